// Channel handshake and channel upgrade records
//
// A row names the chain that has to take the next step (`chain_id`) and the
// end it is talking to (`counterparty_*`). Each event deletes the row it
// answers and inserts the row for the following step.

use sqlx::SqliteConnection;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use super::RelayStore;
use crate::chains::RouteTable;
use crate::error::{RelayerError, Result};
use crate::events::{ChannelAttributes, ChannelEvent, ChannelUpgradeEvent, UpgradeAttributes};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeState {
    /// Counterparty must submit MsgChannelOpenTry
    TryOpen,
    /// Initiator must submit MsgChannelOpenAck
    Ack,
    /// Counterparty must submit MsgChannelOpenConfirm
    Confirm,
    /// Counterparty must submit MsgChannelCloseConfirm
    CloseConfirm,
}

impl HandshakeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandshakeState::TryOpen => "TRYOPEN",
            HandshakeState::Ack => "ACK",
            HandshakeState::Confirm => "CONFIRM",
            HandshakeState::CloseConfirm => "CLOSE_CONFIRM",
        }
    }
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HandshakeState {
    type Err = RelayerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "TRYOPEN" => Ok(HandshakeState::TryOpen),
            "ACK" => Ok(HandshakeState::Ack),
            "CONFIRM" => Ok(HandshakeState::Confirm),
            "CLOSE_CONFIRM" => Ok(HandshakeState::CloseConfirm),
            other => Err(RelayerError::Decode(format!(
                "unknown handshake state {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct HandshakeRecord {
    pub id: i64,
    pub state: String,
    pub chain_id: String,
    pub connection_id: String,
    pub port_id: String,
    /// Empty for TRYOPEN rows: the channel does not exist yet
    pub channel_id: String,
    pub counterparty_chain_id: String,
    pub counterparty_connection_id: String,
    pub counterparty_port_id: String,
    pub counterparty_channel_id: String,
    pub version: String,
    pub in_progress: bool,
}

impl HandshakeRecord {
    pub fn state(&self) -> Result<HandshakeState> {
        self.state.parse()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpgradeState {
    Try,
    Ack,
    Confirm,
    Open,
    Error,
}

impl UpgradeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpgradeState::Try => "TRY",
            UpgradeState::Ack => "ACK",
            UpgradeState::Confirm => "CONFIRM",
            UpgradeState::Open => "OPEN",
            UpgradeState::Error => "ERROR",
        }
    }
}

impl fmt::Display for UpgradeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct UpgradeRecord {
    pub id: i64,
    pub state: String,
    pub chain_id: String,
    pub connection_id: String,
    pub port_id: String,
    pub channel_id: String,
    pub counterparty_chain_id: String,
    pub counterparty_connection_id: String,
    pub counterparty_port_id: String,
    pub counterparty_channel_id: String,
    pub upgrade_sequence: i64,
    pub version: String,
    pub ordering: String,
    pub timeout_revision_number: i64,
    pub timeout_revision_height: i64,
    pub timeout_timestamp: i64,
    pub error_receipt: Option<String>,
    pub in_progress: bool,
}

const HANDSHAKE_COLUMNS: &str = "id, state, chain_id, connection_id, port_id, channel_id, \
     counterparty_chain_id, counterparty_connection_id, counterparty_port_id, \
     counterparty_channel_id, version, in_progress";

const UPGRADE_COLUMNS: &str = "id, state, chain_id, connection_id, port_id, channel_id, \
     counterparty_chain_id, counterparty_connection_id, counterparty_port_id, \
     counterparty_channel_id, upgrade_sequence, version, ordering, timeout_revision_number, \
     timeout_revision_height, timeout_timestamp, error_receipt, in_progress";

/// One end of a channel: (chain, connection, port, channel)
type End<'a> = (&'a str, &'a str, &'a str, &'a str);

async fn insert_handshake(
    conn: &mut SqliteConnection,
    state: HandshakeState,
    acting: End<'_>,
    counterparty: End<'_>,
    version: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO channel_handshakes (state, chain_id, connection_id, port_id, channel_id,
             counterparty_chain_id, counterparty_connection_id, counterparty_port_id,
             counterparty_channel_id, version)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT DO NOTHING",
    )
    .bind(state.as_str())
    .bind(acting.0)
    .bind(acting.1)
    .bind(acting.2)
    .bind(acting.3)
    .bind(counterparty.0)
    .bind(counterparty.1)
    .bind(counterparty.2)
    .bind(counterparty.3)
    .bind(version)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Remove every handshake row touching either end of the channel
async fn delete_handshakes_for_channel(
    conn: &mut SqliteConnection,
    chain_id: &str,
    port_id: &str,
    channel_id: &str,
) -> Result<()> {
    sqlx::query(
        "DELETE FROM channel_handshakes
         WHERE (chain_id = ?1 AND port_id = ?2 AND channel_id = ?3)
            OR (counterparty_chain_id = ?1 AND counterparty_port_id = ?2 AND counterparty_channel_id = ?3)",
    )
    .bind(chain_id)
    .bind(port_id)
    .bind(channel_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub(crate) async fn apply_handshake_event(
    conn: &mut SqliteConnection,
    chain_id: &str,
    routes: &RouteTable,
    event: &ChannelEvent,
) -> Result<bool> {
    let attrs: &ChannelAttributes = event.attributes();
    let Some(route) = routes.get(chain_id, &attrs.connection_id) else {
        debug!(
            "{}: no route for {}, skipping channel event on {}",
            chain_id, attrs.connection_id, attrs.channel_id
        );
        return Ok(false);
    };

    let here: End = (
        chain_id,
        route.connection_id.as_str(),
        attrs.port_id.as_str(),
        attrs.channel_id.as_str(),
    );
    let there: End = (
        route.counterparty_chain_id.as_str(),
        route.counterparty_connection_id.as_str(),
        attrs.counterparty_port_id.as_str(),
        attrs.counterparty_channel_id.as_str(),
    );

    match event {
        ChannelEvent::OpenInit(_) => {
            let acting = (there.0, there.1, there.2, "");
            insert_handshake(conn, HandshakeState::TryOpen, acting, here, &attrs.version).await?;
        }
        ChannelEvent::OpenTry(_) => {
            // the TRYOPEN row was keyed on the initiator's end; our channel id is new
            sqlx::query(
                "DELETE FROM channel_handshakes
                 WHERE state = ? AND chain_id = ? AND port_id = ?
                   AND counterparty_chain_id = ? AND counterparty_port_id = ?
                   AND counterparty_channel_id = ?",
            )
            .bind(HandshakeState::TryOpen.as_str())
            .bind(here.0)
            .bind(here.2)
            .bind(there.0)
            .bind(there.2)
            .bind(there.3)
            .execute(&mut *conn)
            .await?;
            insert_handshake(conn, HandshakeState::Ack, there, here, &attrs.version).await?;
        }
        ChannelEvent::OpenAck(_) => {
            sqlx::query(
                "DELETE FROM channel_handshakes
                 WHERE state = ? AND chain_id = ? AND port_id = ? AND channel_id = ?",
            )
            .bind(HandshakeState::Ack.as_str())
            .bind(here.0)
            .bind(here.2)
            .bind(here.3)
            .execute(&mut *conn)
            .await?;
            insert_handshake(conn, HandshakeState::Confirm, there, here, &attrs.version).await?;
        }
        ChannelEvent::OpenConfirm(_) => {
            delete_handshakes_for_channel(conn, here.0, here.2, here.3).await?;
            delete_handshakes_for_channel(conn, there.0, there.2, there.3).await?;
        }
        ChannelEvent::CloseInit(_) => {
            insert_handshake(conn, HandshakeState::CloseConfirm, there, here, &attrs.version)
                .await?;
        }
        ChannelEvent::CloseConfirm(_) => {
            sqlx::query(
                "DELETE FROM channel_handshakes
                 WHERE state = ? AND chain_id = ? AND port_id = ? AND channel_id = ?",
            )
            .bind(HandshakeState::CloseConfirm.as_str())
            .bind(here.0)
            .bind(here.2)
            .bind(here.3)
            .execute(&mut *conn)
            .await?;
        }
    }
    Ok(true)
}

async fn upsert_upgrade(
    conn: &mut SqliteConnection,
    state: UpgradeState,
    acting: End<'_>,
    counterparty: End<'_>,
    attrs: &UpgradeAttributes,
) -> Result<()> {
    let timeout = attrs.timeout_height.unwrap_or_default();
    sqlx::query(
        "INSERT INTO channel_upgrades (state, chain_id, connection_id, port_id, channel_id,
             counterparty_chain_id, counterparty_connection_id, counterparty_port_id,
             counterparty_channel_id, upgrade_sequence, version, ordering,
             timeout_revision_number, timeout_revision_height, timeout_timestamp, error_receipt)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT (state, chain_id, port_id, channel_id) DO UPDATE SET
             upgrade_sequence = excluded.upgrade_sequence,
             version = excluded.version,
             ordering = excluded.ordering,
             timeout_revision_number = excluded.timeout_revision_number,
             timeout_revision_height = excluded.timeout_revision_height,
             timeout_timestamp = excluded.timeout_timestamp,
             error_receipt = excluded.error_receipt",
    )
    .bind(state.as_str())
    .bind(acting.0)
    .bind(acting.1)
    .bind(acting.2)
    .bind(acting.3)
    .bind(counterparty.0)
    .bind(counterparty.1)
    .bind(counterparty.2)
    .bind(counterparty.3)
    .bind(attrs.upgrade_sequence as i64)
    .bind(&attrs.version)
    .bind(&attrs.ordering)
    .bind(timeout.revision_number as i64)
    .bind(timeout.revision_height as i64)
    .bind(attrs.timeout_timestamp.min(i64::MAX as u64) as i64)
    .bind(&attrs.error_receipt)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn delete_upgrade(
    conn: &mut SqliteConnection,
    state: UpgradeState,
    end: End<'_>,
) -> Result<()> {
    sqlx::query(
        "DELETE FROM channel_upgrades
         WHERE state = ? AND chain_id = ? AND port_id = ? AND channel_id = ?",
    )
    .bind(state.as_str())
    .bind(end.0)
    .bind(end.2)
    .bind(end.3)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn delete_upgrades_for_channel(conn: &mut SqliteConnection, end: End<'_>) -> Result<()> {
    sqlx::query(
        "DELETE FROM channel_upgrades
         WHERE (chain_id = ?1 AND port_id = ?2 AND channel_id = ?3)
            OR (counterparty_chain_id = ?1 AND counterparty_port_id = ?2 AND counterparty_channel_id = ?3)",
    )
    .bind(end.0)
    .bind(end.2)
    .bind(end.3)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Connection ids of both ends, taken from an existing row when the event has none
async fn resolve_upgrade_connections(
    conn: &mut SqliteConnection,
    chain_id: &str,
    routes: &RouteTable,
    attrs: &UpgradeAttributes,
) -> Result<Option<(String, String, String)>> {
    if let Some(connection_id) = &attrs.connection_id {
        return Ok(routes.get(chain_id, connection_id).map(|route| {
            (
                route.connection_id.clone(),
                route.counterparty_chain_id.clone(),
                route.counterparty_connection_id.clone(),
            )
        }));
    }

    let known: Option<(String, String, String)> = sqlx::query_as(
        "SELECT connection_id, counterparty_chain_id, counterparty_connection_id
             FROM channel_upgrades WHERE chain_id = ?1 AND port_id = ?2 AND channel_id = ?3
         UNION ALL
         SELECT counterparty_connection_id, chain_id, connection_id
             FROM channel_upgrades
             WHERE counterparty_chain_id = ?1 AND counterparty_port_id = ?2 AND counterparty_channel_id = ?3
         LIMIT 1",
    )
    .bind(chain_id)
    .bind(&attrs.port_id)
    .bind(&attrs.channel_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(known)
}

pub(crate) async fn apply_upgrade_event(
    conn: &mut SqliteConnection,
    chain_id: &str,
    routes: &RouteTable,
    event: &ChannelUpgradeEvent,
) -> Result<bool> {
    let attrs = event.attributes();
    let needs_route = matches!(
        event,
        ChannelUpgradeEvent::Init(_) | ChannelUpgradeEvent::Try(_) | ChannelUpgradeEvent::Ack(_)
    );
    if needs_route && attrs.connection_id.is_none() {
        debug!(
            "{}: upgrade event on {} without connection, skipping",
            chain_id, attrs.channel_id
        );
        return Ok(false);
    }

    let Some((connection_id, cp_chain_id, cp_connection_id)) =
        resolve_upgrade_connections(conn, chain_id, routes, attrs).await?
    else {
        debug!(
            "{}: no known route for upgrade on {}/{}",
            chain_id, attrs.port_id, attrs.channel_id
        );
        return Ok(false);
    };

    let here: End = (
        chain_id,
        connection_id.as_str(),
        attrs.port_id.as_str(),
        attrs.channel_id.as_str(),
    );
    let there: End = (
        cp_chain_id.as_str(),
        cp_connection_id.as_str(),
        attrs.counterparty_port_id.as_str(),
        attrs.counterparty_channel_id.as_str(),
    );

    match event {
        ChannelUpgradeEvent::Init(_) => {
            upsert_upgrade(conn, UpgradeState::Try, there, here, attrs).await?;
        }
        ChannelUpgradeEvent::Try(_) => {
            delete_upgrade(conn, UpgradeState::Try, here).await?;
            upsert_upgrade(conn, UpgradeState::Ack, there, here, attrs).await?;
        }
        ChannelUpgradeEvent::Ack(_) => {
            delete_upgrade(conn, UpgradeState::Ack, here).await?;
            upsert_upgrade(conn, UpgradeState::Confirm, there, here, attrs).await?;
        }
        ChannelUpgradeEvent::Confirm(_) => {
            delete_upgrade(conn, UpgradeState::Confirm, here).await?;
            upsert_upgrade(conn, UpgradeState::Open, there, here, attrs).await?;
        }
        ChannelUpgradeEvent::Open(_) => {
            delete_upgrades_for_channel(conn, here).await?;
            delete_upgrades_for_channel(conn, there).await?;
        }
        ChannelUpgradeEvent::Error(_) => {
            delete_upgrades_for_channel(conn, here).await?;
            delete_upgrades_for_channel(conn, there).await?;
            upsert_upgrade(conn, UpgradeState::Error, there, here, attrs).await?;
        }
    }
    Ok(true)
}

impl RelayStore {
    /// Unleased handshake steps `chain_id` has to submit, oldest first
    pub async fn pending_handshakes(
        &self,
        chain_id: &str,
        limit: usize,
    ) -> Result<Vec<HandshakeRecord>> {
        let sql = format!(
            "SELECT {} FROM channel_handshakes
             WHERE chain_id = ? AND in_progress = 0 ORDER BY id LIMIT ?",
            HANDSHAKE_COLUMNS
        );
        Ok(sqlx::query_as::<_, HandshakeRecord>(&sql)
            .bind(chain_id)
            .bind(limit as i64)
            .fetch_all(self.pool())
            .await?)
    }

    pub async fn all_handshakes(&self) -> Result<Vec<HandshakeRecord>> {
        let sql = format!("SELECT {} FROM channel_handshakes ORDER BY id", HANDSHAKE_COLUMNS);
        Ok(sqlx::query_as::<_, HandshakeRecord>(&sql)
            .fetch_all(self.pool())
            .await?)
    }

    pub async fn upgrades(&self, chain_id: &str) -> Result<Vec<UpgradeRecord>> {
        let sql = format!(
            "SELECT {} FROM channel_upgrades WHERE chain_id = ? ORDER BY id",
            UPGRADE_COLUMNS
        );
        Ok(sqlx::query_as::<_, UpgradeRecord>(&sql)
            .bind(chain_id)
            .fetch_all(self.pool())
            .await?)
    }

    pub async fn all_upgrades(&self) -> Result<Vec<UpgradeRecord>> {
        let sql = format!("SELECT {} FROM channel_upgrades ORDER BY id", UPGRADE_COLUMNS);
        Ok(sqlx::query_as::<_, UpgradeRecord>(&sql)
            .fetch_all(self.pool())
            .await?)
    }
}

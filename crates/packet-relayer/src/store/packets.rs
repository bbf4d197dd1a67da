// Pending packet records
//
// One packet is tracked through three views, each consumed by a different
// wallet: send (MsgRecvPacket on the destination), timeout (MsgTimeout on
// the source) and write-ack (MsgAcknowledgement on the source). A write-ack
// removes the send view; an ack or timeout on the source removes all three.
// `packet_progress` remembers how far each packet got, so events ingested out
// of order never bring a removed view back.

use sqlx::{Sqlite, SqliteConnection, Transaction};
use tracing::debug;

use super::channels::HandshakeRecord;
use super::RelayStore;
use crate::chains::RouteTable;
use crate::error::Result;
use crate::events::{Height, PacketEvent, PacketInfo};

/// Tables carrying an `in_progress` lease flag
pub(crate) const LEASED_TABLES: [&str; 5] = [
    "send_packets",
    "timeout_packets",
    "write_ack_packets",
    "channel_handshakes",
    "channel_upgrades",
];

const PACKET_COLUMNS: &str = "src_chain_id, src_connection_id, src_port_id, src_channel_id, \
     dst_chain_id, dst_connection_id, dst_port_id, dst_channel_id, sequence, data, \
     timeout_revision_number, timeout_revision_height, timeout_timestamp, ordering";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PacketKind {
    Send,
    WriteAck,
    Timeout,
}

impl PacketKind {
    fn table(self) -> &'static str {
        match self {
            PacketKind::Send => "send_packets",
            PacketKind::WriteAck => "write_ack_packets",
            PacketKind::Timeout => "timeout_packets",
        }
    }

    /// Send records are keyed by their destination end, the others by their source end
    fn key_clause(self) -> &'static str {
        match self {
            PacketKind::Send => {
                "dst_chain_id = ? AND dst_connection_id = ? AND dst_channel_id = ? AND sequence = ?"
            }
            PacketKind::WriteAck | PacketKind::Timeout => {
                "src_chain_id = ? AND src_connection_id = ? AND src_channel_id = ? AND sequence = ?"
            }
        }
    }

    fn conflict_target(self) -> &'static str {
        match self {
            PacketKind::Send => "dst_chain_id, dst_connection_id, dst_channel_id, sequence",
            PacketKind::WriteAck | PacketKind::Timeout => {
                "src_chain_id, src_connection_id, src_channel_id, sequence"
            }
        }
    }

    fn select_columns(self) -> String {
        match self {
            PacketKind::WriteAck => format!("{}, ack, in_progress", PACKET_COLUMNS),
            _ => format!("{}, NULL AS ack, in_progress", PACKET_COLUMNS),
        }
    }
}

impl std::fmt::Display for PacketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PacketKind::Send => "send",
            PacketKind::WriteAck => "write_ack",
            PacketKind::Timeout => "timeout",
        };
        f.write_str(name)
    }
}

/// One row of any of the three packet tables
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct PacketRecord {
    pub src_chain_id: String,
    pub src_connection_id: String,
    pub src_port_id: String,
    pub src_channel_id: String,
    pub dst_chain_id: String,
    pub dst_connection_id: String,
    pub dst_port_id: String,
    pub dst_channel_id: String,
    pub sequence: i64,
    pub data: Vec<u8>,
    pub timeout_revision_number: i64,
    pub timeout_revision_height: i64,
    pub timeout_timestamp: i64,
    pub ordering: String,
    /// Only set on write-ack records
    pub ack: Option<Vec<u8>>,
    pub in_progress: bool,
}

impl PacketRecord {
    fn from_event(
        packet: &PacketInfo,
        src: (&str, &str),
        dst: (&str, &str),
        ack: Option<Vec<u8>>,
    ) -> Self {
        let timeout = packet.timeout_height.unwrap_or_default();
        Self {
            src_chain_id: src.0.to_string(),
            src_connection_id: src.1.to_string(),
            src_port_id: packet.src_port.clone(),
            src_channel_id: packet.src_channel.clone(),
            dst_chain_id: dst.0.to_string(),
            dst_connection_id: dst.1.to_string(),
            dst_port_id: packet.dst_port.clone(),
            dst_channel_id: packet.dst_channel.clone(),
            sequence: packet.sequence as i64,
            data: packet.data.clone(),
            timeout_revision_number: timeout.revision_number as i64,
            timeout_revision_height: timeout.revision_height as i64,
            timeout_timestamp: packet.timeout_timestamp.min(i64::MAX as u64) as i64,
            ordering: packet.ordering.clone(),
            ack,
            in_progress: false,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence as u64
    }

    pub fn timeout_height(&self) -> Option<Height> {
        let height = Height::new(
            self.timeout_revision_number as u64,
            self.timeout_revision_height as u64,
        );
        (!height.is_zero()).then_some(height)
    }

    pub fn is_ordered(&self) -> bool {
        self.ordering == "ORDER_ORDERED"
    }

    fn key(&self, kind: PacketKind) -> (&str, &str, &str, i64) {
        match kind {
            PacketKind::Send => (
                self.dst_chain_id.as_str(),
                self.dst_connection_id.as_str(),
                self.dst_channel_id.as_str(),
                self.sequence,
            ),
            PacketKind::WriteAck | PacketKind::Timeout => (
                self.src_chain_id.as_str(),
                self.src_connection_id.as_str(),
                self.src_channel_id.as_str(),
                self.sequence,
            ),
        }
    }
}

/// Latest observed state of the chain a packet's timeout is measured against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutCutoff {
    pub revision_number: u64,
    pub height: u64,
    pub timestamp_nanos: u64,
}

const TIMED_OUT: &str = "(((timeout_revision_number <> 0 OR timeout_revision_height <> 0) \
     AND (timeout_revision_number < ? OR (timeout_revision_number = ? AND timeout_revision_height <= ?))) \
     OR (timeout_timestamp <> 0 AND timeout_timestamp <= ?))";

/// A record selected for relaying by a wallet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingItem {
    Packet(PacketKind, PacketRecord),
    Handshake(HandshakeRecord),
}

async fn upsert_packet(
    conn: &mut SqliteConnection,
    kind: PacketKind,
    record: &PacketRecord,
) -> Result<()> {
    let (columns, placeholders, ack_update) = match kind {
        PacketKind::WriteAck => (
            format!("{}, ack", PACKET_COLUMNS),
            "?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?",
            ", ack = excluded.ack",
        ),
        _ => (
            PACKET_COLUMNS.to_string(),
            "?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?",
            "",
        ),
    };
    // the lease flag is left untouched on replay
    let sql = format!(
        "INSERT INTO {table} ({columns}) VALUES ({placeholders})
         ON CONFLICT ({target}) DO UPDATE SET
             data = excluded.data,
             timeout_revision_number = excluded.timeout_revision_number,
             timeout_revision_height = excluded.timeout_revision_height,
             timeout_timestamp = excluded.timeout_timestamp,
             ordering = excluded.ordering{ack_update}",
        table = kind.table(),
        target = kind.conflict_target(),
    );

    let mut query = sqlx::query(&sql)
        .bind(&record.src_chain_id)
        .bind(&record.src_connection_id)
        .bind(&record.src_port_id)
        .bind(&record.src_channel_id)
        .bind(&record.dst_chain_id)
        .bind(&record.dst_connection_id)
        .bind(&record.dst_port_id)
        .bind(&record.dst_channel_id)
        .bind(record.sequence)
        .bind(&record.data)
        .bind(record.timeout_revision_number)
        .bind(record.timeout_revision_height)
        .bind(record.timeout_timestamp)
        .bind(&record.ordering);
    if kind == PacketKind::WriteAck {
        query = query.bind(record.ack.clone().unwrap_or_default());
    }
    query.execute(&mut *conn).await?;
    Ok(())
}

async fn delete_packet(
    conn: &mut SqliteConnection,
    kind: PacketKind,
    key: (&str, &str, &str, u64),
) -> Result<()> {
    sqlx::query(&format!(
        "DELETE FROM {} WHERE {}",
        kind.table(),
        kind.key_clause()
    ))
    .bind(key.0)
    .bind(key.1)
    .bind(key.2)
    .bind(key.3 as i64)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Furthest lifecycle step seen for a packet, keyed by its source end.
///
/// Chains sync independently, so a packet's later events can be ingested
/// before its `send_packet`; the stage keeps those late events from
/// recreating views the packet has already left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Stage {
    /// Received on the destination chain
    Received = 1,
    /// Acknowledged or timed out on the source chain
    Completed = 2,
}

/// (chain, connection, channel, sequence) of a packet's source end
type SourceKey<'a> = (&'a str, &'a str, &'a str, u64);

async fn packet_stage(conn: &mut SqliteConnection, src: SourceKey<'_>) -> Result<Option<Stage>> {
    let stage: Option<i64> = sqlx::query_scalar(
        "SELECT stage FROM packet_progress
         WHERE src_chain_id = ? AND src_connection_id = ? AND src_channel_id = ? AND sequence = ?",
    )
    .bind(src.0)
    .bind(src.1)
    .bind(src.2)
    .bind(src.3 as i64)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(stage.map(|stage| {
        if stage >= Stage::Completed as i64 {
            Stage::Completed
        } else {
            Stage::Received
        }
    }))
}

async fn advance_stage(conn: &mut SqliteConnection, src: SourceKey<'_>, stage: Stage) -> Result<()> {
    sqlx::query(
        "INSERT INTO packet_progress (src_chain_id, src_connection_id, src_channel_id, sequence, stage)
         VALUES (?, ?, ?, ?, ?)
         ON CONFLICT (src_chain_id, src_connection_id, src_channel_id, sequence)
         DO UPDATE SET stage = MAX(stage, excluded.stage)",
    )
    .bind(src.0)
    .bind(src.1)
    .bind(src.2)
    .bind(src.3 as i64)
    .bind(stage as i64)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Apply one packet event observed on `chain_id`.
///
/// `here` is the observing chain's end of the route and `there` its
/// counterparty. Send and Acknowledge/Timeout are emitted by the source chain,
/// so `here` is the packet's source end; Recv and WriteAck are emitted by the
/// destination chain, so `here` is the destination end and the source-keyed
/// views (timeout, write-ack, progress) are addressed through `there`.
pub(crate) async fn apply_packet_event(
    conn: &mut SqliteConnection,
    chain_id: &str,
    routes: &RouteTable,
    event: &PacketEvent,
) -> Result<bool> {
    let packet = event.packet();
    let Some(route) = routes.get(chain_id, &packet.connection_id) else {
        debug!(
            "{}: no route for {}, skipping packet {}",
            chain_id, packet.connection_id, packet.sequence
        );
        return Ok(false);
    };
    let here = (chain_id, route.connection_id.as_str());
    let there = (
        route.counterparty_chain_id.as_str(),
        route.counterparty_connection_id.as_str(),
    );
    let seq = packet.sequence;

    match event {
        PacketEvent::Send(packet) => {
            let src = (here.0, here.1, packet.src_channel.as_str(), seq);
            if let Some(stage) = packet_stage(conn, src).await? {
                debug!(
                    "{}: packet {}/{} already {:?}, not tracking its send",
                    chain_id, packet.src_channel, seq, stage
                );
                return Ok(false);
            }
            let record = PacketRecord::from_event(packet, here, there, None);
            upsert_packet(conn, PacketKind::Send, &record).await?;
            upsert_packet(conn, PacketKind::Timeout, &record).await?;
        }
        PacketEvent::Recv(packet) => {
            let src = (there.0, there.1, packet.src_channel.as_str(), seq);
            advance_stage(conn, src, Stage::Received).await?;
            delete_packet(conn, PacketKind::Send, (here.0, here.1, packet.dst_channel.as_str(), seq)).await?;
            delete_packet(conn, PacketKind::Timeout, src).await?;
        }
        PacketEvent::WriteAck { packet, ack } => {
            let src = (there.0, there.1, packet.src_channel.as_str(), seq);
            delete_packet(conn, PacketKind::Send, (here.0, here.1, packet.dst_channel.as_str(), seq)).await?;
            delete_packet(conn, PacketKind::Timeout, src).await?;
            if packet_stage(conn, src).await? == Some(Stage::Completed) {
                debug!(
                    "{}: packet {}/{} already acknowledged on {}",
                    chain_id, packet.src_channel, seq, there.0
                );
                return Ok(true);
            }
            advance_stage(conn, src, Stage::Received).await?;
            let record = PacketRecord::from_event(packet, there, here, Some(ack.clone()));
            upsert_packet(conn, PacketKind::WriteAck, &record).await?;
        }
        PacketEvent::Acknowledge(packet) | PacketEvent::Timeout(packet) => {
            let src = (here.0, here.1, packet.src_channel.as_str(), seq);
            advance_stage(conn, src, Stage::Completed).await?;
            delete_packet(conn, PacketKind::Send, (there.0, there.1, packet.dst_channel.as_str(), seq))
                .await?;
            delete_packet(conn, PacketKind::Timeout, src).await?;
            delete_packet(conn, PacketKind::WriteAck, src).await?;
            super::fees::delete_fees(conn, chain_id, packet.src_channel.as_str(), seq).await?;
        }
    }
    Ok(true)
}

async fn set_lease(
    tx: &mut Transaction<'_, Sqlite>,
    item: &PendingItem,
    leased: bool,
) -> Result<bool> {
    let (from, to) = if leased { (0, 1) } else { (1, 0) };
    let result = match item {
        PendingItem::Packet(kind, record) => {
            let key = record.key(*kind);
            sqlx::query(&format!(
                "UPDATE {} SET in_progress = ? WHERE {} AND in_progress = ?",
                kind.table(),
                kind.key_clause()
            ))
            .bind(to)
            .bind(key.0)
            .bind(key.1)
            .bind(key.2)
            .bind(key.3)
            .bind(from)
            .execute(&mut **tx)
            .await?
        }
        PendingItem::Handshake(handshake) => {
            sqlx::query(
                "UPDATE channel_handshakes SET in_progress = ? WHERE id = ? AND in_progress = ?",
            )
            .bind(to)
            .bind(handshake.id)
            .bind(from)
            .execute(&mut **tx)
            .await?
        }
    };
    Ok(result.rows_affected() == 1)
}

impl RelayStore {
    /// Send records waiting for MsgRecvPacket on `dst_chain_id`, excluding timed-out ones
    pub async fn pending_sends(
        &self,
        dst_chain_id: &str,
        cutoff: TimeoutCutoff,
        limit: usize,
    ) -> Result<Vec<PacketRecord>> {
        let sql = format!(
            "SELECT {} FROM send_packets
             WHERE dst_chain_id = ? AND in_progress = 0 AND NOT {}
             ORDER BY src_chain_id, src_channel_id, sequence LIMIT ?",
            PacketKind::Send.select_columns(),
            TIMED_OUT
        );
        let rows = sqlx::query_as::<_, PacketRecord>(&sql)
            .bind(dst_chain_id)
            .bind(cutoff.revision_number as i64)
            .bind(cutoff.revision_number as i64)
            .bind(cutoff.height as i64)
            .bind(cutoff.timestamp_nanos.min(i64::MAX as u64) as i64)
            .bind(limit as i64)
            .fetch_all(self.pool())
            .await?;
        Ok(rows)
    }

    /// Write-ack records waiting for MsgAcknowledgement on `src_chain_id`
    pub async fn pending_write_acks(
        &self,
        src_chain_id: &str,
        limit: usize,
    ) -> Result<Vec<PacketRecord>> {
        let sql = format!(
            "SELECT {} FROM write_ack_packets
             WHERE src_chain_id = ? AND in_progress = 0
             ORDER BY dst_chain_id, src_channel_id, sequence LIMIT ?",
            PacketKind::WriteAck.select_columns()
        );
        let rows = sqlx::query_as::<_, PacketRecord>(&sql)
            .bind(src_chain_id)
            .bind(limit as i64)
            .fetch_all(self.pool())
            .await?;
        Ok(rows)
    }

    /// Timeout records on `src_chain_id` whose deadline passed on `dst_chain_id`
    pub async fn pending_timeouts(
        &self,
        src_chain_id: &str,
        dst_chain_id: &str,
        cutoff: TimeoutCutoff,
        limit: usize,
    ) -> Result<Vec<PacketRecord>> {
        let sql = format!(
            "SELECT {} FROM timeout_packets
             WHERE src_chain_id = ? AND dst_chain_id = ? AND in_progress = 0 AND {}
             ORDER BY src_channel_id, sequence LIMIT ?",
            PacketKind::Timeout.select_columns(),
            TIMED_OUT
        );
        let rows = sqlx::query_as::<_, PacketRecord>(&sql)
            .bind(src_chain_id)
            .bind(dst_chain_id)
            .bind(cutoff.revision_number as i64)
            .bind(cutoff.revision_number as i64)
            .bind(cutoff.height as i64)
            .bind(cutoff.timestamp_nanos.min(i64::MAX as u64) as i64)
            .bind(limit as i64)
            .fetch_all(self.pool())
            .await?;
        Ok(rows)
    }

    pub async fn all_packets(&self, kind: PacketKind) -> Result<Vec<PacketRecord>> {
        let sql = format!(
            "SELECT {} FROM {} ORDER BY src_chain_id, src_channel_id, sequence",
            kind.select_columns(),
            kind.table()
        );
        Ok(sqlx::query_as::<_, PacketRecord>(&sql)
            .fetch_all(self.pool())
            .await?)
    }

    /// Lease the given items in one transaction.
    ///
    /// Returns the items actually leased; an item already leased elsewhere is left out.
    pub async fn lease(&self, items: Vec<PendingItem>) -> Result<Vec<PendingItem>> {
        let mut tx = self.pool().begin().await?;
        let mut leased = Vec::with_capacity(items.len());
        for item in items {
            if set_lease(&mut tx, &item, true).await? {
                leased.push(item);
            }
        }
        tx.commit().await?;
        Ok(leased)
    }

    /// Clear the lease on the given items in one transaction
    pub async fn release(&self, items: &[PendingItem]) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        for item in items {
            set_lease(&mut tx, item, false).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Drop records proven stale against the chain
    pub async fn delete_items(&self, items: &[PendingItem]) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        for item in items {
            match item {
                PendingItem::Packet(kind, record) => {
                    let key = record.key(*kind);
                    delete_packet(&mut tx, *kind, (key.0, key.1, key.2, key.3 as u64)).await?;
                }
                PendingItem::Handshake(handshake) => {
                    sqlx::query("DELETE FROM channel_handshakes WHERE id = ?")
                        .bind(handshake.id)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::IbcEvent;
    use crate::store::test_support::{create_test_packet, create_test_routes};

    const OPEN_CUTOFF: TimeoutCutoff = TimeoutCutoff {
        revision_number: 0,
        height: 10,
        timestamp_nanos: 1,
    };

    async fn ingest(store: &RelayStore, chain_id: &str, events: Vec<PacketEvent>) {
        let events: Vec<IbcEvent> = events.into_iter().map(IbcEvent::Packet).collect();
        store
            .ingest_batch(chain_id, &create_test_routes(), -1, 1, &events)
            .await
            .unwrap();
    }

    async fn create_test_store() -> RelayStore {
        let store = RelayStore::open_in_memory().await.unwrap();
        store.init_sync_ranges("chain-a", Some(1), 1, None).await.unwrap();
        store.init_sync_ranges("chain-b", Some(1), 1, None).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_send_creates_send_and_timeout_views() {
        let store = create_test_store().await;
        ingest(&store, "chain-a", vec![PacketEvent::Send(create_test_packet(1, "connection-1"))]).await;

        let sends = store.pending_sends("chain-b", OPEN_CUTOFF, 10).await.unwrap();
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].src_chain_id, "chain-a");
        assert_eq!(sends[0].dst_connection_id, "connection-2");
        assert_eq!(sends[0].ack, None);

        let timeouts = store.all_packets(PacketKind::Timeout).await.unwrap();
        assert_eq!(timeouts.len(), 1);
        assert_eq!(timeouts[0].src_connection_id, "connection-1");
    }

    #[tokio::test]
    async fn test_write_ack_replaces_send() {
        let store = create_test_store().await;
        let packet = create_test_packet(3, "connection-1");
        ingest(&store, "chain-a", vec![PacketEvent::Send(packet.clone())]).await;

        let mut on_b = packet.clone();
        on_b.connection_id = "connection-2".to_string();
        ingest(
            &store,
            "chain-b",
            vec![PacketEvent::WriteAck {
                packet: on_b,
                ack: b"ok".to_vec(),
            }],
        )
        .await;

        assert!(store.all_packets(PacketKind::Send).await.unwrap().is_empty());
        assert!(store.all_packets(PacketKind::Timeout).await.unwrap().is_empty());
        let acks = store.pending_write_acks("chain-a", 10).await.unwrap();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].ack.as_deref(), Some(b"ok".as_slice()));
        assert_eq!(acks[0].src_connection_id, "connection-1");

        // the ack arriving on the source clears the last view
        ingest(&store, "chain-a", vec![PacketEvent::Acknowledge(packet)]).await;
        assert!(store.all_packets(PacketKind::WriteAck).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_send_and_write_ack_never_coexist() {
        let store = create_test_store().await;
        for seq in 1..=5 {
            let packet = create_test_packet(seq, "connection-1");
            ingest(&store, "chain-a", vec![PacketEvent::Send(packet.clone())]).await;
            if seq % 2 == 0 {
                let mut on_b = packet;
                on_b.connection_id = "connection-2".to_string();
                ingest(
                    &store,
                    "chain-b",
                    vec![PacketEvent::WriteAck {
                        packet: on_b,
                        ack: vec![1],
                    }],
                )
                .await;
            }
        }

        let sends = store.all_packets(PacketKind::Send).await.unwrap();
        let acks = store.all_packets(PacketKind::WriteAck).await.unwrap();
        assert_eq!(sends.len(), 3);
        assert_eq!(acks.len(), 2);
        for ack in &acks {
            assert!(sends.iter().all(|s| s.sequence != ack.sequence));
        }
    }

    #[tokio::test]
    async fn test_write_ack_ingested_before_send() {
        let store = create_test_store().await;
        let packet = create_test_packet(1, "connection-1");

        // chain-b's live range runs ahead of chain-a's backfill
        let mut on_b = packet.clone();
        on_b.connection_id = "connection-2".to_string();
        ingest(
            &store,
            "chain-b",
            vec![PacketEvent::WriteAck {
                packet: on_b,
                ack: b"ok".to_vec(),
            }],
        )
        .await;
        ingest(&store, "chain-a", vec![PacketEvent::Send(packet)]).await;

        assert!(store.all_packets(PacketKind::Send).await.unwrap().is_empty());
        assert!(store.all_packets(PacketKind::Timeout).await.unwrap().is_empty());
        assert_eq!(store.all_packets(PacketKind::WriteAck).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_completed_packet_is_not_resurrected() {
        let store = create_test_store().await;
        let packet = create_test_packet(2, "connection-1");
        let mut on_b = packet.clone();
        on_b.connection_id = "connection-2".to_string();

        ingest(&store, "chain-a", vec![PacketEvent::Acknowledge(packet.clone())]).await;
        ingest(&store, "chain-a", vec![PacketEvent::Send(packet)]).await;
        ingest(
            &store,
            "chain-b",
            vec![PacketEvent::WriteAck {
                packet: on_b.clone(),
                ack: vec![1],
            }],
        )
        .await;
        ingest(&store, "chain-b", vec![PacketEvent::Recv(on_b)]).await;

        for kind in [PacketKind::Send, PacketKind::Timeout, PacketKind::WriteAck] {
            assert!(store.all_packets(kind).await.unwrap().is_empty(), "{} view left", kind);
        }
    }

    #[tokio::test]
    async fn test_recv_ingested_before_send() {
        let store = create_test_store().await;
        let packet = create_test_packet(3, "connection-1");
        let mut on_b = packet.clone();
        on_b.connection_id = "connection-2".to_string();

        ingest(&store, "chain-b", vec![PacketEvent::Recv(on_b)]).await;
        ingest(&store, "chain-a", vec![PacketEvent::Send(packet)]).await;

        assert!(store.all_packets(PacketKind::Send).await.unwrap().is_empty());
        assert!(store.all_packets(PacketKind::Timeout).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_cutoff_uses_destination_state() {
        let store = create_test_store().await;
        // timeout height 0-1000
        ingest(&store, "chain-a", vec![PacketEvent::Send(create_test_packet(1, "connection-1"))]).await;

        let before = TimeoutCutoff {
            revision_number: 0,
            height: 999,
            timestamp_nanos: 1,
        };
        let after = TimeoutCutoff {
            height: 1000,
            ..before
        };

        assert_eq!(store.pending_sends("chain-b", before, 10).await.unwrap().len(), 1);
        assert!(store
            .pending_timeouts("chain-a", "chain-b", before, 10)
            .await
            .unwrap()
            .is_empty());

        assert!(store.pending_sends("chain-b", after, 10).await.unwrap().is_empty());
        assert_eq!(
            store
                .pending_timeouts("chain-a", "chain-b", after, 10)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_lease_is_exclusive_and_reset_at_startup() {
        let store = create_test_store().await;
        ingest(&store, "chain-a", vec![PacketEvent::Send(create_test_packet(1, "connection-1"))]).await;

        let sends = store.pending_sends("chain-b", OPEN_CUTOFF, 10).await.unwrap();
        let items: Vec<PendingItem> = sends
            .into_iter()
            .map(|r| PendingItem::Packet(PacketKind::Send, r))
            .collect();

        let first = store.lease(items.clone()).await.unwrap();
        assert_eq!(first.len(), 1);
        let second = store.lease(items.clone()).await.unwrap();
        assert!(second.is_empty());
        assert!(store.pending_sends("chain-b", OPEN_CUTOFF, 10).await.unwrap().is_empty());

        // simulated crash: the lease survives until the startup sweep
        assert_eq!(store.reset_in_progress().await.unwrap(), 1);
        assert_eq!(store.pending_sends("chain-b", OPEN_CUTOFF, 10).await.unwrap().len(), 1);

        let leased = store.lease(items).await.unwrap();
        store.release(&leased).await.unwrap();
        assert_eq!(store.pending_sends("chain-b", OPEN_CUTOFF, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_replayed_send_keeps_lease() {
        let store = create_test_store().await;
        let packet = create_test_packet(1, "connection-1");
        ingest(&store, "chain-a", vec![PacketEvent::Send(packet.clone())]).await;

        let sends = store.pending_sends("chain-b", OPEN_CUTOFF, 10).await.unwrap();
        store
            .lease(vec![PendingItem::Packet(PacketKind::Send, sends[0].clone())])
            .await
            .unwrap();

        ingest(&store, "chain-a", vec![PacketEvent::Send(packet)]).await;
        let all = store.all_packets(PacketKind::Send).await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].in_progress);
    }
}

// Persistent relay state on SQLite
//
// Every multi-row change that must be observed atomically (event ingestion
// with its sync cursor, lease set/clear) runs inside one transaction. The
// pool holds a single connection, so transactions are fully serialized.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::SqliteConnection;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::chains::RouteTable;
use crate::error::Result;
use crate::events::IbcEvent;

pub mod cache;
pub mod channels;
pub mod fees;
pub mod migrations;
pub mod packets;
pub mod sync;

pub use cache::{ClientRecord, ConnectionRecord};
pub use channels::{HandshakeRecord, HandshakeState, UpgradeRecord, UpgradeState};
pub use fees::{FeeRecord, FeeType};
pub use packets::{PacketKind, PacketRecord, PendingItem};
pub use sync::SyncRange;

/// Handle to the relay database. Cheap to clone; all clones share one pool.
#[derive(Clone)]
pub struct RelayStore {
    pool: SqlitePool,
}

/// Outcome of one ingested batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestOutcome {
    pub events_applied: usize,
    /// The range reached its end and was merged into its successor
    pub range_completed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct PendingCount {
    pub kind: String,
    pub chain_id: String,
    pub count: i64,
}

#[derive(Debug, Clone)]
pub struct StoreStatus {
    pub schema_version: i64,
    pub ranges: Vec<SyncRange>,
    pub pending: Vec<PendingCount>,
}

impl RelayStore {
    /// Open (creating if needed) the database file, migrate and sweep stale leases
    pub async fn open(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        info!("Opened relay store at {}", path);
        Self::init(pool).await
    }

    /// Open an existing database for inspection; leases and schema are left untouched
    pub async fn open_read_only(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .read_only(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Private in-memory database, used by tests and dry runs
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // the database lives exactly as long as its only connection
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::init(pool).await
    }

    async fn init(pool: SqlitePool) -> Result<Self> {
        let version = migrations::run(&pool).await?;
        let store = Self { pool };
        let released = store.reset_in_progress().await?;
        info!(
            "Relay store ready (schema v{}, {} stale leases released)",
            version, released
        );
        Ok(store)
    }

    /// Clear every lease. Runs at startup; leases never survive a restart.
    pub async fn reset_in_progress(&self) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut released = 0;
        for table in packets::LEASED_TABLES {
            released += sqlx::query(&format!(
                "UPDATE {} SET in_progress = 0 WHERE in_progress = 1",
                table
            ))
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        tx.commit().await?;
        Ok(released)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Apply one batch of decoded events and advance the range cursor atomically.
    ///
    /// `range_end` identifies the sync range (-1 for the open-ended one).
    /// Replaying a batch yields the same rows as applying it once.
    pub async fn ingest_batch(
        &self,
        chain_id: &str,
        routes: &RouteTable,
        range_end: i64,
        synced_height: u64,
        events: &[IbcEvent],
    ) -> Result<IngestOutcome> {
        let mut tx = self.pool.begin().await?;

        let mut events_applied = 0;
        for event in events {
            if apply_event(&mut tx, chain_id, routes, event).await? {
                events_applied += 1;
            }
        }

        sync::update_synced_height(&mut tx, chain_id, range_end, synced_height).await?;
        let range_completed = if range_end >= 0 && synced_height as i64 >= range_end {
            sync::merge_completed_range(&mut tx, chain_id, range_end).await?
        } else {
            false
        };

        tx.commit().await?;
        debug!(
            "{}: ingested {} events up to {} (range end {})",
            chain_id, events_applied, synced_height, range_end
        );
        Ok(IngestOutcome {
            events_applied,
            range_completed,
        })
    }

    /// Sync ranges and pending record counts, for the status command
    pub async fn status(&self) -> Result<StoreStatus> {
        let schema_version = migrations::current_version(&self.pool).await?;
        let ranges = self.all_sync_ranges().await?;
        let pending = sqlx::query_as::<_, PendingCount>(
            "SELECT 'send' AS kind, dst_chain_id AS chain_id, COUNT(*) AS count
                 FROM send_packets GROUP BY dst_chain_id
             UNION ALL
             SELECT 'write_ack', src_chain_id, COUNT(*) FROM write_ack_packets GROUP BY src_chain_id
             UNION ALL
             SELECT 'timeout', src_chain_id, COUNT(*) FROM timeout_packets GROUP BY src_chain_id
             UNION ALL
             SELECT 'handshake', chain_id, COUNT(*) FROM channel_handshakes GROUP BY chain_id
             UNION ALL
             SELECT 'upgrade', chain_id, COUNT(*) FROM channel_upgrades GROUP BY chain_id
             ORDER BY 2, 1",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(StoreStatus {
            schema_version,
            ranges,
            pending,
        })
    }
}

/// Returns whether the event changed relay state
async fn apply_event(
    conn: &mut SqliteConnection,
    chain_id: &str,
    routes: &RouteTable,
    event: &IbcEvent,
) -> Result<bool> {
    match event {
        IbcEvent::Packet(packet_event) => {
            packets::apply_packet_event(conn, chain_id, routes, packet_event).await
        }
        IbcEvent::Channel(channel_event) => {
            channels::apply_handshake_event(conn, chain_id, routes, channel_event).await
        }
        IbcEvent::Upgrade(upgrade_event) => {
            channels::apply_upgrade_event(conn, chain_id, routes, upgrade_event).await
        }
        IbcEvent::Fee(fee) => fees::apply_fee_event(conn, chain_id, fee).await,
    }
}

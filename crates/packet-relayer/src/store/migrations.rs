// Forward-only schema migrations, applied in version order at startup
use sqlx::SqlitePool;
use tracing::info;

use crate::error::{RelayerError, Result};

/// Ordered list of (version, statements). Never edit a released entry; append a new one.
const MIGRATIONS: &[(i64, &[&str])] = &[
    (
        1,
        &[
            "CREATE TABLE sync_ranges (
                chain_id TEXT NOT NULL,
                start_height INTEGER NOT NULL,
                end_height INTEGER NOT NULL,
                synced_height INTEGER NOT NULL,
                PRIMARY KEY (chain_id, start_height),
                UNIQUE (chain_id, end_height)
            )",
            "CREATE TABLE send_packets (
                dst_chain_id TEXT NOT NULL,
                dst_connection_id TEXT NOT NULL,
                dst_channel_id TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                dst_port_id TEXT NOT NULL,
                src_chain_id TEXT NOT NULL,
                src_connection_id TEXT NOT NULL,
                src_port_id TEXT NOT NULL,
                src_channel_id TEXT NOT NULL,
                data BLOB NOT NULL,
                timeout_revision_number INTEGER NOT NULL,
                timeout_revision_height INTEGER NOT NULL,
                timeout_timestamp INTEGER NOT NULL,
                ordering TEXT NOT NULL,
                in_progress INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (dst_chain_id, dst_connection_id, dst_channel_id, sequence)
            )",
            "CREATE TABLE timeout_packets (
                src_chain_id TEXT NOT NULL,
                src_connection_id TEXT NOT NULL,
                src_channel_id TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                src_port_id TEXT NOT NULL,
                dst_chain_id TEXT NOT NULL,
                dst_connection_id TEXT NOT NULL,
                dst_port_id TEXT NOT NULL,
                dst_channel_id TEXT NOT NULL,
                data BLOB NOT NULL,
                timeout_revision_number INTEGER NOT NULL,
                timeout_revision_height INTEGER NOT NULL,
                timeout_timestamp INTEGER NOT NULL,
                ordering TEXT NOT NULL,
                in_progress INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (src_chain_id, src_connection_id, src_channel_id, sequence)
            )",
            "CREATE TABLE write_ack_packets (
                src_chain_id TEXT NOT NULL,
                src_connection_id TEXT NOT NULL,
                src_channel_id TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                src_port_id TEXT NOT NULL,
                dst_chain_id TEXT NOT NULL,
                dst_connection_id TEXT NOT NULL,
                dst_port_id TEXT NOT NULL,
                dst_channel_id TEXT NOT NULL,
                data BLOB NOT NULL,
                timeout_revision_number INTEGER NOT NULL,
                timeout_revision_height INTEGER NOT NULL,
                timeout_timestamp INTEGER NOT NULL,
                ordering TEXT NOT NULL,
                ack BLOB NOT NULL,
                in_progress INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (src_chain_id, src_connection_id, src_channel_id, sequence)
            )",
            "CREATE TABLE channel_handshakes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                state TEXT NOT NULL,
                chain_id TEXT NOT NULL,
                connection_id TEXT NOT NULL,
                port_id TEXT NOT NULL,
                channel_id TEXT NOT NULL,
                counterparty_chain_id TEXT NOT NULL,
                counterparty_connection_id TEXT NOT NULL,
                counterparty_port_id TEXT NOT NULL,
                counterparty_channel_id TEXT NOT NULL,
                version TEXT NOT NULL,
                in_progress INTEGER NOT NULL DEFAULT 0,
                UNIQUE (state, chain_id, port_id, channel_id,
                        counterparty_chain_id, counterparty_port_id, counterparty_channel_id)
            )",
        ],
    ),
    (
        2,
        &[
            "CREATE TABLE channel_upgrades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                state TEXT NOT NULL,
                chain_id TEXT NOT NULL,
                connection_id TEXT NOT NULL,
                port_id TEXT NOT NULL,
                channel_id TEXT NOT NULL,
                counterparty_chain_id TEXT NOT NULL,
                counterparty_connection_id TEXT NOT NULL,
                counterparty_port_id TEXT NOT NULL,
                counterparty_channel_id TEXT NOT NULL,
                upgrade_sequence INTEGER NOT NULL,
                version TEXT NOT NULL,
                ordering TEXT NOT NULL,
                timeout_revision_number INTEGER NOT NULL,
                timeout_revision_height INTEGER NOT NULL,
                timeout_timestamp INTEGER NOT NULL,
                error_receipt TEXT,
                in_progress INTEGER NOT NULL DEFAULT 0,
                UNIQUE (state, chain_id, port_id, channel_id)
            )",
            "CREATE TABLE clients (
                chain_id TEXT NOT NULL,
                client_id TEXT NOT NULL,
                counterparty_chain_id TEXT NOT NULL,
                trusting_period_secs INTEGER NOT NULL,
                revision_number INTEGER NOT NULL,
                revision_height INTEGER NOT NULL,
                last_update_time INTEGER NOT NULL,
                PRIMARY KEY (chain_id, client_id)
            )",
            "CREATE TABLE connections (
                chain_id TEXT NOT NULL,
                connection_id TEXT NOT NULL,
                client_id TEXT NOT NULL,
                counterparty_chain_id TEXT NOT NULL,
                counterparty_client_id TEXT NOT NULL,
                counterparty_connection_id TEXT NOT NULL,
                PRIMARY KEY (chain_id, connection_id)
            )",
        ],
    ),
    (
        3,
        &[
            "CREATE TABLE packet_fees (
                chain_id TEXT NOT NULL,
                port_id TEXT NOT NULL,
                channel_id TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                fee_type TEXT NOT NULL,
                denom TEXT NOT NULL,
                amount TEXT NOT NULL,
                PRIMARY KEY (chain_id, channel_id, sequence, fee_type, denom)
            )",
            "CREATE INDEX send_packets_src ON send_packets (src_chain_id, src_channel_id, sequence)",
            "CREATE INDEX timeout_packets_dst ON timeout_packets (dst_chain_id)",
        ],
    ),
    (
        4,
        &[
            "CREATE TABLE packet_progress (
                src_chain_id TEXT NOT NULL,
                src_connection_id TEXT NOT NULL,
                src_channel_id TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                stage INTEGER NOT NULL,
                PRIMARY KEY (src_chain_id, src_connection_id, src_channel_id, sequence)
            )",
        ],
    ),
];

/// Latest schema version this build knows about
pub fn latest_version() -> i64 {
    MIGRATIONS.last().map(|(v, _)| *v).unwrap_or(0)
}

pub async fn current_version(pool: &SqlitePool) -> Result<i64> {
    let version: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
        .fetch_one(pool)
        .await?;
    Ok(version.unwrap_or(0))
}

/// Apply every migration newer than the stored schema version, each in its own transaction
pub async fn run(pool: &SqlitePool) -> Result<i64> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    let mut version = current_version(pool).await?;
    if version > latest_version() {
        return Err(RelayerError::Migration {
            version,
            message: format!(
                "database schema is newer than this build (latest {})",
                latest_version()
            ),
        });
    }

    for (target, statements) in MIGRATIONS.iter().filter(move |(v, _)| *v > version) {
        let mut tx = pool.begin().await?;
        for statement in statements.iter().copied() {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| RelayerError::Migration {
                    version: *target,
                    message: e.to_string(),
                })?;
        }
        sqlx::query("INSERT INTO schema_version (version, applied_at) VALUES (?, strftime('%s','now'))")
            .bind(*target)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!("Applied store migration {}", target);
        version = *target;
    }

    Ok(version)
}

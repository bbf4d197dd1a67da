// Per-chain sync ranges
//
// Ranges of one chain are contiguous and never overlap. `end_height` is -1
// for the open-ended live range; there is at most one per chain. Workers
// address their range by end height since a merge rewrites the successor's
// start height.

use sqlx::SqliteConnection;
use tracing::info;

use super::RelayStore;
use crate::error::Result;

pub const OPEN_ENDED: i64 = -1;

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct SyncRange {
    pub chain_id: String,
    pub start_height: i64,
    pub end_height: i64,
    pub synced_height: i64,
}

impl SyncRange {
    pub fn is_open_ended(&self) -> bool {
        self.end_height == OPEN_ENDED
    }

    pub fn is_complete(&self) -> bool {
        !self.is_open_ended() && self.synced_height >= self.end_height
    }
}

async fn insert_range(
    conn: &mut SqliteConnection,
    chain_id: &str,
    start_height: i64,
    end_height: i64,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO sync_ranges (chain_id, start_height, end_height, synced_height)
         VALUES (?, ?, ?, ?)",
    )
    .bind(chain_id)
    .bind(start_height)
    .bind(end_height)
    .bind(start_height - 1)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub(crate) async fn update_synced_height(
    conn: &mut SqliteConnection,
    chain_id: &str,
    end_height: i64,
    synced_height: u64,
) -> Result<()> {
    // the cursor only moves forward, so a replayed batch cannot rewind it
    sqlx::query(
        "UPDATE sync_ranges SET synced_height = MAX(synced_height, ?)
         WHERE chain_id = ? AND end_height = ?",
    )
    .bind(synced_height as i64)
    .bind(chain_id)
    .bind(end_height)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Fold a finished range into the range starting right after it.
///
/// Returns false when there is no successor; the finished range then stays
/// as a record of synced history.
pub(crate) async fn merge_completed_range(
    conn: &mut SqliteConnection,
    chain_id: &str,
    end_height: i64,
) -> Result<bool> {
    let range = sqlx::query_as::<_, SyncRange>(
        "SELECT chain_id, start_height, end_height, synced_height
         FROM sync_ranges WHERE chain_id = ? AND end_height = ?",
    )
    .bind(chain_id)
    .bind(end_height)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(range) = range.filter(SyncRange::is_complete) else {
        return Ok(false);
    };

    let successor: Option<i64> = sqlx::query_scalar(
        "SELECT end_height FROM sync_ranges WHERE chain_id = ? AND start_height = ?",
    )
    .bind(chain_id)
    .bind(range.end_height + 1)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(successor_end) = successor else {
        return Ok(false);
    };

    sqlx::query("DELETE FROM sync_ranges WHERE chain_id = ? AND end_height = ?")
        .bind(chain_id)
        .bind(range.end_height)
        .execute(&mut *conn)
        .await?;
    sqlx::query("UPDATE sync_ranges SET start_height = ? WHERE chain_id = ? AND end_height = ?")
        .bind(range.start_height)
        .bind(chain_id)
        .bind(successor_end)
        .execute(&mut *conn)
        .await?;

    info!(
        "{}: merged range [{}, {}] into successor ending at {}",
        chain_id, range.start_height, range.end_height, successor_end
    );
    Ok(true)
}

impl RelayStore {
    pub async fn sync_ranges(&self, chain_id: &str) -> Result<Vec<SyncRange>> {
        let ranges = sqlx::query_as::<_, SyncRange>(
            "SELECT chain_id, start_height, end_height, synced_height
             FROM sync_ranges WHERE chain_id = ? ORDER BY start_height",
        )
        .bind(chain_id)
        .fetch_all(self.pool())
        .await?;
        Ok(ranges)
    }

    pub async fn all_sync_ranges(&self) -> Result<Vec<SyncRange>> {
        let ranges = sqlx::query_as::<_, SyncRange>(
            "SELECT chain_id, start_height, end_height, synced_height
             FROM sync_ranges ORDER BY chain_id, start_height",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(ranges)
    }

    /// Prepare the ranges of one chain at startup.
    ///
    /// * no ranges: one open-ended range from `start_height` (or the tip)
    /// * `start_height` below the lowest range: a backfill range ending right before it
    /// * open-ended range more than `catch_up_gap` behind the tip: bounded at
    ///   `tip - 1`, with a fresh live range from the tip
    ///
    /// Returns the ranges that still need syncing.
    pub async fn init_sync_ranges(
        &self,
        chain_id: &str,
        start_height: Option<u64>,
        latest_height: u64,
        catch_up_gap: Option<u64>,
    ) -> Result<Vec<SyncRange>> {
        let latest = latest_height as i64;
        let mut tx = self.pool().begin().await?;

        let lowest: Option<i64> =
            sqlx::query_scalar("SELECT MIN(start_height) FROM sync_ranges WHERE chain_id = ?")
                .bind(chain_id)
                .fetch_one(&mut *tx)
                .await?;

        match (lowest, start_height) {
            (None, configured) => {
                let start = configured.map(|h| h as i64).unwrap_or(latest).max(1);
                insert_range(&mut tx, chain_id, start, OPEN_ENDED).await?;
                info!("{}: starting sync at height {}", chain_id, start);
            }
            (Some(lowest), Some(configured)) if (configured as i64) < lowest => {
                let configured = (configured as i64).max(1);
                insert_range(&mut tx, chain_id, configured, lowest - 1).await?;
                info!(
                    "{}: backfilling heights {}..{}",
                    chain_id,
                    configured,
                    lowest - 1
                );
            }
            _ => {}
        }

        if let Some(gap) = catch_up_gap {
            let live: Option<i64> = sqlx::query_scalar(
                "SELECT synced_height FROM sync_ranges WHERE chain_id = ? AND end_height = ?",
            )
            .bind(chain_id)
            .bind(OPEN_ENDED)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(synced) = live {
                if latest - synced > gap as i64 {
                    sqlx::query(
                        "UPDATE sync_ranges SET end_height = ? WHERE chain_id = ? AND end_height = ?",
                    )
                    .bind(latest - 1)
                    .bind(chain_id)
                    .bind(OPEN_ENDED)
                    .execute(&mut *tx)
                    .await?;
                    insert_range(&mut tx, chain_id, latest, OPEN_ENDED).await?;
                    info!(
                        "{}: live range {} blocks behind, catching up up to {} while following the tip",
                        chain_id,
                        latest - synced,
                        latest - 1
                    );
                }
            }
        }

        // a bounded range whose cursor already reached its end only needs merging
        let finished: Vec<i64> = sqlx::query_scalar(
            "SELECT end_height FROM sync_ranges
             WHERE chain_id = ? AND end_height <> -1 AND synced_height >= end_height",
        )
        .bind(chain_id)
        .fetch_all(&mut *tx)
        .await?;
        for end in finished {
            merge_completed_range(&mut tx, chain_id, end).await?;
        }

        tx.commit().await?;

        let ranges = self.sync_ranges(chain_id).await?;
        Ok(ranges.into_iter().filter(|r| !r.is_complete()).collect())
    }
}

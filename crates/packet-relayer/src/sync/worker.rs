// Height-range sync worker
use async_trait::async_trait;
use futures::future::try_join_all;
use std::ops::RangeInclusive;
use std::time::Duration;
use tracing::{debug, info};

use super::SyncContext;
use crate::config::SyncConfig;
use crate::error::Result;
use crate::events::{decode_event, ConnectionFilter, IbcEvent};
use crate::scheduler::{Step, Task};
use crate::store::sync::OPEN_ENDED;
use crate::store::SyncRange;

/// Next heights to fetch after `synced`, bounded by the range end (if any),
/// the chain's latest height and the batch size
pub fn next_heights(
    synced: u64,
    range_end: Option<u64>,
    latest: u64,
    batch_size: u64,
) -> Option<RangeInclusive<u64>> {
    let upper = range_end.map_or(latest, |end| end.min(latest));
    if synced >= upper || batch_size == 0 {
        return None;
    }
    let from = synced + 1;
    let to = upper.min(synced.saturating_add(batch_size));
    Some(from..=to)
}

/// Syncs one range of one chain into the store
pub struct SyncWorker {
    chain_id: String,
    range_end: i64,
    synced: u64,
    batch_size: u64,
    poll_interval: Duration,
    filter: ConnectionFilter,
    ctx: SyncContext,
}

impl SyncWorker {
    pub fn new(range: &SyncRange, sync: &SyncConfig, ctx: SyncContext) -> Self {
        let filter = ConnectionFilter::new(ctx.routes.connections_on(&range.chain_id));
        Self {
            chain_id: range.chain_id.clone(),
            range_end: range.end_height,
            synced: range.synced_height.max(0) as u64,
            batch_size: sync.batch_size,
            poll_interval: Duration::from_millis(sync.poll_interval_ms),
            filter,
            ctx,
        }
    }

    pub fn synced_height(&self) -> u64 {
        self.synced
    }

    fn bounded_end(&self) -> Option<u64> {
        (self.range_end != OPEN_ENDED).then_some(self.range_end as u64)
    }
}

#[async_trait]
impl Task for SyncWorker {
    fn name(&self) -> String {
        match self.bounded_end() {
            Some(end) => format!("sync:{}:..{}", self.chain_id, end),
            None => format!("sync:{}:live", self.chain_id),
        }
    }

    async fn step(&mut self) -> Result<Step> {
        let latest = self.ctx.registry.latest(&self.chain_id)?.height;
        let Some(heights) = next_heights(self.synced, self.bounded_end(), latest, self.batch_size)
        else {
            return Ok(Step::Continue(self.poll_interval));
        };
        let last = *heights.end();

        let client = self.ctx.registry.client(&self.chain_id)?;
        let blocks = try_join_all(heights.clone().map(|h| client.block_results(h))).await?;

        let events: Vec<IbcEvent> = blocks
            .iter()
            .flat_map(|block| block.events.iter())
            .filter_map(|raw| decode_event(raw, &self.filter))
            .collect();

        let outcome = self
            .ctx
            .store
            .ingest_batch(
                &self.chain_id,
                &self.ctx.routes,
                self.range_end,
                last,
                &events,
            )
            .await?;
        self.synced = last;

        if let Some(metrics) = &self.ctx.metrics {
            metrics
                .blocks_synced
                .with_label_values(&[self.chain_id.as_str()])
                .inc_by(blocks.len() as u64);
            metrics
                .events_ingested
                .with_label_values(&[self.chain_id.as_str()])
                .inc_by(outcome.events_applied as u64);
        }
        debug!(
            "{}: synced {}..={} ({} events)",
            self.chain_id,
            heights.start(),
            last,
            outcome.events_applied
        );

        if let Some(end) = self.bounded_end() {
            if last >= end {
                info!(
                    "{}: range ending at {} complete (merged: {})",
                    self.chain_id, end, outcome.range_completed
                );
                return Ok(Step::Done);
            }
        }

        // keep going without waiting while behind the tip
        if last < latest {
            Ok(Step::Continue(Duration::ZERO))
        } else {
            Ok(Step::Continue(self.poll_interval))
        }
    }
}

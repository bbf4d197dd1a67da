// ChainSyncEngine: height tracking and range workers per chain

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::chains::{ChainRegistry, RouteTable};
use crate::config::{ChainConfig, SyncConfig};
use crate::error::Result;
use crate::metrics::RelayerMetrics;
use crate::store::RelayStore;

pub mod height;
pub mod worker;

pub use height::HeightTracker;
pub use worker::{next_heights, SyncWorker};

/// Shared handles every sync task of one chain needs
#[derive(Clone)]
pub struct SyncContext {
    pub registry: Arc<ChainRegistry>,
    pub routes: Arc<RouteTable>,
    pub store: RelayStore,
    pub metrics: Option<RelayerMetrics>,
}

/// Publish the chain's current height and build one worker per incomplete range
pub async fn prepare_chain_sync(
    chain: &ChainConfig,
    sync: &SyncConfig,
    ctx: &SyncContext,
) -> Result<(HeightTracker, Vec<SyncWorker>)> {
    let client = ctx.registry.client(&chain.chain_id)?;
    let latest = client.latest_block().await?;
    ctx.registry.publish(&chain.chain_id, latest)?;

    let ranges = ctx
        .store
        .init_sync_ranges(
            &chain.chain_id,
            chain.start_height,
            latest.height,
            sync.catch_up_gap,
        )
        .await?;

    info!(
        "{}: latest height {}, {} range(s) to sync",
        chain.chain_id,
        latest.height,
        ranges.len()
    );

    let tracker = HeightTracker::new(
        &chain.chain_id,
        ctx.registry.clone(),
        Duration::from_millis(sync.height_poll_interval_ms),
    );
    let workers = ranges
        .iter()
        .map(|range| SyncWorker::new(range, sync, ctx.clone()))
        .collect();
    Ok((tracker, workers))
}

// Latest height tracking
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::chains::ChainRegistry;
use crate::error::Result;
use crate::scheduler::{Step, Task};

/// Polls a chain's latest block and publishes it to the registry.
///
/// Failures are retried by the driver up to `max_height_failures` in a row;
/// after that the tracker fails fatally so a stalled chain never goes unnoticed.
pub struct HeightTracker {
    chain_id: String,
    registry: Arc<ChainRegistry>,
    interval: Duration,
}

impl HeightTracker {
    pub fn new(chain_id: &str, registry: Arc<ChainRegistry>, interval: Duration) -> Self {
        Self {
            chain_id: chain_id.to_string(),
            registry,
            interval,
        }
    }
}

#[async_trait]
impl Task for HeightTracker {
    fn name(&self) -> String {
        format!("height-tracker:{}", self.chain_id)
    }

    async fn step(&mut self) -> Result<Step> {
        let client = self.registry.client(&self.chain_id)?;
        let latest = client.latest_block().await?;
        self.registry.publish(&self.chain_id, latest)?;
        debug!("{}: latest height {}", self.chain_id, latest.height);
        Ok(Step::Continue(self.interval))
    }
}

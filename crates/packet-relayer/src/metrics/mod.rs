// Prometheus counters for the relay engine
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

pub mod server;

/// Relay engine metrics. Counters are labelled by chain id.
#[derive(Clone)]
pub struct RelayerMetrics {
    /// Messages included on chain, by destination chain and message kind
    pub packets_relayed: IntCounterVec,
    pub tx_failures: IntCounterVec,
    pub blocks_synced: IntCounterVec,
    pub events_ingested: IntCounterVec,
    pub tx_duration: Histogram,

    registry: Arc<Registry>,
}

impl RelayerMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let packets_relayed = IntCounterVec::new(
            Opts::new("relayer_packets_relayed_total", "Messages relayed"),
            &["chain_id", "kind"],
        )?;
        let tx_failures = IntCounterVec::new(
            Opts::new("relayer_tx_failures_total", "Failed relay transactions"),
            &["chain_id"],
        )?;
        let blocks_synced = IntCounterVec::new(
            Opts::new("relayer_blocks_synced_total", "Blocks ingested into the store"),
            &["chain_id"],
        )?;
        let events_ingested = IntCounterVec::new(
            Opts::new("relayer_events_ingested_total", "IBC events applied to the store"),
            &["chain_id"],
        )?;
        let tx_duration = Histogram::with_opts(HistogramOpts::new(
            "relayer_tx_duration_seconds",
            "Time from broadcast to inclusion",
        ))?;

        registry.register(Box::new(packets_relayed.clone()))?;
        registry.register(Box::new(tx_failures.clone()))?;
        registry.register(Box::new(blocks_synced.clone()))?;
        registry.register(Box::new(events_ingested.clone()))?;
        registry.register(Box::new(tx_duration.clone()))?;

        Ok(Self {
            packets_relayed,
            tx_failures,
            blocks_synced,
            events_ingested,
            tx_duration,
            registry,
        })
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// Current values in the Prometheus text exposition format
    pub fn encode_text(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

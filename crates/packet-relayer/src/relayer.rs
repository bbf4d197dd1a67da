// Relayer supervisor
//
// Wires chains, routes, the store and metrics together and runs the sync and
// wallet tasks while the node gate allows it. Leaving leadership stops every
// task through the shared shutdown signal; regaining it starts a fresh set.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::chains::{ChainRegistry, CosmosClient, RouteTable};
use crate::config::RelayerConfig;
use crate::error::{RelayerError, Result};
use crate::gate::NodeGate;
use crate::keystore::{load_wallet_key, CosmosKey};
use crate::metrics::server::spawn_metrics_server;
use crate::metrics::RelayerMetrics;
use crate::relay::{WalletContext, WalletWorker};
use crate::scheduler::{drive, BackoffPolicy, Task};
use crate::store::RelayStore;
use crate::sync::{prepare_chain_sync, SyncContext};

/// Tasks of one leadership term
struct RunningTasks {
    shutdown: watch::Sender<bool>,
    tasks: JoinSet<Result<()>>,
}

impl RunningTasks {
    fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shutdown,
            tasks: JoinSet::new(),
        }
    }

    fn spawn<T: Task + 'static>(&mut self, mut task: T, policy: BackoffPolicy) {
        let shutdown = self.shutdown.subscribe();
        self.tasks
            .spawn(async move { drive(&mut task, &policy, shutdown).await });
    }

    /// Signal shutdown and wait for every task to return
    async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Task ended with error during shutdown: {}", e),
                Err(e) => warn!("Task aborted during shutdown: {}", e),
            }
        }
    }
}

pub struct Relayer {
    config: RelayerConfig,
    registry: Arc<ChainRegistry>,
    routes: Arc<RouteTable>,
    store: RelayStore,
    metrics: Option<RelayerMetrics>,
    gate: Arc<dyn NodeGate>,
    /// Signing keys per chain id, in the order of the chain's wallets
    keys: HashMap<String, Vec<CosmosKey>>,
}

/// Resolve every wallet key up front; a bad key is a configuration error
fn load_keys(config: &RelayerConfig) -> Result<HashMap<String, Vec<CosmosKey>>> {
    let mut keys = HashMap::new();
    for chain in config.chains.values() {
        let chain_keys = chain
            .wallets
            .iter()
            .map(|wallet| load_wallet_key(wallet, &chain.address_prefix))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| RelayerError::Config(format!("wallet key for {}: {}", chain.chain_id, e)))?;
        keys.insert(chain.chain_id.clone(), chain_keys);
    }
    Ok(keys)
}

impl Relayer {
    /// Connect to every configured chain and open the relay store
    pub async fn new(config: RelayerConfig, gate: Arc<dyn NodeGate>) -> Result<Self> {
        let mut registry = ChainRegistry::new();
        for chain in config.chains.values() {
            let client = CosmosClient::new(chain, &config.global)?;
            registry.register(Arc::new(client));
            info!(
                "Registered chain {} ({} rpc, {} rest endpoints)",
                chain.chain_id,
                chain.rpc_endpoints.len(),
                chain.rest_endpoints.len()
            );
        }
        let store = RelayStore::open(&config.global.database_path).await?;
        Self::with_parts(config, registry, store, gate)
    }

    /// Assemble a relayer from already built parts
    pub fn with_parts(
        config: RelayerConfig,
        registry: ChainRegistry,
        store: RelayStore,
        gate: Arc<dyn NodeGate>,
    ) -> Result<Self> {
        let metrics = if config.metrics.enabled {
            Some(RelayerMetrics::new().map_err(|e| RelayerError::Config(e.to_string()))?)
        } else {
            None
        };
        let keys = load_keys(&config)?;
        let routes = RouteTable::from_config(&config.connections);
        Ok(Self {
            config,
            registry: Arc::new(registry),
            routes: Arc::new(routes),
            store,
            metrics,
            gate,
            keys,
        })
    }

    pub fn store(&self) -> &RelayStore {
        &self.store
    }

    pub fn metrics(&self) -> Option<&RelayerMetrics> {
        self.metrics.as_ref()
    }

    /// Build and spawn every sync and wallet task
    async fn start_tasks(&self) -> Result<RunningTasks> {
        // nothing runs between terms, so leftover leases are stale
        self.store.reset_in_progress().await?;

        let mut running = RunningTasks::new();
        let sync_ctx = SyncContext {
            registry: self.registry.clone(),
            routes: self.routes.clone(),
            store: self.store.clone(),
            metrics: self.metrics.clone(),
        };

        for chain in self.config.chains.values() {
            let (tracker, workers) =
                prepare_chain_sync(chain, &self.config.sync, &sync_ctx).await?;
            running.spawn(
                tracker,
                BackoffPolicy::default().with_max_failures(self.config.sync.max_height_failures),
            );
            for worker in workers {
                running.spawn(worker, BackoffPolicy::default());
            }

            let keys = self.keys.get(&chain.chain_id).into_iter().flatten();
            for (wallet, key) in chain.wallets.iter().zip(keys) {
                let worker = WalletWorker::new(
                    chain,
                    wallet,
                    &self.config.global,
                    key.clone(),
                    WalletContext {
                        registry: self.registry.clone(),
                        routes: self.routes.clone(),
                        store: self.store.clone(),
                        metrics: self.metrics.clone(),
                    },
                )?;
                info!("{}: wallet {} ready", chain.chain_id, worker.address());
                running.spawn(worker, BackoffPolicy::default());
            }
        }

        info!("Started {} relay tasks", running.tasks.len());
        Ok(running)
    }

    async fn may_relay(&self) -> bool {
        match self.gate.may_relay().await {
            Ok(allowed) => allowed,
            Err(e) => {
                warn!("Node gate unavailable, treating node as standby: {}", e);
                false
            }
        }
    }

    /// Run until `stop` turns true or a task fails fatally
    pub async fn run(&self, mut stop: watch::Receiver<bool>) -> Result<()> {
        let poll = Duration::from_millis(self.config.global.gate_poll_interval_ms);
        let mut running: Option<RunningTasks> = None;

        let metrics_server = match &self.metrics {
            Some(metrics) => {
                let (_, handle) = spawn_metrics_server(
                    &self.config.metrics.host,
                    self.config.metrics.port,
                    metrics.clone(),
                )
                .await?;
                Some(handle)
            }
            None => None,
        };

        let outcome = loop {
            if *stop.borrow() {
                break Ok(());
            }

            let allowed = self.may_relay().await;
            match (allowed, running.is_some()) {
                (true, false) => match self.start_tasks().await {
                    Ok(tasks) => running = Some(tasks),
                    Err(e) if e.is_fatal() => break Err(e),
                    Err(e) => warn!("Could not start relay tasks, retrying: {}", e),
                },
                (false, true) => {
                    info!("Node is no longer active leader, stopping relay tasks");
                    if let Some(tasks) = running.take() {
                        tasks.stop().await;
                    }
                }
                _ => {}
            }

            tokio::select! {
                _ = sleep(poll) => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        break Ok(());
                    }
                }
                exited = next_exit(&mut running) => match exited {
                    Ok(()) => {}
                    Err(e) => {
                        error!("Relay task failed: {}", e);
                        break Err(e);
                    }
                },
            }
        };

        if let Some(tasks) = running.take() {
            tasks.stop().await;
        }
        if let Some(metrics) = &self.metrics {
            match metrics.encode_text() {
                Ok(text) => debug!("Final metrics:\n{}", text),
                Err(e) => warn!("Could not encode metrics: {}", e),
            }
        }
        if let Some(handle) = metrics_server {
            handle.abort();
        }
        info!("Relayer stopped");
        outcome
    }

    pub async fn close(&self) {
        self.store.close().await;
    }
}

/// Outcome of the next task to return; pending forever while nothing runs
async fn next_exit(running: &mut Option<RunningTasks>) -> Result<()> {
    let Some(tasks) = running.as_mut() else {
        return std::future::pending().await;
    };
    match tasks.tasks.join_next().await {
        Some(joined) => joined?,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GlobalConfig, MetricsConfig, SyncConfig};
    use crate::gate::StandaloneNode;
    use std::collections::HashMap;

    fn create_test_config() -> RelayerConfig {
        RelayerConfig {
            global: GlobalConfig {
                log_level: "debug".to_string(),
                database_path: ":memory:".to_string(),
                request_timeout_ms: 1000,
                max_query_rounds: 1,
                tx_poll_retries: 1,
                tx_poll_interval_ms: 10,
                gate_poll_interval_ms: 10,
            },
            sync: SyncConfig::default(),
            chains: HashMap::new(),
            connections: Vec::new(),
            metrics: MetricsConfig {
                enabled: true,
                host: "127.0.0.1".to_string(),
                port: 0,
            },
        }
    }

    #[tokio::test]
    async fn test_run_returns_on_stop_signal() {
        let store = RelayStore::open_in_memory().await.unwrap();
        let relayer = Relayer::with_parts(
            create_test_config(),
            ChainRegistry::new(),
            store,
            Arc::new(StandaloneNode),
        )
        .unwrap();

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { relayer.run(stop_rx).await });
        sleep(Duration::from_millis(50)).await;
        stop_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unreadable_wallet_key_is_fatal() {
        use crate::config::ChainConfig;

        let mut config = create_test_config();
        let chain: ChainConfig = toml::from_str(
            r#"
chain_id = "chain-a"
rpc_endpoints = ["http://localhost:26657"]
rest_endpoints = ["http://localhost:1317"]
address_prefix = "cosmos"
gas_price = "0.025stake"

[[wallets]]
key_env = "PACKET_RELAYER_UNSET_TEST_KEY"
"#,
        )
        .unwrap();
        config.chains.insert("chain-a".to_string(), chain);

        let store = RelayStore::open_in_memory().await.unwrap();
        let result = Relayer::with_parts(config, ChainRegistry::new(), store, Arc::new(StandaloneNode));
        match result {
            Err(err) => {
                assert!(matches!(err, RelayerError::Config(_)));
                assert!(err.is_fatal());
                assert!(err.to_string().contains("chain-a"));
            }
            Ok(_) => panic!("a wallet without a readable key must not build a relayer"),
        }
    }
}

// Chain registry and connection routes
//
// Components look chains up by id instead of holding references to their
// counterparty, so a relayed pair has no object cycle.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

use super::{ChainClient, LatestBlock};
use crate::config::ConnectionConfig;
use crate::error::{RelayerError, Result};

struct ChainEntry {
    client: Arc<dyn ChainClient>,
    latest: watch::Sender<LatestBlock>,
}

/// All chains known to this process, keyed by chain id
#[derive(Default)]
pub struct ChainRegistry {
    chains: HashMap<String, ChainEntry>,
}

impl ChainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, client: Arc<dyn ChainClient>) {
        let (latest, _) = watch::channel(LatestBlock::default());
        self.chains
            .insert(client.chain_id().to_string(), ChainEntry { client, latest });
    }

    pub fn chain_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.chains.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn client(&self, chain_id: &str) -> Result<Arc<dyn ChainClient>> {
        self.chains
            .get(chain_id)
            .map(|entry| entry.client.clone())
            .ok_or_else(|| RelayerError::UnknownChain(chain_id.to_string()))
    }

    /// Last height published by the chain's height tracker
    pub fn latest(&self, chain_id: &str) -> Result<LatestBlock> {
        self.chains
            .get(chain_id)
            .map(|entry| *entry.latest.borrow())
            .ok_or_else(|| RelayerError::UnknownChain(chain_id.to_string()))
    }

    /// Publish a new latest block; heights never move backwards
    pub fn publish(&self, chain_id: &str, block: LatestBlock) -> Result<()> {
        let entry = self
            .chains
            .get(chain_id)
            .ok_or_else(|| RelayerError::UnknownChain(chain_id.to_string()))?;
        entry.latest.send_if_modified(|current| {
            if block.height > current.height {
                *current = block;
                true
            } else {
                false
            }
        });
        Ok(())
    }
}

/// One direction of a relayed connection pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRoute {
    pub chain_id: String,
    pub connection_id: String,
    pub counterparty_chain_id: String,
    pub counterparty_connection_id: String,
}

/// Lookup of configured connections in both directions
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: HashMap<(String, String), ConnectionRoute>,
}

impl RouteTable {
    pub fn from_config(connections: &[ConnectionConfig]) -> Self {
        let mut routes = HashMap::new();
        for conn in connections {
            routes.insert(
                (conn.chain_a.clone(), conn.connection_a.clone()),
                ConnectionRoute {
                    chain_id: conn.chain_a.clone(),
                    connection_id: conn.connection_a.clone(),
                    counterparty_chain_id: conn.chain_b.clone(),
                    counterparty_connection_id: conn.connection_b.clone(),
                },
            );
            routes.insert(
                (conn.chain_b.clone(), conn.connection_b.clone()),
                ConnectionRoute {
                    chain_id: conn.chain_b.clone(),
                    connection_id: conn.connection_b.clone(),
                    counterparty_chain_id: conn.chain_a.clone(),
                    counterparty_connection_id: conn.connection_a.clone(),
                },
            );
        }
        Self { routes }
    }

    pub fn get(&self, chain_id: &str, connection_id: &str) -> Option<&ConnectionRoute> {
        self.routes
            .get(&(chain_id.to_string(), connection_id.to_string()))
    }

    /// Connection ids relayed on `chain_id`; this is the decoder's filter
    pub fn connections_on(&self, chain_id: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .routes
            .keys()
            .filter(|(chain, _)| chain == chain_id)
            .map(|(_, conn)| conn.clone())
            .collect();
        ids.sort();
        ids
    }
}

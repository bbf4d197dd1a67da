// IBC packet relayer library
// Exposes the relay engine components for the binary and for integration tests

pub mod chains;
pub mod config;
pub mod error;
pub mod events;
pub mod gate;
pub mod keystore;
pub mod metrics;
pub mod proof;
pub mod relay;
pub mod relayer;
pub mod scheduler;
pub mod store;
pub mod sync;

// Re-export commonly used types for convenience
pub use chains::{ChainClient, ChainRegistry, CosmosClient, RouteTable};
pub use config::{ChainConfig, ConnectionConfig, RelayerConfig, WalletConfig};
pub use error::{RelayerError, Result};
pub use gate::{NodeGate, StandaloneNode};
pub use metrics::RelayerMetrics;
pub use relay::{MessageFactory, WalletWorker};
pub use relayer::Relayer;
pub use store::RelayStore;

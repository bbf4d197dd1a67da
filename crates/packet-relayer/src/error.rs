// Error taxonomy for the relay engine

use thiserror::Error;

use crate::keystore::KeyError;

pub type Result<T> = std::result::Result<T, RelayerError>;

/// Errors surfaced by the relay engine components
#[derive(Error, Debug)]
pub enum RelayerError {
    /// A read-only query failed on every endpoint for the configured number of rounds
    #[error("query {operation} on {chain_id} failed: {message}")]
    Query {
        chain_id: String,
        operation: String,
        message: String,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The chain returned a proof with an unexpected shape
    #[error("malformed proof for key {key}: {reason}")]
    MalformedProof { key: String, reason: String },

    #[error("transaction {tx_hash} failed with code {code}: {raw_log}")]
    TxFailed {
        tx_hash: String,
        code: u32,
        raw_log: String,
    },

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("migration {version} failed: {message}")]
    Migration { version: i64, message: String },

    #[error("chain {0} is not registered")]
    UnknownChain(String),

    #[error("{task} gave up after {failures} consecutive failures: {last_error}")]
    RetriesExhausted {
        task: String,
        failures: u32,
        last_error: String,
    },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("key error: {0}")]
    Key(#[from] KeyError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("task aborted: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl RelayerError {
    pub fn query(chain_id: &str, operation: &str, message: impl ToString) -> Self {
        RelayerError::Query {
            chain_id: chain_id.to_string(),
            operation: operation.to_string(),
            message: message.to_string(),
        }
    }

    /// Fatal errors stop the whole process instead of being retried by the task driver
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RelayerError::RetriesExhausted { .. }
                | RelayerError::Migration { .. }
                | RelayerError::Config(_)
                | RelayerError::Join(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let exhausted = RelayerError::RetriesExhausted {
            task: "height-tracker:chain-a".to_string(),
            failures: 10,
            last_error: "timeout".to_string(),
        };
        assert!(exhausted.is_fatal());

        let query = RelayerError::query("chain-a", "latest_block", "connection refused");
        assert!(!query.is_fatal());
        assert!(query.to_string().contains("chain-a"));
    }
}

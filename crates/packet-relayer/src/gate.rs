// Leader-election gate
//
// Whether this process may run relay work is decided outside the relayer.
// The supervisor only consults the gate; it never elects anything itself.

use async_trait::async_trait;

use crate::error::Result;

#[async_trait]
pub trait NodeGate: Send + Sync {
    /// The node is healthy and part of the relayer set
    async fn is_active_node(&self) -> Result<bool>;

    /// The node currently holds leadership
    async fn is_leader(&self) -> Result<bool>;

    /// Relay tasks may run only while both hold
    async fn may_relay(&self) -> Result<bool> {
        Ok(self.is_active_node().await? && self.is_leader().await?)
    }
}

/// Single-instance deployment: always active, always leader
#[derive(Debug, Clone, Copy, Default)]
pub struct StandaloneNode;

#[async_trait]
impl NodeGate for StandaloneNode {
    async fn is_active_node(&self) -> Result<bool> {
        Ok(true)
    }

    async fn is_leader(&self) -> Result<bool> {
        Ok(true)
    }
}

// Chain query/broadcast interface used by the relay engine

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

pub mod cosmos;
pub mod endpoints;
pub mod registry;
pub mod tx;

pub use cosmos::CosmosClient;
pub use endpoints::EndpointPool;
pub use registry::{ChainRegistry, ConnectionRoute, RouteTable};

/// Latest block observed on a chain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatestBlock {
    pub height: u64,
    /// Block time in unix nanoseconds
    pub timestamp_nanos: u64,
}

/// One attribute exactly as the node returned it (possibly base64)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAttribute {
    pub key: String,
    pub value: String,
}

/// One block event before decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub kind: String,
    pub attributes: Vec<RawAttribute>,
}

impl RawEvent {
    pub fn new(kind: &str, attributes: &[(&str, &str)]) -> Self {
        Self {
            kind: kind.to_string(),
            attributes: attributes
                .iter()
                .map(|(k, v)| RawAttribute {
                    key: k.to_string(),
                    value: v.to_string(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BlockResults {
    pub height: u64,
    pub events: Vec<RawEvent>,
}

/// Merkle proof operation as returned by the ABCI query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofOp {
    pub op_type: String,
    pub key: Vec<u8>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct StoreQueryResponse {
    pub value: Vec<u8>,
    pub proof_ops: Vec<ProofOp>,
    pub height: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub connection_id: String,
    pub client_id: String,
    pub counterparty_client_id: String,
    pub counterparty_connection_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientStateInfo {
    pub client_id: String,
    /// Chain tracked by this light client
    pub chain_id: String,
    pub trusting_period: Duration,
    pub latest_revision_number: u64,
    pub latest_revision_height: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub port_id: String,
    pub channel_id: String,
    /// Proto enum name, e.g. "STATE_OPEN"
    pub state: String,
    /// Proto enum name, e.g. "ORDER_UNORDERED"
    pub ordering: String,
    pub counterparty_port_id: String,
    pub counterparty_channel_id: String,
    pub connection_hops: Vec<String>,
    pub version: String,
}

impl ChannelInfo {
    pub fn is_closed(&self) -> bool {
        self.state == "STATE_CLOSED"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountInfo {
    pub account_number: u64,
    pub sequence: u64,
}

/// Result of a broadcast or a tx lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxResponse {
    pub tx_hash: String,
    pub code: u32,
    pub raw_log: String,
    /// Zero until the tx is included in a block
    pub height: u64,
}

impl TxResponse {
    pub fn is_ok(&self) -> bool {
        self.code == 0
    }
}

/// Query and broadcast operations the relay engine needs from one chain
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Get the chain ID
    fn chain_id(&self) -> &str;

    /// Latest block height and time
    async fn latest_block(&self) -> Result<LatestBlock>;

    /// All begin/end/tx events of one block
    async fn block_results(&self, height: u64) -> Result<BlockResults>;

    /// IBC store query, optionally with a merkle proof
    async fn query_store(&self, key: &[u8], height: u64, prove: bool)
        -> Result<StoreQueryResponse>;

    async fn connection(&self, connection_id: &str) -> Result<ConnectionInfo>;

    async fn client_state(&self, client_id: &str) -> Result<ClientStateInfo>;

    /// Unix nanos of the consensus state stored for `client_id` at the given height
    async fn consensus_timestamp(
        &self,
        client_id: &str,
        revision_number: u64,
        revision_height: u64,
    ) -> Result<u64>;

    async fn channel(&self, port_id: &str, channel_id: &str) -> Result<ChannelInfo>;

    /// Sequences from `sequences` not yet received on this chain's channel end
    async fn unreceived_packets(
        &self,
        port_id: &str,
        channel_id: &str,
        sequences: &[u64],
    ) -> Result<Vec<u64>>;

    /// Sequences whose ack this chain has not yet processed
    async fn unreceived_acks(
        &self,
        port_id: &str,
        channel_id: &str,
        sequences: &[u64],
    ) -> Result<Vec<u64>>;

    async fn signed_header(&self, height: u64)
        -> Result<tendermint_proto::types::SignedHeader>;

    async fn validator_set(&self, height: u64) -> Result<tendermint_proto::types::ValidatorSet>;

    async fn account(&self, address: &str) -> Result<AccountInfo>;

    /// Broadcast signed tx bytes, returning the CheckTx outcome
    async fn broadcast_tx(&self, tx_bytes: Vec<u8>) -> Result<TxResponse>;

    /// `None` while the tx is not indexed yet
    async fn tx_by_hash(&self, tx_hash: &str) -> Result<Option<TxResponse>>;
}

/// Revision number encoded as the trailing `-<digits>` of a chain id
pub fn revision_number(chain_id: &str) -> u64 {
    chain_id
        .rsplit_once('-')
        .and_then(|(_, suffix)| {
            if !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()) {
                suffix.parse().ok()
            } else {
                None
            }
        })
        .unwrap_or(0)
}

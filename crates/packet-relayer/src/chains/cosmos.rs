// Cosmos chain client over CometBFT RPC and the Cosmos REST gateway
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use super::{
    AccountInfo, BlockResults, ChainClient, ChannelInfo, ClientStateInfo, ConnectionInfo,
    EndpointPool, LatestBlock, ProofOp, RawAttribute, RawEvent, StoreQueryResponse, TxResponse,
};
use crate::config::{ChainConfig, GlobalConfig};
use crate::error::{RelayerError, Result};

const VALIDATORS_PER_PAGE: usize = 100;

/// Cosmos chain client with endpoint failover on both APIs
pub struct CosmosClient {
    chain_id: String,
    rpc: EndpointPool,
    rest: EndpointPool,
}

impl CosmosClient {
    /// Create a new Cosmos chain client
    pub fn new(config: &ChainConfig, global: &GlobalConfig) -> Result<Self> {
        let timeout = Duration::from_millis(global.request_timeout_ms);
        Ok(Self {
            chain_id: config.chain_id.clone(),
            rpc: EndpointPool::new(
                &config.chain_id,
                config.rpc_endpoints.clone(),
                timeout,
                global.max_query_rounds,
            )?,
            rest: EndpointPool::new(
                &config.chain_id,
                config.rest_endpoints.clone(),
                timeout,
                global.max_query_rounds,
            )?,
        })
    }

    fn malformed(&self, operation: &str, what: &str) -> RelayerError {
        RelayerError::query(&self.chain_id, operation, format!("unexpected response: missing {}", what))
    }

    /// Proposer of the block at `height`, needed to rebuild its validator set
    async fn proposer_address(&self, height: u64) -> Result<tendermint::account::Id> {
        let header = self.commit(height).await?;
        Ok(header.header.proposer_address)
    }

    async fn commit(&self, height: u64) -> Result<tendermint::block::signed_header::SignedHeader> {
        let body = self
            .rpc
            .get_json("commit", &format!("/commit?height={}", height))
            .await?;
        let response: tendermint_rpc::endpoint::commit::Response =
            serde_json::from_value(body["result"].clone())?;
        Ok(response.signed_header)
    }
}

fn parse_u64(value: &Value) -> Option<u64> {
    match value {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

fn parse_str(value: &Value) -> String {
    value.as_str().unwrap_or_default().to_string()
}

fn decode_b64(value: &Value) -> Result<Vec<u8>> {
    match value.as_str() {
        Some(s) if !s.is_empty() => general_purpose::STANDARD
            .decode(s)
            .map_err(|e| RelayerError::Decode(format!("invalid base64: {}", e))),
        _ => Ok(Vec::new()),
    }
}

fn parse_rfc3339_nanos(value: &str) -> Result<u64> {
    let time = tendermint::Time::parse_from_rfc3339(value)
        .map_err(|e| RelayerError::Decode(format!("invalid timestamp {}: {}", value, e)))?;
    u64::try_from(time.unix_timestamp_nanos())
        .map_err(|_| RelayerError::Decode(format!("timestamp {} before epoch", value)))
}

fn parse_events(events: &Value) -> Vec<RawEvent> {
    events
        .as_array()
        .map(|list| {
            list.iter()
                .map(|event| RawEvent {
                    kind: parse_str(&event["type"]),
                    attributes: event["attributes"]
                        .as_array()
                        .map(|attrs| {
                            attrs
                                .iter()
                                .map(|attr| RawAttribute {
                                    key: parse_str(&attr["key"]),
                                    value: parse_str(&attr["value"]),
                                })
                                .collect()
                        })
                        .unwrap_or_default(),
                })
                .collect()
        })
        .unwrap_or_default()
}

fn parse_tx_response(tx: &Value) -> TxResponse {
    TxResponse {
        tx_hash: parse_str(&tx["txhash"]),
        code: parse_u64(&tx["code"]).unwrap_or(0) as u32,
        raw_log: parse_str(&tx["raw_log"]),
        height: parse_u64(&tx["height"]).unwrap_or(0),
    }
}

/// Account fields, also found nested inside vesting accounts
fn find_base_account(account: &Value) -> Option<&Value> {
    if account.get("account_number").is_some() {
        return Some(account);
    }
    account
        .get("base_account")
        .or_else(|| account.get("base_vesting_account"))
        .and_then(find_base_account)
}

fn join_sequences(sequences: &[u64]) -> String {
    sequences
        .iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

fn parse_sequences(body: &Value) -> Vec<u64> {
    body["sequences"]
        .as_array()
        .map(|seqs| seqs.iter().filter_map(parse_u64).collect())
        .unwrap_or_default()
}

#[async_trait]
impl ChainClient for CosmosClient {
    fn chain_id(&self) -> &str {
        &self.chain_id
    }

    async fn latest_block(&self) -> Result<LatestBlock> {
        let body = self.rpc.get_json("status", "/status").await?;
        let sync_info = &body["result"]["sync_info"];
        let height = parse_u64(&sync_info["latest_block_height"])
            .ok_or_else(|| self.malformed("status", "latest_block_height"))?;
        let time = sync_info["latest_block_time"]
            .as_str()
            .ok_or_else(|| self.malformed("status", "latest_block_time"))?;
        Ok(LatestBlock {
            height,
            timestamp_nanos: parse_rfc3339_nanos(time)?,
        })
    }

    async fn block_results(&self, height: u64) -> Result<BlockResults> {
        let body = self
            .rpc
            .get_json("block_results", &format!("/block_results?height={}", height))
            .await?;
        let result = &body["result"];

        let mut events = parse_events(&result["begin_block_events"]);
        if let Some(txs) = result["txs_results"].as_array() {
            for tx in txs {
                // failed txs emit no state changes
                if parse_u64(&tx["code"]).unwrap_or(0) != 0 {
                    continue;
                }
                events.extend(parse_events(&tx["events"]));
            }
        }
        events.extend(parse_events(&result["end_block_events"]));
        events.extend(parse_events(&result["finalize_block_events"]));

        Ok(BlockResults { height, events })
    }

    async fn query_store(&self, key: &[u8], height: u64, prove: bool) -> Result<StoreQueryResponse> {
        let path = format!(
            "/abci_query?path=%22%2Fstore%2Fibc%2Fkey%22&data=0x{}&height={}&prove={}",
            hex::encode(key),
            height,
            prove
        );
        let body = self.rpc.get_json("abci_query", &path).await?;
        let response = &body["result"]["response"];

        let code = parse_u64(&response["code"]).unwrap_or(0);
        if code != 0 {
            return Err(RelayerError::query(
                &self.chain_id,
                "abci_query",
                format!("code {}: {}", code, parse_str(&response["log"])),
            ));
        }

        let mut proof_ops = Vec::new();
        if let Some(ops) = response["proofOps"]["ops"].as_array() {
            for op in ops {
                proof_ops.push(ProofOp {
                    op_type: parse_str(&op["type"]),
                    key: decode_b64(&op["key"])?,
                    data: decode_b64(&op["data"])?,
                });
            }
        }

        Ok(StoreQueryResponse {
            value: decode_b64(&response["value"])?,
            proof_ops,
            height: parse_u64(&response["height"]).unwrap_or(height),
        })
    }

    async fn connection(&self, connection_id: &str) -> Result<ConnectionInfo> {
        let body = self
            .rest
            .get_json(
                "connection",
                &format!("/ibc/core/connection/v1/connections/{}", connection_id),
            )
            .await?;
        let connection = &body["connection"];
        let client_id = connection["client_id"]
            .as_str()
            .ok_or_else(|| self.malformed("connection", "client_id"))?;
        Ok(ConnectionInfo {
            connection_id: connection_id.to_string(),
            client_id: client_id.to_string(),
            counterparty_client_id: parse_str(&connection["counterparty"]["client_id"]),
            counterparty_connection_id: parse_str(&connection["counterparty"]["connection_id"]),
        })
    }

    async fn client_state(&self, client_id: &str) -> Result<ClientStateInfo> {
        let body = self
            .rest
            .get_json(
                "client_state",
                &format!("/ibc/core/client/v1/client_states/{}", client_id),
            )
            .await?;
        let state = &body["client_state"];
        let trusting_period = state["trusting_period"]
            .as_str()
            .ok_or_else(|| self.malformed("client_state", "trusting_period"))?;
        let trusting_period = humantime::parse_duration(trusting_period)
            .map_err(|e| RelayerError::Decode(format!("trusting period {}: {}", trusting_period, e)))?;

        Ok(ClientStateInfo {
            client_id: client_id.to_string(),
            chain_id: parse_str(&state["chain_id"]),
            trusting_period,
            latest_revision_number: parse_u64(&state["latest_height"]["revision_number"])
                .unwrap_or(0),
            latest_revision_height: parse_u64(&state["latest_height"]["revision_height"])
                .ok_or_else(|| self.malformed("client_state", "latest_height"))?,
        })
    }

    async fn consensus_timestamp(
        &self,
        client_id: &str,
        revision_number: u64,
        revision_height: u64,
    ) -> Result<u64> {
        let body = self
            .rest
            .get_json(
                "consensus_state",
                &format!(
                    "/ibc/core/client/v1/consensus_states/{}/revision/{}/height/{}",
                    client_id, revision_number, revision_height
                ),
            )
            .await?;
        let timestamp = body["consensus_state"]["timestamp"]
            .as_str()
            .ok_or_else(|| self.malformed("consensus_state", "timestamp"))?;
        parse_rfc3339_nanos(timestamp)
    }

    async fn channel(&self, port_id: &str, channel_id: &str) -> Result<ChannelInfo> {
        let body = self
            .rest
            .get_json(
                "channel",
                &format!("/ibc/core/channel/v1/channels/{}/ports/{}", channel_id, port_id),
            )
            .await?;
        let channel = &body["channel"];
        if channel.is_null() {
            return Err(self.malformed("channel", "channel"));
        }
        Ok(ChannelInfo {
            port_id: port_id.to_string(),
            channel_id: channel_id.to_string(),
            state: parse_str(&channel["state"]),
            ordering: parse_str(&channel["ordering"]),
            counterparty_port_id: parse_str(&channel["counterparty"]["port_id"]),
            counterparty_channel_id: parse_str(&channel["counterparty"]["channel_id"]),
            connection_hops: channel["connection_hops"]
                .as_array()
                .map(|hops| hops.iter().map(parse_str).collect())
                .unwrap_or_default(),
            version: parse_str(&channel["version"]),
        })
    }

    async fn unreceived_packets(
        &self,
        port_id: &str,
        channel_id: &str,
        sequences: &[u64],
    ) -> Result<Vec<u64>> {
        if sequences.is_empty() {
            return Ok(Vec::new());
        }
        let body = self
            .rest
            .get_json(
                "unreceived_packets",
                &format!(
                    "/ibc/core/channel/v1/channels/{}/ports/{}/packet_commitments/{}/unreceived_packets",
                    channel_id,
                    port_id,
                    join_sequences(sequences)
                ),
            )
            .await?;
        Ok(parse_sequences(&body))
    }

    async fn unreceived_acks(
        &self,
        port_id: &str,
        channel_id: &str,
        sequences: &[u64],
    ) -> Result<Vec<u64>> {
        if sequences.is_empty() {
            return Ok(Vec::new());
        }
        let body = self
            .rest
            .get_json(
                "unreceived_acks",
                &format!(
                    "/ibc/core/channel/v1/channels/{}/ports/{}/packet_commitments/{}/unreceived_acks",
                    channel_id,
                    port_id,
                    join_sequences(sequences)
                ),
            )
            .await?;
        Ok(parse_sequences(&body))
    }

    async fn signed_header(&self, height: u64) -> Result<tendermint_proto::types::SignedHeader> {
        Ok(self.commit(height).await?.into())
    }

    async fn validator_set(&self, height: u64) -> Result<tendermint_proto::types::ValidatorSet> {
        let proposer = self.proposer_address(height).await?;

        let mut validators = Vec::new();
        let mut page = 1;
        loop {
            let body = self
                .rpc
                .get_json(
                    "validators",
                    &format!(
                        "/validators?height={}&page={}&per_page={}",
                        height, page, VALIDATORS_PER_PAGE
                    ),
                )
                .await?;
            let response: tendermint_rpc::endpoint::validators::Response =
                serde_json::from_value(body["result"].clone())?;
            let fetched = response.validators.len();
            validators.extend(response.validators);
            if fetched < VALIDATORS_PER_PAGE || validators.len() >= response.total as usize {
                break;
            }
            page += 1;
        }
        debug!(
            "{}: fetched {} validators at height {}",
            self.chain_id,
            validators.len(),
            height
        );

        let set = tendermint::validator::Set::with_proposer(validators, proposer)
            .map_err(|e| RelayerError::Decode(format!("validator set at {}: {}", height, e)))?;
        Ok(set.into())
    }

    async fn account(&self, address: &str) -> Result<AccountInfo> {
        let body = self
            .rest
            .get_json(
                "account",
                &format!("/cosmos/auth/v1beta1/accounts/{}", address),
            )
            .await?;
        let account =
            find_base_account(&body["account"]).ok_or_else(|| self.malformed("account", "account_number"))?;
        Ok(AccountInfo {
            account_number: parse_u64(&account["account_number"]).unwrap_or(0),
            sequence: parse_u64(&account["sequence"]).unwrap_or(0),
        })
    }

    async fn broadcast_tx(&self, tx_bytes: Vec<u8>) -> Result<TxResponse> {
        let body = self
            .rest
            .post_json(
                "broadcast_tx",
                "/cosmos/tx/v1beta1/txs",
                &json!({
                    "tx_bytes": general_purpose::STANDARD.encode(tx_bytes),
                    "mode": "BROADCAST_MODE_SYNC"
                }),
            )
            .await?;
        let tx = body
            .get("tx_response")
            .ok_or_else(|| self.malformed("broadcast_tx", "tx_response"))?;
        Ok(parse_tx_response(tx))
    }

    async fn tx_by_hash(&self, tx_hash: &str) -> Result<Option<TxResponse>> {
        let body = self
            .rest
            .get_json_optional("tx_by_hash", &format!("/cosmos/tx/v1beta1/txs/{}", tx_hash))
            .await?;
        Ok(body
            .as_ref()
            .and_then(|b| b.get("tx_response"))
            .map(parse_tx_response))
    }
}

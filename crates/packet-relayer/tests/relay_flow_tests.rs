// End-to-end relay flow against in-process mock chains

use async_trait::async_trait;
use cosmos_sdk_proto::cosmos::tx::v1beta1::{AuthInfo, TxBody, TxRaw};
use ibc_proto::ibc::core::channel::v1::{MsgRecvPacket, MsgTimeout, MsgTimeoutOnClose};
use ibc_proto::ibc::core::client::v1::MsgUpdateClient;
use prost::Message;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;

use packet_relayer::chains::{
    AccountInfo, BlockResults, ChainClient, ChainRegistry, ChannelInfo, ClientStateInfo,
    ConnectionInfo, LatestBlock, ProofOp, RawEvent, RouteTable, StoreQueryResponse, TxResponse,
};
use packet_relayer::config::{
    ChainConfig, ConnectionConfig, GlobalConfig, MetricsConfig, RelayerConfig, SyncConfig,
    WalletConfig,
};
use packet_relayer::error::{RelayerError, Result};
use packet_relayer::events::{Height, IbcEvent, PacketEvent, PacketInfo};
use packet_relayer::gate::{NodeGate, StandaloneNode};
use packet_relayer::keystore::CosmosKey;
use packet_relayer::metrics::RelayerMetrics;
use packet_relayer::relay::factory::{
    RECV_PACKET_TYPE_URL, TIMEOUT_ON_CLOSE_TYPE_URL, TIMEOUT_TYPE_URL, UPDATE_CLIENT_TYPE_URL,
};
use packet_relayer::relay::{WalletContext, WalletWorker};
use packet_relayer::relayer::Relayer;
use packet_relayer::scheduler::{drive, BackoffPolicy, Step, Task};
use packet_relayer::store::packets::TimeoutCutoff;
use packet_relayer::store::sync::OPEN_ENDED;
use packet_relayer::store::{PacketKind, PendingItem, RelayStore};
use packet_relayer::sync::{prepare_chain_sync, SyncContext};

const TEST_PRIVATE_KEY: [u8; 32] = [7u8; 32];
const TRUSTED_HEIGHT: u64 = 5;

/// Chain whose blocks, height, receipts and query answers are set by the test
struct MockChain {
    chain_id: String,
    /// Chain every light client on this chain tracks
    tracked_chain_id: String,
    latest: Mutex<LatestBlock>,
    blocks: Mutex<HashMap<u64, Vec<RawEvent>>>,
    received: Mutex<HashSet<u64>>,
    channel_state: Mutex<String>,
    account_sequence: Mutex<u64>,
    /// Number of nextSequenceRecv reads answered with an empty value
    empty_next_sequence: Mutex<u32>,
    fail_unreceived: Mutex<bool>,
    /// Scripted broadcast answers, `None` for a transport error
    broadcast_script: Mutex<VecDeque<Option<TxResponse>>>,
    broadcasts: Mutex<Vec<Vec<u8>>>,
    store_queries: Mutex<Vec<(String, u64)>>,
}

impl MockChain {
    fn new(chain_id: &str, height: u64) -> Self {
        Self {
            chain_id: chain_id.to_string(),
            tracked_chain_id: String::new(),
            latest: Mutex::new(LatestBlock {
                height,
                timestamp_nanos: 1_000_000_000,
            }),
            blocks: Mutex::new(HashMap::new()),
            received: Mutex::new(HashSet::new()),
            channel_state: Mutex::new("STATE_OPEN".to_string()),
            account_sequence: Mutex::new(0),
            empty_next_sequence: Mutex::new(0),
            fail_unreceived: Mutex::new(false),
            broadcast_script: Mutex::new(VecDeque::new()),
            broadcasts: Mutex::new(Vec::new()),
            store_queries: Mutex::new(Vec::new()),
        }
    }

    fn tracking(mut self, chain_id: &str) -> Self {
        self.tracked_chain_id = chain_id.to_string();
        self
    }

    fn add_event(&self, height: u64, event: RawEvent) {
        self.blocks.lock().unwrap().entry(height).or_default().push(event);
    }

    fn mark_received(&self, sequence: u64) {
        self.received.lock().unwrap().insert(sequence);
    }

    fn script_broadcast(&self, response: Option<TxResponse>) {
        self.broadcast_script.lock().unwrap().push_back(response);
    }

    fn broadcasts(&self) -> Vec<Vec<u8>> {
        self.broadcasts.lock().unwrap().clone()
    }

    fn store_queries(&self) -> Vec<(String, u64)> {
        self.store_queries.lock().unwrap().clone()
    }

    fn unsupported(&self, operation: &str) -> RelayerError {
        RelayerError::query(&self.chain_id, operation, "not available on mock chain")
    }
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos() as u64
}

/// "connection-N" is served by light client "07-tendermint-N"
fn client_for(connection_id: &str) -> String {
    let suffix = connection_id.rsplit('-').next().unwrap_or_default();
    format!("07-tendermint-{}", suffix)
}

#[async_trait]
impl ChainClient for MockChain {
    fn chain_id(&self) -> &str {
        &self.chain_id
    }

    async fn latest_block(&self) -> Result<LatestBlock> {
        Ok(*self.latest.lock().unwrap())
    }

    async fn block_results(&self, height: u64) -> Result<BlockResults> {
        if height > self.latest.lock().unwrap().height {
            return Err(RelayerError::query(&self.chain_id, "block_results", "height not available"));
        }
        let events = self
            .blocks
            .lock()
            .unwrap()
            .get(&height)
            .cloned()
            .unwrap_or_default();
        Ok(BlockResults { height, events })
    }

    async fn query_store(&self, key: &[u8], height: u64, _prove: bool) -> Result<StoreQueryResponse> {
        let key = String::from_utf8_lossy(key).to_string();
        self.store_queries.lock().unwrap().push((key.clone(), height));

        let value = if key.starts_with("nextSequenceRecv") {
            let mut empty = self.empty_next_sequence.lock().unwrap();
            if *empty > 0 {
                *empty -= 1;
                Vec::new()
            } else {
                1u64.to_be_bytes().to_vec()
            }
        } else {
            b"stored".to_vec()
        };
        let op = |op_type: &str| ProofOp {
            op_type: op_type.to_string(),
            key: key.as_bytes().to_vec(),
            data: Vec::new(),
        };
        Ok(StoreQueryResponse {
            value,
            proof_ops: vec![op("ics23:iavl"), op("ics23:simple")],
            height,
        })
    }

    async fn connection(&self, connection_id: &str) -> Result<ConnectionInfo> {
        Ok(ConnectionInfo {
            connection_id: connection_id.to_string(),
            client_id: client_for(connection_id),
            counterparty_client_id: "07-tendermint-9".to_string(),
            counterparty_connection_id: "connection-9".to_string(),
        })
    }

    async fn client_state(&self, client_id: &str) -> Result<ClientStateInfo> {
        if self.tracked_chain_id.is_empty() {
            return Err(self.unsupported("client_state"));
        }
        Ok(ClientStateInfo {
            client_id: client_id.to_string(),
            chain_id: self.tracked_chain_id.clone(),
            trusting_period: Duration::from_secs(14 * 24 * 3600),
            latest_revision_number: 0,
            latest_revision_height: TRUSTED_HEIGHT,
        })
    }

    async fn consensus_timestamp(&self, _client_id: &str, _rn: u64, _rh: u64) -> Result<u64> {
        Ok(now_nanos())
    }

    async fn channel(&self, port_id: &str, channel_id: &str) -> Result<ChannelInfo> {
        Ok(ChannelInfo {
            port_id: port_id.to_string(),
            channel_id: channel_id.to_string(),
            state: self.channel_state.lock().unwrap().clone(),
            ordering: "ORDER_UNORDERED".to_string(),
            counterparty_port_id: "transfer".to_string(),
            counterparty_channel_id: "channel-0".to_string(),
            connection_hops: vec!["connection-2".to_string()],
            version: "ics20-1".to_string(),
        })
    }

    async fn unreceived_packets(
        &self,
        _port_id: &str,
        _channel_id: &str,
        sequences: &[u64],
    ) -> Result<Vec<u64>> {
        if *self.fail_unreceived.lock().unwrap() {
            return Err(self.unsupported("unreceived_packets"));
        }
        let received = self.received.lock().unwrap();
        Ok(sequences
            .iter()
            .copied()
            .filter(|seq| !received.contains(seq))
            .collect())
    }

    async fn unreceived_acks(
        &self,
        _port_id: &str,
        _channel_id: &str,
        sequences: &[u64],
    ) -> Result<Vec<u64>> {
        Ok(sequences.to_vec())
    }

    async fn signed_header(&self, _height: u64) -> Result<tendermint_proto::types::SignedHeader> {
        Ok(Default::default())
    }

    async fn validator_set(&self, _height: u64) -> Result<tendermint_proto::types::ValidatorSet> {
        Ok(Default::default())
    }

    async fn account(&self, _address: &str) -> Result<AccountInfo> {
        Ok(AccountInfo {
            account_number: 1,
            sequence: *self.account_sequence.lock().unwrap(),
        })
    }

    async fn broadcast_tx(&self, tx_bytes: Vec<u8>) -> Result<TxResponse> {
        let mut broadcasts = self.broadcasts.lock().unwrap();
        broadcasts.push(tx_bytes);
        let accepted = TxResponse {
            tx_hash: format!("TX{}", broadcasts.len()),
            code: 0,
            raw_log: String::new(),
            height: 0,
        };
        match self.broadcast_script.lock().unwrap().pop_front() {
            Some(Some(response)) => Ok(response),
            Some(None) => Err(self.unsupported("broadcast_tx")),
            None => Ok(accepted),
        }
    }

    async fn tx_by_hash(&self, tx_hash: &str) -> Result<Option<TxResponse>> {
        Ok(Some(TxResponse {
            tx_hash: tx_hash.to_string(),
            code: 0,
            raw_log: String::new(),
            height: self.latest.lock().unwrap().height + 1,
        }))
    }
}

struct NeverLeader;

#[async_trait]
impl NodeGate for NeverLeader {
    async fn is_active_node(&self) -> Result<bool> {
        Ok(true)
    }

    async fn is_leader(&self) -> Result<bool> {
        Ok(false)
    }
}

fn create_send_event(sequence: u64) -> RawEvent {
    let sequence = sequence.to_string();
    RawEvent::new(
        "send_packet",
        &[
            ("packet_data_hex", "7b22616d6f756e74223a2231227d"),
            ("packet_timeout_height", "0-1000"),
            ("packet_timeout_timestamp", "0"),
            ("packet_sequence", sequence.as_str()),
            ("packet_src_port", "transfer"),
            ("packet_src_channel", "channel-0"),
            ("packet_dst_port", "transfer"),
            ("packet_dst_channel", "channel-1"),
            ("packet_channel_ordering", "ORDER_UNORDERED"),
            ("connection_id", "connection-1"),
        ],
    )
}

fn create_test_packet(sequence: u64) -> PacketInfo {
    PacketInfo {
        sequence,
        src_port: "transfer".to_string(),
        src_channel: "channel-0".to_string(),
        dst_port: "transfer".to_string(),
        dst_channel: "channel-1".to_string(),
        data: b"{}".to_vec(),
        timeout_height: Some(Height::new(0, 1000)),
        timeout_timestamp: 0,
        connection_id: "connection-1".to_string(),
        ordering: "ORDER_UNORDERED".to_string(),
    }
}

fn create_connection_config() -> ConnectionConfig {
    ConnectionConfig {
        chain_a: "chain-a".to_string(),
        connection_a: "connection-1".to_string(),
        chain_b: "chain-b".to_string(),
        connection_b: "connection-2".to_string(),
    }
}

fn create_chain_config(chain_id: &str, start_height: Option<u64>) -> ChainConfig {
    ChainConfig {
        chain_id: chain_id.to_string(),
        rpc_endpoints: vec!["http://localhost:26657".to_string()],
        rest_endpoints: vec!["http://localhost:1317".to_string()],
        address_prefix: "cosmos".to_string(),
        gas_price: "0.025stake".to_string(),
        gas_limit: 200_000,
        start_height,
        wallets: Vec::new(),
    }
}

fn create_sync_config() -> SyncConfig {
    SyncConfig {
        batch_size: 2,
        poll_interval_ms: 10,
        height_poll_interval_ms: 10,
        max_height_failures: 3,
        catch_up_gap: None,
    }
}

fn create_test_config() -> RelayerConfig {
    let mut chains = HashMap::new();
    chains.insert("chain-a".to_string(), create_chain_config("chain-a", Some(1)));
    chains.insert("chain-b".to_string(), create_chain_config("chain-b", Some(1)));
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
        sync: create_sync_config(),
        chains,
        connections: vec![create_connection_config()],
        metrics: MetricsConfig {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 0,
        },
    }
}

fn create_registry(chain_a: Arc<MockChain>, chain_b: Arc<MockChain>) -> Arc<ChainRegistry> {
    let mut registry = ChainRegistry::new();
    registry.register(chain_a);
    registry.register(chain_b);
    Arc::new(registry)
}

/// The tested pair plus a second connection served by its own light clients
fn create_routes() -> RouteTable {
    RouteTable::from_config(&[
        create_connection_config(),
        ConnectionConfig {
            chain_a: "chain-a".to_string(),
            connection_a: "connection-3".to_string(),
            chain_b: "chain-b".to_string(),
            connection_b: "connection-4".to_string(),
        },
    ])
}

fn create_test_wallet(
    registry: Arc<ChainRegistry>,
    store: RelayStore,
    chain_id: &str,
) -> WalletWorker {
    create_wallet_with_metrics(registry, store, chain_id, None)
}

fn create_wallet_with_metrics(
    registry: Arc<ChainRegistry>,
    store: RelayStore,
    chain_id: &str,
    metrics: Option<RelayerMetrics>,
) -> WalletWorker {
    let key = CosmosKey::from_private_key(TEST_PRIVATE_KEY.to_vec(), "cosmos").unwrap();
    let wallet = WalletConfig {
        key_env: None,
        key_hex: None,
        max_handle_packet: 10,
        loop_interval_ms: 10,
        memo: String::new(),
    };
    WalletWorker::new(
        &create_chain_config(chain_id, None),
        &wallet,
        &create_test_config().global,
        key,
        WalletContext {
            registry,
            routes: Arc::new(create_routes()),
            store,
            metrics,
        },
    )
    .unwrap()
}

async fn publish_latest(registry: &ChainRegistry) {
    for chain_id in registry.chain_ids() {
        let latest = registry.client(&chain_id).unwrap().latest_block().await.unwrap();
        registry.publish(&chain_id, latest).unwrap();
    }
}

async fn ingest_sends(store: &RelayStore, sequences: &[u64]) {
    let packets: Vec<PacketInfo> = sequences.iter().map(|seq| create_test_packet(*seq)).collect();
    ingest_packets(store, packets).await;
}

async fn ingest_packets(store: &RelayStore, packets: Vec<PacketInfo>) {
    store.init_sync_ranges("chain-a", Some(1), 10, None).await.unwrap();
    let events: Vec<IbcEvent> = packets
        .into_iter()
        .map(|packet| IbcEvent::Packet(PacketEvent::Send(packet)))
        .collect();
    store
        .ingest_batch("chain-a", &create_routes(), OPEN_ENDED, 5, &events)
        .await
        .unwrap();
}

/// Messages and signer sequence of a broadcast tx
fn decode_tx(tx_bytes: &[u8]) -> (Vec<prost_types::Any>, u64) {
    let raw = TxRaw::decode(tx_bytes).unwrap();
    let body = TxBody::decode(raw.body_bytes.as_slice()).unwrap();
    let auth_info = AuthInfo::decode(raw.auth_info_bytes.as_slice()).unwrap();
    (body.messages, auth_info.signer_infos[0].sequence)
}

fn type_urls(messages: &[prost_types::Any]) -> Vec<&str> {
    messages.iter().map(|m| m.type_url.as_str()).collect()
}

#[tokio::test]
async fn test_backfill_range_syncs_and_merges() {
    let chain_a = Arc::new(MockChain::new("chain-a", 10));
    chain_a.add_event(3, create_send_event(1));
    let chain_b = Arc::new(MockChain::new("chain-b", 10));
    let registry = create_registry(chain_a, chain_b);
    let store = RelayStore::open_in_memory().await.unwrap();

    // a previous run started live at the tip
    store.init_sync_ranges("chain-a", None, 10, None).await.unwrap();

    let ctx = SyncContext {
        registry: registry.clone(),
        routes: Arc::new(RouteTable::from_config(&[create_connection_config()])),
        store: store.clone(),
        metrics: None,
    };
    let (_tracker, mut workers) =
        prepare_chain_sync(&create_chain_config("chain-a", Some(1)), &create_sync_config(), &ctx)
            .await
            .unwrap();
    assert_eq!(workers.len(), 2);

    let (_stop_tx, stop_rx) = watch::channel(false);
    let mut backfill = workers.remove(0);
    drive(&mut backfill, &BackoffPolicy::default(), stop_rx)
        .await
        .unwrap();
    assert_eq!(backfill.synced_height(), 9);

    let ranges = store.sync_ranges("chain-a").await.unwrap();
    assert_eq!(ranges.len(), 1);
    assert_eq!(ranges[0].start_height, 1);
    assert_eq!(ranges[0].end_height, OPEN_ENDED);

    let cutoff = TimeoutCutoff {
        revision_number: 0,
        height: 10,
        timestamp_nanos: 1_000_000_000,
    };
    let pending = store.pending_sends("chain-b", cutoff, 10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].sequence(), 1);
}

#[tokio::test]
async fn test_live_worker_follows_the_tip() {
    let chain_a = Arc::new(MockChain::new("chain-a", 4));
    let chain_b = Arc::new(MockChain::new("chain-b", 4));
    let registry = create_registry(chain_a.clone(), chain_b);
    let store = RelayStore::open_in_memory().await.unwrap();
    let ctx = SyncContext {
        registry: registry.clone(),
        routes: Arc::new(RouteTable::from_config(&[create_connection_config()])),
        store: store.clone(),
        metrics: None,
    };
    let (_tracker, mut workers) =
        prepare_chain_sync(&create_chain_config("chain-a", Some(1)), &create_sync_config(), &ctx)
            .await
            .unwrap();
    let mut live = workers.remove(0);

    // batch size 2: 1..=2 then 3..=4, then nothing new
    assert_eq!(live.step().await.unwrap(), Step::Continue(Duration::ZERO));
    assert_eq!(live.step().await.unwrap(), Step::Continue(Duration::from_millis(10)));
    assert_eq!(live.synced_height(), 4);
    assert_eq!(live.step().await.unwrap(), Step::Continue(Duration::from_millis(10)));
    assert_eq!(live.synced_height(), 4);

    // new block with a send
    chain_a.add_event(5, create_send_event(9));
    *chain_a.latest.lock().unwrap() = LatestBlock {
        height: 5,
        timestamp_nanos: 2_000_000_000,
    };
    publish_latest(&registry).await;
    live.step().await.unwrap();
    assert_eq!(live.synced_height(), 5);

    let sends = store.all_packets(PacketKind::Send).await.unwrap();
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0].sequence(), 9);
    assert_eq!(store.sync_ranges("chain-a").await.unwrap()[0].synced_height, 5);
}

#[tokio::test]
async fn test_filter_drops_already_received_packets() {
    let chain_a = Arc::new(MockChain::new("chain-a", 10));
    let chain_b = Arc::new(MockChain::new("chain-b", 10));
    chain_b.mark_received(1);
    let registry = create_registry(chain_a, chain_b);
    publish_latest(&registry).await;

    let store = RelayStore::open_in_memory().await.unwrap();
    ingest_sends(&store, &[1, 2]).await;

    let worker = create_test_wallet(registry, store.clone(), "chain-b");
    let selected = worker.select().await.unwrap();
    assert_eq!(selected.len(), 2);

    let (live, stale) = worker.filter(&selected).await.unwrap();
    let sequences = |items: &[PendingItem]| -> Vec<u64> {
        items
            .iter()
            .filter_map(|item| match item {
                PendingItem::Packet(_, record) => Some(record.sequence()),
                PendingItem::Handshake(_) => None,
            })
            .collect()
    };
    assert_eq!(sequences(&live), vec![2]);
    assert_eq!(sequences(&stale), vec![1]);

    store.delete_items(&stale).await.unwrap();
    let remaining = store.all_packets(PacketKind::Send).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].sequence(), 2);
}

#[tokio::test]
async fn test_leased_packets_are_not_selected_twice() {
    let chain_a = Arc::new(MockChain::new("chain-a", 10));
    let chain_b = Arc::new(MockChain::new("chain-b", 10));
    let registry = create_registry(chain_a, chain_b);
    publish_latest(&registry).await;

    let store = RelayStore::open_in_memory().await.unwrap();
    ingest_sends(&store, &[1, 2, 3]).await;

    let first = create_test_wallet(registry.clone(), store.clone(), "chain-b");
    let second = create_test_wallet(registry, store.clone(), "chain-b");

    let leased = store.lease(first.select().await.unwrap()).await.unwrap();
    assert_eq!(leased.len(), 3);
    assert!(second.select().await.unwrap().is_empty());

    store.release(&leased).await.unwrap();
    assert_eq!(second.select().await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_sequence_self_heals_after_mismatch() {
    let chain_a = Arc::new(MockChain::new("chain-a", 10));
    let chain_b = Arc::new(MockChain::new("chain-b", 10));
    let registry = create_registry(chain_a, chain_b);
    let store = RelayStore::open_in_memory().await.unwrap();
    let mut worker = create_test_wallet(registry, store, "chain-b");

    worker.set_account(AccountInfo {
        account_number: 7,
        sequence: 41,
    });
    worker.handle_tx_failure(&TxResponse {
        tx_hash: "AB12".to_string(),
        code: 32,
        raw_log: "account sequence mismatch, expected 42, got 41: incorrect account sequence"
            .to_string(),
        height: 0,
    });
    assert_eq!(worker.account().unwrap().sequence, 42);

    // rejected at CheckTx: the sequence was not consumed
    worker.handle_tx_failure(&TxResponse {
        tx_hash: "CD34".to_string(),
        code: 13,
        raw_log: "insufficient fee".to_string(),
        height: 0,
    });
    assert_eq!(worker.account().unwrap().sequence, 42);

    // failed in DeliverTx: the sequence was consumed
    worker.handle_tx_failure(&TxResponse {
        tx_hash: "EF56".to_string(),
        code: 11,
        raw_log: "out of gas".to_string(),
        height: 120,
    });
    assert_eq!(worker.account().unwrap().sequence, 43);
}

#[tokio::test]
async fn test_relayer_syncs_while_leader() {
    let chain_a = Arc::new(MockChain::new("chain-a", 6));
    chain_a.add_event(2, create_send_event(4));
    let chain_b = Arc::new(MockChain::new("chain-b", 6));

    let mut registry = ChainRegistry::new();
    registry.register(chain_a);
    registry.register(chain_b);
    let store = RelayStore::open_in_memory().await.unwrap();
    let relayer = Arc::new(
        Relayer::with_parts(create_test_config(), registry, store.clone(), Arc::new(StandaloneNode))
            .unwrap(),
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    let running = relayer.clone();
    let handle = tokio::spawn(async move { running.run(stop_rx).await });
    tokio::time::sleep(Duration::from_millis(300)).await;
    stop_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();

    let ranges = store.sync_ranges("chain-a").await.unwrap();
    assert_eq!(ranges[0].synced_height, 6);
    assert_eq!(store.all_packets(PacketKind::Send).await.unwrap().len(), 1);

    let metrics = relayer.metrics().unwrap().encode_text().unwrap();
    assert!(metrics.contains("blocks_synced"));
}

#[tokio::test]
async fn test_relayer_stays_idle_without_leadership() {
    let mut registry = ChainRegistry::new();
    registry.register(Arc::new(MockChain::new("chain-a", 6)));
    registry.register(Arc::new(MockChain::new("chain-b", 6)));
    let store = RelayStore::open_in_memory().await.unwrap();
    let relayer =
        Relayer::with_parts(create_test_config(), registry, store.clone(), Arc::new(NeverLeader))
            .unwrap();

    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { relayer.run(stop_rx).await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    stop_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();

    assert!(store.all_sync_ranges().await.unwrap().is_empty());
}

fn create_packet_on(
    sequence: u64,
    connection_id: &str,
    src_channel: &str,
    dst_channel: &str,
) -> PacketInfo {
    PacketInfo {
        connection_id: connection_id.to_string(),
        src_channel: src_channel.to_string(),
        dst_channel: dst_channel.to_string(),
        ..create_test_packet(sequence)
    }
}

/// chain-b receives packets sent on chain-a; its light clients trust chain-a at 5
fn create_receiving_pair() -> (Arc<MockChain>, Arc<MockChain>, Arc<ChainRegistry>) {
    let chain_a = Arc::new(MockChain::new("chain-a", 10));
    let chain_b = Arc::new(MockChain::new("chain-b", 10).tracking("chain-a"));
    let registry = create_registry(chain_a.clone(), chain_b.clone());
    (chain_a, chain_b, registry)
}

/// chain-a times out packets whose deadline passed on chain-b
fn create_timing_out_pair() -> (Arc<MockChain>, Arc<MockChain>, Arc<ChainRegistry>) {
    let chain_a = Arc::new(MockChain::new("chain-a", 10).tracking("chain-b"));
    let chain_b = Arc::new(MockChain::new("chain-b", 1200));
    let registry = create_registry(chain_a.clone(), chain_b.clone());
    (chain_a, chain_b, registry)
}

#[tokio::test]
async fn test_batch_updates_each_client_once() {
    let (chain_a, chain_b, registry) = create_receiving_pair();
    publish_latest(&registry).await;
    let store = RelayStore::open_in_memory().await.unwrap();
    ingest_packets(
        &store,
        vec![
            create_test_packet(1),
            create_test_packet(2),
            create_packet_on(3, "connection-3", "channel-2", "channel-3"),
        ],
    )
    .await;

    let mut worker = create_test_wallet(registry, store.clone(), "chain-b");
    assert_eq!(worker.step().await.unwrap(), Step::Continue(Duration::from_millis(10)));

    let broadcasts = chain_b.broadcasts();
    assert_eq!(broadcasts.len(), 1);
    let (messages, _) = decode_tx(&broadcasts[0]);
    assert_eq!(
        type_urls(&messages),
        vec![
            UPDATE_CLIENT_TYPE_URL,
            RECV_PACKET_TYPE_URL,
            RECV_PACKET_TYPE_URL,
            UPDATE_CLIENT_TYPE_URL,
            RECV_PACKET_TYPE_URL,
        ]
    );

    let updated: Vec<String> = messages
        .iter()
        .filter(|m| m.type_url == UPDATE_CLIENT_TYPE_URL)
        .map(|m| MsgUpdateClient::decode(m.value.as_slice()).unwrap().client_id)
        .collect();
    assert_eq!(updated, vec!["07-tendermint-2", "07-tendermint-4"]);

    // every receive is proven at the height the client was moved to
    for message in messages.iter().filter(|m| m.type_url == RECV_PACKET_TYPE_URL) {
        let recv = MsgRecvPacket::decode(message.value.as_slice()).unwrap();
        assert_eq!(recv.proof_height.unwrap().revision_height, 10);
        assert!(!recv.proof_commitment.is_empty());
    }
    let queries = chain_a.store_queries();
    assert_eq!(queries.len(), 3);
    assert!(queries
        .iter()
        .all(|(key, height)| key.starts_with("commitments/") && *height == 9));

    let client = store.get_client("chain-b", "07-tendermint-2").await.unwrap().unwrap();
    assert_eq!(client.revision_height, 10);

    // the batch's leases were released
    assert_eq!(worker.select().await.unwrap().len(), 3);
    assert_eq!(worker.account().unwrap().sequence, 1);
}

#[tokio::test]
async fn test_broadcast_failure_releases_leases() {
    let (_chain_a, chain_b, registry) = create_receiving_pair();
    publish_latest(&registry).await;
    let store = RelayStore::open_in_memory().await.unwrap();
    ingest_sends(&store, &[1, 2]).await;

    let mut worker = create_test_wallet(registry, store.clone(), "chain-b");
    chain_b.script_broadcast(None);
    assert!(worker.step().await.is_err());

    assert_eq!(chain_b.broadcasts().len(), 1);
    assert_eq!(worker.select().await.unwrap().len(), 2);
    // the client is re-read and the account re-queried on the next attempt
    assert!(store.get_client("chain-b", "07-tendermint-2").await.unwrap().is_none());
    assert!(worker.account().is_none());

    worker.step().await.unwrap();
    assert_eq!(chain_b.broadcasts().len(), 2);
}

#[tokio::test]
async fn test_filter_failure_releases_leases() {
    let (_chain_a, chain_b, registry) = create_receiving_pair();
    publish_latest(&registry).await;
    let store = RelayStore::open_in_memory().await.unwrap();
    ingest_sends(&store, &[1, 2]).await;

    let mut worker = create_test_wallet(registry, store.clone(), "chain-b");
    *chain_b.fail_unreceived.lock().unwrap() = true;
    assert!(worker.step().await.is_err());

    assert!(chain_b.broadcasts().is_empty());
    assert_eq!(worker.select().await.unwrap().len(), 2);
    assert_eq!(store.all_packets(PacketKind::Send).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_timeout_follows_destination_channel_state() {
    let (chain_a, chain_b, registry) = create_timing_out_pair();
    publish_latest(&registry).await;
    let store = RelayStore::open_in_memory().await.unwrap();
    ingest_sends(&store, &[1]).await;

    let mut worker = create_test_wallet(registry, store.clone(), "chain-a");
    worker.step().await.unwrap();

    let (messages, _) = decode_tx(&chain_a.broadcasts()[0]);
    assert_eq!(type_urls(&messages), vec![UPDATE_CLIENT_TYPE_URL, TIMEOUT_TYPE_URL]);
    let timeout = MsgTimeout::decode(messages[1].value.as_slice()).unwrap();
    assert_eq!(timeout.next_sequence_recv, 1);
    assert_eq!(timeout.proof_height.unwrap().revision_height, 1200);

    // the channel closed meanwhile; the client already trusts 1200
    *chain_b.channel_state.lock().unwrap() = "STATE_CLOSED".to_string();
    worker.step().await.unwrap();

    let (messages, _) = decode_tx(&chain_a.broadcasts()[1]);
    assert_eq!(type_urls(&messages), vec![TIMEOUT_ON_CLOSE_TYPE_URL]);
    let on_close = MsgTimeoutOnClose::decode(messages[0].value.as_slice()).unwrap();
    assert_eq!(on_close.proof_height.unwrap().revision_height, 1200);
    assert!(!on_close.proof_close.is_empty());
    assert!(!on_close.proof_unreceived.is_empty());

    let queries = chain_b.store_queries();
    assert!(queries.iter().all(|(_, height)| *height == 1199));
    assert!(queries.iter().any(|(key, _)| key.starts_with("channelEnds/")));
    assert!(queries.iter().any(|(key, _)| key.starts_with("receipts/")));
}

#[tokio::test]
async fn test_next_sequence_recv_is_retried_until_indexed() {
    let (chain_a, chain_b, registry) = create_timing_out_pair();
    publish_latest(&registry).await;
    let store = RelayStore::open_in_memory().await.unwrap();
    ingest_sends(&store, &[1]).await;
    *chain_b.empty_next_sequence.lock().unwrap() = 2;

    let mut worker = create_test_wallet(registry, store, "chain-a");
    let started = Instant::now();
    worker.step().await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(200));

    let reads = chain_b
        .store_queries()
        .iter()
        .filter(|(key, _)| key.starts_with("nextSequenceRecv/"))
        .count();
    assert_eq!(reads, 3);
    assert_eq!(chain_a.broadcasts().len(), 1);
}

#[tokio::test]
async fn test_next_sequence_recv_gives_up_after_five_reads() {
    let (chain_a, chain_b, registry) = create_timing_out_pair();
    publish_latest(&registry).await;
    let store = RelayStore::open_in_memory().await.unwrap();
    ingest_sends(&store, &[1]).await;
    *chain_b.empty_next_sequence.lock().unwrap() = 10;

    let mut worker = create_test_wallet(registry, store, "chain-a");
    let started = Instant::now();
    let err = worker.step().await.unwrap_err();
    assert!(matches!(err, RelayerError::MalformedProof { .. }));
    assert!(started.elapsed() >= Duration::from_millis(400));

    let reads = chain_b
        .store_queries()
        .iter()
        .filter(|(key, _)| key.starts_with("nextSequenceRecv/"))
        .count();
    assert_eq!(reads, 5);
    assert!(chain_a.broadcasts().is_empty());
    assert_eq!(worker.select().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_mismatched_sequence_is_used_on_next_broadcast() {
    let (_chain_a, chain_b, registry) = create_receiving_pair();
    publish_latest(&registry).await;
    let store = RelayStore::open_in_memory().await.unwrap();
    ingest_sends(&store, &[1]).await;
    *chain_b.account_sequence.lock().unwrap() = 41;
    chain_b.script_broadcast(Some(TxResponse {
        tx_hash: "AB12".to_string(),
        code: 32,
        raw_log: "account sequence mismatch, expected 45, got 41: incorrect account sequence"
            .to_string(),
        height: 0,
    }));

    let mut worker = create_test_wallet(registry, store, "chain-b");
    let err = worker.step().await.unwrap_err();
    assert!(matches!(err, RelayerError::TxFailed { code: 32, .. }));
    assert_eq!(worker.account().unwrap().sequence, 45);

    worker.step().await.unwrap();
    let sequences: Vec<u64> = chain_b
        .broadcasts()
        .iter()
        .map(|tx| decode_tx(tx).1)
        .collect();
    assert_eq!(sequences, vec![41, 45]);
    assert_eq!(worker.account().unwrap().sequence, 46);
}

#[tokio::test]
async fn test_relayed_messages_are_counted() {
    let (_chain_a, _chain_b, registry) = create_receiving_pair();
    publish_latest(&registry).await;
    let store = RelayStore::open_in_memory().await.unwrap();
    ingest_sends(&store, &[1, 2]).await;

    let metrics = RelayerMetrics::new().unwrap();
    let mut worker =
        create_wallet_with_metrics(registry, store, "chain-b", Some(metrics.clone()));
    worker.step().await.unwrap();

    assert_eq!(
        metrics
            .packets_relayed
            .with_label_values(&["chain-b", "MsgRecvPacket"])
            .get(),
        2
    );
    let text = metrics.encode_text().unwrap();
    assert!(text.contains("relayer_packets_relayed_total"));
    assert!(text.contains("MsgUpdateClient"));
    assert!(text.contains("relayer_tx_duration_seconds"));
}

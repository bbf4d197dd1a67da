// WalletWorker: select, lease, filter, build, sign, broadcast, reconcile
//
// One worker per configured wallet. A worker only submits transactions to its
// own chain: receives for packets sent to it, acknowledgements and timeouts
// for packets it sent, and the handshake steps its channel ends must take.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::factory::{now_secs, ClientUpdate, MessageFactory};
use crate::chains::tx::{build_signed_tx, GasPrice, TxParams};
use crate::chains::{revision_number, AccountInfo, ChainClient, ChainRegistry, RouteTable, TxResponse};
use crate::config::{ChainConfig, GlobalConfig, WalletConfig};
use crate::error::{RelayerError, Result};
use crate::keystore::CosmosKey;
use crate::metrics::RelayerMetrics;
use crate::scheduler::{Step, Task};
use crate::store::packets::TimeoutCutoff;
use crate::store::{HandshakeRecord, HandshakeState, PacketKind, PacketRecord, PendingItem, RelayStore};

const SEQUENCE_MISMATCH: &str = "account sequence mismatch";

/// Expected sequence from a raw log such as
/// "account sequence mismatch, expected 42, got 41: incorrect account sequence"
pub fn parse_expected_sequence(raw_log: &str) -> Option<u64> {
    if !raw_log.contains(SEQUENCE_MISMATCH) {
        return None;
    }
    let (_, rest) = raw_log.split_once("expected ")?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// Latest observed height and time of `chain_id`, as a timeout deadline reference
pub fn timeout_cutoff(registry: &ChainRegistry, chain_id: &str) -> Result<TimeoutCutoff> {
    let latest = registry.latest(chain_id)?;
    Ok(TimeoutCutoff {
        revision_number: revision_number(chain_id),
        height: latest.height,
        timestamp_nanos: latest.timestamp_nanos,
    })
}

/// (chain, port, channel, kind) whose unreceived query decides a packet record
type FilterKey = (String, String, String, PacketKind);

/// Receives and timeouts ask the packet's destination end; acks ask its source end
fn filter_key(kind: PacketKind, record: &PacketRecord) -> FilterKey {
    match kind {
        PacketKind::Send | PacketKind::Timeout => (
            record.dst_chain_id.clone(),
            record.dst_port_id.clone(),
            record.dst_channel_id.clone(),
            kind,
        ),
        PacketKind::WriteAck => (
            record.src_chain_id.clone(),
            record.src_port_id.clone(),
            record.src_channel_id.clone(),
            kind,
        ),
    }
}

/// Everything a wallet worker is wired with
pub struct WalletContext {
    pub registry: Arc<ChainRegistry>,
    pub routes: Arc<RouteTable>,
    pub store: RelayStore,
    pub metrics: Option<RelayerMetrics>,
}

/// Messages of one transaction and the client updates they rely on
struct Batch {
    messages: Vec<prost_types::Any>,
    updates: Vec<ClientUpdate>,
}

pub struct WalletWorker {
    chain_id: String,
    key: CosmosKey,
    gas_price: GasPrice,
    gas_limit: u64,
    max_handle_packet: usize,
    loop_interval: Duration,
    memo: String,
    tx_poll_retries: u32,
    tx_poll_interval: Duration,
    account: Option<AccountInfo>,
    factory: MessageFactory,
    ctx: WalletContext,
}

impl WalletWorker {
    pub fn new(
        chain: &ChainConfig,
        wallet: &WalletConfig,
        global: &GlobalConfig,
        key: CosmosKey,
        ctx: WalletContext,
    ) -> Result<Self> {
        Ok(Self {
            chain_id: chain.chain_id.clone(),
            key,
            gas_price: GasPrice::parse(&chain.gas_price)?,
            gas_limit: chain.gas_limit,
            max_handle_packet: wallet.max_handle_packet,
            loop_interval: Duration::from_millis(wallet.loop_interval_ms),
            memo: wallet.memo.clone(),
            tx_poll_retries: global.tx_poll_retries,
            tx_poll_interval: Duration::from_millis(global.tx_poll_interval_ms),
            account: None,
            factory: MessageFactory::new(ctx.registry.clone(), ctx.store.clone()),
            ctx,
        })
    }

    pub fn address(&self) -> &str {
        &self.key.address
    }

    /// Cached account state, `None` until the first broadcast
    pub fn account(&self) -> Option<AccountInfo> {
        self.account
    }

    fn chain(&self) -> Result<Arc<dyn ChainClient>> {
        self.ctx.registry.client(&self.chain_id)
    }

    fn counterparty_chains(&self) -> Vec<String> {
        let chains: HashSet<String> = self
            .ctx
            .routes
            .connections_on(&self.chain_id)
            .iter()
            .filter_map(|conn| self.ctx.routes.get(&self.chain_id, conn))
            .map(|route| route.counterparty_chain_id.clone())
            .collect();
        let mut chains: Vec<String> = chains.into_iter().collect();
        chains.sort();
        chains
    }

    /// SELECT: receives first, then acknowledgements, timeouts and handshakes,
    /// each capped by the remaining budget
    pub async fn select(&self) -> Result<Vec<PendingItem>> {
        let mut budget = self.max_handle_packet;
        let mut items = Vec::new();
        let store = &self.ctx.store;

        let own_cutoff = timeout_cutoff(&self.ctx.registry, &self.chain_id)?;
        for record in store.pending_sends(&self.chain_id, own_cutoff, budget).await? {
            items.push(PendingItem::Packet(PacketKind::Send, record));
        }
        budget = self.max_handle_packet.saturating_sub(items.len());

        if budget > 0 {
            for record in store.pending_write_acks(&self.chain_id, budget).await? {
                items.push(PendingItem::Packet(PacketKind::WriteAck, record));
            }
            budget = self.max_handle_packet.saturating_sub(items.len());
        }

        for counterparty in self.counterparty_chains() {
            if budget == 0 {
                break;
            }
            let cutoff = timeout_cutoff(&self.ctx.registry, &counterparty)?;
            for record in store
                .pending_timeouts(&self.chain_id, &counterparty, cutoff, budget)
                .await?
            {
                items.push(PendingItem::Packet(PacketKind::Timeout, record));
            }
            budget = self.max_handle_packet.saturating_sub(items.len());
        }

        if budget > 0 {
            for record in store.pending_handshakes(&self.chain_id, budget).await? {
                items.push(PendingItem::Handshake(record));
            }
        }
        Ok(items)
    }

    /// FILTER: split leased items into (still relayable, already handled)
    pub async fn filter(
        &self,
        items: &[PendingItem],
    ) -> Result<(Vec<PendingItem>, Vec<PendingItem>)> {
        let own = self.chain()?;

        let mut groups: BTreeMap<FilterKey, Vec<u64>> = BTreeMap::new();
        for item in items {
            if let PendingItem::Packet(kind, record) = item {
                groups
                    .entry(filter_key(*kind, record))
                    .or_default()
                    .push(record.sequence());
            }
        }

        let mut unreceived: HashMap<FilterKey, HashSet<u64>> = HashMap::new();
        for ((chain_id, port, channel, kind), sequences) in &groups {
            let client = self.ctx.registry.client(chain_id)?;
            let pending = match kind {
                PacketKind::WriteAck => {
                    client.unreceived_acks(port, channel, sequences).await?
                }
                _ => client.unreceived_packets(port, channel, sequences).await?,
            };
            unreceived.insert(
                (chain_id.clone(), port.clone(), channel.clone(), *kind),
                pending.into_iter().collect(),
            );
        }

        // a timeout also needs the commitment to still exist on this chain
        let mut committed: HashMap<(String, String), HashSet<u64>> = HashMap::new();
        for item in items {
            if let PendingItem::Packet(PacketKind::Timeout, record) = item {
                committed
                    .entry((record.src_port_id.clone(), record.src_channel_id.clone()))
                    .or_default()
                    .insert(record.sequence());
            }
        }
        for ((port, channel), sequences) in committed.iter_mut() {
            let sequences_vec: Vec<u64> = sequences.iter().copied().collect();
            *sequences = own
                .unreceived_acks(port, channel, &sequences_vec)
                .await?
                .into_iter()
                .collect();
        }

        let mut live = Vec::new();
        let mut stale = Vec::new();
        for item in items {
            let relayable = match item {
                PendingItem::Packet(kind, record) => {
                    let pending = unreceived
                        .get(&filter_key(*kind, record))
                        .map_or(false, |set| set.contains(&record.sequence()));
                    match kind {
                        PacketKind::Timeout => {
                            pending
                                && committed
                                    .get(&(record.src_port_id.clone(), record.src_channel_id.clone()))
                                    .map_or(false, |set| set.contains(&record.sequence()))
                        }
                        _ => pending,
                    }
                }
                PendingItem::Handshake(record) => self.handshake_pending(own.as_ref(), record).await?,
            };
            if relayable {
                live.push(item.clone());
            } else {
                stale.push(item.clone());
            }
        }
        Ok((live, stale))
    }

    /// Whether a handshake step has not been taken yet
    async fn handshake_pending(
        &self,
        own: &dyn ChainClient,
        record: &HandshakeRecord,
    ) -> Result<bool> {
        Ok(match record.state()? {
            HandshakeState::TryOpen => {
                let counterparty = self.ctx.registry.client(&record.counterparty_chain_id)?;
                let init = counterparty
                    .channel(&record.counterparty_port_id, &record.counterparty_channel_id)
                    .await?;
                init.state == "STATE_INIT"
            }
            HandshakeState::Ack | HandshakeState::Confirm => {
                let channel = own.channel(&record.port_id, &record.channel_id).await?;
                channel.state != "STATE_OPEN"
            }
            HandshakeState::CloseConfirm => {
                let channel = own.channel(&record.port_id, &record.channel_id).await?;
                !channel.is_closed()
            }
        })
    }

    fn connection_on_own_chain(item: &PendingItem) -> &str {
        match item {
            PendingItem::Packet(PacketKind::Send, record) => &record.dst_connection_id,
            PendingItem::Packet(_, record) => &record.src_connection_id,
            PendingItem::Handshake(record) => &record.connection_id,
        }
    }

    /// BUILD: one update-client per distinct client, then the messages proven at its height
    async fn build_batch(&self, items: &[PendingItem]) -> Result<Batch> {
        let signer = self.key.address.clone();

        let mut by_client: BTreeMap<String, Vec<&PendingItem>> = BTreeMap::new();
        let mut clients = HashMap::new();
        for item in items {
            let client = self
                .factory
                .resolve_client(&self.chain_id, Self::connection_on_own_chain(item))
                .await?;
            by_client
                .entry(client.client_id.clone())
                .or_default()
                .push(item);
            clients.insert(client.client_id.clone(), client);
        }

        let mut batch = Batch {
            messages: Vec::new(),
            updates: Vec::new(),
        };
        for (client_id, grouped) in by_client {
            let Some(client) = clients.get(&client_id) else {
                continue;
            };
            let update = self.factory.update_client(client, &signer).await?;
            if let Some(message) = &update.message {
                batch.messages.push(message.clone());
            }
            for item in grouped {
                let message = match item {
                    PendingItem::Packet(PacketKind::Send, record) => {
                        self.factory
                            .recv_packet(record, update.proof_height, &signer)
                            .await?
                    }
                    PendingItem::Packet(PacketKind::WriteAck, record) => {
                        self.factory
                            .acknowledgement(record, update.proof_height, &signer)
                            .await?
                    }
                    PendingItem::Packet(PacketKind::Timeout, record) => {
                        self.factory
                            .timeout(record, update.proof_height, &signer)
                            .await?
                    }
                    PendingItem::Handshake(record) => {
                        self.factory
                            .handshake(record, update.proof_height, &signer)
                            .await?
                    }
                };
                batch.messages.push(message);
            }
            batch.updates.push(update);
        }
        Ok(batch)
    }

    async fn account_info(&mut self, client: &dyn ChainClient) -> Result<AccountInfo> {
        if let Some(account) = self.account {
            return Ok(account);
        }
        let account = client.account(&self.key.address).await?;
        debug!(
            "{}: wallet {} account {} sequence {}",
            self.chain_id, self.key.address, account.account_number, account.sequence
        );
        self.account = Some(account);
        Ok(account)
    }

    /// Poll the tx until it is indexed. `None` when the outcome is still unknown.
    async fn wait_for_inclusion(
        &self,
        client: &dyn ChainClient,
        tx_hash: &str,
    ) -> Result<Option<TxResponse>> {
        for _ in 0..self.tx_poll_retries {
            sleep(self.tx_poll_interval).await;
            match client.tx_by_hash(tx_hash).await {
                Ok(Some(response)) => return Ok(Some(response)),
                Ok(None) => continue,
                Err(e) => debug!("{}: tx {} lookup failed: {}", self.chain_id, tx_hash, e),
            }
        }
        Ok(None)
    }

    /// SIGN-BROADCAST and the bookkeeping that depends on the outcome
    async fn submit(&mut self, batch: Batch) -> Result<()> {
        let client = self.chain()?;
        let account = self.account_info(client.as_ref()).await?;
        let params = TxParams {
            chain_id: &self.chain_id,
            account,
            gas_limit: self.gas_limit,
            gas_price: &self.gas_price,
            memo: &self.memo,
        };
        let kinds: Vec<String> = batch
            .messages
            .iter()
            .map(|m| m.type_url.rsplit('.').next().unwrap_or_default().to_string())
            .collect();
        let tx_bytes = build_signed_tx(&self.key, &params, batch.messages)?;

        let started = Instant::now();
        let broadcast = client.broadcast_tx(tx_bytes).await;
        let response = match broadcast {
            Ok(response) if response.is_ok() => {
                match self.wait_for_inclusion(client.as_ref(), &response.tx_hash).await? {
                    Some(included) => included,
                    None => {
                        // the tx may still land; re-read the sequence next time
                        warn!(
                            "{}: tx {} not found after {} lookups",
                            self.chain_id, response.tx_hash, self.tx_poll_retries
                        );
                        self.account = None;
                        return Ok(());
                    }
                }
            }
            Ok(response) => response,
            Err(e) => {
                self.account = None;
                self.on_failure(&batch.updates).await;
                return Err(e);
            }
        };

        if response.is_ok() {
            self.account = Some(AccountInfo {
                sequence: account.sequence + 1,
                ..account
            });
            for update in batch.updates.iter().filter(|u| u.message.is_some()) {
                self.ctx
                    .store
                    .update_client_height(
                        &update.client.chain_id,
                        &update.client.client_id,
                        update.proof_height,
                        now_secs(),
                    )
                    .await?;
            }
            if let Some(metrics) = &self.ctx.metrics {
                metrics.tx_duration.observe(started.elapsed().as_secs_f64());
                for kind in &kinds {
                    metrics
                        .packets_relayed
                        .with_label_values(&[self.chain_id.as_str(), kind.as_str()])
                        .inc();
                }
            }
            info!(
                "{}: tx {} included at {} with {} messages",
                self.chain_id,
                response.tx_hash,
                response.height,
                kinds.len()
            );
            return Ok(());
        }

        self.handle_tx_failure(&response);
        self.on_failure(&batch.updates).await;
        Err(RelayerError::TxFailed {
            tx_hash: response.tx_hash,
            code: response.code,
            raw_log: response.raw_log,
        })
    }

    /// Adjust the cached sequence after a failed tx.
    ///
    /// A sequence mismatch carries the expected value in its raw log. A tx that
    /// failed after inclusion still consumed its sequence.
    pub fn handle_tx_failure(&mut self, response: &TxResponse) {
        let Some(account) = self.account.as_mut() else {
            return;
        };
        if let Some(expected) = parse_expected_sequence(&response.raw_log) {
            info!(
                "{}: account sequence resynced {} -> {}",
                self.chain_id, account.sequence, expected
            );
            account.sequence = expected;
        } else if response.height > 0 {
            account.sequence += 1;
        }
    }

    /// Seed the cached account state, skipping the first account query
    pub fn set_account(&mut self, account: AccountInfo) {
        self.account = Some(account);
    }

    /// Evict the clients of a failed batch so their trusted height is re-read
    async fn on_failure(&self, updates: &[ClientUpdate]) {
        if let Some(metrics) = &self.ctx.metrics {
            metrics
                .tx_failures
                .with_label_values(&[self.chain_id.as_str()])
                .inc();
        }
        for update in updates {
            if let Err(e) = self
                .ctx
                .store
                .evict_client(&update.client.chain_id, &update.client.client_id)
                .await
            {
                warn!("{}: failed to evict client {}: {}", self.chain_id, update.client.client_id, e);
            }
        }
    }

    /// Standalone update-client for cached clients close to expiry
    async fn refresh_clients(&mut self) -> Result<()> {
        let now = now_secs();
        let stale: Vec<_> = self
            .ctx
            .store
            .clients_on(&self.chain_id)
            .await?
            .into_iter()
            .filter(|client| client.needs_refresh(now))
            .collect();

        for client in stale {
            let update = self.factory.update_client(&client, &self.key.address).await?;
            let Some(message) = update.message.clone() else {
                continue;
            };
            info!(
                "{}: refreshing client {} (last update {}s ago)",
                self.chain_id,
                client.client_id,
                now - client.last_update_time
            );
            self.submit(Batch {
                messages: vec![message],
                updates: vec![update],
            })
            .await?;
        }
        Ok(())
    }

    /// LEASE, FILTER, BUILD, SIGN-BROADCAST for selected items; leases are
    /// released by the caller whatever the outcome
    async fn relay(&mut self, leased: &[PendingItem]) -> Result<()> {
        let (live, stale) = self.filter(leased).await?;
        if !stale.is_empty() {
            debug!(
                "{}: dropping {} already handled records",
                self.chain_id,
                stale.len()
            );
            self.ctx.store.delete_items(&stale).await?;
        }
        if live.is_empty() {
            return Ok(());
        }
        let batch = self.build_batch(&live).await?;
        self.submit(batch).await
    }
}

#[async_trait]
impl Task for WalletWorker {
    fn name(&self) -> String {
        format!("wallet:{}:{}", self.chain_id, self.key.address)
    }

    async fn step(&mut self) -> Result<Step> {
        let selected = self.select().await?;
        if selected.is_empty() {
            self.refresh_clients().await?;
            return Ok(Step::Continue(self.loop_interval));
        }

        let leased = self.ctx.store.lease(selected).await?;
        if leased.is_empty() {
            return Ok(Step::Continue(self.loop_interval));
        }

        let outcome = self.relay(&leased).await;
        // RECONCILE
        self.ctx.store.release(&leased).await?;
        outcome?;
        Ok(Step::Continue(self.loop_interval))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_expected_sequence() {
        assert_eq!(
            parse_expected_sequence("account sequence mismatch, expected 42, got 41"),
            Some(42)
        );
        assert_eq!(
            parse_expected_sequence(
                "account sequence mismatch, expected 7, got 9: incorrect account sequence"
            ),
            Some(7)
        );
        assert_eq!(parse_expected_sequence("out of gas"), None);
        assert_eq!(parse_expected_sequence("expected 5"), None);
    }
}

// MessageFactory: proof-backed IBC messages for one destination chain
//
// Every batch first advances the destination's light client to the source's
// latest height H; every proof in the batch is then verified against H.

use ibc_proto::google::protobuf::Any as IbcAny;
use ibc_proto::ibc::core::channel::v1::{
    State as ChannelState, Channel, Counterparty, MsgAcknowledgement,
    MsgChannelCloseConfirm, MsgChannelOpenAck, MsgChannelOpenConfirm, MsgChannelOpenTry,
    MsgRecvPacket, MsgTimeout, MsgTimeoutOnClose, Order, Packet,
};
use ibc_proto::ibc::core::client::v1::{Height as RawHeight, MsgUpdateClient};
use prost::Message;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::sleep;
use tracing::{debug, info};

use crate::chains::tx::to_any;
use crate::chains::{revision_number, ChainClient, ChainRegistry, ChannelInfo};
use crate::error::{RelayerError, Result};
use crate::proof::{decode_sequence, get_proof, paths, Proof};
use crate::store::{
    ClientRecord, ConnectionRecord, HandshakeRecord, HandshakeState, PacketRecord, RelayStore,
};

pub const UPDATE_CLIENT_TYPE_URL: &str = "/ibc.core.client.v1.MsgUpdateClient";
pub const RECV_PACKET_TYPE_URL: &str = "/ibc.core.channel.v1.MsgRecvPacket";
pub const ACKNOWLEDGEMENT_TYPE_URL: &str = "/ibc.core.channel.v1.MsgAcknowledgement";
pub const TIMEOUT_TYPE_URL: &str = "/ibc.core.channel.v1.MsgTimeout";
pub const TIMEOUT_ON_CLOSE_TYPE_URL: &str = "/ibc.core.channel.v1.MsgTimeoutOnClose";
pub const CHANNEL_OPEN_TRY_TYPE_URL: &str = "/ibc.core.channel.v1.MsgChannelOpenTry";
pub const CHANNEL_OPEN_ACK_TYPE_URL: &str = "/ibc.core.channel.v1.MsgChannelOpenAck";
pub const CHANNEL_OPEN_CONFIRM_TYPE_URL: &str = "/ibc.core.channel.v1.MsgChannelOpenConfirm";
pub const CHANNEL_CLOSE_CONFIRM_TYPE_URL: &str = "/ibc.core.channel.v1.MsgChannelCloseConfirm";
const TENDERMINT_HEADER_TYPE_URL: &str = "/ibc.lightclients.tendermint.v1.Header";

const NEXT_SEQUENCE_ATTEMPTS: u32 = 5;
const NEXT_SEQUENCE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Wire layout of `ibc.lightclients.tendermint.v1.Header`
#[derive(Clone, PartialEq, prost::Message)]
struct TendermintHeader {
    #[prost(message, optional, tag = "1")]
    signed_header: Option<tendermint_proto::types::SignedHeader>,
    #[prost(message, optional, tag = "2")]
    validator_set: Option<tendermint_proto::types::ValidatorSet>,
    #[prost(message, optional, tag = "3")]
    trusted_height: Option<RawHeight>,
    #[prost(message, optional, tag = "4")]
    trusted_validators: Option<tendermint_proto::types::ValidatorSet>,
}

/// A destination client brought up to date for one batch
#[derive(Debug, Clone)]
pub struct ClientUpdate {
    pub client: ClientRecord,
    /// `None` when the client already trusts the proof height
    pub message: Option<prost_types::Any>,
    /// Source header height every proof of the batch is checked against
    pub proof_height: u64,
}

pub(crate) fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn raw_height(chain_id: &str, height: u64) -> RawHeight {
    RawHeight {
        revision_number: revision_number(chain_id),
        revision_height: height,
    }
}

fn order_from_name(ordering: &str) -> Order {
    match ordering {
        "ORDER_ORDERED" => Order::Ordered,
        "ORDER_UNORDERED" => Order::Unordered,
        _ => Order::NoneUnspecified,
    }
}

fn raw_packet(record: &PacketRecord) -> Packet {
    Packet {
        sequence: record.sequence(),
        source_port: record.src_port_id.clone(),
        source_channel: record.src_channel_id.clone(),
        destination_port: record.dst_port_id.clone(),
        destination_channel: record.dst_channel_id.clone(),
        data: record.data.clone(),
        timeout_height: Some(RawHeight {
            revision_number: record.timeout_revision_number as u64,
            revision_height: record.timeout_revision_height as u64,
        }),
        timeout_timestamp: record.timeout_timestamp as u64,
    }
}

/// Builds relay messages from chain queries and the store's client cache
#[derive(Clone)]
pub struct MessageFactory {
    registry: Arc<ChainRegistry>,
    store: RelayStore,
}

impl MessageFactory {
    pub fn new(registry: Arc<ChainRegistry>, store: RelayStore) -> Self {
        Self { registry, store }
    }

    fn chain(&self, chain_id: &str) -> Result<Arc<dyn ChainClient>> {
        self.registry.client(chain_id)
    }

    /// Client behind `connection_id` on `chain_id`, read through the cache
    pub async fn resolve_client(&self, chain_id: &str, connection_id: &str) -> Result<ClientRecord> {
        let host = self.chain(chain_id)?;

        let connection = match self.store.get_connection(chain_id, connection_id).await? {
            Some(connection) => connection,
            None => {
                let info = host.connection(connection_id).await?;
                let client_state = host.client_state(&info.client_id).await?;
                let record = ConnectionRecord {
                    chain_id: chain_id.to_string(),
                    connection_id: connection_id.to_string(),
                    client_id: info.client_id,
                    counterparty_chain_id: client_state.chain_id,
                    counterparty_client_id: info.counterparty_client_id,
                    counterparty_connection_id: info.counterparty_connection_id,
                };
                self.store.upsert_connection(&record).await?;
                record
            }
        };

        if let Some(client) = self.store.get_client(chain_id, &connection.client_id).await? {
            return Ok(client);
        }

        let state = host.client_state(&connection.client_id).await?;
        let timestamp_nanos = host
            .consensus_timestamp(
                &connection.client_id,
                state.latest_revision_number,
                state.latest_revision_height,
            )
            .await?;
        let record = ClientRecord {
            chain_id: chain_id.to_string(),
            client_id: connection.client_id.clone(),
            counterparty_chain_id: state.chain_id,
            trusting_period_secs: state.trusting_period.as_secs() as i64,
            revision_number: state.latest_revision_number as i64,
            revision_height: state.latest_revision_height as i64,
            last_update_time: (timestamp_nanos / 1_000_000_000) as i64,
        };
        self.store.upsert_client(&record).await?;
        debug!(
            "{}: cached client {} tracking {} at {}",
            chain_id, record.client_id, record.counterparty_chain_id, record.revision_height
        );
        Ok(record)
    }

    /// MsgUpdateClient moving `client` to the source chain's latest height.
    ///
    /// When the client already trusts that height no message is needed and
    /// proofs are taken at the trusted height instead.
    pub async fn update_client(&self, client: &ClientRecord, signer: &str) -> Result<ClientUpdate> {
        let src_chain_id = &client.counterparty_chain_id;
        let source = self.chain(src_chain_id)?;
        let latest = self.registry.latest(src_chain_id)?.height;
        let trusted = client.revision_height as u64;

        if latest <= trusted {
            return Ok(ClientUpdate {
                client: client.clone(),
                message: None,
                proof_height: trusted,
            });
        }

        let signed_header = source.signed_header(latest).await?;
        let validator_set = source.validator_set(latest).await?;
        let trusted_validators = source.validator_set(trusted + 1).await?;

        let header = TendermintHeader {
            signed_header: Some(signed_header),
            validator_set: Some(validator_set),
            trusted_height: Some(RawHeight {
                revision_number: client.revision_number as u64,
                revision_height: trusted,
            }),
            trusted_validators: Some(trusted_validators),
        };
        let msg = MsgUpdateClient {
            client_id: client.client_id.clone(),
            client_message: Some(IbcAny {
                type_url: TENDERMINT_HEADER_TYPE_URL.to_string(),
                value: header.encode_to_vec(),
            }),
            signer: signer.to_string(),
        };

        info!(
            "{}: updating client {} from {} to {}-{}",
            client.chain_id,
            client.client_id,
            trusted,
            revision_number(src_chain_id),
            latest
        );
        Ok(ClientUpdate {
            client: client.clone(),
            message: Some(to_any(UPDATE_CLIENT_TYPE_URL, &msg)),
            proof_height: latest,
        })
    }

    /// MsgRecvPacket for a send record, proven on the packet's source chain
    pub async fn recv_packet(
        &self,
        record: &PacketRecord,
        proof_height: u64,
        signer: &str,
    ) -> Result<prost_types::Any> {
        let source = self.chain(&record.src_chain_id)?;
        let key = paths::packet_commitment(
            &record.src_port_id,
            &record.src_channel_id,
            record.sequence(),
        );
        let proof = get_proof(source.as_ref(), &key, proof_height).await?;

        let msg = MsgRecvPacket {
            packet: Some(raw_packet(record)),
            proof_commitment: proof.proof,
            proof_height: Some(raw_height(&record.src_chain_id, proof_height)),
            signer: signer.to_string(),
        };
        Ok(to_any(RECV_PACKET_TYPE_URL, &msg))
    }

    /// MsgAcknowledgement for a write-ack record, proven on the packet's destination chain
    pub async fn acknowledgement(
        &self,
        record: &PacketRecord,
        proof_height: u64,
        signer: &str,
    ) -> Result<prost_types::Any> {
        let destination = self.chain(&record.dst_chain_id)?;
        let key = paths::packet_acknowledgement(
            &record.dst_port_id,
            &record.dst_channel_id,
            record.sequence(),
        );
        let proof = get_proof(destination.as_ref(), &key, proof_height).await?;

        let msg = MsgAcknowledgement {
            packet: Some(raw_packet(record)),
            acknowledgement: record.ack.clone().unwrap_or_default(),
            proof_acked: proof.proof,
            proof_height: Some(raw_height(&record.dst_chain_id, proof_height)),
            signer: signer.to_string(),
        };
        Ok(to_any(ACKNOWLEDGEMENT_TYPE_URL, &msg))
    }

    /// `nextSequenceRecv` with its proof. A value that is not indexed yet reads
    /// as empty, so an empty value is retried a few times.
    async fn next_sequence_recv(
        &self,
        destination: &dyn ChainClient,
        port_id: &str,
        channel_id: &str,
        proof_height: u64,
    ) -> Result<(Proof, u64)> {
        let key = paths::next_sequence_recv(port_id, channel_id);
        for attempt in 1..=NEXT_SEQUENCE_ATTEMPTS {
            let proof = get_proof(destination, &key, proof_height).await?;
            if let Some(sequence) = decode_sequence(&proof.value) {
                return Ok((proof, sequence));
            }
            debug!(
                "{}: nextSequenceRecv for {}/{} empty (attempt {})",
                destination.chain_id(),
                port_id,
                channel_id,
                attempt
            );
            if attempt < NEXT_SEQUENCE_ATTEMPTS {
                sleep(NEXT_SEQUENCE_RETRY_DELAY).await;
            }
        }
        Err(RelayerError::MalformedProof {
            key: String::from_utf8_lossy(&key).to_string(),
            reason: format!("no value after {} attempts", NEXT_SEQUENCE_ATTEMPTS),
        })
    }

    /// MsgTimeout for a timeout record, or MsgTimeoutOnClose when the destination channel is closed.
    ///
    /// Ordered channels prove `nextSequenceRecv`; unordered channels prove the
    /// absence of the packet receipt.
    pub async fn timeout(
        &self,
        record: &PacketRecord,
        proof_height: u64,
        signer: &str,
    ) -> Result<prost_types::Any> {
        let destination = self.chain(&record.dst_chain_id)?;
        let (next_seq_proof, next_sequence_recv) = self
            .next_sequence_recv(
                destination.as_ref(),
                &record.dst_port_id,
                &record.dst_channel_id,
                proof_height,
            )
            .await?;

        let proof_unreceived = if record.is_ordered() {
            next_seq_proof.proof
        } else {
            let key = paths::packet_receipt(
                &record.dst_port_id,
                &record.dst_channel_id,
                record.sequence(),
            );
            get_proof(destination.as_ref(), &key, proof_height).await?.proof
        };
        let height = Some(raw_height(&record.dst_chain_id, proof_height));

        let channel = destination
            .channel(&record.dst_port_id, &record.dst_channel_id)
            .await?;
        if channel.is_closed() {
            let key = paths::channel_end(&record.dst_port_id, &record.dst_channel_id);
            let proof_close = get_proof(destination.as_ref(), &key, proof_height).await?;
            let msg = MsgTimeoutOnClose {
                packet: Some(raw_packet(record)),
                proof_unreceived,
                proof_close: proof_close.proof,
                proof_height: height,
                next_sequence_recv,
                signer: signer.to_string(),
                ..Default::default()
            };
            return Ok(to_any(TIMEOUT_ON_CLOSE_TYPE_URL, &msg));
        }

        let msg = MsgTimeout {
            packet: Some(raw_packet(record)),
            proof_unreceived,
            proof_height: height,
            next_sequence_recv,
            signer: signer.to_string(),
        };
        Ok(to_any(TIMEOUT_TYPE_URL, &msg))
    }

    /// Counterparty channel end with its proof
    async fn counterparty_channel(
        &self,
        record: &HandshakeRecord,
        proof_height: u64,
    ) -> Result<(ChannelInfo, Proof, RawHeight)> {
        let counterparty = self.chain(&record.counterparty_chain_id)?;
        let channel = counterparty
            .channel(&record.counterparty_port_id, &record.counterparty_channel_id)
            .await?;
        let key = paths::channel_end(&record.counterparty_port_id, &record.counterparty_channel_id);
        let proof = get_proof(counterparty.as_ref(), &key, proof_height).await?;
        Ok((
            channel,
            proof,
            raw_height(&record.counterparty_chain_id, proof_height),
        ))
    }

    pub async fn channel_open_try(
        &self,
        record: &HandshakeRecord,
        proof_height: u64,
        signer: &str,
    ) -> Result<prost_types::Any> {
        let (init, proof, height) = self.counterparty_channel(record, proof_height).await?;
        let channel = Channel {
            state: ChannelState::Tryopen as i32,
            ordering: order_from_name(&init.ordering) as i32,
            counterparty: Some(Counterparty {
                port_id: record.counterparty_port_id.clone(),
                channel_id: record.counterparty_channel_id.clone(),
            }),
            connection_hops: vec![record.connection_id.clone()],
            version: record.version.clone(),
            ..Default::default()
        };
        let msg = MsgChannelOpenTry {
            port_id: record.port_id.clone(),
            channel: Some(channel),
            counterparty_version: init.version,
            proof_init: proof.proof,
            proof_height: Some(height),
            signer: signer.to_string(),
            ..Default::default()
        };
        Ok(to_any(CHANNEL_OPEN_TRY_TYPE_URL, &msg))
    }

    pub async fn channel_open_ack(
        &self,
        record: &HandshakeRecord,
        proof_height: u64,
        signer: &str,
    ) -> Result<prost_types::Any> {
        let (try_channel, proof, height) = self.counterparty_channel(record, proof_height).await?;
        let msg = MsgChannelOpenAck {
            port_id: record.port_id.clone(),
            channel_id: record.channel_id.clone(),
            counterparty_channel_id: record.counterparty_channel_id.clone(),
            counterparty_version: try_channel.version,
            proof_try: proof.proof,
            proof_height: Some(height),
            signer: signer.to_string(),
        };
        Ok(to_any(CHANNEL_OPEN_ACK_TYPE_URL, &msg))
    }

    pub async fn channel_open_confirm(
        &self,
        record: &HandshakeRecord,
        proof_height: u64,
        signer: &str,
    ) -> Result<prost_types::Any> {
        let (_, proof, height) = self.counterparty_channel(record, proof_height).await?;
        let msg = MsgChannelOpenConfirm {
            port_id: record.port_id.clone(),
            channel_id: record.channel_id.clone(),
            proof_ack: proof.proof,
            proof_height: Some(height),
            signer: signer.to_string(),
        };
        Ok(to_any(CHANNEL_OPEN_CONFIRM_TYPE_URL, &msg))
    }

    pub async fn channel_close_confirm(
        &self,
        record: &HandshakeRecord,
        proof_height: u64,
        signer: &str,
    ) -> Result<prost_types::Any> {
        let (_, proof, height) = self.counterparty_channel(record, proof_height).await?;
        let msg = MsgChannelCloseConfirm {
            port_id: record.port_id.clone(),
            channel_id: record.channel_id.clone(),
            proof_init: proof.proof,
            proof_height: Some(height),
            signer: signer.to_string(),
            ..Default::default()
        };
        Ok(to_any(CHANNEL_CLOSE_CONFIRM_TYPE_URL, &msg))
    }

    /// Handshake step named by the record's state
    pub async fn handshake(
        &self,
        record: &HandshakeRecord,
        proof_height: u64,
        signer: &str,
    ) -> Result<prost_types::Any> {
        match record.state()? {
            HandshakeState::TryOpen => self.channel_open_try(record, proof_height, signer).await,
            HandshakeState::Ack => self.channel_open_ack(record, proof_height, signer).await,
            HandshakeState::Confirm => {
                self.channel_open_confirm(record, proof_height, signer).await
            }
            HandshakeState::CloseConfirm => {
                self.channel_close_confirm(record, proof_height, signer).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_names() {
        assert_eq!(order_from_name("ORDER_ORDERED"), Order::Ordered);
        assert_eq!(order_from_name("ORDER_UNORDERED"), Order::Unordered);
        assert_eq!(order_from_name(""), Order::NoneUnspecified);
    }

    #[test]
    fn test_proof_height_carries_revision() {
        let height = raw_height("osmosis-1", 1200);
        assert_eq!(height.revision_number, 1);
        assert_eq!(height.revision_height, 1200);
        assert_eq!(raw_height("localnet", 5).revision_number, 0);
    }

    #[test]
    fn test_header_wire_layout() {
        let header = TendermintHeader {
            signed_header: None,
            validator_set: None,
            trusted_height: Some(RawHeight {
                revision_number: 0,
                revision_height: 42,
            }),
            trusted_validators: None,
        };
        // field 3, length-delimited, containing revision_height (field 2) = 42
        assert_eq!(header.encode_to_vec(), vec![0x1a, 0x02, 0x10, 42]);
    }
}

// Block event decoding
//
// Chain binaries disagree on attribute encoding: newer ones emit plain UTF-8
// keys and values, older ones base64-encode both. Decoding never fails; an
// event that cannot be understood is simply not an IBC event for us.

use base64::{engine::general_purpose, Engine as _};
use std::collections::{HashMap, HashSet};

use super::{
    ChannelAttributes, ChannelEvent, ChannelUpgradeEvent, Coin, Height, IbcEvent,
    IncentivizedPacket, PacketEvent, PacketInfo, UpgradeAttributes,
};
use crate::chains::RawEvent;

/// Connections relayed on one chain; events on other connections are dropped
#[derive(Debug, Clone, Default)]
pub struct ConnectionFilter {
    connections: HashSet<String>,
}

impl ConnectionFilter {
    pub fn new<I, S>(connections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            connections: connections.into_iter().map(Into::into).collect(),
        }
    }

    pub fn allows(&self, connection_id: &str) -> bool {
        self.connections.contains(connection_id)
    }
}

fn is_plain_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
}

fn decode_b64_string(value: &str) -> Option<String> {
    let bytes = general_purpose::STANDARD.decode(value).ok()?;
    String::from_utf8(bytes).ok()
}

/// Flatten attributes into a map, undoing base64 where the key needs it
fn attribute_map(raw: &RawEvent) -> HashMap<String, String> {
    let mut attributes = HashMap::new();
    for attr in &raw.attributes {
        if is_plain_key(&attr.key) {
            attributes.insert(attr.key.clone(), attr.value.clone());
            continue;
        }
        let Some(key) = decode_b64_string(&attr.key).filter(|k| is_plain_key(k)) else {
            continue;
        };
        let value = if attr.value.is_empty() {
            String::new()
        } else {
            match decode_b64_string(&attr.value) {
                Some(v) => v,
                None => continue,
            }
        };
        attributes.insert(key, value);
    }
    attributes
}

/// "1-100" -> Some(Height); "0-0" or malformed -> None
pub fn parse_timeout_height(value: &str) -> Option<Height> {
    let (number, height) = value.split_once('-')?;
    let height = Height::new(number.parse().ok()?, height.parse().ok()?);
    if height.is_zero() {
        None
    } else {
        Some(height)
    }
}

/// "100tokena,200ibc/ABCD" -> coins; amounts are the leading digits
pub fn parse_fee_coins(value: &str) -> Vec<Coin> {
    value
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .filter_map(|coin| {
            let split = coin.find(|c: char| !c.is_ascii_digit())?;
            if split == 0 {
                return None;
            }
            Some(Coin {
                amount: coin[..split].to_string(),
                denom: coin[split..].to_string(),
            })
        })
        .collect()
}

fn get(attrs: &HashMap<String, String>, key: &str) -> String {
    attrs.get(key).cloned().unwrap_or_default()
}

fn get_u64(attrs: &HashMap<String, String>, key: &str) -> Option<u64> {
    attrs.get(key)?.parse().ok()
}

fn decode_packet(attrs: &HashMap<String, String>) -> Option<PacketInfo> {
    let sequence = get_u64(attrs, "packet_sequence")?;

    let data = match attrs.get("packet_data_hex") {
        Some(hex_data) => hex::decode(hex_data).ok()?,
        None => get(attrs, "packet_data").into_bytes(),
    };

    let connection_id = attrs
        .get("connection_id")
        .or_else(|| attrs.get("packet_connection"))
        .cloned()?;

    Some(PacketInfo {
        sequence,
        src_port: get(attrs, "packet_src_port"),
        src_channel: get(attrs, "packet_src_channel"),
        dst_port: get(attrs, "packet_dst_port"),
        dst_channel: get(attrs, "packet_dst_channel"),
        data,
        timeout_height: attrs
            .get("packet_timeout_height")
            .and_then(|h| parse_timeout_height(h)),
        timeout_timestamp: get_u64(attrs, "packet_timeout_timestamp").unwrap_or(0),
        connection_id,
        ordering: get(attrs, "packet_channel_ordering"),
    })
}

fn decode_ack(attrs: &HashMap<String, String>) -> Option<Vec<u8>> {
    match attrs.get("packet_ack_hex") {
        Some(hex_ack) => hex::decode(hex_ack).ok(),
        None => attrs.get("packet_ack").map(|a| a.clone().into_bytes()),
    }
}

fn decode_channel(attrs: &HashMap<String, String>) -> Option<ChannelAttributes> {
    Some(ChannelAttributes {
        port_id: attrs.get("port_id").cloned()?,
        channel_id: attrs.get("channel_id").cloned()?,
        counterparty_port_id: get(attrs, "counterparty_port_id"),
        counterparty_channel_id: get(attrs, "counterparty_channel_id"),
        connection_id: attrs.get("connection_id").cloned()?,
        version: get(attrs, "version"),
    })
}

fn decode_upgrade(attrs: &HashMap<String, String>) -> Option<UpgradeAttributes> {
    Some(UpgradeAttributes {
        port_id: attrs.get("port_id").cloned()?,
        channel_id: attrs.get("channel_id").cloned()?,
        counterparty_port_id: get(attrs, "counterparty_port_id"),
        counterparty_channel_id: get(attrs, "counterparty_channel_id"),
        connection_id: attrs
            .get("upgrade_connection_hops")
            .filter(|hops| !hops.is_empty())
            .cloned(),
        upgrade_sequence: get_u64(attrs, "upgrade_sequence").unwrap_or(0),
        version: get(attrs, "upgrade_version"),
        ordering: get(attrs, "upgrade_ordering"),
        timeout_height: attrs
            .get("upgrade_timeout_height")
            .and_then(|h| parse_timeout_height(h)),
        timeout_timestamp: get_u64(attrs, "upgrade_timeout_timestamp").unwrap_or(0),
        error_receipt: attrs.get("upgrade_error_receipt").cloned(),
    })
}

fn decode_fee(attrs: &HashMap<String, String>) -> Option<IncentivizedPacket> {
    Some(IncentivizedPacket {
        port_id: attrs.get("port_id").cloned()?,
        channel_id: attrs.get("channel_id").cloned()?,
        sequence: get_u64(attrs, "packet_sequence")?,
        recv_fee: parse_fee_coins(&get(attrs, "recv_fee")),
        ack_fee: parse_fee_coins(&get(attrs, "ack_fee")),
        timeout_fee: parse_fee_coins(&get(attrs, "timeout_fee")),
    })
}

/// Decode one raw block event into at most one typed IBC event
pub fn decode_event(raw: &RawEvent, filter: &ConnectionFilter) -> Option<IbcEvent> {
    let attrs = attribute_map(raw);

    let packet_event = |wrap: fn(PacketInfo) -> PacketEvent| {
        decode_packet(&attrs)
            .filter(|p| filter.allows(&p.connection_id))
            .map(|p| IbcEvent::Packet(wrap(p)))
    };
    let channel_event = |wrap: fn(ChannelAttributes) -> ChannelEvent| {
        decode_channel(&attrs)
            .filter(|c| filter.allows(&c.connection_id))
            .map(|c| IbcEvent::Channel(wrap(c)))
    };
    let upgrade_event = |wrap: fn(UpgradeAttributes) -> ChannelUpgradeEvent| {
        decode_upgrade(&attrs)
            .filter(|u| u.connection_id.as_deref().map_or(true, |c| filter.allows(c)))
            .map(|u| IbcEvent::Upgrade(wrap(u)))
    };

    match raw.kind.as_str() {
        "send_packet" => packet_event(PacketEvent::Send),
        "recv_packet" => packet_event(PacketEvent::Recv),
        "write_acknowledgement" => {
            let ack = decode_ack(&attrs)?;
            decode_packet(&attrs)
                .filter(|p| filter.allows(&p.connection_id))
                .map(|packet| IbcEvent::Packet(PacketEvent::WriteAck { packet, ack }))
        }
        "acknowledge_packet" => packet_event(PacketEvent::Acknowledge),
        "timeout_packet" | "timeout_on_close_packet" => packet_event(PacketEvent::Timeout),

        "channel_open_init" => channel_event(ChannelEvent::OpenInit),
        "channel_open_try" => channel_event(ChannelEvent::OpenTry),
        "channel_open_ack" => channel_event(ChannelEvent::OpenAck),
        "channel_open_confirm" => channel_event(ChannelEvent::OpenConfirm),
        "channel_close_init" => channel_event(ChannelEvent::CloseInit),
        "channel_close_confirm" => channel_event(ChannelEvent::CloseConfirm),

        "channel_upgrade_init" => upgrade_event(ChannelUpgradeEvent::Init),
        "channel_upgrade_try" => upgrade_event(ChannelUpgradeEvent::Try),
        "channel_upgrade_ack" => upgrade_event(ChannelUpgradeEvent::Ack),
        "channel_upgrade_confirm" => upgrade_event(ChannelUpgradeEvent::Confirm),
        "channel_upgrade_open" => upgrade_event(ChannelUpgradeEvent::Open),
        "channel_upgrade_error" => upgrade_event(ChannelUpgradeEvent::Error),

        "incentivized_ibc_packet" => decode_fee(&attrs).map(IbcEvent::Fee),

        _ => None,
    }
}

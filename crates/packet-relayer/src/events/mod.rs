// Typed IBC events observed in block results

pub mod decoder;

pub use decoder::{decode_event, parse_fee_coins, ConnectionFilter};

/// IBC height, written as "<revision_number>-<revision_height>" on chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Height {
    pub revision_number: u64,
    pub revision_height: u64,
}

impl Height {
    pub fn new(revision_number: u64, revision_height: u64) -> Self {
        Self {
            revision_number,
            revision_height,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.revision_number == 0 && self.revision_height == 0
    }
}

impl std::fmt::Display for Height {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.revision_number, self.revision_height)
    }
}

/// Packet fields shared by every packet lifecycle event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketInfo {
    pub sequence: u64,
    pub src_port: String,
    pub src_channel: String,
    pub dst_port: String,
    pub dst_channel: String,
    pub data: Vec<u8>,
    /// `None` when the packet has no height timeout
    pub timeout_height: Option<Height>,
    /// Unix nanos, 0 when unset
    pub timeout_timestamp: u64,
    /// Connection on the chain that emitted the event
    pub connection_id: String,
    pub ordering: String,
}

impl PacketInfo {
    pub fn is_ordered(&self) -> bool {
        self.ordering == "ORDER_ORDERED"
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketEvent {
    Send(PacketInfo),
    Recv(PacketInfo),
    WriteAck { packet: PacketInfo, ack: Vec<u8> },
    Acknowledge(PacketInfo),
    Timeout(PacketInfo),
}

impl PacketEvent {
    pub fn packet(&self) -> &PacketInfo {
        match self {
            PacketEvent::Send(p)
            | PacketEvent::Recv(p)
            | PacketEvent::Acknowledge(p)
            | PacketEvent::Timeout(p) => p,
            PacketEvent::WriteAck { packet, .. } => packet,
        }
    }
}

/// Channel end identifiers carried by handshake events
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelAttributes {
    pub port_id: String,
    pub channel_id: String,
    pub counterparty_port_id: String,
    /// Empty on OPEN_INIT
    pub counterparty_channel_id: String,
    pub connection_id: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    OpenInit(ChannelAttributes),
    OpenTry(ChannelAttributes),
    OpenAck(ChannelAttributes),
    OpenConfirm(ChannelAttributes),
    CloseInit(ChannelAttributes),
    CloseConfirm(ChannelAttributes),
}

impl ChannelEvent {
    pub fn attributes(&self) -> &ChannelAttributes {
        match self {
            ChannelEvent::OpenInit(a)
            | ChannelEvent::OpenTry(a)
            | ChannelEvent::OpenAck(a)
            | ChannelEvent::OpenConfirm(a)
            | ChannelEvent::CloseInit(a)
            | ChannelEvent::CloseConfirm(a) => a,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UpgradeAttributes {
    pub port_id: String,
    pub channel_id: String,
    pub counterparty_port_id: String,
    pub counterparty_channel_id: String,
    /// Single-hop upgrade connection, when the event carries one
    pub connection_id: Option<String>,
    pub upgrade_sequence: u64,
    pub version: String,
    pub ordering: String,
    pub timeout_height: Option<Height>,
    pub timeout_timestamp: u64,
    pub error_receipt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelUpgradeEvent {
    Init(UpgradeAttributes),
    Try(UpgradeAttributes),
    Ack(UpgradeAttributes),
    Confirm(UpgradeAttributes),
    Open(UpgradeAttributes),
    Error(UpgradeAttributes),
}

impl ChannelUpgradeEvent {
    pub fn attributes(&self) -> &UpgradeAttributes {
        match self {
            ChannelUpgradeEvent::Init(a)
            | ChannelUpgradeEvent::Try(a)
            | ChannelUpgradeEvent::Ack(a)
            | ChannelUpgradeEvent::Confirm(a)
            | ChannelUpgradeEvent::Open(a)
            | ChannelUpgradeEvent::Error(a) => a,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coin {
    pub amount: String,
    pub denom: String,
}

/// Fees escrowed for one packet (ICS-29)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncentivizedPacket {
    pub port_id: String,
    pub channel_id: String,
    pub sequence: u64,
    pub recv_fee: Vec<Coin>,
    pub ack_fee: Vec<Coin>,
    pub timeout_fee: Vec<Coin>,
}

/// Every event kind the relay engine consumes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IbcEvent {
    Packet(PacketEvent),
    Channel(ChannelEvent),
    Upgrade(ChannelUpgradeEvent),
    Fee(IncentivizedPacket),
}

// ICS-24 store keys under the "ibc" store

pub fn packet_commitment(port_id: &str, channel_id: &str, sequence: u64) -> Vec<u8> {
    format!(
        "commitments/ports/{}/channels/{}/sequences/{}",
        port_id, channel_id, sequence
    )
    .into_bytes()
}

pub fn packet_acknowledgement(port_id: &str, channel_id: &str, sequence: u64) -> Vec<u8> {
    format!(
        "acks/ports/{}/channels/{}/sequences/{}",
        port_id, channel_id, sequence
    )
    .into_bytes()
}

pub fn packet_receipt(port_id: &str, channel_id: &str, sequence: u64) -> Vec<u8> {
    format!(
        "receipts/ports/{}/channels/{}/sequences/{}",
        port_id, channel_id, sequence
    )
    .into_bytes()
}

pub fn next_sequence_recv(port_id: &str, channel_id: &str) -> Vec<u8> {
    format!("nextSequenceRecv/ports/{}/channels/{}", port_id, channel_id).into_bytes()
}

pub fn channel_end(port_id: &str, channel_id: &str) -> Vec<u8> {
    format!("channelEnds/ports/{}/channels/{}", port_id, channel_id).into_bytes()
}

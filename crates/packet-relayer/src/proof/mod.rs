// Merkle proofs for IBC store keys
//
// A proof for header height H is queried at H-1: the app hash of state H-1
// is committed in header H.

use ibc_proto::ibc::core::commitment::v1::MerkleProof;
use prost::Message;
use tracing::debug;

use crate::chains::{ChainClient, ProofOp};
use crate::error::{RelayerError, Result};

pub mod paths;

/// Outer proof op proving the IBC store root inside the multistore
const MULTISTORE_OP: &str = "ics23:simple";
const ICS23_PREFIX: &str = "ics23:";

/// Same wire layout as `MerkleProof`, with each `CommitmentProof` kept as raw bytes
#[derive(Clone, PartialEq, prost::Message)]
struct MerkleProofBytes {
    #[prost(bytes = "vec", repeated, tag = "1")]
    proofs: Vec<Vec<u8>>,
}

/// A store value with its encoded `MerkleProof`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proof {
    /// Value at the key, empty for absence proofs
    pub value: Vec<u8>,
    /// Encoded `ibc.core.commitment.v1.MerkleProof`
    pub proof: Vec<u8>,
    /// Header height the proof verifies against
    pub proof_height: u64,
}

/// Fetch `key` with its proof for verification against header `height`
pub async fn get_proof(client: &dyn ChainClient, key: &[u8], height: u64) -> Result<Proof> {
    let key_str = String::from_utf8_lossy(key).to_string();
    if height < 2 {
        return Err(RelayerError::MalformedProof {
            key: key_str,
            reason: format!("cannot prove at header height {}", height),
        });
    }

    let response = client.query_store(key, height - 1, true).await?;
    let proof = convert_proof_ops(&key_str, &response.proof_ops)?;
    debug!(
        "{}: proof for {} at {} ({} bytes)",
        client.chain_id(),
        key_str,
        height,
        proof.len()
    );

    Ok(Proof {
        value: response.value,
        proof,
        proof_height: height,
    })
}

/// Turn the two ABCI proof ops into an encoded `MerkleProof`
pub fn convert_proof_ops(key: &str, ops: &[ProofOp]) -> Result<Vec<u8>> {
    let malformed = |reason: String| RelayerError::MalformedProof {
        key: key.to_string(),
        reason,
    };

    if ops.len() != 2 {
        return Err(malformed(format!("expected 2 proof ops, got {}", ops.len())));
    }
    if !ops[0].op_type.starts_with(ICS23_PREFIX) || ops[0].op_type == MULTISTORE_OP {
        return Err(malformed(format!("unexpected store proof op {}", ops[0].op_type)));
    }
    if ops[1].op_type != MULTISTORE_OP {
        return Err(malformed(format!(
            "unexpected multistore proof op {}",
            ops[1].op_type
        )));
    }

    let raw = MerkleProofBytes {
        proofs: ops.iter().map(|op| op.data.clone()).collect(),
    };
    // Round-trip through the typed message so undecodable commitment proofs fail here
    let merkle = MerkleProof::decode(raw.encode_to_vec().as_slice())
        .map_err(|e| malformed(format!("invalid commitment proof: {}", e)))?;
    Ok(merkle.encode_to_vec())
}

/// `nextSequenceRecv` values are 8-byte big-endian integers
pub fn decode_sequence(value: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = value.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

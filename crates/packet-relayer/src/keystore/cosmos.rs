// Cosmos secp256k1 wallet key
use super::KeyError;
use bech32::{ToBase32, Variant};
use ripemd::Ripemd160;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};

/// Signing key of one relayer wallet
#[derive(Clone)]
pub struct CosmosKey {
    /// Account address under the chain's bech32 prefix
    pub address: String,
    secret: SecretKey,
    /// Compressed SEC1 encoding, as carried in the tx auth info
    pub public_key: Vec<u8>,
}

impl std::fmt::Debug for CosmosKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CosmosKey")
            .field("address", &self.address)
            .field("public_key", &hex::encode(&self.public_key))
            .finish()
    }
}

fn crypto_err(e: secp256k1::Error) -> KeyError {
    KeyError::Crypto(e.to_string())
}

/// bech32(prefix, ripemd160(sha256(pubkey)))
fn account_address(public_key: &[u8], prefix: &str) -> Result<String, KeyError> {
    let account_id = Ripemd160::digest(Sha256::digest(public_key));
    bech32::encode(prefix, account_id.to_base32(), Variant::Bech32)
        .map_err(|e| KeyError::InvalidFormat(format!("bad address prefix {}: {}", prefix, e)))
}

impl CosmosKey {
    pub fn from_private_key(private_key: Vec<u8>, address_prefix: &str) -> Result<Self, KeyError> {
        if private_key.len() != 32 {
            return Err(KeyError::InvalidFormat(format!(
                "secp256k1 secret must be 32 bytes, got {}",
                private_key.len()
            )));
        }
        let secret = SecretKey::from_slice(&private_key).map_err(crypto_err)?;
        let public_key = PublicKey::from_secret_key(&Secp256k1::signing_only(), &secret)
            .serialize()
            .to_vec();
        let address = account_address(&public_key, address_prefix)?;

        Ok(Self {
            address,
            secret,
            public_key,
        })
    }

    /// Parse `<address>:<hex secret>` or a bare hex secret.
    ///
    /// A pinned address must match the one derived from the secret.
    pub fn from_env_string(env_str: &str, address_prefix: &str) -> Result<Self, KeyError> {
        let env_str = env_str.trim();
        let (pinned, hex_secret) = match env_str.split_once(':') {
            Some((address, secret)) if !secret.contains(':') => (Some(address), secret),
            Some(_) => {
                return Err(KeyError::InvalidFormat(
                    "wallet key takes at most one ':' separator".to_string(),
                ))
            }
            None => (None, env_str),
        };

        let secret = hex::decode(hex_secret)
            .map_err(|e| KeyError::InvalidFormat(format!("wallet key is not hex: {}", e)))?;
        let key = Self::from_private_key(secret, address_prefix)?;

        match pinned {
            Some(address) if address != key.address => Err(KeyError::InvalidFormat(format!(
                "Address {} does not match key (derived {})",
                address, key.address
            ))),
            _ => Ok(key),
        }
    }

    /// Sign the sha256 digest of `payload`, returning the 64-byte compact signature
    pub fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, KeyError> {
        let digest = Sha256::digest(payload);
        let message = Message::from_digest_slice(&digest).map_err(crypto_err)?;
        let signature = Secp256k1::signing_only().sign_ecdsa(&message, &self.secret);
        Ok(signature.serialize_compact().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::ecdsa::Signature;

    const TEST_KEY: &str = "1234567890abcdef1234567890abcdef1234567890abcdef1234567890abcdef";

    #[test]
    fn test_cosmos_key_from_private_key() {
        let private_key = hex::decode(TEST_KEY).unwrap();
        let key = CosmosKey::from_private_key(private_key, "cosmos").unwrap();

        assert_eq!(key.public_key.len(), 33);
        assert!(key.address.starts_with("cosmos1"));
        // 20-byte account id encodes to 38 data chars plus 6 checksum chars
        assert_eq!(key.address.len(), "cosmos1".len() + 38);
    }

    #[test]
    fn test_address_uses_chain_prefix() {
        let private_key = hex::decode(TEST_KEY).unwrap();
        let cosmos = CosmosKey::from_private_key(private_key.clone(), "cosmos").unwrap();
        let osmo = CosmosKey::from_private_key(private_key, "osmo").unwrap();

        let (_, cosmos_data, _) = bech32::decode(&cosmos.address).unwrap();
        let (hrp, osmo_data, _) = bech32::decode(&osmo.address).unwrap();
        assert_eq!(hrp, "osmo");
        assert_eq!(cosmos_data, osmo_data);
    }

    #[test]
    fn test_env_string_with_mismatched_address() {
        let env_str = format!("cosmos1notmine:{}", TEST_KEY);
        assert!(CosmosKey::from_env_string(&env_str, "cosmos").is_err());

        let derived = CosmosKey::from_env_string(TEST_KEY, "cosmos").unwrap();
        let pinned =
            CosmosKey::from_env_string(&format!("{}:{}", derived.address, TEST_KEY), "cosmos")
                .unwrap();
        assert_eq!(pinned.address, derived.address);
    }

    #[test]
    fn test_sign_produces_verifiable_compact_signature() {
        let key = CosmosKey::from_private_key(hex::decode(TEST_KEY).unwrap(), "cosmos").unwrap();
        let sig_bytes = key.sign(b"sign doc bytes").unwrap();
        assert_eq!(sig_bytes.len(), 64);

        let secp = Secp256k1::verification_only();
        let digest = Sha256::digest(b"sign doc bytes");
        let message = Message::from_digest_slice(&digest).unwrap();
        let signature = Signature::from_compact(&sig_bytes).unwrap();
        let public_key = secp256k1::PublicKey::from_slice(&key.public_key).unwrap();
        assert!(secp.verify_ecdsa(&message, &signature, &public_key).is_ok());
    }

    #[test]
    fn test_invalid_length_rejected() {
        assert!(CosmosKey::from_private_key(vec![1; 31], "cosmos").is_err());
    }
}

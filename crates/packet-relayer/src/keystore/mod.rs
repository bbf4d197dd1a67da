// Signing key handling for relay wallets
// Keys come from environment variables or inline hex in the config

use thiserror::Error;

pub mod cosmos;

pub use cosmos::CosmosKey;

use crate::config::WalletConfig;

/// Errors that can occur while loading or using a wallet key
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Invalid key format: {0}")]
    InvalidFormat(String),

    #[error("Cryptographic error: {0}")]
    Crypto(String),

    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    #[error("Wallet has no key source configured")]
    NoKeySource,
}

/// Resolve the signing key for one configured wallet.
///
/// `key_env` wins over `key_hex`. The address is always re-derived with the
/// chain's prefix unless the environment value pins one explicitly.
pub fn load_wallet_key(wallet: &WalletConfig, address_prefix: &str) -> Result<CosmosKey, KeyError> {
    if let Some(var) = &wallet.key_env {
        let value =
            std::env::var(var).map_err(|_| KeyError::EnvVarNotFound(var.clone()))?;
        return CosmosKey::from_env_string(&value, address_prefix);
    }
    if let Some(hex_key) = &wallet.key_hex {
        let private_key = hex::decode(hex_key.trim_start_matches("0x"))
            .map_err(|e| KeyError::InvalidFormat(format!("Invalid hex key: {}", e)))?;
        return CosmosKey::from_private_key(private_key, address_prefix);
    }
    Err(KeyError::NoKeySource)
}

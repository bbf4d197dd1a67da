// Transaction building and SIGN_MODE_DIRECT signing
use cosmos_sdk_proto::cosmos::base::v1beta1::Coin as ProtoCoin;
use cosmos_sdk_proto::cosmos::crypto::secp256k1::PubKey;
use cosmos_sdk_proto::cosmos::tx::signing::v1beta1::SignMode;
use cosmos_sdk_proto::cosmos::tx::v1beta1::{
    mode_info, AuthInfo, Fee, ModeInfo, SignDoc, SignerInfo, TxBody, TxRaw,
};
use prost::Message;

use crate::chains::AccountInfo;
use crate::error::{RelayerError, Result};
use crate::keystore::CosmosKey;

/// Wrap an encoded protobuf message into a tx `Any`
pub fn to_any<M: Message>(type_url: &str, msg: &M) -> prost_types::Any {
    prost_types::Any {
        type_url: type_url.to_string(),
        value: msg.encode_to_vec(),
    }
}

/// Gas price such as "0.025uatom"
#[derive(Debug, Clone, PartialEq)]
pub struct GasPrice {
    pub amount: f64,
    pub denom: String,
}

impl GasPrice {
    pub fn parse(gas_price: &str) -> Result<Self> {
        let split_pos = gas_price
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(|| RelayerError::Config(format!("gas price {} has no denom", gas_price)))?;
        if split_pos == 0 {
            return Err(RelayerError::Config(format!(
                "gas price {} has no amount",
                gas_price
            )));
        }
        let amount: f64 = gas_price[..split_pos]
            .parse()
            .map_err(|e| RelayerError::Config(format!("invalid gas price {}: {}", gas_price, e)))?;
        Ok(Self {
            amount,
            denom: gas_price[split_pos..].to_string(),
        })
    }

    /// Fee for `gas_limit`, rounded up
    pub fn fee(&self, gas_limit: u64) -> ProtoCoin {
        ProtoCoin {
            denom: self.denom.clone(),
            // epsilon keeps float noise from rounding an exact product up
            amount: ((self.amount * gas_limit as f64 - 1e-9).ceil().max(0.0) as u64).to_string(),
        }
    }
}

/// Everything needed to sign one transaction
pub struct TxParams<'a> {
    pub chain_id: &'a str,
    pub account: AccountInfo,
    pub gas_limit: u64,
    pub gas_price: &'a GasPrice,
    pub memo: &'a str,
}

/// Build, sign and encode a `TxRaw` carrying `messages`
pub fn build_signed_tx(
    key: &CosmosKey,
    params: &TxParams<'_>,
    messages: Vec<prost_types::Any>,
) -> Result<Vec<u8>> {
    let tx_body = TxBody {
        messages,
        memo: params.memo.to_string(),
        timeout_height: 0,
        extension_options: vec![],
        non_critical_extension_options: vec![],
    };

    let signer_info = SignerInfo {
        public_key: Some(to_any(
            "/cosmos.crypto.secp256k1.PubKey",
            &PubKey {
                key: key.public_key.clone(),
            },
        )),
        mode_info: Some(ModeInfo {
            sum: Some(mode_info::Sum::Single(mode_info::Single {
                mode: SignMode::Direct as i32,
            })),
        }),
        sequence: params.account.sequence,
    };

    let auth_info = AuthInfo {
        signer_infos: vec![signer_info],
        fee: Some(Fee {
            amount: vec![params.gas_price.fee(params.gas_limit)],
            gas_limit: params.gas_limit,
            payer: String::new(),
            granter: String::new(),
        }),
        tip: None,
    };

    let body_bytes = tx_body.encode_to_vec();
    let auth_info_bytes = auth_info.encode_to_vec();

    let sign_doc = SignDoc {
        body_bytes: body_bytes.clone(),
        auth_info_bytes: auth_info_bytes.clone(),
        chain_id: params.chain_id.to_string(),
        account_number: params.account.account_number,
    };
    let signature = key.sign(&sign_doc.encode_to_vec())?;

    let tx_raw = TxRaw {
        body_bytes,
        auth_info_bytes,
        signatures: vec![signature],
    };
    Ok(tx_raw.encode_to_vec())
}

pub use bitcoin::Network;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Transaction version used for every commit, reveal and transfer
/// transaction built by this crate.
pub const DEFAULT_TX_VERSION: i32 = 2;

/// All inputs signal RBF and stay non-final (`0xfffffffd`).
pub const DEFAULT_SEQUENCE_NUM: u32 = 0xffff_fffd;

/// Postage paid to the destination of a revealed satoshi when the caller
/// does not choose a value.
pub const DEFAULT_REVEAL_OUT_VALUE: i64 = 546;

/// Change below this threshold is folded into the commit fee when the
/// caller does not choose a value.
pub const DEFAULT_MIN_CHANGE_VALUE: i64 = 546;

/// MAX_STANDARD_TX_WEIGHT / 10; reveal transactions above this weight are
/// rejected before signing.
pub const MAX_STANDARD_TX_WEIGHT: u64 = 4_000_000 / 10;

/// A spendable prior output the commit transaction may consume.
///
/// `private_key` is a WIF string in the in-process signing flow and absent
/// in the detached flow.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrevOutput {
    pub tx_id: String,
    pub v_out: u32,
    pub amount: i64,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
}

/// One piece of content to inscribe and the address that receives the
/// revealed satoshi.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InscriptionPayload {
    pub content_type: String,
    #[serde(with = "hex")]
    pub body: Vec<u8>,
    pub reveal_addr: String,
}

/// Request envelope for the end-to-end inscription flow.
///
/// `reveal_out_value` and `min_change_value` fall back to 546 when zero or
/// negative.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InscriptionRequest {
    pub commit_tx_prev_output_list: Vec<PrevOutput>,
    pub commit_fee_rate: i64,
    pub reveal_fee_rate: i64,
    pub inscription_data_list: Vec<InscriptionPayload>,
    #[serde(default)]
    pub reveal_out_value: i64,
    pub change_address: String,
    #[serde(default)]
    pub min_change_value: i64,
}

impl InscriptionRequest {
    pub fn effective_reveal_out_value(&self) -> i64 {
        if self.reveal_out_value > 0 {
            self.reveal_out_value
        } else {
            DEFAULT_REVEAL_OUT_VALUE
        }
    }

    pub fn effective_min_change_value(&self) -> i64 {
        if self.min_change_value > 0 {
            self.min_change_value
        } else {
            DEFAULT_MIN_CHANGE_VALUE
        }
    }
}

/// Result envelope of the end-to-end flow.
///
/// On insufficient balance `commit_tx` is empty, `reveal_txs` is empty and
/// the fee fields report the amounts that would have been required.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InscribeTxs {
    pub commit_tx: String,
    pub reveal_txs: Vec<String>,
    pub commit_tx_fee: i64,
    pub reveal_tx_fees: Vec<i64>,
    pub commit_addrs: Vec<String>,
}

/// Per-inscription context exchanged with the caller across the detached
/// calls. Carries everything needed to rebuild and finalize the reveal
/// without holding key material.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InscriptionContextData {
    pub commit_tx_address: String,
    #[serde(with = "hex")]
    pub commit_tx_out_pk_script: Vec<u8>,
    pub commit_tx_out_value: i64,
    #[serde(with = "hex")]
    pub inscription_script: Vec<u8>,
    #[serde(with = "hex")]
    pub control_block_witness: Vec<u8>,
    #[serde(with = "hex")]
    pub reveal_tx_out_pk_script: Vec<u8>,
    pub reveal_tx_out_value: i64,
}

/// Output of the detached preparation step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreparedInscription {
    pub ctx_data_list: Vec<InscriptionContextData>,
    pub reveal_out_value: i64,
    pub total_reveal_prev_output_value: i64,
    pub min_change_value: i64,
    pub commit_addrs: Vec<String>,
}

#[derive(Debug, Error)]
pub enum InscribeError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("script build error: {0}")]
    ScriptBuild(String),

    #[error("insufficient balance, commit fee of {must_commit_fee} required")]
    InsufficientBalance { must_commit_fee: i64 },

    #[error(
        "reveal (index {index}) transaction weight greater than 400000 \
         (MAX_STANDARD_TX_WEIGHT): {weight}"
    )]
    WeightExceeded { index: usize, weight: u64 },

    #[error("unsupported script for detached signing")]
    UnsupportedScript,

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("unknown network: {0}")]
    UnknownNetwork(String),
}

pub type Result<T> = std::result::Result<T, InscribeError>;

impl From<bitcoin::address::ParseError> for InscribeError {
    fn from(error: bitcoin::address::ParseError) -> Self {
        InscribeError::InvalidAddress(error.to_string())
    }
}

impl From<secp256k1::Error> for InscribeError {
    fn from(error: secp256k1::Error) -> Self {
        InscribeError::InvalidKey(error.to_string())
    }
}

impl From<bitcoin::consensus::encode::Error> for InscribeError {
    fn from(error: bitcoin::consensus::encode::Error) -> Self {
        InscribeError::Serialization(error.to_string())
    }
}

impl From<hex::FromHexError> for InscribeError {
    fn from(error: hex::FromHexError) -> Self {
        InscribeError::Serialization(error.to_string())
    }
}

/// Resolves a network name from the request path into chain parameters.
pub fn parse_network(name: &str) -> Result<Network> {
    match name {
        "mainnet" => Ok(Network::Bitcoin),
        "testnet3" => Ok(Network::Testnet),
        "regtest" => Ok(Network::Regtest),
        // btcd's simnet has no rust-bitcoin counterpart; signet fills the
        // private-test-network role.
        "simnet" | "signet" => Ok(Network::Signet),
        other => Err(InscribeError::UnknownNetwork(other.to_string())),
    }
}

use std::str::FromStr;

use bitcoin::secp256k1::XOnlyPublicKey;
use bitcoin::{Address, Amount, Network, ScriptBuf, TxOut};

use crate::signer::SigningKey;
use crate::types::{InscribeError, InscriptionContextData, Result};

/// Key material attached to one inscription context. The in-process flow
/// holds the signing key; the detached flow only knows the internal
/// public key the envelope was built from.
pub(crate) enum ContextKey {
    Signing(SigningKey),
    ViewOnly(XOnlyPublicKey),
}

impl ContextKey {
    pub fn signing(&self) -> Result<&SigningKey> {
        match self {
            ContextKey::Signing(key) => Ok(key),
            ContextKey::ViewOnly(_) => Err(InscribeError::InvalidKey(
                "context holds no private key".to_string(),
            )),
        }
    }
}

/// One inscription as it moves through the pipeline: built by the
/// envelope stage, sized by the reveal sizer, consumed when the reveal is
/// finalized.
pub(crate) struct InscriptionContext {
    pub key: ContextKey,
    pub inscription_script: ScriptBuf,
    pub commit_address: Address,
    pub commit_script_pubkey: ScriptBuf,
    pub control_block_witness: Vec<u8>,
    /// The (script, value) pair the commit must produce and the reveal
    /// will spend; set once the reveal has been sized.
    pub reveal_prev_output: Option<TxOut>,
}

impl InscriptionContext {
    pub fn reveal_prev_output(&self) -> Result<&TxOut> {
        self.reveal_prev_output.as_ref().ok_or_else(|| {
            InscribeError::ScriptBuild("inscription context has not been sized".to_string())
        })
    }

    /// Reconstructs a context from its caller-visible form. The internal
    /// key is read back from the envelope's leading push; key material
    /// stays external.
    pub fn from_data(data: &InscriptionContextData, network: Network) -> Result<Self> {
        let inscription_script = ScriptBuf::from_bytes(data.inscription_script.clone());
        let internal_key = internal_key_of_envelope(&inscription_script)?;
        let commit_address =
            Address::from_str(&data.commit_tx_address)?.require_network(network)?;

        Ok(Self {
            key: ContextKey::ViewOnly(internal_key),
            inscription_script,
            commit_address,
            commit_script_pubkey: ScriptBuf::from_bytes(data.commit_tx_out_pk_script.clone()),
            control_block_witness: data.control_block_witness.clone(),
            reveal_prev_output: Some(TxOut {
                value: Amount::from_sat(data.commit_tx_out_value.max(0) as u64),
                script_pubkey: ScriptBuf::from_bytes(data.commit_tx_out_pk_script.clone()),
            }),
        })
    }

    pub fn with_key(mut self, key: ContextKey) -> Self {
        self.key = key;
        self
    }
}

/// The envelope starts with a 32-byte push of the x-only internal key.
fn internal_key_of_envelope(script: &ScriptBuf) -> Result<XOnlyPublicKey> {
    let bytes = script.as_bytes();
    if bytes.len() < 33 || bytes[0] != 0x20 {
        return Err(InscribeError::Serialization(
            "inscription script does not start with an internal key push".to_string(),
        ));
    }
    XOnlyPublicKey::from_slice(&bytes[1..33])
        .map_err(|e| InscribeError::InvalidKey(e.to_string()))
}

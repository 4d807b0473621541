//! Standard-script and address primitives: address strings to output
//! scripts, public keys to addresses, and the two pubkey-hash templates.

use std::str::FromStr;

use bitcoin::hashes::{hash160, Hash};
use bitcoin::secp256k1::Secp256k1;
use bitcoin::{
    Address, CompressedPublicKey, Network, PubkeyHash, PublicKey, ScriptBuf, WPubkeyHash,
};

use crate::types::{InscribeError, Result};

/// The four output-script shapes the builder can pay to and spend from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressKind {
    Legacy,
    NestedSegwit,
    NativeSegwit,
    Taproot,
}

/// Decodes an address and returns its scriptPubKey, rejecting addresses
/// that do not belong to `network`.
pub fn address_to_script_pubkey(addr: &str, network: Network) -> Result<ScriptBuf> {
    let address = Address::from_str(addr)?.require_network(network)?;
    Ok(address.script_pubkey())
}

/// Encodes a serialized public key as an address of the requested kind.
pub fn public_key_to_address(pubkey: &[u8], kind: AddressKind, network: Network) -> Result<String> {
    let pk =
        PublicKey::from_slice(pubkey).map_err(|e| InscribeError::InvalidKey(e.to_string()))?;

    let address = match kind {
        AddressKind::Legacy => Address::p2pkh(pk, network),
        AddressKind::NestedSegwit => {
            let compressed = CompressedPublicKey::try_from(pk)
                .map_err(|e| InscribeError::InvalidKey(e.to_string()))?;
            Address::p2shwpkh(&compressed, network)
        }
        AddressKind::NativeSegwit => {
            let compressed = CompressedPublicKey::try_from(pk)
                .map_err(|e| InscribeError::InvalidKey(e.to_string()))?;
            Address::p2wpkh(&compressed, network)
        }
        AddressKind::Taproot => {
            let secp = Secp256k1::verification_only();
            Address::p2tr(&secp, pk.inner.x_only_public_key().0, None, network)
        }
    };

    Ok(address.to_string())
}

/// `OP_DUP OP_HASH160 <hash> OP_EQUALVERIFY OP_CHECKSIG`
pub fn pay_to_pubkey_hash_script(pubkey_hash: [u8; 20]) -> ScriptBuf {
    ScriptBuf::new_p2pkh(&PubkeyHash::from_byte_array(pubkey_hash))
}

/// `OP_0 <hash>`
pub fn pay_to_witness_pubkey_hash_script(pubkey_hash: [u8; 20]) -> ScriptBuf {
    ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array(pubkey_hash))
}

/// HASH160 of a serialized public key.
pub(crate) fn hash160(data: &[u8]) -> [u8; 20] {
    hash160::Hash::hash(data).to_byte_array()
}

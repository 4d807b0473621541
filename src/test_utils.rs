//! Deterministic key and address fixtures shared by the unit tests.

use std::collections::BTreeMap;

use bitcoin::{Network, PrivateKey};
use secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey, XOnlyPublicKey};

use crate::addresses::{public_key_to_address, AddressKind};
use crate::signer::SigningKey;

/// A valid secret key derived from a one-byte tag; never use tag 0.
pub(crate) fn secret_key(tag: u8) -> SecretKey {
    SecretKey::from_slice(&[tag; 32]).expect("constant test key is valid")
}

pub(crate) fn signing_key(tag: u8) -> SigningKey {
    SigningKey::new(secret_key(tag))
}

pub(crate) fn public_key(tag: u8) -> PublicKey {
    let secp = Secp256k1::new();
    PublicKey::from_secret_key(&secp, &secret_key(tag))
}

pub(crate) fn x_only_public_key(tag: u8) -> XOnlyPublicKey {
    public_key(tag).x_only_public_key().0
}

pub(crate) fn wif(tag: u8) -> String {
    PrivateKey::new(secret_key(tag), Network::Testnet).to_wif()
}

pub(crate) fn p2pkh_address(tag: u8) -> String {
    address(tag, AddressKind::Legacy)
}

pub(crate) fn p2shwpkh_address(tag: u8) -> String {
    address(tag, AddressKind::NestedSegwit)
}

pub(crate) fn p2wpkh_address(tag: u8) -> String {
    address(tag, AddressKind::NativeSegwit)
}

pub(crate) fn p2tr_address(tag: u8) -> String {
    address(tag, AddressKind::Taproot)
}

fn address(tag: u8, kind: AddressKind) -> String {
    public_key_to_address(&public_key(tag).serialize(), kind, Network::Testnet)
        .expect("test address derivation")
}

pub(crate) fn txid_hex(tag: u8) -> String {
    hex::encode([tag; 32])
}

/// Plays the external signer: compact ECDSA over each message hash, with
/// the sighash flag byte appended, as the detached callers submit it.
pub(crate) fn sign_hashes_externally(
    hashes: &BTreeMap<usize, String>,
    secret: &SecretKey,
    secp: &Secp256k1<All>,
) -> BTreeMap<usize, String> {
    hashes
        .iter()
        .map(|(index, digest_hex)| {
            let digest: [u8; 32] = hex::decode(digest_hex)
                .expect("hash hex")
                .try_into()
                .expect("32-byte hash");
            let signature = secp.sign_ecdsa(&Message::from_digest(digest), secret);
            let mut encoded = hex::encode(signature.serialize_compact());
            encoded.push_str("01");
            (*index, encoded)
        })
        .collect()
}

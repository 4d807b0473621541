//! Sighash computation and witness/scriptSig production for the four
//! supported prevout shapes, plus the detached variants that hand the
//! message hashes to an external signer and reassemble from its
//! signatures.

use std::collections::{BTreeMap, HashMap};

use bitcoin::hashes::Hash;
use bitcoin::key::TapTweak;
use bitcoin::script::{Builder as ScriptBuilder, PushBytesBuf};
use bitcoin::sighash::{Prevouts, SighashCache};
use bitcoin::{
    EcdsaSighashType, OutPoint, PrivateKey, ScriptBuf, TapSighashType, Transaction, TxOut, Witness,
};
use secp256k1::ecdsa::Signature as EcdsaSignature;
use secp256k1::{All, Keypair, Message, PublicKey, Secp256k1, SecretKey};
use zeroize::Zeroize;

use crate::addresses::{hash160, pay_to_witness_pubkey_hash_script};
use crate::types::{InscribeError, Result};

/// Private key held for the duration of one build; the backing bytes are
/// erased when the holder is dropped.
pub(crate) struct SigningKey {
    secret: SecretKey,
}

impl SigningKey {
    pub fn new(secret: SecretKey) -> Self {
        Self { secret }
    }

    /// Decodes a WIF string into signing material.
    pub fn from_wif(wif: &str) -> Result<Self> {
        let private_key =
            PrivateKey::from_wif(wif).map_err(|e| InscribeError::InvalidKey(e.to_string()))?;
        Ok(Self::new(private_key.inner))
    }

    pub fn secret(&self) -> &SecretKey {
        &self.secret
    }

    pub fn public_key(&self, secp: &Secp256k1<All>) -> PublicKey {
        PublicKey::from_secret_key(secp, &self.secret)
    }
}

impl Drop for SigningKey {
    fn drop(&mut self) {
        let mut bytes = self.secret.secret_bytes();
        bytes.zeroize();
        self.secret.non_secure_erase();
    }
}

/// Maps outpoints to the outputs they created, standing in for chain
/// lookups while signing.
#[derive(Debug, Default)]
pub(crate) struct PrevOutRegistry {
    entries: HashMap<OutPoint, TxOut>,
}

impl PrevOutRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, outpoint: OutPoint, txout: TxOut) {
        self.entries.insert(outpoint, txout);
    }

    pub fn fetch(&self, outpoint: &OutPoint) -> Result<&TxOut> {
        self.entries.get(outpoint).ok_or_else(|| {
            InscribeError::Serialization(format!("no prevout registered for {outpoint}"))
        })
    }

    /// Prevouts of every input, in input order, as BIP-341 signing wants
    /// them.
    pub fn ordered_for(&self, tx: &Transaction) -> Result<Vec<TxOut>> {
        tx.input
            .iter()
            .map(|input| self.fetch(&input.previous_output).cloned())
            .collect()
    }
}

/// What signing one input produced; applied to the transaction after all
/// sighashes are computed.
struct InputAuthorization {
    witness: Option<Witness>,
    script_sig: Option<ScriptBuf>,
}

fn der_with_sighash_all(signature: &EcdsaSignature) -> Vec<u8> {
    let mut bytes = signature.serialize_der().to_vec();
    bytes.push(EcdsaSighashType::All.to_u32() as u8);
    bytes
}

fn push_bytes(data: Vec<u8>) -> Result<PushBytesBuf> {
    PushBytesBuf::try_from(data).map_err(|e| InscribeError::ScriptBuild(e.to_string()))
}

/// Signs every input of `tx`, dispatching on the shape of its prevout
/// script. `keys` is aligned with the inputs.
///
/// - P2TR key-path: BIP-341 `SIGHASH_DEFAULT`, tweaked Schnorr key,
///   witness `[signature]`
/// - P2PKH: legacy `SIGHASH_ALL`, scriptSig `<sig> <pubkey>`
/// - P2WPKH: BIP-143 over the implicit pubkey-hash script code, witness
///   `[sig, pubkey]`
/// - P2SH-P2WPKH: as P2WPKH plus a redeem-script push in the scriptSig
pub(crate) fn sign_inputs(
    tx: &mut Transaction,
    keys: &[SigningKey],
    prevouts: &PrevOutRegistry,
    secp: &Secp256k1<All>,
) -> Result<()> {
    if keys.len() < tx.input.len() {
        return Err(InscribeError::InvalidKey(format!(
            "{} signing keys for {} inputs",
            keys.len(),
            tx.input.len()
        )));
    }

    let all_prevouts = prevouts.ordered_for(tx)?;
    let mut authorizations = Vec::with_capacity(tx.input.len());
    let mut cache = SighashCache::new(&*tx);

    for (index, prev_out) in all_prevouts.iter().enumerate() {
        let script_pubkey = &prev_out.script_pubkey;
        let key = &keys[index];

        let authorization = if script_pubkey.is_p2tr() {
            let sighash = cache
                .taproot_key_spend_signature_hash(
                    index,
                    &Prevouts::All(&all_prevouts),
                    TapSighashType::Default,
                )
                .map_err(|e| InscribeError::Serialization(e.to_string()))?;
            let keypair = Keypair::from_secret_key(secp, key.secret());
            let tweaked = keypair.tap_tweak(secp, None);
            let message = Message::from_digest(sighash.to_byte_array());
            let signature = secp.sign_schnorr_no_aux_rand(&message, &tweaked.to_inner());
            let signature = bitcoin::taproot::Signature {
                signature,
                sighash_type: TapSighashType::Default,
            };

            let mut witness = Witness::new();
            witness.push(signature.to_vec());
            InputAuthorization {
                witness: Some(witness),
                script_sig: None,
            }
        } else if script_pubkey.is_p2pkh() {
            let sighash = cache
                .legacy_signature_hash(index, script_pubkey, EcdsaSighashType::All.to_u32())
                .map_err(|e| InscribeError::Serialization(e.to_string()))?;
            let message = Message::from_digest(sighash.to_byte_array());
            let signature = secp.sign_ecdsa(&message, key.secret());

            let script_sig = ScriptBuilder::new()
                .push_slice(push_bytes(der_with_sighash_all(&signature))?)
                .push_slice(key.public_key(secp).serialize())
                .into_script();
            InputAuthorization {
                witness: None,
                script_sig: Some(script_sig),
            }
        } else {
            // Native or nested segwit: the script code is the pubkey-hash
            // script of the signing key.
            let public_key = key.public_key(secp);
            let wpkh_script = pay_to_witness_pubkey_hash_script(hash160(&public_key.serialize()));
            let sighash = cache
                .p2wpkh_signature_hash(index, &wpkh_script, prev_out.value, EcdsaSighashType::All)
                .map_err(|e| InscribeError::Serialization(e.to_string()))?;
            let message = Message::from(sighash);
            let signature = secp.sign_ecdsa(&message, key.secret());
            let signature = bitcoin::ecdsa::Signature {
                signature,
                sighash_type: EcdsaSighashType::All,
            };

            let script_sig = if script_pubkey.is_p2sh() {
                Some(
                    ScriptBuilder::new()
                        .push_slice(push_bytes(wpkh_script.to_bytes())?)
                        .into_script(),
                )
            } else {
                None
            };
            InputAuthorization {
                witness: Some(Witness::p2wpkh(&signature, &public_key)),
                script_sig,
            }
        };

        authorizations.push(authorization);
    }

    for (input, authorization) in tx.input.iter_mut().zip(authorizations) {
        if let Some(witness) = authorization.witness {
            input.witness = witness;
        }
        if let Some(script_sig) = authorization.script_sig {
            input.script_sig = script_sig;
        }
    }

    Ok(())
}

/// Detached counterpart of [`sign_inputs`]: returns the per-input message
/// hash an external signer must sign, keyed by input index.
///
/// Taproot key-path inputs are not supported here; their signatures cannot
/// be produced from a bare public key without the tweak secret.
pub(crate) fn message_hashes(
    tx: &Transaction,
    prevouts: &PrevOutRegistry,
    public_key: &PublicKey,
) -> Result<BTreeMap<usize, String>> {
    let mut hashes = BTreeMap::new();
    let mut cache = SighashCache::new(tx);

    for (index, input) in tx.input.iter().enumerate() {
        let prev_out = prevouts.fetch(&input.previous_output)?;
        let script_pubkey = &prev_out.script_pubkey;

        let digest: [u8; 32] = if script_pubkey.is_p2tr() {
            return Err(InscribeError::UnsupportedScript);
        } else if script_pubkey.is_p2pkh() {
            cache
                .legacy_signature_hash(index, script_pubkey, EcdsaSighashType::All.to_u32())
                .map_err(|e| InscribeError::Serialization(e.to_string()))?
                .to_byte_array()
        } else {
            let wpkh_script = pay_to_witness_pubkey_hash_script(hash160(&public_key.serialize()));
            cache
                .p2wpkh_signature_hash(index, &wpkh_script, prev_out.value, EcdsaSighashType::All)
                .map_err(|e| InscribeError::Serialization(e.to_string()))?
                .to_byte_array()
        };

        hashes.insert(index, hex::encode(digest));
    }

    Ok(hashes)
}

/// Mirror of [`message_hashes`]: writes externally produced compact ECDSA
/// signatures (64 bytes, or 65 with a trailing sighash flag) into the
/// transaction, re-encoded as DER plus `SIGHASH_ALL`.
pub(crate) fn apply_signatures(
    tx: &mut Transaction,
    signatures: &BTreeMap<usize, String>,
    public_key: &PublicKey,
    prevouts: &PrevOutRegistry,
) -> Result<()> {
    let ordered = prevouts.ordered_for(tx)?;

    for (index, input) in tx.input.iter_mut().enumerate() {
        let script_pubkey = &ordered[index].script_pubkey;
        if script_pubkey.is_p2tr() {
            return Err(InscribeError::UnsupportedScript);
        }

        let signature_hex = signatures.get(&index).ok_or_else(|| {
            InscribeError::Serialization(format!("missing signature for input {index}"))
        })?;
        let signature_bytes = hex::decode(signature_hex)?;
        if signature_bytes.len() != 64 && signature_bytes.len() != 65 {
            return Err(InscribeError::Serialization(format!(
                "signature for input {index} must be 64 or 65 bytes, got {}",
                signature_bytes.len()
            )));
        }
        let signature = EcdsaSignature::from_compact(&signature_bytes[..64])
            .map_err(|e| InscribeError::Serialization(e.to_string()))?;
        let encoded = der_with_sighash_all(&signature);

        if script_pubkey.is_p2pkh() {
            input.script_sig = ScriptBuilder::new()
                .push_slice(push_bytes(encoded)?)
                .push_slice(public_key.serialize())
                .into_script();
        } else {
            let mut witness = Witness::new();
            witness.push(encoded);
            witness.push(public_key.serialize());
            input.witness = witness;

            if script_pubkey.is_p2sh() {
                let wpkh_script =
                    pay_to_witness_pubkey_hash_script(hash160(&public_key.serialize()));
                input.script_sig = ScriptBuilder::new()
                    .push_slice(push_bytes(wpkh_script.to_bytes())?)
                    .into_script();
            }
        }
    }

    Ok(())
}

/// Lowercase-hex consensus encoding.
pub(crate) fn tx_to_hex(tx: &Transaction) -> String {
    bitcoin::consensus::encode::serialize_hex(tx)
}

pub(crate) fn tx_from_hex(tx_hex: &str) -> Result<Transaction> {
    let bytes = hex::decode(tx_hex)?;
    bitcoin::consensus::deserialize(&bytes).map_err(InscribeError::from)
}

#[cfg(test)]
mod tests {
    use bitcoin::absolute::LockTime;
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, Network, Sequence, Txid};

    use super::*;
    use crate::addresses::address_to_script_pubkey;
    use crate::test_utils;

    fn one_in_one_out(script_pubkey: ScriptBuf, value: i64) -> (Transaction, PrevOutRegistry) {
        let outpoint = OutPoint {
            txid: Txid::all_zeros(),
            vout: 0,
        };
        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![bitcoin::TxIn {
                previous_output: outpoint,
                script_sig: ScriptBuf::default(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::default(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(value as u64 - 1_000),
                script_pubkey: address_to_script_pubkey(
                    &test_utils::p2wpkh_address(9),
                    Network::Testnet,
                )
                .unwrap(),
            }],
        };
        let mut registry = PrevOutRegistry::new();
        registry.insert(
            outpoint,
            TxOut {
                value: Amount::from_sat(value as u64),
                script_pubkey,
            },
        );
        (tx, registry)
    }

    #[test]
    fn p2tr_input_gets_single_element_witness() {
        let secp = Secp256k1::new();
        let script =
            address_to_script_pubkey(&test_utils::p2tr_address(1), Network::Testnet).unwrap();
        let (mut tx, registry) = one_in_one_out(script, 10_000);

        sign_inputs(&mut tx, &[test_utils::signing_key(1)], &registry, &secp).unwrap();

        assert_eq!(tx.input[0].witness.len(), 1);
        assert_eq!(tx.input[0].witness.nth(0).unwrap().len(), 64);
        assert!(tx.input[0].script_sig.is_empty());
    }

    #[test]
    fn p2pkh_input_gets_script_sig_only() {
        let secp = Secp256k1::new();
        let script =
            address_to_script_pubkey(&test_utils::p2pkh_address(1), Network::Testnet).unwrap();
        let (mut tx, registry) = one_in_one_out(script, 10_000);

        sign_inputs(&mut tx, &[test_utils::signing_key(1)], &registry, &secp).unwrap();

        assert_eq!(tx.input[0].witness.len(), 0);
        let script_sig = tx.input[0].script_sig.as_bytes();
        assert!(!script_sig.is_empty());
        // trailing push is the 33-byte compressed pubkey
        assert_eq!(
            &script_sig[script_sig.len() - 33..],
            test_utils::public_key(1).serialize().as_slice()
        );
    }

    #[test]
    fn nested_segwit_input_gets_witness_and_redeem_script() {
        let secp = Secp256k1::new();
        let script =
            address_to_script_pubkey(&test_utils::p2shwpkh_address(1), Network::Testnet).unwrap();
        let (mut tx, registry) = one_in_one_out(script, 10_000);

        sign_inputs(&mut tx, &[test_utils::signing_key(1)], &registry, &secp).unwrap();

        assert_eq!(tx.input[0].witness.len(), 2);
        // OP_PUSHBYTES_22 plus the 22-byte p2wpkh redeem script
        assert_eq!(tx.input[0].script_sig.len(), 23);
    }

    #[test]
    fn signing_is_deterministic() {
        let secp = Secp256k1::new();
        let script =
            address_to_script_pubkey(&test_utils::p2wpkh_address(1), Network::Testnet).unwrap();
        let (mut first, registry) = one_in_one_out(script, 10_000);
        let mut second = first.clone();

        sign_inputs(&mut first, &[test_utils::signing_key(1)], &registry, &secp).unwrap();
        sign_inputs(&mut second, &[test_utils::signing_key(1)], &registry, &secp).unwrap();
        assert_eq!(tx_to_hex(&first), tx_to_hex(&second));
    }

    #[test]
    fn detached_taproot_commit_input_is_unsupported() {
        let secp = Secp256k1::new();
        let script =
            address_to_script_pubkey(&test_utils::p2tr_address(1), Network::Testnet).unwrap();
        let (tx, registry) = one_in_one_out(script, 10_000);

        let result = message_hashes(&tx, &registry, &test_utils::signing_key(1).public_key(&secp));
        assert!(matches!(result, Err(InscribeError::UnsupportedScript)));
    }

    #[test]
    fn detached_signatures_reproduce_in_process_signing() {
        let secp = Secp256k1::new();
        let script =
            address_to_script_pubkey(&test_utils::p2wpkh_address(1), Network::Testnet).unwrap();
        let (unsigned, registry) = one_in_one_out(script, 10_000);
        let key = test_utils::signing_key(1);
        let public_key = key.public_key(&secp);

        let mut in_process = unsigned.clone();
        sign_inputs(&mut in_process, &[test_utils::signing_key(1)], &registry, &secp).unwrap();

        let hashes = message_hashes(&unsigned, &registry, &public_key).unwrap();
        let signatures = test_utils::sign_hashes_externally(&hashes, key.secret(), &secp);
        let mut reassembled = unsigned;
        apply_signatures(&mut reassembled, &signatures, &public_key, &registry).unwrap();

        assert_eq!(tx_to_hex(&in_process), tx_to_hex(&reassembled));
    }
}

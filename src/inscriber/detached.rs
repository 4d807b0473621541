//! External-signer workflow. Keys never enter the process: the caller
//! receives per-input message hashes, signs them elsewhere, and hands the
//! signatures back. State crosses the calls as an explicit context list,
//! not as a builder object.

use std::collections::BTreeMap;
use std::str::FromStr;

use bitcoin::{Network, Txid};
use secp256k1::schnorr::Signature as SchnorrSignature;
use secp256k1::{Secp256k1, XOnlyPublicKey};
use tracing::instrument;

use crate::signer::{self, SigningKey};
use crate::types::{
    InscribeError, InscriptionContextData, InscriptionPayload, PreparedInscription, PrevOutput,
    Result, DEFAULT_MIN_CHANGE_VALUE, DEFAULT_REVEAL_OUT_VALUE,
};

use super::context::{ContextKey, InscriptionContext};
use super::{
    build_contexts, build_empty_reveal_txs, calculate_commit_tx_fee, calculate_reveal_tx_fees,
    complete_commit_tx, dry_sign_for_estimate, fill_commit_outputs, fill_reveal_txs,
    parse_commit_prev_outputs, reveal_witness, sign_reveal_txs, EnvelopeKey,
};

fn parse_public_key(public_key: &[u8]) -> Result<secp256k1::PublicKey> {
    secp256k1::PublicKey::from_slice(public_key)
        .map_err(|e| InscribeError::InvalidKey(e.to_string()))
}

fn x_only(public_key: &secp256k1::PublicKey) -> XOnlyPublicKey {
    public_key.x_only_public_key().0
}

fn contexts_from_data(
    ctx_data_list: &[InscriptionContextData],
    network: Network,
) -> Result<Vec<InscriptionContext>> {
    ctx_data_list
        .iter()
        .map(|data| InscriptionContext::from_data(data, network))
        .collect()
}

/// Builds the envelopes from the caller's public key, sizes the reveals,
/// and returns the caller-visible context list together with the
/// unsigned, unbalanced commit transaction and the total input value.
#[instrument(skip_all, target = "btc_inscriber")]
#[allow(clippy::too_many_arguments)]
pub fn prepare_commit_tx(
    network: Network,
    inscription_data_list: &[InscriptionPayload],
    commit_tx_prev_output_list: &[PrevOutput],
    reveal_out_value: i64,
    min_change_value: i64,
    reveal_fee_rate: i64,
    change_address: &str,
    public_key: &[u8],
) -> Result<(PreparedInscription, String, i64)> {
    let secp = Secp256k1::new();
    let internal_key = x_only(&parse_public_key(public_key)?);

    let reveal_out_value = if reveal_out_value > 0 {
        reveal_out_value
    } else {
        DEFAULT_REVEAL_OUT_VALUE
    };
    let min_change_value = if min_change_value > 0 {
        min_change_value
    } else {
        DEFAULT_MIN_CHANGE_VALUE
    };

    let destinations: Vec<String> = inscription_data_list
        .iter()
        .map(|payload| payload.reveal_addr.clone())
        .collect();
    let mut contexts = build_contexts(
        network,
        inscription_data_list,
        &EnvelopeKey::ViewOnly(internal_key),
        &secp,
    )?;
    let plan = build_empty_reveal_txs(
        network,
        &destinations,
        &mut contexts,
        reveal_out_value,
        reveal_fee_rate,
    )?;

    let ctx_data_list = contexts
        .iter()
        .zip(&plan.txs)
        .map(|(context, reveal_tx)| {
            Ok(InscriptionContextData {
                commit_tx_address: context.commit_address.to_string(),
                commit_tx_out_pk_script: context.commit_script_pubkey.to_bytes(),
                commit_tx_out_value: context.reveal_prev_output()?.value.to_sat() as i64,
                inscription_script: context.inscription_script.to_bytes(),
                control_block_witness: context.control_block_witness.clone(),
                reveal_tx_out_pk_script: reveal_tx.output[0].script_pubkey.to_bytes(),
                reveal_tx_out_value: reveal_tx.output[0].value.to_sat() as i64,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let prepared = PreparedInscription {
        ctx_data_list,
        reveal_out_value,
        total_reveal_prev_output_value: plan.total_prev_output_value,
        min_change_value,
        commit_addrs: plan.commit_addrs,
    };

    let (mut commit_skeleton, _, total_sender_amount) =
        parse_commit_prev_outputs(network, commit_tx_prev_output_list)?;
    fill_commit_outputs(&mut commit_skeleton, &contexts, change_address, network)?;

    Ok((
        prepared,
        signer::tx_to_hex(&commit_skeleton),
        total_sender_amount,
    ))
}

/// Prepare, dry-sign for size, and balance in one call: returns the
/// context list, the balanced (still unsigned) commit hex and its fee.
/// Fails with `InsufficientBalance` when the inputs cannot cover it.
#[instrument(skip_all, target = "btc_inscriber")]
#[allow(clippy::too_many_arguments)]
pub fn build_commit_tx(
    network: Network,
    inscription_data_list: &[InscriptionPayload],
    commit_tx_prev_output_list: &[PrevOutput],
    reveal_out_value: i64,
    min_change_value: i64,
    commit_fee_rate: i64,
    reveal_fee_rate: i64,
    change_address: &str,
    public_key: &[u8],
) -> Result<(PreparedInscription, String, i64)> {
    let secp = Secp256k1::new();

    let (prepared, prepared_hex, total_sender_amount) = prepare_commit_tx(
        network,
        inscription_data_list,
        commit_tx_prev_output_list,
        reveal_out_value,
        min_change_value,
        reveal_fee_rate,
        change_address,
        public_key,
    )?;

    let skeleton = signer::tx_from_hex(&prepared_hex)?;
    let (_, registry, _) = parse_commit_prev_outputs(network, commit_tx_prev_output_list)?;
    let mut estimate = dry_sign_for_estimate(&skeleton, &registry, &secp)?;
    let balanced = complete_commit_tx(
        &mut estimate,
        total_sender_amount,
        prepared.total_reveal_prev_output_value,
        commit_fee_rate,
        prepared.min_change_value,
    )?;
    let commit_tx_fee = calculate_commit_tx_fee(&balanced, &registry)?;

    Ok((prepared, signer::tx_to_hex(&balanced), commit_tx_fee))
}

/// Per-input sighashes of a serialized commit transaction, for the
/// external signer. Taproot prior outputs are not supported on this path.
pub fn commit_tx_message_hashes(
    network: Network,
    tx_hex: &str,
    commit_tx_prev_output_list: &[PrevOutput],
    public_key: &[u8],
) -> Result<BTreeMap<usize, String>> {
    let tx = signer::tx_from_hex(tx_hex)?;
    let (_, registry, _) = parse_commit_prev_outputs(network, commit_tx_prev_output_list)?;
    signer::message_hashes(&tx, &registry, &parse_public_key(public_key)?)
}

/// Writes externally produced commit signatures (keyed by input index)
/// into the serialized transaction and returns the signed hex.
#[instrument(skip_all, target = "btc_inscriber")]
pub fn build_commit_raw_data(
    network: Network,
    tx_hex: &str,
    commit_tx_prev_output_list: &[PrevOutput],
    signatures: &BTreeMap<usize, String>,
    public_key: &[u8],
) -> Result<String> {
    let mut tx = signer::tx_from_hex(tx_hex)?;
    let (_, registry, _) = parse_commit_prev_outputs(network, commit_tx_prev_output_list)?;
    signer::apply_signatures(&mut tx, signatures, &parse_public_key(public_key)?, &registry)?;
    Ok(signer::tx_to_hex(&tx))
}

/// Rebuilds the reveals against the now-known commit txid. Returns the
/// unsigned reveal hexes, the tapscript sighash of each (the message the
/// external signer must sign), and the per-reveal fees.
#[instrument(skip_all, target = "btc_inscriber")]
pub fn build_reveal_txs(
    network: Network,
    commit_txid: &str,
    ctx_data_list: &[InscriptionContextData],
    reveal_addrs: &[String],
    reveal_fee_rate: i64,
    reveal_out_value: i64,
) -> Result<(Vec<String>, Vec<String>, Vec<i64>)> {
    if reveal_addrs.len() != ctx_data_list.len() {
        return Err(InscribeError::Serialization(format!(
            "{} reveal addresses for {} contexts",
            reveal_addrs.len(),
            ctx_data_list.len()
        )));
    }

    let commit_txid =
        Txid::from_str(commit_txid).map_err(|e| InscribeError::Serialization(e.to_string()))?;
    let mut contexts = contexts_from_data(ctx_data_list, network)?;
    let plan = build_empty_reveal_txs(
        network,
        reveal_addrs,
        &mut contexts,
        reveal_out_value,
        reveal_fee_rate,
    )?;

    let mut reveal_txs = plan.txs;
    let (registry, sighashes) = fill_reveal_txs(&mut reveal_txs, commit_txid, &contexts)?;
    let reveal_tx_fees = calculate_reveal_tx_fees(&reveal_txs, &registry)?;

    Ok((
        reveal_txs.iter().map(signer::tx_to_hex).collect(),
        sighashes.iter().map(hex::encode).collect(),
        reveal_tx_fees,
    ))
}

/// Schnorr-signs serialized reveals with a WIF key over the sighashes
/// returned by [`build_reveal_txs`]. The key must be the one whose public
/// key built the envelopes.
#[instrument(skip_all, target = "btc_inscriber")]
pub fn sign_reveal_txs_with_key(
    network: Network,
    reveal_txs_hex: &[String],
    sighashes_hex: &[String],
    ctx_data_list: &[InscriptionContextData],
    private_key_wif: &str,
) -> Result<Vec<String>> {
    if reveal_txs_hex.len() != ctx_data_list.len() || sighashes_hex.len() != ctx_data_list.len() {
        return Err(InscribeError::Serialization(
            "reveal transactions, sighashes and contexts must align".to_string(),
        ));
    }

    let secp = Secp256k1::new();
    let secret = *SigningKey::from_wif(private_key_wif)?.secret();

    let mut reveal_txs = reveal_txs_hex
        .iter()
        .map(|tx_hex| signer::tx_from_hex(tx_hex))
        .collect::<Result<Vec<_>>>()?;
    let contexts = contexts_from_data(ctx_data_list, network)?
        .into_iter()
        .map(|context| context.with_key(ContextKey::Signing(SigningKey::new(secret))))
        .collect::<Vec<_>>();

    let sighashes = sighashes_hex
        .iter()
        .map(|sighash_hex| {
            let bytes = hex::decode(sighash_hex)?;
            <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| {
                InscribeError::Serialization("sighash must be 32 bytes".to_string())
            })
        })
        .collect::<Result<Vec<_>>>()?;

    sign_reveal_txs(&mut reveal_txs, &sighashes, &contexts, &secp)?;
    Ok(reveal_txs.iter().map(signer::tx_to_hex).collect())
}

/// Applies one externally produced 64-byte Schnorr signature to every
/// reveal in the list. Valid only when the caller produced that signature
/// for each reveal's sighash, which in practice means one reveal per
/// call.
#[instrument(skip_all, target = "btc_inscriber")]
pub fn apply_reveal_signature(
    network: Network,
    reveal_txs_hex: &[String],
    signature_hex: &str,
    ctx_data_list: &[InscriptionContextData],
) -> Result<Vec<String>> {
    if reveal_txs_hex.len() != ctx_data_list.len() {
        return Err(InscribeError::Serialization(
            "reveal transactions and contexts must align".to_string(),
        ));
    }

    let signature_bytes = hex::decode(signature_hex)?;
    let signature = SchnorrSignature::from_slice(&signature_bytes)
        .map_err(|e| InscribeError::Serialization(e.to_string()))?;

    let contexts = contexts_from_data(ctx_data_list, network)?;
    let mut signed = Vec::with_capacity(reveal_txs_hex.len());
    for (tx_hex, context) in reveal_txs_hex.iter().zip(&contexts) {
        let mut tx = signer::tx_from_hex(tx_hex)?;
        tx.input[0].witness = reveal_witness(&signature.serialize(), context);
        signed.push(signer::tx_to_hex(&tx));
    }

    Ok(signed)
}

#[cfg(test)]
mod tests {
    use secp256k1::{Keypair, Message};

    use super::*;
    use crate::inscriber::inscribe;
    use crate::test_utils;
    use crate::types::{InscriptionRequest, Network};

    fn transfer_payload(reveal_addr: String) -> InscriptionPayload {
        InscriptionPayload {
            content_type: "text/plain;charset=utf-8".to_string(),
            body: br#"{"p":"brc-20","op":"transfer","tick":"mpct","amt":"20"}"#.to_vec(),
            reveal_addr,
        }
    }

    fn detached_request(payloads: Vec<InscriptionPayload>) -> InscriptionRequest {
        InscriptionRequest {
            commit_tx_prev_output_list: vec![PrevOutput {
                tx_id: test_utils::txid_hex(0x9e),
                v_out: 0,
                amount: 100_000,
                address: test_utils::p2wpkh_address(1),
                private_key: Some(test_utils::wif(1)),
            }],
            commit_fee_rate: 2,
            reveal_fee_rate: 2,
            inscription_data_list: payloads,
            reveal_out_value: 546,
            change_address: test_utils::p2wpkh_address(1),
            min_change_value: 0,
        }
    }

    fn without_keys(prev_outputs: &[PrevOutput]) -> Vec<PrevOutput> {
        prev_outputs
            .iter()
            .cloned()
            .map(|mut prev_output| {
                prev_output.private_key = None;
                prev_output
            })
            .collect()
    }

    #[test]
    fn detached_flow_matches_integrated_flow() {
        let secp = Secp256k1::new();
        let request = detached_request(vec![transfer_payload(test_utils::p2wpkh_address(2))]);
        let integrated = inscribe(Network::Testnet, &request).unwrap();

        let key = test_utils::signing_key(1);
        let public_key = key.public_key(&secp).serialize();
        let prev_outputs = without_keys(&request.commit_tx_prev_output_list);

        let (prepared, unsigned_commit, _) = build_commit_tx(
            Network::Testnet,
            &request.inscription_data_list,
            &prev_outputs,
            546,
            0,
            2,
            2,
            &request.change_address,
            &public_key,
        )
        .unwrap();
        assert_eq!(prepared.commit_addrs, integrated.commit_addrs);

        let hashes = commit_tx_message_hashes(
            Network::Testnet,
            &unsigned_commit,
            &prev_outputs,
            &public_key,
        )
        .unwrap();
        let signatures = test_utils::sign_hashes_externally(&hashes, key.secret(), &secp);
        let signed_commit = build_commit_raw_data(
            Network::Testnet,
            &unsigned_commit,
            &prev_outputs,
            &signatures,
            &public_key,
        )
        .unwrap();
        assert_eq!(signed_commit, integrated.commit_tx);

        let commit_txid = signer::tx_from_hex(&signed_commit)
            .unwrap()
            .compute_txid()
            .to_string();
        let reveal_addrs: Vec<String> = request
            .inscription_data_list
            .iter()
            .map(|payload| payload.reveal_addr.clone())
            .collect();
        let (unsigned_reveals, sighashes, reveal_fees) = build_reveal_txs(
            Network::Testnet,
            &commit_txid,
            &prepared.ctx_data_list,
            &reveal_addrs,
            2,
            prepared.reveal_out_value,
        )
        .unwrap();
        assert_eq!(reveal_fees, integrated.reveal_tx_fees);

        let digest: [u8; 32] = hex::decode(&sighashes[0]).unwrap().try_into().unwrap();
        let keypair = Keypair::from_secret_key(&secp, key.secret());
        let signature = secp.sign_schnorr_no_aux_rand(&Message::from_digest(digest), &keypair);
        let signed_reveals = apply_reveal_signature(
            Network::Testnet,
            &unsigned_reveals,
            &hex::encode(signature.serialize()),
            &prepared.ctx_data_list,
        )
        .unwrap();
        assert_eq!(signed_reveals, integrated.reveal_txs);
    }

    #[test]
    fn key_signed_detached_reveals_match_integrated() {
        let secp = Secp256k1::new();
        let request = detached_request(vec![
            transfer_payload(test_utils::p2wpkh_address(2)),
            transfer_payload(test_utils::p2pkh_address(3)),
        ]);
        let integrated = inscribe(Network::Testnet, &request).unwrap();

        let public_key = test_utils::signing_key(1).public_key(&secp).serialize();
        let prev_outputs = without_keys(&request.commit_tx_prev_output_list);
        let (prepared, unsigned_commit, _) = build_commit_tx(
            Network::Testnet,
            &request.inscription_data_list,
            &prev_outputs,
            546,
            0,
            2,
            2,
            &request.change_address,
            &public_key,
        )
        .unwrap();

        let hashes = commit_tx_message_hashes(
            Network::Testnet,
            &unsigned_commit,
            &prev_outputs,
            &public_key,
        )
        .unwrap();
        let signatures = test_utils::sign_hashes_externally(
            &hashes,
            test_utils::signing_key(1).secret(),
            &secp,
        );
        let signed_commit = build_commit_raw_data(
            Network::Testnet,
            &unsigned_commit,
            &prev_outputs,
            &signatures,
            &public_key,
        )
        .unwrap();
        let commit_txid = signer::tx_from_hex(&signed_commit)
            .unwrap()
            .compute_txid()
            .to_string();

        let reveal_addrs: Vec<String> = request
            .inscription_data_list
            .iter()
            .map(|payload| payload.reveal_addr.clone())
            .collect();
        let (unsigned_reveals, sighashes, _) = build_reveal_txs(
            Network::Testnet,
            &commit_txid,
            &prepared.ctx_data_list,
            &reveal_addrs,
            2,
            prepared.reveal_out_value,
        )
        .unwrap();

        let signed_reveals = sign_reveal_txs_with_key(
            Network::Testnet,
            &unsigned_reveals,
            &sighashes,
            &prepared.ctx_data_list,
            &test_utils::wif(1),
        )
        .unwrap();
        assert_eq!(signed_reveals, integrated.reveal_txs);
    }

    #[test]
    fn prepared_contexts_round_trip_through_json() {
        let secp = Secp256k1::new();
        let public_key = test_utils::signing_key(1).public_key(&secp).serialize();
        let (prepared, _, total_sender_amount) = prepare_commit_tx(
            Network::Testnet,
            &[transfer_payload(test_utils::p2tr_address(2))],
            &[PrevOutput {
                tx_id: test_utils::txid_hex(0x9e),
                v_out: 0,
                amount: 22_000,
                address: test_utils::p2pkh_address(1),
                private_key: None,
            }],
            0,
            805,
            2,
            &test_utils::p2pkh_address(1),
            &public_key,
        )
        .unwrap();

        assert_eq!(total_sender_amount, 22_000);
        assert_eq!(prepared.reveal_out_value, 546);
        assert_eq!(prepared.min_change_value, 805);
        assert_eq!(prepared.ctx_data_list.len(), 1);
        assert_eq!(prepared.commit_addrs.len(), 1);
        assert_eq!(
            prepared.ctx_data_list[0].commit_tx_address,
            prepared.commit_addrs[0]
        );
        assert!(
            prepared.ctx_data_list[0].commit_tx_out_value
                > prepared.ctx_data_list[0].reveal_tx_out_value
        );

        let json = serde_json::to_string(&prepared).unwrap();
        let round_trip: PreparedInscription = serde_json::from_str(&json).unwrap();
        assert_eq!(round_trip, prepared);
    }

    #[test]
    fn malformed_reveal_signature_is_rejected() {
        let secp = Secp256k1::new();
        let public_key = test_utils::signing_key(1).public_key(&secp).serialize();
        let request = detached_request(vec![transfer_payload(test_utils::p2wpkh_address(2))]);
        let prev_outputs = without_keys(&request.commit_tx_prev_output_list);
        let (prepared, _, _) = build_commit_tx(
            Network::Testnet,
            &request.inscription_data_list,
            &prev_outputs,
            546,
            0,
            2,
            2,
            &request.change_address,
            &public_key,
        )
        .unwrap();
        let (unsigned_reveals, _, _) = build_reveal_txs(
            Network::Testnet,
            &test_utils::txid_hex(0x77),
            &prepared.ctx_data_list,
            &[test_utils::p2wpkh_address(2)],
            2,
            546,
        )
        .unwrap();

        let result = apply_reveal_signature(
            Network::Testnet,
            &unsigned_reveals,
            "deadbeef",
            &prepared.ctx_data_list,
        );
        assert!(matches!(result, Err(InscribeError::Serialization(_))));
    }
}

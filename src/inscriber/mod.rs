//! Commit/reveal construction: sizes the reveals, assembles and balances
//! the commit, signs both, and exposes the end-to-end [`inscribe`] entry
//! point. The detached (external-signer) workflow lives in [`detached`].

use std::str::FromStr;

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::sighash::{Prevouts, SighashCache};
use bitcoin::taproot::LeafVersion;
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, Network, OutPoint, ScriptBuf, Sequence, TapLeafHash, TapSighashType, Transaction,
    TxIn, TxOut, Txid, Witness,
};
use lazy_static::lazy_static;
use secp256k1::{All, Keypair, Message, Secp256k1, SecretKey, XOnlyPublicKey};
use tracing::{debug, instrument};

use crate::addresses::address_to_script_pubkey;
use crate::signer::{self, PrevOutRegistry, SigningKey};
use crate::types::{
    InscribeError, InscribeTxs, InscriptionPayload, InscriptionRequest, Result,
    MAX_STANDARD_TX_WEIGHT,
};

pub(crate) mod context;
pub mod detached;
pub(crate) mod fee;
pub(crate) mod script_builder;

use context::{ContextKey, InscriptionContext};
use script_builder::InscriptionCommitment;

lazy_static! {
    /// Key used only to dry-sign skeletons while measuring virtual size;
    /// its signatures never reach a final transaction.
    static ref ESTIMATION_SECRET: SecretKey =
        SecretKey::from_slice(&[0xAB; 32]).expect("constant estimation key is valid");
}

/// Key material the envelope stage starts from.
pub(crate) enum EnvelopeKey {
    Signing(SecretKey),
    ViewOnly(XOnlyPublicKey),
}

/// What the reveal sizer produced: the unsigned reveal transactions and
/// the amounts the commit has to fund.
pub(crate) struct RevealPlan {
    pub txs: Vec<Transaction>,
    pub total_prev_output_value: i64,
    pub must_fees: Vec<i64>,
    pub commit_addrs: Vec<String>,
}

fn non_final_input(previous_output: OutPoint) -> TxIn {
    TxIn {
        previous_output,
        script_sig: ScriptBuf::default(),
        sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
        witness: Witness::default(),
    }
}

fn empty_v2_tx() -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: Vec::new(),
        output: Vec::new(),
    }
}

/// Builds one frozen context per payload: envelope leaf, commit address
/// and scriptPubKey, control block.
pub(crate) fn build_contexts(
    network: Network,
    payloads: &[InscriptionPayload],
    key: &EnvelopeKey,
    secp: &Secp256k1<All>,
) -> Result<Vec<InscriptionContext>> {
    let internal_key = match key {
        EnvelopeKey::Signing(secret) => {
            secp256k1::PublicKey::from_secret_key(secp, secret)
                .x_only_public_key()
                .0
        }
        EnvelopeKey::ViewOnly(x_only) => *x_only,
    };

    payloads
        .iter()
        .map(|payload| {
            let commitment = InscriptionCommitment::new(payload, secp, internal_key, network)?;
            Ok(InscriptionContext {
                key: match key {
                    EnvelopeKey::Signing(secret) => ContextKey::Signing(SigningKey::new(*secret)),
                    EnvelopeKey::ViewOnly(x_only) => ContextKey::ViewOnly(*x_only),
                },
                inscription_script: commitment.inscription_script,
                commit_address: commitment.commit_address,
                commit_script_pubkey: commitment.commit_script_pubkey,
                control_block_witness: commitment.control_block_witness,
                reveal_prev_output: None,
            })
        })
        .collect()
}

/// Sizes the reveals: builds each unsigned single-input/single-output
/// reveal (the commit txid is a placeholder until the commit hash is
/// known) and computes the exact value commit output *i* must hold.
pub(crate) fn build_empty_reveal_txs(
    network: Network,
    destinations: &[String],
    contexts: &mut [InscriptionContext],
    reveal_out_value: i64,
    reveal_fee_rate: i64,
) -> Result<RevealPlan> {
    let mut txs = Vec::with_capacity(contexts.len());
    let mut must_fees = Vec::with_capacity(contexts.len());
    let mut commit_addrs = Vec::with_capacity(contexts.len());
    let mut total_prev_output_value = 0i64;

    for (index, context) in contexts.iter_mut().enumerate() {
        let mut tx = empty_v2_tx();
        tx.input.push(non_final_input(OutPoint {
            txid: Txid::all_zeros(),
            vout: index as u32,
        }));
        tx.output.push(TxOut {
            value: Amount::from_sat(reveal_out_value as u64),
            script_pubkey: address_to_script_pubkey(&destinations[index], network)?,
        });

        let base_fee = tx.total_size() as i64 * reveal_fee_rate;
        let witness_fee =
            fee::reveal_witness_fee(context.inscription_script.len(), reveal_fee_rate);
        let required = reveal_out_value + base_fee + witness_fee;

        context.reveal_prev_output = Some(TxOut {
            value: Amount::from_sat(required as u64),
            script_pubkey: context.commit_script_pubkey.clone(),
        });

        total_prev_output_value += required;
        must_fees.push(base_fee + witness_fee);
        commit_addrs.push(context.commit_address.to_string());
        txs.push(tx);
    }

    Ok(RevealPlan {
        txs,
        total_prev_output_value,
        must_fees,
        commit_addrs,
    })
}

/// Turns the prior outputs into commit inputs plus a prevout registry,
/// accumulating the total spendable amount.
pub(crate) fn parse_commit_prev_outputs(
    network: Network,
    prev_outputs: &[crate::types::PrevOutput],
) -> Result<(Transaction, PrevOutRegistry, i64)> {
    let mut tx = empty_v2_tx();
    let mut registry = PrevOutRegistry::new();
    let mut total_sender_amount = 0i64;

    for prev_output in prev_outputs {
        let txid = Txid::from_str(&prev_output.tx_id)
            .map_err(|e| InscribeError::Serialization(e.to_string()))?;
        let outpoint = OutPoint {
            txid,
            vout: prev_output.v_out,
        };
        registry.insert(
            outpoint,
            TxOut {
                value: Amount::from_sat(prev_output.amount.max(0) as u64),
                script_pubkey: address_to_script_pubkey(&prev_output.address, network)?,
            },
        );
        tx.input.push(non_final_input(outpoint));
        total_sender_amount += prev_output.amount;
    }

    Ok((tx, registry, total_sender_amount))
}

/// Appends one commit output per inscription (in submission order) and a
/// zero-valued change output at the tail; the balancer fills or drops the
/// tail later.
pub(crate) fn fill_commit_outputs(
    tx: &mut Transaction,
    contexts: &[InscriptionContext],
    change_address: &str,
    network: Network,
) -> Result<()> {
    let change_script = address_to_script_pubkey(change_address, network)?;

    for context in contexts {
        tx.output.push(context.reveal_prev_output()?.clone());
    }
    tx.output.push(TxOut {
        value: Amount::ZERO,
        script_pubkey: change_script,
    });

    Ok(())
}

/// Signs a copy of the skeleton with the estimation key so the measured
/// virtual size carries realistic witness weight.
pub(crate) fn dry_sign_for_estimate(
    tx: &Transaction,
    prevouts: &PrevOutRegistry,
    secp: &Secp256k1<All>,
) -> Result<Transaction> {
    let mut estimate = tx.clone();
    let keys: Vec<SigningKey> = (0..estimate.input.len())
        .map(|_| SigningKey::new(*ESTIMATION_SECRET))
        .collect();
    signer::sign_inputs(&mut estimate, &keys, prevouts, secp)?;
    Ok(estimate)
}

/// Balances the commit against the fee rate measured on the dry-signed
/// estimate: fills the change output, drops it below the minimum, and
/// fails with the required fee when the inputs cannot cover the outputs.
pub(crate) fn complete_commit_tx(
    estimate: &mut Transaction,
    total_sender_amount: i64,
    total_reveal_prev_output_value: i64,
    commit_fee_rate: i64,
    min_change_value: i64,
) -> Result<Transaction> {
    let mut tx = estimate.clone();

    let fee = fee::transaction_vsize(estimate) * commit_fee_rate;
    let change_amount = total_sender_amount - total_reveal_prev_output_value - fee;
    debug!(fee, change_amount, "balancing commit transaction");

    if change_amount >= min_change_value {
        let change_output = tx
            .output
            .last_mut()
            .ok_or_else(|| InscribeError::ScriptBuild("commit has no outputs".to_string()))?;
        change_output.value = Amount::from_sat(change_amount as u64);
    } else {
        let _ = tx.output.pop();
        if change_amount < 0 {
            let _ = estimate.output.pop();
            let fee_without_change = fee::transaction_vsize(estimate) * commit_fee_rate;
            if total_sender_amount - total_reveal_prev_output_value - fee_without_change < 0 {
                return Err(InscribeError::InsufficientBalance {
                    must_commit_fee: fee,
                });
            }
        }
    }

    Ok(tx)
}

/// Patches the reveals with the now-known commit txid and computes each
/// tapscript sighash (`SIGHASH_DEFAULT`, leaf version 0xc0).
pub(crate) fn fill_reveal_txs(
    reveal_txs: &mut [Transaction],
    commit_txid: Txid,
    contexts: &[InscriptionContext],
) -> Result<(PrevOutRegistry, Vec<[u8; 32]>)> {
    if reveal_txs.len() != contexts.len() {
        return Err(InscribeError::Serialization(format!(
            "{} reveal transactions for {} contexts",
            reveal_txs.len(),
            contexts.len()
        )));
    }

    let mut registry = PrevOutRegistry::new();
    for (index, context) in contexts.iter().enumerate() {
        registry.insert(
            OutPoint {
                txid: commit_txid,
                vout: index as u32,
            },
            context.reveal_prev_output()?.clone(),
        );
        reveal_txs[index].input[0].previous_output.txid = commit_txid;
    }

    let mut sighashes = Vec::with_capacity(contexts.len());
    for (index, context) in contexts.iter().enumerate() {
        let prev_output = context.reveal_prev_output()?.clone();
        let mut cache = SighashCache::new(&reveal_txs[index]);
        let sighash = cache
            .taproot_script_spend_signature_hash(
                0,
                &Prevouts::All(&[prev_output]),
                TapLeafHash::from_script(&context.inscription_script, LeafVersion::TapScript),
                TapSighashType::Default,
            )
            .map_err(|e| InscribeError::Serialization(e.to_string()))?;
        sighashes.push(sighash.to_byte_array());
    }

    Ok((registry, sighashes))
}

/// `[signature, envelope, control block]`
pub(crate) fn reveal_witness(signature: &[u8], context: &InscriptionContext) -> Witness {
    let mut witness = Witness::new();
    witness.push(signature);
    witness.push(context.inscription_script.as_bytes());
    witness.push(&context.control_block_witness);
    witness
}

/// Schnorr-signs each reveal with its context key. Script-path spends
/// sign with the untweaked key; the control block proves leaf membership.
pub(crate) fn sign_reveal_txs(
    reveal_txs: &mut [Transaction],
    sighashes: &[[u8; 32]],
    contexts: &[InscriptionContext],
    secp: &Secp256k1<All>,
) -> Result<()> {
    for (index, context) in contexts.iter().enumerate() {
        let key = context.key.signing()?;
        let keypair = Keypair::from_secret_key(secp, key.secret());
        let message = Message::from_digest(sighashes[index]);
        let signature = bitcoin::taproot::Signature {
            signature: secp.sign_schnorr_no_aux_rand(&message, &keypair),
            sighash_type: TapSighashType::Default,
        };
        reveal_txs[index].input[0].witness = reveal_witness(&signature.to_vec(), context);
    }

    Ok(())
}

/// Rejects any reveal above the standardness weight ceiling.
pub(crate) fn check_reveal_txs(reveal_txs: &[Transaction]) -> Result<()> {
    for (index, tx) in reveal_txs.iter().enumerate() {
        let weight = fee::transaction_weight(tx) as u64;
        if weight > MAX_STANDARD_TX_WEIGHT {
            return Err(InscribeError::WeightExceeded { index, weight });
        }
    }
    Ok(())
}

pub(crate) fn calculate_commit_tx_fee(
    tx: &Transaction,
    prevouts: &PrevOutRegistry,
) -> Result<i64> {
    let mut fee = 0i64;
    for input in &tx.input {
        fee += prevouts.fetch(&input.previous_output)?.value.to_sat() as i64;
    }
    for output in &tx.output {
        fee -= output.value.to_sat() as i64;
    }
    Ok(fee)
}

pub(crate) fn calculate_reveal_tx_fees(
    reveal_txs: &[Transaction],
    prevouts: &PrevOutRegistry,
) -> Result<Vec<i64>> {
    reveal_txs
        .iter()
        .map(|tx| {
            let funded = prevouts.fetch(&tx.input[0].previous_output)?.value.to_sat() as i64;
            Ok(funded - tx.output[0].value.to_sat() as i64)
        })
        .collect()
}

/// End-to-end flow: builds, balances and signs the commit and every
/// reveal with in-process keys.
///
/// When the prior outputs cannot cover the outputs plus fee, the call
/// succeeds with an empty `commit_tx` and the fee fields reporting what
/// would have been required, so the caller can top up.
#[instrument(skip_all, target = "btc_inscriber")]
pub fn inscribe(network: Network, request: &InscriptionRequest) -> Result<InscribeTxs> {
    let secp = Secp256k1::new();

    let mut keys = Vec::with_capacity(request.commit_tx_prev_output_list.len());
    for prev_output in &request.commit_tx_prev_output_list {
        let wif = prev_output.private_key.as_deref().ok_or_else(|| {
            InscribeError::InvalidKey("prior output is missing its private key".to_string())
        })?;
        keys.push(SigningKey::from_wif(wif)?);
    }
    let first_secret = *keys
        .first()
        .ok_or_else(|| InscribeError::InvalidKey("no prior outputs provided".to_string()))?
        .secret();

    let reveal_out_value = request.effective_reveal_out_value();
    let min_change_value = request.effective_min_change_value();
    let destinations: Vec<String> = request
        .inscription_data_list
        .iter()
        .map(|payload| payload.reveal_addr.clone())
        .collect();

    let mut contexts = build_contexts(
        network,
        &request.inscription_data_list,
        &EnvelopeKey::Signing(first_secret),
        &secp,
    )?;
    let plan = build_empty_reveal_txs(
        network,
        &destinations,
        &mut contexts,
        reveal_out_value,
        request.reveal_fee_rate,
    )?;
    debug!(
        inscriptions = contexts.len(),
        required = plan.total_prev_output_value,
        "reveal transactions sized"
    );

    let (mut commit_skeleton, commit_prevouts, total_sender_amount) =
        parse_commit_prev_outputs(network, &request.commit_tx_prev_output_list)?;
    fill_commit_outputs(
        &mut commit_skeleton,
        &contexts,
        &request.change_address,
        network,
    )?;

    let mut estimate = dry_sign_for_estimate(&commit_skeleton, &commit_prevouts, &secp)?;
    let mut commit_tx = match complete_commit_tx(
        &mut estimate,
        total_sender_amount,
        plan.total_prev_output_value,
        request.commit_fee_rate,
        min_change_value,
    ) {
        Ok(tx) => tx,
        Err(InscribeError::InsufficientBalance { must_commit_fee }) => {
            debug!(must_commit_fee, "inputs cannot cover outputs plus fee");
            return Ok(InscribeTxs {
                commit_tx: String::new(),
                reveal_txs: Vec::new(),
                commit_tx_fee: must_commit_fee,
                reveal_tx_fees: plan.must_fees,
                commit_addrs: plan.commit_addrs,
            });
        }
        Err(error) => return Err(error),
    };

    signer::sign_inputs(&mut commit_tx, &keys, &commit_prevouts, &secp)?;
    let commit_tx_fee = calculate_commit_tx_fee(&commit_tx, &commit_prevouts)?;
    let commit_txid = commit_tx.compute_txid();
    debug!(%commit_txid, commit_tx_fee, "commit transaction signed");

    let mut reveal_txs = plan.txs;
    let (reveal_prevouts, sighashes) = fill_reveal_txs(&mut reveal_txs, commit_txid, &contexts)?;
    sign_reveal_txs(&mut reveal_txs, &sighashes, &contexts, &secp)?;
    check_reveal_txs(&reveal_txs)?;
    let reveal_tx_fees = calculate_reveal_tx_fees(&reveal_txs, &reveal_prevouts)?;

    Ok(InscribeTxs {
        commit_tx: signer::tx_to_hex(&commit_tx),
        reveal_txs: reveal_txs.iter().map(signer::tx_to_hex).collect(),
        commit_tx_fee,
        reveal_tx_fees,
        commit_addrs: plan.commit_addrs,
    })
}

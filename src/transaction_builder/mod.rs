//! Plain transfer construction: unsigned spend-to-address transactions
//! over the same prior-output model, signable through the detached
//! commit-signing surface.

use std::collections::BTreeMap;

use bitcoin::transaction::Version;
use bitcoin::{Amount, Network, OutPoint, Transaction, TxOut, Txid};
use tracing::{debug, instrument};

use crate::addresses::address_to_script_pubkey;
use crate::inscriber::parse_commit_prev_outputs;
use crate::signer::{self, PrevOutRegistry};
use crate::types::{InscribeError, PrevOutput, Result};

// Approximate serialized sizes used to reserve a fee when a change
// output is requested.
const TX_OVERHEAD_SIZE: i64 = 10; // version + locktime
const INPUT_SIZE: i64 = 148;
const OUTPUT_SIZE: i64 = 34;

struct TransferOutput {
    address: String,
    amount: i64,
}

struct ChangeRequest {
    address: String,
    fee_rate: i64,
}

/// An unsigned transfer bundled with the prevouts it spends and the
/// total input value, everything the signing calls need.
#[derive(Clone, Debug)]
pub struct UnsignedTransferTx {
    pub tx: Transaction,
    pub txid: Txid,
    pub utxos: Vec<(OutPoint, TxOut)>,
    pub total_input_amount: i64,
}

/// Accumulates inputs and recipient outputs for a plain transfer, then
/// produces the unsigned transaction and the per-input message hashes an
/// external signer needs.
pub struct TransferTxBuilder {
    version: i32,
    network: Network,
    inputs: Vec<PrevOutput>,
    outputs: Vec<TransferOutput>,
    change: Option<ChangeRequest>,
}

impl TransferTxBuilder {
    pub fn new(version: i32, network: Network) -> Self {
        Self {
            version,
            network,
            inputs: Vec::new(),
            outputs: Vec::new(),
            change: None,
        }
    }

    pub fn add_input(&mut self, tx_id: String, v_out: u32, address: String, amount: i64) {
        self.inputs.push(PrevOutput {
            tx_id,
            v_out,
            amount,
            address,
            private_key: None,
        });
    }

    pub fn add_output(&mut self, address: String, amount: i64) {
        self.outputs.push(TransferOutput { address, amount });
    }

    /// Sends whatever the inputs leave over, less a fee reserved at
    /// `fee_rate` sat/vB, back to `address` as a trailing output.
    pub fn with_change(&mut self, address: String, fee_rate: i64) {
        self.change = Some(ChangeRequest { address, fee_rate });
    }

    /// The inputs in builder form, as the detached signing calls expect
    /// them.
    pub fn prev_outputs(&self) -> &[PrevOutput] {
        &self.inputs
    }

    /// Builds the unsigned transaction: RBF-signalling inputs in
    /// insertion order, recipient outputs in insertion order, then the
    /// change output when one was requested and any value is left for
    /// it. Fails with `InsufficientBalance` when the inputs cannot cover
    /// the recipients plus the reserved fee.
    #[instrument(skip(self), target = "btc_inscriber")]
    pub fn build(&self) -> Result<UnsignedTransferTx> {
        debug!(
            inputs = self.inputs.len(),
            outputs = self.outputs.len(),
            "building unsigned transfer"
        );

        let (mut tx, registry, total_input_amount) =
            parse_commit_prev_outputs(self.network, &self.inputs)?;
        tx.version = Version(self.version);

        let mut total_output_amount = 0i64;
        for output in &self.outputs {
            total_output_amount += output.amount;
            tx.output.push(TxOut {
                value: Amount::from_sat(output.amount.max(0) as u64),
                script_pubkey: address_to_script_pubkey(&output.address, self.network)?,
            });
        }

        if let Some(change) = &self.change {
            let fee = self.estimate_fee(
                self.inputs.len() as i64,
                self.outputs.len() as i64 + 1,
                change.fee_rate,
            );
            let change_amount = total_input_amount - total_output_amount - fee;
            if change_amount < 0 {
                return Err(InscribeError::InsufficientBalance {
                    must_commit_fee: fee,
                });
            }
            if change_amount > 0 {
                tx.output.push(TxOut {
                    value: Amount::from_sat(change_amount as u64),
                    script_pubkey: address_to_script_pubkey(&change.address, self.network)?,
                });
            }
        }

        let ordered = registry.ordered_for(&tx)?;
        let utxos: Vec<(OutPoint, TxOut)> = tx
            .input
            .iter()
            .map(|input| input.previous_output)
            .zip(ordered)
            .collect();
        let txid = tx.compute_txid();
        debug!(%txid, "unsigned transfer built");

        Ok(UnsignedTransferTx {
            tx,
            txid,
            utxos,
            total_input_amount,
        })
    }

    /// Unsigned hex plus the sighash each input's owner must sign.
    #[instrument(skip(self, public_key), target = "btc_inscriber")]
    pub fn build_with_message_hashes(
        &self,
        public_key: &[u8],
    ) -> Result<(String, BTreeMap<usize, String>)> {
        let unsigned = self.build()?;

        let mut registry = PrevOutRegistry::new();
        for (outpoint, txout) in &unsigned.utxos {
            registry.insert(*outpoint, txout.clone());
        }
        let public_key = secp256k1::PublicKey::from_slice(public_key)
            .map_err(|e| InscribeError::InvalidKey(e.to_string()))?;
        let hashes = signer::message_hashes(&unsigned.tx, &registry, &public_key)?;

        Ok((signer::tx_to_hex(&unsigned.tx), hashes))
    }

    fn estimate_fee(&self, input_count: i64, output_count: i64, fee_rate: i64) -> i64 {
        let total_size = TX_OVERHEAD_SIZE + INPUT_SIZE * input_count + OUTPUT_SIZE * output_count;
        total_size * fee_rate
    }
}

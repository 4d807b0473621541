//! Builds the commit/reveal transaction pairs that inscribe arbitrary
//! content (for example BRC-20 payloads) onto satoshis through taproot
//! script-path spends, with both in-process and external-signer
//! workflows.

mod addresses;
mod inscriber;
mod signer;
mod transaction_builder;
mod types;

#[cfg(test)]
mod test_utils;

pub use addresses::{
    address_to_script_pubkey, pay_to_pubkey_hash_script, pay_to_witness_pubkey_hash_script,
    public_key_to_address, AddressKind,
};
pub use inscriber::detached::{
    apply_reveal_signature, build_commit_raw_data, build_commit_tx, build_reveal_txs,
    commit_tx_message_hashes, prepare_commit_tx, sign_reveal_txs_with_key,
};
pub use inscriber::inscribe;
pub use transaction_builder::{TransferTxBuilder, UnsignedTransferTx};
pub use types::{
    parse_network, InscribeError, InscribeTxs, InscriptionContextData, InscriptionPayload,
    InscriptionRequest, Network, PreparedInscription, PrevOutput, Result,
    DEFAULT_MIN_CHANGE_VALUE, DEFAULT_REVEAL_OUT_VALUE, DEFAULT_SEQUENCE_NUM, DEFAULT_TX_VERSION,
    MAX_STANDARD_TX_WEIGHT,
};

use bitcoin::key::UntweakedPublicKey;
use bitcoin::opcodes::{all, OP_0, OP_FALSE};
use bitcoin::script::{Builder as ScriptBuilder, PushBytesBuf};
use bitcoin::secp256k1::{Secp256k1, Signing, Verification};
use bitcoin::taproot::{LeafVersion, TaprootBuilder};
use bitcoin::{Address, Network, ScriptBuf};

use crate::types::{InscribeError, InscriptionPayload, Result};

/// Envelope protocol tag; the leaf is recognized by indexers through it.
const PROTOCOL_ID: &[u8; 3] = b"ord";

/// Standard script push limit; bodies are split into chunks of this size.
const MAX_CHUNK_SIZE: usize = 520;

/// Everything derived from one inscription payload: the tapscript leaf
/// carrying it, the commit output that pays to the leaf's taproot tree,
/// and the control block that later proves leaf membership.
pub(crate) struct InscriptionCommitment {
    pub inscription_script: ScriptBuf,
    pub commit_address: Address,
    pub commit_script_pubkey: ScriptBuf,
    pub control_block_witness: Vec<u8>,
}

impl InscriptionCommitment {
    /// Builds the envelope leaf for `payload` and commits to it under
    /// `internal_key`:
    ///
    /// ```text
    /// <xonly-pubkey> OP_CHECKSIG
    /// OP_FALSE OP_IF
    ///   "ord"
    ///   0x01 0x01 <content-type>
    ///   OP_0
    ///   <body chunk 1> .. <body chunk N>
    /// OP_ENDIF
    /// ```
    pub fn new<C: Signing + Verification>(
        payload: &InscriptionPayload,
        secp: &Secp256k1<C>,
        internal_key: UntweakedPublicKey,
        network: Network,
    ) -> Result<Self> {
        let serialized_pubkey = internal_key.serialize();
        let mut encoded_pubkey = PushBytesBuf::with_capacity(serialized_pubkey.len());
        encoded_pubkey
            .extend_from_slice(&serialized_pubkey)
            .map_err(|e| InscribeError::ScriptBuild(e.to_string()))?;

        let mut content_type = PushBytesBuf::with_capacity(payload.content_type.len());
        content_type
            .extend_from_slice(payload.content_type.as_bytes())
            .map_err(|e| InscribeError::ScriptBuild(e.to_string()))?;

        let mut builder = ScriptBuilder::new()
            .push_slice(encoded_pubkey.as_push_bytes())
            .push_opcode(all::OP_CHECKSIG)
            .push_opcode(OP_FALSE)
            .push_opcode(all::OP_IF)
            .push_slice(*PROTOCOL_ID)
            .push_slice([1u8])
            .push_slice(content_type)
            .push_opcode(OP_0);

        // Tapscripts carry no script-size cap, so arbitrarily long bodies
        // are fine as long as each push stays within the element limit.
        for chunk in payload.body.chunks(MAX_CHUNK_SIZE) {
            let mut encoded_chunk = PushBytesBuf::with_capacity(chunk.len());
            encoded_chunk
                .extend_from_slice(chunk)
                .map_err(|e| InscribeError::ScriptBuild(e.to_string()))?;
            builder = builder.push_slice(encoded_chunk);
        }

        let inscription_script = builder.push_opcode(all::OP_ENDIF).into_script();

        let taproot_spend_info = TaprootBuilder::new()
            .add_leaf(0, inscription_script.clone())
            .map_err(|e| InscribeError::ScriptBuild(e.to_string()))?
            .finalize(secp, internal_key)
            .map_err(|_| InscribeError::ScriptBuild("taproot tree finalization".to_string()))?;

        let commit_address = Address::p2tr_tweaked(taproot_spend_info.output_key(), network);
        let commit_script_pubkey = commit_address.script_pubkey();

        let control_block = taproot_spend_info
            .control_block(&(inscription_script.clone(), LeafVersion::TapScript))
            .ok_or_else(|| InscribeError::ScriptBuild("missing control block".to_string()))?;

        Ok(Self {
            inscription_script,
            commit_address,
            commit_script_pubkey,
            control_block_witness: control_block.serialize(),
        })
    }
}

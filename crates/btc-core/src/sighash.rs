//! Legacy transaction signature hashing.

use crate::script::remove_code_separators;
use crate::{Sha256dHash, Transaction, TxOutput};
use bytes::BufMut;

/// Sign all inputs and outputs.
pub const SIGHASH_ALL: u32 = 1;
/// Sign no outputs: anyone may spend them.
pub const SIGHASH_NONE: u32 = 2;
/// Sign only the output paired with the signing input.
pub const SIGHASH_SINGLE: u32 = 3;
/// Modifier: sign only the signing input, allowing others to be added.
pub const SIGHASH_ANYONECANPAY: u32 = 0x80;

impl Transaction {
    /// Compute the digest that a signature on `input_index` commits to.
    ///
    /// Implements the original sighash procedure: every input's script is
    /// blanked except the signing one, which receives `subscript` with any
    /// `OP_CODESEPARATOR` removed; outputs and counterpart sequence numbers
    /// are adjusted per the mode bits; the little-endian sighash type is
    /// appended and the whole double-SHA256d.
    ///
    /// As in the reference client, a `SIGHASH_SINGLE` signature on an input
    /// index with no matching output hashes to the number one.
    pub fn hash_for_signature(
        &self,
        input_index: usize,
        subscript: &[u8],
        sighash_type: u32,
    ) -> Sha256dHash {
        let mode = sighash_type & 0x1F;

        // Reference-client quirk: out-of-range SIGHASH_SINGLE signs the
        // value 1 rather than failing.
        if mode == SIGHASH_SINGLE && input_index >= self.outputs().len() {
            let mut one = [0u8; 32];
            one[0] = 1;
            return Sha256dHash::from_bytes(one);
        }

        let mut tx = self.uncached_clone();
        let signing_script = remove_code_separators(subscript);

        {
            let inputs = tx.inputs_raw_mut();
            for (i, input) in inputs.iter_mut().enumerate() {
                input.script_sig = if i == input_index {
                    signing_script.clone()
                } else {
                    Vec::new()
                };
            }
        }

        match mode {
            SIGHASH_NONE => {
                tx.outputs_raw_mut().clear();
                for (i, input) in tx.inputs_raw_mut().iter_mut().enumerate() {
                    if i != input_index {
                        input.sequence = 0;
                    }
                }
            }
            SIGHASH_SINGLE => {
                let outputs = tx.outputs_raw_mut();
                outputs.truncate(input_index + 1);
                for output in outputs.iter_mut().take(input_index) {
                    *output = TxOutput::new(-1, Vec::new());
                }
                for (i, input) in tx.inputs_raw_mut().iter_mut().enumerate() {
                    if i != input_index {
                        input.sequence = 0;
                    }
                }
            }
            _ => {}
        }

        if sighash_type & SIGHASH_ANYONECANPAY != 0 {
            let signing = tx.inputs_raw_mut()[input_index].clone();
            let inputs = tx.inputs_raw_mut();
            inputs.clear();
            inputs.push(signing);
        }

        let mut buf = Vec::new();
        tx.write_fields(&mut buf);
        buf.put_u32_le(sighash_type);
        Sha256dHash::hash(&buf)
    }
}

//! Script byte-level utilities and the verification oracle.
//!
//! Script *execution* is an external collaborator: the chain engine calls a
//! [`ScriptVerifier`] and treats it as a pure oracle. What lives here is the
//! byte-level knowledge the rest of the library needs: walking a script's
//! operations, stripping `OP_CODESEPARATOR` for signature hashing, and the
//! legacy signature-operation count.

use crate::Transaction;
use thiserror::Error;

/// `OP_CODESEPARATOR`.
const OP_CODESEPARATOR: u8 = 0xAB;
/// `OP_CHECKSIG`.
const OP_CHECKSIG: u8 = 0xAC;
/// `OP_CHECKSIGVERIFY`.
const OP_CHECKSIGVERIFY: u8 = 0xAD;
/// `OP_CHECKMULTISIG`.
const OP_CHECKMULTISIG: u8 = 0xAE;
/// `OP_CHECKMULTISIGVERIFY`.
const OP_CHECKMULTISIGVERIFY: u8 = 0xAF;
/// `OP_PUSHDATA1`.
const OP_PUSHDATA1: u8 = 0x4C;
/// `OP_PUSHDATA2`.
const OP_PUSHDATA2: u8 = 0x4D;
/// `OP_PUSHDATA4`.
const OP_PUSHDATA4: u8 = 0x4E;

/// Script verification failure reported by the oracle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("script verification failed: {reason}")]
pub struct ScriptError {
    /// Human-readable cause.
    pub reason: String,
}

impl ScriptError {
    /// Create an error with the given cause.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Pure script-execution oracle.
///
/// Implementations evaluate `script_sig` followed by `script_pubkey` in the
/// context of `tx` input `input_index` and report success or failure. The
/// chain engine never interprets scripts itself.
pub trait ScriptVerifier: Send + Sync {
    /// Verify one input's scripts.
    fn verify(
        &self,
        script_sig: &[u8],
        script_pubkey: &[u8],
        tx: &Transaction,
        input_index: usize,
    ) -> Result<(), ScriptError>;
}

/// Oracle that accepts every script. Used by tests and header-trusting
/// deployments where signature checking is handled elsewhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAllScripts;

impl ScriptVerifier for AcceptAllScripts {
    fn verify(
        &self,
        _script_sig: &[u8],
        _script_pubkey: &[u8],
        _tx: &Transaction,
        _input_index: usize,
    ) -> Result<(), ScriptError> {
        Ok(())
    }
}

/// One script operation: an opcode and its push payload, if any.
struct ScriptOp<'a> {
    opcode: u8,
    /// The raw bytes of the whole op, including length prefixes.
    raw: &'a [u8],
}

/// Walk the operations of a script. Malformed trailing pushes terminate the
/// walk, mirroring how unparseable tails are treated by legacy counting.
fn script_ops(script: &[u8]) -> impl Iterator<Item = ScriptOp<'_>> {
    let mut pos = 0usize;
    std::iter::from_fn(move || {
        if pos >= script.len() {
            return None;
        }
        let start = pos;
        let opcode = script[pos];
        pos += 1;
        let push_len = match opcode {
            1..=0x4B => opcode as usize,
            OP_PUSHDATA1 => {
                if pos >= script.len() {
                    pos = script.len();
                    return Some(ScriptOp {
                        opcode,
                        raw: &script[start..],
                    });
                }
                let len = script[pos] as usize;
                pos += 1;
                len
            }
            OP_PUSHDATA2 => {
                if pos + 2 > script.len() {
                    pos = script.len();
                    return Some(ScriptOp {
                        opcode,
                        raw: &script[start..],
                    });
                }
                let len = u16::from_le_bytes([script[pos], script[pos + 1]]) as usize;
                pos += 2;
                len
            }
            OP_PUSHDATA4 => {
                if pos + 4 > script.len() {
                    pos = script.len();
                    return Some(ScriptOp {
                        opcode,
                        raw: &script[start..],
                    });
                }
                let len = u32::from_le_bytes([
                    script[pos],
                    script[pos + 1],
                    script[pos + 2],
                    script[pos + 3],
                ]) as usize;
                pos += 4;
                len
            }
            _ => 0,
        };
        pos = (pos + push_len).min(script.len());
        Some(ScriptOp {
            opcode,
            raw: &script[start..pos],
        })
    })
}

/// Copy `script` with every `OP_CODESEPARATOR` operation removed, as
/// required when building the signing subscript.
pub fn remove_code_separators(script: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(script.len());
    for op in script_ops(script) {
        if op.opcode != OP_CODESEPARATOR {
            out.extend_from_slice(op.raw);
        }
    }
    out
}

/// Legacy signature-operation count: `CHECKSIG(VERIFY)` counts one,
/// `CHECKMULTISIG(VERIFY)` counts twenty.
pub fn count_sigops(script: &[u8]) -> usize {
    let mut count = 0usize;
    for op in script_ops(script) {
        match op.opcode {
            OP_CHECKSIG | OP_CHECKSIGVERIFY => count += 1,
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => count += 20,
            _ => {}
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_sigops() {
        assert_eq!(count_sigops(&[OP_CHECKSIG]), 1);
        assert_eq!(count_sigops(&[OP_CHECKSIG, OP_CHECKSIGVERIFY]), 2);
        assert_eq!(count_sigops(&[OP_CHECKMULTISIG]), 20);
        assert_eq!(count_sigops(&[]), 0);
    }

    #[test]
    fn test_sigops_inside_push_not_counted() {
        // A pushed 0xAC byte is data, not an operation.
        let script = [0x01, OP_CHECKSIG];
        assert_eq!(count_sigops(&script), 0);
    }

    #[test]
    fn test_remove_code_separators() {
        let script = [OP_CHECKSIG, OP_CODESEPARATOR, 0x02, 0xAB, 0xAB, OP_CHECKSIG];
        let cleaned = remove_code_separators(&script);
        // The pushed 0xAB bytes survive; the bare op does not.
        assert_eq!(cleaned, vec![OP_CHECKSIG, 0x02, 0xAB, 0xAB, OP_CHECKSIG]);
    }

    #[test]
    fn test_pushdata1_walk() {
        let script = [OP_PUSHDATA1, 0x02, 0xAB, 0xAC, OP_CHECKSIG];
        assert_eq!(count_sigops(&script), 1);
        assert_eq!(remove_code_separators(&script), script.to_vec());
    }

    #[test]
    fn test_accept_all() {
        let tx = Transaction::new();
        assert!(AcceptAllScripts.verify(&[], &[], &tx, 0).is_ok());
    }
}

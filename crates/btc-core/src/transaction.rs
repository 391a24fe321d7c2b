//! Transactions, inputs and outputs.

use crate::{
    write_var_int, ParseError, ParseResult, Sha256dHash, VerificationError, VerificationResult,
    WireReader, MAX_BLOCK_SIZE, MAX_MONEY,
};
use bytes::{BufMut, Bytes};
use std::collections::HashSet;
use std::fmt;

/// Sequence number that disables lock-time semantics.
pub const SEQUENCE_FINAL: u32 = 0xFFFF_FFFF;

/// Coinbase scripts must be between these lengths, inclusive.
const COINBASE_SCRIPT_MIN: usize = 2;
const COINBASE_SCRIPT_MAX: usize = 100;

/// Upper bound on input/output counts accepted during parsing.
const MAX_LIST_LEN: u64 = 100_000;

/// Reference to an output of an earlier transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutPoint {
    /// Hash of the transaction holding the output.
    pub hash: Sha256dHash,
    /// Index of the output within that transaction.
    pub index: u32,
}

impl OutPoint {
    /// Index value used by coinbase inputs.
    pub const COINBASE_INDEX: u32 = 0xFFFF_FFFF;

    /// Create an outpoint.
    pub fn new(hash: Sha256dHash, index: u32) -> Self {
        Self { hash, index }
    }

    /// The null outpoint carried by coinbase inputs.
    pub fn null() -> Self {
        Self {
            hash: Sha256dHash::ZERO,
            index: Self::COINBASE_INDEX,
        }
    }

    /// True for the coinbase marker outpoint.
    pub fn is_null(&self) -> bool {
        self.hash.is_zero() && self.index == Self::COINBASE_INDEX
    }

    fn write(&self, buf: &mut Vec<u8>) {
        buf.put_slice(self.hash.as_bytes());
        buf.put_u32_le(self.index);
    }

    fn parse(r: &mut WireReader<'_>) -> ParseResult<Self> {
        let hash = r.read_hash()?;
        let index = r.read_u32_le()?;
        Ok(Self { hash, index })
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hash, self.index)
    }
}

/// A transaction input spending a previous output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInput {
    /// The output being spent.
    pub prev_out: OutPoint,
    /// Unlocking script.
    pub script_sig: Vec<u8>,
    /// Sequence number.
    pub sequence: u32,
}

impl TxInput {
    /// Create an input spending `prev_out` with the given unlocking script.
    pub fn new(prev_out: OutPoint, script_sig: Vec<u8>) -> Self {
        Self {
            prev_out,
            script_sig,
            sequence: SEQUENCE_FINAL,
        }
    }

    /// Create a coinbase input carrying arbitrary script bytes.
    pub fn coinbase(script_sig: Vec<u8>) -> Self {
        Self::new(OutPoint::null(), script_sig)
    }

    /// True when this input is the coinbase marker.
    pub fn is_coinbase(&self) -> bool {
        self.prev_out.is_null()
    }

    fn write(&self, buf: &mut Vec<u8>) {
        self.prev_out.write(buf);
        write_var_int(buf, self.script_sig.len() as u64);
        buf.put_slice(&self.script_sig);
        buf.put_u32_le(self.sequence);
    }

    fn parse(r: &mut WireReader<'_>) -> ParseResult<Self> {
        let prev_out = OutPoint::parse(r)?;
        let script_sig = r.read_var_bytes(MAX_BLOCK_SIZE)?;
        let sequence = r.read_u32_le()?;
        Ok(Self {
            prev_out,
            script_sig,
            sequence,
        })
    }
}

/// A transaction output carrying value to a locking script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    /// Value in satoshis.
    pub value: i64,
    /// Locking script.
    pub script_pubkey: Vec<u8>,
}

impl TxOutput {
    /// Create an output.
    pub fn new(value: i64, script_pubkey: Vec<u8>) -> Self {
        Self {
            value,
            script_pubkey,
        }
    }

    fn write(&self, buf: &mut Vec<u8>) {
        buf.put_u64_le(self.value as u64);
        write_var_int(buf, self.script_pubkey.len() as u64);
        buf.put_slice(&self.script_pubkey);
    }

    fn parse(r: &mut WireReader<'_>) -> ParseResult<Self> {
        let value = r.read_u64_le()? as i64;
        let script_pubkey = r.read_var_bytes(MAX_BLOCK_SIZE)?;
        Ok(Self {
            value,
            script_pubkey,
        })
    }
}

/// A Bitcoin transaction.
///
/// A transaction parsed off the wire retains the exact bytes it came from;
/// [`Transaction::serialize`] hands those bytes back unchanged until a
/// mutating accessor is used, at which point the cache is dropped and the
/// next serialization is rebuilt from the field values. Signatures depend
/// on exact serialization, so the rebuilt form is canonical and matches the
/// cached form for any canonically-encoded input.
#[derive(Debug, Clone)]
pub struct Transaction {
    version: u32,
    inputs: Vec<TxInput>,
    outputs: Vec<TxOutput>,
    lock_time: u32,
    cached: Option<Bytes>,
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version
            && self.inputs == other.inputs
            && self.outputs == other.outputs
            && self.lock_time == other.lock_time
    }
}

impl Eq for Transaction {}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl Transaction {
    /// Create an empty version-1 transaction.
    pub fn new() -> Self {
        Self {
            version: 1,
            inputs: Vec::new(),
            outputs: Vec::new(),
            lock_time: 0,
            cached: None,
        }
    }

    /// Transaction format version.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Inputs in order.
    pub fn inputs(&self) -> &[TxInput] {
        &self.inputs
    }

    /// Outputs in order.
    pub fn outputs(&self) -> &[TxOutput] {
        &self.outputs
    }

    /// Lock time.
    pub fn lock_time(&self) -> u32 {
        self.lock_time
    }

    /// Set the format version, invalidating cached bytes.
    pub fn set_version(&mut self, version: u32) {
        self.cached = None;
        self.version = version;
    }

    /// Set the lock time, invalidating cached bytes.
    pub fn set_lock_time(&mut self, lock_time: u32) {
        self.cached = None;
        self.lock_time = lock_time;
    }

    /// Append an input, invalidating cached bytes.
    pub fn add_input(&mut self, input: TxInput) {
        self.cached = None;
        self.inputs.push(input);
    }

    /// Append an output, invalidating cached bytes.
    pub fn add_output(&mut self, output: TxOutput) {
        self.cached = None;
        self.outputs.push(output);
    }

    /// Mutable access to the inputs. Invalidates cached bytes.
    pub fn inputs_mut(&mut self) -> &mut Vec<TxInput> {
        self.cached = None;
        &mut self.inputs
    }

    /// Mutable access to the outputs. Invalidates cached bytes.
    pub fn outputs_mut(&mut self) -> &mut Vec<TxOutput> {
        self.cached = None;
        &mut self.outputs
    }

    /// True when this is a coinbase transaction: exactly one input and it
    /// carries the null outpoint.
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].is_coinbase()
    }

    /// Sum of output values.
    pub fn output_value(&self) -> i64 {
        self.outputs.iter().map(|o| o.value).sum()
    }

    /// Transaction identity: double-SHA256 of the serialized body.
    pub fn hash(&self) -> Sha256dHash {
        Sha256dHash::hash(&self.serialize())
    }

    /// Serialize, returning the original wire bytes when unmutated.
    pub fn serialize(&self) -> Bytes {
        if let Some(cached) = &self.cached {
            return cached.clone();
        }
        let mut buf = Vec::with_capacity(self.serialized_size_hint());
        self.write_fields(&mut buf);
        Bytes::from(buf)
    }

    /// Write the serialization into `buf`, reusing cached bytes if present.
    pub fn write(&self, buf: &mut Vec<u8>) {
        if let Some(cached) = &self.cached {
            buf.put_slice(cached);
        } else {
            self.write_fields(buf);
        }
    }

    fn serialized_size_hint(&self) -> usize {
        10 + self.inputs.iter().map(|i| 41 + i.script_sig.len()).sum::<usize>()
            + self
                .outputs
                .iter()
                .map(|o| 9 + o.script_pubkey.len())
                .sum::<usize>()
    }

    pub(crate) fn write_fields(&self, buf: &mut Vec<u8>) {
        buf.put_u32_le(self.version);
        write_var_int(buf, self.inputs.len() as u64);
        for input in &self.inputs {
            input.write(buf);
        }
        write_var_int(buf, self.outputs.len() as u64);
        for output in &self.outputs {
            output.write(buf);
        }
        buf.put_u32_le(self.lock_time);
    }

    /// Parse a transaction, retaining the exact consumed slice of `src`.
    ///
    /// `src` must be the buffer the reader was created over.
    pub fn parse(r: &mut WireReader<'_>, src: &Bytes) -> ParseResult<Self> {
        let start = r.position();
        let version = r.read_u32_le()?;

        let count_pos = r.position();
        let n_inputs = r.read_var_int()?;
        if n_inputs > MAX_LIST_LEN {
            return Err(ParseError::Oversized {
                offset: count_pos,
                size: n_inputs as usize,
                max: MAX_LIST_LEN as usize,
            });
        }
        let mut inputs = Vec::with_capacity(n_inputs.min(1024) as usize);
        for _ in 0..n_inputs {
            inputs.push(TxInput::parse(r)?);
        }

        let count_pos = r.position();
        let n_outputs = r.read_var_int()?;
        if n_outputs > MAX_LIST_LEN {
            return Err(ParseError::Oversized {
                offset: count_pos,
                size: n_outputs as usize,
                max: MAX_LIST_LEN as usize,
            });
        }
        let mut outputs = Vec::with_capacity(n_outputs.min(1024) as usize);
        for _ in 0..n_outputs {
            outputs.push(TxOutput::parse(r)?);
        }

        let lock_time = r.read_u32_le()?;
        let cached = Some(src.slice(start..r.position()));

        Ok(Self {
            version,
            inputs,
            outputs,
            lock_time,
            cached,
        })
    }

    /// Parse a complete buffer as one transaction; trailing bytes fail.
    pub fn from_wire(src: &Bytes) -> ParseResult<Self> {
        let mut r = WireReader::new(src);
        let tx = Self::parse(&mut r, src)?;
        if !r.is_empty() {
            return Err(ParseError::Malformed {
                offset: r.position(),
                what: format!("{} trailing bytes after transaction", r.remaining()),
            });
        }
        Ok(tx)
    }

    /// Structural validation: non-empty inputs and outputs, no duplicate
    /// inputs, values within range, coinbase script length bounds.
    pub fn verify(&self) -> VerificationResult<()> {
        if self.inputs.is_empty() {
            return Err(VerificationError::InvalidTransaction(
                "no inputs".to_string(),
            ));
        }
        if self.outputs.is_empty() {
            return Err(VerificationError::InvalidTransaction(
                "no outputs".to_string(),
            ));
        }

        let mut seen = HashSet::with_capacity(self.inputs.len());
        for input in &self.inputs {
            if !seen.insert(input.prev_out) {
                return Err(VerificationError::InvalidTransaction(format!(
                    "duplicate input {}",
                    input.prev_out
                )));
            }
        }

        let mut total: i64 = 0;
        for output in &self.outputs {
            if output.value < 0 || output.value > MAX_MONEY {
                return Err(VerificationError::ValueOverflow {
                    value: output.value,
                });
            }
            total = total.checked_add(output.value).ok_or(
                VerificationError::ValueOverflow {
                    value: output.value,
                },
            )?;
            if total > MAX_MONEY {
                return Err(VerificationError::ValueOverflow { value: total });
            }
        }

        if self.is_coinbase() {
            let len = self.inputs[0].script_sig.len();
            if !(COINBASE_SCRIPT_MIN..=COINBASE_SCRIPT_MAX).contains(&len) {
                return Err(VerificationError::InvalidTransaction(format!(
                    "coinbase script length {len} outside [{COINBASE_SCRIPT_MIN}, {COINBASE_SCRIPT_MAX}]"
                )));
            }
        } else {
            for input in &self.inputs {
                if input.prev_out.is_null() {
                    return Err(VerificationError::InvalidTransaction(
                        "null outpoint in non-coinbase transaction".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Used by signature hashing to build a mutated clone without keeping
    /// stale cached bytes around.
    pub(crate) fn uncached_clone(&self) -> Self {
        let mut clone = self.clone();
        clone.cached = None;
        clone
    }

    pub(crate) fn inputs_raw_mut(&mut self) -> &mut Vec<TxInput> {
        &mut self.inputs
    }

    pub(crate) fn outputs_raw_mut(&mut self) -> &mut Vec<TxOutput> {
        &mut self.outputs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx() -> Transaction {
        let mut tx = Transaction::new();
        tx.add_input(TxInput::new(
            OutPoint::new(Sha256dHash::hash(b"prev"), 0),
            vec![0x51],
        ));
        tx.add_output(TxOutput::new(50 * crate::COIN, vec![0x51]));
        tx
    }

    #[test]
    fn test_roundtrip_preserves_bytes() {
        let tx = sample_tx();
        let bytes = tx.serialize();
        let parsed = Transaction::from_wire(&bytes).unwrap();
        assert_eq!(parsed, tx);
        // Unmutated re-serialization returns the original buffer.
        assert_eq!(parsed.serialize(), bytes);
        assert_eq!(parsed.hash(), tx.hash());
    }

    #[test]
    fn test_mutation_invalidates_cache() {
        let tx = sample_tx();
        let bytes = tx.serialize();
        let mut parsed = Transaction::from_wire(&bytes).unwrap();
        parsed.add_output(TxOutput::new(1, vec![0x51]));
        let reserialized = parsed.serialize();
        assert_ne!(reserialized, bytes);
        // And the rebuilt form parses back to the same value.
        assert_eq!(Transaction::from_wire(&reserialized).unwrap(), parsed);
    }

    #[test]
    fn test_coinbase_detection() {
        let mut cb = Transaction::new();
        cb.add_input(TxInput::coinbase(vec![0x01, 0x02]));
        cb.add_output(TxOutput::new(50 * crate::COIN, vec![0x51]));
        assert!(cb.is_coinbase());
        assert!(cb.verify().is_ok());

        assert!(!sample_tx().is_coinbase());
    }

    #[test]
    fn test_verify_rejects_empty() {
        let tx = Transaction::new();
        assert!(matches!(
            tx.verify(),
            Err(VerificationError::InvalidTransaction(_))
        ));
    }

    #[test]
    fn test_verify_rejects_duplicate_inputs() {
        let mut tx = sample_tx();
        let dup = tx.inputs()[0].clone();
        tx.add_input(dup);
        assert!(matches!(
            tx.verify(),
            Err(VerificationError::InvalidTransaction(_))
        ));
    }

    #[test]
    fn test_verify_rejects_value_overflow() {
        let mut tx = sample_tx();
        tx.outputs_mut()[0].value = MAX_MONEY + 1;
        assert!(matches!(
            tx.verify(),
            Err(VerificationError::ValueOverflow { .. })
        ));

        let mut tx = sample_tx();
        tx.outputs_mut()[0].value = -1;
        assert!(matches!(
            tx.verify(),
            Err(VerificationError::ValueOverflow { .. })
        ));
    }

    #[test]
    fn test_verify_rejects_oversized_coinbase_script() {
        let mut cb = Transaction::new();
        cb.add_input(TxInput::coinbase(vec![0u8; 101]));
        cb.add_output(TxOutput::new(1, vec![0x51]));
        assert!(cb.verify().is_err());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let tx = sample_tx();
        let mut bytes = tx.serialize().to_vec();
        bytes.push(0);
        assert!(Transaction::from_wire(&Bytes::from(bytes)).is_err());
    }
}

//! Canonical variable-length integer writing.
//!
//! Values below 0xFD are a single byte; larger values use a marker byte
//! followed by the smallest little-endian integer that holds them. The
//! matching canonical-enforcing reader lives in [`crate::WireReader`].

use bytes::BufMut;

/// Serialized size of a varint in bytes.
pub fn var_int_size(value: u64) -> usize {
    match value {
        0..=0xFC => 1,
        0xFD..=0xFFFF => 3,
        0x1_0000..=0xFFFF_FFFF => 5,
        _ => 9,
    }
}

/// Write a varint in its canonical shortest form.
pub fn write_var_int(buf: &mut Vec<u8>, value: u64) {
    match value {
        0..=0xFC => buf.put_u8(value as u8),
        0xFD..=0xFFFF => {
            buf.put_u8(0xFD);
            buf.put_u16_le(value as u16);
        }
        0x1_0000..=0xFFFF_FFFF => {
            buf.put_u8(0xFE);
            buf.put_u32_le(value as u32);
        }
        _ => {
            buf.put_u8(0xFF);
            buf.put_u64_le(value);
        }
    }
}

/// Write a varint length prefix followed by the raw bytes.
pub fn write_var_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    write_var_int(buf, bytes.len() as u64);
    buf.put_slice(bytes);
}

/// Write a varint length prefix followed by the UTF-8 bytes of `s`.
pub fn write_var_str(buf: &mut Vec<u8>, s: &str) {
    write_var_bytes(buf, s.as_bytes());
}

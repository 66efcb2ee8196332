use anyhow::bail;
use bytes::{Buf, BufMut};

/// Number of bytes the 7-bit-long encoding of `value` occupies.
pub fn seven_bit_len(value: u64) -> usize {
    let mut len = 1;
    let mut v = value >> 7;
    while v > 0 {
        len += 1;
        v >>= 7;
    }
    len
}

/// Write `value` as a "7-bit-long" integer: 7 bits per byte, most significant
/// group first, high bit set on every byte except the last.
///
/// NB: This is *not* LEB128 - the wire format uses big-endian groups.
pub fn put_u64_7bit(buf: &mut impl BufMut, value: u64) {
    let len = seven_bit_len(value);
    for i in (1..len).rev() {
        buf.put_u8(0x80 | ((value >> (7 * i)) & 0x7f) as u8);
    }
    buf.put_u8((value & 0x7f) as u8);
}

pub fn try_get_u64_7bit(buf: &mut impl Buf) -> anyhow::Result<u64> {
    let mut value: u64 = 0;
    for _ in 0..10 {
        let byte = buf.try_get_u8()?;
        value = (value << 7) | (byte & 0x7f) as u64;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    bail!("7-bit-long value exceeds 64 bits");
}

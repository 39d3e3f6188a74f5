//! Variable-length integer encoding.
//!
//! Unsigned values use 7 data bits per byte with the high bit as a continuation
//! flag. Signed values are zig-zag mapped first so small negative numbers stay
//! short.

use crate::error::{QuireError, Result};

/// Append `value` to `buf` using variable-length encoding.
pub fn write_u64(buf: &mut Vec<u8>, value: u64) {
    let mut val = value;
    loop {
        let mut byte = (val & 0x7F) as u8;
        val >>= 7;
        if val != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if val == 0 {
            break;
        }
    }
}

/// Decode a u64 value, returning it with the number of bytes consumed.
pub fn decode_u64(bytes: &[u8]) -> Result<(u64, usize)> {
    let mut result = 0u64;
    let mut shift = 0;

    for (i, &byte) in bytes.iter().enumerate() {
        if shift >= 64 {
            return Err(QuireError::corrupt("VarInt overflow"));
        }
        result |= ((byte & 0x7F) as u64) << shift;
        if (byte & 0x80) == 0 {
            return Ok((result, i + 1));
        }
        shift += 7;
    }

    Err(QuireError::corrupt("Incomplete VarInt"))
}

/// Map a signed value onto the unsigned range (0, -1, 1, -2, ...).
pub fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

/// Inverse of [`zigzag_encode`].
pub fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

/// Sequential reader over a byte slice of varints.
#[derive(Debug, Clone)]
pub struct VarIntCursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> VarIntCursor<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        VarIntCursor { bytes, pos: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let (value, len) = decode_u64(&self.bytes[self.pos..])?;
        self.pos += len;
        Ok(value)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let value = self.read_u64()?;
        u32::try_from(value).map_err(|_| QuireError::corrupt(format!("VarInt {value} exceeds u32")))
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| QuireError::corrupt("Byte run past end of buffer"))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_u64() {
        let test_values = [0, 1, 127, 128, 255, 256, 16383, 16384, u64::MAX];

        for &value in &test_values {
            let mut encoded = Vec::new();
            write_u64(&mut encoded, value);
            let (decoded, bytes_read) = decode_u64(&encoded).unwrap();

            assert_eq!(value, decoded);
            assert_eq!(encoded.len(), bytes_read);
        }
    }

    #[test]
    fn test_zigzag() {
        assert_eq!(zigzag_encode(0), 0);
        assert_eq!(zigzag_encode(-1), 1);
        assert_eq!(zigzag_encode(1), 2);
        assert_eq!(zigzag_encode(-2), 3);
        for v in [i64::MIN, -300, -1, 0, 1, 300, i64::MAX] {
            assert_eq!(zigzag_decode(zigzag_encode(v)), v);
        }
    }

    #[test]
    fn test_incomplete_varint() {
        assert!(decode_u64(&[0x80, 0x80]).is_err());
    }

    #[test]
    fn test_cursor() {
        let mut buf = Vec::new();
        write_u64(&mut buf, 300);
        write_u64(&mut buf, 5);
        buf.extend_from_slice(b"ab");

        let mut cursor = VarIntCursor::new(&buf);
        assert_eq!(cursor.read_u64().unwrap(), 300);
        assert_eq!(cursor.read_u32().unwrap(), 5);
        assert_eq!(cursor.read_bytes(2).unwrap(), b"ab");
        assert!(cursor.is_empty());
        assert!(cursor.read_bytes(1).is_err());
    }
}

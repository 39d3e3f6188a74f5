//! Structured binary reading and writing for index files.
//!
//! Every index file has the same framing:
//!
//! ```text
//! [u32 magic][u32 version] body... [u32 FOOTER_MAGIC][u32 crc32(all preceding bytes)]
//! ```
//!
//! Fixed-width integers are big-endian. Variable-length integers use the
//! encoding in [`crate::util::varint`]. Readers verify the footer checksum of
//! the whole file before parsing the body, so a flipped byte anywhere is
//! reported as [`QuireError::CorruptIndex`].

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Cursor, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;

use crate::error::{QuireError, Result};
use crate::storage::{Storage, StorageOutput};
use crate::util::varint::{zigzag_decode, zigzag_encode};

/// Magic number closing every index file.
pub const FOOTER_MAGIC: u32 = 0xC028_93E8;

/// Footer length in bytes.
pub const FOOTER_LENGTH: usize = 8;

/// Writer for structured binary data with a running checksum.
pub struct StructWriter<W: Write> {
    writer: W,
    hasher: Hasher,
    written: u64,
}

impl<W: Write> StructWriter<W> {
    pub fn new(writer: W) -> Self {
        StructWriter {
            writer,
            hasher: Hasher::new(),
            written: 0,
        }
    }

    /// Bytes written so far.
    pub fn position(&self) -> u64 {
        self.written
    }

    pub fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes)?;
        self.hasher.update(bytes);
        self.written += bytes.len() as u64;
        Ok(())
    }

    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.write_raw(&[value])
    }

    pub fn write_bool(&mut self, value: bool) -> Result<()> {
        self.write_u8(value as u8)
    }

    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        let mut buf = [0u8; 4];
        (&mut buf[..]).write_u32::<BigEndian>(value)?;
        self.write_raw(&buf)
    }

    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        let mut buf = [0u8; 8];
        (&mut buf[..]).write_u64::<BigEndian>(value)?;
        self.write_raw(&buf)
    }

    pub fn write_i64(&mut self, value: i64) -> Result<()> {
        self.write_u64(value as u64)
    }

    pub fn write_f64(&mut self, value: f64) -> Result<()> {
        self.write_u64(value.to_bits())
    }

    pub fn write_varint(&mut self, value: u64) -> Result<()> {
        let mut buf = Vec::with_capacity(10);
        crate::util::varint::write_u64(&mut buf, value);
        self.write_raw(&buf)
    }

    /// Zig-zag encoded signed varint.
    pub fn write_zvarint(&mut self, value: i64) -> Result<()> {
        self.write_varint(zigzag_encode(value))
    }

    /// Length-prefixed byte blob.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_varint(bytes.len() as u64)?;
        self.write_raw(bytes)
    }

    pub fn write_string(&mut self, value: &str) -> Result<()> {
        self.write_bytes(value.as_bytes())
    }

    pub fn write_string_map(&mut self, map: &BTreeMap<String, String>) -> Result<()> {
        self.write_varint(map.len() as u64)?;
        for (key, value) in map {
            self.write_string(key)?;
            self.write_string(value)?;
        }
        Ok(())
    }

    pub fn write_string_set(&mut self, set: &BTreeSet<String>) -> Result<()> {
        self.write_varint(set.len() as u64)?;
        for value in set {
            self.write_string(value)?;
        }
        Ok(())
    }

    pub fn write_header(&mut self, magic: u32, version: u32) -> Result<()> {
        self.write_u32(magic)?;
        self.write_u32(version)
    }

    /// Write the checksum footer. Nothing may be written afterwards.
    pub fn write_footer(&mut self) -> Result<()> {
        self.write_u32(FOOTER_MAGIC)?;
        let crc = self.hasher.clone().finalize();
        let mut buf = [0u8; 4];
        (&mut buf[..]).write_u32::<BigEndian>(crc)?;
        self.writer.write_all(&buf)?;
        self.written += 4;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl StructWriter<Box<dyn StorageOutput>> {
    /// Write the footer, sync and close the underlying output.
    pub fn finish(mut self) -> Result<()> {
        self.write_footer()?;
        let mut output = self.writer;
        output.flush_and_sync()?;
        output.close()
    }
}

/// Reader for structured binary data.
pub struct StructReader<R: Read> {
    reader: R,
}

impl<R: Read> StructReader<R> {
    pub fn new(reader: R) -> Self {
        StructReader { reader }
    }

    pub fn read_raw(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.reader
            .read_exact(&mut buf)
            .map_err(|e| QuireError::corrupt(format!("truncated read of {len} bytes: {e}")))?;
        Ok(buf)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.reader
            .read_u8()
            .map_err(|e| QuireError::corrupt(format!("truncated u8: {e}")))
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(QuireError::corrupt(format!("invalid bool byte {other}"))),
        }
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.reader
            .read_u32::<BigEndian>()
            .map_err(|e| QuireError::corrupt(format!("truncated u32: {e}")))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.reader
            .read_u64::<BigEndian>()
            .map_err(|e| QuireError::corrupt(format!("truncated u64: {e}")))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(self.read_u64()? as i64)
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    pub fn read_varint(&mut self) -> Result<u64> {
        let mut result = 0u64;
        let mut shift = 0;
        loop {
            if shift >= 64 {
                return Err(QuireError::corrupt("VarInt overflow"));
            }
            let byte = self.read_u8()?;
            result |= ((byte & 0x7F) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
    }

    pub fn read_varint_u32(&mut self) -> Result<u32> {
        let value = self.read_varint()?;
        u32::try_from(value).map_err(|_| QuireError::corrupt(format!("value {value} exceeds u32")))
    }

    pub fn read_zvarint(&mut self) -> Result<i64> {
        Ok(zigzag_decode(self.read_varint()?))
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_varint()? as usize;
        self.read_raw(len)
    }

    pub fn read_string(&mut self) -> Result<String> {
        String::from_utf8(self.read_bytes()?)
            .map_err(|e| QuireError::corrupt(format!("invalid UTF-8 string: {e}")))
    }

    pub fn read_string_map(&mut self) -> Result<BTreeMap<String, String>> {
        let len = self.read_varint()?;
        let mut map = BTreeMap::new();
        for _ in 0..len {
            let key = self.read_string()?;
            let value = self.read_string()?;
            map.insert(key, value);
        }
        Ok(map)
    }

    pub fn read_string_set(&mut self) -> Result<BTreeSet<String>> {
        let len = self.read_varint()?;
        let mut set = BTreeSet::new();
        for _ in 0..len {
            set.insert(self.read_string()?);
        }
        Ok(set)
    }

    /// Check the file header, returning the version found.
    pub fn check_header(&mut self, magic: u32, min_version: u32, max_version: u32) -> Result<u32> {
        let found = self.read_u32()?;
        if found != magic {
            return Err(QuireError::corrupt(format!(
                "header magic mismatch: expected {magic:#x}, found {found:#x}"
            )));
        }
        let version = self.read_u32()?;
        if version < min_version || version > max_version {
            return Err(QuireError::corrupt(format!(
                "unsupported format version {version} (supported {min_version}..={max_version})"
            )));
        }
        Ok(version)
    }
}

/// Verify the footer of a complete file image and return the body.
pub fn verify_checksum(bytes: &[u8]) -> Result<&[u8]> {
    if bytes.len() < FOOTER_LENGTH {
        return Err(QuireError::corrupt(format!(
            "file too short for footer: {} bytes",
            bytes.len()
        )));
    }
    let split = bytes.len() - FOOTER_LENGTH;
    let mut footer = Cursor::new(&bytes[split..]);
    let magic = footer.read_u32::<BigEndian>()?;
    let expected = footer.read_u32::<BigEndian>()?;
    if magic != FOOTER_MAGIC {
        return Err(QuireError::corrupt(format!(
            "footer magic mismatch: {magic:#x}"
        )));
    }

    let mut hasher = Hasher::new();
    hasher.update(&bytes[..split + 4]);
    let actual = hasher.finalize();
    if actual != expected {
        return Err(QuireError::corrupt(format!(
            "checksum mismatch: expected {expected:#x}, actual {actual:#x}"
        )));
    }
    Ok(&bytes[..split])
}

/// Read a file, verify its footer and return the body bytes.
pub fn read_verified(storage: &dyn Storage, name: &str) -> Result<Vec<u8>> {
    let mut bytes = storage.read_file(name)?;
    let body_len = verify_checksum(&bytes)
        .map_err(|e| QuireError::corrupt(format!("{name}: {e}")))?
        .len();
    bytes.truncate(body_len);
    Ok(bytes)
}

/// Open a verified reader over a file body.
pub fn open_verified(storage: &dyn Storage, name: &str) -> Result<StructReader<Cursor<Vec<u8>>>> {
    Ok(StructReader::new(Cursor::new(read_verified(storage, name)?)))
}

/// Create a structured writer for a new file.
pub fn create_writer(
    storage: &dyn Storage,
    name: &str,
) -> Result<StructWriter<Box<dyn StorageOutput>>> {
    Ok(StructWriter::new(storage.create_output(name)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::{MemoryStorage, MemoryStorageConfig};

    #[test]
    fn test_struct_round_trip() {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        let mut writer = create_writer(&storage, "t.bin").unwrap();
        writer.write_header(0x5445_5354, 2).unwrap();
        writer.write_u64(42).unwrap();
        writer.write_zvarint(-7).unwrap();
        writer.write_string("hello").unwrap();
        let mut map = BTreeMap::new();
        map.insert("k".to_string(), "v".to_string());
        writer.write_string_map(&map).unwrap();
        writer.finish().unwrap();

        let mut reader = open_verified(&storage, "t.bin").unwrap();
        assert_eq!(reader.check_header(0x5445_5354, 1, 2).unwrap(), 2);
        assert_eq!(reader.read_u64().unwrap(), 42);
        assert_eq!(reader.read_zvarint().unwrap(), -7);
        assert_eq!(reader.read_string().unwrap(), "hello");
        assert_eq!(reader.read_string_map().unwrap(), map);
        assert!(reader.read_u8().is_err());
    }

    #[test]
    fn test_corruption_detected() {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        let mut writer = create_writer(&storage, "c.bin").unwrap();
        writer.write_header(1, 1).unwrap();
        writer.write_string("payload").unwrap();
        writer.finish().unwrap();

        let mut bytes = storage.read_file("c.bin").unwrap();
        assert!(verify_checksum(&bytes).is_ok());
        bytes[9] ^= 0xFF;
        assert!(matches!(
            verify_checksum(&bytes),
            Err(QuireError::CorruptIndex(_))
        ));
        assert!(verify_checksum(&bytes[..4]).is_err());
    }

    #[test]
    fn test_header_mismatch() {
        let mut buf = Vec::new();
        let mut writer = StructWriter::new(&mut buf);
        writer.write_header(0xAAAA, 5).unwrap();
        drop(writer);

        let mut reader = StructReader::new(Cursor::new(buf.clone()));
        assert!(reader.check_header(0xBBBB, 1, 5).is_err());
        let mut reader = StructReader::new(Cursor::new(buf));
        assert!(reader.check_header(0xAAAA, 1, 4).is_err());
    }
}

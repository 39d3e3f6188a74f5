//! Compound segment files.
//!
//! A compound segment packs the non-generational files of one segment into a
//! data file (`.cfs`) and an entry table (`.cfe`). Generational files (live
//! docs, doc-values and field-infos updates) are always written outside the
//! compound file because they change after the segment is sealed.
//!
//! ```text
//! .cfs: header | file bytes... | footer
//! .cfe: header | count | (suffix, offset, length)... | footer
//! ```

use std::collections::BTreeMap;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::sync::Arc;

use crate::error::{QuireError, Result};
use crate::storage::structured::{create_writer, open_verified, read_verified};
use crate::storage::{Storage, StorageInput, StorageLock, StorageOutput};

const DATA_MAGIC: u32 = 0x4346_5344; // "CFSD"
const ENTRIES_MAGIC: u32 = 0x4346_5345; // "CFSE"
const VERSION: u32 = 1;

pub const DATA_EXTENSION: &str = "cfs";
pub const ENTRIES_EXTENSION: &str = "cfe";

/// Pack `files` of `segment` into `<segment>.cfs` and `<segment>.cfe`.
///
/// Returns the two new file names. The source files are left in place; the
/// caller deletes them once the compound files are referenced.
pub fn write_compound(
    storage: &dyn Storage,
    segment: &str,
    files: &[String],
) -> Result<Vec<String>> {
    let data_name = format!("{segment}.{DATA_EXTENSION}");
    let entries_name = format!("{segment}.{ENTRIES_EXTENSION}");

    let mut entries = BTreeMap::new();
    let mut data = create_writer(storage, &data_name)?;
    data.write_header(DATA_MAGIC, VERSION)?;
    for file in files {
        let suffix = file
            .strip_prefix(segment)
            .ok_or_else(|| {
                QuireError::invalid_argument(format!(
                    "file {file} does not belong to segment {segment}"
                ))
            })?
            .to_string();
        let bytes = storage.read_file(file)?;
        let offset = data.position();
        data.write_raw(&bytes)?;
        entries.insert(suffix, (offset, bytes.len() as u64));
    }
    data.finish()?;

    let mut table = create_writer(storage, &entries_name)?;
    table.write_header(ENTRIES_MAGIC, VERSION)?;
    table.write_varint(entries.len() as u64)?;
    for (suffix, (offset, length)) in &entries {
        table.write_string(suffix)?;
        table.write_u64(*offset)?;
        table.write_u64(*length)?;
    }
    table.finish()?;

    Ok(vec![data_name, entries_name])
}

/// Read-only storage view over a compound segment.
#[derive(Debug)]
pub struct CompoundStorage {
    segment: String,
    data: Arc<Vec<u8>>,
    entries: BTreeMap<String, (usize, usize)>,
}

impl CompoundStorage {
    pub fn open(storage: &dyn Storage, segment: &str) -> Result<Self> {
        let entries_name = format!("{segment}.{ENTRIES_EXTENSION}");
        let data_name = format!("{segment}.{DATA_EXTENSION}");

        let mut table = open_verified(storage, &entries_name)?;
        table.check_header(ENTRIES_MAGIC, VERSION, VERSION)?;
        let count = table.read_varint()?;
        let mut entries = BTreeMap::new();
        for _ in 0..count {
            let suffix = table.read_string()?;
            let offset = table.read_u64()? as usize;
            let length = table.read_u64()? as usize;
            entries.insert(format!("{segment}{suffix}"), (offset, length));
        }

        let data = read_verified(storage, &data_name)?;
        let mut header = Cursor::new(&data);
        crate::storage::structured::StructReader::new(&mut header).check_header(
            DATA_MAGIC,
            VERSION,
            VERSION,
        )?;
        for (name, (offset, length)) in &entries {
            if offset + length > data.len() {
                return Err(QuireError::corrupt(format!(
                    "compound entry {name} runs past end of {data_name}"
                )));
            }
        }

        Ok(CompoundStorage {
            segment: segment.to_string(),
            data: Arc::new(data),
            entries,
        })
    }

    fn read_only(&self) -> QuireError {
        QuireError::illegal_state(format!(
            "compound segment {} is read-only",
            self.segment
        ))
    }
}

impl Storage for CompoundStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        let (offset, length) = *self
            .entries
            .get(name)
            .ok_or_else(|| QuireError::not_found(name))?;
        Ok(Box::new(SliceInput {
            data: self.data.clone(),
            start: offset,
            len: length,
            pos: 0,
        }))
    }

    fn create_output(&self, _name: &str) -> Result<Box<dyn StorageOutput>> {
        Err(self.read_only())
    }

    fn file_exists(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        self.entries
            .get(name)
            .map(|(_, len)| *len as u64)
            .ok_or_else(|| QuireError::not_found(name))
    }

    fn delete_file(&self, _name: &str) -> Result<()> {
        Err(self.read_only())
    }

    fn list_files(&self) -> Result<Vec<String>> {
        Ok(self.entries.keys().cloned().collect())
    }

    fn rename_file(&self, _from: &str, _to: &str) -> Result<()> {
        Err(self.read_only())
    }

    fn sync(&self, _names: &[String]) -> Result<()> {
        Ok(())
    }

    fn sync_metadata(&self) -> Result<()> {
        Ok(())
    }

    fn obtain_lock(&self, _name: &str) -> Result<Box<dyn StorageLock>> {
        Err(self.read_only())
    }
}

#[derive(Debug)]
struct SliceInput {
    data: Arc<Vec<u8>>,
    start: usize,
    len: usize,
    pos: usize,
}

impl Read for SliceInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let remaining = self.len.saturating_sub(self.pos);
        let n = remaining.min(buf.len());
        let from = self.start + self.pos;
        buf[..n].copy_from_slice(&self.data[from..from + n]);
        self.pos += n;
        Ok(n)
    }
}

impl Seek for SliceInput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::End(off) => self.len as i64 + off,
            SeekFrom::Current(off) => self.pos as i64 + off,
        };
        if target < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before start of compound entry",
            ));
        }
        self.pos = target as usize;
        Ok(self.pos as u64)
    }
}

impl StorageInput for SliceInput {
    fn size(&self) -> Result<u64> {
        Ok(self.len as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::{MemoryStorage, MemoryStorageConfig};
    use std::io::Write;

    #[test]
    fn test_compound_round_trip() {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        for (name, data) in [("_0.pst", &b"postings"[..]), ("_0.fdt", &b"stored"[..])] {
            let mut out = storage.create_output(name).unwrap();
            out.write_all(data).unwrap();
            out.close().unwrap();
        }

        let names = write_compound(
            &storage,
            "_0",
            &["_0.pst".to_string(), "_0.fdt".to_string()],
        )
        .unwrap();
        assert_eq!(names, vec!["_0.cfs".to_string(), "_0.cfe".to_string()]);

        let compound = CompoundStorage::open(&storage, "_0").unwrap();
        assert_eq!(compound.read_file("_0.pst").unwrap(), b"postings");
        assert_eq!(compound.read_file("_0.fdt").unwrap(), b"stored");
        assert_eq!(compound.file_size("_0.fdt").unwrap(), 6);
        assert!(compound.open_input("_0.nrm").is_err());
        assert!(compound.create_output("_0.x").is_err());
    }

    #[test]
    fn test_foreign_file_rejected() {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        storage.create_output("_1.pst").unwrap().close().unwrap();
        assert!(write_compound(&storage, "_0", &["_1.pst".to_string()]).is_err());
    }
}

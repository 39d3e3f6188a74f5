//! Storage abstraction for index files.
//!
//! A [`Storage`] is a flat namespace of write-once byte files. The index writer
//! relies on a handful of guarantees beyond plain reads and writes:
//!
//! - `create_output` refuses to overwrite an existing file
//! - `rename_file` is atomic and refuses an existing destination
//! - `sync` is a durability barrier for the named files
//! - `obtain_lock` gives exclusive ownership of the whole storage
//!
//! Two backends are provided: [`memory::MemoryStorage`] for tests and
//! ephemeral indexes, and [`file::FileStorage`] for a directory on disk.

pub mod compound;
pub mod file;
pub mod memory;
pub mod structured;

use std::fmt::Debug;
use std::io::{Read, Seek, Write};
use std::sync::Arc;

use crate::error::Result;

use self::file::{FileStorage, FileStorageConfig};
use self::memory::{MemoryStorage, MemoryStorageConfig};

/// Name of the lock file taken by an index writer.
pub const WRITE_LOCK_NAME: &str = "write.lock";

/// Readable handle to a stored file.
pub trait StorageInput: Read + Seek + Send + Debug {
    /// Total length of the file in bytes.
    fn size(&self) -> Result<u64>;

    /// Read the remainder of the file into memory.
    fn read_all(&mut self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.size()? as usize);
        self.read_to_end(&mut buf)?;
        Ok(buf)
    }
}

/// Writable handle to a new file.
pub trait StorageOutput: Write + Send + Debug {
    /// Flush buffered bytes and make them durable.
    fn flush_and_sync(&mut self) -> Result<()>;

    /// Finish writing. Further writes are an error.
    fn close(&mut self) -> Result<()>;
}

/// Exclusive lock over a storage, released on drop.
pub trait StorageLock: Send + Sync + Debug {
    /// Name the lock was obtained under.
    fn name(&self) -> &str;

    /// Fail if the lock has been lost (e.g. the lock file was removed).
    fn ensure_valid(&self) -> Result<()>;
}

/// A directory of named files.
pub trait Storage: Send + Sync + Debug {
    /// Open an existing file for reading.
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>>;

    /// Create a new file. Fails if the file already exists.
    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>>;

    /// Check whether a file exists.
    fn file_exists(&self, name: &str) -> bool;

    /// Length of a file in bytes.
    fn file_size(&self, name: &str) -> Result<u64>;

    /// Delete a file.
    fn delete_file(&self, name: &str) -> Result<()>;

    /// All file names, sorted.
    fn list_files(&self) -> Result<Vec<String>>;

    /// Atomically rename `from` to `to`. Fails if `to` exists.
    fn rename_file(&self, from: &str, to: &str) -> Result<()>;

    /// Make the content of the named files durable.
    fn sync(&self, names: &[String]) -> Result<()>;

    /// Make directory metadata (renames, creations) durable.
    fn sync_metadata(&self) -> Result<()>;

    /// Obtain an exclusive lock named `name`.
    fn obtain_lock(&self, name: &str) -> Result<Box<dyn StorageLock>>;

    /// Read a whole file into memory.
    fn read_file(&self, name: &str) -> Result<Vec<u8>> {
        let mut input = self.open_input(name)?;
        input.read_all()
    }
}

/// Storage backend selection.
#[derive(Debug, Clone)]
pub enum StorageConfig {
    /// In-memory storage.
    Memory(MemoryStorageConfig),
    /// Directory on the local file system.
    File(FileStorageConfig),
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Memory(MemoryStorageConfig::default())
    }
}

/// Builds storages from a [`StorageConfig`].
pub struct StorageFactory;

impl StorageFactory {
    pub fn create(config: StorageConfig) -> Result<Arc<dyn Storage>> {
        match config {
            StorageConfig::Memory(config) => Ok(Arc::new(MemoryStorage::new(config))),
            StorageConfig::File(config) => Ok(Arc::new(FileStorage::new(config)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_memory() {
        let storage = StorageFactory::create(StorageConfig::default()).unwrap();
        let mut out = storage.create_output("a.bin").unwrap();
        out.write_all(b"hello").unwrap();
        out.close().unwrap();

        assert_eq!(storage.read_file("a.bin").unwrap(), b"hello");
        assert_eq!(storage.list_files().unwrap(), vec!["a.bin".to_string()]);
    }

    #[test]
    fn test_factory_file() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let storage =
            StorageFactory::create(StorageConfig::File(FileStorageConfig::new(temp_dir.path())))
                .unwrap();
        let mut out = storage.create_output("b.bin").unwrap();
        out.write_all(b"world").unwrap();
        out.close().unwrap();

        assert_eq!(storage.file_size("b.bin").unwrap(), 5);
    }
}

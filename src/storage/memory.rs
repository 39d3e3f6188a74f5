//! In-memory storage backend.

use std::collections::{BTreeMap, HashSet};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{QuireError, Result};
use crate::storage::{Storage, StorageInput, StorageLock, StorageOutput};

/// Configuration for [`MemoryStorage`].
#[derive(Debug, Clone, Default)]
pub struct MemoryStorageConfig {
    /// Initial capacity hint for newly created files.
    pub initial_file_capacity: usize,
}

type FileData = Arc<RwLock<Vec<u8>>>;

#[derive(Debug, Default)]
struct MemoryInner {
    files: RwLock<BTreeMap<String, FileData>>,
    locks: Mutex<HashSet<String>>,
}

/// Storage keeping every file in memory.
///
/// Cloning is cheap and clones share the same files.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<MemoryInner>,
    config: MemoryStorageConfig,
}

impl MemoryStorage {
    pub fn new(config: MemoryStorageConfig) -> Self {
        MemoryStorage {
            inner: Arc::new(MemoryInner::default()),
            config,
        }
    }

    /// Total bytes held by all files.
    pub fn total_bytes(&self) -> u64 {
        self.inner
            .files
            .read()
            .values()
            .map(|data| data.read().len() as u64)
            .sum()
    }

    fn get(&self, name: &str) -> Result<FileData> {
        self.inner
            .files
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| QuireError::not_found(name))
    }
}

impl Storage for MemoryStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        let data = self.get(name)?;
        let snapshot = data.read().clone();
        Ok(Box::new(MemoryInput {
            cursor: Cursor::new(snapshot),
        }))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        let mut files = self.inner.files.write();
        if files.contains_key(name) {
            return Err(QuireError::illegal_state(format!(
                "file already exists: {name}"
            )));
        }
        let data = Arc::new(RwLock::new(Vec::with_capacity(
            self.config.initial_file_capacity,
        )));
        files.insert(name.to_string(), data.clone());
        Ok(Box::new(MemoryOutput {
            name: name.to_string(),
            data,
            closed: false,
        }))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.inner.files.read().contains_key(name)
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        Ok(self.get(name)?.read().len() as u64)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        match self.inner.files.write().remove(name) {
            Some(_) => Ok(()),
            None => Err(QuireError::not_found(name)),
        }
    }

    fn list_files(&self) -> Result<Vec<String>> {
        Ok(self.inner.files.read().keys().cloned().collect())
    }

    fn rename_file(&self, from: &str, to: &str) -> Result<()> {
        let mut files = self.inner.files.write();
        if files.contains_key(to) {
            return Err(QuireError::illegal_state(format!(
                "rename target already exists: {to}"
            )));
        }
        let data = files.remove(from).ok_or_else(|| QuireError::not_found(from))?;
        files.insert(to.to_string(), data);
        Ok(())
    }

    fn sync(&self, names: &[String]) -> Result<()> {
        let files = self.inner.files.read();
        for name in names {
            if !files.contains_key(name) {
                return Err(QuireError::not_found(name.as_str()));
            }
        }
        Ok(())
    }

    fn sync_metadata(&self) -> Result<()> {
        Ok(())
    }

    fn obtain_lock(&self, name: &str) -> Result<Box<dyn StorageLock>> {
        let mut locks = self.inner.locks.lock();
        if !locks.insert(name.to_string()) {
            return Err(QuireError::LockObtainFailed(format!(
                "lock instance already obtained: {name}"
            )));
        }
        Ok(Box::new(MemoryLock {
            name: name.to_string(),
            inner: self.inner.clone(),
        }))
    }
}

#[derive(Debug)]
struct MemoryInput {
    cursor: Cursor<Vec<u8>>,
}

impl Read for MemoryInput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl Seek for MemoryInput {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.cursor.seek(pos)
    }
}

impl StorageInput for MemoryInput {
    fn size(&self) -> Result<u64> {
        Ok(self.cursor.get_ref().len() as u64)
    }
}

#[derive(Debug)]
struct MemoryOutput {
    name: String,
    data: FileData,
    closed: bool,
}

impl Write for MemoryOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::other(format!(
                "output already closed: {}",
                self.name
            )));
        }
        self.data.write().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl StorageOutput for MemoryOutput {
    fn flush_and_sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

#[derive(Debug)]
struct MemoryLock {
    name: String,
    inner: Arc<MemoryInner>,
}

impl StorageLock for MemoryLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn ensure_valid(&self) -> Result<()> {
        if self.inner.locks.lock().contains(&self.name) {
            Ok(())
        } else {
            Err(QuireError::already_closed(format!(
                "lock was released: {}",
                self.name
            )))
        }
    }
}

impl Drop for MemoryLock {
    fn drop(&mut self) {
        self.inner.locks.lock().remove(&self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_once() {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        let mut out = storage.create_output("x").unwrap();
        out.write_all(&[1, 2, 3]).unwrap();
        out.close().unwrap();

        assert!(storage.create_output("x").is_err());
        assert_eq!(storage.file_size("x").unwrap(), 3);
        assert!(out.write_all(&[4]).is_err());
    }

    #[test]
    fn test_rename_and_delete() {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        storage.create_output("a").unwrap().close().unwrap();
        storage.create_output("b").unwrap().close().unwrap();

        assert!(storage.rename_file("a", "b").is_err());
        storage.rename_file("a", "c").unwrap();
        assert!(!storage.file_exists("a"));
        assert!(storage.file_exists("c"));

        storage.delete_file("c").unwrap();
        assert!(storage.delete_file("c").is_err());
        assert_eq!(storage.list_files().unwrap(), vec!["b".to_string()]);
    }

    #[test]
    fn test_lock_is_exclusive() {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        let lock = storage.obtain_lock("write.lock").unwrap();
        assert!(lock.ensure_valid().is_ok());
        assert!(storage.obtain_lock("write.lock").is_err());

        drop(lock);
        assert!(storage.obtain_lock("write.lock").is_ok());
    }
}

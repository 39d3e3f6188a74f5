//! File system storage backend.
//!
//! Files live directly under one directory. Writes go through a buffered
//! writer and are made durable by [`StorageOutput::flush_and_sync`] or
//! [`Storage::sync`]. Reads use plain file handles or, when configured, a
//! read-only memory map.
//!
//! # Locking
//!
//! `obtain_lock` creates the lock file if needed and takes an OS advisory lock
//! on it. A process-wide registry of held lock paths additionally rejects a
//! second lock from the same process, whatever the platform's lock semantics.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use memmap2::Mmap;
use parking_lot::Mutex;

use crate::error::{QuireError, Result};
use crate::storage::{Storage, StorageInput, StorageLock, StorageOutput};

lazy_static! {
    static ref HELD_LOCKS: Mutex<HashSet<PathBuf>> = Mutex::new(HashSet::new());
}

/// Configuration for [`FileStorage`].
#[derive(Debug, Clone)]
pub struct FileStorageConfig {
    /// Directory holding the index files.
    pub path: PathBuf,

    /// Read files through a memory map instead of buffered reads.
    pub use_mmap: bool,

    /// Buffer size for writers.
    pub buffer_size: usize,

    /// Create the directory if it does not exist.
    pub create_if_missing: bool,
}

impl FileStorageConfig {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        FileStorageConfig {
            path: path.as_ref().to_path_buf(),
            use_mmap: false,
            buffer_size: 64 * 1024,
            create_if_missing: true,
        }
    }

    pub fn with_mmap(mut self, use_mmap: bool) -> Self {
        self.use_mmap = use_mmap;
        self
    }
}

/// Storage backed by a directory on disk.
#[derive(Debug)]
pub struct FileStorage {
    config: FileStorageConfig,
}

impl FileStorage {
    pub fn new(config: FileStorageConfig) -> Result<Self> {
        if !config.path.exists() {
            if config.create_if_missing {
                fs::create_dir_all(&config.path)?;
            } else {
                return Err(QuireError::not_found(format!(
                    "storage directory {}",
                    config.path.display()
                )));
            }
        }
        if !config.path.is_dir() {
            return Err(QuireError::invalid_argument(format!(
                "not a directory: {}",
                config.path.display()
            )));
        }
        Ok(FileStorage { config })
    }

    /// Directory this storage reads and writes.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn resolve(&self, name: &str) -> PathBuf {
        self.config.path.join(name)
    }
}

impl Storage for FileStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        let path = self.resolve(name);
        let file = File::open(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => QuireError::not_found(name),
            _ => QuireError::Io(e),
        })?;

        if self.config.use_mmap {
            let len = file.metadata()?.len();
            if len == 0 {
                return Ok(Box::new(MmapInput::Empty(Cursor::new(Vec::new()))));
            }
            // SAFETY: index files are write-once; nothing truncates a file
            // while a reader holds it.
            let map = unsafe { Mmap::map(&file)? };
            return Ok(Box::new(MmapInput::Mapped(Cursor::new(map))));
        }

        let size = file.metadata()?.len();
        Ok(Box::new(FileInput { file, size }))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        let path = self.resolve(name);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => {
                    QuireError::illegal_state(format!("file already exists: {name}"))
                }
                _ => QuireError::Io(e),
            })?;
        Ok(Box::new(FileOutput {
            writer: Some(BufWriter::with_capacity(self.config.buffer_size, file)),
        }))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.resolve(name).is_file()
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        match fs::metadata(self.resolve(name)) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(QuireError::not_found(name)),
            Err(e) => Err(e.into()),
        }
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        match fs::remove_file(self.resolve(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(QuireError::not_found(name)),
            Err(e) => Err(e.into()),
        }
    }

    fn list_files(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.config.path)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn rename_file(&self, from: &str, to: &str) -> Result<()> {
        let target = self.resolve(to);
        if target.exists() {
            return Err(QuireError::illegal_state(format!(
                "rename target already exists: {to}"
            )));
        }
        fs::rename(self.resolve(from), target)?;
        Ok(())
    }

    fn sync(&self, names: &[String]) -> Result<()> {
        for name in names {
            let file = OpenOptions::new()
                .read(true)
                .open(self.resolve(name))
                .map_err(|e| match e.kind() {
                    io::ErrorKind::NotFound => QuireError::not_found(name.as_str()),
                    _ => QuireError::Io(e),
                })?;
            file.sync_all()?;
        }
        Ok(())
    }

    fn sync_metadata(&self) -> Result<()> {
        #[cfg(unix)]
        {
            File::open(&self.config.path)?.sync_all()?;
        }
        Ok(())
    }

    fn obtain_lock(&self, name: &str) -> Result<Box<dyn StorageLock>> {
        let path = self.resolve(name);
        let canonical = fs::canonicalize(&self.config.path)?.join(name);

        {
            let mut held = HELD_LOCKS.lock();
            if !held.insert(canonical.clone()) {
                return Err(QuireError::LockObtainFailed(format!(
                    "lock held by this process: {}",
                    path.display()
                )));
            }
        }

        let file = match OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
        {
            Ok(file) => file,
            Err(e) => {
                HELD_LOCKS.lock().remove(&canonical);
                return Err(e.into());
            }
        };

        if let Err(e) = file.try_lock() {
            HELD_LOCKS.lock().remove(&canonical);
            return Err(QuireError::LockObtainFailed(format!(
                "lock held elsewhere: {}: {e}",
                path.display()
            )));
        }

        Ok(Box::new(FileLock {
            name: name.to_string(),
            path,
            canonical,
            file: Some(file),
        }))
    }
}

#[derive(Debug)]
struct FileInput {
    file: File,
    size: u64,
}

impl Read for FileInput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Seek for FileInput {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

impl StorageInput for FileInput {
    fn size(&self) -> Result<u64> {
        Ok(self.size)
    }
}

#[derive(Debug)]
enum MmapInput {
    Mapped(Cursor<Mmap>),
    Empty(Cursor<Vec<u8>>),
}

impl Read for MmapInput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            MmapInput::Mapped(cursor) => cursor.read(buf),
            MmapInput::Empty(cursor) => cursor.read(buf),
        }
    }
}

impl Seek for MmapInput {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            MmapInput::Mapped(cursor) => cursor.seek(pos),
            MmapInput::Empty(cursor) => cursor.seek(pos),
        }
    }
}

impl StorageInput for MmapInput {
    fn size(&self) -> Result<u64> {
        Ok(match self {
            MmapInput::Mapped(cursor) => cursor.get_ref().len() as u64,
            MmapInput::Empty(_) => 0,
        })
    }
}

#[derive(Debug)]
struct FileOutput {
    writer: Option<BufWriter<File>>,
}

impl FileOutput {
    fn writer(&mut self) -> io::Result<&mut BufWriter<File>> {
        self.writer
            .as_mut()
            .ok_or_else(|| io::Error::other("output already closed"))
    }
}

impl Write for FileOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer()?.flush()
    }
}

impl StorageOutput for FileOutput {
    fn flush_and_sync(&mut self) -> Result<()> {
        let writer = self.writer()?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct FileLock {
    name: String,
    path: PathBuf,
    canonical: PathBuf,
    file: Option<File>,
}

impl StorageLock for FileLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn ensure_valid(&self) -> Result<()> {
        if self.file.is_none() || !HELD_LOCKS.lock().contains(&self.canonical) {
            return Err(QuireError::already_closed(format!(
                "lock was released: {}",
                self.path.display()
            )));
        }
        if !self.path.exists() {
            return Err(QuireError::already_closed(format!(
                "lock file was removed externally: {}",
                self.path.display()
            )));
        }
        Ok(())
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = file.unlock();
        }
        HELD_LOCKS.lock().remove(&self.canonical);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(storage: &FileStorage, name: &str, data: &[u8]) {
        let mut out = storage.create_output(name).unwrap();
        out.write_all(data).unwrap();
        out.flush_and_sync().unwrap();
        out.close().unwrap();
    }

    #[test]
    fn test_file_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FileStorage::new(FileStorageConfig::new(temp_dir.path())).unwrap();

        write(&storage, "seg.bin", b"abcdef");
        assert!(storage.file_exists("seg.bin"));
        assert_eq!(storage.read_file("seg.bin").unwrap(), b"abcdef");
        assert!(storage.create_output("seg.bin").is_err());
    }

    #[test]
    fn test_mmap_read() {
        let temp_dir = TempDir::new().unwrap();
        let storage =
            FileStorage::new(FileStorageConfig::new(temp_dir.path()).with_mmap(true)).unwrap();

        write(&storage, "m.bin", &[7u8; 1000]);
        write(&storage, "empty.bin", &[]);
        assert_eq!(storage.read_file("m.bin").unwrap(), vec![7u8; 1000]);
        assert!(storage.read_file("empty.bin").unwrap().is_empty());
    }

    #[test]
    fn test_list_sorted_and_rename() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FileStorage::new(FileStorageConfig::new(temp_dir.path())).unwrap();

        write(&storage, "b", b"1");
        write(&storage, "a", b"2");
        storage.rename_file("b", "c").unwrap();
        assert!(storage.rename_file("a", "c").is_err());
        assert_eq!(
            storage.list_files().unwrap(),
            vec!["a".to_string(), "c".to_string()]
        );
        storage.sync(&["a".to_string(), "c".to_string()]).unwrap();
        storage.sync_metadata().unwrap();
    }

    #[test]
    fn test_lock_exclusive_within_process() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FileStorage::new(FileStorageConfig::new(temp_dir.path())).unwrap();
        let other = FileStorage::new(FileStorageConfig::new(temp_dir.path())).unwrap();

        let lock = storage.obtain_lock("write.lock").unwrap();
        lock.ensure_valid().unwrap();
        assert!(matches!(
            other.obtain_lock("write.lock"),
            Err(QuireError::LockObtainFailed(_))
        ));

        drop(lock);
        let relocked = other.obtain_lock("write.lock").unwrap();
        relocked.ensure_valid().unwrap();
    }
}

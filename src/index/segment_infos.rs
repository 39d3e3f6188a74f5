//! The list of segments that makes up one commit point.
//!
//! A commit is a `segments_N` file. `N` grows with every commit and the file
//! with the highest `N` is the current index. Commits are written in two
//! steps: [`SegmentInfos::prepare_commit`] writes `pending_segments_N` and
//! syncs it, [`SegmentInfos::finish_commit`] renames it into place. A crash
//! between the two leaves the previous commit authoritative.
//!
//! # File layout
//!
//! ```text
//! header(magic, version)
//! string   library version
//! [16]u8   commit id
//! u64      version
//! varint   segment name counter
//! varint   segment count
//! per segment:
//!   string name, [16]u8 segment id, string codec
//!   zvarint del_gen, varint del_count
//!   zvarint field_infos_gen, zvarint dv_gen, varint soft_del_count
//!   bool + [16]u8 commit info id
//!   string set  field infos update files
//!   varint count, (varint field, string set)* doc values update files
//! string map user data
//! footer
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use log::{debug, warn};

use crate::error::{QuireError, Result};
use crate::index::codec::codec_for_name;
use crate::index::file_names::{self, SEGMENTS};
use crate::index::segment_info::{ID_LENGTH, SegmentCommitInfo, random_id};
use crate::storage::Storage;
use crate::storage::structured::{create_writer, open_verified};

const SEGMENTS_MAGIC: u32 = 0x5153_4547; // "QSEG"
const SEGMENTS_FORMAT_VERSION: u32 = 1;
const MAX_READ_RETRIES: usize = 10;

/// Ordered list of committed segments plus commit-level metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfos {
    segments: Vec<SegmentCommitInfo>,
    /// Counter for new segment names.
    pub counter: u64,
    /// Bumped on every change; used to detect stale NRT readers.
    pub version: u64,
    generation: i64,
    last_generation: i64,
    pending_generation: Option<i64>,
    id: [u8; ID_LENGTH],
    user_data: BTreeMap<String, String>,
}

impl Default for SegmentInfos {
    fn default() -> Self {
        SegmentInfos {
            segments: Vec::new(),
            counter: 0,
            version: 0,
            generation: -1,
            last_generation: -1,
            pending_generation: None,
            id: random_id(),
            user_data: BTreeMap::new(),
        }
    }
}

/// Highest commit generation among `files`, or -1.
pub fn last_commit_generation<S: AsRef<str>>(files: &[S]) -> i64 {
    files
        .iter()
        .map(AsRef::as_ref)
        .filter(|f| file_names::is_segments_file(f))
        .filter_map(|f| file_names::generation_from_segments_file_name(f).ok())
        .max()
        .unwrap_or(-1)
}

/// Name of the current commit file in `storage`.
pub fn last_commit_segments_file_name(storage: &dyn Storage) -> Result<String> {
    let generation = last_commit_generation(&storage.list_files()?);
    if generation == -1 {
        return Err(QuireError::IndexNotFound(format!(
            "no {SEGMENTS}* file found in {storage:?}"
        )));
    }
    Ok(file_names::segments_file_name(generation))
}

impl SegmentInfos {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the latest commit, retrying when a concurrent commit removes the
    /// file between listing and reading it.
    pub fn read_latest_commit(storage: &dyn Storage) -> Result<Self> {
        let mut last_error = None;
        for _ in 0..MAX_READ_RETRIES {
            let name = last_commit_segments_file_name(storage)?;
            match Self::read_commit(storage, &name) {
                Ok(infos) => return Ok(infos),
                Err(QuireError::FileNotFound(msg)) => {
                    debug!("commit {name} vanished while reading: {msg}; retrying");
                    last_error = Some(QuireError::FileNotFound(msg));
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| QuireError::IndexNotFound("no readable commit".into())))
    }

    /// Read one `segments_N` file and the segment infos it references.
    pub fn read_commit(storage: &dyn Storage, segments_file: &str) -> Result<Self> {
        let generation = file_names::generation_from_segments_file_name(segments_file)?;
        let mut input = open_verified(storage, segments_file)?;
        input.check_header(SEGMENTS_MAGIC, SEGMENTS_FORMAT_VERSION, SEGMENTS_FORMAT_VERSION)?;
        let _written_by = input.read_string()?;
        let id = read_id(input.read_raw(ID_LENGTH)?)?;
        let version = input.read_u64()?;
        let counter = input.read_varint()?;
        let count = input.read_varint()?;

        let mut segments = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let name = input.read_string()?;
            let segment_id = read_id(input.read_raw(ID_LENGTH)?)?;
            let codec_name = input.read_string()?;
            let del_gen = input.read_zvarint()?;
            let del_count = input.read_varint_u32()?;
            let field_infos_gen = input.read_zvarint()?;
            let dv_gen = input.read_zvarint()?;
            let soft_del_count = input.read_varint_u32()?;
            let commit_id = if input.read_bool()? {
                Some(read_id(input.read_raw(ID_LENGTH)?)?)
            } else {
                None
            };
            let field_infos_files = input.read_string_set()?;
            let dv_field_count = input.read_varint()?;
            let mut dv_updates_files = BTreeMap::new();
            for _ in 0..dv_field_count {
                let field = input.read_varint_u32()?;
                dv_updates_files.insert(field, input.read_string_set()?);
            }

            let segment_number = name
                .strip_prefix('_')
                .map(file_names::from_base36)
                .transpose()?
                .ok_or_else(|| QuireError::corrupt(format!("invalid segment name {name}")))?;
            if segment_number >= counter {
                return Err(QuireError::corrupt(format!(
                    "{segments_file}: segment {name} is not below counter {counter}"
                )));
            }

            let codec = codec_for_name(&codec_name)?;
            let info = codec.read_segment_info(storage, &name, &segment_id)?;
            let mut commit = SegmentCommitInfo::new(
                Arc::new(info),
                del_count,
                soft_del_count,
                del_gen,
                field_infos_gen,
                dv_gen,
                commit_id,
            )
            .map_err(|e| QuireError::corrupt(format!("{segments_file}: {e}")))?;
            commit.set_field_infos_files(field_infos_files);
            commit.set_dv_updates_files(dv_updates_files);
            segments.push(commit);
        }
        let user_data = input.read_string_map()?;

        debug!("read {segments_file} with {} segments", segments.len());
        Ok(SegmentInfos {
            segments,
            counter,
            version,
            generation,
            last_generation: generation,
            pending_generation: None,
            id,
            user_data,
        })
    }

    /// Write `pending_segments_N` for the next generation and sync it.
    ///
    /// The segment files themselves must already be synced by the caller.
    pub fn prepare_commit(&mut self, storage: &dyn Storage) -> Result<String> {
        if self.pending_generation.is_some() {
            return Err(QuireError::illegal_state("prepare_commit was already called"));
        }
        let next = if self.generation == -1 {
            1
        } else {
            self.generation + 1
        };
        let name = file_names::pending_segments_file_name(next);
        self.id = random_id();
        if let Err(e) = self.write_to(storage, &name) {
            if storage.file_exists(&name) {
                if let Err(delete_error) = storage.delete_file(&name) {
                    warn!("failed to delete partial commit {name}: {delete_error}");
                }
            }
            return Err(e);
        }
        storage.sync(std::slice::from_ref(&name))?;
        self.pending_generation = Some(next);
        Ok(name)
    }

    /// Rename the pending commit into place. Returns the new segments file.
    pub fn finish_commit(&mut self, storage: &dyn Storage) -> Result<String> {
        let next = self
            .pending_generation
            .ok_or_else(|| QuireError::illegal_state("prepare_commit was not called"))?;
        let pending = file_names::pending_segments_file_name(next);
        let name = file_names::segments_file_name(next);
        let result = storage
            .rename_file(&pending, &name)
            .and_then(|_| storage.sync_metadata());
        self.pending_generation = None;
        if let Err(e) = result {
            self.rollback_commit(storage);
            return Err(e);
        }
        self.generation = next;
        self.last_generation = next;
        Ok(name)
    }

    /// Delete a pending commit file, if any.
    pub fn rollback_commit(&mut self, storage: &dyn Storage) {
        let next = self.pending_generation.take().unwrap_or(if self.generation == -1 {
            1
        } else {
            self.generation + 1
        });
        let pending = file_names::pending_segments_file_name(next);
        if storage.file_exists(&pending) {
            if let Err(e) = storage.delete_file(&pending) {
                warn!("failed to delete pending commit {pending}: {e}");
            }
        }
    }

    fn write_to(&self, storage: &dyn Storage, name: &str) -> Result<()> {
        let mut out = create_writer(storage, name)?;
        out.write_header(SEGMENTS_MAGIC, SEGMENTS_FORMAT_VERSION)?;
        out.write_string(crate::VERSION)?;
        out.write_raw(&self.id)?;
        out.write_u64(self.version)?;
        out.write_varint(self.counter)?;
        out.write_varint(self.segments.len() as u64)?;
        for commit in &self.segments {
            let info = commit.info();
            out.write_string(&info.name)?;
            out.write_raw(&info.id)?;
            out.write_string(&info.codec)?;
            out.write_zvarint(commit.del_gen())?;
            out.write_varint(commit.del_count() as u64)?;
            out.write_zvarint(commit.field_infos_gen())?;
            out.write_zvarint(commit.dv_gen())?;
            out.write_varint(commit.soft_del_count() as u64)?;
            out.write_bool(true)?;
            out.write_raw(&commit.id())?;
            out.write_string_set(commit.field_infos_files())?;
            out.write_varint(commit.dv_updates_files().len() as u64)?;
            for (field, files) in commit.dv_updates_files() {
                out.write_varint(*field as u64)?;
                out.write_string_set(files)?;
            }
        }
        out.write_string_map(&self.user_data)?;
        out.finish()
    }

    pub fn segments(&self) -> &[SegmentCommitInfo] {
        &self.segments
    }

    pub fn segments_mut(&mut self) -> &mut Vec<SegmentCommitInfo> {
        &mut self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&SegmentCommitInfo> {
        self.segments.iter().find(|s| s.name() == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut SegmentCommitInfo> {
        self.segments.iter_mut().find(|s| s.name() == name)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.segments.iter().position(|s| s.name() == name)
    }

    pub fn add(&mut self, commit: SegmentCommitInfo) -> Result<()> {
        if self.get(commit.name()).is_some() {
            return Err(QuireError::illegal_state(format!(
                "segment {} is already in the index",
                commit.name()
            )));
        }
        self.segments.push(commit);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Option<SegmentCommitInfo> {
        let pos = self.position(name)?;
        Some(self.segments.remove(pos))
    }

    pub fn clear(&mut self) {
        self.segments.clear();
    }

    /// Replace the segment list with another one's, keeping generations.
    pub fn replace(&mut self, other: &SegmentInfos) {
        self.segments = other.segments.clone();
        self.user_data = other.user_data.clone();
    }

    /// Take over the generation of a commit written from a clone.
    pub fn update_generation(&mut self, other: &SegmentInfos) {
        self.generation = other.generation;
        self.last_generation = other.last_generation;
    }

    /// Copy the generation so a later prepare writes past it.
    pub fn set_next_write_generation(&mut self, generation: i64) {
        if generation > self.generation {
            self.generation = generation;
        }
    }

    /// Total document slots across all segments.
    pub fn total_max_doc(&self) -> u64 {
        self.segments.iter().map(|s| s.max_doc() as u64).sum()
    }

    /// Allocate a new segment name.
    pub fn new_segment_name(&mut self) -> String {
        let name = file_names::segment_name(self.counter);
        self.counter += 1;
        self.version += 1;
        name
    }

    /// Record a change visible to NRT readers.
    pub fn changed(&mut self) {
        self.version += 1;
    }

    pub fn generation(&self) -> i64 {
        self.generation
    }

    pub fn last_generation(&self) -> i64 {
        self.last_generation
    }

    pub fn id(&self) -> [u8; ID_LENGTH] {
        self.id
    }

    pub fn user_data(&self) -> &BTreeMap<String, String> {
        &self.user_data
    }

    pub fn set_user_data(
        &mut self,
        user_data: BTreeMap<String, String>,
        do_increment_version: bool,
    ) {
        self.user_data = user_data;
        if do_increment_version {
            self.changed();
        }
    }

    /// Name of the segments file of the last read or written commit.
    pub fn segments_file_name(&self) -> Option<String> {
        file_names::file_name_from_generation(SEGMENTS, "", self.last_generation)
    }

    /// Every file referenced by this commit.
    pub fn files(&self, include_segments_file: bool) -> BTreeSet<String> {
        let mut files = BTreeSet::new();
        if include_segments_file {
            if let Some(name) = self.segments_file_name() {
                files.insert(name);
            }
        }
        for commit in &self.segments {
            files.extend(commit.files());
        }
        files
    }
}

fn read_id(bytes: Vec<u8>) -> Result<[u8; ID_LENGTH]> {
    bytes
        .try_into()
        .map_err(|_| QuireError::corrupt("segment id has the wrong length"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::codec::{Codec, StandardCodec};
    use crate::index::field_info::{FieldInfo, FieldInfos};
    use crate::index::segment_core::SegmentCore;
    use crate::index::segment_info::SegmentInfo;
    use crate::storage::memory::{MemoryStorage, MemoryStorageConfig};

    fn write_segment(storage: &dyn Storage, name: &str, max_doc: u32) -> SegmentCommitInfo {
        let field_infos = FieldInfos::new(vec![FieldInfo::new("id", 0)]).unwrap();
        let core = SegmentCore::new(
            max_doc,
            field_infos,
            BTreeMap::new(),
            vec![Vec::new(); max_doc as usize],
            BTreeMap::new(),
            BTreeMap::new(),
        )
        .unwrap();
        let mut info = SegmentInfo::new(name, max_doc, "Quire10", BTreeMap::new(), None);
        StandardCodec
            .write_segment(storage, &mut info, &core, false)
            .unwrap();
        SegmentCommitInfo::for_new_segment(info)
    }

    #[test]
    fn test_commit_round_trip() {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        let mut infos = SegmentInfos::new();
        let a = infos.new_segment_name();
        let b = infos.new_segment_name();
        let seg_a = write_segment(&storage, &a, 4);
        let mut seg_b = write_segment(&storage, &b, 6);
        seg_b.set_del_counts(2, 1).unwrap();
        seg_b.advance_del_gen();
        infos.add(seg_a).unwrap();
        infos.add(seg_b).unwrap();
        let mut data = BTreeMap::new();
        data.insert("checkpoint".to_string(), "42".to_string());
        infos.set_user_data(data, true);

        let pending = infos.prepare_commit(&storage).unwrap();
        assert_eq!(pending, "pending_segments_1");
        assert!(last_commit_segments_file_name(&storage).is_err());
        let name = infos.finish_commit(&storage).unwrap();
        assert_eq!(name, "segments_1");
        assert!(!storage.file_exists("pending_segments_1"));

        let read = SegmentInfos::read_latest_commit(&storage).unwrap();
        assert_eq!(read, infos);
        assert_eq!(read.segments()[1].del_count(), 2);
        assert_eq!(read.segments()[1].soft_del_count(), 1);
        assert_eq!(read.segments()[1].del_gen(), 1);
        assert_eq!(read.segments()[1].next_write_del_gen(), 2);
        assert_eq!(read.user_data().get("checkpoint").map(String::as_str), Some("42"));
        assert!(read.files(true).contains("segments_1"));
        assert!(read.files(true).contains("_1.si"));
    }

    #[test]
    fn test_generation_increases() {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        let mut infos = SegmentInfos::new();
        infos.prepare_commit(&storage).unwrap();
        infos.finish_commit(&storage).unwrap();
        infos.prepare_commit(&storage).unwrap();
        infos.finish_commit(&storage).unwrap();
        assert_eq!(infos.generation(), 2);
        assert_eq!(last_commit_segments_file_name(&storage).unwrap(), "segments_2");
    }

    #[test]
    fn test_rollback_pending_commit() {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        let mut infos = SegmentInfos::new();
        infos.prepare_commit(&storage).unwrap();
        assert!(storage.file_exists("pending_segments_1"));
        infos.rollback_commit(&storage);
        assert!(!storage.file_exists("pending_segments_1"));
        assert!(matches!(
            SegmentInfos::read_latest_commit(&storage),
            Err(QuireError::IndexNotFound(_))
        ));
    }

    #[test]
    fn test_last_commit_generation() {
        let files = ["segments_2", "segments_a", "pending_segments_z", "_0.si"];
        assert_eq!(last_commit_generation(&files), 10);
        assert_eq!(last_commit_generation::<&str>(&[]), -1);
    }
}

//! Segment descriptors.
//!
//! [`SegmentInfo`] describes one physical segment and never changes after it
//! is written. [`SegmentCommitInfo`] wraps it with the per-commit overlay:
//! delete counts and the generations of live docs, field infos updates and
//! doc values updates.
//!
//! # Generations
//!
//! Each overlay kind keeps a `(gen, next_write_gen)` pair. A successful write
//! moves `gen` to `next_write_gen` and bumps `next_write_gen`; a failed write
//! only bumps `next_write_gen`, so a partially written file name is never
//! reused. Every advance re-stamps the commit id, so two commit infos with
//! the same id always describe the same content.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use uuid::Uuid;

use crate::error::{QuireError, Result};
use crate::index::file_names::{self, LIVE_DOCS_EXTENSION};
use crate::index::sorter::IndexSort;
use crate::storage::Storage;

/// Length of segment and commit ids.
pub const ID_LENGTH: usize = 16;

/// Random identifier.
pub fn random_id() -> [u8; ID_LENGTH] {
    *Uuid::new_v4().as_bytes()
}

/// Immutable description of one physical segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
    pub name: String,
    pub max_doc: u32,
    pub is_compound_file: bool,
    pub id: [u8; ID_LENGTH],
    pub codec: String,
    pub diagnostics: BTreeMap<String, String>,
    pub attributes: BTreeMap<String, String>,
    pub index_sort: Option<IndexSort>,
    /// Version of the library that wrote the segment.
    pub version: String,
    /// Oldest library version that contributed documents.
    pub min_version: Option<String>,
    files: BTreeSet<String>,
}

impl SegmentInfo {
    pub fn new<S: Into<String>, C: Into<String>>(
        name: S,
        max_doc: u32,
        codec: C,
        diagnostics: BTreeMap<String, String>,
        index_sort: Option<IndexSort>,
    ) -> Self {
        SegmentInfo {
            name: name.into(),
            max_doc,
            is_compound_file: false,
            id: random_id(),
            codec: codec.into(),
            diagnostics,
            attributes: BTreeMap::new(),
            index_sort,
            version: crate::VERSION.to_string(),
            min_version: Some(crate::VERSION.to_string()),
            files: BTreeSet::new(),
        }
    }

    /// Files of the segment itself (without generational overlays).
    pub fn files(&self) -> &BTreeSet<String> {
        &self.files
    }

    /// Replace the file set. Every file must belong to this segment.
    pub fn set_files<I: IntoIterator<Item = String>>(&mut self, files: I) -> Result<()> {
        let files: BTreeSet<String> = files.into_iter().collect();
        for file in &files {
            if file_names::parse_segment_name(file) != Some(self.name.as_str()) {
                return Err(QuireError::invalid_argument(format!(
                    "file {file} does not belong to segment {}",
                    self.name
                )));
            }
        }
        self.files = files;
        Ok(())
    }

    /// Total size of the segment's files.
    pub fn size_in_bytes(&self, storage: &dyn Storage) -> Result<u64> {
        let mut total = 0;
        for file in &self.files {
            total += storage.file_size(file)?;
        }
        Ok(total)
    }
}

/// A segment plus its per-commit overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentCommitInfo {
    info: Arc<SegmentInfo>,
    id: [u8; ID_LENGTH],
    del_count: u32,
    soft_del_count: u32,
    del_gen: i64,
    next_write_del_gen: i64,
    field_infos_gen: i64,
    next_write_field_infos_gen: i64,
    dv_gen: i64,
    next_write_dv_gen: i64,
    /// Doc values update files per field number.
    dv_updates_files: BTreeMap<u32, BTreeSet<String>>,
    field_infos_files: BTreeSet<String>,
}

fn next_gen(generation: i64) -> i64 {
    if generation == -1 { 1 } else { generation + 1 }
}

impl SegmentCommitInfo {
    pub fn new(
        info: Arc<SegmentInfo>,
        del_count: u32,
        soft_del_count: u32,
        del_gen: i64,
        field_infos_gen: i64,
        dv_gen: i64,
        id: Option<[u8; ID_LENGTH]>,
    ) -> Result<Self> {
        let mut commit = SegmentCommitInfo {
            info,
            id: id.unwrap_or_else(random_id),
            del_count: 0,
            soft_del_count: 0,
            del_gen,
            next_write_del_gen: next_gen(del_gen),
            field_infos_gen,
            next_write_field_infos_gen: next_gen(field_infos_gen),
            dv_gen,
            next_write_dv_gen: next_gen(dv_gen),
            dv_updates_files: BTreeMap::new(),
            field_infos_files: BTreeSet::new(),
        };
        commit.set_del_count(del_count)?;
        commit.set_soft_del_count(soft_del_count)?;
        Ok(commit)
    }

    /// Fresh commit info for a newly flushed or merged segment.
    pub fn for_new_segment(info: SegmentInfo) -> Self {
        SegmentCommitInfo {
            info: Arc::new(info),
            id: random_id(),
            del_count: 0,
            soft_del_count: 0,
            del_gen: -1,
            next_write_del_gen: 1,
            field_infos_gen: -1,
            next_write_field_infos_gen: 1,
            dv_gen: -1,
            next_write_dv_gen: 1,
            dv_updates_files: BTreeMap::new(),
            field_infos_files: BTreeSet::new(),
        }
    }

    pub fn info(&self) -> &Arc<SegmentInfo> {
        &self.info
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn max_doc(&self) -> u32 {
        self.info.max_doc
    }

    pub fn id(&self) -> [u8; ID_LENGTH] {
        self.id
    }

    /// Hard deletes.
    pub fn del_count(&self) -> u32 {
        self.del_count
    }

    /// Documents soft-deleted and not also hard-deleted.
    pub fn soft_del_count(&self) -> u32 {
        self.soft_del_count
    }

    /// Deletes, optionally including soft deletes.
    pub fn del_count_with_soft(&self, include_soft_deletes: bool) -> u32 {
        if include_soft_deletes {
            self.del_count + self.soft_del_count
        } else {
            self.del_count
        }
    }

    pub fn live_count(&self, include_soft_deletes: bool) -> u32 {
        self.max_doc() - self.del_count_with_soft(include_soft_deletes)
    }

    pub fn set_del_count(&mut self, del_count: u32) -> Result<()> {
        let max_doc = self.max_doc();
        if del_count > max_doc || del_count as u64 + self.soft_del_count as u64 > max_doc as u64 {
            return Err(QuireError::invalid_argument(format!(
                "invalid delCount={del_count} (softDelCount={}, maxDoc={max_doc}) for segment {}",
                self.soft_del_count,
                self.name()
            )));
        }
        self.del_count = del_count;
        Ok(())
    }

    pub fn set_soft_del_count(&mut self, soft_del_count: u32) -> Result<()> {
        let max_doc = self.max_doc();
        if soft_del_count > max_doc
            || soft_del_count as u64 + self.del_count as u64 > max_doc as u64
        {
            return Err(QuireError::invalid_argument(format!(
                "invalid softDelCount={soft_del_count} (delCount={}, maxDoc={max_doc}) for segment {}",
                self.del_count,
                self.name()
            )));
        }
        self.soft_del_count = soft_del_count;
        Ok(())
    }

    /// Set both counts at once, validating the combined bound.
    pub fn set_del_counts(&mut self, del_count: u32, soft_del_count: u32) -> Result<()> {
        let max_doc = self.max_doc();
        if del_count as u64 + soft_del_count as u64 > max_doc as u64 {
            return Err(QuireError::invalid_argument(format!(
                "delCount={del_count} + softDelCount={soft_del_count} exceeds maxDoc={max_doc} for segment {}",
                self.name()
            )));
        }
        self.del_count = del_count;
        self.soft_del_count = soft_del_count;
        Ok(())
    }

    pub fn is_fully_deleted(&self, include_soft_deletes: bool) -> bool {
        self.del_count_with_soft(include_soft_deletes) == self.max_doc()
    }

    pub fn del_gen(&self) -> i64 {
        self.del_gen
    }

    pub fn next_write_del_gen(&self) -> i64 {
        self.next_write_del_gen
    }

    pub fn field_infos_gen(&self) -> i64 {
        self.field_infos_gen
    }

    pub fn next_write_field_infos_gen(&self) -> i64 {
        self.next_write_field_infos_gen
    }

    pub fn dv_gen(&self) -> i64 {
        self.dv_gen
    }

    pub fn next_write_dv_gen(&self) -> i64 {
        self.next_write_dv_gen
    }

    pub fn has_deletions(&self) -> bool {
        self.del_gen != -1
    }

    pub fn has_field_updates(&self) -> bool {
        self.field_infos_gen != -1
    }

    /// Live docs were written successfully.
    pub fn advance_del_gen(&mut self) {
        self.del_gen = self.next_write_del_gen;
        self.next_write_del_gen += 1;
        self.generation_advanced();
    }

    /// Writing live docs failed; skip the generation.
    pub fn advance_next_write_del_gen(&mut self) {
        self.next_write_del_gen += 1;
    }

    pub fn advance_field_infos_gen(&mut self) {
        self.field_infos_gen = self.next_write_field_infos_gen;
        self.next_write_field_infos_gen += 1;
        self.generation_advanced();
    }

    pub fn advance_next_write_field_infos_gen(&mut self) {
        self.next_write_field_infos_gen += 1;
    }

    pub fn advance_dv_gen(&mut self) {
        self.dv_gen = self.next_write_dv_gen;
        self.next_write_dv_gen += 1;
        self.generation_advanced();
    }

    pub fn advance_next_write_dv_gen(&mut self) {
        self.next_write_dv_gen += 1;
    }

    /// Restore write generations read back from a commit.
    pub fn set_next_write_gens(&mut self, del: i64, field_infos: i64, dv: i64) {
        self.next_write_del_gen = del.max(next_gen(self.del_gen));
        self.next_write_field_infos_gen = field_infos.max(next_gen(self.field_infos_gen));
        self.next_write_dv_gen = dv.max(next_gen(self.dv_gen));
    }

    fn generation_advanced(&mut self) {
        self.id = random_id();
    }

    pub fn dv_updates_files(&self) -> &BTreeMap<u32, BTreeSet<String>> {
        &self.dv_updates_files
    }

    pub fn set_dv_updates_files(&mut self, files: BTreeMap<u32, BTreeSet<String>>) {
        self.dv_updates_files = files;
    }

    pub fn field_infos_files(&self) -> &BTreeSet<String> {
        &self.field_infos_files
    }

    pub fn set_field_infos_files(&mut self, files: BTreeSet<String>) {
        self.field_infos_files = files;
    }

    /// Live docs file of the current deletion generation.
    pub fn live_docs_file(&self) -> Option<String> {
        file_names::file_name_from_generation(self.name(), LIVE_DOCS_EXTENSION, self.del_gen)
    }

    /// Every file this commit info references.
    pub fn files(&self) -> BTreeSet<String> {
        let mut files = self.info.files().clone();
        if let Some(liv) = self.live_docs_file() {
            files.insert(liv);
        }
        files.extend(self.field_infos_files.iter().cloned());
        for set in self.dv_updates_files.values() {
            files.extend(set.iter().cloned());
        }
        files
    }

    pub fn size_in_bytes(&self, storage: &dyn Storage) -> Result<u64> {
        let mut total = 0;
        for file in self.files() {
            total += storage.file_size(&file)?;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(max_doc: u32) -> Arc<SegmentInfo> {
        Arc::new(SegmentInfo::new("_0", max_doc, "Quire10", BTreeMap::new(), None))
    }

    #[test]
    fn test_generation_advance() {
        let mut commit = SegmentCommitInfo::new(segment(10), 0, 0, -1, -1, -1, None).unwrap();
        assert_eq!(commit.del_gen(), -1);
        assert_eq!(commit.next_write_del_gen(), 1);

        let id = commit.id();
        commit.advance_del_gen();
        assert_eq!(commit.del_gen(), 1);
        assert_eq!(commit.next_write_del_gen(), 2);
        assert_ne!(commit.id(), id);

        // failed write: only next gen moves, id stays
        let id = commit.id();
        commit.advance_next_write_del_gen();
        commit.advance_next_write_del_gen();
        assert_eq!(commit.del_gen(), 1);
        assert_eq!(commit.next_write_del_gen(), 4);
        assert_eq!(commit.id(), id);

        commit.advance_del_gen();
        assert_eq!(commit.del_gen(), 4);
        assert_eq!(commit.next_write_del_gen(), commit.del_gen() + 1);
    }

    #[test]
    fn test_independent_generations() {
        let mut commit = SegmentCommitInfo::new(segment(10), 0, 0, 3, -1, 2, None).unwrap();
        assert_eq!(commit.next_write_del_gen(), 4);
        assert_eq!(commit.next_write_dv_gen(), 3);

        commit.advance_field_infos_gen();
        assert_eq!(commit.field_infos_gen(), 1);
        assert_eq!(commit.next_write_field_infos_gen(), 2);
        assert_eq!(commit.dv_gen(), 2);
        assert_eq!(commit.next_write_dv_gen(), 3);
    }

    #[test]
    fn test_delete_count_bound() {
        let mut commit = SegmentCommitInfo::new(segment(5), 3, 2, -1, -1, -1, None).unwrap();
        assert_eq!(commit.del_count_with_soft(true), 5);
        assert!(commit.is_fully_deleted(true));
        assert!(!commit.is_fully_deleted(false));

        assert!(commit.set_del_count(4).is_err());
        assert_eq!(commit.del_count(), 3);
        assert!(commit.set_soft_del_count(3).is_err());
        assert!(commit.set_del_counts(6, 0).is_err());
        assert!(SegmentCommitInfo::new(segment(5), 4, 2, -1, -1, -1, None).is_err());
        assert_eq!(commit.soft_del_count(), 2);
    }

    #[test]
    fn test_files_include_generations() {
        let mut info = SegmentInfo::new("_0", 4, "Quire10", BTreeMap::new(), None);
        info.set_files(vec!["_0.si".to_string(), "_0.pst".to_string()])
            .unwrap();
        assert!(info.set_files(vec!["_1.si".to_string()]).is_err());

        let mut commit = SegmentCommitInfo::for_new_segment(info);
        commit.advance_del_gen();
        commit.set_field_infos_files(["_0_1.fnm".to_string()].into_iter().collect());
        let mut dv = BTreeMap::new();
        dv.insert(2, ["_0_1.dvu".to_string()].into_iter().collect());
        commit.set_dv_updates_files(dv);

        let files = commit.files();
        assert!(files.contains("_0_1.liv"));
        assert!(files.contains("_0_1.fnm"));
        assert!(files.contains("_0_1.dvu"));
        assert!(files.contains("_0.pst"));
    }
}

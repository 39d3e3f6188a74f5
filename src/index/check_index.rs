//! Offline consistency check of the latest commit.
//!
//! Every file the commit references is read in full and its checksum
//! footer verified. Each segment is then loaded and its counts compared
//! with the commit: document count, hard and soft deletes, posting lists
//! and per-document columns.

use std::collections::BTreeSet;

use log::{info, warn};
use serde::Serialize;

use crate::error::{QuireError, Result};
use crate::index::dwpt::soft_deleted_count;
use crate::index::live_docs::LiveDocs;
use crate::index::segment_core::SegmentCore;
use crate::index::segment_info::SegmentCommitInfo;
use crate::index::segment_infos::SegmentInfos;
use crate::index::segment_reader::{load_core, load_live_docs};
use crate::storage::Storage;
use crate::storage::structured::read_verified;

/// Findings for one segment.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SegmentStatus {
    pub name: String,
    pub max_doc: u32,
    pub num_docs: u32,
    pub del_count: u32,
    pub soft_del_count: u32,
    pub num_files: usize,
    pub num_fields: usize,
    pub num_terms: u64,
    pub num_postings: u64,
    pub problems: Vec<String>,
}

impl SegmentStatus {
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Result of [`CheckIndex::check`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct CheckIndexStatus {
    pub segments_file: Option<String>,
    pub generation: i64,
    pub total_docs: u64,
    pub segments: Vec<SegmentStatus>,
    /// Referenced files that don't exist.
    pub missing_files: Vec<String>,
    /// Files whose checksum or footer is wrong.
    pub corrupt_files: Vec<String>,
}

impl CheckIndexStatus {
    pub fn is_clean(&self) -> bool {
        self.missing_files.is_empty()
            && self.corrupt_files.is_empty()
            && self.segments.iter().all(SegmentStatus::is_clean)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

pub struct CheckIndex;

impl CheckIndex {
    /// Check the latest commit of `storage`.
    ///
    /// Fails only if no commit can be read; everything else is reported in
    /// the status.
    pub fn check(storage: &dyn Storage) -> Result<CheckIndexStatus> {
        Self::check_with_soft_deletes(storage, None)
    }

    /// Check the latest commit, counting documents marked in
    /// `soft_deletes_field` as soft deleted.
    pub fn check_with_soft_deletes(
        storage: &dyn Storage,
        soft_deletes_field: Option<&str>,
    ) -> Result<CheckIndexStatus> {
        let infos = SegmentInfos::read_latest_commit(storage)?;
        let mut status = CheckIndexStatus {
            segments_file: infos.segments_file_name(),
            generation: infos.generation(),
            ..Default::default()
        };

        let mut bad_files = BTreeSet::new();
        for file in infos.files(true) {
            if !storage.file_exists(&file) {
                status.missing_files.push(file.clone());
                bad_files.insert(file);
                continue;
            }
            if let Err(e) = read_verified(storage, &file) {
                warn!("checksum of {file} failed: {e}");
                status.corrupt_files.push(file.clone());
                bad_files.insert(file);
            }
        }

        for commit_info in infos.segments() {
            let segment = check_segment(storage, commit_info, soft_deletes_field, &bad_files);
            status.total_docs += u64::from(segment.num_docs);
            status.segments.push(segment);
        }

        info!(
            "checked {} segments of generation {}: {}",
            status.segments.len(),
            status.generation,
            if status.is_clean() { "clean" } else { "problems found" }
        );
        Ok(status)
    }
}

fn check_segment(
    storage: &dyn Storage,
    commit_info: &SegmentCommitInfo,
    soft_deletes_field: Option<&str>,
    bad_files: &BTreeSet<String>,
) -> SegmentStatus {
    let files = commit_info.files();
    let mut status = SegmentStatus {
        name: commit_info.name().to_string(),
        max_doc: commit_info.max_doc(),
        num_files: files.len(),
        ..Default::default()
    };
    if let Some(file) = files.iter().find(|f| bad_files.contains(*f)) {
        status.problems.push(format!("file {file} is missing or corrupt"));
        return status;
    }

    let core = match load_core(storage, commit_info) {
        Ok(core) => core,
        Err(e) => {
            status.problems.push(format!("cannot load segment: {e}"));
            return status;
        }
    };
    let live_docs = match load_live_docs(storage, commit_info) {
        Ok(live_docs) => live_docs,
        Err(e) => {
            status.problems.push(format!("cannot load live docs: {e}"));
            return status;
        }
    };

    if core.max_doc() != commit_info.max_doc() {
        status.problems.push(format!(
            "segment holds {} documents but the commit says {}",
            core.max_doc(),
            commit_info.max_doc()
        ));
    }
    status.del_count = live_docs.as_ref().map_or(0, |l| l.deleted_count());
    if status.del_count != commit_info.del_count() {
        status.problems.push(format!(
            "{} deleted documents but the commit says {}",
            status.del_count,
            commit_info.del_count()
        ));
    }
    if soft_deletes_field.is_some() {
        let live = live_docs
            .clone()
            .unwrap_or_else(|| LiveDocs::all_live(core.max_doc()));
        status.soft_del_count = soft_deleted_count(&core, soft_deletes_field, &live);
    }
    if soft_deletes_field.is_some() && status.soft_del_count != commit_info.soft_del_count() {
        status.problems.push(format!(
            "{} soft deleted documents but the commit says {}",
            status.soft_del_count,
            commit_info.soft_del_count()
        ));
    }
    status.num_docs = commit_info
        .max_doc()
        .saturating_sub(status.del_count + status.soft_del_count);
    status.num_fields = core.field_infos().len();

    check_postings(&core, &mut status);
    check_columns(&core, &mut status);
    status
}

fn check_postings(core: &SegmentCore, status: &mut SegmentStatus) {
    let max_doc = core.max_doc();
    for (field, terms) in core.all_field_terms() {
        for (term, ord) in terms.terms() {
            status.num_terms += 1;
            let mut last_doc = None;
            for posting in terms.postings_by_ord(ord) {
                status.num_postings += 1;
                if posting.doc >= max_doc {
                    status.problems.push(format!(
                        "field {field} term {:?}: doc {} is out of range",
                        String::from_utf8_lossy(&term),
                        posting.doc
                    ));
                    return;
                }
                if last_doc.is_some_and(|last| posting.doc <= last) {
                    status.problems.push(format!(
                        "field {field} term {:?}: docs out of order at {}",
                        String::from_utf8_lossy(&term),
                        posting.doc
                    ));
                    return;
                }
                if posting.freq == 0
                    || (!posting.positions.is_empty()
                        && posting.positions.len() != posting.freq as usize)
                {
                    status.problems.push(format!(
                        "field {field} term {:?}: bad freq {} in doc {}",
                        String::from_utf8_lossy(&term),
                        posting.freq,
                        posting.doc
                    ));
                    return;
                }
                last_doc = Some(posting.doc);
            }
        }
    }
}

fn check_columns(core: &SegmentCore, status: &mut SegmentStatus) {
    let max_doc = core.max_doc() as usize;
    let stored = core.all_stored().len();
    if stored != 0 && stored != max_doc {
        status
            .problems
            .push(format!("stored fields cover {stored} of {max_doc} documents"));
    }
    for (field, norms) in core.all_norms() {
        if norms.len() > max_doc {
            status.problems.push(format!(
                "field {field}: {} norms for {max_doc} documents",
                norms.len()
            ));
        }
    }
    for (field, column) in core.all_doc_values() {
        if column.len() > max_doc {
            status.problems.push(format!(
                "field {field}: {} doc values for {max_doc} documents",
                column.len()
            ));
        }
        if core.field_infos().by_number(*field).is_none() {
            status
                .problems
                .push(format!("doc values of unknown field number {field}"));
        }
    }
}

/// Fail with [`QuireError::CorruptIndex`] unless `status` is clean.
pub fn ensure_clean(status: &CheckIndexStatus) -> Result<()> {
    if status.is_clean() {
        return Ok(());
    }
    let mut problems: Vec<String> = status
        .missing_files
        .iter()
        .map(|f| format!("missing {f}"))
        .chain(status.corrupt_files.iter().map(|f| format!("corrupt {f}")))
        .collect();
    for segment in &status.segments {
        problems.extend(segment.problems.iter().map(|p| format!("{}: {p}", segment.name)));
    }
    Err(QuireError::corrupt(problems.join("; ")))
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Arc;

    use super::*;
    use crate::analysis::StandardAnalyzer;
    use crate::document::Document;
    use crate::index::config::IndexWriterConfig;
    use crate::index::index_writer::IndexWriter;
    use crate::index::term::Term;
    use crate::storage::memory::{MemoryStorage, MemoryStorageConfig};

    fn build_index(storage: Arc<dyn Storage>) {
        let mut config = IndexWriterConfig::new(Arc::new(StandardAnalyzer::new()));
        config.use_compound_file = false;
        let writer = IndexWriter::new(storage, config).unwrap();
        for id in ["a", "b", "c"] {
            let doc = Document::builder()
                .add_string("id", id)
                .add_text("body", "the quick brown fox")
                .build();
            writer.add_document(&doc).unwrap();
        }
        writer.commit().unwrap();
        writer.delete_documents(&[Term::text("id", "b")]).unwrap();
        writer.close().unwrap();
    }

    #[test]
    fn test_clean_index() {
        let storage: Arc<dyn Storage> =
            Arc::new(MemoryStorage::new(MemoryStorageConfig::default()));
        build_index(Arc::clone(&storage));

        let status = CheckIndex::check(storage.as_ref()).unwrap();
        assert!(status.is_clean(), "{status:?}");
        assert_eq!(status.segments.len(), 1);
        assert_eq!(status.segments[0].del_count, 1);
        assert_eq!(status.total_docs, 2);
        assert!(status.segments[0].num_terms > 0);
        assert!(ensure_clean(&status).is_ok());
    }

    #[test]
    fn test_flipped_byte_is_reported() {
        let storage: Arc<dyn Storage> =
            Arc::new(MemoryStorage::new(MemoryStorageConfig::default()));
        build_index(Arc::clone(&storage));

        let victim = storage
            .list_files()
            .unwrap()
            .into_iter()
            .find(|f| f.ends_with(".pst"))
            .unwrap();
        let mut bytes = storage.read_file(&victim).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        storage.delete_file(&victim).unwrap();
        let mut out = storage.create_output(&victim).unwrap();
        out.write_all(&bytes).unwrap();
        out.close().unwrap();

        let status = CheckIndex::check(storage.as_ref()).unwrap();
        assert!(!status.is_clean());
        assert_eq!(status.corrupt_files, vec![victim]);
        assert!(matches!(
            ensure_clean(&status),
            Err(QuireError::CorruptIndex(_))
        ));
    }

    #[test]
    fn test_empty_storage_has_no_commit() {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        assert!(matches!(
            CheckIndex::check(&storage),
            Err(QuireError::IndexNotFound(_))
        ));
    }
}

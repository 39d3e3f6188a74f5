//! Commit points.

use std::collections::{BTreeMap, BTreeSet};

use log::warn;

use crate::error::{QuireError, Result};
use crate::index::file_names;
use crate::index::segment_infos::SegmentInfos;
use crate::storage::Storage;

/// One `segments_N` file and the files it references.
///
/// Deletion policies mark commits with [`IndexCommit::delete`]; the writer
/// removes their files once no other commit or the live state needs them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexCommit {
    segments_file_name: String,
    generation: i64,
    files: BTreeSet<String>,
    user_data: BTreeMap<String, String>,
    segment_count: usize,
    deleted: bool,
}

impl IndexCommit {
    /// Commit point for committed `infos`.
    pub fn from_infos(infos: &SegmentInfos) -> Result<Self> {
        let segments_file_name = infos
            .segments_file_name()
            .ok_or_else(|| QuireError::illegal_state("segment infos were never committed"))?;
        Ok(IndexCommit {
            segments_file_name,
            generation: infos.last_generation(),
            files: infos.files(true),
            user_data: infos.user_data().clone(),
            segment_count: infos.len(),
            deleted: false,
        })
    }

    pub fn segments_file_name(&self) -> &str {
        &self.segments_file_name
    }

    pub fn generation(&self) -> i64 {
        self.generation
    }

    /// Every file of the commit, the segments file included.
    pub fn files(&self) -> &BTreeSet<String> {
        &self.files
    }

    pub fn user_data(&self) -> &BTreeMap<String, String> {
        &self.user_data
    }

    pub fn segment_count(&self) -> usize {
        self.segment_count
    }

    /// Mark the commit for deletion.
    pub fn delete(&mut self) {
        self.deleted = true;
    }

    pub(crate) fn undelete(&mut self) {
        self.deleted = false;
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }
}

/// Every readable commit in `storage`, oldest first.
///
/// Commits that fail to load are skipped with a warning, except the newest
/// one.
pub fn list_commits(storage: &dyn Storage) -> Result<Vec<IndexCommit>> {
    let mut generations: Vec<(i64, String)> = storage
        .list_files()?
        .into_iter()
        .filter(|f| file_names::is_segments_file(f))
        .filter_map(|f| {
            file_names::generation_from_segments_file_name(&f)
                .ok()
                .map(|g| (g, f))
        })
        .collect();
    generations.sort();
    let last = generations.last().map(|(g, _)| *g);
    let mut commits = Vec::with_capacity(generations.len());
    for (generation, name) in generations {
        match SegmentInfos::read_commit(storage, &name) {
            Ok(infos) => commits.push(IndexCommit::from_infos(&infos)?),
            Err(e) if Some(generation) != last => {
                warn!("skipping unreadable commit {name}: {e}");
            }
            Err(e) => return Err(e),
        }
    }
    if commits.is_empty() {
        return Err(QuireError::IndexNotFound(format!(
            "no commit found in {storage:?}"
        )));
    }
    Ok(commits)
}

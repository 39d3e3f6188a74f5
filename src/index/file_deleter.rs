//! Reference counting of index files.
//!
//! Every file referenced by a kept commit or by the writer's current
//! segment list holds a reference. A file is deleted when its count drops
//! to zero. Deletes that fail (e.g. a file still open on some platforms) are
//! remembered and retried on the next operation.

use std::collections::BTreeSet;
use std::sync::Arc;

use ahash::AHashMap;
use log::{debug, info, warn};

use crate::error::{QuireError, Result};
use crate::index::deletion_policy::IndexDeletionPolicy;
use crate::index::file_names;
use crate::index::index_commit::IndexCommit;
use crate::index::segment_infos::SegmentInfos;
use crate::storage::{Storage, WRITE_LOCK_NAME};

#[derive(Debug)]
pub struct IndexFileDeleter {
    storage: Arc<dyn Storage>,
    policy: Arc<dyn IndexDeletionPolicy>,
    ref_counts: AHashMap<String, usize>,
    /// Kept commits, oldest first.
    commits: Vec<IndexCommit>,
    /// Files of the last non-commit checkpoint.
    last_files: BTreeSet<String>,
    pending_deletes: BTreeSet<String>,
}

impl IndexFileDeleter {
    /// Load every commit in storage, reference their files, run the policy's
    /// `on_init` and delete whatever is left unreferenced.
    ///
    /// `current` is the writer's starting segment list; its files are kept
    /// even if no commit references them.
    pub fn new(
        storage: Arc<dyn Storage>,
        policy: Arc<dyn IndexDeletionPolicy>,
        current: &SegmentInfos,
    ) -> Result<Self> {
        let mut deleter = IndexFileDeleter {
            storage,
            policy,
            ref_counts: AHashMap::new(),
            commits: Vec::new(),
            last_files: BTreeSet::new(),
            pending_deletes: BTreeSet::new(),
        };
        let files = deleter.storage.list_files()?;
        let current_generation = current.last_generation();
        let mut generations: Vec<(i64, String)> = files
            .iter()
            .filter(|f| file_names::is_segments_file(f))
            .filter_map(|f| {
                file_names::generation_from_segments_file_name(f)
                    .ok()
                    .map(|g| (g, f.clone()))
            })
            .collect();
        generations.sort();
        for (generation, name) in generations {
            match SegmentInfos::read_commit(deleter.storage.as_ref(), &name) {
                Ok(infos) => {
                    let commit = IndexCommit::from_infos(&infos)?;
                    deleter.inc_ref(commit.files().iter());
                    deleter.commits.push(commit);
                }
                Err(e) if generation != current_generation => {
                    warn!("ignoring unreadable commit {name}: {e}");
                }
                Err(e) => return Err(e),
            }
        }

        deleter.inc_ref(current.files(false).iter());
        deleter.last_files = current.files(false);

        let policy = Arc::clone(&deleter.policy);
        if !deleter.commits.is_empty() {
            policy.on_init(&mut deleter.commits)?;
        }
        deleter.delete_commits();

        for file in files {
            if file == WRITE_LOCK_NAME || !file_names::is_index_file(&file) {
                continue;
            }
            if !deleter.ref_counts.contains_key(&file) {
                debug!("deleting unreferenced file {file}");
                deleter.delete_file(&file);
            }
        }
        Ok(deleter)
    }

    pub fn inc_ref<'a, I: IntoIterator<Item = &'a String>>(&mut self, files: I) {
        for file in files {
            *self.ref_counts.entry(file.clone()).or_insert(0) += 1;
        }
    }

    pub fn dec_ref<'a, I: IntoIterator<Item = &'a String>>(&mut self, files: I) {
        let mut to_delete = Vec::new();
        for file in files {
            match self.ref_counts.get_mut(file) {
                Some(count) if *count > 1 => *count -= 1,
                Some(_) => {
                    self.ref_counts.remove(file);
                    to_delete.push(file.clone());
                }
                None => warn!("dec_ref of unreferenced file {file}"),
            }
        }
        for file in to_delete {
            self.delete_file(&file);
        }
        self.retry_pending_deletes();
    }

    pub fn ref_count(&self, file: &str) -> usize {
        self.ref_counts.get(file).copied().unwrap_or(0)
    }

    /// Kept commits, oldest first.
    pub fn commits(&self) -> &[IndexCommit] {
        &self.commits
    }

    /// Record a new state of the segment list.
    ///
    /// For a commit, the new commit point is handed to the deletion policy
    /// and the commits it drops lose their references. Otherwise the files
    /// of the previous checkpoint are released.
    pub fn checkpoint(&mut self, infos: &SegmentInfos, is_commit: bool) -> Result<()> {
        self.inc_ref(infos.files(is_commit).iter());
        if is_commit {
            self.commits.push(IndexCommit::from_infos(infos)?);
            let policy = Arc::clone(&self.policy);
            policy.on_commit(&mut self.commits)?;
            self.delete_commits();
        } else {
            let last = std::mem::replace(&mut self.last_files, infos.files(false));
            self.dec_ref(last.iter());
        }
        Ok(())
    }

    /// Run the policy again, e.g. after a snapshot was released.
    pub fn revisit_policy(&mut self) -> Result<()> {
        if self.commits.is_empty() {
            return Ok(());
        }
        let policy = Arc::clone(&self.policy);
        policy.on_commit(&mut self.commits)?;
        self.delete_commits();
        Ok(())
    }

    fn delete_commits(&mut self) {
        let (deleted, kept): (Vec<IndexCommit>, Vec<IndexCommit>) =
            std::mem::take(&mut self.commits)
                .into_iter()
                .partition(IndexCommit::is_deleted);
        self.commits = kept;
        for commit in deleted {
            info!("deleting commit {}", commit.segments_file_name());
            self.dec_ref(commit.files().iter());
        }
    }

    /// Delete files written for state that was never published (an aborted
    /// flush or merge), unless something references them.
    pub fn delete_new_files<'a, I: IntoIterator<Item = &'a String>>(&mut self, files: I) {
        for file in files {
            if !self.ref_counts.contains_key(file) && self.storage.file_exists(file) {
                self.delete_file(file);
            }
        }
    }

    /// Delete every index file nothing references. Only safe while no flush
    /// or merge is writing files.
    pub fn refresh(&mut self) -> Result<()> {
        for file in self.storage.list_files()? {
            if file == WRITE_LOCK_NAME || !file_names::is_index_file(&file) {
                continue;
            }
            if !self.ref_counts.contains_key(&file) {
                debug!("refresh: deleting unreferenced file {file}");
                self.delete_file(&file);
            }
        }
        Ok(())
    }

    /// Files whose delete failed and will be retried.
    pub fn pending_deletes(&self) -> &BTreeSet<String> {
        &self.pending_deletes
    }

    pub fn close(&mut self) {
        self.retry_pending_deletes();
    }

    fn retry_pending_deletes(&mut self) {
        if self.pending_deletes.is_empty() {
            return;
        }
        for file in std::mem::take(&mut self.pending_deletes) {
            if !self.ref_counts.contains_key(&file) {
                self.delete_file(&file);
            }
        }
    }

    fn delete_file(&mut self, file: &str) {
        match self.storage.delete_file(file) {
            Ok(()) => {}
            Err(QuireError::FileNotFound(_)) => {}
            Err(e) if !self.storage.file_exists(file) => {
                debug!("delete of {file} failed but the file is gone: {e}");
            }
            Err(e) => {
                warn!("failed to delete {file}, will retry: {e}");
                self.pending_deletes.insert(file.to_string());
            }
        }
    }
}

//! Which commit points to keep.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{QuireError, Result};
use crate::index::index_commit::IndexCommit;

/// Decides which commits are deleted.
///
/// `commits` is ordered oldest first; the last entry is the newest commit.
/// The policy calls [`IndexCommit::delete`] on commits it no longer needs.
pub trait IndexDeletionPolicy: Send + Sync + Debug {
    /// Called once when a writer opens an existing index.
    fn on_init(&self, commits: &mut [IndexCommit]) -> Result<()> {
        self.on_commit(commits)
    }

    /// Called after every successful commit.
    fn on_commit(&self, commits: &mut [IndexCommit]) -> Result<()>;
}

/// Keeps only the newest commit.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeepOnlyLastCommitDeletionPolicy;

impl IndexDeletionPolicy for KeepOnlyLastCommitDeletionPolicy {
    fn on_commit(&self, commits: &mut [IndexCommit]) -> Result<()> {
        if let Some((_, older)) = commits.split_last_mut() {
            older.iter_mut().for_each(IndexCommit::delete);
        }
        Ok(())
    }
}

/// Keeps every commit.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDeletionPolicy;

impl IndexDeletionPolicy for NoDeletionPolicy {
    fn on_commit(&self, _commits: &mut [IndexCommit]) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct SnapshotState {
    /// Snapshot count per commit generation.
    ref_counts: BTreeMap<i64, usize>,
    last_commit: Option<IndexCommit>,
}

/// Wraps another policy and protects snapshotted commits from it.
///
/// Call [`IndexWriter::delete_unused_files`] after releasing a snapshot to
/// remove its files right away.
///
/// [`IndexWriter::delete_unused_files`]: crate::index::index_writer::IndexWriter::delete_unused_files
#[derive(Debug)]
pub struct SnapshotDeletionPolicy {
    primary: Arc<dyn IndexDeletionPolicy>,
    state: Mutex<SnapshotState>,
}

impl SnapshotDeletionPolicy {
    pub fn new(primary: Arc<dyn IndexDeletionPolicy>) -> Self {
        SnapshotDeletionPolicy {
            primary,
            state: Mutex::new(SnapshotState::default()),
        }
    }

    /// Pin the newest commit.
    pub fn snapshot(&self) -> Result<IndexCommit> {
        let mut state = self.state.lock();
        let commit = state
            .last_commit
            .clone()
            .ok_or_else(|| QuireError::illegal_state("no commit to snapshot"))?;
        *state.ref_counts.entry(commit.generation()).or_insert(0) += 1;
        Ok(commit)
    }

    /// Release a snapshot taken with [`snapshot`](Self::snapshot).
    pub fn release(&self, commit: &IndexCommit) -> Result<()> {
        let mut state = self.state.lock();
        let generation = commit.generation();
        match state.ref_counts.get_mut(&generation) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                state.ref_counts.remove(&generation);
            }
            None => {
                return Err(QuireError::invalid_argument(format!(
                    "commit generation {generation} is not snapshotted"
                )));
            }
        }
        Ok(())
    }

    /// Outstanding snapshots.
    pub fn snapshot_count(&self) -> usize {
        self.state.lock().ref_counts.values().sum()
    }

    pub fn snapshots(&self) -> Vec<i64> {
        self.state.lock().ref_counts.keys().copied().collect()
    }

    fn protect(&self, commits: &mut [IndexCommit]) {
        let mut state = self.state.lock();
        for commit in commits.iter_mut() {
            if state.ref_counts.contains_key(&commit.generation()) {
                commit.undelete();
            }
        }
        state.last_commit = commits.last().cloned();
    }
}

impl IndexDeletionPolicy for SnapshotDeletionPolicy {
    fn on_init(&self, commits: &mut [IndexCommit]) -> Result<()> {
        self.primary.on_init(commits)?;
        self.protect(commits);
        Ok(())
    }

    fn on_commit(&self, commits: &mut [IndexCommit]) -> Result<()> {
        self.primary.on_commit(commits)?;
        self.protect(commits);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::segment_infos::SegmentInfos;
    use crate::storage::memory::{MemoryStorage, MemoryStorageConfig};

    fn commits(count: usize) -> Vec<IndexCommit> {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        let mut infos = SegmentInfos::new();
        let mut out = Vec::new();
        for _ in 0..count {
            infos.prepare_commit(&storage).unwrap();
            infos.finish_commit(&storage).unwrap();
            out.push(IndexCommit::from_infos(&infos).unwrap());
        }
        out
    }

    #[test]
    fn test_keep_only_last() {
        let mut commits = commits(3);
        KeepOnlyLastCommitDeletionPolicy.on_commit(&mut commits).unwrap();
        let kept: Vec<bool> = commits.iter().map(|c| !c.is_deleted()).collect();
        assert_eq!(kept, vec![false, false, true]);

        let mut commits = super::tests::commits(2);
        NoDeletionPolicy.on_commit(&mut commits).unwrap();
        assert!(commits.iter().all(|c| !c.is_deleted()));
    }

    #[test]
    fn test_snapshot_protects_commit() {
        let policy = SnapshotDeletionPolicy::new(Arc::new(KeepOnlyLastCommitDeletionPolicy));
        assert!(policy.snapshot().is_err());

        let mut all = commits(2);
        let mut first = all[..1].to_vec();
        policy.on_commit(&mut first).unwrap();
        let snapshot = policy.snapshot().unwrap();
        assert_eq!(snapshot.generation(), 1);
        assert_eq!(policy.snapshot_count(), 1);

        policy.on_commit(&mut all).unwrap();
        assert!(!all[0].is_deleted());

        policy.release(&snapshot).unwrap();
        assert!(policy.release(&snapshot).is_err());
        let mut all = commits(2);
        policy.on_commit(&mut all).unwrap();
        assert!(all[0].is_deleted());
    }
}

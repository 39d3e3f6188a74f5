//! Index writer configuration.
//!
//! [`IndexWriterConfig`] is what the writer runs with. Everything that can
//! be expressed as plain data is also available as [`IndexWriterSettings`],
//! which loads from JSON:
//!
//! ```
//! use quire::index::config::{IndexWriterConfig, IndexWriterSettings};
//!
//! let settings = IndexWriterSettings::from_json_str(
//!     r#"{ "max_buffered_docs": 1000, "merge_policy": { "type": "log_doc" } }"#,
//! )
//! .unwrap();
//! let config = IndexWriterConfig::from_settings(&settings).unwrap();
//! assert_eq!(config.max_buffered_docs, Some(1000));
//! assert_eq!(config.merge_policy.name(), "LogDocMergePolicy");
//! ```

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::analysis::{Analyzer, KeywordAnalyzer, StandardAnalyzer, WhitespaceAnalyzer};
use crate::error::{QuireError, Result};
use crate::index::codec::{Codec, StandardCodec};
use crate::index::deletion_policy::{
    IndexDeletionPolicy, KeepOnlyLastCommitDeletionPolicy, NoDeletionPolicy,
    SnapshotDeletionPolicy,
};
use crate::index::flush_policy::{FlushByRamOrCountsPolicy, FlushPolicy};
use crate::index::index_commit::IndexCommit;
use crate::index::merge_policy::{
    LogDocMergePolicy, MergePolicy, NoMergePolicy, TieredMergePolicy,
};
use crate::index::merge_scheduler::{
    ConcurrentMergeScheduler, MergeScheduler, NoMergeScheduler, SerialMergeScheduler,
};
use crate::index::sorter::IndexSort;

/// Largest number of documents an index may hold.
pub const MAX_DOCS: i64 = i32::MAX as i64 - 128;

/// Default RAM buffer, in MB.
pub const DEFAULT_RAM_BUFFER_SIZE_MB: f64 = 16.0;

/// Default per-DWPT hard limit, in MB.
pub const DEFAULT_RAM_PER_THREAD_HARD_LIMIT_MB: usize = 1945;

/// How the writer treats an existing index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenMode {
    /// Start empty. Existing commits stay until the deletion policy drops
    /// them.
    Create,
    /// Open the latest commit; fail if there is none.
    Append,
    /// Append if a commit exists, create otherwise.
    #[default]
    CreateOrAppend,
}

/// Index writer configuration.
#[derive(Clone)]
pub struct IndexWriterConfig {
    /// Analyzer for tokenized fields.
    pub analyzer: Arc<dyn Analyzer>,

    /// Codec for new segments.
    pub codec: Arc<dyn Codec>,

    pub merge_policy: Arc<dyn MergePolicy>,

    pub merge_scheduler: Arc<dyn MergeScheduler>,

    /// Which commits to keep.
    pub deletion_policy: Arc<dyn IndexDeletionPolicy>,

    pub flush_policy: Arc<dyn FlushPolicy>,

    pub open_mode: OpenMode,

    /// Flush once buffered documents and deletes use this much RAM.
    /// `None` disables flushing by RAM.
    pub ram_buffer_size_mb: Option<f64>,

    /// Flush a DWPT once it holds this many documents. `None` disables
    /// flushing by count.
    pub max_buffered_docs: Option<u32>,

    /// A DWPT is flushed once it reaches this size, whatever the flush
    /// policy says.
    pub ram_per_thread_hard_limit_mb: usize,

    /// Write new segments as compound files.
    pub use_compound_file: bool,

    /// Numeric doc values field marking soft deleted documents.
    pub soft_deletes_field: Option<String>,

    /// Order of documents within each segment.
    pub index_sort: Option<IndexSort>,

    /// Whether `close` commits.
    pub commit_on_close: bool,

    /// Upper bound for concurrently indexing threads, used to size the
    /// stall threshold.
    pub max_thread_states: usize,

    /// Open the writer on this commit instead of the latest one.
    pub index_commit: Option<IndexCommit>,

    /// Document limit of the index.
    pub max_docs: i64,
}

impl std::fmt::Debug for IndexWriterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexWriterConfig")
            .field("analyzer", &self.analyzer.name())
            .field("codec", &self.codec.name())
            .field("merge_policy", &self.merge_policy.name())
            .field("merge_scheduler", &self.merge_scheduler.name())
            .field("open_mode", &self.open_mode)
            .field("ram_buffer_size_mb", &self.ram_buffer_size_mb)
            .field("max_buffered_docs", &self.max_buffered_docs)
            .field(
                "ram_per_thread_hard_limit_mb",
                &self.ram_per_thread_hard_limit_mb,
            )
            .field("use_compound_file", &self.use_compound_file)
            .field("soft_deletes_field", &self.soft_deletes_field)
            .field("index_sort", &self.index_sort)
            .field("commit_on_close", &self.commit_on_close)
            .field("max_thread_states", &self.max_thread_states)
            .field(
                "index_commit",
                &self.index_commit.as_ref().map(|c| c.segments_file_name()),
            )
            .field("max_docs", &self.max_docs)
            .finish()
    }
}

impl Default for IndexWriterConfig {
    fn default() -> Self {
        IndexWriterConfig::new(Arc::new(StandardAnalyzer::new()))
    }
}

impl IndexWriterConfig {
    pub fn new(analyzer: Arc<dyn Analyzer>) -> Self {
        IndexWriterConfig {
            analyzer,
            codec: Arc::new(StandardCodec),
            merge_policy: Arc::new(TieredMergePolicy::default()),
            merge_scheduler: Arc::new(ConcurrentMergeScheduler::default()),
            deletion_policy: Arc::new(KeepOnlyLastCommitDeletionPolicy),
            flush_policy: Arc::new(FlushByRamOrCountsPolicy::new()),
            open_mode: OpenMode::default(),
            ram_buffer_size_mb: Some(DEFAULT_RAM_BUFFER_SIZE_MB),
            max_buffered_docs: None,
            ram_per_thread_hard_limit_mb: DEFAULT_RAM_PER_THREAD_HARD_LIMIT_MB,
            use_compound_file: true,
            soft_deletes_field: None,
            index_sort: None,
            commit_on_close: true,
            max_thread_states: num_cpus::get().max(1),
            index_commit: None,
            max_docs: MAX_DOCS,
        }
    }

    /// Build a configuration from plain settings.
    pub fn from_settings(settings: &IndexWriterSettings) -> Result<Self> {
        let analyzer: Arc<dyn Analyzer> = match settings.analyzer {
            AnalyzerKind::Standard => Arc::new(StandardAnalyzer::new()),
            AnalyzerKind::Keyword => Arc::new(KeywordAnalyzer),
            AnalyzerKind::Whitespace => Arc::new(WhitespaceAnalyzer),
        };
        let merge_policy: Arc<dyn MergePolicy> = match &settings.merge_policy {
            MergePolicySettings::Tiered(policy) => Arc::new(policy.clone()),
            MergePolicySettings::LogDoc(policy) => Arc::new(policy.clone()),
            MergePolicySettings::NoMerge => Arc::new(NoMergePolicy),
        };
        let merge_scheduler: Arc<dyn MergeScheduler> = match settings.merge_scheduler {
            MergeSchedulerSettings::Serial => Arc::new(SerialMergeScheduler::new()),
            MergeSchedulerSettings::Concurrent {
                max_thread_count,
                max_merge_count,
            } => match (max_thread_count, max_merge_count) {
                (None, None) => Arc::new(ConcurrentMergeScheduler::default()),
                (threads, merges) => {
                    let defaults = ConcurrentMergeScheduler::default();
                    let threads = threads.unwrap_or(defaults.max_thread_count());
                    Arc::new(ConcurrentMergeScheduler::with_limits(
                        threads,
                        merges.unwrap_or(threads + 5),
                    ))
                }
            },
            MergeSchedulerSettings::NoMerge => Arc::new(NoMergeScheduler),
        };
        let deletion_policy: Arc<dyn IndexDeletionPolicy> = match settings.deletion_policy {
            DeletionPolicyKind::KeepOnlyLastCommit => Arc::new(KeepOnlyLastCommitDeletionPolicy),
            DeletionPolicyKind::KeepAll => Arc::new(NoDeletionPolicy),
            DeletionPolicyKind::Snapshot => Arc::new(SnapshotDeletionPolicy::new(Arc::new(
                KeepOnlyLastCommitDeletionPolicy,
            ))),
        };
        let config = IndexWriterConfig {
            merge_policy,
            merge_scheduler,
            deletion_policy,
            open_mode: settings.open_mode,
            ram_buffer_size_mb: settings.ram_buffer_size_mb,
            max_buffered_docs: settings.max_buffered_docs,
            ram_per_thread_hard_limit_mb: settings.ram_per_thread_hard_limit_mb,
            use_compound_file: settings.use_compound_file,
            soft_deletes_field: settings.soft_deletes_field.clone(),
            index_sort: settings.index_sort.clone(),
            commit_on_close: settings.commit_on_close,
            max_thread_states: settings
                .max_thread_states
                .unwrap_or_else(|| num_cpus::get().max(1)),
            ..IndexWriterConfig::new(analyzer)
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject inconsistent settings.
    pub fn validate(&self) -> Result<()> {
        if self.ram_buffer_size_mb.is_none() && self.max_buffered_docs.is_none() {
            return Err(QuireError::invalid_argument(
                "at least one of ram_buffer_size_mb and max_buffered_docs must be enabled",
            ));
        }
        if let Some(mb) = self.ram_buffer_size_mb {
            if !(mb > 0.0) || mb * 1024.0 * 1024.0 > usize::MAX as f64 {
                return Err(QuireError::invalid_argument(format!(
                    "ram_buffer_size_mb must be positive, got {mb}"
                )));
            }
        }
        if let Some(docs) = self.max_buffered_docs {
            if docs < 2 {
                return Err(QuireError::invalid_argument(format!(
                    "max_buffered_docs must be at least 2, got {docs}"
                )));
            }
        }
        if self.ram_per_thread_hard_limit_mb == 0 || self.ram_per_thread_hard_limit_mb >= 2048 {
            return Err(QuireError::invalid_argument(format!(
                "ram_per_thread_hard_limit_mb must be in 1..2048, got {}",
                self.ram_per_thread_hard_limit_mb
            )));
        }
        if self.max_docs < 1 || self.max_docs > MAX_DOCS {
            return Err(QuireError::invalid_argument(format!(
                "max_docs must be in 1..={MAX_DOCS}, got {}",
                self.max_docs
            )));
        }
        if self.max_thread_states == 0 {
            return Err(QuireError::invalid_argument("max_thread_states must be positive"));
        }
        if let Some(field) = &self.soft_deletes_field {
            if field.is_empty() {
                return Err(QuireError::invalid_argument(
                    "soft_deletes_field must not be empty",
                ));
            }
        }
        Ok(())
    }

    pub(crate) fn ram_buffer_bytes(&self) -> Option<usize> {
        self.ram_buffer_size_mb
            .map(|mb| (mb * 1024.0 * 1024.0) as usize)
    }

    pub(crate) fn hard_limit_bytes(&self) -> usize {
        self.ram_per_thread_hard_limit_mb * 1024 * 1024
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalyzerKind {
    #[default]
    Standard,
    Keyword,
    Whitespace,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MergePolicySettings {
    Tiered(TieredMergePolicy),
    LogDoc(LogDocMergePolicy),
    NoMerge,
}

impl Default for MergePolicySettings {
    fn default() -> Self {
        MergePolicySettings::Tiered(TieredMergePolicy::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MergeSchedulerSettings {
    Serial,
    Concurrent {
        #[serde(default)]
        max_thread_count: Option<usize>,
        #[serde(default)]
        max_merge_count: Option<usize>,
    },
    NoMerge,
}

impl Default for MergeSchedulerSettings {
    fn default() -> Self {
        MergeSchedulerSettings::Concurrent {
            max_thread_count: None,
            max_merge_count: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionPolicyKind {
    #[default]
    KeepOnlyLastCommit,
    KeepAll,
    Snapshot,
}

/// The serializable part of [`IndexWriterConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexWriterSettings {
    pub analyzer: AnalyzerKind,
    pub merge_policy: MergePolicySettings,
    pub merge_scheduler: MergeSchedulerSettings,
    pub deletion_policy: DeletionPolicyKind,
    pub open_mode: OpenMode,
    pub ram_buffer_size_mb: Option<f64>,
    pub max_buffered_docs: Option<u32>,
    pub ram_per_thread_hard_limit_mb: usize,
    pub use_compound_file: bool,
    pub soft_deletes_field: Option<String>,
    pub index_sort: Option<IndexSort>,
    pub commit_on_close: bool,
    /// Defaults to the number of CPUs.
    pub max_thread_states: Option<usize>,
}

impl Default for IndexWriterSettings {
    fn default() -> Self {
        IndexWriterSettings {
            analyzer: AnalyzerKind::default(),
            merge_policy: MergePolicySettings::default(),
            merge_scheduler: MergeSchedulerSettings::default(),
            deletion_policy: DeletionPolicyKind::default(),
            open_mode: OpenMode::default(),
            ram_buffer_size_mb: Some(DEFAULT_RAM_BUFFER_SIZE_MB),
            max_buffered_docs: None,
            ram_per_thread_hard_limit_mb: DEFAULT_RAM_PER_THREAD_HARD_LIMIT_MB,
            use_compound_file: true,
            soft_deletes_field: None,
            index_sort: None,
            commit_on_close: true,
            max_thread_states: None,
        }
    }
}

impl IndexWriterSettings {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = IndexWriterConfig::default();
        config.validate().unwrap();
        assert_eq!(config.ram_buffer_size_mb, Some(16.0));
        assert_eq!(config.max_docs, MAX_DOCS);
        assert_eq!(config.merge_policy.name(), "TieredMergePolicy");
        let debug = format!("{config:?}");
        assert!(debug.contains("StandardAnalyzer") || debug.contains("analyzer"));
    }

    #[test]
    fn test_validation() {
        let config = IndexWriterConfig {
            ram_buffer_size_mb: None,
            max_buffered_docs: None,
            ..IndexWriterConfig::default()
        };
        assert!(config.validate().is_err());

        let config = IndexWriterConfig {
            max_buffered_docs: Some(1),
            ..IndexWriterConfig::default()
        };
        assert!(config.validate().is_err());

        let config = IndexWriterConfig {
            ram_per_thread_hard_limit_mb: 2048,
            ..IndexWriterConfig::default()
        };
        assert!(config.validate().is_err());

        let config = IndexWriterConfig {
            max_docs: MAX_DOCS + 1,
            ..IndexWriterConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_settings_from_json() {
        let settings = IndexWriterSettings::from_json_str(
            r#"{
                "analyzer": "whitespace",
                "open_mode": "create",
                "ram_buffer_size_mb": null,
                "max_buffered_docs": 50,
                "merge_policy": { "type": "tiered", "segments_per_tier": 4.0 },
                "merge_scheduler": { "type": "serial" },
                "deletion_policy": "keep_all",
                "soft_deletes_field": "__soft",
                "index_sort": { "field": "rank", "reverse": true, "missing_value": 0 }
            }"#,
        )
        .unwrap();
        assert_eq!(settings.open_mode, OpenMode::Create);
        assert!(settings.use_compound_file);

        let config = IndexWriterConfig::from_settings(&settings).unwrap();
        assert_eq!(config.analyzer.name(), WhitespaceAnalyzer.name());
        assert_eq!(config.merge_scheduler.name(), "SerialMergeScheduler");
        assert_eq!(config.ram_buffer_size_mb, None);
        assert_eq!(config.soft_deletes_field.as_deref(), Some("__soft"));
        assert!(config.index_sort.as_ref().unwrap().reverse);

        let json = settings.to_json_string().unwrap();
        let round = IndexWriterSettings::from_json_str(&json).unwrap();
        assert_eq!(round.max_buffered_docs, Some(50));
    }

    #[test]
    fn test_invalid_settings_are_rejected() {
        let settings = IndexWriterSettings::from_json_str(
            r#"{ "ram_buffer_size_mb": null, "max_buffered_docs": null }"#,
        )
        .unwrap();
        assert!(IndexWriterConfig::from_settings(&settings).is_err());
        assert!(IndexWriterSettings::from_json_str("{ not json").is_err());
    }
}

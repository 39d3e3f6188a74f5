//! Index writing and reading.
//!
//! Documents enter through [`IndexWriter`], are buffered by per-thread
//! writers (DWPTs) and flushed into immutable segments. Deletes and doc
//! values updates travel through a shared delete queue so that each one is
//! applied exactly to the documents that existed before it. A commit writes
//! a `segments_N` file naming the segments that make up the index;
//! [`DirectoryReader`] opens such a commit, or the writer's live state, as a
//! point-in-time view.

pub mod buffered_updates;
pub mod check_index;
pub mod codec;
pub mod config;
pub mod delete_queue;
pub mod deletion_policy;
pub mod directory_reader;
pub mod documents_writer;
pub mod dwpt;
pub mod dwpt_pool;
pub mod field_info;
pub mod file_deleter;
pub mod file_names;
pub mod flush_control;
pub mod flush_policy;
pub mod flush_queue;
pub mod index_commit;
pub mod index_writer;
pub mod live_docs;
pub mod merge_policy;
pub mod merge_scheduler;
pub mod merger;
pub mod reader;
pub mod reader_pool;
pub mod segment_core;
pub mod segment_info;
pub mod segment_infos;
pub mod segment_reader;
pub mod sorter;
pub mod stall_control;
pub mod term;
pub mod terms_hash;

pub use buffered_updates::DocValuesUpdate;
pub use check_index::{CheckIndex, CheckIndexStatus, SegmentStatus};
pub use codec::{Codec, StandardCodec};
pub use config::{IndexWriterConfig, IndexWriterSettings, OpenMode};
pub use deletion_policy::{
    IndexDeletionPolicy, KeepOnlyLastCommitDeletionPolicy, NoDeletionPolicy,
    SnapshotDeletionPolicy,
};
pub use directory_reader::DirectoryReader;
pub use field_info::{DocValuesType, FieldInfo, FieldInfos, IndexOptions};
pub use flush_policy::{FlushByRamOrCountsPolicy, FlushPolicy};
pub use index_commit::{IndexCommit, list_commits};
pub use index_writer::IndexWriter;
pub use live_docs::LiveDocs;
pub use merge_policy::{
    LogDocMergePolicy, MergePolicy, MergeTrigger, NoMergePolicy, TieredMergePolicy,
};
pub use merge_scheduler::{
    ConcurrentMergeScheduler, MergeScheduler, NoMergeScheduler, SerialMergeScheduler,
};
pub use segment_info::{SegmentCommitInfo, SegmentInfo};
pub use segment_infos::SegmentInfos;
pub use segment_reader::SegmentReader;
pub use sorter::IndexSort;
pub use term::Term;

//! Point-in-time reader over all segments of a commit, or over a writer's
//! uncommitted state (near-real-time).

use std::sync::{Arc, Weak};

use log::debug;

use crate::document::Document;
use crate::error::{QuireError, Result};
use crate::index::index_commit::IndexCommit;
use crate::index::index_writer::{IndexWriter, WriterInner};
use crate::index::segment_infos::{SegmentInfos, last_commit_generation};
use crate::index::segment_reader::SegmentReader;
use crate::storage::Storage;

/// A frozen view of an index. Later writes never change what it returns.
pub struct DirectoryReader {
    storage: Arc<dyn Storage>,
    segment_infos: SegmentInfos,
    leaves: Vec<Arc<SegmentReader>>,
    /// Global doc id of each leaf's first document.
    starts: Vec<u32>,
    max_doc: u32,
    num_docs: u32,
    soft_deletes_field: Option<String>,
    writer: Option<Weak<WriterInner>>,
    applied_all_deletes: bool,
}

impl std::fmt::Debug for DirectoryReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryReader")
            .field("generation", &self.segment_infos.generation())
            .field("version", &self.segment_infos.version)
            .field("segments", &self.leaves.len())
            .field("max_doc", &self.max_doc)
            .field("num_docs", &self.num_docs)
            .field("nrt", &self.writer.is_some())
            .finish()
    }
}

impl DirectoryReader {
    /// Open the latest commit.
    pub fn open(storage: Arc<dyn Storage>) -> Result<Arc<Self>> {
        Self::open_with_soft_deletes(storage, None)
    }

    /// Open the latest commit, hiding documents that carry a value in
    /// `soft_deletes_field`.
    pub fn open_with_soft_deletes(
        storage: Arc<dyn Storage>,
        soft_deletes_field: Option<&str>,
    ) -> Result<Arc<Self>> {
        let infos = SegmentInfos::read_latest_commit(storage.as_ref())?;
        Self::open_infos(storage, infos, soft_deletes_field)
    }

    /// Open a specific commit point.
    pub fn open_commit(
        storage: Arc<dyn Storage>,
        commit: &IndexCommit,
        soft_deletes_field: Option<&str>,
    ) -> Result<Arc<Self>> {
        let infos = SegmentInfos::read_commit(storage.as_ref(), commit.segments_file_name())?;
        Self::open_infos(storage, infos, soft_deletes_field)
    }

    /// Open a near-real-time reader over everything `writer` has indexed,
    /// committed or not.
    pub fn open_from_writer(writer: &IndexWriter, apply_all_deletes: bool) -> Result<Arc<Self>> {
        writer.inner().nrt_reader(apply_all_deletes)
    }

    fn open_infos(
        storage: Arc<dyn Storage>,
        infos: SegmentInfos,
        soft_deletes_field: Option<&str>,
    ) -> Result<Arc<Self>> {
        let mut leaves = Vec::with_capacity(infos.len());
        for commit_info in infos.segments() {
            leaves.push(Arc::new(SegmentReader::open(
                storage.as_ref(),
                commit_info,
                soft_deletes_field,
            )?));
        }
        debug!(
            "opened reader on generation {} with {} segments",
            infos.generation(),
            leaves.len()
        );
        Ok(Arc::new(Self::from_leaves(
            storage,
            infos,
            leaves,
            soft_deletes_field.map(str::to_string),
            None,
            true,
        )?))
    }

    pub(crate) fn from_leaves(
        storage: Arc<dyn Storage>,
        segment_infos: SegmentInfos,
        leaves: Vec<Arc<SegmentReader>>,
        soft_deletes_field: Option<String>,
        writer: Option<Weak<WriterInner>>,
        applied_all_deletes: bool,
    ) -> Result<Self> {
        let mut starts = Vec::with_capacity(leaves.len());
        let mut max_doc: u64 = 0;
        let mut num_docs: u64 = 0;
        for leaf in &leaves {
            starts.push(max_doc as u32);
            max_doc += leaf.max_doc() as u64;
            num_docs += leaf.num_docs() as u64;
        }
        if max_doc > i32::MAX as u64 {
            return Err(QuireError::corrupt(format!(
                "reader would hold {max_doc} documents"
            )));
        }
        Ok(DirectoryReader {
            storage,
            segment_infos,
            leaves,
            starts,
            max_doc: max_doc as u32,
            num_docs: num_docs as u32,
            soft_deletes_field,
            writer,
            applied_all_deletes,
        })
    }

    /// A new reader if the index changed since this one was opened.
    pub fn open_if_changed(self: &Arc<Self>) -> Result<Option<Arc<Self>>> {
        if self.is_current()? {
            return Ok(None);
        }
        if let Some(writer) = self.writer.as_ref().and_then(Weak::upgrade) {
            if writer.is_open() {
                return writer.nrt_reader(self.applied_all_deletes).map(Some);
            }
        }
        Self::open_with_soft_deletes(Arc::clone(&self.storage), self.soft_deletes_field.as_deref())
            .map(Some)
    }

    /// Whether this reader still reflects the latest state.
    ///
    /// NRT readers compare against the writer's in-memory state; others
    /// against the newest commit in storage.
    pub fn is_current(&self) -> Result<bool> {
        if let Some(writer) = self.writer.as_ref().and_then(Weak::upgrade) {
            return Ok(writer.is_open() && writer.is_current(&self.segment_infos));
        }
        if self.writer.is_some() {
            // the writer is gone; whatever it committed last is on disk
            return Ok(false);
        }
        let latest = last_commit_generation(&self.storage.list_files()?);
        Ok(latest == self.segment_infos.generation())
    }

    pub fn leaves(&self) -> &[Arc<SegmentReader>] {
        &self.leaves
    }

    pub fn segment_infos(&self) -> &SegmentInfos {
        &self.segment_infos
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn version(&self) -> u64 {
        self.segment_infos.version
    }

    pub fn generation(&self) -> i64 {
        self.segment_infos.generation()
    }

    pub fn max_doc(&self) -> u32 {
        self.max_doc
    }

    pub fn num_docs(&self) -> u32 {
        self.num_docs
    }

    pub fn num_deleted_docs(&self) -> u32 {
        self.max_doc - self.num_docs
    }

    pub fn has_deletions(&self) -> bool {
        self.num_docs < self.max_doc
    }

    /// Leaf holding global doc `doc` and the doc's id within it.
    pub fn leaf_for(&self, doc: u32) -> Result<(&Arc<SegmentReader>, u32)> {
        if doc >= self.max_doc {
            return Err(QuireError::invalid_argument(format!(
                "doc {doc} is out of bounds (maxDoc={})",
                self.max_doc
            )));
        }
        let index = match self.starts.binary_search(&doc) {
            Ok(mut i) => {
                // skip empty leaves sharing the same start
                while i + 1 < self.starts.len() && self.starts[i + 1] == doc {
                    i += 1;
                }
                i
            }
            Err(i) => i - 1,
        };
        Ok((&self.leaves[index], doc - self.starts[index]))
    }

    /// Global doc id of the first document of leaf `ord`.
    pub fn doc_base(&self, ord: usize) -> u32 {
        self.starts[ord]
    }

    pub fn is_live(&self, doc: u32) -> bool {
        self.leaf_for(doc)
            .map(|(leaf, local)| leaf.is_live(local))
            .unwrap_or(false)
    }

    /// Stored fields of a live document.
    pub fn document(&self, doc: u32) -> Result<Document> {
        let (leaf, local) = self.leaf_for(doc)?;
        if !leaf.is_live(local) {
            return Err(QuireError::invalid_argument(format!("doc {doc} is deleted")));
        }
        leaf.stored_document(local)
    }
}

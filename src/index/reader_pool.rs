//! Writer-side segment state: loaded cores, pending deletes and pending doc
//! values updates of every segment in the index.
//!
//! Deletes and updates resolved against flushed segments are held here until
//! a commit (or an NRT reader) needs them, then written as new live docs and
//! doc values generations.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use ahash::AHashMap;
use log::{debug, warn};

use crate::error::{QuireError, Result};
use crate::index::buffered_updates::{DocValuesUpdate, FrozenBufferedUpdates};
use crate::index::codec::{Codec, codec_for_name};
use crate::index::dwpt::{FlushedSegment, soft_deleted_count};
use crate::index::field_info::{FieldInfo, FieldNumbers};
use crate::index::live_docs::LiveDocs;
use crate::index::reader::TermSource;
use crate::index::segment_core::SegmentCore;
use crate::index::segment_info::SegmentCommitInfo;
use crate::index::segment_infos::SegmentInfos;
use crate::index::segment_reader::{SegmentReader, load_core, load_live_docs};
use crate::index::term::Term;
use crate::storage::Storage;

/// In-memory state of one segment owned by the writer.
#[derive(Debug)]
pub struct ReadersAndUpdates {
    core: Arc<SegmentCore>,
    live_docs: LiveDocs,
    pending_delete_count: u32,
    dirty_fields: BTreeSet<u32>,
}

impl ReadersAndUpdates {
    pub fn load(storage: &dyn Storage, commit_info: &SegmentCommitInfo) -> Result<Self> {
        let core = load_core(storage, commit_info)?;
        let live_docs = load_live_docs(storage, commit_info)?
            .unwrap_or_else(|| LiveDocs::all_live(commit_info.max_doc()));
        Ok(ReadersAndUpdates {
            core: Arc::new(core),
            live_docs,
            pending_delete_count: 0,
            dirty_fields: BTreeSet::new(),
        })
    }

    pub fn from_flushed(segment: &FlushedSegment) -> Self {
        Self::from_parts(
            Arc::clone(&segment.core),
            segment
                .live_docs
                .clone()
                .unwrap_or_else(|| LiveDocs::all_live(segment.commit_info.max_doc())),
        )
    }

    pub fn from_parts(core: Arc<SegmentCore>, live_docs: LiveDocs) -> Self {
        ReadersAndUpdates {
            core,
            live_docs,
            pending_delete_count: 0,
            dirty_fields: BTreeSet::new(),
        }
    }

    pub fn core(&self) -> &Arc<SegmentCore> {
        &self.core
    }

    pub fn live_docs(&self) -> &LiveDocs {
        &self.live_docs
    }

    /// Hard delete `doc`. Returns true if it was live.
    pub fn delete(&mut self, doc: u32) -> bool {
        let deleted = self.live_docs.delete(doc);
        if deleted {
            self.pending_delete_count += 1;
        }
        deleted
    }

    pub fn del_count(&self) -> u32 {
        self.live_docs.deleted_count()
    }

    /// Live documents carrying a soft delete marker.
    pub fn soft_del_count(&self, soft_deletes_field: Option<&str>) -> u32 {
        soft_deleted_count(&self.core, soft_deletes_field, &self.live_docs)
    }

    pub fn is_dirty(&self) -> bool {
        self.pending_delete_count > 0 || !self.dirty_fields.is_empty()
    }

    pub fn pending_delete_count(&self) -> u32 {
        self.pending_delete_count
    }

    /// Apply a frozen packet. Returns the number of newly deleted documents
    /// and whether any doc values changed.
    pub fn apply(
        &mut self,
        updates: &FrozenBufferedUpdates,
        field_numbers: &FieldNumbers,
    ) -> Result<(u32, bool)> {
        let mut deleted = 0;
        if !updates.terms.is_empty() || !updates.queries.is_empty() {
            let matched = updates.matching_deletes(self.core.as_ref())?;
            for (doc, hit) in matched.iter().enumerate() {
                if hit && self.delete(doc as u32) {
                    deleted += 1;
                }
            }
        }
        let mut updated = false;
        for (term, update) in &updates.doc_values_updates {
            updated |= self.apply_doc_values_update(term, update, field_numbers)?;
        }
        Ok((deleted, updated))
    }

    /// Set the value of every document containing `term`, deleted ones
    /// included.
    pub fn apply_doc_values_update(
        &mut self,
        term: &Term,
        update: &DocValuesUpdate,
        field_numbers: &FieldNumbers,
    ) -> Result<bool> {
        let docs: Vec<u32> = match self.core.postings(term) {
            Some(postings) => postings.iter().map(|p| p.doc).collect(),
            None => return Ok(false),
        };
        if docs.is_empty() {
            return Ok(false);
        }
        let core = Arc::make_mut(&mut self.core);
        let number = match core.field_infos().by_name(update.field()) {
            Some(info) => info.number,
            None => {
                let number = field_numbers.number_of(update.field()).ok_or_else(|| {
                    QuireError::invalid_argument(format!(
                        "doc values update of unknown field \"{}\"",
                        update.field()
                    ))
                })?;
                let mut info = FieldInfo::new(update.field(), number);
                info.set_doc_values_type(update.dv_type())?;
                info.soft_deletes_field =
                    field_numbers.soft_deletes_field().as_deref() == Some(update.field());
                let infos = core.field_infos().with_field(info)?;
                core.set_field_infos(infos);
                number
            }
        };
        let column = core.doc_values_mut(number, update.dv_type())?;
        for doc in docs {
            update.apply_to(column, doc)?;
        }
        self.dirty_fields.insert(number);
        Ok(true)
    }

    /// Write pending live docs and doc values updates as new generations of
    /// `commit_info`. Returns true if anything was written.
    pub fn write(
        &mut self,
        storage: &dyn Storage,
        commit_info: &mut SegmentCommitInfo,
        soft_deletes_field: Option<&str>,
    ) -> Result<bool> {
        if !self.is_dirty() {
            return Ok(false);
        }
        let codec = codec_for_name(&commit_info.info().codec)?;
        if !self.dirty_fields.is_empty() {
            self.write_field_updates(storage, codec.as_ref(), commit_info)?;
        }
        if self.pending_delete_count > 0 {
            let generation = commit_info.next_write_del_gen();
            if let Err(e) =
                codec.write_live_docs(storage, commit_info.name(), generation, &self.live_docs)
            {
                commit_info.advance_next_write_del_gen();
                return Err(e);
            }
            commit_info.advance_del_gen();
            debug!(
                "wrote live docs of {} generation {generation} ({} deleted)",
                commit_info.name(),
                self.live_docs.deleted_count()
            );
            self.pending_delete_count = 0;
        }
        commit_info.set_del_counts(
            self.live_docs.deleted_count(),
            self.soft_del_count(soft_deletes_field),
        )?;
        Ok(true)
    }

    fn write_field_updates(
        &mut self,
        storage: &dyn Storage,
        codec: &dyn Codec,
        commit_info: &mut SegmentCommitInfo,
    ) -> Result<()> {
        let segment = commit_info.name().to_string();
        let dv_gen = commit_info.next_write_dv_gen();
        let mut columns = BTreeMap::new();
        for number in &self.dirty_fields {
            if let Some(column) = self.core.doc_values(*number) {
                columns.insert(*number, column.clone());
            }
        }
        let dvu = match codec.write_doc_values_updates(storage, &segment, dv_gen, &columns) {
            Ok(name) => name,
            Err(e) => {
                commit_info.advance_next_write_dv_gen();
                return Err(e);
            }
        };

        let mut infos = self.core.field_infos().clone();
        for number in &self.dirty_fields {
            if let Some(name) = infos.by_number(*number).map(|f| f.name.clone()) {
                infos = infos.with_dv_gen(&name, dv_gen)?;
            }
        }
        let fi_gen = commit_info.next_write_field_infos_gen();
        let fnm = match codec.write_field_infos(storage, &segment, fi_gen, &infos) {
            Ok(name) => name,
            Err(e) => {
                if let Err(delete_error) = storage.delete_file(&dvu) {
                    warn!("failed to delete {dvu}: {delete_error}");
                }
                commit_info.advance_next_write_dv_gen();
                commit_info.advance_next_write_field_infos_gen();
                return Err(e);
            }
        };
        commit_info.advance_dv_gen();
        commit_info.advance_field_infos_gen();
        let mut dv_files = commit_info.dv_updates_files().clone();
        for number in &self.dirty_fields {
            dv_files.insert(*number, std::iter::once(dvu.clone()).collect());
        }
        commit_info.set_dv_updates_files(dv_files);
        commit_info.set_field_infos_files(std::iter::once(fnm).collect());
        Arc::make_mut(&mut self.core).set_field_infos(infos);
        debug!(
            "wrote doc values updates of {segment} generation {dv_gen} for {} fields",
            self.dirty_fields.len()
        );
        self.dirty_fields.clear();
        Ok(())
    }

    /// Reader over the current in-memory state.
    pub fn reader(
        &self,
        commit_info: &SegmentCommitInfo,
        soft_deletes_field: Option<&str>,
    ) -> Result<SegmentReader> {
        let live_docs = if self.live_docs.deleted_count() == 0 {
            None
        } else {
            Some(Arc::new(self.live_docs.clone()))
        };
        SegmentReader::from_parts(
            commit_info.clone(),
            Arc::clone(&self.core),
            live_docs,
            soft_deletes_field,
        )
    }
}

/// Per-segment writer state, keyed by segment name.
#[derive(Debug)]
pub struct ReaderPool {
    storage: Arc<dyn Storage>,
    field_numbers: Arc<FieldNumbers>,
    soft_deletes_field: Option<String>,
    readers: AHashMap<String, ReadersAndUpdates>,
}

impl ReaderPool {
    pub fn new(
        storage: Arc<dyn Storage>,
        field_numbers: Arc<FieldNumbers>,
        soft_deletes_field: Option<String>,
    ) -> Self {
        ReaderPool {
            storage,
            field_numbers,
            soft_deletes_field,
            readers: AHashMap::new(),
        }
    }

    pub fn soft_deletes_field(&self) -> Option<&str> {
        self.soft_deletes_field.as_deref()
    }

    /// State of `commit_info`'s segment, loading it on first use.
    pub fn get(&mut self, commit_info: &SegmentCommitInfo) -> Result<&mut ReadersAndUpdates> {
        if !self.readers.contains_key(commit_info.name()) {
            let rau = ReadersAndUpdates::load(self.storage.as_ref(), commit_info)?;
            self.readers.insert(commit_info.name().to_string(), rau);
        }
        self.readers
            .get_mut(commit_info.name())
            .ok_or_else(|| QuireError::internal("reader pool entry vanished"))
    }

    pub fn get_if_loaded(&self, name: &str) -> Option<&ReadersAndUpdates> {
        self.readers.get(name)
    }

    pub fn insert(&mut self, name: &str, rau: ReadersAndUpdates) {
        self.readers.insert(name.to_string(), rau);
    }

    pub fn add_flushed(&mut self, segment: &FlushedSegment) {
        self.insert(
            segment.commit_info.name(),
            ReadersAndUpdates::from_flushed(segment),
        );
    }

    pub fn drop_reader(&mut self, name: &str) -> Option<ReadersAndUpdates> {
        self.readers.remove(name)
    }

    pub fn drop_all(&mut self) {
        self.readers.clear();
    }

    /// Apply a frozen packet to one segment.
    pub fn apply(
        &mut self,
        commit_info: &SegmentCommitInfo,
        updates: &FrozenBufferedUpdates,
    ) -> Result<(u32, bool)> {
        let field_numbers = Arc::clone(&self.field_numbers);
        self.get(commit_info)?.apply(updates, &field_numbers)
    }

    /// Deleted documents as a merge sees them: hard deletes plus live soft
    /// deleted documents.
    pub fn num_deletes_to_merge(&self, commit_info: &SegmentCommitInfo) -> u32 {
        match self.readers.get(commit_info.name()) {
            Some(rau) => rau.del_count() + rau.soft_del_count(self.soft_deletes_field()),
            None => commit_info.del_count_with_soft(true),
        }
    }

    /// Live documents of a segment, counting soft deletes when configured.
    pub fn num_docs(&self, commit_info: &SegmentCommitInfo) -> u32 {
        commit_info.max_doc() - self.num_deletes_to_merge(commit_info)
    }

    pub fn any_pending_changes(&self) -> bool {
        self.readers.values().any(ReadersAndUpdates::is_dirty)
    }

    /// Write every dirty segment of `infos`. Returns true if anything was
    /// written.
    pub fn write_all(&mut self, infos: &mut SegmentInfos) -> Result<bool> {
        let mut written = false;
        let soft = self.soft_deletes_field.clone();
        for commit_info in infos.segments_mut().iter_mut() {
            if let Some(rau) = self.readers.get_mut(commit_info.name()) {
                written |= rau.write(self.storage.as_ref(), commit_info, soft.as_deref())?;
            }
        }
        Ok(written)
    }

    /// Reader over the writer's current view of a segment.
    pub fn reader(&mut self, commit_info: &SegmentCommitInfo) -> Result<SegmentReader> {
        let soft = self.soft_deletes_field.clone();
        self.get(commit_info)?.reader(commit_info, soft.as_deref())
    }
}

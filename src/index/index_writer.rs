//! The index writer: adds, updates and deletes documents, publishes flushed
//! segments, runs merges and writes commits.
//!
//! Any number of threads may call the indexing methods concurrently. Each
//! call returns a sequence number; numbers are unique, increase with the
//! order in which operations took effect, and a commit returns the number
//! that separates the operations it contains from those it doesn't.
//!
//! Lock order is `close_lock`, `commit_lock`, `full_flush_lock`,
//! `purge_lock`, then `state`. A merge's own state lock nests inside
//! `state`. Merges never hold `state` while they copy data.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::slice;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};

use crate::document::{Document, Field};
use crate::error::{QuireError, Result};
use crate::index::buffered_updates::DocValuesUpdate;
use crate::index::config::{IndexWriterConfig, OpenMode};
use crate::index::delete_queue::DeleteNode;
use crate::index::directory_reader::DirectoryReader;
use crate::index::documents_writer::{DocumentsWriter, DocumentsWriterParams};
use crate::index::dwpt::DwptSettings;
use crate::index::field_info::{DocValuesType, FieldNumbers, IndexOptions};
use crate::index::file_deleter::IndexFileDeleter;
use crate::index::file_names::segment_name;
use crate::index::flush_control::FlushSettings;
use crate::index::flush_queue::FlushTicket;
use crate::index::live_docs::LiveDocs;
use crate::index::merge_policy::{MergeContext, MergeTrigger, OneMerge};
use crate::index::merge_scheduler::MergeSource;
use crate::index::merger::{MergeInput, MergedSegment, merge_segments};
use crate::index::reader_pool::{ReaderPool, ReadersAndUpdates};
use crate::index::segment_core::numeric_value;
use crate::index::segment_info::SegmentCommitInfo;
use crate::index::segment_infos::{SegmentInfos, last_commit_generation};
use crate::index::term::Term;
use crate::search::query::Query;
use crate::storage::{Storage, StorageLock, WRITE_LOCK_NAME};

/// How long a waiter sleeps before it re-checks merge progress.
const MERGE_WAIT: Duration = Duration::from_millis(250);

/// A commit written by `prepare_commit` and not yet made visible.
struct PendingCommit {
    /// `None` when there was nothing to commit.
    infos: Option<SegmentInfos>,
    /// Files referenced on behalf of the pending commit.
    files: BTreeSet<String>,
    seq_no: i64,
    change_count: u64,
}

/// Everything guarded by the writer's state lock.
struct WriterState {
    segment_infos: SegmentInfos,
    /// Segments of the last commit, restored by rollback.
    rollback_infos: SegmentInfos,
    pool: ReaderPool,
    deleter: IndexFileDeleter,
    pending_merges: VecDeque<Arc<OneMerge>>,
    running_merges: Vec<Arc<OneMerge>>,
    merging_segments: BTreeSet<String>,
    /// Segments a forced merge still has to fold.
    segments_to_merge: BTreeSet<String>,
    merge_max_num_segments: Option<usize>,
    merge_exceptions: Vec<QuireError>,
    stop_merges: bool,
    change_count: u64,
    last_commit_change_count: u64,
    pending_commit: Option<PendingCommit>,
}

/// Merge policy view of the writer state.
struct WriterMergeContext<'a> {
    storage: &'a dyn Storage,
    pool: &'a ReaderPool,
    merging: &'a BTreeSet<String>,
}

impl MergeContext for WriterMergeContext<'_> {
    fn num_deletes_to_merge(&self, info: &SegmentCommitInfo) -> u32 {
        self.pool.num_deletes_to_merge(info)
    }

    fn merging_segments(&self) -> &BTreeSet<String> {
        self.merging
    }

    fn size_in_bytes(&self, info: &SegmentCommitInfo) -> u64 {
        info.size_in_bytes(self.storage).unwrap_or(0)
    }
}

/// State shared between the writer handle, its NRT readers and merge
/// threads.
pub struct WriterInner {
    self_ref: Weak<WriterInner>,
    storage: Arc<dyn Storage>,
    config: IndexWriterConfig,
    write_lock: Mutex<Option<Box<dyn StorageLock>>>,
    docs_writer: DocumentsWriter,
    field_numbers: Arc<FieldNumbers>,
    dwpt_settings: Arc<DwptSettings>,
    segment_counter: Arc<AtomicU64>,
    pending_num_docs: Arc<AtomicI64>,
    state: Mutex<WriterState>,
    merge_cond: Condvar,
    close_lock: Mutex<()>,
    commit_lock: Mutex<()>,
    full_flush_lock: Mutex<()>,
    purge_lock: Mutex<()>,
    tragedy: Mutex<Option<Arc<QuireError>>>,
    closed: AtomicBool,
}

/// Writes documents into an index in a [`Storage`].
///
/// Only one writer can be open on a storage at a time; the second one fails
/// with [`QuireError::LockObtainFailed`]. Dropping a writer that was not
/// closed rolls back everything since the last commit.
pub struct IndexWriter {
    inner: Arc<WriterInner>,
}

impl std::fmt::Debug for IndexWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexWriter")
            .field("config", &self.inner.config)
            .field("closed", &self.inner.closed.load(Ordering::Acquire))
            .finish()
    }
}

/// Pick the segments the writer starts from. The flag tells whether the
/// first commit must be written even if nothing else changes.
fn initial_segment_infos(
    storage: &dyn Storage,
    config: &IndexWriterConfig,
) -> Result<(SegmentInfos, bool)> {
    if let Some(commit) = &config.index_commit {
        if config.open_mode == OpenMode::Create {
            return Err(QuireError::invalid_argument(
                "an index commit cannot be opened in create mode",
            ));
        }
        let mut infos = SegmentInfos::read_commit(storage, commit.segments_file_name())?;
        // the next commit must not overwrite a newer segments file
        let latest = last_commit_generation(&storage.list_files()?);
        infos.set_next_write_generation(latest);
        return Ok((infos, true));
    }

    match config.open_mode {
        OpenMode::Append => Ok((SegmentInfos::read_latest_commit(storage)?, false)),
        OpenMode::CreateOrAppend => match SegmentInfos::read_latest_commit(storage) {
            Ok(infos) => Ok((infos, false)),
            Err(QuireError::IndexNotFound(_)) => Ok((SegmentInfos::new(), true)),
            Err(e) => Err(e),
        },
        OpenMode::Create => {
            let mut infos = SegmentInfos::new();
            match SegmentInfos::read_latest_commit(storage) {
                Ok(previous) => {
                    infos.counter = previous.counter;
                    infos.version = previous.version;
                    infos.update_generation(&previous);
                    infos.changed();
                }
                Err(QuireError::IndexNotFound(_)) => {}
                Err(e) => return Err(e),
            }
            Ok((infos, true))
        }
    }
}

impl IndexWriter {
    /// Open a writer on `storage`.
    pub fn new(storage: Arc<dyn Storage>, config: IndexWriterConfig) -> Result<Self> {
        config.validate()?;
        let write_lock = storage.obtain_lock(WRITE_LOCK_NAME)?;
        let (segment_infos, initial_change) = initial_segment_infos(storage.as_ref(), &config)?;

        if segment_infos.total_max_doc() > config.max_docs as u64 {
            return Err(QuireError::max_docs_exceeded(format!(
                "index holds {} documents, more than the limit of {}",
                segment_infos.total_max_doc(),
                config.max_docs
            )));
        }
        if let Some(sort) = &config.index_sort {
            for commit_info in segment_infos.segments() {
                if commit_info.info().index_sort.as_ref() != Some(sort) {
                    return Err(QuireError::invalid_argument(format!(
                        "cannot change index sort from {:?} to {sort:?} (segment {})",
                        commit_info.info().index_sort,
                        commit_info.name()
                    )));
                }
            }
        }

        let soft_deletes_field = config.soft_deletes_field.clone();
        let field_numbers = Arc::new(FieldNumbers::new(soft_deletes_field.clone()));
        let mut pool = ReaderPool::new(
            Arc::clone(&storage),
            Arc::clone(&field_numbers),
            soft_deletes_field.clone(),
        );
        for commit_info in segment_infos.segments() {
            let rau = pool.get(commit_info)?;
            field_numbers.register_all(rau.core().field_infos())?;
        }

        let deleter = IndexFileDeleter::new(
            Arc::clone(&storage),
            Arc::clone(&config.deletion_policy),
            &segment_infos,
        )?;

        let dwpt_settings = Arc::new(DwptSettings {
            analyzer: Arc::clone(&config.analyzer),
            codec: Arc::clone(&config.codec),
            use_compound_file: config.use_compound_file,
            index_sort: config.index_sort.clone(),
            soft_deletes_field,
        });
        let segment_counter = Arc::new(AtomicU64::new(segment_infos.counter));
        let pending_num_docs = Arc::new(AtomicI64::new(segment_infos.total_max_doc() as i64));
        let docs_writer = DocumentsWriter::new(DocumentsWriterParams {
            storage: Arc::clone(&storage),
            dwpt_settings: Arc::clone(&dwpt_settings),
            field_numbers: Arc::clone(&field_numbers),
            segment_counter: Arc::clone(&segment_counter),
            flush_settings: FlushSettings {
                ram_buffer_bytes: config.ram_buffer_bytes(),
                max_buffered_docs: config.max_buffered_docs,
                hard_limit_bytes: config.hard_limit_bytes(),
            },
            flush_policy: Arc::clone(&config.flush_policy),
            pool_size: config.max_thread_states,
            pending_num_docs: Arc::clone(&pending_num_docs),
            max_docs: config.max_docs,
            start_seq_no: 1,
            queue_generation: 0,
        });

        info!(
            "opened index writer on {} segments, generation {}, mode {:?}",
            segment_infos.len(),
            segment_infos.generation(),
            config.open_mode
        );

        let state = WriterState {
            rollback_infos: segment_infos.clone(),
            segment_infos,
            pool,
            deleter,
            pending_merges: VecDeque::new(),
            running_merges: Vec::new(),
            merging_segments: BTreeSet::new(),
            segments_to_merge: BTreeSet::new(),
            merge_max_num_segments: None,
            merge_exceptions: Vec::new(),
            stop_merges: false,
            change_count: u64::from(initial_change),
            last_commit_change_count: 0,
            pending_commit: None,
        };

        let inner = Arc::new_cyclic(|self_ref| WriterInner {
            self_ref: self_ref.clone(),
            storage,
            config,
            write_lock: Mutex::new(Some(write_lock)),
            docs_writer,
            field_numbers,
            dwpt_settings,
            segment_counter,
            pending_num_docs,
            state: Mutex::new(state),
            merge_cond: Condvar::new(),
            close_lock: Mutex::new(()),
            commit_lock: Mutex::new(()),
            full_flush_lock: Mutex::new(()),
            purge_lock: Mutex::new(()),
            tragedy: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        Ok(IndexWriter { inner })
    }

    pub(crate) fn inner(&self) -> &Arc<WriterInner> {
        &self.inner
    }

    pub fn config(&self) -> &IndexWriterConfig {
        &self.inner.config
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.inner.storage
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    /// Add one document. Returns its sequence number.
    pub fn add_document(&self, doc: &Document) -> Result<i64> {
        self.inner.update_documents(slice::from_ref(doc), None)
    }

    /// Add a block of documents that get adjacent doc ids in one segment.
    pub fn add_documents(&self, docs: &[Document]) -> Result<i64> {
        self.inner.update_documents(docs, None)
    }

    /// Delete every document containing `term`, then add `doc`, atomically.
    pub fn update_document(&self, term: Term, doc: &Document) -> Result<i64> {
        self.inner
            .update_documents(slice::from_ref(doc), Some(DeleteNode::Term(term)))
    }

    pub fn update_documents(&self, term: Term, docs: &[Document]) -> Result<i64> {
        self.inner.update_documents(docs, Some(DeleteNode::Term(term)))
    }

    /// Mark the documents containing `term` as soft deleted by setting
    /// `soft_deletes` on them, then add `doc`.
    ///
    /// The replaced documents stay in the index and are hidden from readers
    /// opened with the soft deletes field.
    pub fn soft_update_document(
        &self,
        term: Term,
        doc: &Document,
        soft_deletes: &[Field],
    ) -> Result<i64> {
        self.soft_update_documents(term, slice::from_ref(doc), soft_deletes)
    }

    pub fn soft_update_documents(
        &self,
        term: Term,
        docs: &[Document],
        soft_deletes: &[Field],
    ) -> Result<i64> {
        let updates = self.inner.soft_delete_updates(&term, soft_deletes)?;
        self.inner
            .update_documents(docs, Some(DeleteNode::DocValuesUpdates(updates)))
    }

    pub fn delete_documents(&self, terms: &[Term]) -> Result<i64> {
        self.inner.delete(DeleteNode::Terms(terms.to_vec()))
    }

    pub fn delete_documents_by_query(&self, queries: &[Arc<dyn Query>]) -> Result<i64> {
        self.inner.delete(DeleteNode::Queries(queries.to_vec()))
    }

    /// Set a numeric doc value on every document containing `term`.
    pub fn update_numeric_doc_value(&self, term: Term, field: &str, value: i64) -> Result<i64> {
        self.update_doc_values(term, &[DocValuesUpdate::numeric(field, value)])
    }

    pub fn update_binary_doc_value(&self, term: Term, field: &str, value: Vec<u8>) -> Result<i64> {
        self.update_doc_values(term, &[DocValuesUpdate::binary(field, value)])
    }

    /// Apply several doc values updates to the documents containing `term`
    /// as one operation.
    pub fn update_doc_values(&self, term: Term, updates: &[DocValuesUpdate]) -> Result<i64> {
        if updates.is_empty() {
            return Err(QuireError::invalid_argument("no doc values updates given"));
        }
        for update in updates {
            self.inner.check_doc_values_update(update)?;
        }
        let node = updates
            .iter()
            .map(|update| (term.clone(), update.clone()))
            .collect();
        self.inner.delete(DeleteNode::DocValuesUpdates(node))
    }

    /// Drop every document and segment. Takes effect on the next commit.
    pub fn delete_all(&self) -> Result<i64> {
        self.inner.delete_all()
    }

    /// Flush buffered documents into segments without committing.
    pub fn flush(&self) -> Result<()> {
        self.inner.flush_internal(true)
    }

    /// Write a pending commit that [`IndexWriter::commit`] makes visible.
    pub fn prepare_commit(&self) -> Result<i64> {
        let inner = &self.inner;
        inner.ensure_open()?;
        let _commit = inner.commit_lock.lock();
        inner.prepare_commit_internal()
    }

    /// Make every operation so far durable and visible to new readers.
    ///
    /// Returns the sequence number of the commit, or -1 if nothing changed
    /// since the last commit.
    pub fn commit(&self) -> Result<i64> {
        self.inner.ensure_open()?;
        self.inner.commit_internal()
    }

    /// Register natural merges and hand them to the scheduler.
    pub fn maybe_merge(&self) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.maybe_merge_internal(MergeTrigger::Explicit, None);
        Ok(())
    }

    /// Merge until at most `max_num_segments` segments remain, waiting for
    /// the merges to finish.
    pub fn force_merge(&self, max_num_segments: usize) -> Result<()> {
        self.force_merge_with_wait(max_num_segments, true)
    }

    pub fn force_merge_with_wait(&self, max_num_segments: usize, do_wait: bool) -> Result<()> {
        self.inner.force_merge(max_num_segments, do_wait)
    }

    /// Merge segments with deleted documents to reclaim their space.
    pub fn force_merge_deletes(&self, do_wait: bool) -> Result<()> {
        self.inner.force_merge_deletes(do_wait)
    }

    /// Block until no merge is pending or running. Returns the first merge
    /// failure since the last call.
    pub fn wait_for_merges(&self) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.wait_for_merges_internal()
    }

    /// Ask the deletion policy again and delete files of commits it drops.
    pub fn delete_unused_files(&self) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.state.lock().deleter.revisit_policy()
    }

    /// User data stored with the next commit.
    pub fn set_live_commit_data(&self, data: BTreeMap<String, String>) -> Result<()> {
        self.inner.ensure_open()?;
        let mut state = self.inner.state.lock();
        state.segment_infos.set_user_data(data, true);
        state.change_count += 1;
        Ok(())
    }

    pub fn live_commit_data(&self) -> BTreeMap<String, String> {
        self.inner.state.lock().segment_infos.user_data().clone()
    }

    /// Commit if configured, then release the write lock.
    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }

    /// Discard everything since the last commit and release the write lock.
    pub fn rollback(&self) -> Result<()> {
        let _close = self.inner.close_lock.lock();
        self.inner.rollback_internal()
    }

    /// Documents in the index and in RAM, deleted ones included.
    pub fn max_doc(&self) -> u64 {
        let state = self.inner.state.lock();
        state.segment_infos.total_max_doc() + self.inner.docs_writer.num_buffered_docs()
    }

    /// Live documents, counting buffered documents and the deletes applied
    /// so far.
    pub fn num_docs(&self) -> u64 {
        let state = self.inner.state.lock();
        let flushed: u64 = state
            .segment_infos
            .segments()
            .iter()
            .map(|info| state.pool.num_docs(info) as u64)
            .sum();
        flushed + self.inner.docs_writer.num_buffered_docs()
    }

    /// Documents reserved against the document limit.
    pub fn pending_num_docs(&self) -> i64 {
        self.inner.pending_num_docs.load(Ordering::SeqCst)
    }

    pub fn num_buffered_docs(&self) -> u64 {
        self.inner.docs_writer.num_buffered_docs()
    }

    pub fn ram_bytes_used(&self) -> usize {
        self.inner.docs_writer.ram_bytes_used()
    }

    pub fn segment_count(&self) -> usize {
        self.inner.state.lock().segment_infos.len()
    }

    /// Copy of the writer's current segment list.
    pub fn segment_infos(&self) -> SegmentInfos {
        self.inner.state.lock().segment_infos.clone()
    }

    pub fn has_uncommitted_changes(&self) -> bool {
        let state = self.inner.state.lock();
        state.change_count != state.last_commit_change_count
            || state.pending_commit.is_some()
            || self.inner.docs_writer.any_changes()
    }

    pub fn has_pending_merges(&self) -> bool {
        let state = self.inner.state.lock();
        !state.pending_merges.is_empty() || !state.running_merges.is_empty()
    }

    /// The error that forced the writer closed, if any.
    pub fn tragic_exception(&self) -> Option<Arc<QuireError>> {
        self.inner.tragedy.lock().clone()
    }
}

impl Drop for IndexWriter {
    fn drop(&mut self) {
        if self.inner.is_open() {
            debug!("index writer dropped without close; rolling back");
            let _close = self.inner.close_lock.lock();
            if let Err(e) = self.inner.rollback_internal() {
                warn!("rollback of dropped index writer failed: {e}");
            }
        }
    }
}

impl WriterInner {
    pub(crate) fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }
        Err(match self.tragedy.lock().as_ref() {
            Some(cause) => QuireError::already_closed(format!(
                "this index writer is closed after an unrecoverable error: {cause}"
            )),
            None => QuireError::already_closed("this index writer is closed"),
        })
    }

    /// Latch `e` as the writer's tragedy if it may have left the writer
    /// inconsistent, and roll back. Returns `e` for the caller.
    fn check_tragic(&self, e: QuireError, location: &str) -> QuireError {
        if !e.is_tragic_candidate() {
            return e;
        }
        {
            let mut tragedy = self.tragedy.lock();
            if tragedy.is_some() {
                return e;
            }
            *tragedy = Some(Arc::new(e.duplicate()));
        }
        error!("tragic error in {location}: {e}");
        if let Err(rollback_err) = self.rollback_internal() {
            warn!("rollback after tragic error failed: {rollback_err}");
        }
        e
    }

    fn update_documents(&self, docs: &[Document], node: Option<DeleteNode>) -> Result<i64> {
        self.ensure_open()?;
        let (seq_no, has_events) = self
            .docs_writer
            .update_documents(docs, node)
            .map_err(|e| self.check_tragic(e, "update_documents"))?;
        if has_events {
            self.process_events(true)?;
        }
        Ok(seq_no)
    }

    fn delete(&self, node: DeleteNode) -> Result<i64> {
        self.ensure_open()?;
        let (seq_no, has_events) = self
            .docs_writer
            .delete(node)
            .map_err(|e| self.check_tragic(e, "delete"))?;
        if has_events {
            self.process_events(true)?;
        }
        Ok(seq_no)
    }

    /// Doc values updates that soft delete the documents matching `term`.
    fn soft_delete_updates(
        &self,
        term: &Term,
        soft_deletes: &[Field],
    ) -> Result<Vec<(Term, DocValuesUpdate)>> {
        self.ensure_open()?;
        if soft_deletes.is_empty() {
            return Err(QuireError::invalid_argument(
                "at least one soft deletes field is required",
            ));
        }
        let configured = self.field_numbers.soft_deletes_field();
        let mut updates = Vec::with_capacity(soft_deletes.len());
        for field in soft_deletes {
            if field.field_type.doc_values_type != DocValuesType::Numeric {
                return Err(QuireError::invalid_argument(format!(
                    "soft deletes field \"{}\" must be a numeric doc values field",
                    field.name
                )));
            }
            let value = numeric_value(&field.value).ok_or_else(|| {
                QuireError::invalid_argument(format!(
                    "soft deletes field \"{}\" has a non numeric value",
                    field.name
                ))
            })?;
            self.field_numbers.add_or_get(
                &field.name,
                None,
                IndexOptions::None,
                DocValuesType::Numeric,
                configured.as_deref() == Some(field.name.as_str()),
            )?;
            updates.push((term.clone(), DocValuesUpdate::numeric(field.name.clone(), value)));
        }
        Ok(updates)
    }

    fn check_doc_values_update(&self, update: &DocValuesUpdate) -> Result<()> {
        if let Some(sort) = &self.config.index_sort {
            if sort.field == update.field() {
                return Err(QuireError::invalid_argument(format!(
                    "cannot update the index sort field \"{}\"",
                    sort.field
                )));
            }
        }
        self.field_numbers
            .verify_doc_values_type(update.field(), update.dv_type())
    }

    fn process_events(&self, trigger_merge: bool) -> Result<()> {
        let published = self
            .publish_flushed_segments(false)
            .map_err(|e| self.check_tragic(e, "publish_flushed_segments"))?;
        if published > 0 && trigger_merge {
            self.maybe_merge_internal(MergeTrigger::SegmentFlush, None);
        }
        Ok(())
    }

    /// Publish flush tickets in order. Without `force`, gives up if another
    /// thread is already publishing.
    fn publish_flushed_segments(&self, force: bool) -> Result<usize> {
        let _purge = if force {
            self.purge_lock.lock()
        } else {
            match self.purge_lock.try_lock() {
                Some(guard) => guard,
                None => return Ok(0),
            }
        };
        self.docs_writer
            .purge_flush_tickets(force, |ticket| self.publish_ticket(ticket))
    }

    /// Apply a ticket's frozen updates to the existing segments, then add
    /// its segment.
    fn publish_ticket(&self, ticket: FlushTicket) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if ticket.failed() {
            debug!("publishing deletes of a failed flush");
        }
        if let Some(frozen) = ticket.frozen_updates.as_ref().filter(|f| f.any()) {
            let mut changed = false;
            let mut fully_deleted = Vec::new();
            for commit_info in state.segment_infos.segments() {
                let (deleted, updated) = state.pool.apply(commit_info, frozen)?;
                changed |= deleted > 0 || updated;
                if deleted > 0
                    && !state.merging_segments.contains(commit_info.name())
                    && state.pool.num_deletes_to_merge(commit_info) >= commit_info.max_doc()
                {
                    fully_deleted.push((commit_info.name().to_string(), commit_info.max_doc()));
                }
            }
            if frozen.has_doc_values_updates() {
                // started merges replay these on the merged segment
                for merge in &state.running_merges {
                    let mut merge_state = merge.state.lock();
                    if merge_state.merged_name.is_some() {
                        merge_state
                            .dv_updates
                            .extend(frozen.doc_values_updates.iter().cloned());
                    }
                }
            }
            for (name, max_doc) in &fully_deleted {
                debug!("dropping fully deleted segment {name}");
                state.segment_infos.remove(name);
                state.pool.drop_reader(name);
                self.pending_num_docs
                    .fetch_sub(i64::from(*max_doc), Ordering::SeqCst);
            }
            if changed {
                state.segment_infos.changed();
                state.change_count += 1;
            }
            if !fully_deleted.is_empty() {
                state.deleter.checkpoint(&state.segment_infos, false)?;
            }
        }

        if let Some(segment) = ticket.segment {
            let max_doc = segment.commit_info.max_doc();
            if segment.commit_info.is_fully_deleted(true) {
                debug!(
                    "flushed segment {} is fully deleted; dropping it",
                    segment.commit_info.name()
                );
                state.deleter.delete_new_files(segment.commit_info.files().iter());
                self.pending_num_docs
                    .fetch_sub(i64::from(max_doc), Ordering::SeqCst);
                return Ok(());
            }
            state.pool.add_flushed(&segment);
            let name = segment.commit_info.name().to_string();
            state.segment_infos.add(segment.commit_info)?;
            state.segment_infos.changed();
            state.change_count += 1;
            state.deleter.checkpoint(&state.segment_infos, false)?;
            debug!("published segment {name} with {max_doc} docs");
        }
        Ok(())
    }

    /// Flush every DWPT and publish the result. Returns whether anything
    /// changed and the full flush's sequence number.
    fn full_flush_and_publish(&self) -> Result<(bool, i64)> {
        let _flush = self.full_flush_lock.lock();
        let outcome = match self.docs_writer.flush_all_threads() {
            Ok(outcome) => outcome,
            Err(e) => {
                self.docs_writer.abort_full_flush();
                return Err(e);
            }
        };
        if let Err(e) = self.publish_flushed_segments(true) {
            self.docs_writer.abort_full_flush();
            return Err(e);
        }
        self.docs_writer.finish_full_flush(&outcome.queue)?;
        Ok((outcome.any_changes, outcome.seq_no))
    }

    fn flush_internal(&self, trigger_merge: bool) -> Result<()> {
        self.ensure_open()?;
        let (any_changes, _) = self
            .full_flush_and_publish()
            .map_err(|e| self.check_tragic(e, "flush"))?;
        if any_changes && trigger_merge {
            self.maybe_merge_internal(MergeTrigger::FullFlush, None);
        }
        Ok(())
    }

    /// Caller holds `commit_lock`.
    fn prepare_commit_internal(&self) -> Result<i64> {
        if self.state.lock().pending_commit.is_some() {
            return Err(QuireError::illegal_state(
                "prepare_commit was already called; call commit or rollback first",
            ));
        }
        let (_, seq_no) = self
            .full_flush_and_publish()
            .map_err(|e| self.check_tragic(e, "prepare_commit"))?;

        let (mut to_commit, files, change_count) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.pool.write_all(&mut state.segment_infos)? {
                state.segment_infos.changed();
                state.change_count += 1;
                state.deleter.checkpoint(&state.segment_infos, false)?;
            }
            if state.change_count == state.last_commit_change_count {
                debug!("prepare_commit: no changes pending");
                state.pending_commit = Some(PendingCommit {
                    infos: None,
                    files: BTreeSet::new(),
                    seq_no,
                    change_count: state.change_count,
                });
                return Ok(seq_no);
            }
            let counter = self.segment_counter.load(Ordering::SeqCst);
            state.segment_infos.counter = state.segment_infos.counter.max(counter);
            let to_commit = state.segment_infos.clone();
            let files = to_commit.files(false);
            state.deleter.inc_ref(files.iter());
            (to_commit, files, state.change_count)
        };

        let files_vec: Vec<String> = files.iter().cloned().collect();
        let written = self
            .storage
            .sync(&files_vec)
            .and_then(|_| to_commit.prepare_commit(self.storage.as_ref()));
        let mut state = self.state.lock();
        match written {
            Ok(pending_name) => {
                debug!("prepare_commit: wrote {pending_name}");
                state.pending_commit = Some(PendingCommit {
                    infos: Some(to_commit),
                    files,
                    seq_no,
                    change_count,
                });
                Ok(seq_no)
            }
            Err(e) => {
                state.deleter.dec_ref(files.iter());
                Err(e)
            }
        }
    }

    fn commit_internal(&self) -> Result<i64> {
        let result = {
            let _commit = self.commit_lock.lock();
            if self.state.lock().pending_commit.is_none() {
                self.prepare_commit_internal()?;
            }
            self.finish_commit()?
        };
        if result >= 0 {
            self.maybe_merge_internal(MergeTrigger::Commit, None);
        }
        Ok(result)
    }

    /// Publish the pending commit. Caller holds `commit_lock`.
    fn finish_commit(&self) -> Result<i64> {
        let pending = self.state.lock().pending_commit.take();
        let Some(pending) = pending else {
            return Ok(-1);
        };
        let Some(mut infos) = pending.infos else {
            return Ok(-1);
        };
        let finished = infos.finish_commit(self.storage.as_ref());
        let mut guard = self.state.lock();
        let state = &mut *guard;
        match finished {
            Ok(segments_file) => {
                state.segment_infos.update_generation(&infos);
                state.last_commit_change_count = pending.change_count;
                state.rollback_infos = infos.clone();
                let checkpointed = state.deleter.checkpoint(&infos, true);
                state.deleter.dec_ref(pending.files.iter());
                checkpointed?;
                info!(
                    "committed {segments_file} with {} segments",
                    infos.len()
                );
                Ok(pending.seq_no)
            }
            Err(e) => {
                warn!("commit failed: {e}");
                state.deleter.dec_ref(pending.files.iter());
                Err(e)
            }
        }
    }

    pub(crate) fn nrt_reader(
        self: &Arc<Self>,
        apply_all_deletes: bool,
    ) -> Result<Arc<DirectoryReader>> {
        self.ensure_open()?;
        let (any_changes, _) = self
            .full_flush_and_publish()
            .map_err(|e| self.check_tragic(e, "nrt_reader"))?;
        let (infos, leaves) = {
            let mut state = self.state.lock();
            let infos = state.segment_infos.clone();
            let mut leaves = Vec::with_capacity(infos.len());
            for commit_info in infos.segments() {
                leaves.push(Arc::new(state.pool.reader(commit_info)?));
            }
            (infos, leaves)
        };
        debug!(
            "opened NRT reader on {} segments, version {}",
            leaves.len(),
            infos.version
        );
        let reader = DirectoryReader::from_leaves(
            Arc::clone(&self.storage),
            infos,
            leaves,
            self.config.soft_deletes_field.clone(),
            Some(Arc::downgrade(self)),
            apply_all_deletes,
        )?;
        if any_changes {
            self.maybe_merge_internal(MergeTrigger::FullFlush, None);
        }
        Ok(Arc::new(reader))
    }

    /// Whether a reader over `infos` still sees everything.
    pub(crate) fn is_current(&self, infos: &SegmentInfos) -> bool {
        let state = self.state.lock();
        infos.version == state.segment_infos.version && !self.docs_writer.any_changes()
    }

    fn merge_context<'a>(&'a self, state: &'a WriterState) -> WriterMergeContext<'a> {
        WriterMergeContext {
            storage: self.storage.as_ref(),
            pool: &state.pool,
            merging: &state.merging_segments,
        }
    }

    /// Ask the merge policy for merges and register them.
    fn update_pending_merges(
        &self,
        state: &mut WriterState,
        trigger: MergeTrigger,
        max_num_segments: Option<usize>,
    ) -> Vec<Arc<OneMerge>> {
        if state.stop_merges || !self.is_open() {
            return Vec::new();
        }
        let spec = {
            let ctx = self.merge_context(state);
            let policy = &self.config.merge_policy;
            match max_num_segments {
                Some(max) => policy.find_forced_merges(
                    &state.segment_infos,
                    max,
                    &state.segments_to_merge,
                    &ctx,
                ),
                None => policy.find_merges(trigger, &state.segment_infos, &ctx),
            }
        };
        let mut registered = Vec::new();
        if let Some(spec) = spec {
            for merge in spec.merges {
                if let Some(merge) = self.register_merge(state, merge, max_num_segments) {
                    registered.push(merge);
                }
            }
        }
        registered
    }

    fn register_merge(
        &self,
        state: &mut WriterState,
        mut merge: OneMerge,
        max_num_segments: Option<usize>,
    ) -> Option<Arc<OneMerge>> {
        if merge.segments().is_empty() {
            return None;
        }
        for commit_info in merge.segments() {
            let name = commit_info.name();
            if state.merging_segments.contains(name) || state.segment_infos.get(name).is_none() {
                debug!(
                    "skipping merge {}: segment {name} is gone or already merging",
                    merge.describe()
                );
                return None;
            }
        }
        for name in merge.segment_names() {
            state.merging_segments.insert(name.to_string());
        }
        merge.set_max_num_segments(max_num_segments);
        let merge = Arc::new(merge);
        debug!("registered merge {}", merge.describe());
        state.pending_merges.push_back(Arc::clone(&merge));
        Some(merge)
    }

    fn maybe_merge_internal(&self, trigger: MergeTrigger, max_num_segments: Option<usize>) {
        if !self.config.merge_scheduler.runs_merges() {
            return;
        }
        let has_pending = {
            let mut state = self.state.lock();
            self.update_pending_merges(&mut state, trigger, max_num_segments);
            !state.pending_merges.is_empty()
        };
        if has_pending {
            self.run_scheduler(trigger);
        }
    }

    fn run_scheduler(&self, trigger: MergeTrigger) {
        let Some(source) = self.self_ref.upgrade() else {
            return;
        };
        if let Err(e) = self.config.merge_scheduler.merge(source, trigger) {
            warn!("merge scheduler reported: {e}");
        }
    }

    fn force_merge(&self, max_num_segments: usize, do_wait: bool) -> Result<()> {
        self.ensure_open()?;
        if max_num_segments < 1 {
            return Err(QuireError::invalid_argument(format!(
                "max_num_segments must be >= 1, got {max_num_segments}"
            )));
        }
        info!("force_merge: max_num_segments={max_num_segments}");
        self.flush_internal(true)?;
        {
            let mut state = self.state.lock();
            let names: BTreeSet<String> = state
                .segment_infos
                .segments()
                .iter()
                .map(|info| info.name().to_string())
                .collect();
            state.segments_to_merge = names;
            state.merge_max_num_segments = Some(max_num_segments);
        }
        self.maybe_merge_internal(MergeTrigger::Explicit, Some(max_num_segments));
        if do_wait {
            let waited = self.wait_for_merges_internal();
            let mut state = self.state.lock();
            state.segments_to_merge.clear();
            state.merge_max_num_segments = None;
            drop(state);
            waited?;
        }
        Ok(())
    }

    fn force_merge_deletes(&self, do_wait: bool) -> Result<()> {
        self.ensure_open()?;
        self.flush_internal(true)?;
        if !self.config.merge_scheduler.runs_merges() {
            return Ok(());
        }
        let registered = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let spec = {
                let ctx = self.merge_context(state);
                self.config
                    .merge_policy
                    .find_forced_deletes_merges(&state.segment_infos, &ctx)
            };
            let mut registered = 0;
            if let Some(spec) = spec {
                for merge in spec.merges {
                    registered += usize::from(self.register_merge(state, merge, None).is_some());
                }
            }
            registered
        };
        info!("force_merge_deletes: registered {registered} merges");
        if registered > 0 {
            self.run_scheduler(MergeTrigger::Explicit);
        }
        if do_wait {
            self.wait_for_merges_internal()?;
        }
        Ok(())
    }

    fn wait_for_merges_internal(&self) -> Result<()> {
        if !self.config.merge_scheduler.runs_merges() {
            return Ok(());
        }
        let has_pending = !self.state.lock().pending_merges.is_empty();
        if has_pending {
            self.run_scheduler(MergeTrigger::Explicit);
        }
        let mut state = self.state.lock();
        while !state.pending_merges.is_empty() || !state.running_merges.is_empty() {
            if state.stop_merges {
                break;
            }
            self.merge_cond.wait_for(&mut state, MERGE_WAIT);
        }
        let first = state.merge_exceptions.drain(..).next();
        drop(state);
        if let Err(e) = self.config.merge_scheduler.sync() {
            debug!("merge scheduler sync: {e}");
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Snapshot the sources of `merge` and reserve the merged name.
    fn merge_init(&self, merge: &OneMerge) -> Result<(Vec<MergeInput>, String)> {
        let mut state = self.state.lock();
        if merge.is_aborted() || state.stop_merges {
            return Err(QuireError::merge_aborted(format!(
                "merge {} was aborted before it started",
                merge.describe()
            )));
        }
        let mut inputs = Vec::with_capacity(merge.segments().len());
        for commit_info in merge.segments() {
            let current = state
                .segment_infos
                .get(commit_info.name())
                .cloned()
                .ok_or_else(|| {
                    QuireError::merge_aborted(format!(
                        "segment {} was dropped before the merge started",
                        commit_info.name()
                    ))
                })?;
            let rau = state.pool.get(&current)?;
            inputs.push(MergeInput {
                core: Arc::clone(rau.core()),
                live_docs: rau.live_docs().clone(),
                commit_info: current,
            });
        }
        let name = segment_name(self.segment_counter.fetch_add(1, Ordering::SeqCst));
        let mut merge_state = merge.state.lock();
        merge_state.inputs = inputs.clone();
        merge_state.merged_name = Some(name.clone());
        merge_state.dv_updates.clear();
        Ok((inputs, name))
    }

    fn run_merge(&self, merge: &OneMerge) -> Result<()> {
        let (inputs, name) = self.merge_init(merge)?;
        info!(
            "merging {} ({} docs) into {name}",
            merge.describe(),
            merge.total_max_doc()
        );
        let merged = merge_segments(
            self.storage.as_ref(),
            &name,
            &inputs,
            &self.dwpt_settings,
            Arc::clone(&self.field_numbers),
            &|| merge.is_aborted(),
        )?;
        self.commit_merge(merge, &inputs, merged)
    }

    /// Writer view of the merged segment: deletes that hit the sources
    /// while merging, then doc values updates recorded meanwhile.
    fn carry_over_changes(
        &self,
        state: &WriterState,
        inputs: &[MergeInput],
        merged: &MergedSegment,
        dv_updates: &[(Term, DocValuesUpdate)],
    ) -> Result<ReadersAndUpdates> {
        let max_doc = merged.segment.commit_info.max_doc();
        let mut rau = ReadersAndUpdates::from_parts(
            Arc::clone(&merged.segment.core),
            LiveDocs::all_live(max_doc),
        );
        for (input, doc_map) in inputs.iter().zip(&merged.doc_maps) {
            let Some(current) = state.pool.get_if_loaded(input.commit_info.name()) else {
                continue;
            };
            for doc in input.live_docs.newly_deleted(current.live_docs()) {
                if let Some(Some(target)) = doc_map.get(doc as usize) {
                    rau.delete(*target);
                }
            }
        }
        for (term, update) in dv_updates {
            rau.apply_doc_values_update(term, update, &self.field_numbers)?;
        }
        Ok(rau)
    }

    /// Swap the merged segment in for its sources.
    fn commit_merge(
        &self,
        merge: &OneMerge,
        inputs: &[MergeInput],
        merged: Option<MergedSegment>,
    ) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let merged_files = merged
            .as_ref()
            .map(|m| m.segment.commit_info.files())
            .unwrap_or_default();

        let dropped_source = inputs
            .iter()
            .find(|input| state.segment_infos.get(input.commit_info.name()).is_none());
        if merge.is_aborted() || state.stop_merges || dropped_source.is_some() {
            state.deleter.delete_new_files(merged_files.iter());
            return Err(QuireError::merge_aborted(format!(
                "merge {} was aborted before commit",
                merge.describe()
            )));
        }

        let dv_updates = std::mem::take(&mut merge.state.lock().dv_updates);
        let source_docs: u64 = inputs
            .iter()
            .map(|input| u64::from(input.commit_info.max_doc()))
            .sum();
        let position = inputs
            .iter()
            .filter_map(|input| state.segment_infos.position(input.commit_info.name()))
            .min()
            .unwrap_or(0);

        let mut merged_entry = None;
        if let Some(merged) = merged {
            let rau = match self.carry_over_changes(state, inputs, &merged, &dv_updates) {
                Ok(rau) => rau,
                Err(e) => {
                    state.deleter.delete_new_files(merged_files.iter());
                    return Err(e);
                }
            };
            let soft = self.config.soft_deletes_field.as_deref();
            if rau.del_count() + rau.soft_del_count(soft) >= merged.segment.commit_info.max_doc() {
                debug!(
                    "merged segment {} is fully deleted; dropping it",
                    merged.segment.commit_info.name()
                );
                state.deleter.delete_new_files(merged_files.iter());
            } else {
                merged_entry = Some((merged.segment.commit_info, rau));
            }
        }

        let mut was_forced = false;
        for input in inputs {
            let name = input.commit_info.name();
            state.segment_infos.remove(name);
            state.pool.drop_reader(name);
            was_forced |= state.segments_to_merge.remove(name);
        }
        let mut merged_docs = 0u64;
        let mut merged_name = None;
        if let Some((commit_info, rau)) = merged_entry {
            let name = commit_info.name().to_string();
            merged_docs = u64::from(commit_info.max_doc());
            let at = position.min(state.segment_infos.len());
            state.segment_infos.segments_mut().insert(at, commit_info);
            state.pool.insert(&name, rau);
            if was_forced {
                state.segments_to_merge.insert(name.clone());
            }
            merged_name = Some(name);
        }
        self.pending_num_docs
            .fetch_sub((source_docs - merged_docs) as i64, Ordering::SeqCst);
        state.segment_infos.changed();
        state.change_count += 1;
        state.deleter.checkpoint(&state.segment_infos, false)?;
        merge.state.lock().committed = true;
        info!(
            "merged {} into {} ({merged_docs} docs)",
            merge.describe(),
            merged_name.as_deref().unwrap_or("nothing")
        );
        Ok(())
    }

    /// Abort every merge and wait for running ones to stop.
    fn abort_merges(&self) {
        let mut state = self.state.lock();
        state.stop_merges = true;
        let pending: Vec<Arc<OneMerge>> = state.pending_merges.drain(..).collect();
        for merge in pending {
            merge.abort();
            for name in merge.segment_names() {
                state.merging_segments.remove(name);
            }
        }
        for merge in &state.running_merges {
            merge.abort();
        }
        self.merge_cond.notify_all();
        while !state.running_merges.is_empty() {
            debug!(
                "waiting for {} aborted merges to finish",
                state.running_merges.len()
            );
            self.merge_cond.wait_for(&mut state, MERGE_WAIT);
        }
    }

    fn delete_all(&self) -> Result<i64> {
        self.ensure_open()?;
        let _flush = self.full_flush_lock.lock();
        self.abort_merges();
        let dropped = self.docs_writer.lock_and_abort_all();
        let result = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            for segment in &dropped {
                state.deleter.delete_new_files(segment.commit_info.files().iter());
            }
            self.pending_num_docs
                .fetch_sub(state.segment_infos.total_max_doc() as i64, Ordering::SeqCst);
            state.segment_infos.clear();
            state.pool.drop_all();
            state.segments_to_merge.clear();
            state.merge_max_num_segments = None;
            self.field_numbers.clear();
            state.segment_infos.changed();
            state.change_count += 1;
            state.stop_merges = false;
            state.deleter.checkpoint(&state.segment_infos, false)
        };
        self.docs_writer.unlock_after_abort();
        result?;
        info!("deleted all documents");
        self.docs_writer.next_sequence_number()
    }

    fn close(&self) -> Result<()> {
        let _close = self.close_lock.lock();
        if !self.is_open() {
            return Ok(());
        }
        if !self.config.commit_on_close {
            return self.rollback_internal();
        }
        let shutdown = self
            .flush_internal(true)
            .and_then(|_| self.wait_for_merges_internal())
            .and_then(|_| {
                self.state.lock().stop_merges = true;
                self.commit_internal()
            });
        if let Err(e) = shutdown {
            warn!("close failed, rolling back: {e}");
            if let Err(rollback_err) = self.rollback_internal() {
                warn!("rollback during close failed: {rollback_err}");
            }
            return Err(e);
        }
        self.abort_merges();
        self.docs_writer.close();
        let scheduler_result = self.config.merge_scheduler.close();
        self.closed.store(true, Ordering::Release);
        {
            let mut state = self.state.lock();
            state.pool.drop_all();
            state.deleter.close();
        }
        self.write_lock.lock().take();
        info!("closed index writer");
        scheduler_result
    }

    /// Drop everything since the last commit and close.
    fn rollback_internal(&self) -> Result<()> {
        if !self.is_open() {
            return Ok(());
        }
        info!("rolling back index writer");
        self.abort_merges();
        if let Err(e) = self.config.merge_scheduler.close() {
            debug!("merge scheduler close during rollback: {e}");
        }
        let dropped = self.docs_writer.lock_and_abort_all();
        self.docs_writer.close();
        self.closed.store(true, Ordering::Release);

        let result = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            for segment in &dropped {
                state.deleter.delete_new_files(segment.commit_info.files().iter());
            }
            if let Some(pending) = state.pending_commit.take() {
                if let Some(mut infos) = pending.infos {
                    infos.rollback_commit(self.storage.as_ref());
                }
                state.deleter.dec_ref(pending.files.iter());
            }
            state.pool.drop_all();
            let rollback_infos = state.rollback_infos.clone();
            state.segment_infos.replace(&rollback_infos);
            self.pending_num_docs
                .store(rollback_infos.total_max_doc() as i64, Ordering::SeqCst);
            let result = state
                .deleter
                .checkpoint(&state.segment_infos, false)
                .and_then(|_| state.deleter.refresh());
            state.deleter.close();
            result
        };
        self.docs_writer.unlock_after_abort();
        self.write_lock.lock().take();
        self.merge_cond.notify_all();
        result
    }
}

impl MergeSource for WriterInner {
    fn next_merge(&self) -> Option<Arc<OneMerge>> {
        let mut state = self.state.lock();
        if state.stop_merges {
            return None;
        }
        let merge = state.pending_merges.pop_front()?;
        state.running_merges.push(Arc::clone(&merge));
        Some(merge)
    }

    fn on_merge_finished(&self, merge: &Arc<OneMerge>) {
        let mut state = self.state.lock();
        state.running_merges.retain(|m| !Arc::ptr_eq(m, merge));
        for name in merge.segment_names() {
            state.merging_segments.remove(name);
        }
        let committed = merge.state.lock().committed;
        if committed && !state.stop_merges {
            let forced = if state.segments_to_merge.is_empty() {
                merge.max_num_segments()
            } else {
                state.merge_max_num_segments
            };
            self.update_pending_merges(&mut state, MergeTrigger::MergeFinished, forced);
        }
        self.merge_cond.notify_all();
    }

    fn pending_merge_count(&self) -> usize {
        self.state.lock().pending_merges.len()
    }

    fn merge(&self, merge: &Arc<OneMerge>) -> Result<()> {
        match self.run_merge(merge) {
            Ok(()) => Ok(()),
            Err(e @ QuireError::MergeAborted(_)) => {
                debug!("merge {} aborted: {e}", merge.describe());
                Err(e)
            }
            Err(e) => {
                error!("merge {} failed: {e}", merge.describe());
                self.state.lock().merge_exceptions.push(e.duplicate());
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::StandardAnalyzer;
    use crate::index::merge_policy::LogDocMergePolicy;
    use crate::index::merge_scheduler::SerialMergeScheduler;
    use crate::storage::memory::{MemoryStorage, MemoryStorageConfig};

    fn storage() -> Arc<dyn Storage> {
        Arc::new(MemoryStorage::new(MemoryStorageConfig::default()))
    }

    fn config() -> IndexWriterConfig {
        let mut config = IndexWriterConfig::new(Arc::new(StandardAnalyzer::new()));
        config.merge_scheduler = Arc::new(SerialMergeScheduler::new());
        config
    }

    fn doc(id: &str) -> Document {
        Document::builder()
            .add_string("id", id)
            .add_text("body", "hello world")
            .add_numeric_doc_value("rank", 1)
            .build()
    }

    #[test]
    fn test_sequence_numbers_increase() {
        let writer = IndexWriter::new(storage(), config()).unwrap();
        let a = writer.add_document(&doc("1")).unwrap();
        let b = writer.add_document(&doc("2")).unwrap();
        let c = writer.delete_documents(&[Term::text("id", "1")]).unwrap();
        assert!(a < b && b < c);
        let commit = writer.commit().unwrap();
        assert!(commit > c);
        assert_eq!(writer.num_docs(), 1);
    }

    #[test]
    fn test_commit_without_changes_returns_minus_one() {
        let writer = IndexWriter::new(storage(), config()).unwrap();
        writer.add_document(&doc("1")).unwrap();
        assert!(writer.commit().unwrap() > 0);
        assert_eq!(writer.commit().unwrap(), -1);
        assert!(!writer.has_uncommitted_changes());
    }

    #[test]
    fn test_second_writer_fails_to_lock() {
        let storage = storage();
        let writer = IndexWriter::new(Arc::clone(&storage), config()).unwrap();
        let second = IndexWriter::new(Arc::clone(&storage), config());
        assert!(matches!(second, Err(QuireError::LockObtainFailed(_))));
        writer.close().unwrap();
        IndexWriter::new(storage, config()).unwrap().close().unwrap();
    }

    #[test]
    fn test_prepare_commit_twice_is_illegal() {
        let writer = IndexWriter::new(storage(), config()).unwrap();
        writer.add_document(&doc("1")).unwrap();
        writer.prepare_commit().unwrap();
        assert!(matches!(
            writer.prepare_commit(),
            Err(QuireError::IllegalState(_))
        ));
        assert!(writer.commit().unwrap() > 0);
    }

    #[test]
    fn test_rollback_discards_uncommitted() {
        let storage = storage();
        let writer = IndexWriter::new(Arc::clone(&storage), config()).unwrap();
        writer.add_document(&doc("1")).unwrap();
        writer.commit().unwrap();
        writer.add_document(&doc("2")).unwrap();
        writer.rollback().unwrap();
        assert!(matches!(
            writer.add_document(&doc("3")),
            Err(QuireError::AlreadyClosed(_))
        ));

        let writer = IndexWriter::new(storage, config()).unwrap();
        assert_eq!(writer.num_docs(), 1);
    }

    #[test]
    fn test_force_merge_to_one_segment() {
        let mut config = config();
        config.merge_policy = Arc::new(LogDocMergePolicy::default());
        let writer = IndexWriter::new(storage(), config).unwrap();
        for i in 0..4 {
            writer.add_document(&doc(&i.to_string())).unwrap();
            writer.flush().unwrap();
        }
        writer.delete_documents(&[Term::text("id", "0")]).unwrap();
        writer.force_merge(1).unwrap();
        assert_eq!(writer.segment_count(), 1);
        assert_eq!(writer.max_doc(), 3);
        assert_eq!(writer.num_docs(), 3);
    }

    #[test]
    fn test_update_unknown_doc_values_field_rejected() {
        let writer = IndexWriter::new(storage(), config()).unwrap();
        writer.add_document(&doc("1")).unwrap();
        let result = writer.update_numeric_doc_value(Term::text("id", "1"), "missing", 3);
        assert!(matches!(result, Err(QuireError::InvalidArgument(_))));
        assert!(writer.update_numeric_doc_value(Term::text("id", "1"), "rank", 3).is_ok());
    }

    #[test]
    fn test_delete_all_empties_index() {
        let writer = IndexWriter::new(storage(), config()).unwrap();
        writer.add_document(&doc("1")).unwrap();
        writer.commit().unwrap();
        writer.add_document(&doc("2")).unwrap();
        writer.delete_all().unwrap();
        assert_eq!(writer.max_doc(), 0);
        assert_eq!(writer.pending_num_docs(), 0);
        writer.add_document(&doc("3")).unwrap();
        writer.commit().unwrap();
        assert_eq!(writer.num_docs(), 1);
    }
}

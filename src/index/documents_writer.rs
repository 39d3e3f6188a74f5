//! Routes document and delete calls to DWPTs and drives their flushes.
//!
//! Calls that return `(seq_no, bool)` report in the flag whether flush
//! tickets are waiting to be published; the index writer then purges the
//! ticket queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use log::{debug, warn};

use crate::document::Document;
use crate::error::{QuireError, Result};
use crate::index::delete_queue::{DeleteNode, DeleteQueue};
use crate::index::dwpt::{Dwpt, DwptSettings, FlushedSegment};
use crate::index::dwpt_pool::DwptPool;
use crate::index::field_info::FieldNumbers;
use crate::index::flush_control::{FlushControl, FlushSettings};
use crate::index::flush_policy::FlushPolicy;
use crate::index::flush_queue::{FlushTicket, FlushTicketQueue};
use crate::storage::Storage;

/// How long a stalled thread waits before it checks for flush work again.
const STALL_RECHECK: Duration = Duration::from_millis(250);

/// Outcome of [`DocumentsWriter::flush_all_threads`].
#[derive(Debug)]
pub struct FullFlushOutcome {
    /// Whether any segment or delete was produced.
    pub any_changes: bool,
    /// Sequence number of the full flush.
    pub seq_no: i64,
    /// The delete queue that was flushed.
    pub queue: Arc<DeleteQueue>,
}

#[derive(Debug)]
pub struct DocumentsWriter {
    storage: Arc<dyn Storage>,
    flush_control: FlushControl,
    tickets: FlushTicketQueue,
    /// Documents in the index plus documents buffered, shared with the
    /// index writer.
    pending_num_docs: Arc<AtomicI64>,
    max_docs: i64,
    closed: AtomicBool,
}

/// Construction parameters of a [`DocumentsWriter`].
#[derive(Debug)]
pub struct DocumentsWriterParams {
    pub storage: Arc<dyn Storage>,
    pub dwpt_settings: Arc<DwptSettings>,
    pub field_numbers: Arc<FieldNumbers>,
    pub segment_counter: Arc<AtomicU64>,
    pub flush_settings: FlushSettings,
    pub flush_policy: Arc<dyn FlushPolicy>,
    pub pool_size: usize,
    pub pending_num_docs: Arc<AtomicI64>,
    pub max_docs: i64,
    pub start_seq_no: i64,
    pub queue_generation: u64,
}

impl DocumentsWriter {
    pub fn new(params: DocumentsWriterParams) -> Self {
        let pool = DwptPool::new(
            params.dwpt_settings,
            params.field_numbers,
            params.segment_counter,
        );
        let queue = Arc::new(DeleteQueue::new(params.queue_generation, params.start_seq_no));
        DocumentsWriter {
            storage: params.storage,
            flush_control: FlushControl::new(
                params.flush_settings,
                params.flush_policy,
                pool,
                queue,
                params.pool_size,
            ),
            tickets: FlushTicketQueue::new(),
            pending_num_docs: params.pending_num_docs,
            max_docs: params.max_docs,
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QuireError::already_closed("documents writer is closed"));
        }
        Ok(())
    }

    /// Reserve room for `n` more documents in the index.
    pub fn reserve_docs(&self, n: usize) -> Result<()> {
        let n = n as i64;
        let after = self.pending_num_docs.fetch_add(n, Ordering::SeqCst) + n;
        if after > self.max_docs {
            self.pending_num_docs.fetch_sub(n, Ordering::SeqCst);
            return Err(QuireError::max_docs_exceeded(format!(
                "number of documents in the index cannot exceed {}",
                self.max_docs
            )));
        }
        Ok(())
    }

    pub fn release_docs(&self, n: u64) {
        self.pending_num_docs.fetch_sub(n as i64, Ordering::SeqCst);
    }

    /// Add a block of documents, deleting or updating by `node` first.
    pub fn update_documents(
        &self,
        docs: &[Document],
        node: Option<DeleteNode>,
    ) -> Result<(i64, bool)> {
        self.ensure_open()?;
        let mut has_events = self.pre_update()?;
        self.reserve_docs(docs.len())?;
        let mut dwpt = match self.flush_control.obtain_and_lock() {
            Ok(dwpt) => dwpt,
            Err(e) => {
                self.release_docs(docs.len() as u64);
                return Err(e);
            }
        };
        let is_update = node.is_some();
        let seq_no = match dwpt.update_documents(docs, node) {
            Ok(seq_no) => seq_no,
            Err(e) => {
                self.release_docs(docs.len() as u64);
                if dwpt.is_aborted() {
                    self.abort_dwpt(dwpt);
                } else if let Some(to_flush) = self.flush_control.do_after_document(dwpt, is_update)
                {
                    // a failed flush dropped acknowledged docs and outranks the rejection
                    if let Err(flush_err) = self.flush_pending(Some(to_flush)) {
                        if flush_err.is_tragic_candidate() {
                            return Err(flush_err);
                        }
                        warn!("flush after rejected document failed: {flush_err}");
                    }
                }
                return Err(e);
            }
        };
        let to_flush = self.flush_control.do_after_document(dwpt, is_update);
        has_events |= self.post_update(to_flush)?;
        Ok((seq_no, has_events))
    }

    fn abort_dwpt(&self, mut dwpt: Dwpt) {
        warn!(
            "aborting DWPT {} after a non-recoverable failure, {} docs dropped",
            dwpt.segment_name(),
            dwpt.num_docs()
        );
        self.release_docs(dwpt.num_docs() as u64);
        self.flush_control.do_on_abort(&dwpt);
        dwpt.abort();
    }

    /// Append a global delete or doc values update.
    pub fn delete(&self, node: DeleteNode) -> Result<(i64, bool)> {
        self.ensure_open()?;
        let seq_no = self.flush_control.add_delete(node)?;
        let has_events = self.apply_all_deletes();
        Ok((seq_no, has_events))
    }

    pub fn next_sequence_number(&self) -> Result<i64> {
        self.flush_control.next_sequence_number()
    }

    /// Help flushing while indexing is stalled or flushes are queued.
    fn pre_update(&self) -> Result<bool> {
        let mut has_events = false;
        if !self.flush_control.any_stalled_threads() && self.flush_control.num_queued_flushes() == 0
        {
            return Ok(false);
        }
        loop {
            has_events |= self.flush_pending(None)?;
            if self.flush_control.wait_if_stalled_for(STALL_RECHECK)
                && self.flush_control.num_queued_flushes() == 0
            {
                break;
            }
            self.ensure_open()?;
        }
        Ok(has_events)
    }

    fn post_update(&self, to_flush: Option<Dwpt>) -> Result<bool> {
        let mut has_events = self.apply_all_deletes();
        has_events |= self.flush_pending(to_flush)?;
        Ok(has_events)
    }

    /// Flush `first` and then every DWPT that is pending.
    fn flush_pending(&self, first: Option<Dwpt>) -> Result<bool> {
        let mut flushed = false;
        let mut next = first.or_else(|| self.flush_control.next_pending_flush());
        while let Some(dwpt) = next {
            flushed |= self.do_flush(dwpt)?;
            next = self.flush_control.next_pending_flush();
        }
        Ok(flushed)
    }

    /// Freeze the global deletes into a ticket if the flush policy asked
    /// for it. Deferred while a full flush runs.
    fn apply_all_deletes(&self) -> bool {
        if !self.flush_control.get_and_reset_apply_all_deletes() {
            return false;
        }
        if self.flush_control.is_full_flush() {
            self.flush_control.set_apply_all_deletes();
            return false;
        }
        let queue = self.flush_control.delete_queue();
        self.tickets.add_deletes(&queue)
    }

    /// Freeze the global deletes into a ticket regardless of the policy.
    pub fn freeze_global_deletes(&self) -> bool {
        let queue = self.flush_control.delete_queue();
        self.tickets.add_deletes(&queue)
    }

    fn do_flush(&self, mut dwpt: Dwpt) -> Result<bool> {
        let id = dwpt.id();
        let num_docs = dwpt.num_docs();
        let ticket = self.tickets.add_flush_ticket(&mut dwpt);
        match dwpt.flush(self.storage.as_ref()) {
            Ok(segment) => {
                self.tickets.add_segment(&ticket, segment);
                self.flush_control.do_after_flush(id);
                Ok(true)
            }
            Err(e) => {
                warn!("flush of segment {} failed: {e}", dwpt.segment_name());
                self.tickets.mark_failed(&ticket);
                self.release_docs(num_docs as u64);
                dwpt.abort();
                self.flush_control.do_after_flush(id);
                Err(e)
            }
        }
    }

    /// Flush every DWPT that exists when the call starts.
    ///
    /// On success the caller publishes the tickets and then calls
    /// [`DocumentsWriter::finish_full_flush`]; on failure
    /// [`DocumentsWriter::abort_full_flush`].
    pub fn flush_all_threads(&self) -> Result<FullFlushOutcome> {
        self.ensure_open()?;
        let full = self.flush_control.mark_for_full_flush()?;
        debug!(
            "start full flush of delete queue generation {}",
            full.queue.generation()
        );
        let mut any_changes = false;
        loop {
            while let Some(dwpt) = self.flush_control.next_pending_flush() {
                any_changes |= self.do_flush(dwpt)?;
            }
            if self.flush_control.await_full_flush_progress() {
                break;
            }
        }
        if full.queue.any_changes() {
            any_changes |= self.tickets.add_deletes(&full.queue);
        }
        Ok(FullFlushOutcome {
            any_changes,
            seq_no: full.seq_no,
            queue: full.queue,
        })
    }

    pub fn finish_full_flush(&self, queue: &DeleteQueue) -> Result<()> {
        self.flush_control.finish_full_flush();
        queue.close()
    }

    pub fn abort_full_flush(&self) {
        let dropped = self.flush_control.abort_full_flush();
        self.release_docs(dropped);
    }

    /// Publish ready flush tickets through `consumer`, in ticket order.
    pub fn purge_flush_tickets<F>(&self, force: bool, consumer: F) -> Result<usize>
    where
        F: FnMut(FlushTicket) -> Result<()>,
    {
        if force {
            self.tickets.force_purge(consumer)
        } else {
            self.tickets.try_purge(consumer)
        }
    }

    /// Drop every buffered document, delete and unpublished ticket.
    ///
    /// New indexing calls block until [`DocumentsWriter::unlock_after_abort`].
    /// Returns flushed but unpublished segments whose files must be removed.
    pub fn lock_and_abort_all(&self) -> Vec<FlushedSegment> {
        let dropped = self.flush_control.lock_and_abort_all();
        self.release_docs(dropped);
        self.flush_control.delete_queue().clear();
        let segments = self.tickets.clear();
        for segment in &segments {
            self.release_docs(segment.commit_info.max_doc() as u64);
        }
        segments
    }

    pub fn unlock_after_abort(&self) {
        self.flush_control.unlock_after_abort();
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.flush_control.set_closed();
    }

    pub fn num_buffered_docs(&self) -> u64 {
        self.flush_control.num_buffered_docs()
    }

    pub fn ram_bytes_used(&self) -> usize {
        self.flush_control.ram_bytes_used()
    }

    pub fn has_tickets(&self) -> bool {
        self.tickets.has_tickets()
    }

    pub fn ticket_count(&self) -> usize {
        self.tickets.ticket_count()
    }

    /// Whether anything is buffered that a full flush would publish.
    pub fn any_changes(&self) -> bool {
        self.num_buffered_docs() > 0
            || self.flush_control.delete_queue().any_changes()
            || self.tickets.has_tickets()
    }

    pub fn flush_control(&self) -> &FlushControl {
        &self.flush_control
    }

    pub fn pending_num_docs(&self) -> i64 {
        self.pending_num_docs.load(Ordering::SeqCst)
    }
}

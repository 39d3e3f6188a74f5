//! RAM accounting and flush scheduling for the documents writer.
//!
//! Every DWPT is tracked with its buffered bytes and document count.
//! `active_bytes` covers DWPTs that still take documents, `flush_bytes` those
//! marked flush pending or being written. After every document the
//! [`FlushPolicy`] decides which DWPTs to mark pending; a DWPT that crosses
//! the per thread hard limit is marked regardless.
//!
//! A full flush (commit, NRT reader) swaps in a fresh delete queue and
//! routes every DWPT of the old queue to flushing, including those that are
//! still checked out: they are collected as their threads hand them back.
//! DWPTs of the new queue that become pending meanwhile are held back until
//! the full flush finishes so their flush tickets cannot overtake it.

use std::collections::VecDeque;
use std::sync::Arc;

use ahash::AHashMap;
use log::debug;
use parking_lot::{Condvar, Mutex};

use crate::error::{QuireError, Result};
use crate::index::delete_queue::{DeleteNode, DeleteQueue};
use crate::index::dwpt::Dwpt;
use crate::index::dwpt_pool::DwptPool;
use crate::index::flush_policy::FlushPolicy;
use crate::index::stall_control::StallControl;

/// Flush thresholds taken from the writer configuration.
#[derive(Debug, Clone, Copy)]
pub struct FlushSettings {
    /// Flush once all DWPTs together buffer this much. `None` disables.
    pub ram_buffer_bytes: Option<usize>,
    /// Flush a DWPT once it holds this many documents. `None` disables.
    pub max_buffered_docs: Option<u32>,
    /// Per DWPT ceiling enforced independently of the policy.
    pub hard_limit_bytes: usize,
}

#[derive(Debug, Default)]
struct DwptStats {
    bytes: usize,
    num_docs: u32,
    pending: bool,
}

/// State guarded by the flush control lock. Flush policies see it through
/// the public methods.
#[derive(Debug)]
pub struct FlushState {
    settings: FlushSettings,
    pool: DwptPool,
    delete_queue: Arc<DeleteQueue>,
    stats: AHashMap<u64, DwptStats>,
    active_bytes: usize,
    flush_bytes: usize,
    /// Checked out for flushing, waiting for a thread to write them.
    flush_queue: VecDeque<Dwpt>,
    /// Being written: id to bytes.
    flushing: AHashMap<u64, usize>,
    /// Pending DWPTs of the new queue held back during a full flush.
    blocked: Vec<Dwpt>,
    full_flush_generation: Option<u64>,
    apply_all_deletes: bool,
    aborting: bool,
    closed: bool,
}

impl FlushState {
    pub fn ram_buffer_bytes(&self) -> Option<usize> {
        self.settings.ram_buffer_bytes
    }

    pub fn max_buffered_docs(&self) -> Option<u32> {
        self.settings.max_buffered_docs
    }

    pub fn active_bytes(&self) -> usize {
        self.active_bytes
    }

    pub fn flush_bytes(&self) -> usize {
        self.flush_bytes
    }

    pub fn delete_bytes_used(&self) -> usize {
        self.delete_queue.buffered_bytes()
    }

    pub fn num_docs(&self, dwpt: u64) -> u32 {
        self.stats.get(&dwpt).map_or(0, |s| s.num_docs)
    }

    pub fn is_flush_pending(&self, dwpt: u64) -> bool {
        self.stats.get(&dwpt).is_some_and(|s| s.pending)
    }

    /// Mark a DWPT for flushing. DWPTs without documents are left alone.
    pub fn set_flush_pending(&mut self, dwpt: u64) {
        if let Some(stats) = self.stats.get_mut(&dwpt) {
            if !stats.pending && stats.num_docs > 0 {
                stats.pending = true;
                self.active_bytes -= stats.bytes;
                self.flush_bytes += stats.bytes;
                debug!(
                    "DWPT {dwpt} flush pending ({} docs, {} bytes)",
                    stats.num_docs, stats.bytes
                );
            }
        }
    }

    pub fn set_apply_all_deletes(&mut self) {
        self.apply_all_deletes = true;
    }

    /// The largest DWPT not yet pending, or `fallback` if there is none.
    pub fn find_largest_non_pending_writer(&self, fallback: u64) -> u64 {
        self.stats
            .iter()
            .filter(|(_, s)| !s.pending && s.num_docs > 0)
            .max_by_key(|(id, s)| (s.bytes, std::cmp::Reverse(**id)))
            .map_or(fallback, |(id, _)| *id)
    }

    fn commit_bytes(&mut self, dwpt: u64, bytes: usize, num_docs: u32) {
        let stats = self.stats.entry(dwpt).or_default();
        let previous = stats.bytes;
        stats.bytes = bytes;
        stats.num_docs = num_docs;
        if stats.pending {
            self.flush_bytes = self.flush_bytes + bytes - previous;
        } else {
            self.active_bytes = self.active_bytes + bytes - previous;
        }
    }

    fn forget(&mut self, dwpt: u64) {
        if let Some(stats) = self.stats.remove(&dwpt) {
            if stats.pending {
                self.flush_bytes -= stats.bytes;
            } else {
                self.active_bytes -= stats.bytes;
            }
        }
        self.flushing.remove(&dwpt);
    }

    fn num_pending(&self) -> usize {
        let pending = self.stats.values().filter(|s| s.pending).count();
        pending.saturating_sub(self.flushing.len())
    }

    fn start_flushing(&mut self, dwpt: &Dwpt) {
        let bytes = self.stats.get(&dwpt.id()).map_or(0, |s| s.bytes);
        self.flushing.insert(dwpt.id(), bytes);
    }

    fn next_pending_locked(&mut self) -> Option<Dwpt> {
        if let Some(dwpt) = self.flush_queue.pop_front() {
            self.start_flushing(&dwpt);
            return Some(dwpt);
        }
        if self.full_flush_generation.is_some() {
            return None;
        }
        let FlushState { pool, stats, .. } = &mut *self;
        let dwpt = pool.take_one(|d| stats.get(&d.id()).is_some_and(|s| s.pending))?;
        self.start_flushing(&dwpt);
        Some(dwpt)
    }

    fn is_full_flush_of(&self, dwpt: &Dwpt) -> bool {
        self.full_flush_generation == Some(dwpt.delete_queue().generation())
    }

    #[cfg(test)]
    pub(crate) fn for_policy_test(settings: FlushSettings) -> Self {
        use crate::analysis::StandardAnalyzer;
        use crate::index::codec::StandardCodec;
        use crate::index::dwpt::DwptSettings;
        use crate::index::field_info::FieldNumbers;

        let dwpt_settings = Arc::new(DwptSettings {
            analyzer: Arc::new(StandardAnalyzer::new()),
            codec: Arc::new(StandardCodec),
            use_compound_file: false,
            index_sort: None,
            soft_deletes_field: None,
        });
        let pool = DwptPool::new(
            dwpt_settings,
            Arc::new(FieldNumbers::new(None)),
            Arc::new(std::sync::atomic::AtomicU64::new(0)),
        );
        FlushState::new(settings, pool, Arc::new(DeleteQueue::new(0, 1)))
    }

    #[cfg(test)]
    pub(crate) fn track_for_test(&mut self, dwpt: u64, bytes: usize, num_docs: u32) {
        self.commit_bytes(dwpt, bytes, num_docs);
    }

    fn new(settings: FlushSettings, pool: DwptPool, delete_queue: Arc<DeleteQueue>) -> Self {
        FlushState {
            settings,
            pool,
            delete_queue,
            stats: AHashMap::new(),
            active_bytes: 0,
            flush_bytes: 0,
            flush_queue: VecDeque::new(),
            flushing: AHashMap::new(),
            blocked: Vec::new(),
            full_flush_generation: None,
            apply_all_deletes: false,
            aborting: false,
            closed: false,
        }
    }
}

/// Result of a full flush setup.
#[derive(Debug)]
pub struct FullFlush {
    /// The queue being flushed; closed once the flush is published.
    pub queue: Arc<DeleteQueue>,
    /// Sequence number reserved for the full flush itself.
    pub seq_no: i64,
}

#[derive(Debug)]
pub struct FlushControl {
    state: Mutex<FlushState>,
    changed: Condvar,
    stall: StallControl,
    policy: Arc<dyn FlushPolicy>,
}

impl FlushControl {
    pub fn new(
        settings: FlushSettings,
        policy: Arc<dyn FlushPolicy>,
        pool: DwptPool,
        delete_queue: Arc<DeleteQueue>,
        pool_size: usize,
    ) -> Self {
        FlushControl {
            state: Mutex::new(FlushState::new(settings, pool, delete_queue)),
            changed: Condvar::new(),
            stall: StallControl::new(pool_size),
            policy,
        }
    }

    fn update_stall_state(&self, state: &FlushState) {
        if state.closed {
            self.stall.release();
        } else {
            self.stall.update(state.num_pending(), state.flushing.len());
        }
    }

    pub fn delete_queue(&self) -> Arc<DeleteQueue> {
        Arc::clone(&self.state.lock().delete_queue)
    }

    /// Append a global delete or update and let the policy react.
    pub fn add_delete(&self, node: DeleteNode) -> Result<i64> {
        let mut guard = self.state.lock();
        if guard.closed {
            return Err(QuireError::already_closed("documents writer is closed"));
        }
        let seq_no = guard.delete_queue.add(node)?;
        self.policy.on_delete(&mut guard, None);
        Ok(seq_no)
    }

    /// Sequence number for an operation that buffers nothing.
    pub fn next_sequence_number(&self) -> Result<i64> {
        self.state.lock().delete_queue.next_sequence_number()
    }

    /// Check out a DWPT for the calling thread.
    pub fn obtain_and_lock(&self) -> Result<Dwpt> {
        let mut guard = self.state.lock();
        while guard.aborting && !guard.closed {
            self.changed.wait(&mut guard);
        }
        if guard.closed {
            return Err(QuireError::already_closed("documents writer is closed"));
        }
        let state = &mut *guard;
        let queue = Arc::clone(&state.delete_queue);
        let FlushState { pool, stats, .. } = &mut *state;
        let dwpt = pool.checkout(&queue, |d| !stats.get(&d.id()).is_some_and(|s| s.pending));
        state.stats.entry(dwpt.id()).or_default();
        Ok(dwpt)
    }

    /// Hand a DWPT back after a document call.
    ///
    /// Returns a DWPT the calling thread should flush now: its own if it
    /// became pending, or another pending one.
    pub fn do_after_document(&self, dwpt: Dwpt, is_update: bool) -> Option<Dwpt> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let id = dwpt.id();
        let bytes = dwpt.ram_bytes_used();
        state.commit_bytes(id, bytes, dwpt.num_docs());
        if !state.is_flush_pending(id) {
            if is_update {
                self.policy.on_update(state, id);
            } else {
                self.policy.on_insert(state, id);
            }
            if !state.is_flush_pending(id) && bytes > state.settings.hard_limit_bytes {
                debug!(
                    "DWPT {id} crossed the per thread hard limit ({bytes} > {})",
                    state.settings.hard_limit_bytes
                );
                state.set_flush_pending(id);
            }
        }

        let to_flush = if state.is_full_flush_of(&dwpt) {
            state.pool.detach(id);
            if dwpt.num_docs() > 0 {
                state.set_flush_pending(id);
                state.flush_queue.push_back(dwpt);
            } else {
                state.forget(id);
            }
            None
        } else if state.is_flush_pending(id) {
            state.pool.detach(id);
            if state.full_flush_generation.is_some() {
                state.blocked.push(dwpt);
                None
            } else {
                state.start_flushing(&dwpt);
                Some(dwpt)
            }
        } else {
            state.pool.release(dwpt);
            state.next_pending_locked()
        };
        self.update_stall_state(state);
        self.changed.notify_all();
        to_flush
    }

    /// A document call left its DWPT aborted; drop it.
    pub fn do_on_abort(&self, dwpt: &Dwpt) {
        let mut guard = self.state.lock();
        guard.pool.detach(dwpt.id());
        guard.forget(dwpt.id());
        self.update_stall_state(&guard);
        self.changed.notify_all();
    }

    pub fn next_pending_flush(&self) -> Option<Dwpt> {
        let mut guard = self.state.lock();
        let next = guard.next_pending_locked();
        if next.is_some() {
            self.update_stall_state(&guard);
        }
        next
    }

    /// A flush finished, successfully or not.
    pub fn do_after_flush(&self, dwpt: u64) {
        let mut guard = self.state.lock();
        guard.forget(dwpt);
        self.update_stall_state(&guard);
        self.changed.notify_all();
    }

    /// Start a full flush: swap in a new delete queue and route every DWPT
    /// of the old one to flushing.
    pub fn mark_for_full_flush(&self) -> Result<FullFlush> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.closed {
            return Err(QuireError::already_closed("documents writer is closed"));
        }
        if state.full_flush_generation.is_some() {
            return Err(QuireError::illegal_state("a full flush is already running"));
        }
        let old = Arc::clone(&state.delete_queue);
        let seq_no = old.last_sequence_number() + state.pool.in_use_count() as i64 + 2;
        old.set_max_seq_no(seq_no);
        state.delete_queue = Arc::new(DeleteQueue::new(old.generation() + 1, seq_no + 1));
        state.full_flush_generation = Some(old.generation());

        let generation = old.generation();
        for dwpt in state
            .pool
            .take_free(|d| d.delete_queue().generation() == generation)
        {
            if dwpt.num_docs() > 0 {
                state.set_flush_pending(dwpt.id());
                state.flush_queue.push_back(dwpt);
            } else {
                state.forget(dwpt.id());
            }
        }
        debug!(
            "full flush of delete queue generation {generation}: {} DWPTs queued, {} in use, seq_no={seq_no}",
            state.flush_queue.len(),
            state.pool.in_use_with_generation(generation)
        );
        self.update_stall_state(state);
        Ok(FullFlush { queue: old, seq_no })
    }

    /// Wait until the running full flush has more work or is drained.
    ///
    /// Returns `true` once no DWPT of the flushed queue is checked out,
    /// queued or being written.
    pub fn await_full_flush_progress(&self) -> bool {
        let mut guard = self.state.lock();
        loop {
            let Some(generation) = guard.full_flush_generation else {
                return true;
            };
            if !guard.flush_queue.is_empty() {
                return false;
            }
            let busy =
                guard.pool.in_use_with_generation(generation) > 0 || !guard.flushing.is_empty();
            if !busy {
                return true;
            }
            self.changed.wait(&mut guard);
        }
    }

    /// End the full flush and release the DWPTs held back during it.
    pub fn finish_full_flush(&self) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.full_flush_generation = None;
        let blocked = std::mem::take(&mut state.blocked);
        state.flush_queue.extend(blocked);
        self.update_stall_state(state);
        self.changed.notify_all();
    }

    /// Abort the DWPTs queued by a failed full flush. Returns the number of
    /// documents dropped.
    pub fn abort_full_flush(&self) -> u64 {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut dropped = 0;
        let queued: Vec<Dwpt> = state
            .flush_queue
            .drain(..)
            .chain(state.blocked.drain(..))
            .collect();
        for mut dwpt in queued {
            dropped += dwpt.num_docs() as u64;
            state.forget(dwpt.id());
            dwpt.abort();
        }
        state.full_flush_generation = None;
        self.update_stall_state(state);
        self.changed.notify_all();
        dropped
    }

    /// Block new checkouts, wait for checked out and flushing DWPTs to come
    /// back, and abort every DWPT. Returns the number of documents dropped.
    ///
    /// Must be paired with [`FlushControl::unlock_after_abort`].
    pub fn lock_and_abort_all(&self) -> u64 {
        let mut guard = self.state.lock();
        guard.aborting = true;
        while guard.pool.in_use_count() > 0 || !guard.flushing.is_empty() {
            self.changed.wait(&mut guard);
        }
        let state = &mut *guard;
        let mut all: Vec<Dwpt> = state.flush_queue.drain(..).collect();
        all.append(&mut state.blocked);
        all.extend(state.pool.take_free(|_| true));
        let mut dropped = 0;
        for mut dwpt in all {
            dropped += dwpt.num_docs() as u64;
            state.forget(dwpt.id());
            dwpt.abort();
        }
        state.apply_all_deletes = false;
        self.update_stall_state(state);
        debug!("aborted all DWPTs, {dropped} buffered docs dropped");
        dropped
    }

    pub fn unlock_after_abort(&self) {
        let mut guard = self.state.lock();
        guard.aborting = false;
        self.changed.notify_all();
    }

    /// Wait until no DWPT is being written.
    pub fn wait_for_flush(&self) {
        let mut guard = self.state.lock();
        while !guard.flushing.is_empty() {
            self.changed.wait(&mut guard);
        }
    }

    pub fn get_and_reset_apply_all_deletes(&self) -> bool {
        std::mem::take(&mut self.state.lock().apply_all_deletes)
    }

    pub fn set_apply_all_deletes(&self) {
        self.state.lock().apply_all_deletes = true;
    }

    pub fn num_queued_flushes(&self) -> usize {
        let state = self.state.lock();
        state.flush_queue.len()
    }

    pub fn active_bytes(&self) -> usize {
        self.state.lock().active_bytes
    }

    pub fn flush_bytes(&self) -> usize {
        self.state.lock().flush_bytes
    }

    pub fn ram_bytes_used(&self) -> usize {
        let state = self.state.lock();
        state.active_bytes + state.flush_bytes + state.delete_queue.buffered_bytes()
    }

    /// Documents buffered in DWPTs not yet flushed.
    pub fn num_buffered_docs(&self) -> u64 {
        let state = self.state.lock();
        state.stats.values().map(|s| s.num_docs as u64).sum()
    }

    pub fn any_stalled_threads(&self) -> bool {
        self.stall.is_stalled()
    }

    /// Wait for the stall gate to open, at most `timeout`. Returns whether
    /// it is open.
    pub fn wait_if_stalled_for(&self, timeout: std::time::Duration) -> bool {
        self.stall.wait_if_stalled_for(timeout)
    }

    pub fn is_full_flush(&self) -> bool {
        self.state.lock().full_flush_generation.is_some()
    }

    pub fn set_closed(&self) {
        let mut guard = self.state.lock();
        guard.closed = true;
        self.update_stall_state(&guard);
        self.changed.notify_all();
    }

    #[cfg(test)]
    pub(crate) fn stall_control(&self) -> &StallControl {
        &self.stall
    }

    /// Take `dwpt` out of the pool as flush pending without queueing it, so
    /// the caller decides when it starts flushing.
    #[cfg(test)]
    pub(crate) fn hold_pending(&self, dwpt: &Dwpt) {
        let mut guard = self.state.lock();
        guard.pool.detach(dwpt.id());
        guard.commit_bytes(dwpt.id(), dwpt.ram_bytes_used(), dwpt.num_docs());
        guard.set_flush_pending(dwpt.id());
        self.update_stall_state(&guard);
    }

    #[cfg(test)]
    pub(crate) fn start_flushing(&self, dwpt: &Dwpt) {
        let mut guard = self.state.lock();
        guard.start_flushing(dwpt);
        self.update_stall_state(&guard);
        self.changed.notify_all();
    }
}

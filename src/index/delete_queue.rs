//! The delete queue.
//!
//! Every delete and doc values update issued while a DWPT is buffering must
//! reach exactly the documents added before it. The queue is an append-only
//! arena of operations; each DWPT owns a [`DeleteSlice`] into it and the
//! queue keeps one more slice for the global buffer that later applies to
//! flushed segments.
//!
//! ```text
//!   base                                          tail
//!    |  n0  |  n1  |  n2  |  n3  |  n4  |  n5  |
//!           ^start        ^end                  DWPT slice
//!                  ^global start         ^global end
//! ```
//!
//! Appending takes the queue lock only for the push and the sequence number,
//! so appends from all threads form one total order. A DWPT advances its
//! slice to the tail after every document, then resolves the absorbed nodes
//! against its own buffered documents with `doc_id_upto` set to its doc
//! count: the operation covers every earlier document and none after.
//!
//! Nodes below the lowest slice start still registered are pruned.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use parking_lot::Mutex;

use crate::error::{QuireError, Result};
use crate::index::buffered_updates::{
    APPLY_ALL, BufferedUpdates, DocValuesUpdate, FrozenBufferedUpdates,
};
use crate::index::term::Term;
use crate::search::query::Query;

/// One queued operation.
#[derive(Debug, Clone)]
pub enum DeleteNode {
    Term(Term),
    Terms(Vec<Term>),
    Query(Arc<dyn Query>),
    Queries(Vec<Arc<dyn Query>>),
    DocValuesUpdates(Vec<(Term, DocValuesUpdate)>),
}

impl DeleteNode {
    fn apply(&self, buffered: &mut BufferedUpdates, doc_id_upto: u32) {
        match self {
            DeleteNode::Term(term) => buffered.add_term(term.clone(), doc_id_upto),
            DeleteNode::Terms(terms) => {
                for term in terms {
                    buffered.add_term(term.clone(), doc_id_upto);
                }
            }
            DeleteNode::Query(query) => buffered.add_query(Arc::clone(query), doc_id_upto),
            DeleteNode::Queries(queries) => {
                for query in queries {
                    buffered.add_query(Arc::clone(query), doc_id_upto);
                }
            }
            DeleteNode::DocValuesUpdates(updates) => {
                for (term, update) in updates {
                    buffered.add_doc_values_update(term.clone(), update.clone(), doc_id_upto);
                }
            }
        }
    }
}

/// A cursor `[start, end)` into the queue.
#[derive(Debug)]
pub struct DeleteSlice {
    start: u64,
    end: u64,
}

impl DeleteSlice {
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

#[derive(Debug)]
struct QueueState {
    nodes: VecDeque<Arc<DeleteNode>>,
    /// Position of `nodes[0]`.
    base: u64,
    /// Start positions of live slices, with multiplicity.
    slice_starts: BTreeMap<u64, usize>,
    global_slice: DeleteSlice,
    global_buffer: BufferedUpdates,
}

impl QueueState {
    fn tail(&self) -> u64 {
        self.base + self.nodes.len() as u64
    }

    fn register(&mut self, start: u64) {
        *self.slice_starts.entry(start).or_insert(0) += 1;
    }

    fn unregister(&mut self, start: u64) {
        if let Some(count) = self.slice_starts.get_mut(&start) {
            *count -= 1;
            if *count == 0 {
                self.slice_starts.remove(&start);
            }
        }
    }

    fn nodes_in(&self, start: u64, end: u64) -> Vec<Arc<DeleteNode>> {
        let from = (start - self.base) as usize;
        let to = (end - self.base) as usize;
        self.nodes.range(from..to).cloned().collect()
    }

    fn prune(&mut self) {
        let low_water = self
            .slice_starts
            .keys()
            .next()
            .copied()
            .unwrap_or(u64::MAX)
            .min(self.global_slice.start);
        while self.base < low_water && !self.nodes.is_empty() {
            self.nodes.pop_front();
            self.base += 1;
        }
    }

    /// Move the global slice to the tail and absorb the new nodes.
    fn apply_global_slice(&mut self) {
        let tail = self.tail();
        if self.global_slice.end == tail && self.global_slice.start == tail {
            return;
        }
        self.global_slice.end = tail;
        for node in self.nodes_in(self.global_slice.start, tail) {
            node.apply(&mut self.global_buffer, APPLY_ALL);
        }
        self.global_slice.start = tail;
        self.prune();
    }
}

/// Append-only queue of deletes and updates for one indexing session.
///
/// A full flush replaces the queue with a fresh one whose sequence numbers
/// continue after [`DeleteQueue::max_seq_no`] of the old one.
#[derive(Debug)]
pub struct DeleteQueue {
    state: Mutex<QueueState>,
    generation: u64,
    next_seq_no: AtomicI64,
    max_seq_no: AtomicI64,
    closed: AtomicBool,
}

impl DeleteQueue {
    pub fn new(generation: u64, start_seq_no: i64) -> Self {
        DeleteQueue {
            state: Mutex::new(QueueState {
                nodes: VecDeque::new(),
                base: 0,
                slice_starts: BTreeMap::new(),
                global_slice: DeleteSlice { start: 0, end: 0 },
                global_buffer: BufferedUpdates::new(),
            }),
            generation,
            next_seq_no: AtomicI64::new(start_seq_no),
            max_seq_no: AtomicI64::new(i64::MAX),
            closed: AtomicBool::new(false),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QuireError::already_closed(format!(
                "delete queue generation {} is closed",
                self.generation
            )));
        }
        Ok(())
    }

    /// Take the next sequence number. Must be called with the state locked
    /// so numbers follow queue order.
    fn take_seq_no(&self) -> Result<i64> {
        let seq_no = self.next_seq_no.fetch_add(1, Ordering::SeqCst);
        let max = self.max_seq_no.load(Ordering::SeqCst);
        if seq_no > max {
            return Err(QuireError::internal(format!(
                "sequence number {seq_no} exceeds the limit {max} of delete queue generation {}",
                self.generation
            )));
        }
        Ok(seq_no)
    }

    /// Sequence number for an operation that appends no node.
    pub fn next_sequence_number(&self) -> Result<i64> {
        let _state = self.state.lock();
        self.take_seq_no()
    }

    pub fn last_sequence_number(&self) -> i64 {
        self.next_seq_no.load(Ordering::SeqCst) - 1
    }

    /// Reserve room for operations still in flight on this queue.
    pub fn set_max_seq_no(&self, max_seq_no: i64) {
        self.max_seq_no.store(max_seq_no, Ordering::SeqCst);
    }

    pub fn max_seq_no(&self) -> i64 {
        self.max_seq_no.load(Ordering::SeqCst)
    }

    /// Append a global operation and absorb it into the global buffer.
    pub fn add(&self, node: DeleteNode) -> Result<i64> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        state.nodes.push_back(Arc::new(node));
        let seq_no = self.take_seq_no()?;
        state.apply_global_slice();
        Ok(seq_no)
    }

    /// Append an operation issued together with a document and move `slice`
    /// to cover it.
    pub fn add_with_slice(&self, node: DeleteNode, slice: &mut DeleteSlice) -> Result<i64> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        state.nodes.push_back(Arc::new(node));
        slice.end = state.tail();
        self.take_seq_no()
    }

    pub fn new_slice(&self) -> DeleteSlice {
        let mut state = self.state.lock();
        let tail = state.tail();
        state.register(tail);
        DeleteSlice {
            start: tail,
            end: tail,
        }
    }

    /// Move `slice` to the current tail. Returns whether it absorbed nodes.
    pub fn update_slice(&self, slice: &mut DeleteSlice) -> bool {
        let state = self.state.lock();
        let tail = state.tail();
        if slice.end < tail {
            slice.end = tail;
            true
        } else {
            false
        }
    }

    /// Move `slice` to the tail and hand out a sequence number atomically.
    pub fn update_slice_with_seq_no(&self, slice: &mut DeleteSlice) -> Result<(bool, i64)> {
        let state = self.state.lock();
        let tail = state.tail();
        let changed = slice.end < tail;
        slice.end = tail;
        Ok((changed, self.take_seq_no()?))
    }

    /// Resolve the nodes of `slice` into `buffered` and reset the slice to
    /// start at its end.
    pub fn apply_slice(
        &self,
        slice: &mut DeleteSlice,
        buffered: &mut BufferedUpdates,
        doc_id_upto: u32,
    ) {
        let nodes = {
            let mut state = self.state.lock();
            let nodes = state.nodes_in(slice.start, slice.end);
            state.unregister(slice.start);
            state.register(slice.end);
            slice.start = slice.end;
            state.prune();
            nodes
        };
        for node in nodes {
            node.apply(buffered, doc_id_upto);
        }
    }

    /// Drop a slice that will not be applied again.
    pub fn release_slice(&self, slice: &DeleteSlice) {
        let mut state = self.state.lock();
        state.unregister(slice.start);
        state.prune();
    }

    /// Freeze the global buffer, first moving `caller_slice` (if any) to the
    /// same tail so the caller's documents see exactly the same operations.
    pub fn freeze_global_buffer(
        &self,
        caller_slice: Option<&mut DeleteSlice>,
    ) -> Option<FrozenBufferedUpdates> {
        let mut state = self.state.lock();
        let tail = state.tail();
        if let Some(slice) = caller_slice {
            slice.end = tail;
        }
        state.apply_global_slice();
        if !state.global_buffer.any() {
            return None;
        }
        let frozen = state.global_buffer.freeze();
        state.global_buffer.clear();
        Some(frozen)
    }

    /// Absorb pending nodes into the global buffer.
    pub fn try_apply_global_slice(&self) {
        if let Some(mut state) = self.state.try_lock() {
            state.apply_global_slice();
        }
    }

    pub fn any_changes(&self) -> bool {
        let state = self.state.lock();
        state.global_buffer.any() || state.global_slice.start != state.tail()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.state.lock().global_buffer.bytes_used()
    }

    pub fn num_global_term_deletes(&self) -> usize {
        self.state.lock().global_buffer.num_term_deletes()
    }

    /// Discard everything buffered globally.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        let tail = state.tail();
        state.global_slice = DeleteSlice {
            start: tail,
            end: tail,
        };
        state.global_buffer.clear();
        state.prune();
    }

    /// Reject further appends. Fails if the global buffer has not absorbed
    /// every node.
    pub fn close(&self) -> Result<()> {
        let state = self.state.lock();
        if state.global_slice.start != state.tail() || state.global_buffer.any() {
            return Err(QuireError::illegal_state(
                "cannot close a delete queue with unapplied changes",
            ));
        }
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    #[cfg(test)]
    fn retained_nodes(&self) -> usize {
        self.state.lock().nodes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_sees_only_later_nodes() {
        let queue = DeleteQueue::new(0, 1);
        queue.add(DeleteNode::Term(Term::text("id", "before"))).unwrap();
        let mut slice = queue.new_slice();
        assert!(!queue.update_slice(&mut slice));

        queue.add(DeleteNode::Term(Term::text("id", "after"))).unwrap();
        assert!(queue.update_slice(&mut slice));

        let mut buffered = BufferedUpdates::new();
        queue.apply_slice(&mut slice, &mut buffered, 7);
        assert_eq!(buffered.delete_terms().len(), 1);
        assert_eq!(buffered.delete_terms()[&Term::text("id", "after")], 7);
        assert!(slice.is_empty());
        queue.release_slice(&slice);
    }

    #[test]
    fn test_sequence_numbers_increase() {
        let queue = DeleteQueue::new(0, 1);
        let mut slice = queue.new_slice();
        let a = queue.add(DeleteNode::Term(Term::text("id", "1"))).unwrap();
        let b = queue
            .add_with_slice(DeleteNode::Term(Term::text("id", "2")), &mut slice)
            .unwrap();
        let c = queue.next_sequence_number().unwrap();
        let (changed, d) = queue.update_slice_with_seq_no(&mut slice).unwrap();
        assert!(!changed);
        assert!(a < b && b < c && c < d);
        assert_eq!(queue.last_sequence_number(), d);
        queue.release_slice(&slice);
    }

    #[test]
    fn test_max_seq_no_enforced() {
        let queue = DeleteQueue::new(0, 1);
        queue.set_max_seq_no(2);
        queue.next_sequence_number().unwrap();
        queue.next_sequence_number().unwrap();
        assert!(matches!(
            queue.next_sequence_number(),
            Err(QuireError::Internal(_))
        ));
    }

    #[test]
    fn test_global_buffer_freeze() {
        let queue = DeleteQueue::new(0, 1);
        assert!(queue.freeze_global_buffer(None).is_none());
        queue.add(DeleteNode::Terms(vec![Term::text("id", "1"), Term::text("id", "2")])).unwrap();
        assert!(queue.any_changes());
        let frozen = queue.freeze_global_buffer(None).unwrap();
        assert_eq!(frozen.terms.len(), 2);
        assert!(!queue.any_changes());
        queue.close().unwrap();
        assert!(queue.add(DeleteNode::Term(Term::text("id", "3"))).is_err());
    }

    #[test]
    fn test_nodes_pruned_below_low_water_mark() {
        let queue = DeleteQueue::new(0, 1);
        let mut slice = queue.new_slice();
        for i in 0..10 {
            queue.add(DeleteNode::Term(Term::text("id", &i.to_string()))).unwrap();
        }
        // the DWPT slice still pins every node
        assert_eq!(queue.retained_nodes(), 10);
        queue.update_slice(&mut slice);
        let mut buffered = BufferedUpdates::new();
        queue.apply_slice(&mut slice, &mut buffered, 3);
        assert_eq!(buffered.num_term_deletes(), 10);
        assert_eq!(queue.retained_nodes(), 0);
        queue.release_slice(&slice);
    }
}

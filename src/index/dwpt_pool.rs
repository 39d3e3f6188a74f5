//! Hands DWPTs out to indexing threads.
//!
//! A checked out DWPT is owned by exactly one thread until it is released,
//! so no DWPT is ever used by two threads at once. The pool itself is not
//! synchronized; it lives inside the flush control state and is guarded by
//! that lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::AHashMap;
use log::debug;

use crate::index::delete_queue::DeleteQueue;
use crate::index::dwpt::{Dwpt, DwptSettings};
use crate::index::field_info::FieldNumbers;
use crate::index::file_names::segment_name;

#[derive(Debug)]
pub struct DwptPool {
    free: Vec<Dwpt>,
    /// Checked out DWPTs: id to delete queue generation.
    in_use: AHashMap<u64, u64>,
    next_id: u64,
    settings: Arc<DwptSettings>,
    field_numbers: Arc<FieldNumbers>,
    segment_counter: Arc<AtomicU64>,
}

impl DwptPool {
    pub fn new(
        settings: Arc<DwptSettings>,
        field_numbers: Arc<FieldNumbers>,
        segment_counter: Arc<AtomicU64>,
    ) -> Self {
        DwptPool {
            free: Vec::new(),
            in_use: AHashMap::new(),
            next_id: 0,
            settings,
            field_numbers,
            segment_counter,
        }
    }

    /// Check out an idle DWPT bound to `queue`, or build a new one.
    ///
    /// `eligible` can veto idle DWPTs, e.g. those already marked for flush.
    pub fn checkout<F>(&mut self, queue: &Arc<DeleteQueue>, eligible: F) -> Dwpt
    where
        F: Fn(&Dwpt) -> bool,
    {
        let reusable = self.free.iter().rposition(|dwpt| {
            dwpt.delete_queue().generation() == queue.generation() && eligible(dwpt)
        });
        let dwpt = match reusable {
            Some(i) => self.free.swap_remove(i),
            None => self.new_dwpt(queue),
        };
        self.in_use.insert(dwpt.id(), queue.generation());
        dwpt
    }

    fn new_dwpt(&mut self, queue: &Arc<DeleteQueue>) -> Dwpt {
        let id = self.next_id;
        self.next_id += 1;
        let name = segment_name(self.segment_counter.fetch_add(1, Ordering::SeqCst));
        debug!("new DWPT {id} for segment {name} (queue generation {})", queue.generation());
        Dwpt::new(
            id,
            name,
            Arc::clone(&self.settings),
            Arc::clone(&self.field_numbers),
            Arc::clone(queue),
        )
    }

    /// Put a checked out DWPT back into the idle set.
    pub fn release(&mut self, dwpt: Dwpt) {
        self.in_use.remove(&dwpt.id());
        self.free.push(dwpt);
    }

    /// Forget a checked out DWPT that leaves the pool for flushing or abort.
    pub fn detach(&mut self, id: u64) {
        self.in_use.remove(&id);
    }

    /// Remove and return the idle DWPTs matching `pred`.
    pub fn take_free<F>(&mut self, pred: F) -> Vec<Dwpt>
    where
        F: Fn(&Dwpt) -> bool,
    {
        let (taken, kept): (Vec<_>, Vec<_>) = self.free.drain(..).partition(|d| pred(d));
        self.free = kept;
        taken
    }

    /// Remove and return the most recently released idle DWPT matching `pred`.
    pub fn take_one<F>(&mut self, pred: F) -> Option<Dwpt>
    where
        F: Fn(&Dwpt) -> bool,
    {
        let i = self.free.iter().rposition(pred)?;
        Some(self.free.swap_remove(i))
    }

    pub fn free_dwpts(&self) -> &[Dwpt] {
        &self.free
    }

    pub fn in_use_count(&self) -> usize {
        self.in_use.len()
    }

    pub fn in_use_with_generation(&self, generation: u64) -> usize {
        self.in_use.values().filter(|g| **g == generation).count()
    }

    /// Number of DWPTs alive in the pool, idle or checked out.
    pub fn size(&self) -> usize {
        self.free.len() + self.in_use.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::StandardAnalyzer;
    use crate::index::codec::StandardCodec;

    fn pool() -> DwptPool {
        let settings = Arc::new(DwptSettings {
            analyzer: Arc::new(StandardAnalyzer::new()),
            codec: Arc::new(StandardCodec),
            use_compound_file: false,
            index_sort: None,
            soft_deletes_field: None,
        });
        DwptPool::new(
            settings,
            Arc::new(FieldNumbers::new(None)),
            Arc::new(AtomicU64::new(0)),
        )
    }

    #[test]
    fn test_checkout_reuses_idle_dwpt_of_same_queue() {
        let mut pool = pool();
        let queue = Arc::new(DeleteQueue::new(0, 1));
        let a = pool.checkout(&queue, |_| true);
        let b = pool.checkout(&queue, |_| true);
        assert_ne!(a.id(), b.id());
        assert_ne!(a.segment_name(), b.segment_name());
        assert_eq!(pool.in_use_count(), 2);

        let a_id = a.id();
        pool.release(a);
        let again = pool.checkout(&queue, |_| true);
        assert_eq!(again.id(), a_id);

        pool.release(again);
        let next_queue = Arc::new(DeleteQueue::new(1, 10));
        let fresh = pool.checkout(&next_queue, |_| true);
        assert_ne!(fresh.id(), a_id);
        assert_eq!(pool.in_use_with_generation(1), 1);
        assert_eq!(pool.size(), 3);
    }
}

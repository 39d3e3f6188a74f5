//! Merge execution.
//!
//! The writer is the [`MergeSource`]: it hands out registered merges and
//! commits their results. A [`MergeScheduler`] decides on which thread they
//! run.

use std::fmt::Debug;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{debug, error};
use parking_lot::{Condvar, Mutex};

use crate::error::{QuireError, Result};
use crate::index::merge_policy::{MergeTrigger, OneMerge};

/// How long an idle merge thread sleeps while merges are pending but not
/// handed out.
const WITHHELD_RECHECK: Duration = Duration::from_millis(50);

/// Where a scheduler takes merges from.
pub trait MergeSource: Send + Sync {
    /// Next registered merge not yet started.
    fn next_merge(&self) -> Option<Arc<OneMerge>>;

    /// Release the merge's segments and look for follow-up merges. Called
    /// once per merge, whether it succeeded or not.
    fn on_merge_finished(&self, merge: &Arc<OneMerge>);

    /// Registered merges not yet started.
    fn pending_merge_count(&self) -> usize;

    fn has_pending_merges(&self) -> bool {
        self.pending_merge_count() > 0
    }

    /// Run the merge and commit its result.
    fn merge(&self, merge: &Arc<OneMerge>) -> Result<()>;
}

pub trait MergeScheduler: Send + Sync + Debug {
    fn name(&self) -> &str;

    /// Run pending merges of `source`.
    fn merge(&self, source: Arc<dyn MergeSource>, trigger: MergeTrigger) -> Result<()>;

    /// Wait for running merges. Returns the first failure since the last
    /// call.
    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.sync()
    }

    /// False when merges are never executed, so nobody should wait for
    /// them.
    fn runs_merges(&self) -> bool {
        true
    }
}

fn run_one(source: &dyn MergeSource, merge: &Arc<OneMerge>) -> Result<()> {
    let result = source.merge(merge);
    source.on_merge_finished(merge);
    match result {
        Err(QuireError::MergeAborted(msg)) => {
            debug!("merge {} aborted: {msg}", merge.describe());
            Ok(())
        }
        other => other,
    }
}

/// Runs merges one at a time on the calling thread.
#[derive(Debug, Default)]
pub struct SerialMergeScheduler {
    lock: Mutex<()>,
}

impl SerialMergeScheduler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MergeScheduler for SerialMergeScheduler {
    fn name(&self) -> &str {
        "SerialMergeScheduler"
    }

    fn merge(&self, source: Arc<dyn MergeSource>, _trigger: MergeTrigger) -> Result<()> {
        let _guard = self.lock.lock();
        while let Some(merge) = source.next_merge() {
            run_one(source.as_ref(), &merge)?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MergeThreads {
    running: usize,
    handles: Vec<JoinHandle<()>>,
    spawned: u64,
    closed: bool,
}

#[derive(Debug, Default)]
struct SchedulerShared {
    threads: Mutex<MergeThreads>,
    changed: Condvar,
}

/// Runs merges on background threads.
///
/// At most `max_thread_count` merges run at once. Once `max_merge_count`
/// merges are running or waiting, threads asking for more merges stall
/// until the backlog shrinks, which throttles indexing to merge speed.
#[derive(Debug)]
pub struct ConcurrentMergeScheduler {
    max_thread_count: usize,
    max_merge_count: usize,
    shared: Arc<SchedulerShared>,
    failures_tx: Sender<QuireError>,
    failures_rx: Receiver<QuireError>,
}

impl Default for ConcurrentMergeScheduler {
    fn default() -> Self {
        let threads = (num_cpus::get() / 2).clamp(1, 4);
        Self::with_limits(threads, threads + 5)
    }
}

impl ConcurrentMergeScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(max_thread_count: usize, max_merge_count: usize) -> Self {
        let (failures_tx, failures_rx) = unbounded();
        ConcurrentMergeScheduler {
            max_thread_count: max_thread_count.max(1),
            max_merge_count: max_merge_count.max(max_thread_count.max(1)),
            shared: Arc::new(SchedulerShared::default()),
            failures_tx,
            failures_rx,
        }
    }

    pub fn max_thread_count(&self) -> usize {
        self.max_thread_count
    }

    pub fn max_merge_count(&self) -> usize {
        self.max_merge_count
    }

    /// Merge threads currently alive.
    pub fn running(&self) -> usize {
        self.shared.threads.lock().running
    }

    fn spawn(
        &self,
        threads: &mut MergeThreads,
        source: Arc<dyn MergeSource>,
        first: Arc<OneMerge>,
    ) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let failures = self.failures_tx.clone();
        let name = format!("quire-merge-{}", threads.spawned);
        let handle = std::thread::Builder::new().name(name).spawn(move || {
            let mut next = Some(first);
            loop {
                let merge = match next.take().or_else(|| source.next_merge()) {
                    Some(merge) => merge,
                    None => {
                        let mut threads = shared.threads.lock();
                        if source.has_pending_merges() && !threads.closed {
                            // registered but withheld, e.g. while the writer stops merges
                            shared.changed.wait_for(&mut threads, WITHHELD_RECHECK);
                            continue;
                        }
                        threads.running -= 1;
                        shared.changed.notify_all();
                        break;
                    }
                };
                debug!("merge thread starts {}", merge.describe());
                if let Err(e) = run_one(source.as_ref(), &merge) {
                    error!("merge {} failed: {e}", merge.describe());
                    let _ = failures.send(e);
                }
                shared.changed.notify_all();
            }
        })?;
        threads.running += 1;
        threads.spawned += 1;
        threads.handles.retain(|h| !h.is_finished());
        threads.handles.push(handle);
        Ok(())
    }
}

impl MergeScheduler for ConcurrentMergeScheduler {
    fn name(&self) -> &str {
        "ConcurrentMergeScheduler"
    }

    fn merge(&self, source: Arc<dyn MergeSource>, trigger: MergeTrigger) -> Result<()> {
        let mut threads = self.shared.threads.lock();
        if threads.closed {
            return Ok(());
        }
        while threads.running >= self.max_thread_count
            && threads.running + source.pending_merge_count() > self.max_merge_count
        {
            debug!(
                "stalling {trigger:?} caller: {} merges running",
                threads.running
            );
            self.shared
                .changed
                .wait_for(&mut threads, Duration::from_millis(250));
            if threads.closed {
                return Ok(());
            }
        }
        while threads.running < self.max_thread_count {
            let Some(merge) = source.next_merge() else {
                break;
            };
            self.spawn(&mut threads, Arc::clone(&source), merge)?;
        }
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        loop {
            let handles = std::mem::take(&mut self.shared.threads.lock().handles);
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                if handle.join().is_err() {
                    let _ = self
                        .failures_tx
                        .send(QuireError::internal("merge thread panicked"));
                }
            }
        }
        let mut first = None;
        for failure in self.failures_rx.try_iter() {
            if first.is_none() {
                first = Some(failure);
            } else {
                error!("additional merge failure: {failure}");
            }
        }
        first.map_or(Ok(()), Err)
    }

    fn close(&self) -> Result<()> {
        self.shared.threads.lock().closed = true;
        self.shared.changed.notify_all();
        self.sync()
    }
}

/// Never runs merges.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMergeScheduler;

impl MergeScheduler for NoMergeScheduler {
    fn name(&self) -> &str {
        "NoMergeScheduler"
    }

    fn merge(&self, _source: Arc<dyn MergeSource>, _trigger: MergeTrigger) -> Result<()> {
        Ok(())
    }

    fn runs_merges(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeSource {
        queue: Mutex<VecDeque<Arc<OneMerge>>>,
        finished: AtomicUsize,
        fail: bool,
        /// Hand out at most this many merges, keeping the rest pending.
        hand_out: Option<usize>,
        polls: AtomicUsize,
    }

    impl FakeSource {
        fn with_merges(n: usize, fail: bool) -> Arc<Self> {
            let source = FakeSource {
                fail,
                ..Default::default()
            };
            for _ in 0..n {
                source.queue.lock().push_back(Arc::new(OneMerge::new(Vec::new())));
            }
            Arc::new(source)
        }
    }

    impl MergeSource for FakeSource {
        fn next_merge(&self) -> Option<Arc<OneMerge>> {
            let polls = self.polls.fetch_add(1, Ordering::SeqCst);
            if self.hand_out.is_some_and(|limit| polls >= limit) {
                return None;
            }
            self.queue.lock().pop_front()
        }

        fn on_merge_finished(&self, _merge: &Arc<OneMerge>) {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }

        fn pending_merge_count(&self) -> usize {
            self.queue.lock().len()
        }

        fn merge(&self, _merge: &Arc<OneMerge>) -> Result<()> {
            if self.fail {
                Err(QuireError::Io(std::io::Error::other("disk full")))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn test_serial_runs_everything() {
        let source = FakeSource::with_merges(3, false);
        SerialMergeScheduler::new()
            .merge(source.clone(), MergeTrigger::Explicit)
            .unwrap();
        assert_eq!(source.finished.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_concurrent_runs_and_reports_failures() {
        let scheduler = ConcurrentMergeScheduler::with_limits(2, 4);
        let source = FakeSource::with_merges(5, false);
        scheduler.merge(source.clone(), MergeTrigger::Explicit).unwrap();
        scheduler.sync().unwrap();
        assert_eq!(source.finished.load(Ordering::SeqCst), 5);
        assert_eq!(scheduler.running(), 0);

        let failing = FakeSource::with_merges(1, true);
        scheduler.merge(failing.clone(), MergeTrigger::Explicit).unwrap();
        assert!(matches!(scheduler.sync(), Err(QuireError::Io(_))));
        assert!(scheduler.sync().is_ok());
        scheduler.close().unwrap();
    }

    #[test]
    fn test_idle_thread_waits_for_withheld_merges() {
        let scheduler = ConcurrentMergeScheduler::with_limits(1, 2);
        let source = Arc::new(FakeSource {
            hand_out: Some(1),
            ..Default::default()
        });
        for _ in 0..2 {
            source.queue.lock().push_back(Arc::new(OneMerge::new(Vec::new())));
        }
        scheduler.merge(source.clone(), MergeTrigger::Explicit).unwrap();

        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(source.finished.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.running(), 1);
        // the thread sleeps between checks instead of spinning
        assert!(source.polls.load(Ordering::SeqCst) < 50);

        scheduler.close().unwrap();
        assert_eq!(scheduler.running(), 0);
        assert!(source.has_pending_merges());
    }

    #[test]
    fn test_no_merge_scheduler() {
        let source = FakeSource::with_merges(1, false);
        NoMergeScheduler.merge(source.clone(), MergeTrigger::Explicit).unwrap();
        assert!(!NoMergeScheduler.runs_merges());
        assert!(source.has_pending_merges());
    }
}

//! Flush tickets keep flushed segments and frozen deletes in order.
//!
//! A ticket is created under the queue lock at the moment a DWPT freezes the
//! global delete buffer, so ticket order is freeze order. Flushing itself
//! runs outside the lock and may finish in any order; tickets are published
//! strictly from the head, each one once its segment is ready or its flush
//! failed.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::Result;
use crate::index::buffered_updates::FrozenBufferedUpdates;
use crate::index::delete_queue::DeleteQueue;
use crate::index::dwpt::{Dwpt, FlushedSegment};

#[derive(Debug, Default)]
pub struct FlushTicket {
    /// Global deletes frozen when the ticket was created.
    pub frozen_updates: Option<FrozenBufferedUpdates>,
    /// Set once the DWPT flush finishes. `None` for deletes-only tickets,
    /// empty DWPTs and failed flushes.
    pub segment: Option<FlushedSegment>,
    has_segment: bool,
    done: bool,
    failed: bool,
}

impl FlushTicket {
    fn can_publish(&self) -> bool {
        !self.has_segment || self.done
    }

    pub fn failed(&self) -> bool {
        self.failed
    }
}

pub type TicketRef = Arc<Mutex<FlushTicket>>;

#[derive(Debug, Default)]
pub struct FlushTicketQueue {
    queue: Mutex<VecDeque<TicketRef>>,
    purge_lock: Mutex<()>,
    ticket_count: AtomicUsize,
}

impl FlushTicketQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Freeze the global deletes of `queue` into a ticket of their own.
    ///
    /// Returns whether anything was frozen.
    pub fn add_deletes(&self, delete_queue: &DeleteQueue) -> bool {
        let mut queue = self.queue.lock();
        match delete_queue.freeze_global_buffer(None) {
            Some(frozen) => {
                self.push(
                    &mut queue,
                    FlushTicket {
                        frozen_updates: Some(frozen),
                        ..Default::default()
                    },
                );
                true
            }
            None => false,
        }
    }

    /// Create the ticket for a DWPT about to flush. The DWPT's slice and the
    /// global buffer are frozen together while the queue is locked.
    pub fn add_flush_ticket(&self, dwpt: &mut Dwpt) -> TicketRef {
        let mut queue = self.queue.lock();
        let frozen_updates = dwpt.prepare_flush();
        self.push(
            &mut queue,
            FlushTicket {
                frozen_updates,
                has_segment: true,
                ..Default::default()
            },
        )
    }

    fn push(&self, queue: &mut VecDeque<TicketRef>, ticket: FlushTicket) -> TicketRef {
        let ticket = Arc::new(Mutex::new(ticket));
        self.ticket_count.fetch_add(1, Ordering::SeqCst);
        queue.push_back(Arc::clone(&ticket));
        ticket
    }

    pub fn add_segment(&self, ticket: &TicketRef, segment: Option<FlushedSegment>) {
        let mut ticket = ticket.lock();
        ticket.segment = segment;
        ticket.done = true;
    }

    pub fn mark_failed(&self, ticket: &TicketRef) {
        let mut ticket = ticket.lock();
        ticket.segment = None;
        ticket.done = true;
        ticket.failed = true;
    }

    pub fn has_tickets(&self) -> bool {
        self.ticket_count.load(Ordering::SeqCst) > 0
    }

    pub fn ticket_count(&self) -> usize {
        self.ticket_count.load(Ordering::SeqCst)
    }

    fn inner_purge<F>(&self, consumer: &mut F) -> Result<usize>
    where
        F: FnMut(FlushTicket) -> Result<()>,
    {
        let mut published = 0;
        loop {
            let head = {
                let mut queue = self.queue.lock();
                let ready = queue.front().is_some_and(|t| t.lock().can_publish());
                if !ready {
                    return Ok(published);
                }
                queue.pop_front()
            };
            let Some(head) = head else {
                return Ok(published);
            };
            let ticket = std::mem::take(&mut *head.lock());
            self.ticket_count.fetch_sub(1, Ordering::SeqCst);
            published += 1;
            consumer(ticket)?;
        }
    }

    /// Publish every ready ticket, waiting for a concurrent purge to finish.
    pub fn force_purge<F>(&self, mut consumer: F) -> Result<usize>
    where
        F: FnMut(FlushTicket) -> Result<()>,
    {
        let _purge = self.purge_lock.lock();
        self.inner_purge(&mut consumer)
    }

    /// Publish ready tickets unless another thread is already purging.
    pub fn try_purge<F>(&self, mut consumer: F) -> Result<usize>
    where
        F: FnMut(FlushTicket) -> Result<()>,
    {
        match self.purge_lock.try_lock() {
            Some(_purge) => self.inner_purge(&mut consumer),
            None => Ok(0),
        }
    }

    /// Drop every ticket. Returns the segments that were already flushed so
    /// their files can be removed.
    pub fn clear(&self) -> Vec<FlushedSegment> {
        let _purge = self.purge_lock.lock();
        let mut queue = self.queue.lock();
        let mut segments = Vec::new();
        for ticket in queue.drain(..) {
            if let Some(segment) = ticket.lock().segment.take() {
                segments.push(segment);
            }
        }
        self.ticket_count.store(0, Ordering::SeqCst);
        segments
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::delete_queue::DeleteNode;
    use crate::index::term::Term;

    #[test]
    fn test_tickets_publish_in_creation_order() {
        let tickets = FlushTicketQueue::new();
        let queue = DeleteQueue::new(0, 1);

        let first = {
            let mut q = tickets.queue.lock();
            tickets.push(
                &mut q,
                FlushTicket {
                    has_segment: true,
                    ..Default::default()
                },
            )
        };
        queue.add(DeleteNode::Term(Term::text("id", "1"))).unwrap();
        assert!(tickets.add_deletes(&queue));
        assert!(!tickets.add_deletes(&queue));
        assert_eq!(tickets.ticket_count(), 2);

        // the deletes ticket waits for the unfinished flush ahead of it
        let mut seen = Vec::new();
        let n = tickets
            .force_purge(|t| {
                seen.push(t.frozen_updates.is_some());
                Ok(())
            })
            .unwrap();
        assert_eq!(n, 0);

        tickets.mark_failed(&first);
        let n = tickets
            .force_purge(|t| {
                seen.push(t.frozen_updates.is_some());
                Ok(())
            })
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(seen, vec![false, true]);
        assert!(!tickets.has_tickets());
    }
}

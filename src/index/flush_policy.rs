//! When buffered documents get flushed.
//!
//! The flush control consults its [`FlushPolicy`] after every document and
//! every delete, holding the flush control lock, so a policy can mark DWPTs
//! flush pending atomically with respect to concurrent inserts. The per
//! thread hard limit is enforced by the flush control itself, whatever the
//! policy decides.

use std::fmt::Debug;

use log::debug;

use crate::index::flush_control::FlushState;

pub trait FlushPolicy: Send + Sync + Debug {
    /// Called for each delete. `dwpt` is set when the delete comes with an
    /// update of the given DWPT.
    fn on_delete(&self, control: &mut FlushState, dwpt: Option<u64>);

    /// Called after a document was added to `dwpt`.
    fn on_insert(&self, control: &mut FlushState, dwpt: u64);

    /// Called after a document was updated in `dwpt`.
    fn on_update(&self, control: &mut FlushState, dwpt: u64) {
        self.on_insert(control, dwpt);
        self.on_delete(control, Some(dwpt));
    }
}

/// Flushes by buffered RAM or by buffered document count, whichever is
/// enabled in the writer configuration.
///
/// - on insert: flushes the DWPT once it holds `max_buffered_docs`
///   documents, or marks the largest DWPT pending once the RAM of all
///   DWPTs plus buffered deletes reaches `ram_buffer_size_mb`.
/// - on delete: asks the writer to apply deletes once the buffered deletes
///   alone exceed the RAM buffer.
#[derive(Debug, Default, Clone, Copy)]
pub struct FlushByRamOrCountsPolicy;

impl FlushByRamOrCountsPolicy {
    pub fn new() -> Self {
        FlushByRamOrCountsPolicy
    }

    fn mark_largest_writer_pending(&self, control: &mut FlushState, dwpt: u64) {
        let largest = control.find_largest_non_pending_writer(dwpt);
        control.set_flush_pending(largest);
    }
}

impl FlushPolicy for FlushByRamOrCountsPolicy {
    fn on_delete(&self, control: &mut FlushState, _dwpt: Option<u64>) {
        if let Some(limit) = control.ram_buffer_bytes() {
            if control.delete_bytes_used() > limit {
                debug!(
                    "force apply deletes: delete bytes {} exceed RAM buffer {limit}",
                    control.delete_bytes_used()
                );
                control.set_apply_all_deletes();
            }
        }
    }

    fn on_insert(&self, control: &mut FlushState, dwpt: u64) {
        if let Some(max_docs) = control.max_buffered_docs() {
            if control.num_docs(dwpt) >= max_docs {
                control.set_flush_pending(dwpt);
                return;
            }
        }
        if let Some(limit) = control.ram_buffer_bytes() {
            let total = control.active_bytes() + control.delete_bytes_used();
            if total >= limit {
                debug!("trigger flush: active bytes {total} reached RAM buffer {limit}");
                self.mark_largest_writer_pending(control, dwpt);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::flush_control::FlushSettings;

    #[test]
    fn test_flush_by_doc_count() {
        let settings = FlushSettings {
            ram_buffer_bytes: None,
            max_buffered_docs: Some(2),
            hard_limit_bytes: usize::MAX,
        };
        let mut state = FlushState::for_policy_test(settings);
        state.track_for_test(1, 100, 1);
        FlushByRamOrCountsPolicy.on_insert(&mut state, 1);
        assert!(!state.is_flush_pending(1));

        state.track_for_test(1, 200, 2);
        FlushByRamOrCountsPolicy.on_insert(&mut state, 1);
        assert!(state.is_flush_pending(1));
    }

    #[test]
    fn test_flush_largest_by_ram() {
        let settings = FlushSettings {
            ram_buffer_bytes: Some(1000),
            max_buffered_docs: None,
            hard_limit_bytes: usize::MAX,
        };
        let mut state = FlushState::for_policy_test(settings);
        state.track_for_test(1, 300, 3);
        state.track_for_test(2, 600, 6);
        FlushByRamOrCountsPolicy.on_insert(&mut state, 1);
        assert!(!state.is_flush_pending(1));
        assert!(!state.is_flush_pending(2));

        state.track_for_test(1, 400, 4);
        FlushByRamOrCountsPolicy.on_insert(&mut state, 1);
        // the larger writer is picked, not the caller
        assert!(state.is_flush_pending(2));
        assert!(!state.is_flush_pending(1));
    }
}

//! Bounded-concurrency FIFO admission control.
//!
//! The queue only does bookkeeping. The admission pump lives in the task
//! manager: `while has_capacity() && !pending.is_empty() { dispatch(dequeue()) }`,
//! re-run after every `mark_completed` and `set_max_concurrent`.

use std::collections::{HashSet, VecDeque};

use uuid::Uuid;

/// Pending and running task ids under a concurrency cap.
#[derive(Debug)]
pub struct TaskQueue {
    pending: VecDeque<Uuid>,
    running: HashSet<Uuid>,
    max_concurrent: usize,
}

impl TaskQueue {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            running: HashSet::new(),
            max_concurrent,
        }
    }

    /// Append an id unless it is already pending. Returns whether it was added.
    pub fn enqueue(&mut self, id: Uuid) -> bool {
        if self.pending.contains(&id) {
            return false;
        }
        self.pending.push_back(id);
        true
    }

    /// Pop the oldest pending id. Does not check capacity.
    pub fn dequeue(&mut self) -> Option<Uuid> {
        self.pending.pop_front()
    }

    pub fn mark_running(&mut self, id: Uuid) {
        self.pending.retain(|p| *p != id);
        self.running.insert(id);
    }

    /// Release a running slot. Safe to call for ids that are not running.
    pub fn mark_completed(&mut self, id: Uuid) -> bool {
        self.running.remove(&id)
    }

    /// Strip an id from both the pending and running sets.
    pub fn remove(&mut self, id: Uuid) {
        self.pending.retain(|p| *p != id);
        self.running.remove(&id);
    }

    pub fn has_capacity(&self) -> bool {
        self.running.len() < self.max_concurrent
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Update the cap. Callers re-run the admission pump afterwards.
    pub fn set_max_concurrent(&mut self, max: usize) {
        self.max_concurrent = max;
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Pending ids in FIFO order.
    pub fn pending_ids(&self) -> Vec<Uuid> {
        self.pending.iter().copied().collect()
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }
}

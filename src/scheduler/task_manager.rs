//! Cooperative task manager
//!
//! Holds a FIFO of ready units. One pass runs every unit that was ready
//! when the pass began, exactly once, in the order it became ready. A unit
//! that asks to be rescheduled is queued for the next pass. No threads are
//! ever spawned.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;

/// Decision returned by a unit after one step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Nothing more to do until something re-arms the unit
    Idle,
    /// Run again on the next pass
    Reschedule,
    /// The unit is finished; its owner should destroy it
    Retire,
}

/// Registration table and ready queue for schedulable units
#[derive(Debug)]
pub struct TaskManager<K> {
    ready: VecDeque<K>,
    queued: HashSet<K>,
    retired: Vec<K>,
    passes: u64,
}

impl<K: Copy + Eq + Hash> TaskManager<K> {
    /// Create an idle task manager
    pub fn new() -> Self {
        Self {
            ready: VecDeque::new(),
            queued: HashSet::new(),
            retired: Vec::new(),
            passes: 0,
        }
    }

    /// Mark a unit ready. Returns false if it was already queued.
    pub fn schedule(&mut self, key: K) -> bool {
        if !self.queued.insert(key) {
            return false;
        }
        self.ready.push_back(key);
        true
    }

    /// Remove a unit from the ready queue. Returns false if it was not queued.
    pub fn deschedule(&mut self, key: K) -> bool {
        if !self.queued.remove(&key) {
            return false;
        }
        self.ready.retain(|k| *k != key);
        true
    }

    /// True if the unit is waiting for a pass
    pub fn is_scheduled(&self, key: K) -> bool {
        self.queued.contains(&key)
    }

    /// True when no unit is ready and none awaits destruction
    pub fn is_idle(&self) -> bool {
        self.ready.is_empty() && self.retired.is_empty()
    }

    /// Number of units waiting for a pass
    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// Number of completed (non-empty) passes
    pub fn passes(&self) -> u64 {
        self.passes
    }

    /// Run one pass. Returns the number of units stepped.
    ///
    /// Calling this while no unit is ready changes nothing.
    pub fn proceed<F>(&mut self, mut step: F) -> usize
    where
        F: FnMut(K) -> TaskOutcome,
    {
        if self.ready.is_empty() {
            return 0;
        }

        let batch = std::mem::take(&mut self.ready);
        let ran = batch.len();
        for key in batch {
            self.queued.remove(&key);
            match step(key) {
                TaskOutcome::Idle => {}
                TaskOutcome::Reschedule => {
                    self.schedule(key);
                }
                TaskOutcome::Retire => self.retired.push(key),
            }
        }
        self.passes += 1;
        ran
    }

    /// Hand retired units to the owner for destruction
    pub fn take_retired(&mut self) -> Vec<K> {
        std::mem::take(&mut self.retired)
    }
}

impl<K: Copy + Eq + Hash> Default for TaskManager<K> {
    fn default() -> Self {
        Self::new()
    }
}

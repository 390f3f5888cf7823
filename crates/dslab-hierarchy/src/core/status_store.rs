//! Rolling store of status reports for a host, rack or cluster.

use std::collections::VecDeque;

/// Common view of host, rack and cluster statuses used by the store and the classifier.
pub trait StatusSnapshot: Clone {
    /// Time at which the status was produced.
    fn timestamp(&self) -> f64;

    /// Whether the resource was powered on (or, for racks and clusters, had active hosts).
    fn is_active(&self) -> bool;

    fn cpu_in_use(&self) -> f64;

    /// Whether the resource hosts no VMs at all.
    fn is_empty(&self) -> bool;
}

/// Holds the last confirmed status, a trailing history (newest first) and a sandbox copy used
/// by a single planning pass.
///
/// A store becomes invalid once its status has been consulted for a decision and stays invalid
/// until a report produced after the invalidation arrives.
#[derive(Clone, Debug)]
pub struct StatusStore<S: StatusSnapshot> {
    current: S,
    history: VecDeque<S>,
    sandbox: S,
    window: usize,
    valid: bool,
    invalidation_time: f64,
}

impl<S: StatusSnapshot> StatusStore<S> {
    /// Creates store with initial status which is not part of the history.
    pub fn new(initial: S, window: usize) -> Self {
        Self {
            sandbox: initial.clone(),
            current: initial,
            history: VecDeque::with_capacity(window),
            window,
            valid: true,
            invalidation_time: f64::NEG_INFINITY,
        }
    }

    /// Adds a newly received status.
    pub fn push(&mut self, status: S) {
        if status.timestamp() > self.invalidation_time {
            self.valid = true;
        }
        self.current = status.clone();
        self.history.push_front(status);
        self.history.truncate(self.window);
    }

    pub fn current(&self) -> &S {
        &self.current
    }

    /// Statuses inside the trailing window, newest first.
    pub fn history(&self) -> &VecDeque<S> {
        &self.history
    }

    pub fn sandbox(&self) -> &S {
        &self.sandbox
    }

    pub fn sandbox_mut(&mut self) -> &mut S {
        &mut self.sandbox
    }

    pub fn reset_sandbox(&mut self) {
        self.sandbox = self.current.clone();
    }

    pub fn invalidate(&mut self, time: f64) {
        self.valid = false;
        self.invalidation_time = time;
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

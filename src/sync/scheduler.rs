//! Coalescing of sync requests.
//!
//! At most one sync cycle runs at a time. Requests arriving while a cycle is
//! in flight collapse into a single pending flag; when the cycle finishes,
//! exactly one follow-up cycle runs if the flag was set.

use std::sync::Mutex;

/// Outcome of [`SyncScheduler::request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRequest {
    /// No cycle was running; the caller must start one.
    Started,
    /// A cycle is running; one follow-up is now scheduled.
    Coalesced,
}

#[derive(Debug, Default)]
struct SchedulerState {
    in_flight: bool,
    pending: bool,
}

/// In-flight/pending bookkeeping shared by requesters and the sync worker.
#[derive(Debug, Default)]
pub struct SyncScheduler {
    state: Mutex<SchedulerState>,
}

impl SyncScheduler {
    /// Create an idle scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sync request.
    pub fn request(&self) -> SyncRequest {
        let mut state = self.state.lock().expect("SyncScheduler mutex poisoned");
        if state.in_flight {
            state.pending = true;
            SyncRequest::Coalesced
        } else {
            state.in_flight = true;
            SyncRequest::Started
        }
    }

    /// Mark the current cycle finished.
    ///
    /// Returns `true` when a follow-up cycle must run now; the scheduler then
    /// stays in flight for it. Returns `false` when the scheduler went idle.
    pub fn finish(&self) -> bool {
        let mut state = self.state.lock().expect("SyncScheduler mutex poisoned");
        if state.pending {
            state.pending = false;
            true
        } else {
            state.in_flight = false;
            false
        }
    }

    /// Drop any in-flight and pending state (used on teardown).
    pub fn reset(&self) {
        let mut state = self.state.lock().expect("SyncScheduler mutex poisoned");
        *state = SchedulerState::default();
    }
}

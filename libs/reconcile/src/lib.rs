//! Reconciliation loop primitives.
//!
//! This library holds the bookkeeping that the node agent's periodic loops
//! build on. Key concepts:
//!
//! - **Control signal**: a directive pushed to the remote supervisor that must
//!   be acknowledged. Until it is, the agent keeps resending it.
//! - **Retry state**: per-signal try count and last-sent timestamp.
//! - **Retry policy**: the caller-owned rule that turns a retry state into a
//!   decision (wait, resend, give up).
//!
//! # Invariants
//!
//! - The tracker owns no timers; a driving loop decides when to resend
//! - The first `record` for a signal yields a try count of 1
//! - `clear` forgets a signal entirely, so the next `record` starts over

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

/// Retry bookkeeping for one unacknowledged control signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ControlSignalRetryState {
    /// Number of send attempts so far (first attempt is 1).
    pub send_try_count: u32,

    /// Wall-clock time of the last send attempt, in milliseconds since epoch.
    pub last_sent_millis: i64,
}

impl ControlSignalRetryState {
    /// Milliseconds elapsed since the last send attempt.
    pub fn elapsed_millis(&self, now_millis: i64) -> i64 {
        now_millis.saturating_sub(self.last_sent_millis).max(0)
    }
}

/// Tracks unacknowledged control signals.
///
/// Shared between the acknowledgment path and the resend loop, so every
/// operation takes `&self` and runs under the tracker's own lock.
#[derive(Debug, Default)]
pub struct ControlSignalTracker {
    /// Tracked signals: signal_id -> retry state.
    signals: Mutex<HashMap<String, ControlSignalRetryState>>,
}

impl ControlSignalTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a send attempt for a signal at the current time.
    pub fn record(&self, signal_id: &str) -> ControlSignalRetryState {
        self.record_at(signal_id, now_millis())
    }

    /// Record a send attempt for a signal at the given time.
    ///
    /// Creates the entry with a try count of 1, otherwise increments the count
    /// and refreshes the timestamp.
    pub fn record_at(&self, signal_id: &str, now_millis: i64) -> ControlSignalRetryState {
        let mut signals = self.signals.lock();
        let state = signals
            .entry(signal_id.to_string())
            .and_modify(|state| {
                state.send_try_count = state.send_try_count.saturating_add(1);
                state.last_sent_millis = now_millis;
            })
            .or_insert(ControlSignalRetryState {
                send_try_count: 1,
                last_sent_millis: now_millis,
            });
        *state
    }

    /// Record a resend of a signal that is still tracked.
    ///
    /// Unlike [`record_at`](Self::record_at), this never creates an entry, so
    /// an acknowledgment that lands between a snapshot and the resend is not
    /// undone. Returns `None` if the signal is no longer tracked.
    pub fn retry_at(&self, signal_id: &str, now_millis: i64) -> Option<ControlSignalRetryState> {
        let mut signals = self.signals.lock();
        let state = signals.get_mut(signal_id)?;
        state.send_try_count = state.send_try_count.saturating_add(1);
        state.last_sent_millis = now_millis;
        Some(*state)
    }

    /// Forget a signal (on acknowledgment or when the caller gives up).
    ///
    /// Returns the state the signal had, if it was tracked.
    pub fn clear(&self, signal_id: &str) -> Option<ControlSignalRetryState> {
        self.signals.lock().remove(signal_id)
    }

    /// Current state of a signal.
    pub fn get(&self, signal_id: &str) -> Option<ControlSignalRetryState> {
        self.signals.lock().get(signal_id).copied()
    }

    /// Snapshot of all tracked signals, sorted by id.
    pub fn snapshot(&self) -> Vec<(String, ControlSignalRetryState)> {
        let signals = self.signals.lock();
        let mut entries: Vec<_> = signals
            .iter()
            .map(|(id, state)| (id.clone(), *state))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Number of tracked signals.
    pub fn len(&self) -> usize {
        self.signals.lock().len()
    }

    /// Returns true if no signal is awaiting acknowledgment.
    pub fn is_empty(&self) -> bool {
        self.signals.lock().is_empty()
    }
}

/// What a driving loop should do with a tracked signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Not enough time has passed since the last attempt.
    Wait,

    /// Send the signal again.
    Resend,

    /// The retry ceiling is reached; drop the signal and escalate.
    GiveUp,
}

/// Caller-side retry policy for control signals.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Minimum time between two send attempts.
    pub resend_interval: Duration,

    /// Maximum number of send attempts before giving up.
    pub max_tries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            resend_interval: DEFAULT_RESEND_INTERVAL,
            max_tries: DEFAULT_MAX_SEND_TRIES,
        }
    }
}

impl RetryPolicy {
    /// Decide what to do with a signal given its retry state.
    pub fn evaluate(&self, state: &ControlSignalRetryState, now_millis: i64) -> RetryDecision {
        let interval_millis = i64::try_from(self.resend_interval.as_millis()).unwrap_or(i64::MAX);
        if state.elapsed_millis(now_millis) < interval_millis {
            return RetryDecision::Wait;
        }

        if state.send_try_count >= self.max_tries {
            RetryDecision::GiveUp
        } else {
            RetryDecision::Resend
        }
    }
}

/// Current wall-clock time in milliseconds since epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Default time between control signal resends.
pub const DEFAULT_RESEND_INTERVAL: Duration = Duration::from_secs(10);

/// Default number of send attempts before a control signal is dropped.
pub const DEFAULT_MAX_SEND_TRIES: u32 = 10;

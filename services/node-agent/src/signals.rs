//! Resend loop for unacknowledged control signals.
//!
//! Signals sent to the remote supervisor are recorded in a
//! [`ControlSignalTracker`] until acknowledged. This loop periodically walks
//! the tracker and applies the [`RetryPolicy`]: due signals are resent,
//! exhausted ones are dropped and handed to the sender's `give_up`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use fognode_reconcile::{
    now_millis, ControlSignalRetryState, ControlSignalTracker, RetryDecision, RetryPolicy,
};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Delivers control signals to the remote supervisor.
#[async_trait]
pub trait ControlSignalSender: Send + Sync {
    async fn send(&self, signal_id: &str) -> Result<()>;

    /// Called once a signal is dropped after its last try.
    async fn give_up(&self, signal_id: &str, state: ControlSignalRetryState);
}

/// Record and send a signal for the first time.
pub async fn send_signal(
    tracker: &ControlSignalTracker,
    sender: &dyn ControlSignalSender,
    signal_id: &str,
) -> Result<ControlSignalRetryState> {
    let state = tracker.record(signal_id);
    debug!(signal_id = %signal_id, "Sending control signal");
    sender.send(signal_id).await?;
    Ok(state)
}

/// Forget a signal on acknowledgment. Returns false if it was not tracked.
pub fn acknowledge(tracker: &ControlSignalTracker, signal_id: &str) -> bool {
    match tracker.clear(signal_id) {
        Some(state) => {
            debug!(
                signal_id = %signal_id,
                tries = state.send_try_count,
                "Control signal acknowledged"
            );
            true
        }
        None => false,
    }
}

/// Walk the tracker once. Returns the number of signals resent.
pub async fn resend_due(
    tracker: &ControlSignalTracker,
    policy: &RetryPolicy,
    sender: &dyn ControlSignalSender,
    now_millis: i64,
) -> usize {
    let mut resent = 0;

    for (signal_id, state) in tracker.snapshot() {
        match policy.evaluate(&state, now_millis) {
            RetryDecision::Wait => {}
            RetryDecision::Resend => {
                let Some(state) = tracker.retry_at(&signal_id, now_millis) else {
                    continue;
                };
                resent += 1;
                if let Err(e) = sender.send(&signal_id).await {
                    warn!(
                        signal_id = %signal_id,
                        tries = state.send_try_count,
                        error = %e,
                        "Control signal resend failed"
                    );
                }
            }
            RetryDecision::GiveUp => {
                if let Some(state) = tracker.clear(&signal_id) {
                    error!(
                        signal_id = %signal_id,
                        tries = state.send_try_count,
                        "Control signal never acknowledged, giving up"
                    );
                    sender.give_up(&signal_id, state).await;
                }
            }
        }
    }

    resent
}

/// Run the resend loop until shutdown.
///
/// Ticks at a fraction of the resend interval so due signals are picked up
/// promptly.
pub async fn run_resend_loop(
    tracker: Arc<ControlSignalTracker>,
    policy: RetryPolicy,
    sender: Arc<dyn ControlSignalSender>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let tick = (policy.resend_interval / 2).max(Duration::from_millis(10));

    info!(
        resend_interval_ms = policy.resend_interval.as_millis() as u64,
        max_tries = policy.max_tries,
        "Starting control signal resend loop"
    );

    let mut interval_timer = tokio::time::interval(tick);

    loop {
        tokio::select! {
            _ = interval_timer.tick() => {
                let resent = resend_due(&tracker, &policy, sender.as_ref(), now_millis()).await;
                if resent > 0 {
                    debug!(resent, pending = tracker.len(), "Control signals resent");
                }
            }
            changed = shutdown.changed() => {
                // A dropped sender also ends the loop.
                if changed.is_err() || *shutdown.borrow() {
                    info!("Control signal resend loop shutting down");
                    break;
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<String>>,
        dropped: Mutex<Vec<(String, u32)>>,
        fail: bool,
    }

    #[async_trait]
    impl ControlSignalSender for RecordingSender {
        async fn send(&self, signal_id: &str) -> Result<()> {
            self.sent.lock().push(signal_id.to_string());
            if self.fail {
                anyhow::bail!("supervisor unreachable");
            }
            Ok(())
        }

        async fn give_up(&self, signal_id: &str, state: ControlSignalRetryState) {
            self.dropped
                .lock()
                .push((signal_id.to_string(), state.send_try_count));
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            resend_interval: Duration::from_secs(10),
            max_tries: 3,
        }
    }

    #[tokio::test]
    async fn test_resend_due_respects_interval() {
        let tracker = ControlSignalTracker::new();
        let sender = RecordingSender::default();
        tracker.record_at("sig-1", 0);
        tracker.record_at("sig-2", 8_000);

        let resent = resend_due(&tracker, &policy(), &sender, 10_000).await;
        assert_eq!(resent, 1);
        assert_eq!(*sender.sent.lock(), vec!["sig-1".to_string()]);
        assert_eq!(tracker.get("sig-1").unwrap().send_try_count, 2);
        assert_eq!(tracker.get("sig-2").unwrap().send_try_count, 1);
    }

    #[tokio::test]
    async fn test_resend_due_gives_up_at_ceiling() {
        let tracker = ControlSignalTracker::new();
        let sender = RecordingSender {
            fail: true,
            ..Default::default()
        };
        tracker.record_at("sig-1", 0);

        resend_due(&tracker, &policy(), &sender, 10_000).await;
        resend_due(&tracker, &policy(), &sender, 20_000).await;
        assert_eq!(tracker.get("sig-1").unwrap().send_try_count, 3);

        resend_due(&tracker, &policy(), &sender, 30_000).await;
        assert!(tracker.is_empty());
        assert_eq!(*sender.dropped.lock(), vec![("sig-1".to_string(), 3)]);
        assert_eq!(sender.sent.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_send_and_acknowledge() {
        let tracker = ControlSignalTracker::new();
        let sender = RecordingSender::default();

        let state = send_signal(&tracker, &sender, "sig-1").await.unwrap();
        assert_eq!(state.send_try_count, 1);
        assert!(acknowledge(&tracker, "sig-1"));
        assert!(!acknowledge(&tracker, "sig-1"));
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_loop_stops_on_shutdown() {
        let tracker = Arc::new(ControlSignalTracker::new());
        let sender: Arc<dyn ControlSignalSender> = Arc::new(RecordingSender::default());
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(run_resend_loop(tracker, policy(), sender, rx));
        tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), handle).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }

    #[tokio::test]
    async fn test_loop_stops_when_shutdown_sender_dropped() {
        let tracker = Arc::new(ControlSignalTracker::new());
        let sender: Arc<dyn ControlSignalSender> = Arc::new(RecordingSender::default());
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(run_resend_loop(tracker, policy(), sender, rx));
        drop(tx);

        let result = tokio::time::timeout(Duration::from_secs(5), handle).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }
}

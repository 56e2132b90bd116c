//! Bridge from the messaging transport's push callback to real-time
//! message consumers.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::message::{Message, MessageError};

/// Transport property holding the encoded message.
pub const MESSAGE_PROPERTY: &str = "message";

/// A message as handed over by the transport.
pub trait InboundMessage: Send + Sync {
    /// Confirm receipt to the transport.
    fn acknowledge(&self) -> anyhow::Result<()>;

    fn bytes_property(&self, name: &str) -> Option<Bytes>;
}

/// Application-side consumer of real-time messages.
///
/// Runs on the transport's dispatch thread and must not block.
pub trait MessageCallback: Send + Sync {
    fn send_realtime_message(&self, message: Message) -> anyhow::Result<()>;
}

/// When a message is acknowledged relative to its processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryMode {
    /// Acknowledge before processing. Failed messages are lost.
    #[default]
    AtMostOnce,
    /// Acknowledge after successful processing. Failures are reported to the
    /// transport, which may redeliver.
    AtLeastOnce,
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryMode::AtMostOnce => write!(f, "at-most-once"),
            DeliveryMode::AtLeastOnce => write!(f, "at-least-once"),
        }
    }
}

impl FromStr for DeliveryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "at-most-once" => Ok(DeliveryMode::AtMostOnce),
            "at-least-once" => Ok(DeliveryMode::AtLeastOnce),
            other => Err(format!("unknown delivery mode: {other}")),
        }
    }
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("inbound message has no {0:?} property")]
    MissingProperty(&'static str),

    #[error("failed to decode message: {0}")]
    Decode(#[from] MessageError),

    #[error("message callback failed: {0:#}")]
    Callback(anyhow::Error),

    #[error("failed to acknowledge message: {0:#}")]
    Acknowledge(anyhow::Error),
}

/// Handles each inbound message per the configured [`DeliveryMode`].
pub struct MessageListener {
    callback: Arc<dyn MessageCallback>,
    mode: DeliveryMode,
}

impl MessageListener {
    pub fn new(callback: Arc<dyn MessageCallback>, mode: DeliveryMode) -> Self {
        Self { callback, mode }
    }

    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    /// Invoked by the transport for every inbound message.
    ///
    /// At-most-once: the message is acknowledged exactly once before
    /// anything else; an acknowledgement failure is logged and ignored, and
    /// a callback failure is only logged. At-least-once: the message is
    /// acknowledged only after the callback succeeds, and every failure is
    /// returned.
    pub fn on_message(&self, inbound: &dyn InboundMessage) -> Result<(), DeliveryError> {
        match self.mode {
            DeliveryMode::AtMostOnce => {
                if let Err(e) = inbound.acknowledge() {
                    warn!(error = %e, "Failed to acknowledge message");
                }

                let message = decode(inbound)?;
                let id = message.id.clone();
                if let Err(e) = self.callback.send_realtime_message(message) {
                    warn!(message_id = %id, error = %e, "Message callback failed after acknowledgement");
                }
                Ok(())
            }
            DeliveryMode::AtLeastOnce => {
                let message = decode(inbound)?;
                let id = message.id.clone();
                self.callback
                    .send_realtime_message(message)
                    .map_err(DeliveryError::Callback)?;
                inbound.acknowledge().map_err(DeliveryError::Acknowledge)?;
                debug!(message_id = %id, "Message delivered");
                Ok(())
            }
        }
    }
}

fn decode(inbound: &dyn InboundMessage) -> Result<Message, DeliveryError> {
    let raw = inbound
        .bytes_property(MESSAGE_PROPERTY)
        .ok_or(DeliveryError::MissingProperty(MESSAGE_PROPERTY))?;
    Ok(Message::decode(&raw)?)
}

/// Callback that hands messages to an independent task over a bounded
/// channel. Never blocks: a full channel fails the delivery.
pub struct ChannelCallback {
    tx: mpsc::Sender<Message>,
}

impl ChannelCallback {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl MessageCallback for ChannelCallback {
    fn send_realtime_message(&self, message: Message) -> anyhow::Result<()> {
        self.tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => anyhow::anyhow!("real-time channel is full"),
            mpsc::error::TrySendError::Closed(_) => anyhow::anyhow!("real-time channel is closed"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeInbound {
        payload: Option<Bytes>,
        fail_ack: bool,
        acks: AtomicUsize,
    }

    impl FakeInbound {
        fn new(payload: Option<Bytes>) -> Self {
            Self {
                payload,
                fail_ack: false,
                acks: AtomicUsize::new(0),
            }
        }

        fn failing_ack(payload: Option<Bytes>) -> Self {
            Self {
                fail_ack: true,
                ..Self::new(payload)
            }
        }

        fn acks(&self) -> usize {
            self.acks.load(Ordering::SeqCst)
        }
    }

    impl InboundMessage for FakeInbound {
        fn acknowledge(&self) -> anyhow::Result<()> {
            self.acks.fetch_add(1, Ordering::SeqCst);
            if self.fail_ack {
                anyhow::bail!("session closed");
            }
            Ok(())
        }

        fn bytes_property(&self, name: &str) -> Option<Bytes> {
            (name == MESSAGE_PROPERTY).then(|| self.payload.clone()).flatten()
        }
    }

    struct FailingCallback {
        calls: AtomicUsize,
    }

    impl MessageCallback for FailingCallback {
        fn send_realtime_message(&self, _message: Message) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("consumer crashed")
        }
    }

    fn payload(id: &str) -> Bytes {
        Message {
            id: id.to_string(),
            content_data: Bytes::from_static(b"hello"),
            ..Message::default()
        }
        .encode()
        .unwrap()
    }

    #[test]
    fn test_delivery_mode_parse() {
        assert_eq!("at-least-once".parse::<DeliveryMode>(), Ok(DeliveryMode::AtLeastOnce));
        assert_eq!("AT_MOST_ONCE".parse::<DeliveryMode>(), Ok(DeliveryMode::AtMostOnce));
        assert!("exactly-once".parse::<DeliveryMode>().is_err());
        assert_eq!(DeliveryMode::default().to_string(), "at-most-once");
    }

    #[tokio::test]
    async fn test_at_most_once_delivers_to_channel() {
        let (callback, mut rx) = ChannelCallback::new(4);
        let listener = MessageListener::new(Arc::new(callback), DeliveryMode::AtMostOnce);
        let inbound = FakeInbound::new(Some(payload("m1")));

        listener.on_message(&inbound).unwrap();
        assert_eq!(inbound.acks(), 1);
        let received = rx.recv().await.unwrap();
        assert_eq!(received.id, "m1");
        assert_eq!(received.content_data.as_ref(), b"hello");
    }

    #[test]
    fn test_at_most_once_acks_once_when_callback_fails() {
        let callback = Arc::new(FailingCallback {
            calls: AtomicUsize::new(0),
        });
        let listener = MessageListener::new(callback.clone(), DeliveryMode::AtMostOnce);
        let inbound = FakeInbound::new(Some(payload("m1")));

        assert!(listener.on_message(&inbound).is_ok());
        assert_eq!(inbound.acks(), 1);
        assert_eq!(callback.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_at_most_once_swallows_ack_failure() {
        let (callback, mut rx) = ChannelCallback::new(1);
        let listener = MessageListener::new(Arc::new(callback), DeliveryMode::AtMostOnce);
        let inbound = FakeInbound::failing_ack(Some(payload("m1")));

        listener.on_message(&inbound).unwrap();
        assert_eq!(inbound.acks(), 1);
        assert_eq!(rx.try_recv().unwrap().id, "m1");
    }

    #[test]
    fn test_missing_property() {
        let (callback, _rx) = ChannelCallback::new(1);
        let listener = MessageListener::new(Arc::new(callback), DeliveryMode::AtMostOnce);
        let inbound = FakeInbound::new(None);

        let err = listener.on_message(&inbound).unwrap_err();
        assert!(matches!(err, DeliveryError::MissingProperty("message")));
        // Acknowledged before the payload is looked at.
        assert_eq!(inbound.acks(), 1);
    }

    #[test]
    fn test_at_least_once_does_not_ack_failed_callback() {
        let callback = Arc::new(FailingCallback {
            calls: AtomicUsize::new(0),
        });
        let listener = MessageListener::new(callback, DeliveryMode::AtLeastOnce);
        let inbound = FakeInbound::new(Some(payload("m1")));

        let err = listener.on_message(&inbound).unwrap_err();
        assert!(matches!(err, DeliveryError::Callback(_)));
        assert_eq!(inbound.acks(), 0);
    }

    #[test]
    fn test_at_least_once_reports_ack_failure() {
        let (callback, mut rx) = ChannelCallback::new(1);
        let listener = MessageListener::new(Arc::new(callback), DeliveryMode::AtLeastOnce);
        let inbound = FakeInbound::failing_ack(Some(payload("m1")));

        let err = listener.on_message(&inbound).unwrap_err();
        assert!(matches!(err, DeliveryError::Acknowledge(_)));
        assert_eq!(rx.try_recv().unwrap().id, "m1");
    }

    #[test]
    fn test_channel_callback_full() {
        let (callback, _rx) = ChannelCallback::new(1);
        callback.send_realtime_message(Message::default()).unwrap();
        let err = callback.send_realtime_message(Message::default()).unwrap_err();
        assert!(err.to_string().contains("full"));
    }
}

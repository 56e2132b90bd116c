//! Integration tests: real-time message delivery.
//!
//! A fake transport hands encoded messages to the listener, which forwards
//! them to a consumer task over a bounded channel.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use fognode_node_agent::message_bus::{
    ChannelCallback, DeliveryError, DeliveryMode, InboundMessage, Message, MessageCallback,
    MessageListener, MESSAGE_PROPERTY,
};

/// Transport-side message carrying its properties.
struct TransportMessage {
    properties: Vec<(&'static str, Bytes)>,
    acks: AtomicUsize,
}

impl TransportMessage {
    fn carrying(message: &Message) -> Self {
        Self {
            properties: vec![(MESSAGE_PROPERTY, message.encode().unwrap())],
            acks: AtomicUsize::new(0),
        }
    }

    fn raw(bytes: &'static [u8]) -> Self {
        Self {
            properties: vec![(MESSAGE_PROPERTY, Bytes::from_static(bytes))],
            acks: AtomicUsize::new(0),
        }
    }

    fn acks(&self) -> usize {
        self.acks.load(Ordering::SeqCst)
    }
}

impl InboundMessage for TransportMessage {
    fn acknowledge(&self) -> anyhow::Result<()> {
        self.acks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn bytes_property(&self, name: &str) -> Option<Bytes> {
        self.properties
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value.clone())
    }
}

struct PanickyConsumer;

impl MessageCallback for PanickyConsumer {
    fn send_realtime_message(&self, message: Message) -> anyhow::Result<()> {
        anyhow::bail!("cannot handle {}", message.id)
    }
}

fn reading(id: &str, value: &str) -> Message {
    Message {
        id: id.to_string(),
        tag: "temperature".to_string(),
        publisher: "sensor-app".to_string(),
        timestamp: 1_709_287_200_000,
        info_type: "reading".to_string(),
        info_format: "text/plain".to_string(),
        content_data: Bytes::copy_from_slice(value.as_bytes()),
        ..Message::default()
    }
}

#[tokio::test]
async fn test_messages_reach_consumer_task() {
    let (callback, mut rx) = ChannelCallback::new(16);
    let listener = MessageListener::new(Arc::new(callback), DeliveryMode::AtMostOnce);

    let consumer = tokio::spawn(async move {
        let mut seen = Vec::new();
        while let Some(message) = rx.recv().await {
            seen.push((message.id, message.content_data));
        }
        seen
    });

    let inbound: Vec<_> = (0..3)
        .map(|i| TransportMessage::carrying(&reading(&format!("m{i}"), &format!("2{i}.5"))))
        .collect();
    for message in &inbound {
        listener.on_message(message).unwrap();
    }
    drop(listener);

    let seen = consumer.await.unwrap();
    assert_eq!(seen.len(), 3);
    assert_eq!(seen[0].0, "m0");
    assert_eq!(seen[2].1.as_ref(), b"22.5");
    assert!(inbound.iter().all(|m| m.acks() == 1));
}

#[test]
fn test_failing_consumer_still_acknowledged_once() {
    let listener = MessageListener::new(Arc::new(PanickyConsumer), DeliveryMode::AtMostOnce);
    let inbound = TransportMessage::carrying(&reading("m1", "1"));

    listener.on_message(&inbound).unwrap();
    assert_eq!(inbound.acks(), 1);
}

#[test]
fn test_at_least_once_leaves_failed_message_unacknowledged() {
    let listener = MessageListener::new(Arc::new(PanickyConsumer), DeliveryMode::AtLeastOnce);
    let inbound = TransportMessage::carrying(&reading("m1", "1"));

    let err = listener.on_message(&inbound).unwrap_err();
    assert!(err.to_string().contains("cannot handle m1"));
    assert_eq!(inbound.acks(), 0);
}

#[test]
fn test_undecodable_payload() {
    let (callback, mut rx) = ChannelCallback::new(1);
    let listener = MessageListener::new(Arc::new(callback), DeliveryMode::AtLeastOnce);
    let inbound = TransportMessage::raw(b"\x00\x04short");

    let err = listener.on_message(&inbound).unwrap_err();
    assert!(matches!(err, DeliveryError::Decode(_)));
    assert_eq!(inbound.acks(), 0);
    assert!(rx.try_recv().is_err());
}

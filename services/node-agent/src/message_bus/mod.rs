//! Real-time message delivery.

mod listener;
pub mod message;

pub use listener::{
    ChannelCallback, DeliveryError, DeliveryMode, InboundMessage, MessageCallback,
    MessageListener, MESSAGE_PROPERTY,
};
pub use message::{Message, MessageError, MESSAGE_VERSION};

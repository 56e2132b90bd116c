//! Real-time message representation and its binary codec.
//!
//! Layout (all integers big-endian):
//!
//! ```text
//! version:u16 | field lengths (31 bytes) | field bodies in header order
//! ```
//!
//! Length widths per field: `id` 1, `tag` 2, `group_id` 1,
//! `sequence_number` 1, `sequence_total` 1, `priority` 1, `timestamp` 1,
//! `publisher` 1, `auth_id` 2, `auth_group` 2, `chain_position` 1, `hash` 2,
//! `previous_hash` 2, `nonce` 2, `difficulty_target` 1, `info_type` 1,
//! `info_format` 1, `context_data` 4, `content_data` 4.
//!
//! Numeric fields are written at their full width, or with length 0 when
//! the value is zero.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Codec version written and accepted.
pub const MESSAGE_VERSION: u16 = 4;

/// Version plus all length prefixes.
pub const HEADER_LEN: usize = 33;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("unsupported message version {0}")]
    UnsupportedVersion(u16),

    #[error("message truncated: {needed} bytes needed, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("field {field} is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },

    #[error("field {field} has invalid length {len}")]
    InvalidFieldLength { field: &'static str, len: usize },

    #[error("field {field} is too long to encode ({len} bytes)")]
    FieldTooLong { field: &'static str, len: usize },
}

/// A message exchanged between workloads over the real-time bus.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub id: String,
    pub tag: String,
    pub group_id: String,
    pub sequence_number: i32,
    pub sequence_total: i32,
    pub priority: i8,
    /// Milliseconds since epoch.
    pub timestamp: i64,
    pub publisher: String,
    pub auth_id: String,
    pub auth_group: String,
    pub chain_position: i64,
    pub hash: String,
    pub previous_hash: String,
    pub nonce: String,
    pub difficulty_target: i32,
    pub info_type: String,
    pub info_format: String,
    pub context_data: Bytes,
    pub content_data: Bytes,
}

/// Width in bytes of a length prefix.
#[derive(Clone, Copy)]
enum Width {
    U8,
    U16,
    U32,
}

impl Width {
    fn max(self) -> usize {
        match self {
            Width::U8 => u8::MAX as usize,
            Width::U16 => u16::MAX as usize,
            Width::U32 => u32::MAX as usize,
        }
    }

    fn put(self, buf: &mut BytesMut, len: usize) {
        match self {
            Width::U8 => buf.put_u8(len as u8),
            Width::U16 => buf.put_u16(len as u16),
            Width::U32 => buf.put_u32(len as u32),
        }
    }

    fn get(self, buf: &mut Bytes) -> usize {
        match self {
            Width::U8 => buf.get_u8() as usize,
            Width::U16 => buf.get_u16() as usize,
            Width::U32 => buf.get_u32() as usize,
        }
    }
}

/// Header order; bodies follow in the same order.
const FIELDS: [(&str, Width); 19] = [
    ("id", Width::U8),
    ("tag", Width::U16),
    ("group_id", Width::U8),
    ("sequence_number", Width::U8),
    ("sequence_total", Width::U8),
    ("priority", Width::U8),
    ("timestamp", Width::U8),
    ("publisher", Width::U8),
    ("auth_id", Width::U16),
    ("auth_group", Width::U16),
    ("chain_position", Width::U8),
    ("hash", Width::U16),
    ("previous_hash", Width::U16),
    ("nonce", Width::U16),
    ("difficulty_target", Width::U8),
    ("info_type", Width::U8),
    ("info_format", Width::U8),
    ("context_data", Width::U32),
    ("content_data", Width::U32),
];

impl Message {
    /// Encode into the wire layout.
    pub fn encode(&self) -> Result<Bytes, MessageError> {
        let bodies: [Bytes; 19] = [
            Bytes::copy_from_slice(self.id.as_bytes()),
            Bytes::copy_from_slice(self.tag.as_bytes()),
            Bytes::copy_from_slice(self.group_id.as_bytes()),
            int_body(self.sequence_number.to_be_bytes(), self.sequence_number == 0),
            int_body(self.sequence_total.to_be_bytes(), self.sequence_total == 0),
            int_body(self.priority.to_be_bytes(), self.priority == 0),
            int_body(self.timestamp.to_be_bytes(), self.timestamp == 0),
            Bytes::copy_from_slice(self.publisher.as_bytes()),
            Bytes::copy_from_slice(self.auth_id.as_bytes()),
            Bytes::copy_from_slice(self.auth_group.as_bytes()),
            int_body(self.chain_position.to_be_bytes(), self.chain_position == 0),
            Bytes::copy_from_slice(self.hash.as_bytes()),
            Bytes::copy_from_slice(self.previous_hash.as_bytes()),
            Bytes::copy_from_slice(self.nonce.as_bytes()),
            int_body(self.difficulty_target.to_be_bytes(), self.difficulty_target == 0),
            Bytes::copy_from_slice(self.info_type.as_bytes()),
            Bytes::copy_from_slice(self.info_format.as_bytes()),
            self.context_data.clone(),
            self.content_data.clone(),
        ];

        let body_len: usize = bodies.iter().map(Bytes::len).sum();
        let mut buf = BytesMut::with_capacity(HEADER_LEN + body_len);
        buf.put_u16(MESSAGE_VERSION);

        for (&(field, width), body) in FIELDS.iter().zip(&bodies) {
            if body.len() > width.max() {
                return Err(MessageError::FieldTooLong {
                    field,
                    len: body.len(),
                });
            }
            width.put(&mut buf, body.len());
        }
        for body in &bodies {
            buf.put_slice(body);
        }

        Ok(buf.freeze())
    }

    /// Decode from the wire layout.
    pub fn decode(raw: &[u8]) -> Result<Self, MessageError> {
        if raw.len() < HEADER_LEN {
            return Err(MessageError::Truncated {
                needed: HEADER_LEN,
                available: raw.len(),
            });
        }

        let mut buf = Bytes::copy_from_slice(raw);
        let version = buf.get_u16();
        if version != MESSAGE_VERSION {
            return Err(MessageError::UnsupportedVersion(version));
        }

        let lengths: Vec<usize> = FIELDS.iter().map(|(_, width)| width.get(&mut buf)).collect();
        let needed: usize = lengths.iter().sum();
        if buf.remaining() < needed {
            return Err(MessageError::Truncated {
                needed: HEADER_LEN + needed,
                available: raw.len(),
            });
        }

        let mut reader = FieldReader {
            buf,
            lengths: lengths.into_iter(),
        };

        Ok(Message {
            id: reader.string("id")?,
            tag: reader.string("tag")?,
            group_id: reader.string("group_id")?,
            sequence_number: reader.int::<4>("sequence_number").map(i32::from_be_bytes)?,
            sequence_total: reader.int::<4>("sequence_total").map(i32::from_be_bytes)?,
            priority: reader.int::<1>("priority").map(i8::from_be_bytes)?,
            timestamp: reader.int::<8>("timestamp").map(i64::from_be_bytes)?,
            publisher: reader.string("publisher")?,
            auth_id: reader.string("auth_id")?,
            auth_group: reader.string("auth_group")?,
            chain_position: reader.int::<8>("chain_position").map(i64::from_be_bytes)?,
            hash: reader.string("hash")?,
            previous_hash: reader.string("previous_hash")?,
            nonce: reader.string("nonce")?,
            difficulty_target: reader.int::<4>("difficulty_target").map(i32::from_be_bytes)?,
            info_type: reader.string("info_type")?,
            info_format: reader.string("info_format")?,
            context_data: reader.raw(),
            content_data: reader.raw(),
        })
    }
}

fn int_body<const N: usize>(bytes: [u8; N], zero: bool) -> Bytes {
    if zero {
        Bytes::new()
    } else {
        Bytes::copy_from_slice(&bytes)
    }
}

/// Walks field bodies in header order. Lengths are validated against the
/// buffer before construction.
struct FieldReader {
    buf: Bytes,
    lengths: std::vec::IntoIter<usize>,
}

impl FieldReader {
    fn raw(&mut self) -> Bytes {
        let len = self.lengths.next().unwrap_or(0);
        self.buf.split_to(len)
    }

    fn string(&mut self, field: &'static str) -> Result<String, MessageError> {
        let body = self.raw();
        String::from_utf8(body.to_vec()).map_err(|_| MessageError::InvalidUtf8 { field })
    }

    fn int<const N: usize>(&mut self, field: &'static str) -> Result<[u8; N], MessageError> {
        let body = self.raw();
        match body.len() {
            0 => Ok([0; N]),
            len if len == N => {
                let mut out = [0; N];
                out.copy_from_slice(&body);
                Ok(out)
            }
            len => Err(MessageError::InvalidFieldLength { field, len }),
        }
    }
}

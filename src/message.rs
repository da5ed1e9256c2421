//! # Requeue Envelope Codec
//!
//! The envelope is the wire format producers publish on the bus and the
//! exact bytes the service persists. It is a self-describing binary record:
//! a fixed-offset header for the scalar fields followed by three
//! variable-length sections.
//!
//! ## Wire Layout
//!
//! ```text
//! offset  size  field
//! 0       2     magic "RQ"
//! 2       1     format version (currently 1)
//! 3       1     backoff strategy
//! 4       8     retries              u64 LE
//! 12      8     ttl (nanoseconds)    u64 LE
//! 20      8     delay (nanoseconds)  u64 LE
//! 28      2     queue name length    u16 LE
//! 30      2     subject length       u16 LE
//! 32      4     payload length       u32 LE
//! 36      ..    queue name | original subject | original payload
//! ```
//!
//! ## Why Fixed Offsets?
//!
//! The replay path decrements `retries` on every attempt. Because the field
//! lives at a fixed offset, [`RequeueMessage::mutate_retries`] overwrites
//! eight bytes in place on the very buffer that was handed to storage;
//! nothing is re-serialized and variable-length sections never move. A
//! fresh [`MessageView`] of the same buffer reads the new value.
//!
//! Scalar accessors on a view read their fixed offset directly; the string
//! and payload sections are zero-copy slices of the underlying buffer.

use bytes::{Buf, BufMut};

use crate::error::{Error, Result};

// =============================================================================
// Constants
// =============================================================================

/// Magic bytes at the start of every envelope.
pub const MAGIC: [u8; 2] = *b"RQ";

/// Envelope format version written by this crate.
pub const FORMAT_VERSION: u8 = 1;

/// Size of the fixed header preceding the variable sections.
pub const HEADER_SIZE: usize = 36;

/// Queue used when a producer leaves the queue name empty.
pub const DEFAULT_QUEUE: &str = "default";

const BACKOFF_OFFSET: usize = 3;
const RETRIES_OFFSET: usize = 4;
const TTL_OFFSET: usize = 12;
const DELAY_OFFSET: usize = 20;
const QUEUE_LEN_OFFSET: usize = 28;
const SUBJECT_LEN_OFFSET: usize = 30;
const PAYLOAD_LEN_OFFSET: usize = 32;

// =============================================================================
// Backoff Strategy
// =============================================================================

/// How the replay component spaces out retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum BackoffStrategy {
    /// No strategy specified; the replay component picks its default.
    #[default]
    Undefined = 0,
    /// Delay doubles on every attempt.
    Exponential = 1,
    /// Delay is constant across attempts.
    Fixed = 2,
}

impl BackoffStrategy {
    /// Decodes a wire discriminant. Unknown values fall back to
    /// [`BackoffStrategy::Undefined`] so that envelopes from newer
    /// producers remain readable.
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => BackoffStrategy::Exponential,
            2 => BackoffStrategy::Fixed,
            _ => BackoffStrategy::Undefined,
        }
    }
}

// =============================================================================
// Owned Message (builder side)
// =============================================================================

/// An owned requeue envelope, used by producers and tests to build the
/// wire bytes.
///
/// Field defaults mirror the wire defaults: zero scalars, an undefined
/// backoff strategy, and the `"default"` queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequeueMessage {
    /// Remaining replay attempts.
    pub retries: u64,
    /// Commit-relative expiry in nanoseconds; 0 means no expiry.
    pub ttl: u64,
    /// Time from commit until the first replay, in nanoseconds.
    pub delay: u64,
    /// Retry spacing strategy.
    pub backoff_strategy: BackoffStrategy,
    /// Logical persistence queue.
    pub queue_name: String,
    /// Subject on which to republish.
    pub original_subject: String,
    /// Opaque producer payload.
    pub original_payload: Vec<u8>,
}

impl Default for RequeueMessage {
    fn default() -> Self {
        Self {
            retries: 0,
            ttl: 0,
            delay: 0,
            backoff_strategy: BackoffStrategy::Undefined,
            queue_name: DEFAULT_QUEUE.to_string(),
            original_subject: String::new(),
            original_payload: Vec::new(),
        }
    }
}

impl RequeueMessage {
    /// Serializes the envelope into a finalized byte buffer.
    ///
    /// An empty `queue_name` is written as [`DEFAULT_QUEUE`]. Fails if the
    /// queue name or subject exceeds `u16::MAX` bytes, or the payload
    /// exceeds `u32::MAX` bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let queue_name = if self.queue_name.is_empty() {
            DEFAULT_QUEUE
        } else {
            &self.queue_name
        };

        if queue_name.len() > u16::MAX as usize {
            return Err(Error::InvalidMessage(format!(
                "queue name of {} bytes exceeds the {} byte limit",
                queue_name.len(),
                u16::MAX
            )));
        }
        if self.original_subject.len() > u16::MAX as usize {
            return Err(Error::InvalidMessage(format!(
                "subject of {} bytes exceeds the {} byte limit",
                self.original_subject.len(),
                u16::MAX
            )));
        }
        if self.original_payload.len() > u32::MAX as usize {
            return Err(Error::InvalidMessage(format!(
                "payload of {} bytes exceeds the {} byte limit",
                self.original_payload.len(),
                u32::MAX
            )));
        }

        let total = HEADER_SIZE
            + queue_name.len()
            + self.original_subject.len()
            + self.original_payload.len();
        let mut buf = Vec::with_capacity(total);

        buf.put_slice(&MAGIC);
        buf.put_u8(FORMAT_VERSION);
        buf.put_u8(self.backoff_strategy as u8);
        buf.put_u64_le(self.retries);
        buf.put_u64_le(self.ttl);
        buf.put_u64_le(self.delay);
        buf.put_u16_le(queue_name.len() as u16);
        buf.put_u16_le(self.original_subject.len() as u16);
        buf.put_u32_le(self.original_payload.len() as u32);
        buf.put_slice(queue_name.as_bytes());
        buf.put_slice(self.original_subject.as_bytes());
        buf.put_slice(&self.original_payload);

        Ok(buf)
    }

    /// Overwrites the `retries` field in place on an encoded envelope.
    ///
    /// The buffer is validated as an envelope first; only the eight bytes
    /// of the retries slot are touched, so views held over other sections
    /// of the buffer remain valid and a fresh view reads back `retries`.
    pub fn mutate_retries(buf: &mut [u8], retries: u64) -> Result<()> {
        validate_header(buf)?;
        buf[RETRIES_OFFSET..TTL_OFFSET].copy_from_slice(&retries.to_le_bytes());
        Ok(())
    }
}

// =============================================================================
// Message View (zero-copy read side)
// =============================================================================

/// A zero-copy view over an encoded envelope.
///
/// Parsing validates the magic, version, and section lengths once; after
/// that, scalar accessors read their fixed offset directly and the string
/// and payload accessors return slices of the underlying buffer.
#[derive(Debug, Clone, Copy)]
pub struct MessageView<'a> {
    data: &'a [u8],
    queue_name: &'a str,
    original_subject: &'a str,
    original_payload: &'a [u8],
}

impl<'a> MessageView<'a> {
    /// Interprets a byte buffer as a requeue envelope.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        validate_header(data)?;

        let queue_len = read_u16_le(data, QUEUE_LEN_OFFSET) as usize;
        let subject_len = read_u16_le(data, SUBJECT_LEN_OFFSET) as usize;
        let payload_len = read_u32_le(data, PAYLOAD_LEN_OFFSET) as usize;

        let expected = HEADER_SIZE + queue_len + subject_len + payload_len;
        if data.len() != expected {
            return Err(Error::InvalidMessage(format!(
                "length mismatch: header declares {} bytes, buffer holds {}",
                expected,
                data.len()
            )));
        }

        let queue_start = HEADER_SIZE;
        let subject_start = queue_start + queue_len;
        let payload_start = subject_start + subject_len;

        let queue_name = std::str::from_utf8(&data[queue_start..subject_start])
            .map_err(|_| Error::InvalidMessage("queue name is not valid utf-8".to_string()))?;
        let original_subject = std::str::from_utf8(&data[subject_start..payload_start])
            .map_err(|_| Error::InvalidMessage("subject is not valid utf-8".to_string()))?;

        Ok(Self {
            data,
            queue_name,
            original_subject,
            original_payload: &data[payload_start..],
        })
    }

    /// Remaining replay attempts.
    pub fn retries(&self) -> u64 {
        read_u64_le(self.data, RETRIES_OFFSET)
    }

    /// Commit-relative expiry in nanoseconds; 0 means no expiry.
    pub fn ttl(&self) -> u64 {
        read_u64_le(self.data, TTL_OFFSET)
    }

    /// Time from commit until the first replay, in nanoseconds.
    pub fn delay(&self) -> u64 {
        read_u64_le(self.data, DELAY_OFFSET)
    }

    /// Retry spacing strategy.
    pub fn backoff_strategy(&self) -> BackoffStrategy {
        BackoffStrategy::from_u8(self.data[BACKOFF_OFFSET])
    }

    /// Logical persistence queue. An empty stored field reads back as
    /// [`DEFAULT_QUEUE`], tolerating producers whose encoder omits it.
    pub fn queue_name(&self) -> &'a str {
        if self.queue_name.is_empty() {
            DEFAULT_QUEUE
        } else {
            self.queue_name
        }
    }

    /// Subject on which to republish.
    pub fn original_subject(&self) -> &'a str {
        self.original_subject
    }

    /// Opaque producer payload.
    pub fn original_payload(&self) -> &'a [u8] {
        self.original_payload
    }

    /// Decodes the view into an owned [`RequeueMessage`].
    pub fn to_owned_message(&self) -> RequeueMessage {
        RequeueMessage {
            retries: self.retries(),
            ttl: self.ttl(),
            delay: self.delay(),
            backoff_strategy: self.backoff_strategy(),
            queue_name: self.queue_name().to_string(),
            original_subject: self.original_subject.to_string(),
            original_payload: self.original_payload.to_vec(),
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn validate_header(data: &[u8]) -> Result<()> {
    if data.len() < HEADER_SIZE {
        return Err(Error::InvalidMessage(format!(
            "buffer of {} bytes is shorter than the {} byte header",
            data.len(),
            HEADER_SIZE
        )));
    }
    if data[0..2] != MAGIC {
        return Err(Error::InvalidMessage("bad magic".to_string()));
    }
    if data[2] != FORMAT_VERSION {
        return Err(Error::InvalidMessage(format!(
            "unsupported format version {}",
            data[2]
        )));
    }
    Ok(())
}

fn read_u16_le(data: &[u8], offset: usize) -> u16 {
    let mut buf = &data[offset..offset + 2];
    buf.get_u16_le()
}

fn read_u32_le(data: &[u8], offset: usize) -> u32 {
    let mut buf = &data[offset..offset + 4];
    buf.get_u32_le()
}

fn read_u64_le(data: &[u8], offset: usize) -> u64 {
    let mut buf = &data[offset..offset + 8];
    buf.get_u64_le()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_view_roundtrip() {
        let msg = RequeueMessage {
            retries: 5,
            ttl: 10_000,
            delay: 20_000,
            backoff_strategy: BackoffStrategy::Exponential,
            queue_name: "high".to_string(),
            original_subject: "foo.bar".to_string(),
            original_payload: b"my awesome message".to_vec(),
        };

        let bytes = msg.encode().unwrap();
        let view = MessageView::parse(&bytes).unwrap();

        assert_eq!(view.retries(), 5);
        assert_eq!(view.ttl(), 10_000);
        assert_eq!(view.delay(), 20_000);
        assert_eq!(view.backoff_strategy(), BackoffStrategy::Exponential);
        assert_eq!(view.queue_name(), "high");
        assert_eq!(view.original_subject(), "foo.bar");
        assert_eq!(view.original_payload(), b"my awesome message");
        assert_eq!(view.to_owned_message(), msg);
    }

    #[test]
    fn test_empty_queue_name_reads_default() {
        let msg = RequeueMessage {
            queue_name: String::new(),
            ..RequeueMessage::default()
        };
        let bytes = msg.encode().unwrap();
        let view = MessageView::parse(&bytes).unwrap();
        assert_eq!(view.queue_name(), DEFAULT_QUEUE);
    }

    #[test]
    fn test_mutate_retries_in_place() {
        let msg = RequeueMessage {
            retries: 5,
            ..RequeueMessage::default()
        };
        let mut bytes = msg.encode().unwrap();
        let len_before = bytes.len();

        RequeueMessage::mutate_retries(&mut bytes, 4).unwrap();

        // No reallocation or resize; only the retries slot changed.
        assert_eq!(bytes.len(), len_before);
        let view = MessageView::parse(&bytes).unwrap();
        assert_eq!(view.retries(), 4);

        // A second independent view of the same buffer also reads 4.
        let view2 = MessageView::parse(&bytes).unwrap();
        assert_eq!(view2.retries(), 4);
    }

    #[test]
    fn test_mutate_retries_rejects_garbage() {
        let mut garbage = vec![0u8; 64];
        assert!(matches!(
            RequeueMessage::mutate_retries(&mut garbage, 1),
            Err(Error::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_parse_rejects_short_buffer() {
        let err = MessageView::parse(&[0u8; 4]).unwrap_err();
        assert!(matches!(err, Error::InvalidMessage(_)));
    }

    #[test]
    fn test_parse_rejects_length_mismatch() {
        let msg = RequeueMessage::default();
        let mut bytes = msg.encode().unwrap();
        bytes.push(0); // trailing garbage
        assert!(matches!(
            MessageView::parse(&bytes),
            Err(Error::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_unknown_backoff_reads_undefined() {
        let msg = RequeueMessage::default();
        let mut bytes = msg.encode().unwrap();
        bytes[3] = 200; // unknown discriminant
        let view = MessageView::parse(&bytes).unwrap();
        assert_eq!(view.backoff_strategy(), BackoffStrategy::Undefined);
    }

    #[test]
    fn test_defaults() {
        let msg = RequeueMessage::default();
        assert_eq!(msg.retries, 0);
        assert_eq!(msg.ttl, 0);
        assert_eq!(msg.delay, 0);
        assert_eq!(msg.backoff_strategy, BackoffStrategy::Undefined);
        assert_eq!(msg.queue_name, DEFAULT_QUEUE);
    }
}

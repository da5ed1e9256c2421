//! # Queue Keys
//!
//! All persisted state lives under the `_q` namespace, laid out so that the
//! messages of one queue occupy a contiguous, lexicographically ordered key
//! range:
//!
//! ```text
//! <namespace> "." <bucket> "." <queue-name> "." <suffix>
//!
//! _q._m.high.<20-byte sortable id>     message record
//! _q._s.high.checkpoint                state property
//! _q._s.low.checkpoint
//! ```
//!
//! Buckets group what is stored: `_m` holds message envelopes, `_s` holds
//! small per-queue state blobs such as the replay checkpoint. Because the
//! message suffix is a fixed-width [`MessageId`], every message of a queue
//! sorts strictly between [`QueueKey::first_message`] and
//! [`QueueKey::last_message`], which the replay component turns into a
//! bounded range scan.
//!
//! Queue names and property names must not contain the `.` separator;
//! constructors assert this. A key that fails to parse is a programmer
//! error (the store must never contain malformed keys), so
//! [`QueueKey::parse`] panics rather than returning a runtime error.

use std::fmt;

use crate::id::{self, MessageId};

// =============================================================================
// Constants
// =============================================================================

/// Namespace under which all queue data is stored.
pub const QUEUES_NAMESPACE: &str = "_q";

/// Bucket holding message envelopes.
pub const MESSAGES_BUCKET: &str = "_m";

/// Bucket holding per-queue state properties.
pub const STATE_BUCKET: &str = "_s";

/// State property under which the replay component stores its checkpoint.
pub const CHECKPOINT_PROPERTY: &str = "checkpoint";

const SEPARATOR: u8 = b'.';

// =============================================================================
// Queue Key
// =============================================================================

/// The suffix segment of a [`QueueKey`]: a fixed-width sortable identifier
/// for message keys, a free-form property name for state keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySuffix {
    /// A message record suffix.
    Message(MessageId),
    /// A state property suffix.
    Property(String),
}

/// A parsed or constructed storage key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKey {
    namespace: String,
    bucket: String,
    name: String,
    suffix: KeySuffix,
}

impl QueueKey {
    /// Builds the key for a message record in `queue`.
    ///
    /// # Panics
    ///
    /// Panics if `queue` is empty or contains the `.` separator.
    pub fn for_message(queue: impl Into<String>, id: MessageId) -> Self {
        let name = queue.into();
        assert_valid_segment(&name, "queue name");
        Self {
            namespace: QUEUES_NAMESPACE.to_string(),
            bucket: MESSAGES_BUCKET.to_string(),
            name,
            suffix: KeySuffix::Message(id),
        }
    }

    /// Builds the key for a state property of `queue`.
    ///
    /// # Panics
    ///
    /// Panics if `queue` or `property` is empty or contains the `.`
    /// separator.
    pub fn for_state(queue: impl Into<String>, property: impl Into<String>) -> Self {
        let name = queue.into();
        let property = property.into();
        assert_valid_segment(&name, "queue name");
        assert_valid_segment(&property, "property");
        Self {
            namespace: QUEUES_NAMESPACE.to_string(),
            bucket: STATE_BUCKET.to_string(),
            name,
            suffix: KeySuffix::Property(property),
        }
    }

    /// The smallest possible message key for `queue`.
    pub fn first_message(queue: impl Into<String>) -> Self {
        Self::for_message(queue, MessageId::MIN)
    }

    /// The largest possible message key for `queue`.
    pub fn last_message(queue: impl Into<String>) -> Self {
        Self::for_message(queue, MessageId::MAX)
    }

    /// Parses a stored key back into its four segments.
    ///
    /// The namespace and bucket are split off the front; the suffix comes
    /// off the back (fixed-width for message keys), so identifier bytes
    /// that happen to contain `0x2E` parse correctly.
    ///
    /// # Panics
    ///
    /// Panics if the key does not have exactly four segments, if a message
    /// key's identifier is not [`id::SIZE`] bytes wide, or if a segment is
    /// not valid UTF-8. Malformed keys in the store are a programmer error.
    pub fn parse(k: &[u8]) -> Self {
        let mut parts = k.splitn(3, |&b| b == SEPARATOR);
        let namespace = segment_str(parts.next(), k, "namespace");
        let bucket = segment_str(parts.next(), k, "bucket");
        let rest = match parts.next() {
            Some(rest) if !rest.is_empty() => rest,
            _ => panic!("invalid queue key (missing name and suffix): {:?}", k),
        };

        let (name, suffix) = if bucket == MESSAGES_BUCKET {
            assert!(
                rest.len() > id::SIZE + 1,
                "invalid message key (too short for a {} byte id): {:?}",
                id::SIZE,
                k
            );
            let split = rest.len() - id::SIZE;
            assert_eq!(
                rest[split - 1],
                SEPARATOR,
                "invalid message key (id is not {} bytes wide): {:?}",
                id::SIZE,
                k
            );
            let name = bytes_str(&rest[..split - 1], k, "queue name");
            (name, KeySuffix::Message(MessageId::from_bytes(&rest[split..])))
        } else {
            let split = rest
                .iter()
                .rposition(|&b| b == SEPARATOR)
                .unwrap_or_else(|| panic!("invalid queue key (missing suffix): {:?}", k));
            let name = bytes_str(&rest[..split], k, "queue name");
            let property = bytes_str(&rest[split + 1..], k, "property");
            assert!(!property.is_empty(), "invalid queue key (empty property): {:?}", k);
            (name, KeySuffix::Property(property))
        };

        assert!(!name.is_empty(), "invalid queue key (empty name): {:?}", k);
        assert!(
            !name.as_bytes().contains(&SEPARATOR),
            "invalid queue key (name holds a separator): {:?}",
            k
        );

        Self {
            namespace,
            bucket,
            name,
            suffix,
        }
    }

    /// Serializes the key to its stored byte form.
    pub fn bytes(&self) -> Vec<u8> {
        let suffix_len = match &self.suffix {
            KeySuffix::Message(_) => id::SIZE,
            KeySuffix::Property(p) => p.len(),
        };
        let mut out = Vec::with_capacity(
            self.namespace.len() + self.bucket.len() + self.name.len() + suffix_len + 3,
        );
        out.extend_from_slice(self.namespace.as_bytes());
        out.push(SEPARATOR);
        out.extend_from_slice(self.bucket.as_bytes());
        out.push(SEPARATOR);
        out.extend_from_slice(self.name.as_bytes());
        out.push(SEPARATOR);
        match &self.suffix {
            KeySuffix::Message(id) => out.extend_from_slice(id.as_bytes()),
            KeySuffix::Property(p) => out.extend_from_slice(p.as_bytes()),
        }
        out
    }

    /// The namespace segment (always [`QUEUES_NAMESPACE`] today).
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The bucket segment.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// The queue name segment.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The suffix segment.
    pub fn suffix(&self) -> &KeySuffix {
        &self.suffix
    }

    /// Whether this is a message record key.
    pub fn is_message(&self) -> bool {
        matches!(self.suffix, KeySuffix::Message(_))
    }

    /// The message identifier, for message keys.
    pub fn message_id(&self) -> Option<MessageId> {
        match &self.suffix {
            KeySuffix::Message(id) => Some(*id),
            KeySuffix::Property(_) => None,
        }
    }

    /// `<namespace>.<bucket>`
    pub fn bucket_path(&self) -> String {
        format!("{}.{}", self.namespace, self.bucket)
    }

    /// `<namespace>.<bucket>.<name>`
    pub fn name_path(&self) -> String {
        format!("{}.{}.{}", self.namespace, self.bucket, self.name)
    }

    /// `<namespace>.<bucket>.<name>.<suffix>` with the suffix printed in a
    /// log-safe form (hex for message identifiers).
    pub fn property_path(&self) -> String {
        match &self.suffix {
            KeySuffix::Message(id) => format!("{}.{}", self.name_path(), id),
            KeySuffix::Property(p) => format!("{}.{}", self.name_path(), p),
        }
    }
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.property_path())
    }
}

// =============================================================================
// Range Helpers
// =============================================================================

/// The longest common byte prefix of two keys.
///
/// The replay component hands the prefix of a queue's first and last
/// message key to the storage engine to narrow range scans.
pub fn prefix_of<'a>(seek: &'a [u8], until: &[u8]) -> &'a [u8] {
    let len = seek
        .iter()
        .zip(until.iter())
        .take_while(|(a, b)| a == b)
        .count();
    &seek[..len]
}

/// The key prefix shared by every message record of every queue.
pub(crate) fn messages_bucket_prefix() -> Vec<u8> {
    let mut prefix =
        Vec::with_capacity(QUEUES_NAMESPACE.len() + MESSAGES_BUCKET.len() + 2);
    prefix.extend_from_slice(QUEUES_NAMESPACE.as_bytes());
    prefix.push(SEPARATOR);
    prefix.extend_from_slice(MESSAGES_BUCKET.as_bytes());
    prefix.push(SEPARATOR);
    prefix
}

/// Whether `name` can be used as a queue name segment.
///
/// The ingress path validates envelope-supplied queue names with this
/// before key construction, so a hostile producer cannot panic a worker.
pub fn is_valid_queue_name(name: &str) -> bool {
    !name.is_empty() && !name.as_bytes().contains(&SEPARATOR)
}

// =============================================================================
// Helpers
// =============================================================================

fn assert_valid_segment(segment: &str, what: &str) {
    assert!(!segment.is_empty(), "{} must not be empty", what);
    assert!(
        !segment.as_bytes().contains(&SEPARATOR),
        "{} {:?} must not contain the '.' separator",
        what,
        segment
    );
}

fn segment_str(segment: Option<&[u8]>, key: &[u8], what: &str) -> String {
    match segment {
        Some(bytes) if !bytes.is_empty() => bytes_str(bytes, key, what),
        _ => panic!("invalid queue key (missing {}): {:?}", what, key),
    }
}

fn bytes_str(bytes: &[u8], key: &[u8], what: &str) -> String {
    String::from_utf8(bytes.to_vec())
        .unwrap_or_else(|_| panic!("invalid queue key ({} is not utf-8): {:?}", what, key))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_key_roundtrip() {
        let id = MessageId::new();
        let key = QueueKey::for_message("high", id);
        let parsed = QueueKey::parse(&key.bytes());

        assert_eq!(parsed, key);
        assert_eq!(parsed.namespace(), QUEUES_NAMESPACE);
        assert_eq!(parsed.bucket(), MESSAGES_BUCKET);
        assert_eq!(parsed.name(), "high");
        assert_eq!(parsed.message_id(), Some(id));
    }

    #[test]
    fn test_state_key_roundtrip() {
        let key = QueueKey::for_state("low", CHECKPOINT_PROPERTY);
        let parsed = QueueKey::parse(&key.bytes());

        assert_eq!(parsed, key);
        assert_eq!(parsed.bucket(), STATE_BUCKET);
        assert_eq!(parsed.name(), "low");
        assert_eq!(
            parsed.suffix(),
            &KeySuffix::Property(CHECKPOINT_PROPERTY.to_string())
        );
        assert!(!parsed.is_message());
    }

    #[test]
    fn test_message_keys_sort_within_range() {
        let first = QueueKey::first_message("orders").bytes();
        let last = QueueKey::last_message("orders").bytes();
        let key = QueueKey::for_message("orders", MessageId::new()).bytes();

        assert!(first < key, "first must sort before any generated key");
        assert!(key < last, "any generated key must sort before last");
    }

    #[test]
    fn test_id_bytes_containing_separator_parse_correctly() {
        // 0x2E is '.'; a random tail may contain it.
        let raw = [0x2Eu8; id::SIZE];
        let id = MessageId::from_bytes(&raw);
        let key = QueueKey::for_message("dots", id);
        let parsed = QueueKey::parse(&key.bytes());
        assert_eq!(parsed.name(), "dots");
        assert_eq!(parsed.message_id(), Some(id));
    }

    #[test]
    fn test_paths() {
        let key = QueueKey::for_state("high", CHECKPOINT_PROPERTY);
        assert_eq!(key.bucket_path(), "_q._s");
        assert_eq!(key.name_path(), "_q._s.high");
        assert_eq!(key.property_path(), "_q._s.high.checkpoint");
        assert_eq!(key.to_string(), "_q._s.high.checkpoint");
    }

    #[test]
    fn test_prefix_of() {
        let first = QueueKey::first_message("q").bytes();
        let last = QueueKey::last_message("q").bytes();
        let prefix = prefix_of(&first, &last);
        assert_eq!(prefix, b"_q._m.q.");

        assert_eq!(prefix_of(b"abc", b"abd"), b"ab");
        assert_eq!(prefix_of(b"abc", b"xyz"), b"");
        assert_eq!(prefix_of(b"abc", b"abc"), b"abc");
    }

    #[test]
    fn test_is_valid_queue_name() {
        assert!(is_valid_queue_name("default"));
        assert!(is_valid_queue_name("high-priority_1"));
        assert!(!is_valid_queue_name(""));
        assert!(!is_valid_queue_name("a.b"));
    }

    #[test]
    #[should_panic(expected = "invalid queue key")]
    fn test_parse_rejects_two_segments() {
        QueueKey::parse(b"_q._m");
    }

    #[test]
    #[should_panic(expected = "invalid message key")]
    fn test_parse_rejects_short_message_id() {
        QueueKey::parse(b"_q._m.queue.short-id");
    }

    #[test]
    #[should_panic(expected = "must not contain the '.' separator")]
    fn test_for_message_rejects_dotted_queue() {
        QueueKey::for_message("a.b", MessageId::new());
    }
}

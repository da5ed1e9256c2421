//! # Sortable Message Identifiers
//!
//! Every stored message is keyed by a fixed-width 20-byte identifier whose
//! lexicographic byte order equals creation-time order: an 8-byte
//! big-endian Unix-nanosecond timestamp prefix followed by a 12-byte random
//! tail. Within a single producer, later ids always sort after earlier
//! ones; across producers the random tail makes collisions overwhelmingly
//! unlikely.
//!
//! Two sentinel values bound every possible id: [`MessageId::MIN`] (all
//! zero bytes) and [`MessageId::MAX`] (all one bits). The key module uses
//! them to form range scans covering an entire queue.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;

// =============================================================================
// Constants
// =============================================================================

/// Width of a message identifier in bytes.
pub const SIZE: usize = 20;

/// Width of the big-endian timestamp prefix in bytes.
const TIMESTAMP_SIZE: usize = 8;

// =============================================================================
// MessageId
// =============================================================================

/// A fixed-width, lexicographically sortable message identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId([u8; SIZE]);

impl MessageId {
    /// The smallest possible identifier (all zero bytes). Used as the lower
    /// bound of queue range scans; never generated.
    pub const MIN: MessageId = MessageId([0x00; SIZE]);

    /// The largest possible identifier (all one bits). Used as the upper
    /// bound of queue range scans; never generated.
    pub const MAX: MessageId = MessageId([0xFF; SIZE]);

    /// Generates a new identifier stamped with the current time.
    pub fn new() -> Self {
        Self::with_time(SystemTime::now())
    }

    /// Generates a new identifier stamped with an explicit time.
    pub fn with_time(time: SystemTime) -> Self {
        let nanos = time
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);

        let mut bytes = [0u8; SIZE];
        bytes[..TIMESTAMP_SIZE].copy_from_slice(&nanos.to_be_bytes());
        rand::thread_rng().fill_bytes(&mut bytes[TIMESTAMP_SIZE..]);
        Self(bytes)
    }

    /// Reinterprets a raw byte slice as an identifier.
    ///
    /// # Panics
    ///
    /// Panics if the slice is not exactly [`SIZE`] bytes. Identifiers only
    /// ever come out of well-formed queue keys, so a bad length is a
    /// programmer error, not a runtime condition.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        assert_eq!(
            bytes.len(),
            SIZE,
            "message id must be {} bytes, got {}",
            SIZE,
            bytes.len()
        );
        let mut id = [0u8; SIZE];
        id.copy_from_slice(bytes);
        Self(id)
    }

    /// The raw identifier bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The Unix-nanosecond timestamp encoded in the prefix.
    pub fn unix_nanos(&self) -> u64 {
        let mut prefix = [0u8; TIMESTAMP_SIZE];
        prefix.copy_from_slice(&self.0[..TIMESTAMP_SIZE]);
        u64::from_be_bytes(prefix)
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    /// Lowercase hex, which preserves the byte-wise sort order in logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self)
    }
}

// =============================================================================
// Tests
// =============================================================================

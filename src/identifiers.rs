//! Type-safe identifiers.
//!
//! Client identifiers are assigned by the transport and are opaque to the
//! multiplexer. The newtype keeps them from being mixed up with other
//! integers such as byte counts.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

// ============================================================================
// Constants
// ============================================================================

/// Process-wide counter for [`ClientId::next`]. Starts at 1.
static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// ClientId
// ============================================================================

/// Opaque identifier for one active client connection.
///
/// Unique while the connection is open. Transports built on
/// [`ClientId::next`] never reuse a value within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(u64);

impl ClientId {
    /// Wraps a transport-assigned value.
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Allocates a fresh, never-before-returned identifier.
    #[inline]
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ClientId {
    #[inline]
    fn from(value: u64) -> Self {
        Self(value)
    }
}

// ============================================================================
// Tests
// ============================================================================

//! Multiplexer options.
//!
//! # Example
//!
//! ```ignore
//! use session_mux::MuxOptions;
//!
//! let options = MuxOptions::new().with_drain_on_close(true);
//! ```

// ============================================================================
// Imports
// ============================================================================

use serde::Deserialize;

// ============================================================================
// MuxOptions
// ============================================================================

/// Behavioural switches for [`SessionMux`](super::SessionMux).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MuxOptions {
    /// Tear down sessions still in the table after the transport stops.
    ///
    /// When `false`, `close()` relies entirely on the transport reporting
    /// a disconnect for every client.
    pub drain_on_close: bool,
}

impl MuxOptions {
    /// Creates options with default settings.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            drain_on_close: false,
        }
    }

    /// Sets whether `close()` drains remaining sessions.
    #[inline]
    #[must_use]
    pub fn with_drain_on_close(mut self, drain: bool) -> Self {
        self.drain_on_close = drain;
        self
    }
}

// ============================================================================
// Tests
// ============================================================================

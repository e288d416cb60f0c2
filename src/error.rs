//! Error types for the session multiplexer.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use session_mux::{ClientId, Result};
//!
//! async fn reply(mux: &Mux, client_id: ClientId) -> Result<()> {
//!     mux.send(client_id, Bytes::from_static(b"ok\n")).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Session | [`Error::ClientNotConnected`], [`Error::AlreadyConnected`] |
//! | Decoder | [`Error::DecoderCreationFailed`], [`Error::Decoder`] |
//! | Flow control | [`Error::Busy`] |
//! | Transport | [`Error::Transport`], [`Error::Io`] |
//! | Configuration | [`Error::Config`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;

use crate::identifiers::ClientId;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Session Errors
    // ========================================================================
    /// Client is not connected.
    ///
    /// Returned when an operation addresses a client identifier with no
    /// live connection.
    #[error("Client not connected: {client_id}")]
    ClientNotConnected {
        /// The unknown or disconnected client.
        client_id: ClientId,
    },

    /// Client already has a session.
    ///
    /// Returned when a connect notification arrives for a client whose
    /// previous session has not been disconnected.
    #[error("Client already connected: {client_id}")]
    AlreadyConnected {
        /// The client with an existing session.
        client_id: ClientId,
    },

    // ========================================================================
    // Decoder Errors
    // ========================================================================
    /// Decoder factory failed.
    ///
    /// The connection never completes its handshake.
    #[error("Decoder creation failed for {client_id}: {source}")]
    DecoderCreationFailed {
        /// Client whose connect was aborted.
        client_id: ClientId,
        /// The factory's own error.
        #[source]
        source: Box<Error>,
    },

    /// Decoder rejected its input.
    #[error("Decoder error: {message}")]
    Decoder {
        /// Description of the decoding failure.
        message: String,
    },

    // ========================================================================
    // Flow Control Errors
    // ========================================================================
    /// Operation conflicts with work already in flight.
    #[error("Busy: {operation}")]
    Busy {
        /// The operation that could not proceed.
        operation: String,
    },

    // ========================================================================
    // Transport Errors
    // ========================================================================
    /// Transport failure.
    #[error("Transport error: {message}")]
    Transport {
        /// Description of the transport failure.
        message: String,
    },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a client not connected error.
    #[inline]
    pub fn client_not_connected(client_id: ClientId) -> Self {
        Self::ClientNotConnected { client_id }
    }

    /// Creates an already connected error.
    #[inline]
    pub fn already_connected(client_id: ClientId) -> Self {
        Self::AlreadyConnected { client_id }
    }

    /// Creates a decoder creation failed error.
    #[inline]
    pub fn decoder_creation_failed(client_id: ClientId, source: Error) -> Self {
        Self::DecoderCreationFailed {
            client_id,
            source: Box::new(source),
        }
    }

    /// Creates a decoder error.
    #[inline]
    pub fn decoder(message: impl Into<String>) -> Self {
        Self::Decoder {
            message: message.into(),
        }
    }

    /// Creates a busy error.
    #[inline]
    pub fn busy(operation: impl Into<String>) -> Self {
        Self::Busy {
            operation: operation.into(),
        }
    }

    /// Creates a transport error.
    #[inline]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this error concerns a client's connection state.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::ClientNotConnected { .. }
                | Self::AlreadyConnected { .. }
                | Self::Transport { .. }
                | Self::Io(_)
        )
    }

    /// Returns `true` if this error is recoverable.
    ///
    /// Recoverable errors may succeed if the caller tries again later.
    /// The multiplexer itself never retries.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Busy { .. })
    }
}

// ============================================================================
// Tests
// ============================================================================

//! TCP transport configuration.
//!
//! # Example
//!
//! ```ignore
//! use session_mux::TcpOptions;
//!
//! let options = TcpOptions::new()
//!     .with_bind_addr("0.0.0.0:9000".parse()?)
//!     .with_max_connections(256);
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use serde::Deserialize;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Default bind address (localhost, OS-assigned port).
const DEFAULT_BIND_ADDR: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);

/// Default bytes requested per socket read.
const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Default outbound chunks queued per client before sends report busy.
const DEFAULT_SEND_QUEUE_CAPACITY: usize = 64;

// ============================================================================
// TcpOptions
// ============================================================================

/// Settings for [`TcpTransport`](super::TcpTransport).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TcpOptions {
    /// Address to listen on. Port 0 lets the OS choose.
    pub bind_addr: SocketAddr,

    /// Maximum bytes per raw data notification.
    pub read_buffer_size: usize,

    /// Outbound chunks buffered per client.
    pub send_queue_capacity: usize,

    /// Connections beyond this count are refused. `None` is unlimited.
    pub max_connections: Option<usize>,
}

impl Default for TcpOptions {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl TcpOptions {
    /// Creates options with default settings.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            send_queue_capacity: DEFAULT_SEND_QUEUE_CAPACITY,
            max_connections: None,
        }
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl TcpOptions {
    /// Sets the listen address.
    #[inline]
    #[must_use]
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Sets the per-read buffer size.
    #[inline]
    #[must_use]
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Sets the per-client outbound queue capacity.
    #[inline]
    #[must_use]
    pub fn with_send_queue_capacity(mut self, capacity: usize) -> Self {
        self.send_queue_capacity = capacity;
        self
    }

    /// Limits concurrent connections.
    #[inline]
    #[must_use]
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }
}

// ============================================================================
// Validation
// ============================================================================

impl TcpOptions {
    /// Checks that all sizes are usable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for zero-sized buffers or queues.
    pub fn validate(&self) -> Result<()> {
        if self.read_buffer_size == 0 {
            return Err(Error::config("read_buffer_size must be greater than 0"));
        }

        if self.send_queue_capacity == 0 {
            return Err(Error::config("send_queue_capacity must be greater than 0"));
        }

        if self.max_connections == Some(0) {
            return Err(Error::config("max_connections must be greater than 0"));
        }

        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

//! Network transport layer.
//!
//! The transport owns the sockets. It assigns a [`ClientId`] to every
//! accepted connection and reports lifecycle and data to exactly one
//! [`TransportHandler`], normally the multiplexer.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐  connect / raw bytes / disconnect   ┌──────────────────┐
//! │ Clients  │ ──────────► Transport ────────────► │ TransportHandler │
//! │ (TCP)    │ ◄────────── send(id, bytes) ◄────── │ (SessionMux)     │
//! └──────────┘                                     └──────────────────┘
//! ```
//!
//! # Notification Order
//!
//! For one client: `on_connect` → `on_raw_data`* → `on_disconnect`.
//! Notifications for different clients may run in parallel.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `options` | TCP transport configuration |
//! | `tcp` | Stock TCP listener transport |

// ============================================================================
// Submodules
// ============================================================================

/// TCP transport configuration.
pub mod options;

/// TCP listener transport.
pub mod tcp;

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::identifiers::ClientId;

// ============================================================================
// Re-exports
// ============================================================================

pub use options::TcpOptions;
pub use tcp::TcpTransport;

// ============================================================================
// TransportHandler
// ============================================================================

/// Receiver of transport notifications.
///
/// Each method may be invoked concurrently for distinct clients.
#[async_trait]
pub trait TransportHandler: Send + Sync + 'static {
    /// A client connected.
    ///
    /// # Errors
    ///
    /// An error rejects the session; the transport closes the connection
    /// and reports no disconnect for it.
    async fn on_connect(&self, client_id: ClientId) -> Result<()>;

    /// A chunk of raw bytes arrived from a client.
    async fn on_raw_data(&self, client_id: ClientId, data: Bytes);

    /// A client disconnected.
    async fn on_disconnect(&self, client_id: ClientId);
}

// ============================================================================
// Transport
// ============================================================================

/// Shared physical transport carrying many client connections.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Registers the handler for all notifications.
    ///
    /// Must be called before [`start`](Transport::start).
    fn set_handler(&self, handler: Arc<dyn TransportHandler>);

    /// Begins accepting connections.
    async fn start(&self) -> Result<()>;

    /// Stops accepting connections and closes the live ones.
    async fn stop(&self) -> Result<()>;

    /// Sends bytes to one client.
    ///
    /// # Errors
    ///
    /// - [`Error::ClientNotConnected`](crate::Error::ClientNotConnected) if the client is unknown or gone
    /// - [`Error::Busy`](crate::Error::Busy) if the client's outbound queue is full
    async fn send(&self, client_id: ClientId, data: Bytes) -> Result<()>;
}

//! Session event sink.
//!
//! The upstream consumer registers up to three callbacks: parsed data,
//! connect, and disconnect. Unset callbacks are no-ops. Callbacks can be
//! replaced or cleared at any time; an emission already in progress keeps
//! using the callback it started with.
//!
//! Callbacks run on the transport's task for the affected client and must
//! not block. Consumers that prefer a queue can use [`EventSink::forward_to`].

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::trace;

use crate::identifiers::ClientId;

// ============================================================================
// Types
// ============================================================================

/// Callback for decoded messages.
pub type ParsedDataHandler<M> = Arc<dyn Fn(ClientId, M) + Send + Sync>;

/// Callback for connect and disconnect notifications.
pub type LifecycleHandler = Arc<dyn Fn(ClientId) + Send + Sync>;

// ============================================================================
// SessionEvent
// ============================================================================

/// A session event in queued form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent<M> {
    /// Connect handshake completed.
    Connected(ClientId),
    /// Decoder produced a message.
    ParsedData(ClientId, M),
    /// Transport reported a disconnect.
    Disconnected(ClientId),
}

impl<M> SessionEvent<M> {
    /// Returns the client the event concerns.
    #[inline]
    #[must_use]
    pub fn client_id(&self) -> ClientId {
        match self {
            Self::Connected(id) | Self::ParsedData(id, _) | Self::Disconnected(id) => *id,
        }
    }
}

// ============================================================================
// EventSink
// ============================================================================

/// Holder for the consumer's session callbacks.
pub struct EventSink<M> {
    on_parsed_data: RwLock<Option<ParsedDataHandler<M>>>,
    on_connect: RwLock<Option<LifecycleHandler>>,
    on_disconnect: RwLock<Option<LifecycleHandler>>,
}

impl<M> Default for EventSink<M> {
    fn default() -> Self {
        Self {
            on_parsed_data: RwLock::new(None),
            on_connect: RwLock::new(None),
            on_disconnect: RwLock::new(None),
        }
    }
}

impl<M> fmt::Debug for EventSink<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("on_parsed_data", &self.on_parsed_data.read().is_some())
            .field("on_connect", &self.on_connect.read().is_some())
            .field("on_disconnect", &self.on_disconnect.read().is_some())
            .finish()
    }
}

// ============================================================================
// EventSink - Registration
// ============================================================================

impl<M: Send + 'static> EventSink<M> {
    /// Creates a sink with no callbacks.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the parsed data callback.
    pub fn set_on_parsed_data(&self, handler: impl Fn(ClientId, M) + Send + Sync + 'static) {
        *self.on_parsed_data.write() = Some(Arc::new(handler));
    }

    /// Sets the connect callback.
    pub fn set_on_connect(&self, handler: impl Fn(ClientId) + Send + Sync + 'static) {
        *self.on_connect.write() = Some(Arc::new(handler));
    }

    /// Sets the disconnect callback.
    pub fn set_on_disconnect(&self, handler: impl Fn(ClientId) + Send + Sync + 'static) {
        *self.on_disconnect.write() = Some(Arc::new(handler));
    }

    /// Removes all callbacks.
    pub fn clear(&self) {
        *self.on_parsed_data.write() = None;
        *self.on_connect.write() = None;
        *self.on_disconnect.write() = None;
    }

    /// Routes every event into `tx`, replacing all three callbacks.
    ///
    /// Events are silently discarded once the receiver is dropped.
    pub fn forward_to(&self, tx: mpsc::UnboundedSender<SessionEvent<M>>) {
        let parsed_tx = tx.clone();
        self.set_on_parsed_data(move |client_id, message| {
            let _ = parsed_tx.send(SessionEvent::ParsedData(client_id, message));
        });

        let connect_tx = tx.clone();
        self.set_on_connect(move |client_id| {
            let _ = connect_tx.send(SessionEvent::Connected(client_id));
        });

        self.set_on_disconnect(move |client_id| {
            let _ = tx.send(SessionEvent::Disconnected(client_id));
        });
    }
}

// ============================================================================
// EventSink - Emission
// ============================================================================

impl<M> EventSink<M> {
    pub(crate) fn emit_parsed_data(&self, client_id: ClientId, message: M) {
        let handler = self.on_parsed_data.read().clone();
        match handler {
            Some(handler) => handler(client_id, message),
            None => trace!(client_id = %client_id, "No parsed data handler"),
        }
    }

    pub(crate) fn emit_connect(&self, client_id: ClientId) {
        let handler = self.on_connect.read().clone();
        if let Some(handler) = handler {
            handler(client_id);
        }
    }

    pub(crate) fn emit_disconnect(&self, client_id: ClientId) {
        let handler = self.on_disconnect.read().clone();
        if let Some(handler) = handler {
            handler(client_id);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

//! Session multiplexing over a shared network transport.
//!
//! A transport accepts many clients and delivers raw byte chunks tagged
//! with a client identifier. This library gives every client its own
//! decoder, keeps that decoder alive exactly as long as the connection, and
//! hands decoded messages and lifecycle events to one upstream consumer.
//!
//! # Architecture
//!
//! ```text
//! Transport ──(client id, bytes)──► SessionMux ──► Decoder (one per client)
//!     ▲                                 │               │
//!     │                                 ▼               ▼
//!     └──────── send(id, bytes) ──── EventSink ◄── decoded messages
//! ```
//!
//! Key guarantees:
//!
//! - A decoder only ever sees bytes from the client it was created for
//! - A decoder is torn down at most once, when its client disconnects
//! - No parsed data is delivered for a client after its disconnect
//! - Unrelated clients never wait on each other's locks
//!
//! # Quick Start
//!
//! ```no_run
//! use session_mux::{DelimiterDecoder, Result, SessionMux, TcpOptions, TcpTransport};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let transport = TcpTransport::new(TcpOptions::new())?;
//!     let factory = DelimiterDecoder::factory(b"\n".as_slice())?;
//!     let mux = SessionMux::new(transport, factory);
//!
//!     mux.on_connect(|client_id| println!("{client_id} connected"));
//!     mux.on_parsed_data(|client_id, line| println!("{client_id}: {line:?}"));
//!     mux.on_disconnect(|client_id| println!("{client_id} left"));
//!
//!     mux.open().await?;
//!     tokio::signal::ctrl_c().await?;
//!     mux.close().await
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`decoder`] | Decoder contract and the stock delimiter decoder |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Type-safe client identifier |
//! | [`mux`] | The session multiplexer and its event sink |
//! | [`transport`] | Transport contract and the stock TCP transport |

// ============================================================================
// Modules
// ============================================================================

/// Per-connection decoders.
pub mod decoder;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers.
pub mod identifiers;

/// Session multiplexer.
///
/// - [`SessionMux`] - Routes transport traffic to per-client decoders
/// - [`EventSink`] - Upstream callbacks
pub mod mux;

/// Network transport layer.
///
/// - [`Transport`] / [`TransportHandler`] - Collaborator contract
/// - [`TcpTransport`] - Stock TCP listener
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Decoder types
pub use decoder::{
    Decoder, DecoderFactory, DelimiterDecoder, DelimiterFactory, FnFactory, MessageHandler,
    factory_fn,
};

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::ClientId;

// Multiplexer types
pub use mux::{EventSink, MessageOf, MuxOptions, SessionEvent, SessionMux};

// Transport types
pub use transport::{TcpOptions, TcpTransport, Transport, TransportHandler};

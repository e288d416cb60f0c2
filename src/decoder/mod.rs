//! Per-connection decoders.
//!
//! A decoder turns one client's raw byte stream into discrete messages.
//! The multiplexer creates one decoder per connection through a
//! [`DecoderFactory`], subscribes to it before feeding any bytes, and tears
//! it down when the connection goes away.
//!
//! # Contract
//!
//! | Method | Called |
//! |--------|--------|
//! | [`Decoder::subscribe`] | Once, before the first `feed` |
//! | [`Decoder::feed`] | Zero or more times, never concurrently |
//! | [`Decoder::teardown`] | At most once, at disconnect |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `delimiter` | Stock decoder splitting on a byte delimiter |

// ============================================================================
// Submodules
// ============================================================================

/// Delimiter-framed decoder.
pub mod delimiter;

// ============================================================================
// Imports
// ============================================================================

use std::future::Future;

use async_trait::async_trait;

use crate::error::Result;

// ============================================================================
// Re-exports
// ============================================================================

pub use delimiter::{DelimiterDecoder, DelimiterFactory};

// ============================================================================
// Types
// ============================================================================

/// Callback receiving each decoded message.
pub type MessageHandler<M> = Box<dyn Fn(M) + Send + Sync>;

// ============================================================================
// Decoder
// ============================================================================

/// Stateful per-connection decoder.
#[async_trait]
pub trait Decoder: Send + 'static {
    /// Application-level message produced by this decoder.
    type Message: Send + 'static;

    /// Registers the handler invoked for every decoded message.
    ///
    /// A later call replaces the earlier handler.
    fn subscribe(&mut self, handler: MessageHandler<Self::Message>);

    /// Feeds a chunk of raw bytes.
    ///
    /// May emit zero or more messages through the subscribed handler
    /// before returning.
    ///
    /// # Errors
    ///
    /// Implementation-defined; the multiplexer logs and does not retry.
    async fn feed(&mut self, data: &[u8]) -> Result<()>;

    /// Releases decoder-held resources. Default is a no-op.
    fn teardown(&mut self) {}
}

// ============================================================================
// DecoderFactory
// ============================================================================

/// Produces a fresh decoder for every new connection.
///
/// Instances are never shared between clients.
#[async_trait]
pub trait DecoderFactory: Send + Sync + 'static {
    /// Decoder type produced.
    type Decoder: Decoder;

    /// Creates a decoder.
    ///
    /// # Errors
    ///
    /// Any error aborts the connect handshake for the client being set up.
    async fn create(&self) -> Result<Self::Decoder>;
}

// ============================================================================
// FnFactory
// ============================================================================

/// [`DecoderFactory`] backed by an async closure.
///
/// Built with [`factory_fn`].
#[derive(Clone)]
pub struct FnFactory<F> {
    make: F,
}

/// Wraps a closure returning a decoder future as a [`DecoderFactory`].
///
/// # Example
///
/// ```ignore
/// let factory = factory_fn(|| async { DelimiterDecoder::new(b"\n".as_slice()) });
/// ```
#[inline]
#[must_use]
pub fn factory_fn<F, Fut, D>(make: F) -> FnFactory<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<D>> + Send + 'static,
    D: Decoder,
{
    FnFactory { make }
}

#[async_trait]
impl<F, Fut, D> DecoderFactory for FnFactory<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<D>> + Send + 'static,
    D: Decoder,
{
    type Decoder = D;

    async fn create(&self) -> Result<D> {
        (self.make)().await
    }
}

// ============================================================================
// Tests
// ============================================================================

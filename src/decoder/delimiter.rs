//! Delimiter-framed decoder.
//!
//! Splits the byte stream on a fixed, non-empty delimiter and emits each
//! frame without the delimiter. Partial frames are buffered across feeds.
//!
//! # Example
//!
//! ```ignore
//! let factory = DelimiterDecoder::factory(b"\r\n".as_slice())?
//!     .with_max_frame_len(4096);
//! let mux = SessionMux::new(transport, factory);
//! ```

// ============================================================================
// Imports
// ============================================================================

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use tracing::trace;

use crate::error::{Error, Result};

use super::{Decoder, DecoderFactory, MessageHandler};

// ============================================================================
// Constants
// ============================================================================

/// Default upper bound on a buffered, not-yet-terminated frame.
const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

// ============================================================================
// DelimiterDecoder
// ============================================================================

/// Decoder emitting one [`Bytes`] frame per delimiter occurrence.
pub struct DelimiterDecoder {
    /// Frame terminator.
    delimiter: Bytes,
    /// Maximum bytes buffered without seeing a delimiter.
    max_frame_len: usize,
    /// Bytes received but not yet framed.
    buffer: BytesMut,
    /// Subscriber for decoded frames.
    handler: Option<MessageHandler<Bytes>>,
}

impl DelimiterDecoder {
    /// Creates a decoder for the given delimiter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the delimiter is empty.
    pub fn new(delimiter: impl Into<Bytes>) -> Result<Self> {
        let delimiter = delimiter.into();
        if delimiter.is_empty() {
            return Err(Error::config("Delimiter must not be empty"));
        }

        Ok(Self {
            delimiter,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            buffer: BytesMut::new(),
            handler: None,
        })
    }

    /// Sets the maximum length of a buffered partial frame.
    #[inline]
    #[must_use]
    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    /// Creates a factory producing decoders for the given delimiter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the delimiter is empty.
    pub fn factory(delimiter: impl Into<Bytes>) -> Result<DelimiterFactory> {
        let delimiter = delimiter.into();
        if delimiter.is_empty() {
            return Err(Error::config("Delimiter must not be empty"));
        }

        Ok(DelimiterFactory {
            delimiter,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        })
    }

    /// Returns the number of buffered bytes awaiting a delimiter.
    #[inline]
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Position of the next delimiter in the buffer.
    fn find_delimiter(&self) -> Option<usize> {
        self.buffer
            .windows(self.delimiter.len())
            .position(|window| window == &self.delimiter[..])
    }
}

#[async_trait]
impl Decoder for DelimiterDecoder {
    type Message = Bytes;

    fn subscribe(&mut self, handler: MessageHandler<Bytes>) {
        self.handler = Some(handler);
    }

    async fn feed(&mut self, data: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(data);

        while let Some(pos) = self.find_delimiter() {
            let frame = self.buffer.split_to(pos).freeze();
            self.buffer.advance(self.delimiter.len());

            trace!(len = frame.len(), "Frame decoded");

            if let Some(ref handler) = self.handler {
                handler(frame);
            }
        }

        if self.buffer.len() > self.max_frame_len {
            let buffered = self.buffer.len();
            self.buffer.clear();
            return Err(Error::decoder(format!(
                "Frame exceeds maximum length: {}/{}",
                buffered, self.max_frame_len
            )));
        }

        Ok(())
    }

    fn teardown(&mut self) {
        self.buffer.clear();
        self.handler = None;
    }
}

// ============================================================================
// DelimiterFactory
// ============================================================================

/// Factory for [`DelimiterDecoder`] instances sharing one configuration.
#[derive(Debug, Clone)]
pub struct DelimiterFactory {
    delimiter: Bytes,
    max_frame_len: usize,
}

impl DelimiterFactory {
    /// Sets the maximum partial frame length for produced decoders.
    #[inline]
    #[must_use]
    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }
}

#[async_trait]
impl DecoderFactory for DelimiterFactory {
    type Decoder = DelimiterDecoder;

    async fn create(&self) -> Result<DelimiterDecoder> {
        Ok(DelimiterDecoder::new(self.delimiter.clone())?.with_max_frame_len(self.max_frame_len))
    }
}

// ============================================================================
// Tests
// ============================================================================

//! Framing layer: turns a connection's byte stream into requests.
//!
//! A `Framer` owns the bytes of an incomplete trailing frame and drives a
//! pluggable `FrameDecoder` over them. Any read may carry a fraction of a
//! frame, exactly one frame, or several pipelined frames; `Framer::feed`
//! hides the difference and yields every complete request in arrival order.
//!
//! Two decoders ship with the engine:
//! - `LineDecoder`: delimiter-terminated text lines (`KEY body\r\n`)
//! - `LengthPrefixedDecoder`: fixed-width key, big-endian body length, body
//!
//! A decoder error is terminal. The framer stops decoding and discards
//! further input; the owning session closes the connection.

mod length;
mod line;

pub use length::{BinaryRequest, LengthPrefixedDecoder};
pub use line::{LineDecoder, StringRequest};

use crate::error::FramingError;
use bytes::{Buf, BytesMut};

/// A decoded request as seen by the dispatcher.
pub trait RequestInfo: Send + 'static {
    /// Command key used to look up the handler.
    fn key(&self) -> &str;

    /// Opaque request payload.
    fn body(&self) -> &[u8];
}

/// Result of one decode attempt against the buffered input.
#[derive(Debug)]
pub enum DecodeResult<R> {
    /// A request was decoded from the first `usize` bytes.
    Complete(R, usize),
    /// The first `usize` bytes carry no request and can be dropped.
    Skip(usize),
    /// Need more data.
    Incomplete,
    /// The input violates the framing rule.
    Error(FramingError),
}

/// A framing rule.
///
/// `decode` always sees the unconsumed input starting at a frame boundary.
/// It may keep state between calls (for example, how far it has already
/// scanned), but must reset it once it reports `Complete` or `Skip`.
pub trait FrameDecoder: Send {
    type Request: RequestInfo;

    fn decode(&mut self, input: &[u8]) -> DecodeResult<Self::Request>;
}

/// Per-session frame accumulator.
pub struct Framer<R> {
    decoder: Box<dyn FrameDecoder<Request = R>>,
    buffer: BytesMut,
    failed: bool,
}

impl<R: RequestInfo> Framer<R> {
    pub fn new(decoder: impl FrameDecoder<Request = R> + 'static) -> Self {
        Self::from_boxed(Box::new(decoder))
    }

    pub fn from_boxed(decoder: Box<dyn FrameDecoder<Request = R>>) -> Self {
        Self {
            decoder,
            buffer: BytesMut::new(),
            failed: false,
        }
    }

    /// Append received bytes and iterate over the requests they complete.
    ///
    /// The iterator is lazy: frames are decoded as it is advanced. Bytes of a
    /// trailing partial frame stay buffered for the next call.
    pub fn feed(&mut self, data: &[u8]) -> Frames<'_, R> {
        if !self.failed {
            self.buffer.extend_from_slice(data);
        }
        Frames { framer: self }
    }

    /// Bytes held for an incomplete frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Whether a framing error has been reported.
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    fn next_frame(&mut self) -> Option<Result<R, FramingError>> {
        loop {
            if self.failed || self.buffer.is_empty() {
                return None;
            }

            match self.decoder.decode(&self.buffer) {
                DecodeResult::Complete(request, consumed) => {
                    if consumed == 0 || consumed > self.buffer.len() {
                        return Some(Err(self.fail(FramingError::NoProgress)));
                    }
                    self.buffer.advance(consumed);
                    return Some(Ok(request));
                }
                DecodeResult::Skip(consumed) => {
                    if consumed == 0 || consumed > self.buffer.len() {
                        return Some(Err(self.fail(FramingError::NoProgress)));
                    }
                    self.buffer.advance(consumed);
                }
                DecodeResult::Incomplete => return None,
                DecodeResult::Error(e) => return Some(Err(self.fail(e))),
            }
        }
    }

    fn fail(&mut self, error: FramingError) -> FramingError {
        self.failed = true;
        self.buffer.clear();
        error
    }
}

/// Requests completed by one `Framer::feed` call.
pub struct Frames<'a, R> {
    framer: &'a mut Framer<R>,
}

impl<R: RequestInfo> Iterator for Frames<'_, R> {
    type Item = Result<R, FramingError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.framer.next_frame()
    }
}

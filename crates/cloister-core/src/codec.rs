//! Framing codec for the worker's standard streams.
//!
//! Frames carry no length prefix and no delimiter that the payload cannot
//! contain. Every encoded value is its JSON text followed by a comma. The
//! decoder buffers everything it has received, wraps the buffer as
//! `[<buffer>null]` and attempts a full parse. When the buffer ends on a frame
//! boundary that parse succeeds and the trailing sentinel is dropped;
//! otherwise the whole buffer is retained until more bytes arrive.
//!
//! A buffer that can never become valid (it is not a prefix of any sequence
//! of frames) is discarded and reported, so that later frames still get
//! through.

use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Byte appended after every encoded value.
pub const SEPARATOR: u8 = b',';

const SENTINEL: &[u8] = b"null]";

/// Encode a value as one wire chunk.
pub fn encode<T: Serialize>(value: &T) -> serde_json::Result<Vec<u8>> {
    let mut buf = serde_json::to_vec(value)?;
    buf.push(SEPARATOR);
    Ok(buf)
}

/// Buffered bytes that cannot be completed into frames.
#[derive(Debug, Error)]
#[error("discarded {} undecodable bytes: {reason}", .discarded.len())]
pub struct MalformedFrame {
    /// The bytes that were dropped from the buffer.
    pub discarded: Bytes,
    /// Parser message for the failure.
    pub reason: String,
}

/// Incremental decoder for a stream of comma-terminated JSON values.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every value that is now complete.
    ///
    /// Either all buffered values are returned, in order, and the buffer is
    /// emptied, or nothing is returned and the buffer is kept intact.
    ///
    /// # Errors
    ///
    /// Returns [`MalformedFrame`] when the buffer holds bytes that no further
    /// input could turn into valid frames. The buffer is cleared in that case.
    pub fn decode(&mut self, chunk: &[u8]) -> Result<Vec<Value>, MalformedFrame> {
        self.buffer.extend_from_slice(chunk);
        if self.buffer.is_empty() {
            return Ok(Vec::new());
        }

        let mut wrapped = Vec::with_capacity(self.buffer.len() + 1 + SENTINEL.len());
        wrapped.push(b'[');
        wrapped.extend_from_slice(&self.buffer);
        wrapped.extend_from_slice(SENTINEL);

        match serde_json::from_slice::<Vec<Value>>(&wrapped) {
            Ok(mut values) => {
                values.pop();
                self.buffer.clear();
                Ok(values)
            }
            Err(_) => match self.probe() {
                Probe::Incomplete => {
                    tracing::trace!(buffered = self.buffer.len(), "partial frame buffered");
                    Ok(Vec::new())
                }
                Probe::Malformed(reason) => Err(MalformedFrame {
                    discarded: self.buffer.split().freeze(),
                    reason,
                }),
            },
        }
    }

    /// Number of bytes held back waiting for the rest of a frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Consume the decoder, returning any bytes that never completed a frame.
    pub fn finish(self) -> Option<Bytes> {
        if self.buffer.iter().all(u8::is_ascii_whitespace) {
            None
        } else {
            Some(self.buffer.freeze())
        }
    }

    /// Decide whether the current buffer is a prefix of valid frames.
    ///
    /// Parsing `[<buffer>` alone runs out of input exactly when the buffer
    /// stops in the middle of a value or right after a separator.
    fn probe(&self) -> Probe {
        let mut open = Vec::with_capacity(self.buffer.len() + 1);
        open.push(b'[');
        open.extend_from_slice(&self.buffer);

        match serde_json::from_slice::<Vec<Value>>(&open) {
            Err(e) if e.is_eof() => Probe::Incomplete,
            Err(e) => Probe::Malformed(e.to_string()),
            Ok(_) => Probe::Malformed("unbalanced closing bracket".into()),
        }
    }
}

enum Probe {
    Incomplete,
    Malformed(String),
}

/// Accumulates input until it parses as exactly one JSON document.
///
/// Used on the worker's inbound side, where the request is written once with
/// no separator but may arrive split across several reads.
#[derive(Debug, Default)]
pub struct DocumentAssembler {
    buffer: BytesMut,
}

impl DocumentAssembler {
    /// Create an empty assembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk. Returns `Ok(None)` while the document is incomplete.
    ///
    /// # Errors
    ///
    /// Returns the parse error once the buffered text can no longer become
    /// a valid document of type `T`.
    pub fn push<T: DeserializeOwned>(&mut self, chunk: &[u8]) -> serde_json::Result<Option<T>> {
        self.buffer.extend_from_slice(chunk);
        match serde_json::from_slice::<T>(&self.buffer) {
            Ok(doc) => {
                self.buffer.clear();
                Ok(Some(doc))
            }
            Err(e) if e.is_eof() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Number of bytes buffered so far.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether nothing has been buffered.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

//! JSON document codec for the gateway stream.
//!
//! The gateway writes bare JSON objects back to back with no length prefix or
//! delimiter. Reads may split a document anywhere, so the decoder keeps
//! accumulating until one complete document parses, then consumes exactly the
//! bytes it used and leaves the rest for the next call.

use bytes::{Buf, BytesMut};
use serde::Serialize;
use serde_json::Value;
use std::io;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{trace, warn};

/// Maximum size of a single buffered document (4 MB)
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Default read chunk size for the framed reader
pub const DEFAULT_READ_CHUNK: usize = 30 * 1024;

/// Codec for unframed, back-to-back JSON documents
#[derive(Debug, Clone)]
pub struct JsonFrameCodec {
    max_size: usize,
}

impl Default for JsonFrameCodec {
    fn default() -> Self {
        Self {
            max_size: MAX_MESSAGE_SIZE,
        }
    }
}

impl JsonFrameCodec {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_max_size(max_size: usize) -> Self {
        Self { max_size }
    }
}

impl Decoder for JsonFrameCodec {
    type Item = Value;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(start) = src.iter().position(|b| !b.is_ascii_whitespace()) else {
            src.clear();
            return Ok(None);
        };
        src.advance(start);

        let (next, consumed) = {
            let mut documents = serde_json::Deserializer::from_slice(src).into_iter::<Value>();
            let next = documents.next();
            (next, documents.byte_offset())
        };

        match next {
            Some(Ok(value)) => {
                src.advance(consumed);
                trace!("Decoded document ({consumed} bytes, {} buffered)", src.len());
                Ok(Some(value))
            }
            Some(Err(e)) if e.is_eof() => {
                if src.len() > self.max_size {
                    return Err(CodecError::MessageTooLarge(src.len()));
                }
                Ok(None)
            }
            Some(Err(e)) => {
                warn!("Discarding {} undecodable bytes: {e}", src.len());
                src.clear();
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(value) => Ok(Some(value)),
            None => {
                if !buf.is_empty() {
                    warn!("Stream closed with {} bytes of partial document", buf.len());
                    buf.clear();
                }
                Ok(None)
            }
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonFrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item)?;

        if json.len() > self.max_size {
            return Err(CodecError::MessageTooLarge(json.len()));
        }

        dst.extend_from_slice(&json);
        Ok(())
    }
}

/// Errors that can occur during codec operations
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),
}

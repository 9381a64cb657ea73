//! Length-prefixed message framing
//!
//! Every message on a session TCP stream (discovery traffic and host media
//! alike) is framed the same way:
//!
//! ```text
//! ┌─────────────┬─────────────────────────────────┐
//! │ Length (4B) │ Payload (bincode-encoded)       │
//! └─────────────┴─────────────────────────────────┘
//! ```
//!
//! The length is big-endian. Each protocol picks its own maximum payload size.

use std::io::{self, Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

// ============================================================================
// Constants
// ============================================================================

/// Length of the frame header (4 bytes for length)
pub const HEADER_LEN: usize = 4;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during frame encoding
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },
}

/// Errors that can occur during frame decoding
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Not enough data (need N more bytes)
    #[error("incomplete message, need {0} more bytes")]
    Incomplete(usize),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },
}

// ============================================================================
// Encoding/Decoding
// ============================================================================

/// Encode a message as `[4-byte BE length][bincode payload]`
pub fn encode_frame<T: Serialize>(msg: &T, max_len: usize) -> Result<Vec<u8>, EncodeError> {
    let payload =
        bincode::serialize(msg).map_err(|e| EncodeError::Serialization(e.to_string()))?;

    if payload.len() > max_len {
        return Err(EncodeError::MessageTooLarge {
            size: payload.len(),
            max: max_len,
        });
    }

    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);

    Ok(buf)
}

/// Decode one message from the front of `buf`
///
/// Returns the message and the number of bytes consumed
pub fn decode_frame<T: DeserializeOwned>(
    buf: &[u8],
    max_len: usize,
) -> Result<(T, usize), DecodeError> {
    if buf.len() < HEADER_LEN {
        return Err(DecodeError::Incomplete(HEADER_LEN - buf.len()));
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if length > max_len {
        return Err(DecodeError::MessageTooLarge {
            size: length,
            max: max_len,
        });
    }

    let total_len = HEADER_LEN + length;
    if buf.len() < total_len {
        return Err(DecodeError::Incomplete(total_len - buf.len()));
    }

    let msg = bincode::deserialize(&buf[HEADER_LEN..total_len])
        .map_err(|e| DecodeError::Deserialization(e.to_string()))?;

    Ok((msg, total_len))
}

// ============================================================================
// Blocking stream I/O
// ============================================================================

/// Write one framed message to a blocking writer
pub fn write_frame<W: Write, T: Serialize>(
    writer: &mut W,
    msg: &T,
    max_len: usize,
) -> io::Result<()> {
    let encoded =
        encode_frame(msg, max_len).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&encoded)
}

/// Read one framed message from a blocking reader
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R, max_len: usize) -> io::Result<T> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header)?;

    let length = u32::from_be_bytes(header) as usize;
    if length > max_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message too large: {} bytes", length),
        ));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload)?;

    bincode::deserialize(&payload).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

// ============================================================================
// Accumulating buffer for non-blocking sockets
// ============================================================================

/// Accumulates bytes read from a non-blocking socket and yields whole frames
#[derive(Debug)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    max_len: usize,
}

impl FrameBuffer {
    pub fn new(max_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_len,
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes currently buffered
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Pop the next complete frame, if one is buffered
    ///
    /// A malformed frame is an error; the stream cannot be resynchronised
    /// after one, so callers drop the connection.
    pub fn next_frame<T: DeserializeOwned>(&mut self) -> Result<Option<T>, DecodeError> {
        match decode_frame(&self.buf, self.max_len) {
            Ok((msg, consumed)) => {
                self.buf.drain(..consumed);
                Ok(Some(msg))
            }
            Err(DecodeError::Incomplete(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

//! Chunk framing for the streaming command.
//!
//! A streamed body is a sequence of chunks, each prefixed by its payload
//! length, closed by a zero-length terminator:
//! ```text
//! ┌──────────┬──────────────┐     ┌──────────┐
//! │ Length   │ Payload      │ ... │ 0        │
//! │ uint32 BE│ Length bytes │     │ uint32 BE│
//! └──────────┴──────────────┘     └──────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use clamd_client::protocol::encode_chunks;
//!
//! let chunks = encode_chunks(b"hello world", 4).unwrap();
//! assert_eq!(chunks.len(), 4); // "hell", "o wo", "rld", terminator
//! assert!(chunks[3].is_terminator());
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ClamdError, Result};

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Chunk size used by clients that do not configure one (1 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 1 << 10;

/// Largest chunk a [`ChunkBuffer`] accepts by default (25 MiB, the daemon's
/// default stream limit).
pub const DEFAULT_MAX_CHUNK_SIZE: u32 = 25 * 1024 * 1024;

/// One length-prefixed chunk, stored in wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Length prefix followed by the payload.
    wire: Bytes,
}

impl Chunk {
    /// Frame a payload slice as a chunk.
    ///
    /// Fails with `InvalidArgument` if the payload does not fit a 32-bit length.
    pub fn new(payload: &[u8]) -> Result<Self> {
        let len = u32::try_from(payload.len()).map_err(|_| {
            ClamdError::InvalidArgument(format!(
                "chunk payload of {} bytes exceeds u32 length prefix",
                payload.len()
            ))
        })?;

        let mut wire = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
        wire.put_u32(len);
        wire.extend_from_slice(payload);
        Ok(Self {
            wire: wire.freeze(),
        })
    }

    /// The end-of-stream marker: a zero length and no payload.
    pub fn terminator() -> Self {
        Self {
            wire: Bytes::from_static(&[0, 0, 0, 0]),
        }
    }

    /// Length announced by the prefix.
    #[inline]
    pub fn declared_len(&self) -> u32 {
        u32::from_be_bytes([self.wire[0], self.wire[1], self.wire[2], self.wire[3]])
    }

    /// Payload bytes (without the prefix).
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.wire[LENGTH_PREFIX_SIZE..]
    }

    /// Whether this is the zero-length terminator.
    #[inline]
    pub fn is_terminator(&self) -> bool {
        self.declared_len() == 0
    }

    /// Full wire form (prefix + payload).
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.wire
    }

    /// Cheap clone of the wire form.
    #[inline]
    pub fn wire_bytes(&self) -> Bytes {
        self.wire.clone()
    }

    /// Total size on the wire.
    #[inline]
    pub fn wire_len(&self) -> usize {
        self.wire.len()
    }
}

/// Split `payload` into chunks of at most `chunk_size` bytes and append the
/// terminator.
///
/// An empty payload yields only the terminator. A `chunk_size` of zero, or
/// one that cannot be expressed in the 32-bit prefix, is rejected.
pub fn encode_chunks(payload: &[u8], chunk_size: usize) -> Result<Vec<Chunk>> {
    if chunk_size == 0 {
        return Err(ClamdError::InvalidArgument(
            "chunk size must be positive".to_string(),
        ));
    }
    if u32::try_from(chunk_size).is_err() {
        return Err(ClamdError::InvalidArgument(format!(
            "chunk size {} exceeds u32 length prefix",
            chunk_size
        )));
    }

    let mut chunks = Vec::with_capacity(payload.len().div_ceil(chunk_size) + 1);
    for slice in payload.chunks(chunk_size) {
        chunks.push(Chunk::new(slice)?);
    }
    chunks.push(Chunk::terminator());

    Ok(chunks)
}

/// Parsing state for [`ChunkBuffer`].
#[derive(Debug, Clone, Copy)]
enum State {
    /// Need 4 bytes of length prefix.
    WaitingForLength,
    /// Prefix parsed, waiting for payload bytes.
    WaitingForPayload { len: u32 },
    /// Terminator seen; no more chunks may follow.
    Finished,
}

/// Incremental decoder for a chunk stream.
///
/// Feed it bytes as they arrive; it hands back every complete chunk,
/// including the terminator.
pub struct ChunkBuffer {
    buffer: BytesMut,
    state: State,
    max_chunk_size: u32,
}

impl ChunkBuffer {
    /// Create a decoder with the default chunk size limit.
    pub fn new() -> Self {
        Self::with_max_chunk_size(DEFAULT_MAX_CHUNK_SIZE)
    }

    /// Create a decoder that rejects chunks larger than `max_chunk_size`.
    pub fn with_max_chunk_size(max_chunk_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8 * 1024),
            state: State::WaitingForLength,
            max_chunk_size,
        }
    }

    /// Push data and extract all complete chunks.
    ///
    /// # Errors
    ///
    /// `Protocol` if a chunk exceeds the size limit or data follows the
    /// terminator.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Chunk>> {
        self.buffer.extend_from_slice(data);

        let mut chunks = Vec::new();
        while let Some(chunk) = self.try_extract_one()? {
            chunks.push(chunk);
        }

        Ok(chunks)
    }

    fn try_extract_one(&mut self) -> Result<Option<Chunk>> {
        match self.state {
            State::Finished => {
                if self.buffer.is_empty() {
                    Ok(None)
                } else {
                    Err(ClamdError::Protocol(format!(
                        "{} bytes after stream terminator",
                        self.buffer.len()
                    )))
                }
            }

            State::WaitingForLength => {
                if self.buffer.len() < LENGTH_PREFIX_SIZE {
                    return Ok(None);
                }

                let len = u32::from_be_bytes([
                    self.buffer[0],
                    self.buffer[1],
                    self.buffer[2],
                    self.buffer[3],
                ]);
                if len > self.max_chunk_size {
                    return Err(ClamdError::Protocol(format!(
                        "Chunk size {} exceeds maximum {}",
                        len, self.max_chunk_size
                    )));
                }

                let _ = self.buffer.split_to(LENGTH_PREFIX_SIZE);

                if len == 0 {
                    self.state = State::Finished;
                    return Ok(Some(Chunk::terminator()));
                }

                self.state = State::WaitingForPayload { len };
                self.try_extract_one()
            }

            State::WaitingForPayload { len } => {
                let len_usize = len as usize;
                if self.buffer.len() < len_usize {
                    return Ok(None);
                }

                let mut wire = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + len_usize);
                wire.put_u32(len);
                wire.extend_from_slice(&self.buffer.split_to(len_usize));

                self.state = State::WaitingForLength;
                Ok(Some(Chunk {
                    wire: wire.freeze(),
                }))
            }
        }
    }

    /// Whether the terminator has been decoded.
    pub fn is_finished(&self) -> bool {
        matches!(self.state, State::Finished)
    }

    /// Number of buffered, not yet decoded bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if no undecoded bytes are buffered.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match self.state {
            State::WaitingForLength => "WaitingForLength",
            State::WaitingForPayload { .. } => "WaitingForPayload",
            State::Finished => "Finished",
        }
    }
}

impl Default for ChunkBuffer {
    fn default() -> Self {
        Self::new()
    }
}

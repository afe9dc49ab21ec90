//! Protocol module - command encoding and chunk framing.
//!
//! This module implements the client side of the clamd wire format:
//! - Command headers (`n<NAME>\n`, `n<NAME> <ARG>\n`, `z<NAME>\0`)
//! - Length-prefixed chunk stream for `INSTREAM`
//! - Incremental chunk decoder

mod chunk;
mod command;

pub use chunk::{
    encode_chunks, Chunk, ChunkBuffer, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_CHUNK_SIZE,
    LENGTH_PREFIX_SIZE,
};
pub use command::{Command, CommandKind, Encoding};

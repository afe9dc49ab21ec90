//! Command encoding.
//!
//! Every supported command uses one of three wire forms:
//! ```text
//! Simple           n<NAME>\n
//! WithArgument     n<NAME> <ARG>\n
//! Streaming        z<NAME>\0  followed by a chunk stream
//! ```

use std::fmt;
use std::io::Read;
use std::str::FromStr;

use bytes::Bytes;

use super::chunk::{encode_chunks, Chunk};
use crate::error::{ClamdError, Result};

/// Wire form used by a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// `n<NAME>\n`, no body.
    Simple,
    /// `n<NAME> <ARG>\n`, no body.
    WithArgument,
    /// `z<NAME>\0` plus a chunked body.
    Streaming,
}

/// Command identifiers understood by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Ping,
    Version,
    Reload,
    Scan,
    Multiscan,
    Contscan,
    Allmatchscan,
    Instream,
    Stats,
    VersionCommands,
    IdSession,
    End,
    Shutdown,
}

impl CommandKind {
    /// Every supported identifier.
    pub const ALL: [CommandKind; 13] = [
        CommandKind::Ping,
        CommandKind::Version,
        CommandKind::Reload,
        CommandKind::Scan,
        CommandKind::Multiscan,
        CommandKind::Contscan,
        CommandKind::Allmatchscan,
        CommandKind::Instream,
        CommandKind::Stats,
        CommandKind::VersionCommands,
        CommandKind::IdSession,
        CommandKind::End,
        CommandKind::Shutdown,
    ];

    /// Name as sent on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Ping => "PING",
            CommandKind::Version => "VERSION",
            CommandKind::Reload => "RELOAD",
            CommandKind::Scan => "SCAN",
            CommandKind::Multiscan => "MULTISCAN",
            CommandKind::Contscan => "CONTSCAN",
            CommandKind::Allmatchscan => "ALLMATCHSCAN",
            CommandKind::Instream => "INSTREAM",
            CommandKind::Stats => "STATS",
            CommandKind::VersionCommands => "VERSIONCOMMANDS",
            CommandKind::IdSession => "IDSESSION",
            CommandKind::End => "END",
            CommandKind::Shutdown => "SHUTDOWN",
        }
    }

    /// Wire form for this command.
    pub fn encoding(&self) -> Encoding {
        match self {
            CommandKind::Scan
            | CommandKind::Multiscan
            | CommandKind::Contscan
            | CommandKind::Allmatchscan => Encoding::WithArgument,
            CommandKind::Instream => Encoding::Streaming,
            _ => Encoding::Simple,
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandKind {
    type Err = ClamdError;

    fn from_str(s: &str) -> Result<Self> {
        CommandKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ClamdError::UnknownCommand(s.to_string()))
    }
}

/// A fully encoded command, ready to be written.
///
/// Immutable once built. Cloning is cheap: header and chunks share their
/// buffers, so a retried exchange re-sends the same bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    kind: CommandKind,
    header: Bytes,
    body: Vec<Chunk>,
}

impl Command {
    /// Build a command from its wire name.
    ///
    /// `arg` is required for scan-style commands and refused by the others.
    /// For the streaming command the whole `body` is read before returning;
    /// a missing body streams zero bytes. The argument is embedded verbatim.
    ///
    /// # Errors
    ///
    /// - `UnknownCommand` if `name` is not supported
    /// - `InvalidArgument` if `arg` presence does not match the command or
    ///   `chunk_size` is zero
    /// - `Io` if the body cannot be read to the end
    pub fn build(
        name: &str,
        arg: Option<&str>,
        body: Option<&mut dyn Read>,
        chunk_size: usize,
    ) -> Result<Self> {
        let kind: CommandKind = name.parse()?;

        match kind.encoding() {
            Encoding::Simple => {
                if arg.is_some() {
                    return Err(ClamdError::InvalidArgument(format!(
                        "{} takes no argument",
                        kind
                    )));
                }
                Ok(Self::simple(kind))
            }
            Encoding::WithArgument => {
                let arg = arg.ok_or_else(|| {
                    ClamdError::InvalidArgument(format!("{} requires an argument", kind))
                })?;
                Ok(Self::with_argument(kind, arg))
            }
            Encoding::Streaming => {
                let mut payload = Vec::new();
                if let Some(reader) = body {
                    reader.read_to_end(&mut payload)?;
                }
                Self::streaming(kind, &payload, chunk_size)
            }
        }
    }

    /// `n<NAME>\n`.
    pub(crate) fn simple(kind: CommandKind) -> Self {
        Self {
            kind,
            header: Bytes::from(format!("n{}\n", kind)),
            body: Vec::new(),
        }
    }

    /// `n<NAME> <ARG>\n`.
    pub(crate) fn with_argument(kind: CommandKind, arg: &str) -> Self {
        Self {
            kind,
            header: Bytes::from(format!("n{} {}\n", kind, arg)),
            body: Vec::new(),
        }
    }

    /// `z<NAME>\0` followed by `payload` split into chunks.
    pub(crate) fn streaming(kind: CommandKind, payload: &[u8], chunk_size: usize) -> Result<Self> {
        let body = encode_chunks(payload, chunk_size)?;
        Ok(Self {
            kind,
            header: Bytes::from(format!("z{}\0", kind)),
            body,
        })
    }

    /// Streaming command over an in-memory payload.
    pub fn instream(payload: &[u8], chunk_size: usize) -> Result<Self> {
        Self::streaming(CommandKind::Instream, payload, chunk_size)
    }

    /// Command identifier.
    #[inline]
    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    /// Opening line or streaming header.
    #[inline]
    pub fn header(&self) -> &[u8] {
        &self.header
    }

    /// Body chunks; empty for non-streaming commands.
    #[inline]
    pub fn body(&self) -> &[Chunk] {
        &self.body
    }

    /// Total bytes this command puts on the wire.
    pub fn wire_len(&self) -> usize {
        self.header.len() + self.body.iter().map(Chunk::wire_len).sum::<usize>()
    }

    /// Header followed by every chunk, in write order.
    pub fn segments(&self) -> impl Iterator<Item = Bytes> + '_ {
        std::iter::once(self.header.clone()).chain(self.body.iter().map(Chunk::wire_bytes))
    }
}

//! Error types for clamd-client.

use std::fmt;
use std::io;

use thiserror::Error;

/// Point in an exchange where a transport failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStage {
    /// Establishing the connection (including the TLS handshake).
    Dial,
    /// Writing the command header or a body chunk.
    Write,
    /// Reading the response.
    Read,
}

impl fmt::Display for TransportStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportStage::Dial => "dial",
            TransportStage::Write => "write",
            TransportStage::Read => "read",
        };
        f.write_str(s)
    }
}

/// Main error type for all clamd operations.
#[derive(Debug, Error)]
pub enum ClamdError {
    /// Malformed call (bad chunk size, empty scan path, ...).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Command identifier outside the supported set.
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// The command body could not be read.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Dial, write or read failure on the connection.
    #[error("Transport error during {stage}: {source}")]
    Transport {
        /// Where in the exchange the failure happened.
        stage: TransportStage,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The caller cancelled the call or its deadline elapsed.
    #[error("Cancelled")]
    Cancelled,

    /// Response does not have the expected shape.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Options could not be parsed or failed validation.
    #[error("Config error: {0}")]
    Config(String),
}

impl ClamdError {
    /// Build a transport error for the given stage.
    pub fn transport(stage: TransportStage, source: io::Error) -> Self {
        ClamdError::Transport { stage, source }
    }

    /// Build a transport timeout for the given stage.
    pub fn timed_out(stage: TransportStage) -> Self {
        ClamdError::Transport {
            stage,
            source: io::Error::new(io::ErrorKind::TimedOut, format!("{} timed out", stage)),
        }
    }

    /// Whether the retry controller may try the command again.
    ///
    /// Dial and write failures are always transient. Read failures are only
    /// retried when the peer dropped the connection; a read timeout means
    /// the daemon may still be working on the command.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClamdError::Transport { stage, source } => match stage {
                TransportStage::Dial | TransportStage::Write => true,
                TransportStage::Read => matches!(
                    source.kind(),
                    io::ErrorKind::ConnectionReset
                        | io::ErrorKind::ConnectionAborted
                        | io::ErrorKind::BrokenPipe
                ),
            },
            _ => false,
        }
    }
}

impl From<serde_json::Error> for ClamdError {
    fn from(err: serde_json::Error) -> Self {
        ClamdError::Config(err.to_string())
    }
}

/// Result type alias using ClamdError.
pub type Result<T> = std::result::Result<T, ClamdError>;

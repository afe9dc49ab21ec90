//! # clamd-client
//!
//! Async Rust client for the clamd command protocol.
//!
//! Commands are short text lines (`nPING\n`, `nSCAN /path\n`, ...) sent over
//! TCP, a Unix socket, or TLS. `INSTREAM` uploads a payload as a sequence of
//! length-prefixed chunks closed by a zero-length chunk.
//!
//! ## Architecture
//!
//! - **Protocol**: command encoding and chunk framing, no I/O
//! - **Transport**: one fresh connection per call
//! - **Exchange**: write command, read response to EOF, cancellable
//! - **Retry**: bounded attempts with exponential backoff
//!
//! ## Example
//!
//! ```ignore
//! use clamd_client::Clamd;
//!
//! #[tokio::main]
//! async fn main() {
//!     let clamd = Clamd::builder()
//!         .unix("/var/run/clamav/clamd.ctl")
//!         .build()
//!         .unwrap();
//!
//!     let reply = clamd.ping().await.unwrap();
//!     assert!(reply.raw.starts_with("PONG"));
//! }
//! ```

pub mod error;
pub mod exchange;
pub mod options;
pub mod protocol;
pub mod retry;
pub mod transport;

mod client;
mod commands;

pub use client::{Clamd, ClamdBuilder};
pub use commands::{Reply, ScanReport, ScanResult, Verdict};
pub use error::{ClamdError, TransportStage};
pub use exchange::Interrupt;
pub use options::{Network, Options, RetryPolicy};
pub use protocol::{Command, CommandKind};
pub use retry::Response;

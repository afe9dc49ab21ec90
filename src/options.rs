//! Client configuration.
//!
//! [`Options`] is supplied once when the client is built and shared
//! read-only by every exchange. It can be filled in from code or parsed
//! from JSON; durations are given in milliseconds. A timeout of zero means
//! no timeout:
//!
//! ```
//! use clamd_client::options::{Network, Options};
//!
//! let opts = Options::from_json(r#"{
//!     "network": "tcp",
//!     "address": "127.0.0.1:3310",
//!     "read_timeout": 60000,
//!     "max_retries": 5
//! }"#).unwrap();
//!
//! assert_eq!(opts.network, Network::Tcp);
//! assert_eq!(opts.read_timeout.as_secs(), 60);
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_rustls::rustls::ClientConfig;

use crate::error::{ClamdError, Result};
use crate::protocol::DEFAULT_CHUNK_SIZE;
use crate::transport::OnConnect;

/// Default socket of a packaged daemon.
pub const DEFAULT_ADDRESS: &str = "/var/run/clamav/clamd.ctl";

/// Default connect timeout.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Default read/write timeout.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of attempts per call.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default first backoff delay.
pub const DEFAULT_MIN_RETRY_BACKOFF: Duration = Duration::from_millis(8);

/// Default backoff ceiling.
pub const DEFAULT_MAX_RETRY_BACKOFF: Duration = Duration::from_millis(512);

/// Default ceiling on an accumulated response (64 MiB).
pub const DEFAULT_MAX_RESPONSE_SIZE: usize = 64 * 1024 * 1024;

/// Transport used to reach the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Network {
    /// Plain TCP, `address` is `host:port`.
    #[serde(rename = "tcp")]
    Tcp,
    /// Unix domain socket, `address` is a filesystem path.
    #[serde(rename = "unix")]
    Unix,
    /// TCP wrapped in TLS.
    #[serde(rename = "tcp+tls")]
    TcpTls,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Network::Tcp => "tcp",
            Network::Unix => "unix",
            Network::TcpTls => "tcp+tls",
        };
        f.write_str(s)
    }
}

/// Connection and retry settings.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Transport family.
    pub network: Network,
    /// `host:port` or socket path.
    pub address: String,
    /// Connect (and TLS handshake) timeout; zero waits indefinitely.
    #[serde(with = "millis")]
    pub dial_timeout: Duration,
    /// Idle timeout between response reads; zero reads until EOF.
    #[serde(with = "millis")]
    pub read_timeout: Duration,
    /// Timeout for each header/chunk write; zero waits indefinitely.
    #[serde(with = "millis")]
    pub write_timeout: Duration,
    /// Upper bound on attempts per call (at least one attempt is made).
    pub max_retries: u32,
    /// Delay before the second attempt.
    #[serde(with = "millis")]
    pub min_retry_backoff: Duration,
    /// Ceiling for the doubling backoff.
    #[serde(with = "millis")]
    pub max_retry_backoff: Duration,
    /// Payload bytes per `INSTREAM` chunk.
    pub chunk_size: usize,
    /// Responses larger than this are rejected.
    pub max_response_size: usize,
    /// Name checked against the server certificate. Defaults to the host
    /// part of `address`.
    pub tls_server_name: Option<String>,
    /// TLS settings for [`Network::TcpTls`].
    #[serde(skip)]
    pub tls_config: Option<Arc<ClientConfig>>,
    /// Called with every connection right after it is dialed.
    #[serde(skip)]
    pub on_connect: Option<OnConnect>,
}

impl Options {
    /// Options for a TCP daemon at `addr`.
    pub fn tcp(addr: impl Into<String>) -> Self {
        Self {
            network: Network::Tcp,
            address: addr.into(),
            ..Self::default()
        }
    }

    /// Options for a daemon listening on a Unix socket.
    pub fn unix(path: impl Into<String>) -> Self {
        Self {
            network: Network::Unix,
            address: path.into(),
            ..Self::default()
        }
    }

    /// Options for a TLS-wrapped TCP daemon.
    pub fn tls(addr: impl Into<String>, config: Arc<ClientConfig>) -> Self {
        Self {
            network: Network::TcpTls,
            address: addr.into(),
            tls_config: Some(config),
            ..Self::default()
        }
    }

    /// Parse options from a JSON document and validate them.
    pub fn from_json(json: &str) -> Result<Self> {
        let opts: Options = serde_json::from_str(json)?;
        opts.validate()?;
        Ok(opts)
    }

    /// Check the options for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.address.is_empty() {
            return Err(ClamdError::Config("address must not be empty".to_string()));
        }

        if self.chunk_size == 0 {
            return Err(ClamdError::Config(
                "chunk_size must be positive".to_string(),
            ));
        }

        if u32::try_from(self.chunk_size).is_err() {
            return Err(ClamdError::Config(format!(
                "chunk_size {} exceeds u32 length prefix",
                self.chunk_size
            )));
        }

        if self.min_retry_backoff > self.max_retry_backoff {
            return Err(ClamdError::Config(format!(
                "min_retry_backoff {:?} exceeds max_retry_backoff {:?}",
                self.min_retry_backoff, self.max_retry_backoff
            )));
        }

        if self.network == Network::TcpTls && self.tls_config.is_none() {
            return Err(ClamdError::Config(
                "tcp+tls network requires a TLS config".to_string(),
            ));
        }

        Ok(())
    }

    /// Retry bounds taken from these options.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            min_backoff: self.min_retry_backoff,
            max_backoff: self.max_retry_backoff,
        }
    }
}

impl Default for Options {
    fn default() -> Self {
        Self {
            network: Network::Unix,
            address: DEFAULT_ADDRESS.to_string(),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            read_timeout: DEFAULT_IO_TIMEOUT,
            write_timeout: DEFAULT_IO_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            min_retry_backoff: DEFAULT_MIN_RETRY_BACKOFF,
            max_retry_backoff: DEFAULT_MAX_RETRY_BACKOFF,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_response_size: DEFAULT_MAX_RESPONSE_SIZE,
            tls_server_name: None,
            tls_config: None,
            on_connect: None,
        }
    }
}

// Neither rustls::ClientConfig nor the hook has useful Debug output.
impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("network", &self.network)
            .field("address", &self.address)
            .field("dial_timeout", &self.dial_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("max_retries", &self.max_retries)
            .field("min_retry_backoff", &self.min_retry_backoff)
            .field("max_retry_backoff", &self.max_retry_backoff)
            .field("chunk_size", &self.chunk_size)
            .field("max_response_size", &self.max_response_size)
            .field("tls_server_name", &self.tls_server_name)
            .field("tls", &self.tls_config.is_some())
            .field("on_connect", &self.on_connect.is_some())
            .finish()
    }
}

/// Retry bounds for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Upper bound on attempts (treated as at least one).
    pub max_retries: u32,
    /// Delay before the second attempt.
    pub min_backoff: Duration,
    /// Ceiling for the doubling delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Options::default().retry_policy()
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

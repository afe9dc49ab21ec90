//! Client builder and command dispatch.
//!
//! The [`ClamdBuilder`] provides a fluent API for configuring the
//! connection. The [`Clamd`] client is built once and shared by reference
//! (or cheaply cloned); every call:
//! 1. Encodes the command
//! 2. Opens a fresh connection
//! 3. Writes the command and reads the response
//! 4. Retries transient transport failures with backoff
//!
//! # Example
//!
//! ```ignore
//! use clamd_client::Clamd;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let clamd = Clamd::builder()
//!         .tcp("127.0.0.1:3310")
//!         .max_retries(5)
//!         .build()?;
//!
//!     let reply = clamd.version().await?;
//!     println!("{}", reply.raw);
//!     Ok(())
//! }
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio_rustls::rustls::ClientConfig;

use crate::error::Result;
use crate::exchange::{exchange, ExchangeConfig, Interrupt};
use crate::options::{Network, Options, RetryPolicy};
use crate::protocol::Command;
use crate::retry::{do_with_retry, Response};
use crate::transport::{Connection, Connector, Dialer};

/// Builder for configuring and creating a [`Clamd`] client.
#[derive(Debug, Clone, Default)]
pub struct ClamdBuilder {
    options: Options,
}

impl ClamdBuilder {
    /// Create a builder with default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from existing options.
    pub fn from_options(options: Options) -> Self {
        Self { options }
    }

    /// Connect over TCP to `host:port`.
    pub fn tcp(mut self, addr: impl Into<String>) -> Self {
        self.options.network = Network::Tcp;
        self.options.address = addr.into();
        self
    }

    /// Connect over a Unix domain socket.
    pub fn unix(mut self, path: impl Into<String>) -> Self {
        self.options.network = Network::Unix;
        self.options.address = path.into();
        self
    }

    /// Connect over TLS-wrapped TCP to `host:port`.
    pub fn tls(mut self, addr: impl Into<String>, config: Arc<ClientConfig>) -> Self {
        self.options.network = Network::TcpTls;
        self.options.address = addr.into();
        self.options.tls_config = Some(config);
        self
    }

    /// Override the name checked against the server certificate.
    pub fn tls_server_name(mut self, name: impl Into<String>) -> Self {
        self.options.tls_server_name = Some(name.into());
        self
    }

    /// Set the connect timeout.
    ///
    /// Default: 5 seconds
    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.options.dial_timeout = timeout;
        self
    }

    /// Set the idle read timeout.
    ///
    /// Default: 30 seconds
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.options.read_timeout = timeout;
        self
    }

    /// Set the per-write timeout.
    ///
    /// Default: 30 seconds
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.options.write_timeout = timeout;
        self
    }

    /// Set the maximum number of attempts per call.
    ///
    /// Default: 3
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.options.max_retries = max_retries;
        self
    }

    /// Set the backoff bounds between attempts.
    ///
    /// Default: 8 ms doubling up to 512 ms
    pub fn retry_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.options.min_retry_backoff = min;
        self.options.max_retry_backoff = max;
        self
    }

    /// Set the `INSTREAM` chunk size.
    ///
    /// Default: 1024 bytes
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.options.chunk_size = chunk_size;
        self
    }

    /// Set the largest accepted response.
    ///
    /// Default: 64 MiB
    pub fn max_response_size(mut self, limit: usize) -> Self {
        self.options.max_response_size = limit;
        self
    }

    /// Run `hook` on every connection right after it is dialed.
    ///
    /// Not used by [`build_with_connector`](Self::build_with_connector).
    pub fn on_connect<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        self.options.on_connect = Some(Arc::new(hook));
        self
    }

    /// Build a client that dials according to the options.
    pub fn build(self) -> Result<Clamd<Dialer>> {
        let dialer = Dialer::new(&self.options)?;
        Clamd::with_connector(self.options, dialer)
    }

    /// Build a client that obtains connections from `connector`.
    ///
    /// Network, address, TLS settings and the connect hook are ignored;
    /// timeouts, retry bounds and chunk size still apply.
    pub fn build_with_connector<C: Connector>(self, connector: C) -> Result<Clamd<C>> {
        Clamd::with_connector(self.options, connector)
    }
}

/// A clamd client.
///
/// Holds no connection between calls; each call dials its own. Clones share
/// the same options and connector.
pub struct Clamd<C: Connector = Dialer> {
    connector: Arc<C>,
    options: Arc<Options>,
    exchange_config: ExchangeConfig,
    policy: RetryPolicy,
    interrupt: Interrupt,
}

impl Clamd<Dialer> {
    /// Create a new client builder.
    pub fn builder() -> ClamdBuilder {
        ClamdBuilder::new()
    }

    /// Build a client straight from options.
    pub fn new(options: Options) -> Result<Self> {
        ClamdBuilder::from_options(options).build()
    }
}

impl<C: Connector> Clamd<C> {
    /// Build a client over a custom connector.
    pub fn with_connector(options: Options, connector: C) -> Result<Self> {
        options.validate()?;

        Ok(Self {
            connector: Arc::new(connector),
            exchange_config: ExchangeConfig::from(&options),
            policy: options.retry_policy(),
            options: Arc::new(options),
            interrupt: Interrupt::new(),
        })
    }

    /// A handle whose calls are cancelled by `interrupt`.
    ///
    /// ```ignore
    /// let token = CancellationToken::new();
    /// let scoped = clamd.with_interrupt(Interrupt::from_token(token.clone()));
    /// let reply = scoped.multiscan("/srv/uploads").await;
    /// ```
    pub fn with_interrupt(&self, interrupt: Interrupt) -> Self {
        Self {
            interrupt,
            ..self.clone()
        }
    }

    /// Options this client was built with.
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Interrupt applied to calls on this handle.
    pub fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }

    /// Send `cmd`, retrying transient failures, and return the raw response.
    pub async fn do_command(&self, cmd: Command) -> Result<Response> {
        self.do_command_with(&cmd, &self.interrupt).await
    }

    /// Like [`do_command`](Self::do_command) with an explicit interrupt.
    pub async fn do_command_with(&self, cmd: &Command, interrupt: &Interrupt) -> Result<Response> {
        let connector = self.connector.as_ref();
        let config = &self.exchange_config;

        let response = do_with_retry(&self.policy, interrupt, |attempt| {
            tracing::trace!("{} attempt {}", cmd.kind(), attempt);
            exchange(cmd, connector, config, interrupt)
        })
        .await?;

        tracing::debug!(
            "{} answered with {} bytes after {} attempt(s)",
            cmd.kind(),
            response.body.len(),
            response.attempts
        );
        Ok(response)
    }
}

impl<C: Connector> Clone for Clamd<C> {
    fn clone(&self) -> Self {
        Self {
            connector: self.connector.clone(),
            options: self.options.clone(),
            exchange_config: self.exchange_config,
            policy: self.policy,
            interrupt: self.interrupt.clone(),
        }
    }
}

impl<C: Connector> fmt::Debug for Clamd<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clamd")
            .field("options", &self.options)
            .field("interrupt", &self.interrupt)
            .finish_non_exhaustive()
    }
}

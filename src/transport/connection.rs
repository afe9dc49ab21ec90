//! Connection establishment.
//!
//! - TCP: `host:port`
//! - Unix: socket path (Unix platforms only)
//! - TLS: `host:port`, handshake via `tokio-rustls`
//!
//! # Example
//!
//! ```ignore
//! use clamd_client::options::Options;
//! use clamd_client::transport::{Connector, Dialer};
//!
//! let dialer = Dialer::new(&Options::tcp("127.0.0.1:3310"))?;
//! let conn = dialer.connect().await?;
//! ```

use std::fmt;
use std::future::Future;
use std::io::{self, IoSlice};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

use crate::error::{ClamdError, Result, TransportStage};
use crate::exchange::bounded;
use crate::options::{Network, Options};

/// Boxed future for connector results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Hook run on every freshly dialed connection.
pub type OnConnect = Arc<dyn Fn(&Connection) + Send + Sync>;

/// Factory for fresh connections, one per exchange.
pub trait Connector: Send + Sync + 'static {
    /// Stream handed to the exchange engine.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Open a new connection.
    ///
    /// Failures should be reported as `Transport { stage: Dial, .. }`.
    fn connect(&self) -> BoxFuture<'_, Result<Self::Stream>>;
}

/// An open transport stream.
pub enum Connection {
    /// Plain TCP.
    Tcp(TcpStream),
    /// Unix Domain Socket.
    #[cfg(unix)]
    Unix(UnixStream),
    /// TLS over TCP.
    Tls(Box<TlsStream<TcpStream>>),
}

impl Connection {
    /// Transport family of this connection.
    pub fn network(&self) -> Network {
        match self {
            Connection::Tcp(_) => Network::Tcp,
            #[cfg(unix)]
            Connection::Unix(_) => Network::Unix,
            Connection::Tls(_) => Network::TcpTls,
        }
    }

    /// Shut the stream down gracefully.
    ///
    /// Dropping a `Connection` closes it as well; this additionally sends
    /// TLS close_notify where applicable.
    pub async fn close(mut self) -> io::Result<()> {
        self.shutdown().await
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Connection").field(&self.network()).finish()
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            Connection::Unix(s) => Pin::new(s).poll_read(cx, buf),
            Connection::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Connection::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            Connection::Unix(s) => Pin::new(s).poll_write(cx, buf),
            Connection::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Connection::Tcp(s) => Pin::new(s).poll_write_vectored(cx, bufs),
            #[cfg(unix)]
            Connection::Unix(s) => Pin::new(s).poll_write_vectored(cx, bufs),
            Connection::Tls(s) => Pin::new(s.as_mut()).poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            Connection::Tcp(s) => s.is_write_vectored(),
            #[cfg(unix)]
            Connection::Unix(s) => s.is_write_vectored(),
            Connection::Tls(s) => s.is_write_vectored(),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            Connection::Unix(s) => Pin::new(s).poll_flush(cx),
            Connection::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            Connection::Unix(s) => Pin::new(s).poll_shutdown(cx),
            Connection::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// TLS material resolved once at construction.
#[derive(Clone)]
struct TlsSetup {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

/// Default [`Connector`]: dials the network and address from [`Options`].
#[derive(Clone)]
pub struct Dialer {
    network: Network,
    address: String,
    dial_timeout: Duration,
    tls: Option<TlsSetup>,
    on_connect: Option<OnConnect>,
}

impl Dialer {
    /// Build a dialer from validated options.
    ///
    /// # Errors
    ///
    /// `Config` if the options are inconsistent or the TLS server name is
    /// not a valid DNS name or IP address.
    pub fn new(options: &Options) -> Result<Self> {
        options.validate()?;

        let tls = match (options.network, &options.tls_config) {
            (Network::TcpTls, Some(config)) => {
                let name = options
                    .tls_server_name
                    .clone()
                    .unwrap_or_else(|| host_part(&options.address).to_string());
                let server_name = ServerName::try_from(name.clone()).map_err(|e| {
                    ClamdError::Config(format!("invalid TLS server name {:?}: {}", name, e))
                })?;
                Some(TlsSetup {
                    connector: TlsConnector::from(config.clone()),
                    server_name,
                })
            }
            _ => None,
        };

        Ok(Self {
            network: options.network,
            address: options.address.clone(),
            dial_timeout: options.dial_timeout,
            tls,
            on_connect: options.on_connect.clone(),
        })
    }

    /// Transport family this dialer uses.
    pub fn network(&self) -> Network {
        self.network
    }

    /// Address this dialer connects to.
    pub fn address(&self) -> &str {
        &self.address
    }

    async fn dial(&self) -> Result<Connection> {
        let dial_err = |e| ClamdError::transport(TransportStage::Dial, e);

        match self.network {
            Network::Tcp => {
                let stream = TcpStream::connect(&self.address).await.map_err(dial_err)?;
                stream.set_nodelay(true).map_err(dial_err)?;
                Ok(Connection::Tcp(stream))
            }

            #[cfg(unix)]
            Network::Unix => {
                let stream = UnixStream::connect(&self.address)
                    .await
                    .map_err(dial_err)?;
                Ok(Connection::Unix(stream))
            }

            #[cfg(not(unix))]
            Network::Unix => Err(dial_err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix sockets are not available on this platform",
            ))),

            Network::TcpTls => {
                let tls = self.tls.as_ref().ok_or_else(|| {
                    ClamdError::Config("tcp+tls network requires a TLS config".to_string())
                })?;
                let stream = TcpStream::connect(&self.address).await.map_err(dial_err)?;
                stream.set_nodelay(true).map_err(dial_err)?;
                let stream = tls
                    .connector
                    .connect(tls.server_name.clone(), stream)
                    .await
                    .map_err(dial_err)?;
                Ok(Connection::Tls(Box::new(stream)))
            }
        }
    }
}

impl fmt::Debug for Dialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dialer")
            .field("network", &self.network)
            .field("address", &self.address)
            .field("dial_timeout", &self.dial_timeout)
            .field("tls", &self.tls.is_some())
            .field("on_connect", &self.on_connect.is_some())
            .finish()
    }
}

impl Connector for Dialer {
    type Stream = Connection;

    fn connect(&self) -> BoxFuture<'_, Result<Connection>> {
        Box::pin(async move {
            match bounded(self.dial_timeout, self.dial()).await {
                Some(Ok(conn)) => {
                    tracing::debug!("Connected to {} via {}", self.address, self.network);
                    if let Some(hook) = &self.on_connect {
                        hook(&conn);
                    }
                    Ok(conn)
                }
                Some(Err(e)) => {
                    tracing::debug!("Dial {} failed: {}", self.address, e);
                    Err(e)
                }
                None => {
                    tracing::debug!(
                        "Dial {} timed out after {:?}",
                        self.address,
                        self.dial_timeout
                    );
                    Err(ClamdError::timed_out(TransportStage::Dial))
                }
            }
        })
    }
}

/// Host portion of `host:port`, without IPv6 brackets.
fn host_part(address: &str) -> &str {
    let host = match address.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => address,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}

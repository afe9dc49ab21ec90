//! Transport module - connections to the daemon.
//!
//! Provides:
//! - [`Connection`] over TCP, Unix Domain Sockets, or TLS-wrapped TCP
//! - [`Connector`], the connection factory seam used by the exchange engine
//! - [`Dialer`], the connector built from [`Options`](crate::options::Options)

mod connection;

pub use connection::{BoxFuture, Connection, Connector, Dialer, OnConnect};

//! Edge API gateway routing HTTP requests to functions and services.
//!
//! Inbound requests are classified by path (and optionally by `Host`) into
//! one of two kinds of back end:
//!
//! - short-lived **functions**, invoked with a unary gRPC call
//!   (`faas.Function/Call`) over a cached channel;
//! - long-running **services**, reached by proxying the HTTP request.
//!
//! A logical service name becomes a network address through a [`Resolver`].
//! In orchestrated deployments the resolver composes a DNS-style
//! `<service>.<namespace>` name. In native deployments it reads a port
//! mapping file, follows changes to it, and round-robins over the ports
//! listed for each service.
//!
//! The [`ConnectionManager`] keeps one outbound connection per address,
//! created on first use and re-created on request after transient failures.
//! The [`Dispatcher`] ties everything together and runs the
//! resolve/connect/call retry loop.
//!
//! ```no_run
//! use function_gateway::{Gateway, GatewayConfig, RuntimeContext};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = GatewayConfig::default();
//! let ctx = RuntimeContext::from_env()?;
//! let gateway = Gateway::new(config, ctx)?;
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//! function_gateway::server::serve(
//!     listener,
//!     None,
//!     gateway.dispatcher(),
//!     async { let _ = tokio::signal::ctrl_c().await; },
//! )
//! .await;
//! gateway.close();
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **metrics**: Export Prometheus counters about calls, retries and
//!   connections. Enabled by default.

#![warn(missing_docs)]

#[cfg(test)]
#[macro_use]
extern crate assert_matches;

use http::Uri;
use std::future::Future;
use tokio::io::{AsyncRead, AsyncWrite};

/// A constructor for the streaming byte IO channel over which outbound
/// gRPC connections are built.
///
/// The connector is given the URI of the back end (scheme, host and port)
/// and delivers a raw byte IO channel connected to it.
///
/// ```
/// # use std::sync::Arc;
/// // Plaintext:
/// function_gateway::stream::TCPConnector::default();
/// // TLS on top of TCP:
/// # let tls_config = tokio_rustls::rustls::client::ClientConfig::builder()
/// #     .with_root_certificates(tokio_rustls::rustls::RootCertStore::empty())
/// #     .with_no_client_auth();
/// function_gateway::tls::TLSConnector::new(
///     function_gateway::stream::TCPConnector::default(),
///     Some(&tls_config),
///     None,
/// );
/// ```
pub trait Connector {
    /// The type of the byte-based IO channel this Connector will produce
    /// on successful connection.
    type IO: AsyncRead + AsyncWrite + Send + Unpin + 'static;
    /// The type of the error this Connector will produce on failure.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Attempt to asynchronously connect to the authority of `target`.
    ///
    /// The connector should impose a deadline on connection, otherwise a
    /// request may wait indefinitely for an unreachable back end.
    fn connect(
        &self,
        target: &Uri,
    ) -> impl Future<Output = Result<Self::IO, Self::Error>> + Send + 'static;
}

/// Creates connection handles for addresses.
///
/// Dialing is synchronous and must not wait on the network: the returned
/// handle connects lazily on first use. This keeps the
/// [`ConnectionManager`] creation lock free of network waits.
pub trait Dialer: Send + Sync {
    /// A cheaply cloneable handle to a connection.
    type Connection: Clone + Send + Sync + 'static;
    /// The error returned when a handle cannot be created or closed.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Create a connection handle for `address`.
    fn dial(&self, address: &str) -> Result<Self::Connection, Self::Error>;

    /// Release a connection handle. The default drops it.
    fn close(&self, address: &str, connection: Self::Connection) -> Result<(), Self::Error> {
        let _ = (address, connection);
        Ok(())
    }
}

/// Something that can carry a function invocation to a back end.
pub trait Invoker {
    /// Send one invocation and wait for its response.
    ///
    /// Dropping the returned future cancels the call.
    fn invoke(
        &self,
        request: proto::Message,
    ) -> impl Future<Output = Result<proto::Message, tonic::Status>> + Send + 'static;
}

pub mod config;
pub mod dispatcher;
mod gateway;
pub mod grpc;
pub mod http_client;
pub mod manager;
pub mod mapping;
pub mod metadata;
#[cfg(feature = "metrics")]
mod metrics;
pub mod port;
pub mod proto;
pub mod resolver;
pub mod response;
pub mod server;
pub mod stream;
#[cfg(test)]
mod testutil;
pub mod tls;

pub use config::{GatewayConfig, RunMode, RuntimeContext};
pub use dispatcher::{DispatchError, Dispatcher};
pub use gateway::{DefaultDialer, Gateway, GatewayError};
pub use manager::ConnectionManager;
pub use resolver::Resolver;

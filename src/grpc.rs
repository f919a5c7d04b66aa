//! gRPC connections to function back ends.
//!
//! [`GrpcDialer`] creates [`tonic`] channels on top of any [`Connector`].
//! Channels connect lazily, so dialing never waits on the network and a
//! back end that is down surfaces as an `Unavailable` call failure, which
//! the dispatcher treats as retryable.
//!
//! ```
//! use function_gateway::grpc::GrpcDialer;
//! use function_gateway::stream::TCPConnector;
//!
//! // Addresses without a port are dialed on 80.
//! let dialer = GrpcDialer::new(TCPConnector::default(), 80);
//! # let _ = dialer;
//! ```

use http::Uri;
use http::uri::Authority;
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use thiserror::Error;
use tonic::transport::{Channel, Endpoint};
use tower_service::Service;

use crate::proto::Message;
use crate::proto::function_client::FunctionClient;
use crate::{Connector, Dialer, Invoker};

/// Error returned by [`GrpcDialer::dial`].
#[derive(Debug, Error)]
pub enum DialError {
    /// The address cannot be turned into an endpoint URI.
    #[error("invalid address {0:?}: {1}")]
    InvalidAddress(String, #[source] tonic::transport::Error),
}

/// Adapts a [`Connector`] to the [`Service<Uri>`] shape tonic expects.
struct ConnectorService<C> {
    connector: Arc<C>,
}

impl<C> Clone for ConnectorService<C> {
    fn clone(&self) -> Self {
        Self {
            connector: Arc::clone(&self.connector),
        }
    }
}

impl<C> Service<Uri> for ConnectorService<C>
where
    C: Connector + Send + Sync + 'static,
{
    type Response = TokioIo<C::IO>;
    type Error = C::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let connect = self.connector.connect(&uri);
        Box::pin(async move { connect.await.map(TokioIo::new) })
    }
}

/// Append `port` to `address` unless it already names one.
pub fn with_default_port(address: &str, port: u16) -> String {
    match address.parse::<Authority>() {
        Ok(a) if a.port_u16().is_none() => format!("{}:{}", address, port),
        _ => address.to_owned(),
    }
}

/// Dials lazily connected [`Channel`]s through a [`Connector`].
pub struct GrpcDialer<C> {
    connector: Arc<C>,
    default_port: u16,
}

impl<C> GrpcDialer<C> {
    /// Create a dialer. Addresses without a port are dialed on
    /// `default_port`.
    pub fn new(connector: C, default_port: u16) -> Self {
        Self {
            connector: Arc::new(connector),
            default_port,
        }
    }
}

impl<C> Dialer for GrpcDialer<C>
where
    C: Connector + Send + Sync + 'static,
{
    type Connection = Channel;
    type Error = DialError;

    /// Must be called from within a tokio runtime.
    fn dial(&self, address: &str) -> Result<Channel, DialError> {
        let target = format!("http://{}", with_default_port(address, self.default_port));
        let endpoint = Endpoint::from_shared(target)
            .map_err(|e| DialError::InvalidAddress(address.to_owned(), e))?;
        Ok(endpoint.connect_with_connector_lazy(ConnectorService {
            connector: Arc::clone(&self.connector),
        }))
    }
}

impl Invoker for Channel {
    fn invoke(
        &self,
        request: Message,
    ) -> impl Future<Output = Result<Message, tonic::Status>> + Send + 'static {
        let mut client = FunctionClient::new(self.clone());
        async move { client.call(request).await.map(tonic::Response::into_inner) }
    }
}

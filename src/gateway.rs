//! Assembly of one gateway instance from configuration.

use std::sync::Arc;
use thiserror::Error;

use crate::config::{GatewayConfig, RuntimeContext};
use crate::dispatcher::Dispatcher;
use crate::grpc::GrpcDialer;
use crate::manager::ConnectionManager;
use crate::resolver::{Resolver, ResolverError};
use crate::stream::TCPConnector;
use crate::tls::{self, TLSConnector, TLSConnectorCreationError, TlsConfigError};
use crate::{Dialer, Invoker};

/// The dialer used outside of tests: gRPC over TCP, with TLS when the
/// client configuration asks for it.
pub type DefaultDialer = GrpcDialer<TLSConnector<TCPConnector>>;

/// Error returned by [`Gateway::new`].
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The resolver could not be built.
    #[error("{0}")]
    Resolver(#[from] ResolverError),
    /// The outbound TLS material could not be loaded.
    #[error("outbound TLS: {0}")]
    Tls(#[from] TlsConfigError),
    /// The outbound TLS settings are unusable.
    #[error("outbound TLS: {0}")]
    Connector(#[from] TLSConnectorCreationError),
}

/// One gateway instance: a resolver, a connection manager and the
/// dispatcher that uses them. Instances share no state.
pub struct Gateway<D: Dialer = DefaultDialer> {
    resolver: Arc<Resolver>,
    manager: Arc<ConnectionManager<D>>,
    dispatcher: Arc<Dispatcher<D>>,
}

impl Gateway<DefaultDialer> {
    /// Assemble a gateway from configuration.
    ///
    /// In native mode this loads the mapping file and starts watching it, so
    /// it must be called from within a tokio runtime.
    pub fn new(config: GatewayConfig, ctx: RuntimeContext) -> Result<Self, GatewayError> {
        let grpc = &config.client.grpc;
        let tls_config = grpc.tls.as_ref().map(tls::client_config).transpose()?;
        let connector = TLSConnector::new(
            TCPConnector::new(grpc.connect_timeout),
            tls_config.as_ref(),
            grpc.tls.as_ref().and_then(|t| t.server_name.as_deref()),
        )?;
        let dialer = GrpcDialer::new(connector, grpc.port);
        Self::with_dialer(config, ctx, dialer)
    }
}

impl<D> Gateway<D>
where
    D: Dialer,
    D::Connection: Invoker,
{
    /// Assemble a gateway that creates connections with `dialer`.
    pub fn with_dialer(
        config: GatewayConfig,
        ctx: RuntimeContext,
        dialer: D,
    ) -> Result<Self, GatewayError> {
        let resolver = Arc::new(Resolver::new(
            ctx.run_mode,
            &ctx.namespace,
            config.native.mapping_file.clone(),
        )?);
        let manager = Arc::new(ConnectionManager::new(dialer, config.client.http.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            &config,
            ctx.namespace,
            Arc::clone(&resolver),
            Arc::clone(&manager),
        ));
        log::info!(
            "gateway: {:?} mode, namespace {:?}",
            ctx.run_mode,
            dispatcher.namespace()
        );
        Ok(Self {
            resolver,
            manager,
            dispatcher,
        })
    }

    /// The request handler, to be given to [`crate::server::serve`].
    pub fn dispatcher(&self) -> Arc<Dispatcher<D>> {
        Arc::clone(&self.dispatcher)
    }

    /// Release connections and stop watching the mapping file. Requests
    /// still in flight fail with an ordinary error.
    pub fn close(&self) {
        self.manager.close();
        self.resolver.close();
        log::info!("gateway: closed");
    }
}

//! Inbound HTTP listener.

use futures::future::{Either, select};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::pin;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use crate::dispatcher::Dispatcher;
use crate::{Dialer, Invoker};

async fn serve_connection<IO, D>(io: IO, peer: SocketAddr, dispatcher: Arc<Dispatcher<D>>)
where
    IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    D: Dialer + 'static,
    D::Connection: Invoker,
{
    let service = service_fn(move |req: http::Request<Incoming>| {
        let dispatcher = Arc::clone(&dispatcher);
        async move { Ok::<_, Infallible>(dispatcher.dispatch(req).await) }
    });
    if let Err(e) = auto::Builder::new(TokioExecutor::new())
        .serve_connection(TokioIo::new(io), service)
        .await
    {
        log::debug!("{}: connection ended with error: {}", peer, e);
    }
}

/// Accept HTTP/1 and HTTP/2 connections on `listener` and hand every request
/// to `dispatcher`, until `shutdown` completes.
///
/// With an acceptor, connections are TLS; a failed handshake only drops
/// that connection. Connections already accepted when `shutdown` completes
/// are left to finish on their own.
pub async fn serve<D>(
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    dispatcher: Arc<Dispatcher<D>>,
    shutdown: impl Future,
) where
    D: Dialer + 'static,
    D::Connection: Invoker,
{
    let local = listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();
    log::info!(
        "{}: serving{}",
        local,
        if tls.is_some() { " with TLS" } else { "" }
    );
    let mut shutdown = pin!(shutdown);
    loop {
        let accepted = match select(shutdown.as_mut(), pin!(listener.accept())).await {
            Either::Left(_) => break,
            Either::Right((r, _)) => r,
        };
        let (stream, peer) = match accepted {
            Ok(a) => a,
            Err(e) => {
                log::warn!("{}: accept failed: {}", local, e);
                continue;
            }
        };
        let _ = stream.set_nodelay(true);
        let dispatcher = Arc::clone(&dispatcher);
        match tls {
            Some(ref acceptor) => {
                let handshake = acceptor.accept(stream);
                tokio::task::spawn(async move {
                    match handshake.await {
                        Ok(stream) => serve_connection(stream, peer, dispatcher).await,
                        Err(e) => log::debug!("{}: TLS handshake failed: {}", peer, e),
                    }
                });
            }
            None => {
                tokio::task::spawn(serve_connection(stream, peer, dispatcher));
            }
        }
    }
    log::info!("{}: no longer accepting connections", local);
}

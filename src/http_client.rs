//! The shared outbound HTTP client used to proxy service requests.

use bytes::Bytes;
use http::{HeaderMap, Method, Request, Response, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::config::HttpClientConfig;

type PooledClient = Client<HttpConnector, Full<Bytes>>;

/// Error returned by [`ProxyClient::send`].
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The request could not be assembled.
    #[error("building request: {0}")]
    Request(#[from] http::Error),
    /// Connecting, sending, or receiving the response head failed.
    #[error("{0}")]
    Transport(#[from] hyper_util::client::legacy::Error),
    /// The response body could not be read.
    #[error("reading response body: {0}")]
    Body(#[from] hyper::Error),
    /// No complete response arrived within the read timeout.
    #[error("no response within {0:?}")]
    Timeout(Duration),
    /// Every connection slot for the host stayed busy for the read timeout.
    #[error("too many concurrent requests to {0}")]
    Saturated(String),
}

/// A request to forward. The body is already buffered so that the request
/// can be replayed.
#[derive(Clone, Debug)]
pub struct ProxyRequest {
    /// Request method.
    pub method: Method,
    /// Absolute destination URI.
    pub uri: Uri,
    /// Headers to send, including `Host`.
    pub headers: HeaderMap,
    /// Request body.
    pub body: Bytes,
}

impl ProxyRequest {
    fn to_request(&self) -> Result<Request<Full<Bytes>>, http::Error> {
        let mut req = Request::builder()
            .method(self.method.clone())
            .uri(self.uri.clone())
            .body(Full::new(self.body.clone()))?;
        *req.headers_mut() = self.headers.clone();
        Ok(req)
    }
}

fn is_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::PUT | Method::DELETE | Method::OPTIONS | Method::TRACE
    )
}

/// Connection-pooling HTTP/1 client with per-host concurrency limits.
///
/// The underlying pool is replaced once it is older than
/// `max_conn_duration`; requests already in flight finish on the old one
/// and its connections are dropped as they go idle.
#[derive(Debug)]
pub struct ProxyClient {
    config: HttpClientConfig,
    current: Mutex<(PooledClient, Instant)>,
    hosts: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl ProxyClient {
    /// Create a client with the given limits. Must be called from within a
    /// tokio runtime.
    pub fn new(config: HttpClientConfig) -> Self {
        let client = Self::build(&config);
        Self {
            config,
            current: Mutex::new((client, Instant::now())),
            hosts: Mutex::new(HashMap::new()),
        }
    }

    fn build(config: &HttpClientConfig) -> PooledClient {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(config.connect_timeout));
        connector.set_nodelay(true);
        Client::builder(TokioExecutor::new())
            .pool_timer(TokioTimer::new())
            .pool_idle_timeout(config.idle_timeout)
            .pool_max_idle_per_host(config.max_conns_per_host)
            .build(connector)
    }

    fn client(&self) -> PooledClient {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if current.1.elapsed() >= self.config.max_conn_duration {
            log::debug!("proxy client: rotating connection pool");
            *current = (Self::build(&self.config), Instant::now());
        }
        current.0.clone()
    }

    fn host_slots(&self, host: &str) -> Arc<Semaphore> {
        let mut hosts = self.hosts.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            hosts
                .entry(host.to_owned())
                .or_insert_with(|| Arc::new(Semaphore::new(self.config.max_conns_per_host.max(1)))),
        )
    }

    /// Send `req` and buffer the whole response.
    ///
    /// The read timeout bounds the entire exchange, including waiting for a
    /// free slot. Idempotent requests that fail at the transport level are
    /// attempted again, up to `max_idempotent_call_attempts` times in total.
    pub async fn send(&self, req: ProxyRequest) -> Result<Response<Bytes>, ProxyError> {
        let host = req
            .uri
            .authority()
            .map(|a| a.as_str().to_owned())
            .unwrap_or_default();
        let slots = self.host_slots(&host);
        let r = self.send_limited(&host, slots, req).await;
        self.release_host(&host);
        r
    }

    // Forget the host's slots once nobody holds or waits for them.
    fn release_host(&self, host: &str) {
        let mut hosts = self.hosts.lock().unwrap_or_else(PoisonError::into_inner);
        if hosts.get(host).is_some_and(|s| Arc::strong_count(s) == 1) {
            hosts.remove(host);
        }
    }

    async fn send_limited(
        &self,
        host: &str,
        slots: Arc<Semaphore>,
        req: ProxyRequest,
    ) -> Result<Response<Bytes>, ProxyError> {
        let deadline = tokio::time::Instant::now() + self.config.read_timeout;
        let _permit = match tokio::time::timeout_at(deadline, slots.acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            _ => return Err(ProxyError::Saturated(host.to_owned())),
        };

        let attempts = if is_idempotent(&req.method) {
            self.config.max_idempotent_call_attempts.max(1)
        } else {
            1
        };
        let mut attempt = 0;
        loop {
            attempt += 1;
            let client = self.client();
            let request = req.to_request()?;
            let exchange = async move {
                let (parts, body) = client.request(request).await?.into_parts();
                let body = body.collect().await?.to_bytes();
                Ok::<_, ProxyError>(Response::from_parts(parts, body))
            };
            match tokio::time::timeout_at(deadline, exchange).await {
                Err(_) => return Err(ProxyError::Timeout(self.config.read_timeout)),
                Ok(Err(ProxyError::Transport(e))) if attempt < attempts => {
                    log::debug!(
                        "proxy client: {} {} attempt {} failed: {}",
                        req.method,
                        req.uri,
                        attempt,
                        e
                    );
                }
                Ok(r) => return r,
            }
        }
    }
}

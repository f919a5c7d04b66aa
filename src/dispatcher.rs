//! Request classification and the function call retry loop.
//!
//! Every inbound request ends up in exactly one of three places:
//!
//! | path                          | host (if configured) | handled as      |
//! |-------------------------------|----------------------|-----------------|
//! | `/<svc>`, `/<svc>/<fn>`       | function host        | function call   |
//! | `/<svc>`, `/<svc>/<fn>`       | service host         | service proxy   |
//! | `/<svc>/<fn>/<rest...>`       | any                  | service proxy   |
//! | anything else                 |                      | `ERR_NO_ROUTE`  |
//!
//! A function call resolves the service, takes a connection from the
//! [`ConnectionManager`] and invokes `faas.Function/Call`. Failures whose
//! status code is one of the configured retry codes cause the whole
//! sequence to run again on a freshly dialed connection, after an
//! exponentially growing pause.

use backoff::backoff::Backoff;
use bytes::Bytes;
use http::header::{CONNECTION, HOST, HeaderMap, HeaderName, HeaderValue};
use http::{Method, Request, Response, StatusCode, Uri};
use http_body_util::BodyExt;
use hyper::body::Body;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::{GatewayConfig, GrpcClientConfig, HostConfig};
use crate::http_client::{ProxyError, ProxyRequest};
use crate::manager::{ConnectionError, ConnectionManager};
use crate::metadata;
use crate::proto::Message;
use crate::resolver::{ResolveError, Resolver};
use crate::response::{self, GatewayBody};
use crate::{Dialer, Invoker};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Where a request goes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Route {
    /// Invoke `function` of `service`. The function name may be empty.
    Function {
        /// Service name.
        service: String,
        /// Function name.
        function: String,
    },
    /// Proxy to `service`, with `rest` as the new path.
    Service {
        /// Service name.
        service: String,
        /// Path with the leading `/<service>` removed. Never empty.
        rest: String,
    },
    /// Nothing handles this request.
    NoRoute,
}

fn host_matches(host: &str, configured: &str) -> bool {
    if host.eq_ignore_ascii_case(configured) {
        return true;
    }
    match host.parse::<http::uri::Authority>() {
        Ok(a) => a.host().eq_ignore_ascii_case(configured),
        Err(_) => false,
    }
}

/// Decide where a request for `path`, received with `host`, goes.
pub fn classify(path: &str, host: Option<&str>, hosts: &HostConfig) -> Route {
    let Some(trimmed) = path.strip_prefix('/') else {
        return Route::NoRoute;
    };
    let mut segments = trimmed.splitn(3, '/');
    let service = segments.next().unwrap_or_default();
    if service.is_empty() {
        return Route::NoRoute;
    }
    let function = segments.next().unwrap_or_default();
    let rest = || {
        let rest = &trimmed[service.len()..];
        if rest.is_empty() { "/" } else { rest }.to_owned()
    };
    if segments.next().is_some() {
        return Route::Service {
            service: service.to_owned(),
            rest: rest(),
        };
    }
    if !hosts.discriminates() {
        return Route::Function {
            service: service.to_owned(),
            function: function.to_owned(),
        };
    }
    let host = host.unwrap_or_default();
    if hosts.function.as_deref().is_some_and(|f| host_matches(host, f)) {
        Route::Function {
            service: service.to_owned(),
            function: function.to_owned(),
        }
    } else if hosts.service.as_deref().is_some_and(|s| host_matches(host, s)) {
        Route::Service {
            service: service.to_owned(),
            rest: rest(),
        }
    } else {
        Route::NoRoute
    }
}

/// Build the URI a service request is proxied to.
pub fn proxy_target(
    service: &str,
    namespace: &str,
    port: Option<u16>,
    rest: &str,
    query: Option<&str>,
) -> Result<Uri, http::Error> {
    let mut target = format!("http://{}.{}", service, namespace);
    if let Some(port) = port {
        target.push_str(&format!(":{}", port));
    }
    target.push_str(rest);
    if let Some(q) = query {
        target.push('?');
        target.push_str(q);
    }
    Ok(Uri::try_from(target)?)
}

const HOP_BY_HOP: [&str; 7] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

// Also drops every header the `Connection` header lists as connection specific.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(HeaderName::from_static(name));
    }
}

fn describe(status: &tonic::Status) -> String {
    format!("{:?}: {}", status.code(), status.message())
}

/// A classified dispatch failure. Every variant becomes a JSON error
/// response; see [`DispatchError::error_code`].
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The request matched no route.
    #[error("no route")]
    NoRoute,
    /// The request path does not make a valid proxy target.
    #[error("no route: {0}")]
    InvalidTarget(#[source] http::Error),
    /// The inbound body could not be read.
    #[error("failed to read request body: {0}")]
    ReadBody(#[source] BoxError),
    /// The service name did not resolve.
    #[error("failed to resolve address of service ({service}): {source}")]
    AddressResolve {
        /// Service name.
        service: String,
        /// Cause.
        source: ResolveError,
    },
    /// No connection could be had.
    #[error("{0}")]
    GetGrpcConn(#[from] ConnectionError),
    /// The call failed with a status that is not retried.
    #[error("function call failed: {}", describe(.0))]
    FunctionCall(tonic::Status),
    /// The call kept failing with retryable statuses.
    #[error("function call failed after {retries} retries: {}", describe(.status))]
    RetriesExhausted {
        /// Retries made after the first attempt.
        retries: u32,
        /// Status of the last attempt.
        status: tonic::Status,
    },
    /// The proxied request failed.
    #[error("service call failed: {0}")]
    ServiceCall(#[from] ProxyError),
}

impl DispatchError {
    /// The `errCode` reported to the caller.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NoRoute | Self::InvalidTarget(_) => "ERR_NO_ROUTE",
            Self::ReadBody(_) => "ERR_READ_BODY",
            Self::AddressResolve { .. } => "ERR_ADDRESS_RESOLVE",
            Self::GetGrpcConn(_) => "ERR_GET_GRPC_CONN",
            Self::FunctionCall(_) | Self::RetriesExhausted { .. } => "ERR_FUNCTION_CALL",
            Self::ServiceCall(_) => "ERR_SERVICE_CALL",
        }
    }

    /// The HTTP status reported to the caller.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NoRoute | Self::InvalidTarget(_) | Self::AddressResolve { .. } => {
                StatusCode::NOT_FOUND
            }
            Self::ReadBody(_) => StatusCode::BAD_REQUEST,
            Self::GetGrpcConn(_)
            | Self::FunctionCall(_)
            | Self::RetriesExhausted { .. }
            | Self::ServiceCall(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Render as a JSON error response.
    pub fn into_response(self) -> Response<GatewayBody> {
        response::error(self.status_code(), self.error_code(), self.to_string())
    }
}

/// Turns inbound HTTP requests into function calls or proxied requests.
pub struct Dispatcher<D: Dialer> {
    resolver: Arc<Resolver>,
    manager: Arc<ConnectionManager<D>>,
    namespace: String,
    hosts: HostConfig,
    service_port: Option<u16>,
    grpc: GrpcClientConfig,
}

impl<D> Dispatcher<D>
where
    D: Dialer,
    D::Connection: Invoker,
{
    /// Create a dispatcher using `resolver` and `manager`. Services are
    /// proxied to `<service>.<namespace>`.
    pub fn new(
        config: &GatewayConfig,
        namespace: impl Into<String>,
        resolver: Arc<Resolver>,
        manager: Arc<ConnectionManager<D>>,
    ) -> Self {
        Self {
            resolver,
            manager,
            namespace: namespace.into(),
            hosts: config.server.host.clone(),
            service_port: config.client.http.service_port,
            grpc: config.client.grpc.clone(),
        }
    }

    /// Namespace services are proxied into.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Handle one request. Never fails: errors become JSON responses.
    pub async fn dispatch<B>(&self, req: Request<B>) -> Response<GatewayBody>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<BoxError>,
    {
        let host = req
            .headers()
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .or_else(|| req.uri().authority().map(|a| a.as_str()))
            .map(str::to_owned);
        match classify(req.uri().path(), host.as_deref(), &self.hosts) {
            Route::NoRoute => {
                log::debug!("{} {}: no route", req.method(), req.uri());
                DispatchError::NoRoute.into_response()
            }
            Route::Function { service, function } => {
                let r = self.call_function(&service, &function, req).await;
                #[cfg(feature = "metrics")]
                crate::metrics::function_call(
                    r.as_ref().err().map(DispatchError::error_code).unwrap_or("ok"),
                );
                r.unwrap_or_else(|e| {
                    log::warn!("{}/{}: {}", service, function, e);
                    e.into_response()
                })
            }
            Route::Service { service, rest } => {
                let r = self.proxy(&service, &rest, req).await;
                #[cfg(feature = "metrics")]
                crate::metrics::proxy_request(
                    r.as_ref().err().map(DispatchError::error_code).unwrap_or("ok"),
                );
                r.unwrap_or_else(|e| {
                    log::warn!("{}{}: {}", service, rest, e);
                    e.into_response()
                })
            }
        }
    }

    async fn read_body<B>(body: B) -> Result<Bytes, DispatchError>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<BoxError>,
    {
        Ok(body
            .collect()
            .await
            .map_err(|e| DispatchError::ReadBody(e.into()))?
            .to_bytes())
    }

    async fn proxy<B>(
        &self,
        service: &str,
        rest: &str,
        req: Request<B>,
    ) -> Result<Response<GatewayBody>, DispatchError>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<BoxError>,
    {
        let (parts, body) = req.into_parts();
        let uri = proxy_target(
            service,
            &self.namespace,
            self.service_port,
            rest,
            parts.uri.query(),
        )
        .map_err(DispatchError::InvalidTarget)?;
        let body = Self::read_body(body).await?;

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        if let Some(authority) = uri.authority() {
            if let Ok(v) = HeaderValue::from_str(authority.as_str()) {
                headers.insert(HOST, v);
            }
        }
        let (resp_parts, resp_body) = self
            .manager
            .http_client()
            .send(ProxyRequest {
                method: parts.method,
                uri,
                headers,
                body,
            })
            .await?
            .into_parts();
        let mut resp = response::respond(resp_parts.status, resp_body);
        *resp.headers_mut() = resp_parts.headers;
        strip_hop_by_hop(resp.headers_mut());
        Ok(resp)
    }

    fn invocation(
        service: &str,
        function: &str,
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Message {
        let invoke_id = headers
            .get(metadata::INVOKE_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_owned)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let mut md = HashMap::from([
            (metadata::SERVICE_NAME.to_owned(), service.to_owned()),
            (metadata::FUNCTION_NAME.to_owned(), function.to_owned()),
            (metadata::INVOKE_ID.to_owned(), invoke_id),
            (metadata::HTTP_METHOD.to_owned(), method.as_str().to_ascii_uppercase()),
            (metadata::PATH.to_owned(), uri.path().to_owned()),
            (
                metadata::QUERY_STRING.to_owned(),
                uri.query().unwrap_or_default().to_owned(),
            ),
            (metadata::IS_BASE64_ENCODED.to_owned(), "false".to_owned()),
        ]);
        let encoded = metadata::encode_headers(headers);
        if !encoded.is_empty() {
            md.insert(metadata::HEADERS.to_owned(), encoded);
        }
        Message {
            id: 0,
            metadata: md,
            payload: body.to_vec(),
        }
    }

    fn function_response(message: Message) -> Response<GatewayBody> {
        let mut headers = metadata::response_headers(&message.metadata);
        strip_hop_by_hop(&mut headers);
        headers.remove(http::header::CONTENT_LENGTH);
        let mut resp = response::respond(metadata::status_code(&message.metadata), message.payload);
        resp.headers_mut().extend(headers);
        response::default_content_type(&mut resp);
        resp
    }

    async fn call_function<B>(
        &self,
        service: &str,
        function: &str,
        req: Request<B>,
    ) -> Result<Response<GatewayBody>, DispatchError>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<BoxError>,
    {
        let (parts, body) = req.into_parts();
        let body = Self::read_body(body).await?;
        let request = Self::invocation(
            service,
            function,
            &parts.method,
            &parts.uri,
            &parts.headers,
            body,
        );

        let mut backoff = backoff::ExponentialBackoffBuilder::new()
            .with_initial_interval(self.grpc.retry_interval)
            .with_max_interval(self.grpc.retry_interval.max(Duration::from_secs(5)))
            .with_max_elapsed_time(None)
            .build();
        let mut recreate = false;
        let mut retries = 0;
        loop {
            let address =
                self.resolver
                    .resolve(service)
                    .map_err(|source| DispatchError::AddressResolve {
                        service: service.to_owned(),
                        source,
                    })?;
            let conn = self.manager.get_connection(&address, recreate)?;
            let outcome =
                match tokio::time::timeout(self.grpc.timeout, conn.invoke(request.clone())).await {
                    Ok(r) => r,
                    Err(_) => Err(tonic::Status::deadline_exceeded(format!(
                        "no response within {:?}",
                        self.grpc.timeout
                    ))),
                };
            let status = match outcome {
                Ok(resp) => return Ok(Self::function_response(resp)),
                Err(status) => status,
            };
            if !self.grpc.retry_codes.contains(&status.code()) {
                return Err(DispatchError::FunctionCall(status));
            }
            if retries >= self.grpc.max_retries {
                return Err(DispatchError::RetriesExhausted { retries, status });
            }
            retries += 1;
            log::warn!(
                "{}/{}: call to {} failed with {:?} ({}), retry {} of {}",
                service,
                function,
                address,
                status.code(),
                status.message(),
                retries,
                self.grpc.max_retries
            );
            #[cfg(feature = "metrics")]
            crate::metrics::function_retry(status.code());
            recreate = true;
            if let Some(pause) = backoff.next_backoff() {
                tokio::time::sleep(pause).await;
            }
        }
    }
}

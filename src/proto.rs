//! Wire types and stubs for the `faas.Function` service.
//!
//! ```proto
//! syntax = "proto3";
//! package faas;
//!
//! service Function {
//!   rpc Call(Message) returns (Message);
//! }
//!
//! message Message {
//!   uint64 ID = 1;
//!   map<string, string> Metadata = 2;
//!   bytes Payload = 3;
//! }
//! ```
//!
//! The full definition ships as `proto/function.proto`. The stubs below are
//! what `tonic-build` generates for it, kept in-tree so that building the
//! gateway does not need `protoc`.

/// A function invocation or its result.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Message {
    /// Caller-chosen message id. The gateway leaves it zero.
    #[prost(uint64, tag = "1")]
    pub id: u64,
    /// Out-of-band invocation data; see [`crate::metadata`].
    #[prost(map = "string, string", tag = "2")]
    pub metadata: ::std::collections::HashMap<::prost::alloc::string::String, ::prost::alloc::string::String>,
    /// Request or response body.
    #[prost(bytes = "vec", tag = "3")]
    pub payload: ::prost::alloc::vec::Vec<u8>,
}

/// Client stub.
pub mod function_client {
    use tonic::codegen::*;

    /// Client for `faas.Function`.
    #[derive(Debug, Clone)]
    pub struct FunctionClient<T> {
        inner: tonic::client::Grpc<T>,
    }

    impl<T> FunctionClient<T>
    where
        T: tonic::client::GrpcService<tonic::body::BoxBody>,
        T::Error: Into<StdError>,
        T::ResponseBody: Body<Data = Bytes> + Send + 'static,
        <T::ResponseBody as Body>::Error: Into<StdError> + Send,
    {
        /// Wrap a gRPC transport such as a [`tonic::transport::Channel`].
        pub fn new(inner: T) -> Self {
            Self {
                inner: tonic::client::Grpc::new(inner),
            }
        }

        /// Invoke a function.
        pub async fn call(
            &mut self,
            request: impl tonic::IntoRequest<super::Message>,
        ) -> std::result::Result<tonic::Response<super::Message>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::unavailable(format!("Service was not ready: {}", e.into()))
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/faas.Function/Call");
            let mut req = request.into_request();
            req.extensions_mut()
                .insert(GrpcMethod::new("faas.Function", "Call"));
            self.inner.unary(req, path, codec).await
        }
    }
}

/// Server stub, for function runtimes.
pub mod function_server {
    use tonic::codegen::*;

    /// Implemented by function runtimes.
    #[async_trait]
    pub trait Function: Send + Sync + 'static {
        /// Handle one invocation.
        async fn call(
            &self,
            request: tonic::Request<super::Message>,
        ) -> std::result::Result<tonic::Response<super::Message>, tonic::Status>;
    }

    /// Adapts a [`Function`] to a tonic service.
    #[derive(Debug)]
    pub struct FunctionServer<T> {
        inner: Arc<T>,
    }

    impl<T> FunctionServer<T> {
        /// Serve `inner`.
        pub fn new(inner: T) -> Self {
            Self::from_arc(Arc::new(inner))
        }

        /// Serve a shared `inner`.
        pub fn from_arc(inner: Arc<T>) -> Self {
            Self { inner }
        }
    }

    impl<T> Clone for FunctionServer<T> {
        fn clone(&self) -> Self {
            Self {
                inner: Arc::clone(&self.inner),
            }
        }
    }

    struct CallSvc<T: Function>(Arc<T>);

    impl<T: Function> tonic::server::UnaryService<super::Message> for CallSvc<T> {
        type Response = super::Message;
        type Future = BoxFuture<tonic::Response<Self::Response>, tonic::Status>;

        fn call(&mut self, request: tonic::Request<super::Message>) -> Self::Future {
            let inner = Arc::clone(&self.0);
            Box::pin(async move { <T as Function>::call(&inner, request).await })
        }
    }

    impl<T, B> Service<http::Request<B>> for FunctionServer<T>
    where
        T: Function,
        B: Body + Send + 'static,
        B::Error: Into<StdError> + Send + 'static,
    {
        type Response = http::Response<tonic::body::BoxBody>;
        type Error = std::convert::Infallible;
        type Future = BoxFuture<Self::Response, Self::Error>;

        fn poll_ready(
            &mut self,
            _cx: &mut Context<'_>,
        ) -> Poll<std::result::Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: http::Request<B>) -> Self::Future {
            match req.uri().path() {
                "/faas.Function/Call" => {
                    let method = CallSvc(Arc::clone(&self.inner));
                    Box::pin(async move {
                        let codec = tonic::codec::ProstCodec::default();
                        let mut grpc = tonic::server::Grpc::new(codec);
                        Ok(grpc.unary(method, req).await)
                    })
                }
                _ => Box::pin(async move {
                    let mut response = http::Response::new(empty_body());
                    let headers = response.headers_mut();
                    headers.insert(
                        "grpc-status",
                        http::HeaderValue::from(tonic::Code::Unimplemented as i32),
                    );
                    headers.insert(
                        http::header::CONTENT_TYPE,
                        http::HeaderValue::from_static("application/grpc"),
                    );
                    Ok(response)
                }),
            }
        }
    }

    impl<T> tonic::server::NamedService for FunctionServer<T> {
        const NAME: &'static str = "faas.Function";
    }
}

use bytes::Bytes;
use http::{Request, Response};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

use crate::proto::Message;
use crate::proto::function_server::{Function, FunctionServer};
use crate::{Dialer, Invoker};

/// Write a mapping file named `services.yml` into `dir`.
pub(crate) fn write_mapping(dir: &Path, services: &[(&str, &[u16])]) -> PathBuf {
    let mut doc = String::from("ports:\n");
    for (name, ports) in services {
        let ports = ports
            .iter()
            .map(u16::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        doc.push_str(&format!("  {}:\n    items: [{}]\n", name, ports));
    }
    let path = dir.join("services.yml");
    std::fs::write(&path, doc).unwrap();
    path
}

#[derive(Debug, Error)]
#[error("mock {0} failure for {1}")]
pub(crate) struct MockError(&'static str, String);

/// Shared record of what a [`MockDialer`] and its connections did.
#[derive(Debug, Default)]
pub(crate) struct MockState {
    outcomes: Mutex<VecDeque<Result<Message, tonic::Status>>>,
    delay: Mutex<Option<Duration>>,
    calls: Mutex<Vec<(String, Message)>>,
    dials: Mutex<Vec<String>>,
    closed: Mutex<Vec<String>>,
    fail_dial: Mutex<HashSet<String>>,
    fail_close: Mutex<HashSet<String>>,
    dial_delay: Mutex<Option<Duration>>,
    next_id: AtomicUsize,
}

/// A [`Dialer`] whose connections answer from a script. Clones share state.
#[derive(Clone, Debug, Default)]
pub(crate) struct MockDialer {
    state: Arc<MockState>,
}

impl MockDialer {
    /// Queue call outcomes. Once the queue is empty calls echo the payload.
    pub(crate) fn script(&self, outcomes: impl IntoIterator<Item = Result<Message, tonic::Status>>) {
        self.state.outcomes.lock().unwrap().extend(outcomes);
    }

    pub(crate) fn set_call_delay(&self, d: Duration) {
        *self.state.delay.lock().unwrap() = Some(d);
    }

    pub(crate) fn set_dial_delay(&self, d: Duration) {
        *self.state.dial_delay.lock().unwrap() = Some(d);
    }

    pub(crate) fn fail_dial(&self, address: &str) {
        self.state.fail_dial.lock().unwrap().insert(address.to_owned());
    }

    pub(crate) fn fail_close(&self, address: &str) {
        self.state.fail_close.lock().unwrap().insert(address.to_owned());
    }

    pub(crate) fn dials(&self) -> Vec<String> {
        self.state.dials.lock().unwrap().clone()
    }

    pub(crate) fn closed(&self) -> Vec<String> {
        self.state.closed.lock().unwrap().clone()
    }

    pub(crate) fn calls(&self) -> Vec<(String, Message)> {
        self.state.calls.lock().unwrap().clone()
    }
}

#[derive(Clone, Debug)]
pub(crate) struct MockConnection {
    pub(crate) id: usize,
    pub(crate) address: String,
    state: Arc<MockState>,
}

impl Dialer for MockDialer {
    type Connection = MockConnection;
    type Error = MockError;

    fn dial(&self, address: &str) -> Result<MockConnection, MockError> {
        self.state.dials.lock().unwrap().push(address.to_owned());
        if let Some(d) = *self.state.dial_delay.lock().unwrap() {
            std::thread::sleep(d);
        }
        if self.state.fail_dial.lock().unwrap().contains(address) {
            return Err(MockError("dial", address.to_owned()));
        }
        Ok(MockConnection {
            id: self.state.next_id.fetch_add(1, Ordering::SeqCst),
            address: address.to_owned(),
            state: Arc::clone(&self.state),
        })
    }

    fn close(&self, address: &str, _: MockConnection) -> Result<(), MockError> {
        self.state.closed.lock().unwrap().push(address.to_owned());
        if self.state.fail_close.lock().unwrap().contains(address) {
            return Err(MockError("close", address.to_owned()));
        }
        Ok(())
    }
}

impl Invoker for MockConnection {
    fn invoke(
        &self,
        request: Message,
    ) -> impl Future<Output = Result<Message, tonic::Status>> + Send + 'static {
        self.state
            .calls
            .lock()
            .unwrap()
            .push((self.address.clone(), request.clone()));
        let outcome = self.state.outcomes.lock().unwrap().pop_front();
        let delay = *self.state.delay.lock().unwrap();
        async move {
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }
            outcome.unwrap_or_else(|| {
                Ok(Message {
                    id: request.id,
                    metadata: HashMap::new(),
                    payload: request.payload,
                })
            })
        }
    }
}

/// Serve HTTP on a loopback port with `handler`.
pub(crate) async fn spawn_http_server<F, Fut>(handler: F) -> SocketAddr
where
    F: Fn(Request<Incoming>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Response<Full<Bytes>>> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::task::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let handler = handler.clone();
            tokio::task::spawn(async move {
                let _ = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                    .serve_connection(
                        TokioIo::new(stream),
                        service_fn(move |req| {
                            let handler = handler.clone();
                            async move { Ok::<_, std::convert::Infallible>(handler(req).await) }
                        }),
                    )
                    .await;
            });
        }
    });
    addr
}

/// Serve HTTP on a loopback port, but hang up on the first `fail_first`
/// connections without reading from them. Returns the number of accepted
/// connections alongside the address.
pub(crate) async fn flaky_http_server(fail_first: usize) -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&accepted);
    tokio::task::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            if counter.fetch_add(1, Ordering::SeqCst) < fail_first {
                drop(stream);
                continue;
            }
            tokio::task::spawn(async move {
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(
                        TokioIo::new(stream),
                        service_fn(|_| async {
                            Ok::<_, std::convert::Infallible>(Response::new(Full::new(
                                Bytes::from_static(b"ok"),
                            )))
                        }),
                    )
                    .await;
            });
        }
    });
    (addr, accepted)
}

struct EchoFunction;

#[tonic::async_trait]
impl Function for EchoFunction {
    async fn call(
        &self,
        request: tonic::Request<Message>,
    ) -> Result<tonic::Response<Message>, tonic::Status> {
        let mut message = request.into_inner();
        message.metadata.insert("echoed".to_owned(), "true".to_owned());
        Ok(tonic::Response::new(message))
    }
}

/// Serve a real `faas.Function` echo service on a loopback port.
pub(crate) async fn spawn_function_server() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::task::spawn(
        tonic::transport::Server::builder()
            .add_service(FunctionServer::new(EchoFunction))
            .serve_with_incoming(tokio_stream::wrappers::TcpListenerStream::new(listener)),
    );
    addr
}

//! Plaintext TCP connector for outbound gRPC connections.

use http::Uri;
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;

use crate::Connector;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(30000);

/// A [`crate::Connector`] that connects with TCP/IP.
///
/// The host is resolved with the system resolver and each resulting
/// address is tried in turn. The whole attempt is bounded by the connect
/// timeout.
#[derive(Clone, Debug)]
pub struct TCPConnector {
    connect_timeout: Duration,
}

impl Default for TCPConnector {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
        }
    }
}

impl TCPConnector {
    /// A connector that gives up after `connect_timeout`.
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

fn default_port(uri: &Uri) -> u16 {
    if uri.scheme() == Some(&http::uri::Scheme::HTTPS) {
        443
    } else {
        80
    }
}

async fn connect_any(host: String, port: u16) -> io::Result<TcpStream> {
    let mut last_error = None;
    for addr in tokio::net::lookup_host((host.as_str(), port)).await? {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} resolved to no addresses", host),
        )
    }))
}

impl Connector for TCPConnector {
    type IO = TcpStream;
    type Error = io::Error;

    fn connect(&self, target: &Uri) -> impl Future<Output = io::Result<TcpStream>> + Send + 'static {
        let host = target
            .host()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_owned());
        let port = target.port_u16().unwrap_or_else(|| default_port(target));
        let connect_timeout = self.connect_timeout;
        async move {
            let host = host
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "URI without host"))?;
            match tokio::time::timeout(connect_timeout, connect_any(host, port)).await {
                Ok(r) => r,
                Err(e) => Err(io::Error::new(io::ErrorKind::TimedOut, e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn connects_by_name() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::task::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            s.write_all(b"hi").await.unwrap();
        });
        let uri: Uri = format!("http://localhost:{}", port).parse().unwrap();
        let mut s = TCPConnector::default().connect(&uri).await.unwrap();
        let mut buf = [0u8; 2];
        s.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let uri: Uri = format!("http://127.0.0.1:{}", port).parse().unwrap();
        assert_matches!(
            TCPConnector::default().connect(&uri).await,
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused
        );
    }

    #[test]
    fn default_ports() {
        assert_eq!(default_port(&"http://a".parse().unwrap()), 80);
        assert_eq!(default_port(&"https://a".parse().unwrap()), 443);
    }
}

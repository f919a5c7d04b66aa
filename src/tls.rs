//! TLS for outbound gRPC connections and the inbound listener.
//!
//! [`TLSConnector`] layers on top of another connector (from
//! [`crate::stream`]) to add TLS to the stream. The loaders turn the
//! certificate paths from [`crate::config`] into rustls configurations.

use http::Uri;
use pin_project_lite::pin_project;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::rustls::client::ClientConfig;
use tokio_rustls::rustls::pki_types::pem::PemObject;
use tokio_rustls::rustls::pki_types::{
    CertificateDer, InvalidDnsNameError, PrivateKeyDer, ServerName,
};
use tokio_rustls::rustls::server::{ServerConfig, VerifierBuilderError, WebPkiClientVerifier};
use tokio_rustls::rustls::RootCertStore;

use crate::Connector;
use crate::config::{ClientTlsConfig, ServerTlsConfig};

pin_project! {
    #[project = LayerProjected]
    #[derive(Debug)]
    enum Layer<IO> {
        Plain { #[pin] inner: IO },
        Tls { #[pin] inner: tokio_rustls::client::TlsStream<IO> },
    }
}

pin_project! {
    /// A byte stream that is either plaintext or wrapped in TLS.
    #[derive(Debug)]
    pub struct MaybeTlsStream<IO> {
        #[pin]
        layer: Layer<IO>,
    }
}

impl<IO> MaybeTlsStream<IO> {
    fn plain(inner: IO) -> Self {
        Self {
            layer: Layer::Plain { inner },
        }
    }

    fn tls(inner: tokio_rustls::client::TlsStream<IO>) -> Self {
        Self {
            layer: Layer::Tls { inner },
        }
    }

    /// Whether the stream is wrapped in TLS.
    pub fn is_tls(&self) -> bool {
        matches!(self.layer, Layer::Tls { .. })
    }
}

impl<IO: AsyncRead + AsyncWrite + Unpin> AsyncRead for MaybeTlsStream<IO> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.project().layer.project() {
            LayerProjected::Plain { inner } => inner.poll_read(cx, buf),
            LayerProjected::Tls { inner } => inner.poll_read(cx, buf),
        }
    }
}

impl<IO: AsyncRead + AsyncWrite + Unpin> AsyncWrite for MaybeTlsStream<IO> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.project().layer.project() {
            LayerProjected::Plain { inner } => inner.poll_write(cx, buf),
            LayerProjected::Tls { inner } => inner.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.project().layer.project() {
            LayerProjected::Plain { inner } => inner.poll_flush(cx),
            LayerProjected::Tls { inner } => inner.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.project().layer.project() {
            LayerProjected::Plain { inner } => inner.poll_shutdown(cx),
            LayerProjected::Tls { inner } => inner.poll_shutdown(cx),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[std::io::IoSlice<'_>],
    ) -> Poll<std::io::Result<usize>> {
        match self.project().layer.project() {
            LayerProjected::Plain { inner } => inner.poll_write_vectored(cx, bufs),
            LayerProjected::Tls { inner } => inner.poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self.layer {
            Layer::Plain { ref inner } => inner.is_write_vectored(),
            Layer::Tls { ref inner } => inner.is_write_vectored(),
        }
    }
}

#[derive(Debug)]
struct TLSSettings {
    server_name: Option<ServerName<'static>>,
    config: Arc<ClientConfig>,
}

/// A [`Connector`] that optionally wraps another one with a TLS client.
#[derive(Debug)]
pub struct TLSConnector<T> {
    inner: T,
    tls: Option<TLSSettings>,
}

/// Error type returned at [`TLSConnector`] creation time.
#[derive(Debug, Error)]
pub enum TLSConnectorCreationError {
    /// The server name override is not a valid TLS [`ServerName`].
    #[error("{0}")]
    InvalidNameError(#[from] InvalidDnsNameError),
}

impl<T> TLSConnector<T> {
    /// Create a new connector around `inner`, a connector that delivers a
    /// plaintext bytestream. With a config, TLS is added and h2 is
    /// negotiated; without one the connector is a passthrough.
    ///
    /// Certificates are verified against `server_name` if given, otherwise
    /// against the host being connected to.
    pub fn new(
        inner: T,
        config: Option<&ClientConfig>,
        server_name: Option<&str>,
    ) -> Result<Self, TLSConnectorCreationError> {
        let tls = match config {
            Some(c) => {
                let mut c = c.clone();
                c.alpn_protocols = vec![b"h2".to_vec()];
                Some(TLSSettings {
                    server_name: server_name
                        .map(|n| ServerName::try_from(n.to_owned()))
                        .transpose()?,
                    config: Arc::new(c),
                })
            }
            None => None,
        };
        Ok(Self { inner, tls })
    }

    /// Whether connections get TLS.
    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }
}

/// Error type returned by [`TLSConnector`] when establishing connections.
#[derive(Debug, Error)]
pub enum TLSConnectorError<T: std::error::Error> {
    /// The inner connector returned an error.
    #[error("{0}")]
    InnerError(#[source] T),
    /// The host cannot be used as a TLS server name.
    #[error("{0}")]
    InvalidName(#[source] InvalidDnsNameError),
    /// An error occcurred at the TLS layer.
    #[error("{0}")]
    TLSError(#[source] std::io::Error),
}

impl<T: Connector> Connector for TLSConnector<T> {
    type IO = MaybeTlsStream<T::IO>;
    type Error = TLSConnectorError<T::Error>;

    fn connect(
        &self,
        target: &Uri,
    ) -> impl Future<Output = Result<Self::IO, Self::Error>> + Send + 'static {
        let inner = self.inner.connect(target);
        let tls = self.tls.as_ref().map(|t| {
            let name = match t.server_name {
                Some(ref n) => Ok(n.clone()),
                None => ServerName::try_from(
                    target
                        .host()
                        .unwrap_or_default()
                        .trim_start_matches('[')
                        .trim_end_matches(']')
                        .to_owned(),
                ),
            };
            (name, Arc::clone(&t.config))
        });
        async move {
            let io = inner.await.map_err(TLSConnectorError::InnerError)?;
            let Some((name, config)) = tls else {
                return Ok(MaybeTlsStream::plain(io));
            };
            let name = name.map_err(TLSConnectorError::InvalidName)?;
            let io = tokio_rustls::TlsConnector::from(config)
                .connect(name, io)
                .await
                .map_err(TLSConnectorError::TLSError)?;
            Ok(MaybeTlsStream::tls(io))
        }
    }
}

/// Errors from loading certificate material.
#[derive(Debug, Error)]
pub enum TlsConfigError {
    /// A PEM file could not be read or decoded.
    #[error("reading {}: {}", .0.display(), .1)]
    Pem(PathBuf, #[source] tokio_rustls::rustls::pki_types::pem::Error),
    /// A certificate file held no certificates.
    #[error("{}: no certificates found", .0.display())]
    NoCertificates(PathBuf),
    /// Only one of a client certificate and key was configured.
    #[error("client TLS identity needs both cert and key")]
    IncompleteIdentity,
    /// rustls rejected the material.
    #[error("{0}")]
    Rustls(#[from] tokio_rustls::rustls::Error),
    /// The client certificate verifier could not be built.
    #[error("client certificate verifier: {0}")]
    Verifier(#[from] VerifierBuilderError),
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsConfigError> {
    let certs = CertificateDer::pem_file_iter(path)
        .and_then(|iter| iter.collect::<Result<Vec<_>, _>>())
        .map_err(|e| TlsConfigError::Pem(path.to_owned(), e))?;
    if certs.is_empty() {
        return Err(TlsConfigError::NoCertificates(path.to_owned()));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsConfigError> {
    PrivateKeyDer::from_pem_file(path).map_err(|e| TlsConfigError::Pem(path.to_owned(), e))
}

fn load_roots(path: &Path) -> Result<RootCertStore, TlsConfigError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots.add(cert)?;
    }
    Ok(roots)
}

/// Build the client configuration for outbound gRPC.
pub fn client_config(c: &ClientTlsConfig) -> Result<ClientConfig, TlsConfigError> {
    let builder = ClientConfig::builder().with_root_certificates(load_roots(&c.ca)?);
    match (&c.cert, &c.key) {
        (Some(cert), Some(key)) => {
            Ok(builder.with_client_auth_cert(load_certs(cert)?, load_key(key)?)?)
        }
        (None, None) => Ok(builder.with_no_client_auth()),
        _ => Err(TlsConfigError::IncompleteIdentity),
    }
}

/// Build the server configuration for the inbound listener. A configured
/// CA makes client certificates mandatory.
pub fn server_config(c: &ServerTlsConfig) -> Result<ServerConfig, TlsConfigError> {
    let builder = ServerConfig::builder();
    let builder = match c.ca {
        Some(ref ca) => builder.with_client_cert_verifier(
            WebPkiClientVerifier::builder(Arc::new(load_roots(ca)?)).build()?,
        ),
        None => builder.with_no_client_auth(),
    };
    let mut config = builder.with_single_cert(load_certs(&c.cert)?, load_key(&c.key)?)?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::stream::TCPConnector;

    #[tokio::test]
    async fn passthrough_without_config() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::task::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            s.write_all(b"ok").await.unwrap();
        });
        let c = TLSConnector::new(TCPConnector::default(), None, None).unwrap();
        assert!(!c.is_tls());
        let uri: Uri = format!("http://{}", addr).parse().unwrap();
        let mut io = c.connect(&uri).await.unwrap();
        assert!(!io.is_tls());
        let mut buf = [0u8; 2];
        io.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");
    }

    #[test]
    fn rejects_bad_server_name() {
        let config = ClientConfig::builder()
            .with_root_certificates(RootCertStore::empty())
            .with_no_client_auth();
        assert_matches!(
            TLSConnector::new(TCPConnector::default(), Some(&config), Some("not a name!")),
            Err(TLSConnectorCreationError::InvalidNameError(_))
        );
        let c = TLSConnector::new(TCPConnector::default(), Some(&config), Some("fn.local")).unwrap();
        assert!(c.is_tls());
    }

    #[test]
    fn loader_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.pem");
        assert_matches!(
            client_config(&ClientTlsConfig {
                ca: missing.clone(),
                cert: None,
                key: None,
                server_name: None,
            }),
            Err(TlsConfigError::Pem(p, _)) if p == missing
        );

        let empty = dir.path().join("empty.pem");
        std::fs::write(&empty, "").unwrap();
        assert_matches!(
            server_config(&ServerTlsConfig {
                cert: empty.clone(),
                key: empty.clone(),
                ca: None,
            }),
            Err(TlsConfigError::NoCertificates(_))
        );
    }
}

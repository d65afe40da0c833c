//! Transport strategy: plaintext TCP or TLS byte streams.
//!
//! The core only ever sees a [`BoxedStream`] — a reliable bidirectional
//! byte stream. Which kind it gets is decided once, at endpoint
//! construction; requiring TLS without certificates configured is a
//! construction-time error, not a runtime surprise.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, pem::PemObject};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use magnetite_types::NetworkInfo;

use crate::{CoreError, timeout};

/// A reliable bidirectional byte stream between endpoints.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

/// Type-erased connection handed to the core's peer tasks.
pub type BoxedStream = Box<dyn ByteStream>;

/// Certificate material for the TLS transport.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// Path to this endpoint's certificate chain (PEM).
    pub cert_path: PathBuf,
    /// Path to the matching private key (PEM).
    pub key_path: PathBuf,
    /// CA bundle used to verify remote endpoints (PEM).
    pub ca_path: PathBuf,
}

impl TlsConfig {
    pub fn new(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
        ca_path: impl AsRef<Path>,
    ) -> Self {
        Self {
            cert_path: cert_path.as_ref().to_path_buf(),
            key_path: key_path.as_ref().to_path_buf(),
            ca_path: ca_path.as_ref().to_path_buf(),
        }
    }
}

/// TLS machinery built once from a [`TlsConfig`].
struct TlsContext {
    acceptor: TlsAcceptor,
    connector: TlsConnector,
}

impl TlsContext {
    fn build(config: &TlsConfig) -> Result<Self, CoreError> {
        let certs: Vec<CertificateDer<'static>> =
            CertificateDer::pem_file_iter(&config.cert_path)
                .map_err(|e| CoreError::Tls(format!("reading {}: {e}", config.cert_path.display())))?
                .collect::<Result<_, _>>()
                .map_err(|e| CoreError::Tls(format!("parsing {}: {e}", config.cert_path.display())))?;
        let key = PrivateKeyDer::from_pem_file(&config.key_path)
            .map_err(|e| CoreError::Tls(format!("reading {}: {e}", config.key_path.display())))?;

        let mut roots = rustls::RootCertStore::empty();
        for cert in CertificateDer::pem_file_iter(&config.ca_path)
            .map_err(|e| CoreError::Tls(format!("reading {}: {e}", config.ca_path.display())))?
        {
            let cert =
                cert.map_err(|e| CoreError::Tls(format!("parsing {}: {e}", config.ca_path.display())))?;
            roots
                .add(cert)
                .map_err(|e| CoreError::Tls(e.to_string()))?;
        }

        let server_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| CoreError::Tls(e.to_string()))?;
        let client_config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(server_config)),
            connector: TlsConnector::from(Arc::new(client_config)),
        })
    }
}

/// The transport strategy selected at endpoint construction.
pub struct Transport {
    kind: TransportKind,
}

enum TransportKind {
    /// Plaintext TCP; only for explicitly SSL-disabled deployments.
    Tcp,
    /// TLS over TCP.
    Tls(TlsContext),
}

impl Transport {
    /// Builds the plaintext transport.
    pub fn tcp() -> Self {
        Self {
            kind: TransportKind::Tcp,
        }
    }

    /// Builds the TLS transport, failing fast on bad certificate material.
    pub fn tls(config: &TlsConfig) -> Result<Self, CoreError> {
        Ok(Self {
            kind: TransportKind::Tls(TlsContext::build(config)?),
        })
    }

    /// Whether connections are TLS-wrapped.
    pub fn is_tls(&self) -> bool {
        matches!(self.kind, TransportKind::Tls(_))
    }

    /// Binds a listener. Returns the actual local port (useful when `port`
    /// was 0).
    pub async fn listen(&self, address: &str, port: u16) -> Result<(u16, Listener), CoreError> {
        let bind_addr = if address.is_empty() {
            format!("0.0.0.0:{port}")
        } else {
            format!("{address}:{port}")
        };
        let listener = TcpListener::bind(&bind_addr).await?;
        let local_port = listener.local_addr()?.port();
        let acceptor = match &self.kind {
            TransportKind::Tcp => None,
            TransportKind::Tls(context) => Some(context.acceptor.clone()),
        };
        Ok((
            local_port,
            Listener {
                inner: listener,
                acceptor,
            },
        ))
    }

    /// Opens a connection to `info`, bounded by the connect timeout.
    pub async fn connect(&self, info: &NetworkInfo) -> Result<BoxedStream, CoreError> {
        let addr = format!("{}:{}", info.address, info.port);
        let connect = TcpStream::connect(&addr);
        let stream = tokio::time::timeout(timeout::CONNECT, connect)
            .await
            .map_err(|_| CoreError::PeerTimeout { info: info.clone() })?
            .map_err(|e| CoreError::PeerUnavailable {
                info: info.clone(),
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true)?;

        match &self.kind {
            TransportKind::Tcp => Ok(Box::new(stream)),
            TransportKind::Tls(context) => {
                let name = ServerName::try_from(info.address.clone())
                    .map_err(|e| CoreError::Tls(e.to_string()))?;
                let tls = context
                    .connector
                    .connect(name, stream)
                    .await
                    .map_err(|e| CoreError::PeerUnavailable {
                        info: info.clone(),
                        reason: format!("TLS handshake: {e}"),
                    })?;
                Ok(Box::new(tls))
            }
        }
    }
}

/// An accepting socket, TLS-wrapping inbound streams when configured.
pub struct Listener {
    inner: TcpListener,
    acceptor: Option<TlsAcceptor>,
}

impl Listener {
    /// Accepts the next inbound connection.
    pub async fn accept(&self) -> Result<(BoxedStream, std::net::SocketAddr), CoreError> {
        let (stream, addr) = self.inner.accept().await?;
        stream.set_nodelay(true)?;
        match &self.acceptor {
            None => Ok((Box::new(stream), addr)),
            Some(acceptor) => {
                let tls = acceptor.accept(stream).await.map_err(|e| {
                    CoreError::Tls(format!("inbound TLS handshake from {addr}: {e}"))
                })?;
                Ok((Box::new(tls), addr))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use magnetite_types::Timespan;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn tcp_listen_connect_round_trip() {
        let transport = Transport::tcp();
        let (port, listener) = transport.listen("127.0.0.1", 0).await.expect("listen");

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.expect("read");
            stream.write_all(&buf).await.expect("write");
        });

        let info = NetworkInfo::new("127.0.0.1", port, Timespan::ZERO);
        let mut stream = transport.connect(&info).await.expect("connect");
        stream.write_all(b"ping").await.expect("write");
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.expect("read");
        assert_eq!(&buf, b"ping");

        server.await.expect("join");
    }

    #[tokio::test]
    async fn connect_to_dead_port_reports_unavailable() {
        let transport = Transport::tcp();
        // Bind-then-drop guarantees the port is closed.
        let dead_port = {
            let sock = TcpListener::bind("127.0.0.1:0").await.expect("bind");
            sock.local_addr().expect("addr").port()
        };
        let info = NetworkInfo::new("127.0.0.1", dead_port, Timespan::ZERO);
        assert!(matches!(
            transport.connect(&info).await,
            Err(CoreError::PeerUnavailable { .. })
        ));
    }

    #[test]
    fn tls_requires_valid_certificate_material() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("nope.pem");
        let config = TlsConfig::new(&missing, &missing, &missing);
        assert!(matches!(
            Transport::tls(&config),
            Err(CoreError::Tls(_))
        ));
    }
}

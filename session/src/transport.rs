//! TCP and TLS transport for sessions.
//!
//! Provides the unified stream type that the session loops read and write,
//! plus listeners and dialers that honor the socket-level options.

use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};

use crate::options::SessionOptions;

/// Unified stream type: plain TCP or a TLS stream on either side.
pub enum IoStream {
    /// Plain TCP stream
    Plain(TcpStream),
    /// Server-side TLS stream
    Tls(tokio_rustls::server::TlsStream<TcpStream>),
    /// Client-side TLS stream
    TlsClient(tokio_rustls::client::TlsStream<TcpStream>),
}

impl AsyncRead for IoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            IoStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
            IoStream::TlsClient(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            IoStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
            IoStream::TlsClient(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            IoStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
            IoStream::TlsClient(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            IoStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
            IoStream::TlsClient(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

impl IoStream {
    /// Remote address of the underlying socket.
    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            IoStream::Plain(stream) => stream.peer_addr(),
            IoStream::Tls(stream) => stream.get_ref().0.peer_addr(),
            IoStream::TlsClient(stream) => stream.get_ref().0.peer_addr(),
        }
    }
}

/// Bind a listener. IPv6 addresses are bound dual-stack when the option
/// allows it; the flag has no effect on IPv4 addresses.
pub async fn listen(addr: SocketAddr, options: &SessionOptions) -> std::io::Result<TcpListener> {
    if addr.is_ipv6() {
        let socket = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_only_v6(!options.allow_dual_stack_socket)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(1024)?;
        TcpListener::from_std(socket.into())
    } else {
        TcpListener::bind(addr).await
    }
}

/// Dial a TCP address and apply the socket options.
pub async fn connect(addr: SocketAddr, options: &SessionOptions) -> std::io::Result<TcpStream> {
    let stream = TcpStream::connect(addr).await?;
    if options.no_delay {
        stream.set_nodelay(true)?;
    }
    Ok(stream)
}

/// TLS configuration building and handshakes.
pub mod tls {
    use super::*;
    use std::path::Path;
    use std::sync::Arc;

    use rustls::pki_types::{
        CertificateDer, CertificateRevocationListDer, PrivateKeyDer, ServerName,
    };
    use rustls::{ClientConfig, RootCertStore, ServerConfig, SupportedProtocolVersion};
    use tokio_rustls::{TlsAcceptor, TlsConnector};
    use tracing::{debug, warn};

    use crate::error::SessionError;
    use crate::options::{CertificateSource, TlsProtocols};

    fn invalid(msg: impl Into<String>) -> SessionError {
        SessionError::InvalidConfig(msg.into())
    }

    /// Handshake failures arrive as `io::Error`, with the TLS cause boxed
    /// inside when there is one.
    fn handshake_error(err: std::io::Error) -> SessionError {
        match err
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        {
            Some(tls_error) => SessionError::Tls(tls_error.clone()),
            None => SessionError::Socket(err),
        }
    }

    fn protocol_versions(
        set: TlsProtocols,
    ) -> Result<Vec<&'static SupportedProtocolVersion>, SessionError> {
        let mut versions = Vec::new();
        if set.contains(TlsProtocols::TLS12) {
            versions.push(&rustls::version::TLS12);
        }
        if set.contains(TlsProtocols::TLS13) {
            versions.push(&rustls::version::TLS13);
        }
        if versions.is_empty() {
            return Err(invalid("no TLS protocol version enabled"));
        }
        Ok(versions)
    }

    fn load_certificate(
        source: &CertificateSource,
    ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), SessionError> {
        match source {
            CertificateSource::Pem { cert, key } => {
                let cert_pem = std::fs::read(cert).map_err(SessionError::Socket)?;
                let certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(SessionError::Socket)?;
                if certs.is_empty() {
                    return Err(invalid(format!("no certificates in {}", cert.display())));
                }

                let key_pem = std::fs::read(key).map_err(SessionError::Socket)?;
                let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
                    .map_err(SessionError::Socket)?
                    .ok_or_else(|| invalid(format!("no private key in {}", key.display())))?;

                Ok((certs, key))
            }
            CertificateSource::Provided(provider) => provider.certificate(),
        }
    }

    /// Build the default validator's trust list from the trusted-cert
    /// directory. Entries are parsed as PEM when they look like PEM and as
    /// DER otherwise; unreadable entries are skipped with a warning.
    pub fn load_trust_dir(dir: &Path) -> Result<RootCertStore, SessionError> {
        let mut roots = RootCertStore::empty();

        for entry in std::fs::read_dir(dir).map_err(SessionError::Socket)? {
            let path = entry.map_err(SessionError::Socket)?.path();
            if !path.is_file() {
                continue;
            }
            let contents = match std::fs::read(&path) {
                Ok(contents) => contents,
                Err(e) => {
                    warn!("Skipping unreadable trust entry {}: {}", path.display(), e);
                    continue;
                }
            };

            let mut added = 0usize;
            if contents.windows(10).any(|w| w == b"-----BEGIN") {
                for cert in rustls_pemfile::certs(&mut contents.as_slice()).flatten() {
                    if roots.add(cert).is_ok() {
                        added += 1;
                    }
                }
            } else if roots.add(CertificateDer::from(contents)).is_ok() {
                added += 1;
            }

            if added == 0 {
                warn!("No usable certificate in trust entry {}", path.display());
            }
        }

        debug!("Loaded {} trust anchors from {}", roots.len(), dir.display());
        Ok(roots)
    }

    fn load_crls(
        paths: &[std::path::PathBuf],
    ) -> Result<Vec<CertificateRevocationListDer<'static>>, SessionError> {
        let mut crls = Vec::new();
        for path in paths {
            let contents = std::fs::read(path).map_err(SessionError::Socket)?;
            for crl in rustls_pemfile::crls(&mut contents.as_slice()) {
                crls.push(crl.map_err(SessionError::Socket)?);
            }
        }
        Ok(crls)
    }

    /// Build the server-side TLS configuration from the session options.
    pub fn make_server_config(
        options: &crate::options::SessionOptions,
    ) -> Result<ServerConfig, SessionError> {
        let tls = options
            .tls
            .as_ref()
            .ok_or_else(|| invalid("TLS server requires TLS options"))?;
        let source = tls
            .certificate
            .as_ref()
            .ok_or_else(|| invalid("TLS server requires a certificate source"))?;

        let _ = rustls::crypto::ring::default_provider().install_default();

        let versions = protocol_versions(options.enabled_tls_protocols)?;
        let builder = ServerConfig::builder_with_protocol_versions(&versions);

        let builder = if let Some(verifier) = &tls.client_cert_verifier {
            builder.with_client_cert_verifier(verifier.clone())
        } else if options.require_client_certificate {
            let dir = tls
                .trusted_cert_dir
                .as_ref()
                .ok_or_else(|| invalid("client certificates require a trusted-cert directory"))?;
            let roots = load_trust_dir(dir)?;
            let mut verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots));
            if options.check_certificate_revocation {
                verifier = verifier.with_crls(load_crls(&tls.crl_files)?);
            }
            let verifier = verifier
                .build()
                .map_err(|e| invalid(format!("client verifier: {e}")))?;
            builder.with_client_cert_verifier(verifier)
        } else {
            builder.with_no_client_auth()
        };

        let (certs, key) = load_certificate(source)?;
        let config = builder.with_single_cert(certs, key)?;
        Ok(config)
    }

    /// Build the client-side TLS configuration from the session options.
    pub fn make_client_config(
        options: &crate::options::SessionOptions,
    ) -> Result<ClientConfig, SessionError> {
        let tls = options
            .tls
            .as_ref()
            .ok_or_else(|| invalid("TLS client requires TLS options"))?;

        let _ = rustls::crypto::ring::default_provider().install_default();

        let versions = protocol_versions(options.enabled_tls_protocols)?;
        let builder = ClientConfig::builder_with_protocol_versions(&versions);

        let builder = if let Some(verifier) = &tls.server_cert_verifier {
            builder
                .dangerous()
                .with_custom_certificate_verifier(verifier.clone())
        } else {
            let dir = tls
                .trusted_cert_dir
                .as_ref()
                .ok_or_else(|| invalid("TLS client requires a trusted-cert directory or verifier"))?;
            let roots = Arc::new(load_trust_dir(dir)?);
            if options.check_certificate_revocation {
                let verifier = rustls::client::WebPkiServerVerifier::builder(roots)
                    .with_crls(load_crls(&tls.crl_files)?)
                    .build()
                    .map_err(|e| invalid(format!("server verifier: {e}")))?;
                builder.dangerous().with_custom_certificate_verifier(verifier)
            } else {
                builder.with_root_certificates(roots)
            }
        };

        let config = match &tls.certificate {
            Some(source) => {
                let (certs, key) = load_certificate(source)?;
                builder.with_client_auth_cert(certs, key)?
            }
            None => builder.with_no_client_auth(),
        };
        Ok(config)
    }

    /// Accept one TLS connection. Returns the wrapped stream and the
    /// peer's certificate when one was presented.
    pub async fn accept(
        acceptor: &TlsAcceptor,
        stream: TcpStream,
    ) -> Result<(IoStream, Option<Vec<u8>>), SessionError> {
        let tls_stream = acceptor.accept(stream).await.map_err(handshake_error)?;

        let peer_cert = tls_stream
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|cert| cert.as_ref().to_vec());

        debug!(
            "TLS connection accepted, peer cert present: {}",
            peer_cert.is_some()
        );
        Ok((IoStream::Tls(tls_stream), peer_cert))
    }

    /// Drive the client-side TLS handshake over a connected socket.
    pub async fn connect(
        config: Arc<ClientConfig>,
        stream: TcpStream,
        sni: &str,
    ) -> Result<(IoStream, Option<Vec<u8>>), SessionError> {
        let connector = TlsConnector::from(config);
        let server_name = ServerName::try_from(sni.to_owned())
            .map_err(|_| invalid(format!("invalid server name: {sni}")))?;

        let tls_stream = connector
            .connect(server_name, stream)
            .await
            .map_err(handshake_error)?;

        let peer_cert = tls_stream
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|cert| cert.as_ref().to_vec());

        debug!("TLS connection established to {}", sni);
        Ok((IoStream::TlsClient(tls_stream), peer_cert))
    }

    /// Derive a principal name from a certificate's subject common name.
    pub fn principal_from_cert(cert_der: &[u8]) -> Option<String> {
        let (_remaining, cert) = x509_parser::parse_x509_certificate(cert_der).ok()?;
        let name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_owned);
        name
    }
}

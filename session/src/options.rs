//! Session-level configuration.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use bytes::Bytes;
use rustls::client::danger::ServerCertVerifier;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::danger::ClientCertVerifier;

use crate::error::SessionError;
use tether_wire::{Endian, FrameFormat, DEFAULT_MAX_PAYLOAD};

/// Default timeout armed before each authentication phase.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Default payload marker for payload-aware sessions.
pub const DEFAULT_PAYLOAD_MARKER: &[u8] = &[0xAA, 0x55];

bitflags! {
    /// TLS protocol versions permitted during the handshake.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TlsProtocols: u8 {
        /// TLS 1.2
        const TLS12 = 1 << 0;
        /// TLS 1.3
        const TLS13 = 1 << 1;
    }
}

/// Client credentials presented during the integrated-security sub-handshake.
#[derive(Clone)]
pub struct Credentials {
    /// User name
    pub user: String,
    /// Shared secret
    pub secret: Bytes,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Caller-supplied certificate selection.
pub trait CertificateProvider: Send + Sync {
    /// Return the DER certificate chain and the matching private key.
    fn certificate(
        &self,
    ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), SessionError>;
}

/// Source of the local certificate chain and private key.
#[derive(Clone)]
pub enum CertificateSource {
    /// PEM files on disk
    Pem {
        /// Certificate chain file
        cert: PathBuf,
        /// Private key file
        key: PathBuf,
    },
    /// Caller-supplied selection callback
    Provided(Arc<dyn CertificateProvider>),
}

impl fmt::Debug for CertificateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CertificateSource::Pem { cert, key } => f
                .debug_struct("Pem")
                .field("cert", cert)
                .field("key", key)
                .finish(),
            CertificateSource::Provided(_) => f.write_str("Provided(..)"),
        }
    }
}

/// TLS material and validation hooks for one endpoint.
#[derive(Clone, Default)]
pub struct TlsOptions {
    /// Local certificate chain and key. Required on the server; optional on
    /// the client (client certificates).
    pub certificate: Option<CertificateSource>,
    /// Directory whose entries are loaded into the default validator's
    /// trust list at handshake start.
    pub trusted_cert_dir: Option<PathBuf>,
    /// CRL files consulted when certificate revocation checking is enabled.
    pub crl_files: Vec<PathBuf>,
    /// Server name for SNI on outbound connections. Defaults to the target
    /// IP address when unset.
    pub server_name: Option<String>,
    /// Caller-supplied remote-certificate validation hook (client side).
    /// Replaces the default trust-directory validator.
    pub server_cert_verifier: Option<Arc<dyn ServerCertVerifier>>,
    /// Caller-supplied client-certificate validation hook (server side).
    pub client_cert_verifier: Option<Arc<dyn ClientCertVerifier>>,
}

impl fmt::Debug for TlsOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsOptions")
            .field("certificate", &self.certificate)
            .field("trusted_cert_dir", &self.trusted_cert_dir)
            .field("crl_files", &self.crl_files)
            .field("server_name", &self.server_name)
            .field(
                "server_cert_verifier",
                &self.server_cert_verifier.as_ref().map(|_| ".."),
            )
            .field(
                "client_cert_verifier",
                &self.client_cert_verifier.as_ref().map(|_| ".."),
            )
            .finish()
    }
}

/// Configuration for sessions on either endpoint.
///
/// Server-only and client-only knobs are ignored by the other side.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Enable payload-aware framing
    pub payload_aware: bool,
    /// Marker prepended to each frame; empty degenerates to a pure length prefix
    pub payload_marker: Bytes,
    /// Byte order of the length field
    pub payload_endian: Endian,
    /// Enable the credential sub-handshake after TLS
    pub integrated_security: bool,
    /// Accept the connection even when credential auth fails
    pub ignore_invalid_credentials: bool,
    /// Bind IPv6 listen sockets in dual-stack mode
    pub allow_dual_stack_socket: bool,
    /// Queue bound before the drop policy dumps pending payloads; -1 disables
    pub max_send_queue_size: i32,
    /// Disable Nagle's algorithm
    pub no_delay: bool,
    /// TLS versions permitted during the handshake
    pub enabled_tls_protocols: TlsProtocols,
    /// Consult CRLs during certificate validation
    pub check_certificate_revocation: bool,
    /// Require and verify a client certificate (server)
    pub require_client_certificate: bool,
    /// Live-session limit before new peers are rejected (server); -1 unlimited
    pub max_client_connections: i32,
    /// Retries permitted while the connection is refused (client); -1
    /// unlimited, 0 disables retry
    pub max_connection_attempts: i32,
    /// Receive buffer size for unframed sessions and read chunking
    pub receive_buffer_size: usize,
    /// Bound on a single framed payload body
    pub max_payload_size: usize,
    /// Timeout armed before each authentication phase
    pub handshake_timeout: Duration,
    /// Client credentials for integrated security
    pub credentials: Option<Credentials>,
    /// TLS material; `None` runs plain TCP
    pub tls: Option<TlsOptions>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            payload_aware: true,
            payload_marker: Bytes::from_static(DEFAULT_PAYLOAD_MARKER),
            payload_endian: Endian::Little,
            integrated_security: false,
            ignore_invalid_credentials: false,
            allow_dual_stack_socket: false,
            max_send_queue_size: 10_000,
            no_delay: false,
            enabled_tls_protocols: TlsProtocols::TLS12 | TlsProtocols::TLS13,
            check_certificate_revocation: false,
            require_client_certificate: false,
            max_client_connections: -1,
            max_connection_attempts: -1,
            receive_buffer_size: 8 * 1024,
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            credentials: None,
            tls: None,
        }
    }
}

impl SessionOptions {
    /// The framing configuration for payload-aware sessions, `None` when
    /// the session runs unframed.
    pub fn frame_format(&self) -> Option<FrameFormat> {
        self.payload_aware
            .then(|| FrameFormat::new(self.payload_marker.clone(), self.payload_endian))
    }
}

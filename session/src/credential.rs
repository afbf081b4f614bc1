//! Post-TLS credential sub-handshake.
//!
//! When integrated security is enabled, the endpoints run one more
//! exchange over the freshly authenticated TLS stream before entering
//! steady state:
//!
//! ```text
//! client -> server:  u8 version || u16 user_len || user || u16 secret_len || secret
//! server -> client:  u8 status  (0 = accepted, 1 = rejected)
//! ```
//!
//! Length fields are big-endian and independent of the session's payload
//! framing configuration.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use bytes::{BufMut, BytesMut};

use crate::error::SessionError;
use crate::options::Credentials;

const CRED_VERSION: u8 = 1;
const STATUS_ACCEPTED: u8 = 0;
const STATUS_REJECTED: u8 = 1;

const MAX_USER_LEN: usize = 1024;
const MAX_SECRET_LEN: usize = 4096;

/// Authenticated identity bound to a session by the sub-handshake.
pub type Principal = String;

/// Server-side credential check.
///
/// Returns the authenticated principal, or `None` when the credentials
/// are invalid.
pub trait CredentialValidator: Send + Sync {
    /// Validate one user/secret pair.
    fn validate(&self, user: &str, secret: &[u8]) -> Option<Principal>;
}

/// Run the client side of the sub-handshake.
///
/// A rejected status is an error unless invalid credentials are tolerated.
pub async fn client_handshake<S>(
    stream: &mut S,
    credentials: &Credentials,
    ignore_invalid: bool,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if credentials.user.len() > MAX_USER_LEN || credentials.secret.len() > MAX_SECRET_LEN {
        return Err(SessionError::InvalidConfig(
            "credentials exceed the handshake size limits".into(),
        ));
    }

    let mut buf =
        BytesMut::with_capacity(1 + 2 + credentials.user.len() + 2 + credentials.secret.len());
    buf.put_u8(CRED_VERSION);
    buf.put_u16(credentials.user.len() as u16);
    buf.put_slice(credentials.user.as_bytes());
    buf.put_u16(credentials.secret.len() as u16);
    buf.put_slice(&credentials.secret);

    stream.write_all(&buf).await.map_err(SessionError::Socket)?;
    stream.flush().await.map_err(SessionError::Socket)?;

    let status = stream.read_u8().await.map_err(SessionError::Socket)?;
    match status {
        STATUS_ACCEPTED => {
            debug!("Credential handshake accepted for user {}", credentials.user);
            Ok(())
        }
        _ if ignore_invalid => {
            warn!(
                "Credentials for user {} rejected; continuing as configured",
                credentials.user
            );
            Ok(())
        }
        _ => Err(SessionError::BadCredentials),
    }
}

/// Run the server side of the sub-handshake.
///
/// Returns the authenticated principal, or `None` when invalid credentials
/// are tolerated by configuration.
pub async fn server_handshake<S>(
    stream: &mut S,
    validator: &dyn CredentialValidator,
    ignore_invalid: bool,
) -> Result<Option<Principal>, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let version = stream.read_u8().await.map_err(SessionError::Socket)?;
    if version != CRED_VERSION {
        warn!("Unsupported credential handshake version {}", version);
        return Err(SessionError::BadCredentials);
    }

    let user_len = stream.read_u16().await.map_err(SessionError::Socket)? as usize;
    if user_len > MAX_USER_LEN {
        return Err(SessionError::BadCredentials);
    }
    let mut user = vec![0u8; user_len];
    stream
        .read_exact(&mut user)
        .await
        .map_err(SessionError::Socket)?;
    let user = String::from_utf8(user).map_err(|_| SessionError::BadCredentials)?;

    let secret_len = stream.read_u16().await.map_err(SessionError::Socket)? as usize;
    if secret_len > MAX_SECRET_LEN {
        return Err(SessionError::BadCredentials);
    }
    let mut secret = vec![0u8; secret_len];
    stream
        .read_exact(&mut secret)
        .await
        .map_err(SessionError::Socket)?;

    match validator.validate(&user, &secret) {
        Some(principal) => {
            stream
                .write_all(&[STATUS_ACCEPTED])
                .await
                .map_err(SessionError::Socket)?;
            stream.flush().await.map_err(SessionError::Socket)?;
            debug!("Authenticated principal {}", principal);
            Ok(Some(principal))
        }
        None if ignore_invalid => {
            stream
                .write_all(&[STATUS_ACCEPTED])
                .await
                .map_err(SessionError::Socket)?;
            stream.flush().await.map_err(SessionError::Socket)?;
            warn!("Invalid credentials for user {} tolerated", user);
            Ok(None)
        }
        None => {
            stream
                .write_all(&[STATUS_REJECTED])
                .await
                .map_err(SessionError::Socket)?;
            stream.flush().await.map_err(SessionError::Socket)?;
            Err(SessionError::BadCredentials)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    struct FixedValidator;

    impl CredentialValidator for FixedValidator {
        fn validate(&self, user: &str, secret: &[u8]) -> Option<Principal> {
            (user == "svc" && secret == b"s3cret").then(|| user.to_owned())
        }
    }

    fn credentials(user: &str, secret: &'static [u8]) -> Credentials {
        Credentials {
            user: user.to_owned(),
            secret: Bytes::from_static(secret),
        }
    }

    #[tokio::test]
    async fn test_accepted_credentials_bind_principal() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let client_task = tokio::spawn(async move {
            client_handshake(&mut client, &credentials("svc", b"s3cret"), false).await
        });
        let principal = server_handshake(&mut server, &FixedValidator, false)
            .await
            .unwrap();

        assert_eq!(principal.as_deref(), Some("svc"));
        client_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_rejected_credentials_fail_both_sides() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let client_task = tokio::spawn(async move {
            client_handshake(&mut client, &credentials("svc", b"wrong"), false).await
        });
        let server_result = server_handshake(&mut server, &FixedValidator, false).await;

        assert!(matches!(server_result, Err(SessionError::BadCredentials)));
        assert!(matches!(
            client_task.await.unwrap(),
            Err(SessionError::BadCredentials)
        ));
    }

    #[tokio::test]
    async fn test_invalid_credentials_tolerated_without_principal() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let client_task = tokio::spawn(async move {
            client_handshake(&mut client, &credentials("svc", b"wrong"), true).await
        });
        let principal = server_handshake(&mut server, &FixedValidator, true)
            .await
            .unwrap();

        assert!(principal.is_none());
        client_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unknown_version_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut client, &[9, 0, 0, 0, 0])
            .await
            .unwrap();

        let result = server_handshake(&mut server, &FixedValidator, false).await;
        assert!(matches!(result, Err(SessionError::BadCredentials)));
    }
}

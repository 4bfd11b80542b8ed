//! TLS context and server-side handshakes

use std::io::BufReader as StdBufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rustls::cipher_suite::{
    TLS13_AES_128_GCM_SHA256, TLS13_AES_256_GCM_SHA384, TLS13_CHACHA20_POLY1305_SHA256,
    TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256, TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
    TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256, TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
    TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384, TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
};
use rustls::version::{TLS12, TLS13};
use rustls::{Certificate, PrivateKey, ServerConfig, SupportedCipherSuite};
use rustls_pemfile::Item;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

use crate::error::{Error, Result, SessionError};

/// Builds the acceptor shared by every session of a server.
pub fn load_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let cert_chain = load_certs(cert_path)?;
    let private_key = load_private_key(key_path)?;

    // AEAD suites with forward secrecy only, strongest first.
    let suites: [SupportedCipherSuite; 9] = [
        TLS13_AES_256_GCM_SHA384,
        TLS13_AES_128_GCM_SHA256,
        TLS13_CHACHA20_POLY1305_SHA256,
        TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
        TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
        TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
        TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
        TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
    ];

    let config = ServerConfig::builder()
        .with_cipher_suites(&suites)
        .with_safe_default_kx_groups()
        .with_protocol_versions(&[&TLS13, &TLS12])
        .map_err(|e| Error::Tls(format!("Unsupported protocol versions: {}", e)))?
        .with_no_client_auth()
        .with_single_cert(cert_chain, private_key)
        .map_err(|e| Error::Tls(format!("Failed to build TLS config: {}", e)))?;

    tracing::info!(certificate = %cert_path.display(), "TLS context loaded");
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &Path) -> Result<Vec<Certificate>> {
    let file = std::fs::File::open(path)
        .map_err(|e| Error::Tls(format!("Failed to open certificate {:?}: {}", path, e)))?;
    let mut reader = StdBufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .map_err(|e| Error::Tls(format!("Failed to parse certificate {:?}: {}", path, e)))?;

    if certs.is_empty() {
        return Err(Error::Tls(format!("No certificate found in {:?}", path)));
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

fn load_private_key(path: &Path) -> Result<PrivateKey> {
    let file = std::fs::File::open(path)
        .map_err(|e| Error::Tls(format!("Failed to open private key {:?}: {}", path, e)))?;
    let mut reader = StdBufReader::new(file);
    let items = rustls_pemfile::read_all(&mut reader)
        .map_err(|e| Error::Tls(format!("Failed to parse private key {:?}: {}", path, e)))?;

    items
        .into_iter()
        .find_map(|item| match item {
            Item::PKCS8Key(key) | Item::RSAKey(key) | Item::ECKey(key) => Some(PrivateKey(key)),
            _ => None,
        })
        .ok_or_else(|| Error::Tls(format!("No private key found in {:?}", path)))
}

/// Runs the server side of a handshake, giving up after `limit`.
pub async fn accept<IO>(
    acceptor: &TlsAcceptor,
    stream: IO,
    limit: Duration,
) -> std::result::Result<TlsStream<IO>, SessionError>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    match time::timeout(limit, acceptor.accept(stream)).await {
        Ok(Ok(tls_stream)) => {
            let (_, connection) = tls_stream.get_ref();
            tracing::debug!(
                version = ?connection.protocol_version(),
                cipher = ?connection.negotiated_cipher_suite().map(|s| s.suite()),
                "TLS handshake complete"
            );
            Ok(tls_stream)
        }
        Ok(Err(e)) => Err(SessionError::Handshake(e)),
        Err(_) => Err(SessionError::HandshakeTimeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("smtp-inbox-tls-{}-{}", name, uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn missing_files_are_fatal() {
        let dir = scratch_dir("missing");
        let err = load_acceptor(&dir.join("cert.pem"), &dir.join("key.pem")).err().unwrap();
        assert!(matches!(err, Error::Tls(_)));
    }

    #[test]
    fn garbage_pem_is_rejected() {
        let dir = scratch_dir("garbage");
        let cert = dir.join("cert.pem");
        let key = dir.join("key.pem");
        std::fs::write(&cert, "not a certificate").unwrap();
        std::fs::write(&key, "not a key").unwrap();
        assert!(load_acceptor(&cert, &key).is_err());
    }

    #[test]
    fn loads_self_signed_pair() {
        let dir = scratch_dir("valid");
        let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert = dir.join("cert.pem");
        let key = dir.join("key.pem");
        std::fs::write(&cert, generated.cert.pem()).unwrap();
        std::fs::write(&key, generated.key_pair.serialize_pem()).unwrap();
        assert!(load_acceptor(&cert, &key).is_ok());
    }

    #[test]
    fn certificate_without_key_is_rejected() {
        let dir = scratch_dir("nokey");
        let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert = dir.join("cert.pem");
        std::fs::write(&cert, generated.cert.pem()).unwrap();
        let err = load_acceptor(&cert, &cert).err().unwrap();
        assert!(err.to_string().contains("No private key"));
    }
}

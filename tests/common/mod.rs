#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use smtp_inbox::{MailStore, ServerHandle, SmtpConfig, SmtpServer, StorageError, StoredEmail};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

const IO_LIMIT: Duration = Duration::from_secs(5);

/// Records every store call; can be switched to fail.
#[derive(Default)]
pub struct RecordingStore {
    calls: Mutex<Vec<StoredEmail>>,
    fail: AtomicBool,
}

impl RecordingStore {
    pub fn failing() -> Self {
        let store = Self::default();
        store.fail.store(true, Ordering::SeqCst);
        store
    }

    pub fn calls(&self) -> Vec<StoredEmail> {
        self.calls.lock().unwrap().clone()
    }
}

impl MailStore for RecordingStore {
    fn store_email(&self, from: &str, to: &[String], body: &[u8]) -> Result<String, StorageError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("disk on fire".to_string()));
        }
        let mut calls = self.calls.lock().unwrap();
        let id = format!("msg-{}", calls.len() + 1);
        calls.push(StoredEmail {
            id: id.clone(),
            from: from.to_string(),
            to: to.to_vec(),
            date: String::new(),
            body: body.to_vec(),
        });
        Ok(id)
    }

    fn get_emails(&self) -> Result<Vec<StoredEmail>, StorageError> {
        Ok(self.calls())
    }

    fn get_email(&self, id: &str) -> Result<StoredEmail, StorageError> {
        self.calls()
            .into_iter()
            .find(|email| email.id == id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }
}

pub fn plain_config() -> SmtpConfig {
    SmtpConfig {
        host: "127.0.0.1".to_string(),
        port: Some(0),
        domain: "mx.test".to_string(),
        ..SmtpConfig::default()
    }
}

pub struct TestCert {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub pem: String,
}

/// Writes a fresh self-signed `localhost` certificate to a scratch directory.
pub fn test_cert() -> TestCert {
    let dir = std::env::temp_dir().join(format!("smtp-inbox-test-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();

    let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let pem = generated.cert.pem();
    let cert = dir.join("cert.pem");
    let key = dir.join("key.pem");
    std::fs::write(&cert, &pem).unwrap();
    std::fs::write(&key, generated.key_pair.serialize_pem()).unwrap();
    TestCert { cert, key, pem }
}

pub fn tls_config(cert: &TestCert) -> SmtpConfig {
    SmtpConfig {
        tls_enable: true,
        cert_file: Some(cert.cert.clone()),
        key_file: Some(cert.key.clone()),
        handshake_timeout: Duration::from_secs(1),
        ..plain_config()
    }
}

pub async fn start(config: SmtpConfig, store: Arc<dyn MailStore>) -> ServerHandle {
    SmtpServer::bind(config, store).await.unwrap().spawn()
}

pub fn connector(cert: &TestCert) -> TlsConnector {
    let mut roots = rustls::RootCertStore::empty();
    for der in rustls_pemfile::certs(&mut cert.pem.as_bytes()).unwrap() {
        roots.add(&rustls::Certificate(der)).unwrap();
    }
    let config = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

pub async fn tls_handshake(connector: &TlsConnector, stream: TcpStream) -> TlsStream<TcpStream> {
    let name = rustls::ServerName::try_from("localhost").unwrap();
    tokio::time::timeout(IO_LIMIT, connector.connect(name, stream))
        .await
        .expect("TLS handshake timed out")
        .expect("TLS handshake failed")
}

/// Line-oriented SMTP client over any stream.
pub struct Client<S> {
    io: BufReader<S>,
}

impl Client<TcpStream> {
    pub async fn connect(handle: &ServerHandle) -> Self {
        let stream = TcpStream::connect(handle.local_addr()).await.unwrap();
        Self::new(stream)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Client<S> {
    pub fn new(stream: S) -> Self {
        Self {
            io: BufReader::new(stream),
        }
    }

    pub fn into_inner(self) -> S {
        self.io.into_inner()
    }

    pub async fn send(&mut self, data: &str) {
        self.send_bytes(data.as_bytes()).await;
    }

    pub async fn send_bytes(&mut self, data: &[u8]) {
        self.io.write_all(data).await.unwrap();
        self.io.flush().await.unwrap();
    }

    /// Reads one full reply, multiline replies included, with terminators.
    pub async fn reply(&mut self) -> String {
        let mut reply = String::new();
        loop {
            let mut line = String::new();
            let n = tokio::time::timeout(IO_LIMIT, self.io.read_line(&mut line))
                .await
                .expect("timed out waiting for reply")
                .unwrap();
            assert!(n > 0, "connection closed, got so far: {:?}", reply);
            reply.push_str(&line);
            if line.as_bytes().get(3) != Some(&b'-') {
                return reply;
            }
        }
    }

    pub async fn command(&mut self, line: &str) -> String {
        self.send(&format!("{}\r\n", line)).await;
        self.reply().await
    }

    /// Reads whatever arrives until EOF, error or `limit`.
    pub async fn drain(&mut self, limit: Duration) -> Vec<u8> {
        let mut received = Vec::new();
        let mut chunk = [0u8; 512];
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            match tokio::time::timeout_at(deadline, self.io.read(&mut chunk)).await {
                Ok(Ok(0)) | Ok(Err(_)) | Err(_) => return received,
                Ok(Ok(n)) => received.extend_from_slice(&chunk[..n]),
            }
        }
    }
}

//! Error types for smtp-inbox

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Server construction and listener errors.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Accept error on {addr}: {source}")]
    Accept {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Server task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failures reported by a [`MailStore`](crate::store::MailStore).
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Message rejected: {0}")]
    Rejected(&'static str),

    #[error("Message not found: {0}")]
    NotFound(String),

    #[error("Invalid stored message {id}: {reason}")]
    Corrupt { id: String, reason: &'static str },

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Conditions that end a single SMTP connection.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Client idle for more than {0:?}")]
    Timeout(std::time::Duration),

    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] io::Error),

    #[error("TLS handshake timed out")]
    HandshakeTimeout,

    #[error("TLS requested but no TLS context is loaded")]
    TlsUnavailable,
}

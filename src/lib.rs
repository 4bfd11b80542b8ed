//! SMTP submission server with STARTTLS, implicit TLS and pluggable storage.
//!
//! ```no_run
//! use std::sync::Arc;
//! use smtp_inbox::{MemoryStore, SmtpConfig, SmtpServer};
//!
//! # async fn run() -> smtp_inbox::Result<()> {
//! let config = SmtpConfig {
//!     port: Some(2525),
//!     ..SmtpConfig::default()
//! };
//! let server = SmtpServer::bind(config, Arc::new(MemoryStore::new())).await?;
//! let handle = server.spawn();
//! // ...
//! handle.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod command;
pub mod config;
mod connection;
pub mod error;
pub mod reply;
pub mod server;
pub mod session;
pub mod store;
pub mod tls;
pub mod utils;

pub use config::SmtpConfig;
pub use connection::MAX_LINE_LENGTH;
pub use error::{Error, Result, SessionError, StorageError};
pub use reply::Reply;
pub use server::{ServerHandle, SmtpServer};
pub use session::{Capabilities, Effect, Envelope, SmtpSession, Transition};
pub use store::{FileStore, MailStore, MemoryStore, StoredEmail};

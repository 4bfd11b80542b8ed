//! Server configuration

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Default port for plaintext SMTP (STARTTLS may still be offered).
pub const SMTP_PORT: u16 = 25;
/// Default port for SMTP submission over implicit TLS.
pub const SUBMISSIONS_PORT: u16 = 465;

/// Immutable settings for one SMTP listener.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    /// `None` picks the default for the TLS mode, `Some(0)` an ephemeral port.
    pub port: Option<u16>,
    /// Name used in the banner and EHLO reply.
    pub domain: String,
    /// Largest accepted message body in bytes.
    pub max_size: usize,
    pub tls_enable: bool,
    /// Handshake before the banner instead of offering STARTTLS.
    pub implicit_tls: bool,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    /// Longest wait for the next client line, refreshed after every read.
    pub command_timeout: Duration,
    pub handshake_timeout: Duration,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: None,
            domain: "localhost".to_string(),
            max_size: 10 * 1024 * 1024,
            tls_enable: false,
            implicit_tls: false,
            cert_file: None,
            key_file: None,
            command_timeout: Duration::from_secs(300),
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

impl SmtpConfig {
    pub fn listen_addr(&self) -> String {
        let port = self.port.unwrap_or(if self.implicit_tls {
            SUBMISSIONS_PORT
        } else {
            SMTP_PORT
        });
        format!("{}:{}", self.host, port)
    }

    pub fn validate(&self) -> Result<()> {
        if self.implicit_tls && !self.tls_enable {
            return Err(Error::Config(
                "implicit TLS requires TLS to be enabled".to_string(),
            ));
        }
        if self.tls_enable && (self.cert_file.is_none() || self.key_file.is_none()) {
            return Err(Error::Config(
                "TLS enabled but certificate or key file missing".to_string(),
            ));
        }
        if self.max_size == 0 {
            return Err(Error::Config("max_size must be positive".to_string()));
        }
        Ok(())
    }
}

//! SMTP replies

use std::fmt;

/// A numeric reply, possibly spanning several lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            lines: vec![text.into()],
        }
    }

    pub fn multiline(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    pub fn banner(domain: &str) -> Self {
        Self::new(220, format!("{} ESMTP Service Ready", domain))
    }

    pub fn ok() -> Self {
        Self::new(250, "OK")
    }

    pub fn message_accepted() -> Self {
        Self::new(250, "OK: Message accepted")
    }

    pub fn cannot_verify() -> Self {
        Self::new(
            252,
            "Cannot VRFY user, but will accept message and attempt delivery",
        )
    }

    pub fn bye() -> Self {
        Self::new(221, "Bye")
    }

    pub fn start_data() -> Self {
        Self::new(354, "End data with <CR><LF>.<CR><LF>")
    }

    pub fn ready_for_tls() -> Self {
        Self::new(220, "Ready to start TLS")
    }

    pub fn tls_not_available() -> Self {
        Self::new(421, "TLS not available")
    }

    pub fn shutting_down(domain: &str) -> Self {
        Self::new(421, format!("{} Service shutting down", domain))
    }

    pub fn local_error() -> Self {
        Self::new(451, "Requested action aborted: local error in processing")
    }

    pub fn unknown_command() -> Self {
        Self::new(500, "Unknown command")
    }

    pub fn line_too_long() -> Self {
        Self::new(500, "Line too long")
    }

    pub fn syntax_error() -> Self {
        Self::new(501, "Syntax error in parameters or arguments")
    }

    pub fn bad_sequence() -> Self {
        Self::new(503, "Bad sequence of commands")
    }

    pub fn tls_already_active() -> Self {
        Self::new(503, "TLS already active")
    }

    pub fn message_too_big() -> Self {
        Self::new(552, "Message size exceeds fixed maximum message size")
    }

    /// Whether the reply signals success (2xx or 3xx).
    pub fn is_positive(&self) -> bool {
        self.code < 400
    }
}

/// Renders the wire form, every line CRLF-terminated.
impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let last = self.lines.len().saturating_sub(1);
        if self.lines.is_empty() {
            return write!(f, "{}\r\n", self.code);
        }
        for (i, line) in self.lines.iter().enumerate() {
            let sep = if i == last { ' ' } else { '-' };
            write!(f, "{}{}{}\r\n", self.code, sep, line)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_line() {
        assert_eq!(Reply::ok().to_string(), "250 OK\r\n");
        assert_eq!(Reply::unknown_command().to_string(), "500 Unknown command\r\n");
    }

    #[test]
    fn multiline_uses_dash_until_last_line() {
        let reply = Reply::multiline(
            250,
            vec!["mx.test Hello a.com".into(), "8BITMIME".into(), "OK".into()],
        );
        assert_eq!(
            reply.to_string(),
            "250-mx.test Hello a.com\r\n250-8BITMIME\r\n250 OK\r\n"
        );
    }

    #[test]
    fn positive_codes() {
        assert!(Reply::start_data().is_positive());
        assert!(!Reply::local_error().is_positive());
    }
}

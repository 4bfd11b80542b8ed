//! Per-connection SMTP state and its transition function

use std::mem;

use crate::command::{Command, ParseError};
use crate::reply::Reply;

/// What the server offers to every session it runs.
#[derive(Debug, Clone)]
pub struct Capabilities {
    pub domain: String,
    pub max_size: usize,
    /// A TLS context is loaded and STARTTLS can be served.
    pub tls_available: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Phase {
    #[default]
    Command,
    Data,
}

/// A finished message ready for the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub sender: String,
    pub recipients: Vec<String>,
    /// Message bytes exactly as received, dot-unstuffed, CRLF line endings.
    pub body: Vec<u8>,
}

/// Work the connection must do after writing the reply, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    None,
    /// Store the message and answer with 250 or 451.
    Deliver(Envelope),
    /// Run the TLS handshake on the current socket.
    StartTls,
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub reply: Option<Reply>,
    pub effect: Effect,
}

impl Transition {
    fn reply(reply: Reply) -> Self {
        Self {
            reply: Some(reply),
            effect: Effect::None,
        }
    }

    fn silent() -> Self {
        Self {
            reply: None,
            effect: Effect::None,
        }
    }
}

#[derive(Debug, Default)]
pub struct SmtpSession {
    sender: Option<String>,
    recipients: Vec<String>,
    body: Vec<u8>,
    phase: Phase,
    client: Option<String>,
    tls_active: bool,
    oversized: bool,
}

impl SmtpSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// The sender of the open transaction, empty until `MAIL FROM`.
    pub fn sender(&self) -> &str {
        self.sender.as_deref().unwrap_or_default()
    }

    pub fn recipients(&self) -> &[String] {
        &self.recipients
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn client(&self) -> Option<&str> {
        self.client.as_deref()
    }

    pub fn tls_active(&self) -> bool {
        self.tls_active
    }

    /// Clears the mail transaction.
    pub fn reset(&mut self) {
        self.sender = None;
        self.recipients.clear();
        self.body.clear();
        self.oversized = false;
        self.phase = Phase::Command;
    }

    /// Called once the channel is encrypted. Nothing said in plaintext
    /// survives the upgrade, the client has to greet again.
    pub fn tls_established(&mut self) {
        self.reset();
        self.client = None;
        self.tls_active = true;
    }

    /// Feeds one received line (terminator removed) through the state machine.
    ///
    /// Command lines are read as text. DATA lines are kept byte for byte, so
    /// 8-bit bodies reach the store unchanged.
    pub fn handle(&mut self, line: &[u8], caps: &Capabilities) -> Transition {
        match self.phase() {
            Phase::Data => self.handle_data_line(line, caps),
            Phase::Command => match Command::parse(&String::from_utf8_lossy(line)) {
                Ok(command) => self.handle_command(command, caps),
                Err(ParseError::Unknown) => Transition::reply(Reply::unknown_command()),
                Err(ParseError::Syntax) => Transition::reply(Reply::syntax_error()),
            },
        }
    }

    fn handle_command(&mut self, command: Command, caps: &Capabilities) -> Transition {
        match command {
            Command::Ehlo(client) => {
                let mut lines = vec![
                    format!("{} Hello {}", caps.domain, client),
                    format!("SIZE {}", caps.max_size),
                    "8BITMIME".to_string(),
                    "SMTPUTF8".to_string(),
                ];
                if caps.tls_available && !self.tls_active {
                    lines.push("STARTTLS".to_string());
                }
                lines.push("OK".to_string());
                self.reset();
                self.client = Some(client);
                Transition::reply(Reply::multiline(250, lines))
            }
            Command::Helo(client) => {
                let reply = Reply::new(250, format!("{} Hello {}", caps.domain, client));
                self.reset();
                self.client = Some(client);
                Transition::reply(reply)
            }
            Command::Mail { from, size } => {
                if size.is_some_and(|size| size > caps.max_size) {
                    return Transition::reply(Reply::message_too_big());
                }
                // A new MAIL starts a new transaction.
                self.reset();
                self.sender = Some(from);
                Transition::reply(Reply::ok())
            }
            Command::Rcpt(to) => {
                if self.sender.is_none() {
                    return Transition::reply(Reply::bad_sequence());
                }
                self.recipients.push(to);
                Transition::reply(Reply::ok())
            }
            Command::Data => {
                if self.sender.is_none() || self.recipients.is_empty() {
                    return Transition::reply(Reply::bad_sequence());
                }
                self.body.clear();
                self.oversized = false;
                self.phase = Phase::Data;
                Transition::reply(Reply::start_data())
            }
            Command::StartTls => {
                if !caps.tls_available {
                    Transition::reply(Reply::tls_not_available())
                } else if self.tls_active {
                    Transition::reply(Reply::tls_already_active())
                } else {
                    Transition {
                        reply: Some(Reply::ready_for_tls()),
                        effect: Effect::StartTls,
                    }
                }
            }
            Command::Rset => {
                self.reset();
                Transition::reply(Reply::ok())
            }
            Command::Noop => Transition::reply(Reply::ok()),
            Command::Vrfy => Transition::reply(Reply::cannot_verify()),
            Command::Quit => Transition {
                reply: Some(Reply::bye()),
                effect: Effect::Close,
            },
        }
    }

    fn handle_data_line(&mut self, line: &[u8], caps: &Capabilities) -> Transition {
        if line == b"." {
            let oversized = self.oversized;
            let envelope = Envelope {
                sender: self.sender.take().unwrap_or_default(),
                recipients: mem::take(&mut self.recipients),
                body: mem::take(&mut self.body),
            };
            self.reset();
            if oversized {
                return Transition::reply(Reply::message_too_big());
            }
            return Transition {
                reply: None,
                effect: Effect::Deliver(envelope),
            };
        }

        let line = line.strip_prefix(b".").unwrap_or(line);
        if self.oversized || self.body.len() + line.len() + 2 > caps.max_size {
            // Keep reading up to the terminator but stop buffering.
            self.oversized = true;
            self.body.clear();
        } else {
            self.body.extend_from_slice(line);
            self.body.extend_from_slice(b"\r\n");
        }
        Transition::silent()
    }
}

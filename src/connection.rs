//! Drives one client connection from banner to close

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::config::SmtpConfig;
use crate::error::SessionError;
use crate::reply::Reply;
use crate::session::{Capabilities, Effect, Envelope, Phase, SmtpSession};
use crate::store::MailStore;
use crate::tls;
use crate::utils::{escape_for_log, truncate_for_log};

/// Longest accepted line, terminator included.
pub const MAX_LINE_LENGTH: usize = 8192;

/// Why the command loop stopped.
#[derive(Debug, PartialEq, Eq)]
enum Exit {
    Closed,
    StartTls,
}

enum Line {
    Text(Vec<u8>),
    TooLong,
    Eof,
    Shutdown,
}

pub(crate) struct Connection {
    pub config: Arc<SmtpConfig>,
    pub caps: Arc<Capabilities>,
    pub store: Arc<dyn MailStore>,
    pub tls: Option<TlsAcceptor>,
    pub cancel: CancellationToken,
}

impl Connection {
    pub async fn run(self, stream: TcpStream) -> Result<(), SessionError> {
        let mut session = SmtpSession::new();

        if self.config.implicit_tls {
            let acceptor = self.tls.as_ref().ok_or(SessionError::TlsUnavailable)?;
            tracing::debug!("starting implicit TLS handshake");
            let stream = tls::accept(acceptor, stream, self.config.handshake_timeout).await?;
            session.tls_established();

            let mut io = BufReader::new(stream);
            self.write_reply(&mut io, &Reply::banner(&self.config.domain)).await?;
            self.command_loop(&mut io, &mut session).await?;
            return Ok(());
        }

        let mut io = BufReader::new(stream);
        self.write_reply(&mut io, &Reply::banner(&self.config.domain)).await?;
        if self.command_loop(&mut io, &mut session).await? == Exit::Closed {
            return Ok(());
        }

        let acceptor = self.tls.as_ref().ok_or(SessionError::TlsUnavailable)?;
        // Anything the client pipelined behind STARTTLS is dropped with the buffer.
        let stream = io.into_inner();
        let stream = tls::accept(acceptor, stream, self.config.handshake_timeout).await?;
        session.tls_established();
        tracing::info!("connection upgraded to TLS");

        let mut io = BufReader::new(stream);
        self.command_loop(&mut io, &mut session).await?;
        Ok(())
    }

    async fn command_loop<S>(
        &self,
        io: &mut BufReader<S>,
        session: &mut SmtpSession,
    ) -> Result<Exit, SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let line = match self.read_line(io).await? {
                Line::Text(line) => line,
                Line::Eof => {
                    if session.phase() == Phase::Data {
                        tracing::info!("client disconnected during DATA, message discarded");
                    }
                    return Ok(Exit::Closed);
                }
                Line::TooLong => {
                    self.write_reply(io, &Reply::line_too_long()).await?;
                    return Ok(Exit::Closed);
                }
                Line::Shutdown => {
                    self.write_reply(io, &Reply::shutting_down(&self.config.domain))
                        .await?;
                    return Ok(Exit::Closed);
                }
            };

            if session.phase() == Phase::Command {
                tracing::debug!(">> {}", truncate_for_log(&String::from_utf8_lossy(&line), 512));
            }

            let transition = session.handle(&line, &self.caps);
            if let Some(reply) = &transition.reply {
                self.write_reply(io, reply).await?;
            }

            match transition.effect {
                Effect::None => {}
                Effect::Deliver(envelope) => {
                    let reply = self.deliver(envelope).await;
                    self.write_reply(io, &reply).await?;
                }
                Effect::StartTls if !session.tls_active() => return Ok(Exit::StartTls),
                Effect::StartTls => return Ok(Exit::Closed),
                Effect::Close => return Ok(Exit::Closed),
            }
        }
    }

    async fn deliver(&self, envelope: Envelope) -> Reply {
        let store = Arc::clone(&self.store);
        let sender = envelope.sender.clone();
        let recipients = envelope.recipients.len();
        let result = tokio::task::spawn_blocking(move || {
            store.store_email(&envelope.sender, &envelope.recipients, &envelope.body)
        })
        .await;

        match result {
            Ok(Ok(id)) => {
                tracing::info!(
                    id = %id,
                    from = %escape_for_log(&sender),
                    recipients,
                    "message accepted"
                );
                Reply::message_accepted()
            }
            Ok(Err(e)) => {
                tracing::error!(from = %escape_for_log(&sender), "failed to store message: {}", e);
                Reply::local_error()
            }
            Err(e) => {
                tracing::error!("store task failed: {}", e);
                Reply::local_error()
            }
        }
    }

    async fn read_line<S>(&self, io: &mut BufReader<S>) -> Result<Line, SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut buf = Vec::new();
        let limit = self.config.command_timeout;
        let read = async {
            let mut limited = (&mut *io).take(MAX_LINE_LENGTH as u64);
            limited.read_until(b'\n', &mut buf).await
        };

        let n = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(Line::Shutdown),
            res = time::timeout(limit, read) => match res {
                Ok(res) => res?,
                Err(_) => return Err(SessionError::Timeout(limit)),
            },
        };

        if n == 0 {
            return Ok(Line::Eof);
        }
        if buf.last() != Some(&b'\n') {
            return Ok(if n >= MAX_LINE_LENGTH {
                Line::TooLong
            } else {
                Line::Eof
            });
        }

        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
        Ok(Line::Text(buf))
    }

    async fn write_reply<S>(&self, io: &mut BufReader<S>, reply: &Reply) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let wire = reply.to_string();
        tracing::debug!("<< {}", wire.trim_end());
        let limit = self.config.command_timeout;
        let write = async {
            io.write_all(wire.as_bytes()).await?;
            io.flush().await
        };
        match time::timeout(limit, write).await {
            Ok(res) => Ok(res?),
            Err(_) => Err(SessionError::Timeout(limit)),
        }
    }
}

//! Listener, accept loop and server handles

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use crate::config::SmtpConfig;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::session::Capabilities;
use crate::store::MailStore;
use crate::tls;

/// A bound SMTP listener, ready to serve.
pub struct SmtpServer {
    config: Arc<SmtpConfig>,
    caps: Arc<Capabilities>,
    store: Arc<dyn MailStore>,
    tls_acceptor: Option<TlsAcceptor>,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl SmtpServer {
    /// Loads the TLS context (when enabled) and binds the listening socket.
    /// Both failures are fatal: nothing is served with a broken setup.
    pub async fn bind(config: SmtpConfig, store: Arc<dyn MailStore>) -> Result<Self> {
        config.validate()?;

        let tls_acceptor = match (&config.cert_file, &config.key_file) {
            (Some(cert), Some(key)) if config.tls_enable => Some(tls::load_acceptor(cert, key)?),
            _ => None,
        };

        let addr = config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| Error::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        tracing::info!(
            addr = %local_addr,
            max_size = config.max_size,
            tls = tls_acceptor.is_some(),
            implicit_tls = config.implicit_tls,
            "SMTP listener bound"
        );

        let caps = Capabilities {
            domain: config.domain.clone(),
            max_size: config.max_size,
            // Implicit TLS sessions are encrypted from the start and never upgrade.
            tls_available: tls_acceptor.is_some(),
        };

        Ok(Self {
            config: Arc::new(config),
            caps: Arc::new(caps),
            store,
            tls_acceptor,
            listener,
            local_addr,
        })
    }

    /// The bound address; resolves an ephemeral port request.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts connections until `shutdown` fires.
    ///
    /// Every connection runs in its own task with a child token of
    /// `shutdown`, so cancelling also ends in-flight sessions. Returns once
    /// the listener is closed and all sessions have finished. An accept error
    /// stops the loop and is returned.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        let tracker = TaskTracker::new();
        let sessions = shutdown.child_token();
        let local_addr = self.local_addr;
        let result = self.accept_loop(&shutdown, &sessions, &tracker).await;
        drop(self);
        if let Err(e) = &result {
            tracing::error!(addr = %local_addr, "accept loop failed: {}", e);
        }

        // Accept failures also end the sessions of this listener.
        sessions.cancel();
        tracker.close();
        tracker.wait().await;
        tracing::info!(addr = %local_addr, "SMTP listener stopped");
        result
    }

    async fn accept_loop(
        &self,
        shutdown: &CancellationToken,
        sessions: &CancellationToken,
        tracker: &TaskTracker,
    ) -> Result<()> {
        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                accepted = self.listener.accept() => accepted.map_err(|source| Error::Accept {
                    addr: self.local_addr,
                    source,
                })?,
            };

            let connection = Connection {
                config: Arc::clone(&self.config),
                caps: Arc::clone(&self.caps),
                store: Arc::clone(&self.store),
                tls: self.tls_acceptor.clone(),
                cancel: sessions.child_token(),
            };
            let span = tracing::info_span!("smtp", peer = %peer);

            tracker.spawn(
                async move {
                    tracing::info!("connection opened");
                    match connection.run(stream).await {
                        Ok(()) => tracing::info!("connection closed"),
                        Err(e) => tracing::warn!("connection aborted: {}", e),
                    }
                }
                .instrument(span),
            );
        }
    }

    /// Serves in a background task and returns a handle to stop it.
    pub fn spawn(self) -> ServerHandle {
        let shutdown = CancellationToken::new();
        let stopped = CancellationToken::new();
        let local_addr = self.local_addr;

        let on_exit = stopped.clone().drop_guard();
        let serve = self.serve(shutdown.clone());
        let task = tokio::spawn(async move {
            let _on_exit = on_exit;
            serve.await
        });
        ServerHandle {
            local_addr,
            shutdown,
            stopped,
            task,
        }
    }
}

/// Owns a running server: its address, its cancellation token and its task.
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    stopped: CancellationToken,
    task: JoinHandle<Result<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// A token cancelled once the server task has ended, for any reason.
    /// `wait` or `shutdown` then returns the outcome.
    pub fn stopped(&self) -> CancellationToken {
        self.stopped.clone()
    }

    /// Stops accepting, ends open sessions and waits for the server task.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.cancel();
        self.task.await?
    }

    /// Waits for the server to stop on its own, e.g. after an accept error.
    pub async fn wait(self) -> Result<()> {
        self.task.await?
    }
}

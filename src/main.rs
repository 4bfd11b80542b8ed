use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use structopt::StructOpt;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use smtp_inbox::{FileStore, MailStore, ServerHandle, SmtpConfig, SmtpServer};

#[derive(Debug, StructOpt, Clone)]
#[structopt(
    name = "smtp-inbox",
    about = "An SMTP submission server storing received mail on disk"
)]
pub struct Opt {
    /// Listening address
    #[structopt(short = "a", long = "address", default_value = "0.0.0.0")]
    pub address: String,

    /// Listening ports (repeatable; default 25, or 465 with --implicit-tls)
    #[structopt(short = "p", long = "port", number_of_values = 1)]
    pub ports: Vec<u16>,

    /// Run the TLS handshake before the banner instead of offering STARTTLS
    #[structopt(long = "implicit-tls")]
    pub implicit_tls: bool,

    /// Domain announced in the banner and EHLO reply
    #[structopt(long = "domain", default_value = "localhost")]
    pub domain: String,

    /// Maximum message size in bytes
    #[structopt(long = "max-size", default_value = "10485760")]
    pub max_size: usize,

    /// TLS certificate file (PEM); enables TLS together with --tls-key
    #[structopt(long = "tls-cert", parse(from_os_str))]
    pub tls_cert: Option<PathBuf>,

    /// TLS private key file (PEM)
    #[structopt(long = "tls-key", parse(from_os_str))]
    pub tls_key: Option<PathBuf>,

    /// Directory to store received messages
    #[structopt(long = "data", parse(from_os_str), default_value = "data/emails")]
    pub data_dir: PathBuf,

    /// Log file path (logs go to stdout otherwise)
    #[structopt(long = "logs", parse(from_os_str))]
    pub log_file: Option<PathBuf>,

    /// Log the SMTP dialogue
    #[structopt(short = "v", long = "verbose")]
    pub verbose: bool,

    /// Seconds a client may stay silent before it is disconnected
    #[structopt(long = "idle-timeout", default_value = "300")]
    pub idle_timeout: u64,

    /// Seconds allowed for a TLS handshake
    #[structopt(long = "handshake-timeout", default_value = "5")]
    pub handshake_timeout: u64,
}

impl Opt {
    fn config_for(&self, port: Option<u16>) -> SmtpConfig {
        SmtpConfig {
            host: self.address.clone(),
            port,
            domain: self.domain.clone(),
            max_size: self.max_size,
            tls_enable: self.tls_cert.is_some() || self.tls_key.is_some(),
            implicit_tls: self.implicit_tls,
            cert_file: self.tls_cert.clone(),
            key_file: self.tls_key.clone(),
            command_timeout: Duration::from_secs(self.idle_timeout),
            handshake_timeout: Duration::from_secs(self.handshake_timeout),
        }
    }
}

fn init_logging(opt: &Opt) -> Result<()> {
    let default_level = if opt.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    match &opt.log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("Failed to create log directory: {:?}", parent))?;
                }
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file: {:?}", path))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::from_args();
    init_logging(&opt)?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), pid = std::process::id(), "starting smtp-inbox");

    let store: Arc<dyn MailStore> = Arc::new(
        FileStore::new(&opt.data_dir)
            .with_context(|| format!("Failed to open data directory: {:?}", opt.data_dir))?,
    );

    let ports: Vec<Option<u16>> = if opt.ports.is_empty() {
        vec![None]
    } else {
        opt.ports.iter().copied().map(Some).collect()
    };

    let mut handles: Vec<ServerHandle> = Vec::new();
    for port in ports {
        let config = opt.config_for(port);
        let addr = config.listen_addr();
        let server = SmtpServer::bind(config, Arc::clone(&store))
            .await
            .with_context(|| format!("Failed to start SMTP server on {}", addr))?;
        handles.push(server.spawn());
    }

    tracing::info!(
        addrs = ?handles.iter().map(ServerHandle::local_addr).collect::<Vec<_>>(),
        domain = %opt.domain,
        data = %opt.data_dir.display(),
        "waiting for connections, press Ctrl+C to stop"
    );

    // Any listener ending on its own takes the whole process down.
    let listener_down = CancellationToken::new();
    for handle in &handles {
        let stopped = handle.stopped();
        let listener_down = listener_down.clone();
        tokio::spawn(async move {
            stopped.cancelled().await;
            listener_down.cancel();
        });
    }

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl+C")?;
            tracing::info!("shutting down");
        }
        _ = listener_down.cancelled() => {
            tracing::error!("a listener stopped unexpectedly, shutting down");
        }
    }

    let mut failed = false;
    for handle in handles {
        let addr = handle.local_addr();
        if let Err(e) = handle.shutdown().await {
            tracing::error!("server on {} failed: {}", addr, e);
            failed = true;
        }
    }
    if failed {
        anyhow::bail!("one or more SMTP servers stopped with an error");
    }
    Ok(())
}

//! Offload CLI - expose local services through an offload broker
//!
//! Listening ports are opened on the broker; forwarded connections are
//! pulled over outbound mutual-TLS connections and relayed to a local target.

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand, ValueEnum};
use offload_client::{
    ConnectionType, Endpoint, ExtraData, Listener, OffloadConfig, OffloadError, OffloadManager,
};
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Offload - expose local services through a remote broker
#[derive(Parser, Debug)]
#[command(name = "offload")]
#[command(about = "Offload - expose local services through a remote broker")]
#[command(version)]
#[command(long_about = r#"
Offload asks a remote broker to listen on your behalf and relays every
forwarded connection to a local target address.

EXAMPLES:
  # Print the address the broker sees for this host
  offload --config offload.yaml external-ip

  # Expose a local SSH server on broker port 2222
  offload --broker broker.example.com:443 \
    --ca-cert ca.pem --client-cert agent.pem --client-key agent.key \
    expose --port 2222 --target 127.0.0.1:22

ENVIRONMENT VARIABLES:
  OFFLOAD_BROKER       Broker address (host:port)
  OFFLOAD_CA_CERT      CA certificate (PEM)
  OFFLOAD_CLIENT_CERT  Client certificate (PEM)
  OFFLOAD_CLIENT_KEY   Client private key (PEM)
  OFFLOAD_SERVER_NAME  TLS server name override
"#)]
struct Cli {
    #[command(flatten)]
    connection: ConnectionArgs,

    /// Configuration file (YAML)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

/// Broker connection settings; each one overrides the config file
#[derive(clap::Args, Debug, Default)]
struct ConnectionArgs {
    /// Broker address (e.g., broker.example.com:443)
    #[arg(long, env = "OFFLOAD_BROKER", global = true)]
    broker: Option<String>,

    /// CA certificate the broker must chain to
    #[arg(long, env = "OFFLOAD_CA_CERT", global = true)]
    ca_cert: Option<PathBuf>,

    /// Client certificate presented to the broker
    #[arg(long, env = "OFFLOAD_CLIENT_CERT", global = true)]
    client_cert: Option<PathBuf>,

    /// Client private key
    #[arg(long, env = "OFFLOAD_CLIENT_KEY", global = true)]
    client_key: Option<PathBuf>,

    /// TLS server name to verify instead of the broker host
    #[arg(long, env = "OFFLOAD_SERVER_NAME", global = true)]
    server_name: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print this host's external IP as seen by the broker
    ExternalIp,

    /// Forward connections accepted by the broker to a local target
    Expose {
        /// Connection type requested from the broker
        #[arg(long, value_enum, default_value = "tcp")]
        kind: ExposeKind,

        /// Port the broker listens on
        #[arg(long)]
        port: u16,

        /// Local target address (host:port)
        #[arg(long)]
        target: String,

        /// Extra data offered to the broker, as key=path (repeatable)
        #[arg(long = "extra", value_parser = parse_extra)]
        extra: Vec<(String, PathBuf)>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum ExposeKind {
    Tcp,
    Kcp,
    Ssl,
}

impl From<ExposeKind> for ConnectionType {
    fn from(kind: ExposeKind) -> Self {
        match kind {
            ExposeKind::Tcp => ConnectionType::Tcp,
            ExposeKind::Kcp => ConnectionType::Kcp,
            ExposeKind::Ssl => ConnectionType::Ssl,
        }
    }
}

fn parse_extra(s: &str) -> Result<(String, PathBuf), String> {
    match s.split_once('=') {
        Some((key, path)) if !key.is_empty() && !path.is_empty() => {
            Ok((key.to_string(), PathBuf::from(path)))
        }
        _ => Err(format!("Expected key=path, got '{}'", s)),
    }
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

/// Load configuration from YAML file
fn load_config_file(path: &Path) -> Result<OffloadConfig> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Merge CLI args with the config file, giving precedence to CLI args
fn build_config(args: ConnectionArgs, path: Option<&Path>) -> Result<OffloadConfig> {
    let mut config = match path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            load_config_file(path)?
        }
        None => OffloadConfig::new(
            args.broker
                .clone()
                .context("Broker address is required (use --broker or config file)")?,
            args.ca_cert
                .clone()
                .context("CA certificate is required (use --ca-cert or config file)")?,
            args.client_cert
                .clone()
                .context("Client certificate is required (use --client-cert or config file)")?,
            args.client_key
                .clone()
                .context("Client key is required (use --client-key or config file)")?,
        ),
    };

    if let Some(broker) = args.broker {
        config.broker = broker;
    }
    if let Some(ca_cert) = args.ca_cert {
        config.ca_cert = ca_cert;
    }
    if let Some(client_cert) = args.client_cert {
        config.client_cert = client_cert;
    }
    if let Some(client_key) = args.client_key {
        config.client_key = client_key;
    }
    if args.server_name.is_some() {
        config.server_name = args.server_name;
    }

    config
        .broker_address()
        .with_context(|| format!("Invalid broker address: '{}'", config.broker))?;

    Ok(config)
}

fn load_extra(entries: &[(String, PathBuf)]) -> Result<ExtraData> {
    entries
        .iter()
        .map(|(key, path)| {
            let data = fs::read(path)
                .with_context(|| format!("Failed to read extra data file: {}", path.display()))?;
            Ok((key.clone(), Bytes::from(data)))
        })
        .collect()
}

async fn expose(
    manager: OffloadManager,
    kind: ConnectionType,
    port: u16,
    target: String,
    extra: ExtraData,
) -> Result<()> {
    let acceptor = manager.acceptor(kind, port, extra);
    info!(kind = %kind, port, target = %target, "Exposing local service");

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, shutting down...");
    };

    let error_backoff = manager.retry_policy().refused_backoff;
    run_forwarder(&acceptor, &target, error_backoff, shutdown).await;
    Ok(())
}

/// Relay accepted connections to `target` until `shutdown` resolves or the
/// listener closes. A failed accept is logged and the loop carries on.
async fn run_forwarder<L, F>(listener: &L, target: &str, error_backoff: Duration, shutdown: F)
where
    L: Listener,
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);

    while listener.is_active() {
        tokio::select! {
            _ = &mut shutdown => {
                listener.close();
                break;
            }
            result = listener.accept() => match result {
                Ok((socket, peer)) => {
                    tokio::spawn(forward(socket, peer, target.to_string()));
                }
                Err(OffloadError::Closed) => break,
                Err(e) => {
                    error!(error = %e, "Failed to accept forwarded connection");
                    tokio::select! {
                        _ = &mut shutdown => {
                            listener.close();
                            break;
                        }
                        _ = tokio::time::sleep(error_backoff) => {}
                    }
                }
            },
        }
    }

    debug!(target = %target, "Forwarder stopped");
}

async fn forward<S>(mut socket: S, peer: Endpoint, target: String)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut local = match TcpStream::connect(&target).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(peer = %peer, target = %target, error = %e, "Failed to connect to target");
            return;
        }
    };

    match tokio::io::copy_bidirectional(&mut socket, &mut local).await {
        Ok((to_target, to_peer)) => {
            debug!(
                peer = %peer,
                target = %target,
                bytes_to_target = to_target,
                bytes_to_peer = to_peer,
                "Forwarded connection closed"
            );
        }
        Err(e) => {
            debug!(peer = %peer, target = %target, error = %e, "Forwarded connection ended with error");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli.log_level)?;

    let config = build_config(cli.connection, cli.config.as_deref())
        .context("Failed to build offload configuration")?;
    info!("Broker: {}", config.broker);

    let manager = OffloadManager::from_config(&config).context("Failed to create manager")?;

    match cli.command {
        Commands::ExternalIp => {
            let ip = manager
                .external_ip()
                .await
                .context("Failed to resolve external IP")?;
            println!("{}", ip);
        }
        Commands::Expose {
            kind,
            port,
            target,
            extra,
        } => {
            let extra = load_extra(&extra)?;
            expose(manager, kind.into(), port, target, extra).await?;
        }
    }

    Ok(())
}

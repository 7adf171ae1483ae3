//! Client configuration and TLS context construction

use crate::error::OffloadError;
use crate::retry::RetryPolicy;
use offload_proto::ALPN_PROTOCOL;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Port assumed when the broker address carries none
pub const DEFAULT_BROKER_PORT: u16 = 443;

/// Broker endpoint, parsed from `host` or `host:port`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
}

impl BrokerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl FromStr for BrokerAddress {
    type Err = OffloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(OffloadError::Config("Broker address is empty".to_string()));
        }

        // Bracketed IPv6: [::1] or [::1]:8443
        if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(|| {
                OffloadError::Config(format!("Unterminated IPv6 literal in '{}'", s))
            })?;
            let port = match tail {
                "" => DEFAULT_BROKER_PORT,
                _ => parse_port(tail.strip_prefix(':').unwrap_or(tail), s)?,
            };
            return Ok(Self::new(host, port));
        }

        match s.rsplit_once(':') {
            // A bare IPv6 address has several colons and no port
            Some((host, _)) if host.contains(':') => Ok(Self::new(s, DEFAULT_BROKER_PORT)),
            Some((host, port)) => {
                if host.is_empty() {
                    return Err(OffloadError::Config(format!(
                        "Broker host cannot be empty: '{}'",
                        s
                    )));
                }
                Ok(Self::new(host, parse_port(port, s)?))
            }
            None => Ok(Self::new(s, DEFAULT_BROKER_PORT)),
        }
    }
}

fn parse_port(port: &str, addr: &str) -> Result<u16, OffloadError> {
    port.parse()
        .map_err(|_| OffloadError::Config(format!("Invalid port '{}' in '{}'", port, addr)))
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Offload client configuration
///
/// Read once at manager construction; certificate files are not reloaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OffloadConfig {
    /// Broker address (`host` or `host:port`)
    pub broker: String,

    /// CA certificate the broker must chain to (PEM)
    pub ca_cert: PathBuf,

    /// Client certificate presented to the broker (PEM)
    pub client_cert: PathBuf,

    /// Client private key (PEM)
    pub client_key: PathBuf,

    /// TLS server name to verify instead of the broker host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,

    /// TCP connect timeout in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout: Option<u64>,

    #[serde(default)]
    pub retry: RetryPolicy,
}

impl OffloadConfig {
    pub fn new(
        broker: impl Into<String>,
        ca_cert: impl Into<PathBuf>,
        client_cert: impl Into<PathBuf>,
        client_key: impl Into<PathBuf>,
    ) -> Self {
        Self {
            broker: broker.into(),
            ca_cert: ca_cert.into(),
            client_cert: client_cert.into(),
            client_key: client_key.into(),
            server_name: None,
            connect_timeout: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn broker_address(&self) -> Result<BrokerAddress, OffloadError> {
        self.broker.parse()
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout.map(Duration::from_secs)
    }

    /// Server name checked against the broker certificate
    pub fn tls_server_name(&self) -> Result<ServerName<'static>, OffloadError> {
        let name = match &self.server_name {
            Some(name) => name.clone(),
            None => self.broker_address()?.host,
        };
        ServerName::try_from(name.clone())
            .map_err(|e| OffloadError::Config(format!("Invalid TLS server name '{}': {}", name, e)))
    }

    /// Build the mutual-TLS client context from the configured PEM files
    pub fn build_tls_config(&self) -> Result<Arc<rustls::ClientConfig>, OffloadError> {
        let roots = load_certs(&self.ca_cert)?;
        let chain = load_certs(&self.client_cert)?;
        let key = load_private_key(&self.client_key)?;
        client_tls_config(roots, chain, key)
    }
}

/// Build a client context that trusts `roots`, presents `chain`/`key`, and
/// offers the offload ALPN protocol.
pub fn client_tls_config(
    roots: Vec<CertificateDer<'static>>,
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<rustls::ClientConfig>, OffloadError> {
    ensure_crypto_provider();

    let mut store = rustls::RootCertStore::empty();
    for cert in roots {
        store
            .add(cert)
            .map_err(|e| OffloadError::Tls(format!("Invalid CA certificate: {}", e)))?;
    }
    if store.is_empty() {
        return Err(OffloadError::Tls("No CA certificates found".to_string()));
    }

    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(store)
        .with_client_auth_cert(chain, key)
        .map_err(|e| OffloadError::Tls(format!("Invalid client cert/key: {}", e)))?;
    config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

    Ok(Arc::new(config))
}

// Initialize rustls crypto provider
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

pub(crate) fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, OffloadError> {
    let file = File::open(path).map_err(|e| {
        OffloadError::Config(format!("Failed to open {}: {}", path.display(), e))
    })?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| OffloadError::Tls(format!("Failed to parse {}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(OffloadError::Tls(format!(
            "No certificates in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, OffloadError> {
    let file = File::open(path).map_err(|e| {
        OffloadError::Config(format!("Failed to open {}: {}", path.display(), e))
    })?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| OffloadError::Tls(format!("Failed to parse {}: {}", path.display(), e)))?
        .ok_or_else(|| OffloadError::Tls(format!("No private key in {}", path.display())))
}

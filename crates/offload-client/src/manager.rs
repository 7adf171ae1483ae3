//! Offload manager: opens control connections to the broker
//!
//! Every logical request is a fresh TCP + mutual-TLS connection that starts
//! with a single [`ControlRequest`] frame. Acceptors and DNS sessions are
//! created from here and share the manager's read-only TLS context.

use crate::acceptor::{ExtraData, OffloadAcceptor};
use crate::config::{BrokerAddress, OffloadConfig};
use crate::dns::{DnsHandler, DnsSession};
use crate::error::OffloadError;
use crate::retry::RetryPolicy;
use offload_proto::{
    ConnectionType, ControlRequest, ExternalIpResponse, MessageStream, ALPN_PROTOCOL,
};
use rustls::pki_types::ServerName;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::OnceCell;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

/// Decrypted control connection to the broker
pub type BrokerStream = TlsStream<TcpStream>;

struct ManagerInner {
    broker: BrokerAddress,
    server_name: ServerName<'static>,
    connector: TlsConnector,
    retry: RetryPolicy,
    connect_timeout: Option<Duration>,
    external_ip: OnceCell<String>,
}

/// Builder for [`OffloadManager`]
pub struct OffloadManagerBuilder {
    broker: BrokerAddress,
    server_name: ServerName<'static>,
    tls: Arc<rustls::ClientConfig>,
    retry: RetryPolicy,
    connect_timeout: Option<Duration>,
}

impl OffloadManagerBuilder {
    /// Retry policy handed to every acceptor and DNS session
    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Bound the TCP connect to the broker
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> OffloadManager {
        OffloadManager {
            inner: Arc::new(ManagerInner {
                broker: self.broker,
                server_name: self.server_name,
                connector: TlsConnector::from(self.tls),
                retry: self.retry,
                connect_timeout: self.connect_timeout,
                external_ip: OnceCell::new(),
            }),
        }
    }
}

/// Handle to one broker; cheap to clone.
#[derive(Clone)]
pub struct OffloadManager {
    inner: Arc<ManagerInner>,
}

impl fmt::Debug for OffloadManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OffloadManager")
            .field("broker", &self.inner.broker)
            .field("server_name", &self.inner.server_name)
            .finish()
    }
}

impl OffloadManager {
    /// Create a manager from file-based configuration
    pub fn from_config(config: &OffloadConfig) -> Result<Self, OffloadError> {
        let tls = config.build_tls_config()?;
        let mut builder =
            Self::builder(config.broker_address()?, config.tls_server_name()?, tls)
                .retry_policy(config.retry.clone());
        if let Some(timeout) = config.connect_timeout() {
            builder = builder.connect_timeout(timeout);
        }
        Ok(builder.build())
    }

    /// Start building a manager from an already prepared TLS client context.
    ///
    /// The context should offer the `pp/1` ALPN protocol and carry the client
    /// certificate; see [`crate::config::client_tls_config`].
    pub fn builder(
        broker: BrokerAddress,
        server_name: ServerName<'static>,
        tls: Arc<rustls::ClientConfig>,
    ) -> OffloadManagerBuilder {
        OffloadManagerBuilder {
            broker,
            server_name,
            tls,
            retry: RetryPolicy::default(),
            connect_timeout: None,
        }
    }

    pub fn broker(&self) -> &BrokerAddress {
        &self.inner.broker
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.inner.retry
    }

    /// Open a control connection and send its Control Request.
    ///
    /// Returns the decrypted stream positioned right after the request. No
    /// retries happen here.
    pub async fn connect(
        &self,
        kind: ConnectionType,
        bind: impl fmt::Display,
        timeout: u32,
    ) -> Result<BrokerStream, OffloadError> {
        let inner = &self.inner;
        let bind = bind.to_string();

        debug!(
            kind = %kind,
            bind = %bind,
            broker = %inner.broker,
            "Opening control connection"
        );

        let addr = (inner.broker.host.as_str(), inner.broker.port);
        let tcp = match inner.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, TcpStream::connect(addr))
                .await
                .map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("Connecting to broker {} timed out", inner.broker),
                    )
                })??,
            None => TcpStream::connect(addr).await?,
        };
        tcp.set_nodelay(true)?;

        let tls = inner
            .connector
            .connect(inner.server_name.clone(), tcp)
            .await?;

        if tls.get_ref().1.alpn_protocol() != Some(ALPN_PROTOCOL) {
            debug!(kind = %kind, "Broker did not select the pp/1 ALPN protocol");
        }

        let mut framed = MessageStream::new(tls);
        framed
            .send(&ControlRequest::new(kind, bind).with_timeout(timeout))
            .await?;

        debug!(kind = %kind, "Control request sent");
        Ok(framed.into_inner())
    }

    /// External IP address of this agent as seen by the broker.
    ///
    /// Fetched over one type-0 connection on first use and cached for the
    /// lifetime of the manager; concurrent first callers share the fetch.
    pub async fn external_ip(&self) -> Result<&str, OffloadError> {
        let ip = self
            .inner
            .external_ip
            .get_or_try_init(|| async {
                let stream = self.connect(ConnectionType::ExternalIp, "", 0).await?;
                let mut framed = MessageStream::new(stream);
                let response: ExternalIpResponse = framed.recv().await?;
                info!(ip = %response.ip, "Resolved external IP via broker");
                Ok::<_, OffloadError>(response.ip)
            })
            .await?;
        Ok(ip.as_str())
    }

    /// Acceptor for an arbitrary forwarded connection type
    pub fn acceptor(&self, kind: ConnectionType, port: u16, extra: ExtraData) -> OffloadAcceptor {
        OffloadAcceptor::new(self.clone(), kind, port, extra)
    }

    /// Acceptor for forwarded TCP connections
    pub fn tcp(&self, port: u16, extra: ExtraData) -> OffloadAcceptor {
        self.acceptor(ConnectionType::Tcp, port, extra)
    }

    /// Acceptor for forwarded KCP (reliable UDP) connections
    pub fn kcp(&self, port: u16, extra: ExtraData) -> OffloadAcceptor {
        self.acceptor(ConnectionType::Kcp, port, extra)
    }

    /// Acceptor for forwarded TLS connections
    pub fn ssl(&self, port: u16, extra: ExtraData) -> OffloadAcceptor {
        self.acceptor(ConnectionType::Ssl, port, extra)
    }

    /// DNS session serving `domain` through `handler`; call
    /// [`DnsSession::start`] to run it.
    pub fn dns<H: DnsHandler>(&self, handler: Arc<H>, domain: impl Into<String>) -> DnsSession<H> {
        DnsSession::new(self.clone(), handler, domain.into())
    }
}

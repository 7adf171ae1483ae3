//! Listening-socket facade over outbound broker connections
//!
//! `OffloadAcceptor` never binds anything locally: each `accept()` opens a
//! fresh control connection and waits for the broker to hand over one
//! forwarded peer. `LocalListener` offers the same [`Listener`] surface over a
//! real TCP listener so consumers can run without a broker.

use crate::error::{OffloadError, RetryClass};
use crate::manager::{BrokerStream, OffloadManager};
use crate::retry::{Backoff, WaitOutcome};
use crate::socket::{AddressedStream, Endpoint, OffloadSocket};
use async_trait::async_trait;
use bytes::Bytes;
use offload_proto::{ConnectionInfo, ConnectionType, MessageStream};
use rmpv::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Side data the broker may ask for before completing a forward, keyed by
/// the name it sends in `ConnectionInfo::data`
pub type ExtraData = HashMap<String, Bytes>;

/// Minimal listening-socket contract
#[async_trait]
pub trait Listener: Send + Sync {
    type Stream: AddressedStream + 'static;

    /// Record (or bind) the listening address
    async fn bind(&self, host: &str, port: u16) -> Result<(), OffloadError>;

    /// Accepted for compatibility; backlog is not configurable
    fn listen(&self, _backlog: u32) {}

    /// Accepted for compatibility; accept calls block until a peer arrives
    fn set_timeout(&self, _timeout: Option<Duration>) {}

    /// Wait for the next connection
    async fn accept(&self) -> Result<(Self::Stream, Endpoint), OffloadError>;

    /// Stop accepting; pending and future `accept()` calls fail with
    /// [`OffloadError::Closed`]
    fn close(&self);

    fn shutdown(&self) {
        self.close();
    }

    fn is_active(&self) -> bool;

    fn local_endpoint(&self) -> Option<Endpoint>;
}

/// Broker-backed acceptor for one connection type and port
pub struct OffloadAcceptor {
    manager: OffloadManager,
    kind: ConnectionType,
    bind: Mutex<Endpoint>,
    extra: Arc<ExtraData>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for OffloadAcceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OffloadAcceptor")
            .field("kind", &self.kind)
            .field("bind", &self.bind_target())
            .field("active", &!self.cancel.is_cancelled())
            .finish()
    }
}

impl OffloadAcceptor {
    pub(crate) fn new(
        manager: OffloadManager,
        kind: ConnectionType,
        port: u16,
        extra: ExtraData,
    ) -> Self {
        Self {
            manager,
            kind,
            bind: Mutex::new(Endpoint::new("", port)),
            extra: Arc::new(extra),
            cancel: CancellationToken::new(),
        }
    }

    pub fn kind(&self) -> ConnectionType {
        self.kind
    }

    fn bind_target(&self) -> Endpoint {
        self.bind
            .lock()
            .map(|bind| bind.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Pull one forwarded connection from the broker.
    ///
    /// Refused connections and early closes are retried with the manager's
    /// back-off for as long as the acceptor is open.
    pub async fn accept(&self) -> Result<(OffloadSocket<BrokerStream>, Endpoint), OffloadError> {
        let mut backoff = Backoff::new(self.manager.retry_policy().clone());

        loop {
            if self.cancel.is_cancelled() {
                return Err(OffloadError::Closed);
            }

            let port = self.bind_target().port;
            let attempt = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(OffloadError::Closed),
                result = self.pull_connection(port) => result,
            };

            let err = match attempt {
                // Closed while the handover completed; the socket is dropped
                Ok(_) if self.cancel.is_cancelled() => return Err(OffloadError::Closed),
                Ok(socket) => {
                    let peer = socket.peer_endpoint().clone();
                    info!(
                        kind = %self.kind,
                        port,
                        peer = %peer,
                        "Accepted forwarded connection"
                    );
                    return Ok((socket, peer));
                }
                Err(err) => err,
            };

            let class = err.retry_class();
            match class {
                RetryClass::Fatal => {
                    if !err.is_transport() {
                        error!(kind = %self.kind, port, error = %err, "Accept failed");
                    }
                    return Err(err);
                }
                RetryClass::Refused => {
                    warn!(kind = %self.kind, port, "Broker refused connection, retrying");
                }
                RetryClass::EndOfStream => {
                    debug!(kind = %self.kind, port, "Broker closed control connection, retrying");
                }
            }

            if backoff.wait(class, &self.cancel).await? == WaitOutcome::Cancelled {
                return Err(OffloadError::Closed);
            }
        }
    }

    async fn pull_connection(
        &self,
        port: u16,
    ) -> Result<OffloadSocket<BrokerStream>, OffloadError> {
        let stream = self.manager.connect(self.kind, port, 0).await?;
        let mut framed = MessageStream::new(stream);

        let mut info: ConnectionInfo = framed.recv().await?;
        if info.extra {
            let key = info.extra_key().ok_or_else(|| {
                OffloadError::Protocol(format!(
                    "Broker requested extra data with a non-string key: {}",
                    info.data
                ))
            })?;
            let payload = self
                .extra
                .get(key)
                .ok_or_else(|| OffloadError::MissingExtra(key.to_string()))?;

            debug!(key, bytes = payload.len(), "Sending extra data to broker");
            framed.send(&Value::Binary(payload.to_vec())).await?;
            info = framed.recv().await?;
        }

        Ok(OffloadSocket::from_info(framed.into_inner(), &info))
    }

    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            debug!(kind = %self.kind, "Closing acceptor");
            self.cancel.cancel();
        }
    }

    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled()
    }
}

#[async_trait]
impl Listener for OffloadAcceptor {
    type Stream = OffloadSocket<BrokerStream>;

    /// Only the port reaches the broker, as the Control Request `bind` field
    async fn bind(&self, host: &str, port: u16) -> Result<(), OffloadError> {
        let mut bind = self
            .bind
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *bind = Endpoint::new(host, port);
        Ok(())
    }

    async fn accept(&self) -> Result<(Self::Stream, Endpoint), OffloadError> {
        OffloadAcceptor::accept(self).await
    }

    fn close(&self) {
        OffloadAcceptor::close(self);
    }

    fn is_active(&self) -> bool {
        OffloadAcceptor::is_active(self)
    }

    fn local_endpoint(&self) -> Option<Endpoint> {
        Some(self.bind_target())
    }
}

/// [`Listener`] over a genuine local TCP socket
#[derive(Debug, Default)]
pub struct LocalListener {
    listener: Mutex<Option<Arc<TcpListener>>>,
    cancel: CancellationToken,
}

impl LocalListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a listener already bound to `host:port`
    pub async fn bound(host: &str, port: u16) -> Result<Self, OffloadError> {
        let listener = Self::new();
        listener.bind(host, port).await?;
        Ok(listener)
    }

    fn current(&self) -> Option<Arc<TcpListener>> {
        self.listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl Listener for LocalListener {
    type Stream = OffloadSocket<TcpStream>;

    async fn bind(&self, host: &str, port: u16) -> Result<(), OffloadError> {
        let listener = TcpListener::bind((host, port)).await?;
        debug!(addr = %listener.local_addr()?, "Local listener bound");
        *self
            .listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Arc::new(listener));
        Ok(())
    }

    async fn accept(&self) -> Result<(Self::Stream, Endpoint), OffloadError> {
        if self.cancel.is_cancelled() {
            return Err(OffloadError::Closed);
        }
        let listener = self
            .current()
            .ok_or_else(|| OffloadError::Config("Listener is not bound".to_string()))?;

        let (stream, peer_addr) = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(OffloadError::Closed),
            result = listener.accept() => result?,
        };

        let local = Endpoint::from(stream.local_addr()?);
        let peer = Endpoint::from(peer_addr);
        Ok((OffloadSocket::new(stream, local, peer.clone()), peer))
    }

    fn close(&self) {
        self.cancel.cancel();
        self.listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
    }

    fn is_active(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    fn local_endpoint(&self) -> Option<Endpoint> {
        self.current()
            .and_then(|listener| listener.local_addr().ok())
            .map(Endpoint::from)
    }
}

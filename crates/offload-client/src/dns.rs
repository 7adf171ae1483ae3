//! Persistent DNS session over one broker control connection
//!
//! Unlike acceptors, DNS traffic arrives as a stream of request/response
//! pairs on a single long-lived type-1 connection. The session keeps that
//! connection open, feeds requests to a [`DnsHandler`] and reconnects with
//! back-off when the broker goes away.
//!
//! States: `Connecting -> Serving -> (RetryWait | Stopped)`.

use crate::error::{OffloadError, RetryClass};
use crate::manager::OffloadManager;
use crate::retry::{Backoff, WaitOutcome};
use async_trait::async_trait;
use offload_proto::{is_empty_request, ConnectionType, MessageStream};
use rmpv::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Error type handlers may return from `process`
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// DNS protocol logic plugged into a session
#[async_trait]
pub trait DnsHandler: Send + Sync + 'static {
    /// Answer one request received from the broker
    async fn process(&self, request: Value) -> Result<Value, HandlerError>;

    /// Background housekeeping, spawned once when the session starts and
    /// left running for the life of the process
    async fn cleanup(&self) {}

    /// Called exactly once when the session owner stops the session
    fn finished(&self);
}

/// Observable phase of a DNS session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Serving,
    RetryWait,
    Stopped,
}

/// A DNS session that has not been started yet
pub struct DnsSession<H> {
    manager: OffloadManager,
    handler: Arc<H>,
    domain: String,
}

impl<H: DnsHandler> DnsSession<H> {
    pub(crate) fn new(manager: OffloadManager, handler: Arc<H>, domain: String) -> Self {
        Self {
            manager,
            handler,
            domain,
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Spawn the session loop and the handler's cleanup task
    pub fn start(self) -> DnsSessionHandle {
        let cancel = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(SessionState::Connecting);

        let handler = self.handler.clone();
        tokio::spawn(async move {
            handler.cleanup().await;
        });

        let shared = Arc::new(SessionShared {
            cancel: cancel.clone(),
            handler: self.handler.clone(),
            finished: AtomicBool::new(false),
        });
        let task = tokio::spawn(self.run(cancel, state_tx));

        DnsSessionHandle {
            shared,
            state: state_rx,
            task,
        }
    }

    async fn run(self, cancel: CancellationToken, state: watch::Sender<SessionState>) {
        let mut backoff = Backoff::new(self.manager.retry_policy().clone());
        info!(domain = %self.domain, "DNS session started");

        while !cancel.is_cancelled() {
            state.send_replace(SessionState::Connecting);

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = self.serve(&state, &mut backoff, &cancel) => result,
            };

            let err = match outcome {
                Ok(()) if cancel.is_cancelled() => break,
                Ok(()) => {
                    debug!(domain = %self.domain, "Broker ended DNS session, reconnecting");
                    continue;
                }
                Err(err) => err,
            };

            let class = err.retry_class();
            match class {
                RetryClass::Fatal => {
                    error!(domain = %self.domain, error = %err, "DNS session failed");
                    break;
                }
                RetryClass::Refused => {
                    warn!(domain = %self.domain, "Broker refused DNS session, retrying");
                }
                RetryClass::EndOfStream => {
                    debug!(domain = %self.domain, "Broker closed DNS session, retrying");
                }
            }

            state.send_replace(SessionState::RetryWait);
            match backoff.wait(class, &cancel).await {
                Ok(WaitOutcome::Elapsed) => {}
                Ok(WaitOutcome::Cancelled) => break,
                Err(err) => {
                    error!(domain = %self.domain, error = %err, "DNS session failed");
                    break;
                }
            }
        }

        state.send_replace(SessionState::Stopped);
        info!(domain = %self.domain, "DNS session stopped");
    }

    /// One control connection: returns `Ok` when the broker sends an empty
    /// request or the session is stopped
    async fn serve(
        &self,
        state: &watch::Sender<SessionState>,
        backoff: &mut Backoff,
        cancel: &CancellationToken,
    ) -> Result<(), OffloadError> {
        let stream = self
            .manager
            .connect(ConnectionType::Dns, &self.domain, 0)
            .await?;
        let mut framed = MessageStream::new(stream);

        state.send_replace(SessionState::Serving);
        backoff.reset();
        debug!(domain = %self.domain, "DNS session connected");

        loop {
            let request = framed.recv_value().await?;
            // No process() once stop() has been called
            if cancel.is_cancelled() || is_empty_request(&request) {
                return Ok(());
            }

            let response = self
                .handler
                .process(request)
                .await
                .map_err(|e| OffloadError::Handler(e.to_string()))?;
            framed.send(&response).await?;
        }
    }
}

struct SessionShared {
    cancel: CancellationToken,
    handler: Arc<dyn DnsHandler>,
    finished: AtomicBool,
}

/// Owner's handle to a running DNS session
pub struct DnsSessionHandle {
    shared: Arc<SessionShared>,
    state: watch::Receiver<SessionState>,
    task: JoinHandle<()>,
}

impl DnsSessionHandle {
    /// Stop the session.
    ///
    /// Drops the current control connection, which unblocks a pending
    /// receive, and signals the handler. Repeated calls have no effect.
    pub fn stop(&self) {
        self.shared.cancel.cancel();
        if !self.shared.finished.swap(true, Ordering::SeqCst) {
            self.shared.handler.finished();
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Receiver notified on every state transition
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// False once stopped by the owner or after a fatal error
    pub fn is_active(&self) -> bool {
        !self.shared.cancel.is_cancelled() && self.state() != SessionState::Stopped
    }

    /// Wait for the session loop to exit
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            error!("DNS session task panicked: {}", e);
        }
    }
}

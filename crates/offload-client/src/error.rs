//! Client error type and its retry classification

use offload_proto::CodecError;
use std::io;
use thiserror::Error;

/// Offload client errors
#[derive(Debug, Error)]
pub enum OffloadError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Frame error: {0}")]
    Codec(#[from] CodecError),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("No extra data registered for key '{0}'")]
    MissingExtra(String),

    #[error("DNS handler failed: {0}")]
    Handler(String),

    #[error("Gave up after {0} consecutive retryable failures")]
    RetriesExhausted(usize),

    #[error("Listener closed")]
    Closed,
}

/// How a failed broker exchange should be handled by the retrying caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Broker not reachable yet
    Refused,
    /// Broker closed the control connection early
    EndOfStream,
    /// Not retried
    Fatal,
}

impl OffloadError {
    pub fn retry_class(&self) -> RetryClass {
        match self {
            OffloadError::Io(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                RetryClass::Refused
            }
            // Broker hung up during the TLS handshake
            OffloadError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                RetryClass::EndOfStream
            }
            OffloadError::Codec(e) if e.is_end_of_stream() => RetryClass::EndOfStream,
            OffloadError::Codec(e)
                if e.io_error().map(io::Error::kind) == Some(io::ErrorKind::ConnectionRefused) =>
            {
                RetryClass::Refused
            }
            _ => RetryClass::Fatal,
        }
    }

    /// Transport or OS level failure, as opposed to a protocol or programming
    /// error
    pub fn is_transport(&self) -> bool {
        match self {
            OffloadError::Io(_) | OffloadError::Tls(_) => true,
            OffloadError::Codec(e) => e.io_error().is_some() || e.is_end_of_stream(),
            _ => false,
        }
    }
}

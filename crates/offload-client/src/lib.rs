//! Offload client library
//!
//! Exposes services from behind NAT without opening inbound ports: a remote
//! broker accepts connections on the agent's behalf and this crate pulls them
//! over outbound mutual-TLS control connections.
//!
//! # Example
//!
//! ```no_run
//! use offload_client::{ExtraData, OffloadConfig, OffloadManager};
//! use tokio::io::AsyncWriteExt;
//!
//! # async fn run() -> Result<(), offload_client::OffloadError> {
//! let config = OffloadConfig::new("offload.example.com:443", "ca.pem", "agent.pem", "agent.key");
//! let manager = OffloadManager::from_config(&config)?;
//! println!("reachable at {}", manager.external_ip().await?);
//!
//! let acceptor = manager.tcp(8080, ExtraData::new());
//! let (mut socket, peer) = acceptor.accept().await?;
//! println!("connection from {}", peer);
//! socket.write_all(b"hello\n").await?;
//! # Ok(())
//! # }
//! ```

pub mod acceptor;
pub mod config;
pub mod dns;
pub mod error;
pub mod manager;
pub mod retry;
pub mod socket;

pub use acceptor::{ExtraData, Listener, LocalListener, OffloadAcceptor};
pub use config::{client_tls_config, BrokerAddress, OffloadConfig, DEFAULT_BROKER_PORT};
pub use dns::{DnsHandler, DnsSession, DnsSessionHandle, HandlerError, SessionState};
pub use error::{OffloadError, RetryClass};
pub use manager::{BrokerStream, OffloadManager, OffloadManagerBuilder};
pub use retry::RetryPolicy;
pub use socket::{AddressedStream, Endpoint, OffloadSocket};

pub use offload_proto::{ConnectionInfo, ConnectionType};

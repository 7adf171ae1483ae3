//! Shared fixtures: throwaway PKI and an in-process mutual-TLS broker

#![allow(dead_code)]

use offload_client::{client_tls_config, BrokerAddress, OffloadManager, RetryPolicy};
use offload_proto::{ControlRequest, MessageStream, ALPN_PROTOCOL};
use rcgen::{BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

pub type ServerStream = tokio_rustls::server::TlsStream<TcpStream>;

pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// CA plus one server and one client certificate signed by it
pub struct TestPki {
    pub ca_der: CertificateDer<'static>,
    pub ca_pem: String,
    pub server_der: CertificateDer<'static>,
    server_key_der: Vec<u8>,
    pub client_der: CertificateDer<'static>,
    client_key_der: Vec<u8>,
    pub client_pem: String,
    pub client_key_pem: String,
}

fn named(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, "Offload Test");
    dn
}

impl TestPki {
    pub fn generate() -> Self {
        install_crypto_provider();

        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::default();
        ca_params.distinguished_name = named("Offload Test CA");
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca = ca_params.self_signed(&ca_key).unwrap();

        let server_key = KeyPair::generate().unwrap();
        let mut server_params =
            CertificateParams::new(vec!["localhost".to_string(), "127.0.0.1".to_string()])
                .unwrap();
        server_params.distinguished_name = named("Offload Test Broker");
        let server = server_params.signed_by(&server_key, &ca, &ca_key).unwrap();

        let client_key = KeyPair::generate().unwrap();
        let mut client_params = CertificateParams::new(vec!["agent".to_string()]).unwrap();
        client_params.distinguished_name = named("Offload Test Agent");
        let client = client_params.signed_by(&client_key, &ca, &ca_key).unwrap();

        Self {
            ca_der: ca.der().clone(),
            ca_pem: ca.pem(),
            server_der: server.der().clone(),
            server_key_der: server_key.serialize_der(),
            client_der: client.der().clone(),
            client_key_der: client_key.serialize_der(),
            client_pem: client.pem(),
            client_key_pem: client_key.serialize_pem(),
        }
    }

    pub fn client_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.client_key_der.clone()))
    }

    pub fn client_config(&self) -> Arc<rustls::ClientConfig> {
        client_tls_config(
            vec![self.ca_der.clone()],
            vec![self.client_der.clone()],
            self.client_key(),
        )
        .unwrap()
    }

    /// Broker side: requires a client certificate from our CA and offers pp/1
    pub fn server_config(&self) -> Arc<rustls::ServerConfig> {
        let mut roots = rustls::RootCertStore::empty();
        roots.add(self.ca_der.clone()).unwrap();
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .unwrap();

        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.server_key_der.clone()));
        let mut config = rustls::ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(vec![self.server_der.clone()], key)
            .unwrap();
        config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];
        Arc::new(config)
    }
}

/// Retry delays short enough for tests
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        refused_backoff: Duration::from_millis(50),
        eof_backoff: Duration::from_millis(20),
        max_attempts: None,
    }
}

pub fn manager_for(pki: &TestPki, addr: SocketAddr, retry: RetryPolicy) -> OffloadManager {
    OffloadManager::builder(
        BrokerAddress::new("127.0.0.1", addr.port()),
        ServerName::try_from("localhost").unwrap(),
        pki.client_config(),
    )
    .retry_policy(retry)
    .connect_timeout(Duration::from_secs(5))
    .build()
}

/// Broker double.
///
/// Each accepted connection completes the TLS handshake, reads the Control
/// Request and is handed to the script together with its 0-based index.
pub struct MockBroker {
    pub addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<ControlRequest>>>,
    task: JoinHandle<()>,
}

impl MockBroker {
    pub async fn start<F, Fut>(pki: &TestPki, script: F) -> Self
    where
        F: Fn(usize, ControlRequest, MessageStream<ServerStream>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self::start_on(listener, pki, script)
    }

    pub fn start_on<F, Fut>(listener: TcpListener, pki: &TestPki, script: F) -> Self
    where
        F: Fn(usize, ControlRequest, MessageStream<ServerStream>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr().unwrap();
        let acceptor = TlsAcceptor::from(pki.server_config());
        let connections = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let script = Arc::new(script);

        let task = {
            let connections = connections.clone();
            let requests = requests.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((tcp, _)) = listener.accept().await else {
                        return;
                    };
                    let index = connections.fetch_add(1, Ordering::SeqCst);
                    let acceptor = acceptor.clone();
                    let requests = requests.clone();
                    let script = script.clone();

                    tokio::spawn(async move {
                        let Ok(tls) = acceptor.accept(tcp).await else {
                            return;
                        };
                        let mut framed = MessageStream::new(tls);
                        let Ok(request) = framed.recv::<ControlRequest>().await else {
                            return;
                        };
                        requests.lock().unwrap().push(request.clone());
                        script(index, request, framed).await;
                    });
                }
            })
        };

        Self {
            addr,
            connections,
            requests,
            task,
        }
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ControlRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for MockBroker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

//! Common utilities for integration tests
#![allow(dead_code)]

use parking_lot::Mutex;
use rustls::pki_types::{CertificateDer, ServerName};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tls_intercept::config::ProxyConfig;
use tls_intercept::forge::CertificateForge;
use tls_intercept::server::ProxyServer;
use tls_intercept::tls::{self, crypto_provider, RootCa};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_rustls::client::TlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Get an available port for testing
pub fn get_available_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to random port")
        .local_addr()
        .expect("Failed to get local addr")
        .port()
}

/// Root CA written to temporary files, removed on drop
pub struct TestCa {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub root: Arc<RootCa>,
    _cleanup: TestCleanup,
}

impl TestCa {
    pub fn generate(common_name: &str) -> Self {
        use std::sync::atomic::AtomicU64;

        static COUNTER: AtomicU64 = AtomicU64::new(0);

        let temp_dir = std::env::temp_dir();
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos() as u64;
        let counter = COUNTER.fetch_add(1, Ordering::SeqCst);
        let unique_id = format!("{}-{}-{}", timestamp, counter, std::process::id());

        let cert_path = temp_dir.join(format!("test-ca-{}.pem", unique_id));
        let key_path = temp_dir.join(format!("test-ca-{}.key", unique_id));

        tls::write_root_ca(common_name, 30, &cert_path, &key_path)
            .expect("Failed to generate test CA");
        let root = Arc::new(RootCa::load(&cert_path, &key_path).expect("Failed to load test CA"));

        Self {
            _cleanup: TestCleanup::new(cert_path.clone(), key_path.clone()),
            cert_path,
            key_path,
            root,
        }
    }

    pub fn cert_der(&self) -> CertificateDer<'static> {
        self.root.cert_der().clone()
    }
}

/// How the fake upstream host treats each connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostBehavior {
    /// Echo everything back until the peer closes
    Echo,
    /// Echo the first chunk, then close the session
    CloseAfterFirstChunk,
}

/// TLS server standing in for the real host
pub struct TestHost {
    pub addr: SocketAddr,
    /// SNI of every accepted handshake, in order
    pub server_names: Arc<Mutex<Vec<Option<String>>>>,
    /// Every chunk the host received
    pub received: mpsc::UnboundedReceiver<Vec<u8>>,
    /// Connections whose session has ended, by peer close or error
    pub closed: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl TestHost {
    pub fn closed_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` host connections have ended
    pub async fn wait_closed(&self, count: usize, within: Duration) -> bool {
        tokio::time::timeout(within, async {
            while self.closed_count() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok()
    }
}

impl Drop for TestHost {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Start a TLS host presenting a certificate for `hostname` signed by `ca`
pub async fn start_tls_host(ca: &TestCa, hostname: &str, behavior: HostBehavior) -> TestHost {
    let forged = CertificateForge::new(ca.root.clone(), 30)
        .forge(hostname)
        .expect("Failed to forge host certificate");

    let config = rustls::ServerConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(forged.chain.clone(), forged.key.clone_key())
        .expect("Failed to build host TLS config");
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test host");
    let addr = listener.local_addr().unwrap();

    let server_names = Arc::new(Mutex::new(Vec::new()));
    let (tx, received) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicUsize::new(0));

    let names = server_names.clone();
    let closed_counter = closed.clone();
    let handle = tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                break;
            };
            let acceptor = acceptor.clone();
            let names = names.clone();
            let tx = tx.clone();
            let closed_counter = closed_counter.clone();
            tokio::spawn(async move {
                let Ok(mut stream) = acceptor.accept(socket).await else {
                    return;
                };
                names
                    .lock()
                    .push(stream.get_ref().1.server_name().map(str::to_string));

                let mut buf = vec![0u8; 64 * 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let _ = tx.send(buf[..n].to_vec());
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                            if behavior == HostBehavior::CloseAfterFirstChunk {
                                let _ = stream.shutdown().await;
                                break;
                            }
                        }
                    }
                }
                closed_counter.fetch_add(1, Ordering::SeqCst);
            });
        }
    });

    TestHost {
        addr,
        server_names,
        received,
        closed,
        handle,
    }
}

/// Proxy configuration pointing every host leg at `host`
pub fn proxy_config(proxy_ca: &TestCa, upstream_ca: &TestCa, host: &TestHost) -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.proxy.bind_addr = "127.0.0.1".to_string();
    config.proxy.bind_port = get_available_port();
    config.proxy.handshake_timeout_secs = 5;
    config.proxy.write_timeout_secs = 5;
    config.ca.cert_path = proxy_ca.cert_path.clone();
    config.ca.key_path = proxy_ca.key_path.clone();
    config.upstream.connect_override = Some(host.addr.to_string());
    config.upstream.ca_cert_path = Some(upstream_ca.cert_path.clone());
    config
}

/// Running proxy; stops when dropped or on `stop`
pub struct TestProxy {
    pub addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl TestProxy {
    pub async fn stop(mut self) -> anyhow::Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        (&mut self.handle).await.expect("proxy task panicked")
    }
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

pub async fn start_proxy(config: &ProxyConfig, ca: &TestCa) -> TestProxy {
    let forge = CertificateForge::new(ca.root.clone(), config.ca.leaf_validity_days)
        .with_cache(config.ca.cache_size);
    let server = ProxyServer::bind(config, Arc::new(forge))
        .await
        .expect("Failed to bind proxy");
    let addr = server.local_addr().unwrap();

    let (tx, rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(server.run_until(async {
        let _ = rx.await;
    }));

    TestProxy {
        addr,
        shutdown: Some(tx),
        handle,
    }
}

/// TLS client trusting only `root`
pub fn client_connector(root: CertificateDer<'static>) -> TlsConnector {
    let mut roots = rustls::RootCertStore::empty();
    roots.add(root).unwrap();
    let config = rustls::ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

/// Connect to the proxy and handshake as a client asking for `server_name`
pub async fn connect_client(
    proxy: SocketAddr,
    root: CertificateDer<'static>,
    server_name: &str,
) -> std::io::Result<TlsStream<TcpStream>> {
    let tcp = TcpStream::connect(proxy).await?;
    let name = ServerName::try_from(server_name.to_string())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    client_connector(root).connect(name, tcp).await
}

/// Write `data` and read back exactly as many bytes
pub async fn round_trip(stream: &mut TlsStream<TcpStream>, data: &[u8]) -> Vec<u8> {
    tokio::time::timeout(TEST_TIMEOUT, async {
        stream.write_all(data).await.unwrap();
        stream.flush().await.unwrap();
        let mut buf = vec![0u8; data.len()];
        stream.read_exact(&mut buf).await.unwrap();
        buf
    })
    .await
    .expect("Timeout waiting for echo")
}

/// True when the peer closes the stream within the timeout
pub async fn closed_by_peer(stream: &mut TlsStream<TcpStream>, within: Duration) -> bool {
    let mut buf = [0u8; 1];
    match tokio::time::timeout(within, stream.read(&mut buf)).await {
        Ok(Ok(0)) | Ok(Err(_)) => true,
        Ok(Ok(_)) | Err(_) => false,
    }
}

/// Remove temp files on drop
pub struct TestCleanup {
    cert_path: Option<PathBuf>,
    key_path: Option<PathBuf>,
}

impl TestCleanup {
    pub fn new(cert_path: PathBuf, key_path: PathBuf) -> Self {
        Self {
            cert_path: Some(cert_path),
            key_path: Some(key_path),
        }
    }
}

impl Drop for TestCleanup {
    fn drop(&mut self) {
        if let Some(cert) = self.cert_path.take() {
            let _ = std::fs::remove_file(cert);
        }
        if let Some(key) = self.key_path.take() {
            let _ = std::fs::remove_file(key);
        }
    }
}

//! 双 TLS 会话对
//!
//! 每个代理连接持有两个 TLS 端点：面向客户端的服务端会话使用伪造证书，
//! 面向真实主机的客户端会话把从客户端 hello 中捕获的主机名作为 SNI 发送。
//! [`Establisher`] 依次完成两次握手，只返回完整的 [`SessionPair`]。

use bytes::Bytes;
use rustls::pki_types::ServerName;
use socket2::{SockRef, TcpKeepalive};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::error::{LegKind, ProxyError, Result};
use crate::forge::{normalize_hostname, CredentialProvider, ForgingResolver};
use crate::table::SlotId;
use crate::tls;

/// 面向客户端的 TLS 流，代理为服务端
pub type ClientTls = tokio_rustls::server::TlsStream<TcpStream>;
/// 面向主机的 TLS 流，代理为客户端
pub type HostTls = tokio_rustls::client::TlsStream<TcpStream>;

const KEEPALIVE_TIME: Duration = Duration::from_secs(60);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// 单个代理连接的生命周期
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    AcceptingClient,
    ClientEstablished,
    ConnectingHost,
    /// 两侧均已建立，参与数据转发
    HostEstablished,
    Closing,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::AcceptingClient => "accepting-client",
            ConnectionState::ClientEstablished => "client-established",
            ConnectionState::ConnectingHost => "connecting-host",
            ConnectionState::HostEstablished => "active",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// 一次读取的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadChunk {
    Data(Bytes),
    Eof,
}

/// 代理连接的一侧
pub struct Leg<S> {
    stream: S,
    peer: SocketAddr,
}

impl<S> Leg<S> {
    pub fn new(stream: S, peer: SocketAddr) -> Self {
        Self { stream, peer }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Leg<S> {
    /// 轮询一个单位的应用数据，最多 `scratch.len()` 字节
    ///
    /// 返回 `Pending` 时不消耗数据并注册 waker，之后的轮次可再次轮询而不丢数据。
    pub fn poll_read_chunk(
        &mut self,
        cx: &mut Context<'_>,
        scratch: &mut [u8],
    ) -> Poll<io::Result<ReadChunk>> {
        let mut buf = ReadBuf::new(scratch);
        match Pin::new(&mut self.stream).poll_read(cx, &mut buf) {
            Poll::Ready(Ok(())) if buf.filled().is_empty() => Poll::Ready(Ok(ReadChunk::Eof)),
            Poll::Ready(Ok(())) => Poll::Ready(Ok(ReadChunk::Data(Bytes::copy_from_slice(
                buf.filled(),
            )))),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }

    /// 原样写入数据块并从 TLS 缓冲区刷出
    pub async fn write_chunk(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.write_all(data).await?;
        self.stream.flush().await
    }

    /// 发送 close_notify 并关闭写方向
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }
}

/// 已建立连接的两侧及转发统计
pub struct SessionPair<C = ClientTls, H = HostTls> {
    hostname: String,
    port: u16,
    pub client: Leg<C>,
    pub host: Leg<H>,
    state: ConnectionState,
    established_at: Instant,
    last_activity: Instant,
    bytes_to_host: u64,
    bytes_to_client: u64,
}

impl<C, H> SessionPair<C, H> {
    pub fn new(hostname: String, port: u16, client: Leg<C>, host: Leg<H>) -> Self {
        let now = Instant::now();
        Self {
            hostname,
            port,
            client,
            host,
            state: ConnectionState::HostEstablished,
            established_at: now,
            last_activity: now,
            bytes_to_host: 0,
            bytes_to_client: 0,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn age(&self) -> Duration {
        self.established_at.elapsed()
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    pub fn bytes_to_host(&self) -> u64 {
        self.bytes_to_host
    }

    pub fn bytes_to_client(&self) -> u64 {
        self.bytes_to_client
    }

    pub(crate) fn record_to_host(&mut self, n: usize) {
        self.bytes_to_host += n as u64;
        self.last_activity = Instant::now();
    }

    pub(crate) fn record_to_client(&mut self, n: usize) {
        self.bytes_to_client += n as u64;
        self.last_activity = Instant::now();
    }
}

impl<C, H> SessionPair<C, H>
where
    C: AsyncRead + AsyncWrite + Unpin,
    H: AsyncRead + AsyncWrite + Unpin,
{
    /// 关闭两个 TLS 会话，套接字在会话对释放时关闭
    pub async fn close(&mut self) {
        self.state = ConnectionState::Closing;
        if let Err(e) = self.client.shutdown().await {
            debug!("close_notify to client {} failed: {}", self.client.peer(), e);
        }
        if let Err(e) = self.host.shutdown().await {
            debug!("close_notify to host {} failed: {}", self.host.peer(), e);
        }
        self.state = ConnectionState::Closed;
    }
}

/// 执行两次握手，把已接受的套接字变成 [`SessionPair`]
pub struct Establisher {
    acceptor: TlsAcceptor,
    connector: TlsConnector,
    fallback_host: Option<String>,
    upstream_port: u16,
    connect_override: Option<String>,
    handshake_timeout: Duration,
}

impl Establisher {
    /// 构建两侧 TLS 配置，`credentials` 由 hello 钩子调用
    pub fn new(credentials: Arc<dyn CredentialProvider>, config: &ProxyConfig) -> anyhow::Result<Self> {
        let alpn = config.proxy.alpn();
        let resolver = Arc::new(ForgingResolver::new(
            credentials,
            config.proxy.fallback_host.clone(),
        ));

        let server_config = tls::build_client_facing_config(resolver, alpn.clone())?;
        let client_config = tls::build_host_facing_config(
            config.upstream.ca_cert_path.as_deref(),
            config.upstream.skip_verify,
            alpn,
        )?;

        Ok(Self {
            acceptor: TlsAcceptor::from(server_config),
            connector: TlsConnector::from(client_config),
            fallback_host: config.proxy.fallback_host.clone(),
            upstream_port: config.upstream.port,
            connect_override: config.upstream.connect_override.clone(),
            handshake_timeout: config.proxy.handshake_timeout(),
        })
    }

    /// 客户端握手，然后连接主机并握手，共用一个超时
    ///
    /// 只有两侧都建立后才返回；出错时已打开的套接字均已释放。
    pub async fn establish(
        &self,
        slot: SlotId,
        tcp: TcpStream,
        peer: SocketAddr,
    ) -> Result<SessionPair> {
        match tokio::time::timeout(self.handshake_timeout, self.establish_inner(slot, tcp, peer))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(ProxyError::timeout(self.handshake_timeout)),
        }
    }

    async fn establish_inner(
        &self,
        slot: SlotId,
        tcp: TcpStream,
        peer: SocketAddr,
    ) -> Result<SessionPair> {
        debug!(%slot, %peer, state = %ConnectionState::AcceptingClient, "starting client handshake");
        let (client, hostname) = self.accept_client(tcp, peer).await?;
        debug!(%slot, %hostname, state = %ConnectionState::ClientEstablished, "client leg established");

        debug!(%slot, %hostname, state = %ConnectionState::ConnectingHost, "connecting to host");
        let host = self.connect_host(&hostname).await?;

        info!(
            "Slot {} established: {} <-> {}:{} ({})",
            slot,
            peer,
            hostname,
            self.upstream_port,
            host.peer()
        );

        Ok(SessionPair::new(hostname, self.upstream_port, client, host))
    }

    /// 服务端角色握手，证书由伪造解析器提供
    async fn accept_client(
        &self,
        tcp: TcpStream,
        peer: SocketAddr,
    ) -> Result<(Leg<ClientTls>, String)> {
        tune_socket(&tcp);

        let stream = self
            .acceptor
            .accept(tcp)
            .await
            .map_err(|e| ProxyError::handshake(LegKind::Client, e))?;

        let sni = stream.get_ref().1.server_name().map(str::to_string);
        let hostname = self.captured_hostname(sni.as_deref())?;

        Ok((Leg::new(stream, peer), hostname))
    }

    /// 主机侧使用的主机名：客户端的 SNI，否则为备用主机
    pub fn captured_hostname(&self, sni: Option<&str>) -> Result<String> {
        let raw = sni
            .or(self.fallback_host.as_deref())
            .ok_or(ProxyError::MissingServerName)?;
        normalize_hostname(raw)
    }

    /// 主机侧的拨号地址，SNI 始终为捕获的主机名
    pub fn dial_target(&self, hostname: &str) -> String {
        match self.connect_override {
            Some(ref target) => target.clone(),
            None if hostname.contains(':') => format!("[{}]:{}", hostname, self.upstream_port),
            None => format!("{}:{}", hostname, self.upstream_port),
        }
    }

    /// 面向真实主机的客户端角色握手
    async fn connect_host(&self, hostname: &str) -> Result<Leg<HostTls>> {
        let target = self.dial_target(hostname);

        let tcp = TcpStream::connect(&target)
            .await
            .map_err(|e| ProxyError::connection_failed(target.clone(), e))?;
        let peer = tcp.peer_addr()?;
        tune_socket(&tcp);

        let server_name = ServerName::try_from(hostname.to_string())
            .map_err(|_| ProxyError::invalid_hostname(hostname))?;

        let stream = self
            .connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| ProxyError::handshake(LegKind::Host, e))?;

        debug!(%hostname, %peer, state = %ConnectionState::HostEstablished, "host leg established");

        Ok(Leg::new(stream, peer))
    }
}

/// 关闭 Nagle 算法并启用 keepalive
fn tune_socket(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }
    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_TIME)
        .with_interval(KEEPALIVE_INTERVAL);
    if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        warn!("Failed to set TCP keepalive: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forge::CertificateForge;
    use crate::tls::{generate_root_ca, RootCa};
    use futures::future::poll_fn;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn establisher(config: &ProxyConfig) -> Establisher {
        let ca = generate_root_ca("Session Test Root", 30).unwrap();
        let root = Arc::new(RootCa::from_pem(&ca.cert_pem, &ca.key_pem).unwrap());
        let forge: Arc<dyn CredentialProvider> = Arc::new(CertificateForge::new(root, 30));
        Establisher::new(forge, config).unwrap()
    }

    fn skip_verify_config() -> ProxyConfig {
        let mut config = ProxyConfig::default();
        config.upstream.skip_verify = true;
        config
    }

    #[tokio::test]
    async fn test_read_chunk_data_then_eof() {
        let (local, mut remote) = duplex(64);
        let mut leg = Leg::new(local, addr(1));
        let mut scratch = [0u8; 16];

        remote.write_all(b"hello").await.unwrap();
        let chunk = poll_fn(|cx| leg.poll_read_chunk(cx, &mut scratch))
            .await
            .unwrap();
        assert_eq!(chunk, ReadChunk::Data(Bytes::from_static(b"hello")));

        drop(remote);
        let chunk = poll_fn(|cx| leg.poll_read_chunk(cx, &mut scratch))
            .await
            .unwrap();
        assert_eq!(chunk, ReadChunk::Eof);
    }

    #[tokio::test]
    async fn test_read_chunk_is_bounded_by_scratch() {
        let (local, mut remote) = duplex(64);
        let mut leg = Leg::new(local, addr(1));
        let mut scratch = [0u8; 4];

        remote.write_all(b"abcdefgh").await.unwrap();
        let first = poll_fn(|cx| leg.poll_read_chunk(cx, &mut scratch))
            .await
            .unwrap();
        let second = poll_fn(|cx| leg.poll_read_chunk(cx, &mut scratch))
            .await
            .unwrap();
        assert_eq!(first, ReadChunk::Data(Bytes::from_static(b"abcd")));
        assert_eq!(second, ReadChunk::Data(Bytes::from_static(b"efgh")));
    }

    #[tokio::test]
    async fn test_write_chunk_is_verbatim() {
        let (local, mut remote) = duplex(64);
        let mut leg = Leg::new(local, addr(1));
        leg.write_chunk(b"\x00\x01binary\xff").await.unwrap();

        let mut buf = [0u8; 9];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"\x00\x01binary\xff");
    }

    #[tokio::test]
    async fn test_pair_close_walks_states() {
        let (c, mut c_remote) = duplex(64);
        let (h, mut h_remote) = duplex(64);
        let mut pair: SessionPair<DuplexStream, DuplexStream> = SessionPair::new(
            "example.com".to_string(),
            443,
            Leg::new(c, addr(1)),
            Leg::new(h, addr(2)),
        );
        assert_eq!(pair.state(), ConnectionState::HostEstablished);

        pair.close().await;
        assert_eq!(pair.state(), ConnectionState::Closed);

        // both peers see end-of-stream
        let mut buf = [0u8; 1];
        assert_eq!(c_remote.read(&mut buf).await.unwrap(), 0);
        assert_eq!(h_remote.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_pair_accounting() {
        let (c, _c_remote) = duplex(8);
        let (h, _h_remote) = duplex(8);
        let mut pair: SessionPair<DuplexStream, DuplexStream> = SessionPair::new(
            "example.com".to_string(),
            443,
            Leg::new(c, addr(1)),
            Leg::new(h, addr(2)),
        );
        pair.record_to_host(10);
        pair.record_to_client(32);
        pair.record_to_host(5);
        assert_eq!(pair.bytes_to_host(), 15);
        assert_eq!(pair.bytes_to_client(), 32);
        assert_eq!(pair.hostname(), "example.com");
        assert_eq!(pair.port(), 443);
        assert!(pair.idle_for(Instant::now()) < Duration::from_secs(5));
    }

    #[test]
    fn test_state_names() {
        assert_eq!(ConnectionState::HostEstablished.to_string(), "active");
        assert_eq!(ConnectionState::AcceptingClient.to_string(), "accepting-client");
    }

    #[test]
    fn test_captured_hostname_prefers_sni() {
        let mut config = skip_verify_config();
        config.proxy.fallback_host = Some("Fallback.Example".to_string());
        let est = establisher(&config);

        assert_eq!(
            est.captured_hostname(Some("Example.COM")).unwrap(),
            "example.com"
        );
        assert_eq!(est.captured_hostname(None).unwrap(), "fallback.example");
    }

    #[test]
    fn test_missing_sni_without_fallback() {
        let est = establisher(&skip_verify_config());
        assert!(matches!(
            est.captured_hostname(None),
            Err(ProxyError::MissingServerName)
        ));
    }

    #[test]
    fn test_dial_target() {
        let mut config = skip_verify_config();
        config.upstream.port = 8443;
        let est = establisher(&config);
        assert_eq!(est.dial_target("example.com"), "example.com:8443");
        assert_eq!(est.dial_target("::1"), "[::1]:8443");

        config.upstream.connect_override = Some("127.0.0.1:9443".to_string());
        let est = establisher(&config);
        assert_eq!(est.dial_target("example.com"), "127.0.0.1:9443");
    }
}

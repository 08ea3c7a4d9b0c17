//! 事件循环
//!
//! 由单个任务持有连接表并驱动全部转发。每一轮先计算关注集合，等待一次就绪，
//! 然后依次：应用握手结果，转发客户端到主机的数据，转发主机到客户端的数据，
//! 至多接受一个新连接，最后关闭空闲连接。

mod relay;

pub use relay::{forward, preview, Direction};

use anyhow::{Context as _, Result};
use futures::future::poll_fn;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::forge::{CertificateForge, CredentialProvider};
use crate::rate_limiter::AcceptLimiter;
use crate::session::{ConnectionState, Establisher, ReadChunk, SessionPair};
use crate::table::{ConnectionTable, Interest, SlotId};
use crate::tls::RootCa;

/// 拆除连接时 close_notify 交换的时间上限
pub const CLOSE_TIMEOUT: Duration = Duration::from_millis(500);

const HOUSEKEEPING_PERIOD: Duration = Duration::from_secs(1);

/// 握手任务的结果，回报给事件循环
struct HandshakeOutcome {
    slot: SlotId,
    result: crate::error::Result<SessionPair>,
}

/// 在发送结果之前被丢弃时，为其槽位回报失败
///
/// 握手任务 panic 或被中止时，预留槽位不会泄漏。
struct OutcomeSender {
    slot: SlotId,
    tx: Option<mpsc::UnboundedSender<HandshakeOutcome>>,
}

impl OutcomeSender {
    fn send(mut self, result: crate::error::Result<SessionPair>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(HandshakeOutcome {
                slot: self.slot,
                result,
            });
        }
    }
}

impl Drop for OutcomeSender {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(HandshakeOutcome {
                slot: self.slot,
                result: Err(ProxyError::Other(anyhow::anyhow!("handshake task ended"))),
            });
        }
    }
}

/// 一次等待中就绪的全部事件
#[derive(Default)]
struct Readiness {
    outcomes: Vec<HandshakeOutcome>,
    client: Vec<(SlotId, io::Result<ReadChunk>)>,
    host: Vec<(SlotId, io::Result<ReadChunk>)>,
    accepted: Option<io::Result<(TcpStream, SocketAddr)>>,
    housekeeping: bool,
    shutdown: bool,
}

impl Readiness {
    fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
            && self.client.is_empty()
            && self.host.is_empty()
            && self.accepted.is_none()
            && !self.housekeeping
            && !self.shutdown
    }
}

/// 已绑定监听套接字的拦截代理
pub struct ProxyServer {
    listener: TcpListener,
    table: ConnectionTable<SessionPair>,
    establisher: Arc<Establisher>,
    limiter: Option<AcceptLimiter>,
    outcome_tx: mpsc::UnboundedSender<HandshakeOutcome>,
    outcome_rx: mpsc::UnboundedReceiver<HandshakeOutcome>,
    handshakes: Vec<(SlotId, AbortHandle)>,
    scratch: Vec<u8>,
    housekeeping: Interval,
    write_timeout: Duration,
    idle_timeout: Option<Duration>,
    log_payloads: bool,
    preview_bytes: usize,
}

impl ProxyServer {
    /// 验证配置，绑定监听器并准备两侧 TLS 配置
    pub async fn bind(
        config: &ProxyConfig,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self> {
        config.validate().context("Invalid proxy configuration")?;

        let establisher = Establisher::new(credentials, config)
            .context("Failed to build TLS configurations")?;

        let limiter = match config.rate_limit {
            Some(ref rate_limit) => Some(AcceptLimiter::new(rate_limit)?),
            None => None,
        };

        let listen_addr = config.listen_addr();
        let listener = TcpListener::bind(&listen_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", listen_addr))?;

        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();

        let mut housekeeping = interval(HOUSEKEEPING_PERIOD);
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Skip);

        Ok(Self {
            listener,
            table: ConnectionTable::with_capacity(config.proxy.max_connections),
            establisher: Arc::new(establisher),
            limiter,
            outcome_tx,
            outcome_rx,
            handshakes: Vec::new(),
            scratch: vec![0u8; config.proxy.read_buffer_size],
            housekeeping,
            write_timeout: config.proxy.write_timeout(),
            idle_timeout: config.proxy.idle_timeout(),
            log_payloads: config.proxy.log_payloads,
            preview_bytes: config.proxy.payload_preview_bytes,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn table(&self) -> &ConnectionTable<SessionPair> {
        &self.table
    }

    /// 运行直到 Ctrl+C
    pub async fn run(self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Received shutdown signal, stopping proxy...");
        })
        .await
    }

    /// 运行直到 `shutdown` 完成，然后关闭所有连接
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut shutdown = std::pin::pin!(shutdown);

        info!(
            "Proxy listening on {} ({} slots)",
            self.local_addr()?,
            self.table.capacity()
        );

        loop {
            let interest = Interest::from_table(&self.table);
            trace!(
                active = self.table.active_len(),
                pending = self.table.pending_len(),
                interest = interest.len(),
                "tick"
            );

            let ready = poll_fn(|cx| self.poll_ready(cx, &interest, shutdown.as_mut())).await;
            if ready.shutdown {
                break;
            }
            self.tick(ready).await;
        }

        self.shutdown().await;
        info!("Proxy stopped gracefully");
        Ok(())
    }

    /// 轮询每个关注的来源一次，任一来源产生事件即就绪
    fn poll_ready(
        &mut self,
        cx: &mut Context<'_>,
        interest: &Interest,
        shutdown: Pin<&mut impl Future<Output = ()>>,
    ) -> Poll<Readiness> {
        let mut ready = Readiness::default();

        if shutdown.poll(cx).is_ready() {
            ready.shutdown = true;
            return Poll::Ready(ready);
        }

        while let Poll::Ready(Some(outcome)) = self.outcome_rx.poll_recv(cx) {
            ready.outcomes.push(outcome);
        }

        for &slot in &interest.client {
            if let Some(pair) = self.table.get_mut(slot) {
                if let Poll::Ready(res) = pair.client.poll_read_chunk(cx, &mut self.scratch) {
                    ready.client.push((slot, res));
                }
            }
        }

        for &slot in &interest.host {
            if let Some(pair) = self.table.get_mut(slot) {
                if let Poll::Ready(res) = pair.host.poll_read_chunk(cx, &mut self.scratch) {
                    ready.host.push((slot, res));
                }
            }
        }

        if interest.listener {
            if let Poll::Ready(res) = self.listener.poll_accept(cx) {
                ready.accepted = Some(res);
            }
        }

        if self.housekeeping.poll_tick(cx).is_ready() {
            ready.housekeeping = true;
        }

        if ready.is_empty() {
            Poll::Pending
        } else {
            Poll::Ready(ready)
        }
    }

    async fn tick(&mut self, ready: Readiness) {
        for outcome in ready.outcomes {
            self.apply_outcome(outcome).await;
        }

        for (slot, res) in ready.client {
            self.relay(slot, Direction::ClientToHost, res).await;
        }

        for (slot, res) in ready.host {
            // 已在客户端阶段拆除
            if self.table.get(slot).is_none() {
                continue;
            }
            self.relay(slot, Direction::HostToClient, res).await;
        }

        match ready.accepted {
            Some(Ok((tcp, peer))) => self.accept(tcp, peer),
            Some(Err(e)) => error!("Failed to accept connection: {}", e),
            None => {}
        }

        if ready.housekeeping {
            self.expire_idle().await;
        }
    }

    async fn apply_outcome(&mut self, outcome: HandshakeOutcome) {
        let HandshakeOutcome { slot, result } = outcome;
        self.handshakes.retain(|(id, _)| *id != slot);

        match result {
            Ok(pair) => {
                let hostname = pair.hostname().to_string();
                if let Err(mut pair) = self.table.activate(slot, pair) {
                    warn!("Slot {} no longer pending, dropping {}", slot, hostname);
                    let _ = tokio::time::timeout(CLOSE_TIMEOUT, pair.close()).await;
                    return;
                }
                debug!(%slot, %hostname, active = self.table.active_len(), "slot activated");
            }
            Err(e) => {
                self.table.release(slot);
                if e.is_disconnect() {
                    debug!("Slot {} handshake aborted by peer: {}", slot, e);
                } else {
                    warn!("Slot {} handshake failed: {}", slot, e);
                }
            }
        }
    }

    async fn relay(&mut self, slot: SlotId, direction: Direction, read: io::Result<ReadChunk>) {
        let data = match read {
            Ok(ReadChunk::Data(data)) => data,
            Ok(ReadChunk::Eof) => {
                let side = match direction {
                    Direction::ClientToHost => "client",
                    Direction::HostToClient => "host",
                };
                self.teardown(slot, &format!("{} closed the connection", side))
                    .await;
                return;
            }
            Err(e) => {
                self.teardown(slot, &format!("{} read error: {}", direction, e))
                    .await;
                return;
            }
        };

        let write_timeout = self.write_timeout;
        let Some(pair) = self.table.get_mut(slot) else {
            return;
        };

        if self.log_payloads {
            debug!(
                "[{}] {} {} ({} bytes): {}",
                slot,
                pair.hostname(),
                direction,
                data.len(),
                preview(&data, self.preview_bytes)
            );
        }

        if let Err(e) = forward(pair, direction, &data, write_timeout).await {
            self.teardown(slot, &format!("{} write error: {}", direction, e))
                .await;
        }
    }

    /// 接纳或拒绝一个已接受的套接字
    fn accept(&mut self, tcp: TcpStream, peer: SocketAddr) {
        if let Some(ref limiter) = self.limiter {
            if let Err(wait) = limiter.check() {
                warn!(
                    "Rate limit exceeded, dropping connection from {} (retry in {:?})",
                    peer, wait
                );
                return;
            }
        }

        let Some(slot) = self.table.allocate() else {
            let err = ProxyError::CapacityExhausted {
                capacity: self.table.capacity(),
            };
            warn!("Refusing connection from {}: {}", peer, err);
            return;
        };

        debug!(%slot, %peer, "accepted connection, starting handshakes");

        let establisher = Arc::clone(&self.establisher);
        let sender = OutcomeSender {
            slot,
            tx: Some(self.outcome_tx.clone()),
        };
        let handle = tokio::spawn(async move {
            let result = establisher.establish(slot, tcp, peer).await;
            sender.send(result);
        });
        self.handshakes.push((slot, handle.abort_handle()));
    }

    async fn expire_idle(&mut self) {
        let Some(idle_timeout) = self.idle_timeout else {
            return;
        };
        let now = Instant::now();
        let expired: Vec<SlotId> = self
            .table
            .iter_active()
            .filter(|(_, pair)| pair.idle_for(now) >= idle_timeout)
            .map(|(slot, _)| slot)
            .collect();

        for slot in expired {
            self.teardown(slot, "idle timeout").await;
        }
    }

    /// 关闭两侧连接并归还槽位
    async fn teardown(&mut self, slot: SlotId, reason: &str) {
        if let Some(pair) = self.table.get_mut(slot) {
            debug!(
                %slot,
                hostname = pair.hostname(),
                state = %ConnectionState::Closing,
                reason,
                "closing pair"
            );
            if tokio::time::timeout(CLOSE_TIMEOUT, pair.close()).await.is_err() {
                debug!("Slot {} close_notify timed out", slot);
            }
        }

        if let Some(pair) = self.table.release(slot) {
            debug!(%slot, state = %pair.state(), "slot released");
            info!(
                "Slot {} released: {} ({}; {} bytes to host, {} bytes to client, open {:?})",
                slot,
                pair.hostname(),
                reason,
                pair.bytes_to_host(),
                pair.bytes_to_client(),
                pair.age()
            );
        }
    }

    async fn shutdown(&mut self) {
        for (slot, handle) in self.handshakes.drain(..) {
            handle.abort();
            self.table.release(slot);
        }
        for slot in self.table.active_ids() {
            self.teardown(slot, "shutdown").await;
        }
    }
}

/// 加载根 CA，构建证书伪造器，运行代理直到 Ctrl+C
pub async fn run_server(config: ProxyConfig) -> Result<()> {
    let root = RootCa::load(&config.ca.cert_path, &config.ca.key_path)
        .context("Failed to load root CA")?;
    info!("Loaded root CA from {:?}", config.ca.cert_path);

    let forge = CertificateForge::new(Arc::new(root), config.ca.leaf_validity_days)
        .with_cache(config.ca.cache_size);

    let server = ProxyServer::bind(&config, Arc::new(forge)).await?;
    server.run().await
}

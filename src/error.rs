/// 代理错误类型
///
/// 单个连接的失败统一表示为 `ProxyError`，事件循环据此只拆除对应的槽位，
/// 其余连接继续服务。启动阶段的错误在 CLI 层用 anyhow 附加上下文。
use std::fmt;
use std::io;
use thiserror::Error;

/// 错误所属的连接一侧
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegKind {
    /// 面向客户端，代理作为 TLS 服务端
    Client,
    /// 面向真实主机，代理作为 TLS 客户端
    Host,
}

impl fmt::Display for LegKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LegKind::Client => write!(f, "client"),
            LegKind::Host => write!(f, "host"),
        }
    }
}

/// 代理的主要错误类型
#[derive(Error, Debug)]
pub enum ProxyError {
    /// 出站连接失败
    #[error("Failed to connect to {addr}: {source}")]
    ConnectionFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// 某一侧的 TLS 握手失败
    #[error("TLS handshake with {leg} failed: {source}")]
    Handshake {
        leg: LegKind,
        #[source]
        source: io::Error,
    },

    /// 证书伪造或根 CA 材料错误
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// 主机名无法用作 SNI 或证书主题
    #[error("Invalid hostname: {0}")]
    InvalidHostname(String),

    /// 客户端未发送 SNI 且未配置备用主机
    #[error("Client did not present a server name and no fallback host is configured")]
    MissingServerName,

    /// 操作超时
    #[error("Operation timeout after {duration:?}")]
    Timeout { duration: std::time::Duration },

    /// 连接表已无空闲槽位
    #[error("Connection table full ({capacity} slots in use)")]
    CapacityExhausted { capacity: usize },

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// 其他错误，兼容 anyhow
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    pub fn connection_failed(addr: impl Into<String>, source: io::Error) -> Self {
        Self::ConnectionFailed {
            addr: addr.into(),
            source,
        }
    }

    pub fn handshake(leg: LegKind, source: io::Error) -> Self {
        Self::Handshake { leg, source }
    }

    pub fn certificate(msg: impl Into<String>) -> Self {
        Self::Certificate(msg.into())
    }

    pub fn invalid_hostname(host: impl Into<String>) -> Self {
        Self::InvalidHostname(host.into())
    }

    pub fn timeout(duration: std::time::Duration) -> Self {
        Self::Timeout { duration }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_handshake(&self) -> bool {
        matches!(self, Self::Handshake { .. })
    }

    pub fn is_certificate(&self) -> bool {
        matches!(self, Self::Certificate(_) | Self::InvalidHostname(_))
    }

    /// 对端已断开（连接重置、管道破裂或意外 EOF）
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

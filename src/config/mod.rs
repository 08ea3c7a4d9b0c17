// 配置管理

mod validator;

pub use validator::ConfigValidator;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_bind_port() -> u16 {
    8080
}

fn default_max_connections() -> usize {
    20
}

fn default_read_buffer_size() -> usize {
    16 * 1024
}

fn default_handshake_timeout_secs() -> u64 {
    10
}

fn default_write_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    300
}

fn default_alpn_protocols() -> Vec<String> {
    vec!["http/1.1".to_string()]
}

fn default_true() -> bool {
    true
}

fn default_payload_preview_bytes() -> usize {
    256
}

fn default_ca_cert_path() -> PathBuf {
    PathBuf::from("cert/cert-test/rootCA.pem")
}

fn default_ca_key_path() -> PathBuf {
    PathBuf::from("cert/cert-test/rootCA.key")
}

fn default_leaf_validity_days() -> u32 {
    365
}

fn default_cache_size() -> usize {
    1000
}

fn default_upstream_port() -> u16 {
    443
}

/// 监听与转发设置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// 监听地址
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// 监听端口
    #[serde(default = "default_bind_port")]
    pub bind_port: u16,
    /// 连接表容量
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// 单侧单次读取的上限
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    /// 覆盖两次握手和出站连接
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    /// 向另一侧转发一个数据块的时间上限
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,
    /// 空闲超过该时长的连接将被关闭，0 表示不限制
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// 两侧提供的 ALPN
    #[serde(default = "default_alpn_protocols")]
    pub alpn_protocols: Vec<String>,
    /// 客户端 hello 未携带 SNI 时使用的主机名
    #[serde(default)]
    pub fallback_host: Option<String>,
    /// 在 debug 级别记录转发数据预览
    #[serde(default = "default_true")]
    pub log_payloads: bool,
    /// 数据预览的最大字节数
    #[serde(default = "default_payload_preview_bytes")]
    pub payload_preview_bytes: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            bind_port: default_bind_port(),
            max_connections: default_max_connections(),
            read_buffer_size: default_read_buffer_size(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            write_timeout_secs: default_write_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            alpn_protocols: default_alpn_protocols(),
            fallback_host: None,
            log_payloads: true,
            payload_preview_bytes: default_payload_preview_bytes(),
        }
    }
}

impl ListenerConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    /// 未启用空闲超时时为 `None`
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn alpn(&self) -> Vec<Vec<u8>> {
        self.alpn_protocols
            .iter()
            .map(|p| p.as_bytes().to_vec())
            .collect()
    }
}

/// 根 CA 材料与证书伪造设置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaConfig {
    /// 根 CA 证书（PEM）
    #[serde(default = "default_ca_cert_path")]
    pub cert_path: PathBuf,
    /// 根 CA 私钥（PEM）
    #[serde(default = "default_ca_key_path")]
    pub key_path: PathBuf,
    /// 伪造叶子证书的有效期
    #[serde(default = "default_leaf_validity_days")]
    pub leaf_validity_days: u32,
    /// 伪造证书缓存容量，0 表示不缓存
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            cert_path: default_ca_cert_path(),
            key_path: default_ca_key_path(),
            leaf_validity_days: default_leaf_validity_days(),
            cache_size: default_cache_size(),
        }
    }
}

/// 面向主机一侧的设置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// 真实主机的目标端口
    #[serde(default = "default_upstream_port")]
    pub port: u16,
    /// 拨号到该 `host:port` 而不是 `<sni>:<port>`，SNI 不变
    #[serde(default)]
    pub connect_override: Option<String>,
    /// 验证主机时额外信任的 CA 证书
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,
    /// 跳过主机证书验证（仅用于测试）
    #[serde(default)]
    pub skip_verify: bool,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            port: default_upstream_port(),
            connect_override: None,
            ca_cert_path: None,
            skip_verify: false,
        }
    }
}

/// 接入速率限制
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// 每秒允许的新连接数
    pub requests_per_second: u32,
    /// 突发容量
    pub burst_size: u32,
}

/// 完整的代理配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub proxy: ListenerConfig,
    #[serde(default)]
    pub ca: CaConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
}

impl ProxyConfig {
    /// 解析并验证配置文本
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: ProxyConfig =
            toml::from_str(content).context("Failed to parse proxy configuration")?;
        config
            .validate()
            .context("Proxy configuration validation failed")?;
        Ok(config)
    }

    /// 从文件加载配置
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file: {}", path))?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ConfigValidator::validate_proxy_config(self)
    }

    /// `bind_addr:bind_port`
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.proxy.bind_addr, self.proxy.bind_port)
    }
}

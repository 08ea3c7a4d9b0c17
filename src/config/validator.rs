use anyhow::{bail, Result};
use tracing::warn;

use super::{CaConfig, ListenerConfig, ProxyConfig, RateLimitConfig, UpstreamConfig};

const MIN_READ_BUFFER: usize = 512;
const MAX_READ_BUFFER: usize = 1024 * 1024;
/// 通用 TLS 客户端仍接受的叶子证书最长有效期
const MAX_LEAF_VALIDITY_DAYS: u32 = 825;

/// 配置验证器
pub struct ConfigValidator;

impl ConfigValidator {
    /// 端口不能为 0
    pub fn validate_port(port: u16, context: &str) -> Result<()> {
        if port == 0 {
            bail!("{}: port cannot be 0", context);
        }
        Ok(())
    }

    /// 地址不能为空
    pub fn validate_address(addr: &str, context: &str) -> Result<()> {
        if addr.trim().is_empty() {
            bail!("{}: address cannot be empty", context);
        }
        Ok(())
    }

    /// `host:port` 格式，主机非空且端口非 0
    pub fn validate_host_port(value: &str, context: &str) -> Result<()> {
        let Some((host, port)) = value.rsplit_once(':') else {
            bail!("{}: '{}' must be in host:port form", context, value);
        };
        Self::validate_address(host, context)?;
        let port: u16 = match port.parse() {
            Ok(p) => p,
            Err(_) => bail!("{}: invalid port in '{}'", context, value),
        };
        Self::validate_port(port, context)
    }

    pub fn validate_proxy_config(config: &ProxyConfig) -> Result<()> {
        Self::validate_listener_config(&config.proxy)?;
        Self::validate_ca_config(&config.ca)?;
        Self::validate_upstream_config(&config.upstream)?;
        if let Some(ref rate_limit) = config.rate_limit {
            Self::validate_rate_limit_config(rate_limit)?;
        }
        Ok(())
    }

    pub fn validate_listener_config(config: &ListenerConfig) -> Result<()> {
        Self::validate_address(&config.bind_addr, "proxy.bind_addr")?;
        Self::validate_port(config.bind_port, "proxy.bind_port")?;

        if config.max_connections == 0 {
            bail!("proxy.max_connections must be at least 1");
        }
        if !(MIN_READ_BUFFER..=MAX_READ_BUFFER).contains(&config.read_buffer_size) {
            bail!(
                "proxy.read_buffer_size must be between {} and {} (current: {})",
                MIN_READ_BUFFER,
                MAX_READ_BUFFER,
                config.read_buffer_size
            );
        }
        if config.handshake_timeout_secs == 0 {
            bail!("proxy.handshake_timeout_secs must be greater than 0");
        }
        if config.write_timeout_secs == 0 {
            bail!("proxy.write_timeout_secs must be greater than 0");
        }
        if config.alpn_protocols.iter().any(|p| p.is_empty()) {
            bail!("proxy.alpn_protocols cannot contain empty entries");
        }
        if let Some(ref host) = config.fallback_host {
            if host.trim().is_empty() {
                bail!("proxy.fallback_host cannot be empty when set");
            }
        }
        Ok(())
    }

    pub fn validate_ca_config(config: &CaConfig) -> Result<()> {
        if config.cert_path.as_os_str().is_empty() || config.key_path.as_os_str().is_empty() {
            bail!("ca.cert_path and ca.key_path must both be set");
        }
        if config.leaf_validity_days == 0 || config.leaf_validity_days > MAX_LEAF_VALIDITY_DAYS {
            bail!(
                "ca.leaf_validity_days must be between 1 and {}",
                MAX_LEAF_VALIDITY_DAYS
            );
        }
        Ok(())
    }

    pub fn validate_upstream_config(config: &UpstreamConfig) -> Result<()> {
        Self::validate_port(config.port, "upstream.port")?;
        if let Some(ref target) = config.connect_override {
            Self::validate_host_port(target, "upstream.connect_override")?;
        }
        if config.skip_verify {
            warn!("upstream.skip_verify is enabled: host certificates will NOT be verified");
        }
        Ok(())
    }

    pub fn validate_rate_limit_config(config: &RateLimitConfig) -> Result<()> {
        if config.requests_per_second == 0 {
            bail!("rate_limit.requests_per_second must be greater than 0");
        }
        if config.burst_size == 0 {
            bail!("rate_limit.burst_size must be greater than 0");
        }
        if config.burst_size < config.requests_per_second {
            warn!(
                "rate_limit.burst_size ({}) is less than requests_per_second ({}), \
                 this may cause frequent rate limiting",
                config.burst_size, config.requests_per_second
            );
        }
        Ok(())
    }
}

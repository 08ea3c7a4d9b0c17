//! 按主机名伪造叶子证书
//!
//! 为每个主机名生成新的密钥对，并用本地根 CA 签发叶子证书。
//! [`ForgingResolver`] 接入面向客户端的握手：rustls 在选择证书前把 ClientHello
//! 交给它，伪造出的身份始终与客户端请求的名称一致。

use parking_lot::Mutex;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose,
};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tracing::{debug, error, trace};

use crate::error::{ProxyError, Result};
use crate::tls::{crypto_provider, RootCa};

/// `not_before` 的时钟偏差余量
const NOT_BEFORE_SKEW_DAYS: i64 = 1;

/// 可作为证书主题的最长主机名
pub const MAX_HOSTNAME_LEN: usize = 253;

/// 单个主机名的私钥、叶子证书和证书链
#[derive(Debug)]
pub struct ForgedCertificate {
    pub hostname: String,
    /// `[leaf, root]`
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl ForgedCertificate {
    pub fn leaf(&self) -> &CertificateDer<'static> {
        &self.chain[0]
    }
}

/// “给定主机名，提供凭据”
///
/// 由 [`CertificateForge`] 实现，测试或其他证书来源可自行实现。
pub trait CredentialProvider: Send + Sync {
    fn credentials(&self, hostname: &str) -> Result<Arc<CertifiedKey>>;
}

/// 使用根 CA 签发叶子证书
pub struct CertificateForge {
    root: Arc<RootCa>,
    provider: Arc<CryptoProvider>,
    validity_days: i64,
    cache: Option<CertificateCache>,
}

impl CertificateForge {
    pub fn new(root: Arc<RootCa>, validity_days: u32) -> Self {
        Self {
            root,
            provider: crypto_provider(),
            validity_days: i64::from(validity_days),
            cache: None,
        }
    }

    /// 缓存伪造的凭据，最多 `capacity` 个主机名，0 表示不缓存
    pub fn with_cache(mut self, capacity: usize) -> Self {
        self.cache = (capacity > 0).then(|| CertificateCache::new(capacity));
        self
    }

    /// 为 `hostname` 伪造证书
    pub fn forge(&self, hostname: &str) -> Result<ForgedCertificate> {
        let hostname = normalize_hostname(hostname)?;

        // CertificateParams::new 把名称写入 SAN：能解析为 IP 时写 IP 地址，否则写 DNS 名称
        let mut params = CertificateParams::new(vec![hostname.clone()])
            .map_err(|e| ProxyError::invalid_hostname(format!("{}: {}", hostname, e)))?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, hostname.as_str());
        params.distinguished_name = dn;

        params.serial_number = Some(rand::random::<u64>().into());
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.use_authority_key_identifier_extension = true;

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::days(NOT_BEFORE_SKEW_DAYS);
        // 不超过根证书的有效期
        params.not_after = (now + Duration::days(self.validity_days)).min(self.root.not_after());

        let key_pair = KeyPair::generate()
            .map_err(|e| ProxyError::certificate(format!("Failed to generate key pair: {}", e)))?;

        let cert = params
            .signed_by(&key_pair, self.root.issuer())
            .map_err(|e| {
                ProxyError::certificate(format!("Failed to sign certificate for {}: {}", hostname, e))
            })?;

        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        let chain = vec![cert.der().clone(), self.root.cert_der().clone()];

        debug!("Forged certificate for {}", hostname);

        Ok(ForgedCertificate {
            hostname,
            chain,
            key,
        })
    }

    /// 伪造并转换为 rustls 签名身份
    fn forge_certified(&self, hostname: &str) -> Result<Arc<CertifiedKey>> {
        let forged = self.forge(hostname)?;
        let signing_key = self
            .provider
            .key_provider
            .load_private_key(forged.key)
            .map_err(|e| ProxyError::certificate(format!("Failed to load forged key: {}", e)))?;
        Ok(Arc::new(CertifiedKey::new(forged.chain, signing_key)))
    }

    /// 已缓存的主机名数量
    pub fn cached_len(&self) -> usize {
        self.cache.as_ref().map_or(0, CertificateCache::len)
    }
}

impl CredentialProvider for CertificateForge {
    fn credentials(&self, hostname: &str) -> Result<Arc<CertifiedKey>> {
        let Some(cache) = &self.cache else {
            return self.forge_certified(hostname);
        };

        let key = normalize_hostname(hostname)?;
        if let Some(hit) = cache.get(&key) {
            trace!("Certificate cache hit for {}", key);
            return Ok(hit);
        }

        let certified = self.forge_certified(&key)?;
        cache.insert(key, certified.clone());
        Ok(certified)
    }
}

impl fmt::Debug for CertificateForge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateForge")
            .field("validity_days", &self.validity_days)
            .field("cached", &self.cached_len())
            .finish()
    }
}

/// 有界的主机名到凭据映射
///
/// 键为规范化后的主机名，查找只会返回为该名称伪造的凭据。
/// 满了之后，下一次插入前清空整个映射。
struct CertificateCache {
    capacity: usize,
    entries: Mutex<HashMap<String, Arc<CertifiedKey>>>,
}

impl CertificateCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn get(&self, hostname: &str) -> Option<Arc<CertifiedKey>> {
        self.entries.lock().get(hostname).cloned()
    }

    fn insert(&self, hostname: String, key: Arc<CertifiedKey>) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity && !entries.contains_key(&hostname) {
            debug!("Certificate cache full ({} entries), clearing", entries.len());
            entries.clear();
        }
        entries.insert(hostname, key);
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// 转为小写并去掉末尾的点，拒绝空名称和超长名称
pub fn normalize_hostname(hostname: &str) -> Result<String> {
    let trimmed = hostname.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        return Err(ProxyError::invalid_hostname("empty hostname"));
    }
    if trimmed.len() > MAX_HOSTNAME_LEN {
        return Err(ProxyError::invalid_hostname(format!(
            "hostname longer than {} bytes",
            MAX_HOSTNAME_LEN
        )));
    }
    if trimmed.chars().any(|c| c.is_whitespace() || c.is_control() || c == '/') {
        return Err(ProxyError::invalid_hostname(trimmed.to_string()));
    }
    Ok(trimmed.to_ascii_lowercase())
}

/// 基于 [`CredentialProvider`] 的 rustls ClientHello 检查钩子
///
/// 优先使用 ClientHello 中的 SNI，客户端未发送时使用 `fallback_host`。
/// 返回 `None` 时握手以 TLS 告警中止，伪造失败由此传达给客户端。
pub struct ForgingResolver {
    provider: Arc<dyn CredentialProvider>,
    fallback_host: Option<String>,
}

impl ForgingResolver {
    pub fn new(provider: Arc<dyn CredentialProvider>, fallback_host: Option<String>) -> Self {
        Self {
            provider,
            fallback_host,
        }
    }

    /// 将要为其伪造证书的主机名
    pub fn select_hostname(&self, sni: Option<&str>) -> Option<String> {
        sni.map(str::to_string).or_else(|| self.fallback_host.clone())
    }
}

impl ResolvesServerCert for ForgingResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let Some(hostname) = self.select_hostname(client_hello.server_name()) else {
            error!("Client hello carries no SNI and no fallback host is configured");
            return None;
        };

        trace!("Resolving certificate for {}", hostname);

        match self.provider.credentials(&hostname) {
            Ok(key) => Some(key),
            Err(e) => {
                error!("Failed to forge certificate for {}: {}", hostname, e);
                None
            }
        }
    }
}

impl fmt::Debug for ForgingResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForgingResolver")
            .field("fallback_host", &self.fallback_host)
            .finish()
    }
}

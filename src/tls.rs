use anyhow::{Context, Result};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::CertificateDer;
use rustls::server::ResolvesServerCert;
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tracing::{debug, warn};

use crate::error::ProxyError;

/// 两侧连接与证书伪造共用的加密提供者
///
/// 显式构建，不依赖进程级默认提供者，避免多个提供者同时启用时构建器 panic。
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

/// 用于签发伪造叶子证书的根 CA
///
/// 启动时加载一次，之后只读共享。
pub struct RootCa {
    issuer: Issuer<'static, KeyPair>,
    cert_der: CertificateDer<'static>,
    not_after: OffsetDateTime,
}

impl RootCa {
    /// 从 PEM 文件加载根证书和私钥
    pub fn load(cert_path: &Path, key_path: &Path) -> crate::error::Result<Self> {
        let cert_pem = std::fs::read_to_string(cert_path).map_err(|e| {
            ProxyError::certificate(format!(
                "Failed to read CA certificate {:?}: {}",
                cert_path, e
            ))
        })?;
        let key_pem = std::fs::read_to_string(key_path).map_err(|e| {
            ProxyError::certificate(format!("Failed to read CA key {:?}: {}", key_path, e))
        })?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    /// 从 PEM 文本构建
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> crate::error::Result<Self> {
        let key_pair = KeyPair::from_pem(key_pem)
            .map_err(|e| ProxyError::certificate(format!("Failed to parse CA key: {}", e)))?;

        let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| ProxyError::certificate("No certificate found in CA PEM"))?
            .map_err(|e| ProxyError::certificate(format!("Failed to parse CA PEM: {}", e)))?;

        let issuer = Issuer::from_ca_cert_pem(cert_pem, key_pair).map_err(|e| {
            ProxyError::certificate(format!("Failed to create issuer from CA cert: {}", e))
        })?;

        let (_, parsed) = x509_parser::parse_x509_certificate(cert_der.as_ref())
            .map_err(|e| ProxyError::certificate(format!("Failed to parse CA certificate: {}", e)))?;
        let not_after = parsed.validity().not_after.to_datetime();

        Ok(Self {
            issuer,
            cert_der,
            not_after,
        })
    }

    /// DER 格式的根证书，附加在每条伪造证书链末尾
    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    /// 根证书有效期截止时间，叶子证书不得超过
    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    pub(crate) fn issuer(&self) -> &Issuer<'static, KeyPair> {
        &self.issuer
    }
}

impl fmt::Debug for RootCa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootCa")
            .field("cert_der_len", &self.cert_der.len())
            .field("not_after", &self.not_after)
            .finish()
    }
}

/// [`generate_root_ca`] 生成的 PEM 格式根 CA
pub struct GeneratedCa {
    pub cert_pem: String,
    pub key_pem: String,
}

/// 生成可签发伪造叶子证书的自签名根 CA
pub fn generate_root_ca(common_name: &str, validity_days: i64) -> Result<GeneratedCa> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, "TLS Intercept");
    params.distinguished_name = dn;

    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::days(1);
    params.not_after = now + Duration::days(validity_days);

    let key_pair = KeyPair::generate().context("Failed to generate CA key pair")?;
    let cert = params
        .self_signed(&key_pair)
        .context("Failed to self-sign CA certificate")?;

    Ok(GeneratedCa {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    })
}

/// 生成根 CA 并写入指定路径
pub fn write_root_ca(
    common_name: &str,
    validity_days: i64,
    cert_out: &Path,
    key_out: &Path,
) -> Result<()> {
    let ca = generate_root_ca(common_name, validity_days)?;

    if let Some(parent) = cert_out.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }
    if let Some(parent) = key_out.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }

    std::fs::write(cert_out, ca.cert_pem)
        .with_context(|| format!("Failed to write CA certificate to {:?}", cert_out))?;
    std::fs::write(key_out, ca.key_pem)
        .with_context(|| format!("Failed to write CA key to {:?}", key_out))?;

    Ok(())
}

/// 从 PEM 文件加载全部证书
pub fn load_pem_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).with_context(|| format!("Failed to open cert file: {:?}", path))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to parse certificates in {:?}", path))
}

/// 面向客户端的服务端配置，证书由 `resolver` 提供
pub fn build_client_facing_config(
    resolver: Arc<dyn ResolvesServerCert>,
    alpn_protocols: Vec<Vec<u8>>,
) -> Result<Arc<rustls::ServerConfig>> {
    let mut config = rustls::ServerConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .context("Failed to select TLS protocol versions")?
        .with_no_client_auth()
        .with_cert_resolver(resolver);

    config.alpn_protocols = alpn_protocols;

    Ok(Arc::new(config))
}

/// 面向真实主机的客户端配置
///
/// 信任系统根证书和 `extra_ca_path`。启用 `skip_verify` 时接受任何主机证书（仅用于测试）。
pub fn build_host_facing_config(
    extra_ca_path: Option<&Path>,
    skip_verify: bool,
    alpn_protocols: Vec<Vec<u8>>,
) -> Result<Arc<rustls::ClientConfig>> {
    let provider = crypto_provider();
    let mut root_store = rustls::RootCertStore::empty();

    if !skip_verify {
        let native_certs = rustls_native_certs::load_native_certs();
        for err in &native_certs.errors {
            warn!("Failed to load a native root certificate: {}", err);
        }
        let (added, ignored) = root_store.add_parsable_certificates(native_certs.certs);
        debug!("Loaded {} native root certificates ({} ignored)", added, ignored);
    }

    if let Some(ca_path) = extra_ca_path {
        for cert in load_pem_certs(ca_path)? {
            root_store
                .add(cert)
                .context("Failed to add upstream CA certificate")?;
        }
    }

    if root_store.is_empty() && !skip_verify {
        warn!("No trusted roots available for upstream verification; host handshakes will fail");
    }

    let mut config = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .context("Failed to select TLS protocol versions")?
        .with_root_certificates(root_store)
        .with_no_client_auth();

    if skip_verify {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoCertificateVerification { provider }));
    }

    config.alpn_protocols = alpn_protocols;

    Ok(Arc::new(config))
}

/// 接受任何主机证书（仅用于测试）
#[derive(Debug)]
struct NoCertificateVerification {
    provider: Arc<CryptoProvider>,
}

impl rustls::client::danger::ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer,
        _intermediates: &[CertificateDer],
        _server_name: &rustls::pki_types::ServerName,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ca_loads() {
        let ca = generate_root_ca("Test Root", 30).unwrap();
        assert!(ca.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(ca.key_pem.contains("PRIVATE KEY"));

        let root = RootCa::from_pem(&ca.cert_pem, &ca.key_pem).unwrap();
        assert!(!root.cert_der().is_empty());

        let remaining = root.not_after() - OffsetDateTime::now_utc();
        assert!(remaining > Duration::days(29));
        assert!(remaining <= Duration::days(30));
    }

    #[test]
    fn test_mismatched_pem_rejected() {
        let ca = generate_root_ca("Test Root", 30).unwrap();
        assert!(RootCa::from_pem(&ca.key_pem, &ca.key_pem).is_err());
        assert!(RootCa::from_pem(&ca.cert_pem, "not a key").is_err());
    }

    #[test]
    fn test_missing_files_are_certificate_errors() {
        let err = RootCa::load(
            Path::new("/nonexistent/rootCA.pem"),
            Path::new("/nonexistent/rootCA.key"),
        )
        .unwrap_err();
        assert!(err.is_certificate());
    }

    #[test]
    fn test_write_and_load_root_ca() {
        let dir = std::env::temp_dir().join(format!("tls-intercept-ca-{}", std::process::id()));
        let cert_path = dir.join("rootCA.pem");
        let key_path = dir.join("rootCA.key");

        write_root_ca("Written Root", 30, &cert_path, &key_path).unwrap();
        assert!(RootCa::load(&cert_path, &key_path).is_ok());
        assert_eq!(load_pem_certs(&cert_path).unwrap().len(), 1);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_host_facing_config_with_skip_verify() {
        let config = build_host_facing_config(None, true, vec![b"http/1.1".to_vec()]).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }
}

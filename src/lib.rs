/// 透明 TLS 拦截代理库入口
///
/// 将核心模块导出为库，供二进制程序和测试使用
pub mod cli;
pub mod config;
pub mod error;
pub mod forge;
pub mod rate_limiter;
pub mod server;
pub mod session;
pub mod table;
pub mod tls;

pub use config::ProxyConfig;
pub use error::{ProxyError, Result};
pub use forge::{CertificateForge, CredentialProvider, ForgedCertificate, ForgingResolver};
pub use server::{run_server, ProxyServer};
pub use session::{ConnectionState, Establisher, SessionPair};
pub use table::{ConnectionTable, Interest, SlotId, SlotState};
pub use tls::RootCa;

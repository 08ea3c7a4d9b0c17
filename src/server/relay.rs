use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{ProxyError, Result};
use crate::session::SessionPair;

/// 数据块在会话对中的流向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToHost,
    HostToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToHost => f.write_str("client->host"),
            Direction::HostToClient => f.write_str("host->client"),
        }
    }
}

/// 向对侧写入一个数据块，受 `write_timeout` 限制
pub async fn forward<C, H>(
    pair: &mut SessionPair<C, H>,
    direction: Direction,
    data: &[u8],
    write_timeout: Duration,
) -> Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin,
    H: AsyncRead + AsyncWrite + Unpin,
{
    let write = async {
        match direction {
            Direction::ClientToHost => pair.host.write_chunk(data).await,
            Direction::HostToClient => pair.client.write_chunk(data).await,
        }
    };

    match tokio::time::timeout(write_timeout, write).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => return Err(ProxyError::timeout(write_timeout)),
    }

    match direction {
        Direction::ClientToHost => pair.record_to_host(data.len()),
        Direction::HostToClient => pair.record_to_client(data.len()),
    }
    Ok(())
}

/// 用于 debug 日志的数据预览
///
/// 按有损 UTF-8 解码，转义控制字符，截断到 `limit` 字节。
pub fn preview(data: &[u8], limit: usize) -> String {
    let shown = &data[..data.len().min(limit)];
    let text = String::from_utf8_lossy(shown);

    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        if ch.is_control() {
            out.extend(ch.escape_default());
        } else {
            out.push(ch);
        }
    }
    if data.len() > limit {
        out.push_str(&format!("... (+{} bytes)", data.len() - limit));
    }
    out
}

//! 接入速率限制器
//!
//! 对新客户端连接使用令牌桶，令牌耗尽时在分配槽位之前直接丢弃连接。
use anyhow::{anyhow, Result};
use governor::{
    clock::{Clock, DefaultClock},
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorLimiter,
};
use std::num::NonZeroU32;
use std::time::Duration;

use crate::config::RateLimitConfig;

/// 基于 governor 的直接限流器
pub struct AcceptLimiter {
    inner: GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>,
    clock: DefaultClock,
}

impl AcceptLimiter {
    pub fn new(config: &RateLimitConfig) -> Result<Self> {
        let per_second = NonZeroU32::new(config.requests_per_second)
            .ok_or_else(|| anyhow!("rate_limit.requests_per_second must be > 0"))?;
        let burst = NonZeroU32::new(config.burst_size)
            .ok_or_else(|| anyhow!("rate_limit.burst_size must be > 0"))?;

        let quota = Quota::per_second(per_second).allow_burst(burst);

        Ok(Self {
            inner: GovernorLimiter::direct(quota),
            clock: DefaultClock::default(),
        })
    }

    /// 取一个令牌，失败时返回距下一个令牌的等待时间
    pub fn check(&self) -> std::result::Result<(), Duration> {
        self.inner
            .check()
            .map_err(|not_until| not_until.wait_time_from(self.clock.now()))
    }
}

//! 瞬时网络错误重试
//!
//! 只有超时、连接失败、连接被重置和 502/503/504 会重试，
//! 业务拒绝由自动修复循环处理，不在这里重试。

use crate::config::HttpConfig;
use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// 指数退避策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn from_config(http: &HttpConfig) -> Self {
        Self {
            max_retries: http.max_retries,
            base: Duration::from_millis(http.backoff_base_ms),
            max: Duration::from_millis(http.backoff_max_ms),
        }
    }

    /// 第 `attempt` 次失败后的基础等待时间（`base * 2^(attempt-1)`，不超过 `max`）
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base.saturating_mul(factor).min(self.max)
    }

    /// 加上 0~50% 随机抖动后的等待时间
    pub fn delay(&self, attempt: u32) -> Duration {
        let backoff = self.backoff(attempt);
        let jitter_ms = backoff.as_millis() as u64 / 2;
        if jitter_ms == 0 {
            return backoff;
        }
        backoff + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

/// 单次尝试的失败类型
#[derive(Debug)]
pub enum Failure<E> {
    /// 瞬时错误，可以重试
    Transient(E),
    /// 不可重试
    Permanent(E),
}

/// 重试耗尽或遇到不可重试错误
#[derive(Debug)]
pub struct RetryError<E> {
    pub error: E,
    pub attempts: u32,
}

/// 按策略执行 `op`，`op` 的参数是当前尝试次数（从 1 开始）
pub async fn with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, Failure<E>>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(Failure::Transient(error)) if attempt <= policy.max_retries => {
                let delay = policy.delay(attempt);
                warn!(
                    "{} 失败 (尝试 {}/{}): {}，{}ms 后重试...",
                    what,
                    attempt,
                    policy.max_retries + 1,
                    error,
                    delay.as_millis()
                );
                sleep(delay).await;
            }
            Err(Failure::Transient(error)) | Err(Failure::Permanent(error)) => {
                return Err(RetryError {
                    error,
                    attempts: attempt,
                })
            }
        }
    }
}

/// 是否为可重试的 HTTP 状态码
pub fn is_transient_status(status: u16) -> bool {
    matches!(status, 502..=504)
}

/// 是否为可重试的传输层错误
pub fn is_transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || is_connection_reset(err)
}

fn is_connection_reset(err: &reqwest::Error) -> bool {
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            return matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            );
        }
        source = cause.source();
    }
    false
}

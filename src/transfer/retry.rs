// 重试与指数退避
//
// 延迟序列：unit * base^n（n 从 0 开始），默认 1s、2s、4s。
// 每次重试前当前连接都会被作废，重新从连接池借出新连接。

use crate::error::{TransferError, TransferResultOf};
use crate::pool::ConnectionPool;
use crate::remote::RemoteSession;
use futures::future::BoxFuture;
use std::time::Duration;
use tracing::{debug, warn};

/// 默认最大尝试次数
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// 默认退避底数
pub const DEFAULT_BACKOFF_BASE: f64 = 2.0;

/// 退避单位下限，保证延迟严格递增
const MIN_BACKOFF_UNIT: Duration = Duration::from_millis(1);

/// 重试决策
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// 等待后重试
    RetryAfter(Duration),
    /// 放弃
    GiveUp,
}

/// 重试策略
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base: f64,
    unit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_BACKOFF_BASE, Duration::from_secs(1))
    }
}

impl RetryPolicy {
    /// 底数不大于 1（或为 NaN）时退回默认底数，单位最小 1ms
    pub fn new(max_attempts: u32, base: f64, unit: Duration) -> Self {
        let base = if base.is_nan() || base <= 1.0 {
            warn!("退避底数 {} 非法，使用默认值 {}", base, DEFAULT_BACKOFF_BASE);
            DEFAULT_BACKOFF_BASE
        } else {
            base
        };
        Self {
            max_attempts: max_attempts.max(1),
            base,
            unit: unit.max(MIN_BACKOFF_UNIT),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// 第 n 次重试前的等待时间（n 从 0 开始）
    pub fn delay_for(&self, retry_index: u32) -> Duration {
        let exponent = i32::try_from(retry_index).unwrap_or(i32::MAX);
        let secs = self.unit.as_secs_f64() * self.base.powi(exponent);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }

    /// 第 `attempt` 次尝试（从 1 开始）失败后的决策
    pub fn decide(&self, attempt: u32, err: &TransferError) -> RetryDecision {
        if !err.is_retriable() || attempt >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        RetryDecision::RetryAfter(self.delay_for(attempt - 1))
    }
}

/// 带重试的执行结果
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: TransferResultOf<T>,
    /// 实际尝试次数
    pub attempts: u32,
}

/// 在重试包络内执行一个远端操作
///
/// 每次尝试都从连接池借出连接：成功或不可重试的失败归还连接，
/// 可重试的失败作废连接，下一次尝试会拿到新连接。
pub async fn run_with_retry<T, F>(
    pool: &ConnectionPool,
    server: &str,
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> Attempted<T>
where
    F: for<'s> FnMut(&'s mut dyn RemoteSession) -> BoxFuture<'s, TransferResultOf<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;

        let result = match pool.acquire(server).await {
            Ok(mut conn) => {
                let result = match conn.session() {
                    Ok(session) => op(session).await,
                    Err(e) => Err(e),
                };
                match &result {
                    Err(e) if e.is_retriable() => conn.invalidate().await,
                    _ => conn.release(),
                }
                result
            }
            Err(e) => Err(e),
        };

        let err = match result {
            Ok(value) => {
                if attempt > 1 {
                    debug!("{} 在第 {} 次尝试成功", label, attempt);
                }
                return Attempted {
                    result: Ok(value),
                    attempts: attempt,
                };
            }
            Err(e) => e,
        };

        match policy.decide(attempt, &err) {
            RetryDecision::RetryAfter(delay) => {
                warn!(
                    "{} 失败 (第 {}/{} 次): {}，{:?} 后重试",
                    label, attempt, policy.max_attempts, err, delay
                );
                tokio::time::sleep(delay).await;
            }
            RetryDecision::GiveUp => {
                if err.is_retriable() {
                    warn!("{} 重试 {} 次后放弃: {}", label, attempt, err);
                } else {
                    debug!("{} 不可重试: {}", label, err);
                }
                return Attempted {
                    result: Err(err),
                    attempts: attempt,
                };
            }
        }
    }
}

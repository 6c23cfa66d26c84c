// 单文件传输模块
//
// - task: 任务与结果
// - state: 传输状态机
// - download / upload: 单次尝试的状态机实现
// - retry: 重试策略与重试包络
// - progress: 进度事件与节流
// - digest: 完整性摘要

pub mod digest;
pub mod download;
pub mod progress;
pub mod retry;
pub mod state;
pub mod task;
pub mod upload;

pub use digest::{DigestAlgorithm, IntegrityCheck};
pub use progress::{
    ByteProgress, ChannelObserver, NoopObserver, ProgressEvent, ProgressObserver,
    ProgressThrottler, SharedObserver,
};
pub use retry::{run_with_retry, Attempted, RetryDecision, RetryPolicy};
pub use state::{TransferState, TransferStateMachine};
pub use task::{AttemptStats, Direction, TransferOutcome, TransferResult, TransferTask};

use crate::config::TransferConfig;
use crate::pool::ConnectionPool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// 流式传输参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOptions {
    /// 每次读取的分块大小
    pub chunk_size: usize,
    /// 单次写调用的块大小
    pub block_size: usize,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self::from(&TransferConfig::default())
    }
}

impl From<&TransferConfig> for TransferOptions {
    fn from(config: &TransferConfig) -> Self {
        Self {
            chunk_size: config.chunk_size.max(1),
            block_size: config.block_size.clamp(1, config.chunk_size.max(1)),
        }
    }
}

/// 在重试包络内执行一个传输任务
///
/// 永远返回一个 `TransferResult`，错误不会越过这里。
/// 下载最终失败时删除本次写过的本地残留文件。
pub async fn execute_task(
    pool: &ConnectionPool,
    server: &str,
    policy: &RetryPolicy,
    options: TransferOptions,
    task: TransferTask,
    progress: Arc<ByteProgress>,
) -> TransferResult {
    let label = task.label();
    let touched = Arc::new(AtomicBool::new(false));

    let attempted = {
        let task = task.clone();
        let touched = touched.clone();
        run_with_retry(pool, server, policy, &label, move |session| {
            let task = task.clone();
            let progress = progress.clone();
            let touched = touched.clone();
            Box::pin(async move {
                match task.direction {
                    Direction::Download => {
                        download::download_once(session, &task, &options, &progress, &touched)
                            .await
                    }
                    Direction::Upload => {
                        upload::upload_once(session, &task, &options, &progress).await
                    }
                }
            })
        })
        .await
    };

    match attempted.result {
        Ok(stats) => {
            if stats.skipped {
                info!("[{}] 已完整，跳过: {}", task.index, label);
            } else {
                info!(
                    "[{}] 完成: {} ({} 字节，尝试 {} 次)",
                    task.index, label, stats.bytes, attempted.attempts
                );
            }
            TransferResult::completed(task, stats, attempted.attempts)
        }
        Err(e) => {
            if task.direction == Direction::Download && touched.load(Ordering::SeqCst) {
                download::remove_local(&task.local_path).await;
            }
            tracing::error!("[{}] 失败: {}: {}", task.index, label, e);
            TransferResult::failed(task, &e, attempted.attempts)
        }
    }
}

// 批量调度
//
// 并发策略：
// - 任务按 batch_size 分批，批与批之间回收该服务器的全部空闲连接
// - 批内使用 Semaphore 控制并发 worker 数，JoinSet 管理任务
// - 计数器由互斥锁保护，锁内不做任何 I/O
// - 每个任务无论成功、失败还是 panic 都恰好产生一个 TransferResult

use super::plan::BatchOptions;
use crate::error::{TransferError, TransferResultOf};
use crate::pool::ConnectionPool;
use crate::remote::RemoteError;
use crate::transfer::{
    execute_task, ByteProgress, ProgressEvent, ProgressThrottler, RetryPolicy, SharedObserver,
    TransferOptions, TransferOutcome, TransferResult, TransferTask,
};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info};

/// 批次运行计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchCounters {
    pub succeeded: usize,
    pub failed: usize,
    pub total: usize,
}

impl BatchCounters {
    pub fn new(total: usize) -> Self {
        Self {
            succeeded: 0,
            failed: 0,
            total,
        }
    }

    /// 记录一个结束的任务，返回已结束任务数
    pub fn record(&mut self, success: bool) -> usize {
        if success {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        debug_assert!(self.succeeded + self.failed <= self.total);
        self.finished()
    }

    pub fn finished(&self) -> usize {
        self.succeeded + self.failed
    }
}

/// 批量运行结果
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub server: String,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub total: usize,
    pub bytes_transferred: u64,
    pub elapsed_ms: u64,
    /// 按任务序号排序
    pub results: Vec<TransferResult>,
}

impl BatchReport {
    /// (成功数, 总数)
    pub fn counts(&self) -> (usize, usize) {
        (self.succeeded, self.total)
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }

    pub fn failures(&self) -> impl Iterator<Item = &TransferResult> {
        self.results.iter().filter(|r| !r.is_success())
    }
}

/// 批量调度器
#[derive(Clone)]
pub struct BatchScheduler {
    pool: ConnectionPool,
    policy: RetryPolicy,
    transfer: TransferOptions,
    observer: SharedObserver,
    throttle_interval: Duration,
}

impl BatchScheduler {
    pub fn new(
        pool: ConnectionPool,
        policy: RetryPolicy,
        transfer: TransferOptions,
        observer: SharedObserver,
    ) -> Self {
        Self {
            pool,
            policy,
            transfer,
            observer,
            throttle_interval: Duration::from_millis(
                crate::transfer::progress::DEFAULT_THROTTLE_INTERVAL_MS,
            ),
        }
    }

    pub fn with_throttle_interval(mut self, interval: Duration) -> Self {
        self.throttle_interval = interval;
        self
    }

    pub fn observer(&self) -> &SharedObserver {
        &self.observer
    }

    /// 运行一组任务
    ///
    /// 只有配置错误（未知服务器、非法选项）会在调度前直接返回错误，
    /// 其余失败都体现在各任务的 TransferResult 中。
    pub async fn run(
        &self,
        server: &str,
        tasks: Vec<TransferTask>,
        options: &BatchOptions,
    ) -> TransferResultOf<BatchReport> {
        self.pool.registry().get(server)?;
        options.validate()?;

        let started = Instant::now();
        let total = tasks.len();
        let counters = Arc::new(Mutex::new(BatchCounters::new(total)));
        let mut results: Vec<TransferResult> = Vec::with_capacity(total);

        let batch_count = total.div_ceil(options.batch_size);
        info!(
            "开始批量传输: server={}, 任务数={}, 批次数={}, 并发={}",
            server, total, batch_count, options.worker_count
        );
        self.pool.set_capacity(server, options.worker_count)?;

        let mut pending = tasks.into_iter().peekable();
        let mut batch_no = 0;
        while pending.peek().is_some() {
            batch_no += 1;
            let batch: Vec<TransferTask> = pending.by_ref().take(options.batch_size).collect();
            info!("批次 {}/{}: {} 个任务", batch_no, batch_count, batch.len());

            let batch_results = self
                .run_batch(server, batch, options.worker_count, &counters)
                .await;
            results.extend(batch_results);

            if pending.peek().is_some() {
                // 批间重建连接，避免长时间会话退化
                self.pool.recycle(server).await;
                if !options.pause_between_batches.is_zero() {
                    tokio::time::sleep(options.pause_between_batches).await;
                }
            }
        }

        results.sort_by_key(|r| r.index());
        let final_counts = *counters.lock();
        let report = BatchReport {
            server: server.to_string(),
            succeeded: final_counts.succeeded,
            failed: final_counts.failed,
            skipped: results
                .iter()
                .filter(|r| r.outcome == TransferOutcome::Skipped)
                .count(),
            total,
            bytes_transferred: results.iter().map(|r| r.bytes_transferred).sum(),
            elapsed_ms: started.elapsed().as_millis() as u64,
            results,
        };

        info!(
            "批量传输完成: server={}, 成功 {}/{}, 失败 {}, 耗时 {}ms",
            server, report.succeeded, report.total, report.failed, report.elapsed_ms
        );
        Ok(report)
    }

    async fn run_batch(
        &self,
        server: &str,
        batch: Vec<TransferTask>,
        worker_count: usize,
        counters: &Arc<Mutex<BatchCounters>>,
    ) -> Vec<TransferResult> {
        let semaphore = Arc::new(Semaphore::new(worker_count));
        let mut join_set: JoinSet<TransferResult> = JoinSet::new();
        let mut in_flight = HashMap::with_capacity(batch.len());
        let mut results = Vec::with_capacity(batch.len());

        for task in batch {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    // 信号量只在本函数内使用，不会被关闭
                    let err = TransferError::Config("worker 信号量已关闭".to_string());
                    results.push(self.finish_task(task, Err(err), counters));
                    continue;
                }
            };

            let scheduler = self.clone();
            let server = server.to_string();
            let counters = counters.clone();
            let spawned = task.clone();
            let handle = join_set.spawn(async move {
                let _permit = permit;
                scheduler.run_task(&server, spawned, &counters).await
            });
            in_flight.insert(handle.id(), task);
        }

        while let Some(joined) = join_set.join_next_with_id().await {
            match joined {
                Ok((id, result)) => {
                    in_flight.remove(&id);
                    results.push(result);
                }
                Err(e) => {
                    error!("传输任务异常退出: {}", e);
                    // 任务退出时没有产生结果，补一个失败结果
                    if let Some(task) = in_flight.remove(&e.id()) {
                        let err = TransferError::Remote(RemoteError::Other(format!(
                            "传输任务异常退出: {}",
                            e
                        )));
                        results.push(self.finish_task(task, Err(err), counters));
                    }
                }
            }
        }
        results
    }

    /// 执行单个任务，panic 也会转换为失败结果
    async fn run_task(
        &self,
        server: &str,
        task: TransferTask,
        counters: &Arc<Mutex<BatchCounters>>,
    ) -> TransferResult {
        let total = counters.lock().total;
        self.notify(ProgressEvent::TaskStarted {
            index: task.index,
            total,
            label: task.label(),
        });

        let progress = Arc::new(ByteProgress::new(
            self.observer.clone(),
            task.index,
            ProgressThrottler::new(self.throttle_interval),
        ));
        let fallback = task.clone();
        let outcome = AssertUnwindSafe(execute_task(
            &self.pool,
            server,
            &self.policy,
            self.transfer,
            task,
            progress,
        ))
        .catch_unwind()
        .await;

        let result = match outcome {
            Ok(result) => Ok(result),
            Err(_) => {
                error!("[{}] 传输任务 panic: {}", fallback.index, fallback.label());
                Err(TransferError::Remote(RemoteError::Other(
                    "传输任务 panic".to_string(),
                )))
            }
        };
        self.finish_task(fallback, result, counters)
    }

    /// 更新计数并发出结束事件
    fn finish_task(
        &self,
        task: TransferTask,
        result: TransferResultOf<TransferResult>,
        counters: &Arc<Mutex<BatchCounters>>,
    ) -> TransferResult {
        let result = match result {
            Ok(result) => result,
            Err(e) => TransferResult::failed(task, &e, 0),
        };

        let (completed, total) = {
            let mut c = counters.lock();
            let completed = c.record(result.is_success());
            (completed, c.total)
        };

        let status = match result.outcome {
            TransferOutcome::Success => "完成",
            TransferOutcome::Skipped => "跳过",
            TransferOutcome::Failed => "失败",
        };
        self.notify(ProgressEvent::TaskFinished {
            index: result.index(),
            completed,
            total,
            label: format!("{} {}", status, result.task.label()),
            success: result.is_success(),
        });
        result
    }

    /// 观察者 panic 只记录日志，不影响任务结果
    fn notify(&self, event: ProgressEvent) {
        let observer = &self.observer;
        if std::panic::catch_unwind(AssertUnwindSafe(|| observer.on_event(event))).is_err() {
            error!("进度观察者 panic，事件已丢弃");
        }
    }
}

impl std::fmt::Debug for BatchScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchScheduler")
            .field("policy", &self.policy)
            .field("transfer", &self.transfer)
            .finish()
    }
}

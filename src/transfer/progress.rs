//! 进度上报
//!
//! 调度器与传输状态机只产生 [`ProgressEvent`]，由调用方提供的
//! [`ProgressObserver`] 消费。观察者会被多个 worker 并发调用。
//!
//! 字节级事件经过 [`ProgressThrottler`] 节流，单个文件的最后一次进度总会发出。

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// 默认节流间隔（毫秒）
pub const DEFAULT_THROTTLE_INTERVAL_MS: u64 = 200;

/// 进度事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// 任务开始（index 从 1 开始）
    TaskStarted {
        index: usize,
        total: usize,
        label: String,
    },
    /// 任务结束
    TaskFinished {
        index: usize,
        /// 包括本任务在内已结束的任务数
        completed: usize,
        total: usize,
        label: String,
        success: bool,
    },
    /// 单个文件的字节进度
    Bytes { index: usize, done: u64, total: u64 },
}

/// 进度观察者
pub trait ProgressObserver: Send + Sync {
    fn on_event(&self, event: ProgressEvent);
}

impl<F> ProgressObserver for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn on_event(&self, event: ProgressEvent) {
        self(event)
    }
}

/// 忽略所有事件
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ProgressObserver for NoopObserver {
    fn on_event(&self, _event: ProgressEvent) {}
}

/// 通过有界通道转发事件
///
/// 通道满时丢弃事件并计数，worker 永远不会因为消费方太慢而阻塞。
#[derive(Debug)]
pub struct ChannelObserver {
    tx: mpsc::Sender<ProgressEvent>,
    dropped: AtomicU64,
}

impl ChannelObserver {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// 被丢弃的事件数
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl ProgressObserver for ChannelObserver {
    fn on_event(&self, event: ProgressEvent) {
        if self.tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// 共享的观察者句柄
pub type SharedObserver = Arc<dyn ProgressObserver>;

/// 进度事件节流器
///
/// 线程安全的时间节流器，使用 CAS 避免锁竞争。
/// 时间基准是进程级的单调时钟，tokio 任务在线程间迁移不影响判断。
#[derive(Debug)]
pub struct ProgressThrottler {
    /// 上次发布事件的时间戳（纳秒）
    last_emit_nanos: AtomicU64,
    /// 节流间隔（纳秒）
    interval_nanos: u64,
}

impl ProgressThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            last_emit_nanos: AtomicU64::new(0),
            interval_nanos: interval.as_nanos() as u64,
        }
    }

    pub fn with_millis(interval_ms: u64) -> Self {
        Self::new(Duration::from_millis(interval_ms))
    }

    /// 距离上次发布超过间隔时返回 true 并更新时间戳
    pub fn should_emit(&self) -> bool {
        let now_nanos = Self::current_nanos();
        let last = self.last_emit_nanos.load(Ordering::Relaxed);

        // 第一次总是发布
        if last != 0 && now_nanos.saturating_sub(last) < self.interval_nanos {
            return false;
        }
        // 被其他线程抢先更新时本次不发布
        self.last_emit_nanos
            .compare_exchange(last, now_nanos.max(1), Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    /// 强制发布（用于最后一次更新）
    pub fn force_emit(&self) -> bool {
        self.last_emit_nanos
            .store(Self::current_nanos().max(1), Ordering::Relaxed);
        true
    }

    fn current_nanos() -> u64 {
        static START: OnceLock<Instant> = OnceLock::new();
        START.get_or_init(Instant::now).elapsed().as_nanos() as u64
    }
}

impl Default for ProgressThrottler {
    fn default() -> Self {
        Self::with_millis(DEFAULT_THROTTLE_INTERVAL_MS)
    }
}

/// 单个任务的字节进度上报器
pub struct ByteProgress {
    observer: SharedObserver,
    index: usize,
    throttler: ProgressThrottler,
}

impl ByteProgress {
    pub fn new(observer: SharedObserver, index: usize, throttler: ProgressThrottler) -> Self {
        Self {
            observer,
            index,
            throttler,
        }
    }

    /// 不上报任何进度
    pub fn silent() -> Self {
        Self::new(Arc::new(NoopObserver), 1, ProgressThrottler::default())
    }

    /// 节流上报
    pub fn report(&self, done: u64, total: u64) {
        if done >= total {
            self.finish(done, total);
        } else if self.throttler.should_emit() {
            self.emit(done, total);
        }
    }

    /// 强制上报（文件结束）
    pub fn finish(&self, done: u64, total: u64) {
        self.throttler.force_emit();
        self.emit(done, total);
    }

    fn emit(&self, done: u64, total: u64) {
        self.observer.on_event(ProgressEvent::Bytes {
            index: self.index,
            done,
            total,
        });
    }
}

impl std::fmt::Debug for ByteProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteProgress")
            .field("index", &self.index)
            .field("throttler", &self.throttler)
            .finish()
    }
}

// 连接池管理器
//
// 每个服务器一个独立的子池：
// - Semaphore 限制同时借出的连接数（容量 = 本批 worker 数）
// - 空闲队列由互斥锁保护，锁内只做出入队，不做任何 I/O
// - 借出前按空闲时长做健康检查，过期连接直接丢弃

use super::connection::{Connection, ConnectionHealth};
use super::guard::PooledConnection;
use crate::config::{ServerRegistry, TransferConfig};
use crate::error::{TransferError, TransferResultOf};
use crate::remote::{RemoteConnector, RemoteError};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 连接池参数
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// 每个服务器的默认容量
    pub capacity: usize,
    /// 等待可用连接的最长时间
    pub acquire_timeout: Duration,
    /// 空闲超过该时长直接丢弃
    pub stale_after: Duration,
    /// 空闲超过该时长借出前先做健康检查
    pub health_check_after: Duration,
}

impl From<&TransferConfig> for PoolSettings {
    fn from(config: &TransferConfig) -> Self {
        Self {
            capacity: config.worker_count,
            acquire_timeout: config.acquire_timeout(),
            stale_after: config.stale_after(),
            health_check_after: config.health_check_after(),
        }
    }
}

/// 单个服务器的池统计
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub idle: usize,
    pub in_use: usize,
    pub opened_total: u64,
    pub discarded_total: u64,
}

/// 单个服务器的子池
pub(crate) struct ServerPool {
    server: String,
    semaphore: Arc<Semaphore>,
    capacity: AtomicUsize,
    /// 缩容时仍被借出、归还时需要回收的许可数
    permit_debt: Mutex<usize>,
    idle: Mutex<VecDeque<Connection>>,
    in_use: AtomicUsize,
    opened_total: AtomicU64,
    discarded_total: AtomicU64,
    closed: AtomicBool,
}

impl ServerPool {
    fn new(server: &str, capacity: usize) -> Self {
        Self {
            server: server.to_string(),
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity: AtomicUsize::new(capacity),
            permit_debt: Mutex::new(0),
            idle: Mutex::new(VecDeque::new()),
            in_use: AtomicUsize::new(0),
            opened_total: AtomicU64::new(0),
            discarded_total: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn semaphore(&self) -> Arc<Semaphore> {
        self.semaphore.clone()
    }

    /// 调整容量，返回旧容量
    ///
    /// 扩容先抵消未回收的许可再追加；缩容先回收空闲许可，
    /// 不足部分记为欠账，由借出方归还时回收。
    fn resize(&self, capacity: usize) -> usize {
        let mut debt = self.permit_debt.lock();
        let old = self.capacity.swap(capacity, Ordering::SeqCst);
        if capacity > old {
            let grow = capacity - old;
            let paid = grow.min(*debt);
            *debt -= paid;
            if grow > paid {
                self.semaphore.add_permits(grow - paid);
            }
        } else if capacity < old {
            let mut shrink = old - capacity;
            while shrink > 0 {
                match self.semaphore.try_acquire() {
                    Ok(permit) => {
                        permit.forget();
                        shrink -= 1;
                    }
                    Err(_) => break,
                }
            }
            *debt += shrink;
        }
        old
    }

    /// 归还许可，有欠账时直接回收
    pub(super) fn release_permit(&self, permit: OwnedSemaphorePermit) {
        let mut debt = self.permit_debt.lock();
        if *debt > 0 {
            *debt -= 1;
            permit.forget();
        } else {
            drop(permit);
        }
    }

    pub(super) fn checked_out(&self) {
        self.in_use.fetch_add(1, Ordering::SeqCst);
    }

    pub(super) fn checked_in(&self) {
        self.in_use.fetch_sub(1, Ordering::SeqCst);
    }

    pub(super) fn discarded(&self) {
        self.discarded_total.fetch_add(1, Ordering::Relaxed);
    }

    /// 归还连接：Dead、池已关闭或空闲队列已满时关闭，否则入队
    pub(super) fn give_back(&self, conn: Connection) {
        if conn.health() == ConnectionHealth::Dead || self.closed.load(Ordering::SeqCst) {
            self.discard(conn);
            return;
        }

        let capacity = self.capacity.load(Ordering::SeqCst);
        let rejected = {
            let mut idle = self.idle.lock();
            if idle.len() >= capacity {
                Some(conn)
            } else {
                idle.push_back(conn);
                None
            }
        };

        if let Some(conn) = rejected {
            self.discard(conn);
        }
    }

    /// 丢弃连接（后台关闭会话）
    fn discard(&self, conn: Connection) {
        self.discarded();
        debug!("丢弃连接: {:?}", conn);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let _ = conn.close().await;
                });
            }
            Err(_) => drop(conn),
        }
    }

    /// 取出全部空闲连接
    fn drain_idle(&self) -> Vec<Connection> {
        self.idle.lock().drain(..).collect()
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.capacity.load(Ordering::SeqCst),
            idle: self.idle.lock().len(),
            in_use: self.in_use.load(Ordering::SeqCst),
            opened_total: self.opened_total.load(Ordering::Relaxed),
            discarded_total: self.discarded_total.load(Ordering::Relaxed),
        }
    }
}

struct PoolInner {
    registry: ServerRegistry,
    connector: Arc<dyn RemoteConnector>,
    settings: PoolSettings,
    pools: DashMap<String, Arc<ServerPool>>,
    closed: AtomicBool,
}

/// 连接池
///
/// 克隆开销很小，所有克隆共享同一组连接。
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(
        registry: ServerRegistry,
        connector: Arc<dyn RemoteConnector>,
        settings: PoolSettings,
    ) -> Self {
        info!(
            "创建连接池: 服务器数={}, 默认容量={}, 等待超时={:?}",
            registry.len(),
            settings.capacity,
            settings.acquire_timeout
        );
        Self {
            inner: Arc::new(PoolInner {
                registry,
                connector,
                settings,
                pools: DashMap::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn registry(&self) -> &ServerRegistry {
        &self.inner.registry
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.inner.settings
    }

    fn ensure_open(&self, server: &str) -> TransferResultOf<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(TransferError::Config(format!("连接池已关闭: {}", server)));
        }
        Ok(())
    }

    fn server_pool(&self, server: &str) -> Arc<ServerPool> {
        self.inner
            .pools
            .entry(server.to_string())
            .or_insert_with(|| Arc::new(ServerPool::new(server, self.inner.settings.capacity)))
            .clone()
    }

    /// 借出一个健康连接
    ///
    /// 在容量内等待（最长 `acquire_timeout`），优先复用空闲连接，
    /// 没有可用空闲连接时新建会话。
    pub async fn acquire(&self, server: &str) -> TransferResultOf<PooledConnection> {
        let profile = self.inner.registry.get(server)?;
        self.ensure_open(server)?;
        let pool = self.server_pool(server);
        // 子池可能在关闭过程中新建
        self.ensure_open(server)?;
        let waited_from = Instant::now();
        let timeout = self.inner.settings.acquire_timeout;

        let permit = match tokio::time::timeout(timeout, pool.semaphore().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(TransferError::Config(format!("连接池已关闭: {}", server)));
            }
            Err(_) => {
                warn!("等待连接超时: server={}, waited={:?}", server, timeout);
                return Err(TransferError::PoolExhausted {
                    server: server.to_string(),
                    waited: waited_from.elapsed(),
                });
            }
        };

        // 1. 复用空闲连接
        let mut budget = pool.idle.lock().len();
        while budget > 0 {
            budget -= 1;
            let candidate = pool.idle.lock().pop_front();
            let Some(mut conn) = candidate else {
                break;
            };

            if conn.health() == ConnectionHealth::Dead {
                pool.discard(conn);
                continue;
            }
            if conn.idle_for() >= self.inner.settings.stale_after {
                debug!("连接 {} 空闲 {:?}，已过期", conn.id(), conn.idle_for());
                pool.discard(conn);
                continue;
            }
            if conn.health() == ConnectionHealth::Degraded
                || conn.idle_for() >= self.inner.settings.health_check_after
            {
                match conn.check_health().await {
                    ConnectionHealth::Healthy => {}
                    ConnectionHealth::Degraded => {
                        // 再给一次机会，放回队尾
                        pool.idle.lock().push_back(conn);
                        budget += 1;
                        continue;
                    }
                    ConnectionHealth::Dead => {
                        pool.discard(conn);
                        continue;
                    }
                }
            }

            debug!("复用连接: server={}, id={}", server, conn.id());
            return Ok(PooledConnection::new(conn, pool, permit));
        }

        // 2. 新建会话
        let session = match tokio::time::timeout(profile.timeout, self.inner.connector.connect(&profile)).await {
            Ok(Ok(session)) => session,
            Ok(Err(RemoteError::Auth(message))) => {
                warn!("服务器 {} 认证失败: {}", server, message);
                return Err(TransferError::Auth {
                    server: server.to_string(),
                    message,
                });
            }
            Ok(Err(e)) => {
                warn!("连接服务器 {} 失败: {}", server, e);
                return Err(e.into());
            }
            Err(_) => {
                return Err(TransferError::Timeout(format!(
                    "连接 {} ({}) 超过 {:?}",
                    server,
                    profile.address(),
                    profile.timeout
                )));
            }
        };

        pool.opened_total.fetch_add(1, Ordering::Relaxed);
        let conn = Connection::new(server, session);
        debug!("新建连接: server={}, id={}", server, conn.id());
        Ok(PooledConnection::new(conn, pool, permit))
    }

    /// 调整单个服务器的容量
    ///
    /// 已借出的连接继续占用容量，归还时如果空闲队列已满会被关闭。
    pub fn set_capacity(&self, server: &str, capacity: usize) -> TransferResultOf<()> {
        self.ensure_open(server)?;
        let capacity = capacity.max(1);
        let pool = self.server_pool(server);
        let old = pool.resize(capacity);
        if old == capacity {
            return Ok(());
        }

        let excess: Vec<Connection> = {
            let mut idle = pool.idle.lock();
            if idle.len() > capacity {
                idle.drain(capacity..).collect()
            } else {
                Vec::new()
            }
        };
        for conn in excess {
            pool.discard(conn);
        }
        info!("连接池容量调整: server={}, {} -> {}", server, old, capacity);
        Ok(())
    }

    /// 关闭某个服务器的全部空闲连接
    pub async fn recycle(&self, server: &str) -> usize {
        let Some(pool) = self.inner.pools.get(server).map(|p| p.clone()) else {
            return 0;
        };
        let drained = pool.drain_idle();
        let count = drained.len();
        for conn in drained {
            pool.discarded();
            let _ = conn.close().await;
        }
        if count > 0 {
            debug!("已回收 {} 个空闲连接: server={}", count, server);
        }
        count
    }

    /// 单个服务器的统计
    pub fn stats(&self, server: &str) -> PoolStats {
        match self.inner.pools.get(server) {
            Some(pool) => pool.stats(),
            None => PoolStats {
                capacity: self.inner.settings.capacity,
                idle: 0,
                in_use: 0,
                opened_total: 0,
                discarded_total: 0,
            },
        }
    }

    /// 检查全部空闲连接
    ///
    /// 与借出方一样先占用容量许可，保证检查期间不超出容量。
    /// 返回被丢弃的连接数。
    pub async fn maintain(&self) -> usize {
        let pools: Vec<Arc<ServerPool>> =
            self.inner.pools.iter().map(|e| e.value().clone()).collect();
        let mut removed = 0;

        for pool in pools {
            let semaphore = pool.semaphore();
            let snapshot = pool.idle.lock().len();
            for _ in 0..snapshot {
                let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                    break;
                };
                let candidate = pool.idle.lock().pop_front();
                let Some(mut conn) = candidate else {
                    pool.release_permit(permit);
                    break;
                };

                let keep = if conn.idle_for() >= self.inner.settings.stale_after {
                    false
                } else {
                    conn.check_health().await != ConnectionHealth::Dead
                };

                if keep {
                    pool.idle.lock().push_back(conn);
                } else {
                    removed += 1;
                    pool.discarded();
                    let _ = conn.close().await;
                }
                pool.release_permit(permit);
            }
            if removed > 0 {
                debug!("维护完成: server={}, 已丢弃={}", pool.server, removed);
            }
        }
        removed
    }

    /// 启动后台维护任务
    pub fn spawn_maintenance(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // 第一次 tick 立即返回，跳过
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("连接池维护任务退出");
                        break;
                    }
                    _ = ticker.tick() => {
                        let removed = pool.maintain().await;
                        if removed > 0 {
                            info!("连接池维护: 丢弃 {} 个失效连接", removed);
                        }
                    }
                }
            }
        })
    }

    /// 关闭连接池：拒绝新的借出并关闭全部空闲连接
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let pools: Vec<Arc<ServerPool>> =
            self.inner.pools.iter().map(|e| e.value().clone()).collect();
        for pool in pools {
            pool.closed.store(true, Ordering::SeqCst);
            pool.semaphore().close();
            for conn in pool.drain_idle() {
                pool.discarded();
                let _ = conn.close().await;
            }
        }
        info!("连接池已关闭");
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("servers", &self.inner.registry.names())
            .field("settings", &self.inner.settings)
            .finish()
    }
}

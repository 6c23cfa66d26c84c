// 连接：一个已认证会话 + 健康元数据

use crate::remote::{RemoteResult, RemoteSession};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

/// 连接健康状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionHealth {
    /// 正常
    Healthy,
    /// 一次健康检查失败，下次借出前必须重新检查
    Degraded,
    /// 连续两次失败，不可再借出
    Dead,
}

/// 连续失败多少次判定为 Dead
pub const DEAD_AFTER_FAILURES: u32 = 2;

/// 一个连接
///
/// 由连接池独占持有，借给 worker 使用，同一时刻只有一个使用者。
pub struct Connection {
    id: String,
    server: String,
    session: Box<dyn RemoteSession>,
    created_at: Instant,
    last_used_at: Instant,
    consecutive_errors: u32,
    health: ConnectionHealth,
}

impl Connection {
    pub fn new(server: impl Into<String>, session: Box<dyn RemoteSession>) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4().to_string(),
            server: server.into(),
            session,
            created_at: now,
            last_used_at: now,
            consecutive_errors: 0,
            health: ConnectionHealth::Healthy,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn health(&self) -> ConnectionHealth {
        self.health
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used_at.elapsed()
    }

    /// 借出会话，同时刷新最后使用时间
    pub fn session(&mut self) -> &mut dyn RemoteSession {
        self.last_used_at = Instant::now();
        self.session.as_mut()
    }

    /// 记录一次成功
    pub fn mark_success(&mut self) {
        self.consecutive_errors = 0;
        self.health = ConnectionHealth::Healthy;
        self.last_used_at = Instant::now();
    }

    /// 记录一次失败：第一次 Degraded，第二次 Dead
    pub fn mark_failure(&mut self) {
        self.consecutive_errors += 1;
        self.health = if self.consecutive_errors >= DEAD_AFTER_FAILURES {
            ConnectionHealth::Dead
        } else {
            ConnectionHealth::Degraded
        };
    }

    /// 直接判定为 Dead
    pub fn mark_dead(&mut self) {
        self.health = ConnectionHealth::Dead;
    }

    /// 空操作健康检查
    pub async fn check_health(&mut self) -> ConnectionHealth {
        match self.session.noop().await {
            Ok(()) => self.mark_success(),
            Err(e) => {
                self.mark_failure();
                debug!(
                    "连接 {} ({}) 健康检查失败 ({} 次): {}",
                    self.id, self.server, self.consecutive_errors, e
                );
            }
        }
        self.health
    }

    /// 关闭会话
    pub async fn close(mut self) -> RemoteResult<()> {
        self.health = ConnectionHealth::Dead;
        self.session.close().await
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("server", &self.server)
            .field("health", &self.health)
            .field("consecutive_errors", &self.consecutive_errors)
            .field("idle_for", &self.idle_for())
            .finish()
    }
}

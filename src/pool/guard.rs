// 借出连接的守卫
//
// 任何退出路径（成功、失败、panic 展开）都会归还或销毁连接，
// 同时释放占用的容量许可。

use super::connection::{Connection, ConnectionHealth};
use super::manager::ServerPool;
use crate::error::{TransferError, TransferResultOf};
use crate::remote::{RemoteError, RemoteSession};
use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::debug;

/// 借出的连接
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<ServerPool>,
    permit: Option<OwnedSemaphorePermit>,
}

impl PooledConnection {
    pub(super) fn new(conn: Connection, pool: Arc<ServerPool>, permit: OwnedSemaphorePermit) -> Self {
        pool.checked_out();
        Self {
            conn: Some(conn),
            pool,
            permit: Some(permit),
        }
    }

    /// 连接 ID
    pub fn id(&self) -> &str {
        self.conn.as_ref().map(|c| c.id()).unwrap_or_default()
    }

    /// 当前健康状态
    pub fn health(&self) -> ConnectionHealth {
        self.conn
            .as_ref()
            .map(|c| c.health())
            .unwrap_or(ConnectionHealth::Dead)
    }

    /// 会话
    pub fn session(&mut self) -> TransferResultOf<&mut dyn RemoteSession> {
        match self.conn.as_mut() {
            Some(conn) => Ok(conn.session()),
            None => Err(TransferError::Remote(RemoteError::ConnectionReset(
                "连接已归还".to_string(),
            ))),
        }
    }

    /// 归还到连接池
    pub fn release(mut self) {
        if let Some(mut conn) = self.conn.take() {
            if conn.health() != ConnectionHealth::Dead {
                conn.mark_success();
            }
            self.pool.give_back(conn);
        }
    }

    /// 标记为 Dead 并关闭会话
    pub async fn invalidate(mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.mark_dead();
            let id = conn.id().to_string();
            self.pool.discarded();
            if let Err(e) = conn.close().await {
                debug!("关闭失效连接 {} 时出错: {}", id, e);
            }
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            // 未显式归还，按健康状态处理
            self.pool.give_back(conn);
        }
        self.pool.checked_in();
        if let Some(permit) = self.permit.take() {
            self.pool.release_permit(permit);
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("conn", &self.conn)
            .finish()
    }
}

// 远端文件系统能力接口
//
// 传输引擎只依赖这里定义的能力集合（stat / list / 带偏移读 / 追加写 /
// rename / remove / mkdir / noop），不关心具体协议。

pub mod local;

use crate::config::ServerProfile;
use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub use local::{LocalFsConnector, LocalFsSession};

/// 远端读取流
pub type RemoteReader = Box<dyn AsyncRead + Send + Unpin>;

/// 远端写入流
pub type RemoteWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// 远端文件元数据
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteMetadata {
    /// 文件大小（字节）
    pub size: u64,
    /// 是否为目录
    pub is_dir: bool,
}

/// 远端操作错误
#[derive(Debug, Error)]
pub enum RemoteError {
    /// 路径不存在
    #[error("路径不存在: {0}")]
    NotFound(String),
    /// 权限不足
    #[error("权限不足: {0}")]
    PermissionDenied(String),
    /// 认证失败
    #[error("认证失败: {0}")]
    Auth(String),
    /// 连接被重置或会话已断开
    #[error("连接已断开: {0}")]
    ConnectionReset(String),
    /// 超时
    #[error("超时: {0}")]
    Timeout(String),
    /// 底层 I/O 错误
    #[error("I/O 错误: {0}")]
    Io(#[from] std::io::Error),
    /// 其他错误
    #[error("{0}")]
    Other(String),
}

impl RemoteError {
    /// 错误类别
    pub fn kind(&self) -> crate::error::ErrorKind {
        use crate::error::ErrorKind;
        match self {
            RemoteError::NotFound(_) => ErrorKind::NotFound,
            RemoteError::PermissionDenied(_) => ErrorKind::Configuration,
            RemoteError::Auth(_) => ErrorKind::Authentication,
            RemoteError::ConnectionReset(_)
            | RemoteError::Timeout(_)
            | RemoteError::Io(_)
            | RemoteError::Other(_) => ErrorKind::Transient,
        }
    }
}

/// 远端操作结果
pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// 一个已认证的远端会话
///
/// 同一时刻只会被一个 worker 使用（由连接池保证），因此方法取 `&mut self`。
#[async_trait]
pub trait RemoteSession: Send {
    /// 查询路径元数据，路径不存在时返回 `Ok(None)`
    async fn stat(&mut self, path: &str) -> RemoteResult<Option<RemoteMetadata>>;

    /// 列出目录下的条目名（不含 `.` 与 `..`）
    async fn list(&mut self, dir: &str) -> RemoteResult<Vec<String>>;

    /// 从指定偏移开始读取文件
    async fn open_read(&mut self, path: &str, offset: u64) -> RemoteResult<RemoteReader>;

    /// 打开文件写入；`append` 为 false 时截断或新建
    async fn open_write(&mut self, path: &str, append: bool) -> RemoteResult<RemoteWriter>;

    /// 重命名，目标存在时覆盖
    async fn rename(&mut self, from: &str, to: &str) -> RemoteResult<()>;

    /// 删除文件
    async fn remove(&mut self, path: &str) -> RemoteResult<()>;

    /// 创建单级目录
    async fn mkdir(&mut self, path: &str) -> RemoteResult<()>;

    /// 空操作，用于心跳和健康检查
    async fn noop(&mut self) -> RemoteResult<()>;

    /// 关闭会话
    async fn close(&mut self) -> RemoteResult<()>;
}

/// 会话工厂：根据服务器配置建立认证会话
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn connect(&self, profile: &ServerProfile) -> RemoteResult<Box<dyn RemoteSession>>;
}

/// 远端路径的父目录
pub fn remote_parent(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&trimmed[..idx]),
        None => None,
    }
}

/// 远端路径的文件名部分
pub fn remote_basename(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}

/// 拼接远端路径
pub fn remote_join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// 逐级创建远端目录（已存在的层级跳过）
pub async fn ensure_remote_dir(session: &mut dyn RemoteSession, dir: &str) -> RemoteResult<()> {
    if dir.is_empty() || dir == "/" {
        return Ok(());
    }
    if let Some(meta) = session.stat(dir).await? {
        if meta.is_dir {
            return Ok(());
        }
        return Err(RemoteError::Other(format!("路径已存在且不是目录: {}", dir)));
    }

    let absolute = dir.starts_with('/');
    let mut current = String::new();
    for part in dir.split('/').filter(|p| !p.is_empty()) {
        if current.is_empty() {
            current = if absolute {
                format!("/{}", part)
            } else {
                part.to_string()
            };
        } else {
            current = format!("{}/{}", current, part);
        }
        if session.stat(&current).await?.is_none() {
            session.mkdir(&current).await?;
        }
    }
    Ok(())
}

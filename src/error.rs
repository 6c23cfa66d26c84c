// 传输引擎错误类型
//
// 错误分类决定重试策略：
// - 配置错误、认证错误、源文件不存在：立即放弃
// - 网络超时、连接重置、大小探测失败、连接池等待超时：指数退避后重试
// - 完整性错误（大小/摘要不一致）：产物已删除，换新连接重试

use crate::remote::RemoteError;
use std::time::Duration;
use thiserror::Error;

/// 传输引擎结果类型
pub type TransferResultOf<T> = std::result::Result<T, TransferError>;

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// 配置错误（未知服务器、路径列表长度不一致等）
    Configuration,
    /// 认证失败
    Authentication,
    /// 源文件不存在或不可访问
    NotFound,
    /// 临时性错误（超时、连接重置、I/O 抖动）
    Transient,
    /// 完整性校验失败
    Integrity,
}

impl ErrorKind {
    /// 是否可重试
    pub fn is_retriable(&self) -> bool {
        matches!(self, ErrorKind::Transient | ErrorKind::Integrity)
    }
}

/// 传输引擎错误
#[derive(Debug, Error)]
pub enum TransferError {
    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// 认证失败
    #[error("认证失败 ({server}): {message}")]
    Auth { server: String, message: String },

    /// 源文件不可访问
    #[error("{what} inaccessible: {path}")]
    NotFound { what: &'static str, path: String },

    /// 远端操作失败
    #[error("远端操作失败: {0}")]
    Remote(#[source] RemoteError),

    /// 本地文件系统错误
    #[error("本地 I/O 失败 ({path}): {source}")]
    LocalIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// 操作超时
    #[error("操作超时: {0}")]
    Timeout(String),

    /// 连接池等待超时
    #[error("连接池已满 ({server})，等待 {waited:?} 后仍无可用连接")]
    PoolExhausted { server: String, waited: Duration },

    /// 完整性校验失败
    #[error("incomplete transfer: {0}")]
    Integrity(String),
}

impl TransferError {
    /// 远端源文件不存在
    pub fn remote_not_found(path: impl Into<String>) -> Self {
        TransferError::NotFound {
            what: "remote file",
            path: path.into(),
        }
    }

    /// 本地源文件不存在
    pub fn local_not_found(path: impl Into<String>) -> Self {
        TransferError::NotFound {
            what: "local file",
            path: path.into(),
        }
    }

    /// 包装本地 I/O 错误
    pub fn local_io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        TransferError::LocalIo {
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    /// 错误类别
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::Config(_) => ErrorKind::Configuration,
            TransferError::Auth { .. } => ErrorKind::Authentication,
            TransferError::NotFound { .. } => ErrorKind::NotFound,
            TransferError::Remote(e) => e.kind(),
            TransferError::LocalIo { source, .. } => match source.kind() {
                std::io::ErrorKind::PermissionDenied => ErrorKind::Configuration,
                _ => ErrorKind::Transient,
            },
            TransferError::Timeout(_) | TransferError::PoolExhausted { .. } => {
                ErrorKind::Transient
            }
            TransferError::Integrity(_) => ErrorKind::Integrity,
        }
    }

    /// 是否可重试
    pub fn is_retriable(&self) -> bool {
        self.kind().is_retriable()
    }
}

impl From<RemoteError> for TransferError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Auth(message) => TransferError::Auth {
                server: String::new(),
                message,
            },
            RemoteError::NotFound(path) => TransferError::remote_not_found(path),
            RemoteError::Timeout(what) => TransferError::Timeout(what),
            other => TransferError::Remote(other),
        }
    }
}

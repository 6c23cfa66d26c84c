// Remote Transfer Library
// 可断点续传的并发文件传输引擎

// 配置管理模块
pub mod config;

// 错误类型
pub mod error;

// 日志模块
pub mod logging;

// 远端文件系统能力接口
pub mod remote;

// 连接池模块
pub mod pool;

// 单文件传输模块（状态机、重试、进度、校验）
pub mod transfer;

// 批量调度模块
pub mod scheduler;

// 客户端
pub mod client;

// 导出常用类型
pub use client::{ExistenceReport, TransferClient};
pub use config::{AppConfig, Credential, ServerEntry, ServerProfile, ServerRegistry, TransferConfig};
pub use error::{ErrorKind, TransferError, TransferResultOf};
pub use pool::{ConnectionHealth, ConnectionPool, PoolSettings, PoolStats, PooledConnection};
pub use remote::{
    LocalFsConnector, RemoteConnector, RemoteError, RemoteMetadata, RemoteSession,
};
pub use scheduler::{BatchOptions, BatchReport, BatchScheduler, Destinations};
pub use transfer::{
    ChannelObserver, DigestAlgorithm, IntegrityCheck, ProgressEvent, ProgressObserver,
    RetryPolicy, TransferOutcome, TransferResult, TransferTask,
};

// 配置管理模块

pub mod profile;

use crate::error::{TransferError, TransferResultOf};
use crate::transfer::digest::{DigestAlgorithm, IntegrityCheck};
use crate::transfer::retry::RetryPolicy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

pub use profile::{Credential, ServerEntry, ServerProfile, ServerRegistry};

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "config/transfer.toml";

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
    /// 传输配置
    #[serde(default)]
    pub transfer: TransferConfig,
    /// 服务器配置（逻辑名称 -> 连接参数）
    #[serde(default)]
    pub servers: BTreeMap<String, ServerEntry>,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 完整性校验方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum IntegrityMode {
    /// 只比较文件大小
    SizeOnly,
    /// 传输完成后回读目标文件，计算摘要并与源文件比较
    ReadBack { algorithm: DigestAlgorithm },
}

impl Default for IntegrityMode {
    fn default() -> Self {
        IntegrityMode::SizeOnly
    }
}

impl From<IntegrityMode> for IntegrityCheck {
    fn from(mode: IntegrityMode) -> Self {
        match mode {
            IntegrityMode::SizeOnly => IntegrityCheck::SizeOnly,
            IntegrityMode::ReadBack { algorithm } => IntegrityCheck::ReadBack(algorithm),
        }
    }
}

/// 传输配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// 并发 worker 数（同时也是每个服务器的连接上限）
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// 每批任务数，批与批之间重建全部连接
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// 单个操作最大尝试次数
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// 退避底数
    #[serde(default = "default_backoff_base")]
    pub backoff_base: f64,
    /// 退避时间单位（毫秒）
    #[serde(default = "default_backoff_unit_ms")]
    pub backoff_unit_ms: u64,
    /// 流式传输分块大小（字节）
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// 单次写调用的块大小（字节）
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    /// 从连接池获取连接的最长等待时间（秒）
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
    /// 空闲超过该时间的连接直接丢弃（秒）
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    /// 空闲超过该时间的连接在借出前做一次健康检查（秒）
    #[serde(default = "default_health_check_after_secs")]
    pub health_check_after_secs: u64,
    /// 后台维护间隔（秒）
    #[serde(default = "default_maintenance_interval_secs")]
    pub maintenance_interval_secs: u64,
    /// 批与批之间的停顿（毫秒）
    #[serde(default = "default_pause_between_batches_ms")]
    pub pause_between_batches_ms: u64,
    /// 完整性校验方式
    #[serde(default)]
    pub integrity: IntegrityMode,
}

fn default_worker_count() -> usize {
    1
}

fn default_batch_size() -> usize {
    20
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base() -> f64 {
    2.0
}

fn default_backoff_unit_ms() -> u64 {
    1000
}

fn default_chunk_size() -> usize {
    1024 * 1024 // 1MB
}

fn default_block_size() -> usize {
    32 * 1024 // 32KB
}

fn default_acquire_timeout_secs() -> u64 {
    30
}

fn default_stale_after_secs() -> u64 {
    300
}

fn default_health_check_after_secs() -> u64 {
    30
}

fn default_maintenance_interval_secs() -> u64 {
    60
}

fn default_pause_between_batches_ms() -> u64 {
    1000
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
            backoff_base: default_backoff_base(),
            backoff_unit_ms: default_backoff_unit_ms(),
            chunk_size: default_chunk_size(),
            block_size: default_block_size(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
            stale_after_secs: default_stale_after_secs(),
            health_check_after_secs: default_health_check_after_secs(),
            maintenance_interval_secs: default_maintenance_interval_secs(),
            pause_between_batches_ms: default_pause_between_batches_ms(),
            integrity: IntegrityMode::default(),
        }
    }
}

impl TransferConfig {
    /// 校验配置取值
    pub fn validate(&self) -> TransferResultOf<()> {
        if self.worker_count == 0 {
            return Err(TransferError::Config("worker_count 必须大于 0".to_string()));
        }
        if self.batch_size == 0 {
            return Err(TransferError::Config("batch_size 必须大于 0".to_string()));
        }
        if self.max_attempts == 0 {
            return Err(TransferError::Config("max_attempts 必须大于 0".to_string()));
        }
        if self.chunk_size == 0 || self.block_size == 0 {
            return Err(TransferError::Config(
                "chunk_size 与 block_size 必须大于 0".to_string(),
            ));
        }
        if self.block_size > self.chunk_size {
            return Err(TransferError::Config(format!(
                "block_size ({}) 不能大于 chunk_size ({})",
                self.block_size, self.chunk_size
            )));
        }
        if self.backoff_unit_ms == 0 {
            return Err(TransferError::Config("backoff_unit_ms 必须大于 0".to_string()));
        }
        if self.backoff_base.is_nan() || self.backoff_base <= 1.0 {
            return Err(TransferError::Config(format!(
                "backoff_base 必须大于 1.0，当前为 {}",
                self.backoff_base
            )));
        }
        Ok(())
    }

    /// 重试策略
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            self.backoff_base,
            Duration::from_millis(self.backoff_unit_ms),
        )
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn health_check_after(&self) -> Duration {
        Duration::from_secs(self.health_check_after_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }

    pub fn pause_between_batches(&self) -> Duration {
        Duration::from_millis(self.pause_between_batches_ms)
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        config
            .transfer
            .validate()
            .context("配置文件中的传输参数验证失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.transfer
            .validate()
            .context("保存配置失败：传输参数不合法")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);

        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();

                // 配置文件不存在时写出一份默认配置，已存在但解析失败时不覆盖
                if !std::path::Path::new(path).exists() {
                    if let Err(e) = default_config.save_to_file(path).await {
                        tracing::error!("保存默认配置失败: {}", e);
                    }
                }

                default_config
            }
        }
    }

    /// 解析服务器配置
    pub fn registry(&self) -> TransferResultOf<ServerRegistry> {
        ServerRegistry::from_config(&self.servers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::digest::DigestAlgorithm;
    use tempfile::TempDir;

    #[test]
    fn test_default_transfer_config() {
        let config = TransferConfig::default();
        assert_eq!(config.worker_count, 1);
        assert_eq!(config.batch_size, 20);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.chunk_size, 1024 * 1024);
        assert_eq!(config.block_size, 32 * 1024);
        assert_eq!(config.integrity, IntegrityMode::SizeOnly);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_log_config() {
        let config = LogConfig::default();
        assert!(config.enabled);
        assert_eq!(config.log_dir, PathBuf::from("logs"));
        assert_eq!(config.retention_days, 7);
        assert_eq!(config.level, "info");
    }

    #[test]
    fn test_transfer_config_validation() {
        let mut config = TransferConfig::default();
        config.worker_count = 0;
        assert!(config.validate().is_err());

        let mut config = TransferConfig::default();
        config.block_size = config.chunk_size + 1;
        assert!(config.validate().is_err());

        let mut config = TransferConfig::default();
        config.backoff_base = 1.0;
        assert!(config.validate().is_err());

        let mut config = TransferConfig::default();
        config.backoff_base = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = TransferConfig::default();
        config.backoff_unit_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_toml() {
        let content = r#"
[transfer]
worker_count = 4
batch_size = 2

[transfer.integrity]
mode = "read_back"
algorithm = "sha256"

[servers.nas]
host = "10.0.0.5"
username = "backup"
password = "secret"
"#;
        let config: AppConfig = toml::from_str(content).unwrap();
        assert_eq!(config.transfer.worker_count, 4);
        assert_eq!(config.transfer.batch_size, 2);
        // 未填写的字段使用默认值
        assert_eq!(config.transfer.max_attempts, 3);
        assert_eq!(
            config.transfer.integrity,
            IntegrityMode::ReadBack {
                algorithm: DigestAlgorithm::Sha256
            }
        );

        let nas = &config.servers["nas"];
        assert_eq!(nas.port, 22);
        assert_eq!(nas.timeout_secs, 30);
        assert_eq!(nas.keepalive_secs, 30);
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config").join("transfer.toml");
        let path = path.to_str().unwrap();

        let mut config = AppConfig::default();
        config.transfer.worker_count = 8;
        config.save_to_file(path).await.unwrap();

        let loaded = AppConfig::load_from_file(path).await.unwrap();
        assert_eq!(loaded.transfer.worker_count, 8);
        assert!(loaded.servers.is_empty());
    }

    #[tokio::test]
    async fn test_load_or_default_writes_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("transfer.toml");
        let path_str = path.to_str().unwrap();

        let config = AppConfig::load_or_default(path_str).await;
        assert_eq!(config.transfer.batch_size, 20);
        assert!(path.exists());
    }
}

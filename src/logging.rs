//! 日志系统配置
//!
//! 控制台输出到 stderr（stdout 留给命令行的结果输出），可选文件持久化。
//! 日志文件按大小滚动，启动时清理过期文件。

use crate::config::LogConfig;
use chrono::Local;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// 日志文件名前缀
pub const LOG_FILE_PREFIX: &str = "remote-transfer.";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// 滚动日志文件（内部状态）
struct RollingFile {
    /// 进程启动时间戳（YYYY-MM-DD-HHMMSS）
    start_timestamp: String,
    log_dir: PathBuf,
    current: Option<File>,
    /// 0 为基础文件，之后依次递增
    index: u32,
    max_file_size: u64,
    written: u64,
}

impl RollingFile {
    fn open(log_dir: PathBuf, max_file_size: u64) -> io::Result<Self> {
        let mut file = Self {
            start_timestamp: Local::now().format("%Y-%m-%d-%H%M%S").to_string(),
            log_dir,
            current: None,
            index: 0,
            max_file_size,
            written: 0,
        };
        file.open_current()?;
        Ok(file)
    }

    fn path_for(&self, index: u32) -> PathBuf {
        let name = if index == 0 {
            format!("{}{}.log", LOG_FILE_PREFIX, self.start_timestamp)
        } else {
            format!("{}{}_{}.log", LOG_FILE_PREFIX, self.start_timestamp, index)
        };
        self.log_dir.join(name)
    }

    fn open_current(&mut self) -> io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(self.index))?;
        self.current = Some(file);
        self.written = 0;
        Ok(())
    }

    fn write_data(&mut self, buf: &[u8]) -> io::Result<usize> {
        // 空文件时不滚动，避免单条超长日志导致无限滚动
        if self.written > 0 && self.written + buf.len() as u64 > self.max_file_size {
            if let Some(mut file) = self.current.take() {
                file.flush()?;
            }
            self.index += 1;
            self.open_current()?;
        }

        match &mut self.current {
            Some(file) => {
                let n = file.write(buf)?;
                self.written += n as u64;
                Ok(n)
            }
            None => Err(io::Error::new(io::ErrorKind::Other, "日志文件未打开")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(file) = &mut self.current {
            file.flush()?;
        }
        Ok(())
    }
}

/// 日志文件管理器
///
/// 实现了 Write trait，交给 tracing-appender 的后台线程写入。
#[derive(Clone)]
pub struct LogFileManager {
    inner: Arc<Mutex<RollingFile>>,
}

impl LogFileManager {
    pub fn new(log_dir: PathBuf, max_file_size: u64) -> io::Result<Self> {
        Ok(Self {
            inner: Arc::new(Mutex::new(RollingFile::open(log_dir, max_file_size)?)),
        })
    }
}

impl Write for LogFileManager {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.lock().write_data(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.lock().flush()
    }
}

/// 日志系统守卫
/// 必须保持存活，否则日志写入线程会终止
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// 初始化日志系统
///
/// 全局订阅器已存在时（例如测试中重复初始化）静默跳过。
pub fn init_logging(config: &LogConfig) -> LogGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_string()))
        .with_writer(io::stderr);

    let file_writer = if config.enabled {
        match fs::create_dir_all(&config.log_dir)
            .and_then(|_| LogFileManager::new(config.log_dir.clone(), config.max_file_size))
        {
            Ok(manager) => Some(tracing_appender::non_blocking(manager)),
            Err(e) => {
                eprintln!(
                    "创建日志文件失败: {:?}, 错误: {}，回退到仅控制台输出",
                    config.log_dir, e
                );
                None
            }
        }
    } else {
        None
    };

    match file_writer {
        Some((non_blocking, file_guard)) => {
            let file_layer = fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_string()))
                .with_ansi(false)
                .with_writer(non_blocking);

            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .with(file_layer)
                .try_init();

            info!(
                "日志系统初始化完成: 目录={:?}, 保留天数={}, 级别={}, 单文件最大={:.1}MB",
                config.log_dir,
                config.retention_days,
                config.level,
                config.max_file_size as f64 / 1024.0 / 1024.0
            );

            let removed = cleanup_old_logs(&config.log_dir, config.retention_days);
            if removed > 0 {
                info!("已清理 {} 个过期日志文件", removed);
            }

            LogGuard {
                _file_guard: Some(file_guard),
            }
        }
        None => {
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .try_init();
            info!("日志系统初始化完成（仅控制台输出）");
            LogGuard { _file_guard: None }
        }
    }
}

/// 清理过期日志文件，返回删除数量
fn cleanup_old_logs(log_dir: &Path, retention_days: u32) -> usize {
    let today = Local::now().date_naive();
    let retention = chrono::Duration::days(retention_days as i64);

    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("读取日志目录失败: {:?}, 错误: {}", log_dir, e);
            return 0;
        }
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        if !name.starts_with(LOG_FILE_PREFIX) || !name.ends_with(".log") {
            continue;
        }

        let expired = match extract_date_from_filename(name) {
            Some(date) => today.signed_duration_since(date) > retention,
            // 文件名无法解析日期时按修改时间判断
            None => expired_by_modified_time(&entry, retention),
        };

        if expired {
            match fs::remove_file(&path) {
                Ok(()) => {
                    removed += 1;
                    tracing::debug!("已删除过期日志文件: {:?}", path);
                }
                Err(e) => tracing::warn!("删除过期日志文件失败: {:?}, 错误: {}", path, e),
            }
        }
    }
    removed
}

/// 从文件名中提取日期
///
/// - remote-transfer.YYYY-MM-DD-HHMMSS.log
/// - remote-transfer.YYYY-MM-DD-HHMMSS_N.log
fn extract_date_from_filename(filename: &str) -> Option<chrono::NaiveDate> {
    let name = filename
        .strip_prefix(LOG_FILE_PREFIX)?
        .strip_suffix(".log")?;
    let date = name.get(..10)?;
    chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

fn expired_by_modified_time(entry: &fs::DirEntry, retention: chrono::Duration) -> bool {
    entry
        .metadata()
        .and_then(|m| m.modified())
        .map(|modified| {
            let modified: chrono::DateTime<chrono::Utc> = modified.into();
            chrono::Utc::now().signed_duration_since(modified) > retention
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_extract_date() {
        let date = chrono::NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        assert_eq!(
            extract_date_from_filename("remote-transfer.2024-03-09-101500.log"),
            Some(date)
        );
        assert_eq!(
            extract_date_from_filename("remote-transfer.2024-03-09-101500_3.log"),
            Some(date)
        );
        assert_eq!(extract_date_from_filename("remote-transfer.garbage.log"), None);
        assert_eq!(extract_date_from_filename("other.2024-03-09.log"), None);
    }

    #[test]
    fn test_cleanup_only_touches_expired_logs() {
        let dir = TempDir::new().unwrap();
        let old = dir.path().join("remote-transfer.2000-01-01-000000.log");
        let fresh_name = format!(
            "{}{}.log",
            LOG_FILE_PREFIX,
            Local::now().format("%Y-%m-%d-%H%M%S")
        );
        let fresh = dir.path().join(fresh_name);
        let foreign = dir.path().join("notes.2000-01-01.log");
        for path in [&old, &fresh, &foreign] {
            fs::write(path, b"x").unwrap();
        }

        assert_eq!(cleanup_old_logs(dir.path(), 7), 1);
        assert!(!old.exists());
        assert!(fresh.exists());
        assert!(foreign.exists());
    }

    #[test]
    fn test_rolling_file_rotates_by_size() {
        let dir = TempDir::new().unwrap();
        let mut manager = LogFileManager::new(dir.path().to_path_buf(), 16).unwrap();
        manager.write_all(b"0123456789\n").unwrap();
        manager.write_all(b"0123456789\n").unwrap();
        manager.write_all(b"0123456789\n").unwrap();
        manager.flush().unwrap();

        let count = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(count, 3);
    }
}

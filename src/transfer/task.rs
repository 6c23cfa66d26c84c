// 传输任务与结果

use super::digest::IntegrityCheck;
use crate::error::{ErrorKind, TransferError};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// 传输方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Upload,
    Download,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Upload => "上传",
            Direction::Download => "下载",
        }
    }
}

/// 单个文件的传输任务
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferTask {
    /// 在批次中的位置（从 1 开始）
    pub index: usize,
    pub direction: Direction,
    pub remote_path: String,
    pub local_path: PathBuf,
    /// 源文件大小，探测后填入
    pub expected_size: Option<u64>,
    /// 续传偏移，确定后填入
    pub resume_offset: u64,
    pub integrity: IntegrityCheck,
}

impl TransferTask {
    pub fn download(index: usize, remote_path: impl Into<String>, local_path: impl Into<PathBuf>) -> Self {
        Self::new(index, Direction::Download, remote_path.into(), local_path.into())
    }

    pub fn upload(index: usize, local_path: impl Into<PathBuf>, remote_path: impl Into<String>) -> Self {
        Self::new(index, Direction::Upload, remote_path.into(), local_path.into())
    }

    fn new(index: usize, direction: Direction, remote_path: String, local_path: PathBuf) -> Self {
        Self {
            index,
            direction,
            remote_path,
            local_path,
            expected_size: None,
            resume_offset: 0,
            integrity: IntegrityCheck::default(),
        }
    }

    pub fn with_integrity(mut self, integrity: IntegrityCheck) -> Self {
        self.integrity = integrity;
        self
    }

    /// 可读的任务描述
    pub fn label(&self) -> String {
        match self.direction {
            Direction::Download => format!(
                "{} {} -> {}",
                self.direction.as_str(),
                self.remote_path,
                self.local_path.display()
            ),
            Direction::Upload => format!(
                "{} {} -> {}",
                self.direction.as_str(),
                self.local_path.display(),
                self.remote_path
            ),
        }
    }

    /// 源路径
    pub fn source(&self) -> String {
        match self.direction {
            Direction::Download => self.remote_path.clone(),
            Direction::Upload => self.local_path.display().to_string(),
        }
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }
}

/// 传输结果类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferOutcome {
    /// 传输完成
    Success,
    /// 目标已完整，跳过
    Skipped,
    /// 失败
    Failed,
}

/// 单次尝试的统计
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AttemptStats {
    /// 源文件大小
    pub total: u64,
    /// 续传起点
    pub resumed_from: u64,
    /// 本次实际传输字节数
    pub bytes: u64,
    /// 目标已完整
    pub skipped: bool,
}

/// 传输结果（每个任务恰好一个）
#[derive(Debug, Clone, Serialize)]
pub struct TransferResult {
    pub task: TransferTask,
    pub outcome: TransferOutcome,
    pub bytes_transferred: u64,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl TransferResult {
    pub fn completed(mut task: TransferTask, stats: AttemptStats, attempts: u32) -> Self {
        task.expected_size = Some(stats.total);
        task.resume_offset = stats.resumed_from;
        Self {
            task,
            outcome: if stats.skipped {
                TransferOutcome::Skipped
            } else {
                TransferOutcome::Success
            },
            bytes_transferred: stats.bytes,
            attempts,
            error: None,
            error_kind: None,
        }
    }

    pub fn failed(task: TransferTask, err: &TransferError, attempts: u32) -> Self {
        Self {
            task,
            outcome: TransferOutcome::Failed,
            bytes_transferred: 0,
            attempts,
            error: Some(err.to_string()),
            error_kind: Some(err.kind()),
        }
    }

    /// 成功或跳过
    pub fn is_success(&self) -> bool {
        matches!(
            self.outcome,
            TransferOutcome::Success | TransferOutcome::Skipped
        )
    }

    pub fn index(&self) -> usize {
        self.task.index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_label() {
        let task = TransferTask::download(1, "/data/a.bin", "/tmp/a.bin");
        assert_eq!(task.label(), "下载 /data/a.bin -> /tmp/a.bin");
        assert_eq!(task.source(), "/data/a.bin");

        let task = TransferTask::upload(2, "/tmp/b.bin", "/data/b.bin");
        assert_eq!(task.label(), "上传 /tmp/b.bin -> /data/b.bin");
    }

    #[test]
    fn test_result_outcomes() {
        let task = TransferTask::download(1, "/a", "/b");
        let stats = AttemptStats {
            total: 10,
            resumed_from: 4,
            bytes: 6,
            skipped: false,
        };
        let ok = TransferResult::completed(task.clone(), stats, 1);
        assert_eq!(ok.outcome, TransferOutcome::Success);
        assert_eq!(ok.task.expected_size, Some(10));
        assert_eq!(ok.task.resume_offset, 4);
        assert!(ok.is_success());

        let skipped = TransferResult::completed(
            task.clone(),
            AttemptStats {
                skipped: true,
                ..stats
            },
            1,
        );
        assert_eq!(skipped.outcome, TransferOutcome::Skipped);
        assert!(skipped.is_success());

        let failed = TransferResult::failed(task, &TransferError::remote_not_found("/a"), 1);
        assert!(!failed.is_success());
        assert_eq!(failed.error_kind, Some(ErrorKind::NotFound));
        assert!(failed.error.unwrap().contains("remote file inaccessible"));
    }
}

// 内容摘要：用于传输完成后的完整性校验

use crate::error::{TransferError, TransferResultOf};
use crate::remote::RemoteReader;
use md5::Context as Md5Context;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;

/// 读取缓冲区大小
const HASH_BUFFER_SIZE: usize = 256 * 1024;

/// 摘要算法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DigestAlgorithm {
    Md5,
    Sha256,
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DigestAlgorithm::Md5 => f.write_str("md5"),
            DigestAlgorithm::Sha256 => f.write_str("sha256"),
        }
    }
}

/// 单个任务的完整性校验要求
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum IntegrityCheck {
    /// 只比较大小
    SizeOnly,
    /// 与调用方给出的摘要比较（十六进制，忽略大小写）
    Expected {
        algorithm: DigestAlgorithm,
        digest: String,
    },
    /// 回读目标文件，与源文件摘要比较
    ReadBack(DigestAlgorithm),
}

impl Default for IntegrityCheck {
    fn default() -> Self {
        IntegrityCheck::SizeOnly
    }
}

impl IntegrityCheck {
    pub fn algorithm(&self) -> Option<DigestAlgorithm> {
        match self {
            IntegrityCheck::SizeOnly => None,
            IntegrityCheck::Expected { algorithm, .. } => Some(*algorithm),
            IntegrityCheck::ReadBack(algorithm) => Some(*algorithm),
        }
    }
}

/// 流式摘要计算器
pub enum StreamHasher {
    Md5(Md5Context),
    Sha256(Sha256),
}

impl StreamHasher {
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        match algorithm {
            DigestAlgorithm::Md5 => StreamHasher::Md5(Md5Context::new()),
            DigestAlgorithm::Sha256 => StreamHasher::Sha256(Sha256::new()),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            StreamHasher::Md5(ctx) => ctx.consume(data),
            StreamHasher::Sha256(hasher) => hasher.update(data),
        }
    }

    /// 十六进制小写摘要
    pub fn finish(self) -> String {
        match self {
            StreamHasher::Md5(ctx) => format!("{:x}", ctx.compute()),
            StreamHasher::Sha256(hasher) => hex::encode(hasher.finalize()),
        }
    }
}

/// 计算本地文件摘要（在阻塞线程池中执行）
pub async fn hash_local_file(path: &Path, algorithm: DigestAlgorithm) -> TransferResultOf<String> {
    let path: PathBuf = path.to_path_buf();
    tokio::task::spawn_blocking(move || hash_local_file_sync(&path, algorithm))
        .await
        .map_err(|e| TransferError::Integrity(format!("摘要计算任务异常: {}", e)))?
}

fn hash_local_file_sync(path: &Path, algorithm: DigestAlgorithm) -> TransferResultOf<String> {
    let mut file = std::fs::File::open(path).map_err(|e| TransferError::local_io(path, e))?;
    let mut hasher = StreamHasher::new(algorithm);
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let n = file
            .read(&mut buffer)
            .map_err(|e| TransferError::local_io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hasher.finish())
}

/// 计算远端读取流的摘要
pub async fn hash_remote_reader(
    mut reader: RemoteReader,
    algorithm: DigestAlgorithm,
) -> TransferResultOf<String> {
    let mut hasher = StreamHasher::new(algorithm);
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let n = reader
            .read(&mut buffer)
            .await
            .map_err(|e| TransferError::Remote(e.into()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hasher.finish())
}

/// 比较两个十六进制摘要
pub fn digests_match(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

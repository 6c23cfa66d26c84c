// 可续传下载
//
// 单次尝试：
// 1. 创建本地父目录
// 2. 探测远端大小（不存在 -> remote file inaccessible，不可重试）
// 3. 对比本地已有大小：相等跳过，(0, total) 之间续传，否则从头下载
// 4. 从偏移处流式读取，追加写入本地文件
// 5. 校验大小（及可选摘要），不一致删除本地文件

use super::digest::{digests_match, hash_local_file, hash_remote_reader, IntegrityCheck};
use super::progress::ByteProgress;
use super::state::{TransferState, TransferStateMachine};
use super::task::{AttemptStats, TransferTask};
use super::TransferOptions;
use crate::error::{TransferError, TransferResultOf};
use crate::remote::RemoteSession;
use std::io::ErrorKind as IoErrorKind;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

/// 执行一次下载尝试
///
/// `touched` 在本地文件被打开写入后置位，供调用方在最终失败时清理残留文件。
pub async fn download_once(
    session: &mut dyn RemoteSession,
    task: &TransferTask,
    options: &TransferOptions,
    progress: &ByteProgress,
    touched: &AtomicBool,
) -> TransferResultOf<AttemptStats> {
    let mut sm = TransferStateMachine::new(task.label());
    let result = run(&mut sm, session, task, options, progress, touched).await;
    if let Err(e) = &result {
        sm.fail(e);
    }
    result
}

async fn run(
    sm: &mut TransferStateMachine,
    session: &mut dyn RemoteSession,
    task: &TransferTask,
    options: &TransferOptions,
    progress: &ByteProgress,
    touched: &AtomicBool,
) -> TransferResultOf<AttemptStats> {
    let local = task.local_path.as_path();
    let remote = task.remote_path.as_str();

    // 本地父目录
    if let Some(parent) = local.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| TransferError::local_io(parent, e))?;
        }
    }

    // Init → SizeProbed
    let total = match session.stat(remote).await? {
        None => return Err(TransferError::remote_not_found(remote)),
        Some(meta) if meta.is_dir => {
            return Err(TransferError::Config(format!("远端路径是目录: {}", remote)))
        }
        Some(meta) => meta.size,
    };
    sm.advance(TransferState::SizeProbed)?;

    // SizeProbed → OffsetDetermined
    let existing = local_size(local).await?;
    if existing == Some(total) {
        info!("本地文件已完整，跳过: {:?} ({} bytes)", local, total);
        progress.finish(total, total);
        sm.advance(TransferState::Completed)?;
        return Ok(AttemptStats {
            total,
            resumed_from: total,
            bytes: 0,
            skipped: true,
        });
    }
    let offset = match existing {
        Some(size) if size > 0 && size < total => size,
        _ => 0,
    };
    if offset > 0 {
        info!("断点续传: {} 从 {} / {} 字节继续", remote, offset, total);
    }
    sm.advance(TransferState::OffsetDetermined)?;

    // OffsetDetermined → Transferring
    let mut reader = session.open_read(remote, offset).await?;
    let mut open = OpenOptions::new();
    open.create(true);
    if offset > 0 {
        open.append(true);
    } else {
        open.write(true).truncate(true);
    }
    let mut file = open
        .open(local)
        .await
        .map_err(|e| TransferError::local_io(local, e))?;
    touched.store(true, Ordering::SeqCst);
    sm.advance(TransferState::Transferring)?;

    let mut buffer = vec![0u8; options.chunk_size];
    let mut done: u64 = 0;
    loop {
        let n = match reader.read(&mut buffer).await {
            Ok(n) => n,
            Err(e) => {
                // 已写入部分先落盘，下次尝试按本地大小续传
                let _ = file.flush().await;
                return Err(TransferError::Remote(e.into()));
            }
        };
        if n == 0 {
            break;
        }
        file.write_all(&buffer[..n])
            .await
            .map_err(|e| TransferError::local_io(local, e))?;
        done += n as u64;
        progress.report(offset + done, total);
    }
    file.flush()
        .await
        .map_err(|e| TransferError::local_io(local, e))?;
    drop(file);
    drop(reader);
    progress.finish(offset + done, total);

    // Transferring → Verifying
    sm.advance(TransferState::Verifying)?;
    let final_size = local_size(local).await?.unwrap_or(0);
    if final_size != total {
        remove_local(local).await;
        return Err(TransferError::Integrity(format!(
            "{}: 期望 {} 字节，实际 {} 字节",
            remote, total, final_size
        )));
    }

    verify_digest(session, task).await?;

    sm.advance(TransferState::Completed)?;
    debug!("下载完成: {} ({} 字节，本次 {} 字节)", remote, total, done);
    Ok(AttemptStats {
        total,
        resumed_from: offset,
        bytes: done,
        skipped: false,
    })
}

/// 摘要校验，不一致时删除本地文件
async fn verify_digest(session: &mut dyn RemoteSession, task: &TransferTask) -> TransferResultOf<()> {
    let local = task.local_path.as_path();
    let (algorithm, expected) = match &task.integrity {
        IntegrityCheck::SizeOnly => return Ok(()),
        IntegrityCheck::Expected { algorithm, digest } => (*algorithm, digest.clone()),
        IntegrityCheck::ReadBack(algorithm) => {
            let reader = session.open_read(&task.remote_path, 0).await?;
            (*algorithm, hash_remote_reader(reader, *algorithm).await?)
        }
    };

    let actual = hash_local_file(local, algorithm).await?;
    if !digests_match(&actual, &expected) {
        remove_local(local).await;
        return Err(TransferError::Integrity(format!(
            "{}: {} 摘要不一致 (期望 {}，实际 {})",
            task.remote_path, algorithm, expected, actual
        )));
    }
    debug!("{} 校验通过: {}", algorithm, actual);
    Ok(())
}

/// 本地文件大小，不存在返回 None
async fn local_size(path: &Path) -> TransferResultOf<Option<u64>> {
    match fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => Err(TransferError::Config(format!(
            "本地目标是目录: {}",
            path.display()
        ))),
        Ok(meta) => Ok(Some(meta.len())),
        Err(e) if e.kind() == IoErrorKind::NotFound => Ok(None),
        Err(e) => Err(TransferError::local_io(path, e)),
    }
}

/// 删除本地残留文件
pub(crate) async fn remove_local(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => debug!("已删除本地残留文件: {:?}", path),
        Err(e) if e.kind() == IoErrorKind::NotFound => {}
        Err(e) => tracing::warn!("删除本地残留文件失败: {:?}, 错误: {}", path, e),
    }
}

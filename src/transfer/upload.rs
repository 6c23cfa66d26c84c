// 可续传上传
//
// 数据先写入 `<remote>.part`，校验通过后再 rename 为最终文件名，
// 上传中途崩溃不会破坏已有的完整远端文件。
//
// 单次尝试：
// 1. 逐级创建远端父目录
// 2. 探测本地大小（不存在 -> local file inaccessible，不可重试）
// 3. 远端最终文件大小相同则跳过；`.part` 大小在 (0, total) 之间则续传
// 4. 按 chunk_size 读取本地文件，每块再拆成 block_size 小块写入
// 5. 校验 `.part` 大小（及可选摘要）→ rename → 再次校验最终文件大小

use super::digest::{digests_match, hash_local_file, hash_remote_reader, IntegrityCheck};
use super::progress::ByteProgress;
use super::state::{TransferState, TransferStateMachine};
use super::task::{AttemptStats, TransferTask};
use super::TransferOptions;
use crate::error::{TransferError, TransferResultOf};
use crate::remote::{ensure_remote_dir, remote_parent, RemoteSession};
use std::io::{ErrorKind as IoErrorKind, SeekFrom};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

/// 临时文件后缀
pub const PART_SUFFIX: &str = ".part";

/// 远端临时文件路径
pub fn part_path(remote: &str) -> String {
    format!("{}{}", remote, PART_SUFFIX)
}

/// 执行一次上传尝试
pub async fn upload_once(
    session: &mut dyn RemoteSession,
    task: &TransferTask,
    options: &TransferOptions,
    progress: &ByteProgress,
) -> TransferResultOf<AttemptStats> {
    let mut sm = TransferStateMachine::new(task.label());
    let result = run(&mut sm, session, task, options, progress).await;
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
) -> TransferResultOf<AttemptStats> {
    let local = task.local_path.as_path();
    let remote = task.remote_path.as_str();
    let part = part_path(remote);

    // 远端父目录
    if let Some(parent) = remote_parent(remote) {
        ensure_remote_dir(session, parent).await?;
    }

    // Init → SizeProbed
    let total = match fs::metadata(local).await {
        Ok(meta) if meta.is_dir() => {
            return Err(TransferError::Config(format!(
                "本地源是目录: {}",
                local.display()
            )))
        }
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == IoErrorKind::NotFound => {
            return Err(TransferError::local_not_found(local.display().to_string()))
        }
        Err(e) => return Err(TransferError::local_io(local, e)),
    };
    sm.advance(TransferState::SizeProbed)?;

    // SizeProbed → OffsetDetermined
    if let Some(meta) = session.stat(remote).await? {
        if meta.is_dir {
            return Err(TransferError::Config(format!("远端目标是目录: {}", remote)));
        }
        if meta.size == total {
            info!("远端文件已完整，跳过: {} ({} bytes)", remote, total);
            progress.finish(total, total);
            sm.advance(TransferState::Completed)?;
            return Ok(AttemptStats {
                total,
                resumed_from: total,
                bytes: 0,
                skipped: true,
            });
        }
    }
    let existing_part = session.stat(&part).await?.map(|m| m.size).unwrap_or(0);
    let offset = if existing_part > 0 && existing_part < total {
        info!("断点续传: {} 从 {} / {} 字节继续", part, existing_part, total);
        existing_part
    } else {
        0
    };
    sm.advance(TransferState::OffsetDetermined)?;

    // OffsetDetermined → Transferring
    let mut source = fs::File::open(local)
        .await
        .map_err(|e| TransferError::local_io(local, e))?;
    if offset > 0 {
        source
            .seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| TransferError::local_io(local, e))?;
    }
    let mut writer = session.open_write(&part, offset > 0).await?;
    sm.advance(TransferState::Transferring)?;

    let mut chunk = vec![0u8; options.chunk_size];
    let mut done: u64 = 0;
    loop {
        let n = fill_chunk(&mut source, &mut chunk)
            .await
            .map_err(|e| TransferError::local_io(local, e))?;
        if n == 0 {
            break;
        }
        for block in chunk[..n].chunks(options.block_size) {
            writer
                .write_all(block)
                .await
                .map_err(|e| TransferError::Remote(e.into()))?;
        }
        done += n as u64;
        progress.report(offset + done, total);
    }
    writer
        .shutdown()
        .await
        .map_err(|e| TransferError::Remote(e.into()))?;
    drop(writer);
    progress.finish(offset + done, total);

    // Transferring → Verifying
    sm.advance(TransferState::Verifying)?;
    let part_size = session.stat(&part).await?.map(|m| m.size).unwrap_or(0);
    if part_size != total {
        remove_remote(session, &part).await;
        return Err(TransferError::Integrity(format!(
            "{}: 期望 {} 字节，实际 {} 字节",
            part, total, part_size
        )));
    }

    verify_digest(session, task, &part).await?;

    session.rename(&part, remote).await?;
    let final_size = session.stat(remote).await?.map(|m| m.size);
    if final_size != Some(total) {
        remove_remote(session, remote).await;
        return Err(TransferError::Integrity(format!(
            "{}: 重命名后大小不一致 (期望 {}，实际 {:?})",
            remote, total, final_size
        )));
    }

    sm.advance(TransferState::Completed)?;
    debug!("上传完成: {} ({} 字节，本次 {} 字节)", remote, total, done);
    Ok(AttemptStats {
        total,
        resumed_from: offset,
        bytes: done,
        skipped: false,
    })
}

/// 读满一个分块（文件末尾除外）
async fn fill_chunk(source: &mut fs::File, chunk: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < chunk.len() {
        let n = source.read(&mut chunk[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// 对 `.part` 做摘要校验，不一致时删除
async fn verify_digest(
    session: &mut dyn RemoteSession,
    task: &TransferTask,
    part: &str,
) -> TransferResultOf<()> {
    let (algorithm, expected) = match &task.integrity {
        IntegrityCheck::SizeOnly => return Ok(()),
        IntegrityCheck::Expected { algorithm, digest } => (*algorithm, digest.clone()),
        IntegrityCheck::ReadBack(algorithm) => {
            (*algorithm, hash_local_file(&task.local_path, *algorithm).await?)
        }
    };

    let reader = session.open_read(part, 0).await?;
    let actual = hash_remote_reader(reader, algorithm).await?;
    if !digests_match(&actual, &expected) {
        remove_remote(session, part).await;
        return Err(TransferError::Integrity(format!(
            "{}: {} 摘要不一致 (期望 {}，实际 {})",
            part, algorithm, expected, actual
        )));
    }
    debug!("{} 校验通过: {}", algorithm, actual);
    Ok(())
}

async fn remove_remote(session: &mut dyn RemoteSession, path: &str) {
    if let Err(e) = session.remove(path).await {
        warn!("删除远端残留文件失败: {}, 错误: {}", path, e);
    }
}

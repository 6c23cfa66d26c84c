// 端到端场景测试：断点续传、批量失败、上传暂存、截断与参数校验

mod common;

use common::{local_client, pattern, SERVER};
use remote_transfer::transfer::digest::{hash_local_file, DigestAlgorithm};
use remote_transfer::{
    BatchOptions, Destinations, ErrorKind, ProgressEvent, TransferClient, TransferOutcome,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn options(client: &TransferClient) -> BatchOptions {
    let mut options = client.batch_options();
    options.pause_between_batches = Duration::ZERO;
    options
}

fn remote_file(root: &Path, name: &str, data: &[u8]) -> String {
    std::fs::write(root.join(name), data).unwrap();
    format!("/{}", name)
}

#[tokio::test]
async fn resumed_download_matches_full_download() {
    let remote = TempDir::new().unwrap();
    let local = TempDir::new().unwrap();
    let data = pattern(10_485_760);
    let path = remote_file(remote.path(), "big.bin", &data);
    let client = local_client(remote.path());

    let resumed = local.path().join("resumed.bin");
    std::fs::write(&resumed, &data[..4_194_304]).unwrap();
    let result = client.download_file(SERVER, &path, &resumed).await.unwrap();
    assert_eq!(result.outcome, TransferOutcome::Success);
    assert_eq!(result.task.resume_offset, 4_194_304);
    assert_eq!(result.bytes_transferred, 10_485_760 - 4_194_304);
    assert_eq!(std::fs::metadata(&resumed).unwrap().len(), 10_485_760);

    let direct = local.path().join("direct.bin");
    let result = client.download_file(SERVER, &path, &direct).await.unwrap();
    assert_eq!(result.outcome, TransferOutcome::Success);

    let a = hash_local_file(&resumed, DigestAlgorithm::Sha256).await.unwrap();
    let b = hash_local_file(&direct, DigestAlgorithm::Sha256).await.unwrap();
    assert_eq!(a, b);
}

#[tokio::test]
async fn second_download_is_skipped() {
    let remote = TempDir::new().unwrap();
    let local = TempDir::new().unwrap();
    let path = remote_file(remote.path(), "a.txt", b"hello world");
    let client = local_client(remote.path());
    let dest = local.path().join("a.txt");

    let first = client.download_file(SERVER, &path, &dest).await.unwrap();
    assert_eq!(first.outcome, TransferOutcome::Success);
    let modified = std::fs::metadata(&dest).unwrap().modified().unwrap();

    let second = client.download_file(SERVER, &path, &dest).await.unwrap();
    assert_eq!(second.outcome, TransferOutcome::Skipped);
    assert_eq!(second.bytes_transferred, 0);
    assert_eq!(std::fs::read(&dest).unwrap(), b"hello world");
    assert_eq!(std::fs::metadata(&dest).unwrap().modified().unwrap(), modified);
}

#[tokio::test]
async fn missing_remote_file_fails_only_its_task() {
    let remote = TempDir::new().unwrap();
    let local = TempDir::new().unwrap();
    let client = local_client(remote.path());

    let mut remotes = Vec::new();
    for i in 1..=5 {
        let name = format!("f{}.dat", i);
        if i == 3 {
            remotes.push(format!("/{}", name));
        } else {
            remotes.push(remote_file(remote.path(), &name, &pattern(1000 * i)));
        }
    }

    let report = client
        .download_file_list(
            SERVER,
            &remotes,
            &Destinations::Directory(local.path().to_path_buf()),
            &options(&client),
        )
        .await
        .unwrap();

    assert_eq!(report.counts(), (4, 5));
    assert_eq!(report.succeeded + report.failed, report.total);
    let third = &report.results[2];
    assert_eq!(third.index(), 3);
    assert_eq!(third.outcome, TransferOutcome::Failed);
    assert_eq!(third.error_kind, Some(ErrorKind::NotFound));
    assert!(third
        .error
        .as_deref()
        .unwrap()
        .contains("remote file inaccessible"));
    // 不可重试，只尝试一次
    assert_eq!(third.attempts, 1);
    assert!(!local.path().join("f3.dat").exists());
    assert!(local.path().join("f5.dat").exists());
}

#[tokio::test]
async fn upload_stages_part_file_until_complete() {
    let remote = TempDir::new().unwrap();
    let local = TempDir::new().unwrap();
    let src = local.path().join("payload.bin");
    std::fs::write(&src, pattern(2_000_000)).unwrap();

    let part = remote.path().join("up/payload.bin.part");
    let final_path = remote.path().join("up/payload.bin");
    let saw_part = Arc::new(AtomicBool::new(false));
    let saw_final_early = Arc::new(AtomicBool::new(false));

    let observer = {
        let part = part.clone();
        let final_path = final_path.clone();
        let saw_part = saw_part.clone();
        let saw_final_early = saw_final_early.clone();
        move |event: ProgressEvent| {
            if let ProgressEvent::Bytes { done, total, .. } = event {
                if done < total {
                    if part.exists() {
                        saw_part.store(true, Ordering::SeqCst);
                    }
                    if final_path.exists() {
                        saw_final_early.store(true, Ordering::SeqCst);
                    }
                }
            }
        }
    };
    let client = local_client(remote.path()).with_observer(Arc::new(observer));

    let report = client
        .upload_file_list(
            SERVER,
            &[src],
            &Destinations::Directory("/up".to_string()),
            &options(&client).with_batch_size(1),
        )
        .await
        .unwrap();

    assert_eq!(report.counts(), (1, 1));
    assert!(saw_part.load(Ordering::SeqCst));
    assert!(!saw_final_early.load(Ordering::SeqCst));
    assert!(!part.exists());
    assert_eq!(std::fs::metadata(&final_path).unwrap().len(), 2_000_000);
}

#[tokio::test]
async fn max_transfer_count_truncates_before_dispatch() {
    let remote = TempDir::new().unwrap();
    let local = TempDir::new().unwrap();
    let client = local_client(remote.path());

    let remotes: Vec<String> = (0..10)
        .map(|i| remote_file(remote.path(), &format!("r{}.txt", i), format!("{}", i).as_bytes()))
        .collect();
    let started = Arc::new(AtomicUsize::new(0));
    let counter = started.clone();
    let client = client.with_observer(Arc::new(move |event: ProgressEvent| {
        if matches!(event, ProgressEvent::TaskStarted { .. }) {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }));

    let report = client
        .download_file_list(
            SERVER,
            &remotes,
            &Destinations::Directory(local.path().to_path_buf()),
            &options(&client).with_max_transfer_count(Some(3)),
        )
        .await
        .unwrap();

    assert_eq!(report.total, 3);
    assert_eq!(report.results.len(), 3);
    assert_eq!(started.load(Ordering::SeqCst), 3);
    for i in 0..10 {
        assert_eq!(local.path().join(format!("r{}.txt", i)).exists(), i < 3);
    }
}

#[tokio::test]
async fn destination_length_mismatch_is_rejected_up_front() {
    let remote = TempDir::new().unwrap();
    let local = TempDir::new().unwrap();
    let client = local_client(remote.path());

    let remotes: Vec<String> = (0..5)
        .map(|i| remote_file(remote.path(), &format!("m{}.txt", i), b"x"))
        .collect();
    let dests: Vec<PathBuf> = (0..4).map(|i| local.path().join(format!("m{}.txt", i))).collect();

    let err = client
        .download_file_list(
            SERVER,
            &remotes,
            &Destinations::Paths(dests),
            &options(&client),
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert_eq!(std::fs::read_dir(local.path()).unwrap().count(), 0);
    assert_eq!(client.pool().stats(SERVER).opened_total, 0);
}

#[tokio::test]
async fn progress_indices_cover_every_task_once() {
    let remote = TempDir::new().unwrap();
    let local = TempDir::new().unwrap();
    let (observer, mut rx) = remote_transfer::ChannelObserver::new(1024);
    let client = local_client(remote.path()).with_observer(Arc::new(observer));

    let remotes: Vec<String> = (0..9)
        .map(|i| remote_file(remote.path(), &format!("p{}.txt", i), &pattern(100 + i)))
        .collect();
    let report = client
        .download_file_list(
            SERVER,
            &remotes,
            &Destinations::Directory(local.path().to_path_buf()),
            &options(&client).with_workers(3).with_batch_size(4),
        )
        .await
        .unwrap();
    assert_eq!(report.counts(), (9, 9));

    let mut started = Vec::new();
    let mut finished = Vec::new();
    while let Ok(event) = rx.try_recv() {
        match event {
            ProgressEvent::TaskStarted { index, total, .. } => {
                assert_eq!(total, 9);
                started.push(index);
            }
            ProgressEvent::TaskFinished { completed, .. } => finished.push(completed),
            ProgressEvent::Bytes { .. } => {}
        }
    }
    started.sort_unstable();
    finished.sort_unstable();
    assert_eq!(started, (1..=9).collect::<Vec<_>>());
    assert_eq!(finished, (1..=9).collect::<Vec<_>>());
}

// 批量任务规划
//
// 把调用方给出的源路径列表与目标（单一目录或逐一对应的路径列表）
// 组装为 TransferTask 列表。长度不一致属于配置错误，在任何任务开始前返回。

use crate::config::TransferConfig;
use crate::error::{TransferError, TransferResultOf};
use crate::remote::{remote_basename, remote_join};
use crate::transfer::{IntegrityCheck, TransferTask};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 打乱顺序使用的固定种子，保证结果可复现
pub const SHUFFLE_SEED: u64 = 42;

/// 目标位置
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destinations<T> {
    /// 单一目录，文件名取源路径的文件名
    Directory(T),
    /// 与源路径逐一对应
    Paths(Vec<T>),
}

/// 批量传输选项
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// 并发 worker 数
    pub worker_count: usize,
    /// 每批任务数
    pub batch_size: usize,
    /// 最多传输多少个文件，超出部分不会被调度
    pub max_transfer_count: Option<usize>,
    /// 是否按固定种子打乱顺序
    pub shuffle: bool,
    /// 完整性校验
    pub integrity: IntegrityCheck,
    /// 批与批之间的停顿
    pub pause_between_batches: Duration,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self::from(&TransferConfig::default())
    }
}

impl From<&TransferConfig> for BatchOptions {
    fn from(config: &TransferConfig) -> Self {
        Self {
            worker_count: config.worker_count,
            batch_size: config.batch_size,
            max_transfer_count: None,
            shuffle: false,
            integrity: config.integrity.into(),
            pause_between_batches: config.pause_between_batches(),
        }
    }
}

impl BatchOptions {
    pub fn with_workers(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_transfer_count(mut self, max: Option<usize>) -> Self {
        self.max_transfer_count = max;
        self
    }

    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    pub fn validate(&self) -> TransferResultOf<()> {
        if self.worker_count == 0 {
            return Err(TransferError::Config("worker_count 必须大于 0".to_string()));
        }
        if self.batch_size == 0 {
            return Err(TransferError::Config("batch_size 必须大于 0".to_string()));
        }
        Ok(())
    }
}

/// 配对源与目标，并做长度校验
fn pair<S: Clone, T: Clone>(
    sources: &[S],
    destinations: &Destinations<T>,
    derive: impl Fn(&S, &T) -> T,
) -> TransferResultOf<Vec<(S, T)>> {
    match destinations {
        Destinations::Directory(dir) => Ok(sources
            .iter()
            .map(|s| (s.clone(), derive(s, dir)))
            .collect()),
        Destinations::Paths(paths) => {
            if paths.len() != sources.len() {
                return Err(TransferError::Config(format!(
                    "源路径数量 ({}) 与目标路径数量 ({}) 不一致",
                    sources.len(),
                    paths.len()
                )));
            }
            Ok(sources.iter().cloned().zip(paths.iter().cloned()).collect())
        }
    }
}

/// 打乱、截断
pub(crate) fn arrange<T>(mut pairs: Vec<T>, options: &BatchOptions) -> Vec<T> {
    if options.shuffle {
        let mut rng = StdRng::seed_from_u64(SHUFFLE_SEED);
        pairs.shuffle(&mut rng);
    }
    if let Some(max) = options.max_transfer_count {
        pairs.truncate(max);
    }
    pairs
}

/// 规划下载任务
pub fn plan_downloads(
    remotes: &[String],
    destinations: &Destinations<PathBuf>,
    options: &BatchOptions,
) -> TransferResultOf<Vec<TransferTask>> {
    let pairs = pair(remotes, destinations, |remote, dir| {
        dir.join(remote_basename(remote))
    })?;
    Ok(arrange(pairs, options)
        .into_iter()
        .enumerate()
        .map(|(i, (remote, local))| {
            TransferTask::download(i + 1, remote, local).with_integrity(options.integrity.clone())
        })
        .collect())
}

/// 规划上传任务
pub fn plan_uploads(
    locals: &[PathBuf],
    destinations: &Destinations<String>,
    options: &BatchOptions,
) -> TransferResultOf<Vec<TransferTask>> {
    let pairs = pair(locals, destinations, |local, dir| {
        remote_join(dir, &local_basename(local))
    })?;
    Ok(arrange(pairs, options)
        .into_iter()
        .enumerate()
        .map(|(i, (local, remote))| {
            TransferTask::upload(i + 1, local, remote).with_integrity(options.integrity.clone())
        })
        .collect())
}

fn local_basename(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::transfer::Direction;
    use proptest::prelude::*;

    fn remotes(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("/data/f{}.bin", i)).collect()
    }

    #[test]
    fn test_directory_destination() {
        let tasks = plan_downloads(
            &remotes(3),
            &Destinations::Directory(PathBuf::from("/tmp/out")),
            &BatchOptions::default(),
        )
        .unwrap();
        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[0].index, 1);
        assert_eq!(tasks[2].local_path, PathBuf::from("/tmp/out/f2.bin"));
        assert_eq!(tasks[2].direction, Direction::Download);
    }

    #[test]
    fn test_length_mismatch_is_config_error() {
        let dests: Vec<PathBuf> = (0..4).map(|i| PathBuf::from(format!("/tmp/{}", i))).collect();
        let err = plan_downloads(
            &remotes(5),
            &Destinations::Paths(dests),
            &BatchOptions::default(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_truncation_keeps_first_tasks() {
        let options = BatchOptions::default().with_max_transfer_count(Some(3));
        let tasks = plan_downloads(
            &remotes(10),
            &Destinations::Directory(PathBuf::from("/tmp")),
            &options,
        )
        .unwrap();
        let names: Vec<&str> = tasks.iter().map(|t| t.remote_path.as_str()).collect();
        assert_eq!(names, vec!["/data/f0.bin", "/data/f1.bin", "/data/f2.bin"]);
    }

    #[test]
    fn test_shuffle_is_deterministic_and_keeps_pairs() {
        let dests: Vec<PathBuf> = (0..20).map(|i| PathBuf::from(format!("/tmp/l{}", i))).collect();
        let options = BatchOptions::default().with_shuffle(true);
        let a = plan_downloads(&remotes(20), &Destinations::Paths(dests.clone()), &options).unwrap();
        let b = plan_downloads(&remotes(20), &Destinations::Paths(dests), &options).unwrap();
        assert_eq!(a, b);
        for task in &a {
            let n = task.remote_path.trim_start_matches("/data/f").trim_end_matches(".bin");
            assert_eq!(task.local_path, PathBuf::from(format!("/tmp/l{}", n)));
        }
    }

    #[test]
    fn test_upload_plan() {
        let locals = vec![PathBuf::from("/home/u/a.txt"), PathBuf::from("/home/u/b.txt")];
        let tasks = plan_uploads(
            &locals,
            &Destinations::Directory("/remote/in/".to_string()),
            &BatchOptions::default(),
        )
        .unwrap();
        assert_eq!(tasks[1].remote_path, "/remote/in/b.txt");
        assert_eq!(tasks[1].direction, Direction::Upload);
    }

    proptest! {
        #[test]
        fn prop_plan_indices_are_contiguous(n in 0usize..60, max in proptest::option::of(0usize..80), shuffle: bool) {
            let options = BatchOptions::default()
                .with_max_transfer_count(max)
                .with_shuffle(shuffle);
            let tasks = plan_downloads(
                &remotes(n),
                &Destinations::Directory(PathBuf::from("/tmp")),
                &options,
            ).unwrap();
            let expected = max.map_or(n, |m| m.min(n));
            prop_assert_eq!(tasks.len(), expected);
            for (i, task) in tasks.iter().enumerate() {
                prop_assert_eq!(task.index, i + 1);
            }
        }
    }
}

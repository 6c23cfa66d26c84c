// 传输客户端
//
// 把服务器注册表、连接池、重试策略和批量调度器组合成面向调用方的接口。
// 所有远端操作都显式指定服务器名，客户端本身不保存"当前连接"。

use crate::config::{AppConfig, ServerRegistry, TransferConfig};
use crate::error::{TransferError, TransferResultOf};
use crate::pool::{ConnectionPool, PoolSettings};
use crate::remote::{
    ensure_remote_dir, remote_basename, remote_join, RemoteConnector, RemoteMetadata,
    RemoteSession,
};
use crate::scheduler::plan::arrange;
use crate::scheduler::{
    plan_downloads, plan_uploads, BatchOptions, BatchReport, BatchScheduler, Destinations,
};
use crate::transfer::progress::DEFAULT_THROTTLE_INTERVAL_MS;
use crate::transfer::{
    execute_task, run_with_retry, ByteProgress, NoopObserver, ProgressThrottler, RetryPolicy,
    SharedObserver, TransferOptions, TransferResult, TransferTask,
};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// 存在性检查结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExistenceReport {
    /// 存在的远端文件（保持输入顺序）
    pub existing: Vec<String>,
    /// 与 `existing` 对应的目标路径
    pub destinations: Vec<PathBuf>,
    /// 参与检查的文件数
    pub checked: usize,
}

/// 传输客户端
pub struct TransferClient {
    config: TransferConfig,
    pool: ConnectionPool,
    policy: RetryPolicy,
    options: TransferOptions,
    observer: SharedObserver,
    maintenance: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl TransferClient {
    /// 创建客户端，传输参数在此一次性校验
    pub fn new(
        registry: ServerRegistry,
        connector: Arc<dyn RemoteConnector>,
        config: TransferConfig,
    ) -> TransferResultOf<Self> {
        config.validate()?;
        let pool = ConnectionPool::new(registry, connector, PoolSettings::from(&config));
        Ok(Self {
            policy: config.retry_policy(),
            options: TransferOptions::from(&config),
            config,
            pool,
            observer: Arc::new(NoopObserver),
            maintenance: Mutex::new(None),
        })
    }

    /// 从应用配置创建
    pub fn from_app_config(
        app: &AppConfig,
        connector: Arc<dyn RemoteConnector>,
    ) -> TransferResultOf<Self> {
        Self::new(app.registry()?, connector, app.transfer.clone())
    }

    /// 设置进度观察者
    pub fn with_observer(mut self, observer: SharedObserver) -> Self {
        self.observer = observer;
        self
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// 按配置生成的默认批量选项
    pub fn batch_options(&self) -> BatchOptions {
        BatchOptions::from(&self.config)
    }

    fn scheduler(&self) -> BatchScheduler {
        BatchScheduler::new(
            self.pool.clone(),
            self.policy,
            self.options,
            self.observer.clone(),
        )
    }

    /// 启动连接池后台维护（重复调用无效果）
    pub fn start_maintenance(&self) {
        let mut slot = self.maintenance.lock();
        if slot.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let handle = self
            .pool
            .spawn_maintenance(self.config.maintenance_interval(), cancel.clone());
        *slot = Some((cancel, handle));
        info!(
            "连接池维护已启动，间隔 {:?}",
            self.config.maintenance_interval()
        );
    }

    /// 检查服务器是否可连接（不重试）
    pub async fn is_connected(&self, server: &str) -> bool {
        let mut conn = match self.pool.acquire(server).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("服务器 {} 不可用: {}", server, e);
                return false;
            }
        };
        let ok = match conn.session() {
            Ok(session) => session.noop().await.is_ok(),
            Err(_) => false,
        };
        if ok {
            conn.release();
        } else {
            conn.invalidate().await;
        }
        ok
    }

    /// 在重试包络内执行单个远端操作
    async fn remote_op<T, F>(&self, server: &str, label: &str, op: F) -> TransferResultOf<T>
    where
        F: for<'s> FnMut(&'s mut dyn RemoteSession) -> BoxFuture<'s, TransferResultOf<T>>,
    {
        run_with_retry(&self.pool, server, &self.policy, label, op)
            .await
            .result
    }

    // =====================================================
    // 单文件传输
    // =====================================================

    /// 下载单个文件
    ///
    /// 本地目标是已存在的目录时，文件名取远端文件名。
    pub async fn download_file(
        &self,
        server: &str,
        remote: &str,
        local: impl AsRef<Path>,
    ) -> TransferResultOf<TransferResult> {
        self.pool.registry().get(server)?;
        let local = local.as_ref();
        let local = if local.is_dir() {
            local.join(remote_basename(remote))
        } else {
            local.to_path_buf()
        };
        let task =
            TransferTask::download(1, remote, local).with_integrity(self.config.integrity.into());
        Ok(self.run_single(server, task).await)
    }

    /// 上传单个文件
    ///
    /// 远端目标以 `/` 结尾时视为目录，文件名取本地文件名。
    pub async fn upload_file(
        &self,
        server: &str,
        local: impl AsRef<Path>,
        remote: &str,
    ) -> TransferResultOf<TransferResult> {
        self.pool.registry().get(server)?;
        let local = local.as_ref();
        let remote = if remote.ends_with('/') {
            let name = local
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            remote_join(remote, &name)
        } else {
            remote.to_string()
        };
        let task =
            TransferTask::upload(1, local, remote).with_integrity(self.config.integrity.into());
        Ok(self.run_single(server, task).await)
    }

    async fn run_single(&self, server: &str, task: TransferTask) -> TransferResult {
        let progress = Arc::new(ByteProgress::new(
            self.observer.clone(),
            task.index,
            ProgressThrottler::with_millis(DEFAULT_THROTTLE_INTERVAL_MS),
        ));
        execute_task(&self.pool, server, &self.policy, self.options, task, progress).await
    }

    // =====================================================
    // 批量传输
    // =====================================================

    /// 批量下载
    pub async fn download_file_list(
        &self,
        server: &str,
        remotes: &[String],
        destinations: &Destinations<PathBuf>,
        options: &BatchOptions,
    ) -> TransferResultOf<BatchReport> {
        self.pool.registry().get(server)?;
        let tasks = plan_downloads(remotes, destinations, options)?;
        self.scheduler().run(server, tasks, options).await
    }

    /// 批量上传
    pub async fn upload_file_list(
        &self,
        server: &str,
        locals: &[PathBuf],
        destinations: &Destinations<String>,
        options: &BatchOptions,
    ) -> TransferResultOf<BatchReport> {
        self.pool.registry().get(server)?;
        let tasks = plan_uploads(locals, destinations, options)?;
        self.scheduler().run(server, tasks, options).await
    }

    /// 递归下载远端目录，保持相对目录结构
    pub async fn download_directory(
        &self,
        server: &str,
        remote_dir: &str,
        local_dir: impl AsRef<Path>,
        options: &BatchOptions,
    ) -> TransferResultOf<BatchReport> {
        let local_dir = local_dir.as_ref();
        let remotes = self.list_files_recursive(server, remote_dir).await?;
        let prefix = remote_dir.trim_end_matches('/');
        let destinations: Vec<PathBuf> = remotes
            .iter()
            .map(|remote| {
                let relative = remote
                    .strip_prefix(prefix)
                    .unwrap_or(remote)
                    .trim_start_matches('/');
                relative
                    .split('/')
                    .filter(|p| !p.is_empty())
                    .fold(local_dir.to_path_buf(), |acc, part| acc.join(part))
            })
            .collect();
        info!(
            "下载目录: {}:{} -> {:?} ({} 个文件)",
            server,
            remote_dir,
            local_dir,
            remotes.len()
        );
        self.download_file_list(server, &remotes, &Destinations::Paths(destinations), options)
            .await
    }

    /// 递归上传本地目录，保持相对目录结构
    pub async fn upload_directory(
        &self,
        server: &str,
        local_dir: impl AsRef<Path>,
        remote_dir: &str,
        options: &BatchOptions,
    ) -> TransferResultOf<BatchReport> {
        let local_dir = local_dir.as_ref().to_path_buf();
        if !local_dir.is_dir() {
            return Err(TransferError::local_not_found(local_dir.display().to_string()));
        }

        let walk_root = local_dir.clone();
        let files = tokio::task::spawn_blocking(move || collect_local_files(&walk_root))
            .await
            .map_err(|e| TransferError::Config(format!("遍历本地目录失败: {}", e)))??;

        let mut locals = Vec::with_capacity(files.len());
        let mut remotes = Vec::with_capacity(files.len());
        for path in files {
            let relative = path
                .strip_prefix(&local_dir)
                .unwrap_or(&path)
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            remotes.push(remote_join(remote_dir.trim_end_matches('/'), &relative));
            locals.push(path);
        }
        info!(
            "上传目录: {:?} -> {}:{} ({} 个文件)",
            local_dir,
            server,
            remote_dir,
            locals.len()
        );
        self.upload_file_list(server, &locals, &Destinations::Paths(remotes), options)
            .await
    }

    // =====================================================
    // 远端查询与操作
    // =====================================================

    /// 列出目录条目名
    pub async fn list_dir(&self, server: &str, dir: &str) -> TransferResultOf<Vec<String>> {
        let dir = dir.to_string();
        self.remote_op(server, "list", move |session| {
            let dir = dir.clone();
            Box::pin(async move { Ok(session.list(&dir).await?) })
        })
        .await
    }

    /// 递归列出目录下的全部文件（完整远端路径，已排序）
    pub async fn list_files_recursive(
        &self,
        server: &str,
        dir: &str,
    ) -> TransferResultOf<Vec<String>> {
        let dir = dir.to_string();
        self.remote_op(server, "list_recursive", move |session| {
            let dir = dir.clone();
            Box::pin(async move { walk_remote(session, &dir).await })
        })
        .await
    }

    /// 查询远端路径元数据
    pub async fn stat(&self, server: &str, path: &str) -> TransferResultOf<Option<RemoteMetadata>> {
        let path = path.to_string();
        self.remote_op(server, "stat", move |session| {
            let path = path.clone();
            Box::pin(async move { Ok(session.stat(&path).await?) })
        })
        .await
    }

    /// 删除远端文件
    pub async fn remove_file(&self, server: &str, path: &str) -> TransferResultOf<()> {
        let path = path.to_string();
        self.remote_op(server, "remove", move |session| {
            let path = path.clone();
            Box::pin(async move { Ok(session.remove(&path).await?) })
        })
        .await
    }

    /// 重命名远端文件（目标存在时覆盖）
    pub async fn rename_file(&self, server: &str, from: &str, to: &str) -> TransferResultOf<()> {
        let from = from.to_string();
        let to = to.to_string();
        self.remote_op(server, "rename", move |session| {
            let from = from.clone();
            let to = to.clone();
            Box::pin(async move { Ok(session.rename(&from, &to).await?) })
        })
        .await
    }

    /// 逐级创建远端目录
    pub async fn create_directory(&self, server: &str, dir: &str) -> TransferResultOf<()> {
        let dir = dir.to_string();
        self.remote_op(server, "mkdir", move |session| {
            let dir = dir.clone();
            Box::pin(async move { Ok(ensure_remote_dir(session, &dir).await?) })
        })
        .await
    }

    /// 过滤出存在的远端文件
    ///
    /// 按 worker_count 并发探测，结果保持输入顺序；`destinations` 给出时
    /// 同步过滤出对应的目标路径。打乱与截断规则与批量传输相同。
    pub async fn check_files_existence(
        &self,
        server: &str,
        remotes: &[String],
        destinations: Option<&[PathBuf]>,
        options: &BatchOptions,
    ) -> TransferResultOf<ExistenceReport> {
        self.pool.registry().get(server)?;
        options.validate()?;
        if let Some(dests) = destinations {
            if dests.len() != remotes.len() {
                return Err(TransferError::Config(format!(
                    "源路径数量 ({}) 与目标路径数量 ({}) 不一致",
                    remotes.len(),
                    dests.len()
                )));
            }
        }

        let pairs: Vec<(String, Option<PathBuf>)> = remotes
            .iter()
            .enumerate()
            .map(|(i, r)| (r.clone(), destinations.map(|d| d[i].clone())))
            .collect();
        let pairs = arrange(pairs, options);
        let checked = pairs.len();
        self.pool.set_capacity(server, options.worker_count)?;

        let semaphore = Arc::new(Semaphore::new(options.worker_count));
        let mut join_set: JoinSet<(usize, TransferResultOf<Option<RemoteMetadata>>)> =
            JoinSet::new();
        for (i, (remote, _)) in pairs.iter().enumerate() {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| TransferError::Config("worker 信号量已关闭".to_string()))?;
            let pool = self.pool.clone();
            let policy = self.policy;
            let server = server.to_string();
            let remote = remote.clone();
            join_set.spawn(async move {
                let _permit = permit;
                let label = format!("check {}", remote);
                let attempted = run_with_retry(&pool, &server, &policy, &label, move |session| {
                    let remote = remote.clone();
                    Box::pin(async move { Ok(session.stat(&remote).await?) })
                })
                .await;
                (i, attempted.result)
            });
        }

        let mut exists = vec![false; checked];
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((i, Ok(Some(meta)))) if !meta.is_dir => exists[i] = true,
                Ok((i, Ok(_))) => debug!("远端文件不存在: {}", pairs[i].0),
                Ok((i, Err(e))) => warn!("检查 {} 失败: {}", pairs[i].0, e),
                Err(e) => warn!("存在性检查任务异常退出: {}", e),
            }
        }

        let mut report = ExistenceReport {
            checked,
            ..Default::default()
        };
        for ((remote, dest), found) in pairs.into_iter().zip(exists) {
            if found {
                report.existing.push(remote);
                if let Some(dest) = dest {
                    report.destinations.push(dest);
                }
            }
        }
        info!(
            "存在性检查完成: {}/{} 个文件存在",
            report.existing.len(),
            checked
        );
        Ok(report)
    }

    /// 停止后台维护并关闭全部连接
    pub async fn shutdown(&self) {
        let maintenance = self.maintenance.lock().take();
        if let Some((cancel, handle)) = maintenance {
            cancel.cancel();
            if let Err(e) = handle.await {
                warn!("连接池维护任务退出异常: {}", e);
            }
        }
        self.pool.shutdown().await;
    }
}

impl std::fmt::Debug for TransferClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferClient")
            .field("pool", &self.pool)
            .field("policy", &self.policy)
            .finish()
    }
}

/// 广度优先遍历远端目录，返回全部文件路径
async fn walk_remote(session: &mut dyn RemoteSession, dir: &str) -> TransferResultOf<Vec<String>> {
    match session.stat(dir).await? {
        None => return Err(TransferError::remote_not_found(dir)),
        Some(meta) if !meta.is_dir => {
            return Err(TransferError::Config(format!("远端路径不是目录: {}", dir)))
        }
        Some(_) => {}
    }

    let mut files = Vec::new();
    let mut queue = VecDeque::from([dir.to_string()]);
    while let Some(current) = queue.pop_front() {
        for name in session.list(&current).await? {
            let path = remote_join(&current, &name);
            match session.stat(&path).await? {
                Some(meta) if meta.is_dir => queue.push_back(path),
                Some(_) => files.push(path),
                // 列出后被删除
                None => {}
            }
        }
    }
    files.sort();
    Ok(files)
}

/// 收集本地目录下的全部文件（已排序）
fn collect_local_files(root: &Path) -> TransferResultOf<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e
                .path()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| root.to_path_buf());
            match e.into_io_error() {
                Some(io) => TransferError::local_io(path, io),
                None => TransferError::Config(format!("目录遍历出现循环: {}", path.display())),
            }
        })?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ServerEntry, ServerProfile};
    use crate::error::ErrorKind;
    use crate::remote::LocalFsConnector;
    use crate::transfer::TransferOutcome;
    use std::time::Duration;
    use tempfile::TempDir;

    fn client(remote: &TempDir) -> TransferClient {
        let registry = ServerRegistry::from_profiles(vec![ServerProfile::resolve(
            "nas",
            &ServerEntry::new("localhost", "tester").with_password("pw"),
        )
        .unwrap()]);
        let connector = LocalFsConnector::new().with_mount("nas", remote.path());
        let mut config = TransferConfig::default();
        config.worker_count = 2;
        config.backoff_unit_ms = 1;
        config.pause_between_batches_ms = 0;
        TransferClient::new(registry, Arc::new(connector), config).unwrap()
    }

    fn options(client: &TransferClient) -> BatchOptions {
        let mut options = client.batch_options();
        options.pause_between_batches = Duration::ZERO;
        options
    }

    #[tokio::test]
    async fn test_is_connected() {
        let remote = TempDir::new().unwrap();
        let client = client(&remote);
        assert!(client.is_connected("nas").await);
        assert!(!client.is_connected("ghost").await);
    }

    #[tokio::test]
    async fn test_single_file_round_trip_into_directory() {
        let remote = TempDir::new().unwrap();
        let local = TempDir::new().unwrap();
        let client = client(&remote);

        let src = local.path().join("report.csv");
        std::fs::write(&src, b"a,b,c\n1,2,3\n").unwrap();
        let up = client.upload_file("nas", &src, "/inbox/").await.unwrap();
        assert_eq!(up.outcome, TransferOutcome::Success);
        assert!(remote.path().join("inbox/report.csv").exists());

        let out = TempDir::new().unwrap();
        let down = client
            .download_file("nas", "/inbox/report.csv", out.path())
            .await
            .unwrap();
        assert_eq!(down.outcome, TransferOutcome::Success);
        assert_eq!(
            std::fs::read(out.path().join("report.csv")).unwrap(),
            b"a,b,c\n1,2,3\n"
        );
    }

    #[tokio::test]
    async fn test_remote_operations() {
        let remote = TempDir::new().unwrap();
        let client = client(&remote);

        client.create_directory("nas", "/a/b/c").await.unwrap();
        assert!(remote.path().join("a/b/c").is_dir());

        std::fs::write(remote.path().join("a/b/x.txt"), b"x").unwrap();
        client.rename_file("nas", "/a/b/x.txt", "/a/y.txt").await.unwrap();
        assert_eq!(
            client.stat("nas", "/a/y.txt").await.unwrap().map(|m| m.size),
            Some(1)
        );
        assert_eq!(
            client.list_dir("nas", "/a").await.unwrap(),
            vec!["b".to_string(), "y.txt".to_string()]
        );

        client.remove_file("nas", "/a/y.txt").await.unwrap();
        assert!(client.stat("nas", "/a/y.txt").await.unwrap().is_none());

        let err = client.remove_file("nas", "/a/y.txt").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_directory_round_trip() {
        let remote = TempDir::new().unwrap();
        let local = TempDir::new().unwrap();
        let client = client(&remote);

        let src = local.path().join("src");
        std::fs::create_dir_all(src.join("sub/deeper")).unwrap();
        std::fs::write(src.join("top.txt"), b"top").unwrap();
        std::fs::write(src.join("sub/mid.txt"), b"mid").unwrap();
        std::fs::write(src.join("sub/deeper/low.txt"), b"low").unwrap();

        let report = client
            .upload_directory("nas", &src, "/backup", &options(&client))
            .await
            .unwrap();
        assert_eq!(report.counts(), (3, 3));

        let files = client.list_files_recursive("nas", "/backup").await.unwrap();
        assert_eq!(
            files,
            vec![
                "/backup/sub/deeper/low.txt".to_string(),
                "/backup/sub/mid.txt".to_string(),
                "/backup/top.txt".to_string(),
            ]
        );

        let dest = local.path().join("restored");
        let report = client
            .download_directory("nas", "/backup", &dest, &options(&client))
            .await
            .unwrap();
        assert_eq!(report.counts(), (3, 3));
        assert_eq!(std::fs::read(dest.join("sub/deeper/low.txt")).unwrap(), b"low");
    }

    #[tokio::test]
    async fn test_check_files_existence_keeps_order() {
        let remote = TempDir::new().unwrap();
        let client = client(&remote);
        for name in ["a", "c", "e"] {
            std::fs::write(remote.path().join(name), b"1").unwrap();
        }
        let remotes: Vec<String> = ["a", "b", "c", "d", "e"]
            .iter()
            .map(|n| format!("/{}", n))
            .collect();
        let dests: Vec<PathBuf> = ["la", "lb", "lc", "ld", "le"]
            .iter()
            .map(PathBuf::from)
            .collect();

        let report = client
            .check_files_existence("nas", &remotes, Some(&dests), &options(&client))
            .await
            .unwrap();
        assert_eq!(report.checked, 5);
        assert_eq!(report.existing, vec!["/a", "/c", "/e"]);
        assert_eq!(
            report.destinations,
            vec![PathBuf::from("la"), PathBuf::from("lc"), PathBuf::from("le")]
        );

        let err = client
            .check_files_existence("nas", &remotes, Some(&dests[..2]), &options(&client))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn test_shutdown_stops_maintenance() {
        let remote = TempDir::new().unwrap();
        let client = client(&remote);
        client.start_maintenance();
        client.start_maintenance();
        assert!(client.is_connected("nas").await);
        client.shutdown().await;
        assert!(!client.is_connected("nas").await);
    }
}

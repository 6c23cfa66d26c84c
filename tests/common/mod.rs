// 集成测试公共工具
#![allow(dead_code)]

use async_trait::async_trait;
use remote_transfer::remote::{RemoteReader, RemoteResult, RemoteWriter};
use remote_transfer::{
    LocalFsConnector, RemoteConnector, RemoteError, RemoteMetadata, RemoteSession, ServerEntry,
    ServerProfile, ServerRegistry, TransferClient, TransferConfig,
};
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, ReadBuf};

pub const SERVER: &str = "nas";

/// 可复现的测试数据
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + i / 251) % 251) as u8).collect()
}

pub fn registry() -> ServerRegistry {
    let entry = ServerEntry::new("localhost", "tester").with_password("secret");
    ServerRegistry::from_profiles(vec![ServerProfile::resolve(SERVER, &entry).unwrap()])
}

/// 测试用传输配置：退避单位 1ms，批间不停顿
pub fn fast_config() -> TransferConfig {
    let mut config = TransferConfig::default();
    config.worker_count = 2;
    config.batch_size = 4;
    config.backoff_unit_ms = 1;
    config.pause_between_batches_ms = 0;
    config
}

pub fn client_with(connector: Arc<dyn RemoteConnector>, config: TransferConfig) -> TransferClient {
    TransferClient::new(registry(), connector, config).unwrap()
}

pub fn local_client(remote_root: &Path) -> TransferClient {
    client_with(
        Arc::new(LocalFsConnector::new().with_mount(SERVER, remote_root)),
        fast_config(),
    )
}

/// 注入故障的连接器
///
/// `read_failures` / `write_failures` 为剩余的注入次数，所有会话共享；
/// `stream_failures` 次读取在传出 `stream_fail_after` 字节后断开；
/// `connects` 统计建立过的会话数。
pub struct FaultyConnector {
    inner: LocalFsConnector,
    pub read_failures: Arc<AtomicU32>,
    pub write_failures: Arc<AtomicU32>,
    pub stream_failures: Arc<AtomicU32>,
    stream_fail_after: usize,
    pub connects: Arc<AtomicU32>,
}

impl FaultyConnector {
    pub fn new(root: &Path) -> Self {
        Self {
            inner: LocalFsConnector::new().with_mount(SERVER, root),
            read_failures: Arc::new(AtomicU32::new(0)),
            write_failures: Arc::new(AtomicU32::new(0)),
            stream_failures: Arc::new(AtomicU32::new(0)),
            stream_fail_after: 0,
            connects: Arc::new(AtomicU32::new(0)),
        }
    }

    /// 前 `n` 次打开的读取流在传出 `after_bytes` 字节后断开
    pub fn fail_mid_stream(mut self, n: u32, after_bytes: usize) -> Self {
        self.stream_failures.store(n, Ordering::SeqCst);
        self.stream_fail_after = after_bytes;
        self
    }

    pub fn fail_reads(self, n: u32) -> Self {
        self.read_failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn fail_writes(self, n: u32) -> Self {
        self.write_failures.store(n, Ordering::SeqCst);
        self
    }
}

#[async_trait]
impl RemoteConnector for FaultyConnector {
    async fn connect(&self, profile: &ServerProfile) -> RemoteResult<Box<dyn RemoteSession>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.connect(profile).await?;
        Ok(Box::new(FaultySession {
            inner,
            read_failures: self.read_failures.clone(),
            write_failures: self.write_failures.clone(),
            stream_failures: self.stream_failures.clone(),
            stream_fail_after: self.stream_fail_after,
        }))
    }
}

struct FaultySession {
    inner: Box<dyn RemoteSession>,
    read_failures: Arc<AtomicU32>,
    write_failures: Arc<AtomicU32>,
    stream_failures: Arc<AtomicU32>,
    stream_fail_after: usize,
}

/// 传出固定字节数后返回连接重置的读取流
pub struct FailingReader {
    inner: RemoteReader,
    remaining: usize,
}

impl FailingReader {
    pub fn new(inner: RemoteReader, after_bytes: usize) -> Self {
        Self {
            inner,
            remaining: after_bytes,
        }
    }
}

impl AsyncRead for FailingReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.remaining == 0 {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "injected: stream reset",
            )));
        }
        let limit = self.remaining.min(buf.remaining());
        let mut chunk = vec![0u8; limit];
        let mut limited = ReadBuf::new(&mut chunk);
        match Pin::new(&mut self.inner).poll_read(cx, &mut limited) {
            Poll::Ready(Ok(())) => {
                let n = limited.filled().len();
                buf.put_slice(&chunk[..n]);
                self.remaining -= n;
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

fn take(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl RemoteSession for FaultySession {
    async fn stat(&mut self, path: &str) -> RemoteResult<Option<RemoteMetadata>> {
        self.inner.stat(path).await
    }

    async fn list(&mut self, dir: &str) -> RemoteResult<Vec<String>> {
        self.inner.list(dir).await
    }

    async fn open_read(&mut self, path: &str, offset: u64) -> RemoteResult<RemoteReader> {
        if take(&self.read_failures) {
            return Err(RemoteError::ConnectionReset(format!("injected: {}", path)));
        }
        let reader = self.inner.open_read(path, offset).await?;
        if take(&self.stream_failures) {
            return Ok(Box::new(FailingReader::new(reader, self.stream_fail_after)));
        }
        Ok(reader)
    }

    async fn open_write(&mut self, path: &str, append: bool) -> RemoteResult<RemoteWriter> {
        if take(&self.write_failures) {
            return Err(RemoteError::Timeout(format!("injected: {}", path)));
        }
        self.inner.open_write(path, append).await
    }

    async fn rename(&mut self, from: &str, to: &str) -> RemoteResult<()> {
        self.inner.rename(from, to).await
    }

    async fn remove(&mut self, path: &str) -> RemoteResult<()> {
        self.inner.remove(path).await
    }

    async fn mkdir(&mut self, path: &str) -> RemoteResult<()> {
        self.inner.mkdir(path).await
    }

    async fn noop(&mut self) -> RemoteResult<()> {
        self.inner.noop().await
    }

    async fn close(&mut self) -> RemoteResult<()> {
        self.inner.close().await
    }
}

/// 等待后台任务（例如异步关闭会话）完成
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

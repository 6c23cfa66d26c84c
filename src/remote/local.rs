// 本地目录后端
//
// 把每个服务器映射到一个本地根目录（挂载的共享目录、暂存区等），
// 通过与网络协议后端相同的能力接口访问。

use super::{
    RemoteConnector, RemoteError, RemoteMetadata, RemoteReader, RemoteResult, RemoteSession,
    RemoteWriter,
};
use crate::config::ServerProfile;
use async_trait::async_trait;
use dashmap::DashMap;
use std::io::{ErrorKind as IoErrorKind, SeekFrom};
use std::path::{Component, Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncSeekExt;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct Mount {
    root: PathBuf,
    password: Option<String>,
}

/// 本地目录连接器
#[derive(Debug, Default)]
pub struct LocalFsConnector {
    mounts: DashMap<String, Mount>,
}

impl LocalFsConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// 把服务器挂载到本地根目录
    pub fn with_mount(self, server: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        self.mounts.insert(
            server.into(),
            Mount {
                root: root.into(),
                password: None,
            },
        );
        self
    }

    /// 要求连接时提供指定密码，用于模拟认证
    pub fn require_password(self, server: &str, password: impl Into<String>) -> Self {
        if let Some(mut mount) = self.mounts.get_mut(server) {
            mount.password = Some(password.into());
        }
        self
    }

    /// 运行时追加挂载
    pub fn mount(&self, server: impl Into<String>, root: impl Into<PathBuf>) {
        self.mounts.insert(
            server.into(),
            Mount {
                root: root.into(),
                password: None,
            },
        );
    }

    fn mount_for(&self, profile: &ServerProfile) -> Option<Mount> {
        if let Some(mount) = self.mounts.get(&profile.name) {
            return Some(mount.clone());
        }
        // 未显式挂载时，绝对路径形式的 host 直接作为根目录
        let host = Path::new(&profile.host);
        if host.is_absolute() {
            return Some(Mount {
                root: host.to_path_buf(),
                password: None,
            });
        }
        None
    }
}

#[async_trait]
impl RemoteConnector for LocalFsConnector {
    async fn connect(&self, profile: &ServerProfile) -> RemoteResult<Box<dyn RemoteSession>> {
        let mount = self.mount_for(profile).ok_or_else(|| {
            RemoteError::Other(format!("服务器 {} 没有对应的本地目录", profile.name))
        })?;

        if let Some(expected) = &mount.password {
            if profile.credential.secret() != Some(expected.as_str()) {
                return Err(RemoteError::Auth(format!(
                    "{}@{} 密码错误",
                    profile.username, profile.name
                )));
            }
        }

        match fs::metadata(&mount.root).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(RemoteError::Other(format!(
                    "根路径不是目录: {}",
                    mount.root.display()
                )))
            }
            Err(e) => return Err(map_io(&mount.root.display().to_string(), e)),
        }

        debug!("本地目录会话已建立: {} -> {:?}", profile.name, mount.root);
        Ok(Box::new(LocalFsSession::new(mount.root)))
    }
}

/// 本地目录会话
#[derive(Debug)]
pub struct LocalFsSession {
    root: PathBuf,
    closed: bool,
}

impl LocalFsSession {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            closed: false,
        }
    }

    /// 远端路径 -> 本地路径，不允许跳出根目录
    fn resolve(&self, path: &str) -> RemoteResult<PathBuf> {
        if self.closed {
            return Err(RemoteError::ConnectionReset("会话已关闭".to_string()));
        }
        let relative = Path::new(path.trim_start_matches('/'));
        let mut resolved = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => return Err(RemoteError::PermissionDenied(path.to_string())),
            }
        }
        Ok(resolved)
    }
}

fn map_io(path: &str, err: std::io::Error) -> RemoteError {
    match err.kind() {
        IoErrorKind::NotFound => RemoteError::NotFound(path.to_string()),
        IoErrorKind::PermissionDenied => RemoteError::PermissionDenied(path.to_string()),
        _ => RemoteError::Io(err),
    }
}

#[async_trait]
impl RemoteSession for LocalFsSession {
    async fn stat(&mut self, path: &str) -> RemoteResult<Option<RemoteMetadata>> {
        let local = self.resolve(path)?;
        match fs::metadata(&local).await {
            Ok(meta) => Ok(Some(RemoteMetadata {
                size: meta.len(),
                is_dir: meta.is_dir(),
            })),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(None),
            Err(e) => Err(map_io(path, e)),
        }
    }

    async fn list(&mut self, dir: &str) -> RemoteResult<Vec<String>> {
        let local = self.resolve(dir)?;
        let mut entries = fs::read_dir(&local).await.map_err(|e| map_io(dir, e))?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| map_io(dir, e))? {
            let name = entry.file_name();
            match name.to_str() {
                Some(name) => names.push(name.to_string()),
                None => warn!("跳过非 UTF-8 文件名: {}/{:?}", dir, name),
            }
        }
        names.sort();
        Ok(names)
    }

    async fn open_read(&mut self, path: &str, offset: u64) -> RemoteResult<RemoteReader> {
        let local = self.resolve(path)?;
        let mut file = fs::File::open(&local).await.map_err(|e| map_io(path, e))?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset))
                .await
                .map_err(|e| map_io(path, e))?;
        }
        Ok(Box::new(file))
    }

    async fn open_write(&mut self, path: &str, append: bool) -> RemoteResult<RemoteWriter> {
        let local = self.resolve(path)?;
        let mut options = OpenOptions::new();
        options.create(true);
        if append {
            options.append(true);
        } else {
            options.write(true).truncate(true);
        }
        let file = options.open(&local).await.map_err(|e| map_io(path, e))?;
        Ok(Box::new(file))
    }

    async fn rename(&mut self, from: &str, to: &str) -> RemoteResult<()> {
        let src = self.resolve(from)?;
        let dst = self.resolve(to)?;
        fs::rename(&src, &dst).await.map_err(|e| map_io(from, e))
    }

    async fn remove(&mut self, path: &str) -> RemoteResult<()> {
        let local = self.resolve(path)?;
        fs::remove_file(&local).await.map_err(|e| map_io(path, e))
    }

    async fn mkdir(&mut self, path: &str) -> RemoteResult<()> {
        let local = self.resolve(path)?;
        match fs::create_dir(&local).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == IoErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(map_io(path, e)),
        }
    }

    async fn noop(&mut self) -> RemoteResult<()> {
        let root = self.resolve("/")?;
        fs::metadata(&root)
            .await
            .map(|_| ())
            .map_err(|e| RemoteError::ConnectionReset(format!("根目录不可用: {}", e)))
    }

    async fn close(&mut self) -> RemoteResult<()> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ServerEntry, ServerProfile};
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn profile(name: &str, password: &str) -> ServerProfile {
        ServerProfile::resolve(name, &ServerEntry::new("localhost", "tester").with_password(password))
            .unwrap()
    }

    #[tokio::test]
    async fn test_read_write_with_offset() {
        let dir = TempDir::new().unwrap();
        let connector = LocalFsConnector::new().with_mount("nas", dir.path());
        let mut session = connector.connect(&profile("nas", "x")).await.unwrap();

        let mut w = session.open_write("/a.txt", false).await.unwrap();
        w.write_all(b"hello ").await.unwrap();
        w.shutdown().await.unwrap();
        let mut w = session.open_write("/a.txt", true).await.unwrap();
        w.write_all(b"world").await.unwrap();
        w.shutdown().await.unwrap();

        let meta = session.stat("/a.txt").await.unwrap().unwrap();
        assert_eq!(meta.size, 11);
        assert!(!meta.is_dir);

        let mut r = session.open_read("/a.txt", 6).await.unwrap();
        let mut buf = String::new();
        r.read_to_string(&mut buf).await.unwrap();
        assert_eq!(buf, "world");
    }

    #[tokio::test]
    async fn test_stat_missing_is_none() {
        let dir = TempDir::new().unwrap();
        let mut session = LocalFsSession::new(dir.path());
        assert!(session.stat("/nope.bin").await.unwrap().is_none());
        assert!(matches!(
            session.open_read("/nope.bin", 0).await,
            Err(RemoteError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rename_replaces_and_list() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("x.part"), b"new").unwrap();
        std::fs::write(dir.path().join("x"), b"old-content").unwrap();

        let mut session = LocalFsSession::new(dir.path());
        session.rename("x.part", "x").await.unwrap();
        assert_eq!(std::fs::read(dir.path().join("x")).unwrap(), b"new");

        session.mkdir("/sub").await.unwrap();
        session.mkdir("/sub").await.unwrap();
        assert_eq!(
            session.list("/").await.unwrap(),
            vec!["sub".to_string(), "x".to_string()]
        );
    }

    #[tokio::test]
    async fn test_escape_root_rejected() {
        let dir = TempDir::new().unwrap();
        let mut session = LocalFsSession::new(dir.path());
        assert!(matches!(
            session.stat("../etc/passwd").await,
            Err(RemoteError::PermissionDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_auth_and_close() {
        let dir = TempDir::new().unwrap();
        let connector = LocalFsConnector::new()
            .with_mount("nas", dir.path())
            .require_password("nas", "right");

        let err = connector.connect(&profile("nas", "wrong")).await.err().unwrap();
        assert!(matches!(err, RemoteError::Auth(_)));

        let mut session = connector.connect(&profile("nas", "right")).await.unwrap();
        session.noop().await.unwrap();
        session.close().await.unwrap();
        assert!(matches!(
            session.noop().await,
            Err(RemoteError::ConnectionReset(_))
        ));
    }

    #[tokio::test]
    async fn test_unmounted_server() {
        let connector = LocalFsConnector::new();
        assert!(connector.connect(&profile("ghost", "x")).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_list_skips_non_utf8_names() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("ok.txt"), b"1").unwrap();
        let odd = dir.path().join(OsStr::from_bytes(b"bad\xff.bin"));
        if std::fs::write(&odd, b"2").is_err() {
            // 文件系统不接受非 UTF-8 文件名
            return;
        }

        let mut session = LocalFsSession::new(dir.path());
        assert_eq!(session.list("/").await.unwrap(), vec!["ok.txt".to_string()]);
    }
}

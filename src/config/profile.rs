// 服务器配置注册表
//
// 配置文件里的 ServerEntry 在构造时一次性解析为不可变的 ServerProfile，
// 认证方式在此处确定，之后不再读取环境变量。

use crate::error::{TransferError, TransferResultOf};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// 配置文件中的服务器条目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEntry {
    /// 主机地址
    pub host: String,
    /// 端口（默认 22）
    #[serde(default = "default_port")]
    pub port: u16,
    /// 用户名
    #[serde(default)]
    pub username: String,
    /// 连接超时（秒，默认 30）
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// 心跳间隔（秒，默认 30）
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    /// 明文密码
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// 从环境变量读取密码
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,
    /// 私钥路径
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<PathBuf>,
    /// 私钥密码
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
    /// 从环境变量读取私钥密码
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase_env: Option<String>,
}

fn default_port() -> u16 {
    22
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_keepalive_secs() -> u64 {
    30
}

impl ServerEntry {
    /// 以默认端口与超时构造一个条目
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            username: username.into(),
            timeout_secs: default_timeout_secs(),
            keepalive_secs: default_keepalive_secs(),
            password: None,
            password_env: None,
            private_key: None,
            passphrase: None,
            passphrase_env: None,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_password_env(mut self, var: impl Into<String>) -> Self {
        self.password_env = Some(var.into());
        self
    }

    pub fn with_private_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.private_key = Some(path.into());
        self
    }
}

/// 认证方式
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// 明文密码
    Password(String),
    /// 从环境变量解析出的密码
    PasswordEnv { var: String, value: String },
    /// 私钥 + 可选私钥密码
    PrivateKey {
        path: PathBuf,
        passphrase: Option<String>,
    },
}

impl Credential {
    /// 密码类认证的口令
    pub fn secret(&self) -> Option<&str> {
        match self {
            Credential::Password(p) => Some(p),
            Credential::PasswordEnv { value, .. } => Some(value),
            Credential::PrivateKey { .. } => None,
        }
    }
}

// 🔥 日志里不能出现密码
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Password(_) => f.write_str("Password(***)"),
            Credential::PasswordEnv { var, .. } => {
                f.debug_struct("PasswordEnv").field("var", var).finish()
            }
            Credential::PrivateKey { path, passphrase } => f
                .debug_struct("PrivateKey")
                .field("path", path)
                .field("passphrase", &passphrase.as_ref().map(|_| "***"))
                .finish(),
        }
    }
}

/// 解析完成的服务器连接参数（构造后不可变）
#[derive(Debug, Clone)]
pub struct ServerProfile {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub credential: Credential,
    pub timeout: Duration,
    pub keepalive: Duration,
}

impl ServerProfile {
    /// 从配置条目解析
    pub fn resolve(name: &str, entry: &ServerEntry) -> TransferResultOf<Self> {
        if entry.host.trim().is_empty() {
            return Err(TransferError::Config(format!("服务器 '{}' 缺少 host", name)));
        }
        if entry.username.trim().is_empty() {
            return Err(TransferError::Config(format!(
                "服务器 '{}' 缺少 username",
                name
            )));
        }

        let credential = resolve_credential(name, entry)?;

        Ok(Self {
            name: name.to_string(),
            host: entry.host.clone(),
            port: entry.port,
            username: entry.username.clone(),
            credential,
            timeout: Duration::from_secs(entry.timeout_secs),
            keepalive: Duration::from_secs(entry.keepalive_secs),
        })
    }

    /// host:port
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// 解析认证方式
///
/// 优先级：私钥 > 环境变量密码 > 明文密码。
/// 环境变量未设置且没有明文密码兜底时视为配置错误。
fn resolve_credential(name: &str, entry: &ServerEntry) -> TransferResultOf<Credential> {
    if let Some(path) = &entry.private_key {
        let mut passphrase = entry.passphrase.clone();
        if let Some(var) = &entry.passphrase_env {
            match std::env::var(var) {
                Ok(value) => {
                    info!("配置 '{}' 从环境变量获取私钥密码: {}", name, var);
                    passphrase = Some(value);
                }
                Err(_) if passphrase.is_some() => {
                    warn!("配置 '{}' 环境变量 '{}' 未设置，使用配置中的私钥密码", name, var);
                }
                Err(_) => {
                    return Err(TransferError::Config(format!(
                        "服务器 '{}' 的私钥密码环境变量 '{}' 未设置",
                        name, var
                    )));
                }
            }
        }
        return Ok(Credential::PrivateKey {
            path: path.clone(),
            passphrase,
        });
    }

    if let Some(var) = &entry.password_env {
        match std::env::var(var) {
            Ok(value) => {
                info!("配置 '{}' 从环境变量获取密码: {}", name, var);
                return Ok(Credential::PasswordEnv {
                    var: var.clone(),
                    value,
                });
            }
            Err(_) if entry.password.is_some() => {
                warn!("配置 '{}' 环境变量 '{}' 未设置，使用配置中的密码", name, var);
            }
            Err(_) => {
                return Err(TransferError::Config(format!(
                    "服务器 '{}' 的密码环境变量 '{}' 未设置",
                    name, var
                )));
            }
        }
    }

    match &entry.password {
        Some(password) => Ok(Credential::Password(password.clone())),
        None => Err(TransferError::Config(format!(
            "服务器 '{}' 缺少认证方式: password、password_env 或 private_key",
            name
        ))),
    }
}

/// 服务器注册表：逻辑名称 -> 连接参数
#[derive(Debug, Clone, Default)]
pub struct ServerRegistry {
    profiles: HashMap<String, Arc<ServerProfile>>,
}

impl ServerRegistry {
    /// 从配置解析全部服务器，任何一个条目不合法都整体失败
    pub fn from_config(servers: &BTreeMap<String, ServerEntry>) -> TransferResultOf<Self> {
        let mut profiles = HashMap::with_capacity(servers.len());
        for (name, entry) in servers {
            let profile = ServerProfile::resolve(name, entry)?;
            profiles.insert(name.clone(), Arc::new(profile));
        }
        info!("已加载 {} 个服务器配置", profiles.len());
        Ok(Self { profiles })
    }

    /// 直接由已解析的配置构造
    pub fn from_profiles(profiles: impl IntoIterator<Item = ServerProfile>) -> Self {
        Self {
            profiles: profiles
                .into_iter()
                .map(|p| (p.name.clone(), Arc::new(p)))
                .collect(),
        }
    }

    /// 查找服务器，未知名称为配置错误
    pub fn get(&self, name: &str) -> TransferResultOf<Arc<ServerProfile>> {
        self.profiles
            .get(name)
            .cloned()
            .ok_or_else(|| TransferError::Config(format!("未知的服务器: {}", name)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.profiles.contains_key(name)
    }

    /// 所有服务器名称（已排序）
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.profiles.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

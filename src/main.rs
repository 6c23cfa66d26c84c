use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use remote_transfer::config::{AppConfig, LogConfig, DEFAULT_CONFIG_PATH};
use remote_transfer::{
    logging, BatchOptions, BatchReport, Destinations, LocalFsConnector, ProgressEvent,
    TransferClient,
};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};

/// 可断点续传的并发文件传输工具
///
/// 内置后端把每个服务器映射到一个本地目录（挂载的共享盘、暂存区）：
/// 服务器的 host 为绝对路径时，以该目录作为远端根目录。
#[derive(Debug, Parser)]
#[command(name = "remote-transfer", version, about)]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// 服务器名称（只配置了一个服务器时可省略）
    #[arg(short, long, global = true)]
    server: Option<String>,

    /// 并发 worker 数
    #[arg(short, long, global = true)]
    workers: Option<usize>,

    /// 每批任务数
    #[arg(long, global = true)]
    batch_size: Option<usize>,

    /// 最多传输的文件数
    #[arg(long, global = true)]
    max_count: Option<usize>,

    /// 按固定种子打乱任务顺序
    #[arg(long, global = true)]
    shuffle: bool,

    /// 以 JSON 输出结果
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// 下载远端文件到本地目录
    Download {
        /// 远端文件（--recursive 时为单个远端目录）
        #[arg(required = true)]
        remote: Vec<String>,
        /// 本地目标目录
        #[arg(short = 'o', long)]
        dest: PathBuf,
        /// 递归下载目录
        #[arg(short, long)]
        recursive: bool,
    },
    /// 上传本地文件到远端目录
    Upload {
        /// 本地文件（--recursive 时为单个本地目录）
        #[arg(required = true)]
        local: Vec<PathBuf>,
        /// 远端目标目录
        #[arg(short = 'o', long)]
        dest: String,
        /// 递归上传目录
        #[arg(short, long)]
        recursive: bool,
    },
    /// 列出远端目录
    List {
        dir: String,
        /// 递归列出全部文件
        #[arg(short, long)]
        recursive: bool,
    },
    /// 检查远端文件是否存在
    Check {
        #[arg(required = true)]
        remote: Vec<String>,
    },
}

#[derive(Debug, Serialize)]
struct Listing<'a> {
    server: &'a str,
    dir: &'a str,
    entries: Vec<String>,
}

/// 只读取配置文件中的日志部分，失败时使用默认值
async fn load_log_config(path: &str) -> LogConfig {
    if let Ok(content) = tokio::fs::read_to_string(path).await {
        if let Ok(config) = toml::from_str::<toml::Value>(&content) {
            if let Some(log_table) = config.get("log") {
                if let Ok(log_config) = log_table.clone().try_into::<LogConfig>() {
                    return log_config;
                }
            }
        }
    }
    LogConfig::default()
}

fn resolve_server(cli: &Cli, config: &AppConfig) -> Result<String> {
    if let Some(server) = &cli.server {
        return Ok(server.clone());
    }
    let mut names = config.servers.keys();
    match (names.next(), names.next()) {
        (Some(only), None) => Ok(only.clone()),
        (None, _) => bail!("配置文件中没有任何服务器"),
        _ => bail!(
            "配置了多个服务器，请用 --server 指定: {:?}",
            config.servers.keys().collect::<Vec<_>>()
        ),
    }
}

fn batch_options(cli: &Cli, client: &TransferClient) -> BatchOptions {
    let mut options = client
        .batch_options()
        .with_max_transfer_count(cli.max_count)
        .with_shuffle(cli.shuffle);
    if let Some(workers) = cli.workers {
        options = options.with_workers(workers);
    }
    if let Some(batch_size) = cli.batch_size {
        options = options.with_batch_size(batch_size);
    }
    options
}

fn print_report(report: &BatchReport, json: bool) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(report).context("序列化传输结果失败")?
        );
        return Ok(());
    }
    for result in &report.results {
        let line = format!(
            "[{}] {:?} {}",
            result.index(),
            result.outcome,
            result.task.label()
        );
        match &result.error {
            Some(error) => println!("{}: {}", line, error),
            None => println!("{}", line),
        }
    }
    println!(
        "完成: 成功 {}/{} (跳过 {})，失败 {}，传输 {} 字节，耗时 {} ms",
        report.succeeded,
        report.total,
        report.skipped,
        report.failed,
        report.bytes_transferred,
        report.elapsed_ms
    );
    Ok(())
}

async fn run(cli: &Cli, client: &TransferClient, server: &str) -> Result<bool> {
    let options = batch_options(cli, client);
    match &cli.command {
        Command::Download {
            remote,
            dest,
            recursive,
        } => {
            let report = if *recursive {
                let [dir] = remote.as_slice() else {
                    bail!("--recursive 只接受一个远端目录");
                };
                client.download_directory(server, dir, dest, &options).await?
            } else {
                client
                    .download_file_list(server, remote, &Destinations::Directory(dest.clone()), &options)
                    .await?
            };
            print_report(&report, cli.json)?;
            Ok(report.all_succeeded())
        }
        Command::Upload {
            local,
            dest,
            recursive,
        } => {
            let report = if *recursive {
                let [dir] = local.as_slice() else {
                    bail!("--recursive 只接受一个本地目录");
                };
                client.upload_directory(server, dir, dest, &options).await?
            } else {
                client
                    .upload_file_list(server, local, &Destinations::Directory(dest.clone()), &options)
                    .await?
            };
            print_report(&report, cli.json)?;
            Ok(report.all_succeeded())
        }
        Command::List { dir, recursive } => {
            let entries = if *recursive {
                client.list_files_recursive(server, dir).await?
            } else {
                client.list_dir(server, dir).await?
            };
            if cli.json {
                let listing = Listing { server, dir, entries };
                println!("{}", serde_json::to_string_pretty(&listing)?);
            } else {
                for entry in entries {
                    println!("{}", entry);
                }
            }
            Ok(true)
        }
        Command::Check { remote } => {
            let report = client
                .check_files_existence(server, remote, None, &options)
                .await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                for path in &report.existing {
                    println!("{}", path);
                }
                println!("存在 {}/{}", report.existing.len(), report.checked);
            }
            Ok(report.existing.len() == report.checked)
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // 🔥 先加载日志配置，必须保持 _log_guard 存活
    let log_config = load_log_config(&cli.config).await;
    let _log_guard = logging::init_logging(&log_config);

    info!("remote-transfer v{} 启动中...", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::load_or_default(&cli.config).await;
    let server = resolve_server(&cli, &config)?;

    let client = TransferClient::from_app_config(&config, Arc::new(LocalFsConnector::new()))
        .context("初始化传输客户端失败")?
        .with_observer(Arc::new(|event: ProgressEvent| {
            if let ProgressEvent::TaskFinished {
                completed,
                total,
                label,
                success,
                ..
            } = event
            {
                if success {
                    info!("[{}/{}] {} 完成", completed, total, label);
                } else {
                    warn!("[{}/{}] {} 失败", completed, total, label);
                }
            }
        }));
    client.start_maintenance();

    let outcome = run(&cli, &client, &server).await;
    client.shutdown().await;

    match outcome? {
        true => Ok(ExitCode::SUCCESS),
        false => Ok(ExitCode::FAILURE),
    }
}

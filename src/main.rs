use anyhow::Context;
use clap::Parser;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use upload_orchestrator::{
    config::DEFAULT_CONFIG_PATH, logging, AppConfig, HttpTransport, ItemState, TransportAdapter,
    UploadEvent, UploadManager, UploadNotification,
};

/// 命令行参数
#[derive(Parser, Debug)]
#[command(name = "upload-orchestrator")]
#[command(version, about = "多文件并发上传", long_about = None)]
struct Cli {
    /// 配置文件路径
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 上传接口地址（覆盖配置文件）
    #[arg(short, long)]
    endpoint: Option<String>,

    /// 最大同时上传文件数（覆盖配置文件）
    #[arg(long)]
    max_concurrent: Option<usize>,

    /// 每个文件最大尝试次数（覆盖配置文件）
    #[arg(long)]
    max_attempts: Option<u32>,

    /// 待上传的文件
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

/// 加载配置：显式指定的配置文件必须可用，默认路径加载失败时使用默认配置
async fn load_config(cli: &Cli) -> anyhow::Result<AppConfig> {
    let mut config = match &cli.config {
        Some(path) => AppConfig::load_from_file(path).await?,
        None => AppConfig::load_or_default(DEFAULT_CONFIG_PATH).await,
    };

    if let Some(endpoint) = &cli.endpoint {
        config.transport.endpoint = endpoint.clone();
    }
    if let Some(max_concurrent) = cli.max_concurrent {
        config.upload.max_concurrent = max_concurrent;
    }
    if let Some(max_attempts) = cli.max_attempts {
        config.upload.max_attempts = max_attempts;
    }
    config.upload.validate().context("上传配置无效")?;

    Ok(config)
}

/// 把通知写入日志
async fn log_notifications(mut events: broadcast::Receiver<UploadNotification>) {
    loop {
        let notification = match events.recv().await {
            Ok(notification) => notification,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("通知处理过慢，跳过 {} 条", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let progress = notification.aggregate;
        match notification.event {
            UploadEvent::Succeeded { item_id, url } => {
                info!(
                    "✓ 上传成功: {} -> {} (总进度 {}%)",
                    item_id, url, progress.overall_percent
                );
            }
            UploadEvent::Retrying {
                item_id,
                attempt,
                error,
                ..
            } => {
                warn!("第 {} 次上传失败，准备重试: {}, {}", attempt, item_id, error);
            }
            UploadEvent::Failed {
                item_id, error, ..
            } => {
                warn!("✗ 上传失败: {}, {}", item_id, error);
            }
            UploadEvent::BatchCompleted {
                succeeded,
                failed,
                cancelled,
                ..
            } => {
                info!(
                    "批次完成: 成功 {}, 失败 {}, 取消 {}",
                    succeeded.len(),
                    failed.len(),
                    cancelled.len()
                );
            }
            _ => {}
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli).await?;

    // 必须保持 _log_guard 存活
    let _log_guard = logging::init_logging(&config.log);

    info!(
        "Upload Orchestrator v{} 启动: {} 个文件 -> {}",
        env!("CARGO_PKG_VERSION"),
        cli.files.len(),
        config.transport.endpoint
    );

    let transport: Arc<dyn TransportAdapter<PathBuf>> =
        Arc::new(HttpTransport::new(config.transport.clone())?);
    let manager = UploadManager::new(&config.upload, transport)?;
    tokio::spawn(log_notifications(manager.subscribe()));

    let handle = manager.submit(cli.files.clone())?;

    let snapshot = tokio::select! {
        snapshot = manager.wait_idle() => snapshot?,
        _ = tokio::signal::ctrl_c() => {
            warn!("收到中断信号，取消所有上传");
            manager.cancel_all()?;
            manager.wait_idle().await?
        }
    };

    let mut succeeded = Vec::new();
    let mut failed = Vec::new();
    let mut cancelled = Vec::new();
    for item in snapshot
        .items
        .iter()
        .filter(|item| item.batch_id == handle.batch_id)
    {
        match item.state {
            ItemState::Succeeded => succeeded.push(json!({
                "item_id": item.id,
                "path": item.payload,
                "url": item.result_url,
                "attempts": item.attempt_count,
            })),
            ItemState::Failed => failed.push(json!({
                "item_id": item.id,
                "path": item.payload,
                "error": item.last_error,
                "attempts": item.attempt_count,
            })),
            _ => cancelled.push(json!({
                "item_id": item.id,
                "path": item.payload,
            })),
        }
    }

    let unfinished = failed.len() + cancelled.len();
    let summary = json!({
        "batch_id": handle.batch_id,
        "aggregate": snapshot.aggregate,
        "succeeded": succeeded,
        "failed": failed,
        "cancelled": cancelled,
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&summary).context("序列化上传结果失败")?
    );

    manager.shutdown().await;

    if unfinished > 0 {
        anyhow::bail!("{} 个文件未能上传", unfinished);
    }
    Ok(())
}

use anyhow::{bail, Context, Result};
use clap::Parser;
use large_upload_rust::{
    config::{AppConfig, DEFAULT_CONFIG_PATH},
    logging, ProgressCallback, ProgressEvent, UploadBatch, UploadStatus,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// 可断点续传的分片上传工具
#[derive(Parser, Debug)]
#[command(name = "large-upload-rust", version)]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// 服务端地址（覆盖配置文件）
    #[arg(long)]
    base_url: Option<String>,

    /// 分片大小，单位字节（覆盖配置文件）
    #[arg(long)]
    chunk_size: Option<u64>,

    /// 使用小文件直传模式
    #[arg(long)]
    direct: bool,

    /// 要上传的文件或目录（目录递归展开）
    #[arg(required = true)]
    paths: Vec<PathBuf>,
}

/// 展开输入路径：目录递归收集普通文件，文件原样保留
fn expand_paths(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for input in inputs {
        if input.is_dir() {
            for entry in WalkDir::new(input).sort_by_file_name() {
                let entry = entry.with_context(|| format!("遍历目录失败: {:?}", input))?;
                if entry.file_type().is_file() {
                    files.push(entry.into_path());
                }
            }
        } else {
            files.push(input.clone());
        }
    }
    Ok(files)
}

/// 进度日志回调
fn progress_logger() -> ProgressCallback {
    Arc::new(|event: ProgressEvent| {
        let name = &event.file().name;
        match event.status() {
            UploadStatus::Uploading => debug!("{} 上传中 {}%", name, event.percentage()),
            UploadStatus::Done => info!("✓ {} 上传完成", name),
            UploadStatus::Paused => warn!("⏸ {} 已暂停 ({}%)", name, event.percentage()),
            UploadStatus::Error => error!("❌ {} 上传失败", name),
            status => debug!("{} {}", name, status),
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load_or_default(&cli.config).await;
    if let Some(base_url) = cli.base_url {
        config.request.base_url = base_url;
    }
    if let Some(chunk_size) = cli.chunk_size {
        config.upload.chunk_size = chunk_size;
    }
    if cli.direct {
        config.upload.large_file_mode = false;
    }

    let _log_guard = logging::init_logging(&config.log);

    info!("Large Upload Rust v{}", env!("CARGO_PKG_VERSION"));
    info!("服务端地址: {}", config.request.base_url);

    let files = expand_paths(&cli.paths)?;
    if files.is_empty() {
        bail!("没有需要上传的文件");
    }

    let batch = Arc::new(UploadBatch::from_config(&config).context("创建上传批次失败")?);

    // Ctrl-C: 整体暂停，等待所有会话结束后退出
    let brake = batch.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("收到中断信号，暂停所有上传");
            brake.pause_all();
        }
    });

    let outcomes = batch
        .start_upload(&files, Some(progress_logger()))
        .await
        .context("上传失败")?;

    if let Err(e) = batch.flush_progress() {
        warn!("保存上传进度失败: {}", e);
    }

    let mut unfinished = 0;
    for outcome in &outcomes {
        match &outcome.result {
            Ok(snapshot) if snapshot.status == UploadStatus::Done => {
                info!("{:?}: 完成 (hash={})", outcome.path, snapshot.hash.as_deref().unwrap_or("-"));
            }
            Ok(snapshot) => {
                unfinished += 1;
                warn!("{:?}: {} ({}%)", outcome.path, snapshot.status, snapshot.percentage);
            }
            Err(e) => {
                unfinished += 1;
                error!("{:?}: {}", outcome.path, e);
            }
        }
    }

    if unfinished > 0 {
        bail!("{} / {} 个文件未完成上传", unfinished, outcomes.len());
    }

    info!("全部 {} 个文件上传完成", outcomes.len());
    Ok(())
}

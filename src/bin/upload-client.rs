// 上传客户端
//
// 上传单个文件到接收端；Ctrl+C 暂停，再次运行同一文件时只补传缺失的分片

use anyhow::{Context, Result};
use chunk_upload_rust::{
    config::{load_log_config, DEFAULT_CONFIG_PATH},
    logging,
    uploader::{UploadEvent, UploadTaskStatus},
    AppConfig, FingerprintMode, HttpChunkTransport, SessionConfig, UploadSession,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "upload-client")]
#[command(about = "可续传的分片上传客户端", long_about = None)]
struct Cli {
    /// 要上传的文件
    file: PathBuf,
    /// 接收端地址（默认取配置文件 upload.server_url）
    #[arg(long)]
    server: Option<String>,
    /// 分片大小 (MB)
    #[arg(long)]
    chunk_size_mb: Option<u64>,
    /// 最大并发分片数
    #[arg(long)]
    concurrency: Option<usize>,
    /// 使用完整内容 MD5 作为指纹
    #[arg(long)]
    full_hash: bool,
    /// 配置文件路径
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = load_log_config(&cli.config).await;
    let _log_guard = logging::init_logging(&log_config);

    // 配置文件不存在时使用默认值，客户端不回写配置
    let mut upload_config = match AppConfig::load_from_file(&cli.config).await {
        Ok(config) => config.upload,
        Err(e) => {
            warn!("读取配置失败，使用默认上传配置: {:#}", e);
            AppConfig::default().upload
        }
    };
    if let Some(server) = cli.server {
        upload_config.server_url = server;
    }
    if let Some(chunk_size_mb) = cli.chunk_size_mb {
        upload_config.chunk_size_mb = chunk_size_mb;
    }
    if let Some(concurrency) = cli.concurrency {
        upload_config.max_concurrent_chunks = concurrency;
    }
    if cli.full_hash {
        upload_config.fingerprint_mode = FingerprintMode::Full;
    }
    upload_config.validate().context("上传参数不合法")?;

    let transport = Arc::new(
        HttpChunkTransport::new(&upload_config.server_url).context("创建 HTTP 客户端失败")?,
    );
    let mut session = UploadSession::new(
        &cli.file,
        transport,
        SessionConfig::from(&upload_config),
    )?;
    let mut events = session.subscribe();
    let session = Arc::new(session);

    info!(
        "开始上传: {:?} -> {} (分片 {}MB, 并发 {})",
        cli.file,
        upload_config.server_url,
        upload_config.chunk_size_mb,
        upload_config.max_concurrent_chunks
    );

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                UploadEvent::Progress { percent, .. } => info!("上传进度: {}%", percent),
                UploadEvent::StatusChanged { status, error, .. } => match error {
                    Some(error) => info!("任务状态: {:?} ({})", status, error),
                    None => info!("任务状态: {:?}", status),
                },
            }
        }
    });

    let pauser = session.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("收到 Ctrl+C，暂停上传...");
            pauser.pause();
        }
    });

    match session.start().await {
        Ok(UploadTaskStatus::Done) => {
            let task = session.snapshot();
            if task.is_rapid_upload {
                info!("🚀 秒传成功: {}", task.name);
            } else {
                info!("✓ 上传完成: {}", task.name);
            }
            Ok(())
        }
        Ok(UploadTaskStatus::Paused) => {
            let task = session.snapshot();
            info!(
                "上传已暂停 ({}%)，重新运行同一命令即可续传",
                task.percent
            );
            Ok(())
        }
        Ok(status) => {
            warn!("上传结束，状态: {:?}", status);
            Ok(())
        }
        Err(e) => {
            error!("上传失败: {}", e);
            Err(e.into())
        }
    }
}

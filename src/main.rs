use chunk_upload_rust::{
    build_router,
    config::{load_log_config, DEFAULT_CONFIG_PATH},
    logging, AppConfig, AppState,
};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 🔥 先尝试加载日志配置，失败时使用默认配置
    let log_config = load_log_config(DEFAULT_CONFIG_PATH).await;

    // 🔥 初始化日志系统（必须保持 _log_guard 存活）
    let _log_guard = logging::init_logging(&log_config);

    info!("Chunk Upload Server v{} 启动中...", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::load_or_default(DEFAULT_CONFIG_PATH).await;
    tokio::fs::create_dir_all(&config.storage.upload_dir).await?;

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let upload_dir = config.storage.upload_dir.clone();
    let app = build_router(AppState::new(config));

    info!("服务器启动在: http://{}", addr);
    info!("上传目录: {:?}", upload_dir);
    info!("健康检查: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;

    // 🔥 使用 select! 监听关闭信号，支持优雅关闭
    let server = axum::serve(listener, app);

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                tracing::error!("服务器错误: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("收到 Ctrl+C，开始优雅关闭...");
        }
    }

    info!("应用已安全退出");
    Ok(())
}

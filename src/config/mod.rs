// 配置管理模块

use crate::uploader::FingerprintMode;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "config/app.toml";

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// 服务器配置
    #[serde(default)]
    pub server: ServerConfig,
    /// 上传配置（客户端）
    #[serde(default)]
    pub upload: UploadConfig,
    /// 存储配置（接收端）
    #[serde(default)]
    pub storage: StorageConfig,
    /// 🔥 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 监听地址
    #[serde(default = "default_server_host")]
    pub host: String,
    /// 监听端口
    #[serde(default = "default_server_port")]
    pub port: u16,
    /// CORS允许的源（为空表示允许任意来源）
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

fn default_server_host() -> String {
    "0.0.0.0".to_string()
}

fn default_server_port() -> u16 {
    3000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
            cors_origins: Vec::new(),
        }
    }
}

/// 上传配置（客户端会话使用）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 接收端服务地址
    #[serde(default = "default_server_url")]
    pub server_url: String,
    /// 分片大小 (MB)
    #[serde(default = "default_chunk_size_mb")]
    pub chunk_size_mb: u64,
    /// 单文件最大并发分片数
    #[serde(default = "default_max_concurrent_chunks")]
    pub max_concurrent_chunks: usize,
    /// 单分片最大重试次数（不含首次尝试）
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 指纹计算方式
    #[serde(default)]
    pub fingerprint_mode: FingerprintMode,
}

fn default_server_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_chunk_size_mb() -> u64 {
    10
}

fn default_max_concurrent_chunks() -> usize {
    crate::uploader::DEFAULT_MAX_CONCURRENT_CHUNKS
}

fn default_max_retries() -> u32 {
    crate::uploader::DEFAULT_MAX_RETRIES
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            chunk_size_mb: default_chunk_size_mb(),
            max_concurrent_chunks: default_max_concurrent_chunks(),
            max_retries: default_max_retries(),
            fingerprint_mode: FingerprintMode::default(),
        }
    }
}

impl UploadConfig {
    /// 分片大小（字节）
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size_mb * 1024 * 1024
    }

    /// 校验上传配置
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size_mb == 0 {
            anyhow::bail!("分片大小必须大于 0");
        }
        if self.max_concurrent_chunks == 0 {
            anyhow::bail!("最大并发分片数必须大于 0");
        }
        Ok(())
    }
}

/// 存储配置（接收端）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// 上传根目录（分片暂存目录和合并后的文件都位于此处）
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,
    /// 合并时并发写入的分片数
    #[serde(default = "default_merge_concurrency")]
    pub merge_concurrency: usize,
    /// 单个分片请求体上限 (MB)
    #[serde(default = "default_max_chunk_body_mb")]
    pub max_chunk_body_mb: usize,
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("target")
}

fn default_merge_concurrency() -> usize {
    crate::storage::DEFAULT_MERGE_CONCURRENCY
}

fn default_max_chunk_body_mb() -> usize {
    64
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upload_dir: default_upload_dir(),
            merge_concurrency: default_merge_concurrency(),
            max_chunk_body_mb: default_max_chunk_body_mb(),
        }
    }
}

impl StorageConfig {
    /// 分片请求体上限（字节）
    pub fn max_chunk_body_bytes(&self) -> usize {
        self.max_chunk_body_mb * 1024 * 1024
    }

    /// 校验存储配置
    pub fn validate(&self) -> Result<()> {
        if self.merge_concurrency == 0 {
            anyhow::bail!("合并并发数必须大于 0");
        }
        if self.max_chunk_body_mb == 0 {
            anyhow::bail!("分片请求体上限必须大于 0");
        }
        Ok(())
    }
}

/// 加载日志配置
///
/// 日志系统需要在完整配置之前初始化，只读取 [log] 段，失败时返回默认配置
pub async fn load_log_config(path: &str) -> LogConfig {
    if let Ok(content) = fs::read_to_string(path).await {
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

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        config.validate().context("配置文件校验失败")?;

        Ok(config)
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        self.upload.validate()?;
        self.storage.validate()?;
        Ok(())
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.validate().context("保存配置失败：配置校验未通过")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);

        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();

                // 尝试保存默认配置
                if let Err(e) = default_config.save_to_file(path).await {
                    tracing::error!("保存默认配置失败: {}", e);
                }

                default_config
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.upload.chunk_size(), 10 * 1024 * 1024);
        assert_eq!(config.upload.max_concurrent_chunks, 4);
        assert_eq!(config.upload.max_retries, 3);
        assert_eq!(config.upload.fingerprint_mode, FingerprintMode::Sampled);
        assert_eq!(config.storage.upload_dir, PathBuf::from("target"));
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap();

        let mut config = AppConfig::default();
        config.upload.chunk_size_mb = 2;
        config.upload.fingerprint_mode = FingerprintMode::Full;
        config.save_to_file(path).await.unwrap();

        let loaded = AppConfig::load_from_file(path).await.unwrap();
        assert_eq!(loaded.server.port, config.server.port);
        assert_eq!(loaded.upload.chunk_size_mb, 2);
        assert_eq!(loaded.upload.fingerprint_mode, FingerprintMode::Full);
    }

    #[tokio::test]
    async fn test_partial_file_uses_defaults() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap();
        std::fs::write(path, "[server]\nport = 8080\n").unwrap();

        let loaded = AppConfig::load_from_file(path).await.unwrap();
        assert_eq!(loaded.server.port, 8080);
        assert_eq!(loaded.server.host, "0.0.0.0");
        assert_eq!(loaded.upload.max_retries, 3);
        assert!(loaded.log.enabled);
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        assert!(config.validate().is_ok());

        config.upload.chunk_size_mb = 0;
        assert!(config.validate().is_err());

        config.upload.chunk_size_mb = 10;
        config.upload.max_concurrent_chunks = 0;
        assert!(config.validate().is_err());

        config.upload.max_concurrent_chunks = 4;
        config.storage.merge_concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_load_or_default_writes_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config").join("app.toml");
        let path_str = path.to_str().unwrap();

        let config = AppConfig::load_or_default(path_str).await;
        assert_eq!(config.server.port, 3000);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_load_log_config_reads_log_section() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(
            file.path(),
            "[log]\nenabled = false\nlevel = \"debug\"\n\n[server]\nport = 4000\n",
        )
        .unwrap();

        let log = load_log_config(file.path().to_str().unwrap()).await;
        assert!(!log.enabled);
        assert_eq!(log.level, "debug");

        let missing = load_log_config("/nonexistent/app.toml").await;
        assert!(missing.enabled);
    }
}

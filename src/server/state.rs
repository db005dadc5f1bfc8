// 应用状态

use crate::config::AppConfig;
use crate::storage::ChunkStore;
use std::sync::Arc;

/// 应用全局状态
#[derive(Clone)]
pub struct AppState {
    /// 应用配置
    pub config: Arc<AppConfig>,
    /// 分片存储
    pub chunk_store: ChunkStore,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        let chunk_store = ChunkStore::new(config.storage.upload_dir.clone());
        Self {
            config: Arc::new(config),
            chunk_store,
        }
    }
}

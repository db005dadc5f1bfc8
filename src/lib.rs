// Chunk Upload Rust Library
// 可续传、分片、内容去重的文件上传核心库

// 配置管理模块
pub mod config;

// 日志模块
pub mod logging;

// 客户端与接收端共享的协议定义
pub mod protocol;

// 接收端 Web 服务模块
pub mod server;

// 接收端分片存储与合并
pub mod storage;

// 上传客户端模块
pub mod uploader;

// 导出常用类型
pub use config::AppConfig;
pub use server::{build_router, AppState};
pub use storage::{merge_chunks, ChunkStore, StorageError};
pub use uploader::{
    ChunkTransport, ContentFingerprinter, FingerprintMode, HttpChunkTransport, SessionConfig,
    UploadChunkScheduler, UploadSession, UploadTask, UploadTaskStatus,
};

// 上传客户端模块
//
// - chunk: 分片划分与分片状态
// - fingerprint: 文件指纹（采样 / 完整 MD5）
// - transport: 检查、分片上传、合并三个调用
// - scheduler: 并发受限的分片调度（重试、fail-fast、取消）
// - session: 单文件状态机

pub mod chunk;
pub mod fingerprint;
pub mod scheduler;
pub mod session;
pub mod task;
pub mod transport;

pub use chunk::{
    chunk_count, chunk_identity, ChunkIter, UploadChunk, UploadChunkManager,
    DEFAULT_UPLOAD_CHUNK_SIZE,
};
pub use fingerprint::{ContentFingerprinter, FingerprintMode};
pub use scheduler::{
    ChunkJob, ExecutionSlot, RetryBudget, SchedulerError, UploadChunkScheduler,
    DEFAULT_MAX_RETRIES,
};
pub use session::{
    ChunkUpdate, SessionConfig, SessionError, UploadEvent, UploadSession,
    DEFAULT_MAX_CONCURRENT_CHUNKS,
};
pub use task::{UploadTask, UploadTaskStatus};
pub use transport::{
    ChunkTransport, ChunkUploadRequest, HttpChunkTransport, ProgressFn, TransportError,
};

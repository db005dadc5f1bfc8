// 接收端存储模块
//
// - chunk_store: 分片暂存、检查
// - merge: 按序号偏移合并为最终文件

pub mod chunk_store;
pub mod merge;

pub use chunk_store::{parse_chunk_index, ChunkStore, StorageError, StoredChunk, STAGING_DIR_PREFIX};
pub use merge::{merge_chunks, DEFAULT_MERGE_CONCURRENCY};

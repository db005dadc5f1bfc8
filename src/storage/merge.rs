// 分片合并
//
// 1. 列出暂存分片，按序号（数值）排序
// 2. 校验：序号从 0 连续、非末尾分片长度等于分片大小、数量与文件大小相符
//    （必须携带 fileSize，否则无法判断末尾分片是否缺失）
// 3. 预分配临时文件，各分片按 index × chunk_size 偏移并发写入（区间互不重叠）
// 4. 全部写完后 fsync，重命名为最终文件，删除暂存目录
//
// 任一步失败时删除临时文件，保留暂存分片供重新合并。

use crate::protocol::MergeRequest;
use crate::storage::{ChunkStore, StorageError, StoredChunk};
use crate::uploader::chunk_count;
use futures::stream::{self, TryStreamExt};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 默认合并写入并发数
pub const DEFAULT_MERGE_CONCURRENCY: usize = 4;

/// 校验分片覆盖完整，返回合并后的文件大小
fn validate_chunks(
    chunks: &[StoredChunk],
    chunk_size: u64,
    file_size: u64,
) -> Result<u64, StorageError> {
    let expected = chunk_count(file_size, chunk_size);
    if chunks.len() != expected {
        // 先报告缺失的序号，更便于定位
        if let Some(index) = first_gap(chunks).filter(|index| *index < expected) {
            return Err(StorageError::MissingChunk { index });
        }
        return Err(StorageError::ChunkCount {
            expected,
            actual: chunks.len(),
        });
    }

    if let Some(index) = first_gap(chunks) {
        return Err(StorageError::MissingChunk { index });
    }

    let last = chunks.len().saturating_sub(1);
    let mut total = 0u64;
    for chunk in chunks {
        let expected = if chunk.index == last {
            file_size - chunk_size * last as u64
        } else {
            chunk_size
        };
        if chunk.size != expected {
            return Err(StorageError::ChunkLength {
                index: chunk.index,
                expected,
                actual: chunk.size,
            });
        }
        total += chunk.size;
    }

    Ok(total)
}

/// 第一个缺失的序号（输入已按序号排序）
fn first_gap(chunks: &[StoredChunk]) -> Option<usize> {
    chunks
        .iter()
        .enumerate()
        .find(|(position, chunk)| chunk.index != *position)
        .map(|(position, _)| position)
}

/// 将一个分片写入目标文件的对应偏移
///
/// 每个分片独立打开句柄再定位写入，各分片区间互不重叠
async fn write_chunk(output: &Path, chunk: &StoredChunk, offset: u64) -> Result<(), StorageError> {
    let data = tokio::fs::read(&chunk.path)
        .await
        .map_err(StorageError::io(format!("读取分片失败: {}", chunk.identity)))?;

    let mut file = OpenOptions::new()
        .write(true)
        .open(output)
        .await
        .map_err(StorageError::io("打开合并文件失败"))?;
    file.seek(SeekFrom::Start(offset))
        .await
        .map_err(StorageError::io("文件定位失败"))?;
    file.write_all(&data)
        .await
        .map_err(StorageError::io(format!("写入分片 #{} 失败", chunk.index)))?;
    file.flush()
        .await
        .map_err(StorageError::io("刷新文件缓冲失败"))?;

    debug!(
        "分片 #{} 已写入: offset={}, 大小={} bytes",
        chunk.index,
        offset,
        data.len()
    );
    Ok(())
}

async fn write_all_chunks(
    temp: &Path,
    chunks: &[StoredChunk],
    chunk_size: u64,
    total_size: u64,
    concurrency: usize,
) -> Result<(), StorageError> {
    let file = File::create(temp)
        .await
        .map_err(StorageError::io(format!("创建合并文件失败: {:?}", temp)))?;
    file.set_len(total_size)
        .await
        .map_err(StorageError::io("预分配文件空间失败"))?;
    drop(file);

    stream::iter(chunks.iter().map(Ok))
        .try_for_each_concurrent(concurrency.max(1), |chunk| {
            write_chunk(temp, chunk, chunk.index as u64 * chunk_size)
        })
        .await?;

    let file = File::open(temp)
        .await
        .map_err(StorageError::io("打开合并文件失败"))?;
    file.sync_all()
        .await
        .map_err(StorageError::io("同步合并文件失败"))?;
    Ok(())
}

/// 合并指纹对应的全部分片，返回最终文件路径
pub async fn merge_chunks(
    store: &ChunkStore,
    request: &MergeRequest,
    concurrency: usize,
) -> Result<PathBuf, StorageError> {
    if request.size == 0 {
        return Err(StorageError::InvalidInput("分片大小必须大于 0".to_string()));
    }
    let Some(file_size) = request.file_size else {
        return Err(StorageError::InvalidInput("缺少 fileSize".to_string()));
    };

    let final_path = store.final_path(&request.filename, &request.filehash)?;
    let staging = store.staging_dir(&request.filehash)?;
    let chunks = store.stored_chunks(&request.filehash).await?;

    // 已合并过（重复的合并请求）
    if chunks.is_empty() && tokio::fs::try_exists(&final_path).await.unwrap_or(false) {
        info!("文件已合并，跳过: {:?}", final_path);
        return Ok(final_path);
    }

    let total_size = validate_chunks(&chunks, request.size, file_size)?;

    let temp = store.upload_dir().join(format!(
        ".{}.{}.merging",
        request.filehash,
        Uuid::new_v4()
    ));
    tokio::fs::create_dir_all(store.upload_dir())
        .await
        .map_err(StorageError::io("创建上传目录失败"))?;

    let written = write_all_chunks(&temp, &chunks, request.size, total_size, concurrency).await;
    let renamed = match written {
        Ok(()) => tokio::fs::rename(&temp, &final_path)
            .await
            .map_err(StorageError::io(format!("重命名合并文件失败: {:?}", final_path))),
        Err(e) => Err(e),
    };
    if let Err(e) = renamed {
        let _ = tokio::fs::remove_file(&temp).await;
        warn!(
            "合并失败，保留暂存分片: fingerprint={}, 错误: {}",
            request.filehash, e
        );
        return Err(e);
    }

    if let Err(e) = tokio::fs::remove_dir_all(&staging).await {
        // 最终文件已就绪，残留暂存目录不影响结果
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("删除暂存目录失败: {:?}, 错误: {}", staging, e);
        }
    }

    info!(
        "✓ 文件合并完成: {} -> {:?} ({} 个分片, {} bytes)",
        request.filename,
        final_path,
        chunks.len(),
        total_size
    );
    Ok(final_path)
}

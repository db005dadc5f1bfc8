// 上传分片管理
//
// 分片规则：
// - 固定分片大小，分片 i 的字节偏移 = i × chunk_size
// - 最后一个分片长度为 size mod chunk_size（整除时为完整分片）
// - 空文件没有分片
// - 分片标识 = "{fingerprint}-{index}"，接收端依赖该后缀还原顺序

use anyhow::{Context, Result};
use std::io::{Read, Seek, SeekFrom};
use std::ops::Range;
use std::path::Path;
use tracing::{debug, info};

/// 默认上传分片大小: 10MB
pub const DEFAULT_UPLOAD_CHUNK_SIZE: u64 = 10 * 1024 * 1024;

/// 生成分片标识
pub fn chunk_identity(fingerprint: &str, index: usize) -> String {
    format!("{}-{}", fingerprint, index)
}

/// 计算分片数量 ceil(total_size / chunk_size)
pub fn chunk_count(total_size: u64, chunk_size: u64) -> usize {
    if chunk_size == 0 {
        return 0;
    }
    total_size.div_ceil(chunk_size) as usize
}

/// 上传分片信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadChunk {
    /// 分片索引
    pub index: usize,
    /// 字节范围
    pub range: Range<u64>,
    /// 分片标识（fingerprint-index）
    pub identity: String,
    /// 已确认发送的字节数（用于进度计算）
    pub acked: u64,
    /// 是否已完成
    pub completed: bool,
    /// 已尝试上传的次数
    pub attempts: u32,
}

impl UploadChunk {
    pub fn new(fingerprint: &str, index: usize, range: Range<u64>) -> Self {
        Self {
            index,
            range,
            identity: chunk_identity(fingerprint, index),
            acked: 0,
            completed: false,
            attempts: 0,
        }
    }

    /// 分片大小
    pub fn size(&self) -> u64 {
        self.range.end - self.range.start
    }

    /// 读取分片数据（在阻塞线程池中执行定位读取）
    pub async fn read_data(&self, file_path: &Path) -> Result<Vec<u8>> {
        let file_path = file_path.to_path_buf();
        let start = self.range.start;
        let size = self.size() as usize;
        let index = self.index;

        let buffer = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
            let mut file = std::fs::File::open(&file_path)
                .with_context(|| format!("无法打开文件: {:?}", file_path))?;
            file.seek(SeekFrom::Start(start)).context("文件定位失败")?;

            let mut buffer = vec![0u8; size];
            file.read_exact(&mut buffer).context("读取分片数据失败")?;
            Ok(buffer)
        })
        .await
        .context("读取分片任务执行失败")??;

        debug!(
            "读取分片 #{}: offset={}, 大小={} bytes",
            index,
            start,
            buffer.len()
        );

        Ok(buffer)
    }
}

/// 惰性分片迭代器
///
/// 相同的 (total_size, chunk_size, fingerprint) 总是产生相同的分片序列
#[derive(Debug, Clone)]
pub struct ChunkIter {
    fingerprint: String,
    total_size: u64,
    chunk_size: u64,
    offset: u64,
    index: usize,
}

impl ChunkIter {
    pub fn new(fingerprint: &str, total_size: u64, chunk_size: u64) -> Result<Self> {
        anyhow::ensure!(chunk_size > 0, "分片大小必须大于 0");
        Ok(Self {
            fingerprint: fingerprint.to_string(),
            total_size,
            chunk_size,
            offset: 0,
            index: 0,
        })
    }
}

impl Iterator for ChunkIter {
    type Item = UploadChunk;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.total_size {
            return None;
        }
        let end = self.offset.saturating_add(self.chunk_size).min(self.total_size);
        let chunk = UploadChunk::new(&self.fingerprint, self.index, self.offset..end);
        self.offset = end;
        self.index += 1;
        Some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = chunk_count(self.total_size - self.offset, self.chunk_size);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for ChunkIter {}

/// 上传分片管理器
///
/// 持有单个任务的全部分片，暂停/恢复期间保留各分片的完成状态
#[derive(Debug)]
pub struct UploadChunkManager {
    chunks: Vec<UploadChunk>,
    total_size: u64,
    chunk_size: u64,
}

impl UploadChunkManager {
    /// 创建新的上传分片管理器
    pub fn new(fingerprint: &str, total_size: u64, chunk_size: u64) -> Result<Self> {
        let chunks: Vec<UploadChunk> = ChunkIter::new(fingerprint, total_size, chunk_size)?.collect();

        info!(
            "创建上传分片管理器: 文件大小={} bytes, 分片大小={} bytes, 分片数量={}",
            total_size,
            chunk_size,
            chunks.len()
        );

        Ok(Self {
            chunks,
            total_size,
            chunk_size,
        })
    }

    /// 获取所有分片
    pub fn chunks(&self) -> &[UploadChunk] {
        &self.chunks
    }

    pub fn chunk(&self, index: usize) -> Option<&UploadChunk> {
        self.chunks.get(index)
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// 未完成的分片（按索引顺序）
    pub fn pending(&self) -> Vec<UploadChunk> {
        self.chunks.iter().filter(|c| !c.completed).cloned().collect()
    }

    pub fn completed_count(&self) -> usize {
        self.chunks.iter().filter(|c| c.completed).count()
    }

    pub fn is_completed(&self) -> bool {
        self.chunks.iter().all(|c| c.completed)
    }

    /// 已确认的字节总数
    pub fn acked_bytes(&self) -> u64 {
        self.chunks.iter().map(|c| c.acked).sum()
    }

    /// 聚合进度 floor(acked / total × 100)
    ///
    /// 空文件在全部（零个）分片完成时视为 100
    pub fn percent(&self) -> u8 {
        if self.total_size == 0 {
            return if self.is_completed() { 100 } else { 0 };
        }
        ((self.acked_bytes() as u128 * 100) / self.total_size as u128).min(100) as u8
    }

    /// 更新分片已确认字节数（超出分片长度时截断）
    pub fn set_acked(&mut self, index: usize, bytes: u64) {
        if let Some(chunk) = self.chunks.get_mut(index) {
            if !chunk.completed {
                chunk.acked = bytes.min(chunk.size());
            }
        }
    }

    /// 开始一次新的尝试：该分片进度从 0 重新计算
    pub fn begin_attempt(&mut self, index: usize) -> u32 {
        match self.chunks.get_mut(index) {
            Some(chunk) => {
                chunk.acked = 0;
                chunk.attempts += 1;
                chunk.attempts
            }
            None => 0,
        }
    }

    /// 标记分片为已完成
    pub fn mark_completed(&mut self, index: usize) {
        if let Some(chunk) = self.chunks.get_mut(index) {
            chunk.completed = true;
            chunk.acked = chunk.size();
        }
    }

    /// 根据接收端已存储的分片标识标记完成，返回新标记的数量
    pub fn mark_stored(&mut self, identities: &[String]) -> usize {
        let mut marked = 0;
        for chunk in self.chunks.iter_mut() {
            if !chunk.completed && identities.iter().any(|id| id == &chunk.identity) {
                chunk.completed = true;
                chunk.acked = chunk.size();
                marked += 1;
            }
        }
        marked
    }
}

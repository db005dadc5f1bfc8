// 接收端分片存储
//
// 目录布局：
//   <upload_dir>/chunkDir_<fingerprint>/<fingerprint>-<index>   分片暂存
//   <upload_dir>/<fingerprint><.ext>                            合并后的文件
//
// 分片先写入暂存目录下的隐藏临时文件，再重命名到位，
// 列目录时永远看不到写了一半的分片。

use crate::protocol::VerifyResponse;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

/// 暂存目录前缀
pub const STAGING_DIR_PREFIX: &str = "chunkDir_";

/// 存储错误
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// 请求参数不合法（指纹、分片标识、文件名、分片大小等）
    #[error("请求参数不合法: {0}")]
    InvalidInput(String),
    /// 合并时缺少分片
    #[error("缺少分片 #{index}")]
    MissingChunk { index: usize },
    /// 分片长度与分片大小不符
    #[error("分片 #{index} 长度异常: 期望 {expected} bytes, 实际 {actual} bytes")]
    ChunkLength {
        index: usize,
        expected: u64,
        actual: u64,
    },
    /// 分片数量与文件大小不符
    #[error("分片数量不符: 期望 {expected}, 实际 {actual}")]
    ChunkCount { expected: usize, actual: usize },
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error("后台任务执行失败: {0}")]
    Join(String),
}

impl StorageError {
    /// 是否为调用方的输入错误
    pub fn is_client_error(&self) -> bool {
        matches!(self, StorageError::InvalidInput(_))
    }

    pub(crate) fn io(context: impl Into<String>) -> impl FnOnce(io::Error) -> StorageError {
        let context = context.into();
        move |source| StorageError::Io { context, source }
    }
}

/// 校验可用作单个路径组件的名称
fn validate_component(value: &str, what: &str) -> Result<(), StorageError> {
    let invalid = value.is_empty()
        || value.starts_with('.')
        || value.contains(['/', '\\', '\0'])
        || value.contains("..");
    if invalid {
        return Err(StorageError::InvalidInput(format!("{} 不合法: {:?}", what, value)));
    }
    Ok(())
}

/// 从分片标识解析分片序号
///
/// 标识格式为 `{fingerprint}-{index}`，前缀必须与指纹一致
pub fn parse_chunk_index(fingerprint: &str, identity: &str) -> Result<usize, StorageError> {
    let parsed = identity
        .rsplit_once('-')
        .filter(|(prefix, _)| *prefix == fingerprint)
        .and_then(|(_, index)| index.parse::<usize>().ok());

    parsed.ok_or_else(|| {
        StorageError::InvalidInput(format!(
            "分片标识 {:?} 与指纹 {:?} 不匹配",
            identity, fingerprint
        ))
    })
}

/// 已持久化的分片
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredChunk {
    pub index: usize,
    pub identity: String,
    pub path: PathBuf,
    pub size: u64,
}

/// 分片存储
#[derive(Debug, Clone)]
pub struct ChunkStore {
    upload_dir: PathBuf,
}

impl ChunkStore {
    pub fn new(upload_dir: impl Into<PathBuf>) -> Self {
        Self {
            upload_dir: upload_dir.into(),
        }
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    /// 指纹对应的暂存目录
    pub fn staging_dir(&self, fingerprint: &str) -> Result<PathBuf, StorageError> {
        validate_component(fingerprint, "文件指纹")?;
        Ok(self
            .upload_dir
            .join(format!("{}{}", STAGING_DIR_PREFIX, fingerprint)))
    }

    /// 合并后的文件路径：指纹 + 原文件扩展名（没有扩展名时不加）
    pub fn final_path(&self, filename: &str, fingerprint: &str) -> Result<PathBuf, StorageError> {
        validate_component(fingerprint, "文件指纹")?;

        let name = match Path::new(filename).extension().and_then(|e| e.to_str()) {
            Some(ext) => {
                validate_component(ext, "文件扩展名")?;
                format!("{}.{}", fingerprint, ext)
            }
            None => fingerprint.to_string(),
        };
        Ok(self.upload_dir.join(name))
    }

    /// 检查文件是否已存在，以及已持久化的分片
    pub async fn verify(
        &self,
        filename: &str,
        fingerprint: &str,
    ) -> Result<VerifyResponse, StorageError> {
        let final_path = self.final_path(filename, fingerprint)?;
        if tokio::fs::try_exists(&final_path)
            .await
            .map_err(StorageError::io("检查文件是否存在失败"))?
        {
            debug!("文件已存在: {:?}", final_path);
            return Ok(VerifyResponse::exists());
        }

        let uploaded = self.list_chunks(fingerprint).await?;
        debug!(
            "检查文件 {} ({}): 已有 {} 个分片",
            filename,
            fingerprint,
            uploaded.len()
        );
        Ok(VerifyResponse::pending(uploaded))
    }

    /// 持久化一个分片（幂等，重复写入覆盖为相同内容）
    pub async fn store(
        &self,
        fingerprint: &str,
        identity: &str,
        data: &[u8],
    ) -> Result<(), StorageError> {
        validate_component(identity, "分片标识")?;
        let index = parse_chunk_index(fingerprint, identity)?;

        let staging = self.staging_dir(fingerprint)?;
        tokio::fs::create_dir_all(&staging)
            .await
            .map_err(StorageError::io(format!("创建暂存目录失败: {:?}", staging)))?;

        let target = staging.join(identity);
        let temp = staging.join(format!(".{}.{}.tmp", identity, Uuid::new_v4()));

        if let Err(e) = tokio::fs::write(&temp, data).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(StorageError::io(format!("写入分片失败: {:?}", temp))(e));
        }
        if let Err(e) = tokio::fs::rename(&temp, &target).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(StorageError::io(format!("重命名分片失败: {:?}", target))(e));
        }

        info!(
            "已接收分片 #{}: {} ({} bytes)",
            index,
            identity,
            data.len()
        );
        Ok(())
    }

    /// 已持久化的分片标识（按序号排序）
    pub async fn list_chunks(&self, fingerprint: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .stored_chunks(fingerprint)
            .await?
            .into_iter()
            .map(|chunk| chunk.identity)
            .collect())
    }

    /// 已持久化的分片详情（按序号排序）
    ///
    /// 暂存目录不存在时返回空列表；忽略临时文件和无法解析的文件名
    pub async fn stored_chunks(&self, fingerprint: &str) -> Result<Vec<StoredChunk>, StorageError> {
        let staging = self.staging_dir(fingerprint)?;

        let mut entries = match tokio::fs::read_dir(&staging).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(StorageError::io(format!("读取暂存目录失败: {:?}", staging))(e))
            }
        };

        let mut chunks = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(StorageError::io("遍历暂存目录失败"))?
        {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            let Ok(index) = parse_chunk_index(fingerprint, &name) else {
                debug!("忽略无法识别的暂存文件: {}", name);
                continue;
            };
            let metadata = entry
                .metadata()
                .await
                .map_err(StorageError::io(format!("读取分片元数据失败: {}", name)))?;
            if !metadata.is_file() {
                continue;
            }

            chunks.push(StoredChunk {
                index,
                identity: name,
                path: entry.path(),
                size: metadata.len(),
            });
        }

        chunks.sort_by_key(|chunk| chunk.index);
        Ok(chunks)
    }
}

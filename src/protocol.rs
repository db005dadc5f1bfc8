// 上传协议类型定义
//
// 客户端与接收端共享：
// - GET  /upload-verify?filename=&filehash=
// - POST /upload        (multipart: chunk + filename + filehash + hash)
// - POST /upload-merge  (JSON)

use serde::{Deserialize, Serialize};

/// 秒传/续传检查路径
pub const VERIFY_PATH: &str = "/upload-verify";
/// 分片上传路径
pub const UPLOAD_PATH: &str = "/upload";
/// 合并路径
pub const MERGE_PATH: &str = "/upload-merge";

/// multipart 字段：分片数据
pub const FIELD_CHUNK: &str = "chunk";
/// multipart 字段：原始文件名
pub const FIELD_FILENAME: &str = "filename";
/// multipart 字段：文件指纹
pub const FIELD_FILEHASH: &str = "filehash";
/// multipart 字段：分片标识
pub const FIELD_HASH: &str = "hash";

/// 分片接收成功的响应体
pub const CHUNK_RECEIVED_BODY: &str = "received file chunk.";
/// 合并成功的响应体
pub const MERGE_SUCCESS_BODY: &str = "file merged success.";

/// 检查请求参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyQuery {
    pub filename: String,
    pub filehash: String,
}

/// 检查结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    /// 是否需要上传（false 表示接收端已有完整文件）
    pub should_upload: bool,
    /// 接收端已持久化的分片标识
    #[serde(default)]
    pub uploaded: Vec<String>,
}

impl VerifyResponse {
    /// 接收端已有完整文件
    pub fn exists() -> Self {
        Self {
            should_upload: false,
            uploaded: Vec::new(),
        }
    }

    /// 需要上传，附带已存在的分片
    pub fn pending(uploaded: Vec<String>) -> Self {
        Self {
            should_upload: true,
            uploaded,
        }
    }
}

/// 合并请求
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeRequest {
    pub filename: String,
    pub filehash: String,
    /// 分片大小（用于计算写入偏移）
    pub size: u64,
    /// 文件总大小，接收端按 ceil(file_size / size) 校验分片数量；缺失时合并请求被拒绝
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
}

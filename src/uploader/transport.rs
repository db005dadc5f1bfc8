// 分片传输层
//
// ChunkTransport 抽象了会话与接收端之间的三个调用：检查、分片上传、合并。
// 取消（用户暂停）与失败是两种不同的结果，调度器只对失败计入重试。

use crate::protocol::{
    MergeRequest, VerifyResponse, FIELD_CHUNK, FIELD_FILEHASH, FIELD_FILENAME, FIELD_HASH,
    MERGE_PATH, UPLOAD_PATH, VERIFY_PATH,
};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{multipart, Body, Client};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 进度回报的粒度: 64KB
const PROGRESS_PIECE_SIZE: usize = 64 * 1024;

/// 进度回调，参数为本分片已发送的字节数
pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

/// 传输错误
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// 被取消（不计入重试）
    #[error("上传已取消")]
    Cancelled,
    /// 响应状态码不在 2xx 范围
    #[error("HTTP 状态异常: {status}, body={body}")]
    Status { status: u16, body: String },
    /// 网络错误
    #[error("网络错误: {0}")]
    Network(#[from] reqwest::Error),
    /// 响应体解析失败
    #[error("解析响应失败: {0}")]
    Decode(String),
    /// 本地数据准备失败（读取分片等）
    #[error("本地错误: {0}")]
    Local(String),
}

impl TransportError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransportError::Cancelled)
    }
}

/// 单个分片的上传请求
#[derive(Debug, Clone)]
pub struct ChunkUploadRequest {
    /// 原始文件名
    pub filename: String,
    /// 文件指纹
    pub fingerprint: String,
    /// 分片标识
    pub identity: String,
    /// 分片数据
    pub data: Vec<u8>,
}

/// 分片传输抽象
#[async_trait]
pub trait ChunkTransport: Send + Sync {
    /// 询问接收端是否需要上传，以及哪些分片已存在
    async fn verify(&self, filename: &str, fingerprint: &str)
        -> Result<VerifyResponse, TransportError>;

    /// 上传一个分片，成功时返回接收端响应体
    async fn upload_chunk(
        &self,
        request: ChunkUploadRequest,
        progress: ProgressFn,
        cancel: CancellationToken,
    ) -> Result<String, TransportError>;

    /// 请求合并
    async fn merge(&self, request: &MergeRequest) -> Result<(), TransportError>;
}

/// 基于 HTTP 的分片传输
#[derive(Debug, Clone)]
pub struct HttpChunkTransport {
    client: Client,
    base_url: String,
}

impl HttpChunkTransport {
    pub fn new(base_url: &str) -> Result<Self, TransportError> {
        let client = Client::builder().build()?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// 检查状态码并读取响应体
    async fn read_body(response: reqwest::Response) -> Result<String, TransportError> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }
}

/// 将分片数据切成小块，每交出一块回报一次累计进度
fn progress_pieces(
    data: Vec<u8>,
    progress: ProgressFn,
) -> impl futures::Stream<Item = Result<Vec<u8>, std::io::Error>> + Send + Sync + 'static {
    let pieces: Vec<Vec<u8>> = data.chunks(PROGRESS_PIECE_SIZE).map(<[u8]>::to_vec).collect();

    let mut sent = 0u64;
    futures::stream::iter(pieces).map(move |piece| {
        sent += piece.len() as u64;
        progress(sent);
        Ok(piece)
    })
}

#[async_trait]
impl ChunkTransport for HttpChunkTransport {
    async fn verify(
        &self,
        filename: &str,
        fingerprint: &str,
    ) -> Result<VerifyResponse, TransportError> {
        let response = self
            .client
            .get(self.url(VERIFY_PATH))
            .header("X-Requested-With", "XMLHttpRequest")
            .query(&[(FIELD_FILENAME, filename), (FIELD_FILEHASH, fingerprint)])
            .send()
            .await?;

        let body = Self::read_body(response).await?;
        debug!("检查响应: {}", body);

        serde_json::from_str(&body).map_err(|e| TransportError::Decode(format!("{}: {}", e, body)))
    }

    async fn upload_chunk(
        &self,
        request: ChunkUploadRequest,
        progress: ProgressFn,
        cancel: CancellationToken,
    ) -> Result<String, TransportError> {
        let length = request.data.len() as u64;
        let part = multipart::Part::stream_with_length(
            Body::wrap_stream(progress_pieces(request.data, progress)),
            length,
        )
        .file_name(request.identity.clone())
        .mime_str("application/octet-stream")?;

        let form = multipart::Form::new()
            .part(FIELD_CHUNK, part)
            .text(FIELD_FILENAME, request.filename)
            .text(FIELD_FILEHASH, request.fingerprint)
            .text(FIELD_HASH, request.identity);

        let send = async {
            let response = self
                .client
                .post(self.url(UPLOAD_PATH))
                .header("X-Requested-With", "XMLHttpRequest")
                .multipart(form)
                .send()
                .await?;
            Self::read_body(response).await
        };

        // 取消时丢弃请求 future，底层连接随之中断
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            result = send => result,
        }
    }

    async fn merge(&self, request: &MergeRequest) -> Result<(), TransportError> {
        let response = self
            .client
            .post(self.url(MERGE_PATH))
            .header("X-Requested-With", "XMLHttpRequest")
            .json(request)
            .send()
            .await?;

        let body = Self::read_body(response).await?;
        debug!("合并响应: {}", body);
        Ok(())
    }
}

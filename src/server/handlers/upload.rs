// 上传 API 处理器

use crate::protocol::{
    MergeRequest, VerifyQuery, VerifyResponse, CHUNK_RECEIVED_BODY, FIELD_CHUNK, FIELD_FILEHASH,
    FIELD_FILENAME, FIELD_HASH, MERGE_SUCCESS_BODY,
};
use crate::server::error::{ApiError, ApiResult};
use crate::server::AppState;
use crate::storage::merge_chunks;
use axum::{
    extract::{Multipart, Query, State},
    Json,
};
use tracing::{debug, info};

/// GET /upload-verify?filename=&filehash=
/// 检查文件是否已存在，返回已持久化的分片
pub async fn upload_verify(
    State(state): State<AppState>,
    Query(query): Query<VerifyQuery>,
) -> ApiResult<Json<VerifyResponse>> {
    debug!("API: 检查文件 {} ({})", query.filename, query.filehash);
    let response = state
        .chunk_store
        .verify(&query.filename, &query.filehash)
        .await?;
    Ok(Json(response))
}

/// POST /upload
/// 接收一个分片（multipart: chunk + filename + filehash + hash）
pub async fn upload_chunk(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<&'static str> {
    let mut chunk = None;
    let mut filename = None;
    let mut filehash = None;
    let mut hash = None;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            FIELD_CHUNK => chunk = Some(field.bytes().await?),
            FIELD_FILENAME => filename = Some(field.text().await?),
            FIELD_FILEHASH => filehash = Some(field.text().await?),
            FIELD_HASH => hash = Some(field.text().await?),
            other => debug!("忽略未知字段: {}", other),
        }
    }

    let missing = |field: &str| ApiError::BadRequest(format!("缺少字段: {}", field));
    let chunk = chunk.ok_or_else(|| missing(FIELD_CHUNK))?;
    let filehash = filehash.ok_or_else(|| missing(FIELD_FILEHASH))?;
    let hash = hash.ok_or_else(|| missing(FIELD_HASH))?;

    debug!(
        "API: 接收分片 {} (文件 {:?}, {} bytes)",
        hash,
        filename.as_deref().unwrap_or(""),
        chunk.len()
    );
    state.chunk_store.store(&filehash, &hash, &chunk).await?;

    Ok(CHUNK_RECEIVED_BODY)
}

/// POST /upload-merge
/// 合并全部分片
pub async fn upload_merge(
    State(state): State<AppState>,
    Json(request): Json<MergeRequest>,
) -> ApiResult<&'static str> {
    info!(
        "API: 合并文件 {} ({}), 分片大小={}, 文件大小={:?}",
        request.filename, request.filehash, request.size, request.file_size
    );

    merge_chunks(
        &state.chunk_store,
        &request,
        state.config.storage.merge_concurrency,
    )
    .await?;

    Ok(MERGE_SUCCESS_BODY)
}

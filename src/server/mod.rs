// Web服务器模块

pub mod error;
pub mod handlers;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use state::AppState;

use crate::protocol::{MERGE_PATH, UPLOAD_PATH, VERIFY_PATH};
use axum::{
    extract::DefaultBodyLimit,
    http::HeaderValue,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::warn;

/// 健康检查响应结构
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    service: String,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: env!("CARGO_PKG_NAME").to_string(),
    })
}

/// CORS 配置：未指定来源时允许任意来源
fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() {
        return layer.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("忽略无效的 CORS 来源 {:?}: {}", origin, e);
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

/// 构建接收端路由
pub fn build_router(state: AppState) -> Router {
    let body_limit = state.config.storage.max_chunk_body_bytes();

    // 配置中间件层
    let middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http()) // HTTP 请求日志
        .layer(cors_layer(&state.config.server.cors_origins));

    Router::new()
        .route(VERIFY_PATH, get(handlers::upload_verify))
        .route(UPLOAD_PATH, post(handlers::upload_chunk))
        .route(MERGE_PATH, post(handlers::upload_merge))
        .route("/health", get(health_check))
        .with_state(state)
        // 分片请求体超过 axum 默认的 2MB
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(middleware)
}

use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum_auth::AuthBearer;
use axum_typed_multipart::TypedMultipart;
use log::{error, info};
use tokio::task::{block_in_place, spawn_blocking};

use super::error::{ApiError, Result};
use super::state::AppState;
use super::types::*;
use crate::error::ReconcileError;
use crate::reconcile::EventSender;
use crate::search::SearchQuery;

fn check_token(state: &AppState, token: &str) -> Result<()> {
    if token != state.token {
        return Err(ApiError::Unauthorized.into());
    }
    Ok(())
}

/// 以文字或图片搜索
#[utoipa::path(
    post,
    path = "/search",
    request_body(content = SearchForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, body = SearchResponse),
        (status = 409, description = "索引为空"),
    ),
)]
pub async fn search_handler(
    AuthBearer(token): AuthBearer,
    State(state): State<Arc<AppState>>,
    TypedMultipart(data): TypedMultipart<SearchRequest>,
) -> Result<Json<SearchResponse>> {
    check_token(&state, &token)?;

    let query = match (data.text, data.file) {
        (Some(text), None) if !text.trim().is_empty() => SearchQuery::Text(text),
        (None, Some(file)) => SearchQuery::Image(file.to_vec()),
        _ => return Err(ApiError::BadRequest("需要且只能提供 text 或 file 其中之一".into()).into()),
    };
    let count = data.count.unwrap_or(state.count);

    let start = Instant::now();
    info!("正在搜索: {}", if matches!(query, SearchQuery::Text(_)) { "文字" } else { "图片" });
    let result = block_in_place(|| state.collection.search(&query, count))?;

    Ok(Json(SearchResponse {
        time: start.elapsed().as_millis() as u64,
        result: result.into_iter().map(Hit::from).collect(),
    }))
}

/// 查找与集合中某张图片相似的图片，结果不包含该图片本身
#[utoipa::path(
    post,
    path = "/similar",
    request_body = SimilarRequest,
    responses(
        (status = 200, body = SearchResponse),
        (status = 404, description = "图片未被索引"),
    ),
)]
pub async fn similar_handler(
    AuthBearer(token): AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(data): Json<SimilarRequest>,
) -> Result<Json<SearchResponse>> {
    check_token(&state, &token)?;

    let start = Instant::now();
    let count = data.count.unwrap_or(state.count);
    let result = block_in_place(|| state.collection.more_like(&data.path, count))?;

    Ok(Json(SearchResponse {
        time: start.elapsed().as_millis() as u64,
        result: result.into_iter().map(Hit::from).collect(),
    }))
}

/// 在后台开始同步索引
#[utoipa::path(
    post,
    path = "/reindex",
    responses(
        (status = 202, body = ReindexResponse),
        (status = 409, description = "已有同步正在进行"),
    ),
)]
pub async fn reindex_handler(
    AuthBearer(token): AuthBearer,
    State(state): State<Arc<AppState>>,
) -> Result<(StatusCode, Json<ReindexResponse>)> {
    check_token(&state, &token)?;

    if state.collection.is_indexing() {
        return Err(ReconcileError::AlreadyRunning.into());
    }

    let collection = state.collection.clone();
    let cancel = state.shutdown.clone();
    spawn_blocking(move || match collection.reconcile(&EventSender::none(), &cancel) {
        Ok(report) => info!(
            "同步完成，新增 {}，删除 {}，失败 {}",
            report.added,
            report.removed,
            report.failed.len()
        ),
        Err(e) => error!("同步失败: {}", e),
    });

    Ok((StatusCode::ACCEPTED, Json(ReindexResponse { started: true })))
}

/// 获取集合状态
#[utoipa::path(
    get,
    path = "/status",
    responses(
        (status = 200, body = StatusResponse),
    ),
)]
pub async fn status_handler(
    AuthBearer(token): AuthBearer,
    State(state): State<Arc<AppState>>,
) -> Result<Json<StatusResponse>> {
    check_token(&state, &token)?;
    let status = block_in_place(|| state.collection.status())?;
    Ok(Json(status.into()))
}

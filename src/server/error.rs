use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use log::error;

use crate::error::{EmbeddingError, ReconcileError, SearchError};

pub type Result<T, E = AppError> = std::result::Result<T, E>;

/// 请求本身的问题
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("invalid token")]
    Unauthorized,
    #[error("bad request: {0}")]
    BadRequest(String),
}

/// API错误类型
pub struct AppError(pub anyhow::Error);

impl AppError {
    fn status(&self) -> StatusCode {
        if let Some(e) = self.0.downcast_ref::<ApiError>() {
            return match e {
                ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
                ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            };
        }
        if let Some(e) = self.0.downcast_ref::<SearchError>() {
            return match e {
                SearchError::EmptyIndex => StatusCode::CONFLICT,
                SearchError::ModelMismatch { .. } | SearchError::DimensionMismatch { .. } => {
                    StatusCode::BAD_REQUEST
                }
                SearchError::NotIndexed(_) => StatusCode::NOT_FOUND,
                SearchError::Embedding(e) => embedding_status(e),
            };
        }
        if let Some(e) = self.0.downcast_ref::<EmbeddingError>() {
            return embedding_status(e);
        }
        if let Some(ReconcileError::AlreadyRunning) = self.0.downcast_ref::<ReconcileError>() {
            return StatusCode::CONFLICT;
        }
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

fn embedding_status(e: &EmbeddingError) -> StatusCode {
    match e {
        EmbeddingError::UnsupportedFormat => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        EmbeddingError::DecodeFailure(_) => StatusCode::UNPROCESSABLE_ENTITY,
        EmbeddingError::ModelNotLoaded(_) => StatusCode::SERVICE_UNAVAILABLE,
        EmbeddingError::InvalidDimension { .. } | EmbeddingError::Transport(_) => {
            StatusCode::BAD_GATEWAY
        }
        EmbeddingError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("请求失败: {:#}", self.0);
        }
        (status, self.0.to_string()).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

use std::path::PathBuf;

use thiserror::Error;

/// 嵌入计算失败的原因
#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("unsupported image format")]
    UnsupportedFormat,
    #[error("failed to decode input: {0}")]
    DecodeFailure(String),
    #[error("model not loaded: {0}")]
    ModelNotLoaded(String),
    #[error("embedding has invalid dimension: expected {expected}, got {got}")]
    InvalidDimension { expected: usize, got: usize },
    #[error("embedding service error: {0}")]
    Transport(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// 搜索失败的原因
///
/// `EmptyIndex` 与“没有匹配结果”是两回事，后者返回空列表
#[derive(Debug, Error)]
pub enum SearchError {
    #[error("index is empty, run indexing first")]
    EmptyIndex,
    #[error("probe model `{probe}` does not match indexed model `{indexed}`")]
    ModelMismatch { indexed: String, probe: String },
    #[error("probe dimension {got} does not match indexed dimension {expected}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("path is not indexed: {}", .0.display())]
    NotIndexed(PathBuf),
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
}

/// 导致整次索引同步失败的错误，单个文件的错误不会出现在这里
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("a reconciliation is already running for this collection")]
    AlreadyRunning,
    #[error("collection root is not a directory: {}", .0.display())]
    RootMissing(PathBuf),
    #[error("cache error: {0}")]
    Cache(#[from] heed::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

use std::collections::BTreeMap;
use std::path::PathBuf;

use axum::body::Bytes;
use axum_typed_multipart::TryFromMultipart;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::collection::CollectionStatus;
use crate::index::SearchHit;

/// 搜索请求参数
#[derive(TryFromMultipart)]
pub struct SearchRequest {
    pub text: Option<String>,
    pub file: Option<Bytes>,
    pub count: Option<usize>,
}

/// 搜索表单（用于API文档）
#[derive(Debug, ToSchema)]
#[allow(unused)]
pub struct SearchForm {
    /// 文字描述，与 `file` 二选一
    pub text: Option<String>,
    /// 上传的图片文件
    #[schema(format = Binary, content_media_type = "application/octet-stream")]
    pub file: Option<String>,
    /// 返回的结果数量，最多 200
    pub count: Option<usize>,
}

/// 查找相似图片的参数
#[derive(Debug, Deserialize, ToSchema)]
pub struct SimilarRequest {
    /// 集合中的图片路径
    #[schema(value_type = String)]
    pub path: PathBuf,
    pub count: Option<usize>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct Hit {
    #[schema(value_type = String)]
    pub path: PathBuf,
    /// 余弦相似度
    pub score: f32,
}

impl From<SearchHit> for Hit {
    fn from(hit: SearchHit) -> Self {
        Self { path: hit.path, score: hit.score }
    }
}

/// 搜索响应
#[derive(Debug, Serialize, ToSchema)]
pub struct SearchResponse {
    /// 搜索耗时，单位为毫秒
    pub time: u64,
    pub result: Vec<Hit>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ReindexResponse {
    pub started: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct StatusResponse {
    #[schema(value_type = String)]
    pub root: PathBuf,
    pub model_id: String,
    pub indexed: usize,
    pub dim: Option<usize>,
    /// 缓存中每个模型的记录数
    pub cached: BTreeMap<String, usize>,
    pub indexing: bool,
}

impl From<CollectionStatus> for StatusResponse {
    fn from(s: CollectionStatus) -> Self {
        Self {
            root: s.root,
            model_id: s.model_id,
            indexed: s.indexed,
            dim: s.dim,
            cached: s.cached,
            indexing: s.indexing,
        }
    }
}

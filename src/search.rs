use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use log::debug;

use crate::error::SearchError;
use crate::index::{SearchHit, VectorIndex};
use crate::metrics::{self, QueryKind};
use crate::provider::EmbeddingProvider;

/// 默认返回的结果数量
pub const DEFAULT_TOP_K: usize = 24;
/// 单次查询最多返回的结果数量
pub const MAX_TOP_K: usize = 200;

/// 一次查询的输入
#[derive(Debug, Clone)]
pub enum SearchQuery {
    Text(String),
    /// 图片原始字节
    Image(Vec<u8>),
}

impl SearchQuery {
    fn kind(&self) -> QueryKind {
        match self {
            SearchQuery::Text(_) => QueryKind::Text,
            SearchQuery::Image(_) => QueryKind::Image,
        }
    }
}

/// 已经计算好的查询向量
#[derive(Debug, Clone)]
pub struct Probe {
    pub model_id: String,
    pub vector: Vec<f32>,
}

/// 在内存索引上执行查询，只读
#[derive(Clone)]
pub struct SearchEngine {
    index: Arc<VectorIndex>,
    provider: Arc<dyn EmbeddingProvider>,
    model_id: String,
}

impl SearchEngine {
    pub fn new(
        index: Arc<VectorIndex>,
        provider: Arc<dyn EmbeddingProvider>,
        model_id: impl Into<String>,
    ) -> Self {
        Self { index, provider, model_id: model_id.into() }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// 计算查询向量后搜索，空索引时不会调用模型
    pub fn search(&self, query: &SearchQuery, k: usize) -> Result<Vec<SearchHit>, SearchError> {
        self.ensure_ready()?;
        let vector = match query {
            SearchQuery::Text(text) => self.provider.embed_text(&self.model_id, text)?,
            SearchQuery::Image(bytes) => self.provider.embed_image(&self.model_id, bytes)?,
        };
        let probe = Probe { model_id: self.model_id.clone(), vector };
        self.timed(query.kind(), || self.search_probe(&probe, k))
    }

    /// 使用外部计算的向量搜索，模型必须与索引一致
    pub fn search_probe(&self, probe: &Probe, k: usize) -> Result<Vec<SearchHit>, SearchError> {
        self.check_model(&probe.model_id)?;
        self.index.query(&probe.vector, k.min(MAX_TOP_K))
    }

    /// 查找与已索引图片相似的图片，结果不包含图片本身
    pub fn more_like(&self, path: &Path, k: usize) -> Result<Vec<SearchHit>, SearchError> {
        self.ensure_ready()?;
        let vector = self.index.get(path).ok_or_else(|| SearchError::NotIndexed(path.to_path_buf()))?;
        self.timed(QueryKind::Similar, || {
            self.index.query_filtered(&vector, k.min(MAX_TOP_K), |candidate| candidate != path)
        })
    }

    fn ensure_ready(&self) -> Result<(), SearchError> {
        if let Some(indexed) = self.index.model_id() {
            if indexed != self.model_id {
                return Err(SearchError::ModelMismatch { indexed, probe: self.model_id.clone() });
            }
        }
        if self.index.is_empty() {
            return Err(SearchError::EmptyIndex);
        }
        Ok(())
    }

    fn check_model(&self, probe: &str) -> Result<(), SearchError> {
        match self.index.model_id() {
            Some(indexed) if indexed != probe => {
                Err(SearchError::ModelMismatch { indexed, probe: probe.to_string() })
            }
            _ => Ok(()),
        }
    }

    fn timed<F>(&self, kind: QueryKind, f: F) -> Result<Vec<SearchHit>, SearchError>
    where
        F: FnOnce() -> Result<Vec<SearchHit>, SearchError>,
    {
        let start = Instant::now();
        let hits = f()?;
        let elapsed = start.elapsed();
        debug!("{:?} 查询用时 {:.2?}，返回 {} 条结果", kind, elapsed, hits.len());

        metrics::inc_search_count(kind, &self.model_id);
        metrics::inc_search_duration(kind, &self.model_id, elapsed.as_secs_f32());
        if let Some(best) = hits.first() {
            metrics::inc_search_max_score(kind, &self.model_id, best.score);
        }
        Ok(hits)
    }
}

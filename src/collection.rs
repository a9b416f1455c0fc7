use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::{ConfDir, DEFAULT_MODEL};
use crate::db::FingerprintCache;
use crate::error::{ReconcileError, SearchError};
use crate::index::{SearchHit, VectorIndex};
use crate::metrics;
use crate::provider::{EmbeddingProvider, NoProvider};
use crate::reconcile::{EventSender, IndexReconciler, ReconcileReport};
use crate::search::{SearchEngine, SearchQuery};

pub const DEFAULT_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "webp"];
pub const DEFAULT_BATCH_SIZE: usize = 64;

/// 一个图片集合的配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionConfig {
    pub root: PathBuf,
    pub model_id: String,
    /// 不含点号，不区分大小写
    pub extensions: Vec<String>,
    /// 每批计算的数量，每批结束后写入缓存
    pub batch_size: usize,
    pub workers: usize,
    /// 同步时校验已缓存文件的内容哈希
    pub verify_content: bool,
}

impl CollectionConfig {
    pub fn new(root: impl Into<PathBuf>, model_id: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            model_id: model_id.into(),
            extensions: DEFAULT_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
            batch_size: DEFAULT_BATCH_SIZE,
            workers: num_cpus::get(),
            verify_content: false,
        }
    }
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self::new(".", DEFAULT_MODEL)
    }
}

/// 集合的当前状态
#[derive(Debug, Clone, Serialize)]
pub struct CollectionStatus {
    pub root: PathBuf,
    pub model_id: String,
    /// 内存索引中的向量数量
    pub indexed: usize,
    pub dim: Option<usize>,
    /// 缓存中每个模型的记录数
    pub cached: BTreeMap<String, usize>,
    pub indexing: bool,
}

pub struct CollectionBuilder {
    conf_dir: ConfDir,
    config: CollectionConfig,
    store: Option<PathBuf>,
    provider: Arc<dyn EmbeddingProvider>,
}

impl CollectionBuilder {
    pub fn new(conf_dir: ConfDir, config: CollectionConfig) -> Self {
        Self { conf_dir, config, store: None, provider: Arc::new(NoProvider) }
    }

    /// 设置推理服务，不设置时只能进行只读操作
    pub fn provider(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.provider = provider;
        self
    }

    /// 指定缓存目录，默认由配置目录和集合路径决定
    pub fn store(mut self, path: impl Into<PathBuf>) -> Self {
        self.store = Some(path.into());
        self
    }

    /// 打开缓存并从中加载当前模型的索引
    pub fn open(self) -> Result<Collection> {
        let provider = self.provider;
        let mut config = self.config;
        // 存在时使用规范路径，保证同一目录总是对应同一个缓存
        if let Ok(root) = config.root.canonicalize() {
            config.root = root;
        }
        let store = self.store.unwrap_or_else(|| self.conf_dir.collection_store(&config.root));
        std::fs::create_dir_all(&store)
            .with_context(|| format!("无法创建缓存目录 {}", store.display()))?;

        info!("打开集合 {}，缓存: {}", config.root.display(), store.display());
        let cache = Arc::new(FingerprintCache::open(&store)?);
        let index = Arc::new(VectorIndex::new(&config.model_id));
        index.rebuild_from(&cache, &config.model_id)?;
        metrics::set_indexed_count(&config.model_id, index.len());

        let reconciler =
            IndexReconciler::new(cache.clone(), index.clone(), provider.clone(), config.workers)?;

        Ok(Collection { config: RwLock::new(config), cache, index, provider, reconciler })
    }
}

/// 图片集合，对外提供同步与搜索
pub struct Collection {
    config: RwLock<CollectionConfig>,
    cache: Arc<FingerprintCache>,
    index: Arc<VectorIndex>,
    provider: Arc<dyn EmbeddingProvider>,
    reconciler: IndexReconciler,
}

impl Collection {
    pub fn config(&self) -> CollectionConfig {
        self.config.read().unwrap().clone()
    }

    pub fn root(&self) -> PathBuf {
        self.config.read().unwrap().root.clone()
    }

    pub fn model_id(&self) -> String {
        self.config.read().unwrap().model_id.clone()
    }

    pub fn is_indexing(&self) -> bool {
        self.reconciler.is_running()
    }

    /// 同步磁盘与索引，阻塞直到完成或被取消
    pub fn reconcile(
        &self,
        events: &EventSender,
        cancel: &CancellationToken,
    ) -> Result<ReconcileReport, ReconcileError> {
        let config = self.config();
        self.reconciler.reconcile(&config, events, cancel)
    }

    pub fn search_engine(&self) -> SearchEngine {
        SearchEngine::new(self.index.clone(), self.provider.clone(), self.model_id())
    }

    pub fn search(&self, query: &SearchQuery, k: usize) -> Result<Vec<SearchHit>, SearchError> {
        self.search_engine().search(query, k)
    }

    pub fn more_like(&self, path: &Path, k: usize) -> Result<Vec<SearchHit>, SearchError> {
        // 集合内的路径都是规范路径
        let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        self.search_engine().more_like(&path, k)
    }

    /// 切换模型，从缓存中重建索引，其他模型的缓存不受影响
    pub fn set_model(&self, model_id: &str) -> Result<usize, ReconcileError> {
        let _guard = self.reconciler.run_state().try_begin().ok_or(ReconcileError::AlreadyRunning)?;
        self.config.write().unwrap().model_id = model_id.to_string();
        let count = self.index.rebuild_from(&self.cache, model_id)?;
        metrics::set_indexed_count(model_id, count);
        Ok(count)
    }

    pub fn status(&self) -> Result<CollectionStatus, ReconcileError> {
        let config = self.config();
        Ok(CollectionStatus {
            root: config.root,
            model_id: config.model_id,
            indexed: self.index.len(),
            dim: self.index.dim(),
            cached: self.cache.models()?,
            indexing: self.is_indexing(),
        })
    }

    /// 删除某个模型或全部模型的缓存，返回删除的记录数
    pub fn clear(&self, model_id: Option<&str>) -> Result<usize, ReconcileError> {
        let _guard = self.reconciler.run_state().try_begin().ok_or(ReconcileError::AlreadyRunning)?;
        let current = self.model_id();
        let removed = match model_id {
            Some(model_id) => self.cache.remove_model(model_id)?,
            None => {
                let total = self.cache.models()?.values().sum();
                self.cache.clear()?;
                total
            }
        };
        if model_id.is_none_or(|m| m == current) {
            self.index.reset(&current);
            metrics::set_indexed_count(&current, 0);
        }
        info!("删除 {} 条缓存记录", removed);
        Ok(removed)
    }

    /// 将尚未提交的结果写入缓存
    pub fn flush(&self) -> Result<usize, ReconcileError> {
        Ok(self.cache.flush()?)
    }
}

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use log::{debug, info};
use rayon::prelude::*;
use serde::Serialize;

use crate::db::FingerprintCache;
use crate::error::SearchError;
use crate::utils::{dot, normalize};

/// 每个并行任务扫描的向量数量
const CHUNK_ENTRIES: usize = 2048;

/// 一条搜索结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub path: PathBuf,
    pub score: f32,
}

#[derive(Default)]
struct IndexInner {
    model_id: Option<String>,
    dim: usize,
    paths: Vec<PathBuf>,
    /// 按行连续存储的单位向量，第 i 行对应 `paths[i]`
    vectors: Vec<f32>,
    slots: HashMap<PathBuf, usize>,
}

impl IndexInner {
    fn reset(&mut self, model_id: Option<String>) {
        *self = Self { model_id, ..Default::default() };
    }

    fn row(&self, slot: usize) -> &[f32] {
        &self.vectors[slot * self.dim..(slot + 1) * self.dim]
    }

    fn upsert(&mut self, path: &Path, mut vector: Vec<f32>) -> Result<(), SearchError> {
        if vector.is_empty() {
            return Err(SearchError::DimensionMismatch { expected: self.dim, got: 0 });
        }
        if self.paths.is_empty() {
            self.dim = vector.len();
        } else if vector.len() != self.dim {
            return Err(SearchError::DimensionMismatch { expected: self.dim, got: vector.len() });
        }
        normalize(&mut vector);
        match self.slots.get(path) {
            Some(&slot) => {
                let dim = self.dim;
                self.vectors[slot * dim..(slot + 1) * dim].copy_from_slice(&vector);
            }
            None => {
                self.slots.insert(path.to_path_buf(), self.paths.len());
                self.paths.push(path.to_path_buf());
                self.vectors.extend_from_slice(&vector);
            }
        }
        Ok(())
    }

    fn remove(&mut self, path: &Path) -> bool {
        let Some(slot) = self.slots.remove(path) else {
            return false;
        };
        let last = self.paths.len() - 1;
        if slot != last {
            // 用最后一行填补空位
            let dim = self.dim;
            self.vectors.copy_within(last * dim..(last + 1) * dim, slot * dim);
            self.paths.swap(slot, last);
            self.slots.insert(self.paths[slot].clone(), slot);
        }
        self.paths.pop();
        self.vectors.truncate(last * self.dim);
        true
    }
}

/// 候选结果，`Ord` 中越“大”表示越好：分数更高，分数相同时路径字典序更小
struct Candidate<'a> {
    score: f32,
    path: &'a Path,
}

impl PartialEq for Candidate<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate<'_> {}

impl PartialOrd for Candidate<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score.total_cmp(&other.score).then_with(|| other.path.cmp(self.path))
    }
}

/// 保留最好的 k 个候选，堆顶为当前最差的一个
struct TopK<'a> {
    k: usize,
    heap: BinaryHeap<std::cmp::Reverse<Candidate<'a>>>,
}

impl<'a> TopK<'a> {
    fn new(k: usize) -> Self {
        Self { k, heap: BinaryHeap::with_capacity(k.saturating_add(1)) }
    }

    fn push(&mut self, candidate: Candidate<'a>) {
        if self.heap.len() < self.k {
            self.heap.push(std::cmp::Reverse(candidate));
        } else if let Some(std::cmp::Reverse(worst)) = self.heap.peek() {
            if candidate > *worst {
                self.heap.pop();
                self.heap.push(std::cmp::Reverse(candidate));
            }
        }
    }

    fn merge(mut self, other: Self) -> Self {
        for std::cmp::Reverse(c) in other.heap {
            self.push(c);
        }
        self
    }

    fn into_sorted(self) -> Vec<Candidate<'a>> {
        let mut v = self.heap.into_iter().map(|r| r.0).collect::<Vec<_>>();
        v.sort_unstable_by(|a, b| b.cmp(a));
        v
    }
}

/// 内存中的向量索引，只保存当前模型的向量
///
/// 读写通过 `RwLock` 隔离，查询期间不会看到写了一半的记录。
/// 向量在插入时归一化，查询时相似度即为点积。
#[derive(Default)]
pub struct VectorIndex {
    inner: RwLock<IndexInner>,
}

impl VectorIndex {
    pub fn new(model_id: impl Into<String>) -> Self {
        let index = Self::default();
        index.inner.write().unwrap().model_id = Some(model_id.into());
        index
    }

    /// 从缓存中完整加载某个模型的向量，用于冷启动或切换模型
    ///
    /// 加载在锁外完成，最后一次性替换，期间查询看到的仍是旧索引
    pub fn rebuild_from(&self, cache: &FingerprintCache, model_id: &str) -> heed::Result<usize> {
        let mut inner = IndexInner { model_id: Some(model_id.to_string()), ..Default::default() };
        let snapshot = cache.snapshot()?;
        let mut skipped = 0;
        for entry in snapshot.iterate(model_id)? {
            let entry = entry?;
            if inner.upsert(&entry.path, entry.vector).is_err() {
                skipped += 1;
            }
        }
        if skipped > 0 {
            info!("跳过 {} 条维数不一致的缓存记录", skipped);
        }
        let count = inner.paths.len();
        *self.inner.write().unwrap() = inner;
        info!("从缓存加载 {} 条向量，模型: {}", count, model_id);
        Ok(count)
    }

    /// 清空索引并绑定到新模型
    pub fn reset(&self, model_id: &str) {
        self.inner.write().unwrap().reset(Some(model_id.to_string()));
    }

    pub fn model_id(&self) -> Option<String> {
        self.inner.read().unwrap().model_id.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 向量维数，索引为空时为 `None`
    pub fn dim(&self) -> Option<usize> {
        let inner = self.inner.read().unwrap();
        (!inner.paths.is_empty()).then_some(inner.dim)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.inner.read().unwrap().slots.contains_key(path)
    }

    /// 获取已存储的（归一化后的）向量
    pub fn get(&self, path: &Path) -> Option<Vec<f32>> {
        let inner = self.inner.read().unwrap();
        inner.slots.get(path).map(|&slot| inner.row(slot).to_vec())
    }

    /// 插入或更新一条向量，维数必须与已有向量一致
    pub fn upsert(&self, path: &Path, vector: Vec<f32>) -> Result<(), SearchError> {
        self.inner.write().unwrap().upsert(path, vector)
    }

    pub fn remove(&self, path: &Path) -> bool {
        self.inner.write().unwrap().remove(path)
    }

    /// 穷举计算探针与所有向量的余弦相似度，返回分数最高的 k 条
    ///
    /// 分数相同时按路径字典序排列，保证结果确定
    pub fn query(&self, probe: &[f32], k: usize) -> Result<Vec<SearchHit>, SearchError> {
        self.query_filtered(probe, k, |_| true)
    }

    /// 与 [`VectorIndex::query`] 相同，但只考虑 `filter` 返回 `true` 的路径
    pub fn query_filtered<F>(&self, probe: &[f32], k: usize, filter: F) -> Result<Vec<SearchHit>, SearchError>
    where
        F: Fn(&Path) -> bool + Sync,
    {
        let inner = self.inner.read().unwrap();
        if inner.paths.is_empty() {
            return Err(SearchError::EmptyIndex);
        }
        if probe.len() != inner.dim {
            return Err(SearchError::DimensionMismatch { expected: inner.dim, got: probe.len() });
        }
        if k == 0 {
            return Ok(vec![]);
        }
        let k = k.min(inner.paths.len());

        let mut probe = probe.to_vec();
        normalize(&mut probe);

        let dim = inner.dim;
        let paths = &inner.paths;
        let top = inner
            .vectors
            .par_chunks(dim * CHUNK_ENTRIES)
            .enumerate()
            .map(|(chunk_no, chunk)| {
                let mut top = TopK::new(k);
                for (i, row) in chunk.chunks_exact(dim).enumerate() {
                    let path = paths[chunk_no * CHUNK_ENTRIES + i].as_path();
                    if filter(path) {
                        top.push(Candidate { score: dot(&probe, row), path });
                    }
                }
                top
            })
            .reduce(|| TopK::new(k), TopK::merge);

        let hits = top
            .into_sorted()
            .into_iter()
            .map(|c| SearchHit { path: c.path.to_path_buf(), score: c.score })
            .collect::<Vec<_>>();
        debug!("扫描 {} 条向量，返回 {} 条结果", paths.len(), hits.len());
        Ok(hits)
    }
}

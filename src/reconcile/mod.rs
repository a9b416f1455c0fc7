mod tasks;
mod types;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use log::{debug, info, warn};
use rayon::ThreadPool;
use rayon::prelude::*;
use tokio_util::sync::CancellationToken;

pub use types::*;

use crate::collection::CollectionConfig;
use crate::db::{EmbeddingEntry, FingerprintCache, RejectedEntry};
use crate::error::{EmbeddingError, ReconcileError, SearchError};
use crate::index::VectorIndex;
use crate::metrics;
use crate::provider::EmbeddingProvider;
use crate::scanner::{FileScanner, ImageRecord};
use tasks::Outcome;

/// 集合的同步状态，同一时间只允许一次同步
#[derive(Debug, Default)]
pub struct RunState {
    running: AtomicBool,
}

impl RunState {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn try_begin(&self) -> Option<RunGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunGuard(self))
    }
}

/// 释放时结束同步状态
pub struct RunGuard<'a>(&'a RunState);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::Release);
    }
}

/// 使磁盘上的文件、缓存与内存索引保持一致
pub struct IndexReconciler {
    cache: Arc<FingerprintCache>,
    index: Arc<VectorIndex>,
    provider: Arc<dyn EmbeddingProvider>,
    pool: ThreadPool,
    state: RunState,
}

impl IndexReconciler {
    pub fn new(
        cache: Arc<FingerprintCache>,
        index: Arc<VectorIndex>,
        provider: Arc<dyn EmbeddingProvider>,
        workers: usize,
    ) -> Result<Self, rayon::ThreadPoolBuildError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|i| format!("embed-{}", i))
            .build()?;
        Ok(Self { cache, index, provider, pool, state: RunState::default() })
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    /// 修改缓存的其他操作也需要持有同步状态
    pub fn run_state(&self) -> &RunState {
        &self.state
    }

    /// 对比扫描结果与缓存，计算需要完成的工作
    pub fn plan(
        &self,
        config: &CollectionConfig,
        mut records: Vec<ImageRecord>,
    ) -> Result<ReconcilePlan, ReconcileError> {
        let mut cached: HashMap<PathBuf, EmbeddingEntry> = {
            let snapshot = self.cache.snapshot()?;
            snapshot
                .iterate(&config.model_id)?
                .map(|entry| entry.map(|entry| (entry.path.clone(), entry)))
                .collect::<heed::Result<_>>()?
        };

        if config.verify_content {
            // 新文件的哈希在计算向量时顺便得到
            self.pool.install(|| {
                records
                    .par_iter_mut()
                    .filter(|record| cached.contains_key(&record.path))
                    .for_each(|record| {
                        if let Err(e) = record.fingerprint() {
                            debug!("计算哈希失败 {}: {}", record.path.display(), e);
                        }
                    })
            });
        }

        let mut plan = ReconcilePlan::default();
        for record in records {
            let Some(entry) = cached.remove(&record.path) else {
                plan.to_embed.push(record);
                continue;
            };
            let unchanged = entry.matches_snapshot(&record);
            if !config.verify_content {
                if !unchanged {
                    plan.to_embed.push(record);
                }
                continue;
            }
            match (record.content_fingerprint, entry.content_fingerprint) {
                (Some(current), Some(previous)) if current == previous => {
                    if !unchanged {
                        plan.to_refresh.push(refreshed(entry, &record));
                    }
                }
                // 旧记录没有哈希时信任快照，只补充哈希
                (Some(_), None) if unchanged => plan.to_refresh.push(refreshed(entry, &record)),
                _ => plan.to_embed.push(record),
            }
        }
        plan.to_remove = cached.into_keys().collect();

        plan.to_embed.sort_by(|a, b| a.path.cmp(&b.path));
        plan.to_remove.sort();
        Ok(plan)
    }

    /// 执行一次完整的同步
    ///
    /// 单个文件的失败只会记录在报告中。被取消时已经提交的结果会保留，
    /// 下次同步只处理剩余的文件。
    pub fn reconcile(
        &self,
        config: &CollectionConfig,
        events: &EventSender,
        cancel: &CancellationToken,
    ) -> Result<ReconcileReport, ReconcileError> {
        let _guard = self.state.try_begin().ok_or(ReconcileError::AlreadyRunning)?;
        let start = Instant::now();

        if self.index.model_id().as_deref() != Some(config.model_id.as_str()) {
            info!("切换模型为 {}，重建索引", config.model_id);
            self.index.rebuild_from(&self.cache, &config.model_id)?;
        }

        let total_estimate = self.cache.snapshot()?.count(&config.model_id)?;
        events.emit(IndexEvent::ScanStarted { total_estimate });

        let scanner = FileScanner::new(&config.root, &config.extensions);
        let mut scan = scanner.scan().map_err(|e| {
            warn!("无法扫描 {}: {}", config.root.display(), e);
            ReconcileError::RootMissing(config.root.clone())
        })?;
        let records = scan.by_ref().collect::<Vec<_>>();
        let warnings = scan.into_warnings();

        let mut report =
            ReconcileReport { scanned: records.len(), warnings: warnings.len(), ..Default::default() };

        let plan = self.plan(config, records)?;
        info!(
            "扫描到 {} 个文件，新增或修改 {} 个，删除 {} 个，更新时间戳 {} 个",
            report.scanned,
            plan.to_embed.len(),
            plan.to_remove.len(),
            plan.to_refresh.len()
        );

        // 删除操作对所有模型生效
        let removed: HashSet<PathBuf> = plan.to_remove.into_iter().collect();
        if !removed.is_empty() {
            self.cache.remove_all_for_paths(&removed)?;
            for path in &removed {
                self.index.remove(path);
            }
        }
        report.removed = removed.len();

        report.refreshed = plan.to_refresh.len();
        for entry in plan.to_refresh {
            self.cache.put(entry);
        }
        self.cache.flush()?;

        self.embed_all(config, &plan.to_embed, events, cancel, &mut report)?;

        metrics::set_indexed_count(&config.model_id, self.index.len());
        events.emit(IndexEvent::ReconciliationComplete {
            added: report.added,
            removed: report.removed,
            failed: report.failed.len(),
        });

        if report.cancelled {
            info!("同步已取消，已完成 {} 个文件", report.added);
        } else {
            info!(
                "同步完成，新增 {} 个，删除 {} 个，失败 {} 个，用时 {:.2?}",
                report.added,
                report.removed,
                report.failed.len(),
                start.elapsed()
            );
        }
        Ok(report)
    }

    /// 分批计算向量，每批结束后提交到缓存
    fn embed_all(
        &self,
        config: &CollectionConfig,
        records: &[ImageRecord],
        events: &EventSender,
        cancel: &CancellationToken,
        report: &mut ReconcileReport,
    ) -> Result<(), ReconcileError> {
        let total = records.len();
        let mut processed = 0;

        for batch in records.chunks(config.batch_size.max(1)) {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            tasks::embed_batch(
                &self.pool,
                &self.provider,
                &config.model_id,
                config.verify_content,
                batch,
                cancel,
                |outcome| {
                    let Outcome::Done(record, result) = outcome else {
                        return;
                    };
                    // 取消后到达的结果不再提交
                    if cancel.is_cancelled() {
                        return;
                    }
                    processed += 1;
                    let result = result.and_then(|vector| {
                        match self.index.upsert(&record.path, vector.clone()) {
                            Ok(()) => Ok(vector),
                            Err(SearchError::DimensionMismatch { expected, got }) => {
                                Err(EmbeddingError::InvalidDimension { expected, got })
                            }
                            Err(e) => Err(EmbeddingError::DecodeFailure(e.to_string())),
                        }
                    });
                    match result {
                        Ok(vector) => {
                            let entry = EmbeddingEntry::new(&record, &config.model_id, vector);
                            self.cache.put(entry);
                            report.added += 1;
                            metrics::inc_embedded(&config.model_id);
                            events.emit(IndexEvent::ItemIndexed {
                                path: record.path,
                                index: processed,
                                total,
                            });
                        }
                        Err(e) => self.fail(config, record.path, e.to_string(), events, report),
                    }
                },
            );

            // 无法持久化的向量同样视为失败
            for RejectedEntry { entry, reason } in self.cache.commit()?.rejected {
                report.added = report.added.saturating_sub(1);
                self.fail(config, entry.path, reason, events, report);
            }
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
        }
        Ok(())
    }

    /// 记录单个文件的失败，旧的向量已经过期，不再保留
    fn fail(
        &self,
        config: &CollectionConfig,
        path: PathBuf,
        reason: String,
        events: &EventSender,
        report: &mut ReconcileReport,
    ) {
        warn!("处理失败 {}: {}", path.display(), reason);
        self.cache.remove(&path, &config.model_id);
        self.index.remove(&path);
        metrics::inc_failed(&config.model_id);
        events.emit(IndexEvent::ItemFailed { path: path.clone(), reason: reason.clone() });
        report.failed.push(FailedItem { path, reason });
    }
}

/// 内容未变，只更新快照与哈希
fn refreshed(entry: EmbeddingEntry, record: &ImageRecord) -> EmbeddingEntry {
    EmbeddingEntry {
        size_bytes: record.size_bytes,
        modified_time: record.modified_time,
        content_fingerprint: record.content_fingerprint,
        ..entry
    }
}

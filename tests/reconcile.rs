use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime};

use clipsearch::reconcile::{EventSender, IndexEvent, event_channel};
use clipsearch::search::SearchQuery;
use clipsearch::{
    Collection, CollectionBuilder, CollectionConfig, EmbeddingError, EmbeddingProvider,
    ReconcileError, SearchError,
};
use rstest::*;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const DIM: usize = 8;

/// 由输入字节的哈希得到固定向量，内容以 `corrupt` 开头时视为无法解码
#[derive(Default)]
struct FakeProvider {
    image_calls: AtomicUsize,
    /// 第 n 次调用时取消同步
    cancel_at: Mutex<Option<(usize, CancellationToken)>>,
    delay: Option<Duration>,
}

impl FakeProvider {
    fn calls(&self) -> usize {
        self.image_calls.load(Ordering::SeqCst)
    }

    fn vector(model_id: &str, bytes: &[u8]) -> Vec<f32> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(model_id.as_bytes());
        hasher.update(bytes);
        hasher.finalize().as_bytes()[..DIM].iter().map(|&b| b as f32 - 127.5).collect()
    }
}

impl EmbeddingProvider for FakeProvider {
    fn embed_text(&self, model_id: &str, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Ok(Self::vector(model_id, text.as_bytes()))
    }

    fn embed_image(&self, model_id: &str, bytes: &[u8]) -> Result<Vec<f32>, EmbeddingError> {
        let n = self.image_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((at, token)) = &*self.cancel_at.lock().unwrap() {
            if n == *at {
                token.cancel();
            }
        }
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        if bytes.starts_with(b"corrupt") {
            return Err(EmbeddingError::DecodeFailure("not an image".to_string()));
        }
        Ok(Self::vector(model_id, bytes))
    }
}

struct Workspace {
    _root: TempDir,
    /// 规范化后的集合路径
    dir: PathBuf,
    conf: TempDir,
    provider: Arc<FakeProvider>,
}

impl Workspace {
    fn config(&self, model_id: &str) -> CollectionConfig {
        CollectionConfig {
            batch_size: 4,
            workers: 2,
            ..CollectionConfig::new(&self.dir, model_id)
        }
    }

    fn open_with(&self, config: CollectionConfig) -> Collection {
        CollectionBuilder::new(self.conf.path().to_str().unwrap().parse().unwrap(), config)
            .provider(self.provider.clone())
            .open()
            .unwrap()
    }

    fn open(&self) -> Collection {
        self.open_with(self.config("m"))
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn write(&self, name: &str, content: &str) {
        fs::write(self.dir.join(name), content).unwrap();
    }

    fn write_images(&self, range: std::ops::Range<usize>) {
        for i in range {
            self.write(&format!("img_{:03}.jpg", i), &format!("image {}", i));
        }
    }
}

fn reconcile(collection: &Collection) -> clipsearch::reconcile::ReconcileReport {
    collection.reconcile(&EventSender::none(), &CancellationToken::new()).unwrap()
}

fn set_mtime(path: &Path, offset: Duration) {
    let file = File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() + offset).unwrap();
}

#[fixture]
fn workspace() -> Workspace {
    let root = TempDir::new().unwrap();
    let dir = root.path().canonicalize().unwrap();
    Workspace {
        _root: root,
        dir,
        conf: TempDir::new().unwrap(),
        provider: Arc::new(FakeProvider::default()),
    }
}

#[rstest]
fn test_idempotent(workspace: Workspace) {
    workspace.write_images(0..10);
    let collection = workspace.open();

    let report = reconcile(&collection);
    assert_eq!(report.added, 10);
    assert_eq!(workspace.provider.calls(), 10);
    let before = collection.search(&SearchQuery::Text("image 3".into()), 5).unwrap();

    let report = reconcile(&collection);
    assert_eq!(report.added, 0);
    assert_eq!(report.removed, 0);
    assert_eq!(workspace.provider.calls(), 10);
    let after = collection.search(&SearchQuery::Text("image 3".into()), 5).unwrap();
    assert_eq!(before, after);
}

#[rstest]
fn test_incremental(workspace: Workspace) {
    workspace.write_images(0..10);
    let collection = workspace.open();
    reconcile(&collection);

    workspace.write_images(10..13);
    let report = reconcile(&collection);
    assert_eq!(report.added, 3);
    assert_eq!(workspace.provider.calls(), 13);
    assert_eq!(collection.status().unwrap().indexed, 13);
}

#[rstest]
fn test_edit_detected(workspace: Workspace) {
    workspace.write_images(0..5);
    let collection = workspace.open();
    reconcile(&collection);

    let path = workspace.path("img_002.jpg");
    fs::write(&path, "an entirely different picture").unwrap();
    set_mtime(&path, Duration::from_secs(10));

    let report = reconcile(&collection);
    assert_eq!(report.added, 1);
    assert_eq!(workspace.provider.calls(), 6);

    let query = SearchQuery::Image(b"an entirely different picture".to_vec());
    let hits = collection.search(&query, 1).unwrap();
    assert_eq!(hits[0].path, path);
    assert!((hits[0].score - 1.0).abs() < 1e-5);
}

#[rstest]
fn test_deleted_file_removed(workspace: Workspace) {
    workspace.write_images(0..5);
    let collection = workspace.open();
    reconcile(&collection);

    let path = workspace.path("img_001.jpg");
    fs::remove_file(&path).unwrap();
    let report = reconcile(&collection);
    assert_eq!(report.removed, 1);

    let status = collection.status().unwrap();
    assert_eq!(status.indexed, 4);
    assert_eq!(status.cached["m"], 4);
    assert!(matches!(collection.more_like(&path, 5), Err(SearchError::NotIndexed(_))));

    let hits = collection.search(&SearchQuery::Text("image 1".into()), 10).unwrap();
    assert!(hits.iter().all(|hit| hit.path != path));
}

#[rstest]
fn test_failure_isolated(workspace: Workspace) {
    workspace.write_images(0..10);
    workspace.write("broken.png", "corrupt bytes");
    let collection = workspace.open();

    let (events, rx) = event_channel(1024);
    let report = collection.reconcile(&events, &CancellationToken::new()).unwrap();
    drop(events);

    assert_eq!(report.added, 10);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].path, workspace.path("broken.png"));

    let events = rx.iter().collect::<Vec<_>>();
    assert!(matches!(events.first(), Some(IndexEvent::ScanStarted { total_estimate: 0 })));
    assert_eq!(
        events.last(),
        Some(&IndexEvent::ReconciliationComplete { added: 10, removed: 0, failed: 1 })
    );
    let failed = events.iter().filter(|e| matches!(e, IndexEvent::ItemFailed { .. })).count();
    assert_eq!(failed, 1);
    let mut indices = events
        .iter()
        .filter_map(|e| match e {
            IndexEvent::ItemIndexed { index, total, .. } => {
                assert_eq!(*total, 11);
                Some(*index)
            }
            _ => None,
        })
        .collect::<Vec<_>>();
    indices.sort();
    indices.dedup();
    assert_eq!(indices.len(), 10);

    // 失败的文件在下一次同步时重试
    let report = reconcile(&collection);
    assert_eq!(report.added, 0);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(workspace.provider.calls(), 12);
}

#[rstest]
fn test_cancel_and_resume(workspace: Workspace) {
    workspace.write_images(0..20);
    let config = CollectionConfig { batch_size: 1, ..workspace.config("m") };
    let collection = workspace.open_with(config);

    let cancel = CancellationToken::new();
    *workspace.provider.cancel_at.lock().unwrap() = Some((6, cancel.clone()));
    let report = collection.reconcile(&EventSender::none(), &cancel).unwrap();
    assert!(report.cancelled);
    assert_eq!(report.added, 5);
    assert_eq!(collection.status().unwrap().cached["m"], 5);

    *workspace.provider.cancel_at.lock().unwrap() = None;
    let calls = workspace.provider.calls();
    let report = reconcile(&collection);
    assert!(!report.cancelled);
    assert_eq!(report.added, 15);
    assert_eq!(workspace.provider.calls() - calls, 15);
    assert_eq!(collection.status().unwrap().indexed, 20);
}

#[rstest]
fn test_model_isolation(workspace: Workspace) {
    workspace.write_images(0..6);
    let collection = workspace.open();
    reconcile(&collection);
    let hits_a = collection.search(&SearchQuery::Text("image 0".into()), 3).unwrap();

    collection.set_model("other").unwrap();
    assert_eq!(collection.status().unwrap().indexed, 0);
    let report = reconcile(&collection);
    assert_eq!(report.added, 6);
    assert_eq!(workspace.provider.calls(), 12);

    // 切换回原模型不需要重新计算
    assert_eq!(collection.set_model("m").unwrap(), 6);
    let report = reconcile(&collection);
    assert_eq!(report.added, 0);
    assert_eq!(workspace.provider.calls(), 12);
    let hits = collection.search(&SearchQuery::Text("image 0".into()), 3).unwrap();
    assert_eq!(hits, hits_a);

    let status = collection.status().unwrap();
    assert_eq!(status.cached.get("m"), Some(&6));
    assert_eq!(status.cached.get("other"), Some(&6));
}

#[rstest]
fn test_long_path(workspace: Workspace) {
    workspace.write_images(0..5);
    let nested = ["a", "b", "c"]
        .iter()
        .fold(workspace.dir.clone(), |dir, c| dir.join(c.repeat(200)));
    fs::create_dir_all(&nested).unwrap();
    let long = nested.join("long.jpg");
    fs::write(&long, "image long").unwrap();
    assert!(long.as_os_str().len() > 600);

    {
        let collection = workspace.open();
        let report = reconcile(&collection);
        assert_eq!(report.added, 6);
        assert!(report.failed.is_empty());
        assert_eq!(collection.status().unwrap().cached.get("m"), Some(&6));
    }

    let collection = workspace.open();
    assert_eq!(collection.status().unwrap().indexed, 6);
    assert_eq!(collection.more_like(&long, 10).unwrap().len(), 5);
    assert_eq!(reconcile(&collection).added, 0);

    fs::remove_file(&long).unwrap();
    assert_eq!(reconcile(&collection).removed, 1);
    assert_eq!(collection.status().unwrap().cached.get("m"), Some(&5));
}

#[rstest]
fn test_unwritable_entries_fail_per_item(workspace: Workspace) {
    workspace.write_images(0..3);
    // 模型前缀本身可用，但加上路径摘要后超出键长度上限，每条记录都无法写入缓存
    let collection = workspace.open_with(workspace.config(&"m".repeat(480)));

    let (events, rx) = event_channel(1024);
    let report = collection.reconcile(&events, &CancellationToken::new()).unwrap();
    drop(events);

    assert_eq!(report.added, 0);
    assert_eq!(report.failed.len(), 3);
    assert_eq!(collection.status().unwrap().indexed, 0);
    assert_eq!(
        rx.iter().last(),
        Some(IndexEvent::ReconciliationComplete { added: 0, removed: 0, failed: 3 })
    );

    // 缓存仍然可用
    assert!(collection.status().unwrap().cached.is_empty());
    assert_eq!(reconcile(&collection).failed.len(), 3);
}

#[rstest]
fn test_persisted_across_reopen(workspace: Workspace) {
    workspace.write_images(0..8);
    let hits = {
        let collection = workspace.open();
        reconcile(&collection);
        collection.search(&SearchQuery::Text("image 5".into()), 4).unwrap()
    };

    let collection = workspace.open();
    assert_eq!(collection.status().unwrap().indexed, 8);
    assert_eq!(collection.search(&SearchQuery::Text("image 5".into()), 4).unwrap(), hits);
    assert_eq!(reconcile(&collection).added, 0);
    assert_eq!(workspace.provider.calls(), 8);
}

#[rstest]
fn test_root_missing(workspace: Workspace) {
    workspace.write_images(0..3);
    let root = workspace.dir.clone();
    {
        let collection = workspace.open();
        reconcile(&collection);
    }

    let moved = workspace.conf.path().join("moved");
    fs::rename(&root, &moved).unwrap();
    let collection = workspace.open();
    let err = collection.reconcile(&EventSender::none(), &CancellationToken::new()).unwrap_err();
    assert!(matches!(err, ReconcileError::RootMissing(_)));
    // 缓存保持不变
    assert_eq!(collection.status().unwrap().indexed, 3);
    fs::rename(&moved, &root).unwrap();
}

#[rstest]
fn test_already_running(mut workspace: Workspace) {
    workspace.provider = Arc::new(FakeProvider {
        delay: Some(Duration::from_millis(50)),
        ..Default::default()
    });
    workspace.write_images(0..20);
    let config = CollectionConfig { batch_size: 1, workers: 1, ..workspace.config("m") };
    let collection = Arc::new(workspace.open_with(config));

    let background = thread::spawn({
        let collection = collection.clone();
        move || collection.reconcile(&EventSender::none(), &CancellationToken::new())
    });
    while !collection.is_indexing() {
        thread::sleep(Duration::from_millis(1));
    }

    let err = collection.reconcile(&EventSender::none(), &CancellationToken::new()).unwrap_err();
    assert!(matches!(err, ReconcileError::AlreadyRunning));
    assert!(matches!(collection.clear(None), Err(ReconcileError::AlreadyRunning)));

    let report = background.join().unwrap().unwrap();
    assert_eq!(report.added, 20);
    assert!(!collection.is_indexing());
}

#[rstest]
fn test_verify_content(workspace: Workspace) {
    workspace.write_images(0..4);
    let config = CollectionConfig { verify_content: true, ..workspace.config("m") };
    let collection = workspace.open_with(config);
    reconcile(&collection);
    assert_eq!(workspace.provider.calls(), 4);

    // 只修改时间戳，内容不变
    set_mtime(&workspace.path("img_000.jpg"), Duration::from_secs(10));
    let report = reconcile(&collection);
    assert_eq!(report.refreshed, 1);
    assert_eq!(report.added, 0);
    assert_eq!(workspace.provider.calls(), 4);

    // 刷新后的快照不会再触发校验
    assert_eq!(reconcile(&collection).refreshed, 0);

    fs::write(workspace.path("img_001.jpg"), "changed").unwrap();
    set_mtime(&workspace.path("img_001.jpg"), Duration::from_secs(10));
    let report = reconcile(&collection);
    assert_eq!(report.added, 1);
    assert_eq!(workspace.provider.calls(), 5);
}

#[rstest]
fn test_verify_same_snapshot_edit(workspace: Workspace) {
    workspace.write_images(0..3);
    let path = workspace.path("img_002.jpg");
    let config = CollectionConfig { verify_content: true, ..workspace.config("m") };
    let collection = workspace.open_with(config);
    reconcile(&collection);

    // 大小和修改时间都不变，只有内容哈希能发现修改
    let mtime = fs::metadata(&path).unwrap().modified().unwrap();
    fs::write(&path, "image 9").unwrap();
    File::options().write(true).open(&path).unwrap().set_modified(mtime).unwrap();

    let report = reconcile(&collection);
    assert_eq!(report.added, 1);
    let hits = collection.search(&SearchQuery::Image(b"image 9".to_vec()), 1).unwrap();
    assert_eq!(hits[0].path, path);
}

#[rstest]
fn test_touch_without_verify(workspace: Workspace) {
    workspace.write_images(0..4);
    let collection = workspace.open();
    reconcile(&collection);

    set_mtime(&workspace.path("img_000.jpg"), Duration::from_secs(10));
    let report = reconcile(&collection);
    assert_eq!(report.added, 1);
    assert_eq!(report.refreshed, 0);
    assert_eq!(workspace.provider.calls(), 5);
}

#[rstest]
fn test_clear(workspace: Workspace) {
    workspace.write_images(0..3);
    let collection = workspace.open();
    reconcile(&collection);

    assert_eq!(collection.clear(Some("m")).unwrap(), 3);
    assert!(matches!(
        collection.search(&SearchQuery::Text("image 0".into()), 3),
        Err(SearchError::EmptyIndex)
    ));
    assert_eq!(reconcile(&collection).added, 3);
}

#[rstest]
fn test_more_like(workspace: Workspace) {
    workspace.write_images(0..6);
    let collection = workspace.open();
    reconcile(&collection);

    let path = workspace.path("img_004.jpg");
    let hits = collection.more_like(&path, 10).unwrap();
    assert_eq!(hits.len(), 5);
    assert!(hits.iter().all(|hit| hit.path != path));
    assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
}

use std::sync::Arc;

use crossbeam_channel::bounded;
use rayon::ThreadPool;
use tokio_util::sync::CancellationToken;

use crate::error::EmbeddingError;
use crate::provider::EmbeddingProvider;
use crate::scanner::ImageRecord;

/// 工作线程的处理结果
pub(super) enum Outcome {
    Done(ImageRecord, Result<Vec<f32>, EmbeddingError>),
    /// 开始处理前已被取消
    Skipped,
}

/// 读取文件并计算向量
fn embed_one(
    provider: &dyn EmbeddingProvider,
    model_id: &str,
    verify_content: bool,
    mut record: ImageRecord,
) -> Outcome {
    let data = match std::fs::read(&record.path) {
        Ok(data) => data,
        Err(e) => return Outcome::Done(record, Err(e.into())),
    };
    if verify_content {
        // 使用实际参与计算的字节，避免读取期间文件被修改
        record.content_fingerprint = Some(*blake3::hash(&data).as_bytes());
    }
    let result = provider.embed_image(model_id, &data);
    Outcome::Done(record, result)
}

/// 在线程池中并发处理一批文件，结果按完成顺序交给 `consume`
///
/// `consume` 在调用方线程中执行，所有写入都由它完成
pub(super) fn embed_batch<F>(
    pool: &ThreadPool,
    provider: &Arc<dyn EmbeddingProvider>,
    model_id: &str,
    verify_content: bool,
    batch: &[ImageRecord],
    cancel: &CancellationToken,
    mut consume: F,
) where
    F: FnMut(Outcome),
{
    let (tx, rx) = bounded(batch.len().max(1));
    pool.in_place_scope(|s| {
        for record in batch.iter().cloned() {
            let tx = tx.clone();
            s.spawn(move |_| {
                let outcome = if cancel.is_cancelled() {
                    Outcome::Skipped
                } else {
                    embed_one(provider.as_ref(), model_id, verify_content, record)
                };
                // 接收端只会在所有任务结束后释放
                let _ = tx.send(outcome);
            });
        }
        drop(tx);
        for outcome in rx.iter() {
            consume(outcome);
        }
    });
}

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::scanner::ImageRecord;

/// 缓存的嵌入向量记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingEntry {
    /// 图片路径
    pub path: PathBuf,
    /// 产生该向量的模型，不同模型的向量不可比较
    pub model_id: String,
    /// 嵌入向量，长度由模型决定
    pub vector: Vec<f32>,
    /// 计算时的文件大小
    pub size_bytes: u64,
    /// 计算时的修改时间
    pub modified_time: i64,
    /// 计算时的文件内容哈希，仅在启用内容校验时记录
    pub content_fingerprint: Option<[u8; 32]>,
}

impl EmbeddingEntry {
    pub fn new(record: &ImageRecord, model_id: impl Into<String>, vector: Vec<f32>) -> Self {
        Self {
            path: record.path.clone(),
            model_id: model_id.into(),
            vector,
            size_bytes: record.size_bytes,
            modified_time: record.modified_time,
            content_fingerprint: record.content_fingerprint,
        }
    }

    /// 文件大小和修改时间是否与快照一致
    pub fn matches_snapshot(&self, record: &ImageRecord) -> bool {
        self.size_bytes == record.size_bytes && self.modified_time == record.modified_time
    }
}

/// 存储在 meta 数据库中的键
pub(super) enum MetaKey {
    SchemaVersion,
}

impl AsRef<str> for MetaKey {
    fn as_ref(&self) -> &str {
        match self {
            Self::SchemaVersion => "schema_version",
        }
    }
}

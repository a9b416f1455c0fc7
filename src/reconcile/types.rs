use std::path::PathBuf;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use log::debug;
use serde::Serialize;

use crate::db::EmbeddingEntry;
use crate::scanner::ImageRecord;

/// 索引同步过程中发出的进度事件
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum IndexEvent {
    /// 开始扫描，`total_estimate` 为上次同步后缓存中的记录数
    ScanStarted { total_estimate: usize },
    /// 成功计算一个文件，`index` 从 1 开始计数，包含失败的文件
    ItemIndexed { path: PathBuf, index: usize, total: usize },
    ItemFailed { path: PathBuf, reason: String },
    /// 同步结束，被取消时同样会发出
    ReconciliationComplete { added: usize, removed: usize, failed: usize },
}

/// 事件发送端，发送不会阻塞，通道已满或接收端关闭时事件直接丢弃
#[derive(Clone, Default)]
pub struct EventSender(Option<Sender<IndexEvent>>);

impl EventSender {
    /// 不接收任何事件
    pub fn none() -> Self {
        Self(None)
    }

    pub fn emit(&self, event: IndexEvent) {
        let Some(tx) = &self.0 else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => debug!("事件通道已满，丢弃: {:?}", event),
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

/// 创建一个有界事件通道
pub fn event_channel(capacity: usize) -> (EventSender, Receiver<IndexEvent>) {
    let (tx, rx) = bounded(capacity);
    (EventSender(Some(tx)), rx)
}

/// 一次同步需要完成的工作
#[derive(Debug, Default)]
pub struct ReconcilePlan {
    /// 需要（重新）计算向量的文件
    pub to_embed: Vec<ImageRecord>,
    /// 已经不存在于磁盘上的路径
    pub to_remove: Vec<PathBuf>,
    /// 内容哈希未变、只需更新大小和修改时间的记录，仅在内容校验模式下出现
    pub to_refresh: Vec<EmbeddingEntry>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.to_embed.is_empty() && self.to_remove.is_empty() && self.to_refresh.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedItem {
    pub path: PathBuf,
    pub reason: String,
}

/// 同步结果
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    /// 扫描到的文件数量
    pub scanned: usize,
    /// 成功计算向量的文件数量
    pub added: usize,
    pub removed: usize,
    pub refreshed: usize,
    pub failed: Vec<FailedItem>,
    /// 扫描警告数量
    pub warnings: usize,
    pub cancelled: bool,
}

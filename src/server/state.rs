use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::collection::Collection;

/// 应用状态
pub struct AppState {
    /// 图片集合
    pub collection: Arc<Collection>,
    /// 鉴权 token
    pub token: String,
    /// 默认返回的结果数量
    pub count: usize,
    /// 服务关闭时取消后台同步
    pub shutdown: CancellationToken,
}

impl AppState {
    /// 创建新的应用状态
    pub fn new(
        collection: Arc<Collection>,
        token: String,
        count: usize,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(AppState { collection, token, count, shutdown })
    }
}

use std::time::Duration;

use log::debug;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;

use crate::error::EmbeddingError;

/// 嵌入模型的抽象能力，对同一个 `(model_id, input)` 必须返回相同的向量
///
/// 实现会在工作线程中被并发调用
pub trait EmbeddingProvider: Send + Sync {
    /// 将文本转换为向量
    fn embed_text(&self, model_id: &str, text: &str) -> Result<Vec<f32>, EmbeddingError>;
    /// 将图片原始字节转换为向量
    fn embed_image(&self, model_id: &str, bytes: &[u8]) -> Result<Vec<f32>, EmbeddingError>;
}

#[derive(Serialize)]
struct TextRequest<'a> {
    model: &'a str,
    text: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

/// 通过 HTTP 调用外部推理服务
///
/// - `POST {endpoint}/embed/text`，JSON `{model, text}`
/// - `POST {endpoint}/embed/image?model=...`，请求体为图片原始字节
///
/// 两者均返回 `{"embedding": [...]}`。请求在创建时所在的 tokio 运行时上执行，
/// 调用方线程会阻塞等待，因此不能在异步上下文中直接调用。
pub struct HttpEmbeddingProvider {
    endpoint: String,
    http: Client,
    handle: Handle,
}

impl HttpEmbeddingProvider {
    /// 必须在 tokio 运行时中创建
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, EmbeddingError> {
        let handle = Handle::try_current()
            .map_err(|e| EmbeddingError::Transport(format!("no tokio runtime: {}", e)))?;
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EmbeddingError::Transport(e.to_string()))?;
        Ok(Self { endpoint: endpoint.trim_end_matches('/').to_string(), http, handle })
    }

    fn send(&self, request: RequestBuilder) -> Result<Vec<f32>, EmbeddingError> {
        self.handle.block_on(async move {
            let resp =
                request.send().await.map_err(|e| EmbeddingError::Transport(e.to_string()))?;
            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(match status {
                    StatusCode::UNSUPPORTED_MEDIA_TYPE => EmbeddingError::UnsupportedFormat,
                    StatusCode::UNPROCESSABLE_ENTITY => EmbeddingError::DecodeFailure(body),
                    StatusCode::NOT_FOUND => EmbeddingError::ModelNotLoaded(body),
                    _ => EmbeddingError::Transport(format!("HTTP {}: {}", status, body)),
                });
            }
            let parsed: EmbeddingResponse = resp
                .json()
                .await
                .map_err(|e| EmbeddingError::Transport(format!("decode failed: {}", e)))?;
            if parsed.embedding.is_empty() {
                return Err(EmbeddingError::DecodeFailure("empty embedding".to_string()));
            }
            Ok(parsed.embedding)
        })
    }
}

impl EmbeddingProvider for HttpEmbeddingProvider {
    fn embed_text(&self, model_id: &str, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        debug!("embed text with {}: {:?}", model_id, text);
        let url = format!("{}/embed/text", self.endpoint);
        self.send(self.http.post(url).json(&TextRequest { model: model_id, text }))
    }

    fn embed_image(&self, model_id: &str, bytes: &[u8]) -> Result<Vec<f32>, EmbeddingError> {
        let url = format!("{}/embed/image", self.endpoint);
        self.send(
            self.http
                .post(url)
                .query(&[("model", model_id)])
                .header("content-type", "application/octet-stream")
                .body(bytes.to_vec()),
        )
    }
}

/// 未配置推理服务时使用，所有调用均失败
///
/// 只读操作（查看状态、清理缓存）不需要计算向量
pub struct NoProvider;

impl EmbeddingProvider for NoProvider {
    fn embed_text(&self, model_id: &str, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Err(EmbeddingError::ModelNotLoaded(format!("{} (no embedding service configured)", model_id)))
    }

    fn embed_image(&self, model_id: &str, _bytes: &[u8]) -> Result<Vec<f32>, EmbeddingError> {
        Err(EmbeddingError::ModelNotLoaded(format!("{} (no embedding service configured)", model_id)))
    }
}

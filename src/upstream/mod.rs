//! 昂贵的下游调用（模型推理），这里只定义接口和一个 HTTP 转发实现

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum AnswerError {
    #[error("upstream request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("upstream returned status {0}")]
    Status(u16),
}

/// 转发给下游的已清洗请求
#[derive(Debug, Clone, Serialize)]
pub struct AnswerRequest {
    pub operation: String,
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_content: Option<String>,
    pub intensive_mode: bool,
}

#[async_trait]
pub trait Answerer: Send + Sync {
    /// 写入缓存条目的 `produced_by`
    fn name(&self) -> &str;

    async fn answer(&self, request: &AnswerRequest) -> Result<Value, AnswerError>;
}

pub struct HttpAnswerer {
    client: reqwest::Client,
    url: String,
}

impl HttpAnswerer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl Answerer for HttpAnswerer {
    fn name(&self) -> &str {
        "http-upstream"
    }

    async fn answer(&self, request: &AnswerRequest) -> Result<Value, AnswerError> {
        let response = self.client.post(&self.url).json(request).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AnswerError::Status(status.as_u16()));
        }
        Ok(response.json().await?)
    }
}

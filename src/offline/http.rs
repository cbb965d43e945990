// 基于 reqwest 的写操作执行器

use crate::offline::operation::{HttpMethod, QueuedOperation};
use crate::offline::replay::MutationExecutor;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, Method};
use std::time::Duration;
use tracing::debug;

/// 幂等键请求头
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// HTTP 写操作执行器
///
/// 网络错误和非 2xx 状态码都视为失败
#[derive(Debug, Clone)]
pub struct HttpMutationExecutor {
    client: Client,
    default_headers: HeaderMap,
}

impl HttpMutationExecutor {
    /// 创建执行器
    ///
    /// # 参数
    /// * `timeout` - 单次请求超时
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            default_headers: HeaderMap::new(),
        })
    }

    /// 使用外部构造的客户端
    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            default_headers: HeaderMap::new(),
        }
    }

    /// 附加到每个请求上的请求头（例如认证信息）
    pub fn with_header(mut self, name: &'static str, value: &str) -> Result<Self> {
        let value = HeaderValue::from_str(value).context("请求头包含非法字符")?;
        self.default_headers.insert(name, value);
        Ok(self)
    }

    fn to_reqwest_method(method: HttpMethod) -> Method {
        match method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Head => Method::HEAD,
            HttpMethod::Options => Method::OPTIONS,
            HttpMethod::Post => Method::POST,
            HttpMethod::Put => Method::PUT,
            HttpMethod::Patch => Method::PATCH,
            HttpMethod::Delete => Method::DELETE,
        }
    }
}

#[async_trait]
impl MutationExecutor for HttpMutationExecutor {
    async fn execute(&self, op: &QueuedOperation) -> Result<()> {
        let mut request = self
            .client
            .request(Self::to_reqwest_method(op.method), &op.target_url)
            .headers(self.default_headers.clone())
            .header(IDEMPOTENCY_KEY_HEADER, &op.id);

        if let Some(ref payload) = op.payload {
            request = request.json(payload);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("回放请求发送失败: {} {}", op.method, op.target_url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!(
                "回放请求被拒绝: {} {} -> status={}, body={}",
                op.method,
                op.target_url,
                status.as_u16(),
                body
            );
        }

        debug!("回放请求成功: id={}, status={}", op.id, status);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_mapping() {
        assert_eq!(
            HttpMutationExecutor::to_reqwest_method(HttpMethod::Patch),
            Method::PATCH
        );
        assert_eq!(
            HttpMutationExecutor::to_reqwest_method(HttpMethod::Delete),
            Method::DELETE
        );
    }

    #[test]
    fn test_with_header_rejects_invalid_value() {
        let executor = HttpMutationExecutor::new(Duration::from_secs(5)).unwrap();
        assert!(executor.clone().with_header("Authorization", "Bearer abc").is_ok());
        assert!(executor.with_header("Authorization", "bad\nvalue").is_err());
    }

    #[tokio::test]
    async fn test_unreachable_host_is_failure() {
        let executor = HttpMutationExecutor::new(Duration::from_millis(500)).unwrap();
        let op = QueuedOperation::new(HttpMethod::Post, "http://127.0.0.1:9/items", None, 1).unwrap();
        assert!(executor.execute(&op).await.is_err());
    }
}

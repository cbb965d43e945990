// 离线写操作定义

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// HTTP 方法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Head,
    Options,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    /// 是否为写操作（只有写操作允许进入离线队列）
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            HttpMethod::Post | HttpMethod::Put | HttpMethod::Patch | HttpMethod::Delete
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "HEAD" => Ok(HttpMethod::Head),
            "OPTIONS" => Ok(HttpMethod::Options),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "PATCH" => Ok(HttpMethod::Patch),
            "DELETE" => Ok(HttpMethod::Delete),
            other => Err(format!("不支持的 HTTP 方法: {}", other)),
        }
    }
}

/// 排队中的写操作
///
/// 只由 `MutationQueue` 持有，对外只提供克隆
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
    /// 操作ID（服务端据此去重）
    pub id: String,
    /// HTTP 方法（只会是写方法）
    pub method: HttpMethod,
    /// 目标 URL
    pub target_url: String,
    /// 请求体
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    /// 入队时间 (Unix 毫秒)
    pub enqueued_at: i64,
    /// 已失败的回放次数
    #[serde(default)]
    pub retry_count: u32,
    /// 最大重试次数
    pub max_retries: u32,
}

impl QueuedOperation {
    /// 创建新的写操作
    ///
    /// 读方法返回 None
    pub fn new(
        method: HttpMethod,
        target_url: impl Into<String>,
        payload: Option<serde_json::Value>,
        max_retries: u32,
    ) -> Option<Self> {
        if !method.is_mutating() {
            return None;
        }
        Some(Self {
            id: Uuid::new_v4().to_string(),
            method,
            target_url: target_url.into(),
            payload,
            enqueued_at: chrono::Utc::now().timestamp_millis(),
            retry_count: 0,
            max_retries,
        })
    }

    /// 记录一次回放失败，返回新的失败次数
    pub fn record_failure(&mut self) -> u32 {
        self.retry_count += 1;
        self.retry_count
    }
}

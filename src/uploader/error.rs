//! 上传错误类型

use crate::uploader::task::TransferStatus;
use thiserror::Error;

/// 上传过程中可能出现的错误
#[derive(Debug, Error)]
pub enum UploadError {
    /// 网络错误（可重试）
    #[error("网络请求失败: {0}")]
    Network(String),

    /// 超时（可重试）
    #[error("请求超时: {0}")]
    Timeout(String),

    /// 服务器返回 4xx/5xx（与网络错误一样按通用策略重试）
    #[error("服务器拒绝请求: status={status}, body={body}")]
    ServerRejection { status: u16, body: String },

    /// 响应内容不符合协议
    #[error("响应格式无效: {0}")]
    Protocol(String),

    /// 用户取消（不重试）
    #[error("上传已取消")]
    Cancelled,

    /// 重试耗尽
    #[error("已达最大重试次数 (共尝试 {attempts} 次): {last}")]
    MaxRetriesExceeded {
        attempts: u32,
        last: Box<UploadError>,
    },

    /// 图片预处理失败
    #[error("图片处理失败: {0}")]
    Image(String),

    #[error("I/O 错误: {0}")]
    Io(#[from] std::io::Error),

    /// 后台上传任务异常退出
    #[error("上传任务异常: {0}")]
    Internal(String),

    #[error("非法状态切换: {from:?} -> {to:?}")]
    InvalidTransition {
        from: TransferStatus,
        to: TransferStatus,
    },
}

impl UploadError {
    /// 是否允许整体重试
    ///
    /// 4xx 也会被重试，这是已知的简化
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            UploadError::Network(_)
                | UploadError::Timeout(_)
                | UploadError::ServerRejection { .. }
                | UploadError::Protocol(_)
                | UploadError::Io(_)
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, UploadError::Cancelled)
    }
}

impl From<reqwest::Error> for UploadError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            UploadError::Timeout(e.to_string())
        } else if let Some(status) = e.status() {
            UploadError::ServerRejection {
                status: status.as_u16(),
                body: e.to_string(),
            }
        } else {
            UploadError::Network(e.to_string())
        }
    }
}

impl From<image::ImageError> for UploadError {
    fn from(e: image::ImageError) -> Self {
        UploadError::Image(e.to_string())
    }
}

// 上传传输状态定义
//
// 状态机：pending -> active -> {completed | failed | cancelled}
// active -> active 只允许作为整体重试；终态不可再进入 active

use crate::uploader::error::UploadError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 传输状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    /// 等待中
    Pending,
    /// 传输中
    Active,
    /// 已完成
    Completed,
    /// 失败
    Failed,
    /// 已取消
    Cancelled,
}

impl TransferStatus {
    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Cancelled
        )
    }
}

/// 上传策略
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UploadStrategy {
    /// 单次请求直传
    Direct,
    /// init/chunk/finalize 分片上传
    Chunked,
}

/// 单个文件的上传传输
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadTransfer {
    /// 传输ID
    pub id: String,
    /// 文件名
    pub file_name: String,
    /// 总字节数
    pub total_bytes: u64,
    /// 分片大小
    pub chunk_size: u64,
    /// 总分片数（直传为 1）
    pub total_chunks: usize,
    /// 服务端会话ID（init 成功后才会设置）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// 已确认的分片数
    pub chunks_sent: usize,
    /// 状态
    pub status: TransferStatus,
    /// 上传策略
    pub strategy: UploadStrategy,
    /// 第几次尝试（从 1 开始，pending 时为 0）
    pub attempt: u32,
    /// 创建时间 (Unix timestamp)
    pub created_at: i64,
    /// 完成时间 (Unix timestamp)
    pub completed_at: Option<i64>,
    /// 错误信息
    pub error: Option<String>,
}

impl UploadTransfer {
    /// 创建新的传输（每次调用都生成新ID）
    pub fn new(
        file_name: impl Into<String>,
        total_bytes: u64,
        chunk_size: u64,
        total_chunks: usize,
        strategy: UploadStrategy,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            file_name: file_name.into(),
            total_bytes,
            chunk_size,
            total_chunks,
            session_id: None,
            chunks_sent: 0,
            status: TransferStatus::Pending,
            strategy,
            attempt: 0,
            created_at: chrono::Utc::now().timestamp(),
            completed_at: None,
            error: None,
        }
    }

    /// 使用调用方预先分配的ID
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    fn transition(&mut self, to: TransferStatus) -> Result<(), UploadError> {
        let allowed = match (self.status, to) {
            (TransferStatus::Pending, TransferStatus::Active) => true,
            // 整体重试
            (TransferStatus::Active, TransferStatus::Active) => true,
            (TransferStatus::Active, TransferStatus::Completed) => true,
            (TransferStatus::Active, TransferStatus::Failed) => true,
            (TransferStatus::Pending, TransferStatus::Failed) => true,
            (TransferStatus::Pending, TransferStatus::Cancelled) => true,
            (TransferStatus::Active, TransferStatus::Cancelled) => true,
            _ => false,
        };

        if !allowed {
            return Err(UploadError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// 开始一次尝试
    ///
    /// 首次调用 pending -> active；之后的调用是整体重试，从头开始
    pub fn begin_attempt(&mut self) -> Result<u32, UploadError> {
        self.transition(TransferStatus::Active)?;
        self.attempt += 1;
        self.session_id = None;
        self.chunks_sent = 0;
        Ok(self.attempt)
    }

    /// 记录 init 阶段返回的会话ID
    pub fn set_session_id(&mut self, session_id: String) {
        self.session_id = Some(session_id);
    }

    /// 记录一个分片已被确认
    pub fn mark_chunk_sent(&mut self) {
        if self.chunks_sent < self.total_chunks {
            self.chunks_sent += 1;
        }
    }

    /// 标记为已完成
    pub fn mark_completed(&mut self) -> Result<(), UploadError> {
        self.transition(TransferStatus::Completed)?;
        self.completed_at = Some(chrono::Utc::now().timestamp());
        Ok(())
    }

    /// 标记为失败
    pub fn mark_failed(&mut self, error: String) -> Result<(), UploadError> {
        self.transition(TransferStatus::Failed)?;
        self.error = Some(error);
        Ok(())
    }

    /// 标记为已取消
    pub fn mark_cancelled(&mut self) -> Result<(), UploadError> {
        self.transition(TransferStatus::Cancelled)
    }
}

// 分片上传调度器
//
// 一次尝试的完整流程：
// 1. init: 提交文件名、大小、MIME 类型和分片数，获得 sessionId
// 2. chunk: 按索引顺序逐个上传分片，每个分片开始前检查取消
// 3. finalize: 提交 sessionId，返回服务器最终结果
//
// 已被服务器接受的分片不会回滚；失败时由上层决定是否整体重试

use crate::uploader::chunk::{ChunkPlan, UploadChunk};
use crate::uploader::error::UploadError;
use crate::uploader::events::ProgressReporter;
use crate::uploader::source::UploadFile;
use crate::uploader::task::UploadTransfer;
use crate::uploader::transport::{FilePart, MultipartRequest, Transport};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// 共享的传输状态
pub type SharedTransfer = Arc<Mutex<UploadTransfer>>;

/// init 响应中可接受的会话ID字段名
const SESSION_ID_FIELDS: [&str; 3] = ["sessionId", "session_id", "uploadId"];

/// 拼接接口地址
pub fn endpoint_url(endpoint: &str, phase: &str) -> String {
    format!("{}/{}", endpoint.trim_end_matches('/'), phase)
}

/// 从 init 响应中提取会话ID
pub fn parse_session_id(body: &serde_json::Value) -> Result<String, UploadError> {
    SESSION_ID_FIELDS
        .iter()
        .find_map(|field| match body.get(field) {
            Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(serde_json::Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })
        .ok_or_else(|| UploadError::Protocol(format!("init 响应缺少 sessionId: {}", body)))
}

/// 分片上传调度器
#[derive(Clone)]
pub struct ChunkScheduler {
    transport: Arc<dyn Transport>,
    endpoint: String,
    timeout: Option<Duration>,
    /// 附加到 init 请求的文本字段
    extra_fields: Vec<(String, String)>,
}

impl ChunkScheduler {
    /// 创建调度器
    ///
    /// # 参数
    /// * `transport` - 传输实现
    /// * `endpoint` - 上传根地址，init/chunk/finalize 拼接在其后
    /// * `timeout` - 单次请求超时
    pub fn new(
        transport: Arc<dyn Transport>,
        endpoint: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            transport,
            endpoint: endpoint.into(),
            timeout,
            extra_fields: Vec::new(),
        }
    }

    pub fn with_extra_fields(mut self, fields: Vec<(String, String)>) -> Self {
        self.extra_fields = fields;
        self
    }

    /// 执行一次完整的分片上传尝试
    pub async fn run(
        &self,
        file: &UploadFile,
        plan: &ChunkPlan,
        transfer: &SharedTransfer,
        reporter: &Arc<ProgressReporter>,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, UploadError> {
        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        let session_id = self.init(file, plan, cancel).await?;
        transfer.lock().set_session_id(session_id.clone());
        info!(
            "分片上传会话已创建: file={}, session_id={}, chunks={}",
            file.name,
            session_id,
            plan.chunk_count()
        );

        for chunk in plan.chunks() {
            if cancel.is_cancelled() {
                info!(
                    "分片上传已取消: file={}, 已完成分片 {}/{}",
                    file.name,
                    chunk.index,
                    plan.chunk_count()
                );
                return Err(UploadError::Cancelled);
            }

            self.upload_chunk(file, plan, chunk, &session_id, reporter, cancel)
                .await?;
            transfer.lock().mark_chunk_sent();
            reporter.report(chunk.range.end, true);
        }

        self.finalize(&session_id, cancel).await
    }

    async fn init(
        &self,
        file: &UploadFile,
        plan: &ChunkPlan,
        cancel: &CancellationToken,
    ) -> Result<String, UploadError> {
        let mut request = MultipartRequest::new(endpoint_url(&self.endpoint, "init"))
            .text("filename", file.name.clone())
            .text("size", file.size.to_string())
            .text("mimeType", file.mime_type.clone())
            .text("chunkCount", plan.chunk_count().to_string())
            .timeout(self.timeout);
        for (name, value) in &self.extra_fields {
            request = request.text(name.clone(), value.clone());
        }

        let response = self.transport.send(request, cancel).await?.error_for_status()?;
        parse_session_id(&response.json()?)
    }

    async fn upload_chunk(
        &self,
        file: &UploadFile,
        plan: &ChunkPlan,
        chunk: &UploadChunk,
        session_id: &str,
        reporter: &Arc<ProgressReporter>,
        cancel: &CancellationToken,
    ) -> Result<(), UploadError> {
        let data = file.read_range(chunk.range.clone()).await?;

        debug!(
            "上传分片: session_id={}, index={}/{}, size={}",
            session_id,
            chunk.index,
            plan.chunk_count(),
            data.len()
        );

        // 已完成分片字节数 + 本分片已交给传输层的字节数
        let base = chunk.range.start;
        let in_flight = Arc::new(AtomicU64::new(0));
        let progress_reporter = reporter.clone();
        let on_sent = Arc::new(move |n: u64| {
            let sent = in_flight.fetch_add(n, Ordering::SeqCst) + n;
            progress_reporter.report(base + sent, false);
        });

        let request = MultipartRequest::new(endpoint_url(&self.endpoint, "chunk"))
            .text("sessionId", session_id)
            .text("index", chunk.index.to_string())
            .text("chunkCount", plan.chunk_count().to_string())
            .file(FilePart::new(
                "chunk",
                file.name.clone(),
                "application/octet-stream",
                data,
            ))
            .timeout(self.timeout)
            .on_sent(on_sent);

        self.transport.send(request, cancel).await?.error_for_status()?;
        Ok(())
    }

    async fn finalize(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, UploadError> {
        let request = MultipartRequest::new(endpoint_url(&self.endpoint, "finalize"))
            .text("sessionId", session_id)
            .timeout(self.timeout);

        let response = self.transport.send(request, cancel).await?.error_for_status()?;
        response.json()
    }
}

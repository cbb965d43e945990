// 上传会话
//
// 负责：
// - 选择上传策略（直传 / 分片）
// - 图片预处理
// - 整体重试与取消
// - 活动传输注册表（按传输ID查询快照或取消）

use crate::common::{RetryDecision, RetryPolicy};
use crate::config::UploadConfig;
use crate::uploader::chunk::{ChunkPlan, DEFAULT_UPLOAD_CHUNK_SIZE};
use crate::uploader::controller::TransferController;
use crate::uploader::error::UploadError;
use crate::uploader::events::{ProgressReporter, UploadEvent};
use crate::uploader::preprocess::{preprocess_image, ImageOptions};
use crate::uploader::progress::DEFAULT_THROTTLE_INTERVAL_MS;
use crate::uploader::scheduler::{ChunkScheduler, SharedTransfer};
use crate::uploader::source::UploadFile;
use crate::uploader::task::{UploadStrategy, UploadTransfer};
use crate::uploader::transport::{FilePart, MultipartRequest, ReqwestTransport, Transport};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// 默认分片上传阈值: 1MiB（大于该值才分片）
pub const DEFAULT_CHUNKED_THRESHOLD: u64 = 1024 * 1024;

/// 默认单次请求超时（秒）
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

/// 分片上传选项
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkedOptions {
    pub enabled: bool,
    pub chunk_size: u64,
    /// 文件大小超过该值才使用分片上传
    pub threshold: u64,
}

impl Default for ChunkedOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            chunk_size: DEFAULT_UPLOAD_CHUNK_SIZE,
            threshold: DEFAULT_CHUNKED_THRESHOLD,
        }
    }
}

/// 单次上传调用的选项
#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// 直传地址，同时也是分片接口的根地址
    pub endpoint: String,
    pub chunked: ChunkedOptions,
    pub retry: RetryPolicy,
    /// 单次请求超时
    pub timeout: Option<Duration>,
    /// 图片预处理（仅对图片生效）
    pub image: Option<ImageOptions>,
    /// 附加文本字段（直传请求和 init 请求）
    pub extra_fields: Vec<(String, String)>,
    /// 分片内进度事件的最小间隔
    pub progress_interval: Duration,
    /// 事件订阅
    pub events: Option<UnboundedSender<UploadEvent>>,
}

impl UploadOptions {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            chunked: ChunkedOptions::default(),
            retry: RetryPolicy::default(),
            timeout: Some(Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS)),
            image: None,
            extra_fields: Vec::new(),
            progress_interval: Duration::from_millis(DEFAULT_THROTTLE_INTERVAL_MS),
            events: None,
        }
    }

    /// 从配置创建
    pub fn from_config(config: &UploadConfig) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            chunked: ChunkedOptions {
                enabled: config.chunked_enabled,
                chunk_size: config.chunk_size,
                threshold: config.chunked_threshold,
            },
            retry: RetryPolicy {
                max_retries: config.max_retries,
                initial_backoff_ms: config.initial_backoff_ms,
                max_backoff_ms: config.max_backoff_ms,
            },
            timeout: Some(Duration::from_secs(config.request_timeout_secs)),
            image: None,
            extra_fields: Vec::new(),
            progress_interval: Duration::from_millis(config.progress_interval_ms),
            events: None,
        }
    }

    pub fn with_chunked(mut self, chunked: ChunkedOptions) -> Self {
        self.chunked = chunked;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_image(mut self, image: ImageOptions) -> Self {
        self.image = Some(image);
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_fields.push((name.into(), value.into()));
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn with_events(mut self, sender: UnboundedSender<UploadEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    /// 根据文件大小选择上传策略
    pub fn strategy_for(&self, size: u64) -> UploadStrategy {
        if self.chunked.enabled && size > self.chunked.threshold {
            UploadStrategy::Chunked
        } else {
            UploadStrategy::Direct
        }
    }
}

/// 上传结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResult {
    pub transfer_id: String,
    pub file_name: String,
    pub size: u64,
    pub strategy: UploadStrategy,
    /// 分片上传的会话ID
    pub session_id: Option<String>,
    /// 成功时是第几次尝试
    pub attempts: u32,
    /// 服务器最终响应（直传响应或 finalize 响应）
    pub response: serde_json::Value,
}

/// 后台上传句柄
#[derive(Debug)]
pub struct UploadHandle {
    pub transfer_id: String,
    pub controller: TransferController,
    /// 事件订阅，丢弃即退订
    pub events: UnboundedReceiver<UploadEvent>,
    pub task: JoinHandle<Result<UploadResult, UploadError>>,
}

impl UploadHandle {
    pub fn cancel(&self) {
        self.controller.cancel();
    }

    /// 等待上传结束
    pub async fn wait(self) -> Result<UploadResult, UploadError> {
        self.task
            .await
            .map_err(|e| UploadError::Internal(e.to_string()))?
    }
}

/// 注册表中的活动传输
#[derive(Debug, Clone)]
struct TransferEntry {
    transfer: SharedTransfer,
    controller: TransferController,
}

/// 传输收尾守卫
///
/// 上传结束或上传 future 被丢弃时移除注册表条目。
/// 被丢弃时如果还没有发布终态事件，按取消处理并补发 Cancelled
struct TransferGuard {
    id: String,
    transfers: Arc<DashMap<String, TransferEntry>>,
    /// 登记之前发布终态事件用
    events: Option<UnboundedSender<UploadEvent>>,
    /// 登记之后才有
    registered: Option<(SharedTransfer, Arc<ProgressReporter>)>,
    settled: bool,
}

impl TransferGuard {
    fn new(
        id: String,
        transfers: Arc<DashMap<String, TransferEntry>>,
        events: Option<UnboundedSender<UploadEvent>>,
    ) -> Self {
        Self {
            id,
            transfers,
            events,
            registered: None,
            settled: false,
        }
    }

    fn attach(&mut self, transfer: SharedTransfer, reporter: Arc<ProgressReporter>) {
        self.registered = Some((transfer, reporter));
    }

    /// 发布终态事件
    fn settle(&mut self, event: UploadEvent) {
        self.settled = true;
        match self.registered {
            Some((_, ref reporter)) => reporter.finish(event),
            None => {
                if let Some(ref events) = self.events {
                    let _ = events.send(event);
                }
            }
        }
    }
}

impl Drop for TransferGuard {
    fn drop(&mut self) {
        if !self.settled {
            warn!("上传未结束即被丢弃，按取消处理: id={}", self.id);
            if let Some((ref transfer, _)) = self.registered {
                let mut t = transfer.lock();
                if !t.status.is_terminal() {
                    if let Err(e) = t.mark_cancelled() {
                        warn!("更新传输状态失败: id={}, {}", self.id, e);
                    }
                }
            }
            self.settle(UploadEvent::Cancelled {
                transfer_id: self.id.clone(),
            });
        }
        if self.registered.is_some() {
            self.transfers.remove(&self.id);
        }
    }
}

/// 上传会话
///
/// 克隆后共享同一个传输层、活动传输注册表和关闭令牌
#[derive(Clone)]
pub struct UploadSession {
    transport: Arc<dyn Transport>,
    transfers: Arc<DashMap<String, TransferEntry>>,
    /// 所有传输控制器的父令牌
    shutdown: CancellationToken,
}

impl UploadSession {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            transfers: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// 使用 reqwest 传输创建会话
    pub fn with_reqwest(connect_timeout: Duration) -> Result<Self, UploadError> {
        Ok(Self::new(Arc::new(ReqwestTransport::new(connect_timeout)?)))
    }

    /// 上传单个文件并等待结果
    ///
    /// 返回的 future 被丢弃时，传输按取消处理
    pub async fn upload_file(
        &self,
        file: UploadFile,
        options: UploadOptions,
    ) -> Result<UploadResult, UploadError> {
        let controller = TransferController::child_of(&self.shutdown);
        self.execute(Uuid::new_v4().to_string(), file, options, controller)
            .await
    }

    /// 在后台启动上传
    ///
    /// 立即返回句柄，图片预处理期间也可以取消；
    /// 句柄包含事件订阅，`options.events` 会被替换为该订阅
    pub fn start_upload(&self, file: UploadFile, mut options: UploadOptions) -> UploadHandle {
        let transfer_id = Uuid::new_v4().to_string();
        let controller = TransferController::child_of(&self.shutdown);

        let (tx, rx) = mpsc::unbounded_channel();
        options.events = Some(tx);

        let session = self.clone();
        let id = transfer_id.clone();
        let task_controller = controller.clone();
        let task =
            tokio::spawn(async move { session.execute(id, file, options, task_controller).await });

        UploadHandle {
            transfer_id,
            controller,
            events: rx,
            task,
        }
    }

    /// 并发上传多个文件，结果顺序与输入一致
    pub async fn upload_multiple(
        &self,
        files: Vec<UploadFile>,
        options: UploadOptions,
    ) -> Vec<Result<UploadResult, UploadError>> {
        info!("批量上传: {} 个文件", files.len());
        let uploads = files
            .into_iter()
            .map(|file| self.upload_file(file, options.clone()));
        futures::future::join_all(uploads).await
    }

    /// 取消活动传输，传输不存在时返回 false
    pub fn cancel(&self, transfer_id: &str) -> bool {
        match self.transfers.get(transfer_id) {
            Some(entry) => {
                entry.controller.cancel();
                true
            }
            None => false,
        }
    }

    /// 取消会话中的所有上传（包括仍在预处理的）
    ///
    /// 之后在该会话上启动的上传会直接以取消结束
    pub fn cancel_all(&self) {
        info!("取消所有上传: 活动传输 {} 个", self.transfers.len());
        self.shutdown.cancel();
    }

    /// 活动传输的状态快照
    pub fn transfer(&self, transfer_id: &str) -> Option<UploadTransfer> {
        self.transfers
            .get(transfer_id)
            .map(|entry| entry.transfer.lock().clone())
    }

    /// 所有活动传输的快照
    pub fn active_transfers(&self) -> Vec<UploadTransfer> {
        self.transfers
            .iter()
            .map(|entry| entry.transfer.lock().clone())
            .collect()
    }

    /// 预处理、登记并执行上传，保证恰好一个终态事件
    async fn execute(
        &self,
        id: String,
        file: UploadFile,
        options: UploadOptions,
        controller: TransferController,
    ) -> Result<UploadResult, UploadError> {
        let mut guard = TransferGuard::new(
            id.clone(),
            self.transfers.clone(),
            options.events.clone(),
        );

        let file = match self.preprocess(file, &options, &controller).await {
            Ok(file) => file,
            Err(e) if e.is_cancelled() => {
                info!("上传在预处理阶段被取消: id={}", id);
                guard.settle(UploadEvent::Cancelled {
                    transfer_id: id.clone(),
                });
                return Err(e);
            }
            Err(e) => {
                error!("上传预处理失败: id={}, 错误: {}", id, e);
                guard.settle(UploadEvent::Failed {
                    transfer_id: id.clone(),
                    error: e.to_string(),
                });
                return Err(e);
            }
        };

        let (plan, transfer) = self.register(&id, &file, &options, &controller);
        let reporter = Arc::new(ProgressReporter::new(
            id.clone(),
            file.size,
            options.progress_interval,
            options.events.clone(),
        ));
        guard.attach(transfer.clone(), reporter.clone());
        let cancel = controller.token();

        let outcome = self
            .run_attempts(&file, plan.as_ref(), &transfer, &reporter, &options, &cancel)
            .await;

        match outcome {
            Ok((response, attempts)) => {
                let (strategy, session_id) = {
                    let mut t = transfer.lock();
                    if let Err(e) = t.mark_completed() {
                        warn!("更新传输状态失败: id={}, {}", id, e);
                    }
                    (t.strategy, t.session_id.clone())
                };
                reporter.complete();
                guard.settle(UploadEvent::Completed {
                    transfer_id: id.clone(),
                    response: response.clone(),
                });
                info!(
                    "上传完成: id={}, file={}, attempts={}",
                    id, file.name, attempts
                );
                Ok(UploadResult {
                    transfer_id: id,
                    file_name: file.name.clone(),
                    size: file.size,
                    strategy,
                    session_id,
                    attempts,
                    response,
                })
            }
            Err(e) if e.is_cancelled() => {
                if let Err(err) = transfer.lock().mark_cancelled() {
                    warn!("更新传输状态失败: id={}, {}", id, err);
                }
                guard.settle(UploadEvent::Cancelled {
                    transfer_id: id.clone(),
                });
                info!("上传已取消: id={}, file={}", id, file.name);
                Err(e)
            }
            Err(e) => {
                if let Err(err) = transfer.lock().mark_failed(e.to_string()) {
                    warn!("更新传输状态失败: id={}, {}", id, err);
                }
                guard.settle(UploadEvent::Failed {
                    transfer_id: id.clone(),
                    error: e.to_string(),
                });
                error!("上传失败: id={}, file={}, 错误: {}", id, file.name, e);
                Err(e)
            }
        }
    }

    /// 图片预处理，可被取消
    async fn preprocess(
        &self,
        file: UploadFile,
        options: &UploadOptions,
        controller: &TransferController,
    ) -> Result<UploadFile, UploadError> {
        let file = match options.image {
            Some(ref image) if file.is_image() => {
                tokio::select! {
                    biased;
                    _ = controller.cancelled() => return Err(UploadError::Cancelled),
                    processed = preprocess_image(file, image) => processed?,
                }
            }
            _ => file,
        };

        if controller.is_cancelled() {
            return Err(UploadError::Cancelled);
        }
        Ok(file)
    }

    /// 选择策略并登记到活动传输注册表
    fn register(
        &self,
        id: &str,
        file: &UploadFile,
        options: &UploadOptions,
        controller: &TransferController,
    ) -> (Option<ChunkPlan>, SharedTransfer) {
        let strategy = options.strategy_for(file.size);
        let plan = match strategy {
            UploadStrategy::Chunked => Some(ChunkPlan::new(file.size, options.chunked.chunk_size)),
            UploadStrategy::Direct => None,
        };
        let (chunk_size, total_chunks) = plan
            .as_ref()
            .map(|p| (p.chunk_size(), p.chunk_count()))
            .unwrap_or((file.size, 1));

        let transfer = UploadTransfer::new(
            file.name.clone(),
            file.size,
            chunk_size,
            total_chunks,
            strategy,
        )
        .with_id(id);
        let transfer = Arc::new(Mutex::new(transfer));

        self.transfers.insert(
            id.to_string(),
            TransferEntry {
                transfer: transfer.clone(),
                controller: controller.clone(),
            },
        );

        info!(
            "创建上传传输: id={}, file={}, size={}, strategy={:?}, chunks={}",
            id, file.name, file.size, strategy, total_chunks
        );

        (plan, transfer)
    }

    /// 按重试策略执行尝试，每次重试都从头开始
    async fn run_attempts(
        &self,
        file: &UploadFile,
        plan: Option<&ChunkPlan>,
        transfer: &SharedTransfer,
        reporter: &Arc<ProgressReporter>,
        options: &UploadOptions,
        cancel: &CancellationToken,
    ) -> Result<(serde_json::Value, u32), UploadError> {
        let scheduler = ChunkScheduler::new(
            self.transport.clone(),
            options.endpoint.clone(),
            options.timeout,
        )
        .with_extra_fields(options.extra_fields.clone());
        let mut failures = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(UploadError::Cancelled);
            }

            let attempt = transfer.lock().begin_attempt()?;
            reporter.reset();

            let outcome = match plan {
                Some(plan) => scheduler.run(file, plan, transfer, reporter, cancel).await,
                None => self.upload_direct(file, options, reporter, cancel).await,
            };

            let error = match outcome {
                Ok(response) => return Ok((response, attempt)),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => e,
            };

            failures += 1;
            match options.retry.decide(failures, error.is_retriable()) {
                RetryDecision::Retry { delay } => {
                    warn!(
                        "上传失败，{}ms 后整体重试 ({}/{}): file={}, 错误: {}",
                        delay.as_millis(),
                        failures,
                        options.retry.max_retries,
                        file.name,
                        error
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(UploadError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                RetryDecision::GiveUp => {
                    if error.is_retriable() && options.retry.max_retries > 0 {
                        return Err(UploadError::MaxRetriesExceeded {
                            attempts: failures,
                            last: Box::new(error),
                        });
                    }
                    return Err(error);
                }
            }
        }
    }

    /// 单次请求直传
    async fn upload_direct(
        &self,
        file: &UploadFile,
        options: &UploadOptions,
        reporter: &Arc<ProgressReporter>,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, UploadError> {
        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        let data = file.read_all().await?;
        let sent = Arc::new(AtomicU64::new(0));
        let progress_reporter = reporter.clone();
        let on_sent = Arc::new(move |n: u64| {
            let loaded = sent.fetch_add(n, Ordering::SeqCst) + n;
            progress_reporter.report(loaded, false);
        });

        let mut request = MultipartRequest::new(options.endpoint.clone());
        for (name, value) in &options.extra_fields {
            request = request.text(name.clone(), value.clone());
        }
        let request = request
            .file(FilePart::new(
                "file",
                file.name.clone(),
                file.mime_type.clone(),
                data,
            ))
            .timeout(options.timeout)
            .on_sent(on_sent);

        let response = self.transport.send(request, cancel).await?.error_for_status()?;
        response.json()
    }
}

// 弱网环境下的可靠传输库
//
// - 离线写操作队列：断网时持久化写请求，恢复在线后按顺序回放
// - 可恢复上传：大文件分片上传，支持重试、取消和进度事件

// 公共模块（重试策略、网络状态）
pub mod common;

// 配置管理模块
pub mod config;

// 日志模块
pub mod logging;

// 离线写操作队列模块
pub mod offline;

// 上传模块
pub mod uploader;

// 导出常用类型
pub use common::{NetworkMonitor, RetryDecision, RetryPolicy};
pub use config::{AppConfig, LogConfig, QueueConfig, UploadConfig};
pub use offline::{
    DurableStore, FileStore, HttpMethod, HttpMutationExecutor, MemoryStore, MutationExecutor,
    MutationQueue, QueuedOperation, ReplayEngine, ReplayReport,
};
pub use uploader::{
    ChunkPlan, FitMode, ImageOptions, ReqwestTransport, TransferController, TransferStatus,
    Transport, UploadError, UploadEvent, UploadFile, UploadHandle, UploadOptions, UploadProgress,
    UploadResult, UploadSession, UploadStrategy, UploadTransfer,
};

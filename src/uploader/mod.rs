// 上传模块
//
// - 直传：单个 multipart 请求
// - 分片上传：init -> 顺序上传分片 -> finalize
// - 失败时整体重试（指数退避），每个传输可单独取消
// - 进度通过事件通道发布，分片内部节流

pub mod chunk;
pub mod controller;
pub mod error;
pub mod events;
pub mod preprocess;
pub mod progress;
pub mod scheduler;
pub mod session;
pub mod source;
pub mod task;
pub mod transport;

pub use chunk::{ChunkPlan, UploadChunk, DEFAULT_UPLOAD_CHUNK_SIZE};
pub use controller::TransferController;
pub use error::UploadError;
pub use events::{ProgressReporter, UploadEvent};
pub use preprocess::{
    compute_target_dimensions, preprocess_image, FitMode, ImageOptions, OutputFormat,
};
pub use progress::{ProgressSample, ProgressThrottler, ProgressTracker, UploadProgress};
pub use scheduler::ChunkScheduler;
pub use session::{
    ChunkedOptions, UploadHandle, UploadOptions, UploadResult, UploadSession,
    DEFAULT_CHUNKED_THRESHOLD,
};
pub use source::{guess_mime_type, UploadFile, UploadSource};
pub use task::{TransferStatus, UploadStrategy, UploadTransfer};
pub use transport::{
    FilePart, MultipartRequest, ReqwestTransport, SentCallback, Transport, TransportResponse,
};

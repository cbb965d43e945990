// 配置管理模块

use crate::offline::FileStore;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 离线队列配置
    #[serde(default)]
    pub queue: QueueConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
        }
    }
}

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 上传地址（分片接口为 {endpoint}/init、/chunk、/finalize）
    #[serde(default = "default_upload_endpoint")]
    pub endpoint: String,
    /// 分片大小（字节，默认 1MiB）
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// 是否启用分片上传
    #[serde(default = "default_chunked_enabled")]
    pub chunked_enabled: bool,
    /// 文件大小超过该值才分片（字节，默认 1MiB）
    #[serde(default = "default_chunked_threshold")]
    pub chunked_threshold: u64,
    /// 单次请求超时（秒）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// 最大重试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 初始退避延迟（毫秒）
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// 最大退避延迟（毫秒）
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// 分片内进度事件最小间隔（毫秒）
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
}

fn default_upload_endpoint() -> String {
    "http://127.0.0.1:8080/upload".to_string()
}

fn default_chunk_size() -> u64 {
    crate::uploader::DEFAULT_UPLOAD_CHUNK_SIZE
}

fn default_chunked_enabled() -> bool {
    true
}

fn default_chunked_threshold() -> u64 {
    crate::uploader::DEFAULT_CHUNKED_THRESHOLD
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    crate::common::DEFAULT_MAX_RETRIES
}

fn default_initial_backoff_ms() -> u64 {
    crate::common::INITIAL_BACKOFF_MS
}

fn default_max_backoff_ms() -> u64 {
    crate::common::MAX_BACKOFF_MS
}

fn default_progress_interval_ms() -> u64 {
    200
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            endpoint: default_upload_endpoint(),
            chunk_size: default_chunk_size(),
            chunked_enabled: default_chunked_enabled(),
            chunked_threshold: default_chunked_threshold(),
            request_timeout_secs: default_request_timeout_secs(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            progress_interval_ms: default_progress_interval_ms(),
        }
    }
}

/// 离线写操作队列配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// 队列持久化目录
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,
    /// 存储键（对应 {storage_dir}/{storage_key}.json）
    #[serde(default = "default_storage_key")]
    pub storage_key: String,
    /// 队列容量，超出时淘汰最早的操作
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
    /// 每个操作的默认最大重试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 回放时单个请求的超时（秒）
    #[serde(default = "default_replay_timeout_secs")]
    pub replay_timeout_secs: u64,
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("data/queue")
}

fn default_storage_key() -> String {
    "pending-mutations".to_string()
}

fn default_queue_capacity() -> usize {
    100
}

fn default_replay_timeout_secs() -> u64 {
    30
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            storage_key: default_storage_key(),
            capacity: default_queue_capacity(),
            max_retries: default_max_retries(),
            replay_timeout_secs: default_replay_timeout_secs(),
        }
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;
        config.validate()?;

        Ok(config)
    }

    /// 检查取值范围
    pub fn validate(&self) -> Result<()> {
        if self.upload.endpoint.trim().is_empty() {
            anyhow::bail!("配置错误：upload.endpoint 不能为空");
        }
        if self.upload.chunk_size == 0 {
            anyhow::bail!("配置错误：upload.chunk_size 必须大于 0");
        }
        if self.queue.capacity == 0 {
            anyhow::bail!("配置错误：queue.capacity 必须大于 0");
        }
        if !FileStore::is_valid_key(&self.queue.storage_key) {
            anyhow::bail!(
                "配置错误：queue.storage_key 只能包含字母、数字、'-'、'_'、'.': {:?}",
                self.queue.storage_key
            );
        }
        if self.upload.initial_backoff_ms > self.upload.max_backoff_ms {
            anyhow::bail!(
                "配置错误：initial_backoff_ms ({}) 大于 max_backoff_ms ({})",
                self.upload.initial_backoff_ms,
                self.upload.max_backoff_ms
            );
        }
        Ok(())
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);
        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();

                // 尝试保存默认配置
                if let Err(e) = default_config.save_to_file(path).await {
                    tracing::error!("保存默认配置失败: {}", e);
                }

                default_config
            }
        }
    }
}

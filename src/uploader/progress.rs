//! 上传进度计算
//!
//! - [`ProgressTracker`]: 根据相邻两次采样计算已传字节、百分比、速度和剩余时间
//! - [`ProgressThrottler`]: 控制分片内部进度事件的发布频率，避免事件风暴

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 默认节流间隔（毫秒）
pub const DEFAULT_THROTTLE_INTERVAL_MS: u64 = 200;

/// 进度采样（只用于计算相邻两次之间的瞬时速度）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSample {
    pub loaded_bytes: u64,
    pub total_bytes: u64,
    pub timestamp_ms: u64,
}

/// 对外发布的进度
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UploadProgress {
    /// 已上传字节数
    pub loaded: u64,
    /// 总字节数
    pub total: u64,
    /// 百分比 (0-100)
    pub percentage: f64,
    /// 速度 (bytes/s)
    pub speed: f64,
    /// 预计剩余时间（秒），速度为 0 时无法估算
    pub eta_secs: Option<f64>,
}

/// 进度跟踪器
///
/// 单次尝试内已传字节只增不减；整体重试时创建新的跟踪器
#[derive(Debug)]
pub struct ProgressTracker {
    total: u64,
    start: Instant,
    last: Option<ProgressSample>,
    speed: f64,
}

impl ProgressTracker {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            start: Instant::now(),
            last: None,
            speed: 0.0,
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// 当前已记录的字节数
    pub fn loaded(&self) -> u64 {
        self.last.map(|s| s.loaded_bytes).unwrap_or(0)
    }

    /// 使用当前时间采样
    pub fn record(&mut self, loaded: u64) -> UploadProgress {
        let now_ms = self.start.elapsed().as_millis() as u64;
        self.record_at(loaded, now_ms)
    }

    /// 使用指定时间戳采样
    ///
    /// # 参数
    /// * `loaded` - 已上传字节数（会被限制在 [上次值, total] 内）
    /// * `timestamp_ms` - 采样时间（毫秒，单调递增）
    pub fn record_at(&mut self, loaded: u64, timestamp_ms: u64) -> UploadProgress {
        let loaded = loaded.min(self.total).max(self.loaded());

        if let Some(prev) = self.last {
            let elapsed_ms = timestamp_ms.saturating_sub(prev.timestamp_ms);
            // 时间间隔为 0 时保持上次速度
            if elapsed_ms > 0 {
                let delta = loaded - prev.loaded_bytes;
                self.speed = delta as f64 * 1000.0 / elapsed_ms as f64;
            }
        }

        self.last = Some(ProgressSample {
            loaded_bytes: loaded,
            total_bytes: self.total,
            timestamp_ms,
        });

        self.snapshot(loaded)
    }

    /// 完成：已传字节等于总字节，百分比恰好为 100
    pub fn complete(&mut self) -> UploadProgress {
        let now_ms = self.start.elapsed().as_millis() as u64;
        let mut progress = self.record_at(self.total, now_ms);
        progress.percentage = 100.0;
        progress.eta_secs = Some(0.0);
        progress
    }

    fn snapshot(&self, loaded: u64) -> UploadProgress {
        let percentage = if self.total == 0 {
            0.0
        } else {
            loaded as f64 / self.total as f64 * 100.0
        };

        let eta_secs = if self.speed > 0.0 {
            Some((self.total - loaded) as f64 / self.speed)
        } else {
            None
        };

        UploadProgress {
            loaded,
            total: self.total,
            percentage,
            speed: self.speed,
            eta_secs,
        }
    }
}

/// 进度事件节流器
///
/// 线程安全的时间节流器，使用原子操作避免锁竞争
#[derive(Debug)]
pub struct ProgressThrottler {
    /// 上次发布事件的时间（相对创建时刻的纳秒数 + 1，0 表示从未发布）
    last_emit_nanos: AtomicU64,
    /// 节流间隔（纳秒）
    interval_nanos: u64,
    /// 创建时刻
    origin: Instant,
}

impl ProgressThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            last_emit_nanos: AtomicU64::new(0),
            interval_nanos: interval.as_nanos() as u64,
            origin: Instant::now(),
        }
    }

    /// 使用指定毫秒间隔创建节流器
    pub fn with_millis(interval_ms: u64) -> Self {
        Self::new(Duration::from_millis(interval_ms))
    }

    /// 检查是否应该发布事件
    ///
    /// 如果距离上次发布已超过节流间隔，返回 true 并更新时间戳
    pub fn should_emit(&self) -> bool {
        let now = self.origin.elapsed().as_nanos() as u64 + 1;
        let last = self.last_emit_nanos.load(Ordering::Relaxed);

        if last == 0 || now.saturating_sub(last) >= self.interval_nanos {
            // 被其他线程抢先更新时本次不发布
            self.last_emit_nanos
                .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        } else {
            false
        }
    }

    /// 重置节流器状态
    pub fn reset(&self) {
        self.last_emit_nanos.store(0, Ordering::Relaxed);
    }
}

impl Default for ProgressThrottler {
    fn default() -> Self {
        Self::with_millis(DEFAULT_THROTTLE_INTERVAL_MS)
    }
}

// 上传事件
//
// 每个传输先发布零个或多个 Progress，最后发布且只发布一个终态事件
// (Completed / Failed / Cancelled)

use crate::uploader::progress::{ProgressThrottler, ProgressTracker, UploadProgress};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

/// 上传事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum UploadEvent {
    /// 进度更新
    Progress {
        transfer_id: String,
        #[serde(flatten)]
        progress: UploadProgress,
    },
    /// 上传完成
    Completed {
        transfer_id: String,
        /// 服务器最终响应
        response: serde_json::Value,
    },
    /// 上传失败
    Failed { transfer_id: String, error: String },
    /// 已取消
    Cancelled { transfer_id: String },
}

impl UploadEvent {
    pub fn transfer_id(&self) -> &str {
        match self {
            UploadEvent::Progress { transfer_id, .. } => transfer_id,
            UploadEvent::Completed { transfer_id, .. } => transfer_id,
            UploadEvent::Failed { transfer_id, .. } => transfer_id,
            UploadEvent::Cancelled { transfer_id } => transfer_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, UploadEvent::Progress { .. })
    }

    /// 获取事件类型名称
    pub fn event_type_name(&self) -> &'static str {
        match self {
            UploadEvent::Progress { .. } => "progress",
            UploadEvent::Completed { .. } => "completed",
            UploadEvent::Failed { .. } => "failed",
            UploadEvent::Cancelled { .. } => "cancelled",
        }
    }
}

/// 单个传输的进度发布器
///
/// 分片内部的进度经过节流，分片边界和完成时强制发布；
/// 速度按相邻两次发布的进度计算
pub struct ProgressReporter {
    transfer_id: String,
    total: u64,
    tracker: Mutex<ProgressTracker>,
    throttler: ProgressThrottler,
    sender: Option<UnboundedSender<UploadEvent>>,
    finished: AtomicBool,
}

impl ProgressReporter {
    pub fn new(
        transfer_id: impl Into<String>,
        total: u64,
        interval: Duration,
        sender: Option<UnboundedSender<UploadEvent>>,
    ) -> Self {
        Self {
            transfer_id: transfer_id.into(),
            total,
            tracker: Mutex::new(ProgressTracker::new(total)),
            throttler: ProgressThrottler::new(interval),
            sender,
            finished: AtomicBool::new(false),
        }
    }

    /// 新一次尝试从 0 开始计算
    pub fn reset(&self) {
        *self.tracker.lock() = ProgressTracker::new(self.total);
        self.throttler.reset();
    }

    /// 当前已记录的字节数
    pub fn loaded(&self) -> u64 {
        self.tracker.lock().loaded()
    }

    /// 发布进度
    ///
    /// # 参数
    /// * `loaded` - 本次尝试已发送的字节数
    /// * `force` - 跳过节流（分片边界）
    pub fn report(&self, loaded: u64, force: bool) {
        if self.finished.load(Ordering::SeqCst) {
            return;
        }
        if !self.throttler.should_emit() && !force {
            return;
        }
        let progress = self.tracker.lock().record(loaded);
        self.emit(UploadEvent::Progress {
            transfer_id: self.transfer_id.clone(),
            progress,
        });
    }

    /// 发布 100% 进度
    pub fn complete(&self) {
        if self.finished.load(Ordering::SeqCst) {
            return;
        }
        let progress = self.tracker.lock().complete();
        self.emit(UploadEvent::Progress {
            transfer_id: self.transfer_id.clone(),
            progress,
        });
    }

    /// 发布终态事件，重复调用只有第一次生效
    pub fn finish(&self, event: UploadEvent) {
        debug_assert!(event.is_terminal());
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        self.emit(event);
    }

    fn emit(&self, event: UploadEvent) {
        if let Some(ref sender) = self.sender {
            // 订阅方已丢弃接收端
            if sender.send(event).is_err() {
                debug!("事件接收端已关闭: transfer_id={}", self.transfer_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn drain(rx: &mut mpsc::UnboundedReceiver<UploadEvent>) -> Vec<UploadEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_event_serialization() {
        let event = UploadEvent::Cancelled {
            transfer_id: "t-1".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "cancelled");
        assert_eq!(json["transfer_id"], "t-1");

        let event = UploadEvent::Progress {
            transfer_id: "t-1".to_string(),
            progress: UploadProgress {
                loaded: 5,
                total: 10,
                percentage: 50.0,
                speed: 0.0,
                eta_secs: None,
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "progress");
        assert_eq!(json["loaded"], 5);
        assert!(!event.is_terminal());
    }

    #[test]
    fn test_throttled_unless_forced() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let reporter = ProgressReporter::new("t-1", 100, Duration::from_secs(60), Some(tx));

        reporter.report(10, false);
        reporter.report(20, false);
        reporter.report(30, true);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_single_terminal_event() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let reporter = ProgressReporter::new("t-1", 100, Duration::ZERO, Some(tx));

        reporter.report(50, true);
        reporter.complete();
        reporter.finish(UploadEvent::Completed {
            transfer_id: "t-1".to_string(),
            response: serde_json::Value::Null,
        });
        reporter.finish(UploadEvent::Cancelled {
            transfer_id: "t-1".to_string(),
        });
        // 终态之后不再发布进度
        reporter.report(60, true);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 3);
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        assert_eq!(events[2].event_type_name(), "completed");
    }

    #[test]
    fn test_dropped_receiver_is_ignored() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let reporter = ProgressReporter::new("t-1", 100, Duration::ZERO, Some(tx));
        reporter.report(50, true);
        reporter.finish(UploadEvent::Cancelled {
            transfer_id: "t-1".to_string(),
        });
    }
}

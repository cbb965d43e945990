// 离线队列回放引擎
//
// 回放流程（单轮）：
// 1. 离线、队列为空、或已有一轮在进行时直接返回
// 2. 取出队列快照并清空队列（持久化清空后的状态）
// 3. 按入队顺序逐条调用执行器，每条每轮最多尝试一次
// 4. 失败的操作 retry_count + 1，未超过上限则放回队尾等待下一轮，否则永久丢弃
// 5. 本轮结束后再次持久化
//
// 注意：步骤 2 之后进程崩溃会丢失正在回放的操作（至多一次，可能丢失）

use crate::common::{NetworkMonitor, RetryPolicy};
use crate::offline::operation::QueuedOperation;
use crate::offline::queue::MutationQueue;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 写操作执行器
///
/// 由调用方提供，负责真正发起网络请求。任何网络错误或 HTTP 错误都必须返回 Err，
/// 否则重试逻辑不会生效
#[async_trait]
pub trait MutationExecutor: Send + Sync {
    async fn execute(&self, op: &QueuedOperation) -> anyhow::Result<()>;
}

/// 单轮回放结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// 本轮是否被跳过（离线/空队列/已有回放在进行）
    pub skipped: bool,
    /// 尝试执行的操作数
    pub attempted: usize,
    /// 成功数
    pub succeeded: usize,
    /// 放回队列等待下一轮的数量
    pub requeued: usize,
    /// 超过重试上限被丢弃的数量
    pub dropped: usize,
}

impl ReplayReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

/// 单飞守卫：离开作用域时释放回放标记
struct DrainGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// 回放引擎
pub struct ReplayEngine {
    /// 离线队列
    queue: Arc<MutationQueue>,
    /// 网络状态
    monitor: NetworkMonitor,
    /// 重试策略（只用于判断是否耗尽，上限取自每条操作）
    policy: RetryPolicy,
    /// 单次执行超时（None 表示不限制）
    executor_timeout: Option<Duration>,
    /// 是否有回放正在进行
    draining: AtomicBool,
}

impl ReplayEngine {
    pub fn new(queue: Arc<MutationQueue>, monitor: NetworkMonitor) -> Self {
        Self {
            queue,
            monitor,
            policy: RetryPolicy::default(),
            executor_timeout: None,
            draining: AtomicBool::new(false),
        }
    }

    /// 设置单次执行超时，超时按普通失败计入重试
    pub fn with_executor_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.executor_timeout = timeout;
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn queue(&self) -> &Arc<MutationQueue> {
        &self.queue
    }

    pub fn monitor(&self) -> &NetworkMonitor {
        &self.monitor
    }

    /// 是否有回放正在进行
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// 执行一轮回放
    pub async fn drain_and_replay(&self, executor: &dyn MutationExecutor) -> ReplayReport {
        if !self.monitor.is_online() {
            debug!("当前离线，跳过回放");
            return ReplayReport::skipped();
        }

        if self.queue.is_empty() {
            return ReplayReport::skipped();
        }

        if self
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("已有回放在进行，跳过本次触发");
            return ReplayReport::skipped();
        }
        let _guard = DrainGuard {
            flag: &self.draining,
        };

        let snapshot = self.queue.take_all();
        if snapshot.is_empty() {
            return ReplayReport::skipped();
        }

        info!("开始回放离线队列: {} 条操作", snapshot.len());

        let mut report = ReplayReport::default();
        for mut op in snapshot {
            report.attempted += 1;

            match self.execute_one(executor, &op).await {
                Ok(()) => {
                    report.succeeded += 1;
                    debug!("回放成功: id={}, {} {}", op.id, op.method, op.target_url);
                }
                Err(e) => {
                    let failures = op.record_failure();
                    let decision = self.policy.decide_with_limit(failures, op.max_retries, true);
                    if decision.should_retry() {
                        warn!(
                            "回放失败，等待下一轮 ({}/{}): id={}, {} {}, 错误: {}",
                            failures, op.max_retries, op.id, op.method, op.target_url, e
                        );
                        report.requeued += 1;
                        self.queue.requeue(op);
                    } else {
                        error!(
                            "回放失败且已达最大重试次数 ({})，永久丢弃: id={}, {} {}, 错误: {}",
                            op.max_retries, op.id, op.method, op.target_url, e
                        );
                        report.dropped += 1;
                    }
                }
            }
        }

        self.queue.persist();

        info!(
            "回放结束: 尝试={}, 成功={}, 待重试={}, 丢弃={}",
            report.attempted, report.succeeded, report.requeued, report.dropped
        );

        report
    }

    async fn execute_one(
        &self,
        executor: &dyn MutationExecutor,
        op: &QueuedOperation,
    ) -> anyhow::Result<()> {
        match self.executor_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, executor.execute(op)).await {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!("执行超时 ({}ms)", timeout.as_millis())),
            },
            None => executor.execute(op).await,
        }
    }

    /// 启动后台任务：每次从离线切换到在线时执行一轮回放
    ///
    /// 离线切换只更新状态，不会中断正在执行的操作
    pub fn spawn(
        self: &Arc<Self>,
        executor: Arc<dyn MutationExecutor>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let mut rx = engine.monitor.subscribe();

        tokio::spawn(async move {
            info!("离线回放监听已启动");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("离线回放监听已停止");
                        break;
                    }
                    changed = rx.changed() => {
                        if changed.is_err() {
                            warn!("网络状态通道已关闭，停止回放监听");
                            break;
                        }
                        let online = *rx.borrow_and_update();
                        if online {
                            engine.drain_and_replay(executor.as_ref()).await;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offline::operation::HttpMethod;
    use crate::offline::store::MemoryStore;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    /// 记录调用顺序的执行器
    #[derive(Default)]
    struct RecordingExecutor {
        calls: Mutex<Vec<String>>,
        fail: bool,
    }

    impl RecordingExecutor {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl MutationExecutor for RecordingExecutor {
        async fn execute(&self, op: &QueuedOperation) -> anyhow::Result<()> {
            self.calls.lock().push(op.target_url.clone());
            if self.fail {
                anyhow::bail!("503 Service Unavailable");
            }
            Ok(())
        }
    }

    fn create_engine(online: bool) -> Arc<ReplayEngine> {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MutationQueue::new(store, "pending", 100, 3));
        Arc::new(ReplayEngine::new(queue, NetworkMonitor::new(online)))
    }

    #[tokio::test]
    async fn test_replay_in_enqueue_order() {
        let engine = create_engine(true);
        for i in 0..5 {
            engine
                .queue()
                .enqueue(HttpMethod::Post, format!("/items/{}", i), None);
        }

        let executor = RecordingExecutor::default();
        let report = engine.drain_and_replay(&executor).await;

        assert_eq!(report.attempted, 5);
        assert_eq!(report.succeeded, 5);
        assert!(engine.queue().is_empty());
        let expected: Vec<String> = (0..5).map(|i| format!("/items/{}", i)).collect();
        assert_eq!(executor.calls(), expected);
    }

    #[tokio::test]
    async fn test_skip_when_offline() {
        let engine = create_engine(false);
        engine.queue().enqueue(HttpMethod::Post, "/a", None);

        let executor = RecordingExecutor::default();
        let report = engine.drain_and_replay(&executor).await;

        assert!(report.skipped);
        assert!(executor.calls().is_empty());
        assert_eq!(engine.queue().len(), 1);
    }

    #[tokio::test]
    async fn test_skip_when_empty() {
        let engine = create_engine(true);
        let executor = RecordingExecutor::default();
        assert!(engine.drain_and_replay(&executor).await.skipped);
    }

    #[tokio::test]
    async fn test_always_failing_item_dropped_after_max_retries() {
        let engine = create_engine(true);
        engine
            .queue()
            .enqueue_with_retries(HttpMethod::Put, "/flaky", None, 2);
        let executor = RecordingExecutor::failing();

        // 第 1 轮：retry_count=1，仍在队列
        let report = engine.drain_and_replay(&executor).await;
        assert_eq!(report.requeued, 1);
        assert_eq!(engine.queue().snapshot()[0].retry_count, 1);

        // 第 2 轮：retry_count=2，仍在队列
        let report = engine.drain_and_replay(&executor).await;
        assert_eq!(report.requeued, 1);
        assert_eq!(engine.queue().snapshot()[0].retry_count, 2);

        // 第 3 轮：超过上限，丢弃
        let report = engine.drain_and_replay(&executor).await;
        assert_eq!(report.dropped, 1);
        assert!(engine.queue().is_empty());

        // 丢弃后不再尝试
        let report = engine.drain_and_replay(&executor).await;
        assert!(report.skipped);
        assert_eq!(executor.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_item_not_retried_within_same_pass() {
        let engine = create_engine(true);
        engine.queue().enqueue(HttpMethod::Post, "/a", None);
        engine.queue().enqueue(HttpMethod::Post, "/b", None);
        let executor = RecordingExecutor::failing();

        let report = engine.drain_and_replay(&executor).await;
        assert_eq!(report.attempted, 2);
        assert_eq!(executor.calls(), vec!["/a".to_string(), "/b".to_string()]);
        // 失败的操作按原顺序回到队列
        let urls: Vec<String> = engine
            .queue()
            .snapshot()
            .into_iter()
            .map(|op| op.target_url)
            .collect();
        assert_eq!(urls, vec!["/a".to_string(), "/b".to_string()]);
    }

    /// 第一次调用时阻塞，直到测试放行
    struct BlockingExecutor {
        started: tokio::sync::Notify,
        release: tokio::sync::Notify,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MutationExecutor for BlockingExecutor {
        async fn execute(&self, _op: &QueuedOperation) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.started.notify_one();
            self.release.notified().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_single_flight_guard() {
        let engine = create_engine(true);
        engine.queue().enqueue(HttpMethod::Post, "/slow", None);

        let executor = Arc::new(BlockingExecutor {
            started: tokio::sync::Notify::new(),
            release: tokio::sync::Notify::new(),
            calls: AtomicUsize::new(0),
        });

        let first = {
            let engine = engine.clone();
            let executor = executor.clone();
            tokio::spawn(async move { engine.drain_and_replay(executor.as_ref()).await })
        };

        executor.started.notified().await;
        assert!(engine.is_draining());

        // 进行中的回放期间新入队并再次触发：直接跳过
        engine.queue().enqueue(HttpMethod::Post, "/later", None);
        let second = engine.drain_and_replay(executor.as_ref()).await;
        assert!(second.skipped);

        executor.release.notify_one();
        let report = first.await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert!(!engine.is_draining());
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.queue().len(), 1);
    }

    /// 永不返回的执行器
    struct HangingExecutor;

    #[async_trait]
    impl MutationExecutor for HangingExecutor {
        async fn execute(&self, _op: &QueuedOperation) -> anyhow::Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_executor_timeout_counts_as_failure() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MutationQueue::new(store, "pending", 10, 3));
        let engine = ReplayEngine::new(queue, NetworkMonitor::new(true))
            .with_executor_timeout(Some(Duration::from_millis(20)));
        engine.queue().enqueue(HttpMethod::Post, "/hang", None);

        let report = engine.drain_and_replay(&HangingExecutor).await;
        assert_eq!(report.requeued, 1);
        assert_eq!(engine.queue().snapshot()[0].retry_count, 1);
    }

    #[tokio::test]
    async fn test_going_online_triggers_replay() {
        let engine = create_engine(false);
        for url in ["/1", "/2", "/3"] {
            engine.queue().enqueue(HttpMethod::Patch, url, None);
        }

        let executor = Arc::new(RecordingExecutor::default());
        let shutdown = CancellationToken::new();
        let handle = engine.spawn(executor.clone(), shutdown.clone());

        engine.monitor().set_online(true);

        tokio::time::timeout(Duration::from_secs(5), async {
            while !engine.queue().is_empty() || executor.calls().len() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("回放应在超时前完成");

        assert_eq!(
            executor.calls(),
            vec!["/1".to_string(), "/2".to_string(), "/3".to_string()]
        );

        shutdown.cancel();
        handle.await.unwrap();
    }

    async fn wait_for_calls(executor: &RecordingExecutor, expected: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while executor.calls().len() < expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("回放应在超时前开始");
        // 留出时间暴露多余的回放
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_one_replay_pass_per_online_transition() {
        let engine = create_engine(false);
        engine
            .queue()
            .enqueue_with_retries(HttpMethod::Delete, "/items/7", None, 10);

        let executor = Arc::new(RecordingExecutor::failing());
        let shutdown = CancellationToken::new();
        let handle = engine.spawn(executor.clone(), shutdown.clone());

        // 第一次上线：恰好一轮
        assert!(engine.monitor().set_online(true));
        wait_for_calls(&executor, 1).await;
        assert_eq!(executor.calls().len(), 1);
        assert_eq!(engine.queue().snapshot()[0].retry_count, 1);

        // 重复设置在线不是状态变化，不触发回放
        assert!(!engine.monitor().set_online(true));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(executor.calls().len(), 1);
        assert_eq!(engine.queue().snapshot()[0].retry_count, 1);

        // 第二次 离线 -> 在线：再一轮
        assert!(engine.monitor().set_online(false));
        assert!(engine.monitor().set_online(true));
        wait_for_calls(&executor, 2).await;
        assert_eq!(executor.calls().len(), 2);
        assert_eq!(engine.queue().snapshot()[0].retry_count, 2);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_going_offline_does_not_replay() {
        let engine = create_engine(true);
        engine.queue().enqueue(HttpMethod::Post, "/a", None);

        let executor = Arc::new(RecordingExecutor::default());
        let shutdown = CancellationToken::new();
        let handle = engine.spawn(executor.clone(), shutdown.clone());

        engine.monitor().set_online(false);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(executor.calls().is_empty());
        assert_eq!(engine.queue().len(), 1);

        shutdown.cancel();
        handle.await.unwrap();
    }
}

// 离线写操作队列
//
// 设计要点：
// - 只接受写方法（POST/PUT/PATCH/DELETE）
// - 容量有限，满时丢弃最旧的一条并记录警告
// - 每次结构变化后同步持久化整个队列
// - 持久化失败只记录日志，从不向调用方传播

use crate::config::QueueConfig;
use crate::offline::operation::{HttpMethod, QueuedOperation};
use crate::offline::store::DurableStore;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// 离线写操作队列
pub struct MutationQueue {
    /// 持久化存储
    store: Arc<dyn DurableStore>,
    /// 存储 key
    storage_key: String,
    /// 最大容量
    capacity: usize,
    /// 新操作默认的最大重试次数
    default_max_retries: u32,
    /// 队列内容（FIFO）
    items: Mutex<VecDeque<QueuedOperation>>,
}

impl MutationQueue {
    /// 创建队列，并从存储中恢复之前持久化的内容
    ///
    /// # 参数
    /// * `store` - 持久化存储
    /// * `storage_key` - 存储 key
    /// * `capacity` - 最大容量（至少为 1）
    /// * `default_max_retries` - 新操作默认的最大重试次数
    pub fn new(
        store: Arc<dyn DurableStore>,
        storage_key: impl Into<String>,
        capacity: usize,
        default_max_retries: u32,
    ) -> Self {
        let storage_key = storage_key.into();
        let capacity = capacity.max(1);
        let items = Self::restore(store.as_ref(), &storage_key, capacity);

        info!(
            "离线队列已就绪: key={}, 容量={}, 恢复 {} 条待回放操作",
            storage_key,
            capacity,
            items.len()
        );

        Self {
            store,
            storage_key,
            capacity,
            default_max_retries,
            items: Mutex::new(items),
        }
    }

    /// 根据配置创建队列
    pub fn open(store: Arc<dyn DurableStore>, config: &QueueConfig) -> Self {
        Self::new(
            store,
            config.storage_key.clone(),
            config.capacity,
            config.max_retries,
        )
    }

    /// 从存储中恢复队列
    ///
    /// 数据损坏时记录错误并返回空队列
    fn restore(store: &dyn DurableStore, key: &str, capacity: usize) -> VecDeque<QueuedOperation> {
        let raw = match store.get(key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return VecDeque::new(),
            Err(e) => {
                error!("读取离线队列失败: key={}, 错误: {}", key, e);
                return VecDeque::new();
            }
        };

        match serde_json::from_str::<Vec<QueuedOperation>>(&raw) {
            Ok(ops) => {
                let mut items: VecDeque<QueuedOperation> = ops
                    .into_iter()
                    .filter(|op| op.method.is_mutating())
                    .collect();
                // 容量可能在两次启动之间被调小
                while items.len() > capacity {
                    if let Some(evicted) = items.pop_front() {
                        warn!("恢复时队列超出容量，丢弃最旧操作: id={}", evicted.id);
                    }
                }
                items
            }
            Err(e) => {
                error!("解析离线队列失败，丢弃已持久化内容: key={}, 错误: {}", key, e);
                VecDeque::new()
            }
        }
    }

    /// 入队写操作（使用默认最大重试次数）
    ///
    /// # 返回
    /// - `Some(id)` - 已入队
    /// - `None` - 读方法被忽略
    pub fn enqueue(
        &self,
        method: HttpMethod,
        target_url: impl Into<String>,
        payload: Option<serde_json::Value>,
    ) -> Option<String> {
        self.enqueue_with_retries(method, target_url, payload, self.default_max_retries)
    }

    /// 入队写操作（指定最大重试次数）
    pub fn enqueue_with_retries(
        &self,
        method: HttpMethod,
        target_url: impl Into<String>,
        payload: Option<serde_json::Value>,
        max_retries: u32,
    ) -> Option<String> {
        let target_url = target_url.into();
        let op = match QueuedOperation::new(method, target_url.clone(), payload, max_retries) {
            Some(op) => op,
            None => {
                debug!("忽略只读请求，不进入离线队列: {} {}", method, target_url);
                return None;
            }
        };

        let id = op.id.clone();
        let mut items = self.items.lock();
        self.push_bounded(&mut items, op);
        debug!(
            "写操作已入队: id={}, {} {}, 队列长度={}",
            id,
            method,
            target_url,
            items.len()
        );
        self.persist_locked(&items);

        Some(id)
    }

    /// 追加到队尾，满时丢弃最旧的一条
    fn push_bounded(&self, items: &mut VecDeque<QueuedOperation>, op: QueuedOperation) {
        while items.len() >= self.capacity {
            if let Some(evicted) = items.pop_front() {
                warn!(
                    "离线队列已满 (容量={})，丢弃最旧操作: id={}, {} {}",
                    self.capacity, evicted.id, evicted.method, evicted.target_url
                );
            }
        }
        items.push_back(op);
    }

    /// 取出全部操作并清空队列（持久化清空后的状态）
    pub(crate) fn take_all(&self) -> Vec<QueuedOperation> {
        let mut items = self.items.lock();
        let snapshot: Vec<QueuedOperation> = items.drain(..).collect();
        self.persist_locked(&items);
        snapshot
    }

    /// 将回放失败的操作放回队尾，等待下一轮
    pub(crate) fn requeue(&self, op: QueuedOperation) {
        let mut items = self.items.lock();
        self.push_bounded(&mut items, op);
        self.persist_locked(&items);
    }

    /// 持久化当前队列
    pub fn persist(&self) {
        let items = self.items.lock();
        self.persist_locked(&items);
    }

    fn persist_locked(&self, items: &VecDeque<QueuedOperation>) {
        let serialized = match serde_json::to_string(items) {
            Ok(s) => s,
            Err(e) => {
                error!("序列化离线队列失败: {}", e);
                return;
            }
        };

        if let Err(e) = self.store.set(&self.storage_key, &serialized) {
            error!("持久化离线队列失败: key={}, 错误: {}", self.storage_key, e);
        }
    }

    /// 队列长度
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// 最大容量
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 队列内容快照（按入队顺序）
    pub fn snapshot(&self) -> Vec<QueuedOperation> {
        self.items.lock().iter().cloned().collect()
    }

    /// 清空队列并删除持久化内容
    pub fn clear(&self) {
        let mut items = self.items.lock();
        let dropped = items.len();
        items.clear();
        if let Err(e) = self.store.remove(&self.storage_key) {
            error!("删除离线队列存储失败: key={}, 错误: {}", self.storage_key, e);
        }
        info!("离线队列已清空，丢弃 {} 条操作", dropped);
    }
}

// 网络状态监听
//
// 只关心在线/离线的状态切换，不做轮询：
// - 外部平台层在收到连通性事件时调用 `set_online`
// - 状态未变化的重复通知被直接忽略
// - 订阅方通过 watch 通道感知切换

use tokio::sync::watch;
use tracing::info;

/// 网络状态监听器
///
/// 可廉价克隆，所有克隆共享同一个状态
#[derive(Debug, Clone)]
pub struct NetworkMonitor {
    tx: watch::Sender<bool>,
}

impl NetworkMonitor {
    /// 创建监听器
    ///
    /// # 参数
    /// * `initially_online` - 初始是否在线
    pub fn new(initially_online: bool) -> Self {
        let (tx, _rx) = watch::channel(initially_online);
        Self { tx }
    }

    /// 当前是否在线
    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// 更新在线状态
    ///
    /// # 返回
    /// 状态是否发生了切换（只有切换才会通知订阅方）
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });

        if changed {
            if online {
                info!("网络已恢复在线");
            } else {
                info!("网络已断开，进入离线模式");
            }
        }

        changed
    }

    /// 订阅状态切换
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

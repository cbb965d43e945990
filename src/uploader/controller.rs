// 传输控制器
//
// 每个传输持有一个取消令牌，取消信号会传递到当前进行中的阶段（init/chunk/finalize/重试等待）

use tokio_util::sync::CancellationToken;
use tracing::info;

/// 单个传输的取消控制
#[derive(Debug, Clone, Default)]
pub struct TransferController {
    token: CancellationToken,
}

impl TransferController {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// 创建子控制器
    ///
    /// 父令牌取消时一并取消；子控制器单独取消不影响父令牌
    pub fn child_of(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
        }
    }

    /// 请求取消（幂等）
    pub fn cancel(&self) {
        if !self.token.is_cancelled() {
            info!("请求取消传输");
        }
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// 取消令牌（克隆后与控制器共享同一个取消状态）
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 等待取消
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

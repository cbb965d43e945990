// 离线写操作模块
//
// - MutationQueue: 持久化的有界 FIFO 队列
// - ReplayEngine: 网络恢复时按入队顺序回放
// - DurableStore: 存储契约（内存/文件两种实现）

pub mod http;
pub mod operation;
pub mod queue;
pub mod replay;
pub mod store;

pub use http::{HttpMutationExecutor, IDEMPOTENCY_KEY_HEADER};
pub use operation::{HttpMethod, QueuedOperation};
pub use queue::MutationQueue;
pub use replay::{MutationExecutor, ReplayEngine, ReplayReport};
pub use store::{DurableStore, FileStore, MemoryStore, StoreError};

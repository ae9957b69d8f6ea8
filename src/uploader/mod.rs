// 上传编排模块
//
// - 条目模型与状态机（item）
// - 重试策略（retry）
// - 整体进度统计（progress）
// - 准入控制与调度（queue / cancel）
// - 通知事件（events）
// - 异步调度任务与对外接口（manager）

pub mod cancel;
pub mod events;
pub mod item;
pub mod manager;
pub mod progress;
pub mod queue;
pub mod retry;

#[cfg(test)]
pub(crate) mod testing;

pub use events::{FailedItem, UploadEvent, UploadNotification};
pub use item::{BatchId, ItemId, ItemState, TransferItem};
pub use manager::{BatchHandle, UploadManager};
pub use progress::BatchProgress;
pub use queue::{Effect, QueueManager, Snapshot};
pub use retry::{DefaultRetryPolicy, RetryDecision, RetryPolicy};

// 传输条目定义
//
// 一个条目对应批次中的一个文件，记录它从排队到终态的完整生命周期。
// 状态与进度只允许由 QueueManager 修改。

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// 条目ID（入队时分配，重试期间保持不变）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(Uuid);

impl ItemId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 批次ID（一次 submit 调用对应一个批次）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(Uuid);

impl BatchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 条目状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    /// 等待中
    Pending,
    /// 传输中（占用一个并发槽位）
    InFlight,
    /// 已成功
    Succeeded,
    /// 失败（重试策略放弃后为终态）
    Failed,
    /// 已取消
    Cancelled,
}

impl ItemState {
    /// 是否为终态
    ///
    /// `Failed` 只有在重试策略放弃之后才会停留，因此观察到的 `Failed` 都视为终态
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ItemState::Succeeded | ItemState::Failed | ItemState::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ItemState::Pending => "pending",
            ItemState::InFlight => "in_flight",
            ItemState::Succeeded => "succeeded",
            ItemState::Failed => "failed",
            ItemState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 传输条目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferItem<P> {
    /// 条目ID
    pub id: ItemId,
    /// 所属批次
    pub batch_id: BatchId,
    /// 待传输的文件句柄
    pub payload: P,
    /// 当前状态
    pub state: ItemState,
    /// 进度百分比 (0-100)
    pub progress_percent: u8,
    /// 已尝试次数
    pub attempt_count: u32,
    /// 启动序号，每次启动传输加一，重新入队失败条目时也不清零
    #[serde(default)]
    pub sequence: u32,
    /// 最近一次错误（仅 Failed 时存在）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// 上传结果地址（仅 Succeeded 时存在）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_url: Option<String>,
    /// 创建时间 (Unix timestamp)
    pub created_at: i64,
    /// 首次开始时间 (Unix timestamp)
    pub started_at: Option<i64>,
    /// 进入终态的时间 (Unix timestamp)
    pub finished_at: Option<i64>,
}

impl<P> TransferItem<P> {
    /// 创建新的传输条目（初始为 Pending）
    pub fn new(id: ItemId, batch_id: BatchId, payload: P) -> Self {
        Self {
            id,
            batch_id,
            payload,
            state: ItemState::Pending,
            progress_percent: 0,
            attempt_count: 0,
            sequence: 0,
            last_error: None,
            result_url: None,
            created_at: chrono::Utc::now().timestamp(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// 标记为传输中，尝试次数加一
    pub(crate) fn mark_in_flight(&mut self) {
        self.state = ItemState::InFlight;
        self.attempt_count += 1;
        self.sequence += 1;
        self.progress_percent = 0;
        if self.started_at.is_none() {
            self.started_at = Some(chrono::Utc::now().timestamp());
        }
    }

    /// 更新进度
    ///
    /// 进度只增不减；传输中最多到 99，100 只留给成功状态
    ///
    /// # 返回
    /// 进度是否发生变化
    pub(crate) fn update_progress(&mut self, percent: u8) -> bool {
        let capped = percent.min(99);
        if capped <= self.progress_percent {
            return false;
        }
        self.progress_percent = capped;
        true
    }

    /// 标记为成功
    pub(crate) fn mark_succeeded(&mut self, url: String) {
        self.state = ItemState::Succeeded;
        self.progress_percent = 100;
        self.result_url = Some(url);
        self.last_error = None;
        self.finished_at = Some(chrono::Utc::now().timestamp());
    }

    /// 标记为失败
    pub(crate) fn mark_failed(&mut self, error: String) {
        self.state = ItemState::Failed;
        self.last_error = Some(error);
        self.finished_at = Some(chrono::Utc::now().timestamp());
    }

    /// 重新回到等待状态（重试）
    pub(crate) fn reset_for_retry(&mut self) {
        self.state = ItemState::Pending;
        self.progress_percent = 0;
        self.last_error = None;
        self.finished_at = None;
    }

    /// 标记为已取消
    pub(crate) fn mark_cancelled(&mut self) {
        self.state = ItemState::Cancelled;
        self.finished_at = Some(chrono::Utc::now().timestamp());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item() -> TransferItem<&'static str> {
        TransferItem::new(ItemId::new(), BatchId::new(), "photo.jpg")
    }

    #[test]
    fn test_item_creation() {
        let item = item();
        assert_eq!(item.state, ItemState::Pending);
        assert_eq!(item.progress_percent, 0);
        assert_eq!(item.attempt_count, 0);
        assert!(item.last_error.is_none());
        assert!(item.result_url.is_none());
        assert!(item.started_at.is_none());
    }

    #[test]
    fn test_progress_is_monotonic_and_capped() {
        let mut item = item();
        item.mark_in_flight();

        assert!(item.update_progress(40));
        assert!(!item.update_progress(30));
        assert_eq!(item.progress_percent, 40);

        assert!(item.update_progress(100));
        assert_eq!(item.progress_percent, 99);
        assert!(!item.update_progress(255));
    }

    #[test]
    fn test_status_transitions() {
        let mut item = item();

        item.mark_in_flight();
        assert_eq!(item.state, ItemState::InFlight);
        assert_eq!(item.attempt_count, 1);
        assert!(item.started_at.is_some());

        item.update_progress(60);
        item.mark_failed("网络错误".to_string());
        assert_eq!(item.state, ItemState::Failed);
        assert_eq!(item.last_error.as_deref(), Some("网络错误"));

        item.reset_for_retry();
        assert_eq!(item.state, ItemState::Pending);
        assert_eq!(item.progress_percent, 0);
        assert!(item.last_error.is_none());

        item.mark_in_flight();
        assert_eq!(item.attempt_count, 2);
        item.mark_succeeded("https://cdn.example.com/a.jpg".to_string());
        assert_eq!(item.state, ItemState::Succeeded);
        assert_eq!(item.progress_percent, 100);
        assert!(item.finished_at.is_some());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!ItemState::Pending.is_terminal());
        assert!(!ItemState::InFlight.is_terminal());
        assert!(ItemState::Succeeded.is_terminal());
        assert!(ItemState::Failed.is_terminal());
        assert!(ItemState::Cancelled.is_terminal());
    }

    #[test]
    fn test_ids_are_unique() {
        let a = ItemId::new();
        let b = ItemId::new();
        assert_ne!(a, b);
    }
}

//! 上传事件类型定义
//!
//! 调度器每次修改条目后发布事件，订阅方通过 `UploadManager::subscribe` 接收

use crate::uploader::{BatchId, BatchProgress, ItemId, ItemState};
use serde::{Deserialize, Serialize};

/// 最终失败的条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedItem {
    pub item_id: ItemId,
    /// 最近一次错误（可直接展示给用户）
    pub error: String,
    pub attempts: u32,
}

/// 上传事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum UploadEvent {
    /// 批次提交
    Submitted {
        batch_id: BatchId,
        item_ids: Vec<ItemId>,
    },
    /// 状态变更
    StatusChanged {
        item_id: ItemId,
        old_state: ItemState,
        new_state: ItemState,
    },
    /// 进度更新
    Progress { item_id: ItemId, percent: u8 },
    /// 上传成功
    Succeeded { item_id: ItemId, url: String },
    /// 失败后重新入队
    Retrying {
        item_id: ItemId,
        /// 已完成的尝试次数
        attempt: u32,
        error: String,
        delay_ms: u64,
    },
    /// 最终失败（重试策略放弃）
    Failed {
        item_id: ItemId,
        error: String,
        attempts: u32,
    },
    /// 已取消
    Cancelled { item_id: ItemId },
    /// 批次内所有条目都进入终态
    BatchCompleted {
        batch_id: BatchId,
        succeeded: Vec<ItemId>,
        failed: Vec<FailedItem>,
        cancelled: Vec<ItemId>,
    },
    /// 条目被清除
    Cleared { item_ids: Vec<ItemId> },
}

impl UploadEvent {
    /// 获取条目 ID（批次级事件返回 None）
    pub fn item_id(&self) -> Option<ItemId> {
        match self {
            UploadEvent::StatusChanged { item_id, .. } => Some(*item_id),
            UploadEvent::Progress { item_id, .. } => Some(*item_id),
            UploadEvent::Succeeded { item_id, .. } => Some(*item_id),
            UploadEvent::Retrying { item_id, .. } => Some(*item_id),
            UploadEvent::Failed { item_id, .. } => Some(*item_id),
            UploadEvent::Cancelled { item_id } => Some(*item_id),
            UploadEvent::Submitted { .. }
            | UploadEvent::BatchCompleted { .. }
            | UploadEvent::Cleared { .. } => None,
        }
    }

    /// 获取事件类型名称
    pub fn event_type_name(&self) -> &'static str {
        match self {
            UploadEvent::Submitted { .. } => "submitted",
            UploadEvent::StatusChanged { .. } => "status_changed",
            UploadEvent::Progress { .. } => "progress",
            UploadEvent::Succeeded { .. } => "succeeded",
            UploadEvent::Retrying { .. } => "retrying",
            UploadEvent::Failed { .. } => "failed",
            UploadEvent::Cancelled { .. } => "cancelled",
            UploadEvent::BatchCompleted { .. } => "batch_completed",
            UploadEvent::Cleared { .. } => "cleared",
        }
    }
}

/// 推送给订阅方的通知：事件 + 事件发生时的整体统计
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadNotification {
    pub event: UploadEvent,
    pub aggregate: BatchProgress,
}

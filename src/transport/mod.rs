// 传输适配器模块
//
// 编排器只通过这里定义的契约和实际的网络传输交互：
// - 每次尝试调用一次 `TransportAdapter::transfer`
// - 进度通过 `ProgressReporter` 推送
// - 中止通过 `CancellationToken` 发出，适配器返回 `TransferError::Aborted` 作为确认
//
// 适配器的每条消息都会被包装成 `TransferEvent`，经同一个通道送回调度器

pub mod http;

use crate::uploader::{BatchId, ItemId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use http::HttpTransport;

/// 传输错误
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum TransferError {
    /// 临时错误（网络故障、服务器 5xx），可以重试
    #[error("传输失败: {0}")]
    Transient(String),
    /// 服务器明确拒绝（如校验失败），不可重试
    #[error("服务器拒绝: {0}")]
    Rejected(String),
    /// 传输已按请求中止（中止确认）
    #[error("传输已中止")]
    Aborted,
}

impl TransferError {
    pub fn transient(message: impl Into<String>) -> Self {
        TransferError::Transient(message.into())
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        TransferError::Rejected(message.into())
    }

    /// 是否允许重试
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransferError::Transient(_))
    }
}

/// 单次尝试的传输消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// 进度更新 (0-100)
    Progress(u8),
    /// 传输成功，携带结果地址
    Success(String),
    /// 传输失败
    Failure(TransferError),
    /// 中止确认
    Aborted,
}

impl TransferOutcome {
    /// 是否为终态消息
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransferOutcome::Progress(_))
    }
}

impl From<Result<String, TransferError>> for TransferOutcome {
    fn from(result: Result<String, TransferError>) -> Self {
        match result {
            Ok(url) => TransferOutcome::Success(url),
            Err(TransferError::Aborted) => TransferOutcome::Aborted,
            Err(e) => TransferOutcome::Failure(e),
        }
    }
}

/// 发往调度器的传输事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferEvent {
    pub item_id: ItemId,
    /// 产生该事件的启动序号（与条目的 sequence 对应）
    pub sequence: u32,
    pub outcome: TransferOutcome,
}

/// 单次传输请求
#[derive(Debug, Clone)]
pub struct TransferRequest<P> {
    pub item_id: ItemId,
    pub batch_id: BatchId,
    /// 第几次尝试（从 1 开始，重新入队失败条目后从 1 重新计数）
    pub attempt: u32,
    /// 启动序号（同一条目内单调递增，用于识别过期消息）
    pub sequence: u32,
    pub payload: P,
}

/// 进度上报器
///
/// 只推送比上次更大的百分比，避免无效事件
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    item_id: ItemId,
    sequence: u32,
    tx: mpsc::UnboundedSender<TransferEvent>,
    last_percent: Arc<AtomicU8>,
}

impl ProgressReporter {
    pub fn new(item_id: ItemId, sequence: u32, tx: mpsc::UnboundedSender<TransferEvent>) -> Self {
        Self {
            item_id,
            sequence,
            tx,
            last_percent: Arc::new(AtomicU8::new(0)),
        }
    }

    /// 上报百分比进度
    pub fn report(&self, percent: u8) {
        let percent = percent.min(100);
        let previous = self.last_percent.fetch_max(percent, Ordering::SeqCst);
        if percent <= previous {
            return;
        }
        // 调度器已退出时丢弃
        let _ = self.tx.send(TransferEvent {
            item_id: self.item_id,
            sequence: self.sequence,
            outcome: TransferOutcome::Progress(percent),
        });
    }

    /// 按字节数上报进度
    pub fn report_bytes(&self, sent: u64, total: u64) {
        if total == 0 {
            return;
        }
        let percent = (sent.min(total) * 100 / total) as u8;
        self.report(percent);
    }
}

/// 传输适配器
///
/// 实现方负责真正的网络传输。收到中止信号后应尽快返回 `Err(TransferError::Aborted)`；
/// 单次传输的超时也由实现方负责，并以普通失败的形式返回
#[async_trait]
pub trait TransportAdapter<P: Send + 'static>: Send + Sync {
    /// 执行一次传输，成功时返回结果地址
    async fn transfer(
        &self,
        request: TransferRequest<P>,
        progress: ProgressReporter,
        abort: CancellationToken,
    ) -> Result<String, TransferError>;
}

//! 编排器错误类型

use crate::uploader::BatchId;

/// 编排器错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrchestratorError {
    /// 配置无效
    #[error("配置无效: {0}")]
    InvalidConfig(String),
    /// 调度任务已停止
    #[error("上传调度器已停止")]
    SchedulerStopped,
    /// 批次不存在
    #[error("批次不存在: {0}")]
    BatchNotFound(BatchId),
    /// 批次仍有未结束的条目
    #[error("批次 {batch_id} 仍有 {active} 个未结束的条目")]
    BatchActive { batch_id: BatchId, active: usize },
}

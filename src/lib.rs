// Upload Orchestrator Library
// 多文件并发上传编排核心库

// 配置管理模块
pub mod config;

// 错误类型
pub mod error;

// 日志系统
pub mod logging;

// 传输适配器模块
pub mod transport;

// 上传编排模块
pub mod uploader;

// 导出常用类型
pub use config::{AbortMode, AppConfig, LogConfig, TransportConfig, UploadConfig};
pub use error::OrchestratorError;
pub use transport::{
    HttpTransport, ProgressReporter, TransferError, TransferEvent, TransferOutcome,
    TransferRequest, TransportAdapter,
};
pub use uploader::{
    BatchHandle, BatchId, BatchProgress, DefaultRetryPolicy, FailedItem, ItemId, ItemState,
    QueueManager, RetryDecision, RetryPolicy, Snapshot, TransferItem, UploadEvent, UploadManager,
    UploadNotification,
};

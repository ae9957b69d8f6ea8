// 上传管理器
//
// 对外的编排接口：
// - submit / cancel / cancel_all / retry_failed / clear_* 都不阻塞，只向调度任务发送命令
// - 调度任务独占 QueueManager，所有状态修改都在这一个任务内串行执行
// - 传输在独立的 tokio 任务中并发运行，结果经通道回到调度任务
// - 快照通过 watch 发布（拉取），通知通过 broadcast 推送（订阅）

use crate::config::UploadConfig;
use crate::error::OrchestratorError;
use crate::transport::{
    ProgressReporter, TransferError, TransferEvent, TransferOutcome, TransferRequest,
    TransportAdapter,
};
use crate::uploader::queue::{Effect, QueueManager, Snapshot};
use crate::uploader::{BatchId, DefaultRetryPolicy, ItemId, RetryPolicy, UploadNotification};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 提交批次后返回的句柄
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchHandle {
    pub batch_id: BatchId,
    /// 按提交顺序排列的条目 ID
    pub item_ids: Vec<ItemId>,
}

/// 调度任务命令
enum Command<P> {
    Submit {
        batch_id: BatchId,
        files: Vec<(ItemId, P)>,
    },
    Cancel(ItemId),
    CancelAll,
    RetryFailed,
    ClearBatch {
        batch_id: BatchId,
        reply: oneshot::Sender<Result<usize, OrchestratorError>>,
    },
    ClearFinished,
    Shutdown,
}

/// 调度任务发布的状态
#[derive(Debug, Clone)]
struct Published<P> {
    /// 已处理的命令数
    processed: u64,
    snapshot: Snapshot<P>,
}

/// 上传管理器
pub struct UploadManager<P> {
    commands: mpsc::UnboundedSender<Command<P>>,
    /// 已发送的命令数
    sent: Arc<AtomicU64>,
    state_rx: watch::Receiver<Published<P>>,
    events_tx: broadcast::Sender<UploadNotification>,
    worker: Option<JoinHandle<()>>,
}

impl<P> UploadManager<P>
where
    P: Clone + Send + Sync + 'static,
{
    /// 创建上传管理器（使用默认重试策略）
    ///
    /// 必须在 tokio 运行时内调用
    pub fn new(
        config: &UploadConfig,
        transport: Arc<dyn TransportAdapter<P>>,
    ) -> Result<Self, OrchestratorError> {
        Self::with_retry_policy(
            config,
            transport,
            Arc::new(DefaultRetryPolicy::from_config(config)),
        )
    }

    /// 创建上传管理器（自定义重试策略）
    pub fn with_retry_policy(
        config: &UploadConfig,
        transport: Arc<dyn TransportAdapter<P>>,
        retry_policy: Arc<dyn RetryPolicy>,
    ) -> Result<Self, OrchestratorError> {
        config.validate()?;
        let queue = QueueManager::new(config.max_concurrent, config.abort_mode, retry_policy)?;

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (transfer_tx, transfer_rx) = mpsc::unbounded_channel();
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(Published {
            processed: 0,
            snapshot: Snapshot::default(),
        });
        let (events_tx, _) = broadcast::channel(config.event_buffer);

        info!(
            "上传管理器启动: 最大并发={}, 最大尝试={}, 退避={}ms, 取消模式={:?}",
            config.max_concurrent, config.max_attempts, config.retry_backoff_ms, config.abort_mode
        );

        let scheduler = Scheduler {
            queue,
            transport,
            abort_tokens: HashMap::new(),
            transfer_tx,
            retry_tx,
            state_tx,
            events_tx: events_tx.clone(),
            processed: 0,
        };
        let worker = tokio::spawn(scheduler.run(command_rx, transfer_rx, retry_rx));

        Ok(Self {
            commands,
            sent: Arc::new(AtomicU64::new(0)),
            state_rx,
            events_tx,
            worker: Some(worker),
        })
    }

    fn send(&self, command: Command<P>) -> Result<(), OrchestratorError> {
        self.commands
            .send(command)
            .map_err(|_| OrchestratorError::SchedulerStopped)?;
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// 提交一批文件
    ///
    /// 立即返回句柄；条目按给出的顺序排队
    pub fn submit(&self, files: Vec<P>) -> Result<BatchHandle, OrchestratorError> {
        let batch_id = BatchId::new();
        let files: Vec<(ItemId, P)> = files.into_iter().map(|f| (ItemId::new(), f)).collect();
        let item_ids = files.iter().map(|(id, _)| *id).collect();

        self.send(Command::Submit { batch_id, files })?;
        Ok(BatchHandle { batch_id, item_ids })
    }

    /// 取消单个条目（重复调用无副作用）
    pub fn cancel(&self, item_id: ItemId) -> Result<(), OrchestratorError> {
        self.send(Command::Cancel(item_id))
    }

    /// 取消所有未结束的条目
    pub fn cancel_all(&self) -> Result<(), OrchestratorError> {
        self.send(Command::CancelAll)
    }

    /// 重新入队所有最终失败的条目（尝试次数清零）
    pub fn retry_failed(&self) -> Result<(), OrchestratorError> {
        self.send(Command::RetryFailed)
    }

    /// 清除一个已全部结束的批次
    pub async fn clear_batch(&self, batch_id: BatchId) -> Result<usize, OrchestratorError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ClearBatch { batch_id, reply })?;
        rx.await.map_err(|_| OrchestratorError::SchedulerStopped)?
    }

    /// 清除所有已结束的条目
    pub fn clear_finished(&self) -> Result<(), OrchestratorError> {
        self.send(Command::ClearFinished)
    }

    /// 当前快照（不等待尚未处理的命令）
    pub fn snapshot(&self) -> Snapshot<P> {
        self.state_rx.borrow().snapshot.clone()
    }

    /// 订阅通知
    pub fn subscribe(&self) -> broadcast::Receiver<UploadNotification> {
        self.events_tx.subscribe()
    }

    /// 等待直到快照满足条件
    ///
    /// 只考虑已处理完此前所有命令之后的快照
    pub async fn wait_until<F>(&self, mut predicate: F) -> Result<Snapshot<P>, OrchestratorError>
    where
        F: FnMut(&Snapshot<P>) -> bool,
    {
        let target = self.sent.load(Ordering::SeqCst);
        let mut rx = self.state_rx.clone();
        let published = rx
            .wait_for(|state| state.processed >= target && predicate(&state.snapshot))
            .await
            .map_err(|_| OrchestratorError::SchedulerStopped)?;
        Ok(published.snapshot.clone())
    }

    /// 等待所有条目进入终态
    pub async fn wait_idle(&self) -> Result<Snapshot<P>, OrchestratorError> {
        self.wait_until(|snapshot| snapshot.aggregate.is_idle()).await
    }

    /// 停止调度：取消全部条目，中止所有传输
    pub async fn shutdown(mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                error!("上传调度任务异常退出: {}", e);
            }
        }
    }
}

/// 调度任务（单写者）
struct Scheduler<P> {
    queue: QueueManager<P>,
    transport: Arc<dyn TransportAdapter<P>>,
    /// 传输中条目的中止令牌（item_id -> (sequence, token)）
    abort_tokens: HashMap<ItemId, (u32, CancellationToken)>,
    transfer_tx: mpsc::UnboundedSender<TransferEvent>,
    retry_tx: mpsc::UnboundedSender<(ItemId, u32)>,
    state_tx: watch::Sender<Published<P>>,
    events_tx: broadcast::Sender<UploadNotification>,
    processed: u64,
}

impl<P> Scheduler<P>
where
    P: Clone + Send + Sync + 'static,
{
    async fn run(
        mut self,
        mut command_rx: mpsc::UnboundedReceiver<Command<P>>,
        mut transfer_rx: mpsc::UnboundedReceiver<TransferEvent>,
        mut retry_rx: mpsc::UnboundedReceiver<(ItemId, u32)>,
    ) {
        loop {
            tokio::select! {
                command = command_rx.recv() => {
                    match command {
                        Some(Command::Shutdown) | None => break,
                        Some(command) => {
                            self.handle_command(command);
                            self.processed += 1;
                        }
                    }
                }
                Some(event) = transfer_rx.recv() => {
                    if event.outcome.is_terminal() {
                        self.forget_token(event.item_id, event.sequence);
                    }
                    self.queue.handle(event);
                }
                Some((item_id, sequence)) = retry_rx.recv() => {
                    self.queue.retry_due(item_id, sequence);
                }
            }
            self.apply_effects();
        }

        info!("上传调度器正在停止，取消所有未结束的条目");
        self.queue.cancel_all();
        self.apply_effects();
        for (_, (_, token)) in self.abort_tokens.drain() {
            token.cancel();
        }
    }

    fn handle_command(&mut self, command: Command<P>) {
        match command {
            Command::Submit { batch_id, files } => self.queue.enqueue(batch_id, files),
            Command::Cancel(item_id) => {
                self.queue.cancel(item_id);
            }
            Command::CancelAll => {
                self.queue.cancel_all();
            }
            Command::RetryFailed => {
                self.queue.retry_failed();
            }
            Command::ClearBatch { batch_id, reply } => {
                let _ = reply.send(self.queue.clear_batch(batch_id));
            }
            Command::ClearFinished => {
                self.queue.clear_finished();
            }
            Command::Shutdown => {}
        }
    }

    /// 执行队列累积的动作并发布最新快照
    fn apply_effects(&mut self) {
        for effect in self.queue.take_effects() {
            match effect {
                Effect::Start(request) => self.spawn_transfer(request),
                Effect::Abort { item_id, sequence } => self.abort(item_id, sequence),
                Effect::ScheduleRetry {
                    item_id,
                    sequence,
                    delay,
                } => {
                    let retry_tx = self.retry_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = retry_tx.send((item_id, sequence));
                    });
                }
                Effect::Notify(notification) => {
                    // 没有订阅者时发送失败，忽略
                    let _ = self.events_tx.send(notification);
                }
            }
        }

        let published = Published {
            processed: self.processed,
            snapshot: self.queue.snapshot(),
        };
        self.state_tx.send_replace(published);
    }

    /// 在独立任务中执行一次传输
    fn spawn_transfer(&mut self, request: TransferRequest<P>) {
        let item_id = request.item_id;
        let sequence = request.sequence;
        let token = CancellationToken::new();
        self.abort_tokens.insert(item_id, (sequence, token.clone()));

        let transport = self.transport.clone();
        let transfer_tx = self.transfer_tx.clone();
        let reporter = ProgressReporter::new(item_id, sequence, transfer_tx.clone());

        tokio::spawn(async move {
            let handle =
                tokio::spawn(async move { transport.transfer(request, reporter, token).await });

            let outcome = match handle.await {
                Ok(result) => TransferOutcome::from(result),
                Err(e) => {
                    error!("传输任务异常退出: item={}, 错误: {}", item_id, e);
                    TransferOutcome::Failure(TransferError::transient(format!(
                        "传输任务异常退出: {}",
                        e
                    )))
                }
            };

            if transfer_tx
                .send(TransferEvent {
                    item_id,
                    sequence,
                    outcome,
                })
                .is_err()
            {
                debug!("调度器已停止，丢弃传输结果: {}", item_id);
            }
        });
    }

    /// 发出中止信号（每次启动最多一次）
    fn abort(&mut self, item_id: ItemId, sequence: u32) {
        match self.abort_tokens.remove(&item_id) {
            Some((token_sequence, token)) if token_sequence == sequence => {
                info!("中止传输: item={}, sequence={}", item_id, sequence);
                token.cancel();
            }
            Some(entry) => {
                warn!(
                    "中止令牌与启动序号不匹配: item={}, 期望 {}, 实际 {}",
                    item_id, sequence, entry.0
                );
                self.abort_tokens.insert(item_id, entry);
            }
            None => debug!("没有可中止的传输: {}", item_id),
        }
    }

    fn forget_token(&mut self, item_id: ItemId, sequence: u32) {
        if let Some((token_sequence, _)) = self.abort_tokens.get(&item_id) {
            if *token_sequence == sequence {
                self.abort_tokens.remove(&item_id);
            }
        }
    }
}

// 队列管理器
//
// 负责准入控制和调度：
// - 等待队列 FIFO（按入队顺序，重试的条目追加到队尾）
// - 并发槽位上限（tick 是唯一把条目置为 InFlight 的入口）
// - 处理传输适配器回传的进度/成功/失败/中止确认
//
// 本结构体不做任何 IO，所有对外动作都以 Effect 的形式累积，
// 由 UploadManager 的调度任务取出并执行。调用方必须保证单写者（同一时刻只有一个调用在修改状态）

use crate::config::{AbortMode, UploadConfig};
use crate::error::OrchestratorError;
use crate::transport::{TransferError, TransferEvent, TransferOutcome, TransferRequest};
use crate::uploader::{
    BatchId, BatchProgress, DefaultRetryPolicy, FailedItem, ItemId, ItemState, RetryDecision,
    RetryPolicy, TransferItem, UploadEvent, UploadNotification,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// 队列产生的待执行动作
#[derive(Debug, Clone)]
pub enum Effect<P> {
    /// 启动一次传输
    Start(TransferRequest<P>),
    /// 通知适配器中止（每次启动最多一次）
    Abort { item_id: ItemId, sequence: u32 },
    /// 延迟后把条目放回等待队列
    ScheduleRetry {
        item_id: ItemId,
        sequence: u32,
        delay: Duration,
    },
    /// 推送通知
    Notify(UploadNotification),
}

/// 条目与整体统计的快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot<P> {
    /// 按入队顺序排列
    pub items: Vec<TransferItem<P>>,
    pub aggregate: BatchProgress,
}

impl<P> Default for Snapshot<P> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            aggregate: BatchProgress::default(),
        }
    }
}

impl<P> Snapshot<P> {
    pub fn get(&self, item_id: ItemId) -> Option<&TransferItem<P>> {
        self.items.iter().find(|item| item.id == item_id)
    }

    /// 最终失败的条目列表
    pub fn failed_items(&self) -> Vec<FailedItem> {
        self.items
            .iter()
            .filter(|item| item.state == ItemState::Failed)
            .map(|item| FailedItem {
                item_id: item.id,
                error: item.last_error.clone().unwrap_or_default(),
                attempts: item.attempt_count,
            })
            .collect()
    }
}

/// 队列管理器
#[derive(Debug)]
pub struct QueueManager<P> {
    /// 所有条目（item_id -> item）
    pub(crate) items: HashMap<ItemId, TransferItem<P>>,
    /// 入队顺序
    pub(crate) order: Vec<ItemId>,
    /// 批次 -> 条目列表
    pub(crate) batches: HashMap<BatchId, Vec<ItemId>>,
    /// 等待队列（FIFO）
    pub(crate) pending: VecDeque<ItemId>,
    /// 处于退避等待中的条目（状态为 Pending，但暂不参与调度）
    pub(crate) parked: HashSet<ItemId>,
    /// 占用槽位的条目
    pub(crate) active: HashSet<ItemId>,
    /// 已发出中止、等待确认的条目（仅 AwaitAck 模式）
    pub(crate) abort_requested: HashSet<ItemId>,
    /// 已发布过完成事件的批次
    pub(crate) completed_batches: HashSet<BatchId>,
    /// 最大并发传输数
    pub(crate) max_concurrent: usize,
    pub(crate) abort_mode: AbortMode,
    retry_policy: Arc<dyn RetryPolicy>,
    effects: Vec<Effect<P>>,
}

impl<P: Clone> QueueManager<P> {
    /// 创建队列管理器
    ///
    /// # 参数
    /// * `max_concurrent` - 最大并发传输数（必须大于 0）
    /// * `abort_mode` - 取消传输中条目时槽位的释放时机
    /// * `retry_policy` - 失败后的重试策略
    pub fn new(
        max_concurrent: usize,
        abort_mode: AbortMode,
        retry_policy: Arc<dyn RetryPolicy>,
    ) -> Result<Self, OrchestratorError> {
        if max_concurrent == 0 {
            return Err(OrchestratorError::InvalidConfig(
                "max_concurrent 必须大于 0".to_string(),
            ));
        }

        Ok(Self {
            items: HashMap::new(),
            order: Vec::new(),
            batches: HashMap::new(),
            pending: VecDeque::new(),
            parked: HashSet::new(),
            active: HashSet::new(),
            abort_requested: HashSet::new(),
            completed_batches: HashSet::new(),
            max_concurrent,
            abort_mode,
            retry_policy,
            effects: Vec::new(),
        })
    }

    /// 从上传配置创建（使用默认重试策略）
    pub fn from_config(config: &UploadConfig) -> Result<Self, OrchestratorError> {
        config.validate()?;
        Self::new(
            config.max_concurrent,
            config.abort_mode,
            Arc::new(DefaultRetryPolicy::from_config(config)),
        )
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// 当前占用的槽位数
    pub fn in_flight_count(&self) -> usize {
        self.active.len()
    }

    /// 可立即调度的等待条目数（不含退避中的条目）
    pub fn ready_count(&self) -> usize {
        self.pending.len()
    }

    pub fn get(&self, item_id: ItemId) -> Option<&TransferItem<P>> {
        self.items.get(&item_id)
    }

    /// 取出累积的动作
    pub fn take_effects(&mut self) -> Vec<Effect<P>> {
        std::mem::take(&mut self.effects)
    }

    /// 整体统计（每次从条目集合重新计算）
    pub fn aggregate(&self) -> BatchProgress {
        BatchProgress::from_items(self.items.values())
    }

    /// 当前快照
    pub fn snapshot(&self) -> Snapshot<P> {
        Snapshot {
            items: self
                .order
                .iter()
                .filter_map(|id| self.items.get(id))
                .cloned()
                .collect(),
            aggregate: self.aggregate(),
        }
    }

    /// 批量入队
    ///
    /// 条目按调用方给出的顺序进入等待队列，随后立即尝试填满空闲槽位
    pub fn enqueue(&mut self, batch_id: BatchId, files: Vec<(ItemId, P)>) {
        let mut item_ids = Vec::with_capacity(files.len());

        for (item_id, payload) in files {
            if self.items.contains_key(&item_id) {
                warn!("条目已存在，忽略重复入队: {}", item_id);
                continue;
            }
            self.items
                .insert(item_id, TransferItem::new(item_id, batch_id, payload));
            self.order.push(item_id);
            self.pending.push_back(item_id);
            item_ids.push(item_id);
        }
        self.batches
            .entry(batch_id)
            .or_default()
            .extend(item_ids.iter().copied());

        info!(
            "批次入队: batch={}, 条目数={}, 等待={}, 传输中={}",
            batch_id,
            item_ids.len(),
            self.pending.len(),
            self.active.len()
        );

        self.emit(UploadEvent::Submitted { batch_id, item_ids });
        self.tick();
        self.check_batch_completion(batch_id);
    }

    /// 调度：在槽位未满时按 FIFO 启动等待中的条目
    ///
    /// 这是唯一允许把条目置为 InFlight 的地方
    pub(crate) fn tick(&mut self) {
        while self.active.len() < self.max_concurrent {
            let Some(item_id) = self.pending.pop_front() else {
                break;
            };

            let Some(item) = self.items.get_mut(&item_id) else {
                continue;
            };
            if item.state != ItemState::Pending {
                warn!("等待队列中的条目状态异常，跳过: {} ({})", item_id, item.state);
                continue;
            }

            item.mark_in_flight();
            let request = TransferRequest {
                item_id,
                batch_id: item.batch_id,
                attempt: item.attempt_count,
                sequence: item.sequence,
                payload: item.payload.clone(),
            };
            self.active.insert(item_id);

            info!(
                "启动传输: item={}, 第 {} 次尝试, 槽位 {}/{}",
                item_id,
                request.attempt,
                self.active.len(),
                self.max_concurrent
            );

            self.emit(UploadEvent::StatusChanged {
                item_id,
                old_state: ItemState::Pending,
                new_state: ItemState::InFlight,
            });
            self.effects.push(Effect::Start(request));
        }
    }

    /// 处理传输适配器回传的事件
    pub fn handle(&mut self, event: TransferEvent) {
        let TransferEvent {
            item_id,
            sequence,
            outcome,
        } = event;

        match outcome {
            TransferOutcome::Progress(percent) => self.on_progress(item_id, sequence, percent),
            TransferOutcome::Success(url) => self.on_success(item_id, sequence, url),
            TransferOutcome::Failure(error) => self.on_failure(item_id, sequence, error),
            TransferOutcome::Aborted => self.on_aborted(item_id, sequence),
        }
    }

    /// 检查事件是否属于条目当前这次启动
    ///
    /// 按启动序号而不是尝试次数比较：retry_failed 会把尝试次数清零
    fn is_current(&self, item_id: ItemId, sequence: u32) -> bool {
        match self.items.get(&item_id) {
            Some(item) => item.state == ItemState::InFlight && item.sequence == sequence,
            None => false,
        }
    }

    /// 进度更新：只修改该条目的进度，不改变状态
    pub fn on_progress(&mut self, item_id: ItemId, sequence: u32, percent: u8) {
        if !self.is_current(item_id, sequence) {
            debug!("丢弃过期进度事件: item={}, sequence={}", item_id, sequence);
            return;
        }

        let changed = match self.items.get_mut(&item_id) {
            Some(item) => item.update_progress(percent),
            None => false,
        };
        if !changed {
            return;
        }

        let percent = self
            .items
            .get(&item_id)
            .map(|item| item.progress_percent)
            .unwrap_or_default();
        debug!("传输进度: item={}, {}%", item_id, percent);
        self.emit(UploadEvent::Progress { item_id, percent });
    }

    /// 传输成功
    pub fn on_success(&mut self, item_id: ItemId, sequence: u32, url: String) {
        if !self.is_current(item_id, sequence) {
            debug!("丢弃过期成功事件: item={}, sequence={}", item_id, sequence);
            return;
        }

        self.release_slot(item_id);
        self.abort_requested.remove(&item_id);

        let Some(item) = self.items.get_mut(&item_id) else {
            return;
        };
        item.mark_succeeded(url.clone());
        let batch_id = item.batch_id;

        info!("传输成功: item={}, url={}", item_id, url);

        self.emit(UploadEvent::StatusChanged {
            item_id,
            old_state: ItemState::InFlight,
            new_state: ItemState::Succeeded,
        });
        self.emit(UploadEvent::Succeeded { item_id, url });

        self.tick();
        self.check_batch_completion(batch_id);
    }

    /// 传输失败：释放槽位，咨询重试策略
    pub fn on_failure(&mut self, item_id: ItemId, sequence: u32, error: TransferError) {
        if !self.is_current(item_id, sequence) {
            debug!("丢弃过期失败事件: item={}, sequence={}", item_id, sequence);
            return;
        }

        // 已请求中止的条目，失败视为中止确认
        if self.abort_requested.contains(&item_id) {
            debug!("已请求中止的条目返回失败，按中止处理: {}", item_id);
            self.finish_cancel(item_id);
            return;
        }

        self.release_slot(item_id);

        let message = error.to_string();
        let Some(item) = self.items.get_mut(&item_id) else {
            return;
        };
        item.mark_failed(message.clone());
        let batch_id = item.batch_id;
        let attempts = item.attempt_count;
        let sequence = item.sequence;

        self.emit(UploadEvent::StatusChanged {
            item_id,
            old_state: ItemState::InFlight,
            new_state: ItemState::Failed,
        });

        match self.retry_policy.decide(attempts, &error) {
            RetryDecision::Retry { delay } => {
                warn!(
                    "传输失败，重新入队: item={}, 第 {} 次尝试, 延迟 {:?}, 错误: {}",
                    item_id, attempts, delay, message
                );
                if let Some(item) = self.items.get_mut(&item_id) {
                    item.reset_for_retry();
                }
                self.emit(UploadEvent::StatusChanged {
                    item_id,
                    old_state: ItemState::Failed,
                    new_state: ItemState::Pending,
                });
                self.emit(UploadEvent::Retrying {
                    item_id,
                    attempt: attempts,
                    error: message,
                    delay_ms: delay.as_millis() as u64,
                });

                if delay.is_zero() {
                    self.pending.push_back(item_id);
                } else {
                    self.parked.insert(item_id);
                    self.effects.push(Effect::ScheduleRetry {
                        item_id,
                        sequence,
                        delay,
                    });
                }
            }
            RetryDecision::GiveUp => {
                error!(
                    "传输最终失败: item={}, 共尝试 {} 次, 错误: {}",
                    item_id, attempts, message
                );
                self.emit(UploadEvent::Failed {
                    item_id,
                    error: message,
                    attempts,
                });
            }
        }

        self.tick();
        self.check_batch_completion(batch_id);
    }

    /// 中止确认
    pub fn on_aborted(&mut self, item_id: ItemId, sequence: u32) {
        if !self.is_current(item_id, sequence) {
            debug!("丢弃过期中止确认: item={}, sequence={}", item_id, sequence);
            return;
        }

        if self.abort_requested.contains(&item_id) {
            self.finish_cancel(item_id);
        } else {
            // 未请求中止却收到中止确认，按临时错误处理
            warn!("条目未请求中止却被中止: {}", item_id);
            self.on_failure(
                item_id,
                sequence,
                TransferError::transient("传输被意外中止"),
            );
        }
    }

    /// 退避结束，把条目放回等待队列末尾
    pub fn retry_due(&mut self, item_id: ItemId, sequence: u32) {
        if !self.parked.remove(&item_id) {
            return;
        }
        match self.items.get(&item_id) {
            Some(item) if item.state == ItemState::Pending && item.sequence == sequence => {
                debug!("退避结束，重新入队: {}", item_id);
                self.pending.push_back(item_id);
                self.tick();
            }
            _ => debug!("退避结束但条目已不在等待状态: {}", item_id),
        }
    }

    /// 重新入队所有最终失败的条目，并重置尝试次数
    ///
    /// # 返回
    /// 重新入队的条目数
    pub fn retry_failed(&mut self) -> usize {
        let failed: Vec<ItemId> = self
            .order
            .iter()
            .copied()
            .filter(|id| {
                self.items
                    .get(id)
                    .is_some_and(|item| item.state == ItemState::Failed)
            })
            .collect();

        for item_id in &failed {
            if let Some(item) = self.items.get_mut(item_id) {
                item.reset_for_retry();
                item.attempt_count = 0;
                self.completed_batches.remove(&item.batch_id);
            }
            self.pending.push_back(*item_id);
            self.emit(UploadEvent::StatusChanged {
                item_id: *item_id,
                old_state: ItemState::Failed,
                new_state: ItemState::Pending,
            });
        }

        if !failed.is_empty() {
            info!("重新入队 {} 个失败条目", failed.len());
        }

        self.tick();
        failed.len()
    }

    /// 清除一个批次（批次内所有条目必须已进入终态）
    pub fn clear_batch(&mut self, batch_id: BatchId) -> Result<usize, OrchestratorError> {
        let item_ids = self
            .batches
            .get(&batch_id)
            .cloned()
            .ok_or(OrchestratorError::BatchNotFound(batch_id))?;

        let active = item_ids
            .iter()
            .filter_map(|id| self.items.get(id))
            .filter(|item| !item.is_terminal())
            .count();
        if active > 0 {
            return Err(OrchestratorError::BatchActive { batch_id, active });
        }

        self.batches.remove(&batch_id);
        self.completed_batches.remove(&batch_id);
        self.remove_items(&item_ids);

        info!("清除批次: batch={}, 条目数={}", batch_id, item_ids.len());
        self.emit(UploadEvent::Cleared { item_ids: item_ids.clone() });
        Ok(item_ids.len())
    }

    /// 清除所有已进入终态的条目
    pub fn clear_finished(&mut self) -> usize {
        let finished: Vec<ItemId> = self
            .order
            .iter()
            .copied()
            .filter(|id| self.items.get(id).is_some_and(|item| item.is_terminal()))
            .collect();
        if finished.is_empty() {
            return 0;
        }

        self.remove_items(&finished);
        let removed: HashSet<ItemId> = finished.iter().copied().collect();
        for ids in self.batches.values_mut() {
            ids.retain(|id| !removed.contains(id));
        }
        let emptied: Vec<BatchId> = self
            .batches
            .iter()
            .filter(|(_, ids)| ids.is_empty())
            .map(|(batch_id, _)| *batch_id)
            .collect();
        for batch_id in emptied {
            self.batches.remove(&batch_id);
            self.completed_batches.remove(&batch_id);
        }

        info!("清除了 {} 个已结束的条目", finished.len());
        let count = finished.len();
        self.emit(UploadEvent::Cleared { item_ids: finished });
        count
    }

    fn remove_items(&mut self, item_ids: &[ItemId]) {
        let removed: HashSet<ItemId> = item_ids.iter().copied().collect();
        for item_id in item_ids {
            self.items.remove(item_id);
        }
        self.order.retain(|id| !removed.contains(id));
    }

    /// 释放槽位（每次尝试只会释放一次）
    pub(crate) fn release_slot(&mut self, item_id: ItemId) {
        if self.active.remove(&item_id) {
            debug!(
                "释放槽位: item={}, 剩余占用 {}/{}",
                item_id,
                self.active.len(),
                self.max_concurrent
            );
        } else {
            error!("释放槽位失败：条目未占用槽位: {}", item_id);
        }
    }

    /// 检查批次是否全部进入终态，是则发布一次完成事件
    pub(crate) fn check_batch_completion(&mut self, batch_id: BatchId) {
        if self.completed_batches.contains(&batch_id) {
            return;
        }
        let Some(item_ids) = self.batches.get(&batch_id) else {
            return;
        };

        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        let mut cancelled = Vec::new();
        for item_id in item_ids {
            let Some(item) = self.items.get(item_id) else {
                continue;
            };
            match item.state {
                ItemState::Succeeded => succeeded.push(item.id),
                ItemState::Cancelled => cancelled.push(item.id),
                ItemState::Failed => failed.push(FailedItem {
                    item_id: item.id,
                    error: item.last_error.clone().unwrap_or_default(),
                    attempts: item.attempt_count,
                }),
                ItemState::Pending | ItemState::InFlight => return,
            }
        }

        self.completed_batches.insert(batch_id);
        info!(
            "批次完成: batch={}, 成功={}, 失败={}, 取消={}",
            batch_id,
            succeeded.len(),
            failed.len(),
            cancelled.len()
        );
        self.emit(UploadEvent::BatchCompleted {
            batch_id,
            succeeded,
            failed,
            cancelled,
        });
    }

    /// 记录通知（附带当前整体统计）
    pub(crate) fn emit(&mut self, event: UploadEvent) {
        let aggregate = self.aggregate();
        self.effects
            .push(Effect::Notify(UploadNotification { event, aggregate }));
    }

    pub(crate) fn push_effect(&mut self, effect: Effect<P>) {
        self.effects.push(effect);
    }
}

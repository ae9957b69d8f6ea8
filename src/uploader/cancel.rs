// 取消控制
//
// | 当前状态                    | 取消后                              |
// |-----------------------------|-------------------------------------|
// | Pending                     | Cancelled（不涉及槽位）             |
// | InFlight                    | 发出中止 → Cancelled                |
// | Succeeded/Failed/Cancelled  | 无操作                              |
//
// 传输中条目的槽位释放时机由 AbortMode 决定：
// - Immediate：取消时立即释放，之后到达的中止确认/成功/失败全部丢弃
// - AwaitAck：等待适配器的第一个终态消息，成功则按成功处理，失败或中止确认按取消处理

use crate::config::AbortMode;
use crate::uploader::queue::{Effect, QueueManager};
use crate::uploader::{ItemId, ItemState, UploadEvent};
use tracing::{debug, info, warn};

impl<P: Clone> QueueManager<P> {
    /// 取消单个条目
    ///
    /// # 返回
    /// 本次调用是否产生了效果（重复取消返回 false）
    pub fn cancel(&mut self, item_id: ItemId) -> bool {
        let Some(item) = self.items.get(&item_id) else {
            warn!("取消失败：条目不存在: {}", item_id);
            return false;
        };

        match item.state {
            ItemState::Pending => {
                self.pending.retain(|id| *id != item_id);
                self.parked.remove(&item_id);
                self.mark_cancelled(item_id, ItemState::Pending);
                true
            }
            ItemState::InFlight => {
                if self.abort_requested.contains(&item_id) {
                    debug!("条目已在等待中止确认: {}", item_id);
                    return false;
                }

                let sequence = item.sequence;
                self.push_effect(Effect::Abort { item_id, sequence });

                match self.abort_mode {
                    AbortMode::Immediate => {
                        self.release_slot(item_id);
                        self.mark_cancelled(item_id, ItemState::InFlight);
                        self.tick();
                    }
                    AbortMode::AwaitAck => {
                        info!("已发出中止信号，等待确认: item={}, sequence={}", item_id, sequence);
                        self.abort_requested.insert(item_id);
                    }
                }
                true
            }
            ItemState::Succeeded | ItemState::Failed | ItemState::Cancelled => {
                debug!("条目已处于终态，忽略取消: {} ({})", item_id, item.state);
                false
            }
        }
    }

    /// 取消所有未结束的条目
    ///
    /// 先取消等待中的条目再取消传输中的条目，避免释放的槽位又启动新的传输
    ///
    /// # 返回
    /// 实际被取消（或发出中止）的条目数
    pub fn cancel_all(&mut self) -> usize {
        let mut pending = Vec::new();
        let mut in_flight = Vec::new();
        for item_id in &self.order {
            match self.items.get(item_id).map(|item| item.state) {
                Some(ItemState::Pending) => pending.push(*item_id),
                Some(ItemState::InFlight) => in_flight.push(*item_id),
                _ => {}
            }
        }

        let mut count = 0;
        for item_id in pending.into_iter().chain(in_flight) {
            if self.cancel(item_id) {
                count += 1;
            }
        }

        info!("取消全部条目: 共 {} 个", count);
        count
    }

    /// 中止确认后完成取消（AwaitAck 模式）
    pub(crate) fn finish_cancel(&mut self, item_id: ItemId) {
        self.abort_requested.remove(&item_id);
        self.release_slot(item_id);
        self.mark_cancelled(item_id, ItemState::InFlight);
        self.tick();
    }

    fn mark_cancelled(&mut self, item_id: ItemId, old_state: ItemState) {
        let Some(item) = self.items.get_mut(&item_id) else {
            return;
        };
        item.mark_cancelled();
        let batch_id = item.batch_id;

        info!("条目已取消: {}", item_id);
        self.emit(UploadEvent::StatusChanged {
            item_id,
            old_state,
            new_state: ItemState::Cancelled,
        });
        self.emit(UploadEvent::Cancelled { item_id });
        self.check_batch_completion(batch_id);
    }
}

#[cfg(test)]
mod tests {
    use crate::config::AbortMode;
    use crate::transport::TransferError;
    use crate::uploader::queue::{Effect, QueueManager};
    use crate::uploader::{BatchId, DefaultRetryPolicy, ItemId, ItemState, UploadEvent};
    use std::sync::Arc;

    fn queue(max_concurrent: usize, mode: AbortMode) -> (QueueManager<u32>, Vec<ItemId>) {
        let mut q =
            QueueManager::new(max_concurrent, mode, Arc::new(DefaultRetryPolicy::new(3))).unwrap();
        let files: Vec<_> = (0..3).map(|n| (ItemId::new(), n)).collect();
        let ids = files.iter().map(|(id, _)| *id).collect();
        q.enqueue(BatchId::new(), files);
        q.take_effects();
        (q, ids)
    }

    fn aborts(effects: &[Effect<u32>]) -> usize {
        effects
            .iter()
            .filter(|e| matches!(e, Effect::Abort { .. }))
            .count()
    }

    fn starts(effects: &[Effect<u32>]) -> Vec<ItemId> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Start(req) => Some(req.item_id),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_cancel_pending_item() {
        let (mut q, ids) = queue(1, AbortMode::Immediate);

        assert!(q.cancel(ids[2]));
        assert_eq!(q.get(ids[2]).unwrap().state, ItemState::Cancelled);
        assert_eq!(q.ready_count(), 1);
        let effects = q.take_effects();
        assert_eq!(aborts(&effects), 0);
        assert!(starts(&effects).is_empty());
    }

    #[test]
    fn test_cancel_in_flight_frees_slot_before_ack() {
        let (mut q, ids) = queue(1, AbortMode::Immediate);

        assert!(q.cancel(ids[0]));
        let effects = q.take_effects();
        assert_eq!(aborts(&effects), 1);
        // 中止尚未确认，下一个条目已经拿到槽位
        assert_eq!(starts(&effects), vec![ids[1]]);
        assert_eq!(q.get(ids[0]).unwrap().state, ItemState::Cancelled);
        assert_eq!(q.in_flight_count(), 1);

        // 迟到的中止确认和成功都被丢弃，不会重复释放槽位
        q.on_aborted(ids[0], 1);
        q.on_success(ids[0], 1, "late".to_string());
        assert_eq!(q.get(ids[0]).unwrap().state, ItemState::Cancelled);
        assert_eq!(q.in_flight_count(), 1);
        assert!(starts(&q.take_effects()).is_empty());
    }

    #[test]
    fn test_cancel_twice_is_idempotent() {
        for mode in [AbortMode::Immediate, AbortMode::AwaitAck] {
            let (mut q, ids) = queue(1, mode);

            assert!(q.cancel(ids[0]));
            let first = q.take_effects();
            assert!(!q.cancel(ids[0]));
            let second = q.take_effects();

            assert_eq!(aborts(&first), 1);
            assert!(second.is_empty());
        }
    }

    #[test]
    fn test_await_ack_keeps_slot_until_acknowledged() {
        let (mut q, ids) = queue(1, AbortMode::AwaitAck);

        assert!(q.cancel(ids[0]));
        let effects = q.take_effects();
        assert_eq!(aborts(&effects), 1);
        assert!(starts(&effects).is_empty());
        assert_eq!(q.get(ids[0]).unwrap().state, ItemState::InFlight);

        q.on_aborted(ids[0], 1);
        let effects = q.take_effects();
        assert_eq!(q.get(ids[0]).unwrap().state, ItemState::Cancelled);
        assert_eq!(starts(&effects), vec![ids[1]]);

        // 第二次确认被丢弃
        q.on_aborted(ids[0], 1);
        assert_eq!(q.in_flight_count(), 1);
    }

    #[test]
    fn test_await_ack_success_wins_race() {
        let (mut q, ids) = queue(1, AbortMode::AwaitAck);

        q.cancel(ids[0]);
        q.on_success(ids[0], 1, "https://files/0".to_string());
        q.on_aborted(ids[0], 1);

        assert_eq!(q.get(ids[0]).unwrap().state, ItemState::Succeeded);
        assert_eq!(q.in_flight_count(), 1);
    }

    #[test]
    fn test_await_ack_failure_counts_as_cancel() {
        let (mut q, ids) = queue(1, AbortMode::AwaitAck);

        q.cancel(ids[0]);
        q.on_failure(ids[0], 1, TransferError::transient("连接被中断"));

        let item = q.get(ids[0]).unwrap();
        assert_eq!(item.state, ItemState::Cancelled);
        assert_eq!(item.attempt_count, 1);
    }

    #[test]
    fn test_cancel_terminal_is_noop() {
        let (mut q, ids) = queue(3, AbortMode::Immediate);
        q.on_success(ids[0], 1, "u".to_string());
        q.take_effects();

        assert!(!q.cancel(ids[0]));
        assert!(q.take_effects().is_empty());
        assert!(!q.cancel(ItemId::new()));
    }

    #[test]
    fn test_cancel_all_does_not_start_new_transfers() {
        let (mut q, ids) = queue(2, AbortMode::Immediate);

        assert_eq!(q.cancel_all(), 3);
        let effects = q.take_effects();
        assert_eq!(aborts(&effects), 2);
        assert!(starts(&effects).is_empty());
        for id in &ids {
            assert_eq!(q.get(*id).unwrap().state, ItemState::Cancelled);
        }

        let completed = effects.iter().any(|e| match e {
            Effect::Notify(n) => matches!(
                &n.event,
                UploadEvent::BatchCompleted { cancelled, .. } if cancelled.len() == 3
            ),
            _ => false,
        });
        assert!(completed);
        assert_eq!(q.cancel_all(), 0);
    }
}

//! 批次进度聚合
//!
//! 每次调用都从条目集合重新计算，不保留任何增量状态

use crate::uploader::{ItemState, TransferItem};
use serde::{Deserialize, Serialize};

/// 批次进度统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProgress {
    /// 条目总数
    pub total: usize,
    pub pending: usize,
    pub in_flight: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// 整体进度百分比：所有条目进度的算术平均（四舍五入），等待中的条目按 0 计入
    pub overall_percent: u8,
}

impl BatchProgress {
    /// 从条目集合计算统计
    pub fn from_items<'a, P, I>(items: I) -> Self
    where
        P: 'a,
        I: IntoIterator<Item = &'a TransferItem<P>>,
    {
        let mut progress = BatchProgress::default();
        let mut percent_sum: u64 = 0;

        for item in items {
            progress.total += 1;
            percent_sum += u64::from(item.progress_percent);
            match item.state {
                ItemState::Pending => progress.pending += 1,
                ItemState::InFlight => progress.in_flight += 1,
                ItemState::Succeeded => progress.succeeded += 1,
                ItemState::Failed => progress.failed += 1,
                ItemState::Cancelled => progress.cancelled += 1,
            }
        }

        progress.overall_percent = rounded_mean(percent_sum, progress.total as u64);
        progress
    }

    /// 已进入终态的条目数
    pub fn terminal(&self) -> usize {
        self.succeeded + self.failed + self.cancelled
    }

    /// 没有等待中或传输中的条目
    pub fn is_idle(&self) -> bool {
        self.pending == 0 && self.in_flight == 0
    }
}

/// 四舍五入的整数平均值（半数向上）
fn rounded_mean(sum: u64, count: u64) -> u8 {
    if count == 0 {
        return 0;
    }
    let mean = (sum * 2 + count) / (count * 2);
    mean.min(100) as u8
}

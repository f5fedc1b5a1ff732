//! 批处理统计信息
//! Batch statistics

use super::controller::FlushTrigger;
use crate::config::MAX_EVENT_TYPES;
use crate::error::CallbackError;
use crate::event::{EventStatus, EventType};
use std::time::Duration;

/// Outcome of dispatching one detached batch.
///
/// 分发一个已摘下批次的结果。
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// 已分发的条目数
    /// Items dispatched
    pub processed: usize,
    /// 回调失败的条目数
    /// Items whose callback failed
    pub failed: usize,
    /// 按类型统计的条目数
    /// Items per type tag
    pub by_type: [u64; MAX_EVENT_TYPES],
    /// 第一个回调错误
    /// First callback error
    pub first_error: Option<CallbackError>,
}

impl DispatchReport {
    /// Accounts a dispatched event.
    /// 统计一个已分发的事件。
    pub fn record(&mut self, event_type: EventType, status: EventStatus) {
        self.processed += 1;
        if let Some(slot) = event_type.index() {
            self.by_type[slot] += 1;
        }
        if status == EventStatus::Failed {
            self.failed += 1;
        }
    }

    /// Accounts `count` untyped items that share one outcome.
    /// 统计 `count` 个共享同一结果的无类型条目。
    pub fn record_untyped(&mut self, count: usize, failed: bool) {
        self.processed += count;
        if failed {
            self.failed += count;
        }
    }

    pub fn fail(&mut self, error: CallbackError) {
        if self.first_error.is_none() {
            self.first_error = Some(error);
        }
    }
}

/// Aggregate counters over completed batches. Only the thread performing a
/// flush mutates them.
///
/// 已完成批次的聚合计数器。只有执行刷新的线程会修改它们。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchStats {
    /// 已完成的批次数
    /// Completed batches
    pub total_batches: u64,
    /// 已处理的事件总数
    /// Total events processed
    pub total_events_processed: u64,
    /// 失败的事件数
    /// Failed events
    pub failed_events: u64,
    /// 观察到的最大批次
    /// Largest batch observed
    pub max_batch_size: usize,
    /// 批次大小的移动平均值
    /// Moving average of the batch size
    pub avg_batch_size: f64,
    /// 按类型统计的事件数
    /// Events per type tag
    pub events_by_type: [u64; MAX_EVENT_TYPES],
    /// 按触发来源统计的刷新次数
    /// Flushes per trigger source
    pub flushes_by_trigger: [u64; FlushTrigger::COUNT],
    /// 最近一次刷新耗时
    /// Duration of the last flush
    pub last_flush_duration: Duration,
    /// 累计刷新耗时
    /// Cumulative flush time
    pub total_processing_time: Duration,
}

impl BatchStats {
    /// Folds a finished batch into the counters.
    /// 将已完成的批次并入计数器。
    pub fn record_batch(&mut self, trigger: FlushTrigger, report: &DispatchReport, elapsed: Duration) {
        let size = report.processed;
        self.avg_batch_size = if self.total_batches == 0 {
            size as f64
        } else {
            (self.avg_batch_size + size as f64) / 2.0
        };
        self.total_batches += 1;
        self.total_events_processed += size as u64;
        self.failed_events += report.failed as u64;
        self.max_batch_size = self.max_batch_size.max(size);
        for (total, count) in self.events_by_type.iter_mut().zip(report.by_type.iter()) {
            *total += count;
        }
        self.flushes_by_trigger[trigger.index()] += 1;
        self.last_flush_duration = elapsed;
        self.total_processing_time = self.total_processing_time.saturating_add(elapsed);
    }

    pub fn flushes(&self, trigger: FlushTrigger) -> u64 {
        self.flushes_by_trigger[trigger.index()]
    }

    pub fn events_of(&self, event_type: EventType) -> u64 {
        event_type
            .index()
            .map_or(0, |slot| self.events_by_type[slot])
    }

    pub fn is_empty(&self) -> bool {
        self == &BatchStats::default()
    }
}

impl std::fmt::Display for BatchStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "BatchStats {{ batches: {}, processed: {}, failed: {}, max: {}, avg: {:.1}, last: {:?}, total: {:?} }}",
            self.total_batches,
            self.total_events_processed,
            self.failed_events,
            self.max_batch_size,
            self.avg_batch_size,
            self.last_flush_duration,
            self.total_processing_time
        )
    }
}

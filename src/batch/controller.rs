//! 刷新控制器
//! Flush controller
//!
//! 拥有触发策略：容量已满、达到阈值、定时器到期。它只做决策，不持有任何可变状态，
//! 由批处理系统在持锁时调用。
//!
//! Owns the trigger policy: capacity reached, threshold reached, timer
//! expiry. It only makes decisions and holds no mutable state; the batch
//! system consults it while holding its lock.

use crate::config::{BatchConfig, BatchFlags};
use std::fmt;
use std::time::Duration;

/// 刷新的触发来源
/// Source that triggered a flush
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlushTrigger {
    /// 入队时达到容量
    /// Capacity reached during enqueue
    Capacity,
    /// 入队时达到阈值
    /// Threshold reached during enqueue
    Threshold,
    /// 刷新定时器到期
    /// Flush timer expired
    Timer,
    /// 显式调用 flush
    /// Explicit flush call
    Manual,
    /// 通过循环唤醒信号请求
    /// Requested through the loop wake signal
    Signal,
    /// 禁用或清理时的强制刷新
    /// Forced flush on disable or cleanup
    Shutdown,
}

impl FlushTrigger {
    pub(crate) const COUNT: usize = 6;

    pub(crate) fn index(self) -> usize {
        match self {
            FlushTrigger::Capacity => 0,
            FlushTrigger::Threshold => 1,
            FlushTrigger::Timer => 2,
            FlushTrigger::Manual => 3,
            FlushTrigger::Signal => 4,
            FlushTrigger::Shutdown => 5,
        }
    }
}

impl fmt::Display for FlushTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FlushTrigger::Capacity => "capacity",
            FlushTrigger::Threshold => "threshold",
            FlushTrigger::Timer => "timer",
            FlushTrigger::Manual => "manual",
            FlushTrigger::Signal => "signal",
            FlushTrigger::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// What to do after an item has been stored.
/// 条目存入后应采取的动作。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushDecision {
    None,
    /// Flush synchronously before returning to the producer.
    /// 在返回生产者之前同步刷新。
    Immediate(FlushTrigger),
    /// Flush on the loop's next iteration.
    /// 在事件循环的下一次迭代中刷新。
    Deferred(FlushTrigger),
}

/// What to do with an incoming item, given the current pending count.
/// 根据当前待处理数量，对新到条目应采取的动作。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// There is room, store it.
    /// 有空间，直接存入。
    Store,
    /// Full, but auto-processing is on: flush first, then store.
    /// 已满但启用了自动处理：先刷新，再存入。
    FlushFirst,
    /// Full and auto-processing is off: reject with batch-full.
    /// 已满且未启用自动处理：以批次已满拒绝。
    Reject,
}

/// Trigger policy derived from an immutable [`BatchConfig`].
/// 由不可变的 [`BatchConfig`] 推导出的触发策略。
#[derive(Debug, Clone)]
pub struct FlushController {
    capacity: usize,
    threshold: usize,
    timeout: Duration,
    flags: BatchFlags,
}

impl FlushController {
    pub fn new(config: &BatchConfig) -> Self {
        Self {
            capacity: config.batch_size,
            threshold: config.effective_threshold(),
            timeout: config.timeout,
            flags: config.flags,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_full(&self, pending: usize) -> bool {
        pending >= self.capacity
    }

    /// 入队前的容量检查
    /// Capacity check before an item is stored
    pub fn admit(&self, pending: usize) -> Admission {
        if !self.is_full(pending) {
            Admission::Store
        } else if self.flags.contains(BatchFlags::AUTO_PROCESS) {
            Admission::FlushFirst
        } else {
            Admission::Reject
        }
    }

    /// Flush timer delay to arm when `pending` just became 1, if time-based
    /// flushing is enabled.
    ///
    /// 当 `pending` 刚变为1且启用了基于时间的刷新时，需要设定的定时器延迟。
    pub fn first_item_timer(&self, pending: usize) -> Option<Duration> {
        (pending == 1 && !self.timeout.is_zero()).then_some(self.timeout)
    }

    /// Re-evaluates the triggers after an item has been stored. Capacity
    /// wins over threshold and always flushes immediately; threshold only
    /// defers, so crossing the soft limit adds no latency to the enqueue call.
    ///
    /// 条目存入后重新评估触发条件。容量优先于阈值并总是立即刷新；
    /// 阈值只做延迟刷新，因此越过软限制不会给入队调用增加延迟。
    pub fn after_insert(&self, pending: usize) -> FlushDecision {
        if self.is_full(pending) {
            FlushDecision::Immediate(FlushTrigger::Capacity)
        } else if self.flags.contains(BatchFlags::THRESHOLD_PROCESS) && pending >= self.threshold {
            FlushDecision::Deferred(FlushTrigger::Threshold)
        } else {
            FlushDecision::None
        }
    }
}

/// Shortens the host loop's poll wait so pending items are not starved.
///
/// `None` is an infinite wait. The requested timeout is returned unchanged
/// when batching is disabled, nothing is pending, or time-based flushing is
/// off (a zero batch timeout would otherwise turn the poll into a busy loop).
///
/// 缩短宿主循环的轮询等待时间，使待处理条目不会被饿死。`None` 表示无限等待。
/// 当批处理被禁用、没有待处理条目或关闭了基于时间的刷新时，原样返回请求的超时。
pub fn adjust_timeout(
    requested: Option<Duration>,
    batch_timeout: Duration,
    pending: usize,
    enabled: bool,
) -> Option<Duration> {
    if !enabled || pending == 0 || batch_timeout.is_zero() {
        return requested;
    }
    match requested {
        Some(requested) => Some(requested.min(batch_timeout)),
        None => Some(batch_timeout),
    }
}

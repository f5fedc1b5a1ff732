//! 定义了批处理系统的可配置参数。
//! Defines configurable parameters for the batching system.

use crate::error::{Error, Result};
use std::ops::{BitOr, BitOrAssign};
use std::time::Duration;

/// 单个批次允许的最大容量。
/// Largest capacity a single batch may be configured with.
pub const MAX_BATCH_SIZE: usize = 1000;

/// Default batch capacity.
/// 默认批次容量。
pub const DEFAULT_BATCH_SIZE: usize = 64;

/// Default time an item may wait before a forced flush.
/// 条目在强制刷新前可等待的默认时间。
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(10);

/// Number of distinct event type tags tracked by the statistics.
/// 统计信息跟踪的不同事件类型标签数量。
pub const MAX_EVENT_TYPES: usize = 16;

/// Default slot size for a queued event payload, in bytes.
/// 排队事件负载的默认槽位大小（字节）。
pub const DEFAULT_MAX_EVENT_SIZE: usize = 100;

/// Flush policies enabled for a batch system.
///
/// 批处理系统启用的刷新策略。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct BatchFlags(u8);

impl BatchFlags {
    /// 批次满时同步处理。
    /// Process synchronously when the batch is full.
    pub const AUTO_PROCESS: BatchFlags = BatchFlags(0x01);
    /// 达到阈值时提前处理。
    /// Process early once the threshold is reached.
    pub const THRESHOLD_PROCESS: BatchFlags = BatchFlags(0x02);

    pub const fn empty() -> Self {
        BatchFlags(0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: BatchFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: BatchFlags) {
        self.0 |= other.0;
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for BatchFlags {
    type Output = BatchFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        BatchFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for BatchFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.insert(rhs);
    }
}

/// Construction-time configuration of a batch system. Immutable after init.
///
/// 批处理系统的构造期配置。初始化后不可变。
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Maximum number of queued items before a flush is forced.
    /// 强制刷新前允许排队的最大条目数。
    pub batch_size: usize,
    /// Maximum time an item may wait before a forced flush.
    /// Zero disables time-based flushing.
    ///
    /// 条目在强制刷新前可等待的最长时间。为零时禁用基于时间的刷新。
    pub timeout: Duration,
    /// Enabled flush policies.
    /// 启用的刷新策略。
    pub flags: BatchFlags,
    /// Pending count that triggers an early flush when
    /// [`BatchFlags::THRESHOLD_PROCESS`] is set. `None` means half the batch size.
    ///
    /// 设置 [`BatchFlags::THRESHOLD_PROCESS`] 时触发提前刷新的待处理数量。
    /// `None` 表示批次大小的一半。
    pub threshold: Option<usize>,
    /// Largest payload a queued event may carry.
    /// 排队事件可携带的最大负载。
    pub max_event_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            timeout: DEFAULT_TIMEOUT,
            flags: BatchFlags::empty(),
            threshold: None,
            max_event_size: DEFAULT_MAX_EVENT_SIZE,
        }
    }
}

impl BatchConfig {
    /// Small batches flushed quickly.
    ///
    /// 小批次，快速刷新。
    pub fn low_latency() -> Self {
        Self {
            batch_size: 16,
            timeout: Duration::from_millis(1),
            flags: BatchFlags::AUTO_PROCESS,
            ..Self::default()
        }
    }

    /// Large batches, flushed early once three quarters full.
    ///
    /// 大批次，达到四分之三时提前刷新。
    pub fn high_throughput() -> Self {
        Self {
            batch_size: 512,
            timeout: Duration::from_millis(50),
            flags: BatchFlags::AUTO_PROCESS | BatchFlags::THRESHOLD_PROCESS,
            threshold: Some(384),
            ..Self::default()
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_flags(mut self, flags: BatchFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = Some(threshold);
        self
    }

    pub fn with_max_event_size(mut self, max_event_size: usize) -> Self {
        self.max_event_size = max_event_size;
        self
    }

    /// The pending count at which the threshold policy fires.
    ///
    /// 阈值策略触发时的待处理数量。
    pub fn effective_threshold(&self) -> usize {
        self.threshold.unwrap_or((self.batch_size / 2).max(1))
    }

    /// Checks every field against its allowed range.
    ///
    /// 检查每个字段是否在允许范围内。
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(Error::InvalidArgument("batch_size must be in 1..=MAX_BATCH_SIZE"));
        }
        if let Some(threshold) = self.threshold {
            if threshold == 0 || threshold > self.batch_size {
                return Err(Error::InvalidArgument("threshold must be in 1..=batch_size"));
            }
        }
        if self.max_event_size == 0 {
            return Err(Error::InvalidArgument("max_event_size must be non-zero"));
        }
        Ok(())
    }
}

//! 批处理存储抽象
//! Batch storage abstraction
//!
//! 批处理系统只通过 `BatchStorage` 访问其存储。目前有两种存储纪律：
//! 用于高层事件的侵入式事件链，以及用于原始完成记录的预分配数组。
//! 同一个批处理系统实例只使用其中一种。
//!
//! The batch system only touches its storage through `BatchStorage`. There
//! are two storage disciplines: the intrusive event chain for higher-level
//! events, and the preallocated array for raw completion records. A single
//! batch system instance uses exactly one of them.

use super::chain::{EventChain, OrderedBatch};
use super::sorter::sort_by_priority;
use super::stats::DispatchReport;
use crate::completion::{CompletionEntry, CompletionStore};
use crate::config::BatchConfig;
use crate::error::{CallbackError, Error, Result};
use crate::event::QueuedEvent;
use std::fmt;
use tokio::time::Instant;

/// Storage discipline plugged into a [`BatchSystem`](super::BatchSystem).
///
/// 插入 [`BatchSystem`](super::BatchSystem) 的存储纪律。
pub trait BatchStorage: Send + Sized + 'static {
    /// 生产者提交的条目
    /// Item submitted by producers
    type Item: Send + fmt::Debug + 'static;
    /// 已摘下、按分发顺序排列的批次
    /// Detached batch, laid out in dispatch order
    type Detached: Send;
    /// 批次级处理器
    /// Batch-level handler
    type Handler: ?Sized + Send + Sync + 'static;

    /// Whether a handler must be supplied at init.
    /// 初始化时是否必须提供处理器。
    const REQUIRES_HANDLER: bool = false;

    /// Preallocates storage for `config.batch_size` items.
    /// 为 `config.batch_size` 个条目预分配存储。
    fn allocate(config: &BatchConfig) -> Result<Self>;

    fn len(&self) -> usize;

    /// Rejects items that do not fit a storage slot.
    /// 拒绝放不进存储槽的条目。
    fn check(item: &Self::Item, config: &BatchConfig) -> Result<()>;

    /// Stores an item the controller has admitted. A storage without a free
    /// slot hands the item back untouched.
    ///
    /// 存入控制器已准许的条目。没有空闲槽位时原样交还条目。
    fn store(&mut self, item: Self::Item, now: Instant) -> std::result::Result<(), Self::Item>;

    /// Detaches everything pending, ordered for dispatch, leaving the
    /// storage empty.
    ///
    /// 摘下所有待处理条目并按分发顺序排列，存储随之清空。
    fn detach(&mut self) -> Self::Detached;

    /// Hands a detached batch to its callbacks and releases every item.
    /// 把已摘下的批次交给回调并释放每个条目。
    fn dispatch(detached: &mut Self::Detached, handler: Option<&Self::Handler>) -> DispatchReport;

    /// Takes a dispatched batch back for reuse.
    /// 收回已分发的批次以便复用。
    fn recycle(&mut self, detached: Self::Detached) {
        drop(detached);
    }

    /// Frees preallocated memory on cleanup.
    /// 清理时释放预分配的内存。
    fn release(&mut self) {}
}

/// Hooks invoked around the dispatch of an event batch.
///
/// 事件批次分发前后调用的钩子。
pub trait EventBatchHandler: Send + Sync {
    /// Runs once per flush with the whole ordered batch, before any per-event
    /// callback.
    ///
    /// 每次刷新在任何单事件回调之前，以整个有序批次调用一次。
    fn on_batch(&self, _batch: &OrderedBatch) {}

    /// Runs for every per-event callback that failed.
    /// 每个失败的单事件回调都会触发一次。
    fn on_error(&self, _event: &QueuedEvent, _error: &CallbackError) {}
}

/// Receives raw completions in arrival order.
///
/// 按到达顺序接收原始完成记录。
pub trait CompletionHandler: Send + Sync {
    fn on_completions(&self, entries: &[CompletionEntry]) -> std::result::Result<(), CallbackError>;
}

impl<F> CompletionHandler for F
where
    F: Fn(&[CompletionEntry]) -> std::result::Result<(), CallbackError> + Send + Sync,
{
    fn on_completions(&self, entries: &[CompletionEntry]) -> std::result::Result<(), CallbackError> {
        self(entries)
    }
}

impl BatchStorage for EventChain {
    type Item = QueuedEvent;
    type Detached = OrderedBatch;
    type Handler = dyn EventBatchHandler;

    fn allocate(_config: &BatchConfig) -> Result<Self> {
        Ok(EventChain::new())
    }

    fn len(&self) -> usize {
        EventChain::len(self)
    }

    fn check(event: &QueuedEvent, config: &BatchConfig) -> Result<()> {
        let size = event.payload().len();
        if size == 0 {
            return Err(Error::InvalidArgument("event payload is empty"));
        }
        if size > config.max_event_size {
            return Err(Error::ItemTooLarge {
                size,
                max: config.max_event_size,
            });
        }
        Ok(())
    }

    fn store(&mut self, mut event: QueuedEvent, now: Instant) -> std::result::Result<(), QueuedEvent> {
        event.stamp_arrival(now);
        self.push(Box::new(event));
        Ok(())
    }

    fn detach(&mut self) -> OrderedBatch {
        sort_by_priority(std::mem::take(self))
    }

    fn dispatch(batch: &mut OrderedBatch, handler: Option<&Self::Handler>) -> DispatchReport {
        let mut report = DispatchReport::default();
        if let Some(handler) = handler {
            handler.on_batch(batch);
        }
        while let Some(mut event) = batch.pop_front() {
            let outcome = event.complete();
            report.record(event.event_type(), event.status());
            if let Err(error) = outcome {
                if let Some(handler) = handler {
                    handler.on_error(&event, &error);
                }
                report.fail(error);
            }
            // 事件节点与负载在此释放
        }
        report
    }
}

impl BatchStorage for CompletionStore {
    type Item = CompletionEntry;
    type Detached = Vec<CompletionEntry>;
    type Handler = dyn CompletionHandler;

    const REQUIRES_HANDLER: bool = true;

    fn allocate(config: &BatchConfig) -> Result<Self> {
        CompletionStore::with_capacity(config.batch_size)
    }

    fn len(&self) -> usize {
        CompletionStore::len(self)
    }

    fn check(_entry: &CompletionEntry, _config: &BatchConfig) -> Result<()> {
        Ok(())
    }

    fn store(
        &mut self,
        entry: CompletionEntry,
        _now: Instant,
    ) -> std::result::Result<(), CompletionEntry> {
        self.push(entry).map_err(|_| entry)
    }

    fn detach(&mut self) -> Vec<CompletionEntry> {
        CompletionStore::detach(self)
    }

    fn dispatch(
        entries: &mut Vec<CompletionEntry>,
        handler: Option<&Self::Handler>,
    ) -> DispatchReport {
        let mut report = DispatchReport::default();
        let outcome = match handler {
            Some(handler) => handler.on_completions(entries),
            None => Ok(()),
        };
        report.record_untyped(entries.len(), outcome.is_err());
        if let Err(error) = outcome {
            report.fail(error);
        }
        entries.clear();
        report
    }

    fn recycle(&mut self, entries: Vec<CompletionEntry>) {
        CompletionStore::recycle(self, entries);
    }

    fn release(&mut self) {
        *self = CompletionStore::empty();
    }
}

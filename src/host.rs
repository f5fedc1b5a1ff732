//! 宿主事件循环边界
//! Host event loop boundary
//!
//! `LoopHandle` 是批处理层看到的宿主循环：一个存放批处理系统的扩展槽、
//! 一个供超时调整使用的待处理计数器、一个唤醒轮询器的信号，以及在阻塞前调用的轮询等待钩子。
//!
//! `LoopHandle` is the host loop as the batching layer sees it: an extension
//! slot holding the batch system, a pending-item counter consulted by the
//! timeout adjuster, a signal that wakes the poller, and the poll-wait hook
//! called before blocking.

pub mod timer;

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::trace;

/// What the loop's batch system exposes back to the loop.
/// 批处理系统向宿主循环暴露的接口。
pub(crate) trait BatchHook: Send + Sync {
    fn adjust_timeout(&self, requested: Option<Duration>) -> Option<Duration>;
    fn process_pending(&self) -> Result<usize>;
}

struct BatchSlot {
    id: u64,
    hook: Weak<dyn BatchHook>,
}

/// 轮询等待结束的原因
/// Why a poll wait returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollWake {
    /// 收到唤醒信号
    /// A wake signal arrived
    Signaled,
    /// 等待超时
    /// The (adjusted) timeout elapsed
    TimedOut,
}

/// Handle to a host event loop instance.
///
/// A loop owns at most one batch system at a time. The slot only keeps a
/// weak reference; the [`BatchSystem`](crate::BatchSystem) returned by
/// `init` is the owning capability.
///
/// 宿主事件循环实例的句柄。一个循环同时最多拥有一个批处理系统。
/// 扩展槽只保存弱引用；`init` 返回的 [`BatchSystem`](crate::BatchSystem) 才是拥有者。
pub struct LoopHandle {
    runtime: Handle,
    slot: Mutex<Option<BatchSlot>>,
    pending: AtomicUsize,
    wakeup: Notify,
}

impl LoopHandle {
    /// 在给定运行时上创建循环句柄
    /// Create a loop handle on the given runtime
    pub fn new(runtime: Handle) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            slot: Mutex::new(None),
            pending: AtomicUsize::new(0),
            wakeup: Notify::new(),
        })
    }

    /// Creates a loop handle on the runtime the caller is running in.
    /// 在调用者所在的运行时上创建循环句柄。
    pub fn current() -> Result<Arc<Self>> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|_| Error::NoRuntime)
    }

    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    /// Items queued in the loop's batch system and not yet dispatched.
    /// 循环的批处理系统中已排队但尚未分发的条目数。
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn has_batch_system(&self) -> bool {
        self.hook().is_some()
    }

    /// Shortens `requested` so pending batched items are not starved. `None`
    /// is an infinite wait.
    ///
    /// 缩短 `requested`，使待处理的批处理条目不会被饿死。`None` 表示无限等待。
    pub fn adjust_timeout(&self, requested: Option<Duration>) -> Option<Duration> {
        match self.hook() {
            Some(hook) => hook.adjust_timeout(requested),
            None => requested,
        }
    }

    /// Wakes the poller. A signal sent while nobody waits is kept for the
    /// next [`LoopHandle::poll_wait`].
    ///
    /// 唤醒轮询器。无人等待时发出的信号会保留给下一次 [`LoopHandle::poll_wait`]。
    pub fn signal(&self) {
        trace!("Loop wake signaled");
        self.wakeup.notify_one();
    }

    /// Blocks until the adjusted timeout elapses or a wake signal arrives.
    /// 阻塞直到调整后的超时到期或收到唤醒信号。
    pub async fn poll_wait(&self, requested: Option<Duration>) -> PollWake {
        let timeout = self.adjust_timeout(requested);
        let notified = self.wakeup.notified();
        match timeout {
            Some(timeout) => tokio::select! {
                _ = notified => PollWake::Signaled,
                _ = tokio::time::sleep(timeout) => PollWake::TimedOut,
            },
            None => {
                notified.await;
                PollWake::Signaled
            }
        }
    }

    /// Runs the batch system's pending flush, if any.
    /// 执行批处理系统中待处理的刷新（如果有）。
    pub fn process_pending(&self) -> Result<usize> {
        match self.hook() {
            Some(hook) => hook.process_pending(),
            None => Ok(0),
        }
    }

    /// One loop iteration as far as batching is concerned: wait, then flush
    /// whatever became ready.
    ///
    /// 就批处理而言的一次循环迭代：等待，然后刷新已就绪的内容。
    pub async fn run_once(&self, requested: Option<Duration>) -> Result<usize> {
        self.poll_wait(requested).await;
        self.process_pending()
    }

    pub(crate) fn attach(&self, id: u64, hook: Weak<dyn BatchHook>) -> Result<()> {
        let mut slot = self.lock_slot();
        if slot.as_ref().is_some_and(|s| s.hook.strong_count() > 0) {
            return Err(Error::AlreadyInitialized);
        }
        *slot = Some(BatchSlot { id, hook });
        Ok(())
    }

    pub(crate) fn detach(&self, id: u64) {
        let mut slot = self.lock_slot();
        if slot.as_ref().is_some_and(|s| s.id == id) {
            *slot = None;
        }
    }

    pub(crate) fn add_pending(&self, count: usize) {
        self.pending.fetch_add(count, Ordering::AcqRel);
    }

    pub(crate) fn sub_pending(&self, count: usize) {
        let _ = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |pending| {
                Some(pending.saturating_sub(count))
            });
    }

    fn hook(&self) -> Option<Arc<dyn BatchHook>> {
        self.lock_slot().as_ref().and_then(|s| s.hook.upgrade())
    }

    fn lock_slot(&self) -> MutexGuard<'_, Option<BatchSlot>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle")
            .field("pending", &self.pending())
            .field("has_batch_system", &self.has_batch_system())
            .finish()
    }
}

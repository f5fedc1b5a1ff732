//! 刷新定时器
//! Flush timer
//!
//! 批处理系统借用宿主循环的定时器实现基于时间的刷新。定时器句柄不会使循环保持存活：
//! 回调只持有批处理系统的弱引用。
//!
//! The batch system borrows the host loop's timer for time-based flushing.
//! The handle does not keep the loop alive: the callback only holds a weak
//! reference to the batch system.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::trace;

/// One-shot, re-armable timer primitive provided by the host loop.
///
/// 宿主循环提供的一次性、可重新设定的定时器原语。
pub trait FlushTimer: Send + Sync {
    /// (Re)arms the timer to fire once after `after`, replacing any earlier
    /// deadline.
    ///
    /// （重新）设定定时器在 `after` 之后触发一次，替换之前的截止时间。
    fn arm(&self, after: Duration);

    /// 停止定时器；未设定时为空操作
    /// Stops the timer; a no-op when it is not armed
    fn stop(&self);

    /// 当前截止时间
    /// Current deadline, if armed
    fn deadline(&self) -> Option<Instant>;
}

type FireFn = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct TimerSlot {
    generation: u64,
    deadline: Option<Instant>,
    task: Option<JoinHandle<()>>,
}

/// [`FlushTimer`] backed by a tokio sleep task.
///
/// The runtime handle lets producer threads outside the runtime arm it.
/// Every arm bumps a generation counter, so a sleep that lost a race with
/// `stop` or a later `arm` never fires.
///
/// 基于 tokio sleep 任务的 [`FlushTimer`]。持有的运行时句柄让运行时之外的生产者线程也能设定它。
/// 每次设定都会递增代数，因此与 `stop` 或更晚的 `arm` 竞争失败的 sleep 永远不会触发。
pub struct TokioFlushTimer {
    runtime: Handle,
    on_fire: FireFn,
    slot: Arc<Mutex<TimerSlot>>,
}

impl TokioFlushTimer {
    pub fn new<F>(runtime: Handle, on_fire: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            runtime,
            on_fire: Arc::new(on_fire),
            slot: Arc::new(Mutex::new(TimerSlot::default())),
        }
    }

    fn lock_slot(slot: &Mutex<TimerSlot>) -> std::sync::MutexGuard<'_, TimerSlot> {
        slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FlushTimer for TokioFlushTimer {
    fn arm(&self, after: Duration) {
        let mut slot = Self::lock_slot(&self.slot);
        if let Some(previous) = slot.task.take() {
            previous.abort();
        }
        slot.generation = slot.generation.wrapping_add(1);
        let generation = slot.generation;
        // 在运行时上下文中读取时钟，使外部线程与暂停的测试时钟一致
        let deadline = {
            let _context = self.runtime.enter();
            Instant::now() + after
        };
        slot.deadline = Some(deadline);

        let shared = Arc::clone(&self.slot);
        let on_fire = Arc::clone(&self.on_fire);
        slot.task = Some(self.runtime.spawn(async move {
            sleep_until(deadline).await;
            {
                let mut slot = Self::lock_slot(&shared);
                if slot.generation != generation {
                    return;
                }
                slot.deadline = None;
                slot.task = None;
            }
            // 回调在锁外执行，可以重新设定定时器
            on_fire();
        }));
        trace!(after_us = after.as_micros() as u64, "Flush timer armed");
    }

    fn stop(&self) {
        let mut slot = Self::lock_slot(&self.slot);
        if slot.deadline.take().is_some() {
            slot.generation = slot.generation.wrapping_add(1);
            if let Some(task) = slot.task.take() {
                task.abort();
            }
            trace!("Flush timer stopped");
        }
    }

    fn deadline(&self) -> Option<Instant> {
        Self::lock_slot(&self.slot).deadline
    }
}

impl Drop for TokioFlushTimer {
    fn drop(&mut self) {
        if let Some(task) = Self::lock_slot(&self.slot).task.take() {
            task.abort();
        }
    }
}

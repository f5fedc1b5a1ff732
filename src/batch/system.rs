//! 批处理系统
//! Batch system
//!
//! 每个宿主循环一个的批处理聚合体：生命周期、入队路径、刷新算法以及防止重入的刷新守卫。
//!
//! The per-loop batching aggregate: lifecycle, enqueue path, flush algorithm
//! and the guard that keeps flushes from interleaving.
//!
//! 锁纪律：`state` 互斥锁覆盖整个入队决策以及刷新的摘下与统计阶段；
//! 回调在锁外执行，因此回调可以再次入队而不会死锁。`flushing` 是一个原子的
//! 空闲/刷新中状态机，任何时刻只允许一次刷新。发现刷新正在进行的触发会被丢弃，
//! 并记录一次重跑请求，由正在运行的刷新在结束时处理。
//!
//! Locking: the `state` mutex covers the whole enqueue decision and the
//! detach and accounting phases of a flush. Callbacks run outside of it, so a
//! callback may enqueue again without deadlocking. `flushing` is an atomic
//! Idle/Flushing state machine that admits one flush at a time. A trigger
//! that finds a flush running is dropped and leaves a rerun request, which
//! the running flush handles when it finishes.

use super::chain::EventChain;
use super::controller::{self, Admission, FlushController, FlushDecision, FlushTrigger};
use super::stats::BatchStats;
use super::storage::BatchStorage;
use crate::completion::{CompletionEntry, CompletionStore, ContinuationHandle};
use crate::config::BatchConfig;
use crate::error::{Error, Rejected, Result};
use crate::event::QueuedEvent;
use crate::host::timer::{FlushTimer, TokioFlushTimer};
use crate::host::{BatchHook, LoopHandle};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

static NEXT_SYSTEM_ID: AtomicU64 = AtomicU64::new(1);

/// 批处理高层事件的批处理系统
/// Batch system over higher-level queued events
pub type EventBatchSystem = BatchSystem<EventChain>;

/// 批处理原始完成记录的批处理系统
/// Batch system over raw completion records
pub type CompletionBatchSystem = BatchSystem<CompletionStore>;

struct BatchState<S> {
    storage: S,
    /// 自上次刷新以来第一个条目的到达时间
    /// Arrival of the first item since the last flush
    batch_started: Option<Instant>,
    stats: BatchStats,
}

/// The batching engine attached to one host loop.
///
/// Returned by [`BatchSystem::init`] as the explicit capability for every
/// later call. Batching starts disabled; call [`BatchSystem::enable`] before
/// submitting items.
///
/// 附加到一个宿主循环的批处理引擎。由 [`BatchSystem::init`] 返回，作为之后所有调用的显式能力对象。
/// 批处理初始为禁用状态；提交条目前需先调用 [`BatchSystem::enable`]。
pub struct BatchSystem<S: BatchStorage> {
    id: u64,
    config: BatchConfig,
    controller: FlushController,
    host: Arc<LoopHandle>,
    handler: Option<Arc<S::Handler>>,
    state: Mutex<BatchState<S>>,
    timer: Box<dyn FlushTimer>,
    enabled: AtomicBool,
    attached: AtomicBool,
    flushing: AtomicBool,
    flusher: Mutex<Option<ThreadId>>,
    rerun: AtomicBool,
    signaled: AtomicBool,
    threshold_due: AtomicBool,
    /// 在回调中调用的清理，由外层刷新完成
    /// Cleanup requested from a callback, finished by the outer flush
    cleanup_deferred: AtomicBool,
}

impl<S: BatchStorage> BatchSystem<S> {
    /// Creates the loop's batch system.
    ///
    /// Fails with [`Error::InvalidArgument`] on a bad configuration or a
    /// missing required handler, [`Error::AlreadyInitialized`] when the loop
    /// already owns a live batch system, and [`Error::OutOfMemory`] when the
    /// storage cannot be preallocated. A failed init leaves the loop
    /// untouched.
    ///
    /// 创建循环的批处理系统。初始化失败时循环保持不变。
    pub fn init(
        host: &Arc<LoopHandle>,
        config: BatchConfig,
        handler: Option<Arc<S::Handler>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        if S::REQUIRES_HANDLER && handler.is_none() {
            return Err(Error::InvalidArgument("a batch handler is required"));
        }
        if host.has_batch_system() {
            return Err(Error::AlreadyInitialized);
        }
        let storage = S::allocate(&config)?;
        let runtime = host.runtime().clone();
        let system = Arc::new_cyclic(|weak: &Weak<Self>| {
            Self::new(host.clone(), config, handler, storage, runtime, weak.clone())
        });

        let hook: Weak<dyn BatchHook> = Arc::downgrade(&system) as Weak<dyn BatchHook>;
        host.attach(system.id, hook)?;
        system.attached.store(true, Ordering::Release);

        info!(
            batch_size = system.config.batch_size,
            timeout_ms = system.config.timeout.as_millis() as u64,
            flags = system.config.flags.bits(),
            "Batch system initialized"
        );
        Ok(system)
    }

    /// 使用默认配置初始化
    /// Initialize with the default configuration
    pub fn init_default(host: &Arc<LoopHandle>, handler: Option<Arc<S::Handler>>) -> Result<Arc<Self>> {
        Self::init(host, BatchConfig::default(), handler)
    }

    fn new(
        host: Arc<LoopHandle>,
        config: BatchConfig,
        handler: Option<Arc<S::Handler>>,
        storage: S,
        runtime: Handle,
        weak: Weak<Self>,
    ) -> Self {
        let timer = TokioFlushTimer::new(runtime, move || {
            if let Some(system) = weak.upgrade() {
                system.on_timer();
            }
        });
        Self {
            id: NEXT_SYSTEM_ID.fetch_add(1, Ordering::Relaxed),
            controller: FlushController::new(&config),
            config,
            host,
            handler,
            state: Mutex::new(BatchState {
                storage,
                batch_started: None,
                stats: BatchStats::default(),
            }),
            timer: Box::new(timer),
            enabled: AtomicBool::new(false),
            attached: AtomicBool::new(false),
            flushing: AtomicBool::new(false),
            flusher: Mutex::new(None),
            rerun: AtomicBool::new(false),
            signaled: AtomicBool::new(false),
            threshold_due: AtomicBool::new(false),
            cleanup_deferred: AtomicBool::new(false),
        }
    }

    /// Lets producers enqueue. A no-op once the system has been cleaned up.
    /// 允许生产者入队。清理之后为空操作。
    pub fn enable(&self) {
        let _state = self.lock_state();
        if self.attached.load(Ordering::Acquire) && !self.enabled.swap(true, Ordering::AcqRel) {
            debug!("Batching enabled");
        }
    }

    /// Stops producers from enqueueing, flushes whatever is pending and
    /// stops the timer. A no-op once the system has been cleaned up.
    ///
    /// 禁止生产者入队，刷新所有待处理条目并停止定时器。清理之后为空操作。
    pub fn disable(&self) -> Result<usize> {
        {
            let _state = self.lock_state();
            if !self.attached.load(Ordering::Acquire) {
                return Ok(0);
            }
            self.enabled.store(false, Ordering::Release);
        }
        let flushed = self.drain(FlushTrigger::Shutdown);
        self.timer.stop();
        debug!("Batching disabled");
        flushed
    }

    /// Flushes pending items, stops the timer, frees the storage and
    /// detaches from the loop. Idempotent.
    ///
    /// Called from a dispatch callback, it only stops admission; the flush
    /// that invoked the callback drains what is left and then frees the
    /// storage.
    ///
    /// 刷新待处理条目，停止定时器，释放存储并从循环分离。可重复调用。
    /// 在分发回调中调用时只停止接收，由调用该回调的刷新排空剩余条目后再释放存储。
    pub fn cleanup(&self) -> Result<usize> {
        {
            let _state = self.lock_state();
            if !self.attached.swap(false, Ordering::AcqRel) {
                return Ok(0);
            }
            self.enabled.store(false, Ordering::Release);
        }
        let flushed = self.drain(FlushTrigger::Shutdown);
        if self.is_flushing_thread() {
            self.cleanup_deferred.store(true, Ordering::Release);
            debug!("Cleanup deferred to the running flush");
            return flushed;
        }
        self.finish_cleanup();
        flushed
    }

    fn finish_cleanup(&self) {
        self.timer.stop();
        self.lock_state().storage.release();
        self.host.detach(self.id);
        info!(stats = %self.stats(), "Batch system cleaned up");
    }

    /// Submits an item. On rejection the item is handed back with the
    /// reason; [`Error::is_fallback`] tells whether to dispatch it
    /// immediately instead.
    ///
    /// Callback failures of a flush run on behalf of this call are reported
    /// through the handler and the log, not through the return value, since
    /// the item itself was accepted.
    ///
    /// 提交条目。被拒绝时连同原因交还条目。
    pub fn add(&self, item: S::Item) -> std::result::Result<(), Rejected<S::Item>> {
        let mut state = self.lock_state();
        if let Err(reason) = self.check_accepting(&item) {
            return Err(Rejected::new(reason, item));
        }

        match self.controller.admit(state.storage.len()) {
            Admission::Store => {}
            Admission::Reject => return Err(Rejected::new(Error::BatchFull, item)),
            Admission::FlushFirst => {
                drop(state);
                self.report(FlushTrigger::Capacity, self.flush_with(FlushTrigger::Capacity));
                state = self.lock_state();
                if let Err(reason) = self.check_accepting(&item) {
                    return Err(Rejected::new(reason, item));
                }
                // 刷新被丢弃（已有刷新在进行）时仍然是满的
                if self.controller.is_full(state.storage.len()) {
                    return Err(Rejected::new(Error::BatchFull, item));
                }
            }
        }

        let now = Instant::now();
        if let Err(item) = state.storage.store(item, now) {
            return Err(Rejected::new(Error::BatchFull, item));
        }
        let pending = state.storage.len();
        self.host.add_pending(1);
        if pending == 1 {
            state.batch_started = Some(now);
        }
        if let Some(delay) = self.controller.first_item_timer(pending) {
            self.timer.arm(delay);
        }
        let decision = self.controller.after_insert(pending);
        drop(state);
        trace!(pending, "Item batched");

        match decision {
            FlushDecision::None => {}
            FlushDecision::Immediate(trigger) => self.report(trigger, self.flush_with(trigger)),
            FlushDecision::Deferred(_) => {
                self.threshold_due.store(true, Ordering::Release);
                self.schedule_next_iteration();
            }
        }
        Ok(())
    }

    /// Flushes now. Returns the number of items dispatched, or `Ok(0)` when
    /// nothing is pending or another flush is already running.
    ///
    /// 立即刷新。返回已分发的条目数；没有待处理条目或已有刷新在进行时返回 `Ok(0)`。
    pub fn flush(&self) -> Result<usize> {
        self.flush_with(FlushTrigger::Manual)
    }

    /// Marks a flush as ready and wakes the host poller, for producers that
    /// want pending items out before the timer fires.
    ///
    /// 标记刷新已就绪并唤醒宿主轮询器，供希望在定时器触发前送出待处理条目的生产者使用。
    pub fn request_flush(&self) {
        self.signaled.store(true, Ordering::Release);
        self.host.signal();
    }

    /// 调整宿主循环的轮询超时
    /// Adjust the host loop's poll timeout
    pub fn adjust_timeout(&self, requested: Option<Duration>) -> Option<Duration> {
        controller::adjust_timeout(
            requested,
            self.controller.timeout(),
            self.host.pending(),
            self.is_enabled(),
        )
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn is_initialized(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    /// 当前已排队的条目数
    /// Items currently queued
    pub fn pending(&self) -> usize {
        self.lock_state().storage.len()
    }

    /// 统计信息快照
    /// Snapshot of the statistics
    pub fn stats(&self) -> BatchStats {
        self.lock_state().stats.clone()
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// How long the oldest pending item has been waiting.
    /// 最早的待处理条目已等待的时长。
    pub fn oldest_pending_age(&self) -> Option<Duration> {
        self.lock_state()
            .batch_started
            .map(|started| started.elapsed())
    }

    fn check_accepting(&self, item: &S::Item) -> Result<()> {
        if !self.attached.load(Ordering::Acquire) {
            return Err(Error::NotInitialized);
        }
        if !self.enabled.load(Ordering::Acquire) {
            return Err(Error::Disabled);
        }
        S::check(item, &self.config)
    }

    /// Runs a flush and then honours any trigger dropped while it ran.
    /// 执行一次刷新，然后处理运行期间被丢弃的触发。
    fn flush_with(&self, trigger: FlushTrigger) -> Result<usize> {
        let Some(mut result) = self.try_flush(trigger) else {
            return Ok(0);
        };
        while self.rerun.swap(false, Ordering::SeqCst) {
            if self.pending() == 0 {
                break;
            }
            if self.is_enabled() {
                self.schedule_next_iteration();
                break;
            }
            // 已被禁用或分离，不能依赖定时器
            match self.try_flush(FlushTrigger::Shutdown) {
                Some(next) => result = merge(result, next),
                None => break,
            }
        }
        self.finish_deferred_cleanup(result)
    }

    /// `None` when another flush holds the guard.
    /// 已有其他刷新持有守卫时返回 `None`。
    fn try_flush(&self, trigger: FlushTrigger) -> Option<Result<usize>> {
        if !self.acquire_flush() {
            trace!(%trigger, "Flush already in progress, trigger dropped");
            return None;
        }
        let mut guard = FlushGuard::enter(self);
        Some(self.run_flush(trigger, &mut guard))
    }

    /// Takes the Idle→Flushing transition. On contention the rerun request
    /// is published before a second attempt, so either this thread flushes
    /// or the flusher holding the guard sees the request when it releases.
    ///
    /// 获取 空闲→刷新中 状态。竞争失败时先发布重跑请求再重试一次：
    /// 要么本线程执行刷新，要么持有守卫的刷新者在释放后看到请求。
    fn acquire_flush(&self) -> bool {
        let acquire = || {
            self.flushing
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        };
        if acquire() {
            return true;
        }
        self.rerun.store(true, Ordering::SeqCst);
        acquire()
    }

    fn run_flush(&self, trigger: FlushTrigger, guard: &mut FlushGuard<'_, S>) -> Result<usize> {
        let started = Instant::now();
        let mut detached = {
            let mut state = self.lock_state();
            let count = state.storage.len();
            if count == 0 {
                return Ok(0);
            }
            state.batch_started = None;
            self.timer.stop();
            self.threshold_due.store(false, Ordering::Release);
            guard.in_flight = count;
            state.storage.detach()
        };

        let report = S::dispatch(&mut detached, self.handler.as_deref());
        let elapsed = started.elapsed();
        {
            let mut state = self.lock_state();
            state.storage.recycle(detached);
            state.stats.record_batch(trigger, &report, elapsed);
        }
        debug!(
            %trigger,
            processed = report.processed,
            failed = report.failed,
            elapsed_us = elapsed.as_micros() as u64,
            "Batch flushed"
        );
        match report.first_error {
            Some(source) => Err(Error::Callback {
                failed: report.failed,
                source,
            }),
            None => Ok(report.processed),
        }
    }

    /// Flushes until nothing is pending. Used on disable and cleanup, where
    /// no item may be left behind.
    ///
    /// 刷新直到没有待处理条目。用于禁用和清理，此时不能遗留任何条目。
    fn drain(&self, trigger: FlushTrigger) -> Result<usize> {
        let mut result = Ok(0);
        loop {
            match self.try_flush(trigger) {
                Some(next) => result = merge(result, next),
                // 在本线程的回调中调用：由外层刷新在结束时处理
                None if self.is_flushing_thread() => return result,
                None => thread::yield_now(),
            }
            if self.pending() == 0 {
                break;
            }
        }
        self.finish_deferred_cleanup(result)
    }

    /// Completes a cleanup that a dispatch callback requested once the
    /// flush running that callback has returned.
    ///
    /// 在运行回调的刷新返回后，完成回调中请求的清理。
    fn finish_deferred_cleanup(&self, result: Result<usize>) -> Result<usize> {
        if !self.cleanup_deferred.swap(false, Ordering::AcqRel) {
            return result;
        }
        let result = merge(result, self.drain(FlushTrigger::Shutdown));
        self.finish_cleanup();
        result
    }

    fn schedule_next_iteration(&self) {
        let now = Instant::now();
        if self.timer.deadline().is_none_or(|deadline| deadline > now) {
            self.timer.arm(Duration::ZERO);
        }
    }

    fn on_timer(&self) {
        let trigger = if self.threshold_due.load(Ordering::Acquire) {
            FlushTrigger::Threshold
        } else {
            FlushTrigger::Timer
        };
        let result = self.flush_with(trigger);
        self.report(trigger, result);
    }

    fn report(&self, trigger: FlushTrigger, result: Result<usize>) {
        if let Err(err) = result {
            warn!(%trigger, error = %err, "Batch callbacks failed");
        }
    }

    fn is_flushing_thread(&self) -> bool {
        *self.lock_flusher() == Some(thread::current().id())
    }

    fn lock_state(&self) -> MutexGuard<'_, BatchState<S>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_flusher(&self) -> MutexGuard<'_, Option<ThreadId>> {
        self.flusher.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BatchSystem<EventChain> {
    /// 提交一个排队事件
    /// Submit a queued event
    pub fn add_event(&self, event: QueuedEvent) -> std::result::Result<(), Rejected<QueuedEvent>> {
        self.add(event)
    }
}

impl BatchSystem<CompletionStore> {
    /// Submits a raw completion record.
    /// 提交一条原始完成记录。
    pub fn add_completion(
        &self,
        bytes: u32,
        key: usize,
        continuation: ContinuationHandle,
    ) -> std::result::Result<(), Rejected<CompletionEntry>> {
        self.add(CompletionEntry::new(bytes, key, continuation))
    }
}

impl<S: BatchStorage> BatchHook for BatchSystem<S> {
    fn adjust_timeout(&self, requested: Option<Duration>) -> Option<Duration> {
        BatchSystem::adjust_timeout(self, requested)
    }

    fn process_pending(&self) -> Result<usize> {
        let signaled = self.signaled.swap(false, Ordering::AcqRel);
        if !self.is_enabled() || self.pending() == 0 {
            return Ok(0);
        }
        let trigger = if signaled {
            FlushTrigger::Signal
        } else {
            FlushTrigger::Manual
        };
        self.flush_with(trigger)
    }
}

impl<S: BatchStorage> Drop for BatchSystem<S> {
    fn drop(&mut self) {
        if !self.attached.swap(false, Ordering::AcqRel) {
            return;
        }
        self.timer.stop();
        self.host.detach(self.id);
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        let pending = state.storage.len();
        if pending > 0 {
            self.host.sub_pending(pending);
            warn!(pending, "Batch system dropped without cleanup, pending items released");
        }
    }
}

impl<S: BatchStorage> std::fmt::Debug for BatchSystem<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchSystem")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("enabled", &self.is_enabled())
            .field("attached", &self.is_initialized())
            .field("flushing", &self.flushing.load(Ordering::Acquire))
            .finish()
    }
}

/// Holds the Idle→Flushing transition for one flush. Dropping it, on return
/// or while unwinding from a panicking callback, gives the detached items'
/// loop count back and returns the system to Idle.
///
/// 持有一次刷新的 空闲→刷新中 状态。无论正常返回还是回调 panic 展开，
/// 析构时都会归还已摘下条目的循环计数并把系统恢复为空闲。
struct FlushGuard<'a, S: BatchStorage> {
    system: &'a BatchSystem<S>,
    in_flight: usize,
}

impl<'a, S: BatchStorage> FlushGuard<'a, S> {
    fn enter(system: &'a BatchSystem<S>) -> Self {
        *system.lock_flusher() = Some(thread::current().id());
        Self {
            system,
            in_flight: 0,
        }
    }
}

impl<S: BatchStorage> Drop for FlushGuard<'_, S> {
    fn drop(&mut self) {
        if self.in_flight > 0 {
            self.system.host.sub_pending(self.in_flight);
        }
        *self.system.lock_flusher() = None;
        self.system.flushing.store(false, Ordering::SeqCst);
    }
}

fn merge(current: Result<usize>, next: Result<usize>) -> Result<usize> {
    match (current, next) {
        (Ok(a), Ok(b)) => Ok(a + b),
        (Err(e), _) | (Ok(_), Err(e)) => Err(e),
    }
}

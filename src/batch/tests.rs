//! 批处理引擎测试
//! Batching engine tests

use super::*;
use crate::completion::{CompletionEntry, ContinuationHandle};
use crate::config::{BatchConfig, BatchFlags, MAX_BATCH_SIZE};
use crate::error::{CallbackError, Error};
use crate::event::{EventStatus, EventType, Priority, QueuedEvent};
use crate::host::LoopHandle;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

/// (priority, tag) in dispatch order
type DispatchLog = Arc<Mutex<Vec<(u8, u8)>>>;

fn logged(log: &DispatchLog, priority: Priority, tag: u8) -> QueuedEvent {
    let log = log.clone();
    QueuedEvent::new(EventType::Read, priority, vec![tag]).with_callback(move |payload| {
        log.lock().unwrap().push((priority.0, payload[0]));
        Ok(())
    })
}

fn plain(tag: u8) -> QueuedEvent {
    QueuedEvent::new(EventType::Write, Priority::NORMAL, vec![tag])
}

fn enabled(config: BatchConfig) -> (Arc<LoopHandle>, Arc<EventBatchSystem>) {
    let host = LoopHandle::current().unwrap();
    let system = EventBatchSystem::init(&host, config, None).unwrap();
    system.enable();
    (host, system)
}

fn untimed(batch_size: usize) -> BatchConfig {
    BatchConfig::default()
        .with_batch_size(batch_size)
        .with_timeout(Duration::ZERO)
}

#[tokio::test]
async fn test_init_starts_disabled() {
    let host = LoopHandle::current().unwrap();
    let system = EventBatchSystem::init_default(&host, None).unwrap();
    assert!(system.is_initialized());
    assert!(!system.is_enabled());
    assert_eq!(system.pending(), 0);
    assert!(host.has_batch_system());

    let rejected = system.add(plain(1)).unwrap_err();
    assert!(matches!(rejected.reason, Error::Disabled));
    assert_eq!(rejected.into_item().payload()[0], 1);
}

#[tokio::test]
async fn test_init_validates_config() {
    let host = LoopHandle::current().unwrap();
    for batch_size in [0, MAX_BATCH_SIZE + 1] {
        let config = BatchConfig::default().with_batch_size(batch_size);
        assert!(matches!(
            EventBatchSystem::init(&host, config, None),
            Err(Error::InvalidArgument(_))
        ));
    }
    // 失败的初始化不会占用扩展槽
    assert!(!host.has_batch_system());
    EventBatchSystem::init(&host, BatchConfig::default().with_batch_size(MAX_BATCH_SIZE), None)
        .unwrap();
}

#[tokio::test]
async fn test_double_init_and_reinit_after_cleanup() {
    let host = LoopHandle::current().unwrap();
    let first = EventBatchSystem::init_default(&host, None).unwrap();
    assert!(matches!(
        EventBatchSystem::init_default(&host, None),
        Err(Error::AlreadyInitialized)
    ));
    // 同一个循环上也不能再挂一个完成批处理系统
    let handler: Arc<dyn CompletionHandler> =
        Arc::new(|_: &[CompletionEntry]| Ok::<(), CallbackError>(()));
    assert!(matches!(
        CompletionBatchSystem::init_default(&host, Some(handler)),
        Err(Error::AlreadyInitialized)
    ));

    first.cleanup().unwrap();
    assert!(!host.has_batch_system());
    let second = EventBatchSystem::init_default(&host, None).unwrap();
    assert!(second.is_initialized());
}

#[tokio::test]
async fn test_disable_and_cleanup_are_idempotent() {
    let (host, system) = enabled(untimed(8));
    system.add(plain(1)).unwrap();

    assert_eq!(system.disable().unwrap(), 1);
    assert_eq!(system.disable().unwrap(), 0);
    assert!(!system.is_enabled());

    assert_eq!(system.cleanup().unwrap(), 0);
    assert_eq!(system.cleanup().unwrap(), 0);
    assert_eq!(system.disable().unwrap(), 0);
    assert!(!system.is_initialized());
    assert!(!host.has_batch_system());

    // 清理后不能重新启用
    system.enable();
    assert!(!system.is_enabled());
    let rejected = system.add(plain(2)).unwrap_err();
    assert!(matches!(rejected.reason, Error::NotInitialized));
}

#[tokio::test]
async fn test_cleanup_flushes_pending() {
    let log = DispatchLog::default();
    let (host, system) = enabled(untimed(8));
    for tag in 0..3 {
        system.add(logged(&log, Priority::NORMAL, tag)).unwrap();
    }
    assert_eq!(host.pending(), 3);

    assert_eq!(system.cleanup().unwrap(), 3);
    assert_eq!(log.lock().unwrap().len(), 3);
    assert_eq!(host.pending(), 0);
    assert_eq!(system.stats().flushes(FlushTrigger::Shutdown), 1);
}

#[tokio::test]
async fn test_priority_order_within_flush() {
    let log = DispatchLog::default();
    let (_host, system) = enabled(untimed(10));
    for (tag, priority) in [3u8, 1, 2, 1].into_iter().enumerate() {
        system.add(logged(&log, Priority(priority), tag as u8)).unwrap();
    }

    assert_eq!(system.flush().unwrap(), 4);
    assert_eq!(*log.lock().unwrap(), vec![(1, 1), (1, 3), (2, 2), (3, 0)]);
}

#[tokio::test(start_paused = true)]
async fn test_capacity_flush_is_synchronous() {
    let log = DispatchLog::default();
    let config = BatchConfig::default()
        .with_batch_size(4)
        .with_timeout(Duration::from_millis(50))
        .with_flags(BatchFlags::AUTO_PROCESS);
    let (host, system) = enabled(config);

    let arrivals = [Priority::LOW, Priority::HIGH, Priority::NORMAL, Priority::HIGH];
    for (tag, priority) in arrivals.into_iter().enumerate() {
        system.add(logged(&log, priority, tag as u8)).unwrap();
    }

    // 第4次入队返回前已同步刷新
    assert_eq!(
        *log.lock().unwrap(),
        vec![(1, 1), (1, 3), (2, 2), (3, 0)]
    );
    assert_eq!(system.pending(), 0);
    assert_eq!(host.pending(), 0);
    let stats = system.stats();
    assert_eq!(stats.total_batches, 1);
    assert_eq!(stats.flushes(FlushTrigger::Capacity), 1);
}

#[tokio::test]
async fn test_exactly_one_flush_per_capacity() {
    for batch_size in [2, 3, 7, 64] {
        let config = untimed(batch_size).with_flags(BatchFlags::AUTO_PROCESS);
        let (_host, system) = enabled(config);

        for tag in 0..batch_size {
            system.add(plain(tag as u8)).unwrap();
        }
        assert_eq!(system.stats().total_batches, 1, "batch_size {batch_size}");

        system.add(plain(0)).unwrap();
        assert_eq!(system.pending(), 1);
        assert_eq!(system.stats().total_batches, 1);
        system.cleanup().unwrap();
    }
}

#[tokio::test]
async fn test_item_checks() {
    let config = untimed(4).with_max_event_size(8);
    let (_host, system) = enabled(config);

    let empty = QueuedEvent::new(EventType::Read, Priority::NORMAL, Vec::new());
    let rejected = system.add(empty).unwrap_err();
    assert!(matches!(rejected.reason, Error::InvalidArgument(_)));

    let large = QueuedEvent::new(EventType::Read, Priority::NORMAL, vec![0u8; 9]);
    let rejected = system.add(large).unwrap_err();
    assert!(matches!(rejected.reason, Error::ItemTooLarge { size: 9, max: 8 }));
    assert!(rejected.reason.is_fallback());

    system
        .add(QueuedEvent::new(EventType::Read, Priority::NORMAL, vec![0u8; 8]))
        .unwrap();
    assert_eq!(system.pending(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_timer_flushes_first_item() {
    let log = DispatchLog::default();
    let config = BatchConfig::default()
        .with_batch_size(16)
        .with_timeout(Duration::from_millis(20));
    let (host, system) = enabled(config);

    system.add(logged(&log, Priority::NORMAL, 1)).unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    system.add(logged(&log, Priority::HIGH, 2)).unwrap();
    assert!(system.oldest_pending_age().unwrap() >= Duration::from_millis(5));

    // 定时器从第一个条目开始计时，第二个条目不会推迟它
    tokio::time::sleep(Duration::from_millis(14)).await;
    assert!(log.lock().unwrap().is_empty());
    tokio::time::sleep(Duration::from_millis(2)).await;

    assert_eq!(*log.lock().unwrap(), vec![(1, 2), (2, 1)]);
    assert_eq!(host.pending(), 0);
    assert_eq!(system.oldest_pending_age(), None);
    assert_eq!(system.stats().flushes(FlushTrigger::Timer), 1);
}

#[tokio::test(start_paused = true)]
async fn test_idle_timer_never_flushes() {
    let config = BatchConfig::default()
        .with_batch_size(10)
        .with_timeout(Duration::from_millis(20));
    let (_host, system) = enabled(config);

    tokio::time::sleep(Duration::from_millis(20)).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(system.stats().is_empty());
    assert_eq!(system.flush().unwrap(), 0);
    assert!(system.stats().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_threshold_flush_is_deferred() {
    let log = DispatchLog::default();
    let config = BatchConfig::default()
        .with_batch_size(10)
        .with_timeout(Duration::from_secs(1))
        .with_flags(BatchFlags::THRESHOLD_PROCESS)
        .with_threshold(3);
    let (_host, system) = enabled(config);

    for tag in 0..3 {
        system.add(logged(&log, Priority::NORMAL, tag)).unwrap();
    }
    // 越过阈值不会在入队时同步刷新
    assert_eq!(system.pending(), 3);
    assert!(log.lock().unwrap().is_empty());

    // 下一次循环迭代完成刷新，远早于1秒超时
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(log.lock().unwrap().len(), 3);
    assert_eq!(system.stats().flushes(FlushTrigger::Threshold), 1);
    assert_eq!(system.stats().flushes(FlushTrigger::Timer), 0);
}

#[tokio::test(start_paused = true)]
async fn test_adjust_timeout_tracks_pending() {
    let config = BatchConfig::default()
        .with_batch_size(10)
        .with_timeout(Duration::from_millis(50));
    let host = LoopHandle::current().unwrap();
    let system = EventBatchSystem::init(&host, config, None).unwrap();
    let long = Some(Duration::from_secs(3));

    // 禁用时原样返回
    assert_eq!(host.adjust_timeout(long), long);
    system.enable();
    assert_eq!(host.adjust_timeout(None), None);

    system.add(plain(1)).unwrap();
    assert_eq!(host.adjust_timeout(long), Some(Duration::from_millis(50)));
    assert_eq!(host.adjust_timeout(None), Some(Duration::from_millis(50)));
    assert_eq!(
        host.adjust_timeout(Some(Duration::from_millis(5))),
        Some(Duration::from_millis(5))
    );

    system.flush().unwrap();
    assert_eq!(host.adjust_timeout(long), long);

    system.cleanup().unwrap();
    assert_eq!(host.adjust_timeout(None), None);
}

#[tokio::test]
async fn test_nested_flush_from_callback_is_dropped() {
    let config = untimed(2);
    let (host, system) = enabled(config);
    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_in_flight = Arc::new(AtomicUsize::new(0));
    let nested_results: Arc<Mutex<Vec<bool>>> = Arc::default();

    let make = |tag: u8| {
        let system = system.clone();
        let in_flight = in_flight.clone();
        let max_in_flight = max_in_flight.clone();
        let nested_results = nested_results.clone();
        QueuedEvent::new(EventType::Read, Priority::NORMAL, vec![tag]).with_callback(move |_| {
            let depth = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            max_in_flight.fetch_max(depth, Ordering::SeqCst);
            // 回调中再入队直到容量已满，再尝试刷新
            for inner in 0..3u8 {
                nested_results
                    .lock()
                    .unwrap()
                    .push(system.add(plain(100 + inner)).is_ok());
            }
            assert_eq!(system.flush().unwrap(), 0);
            in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        })
    };

    system.add(make(1)).unwrap();
    // 第2个条目达到容量，触发同步刷新
    system.add(make(2)).unwrap();

    assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
    // 第一个回调填满2个槽位，第3次入队因嵌套刷新被丢弃而返回 BatchFull
    let results = nested_results.lock().unwrap().clone();
    assert_eq!(&results[..3], &[true, true, false]);
    // 第二个回调发现批次仍然满
    assert_eq!(&results[3..], &[false, false, false]);

    // 被丢弃的触发在下一次循环迭代中重新执行
    assert_eq!(system.pending(), 2);
    tokio::task::yield_now().await;
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(system.pending(), 0);
    assert_eq!(host.pending(), 0);
    assert_eq!(system.stats().total_events_processed, 4);
}

#[tokio::test]
async fn test_disable_from_callback_completes_flush() {
    let (host, system) = enabled(untimed(8));
    let inner = system.clone();
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();

    system
        .add(
            QueuedEvent::new(EventType::Close, Priority::HIGH, vec![1]).with_callback(move |_| {
                // 禁用前再入队一个事件，它必须在本轮刷新结束前被送出
                let late = counter.clone();
                inner
                    .add(QueuedEvent::new(EventType::Close, Priority::LOW, vec![2]).with_callback(
                        move |_| {
                            late.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        },
                    ))
                    .unwrap();
                inner.disable().unwrap();
                Ok(())
            }),
        )
        .unwrap();

    system.flush().unwrap();
    assert!(!system.is_enabled());
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    assert_eq!(system.pending(), 0);
    assert_eq!(host.pending(), 0);
}

#[tokio::test]
async fn test_cleanup_from_completion_handler_drains_late_entries() {
    let host = LoopHandle::current().unwrap();
    let owner: Arc<OnceLock<Weak<CompletionBatchSystem>>> = Arc::default();
    let delivered: Arc<Mutex<Vec<Vec<u32>>>> = Arc::default();

    let handler: Arc<dyn CompletionHandler> = {
        let owner = owner.clone();
        let delivered = delivered.clone();
        Arc::new(move |entries: &[CompletionEntry]| {
            let first = {
                let mut delivered = delivered.lock().unwrap();
                delivered.push(entries.iter().map(|e| e.bytes).collect());
                delivered.len() == 1
            };
            if first {
                let system = owner.get().and_then(Weak::upgrade).unwrap();
                // 清理前接收的条目必须在本轮刷新结束前送出
                system.add_completion(99, 99, ContinuationHandle(99)).unwrap();
                assert_eq!(system.cleanup().unwrap(), 0);
                assert!(system.add_completion(100, 0, ContinuationHandle(0)).is_err());
            }
            Ok::<(), CallbackError>(())
        })
    };

    let system = CompletionBatchSystem::init(&host, untimed(4), Some(handler)).unwrap();
    owner.set(Arc::downgrade(&system)).unwrap();
    system.enable();
    system.add_completion(1, 1, ContinuationHandle(1)).unwrap();

    assert_eq!(system.flush().unwrap(), 2);
    assert_eq!(*delivered.lock().unwrap(), vec![vec![1], vec![99]]);
    assert_eq!(system.pending(), 0);
    assert_eq!(host.pending(), 0);
    assert!(!system.is_initialized());
    assert!(!host.has_batch_system());

    // 清理已完成，再次调用是空操作
    assert_eq!(system.cleanup().unwrap(), 0);
    assert_eq!(system.stats().total_events_processed, 2);
}

#[tokio::test]
async fn test_cleanup_from_event_callback_dispatches_late_event() {
    let (host, system) = enabled(untimed(8));
    let inner = system.clone();
    let log: DispatchLog = Arc::default();
    let late = logged(&log, Priority::LOW, 2);

    system
        .add(
            QueuedEvent::new(EventType::Close, Priority::HIGH, vec![1]).with_callback(move |_| {
                inner.add(late).unwrap();
                inner.cleanup().unwrap();
                Ok(())
            }),
        )
        .unwrap();

    assert_eq!(system.flush().unwrap(), 2);
    assert_eq!(*log.lock().unwrap(), vec![(3, 2)]);
    assert_eq!(host.pending(), 0);
    assert!(!host.has_batch_system());
    EventBatchSystem::init_default(&host, None).unwrap();
}

#[tokio::test]
async fn test_cleanup_from_callback_during_disable() {
    let (host, system) = enabled(untimed(8));
    let inner = system.clone();
    system
        .add(QueuedEvent::new(EventType::Close, Priority::HIGH, vec![1]).with_callback(move |_| {
            inner.cleanup().unwrap();
            Ok(())
        }))
        .unwrap();

    // 外层是禁用时的排空，它在结束时完成清理
    assert_eq!(system.disable().unwrap(), 1);
    assert!(!system.is_initialized());
    assert!(!host.has_batch_system());
    assert_eq!(host.pending(), 0);
}

struct RecordingHandler {
    batches: Mutex<Vec<Vec<u8>>>,
    errors: Mutex<Vec<(u8, String)>>,
}

impl EventBatchHandler for RecordingHandler {
    fn on_batch(&self, batch: &OrderedBatch) {
        let tags = batch.iter().map(|e| e.payload()[0]).collect();
        self.batches.lock().unwrap().push(tags);
    }

    fn on_error(&self, event: &QueuedEvent, error: &CallbackError) {
        assert_eq!(event.status(), EventStatus::Failed);
        self.errors
            .lock()
            .unwrap()
            .push((event.payload()[0], error.to_string()));
    }
}

#[tokio::test]
async fn test_callback_errors_are_accounted() {
    let handler = Arc::new(RecordingHandler {
        batches: Mutex::default(),
        errors: Mutex::default(),
    });
    let host = LoopHandle::current().unwrap();
    let as_dyn: Arc<dyn EventBatchHandler> = handler.clone();
    let system = EventBatchSystem::init(&host, untimed(8), Some(as_dyn)).unwrap();
    system.enable();

    let ran = Arc::new(AtomicUsize::new(0));
    for tag in 0..4u8 {
        let ran = ran.clone();
        let event = QueuedEvent::new(EventType::Write, Priority(tag % 2), vec![tag]).with_callback(
            move |_| {
                ran.fetch_add(1, Ordering::SeqCst);
                if tag % 2 == 1 {
                    Err(format!("write {tag} failed").into())
                } else {
                    Ok(())
                }
            },
        );
        system.add(event).unwrap();
    }

    let err = system.flush().unwrap_err();
    match err {
        Error::Callback { failed, source } => {
            assert_eq!(failed, 2);
            assert_eq!(source.to_string(), "write 1 failed");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    // 失败不会中断分发，所有条目都已释放
    assert_eq!(ran.load(Ordering::SeqCst), 4);
    assert_eq!(system.pending(), 0);
    assert_eq!(host.pending(), 0);
    assert_eq!(*handler.batches.lock().unwrap(), vec![vec![0, 2, 1, 3]]);
    assert_eq!(
        *handler.errors.lock().unwrap(),
        vec![(1, "write 1 failed".to_string()), (3, "write 3 failed".to_string())]
    );

    let stats = system.stats();
    assert_eq!(stats.total_events_processed, 4);
    assert_eq!(stats.failed_events, 2);
    assert_eq!(stats.events_of(EventType::Write), 4);
}

#[tokio::test]
async fn test_panicking_callback_releases_batch() {
    let (host, system) = enabled(untimed(8));
    let token = Arc::new(());
    for tag in 0..3u8 {
        let token = token.clone();
        system
            .add(
                QueuedEvent::new(EventType::Read, Priority::NORMAL, vec![tag]).with_callback(
                    move |_| {
                        let _token = token;
                        if tag == 0 {
                            panic!("callback panicked");
                        }
                        Ok(())
                    },
                ),
            )
            .unwrap();
    }

    let flusher = system.clone();
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| flusher.flush()));
    assert!(outcome.is_err());

    // 剩余节点在展开时释放，守卫已复位
    assert_eq!(Arc::strong_count(&token), 1);
    assert_eq!(host.pending(), 0);
    assert_eq!(system.pending(), 0);
    system.add(plain(9)).unwrap();
    assert_eq!(system.flush().unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_request_flush_wakes_loop() {
    let log = DispatchLog::default();
    let config = BatchConfig::default()
        .with_batch_size(16)
        .with_timeout(Duration::from_secs(10));
    let (host, system) = enabled(config);

    system.add(logged(&log, Priority::NORMAL, 7)).unwrap();
    system.request_flush();

    assert_eq!(host.run_once(None).await.unwrap(), 1);
    assert_eq!(*log.lock().unwrap(), vec![(2, 7)]);
    assert_eq!(system.stats().flushes(FlushTrigger::Signal), 1);

    // 没有待处理条目时不会刷新
    assert_eq!(host.process_pending().unwrap(), 0);
}

#[tokio::test]
async fn test_completions_dispatch_in_arrival_order() {
    let delivered: Arc<Mutex<Vec<Vec<u32>>>> = Arc::default();
    let sink = delivered.clone();
    let handler: Arc<dyn CompletionHandler> = Arc::new(move |entries: &[CompletionEntry]| {
        sink.lock()
            .unwrap()
            .push(entries.iter().map(|e| e.bytes).collect());
        Ok::<(), CallbackError>(())
    });

    let host = LoopHandle::current().unwrap();
    let config = untimed(3).with_flags(BatchFlags::AUTO_PROCESS);
    let system = CompletionBatchSystem::init(&host, config, Some(handler)).unwrap();
    system.enable();

    for bytes in [512, 64, 4096, 8] {
        system
            .add_completion(bytes, bytes as usize, ContinuationHandle(bytes as u64))
            .unwrap();
    }
    assert_eq!(*delivered.lock().unwrap(), vec![vec![512, 64, 4096]]);
    assert_eq!(host.pending(), 1);

    assert_eq!(system.cleanup().unwrap(), 1);
    assert_eq!(delivered.lock().unwrap()[1], vec![8]);
    assert_eq!(host.pending(), 0);
}

#[tokio::test]
async fn test_completion_batch_requires_handler() {
    let host = LoopHandle::current().unwrap();
    assert!(matches!(
        CompletionBatchSystem::init_default(&host, None),
        Err(Error::InvalidArgument(_))
    ));
    assert!(!host.has_batch_system());
}

#[tokio::test]
async fn test_dropped_system_frees_loop_slot() {
    let (host, system) = enabled(untimed(8));
    system.add(plain(1)).unwrap();
    drop(system);

    assert!(!host.has_batch_system());
    assert_eq!(host.pending(), 0);
    EventBatchSystem::init_default(&host, None).unwrap();
}

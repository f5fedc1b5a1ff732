//! tests/common/harness.rs
use kestrel_batch::{
    BatchConfig, EventBatchSystem, EventType, LoopHandle, Priority, QueuedEvent,
};
use std::sync::{Arc, Mutex, Once};

/// Initializes tracing for tests, ensuring it's only done once.
pub fn init_tracing() {
    static TRACING_INIT: Once = Once::new();
    TRACING_INIT.call_once(|| {
        let filter = std::env::var("RUST_LOG")
            .unwrap_or_else(|_| "kestrel_batch=debug".to_string());
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .init();
    });
}

/// One dispatched event as seen by its callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatched {
    pub producer: u8,
    pub seq: u16,
    pub priority: u8,
}

/// A loop with an enabled event batch system and a shared dispatch log.
pub struct TestLoop {
    pub host: Arc<LoopHandle>,
    pub system: Arc<EventBatchSystem>,
    pub log: Arc<Mutex<Vec<Dispatched>>>,
}

impl TestLoop {
    /// Creates the loop on the current runtime and enables batching.
    pub fn new(config: BatchConfig) -> Self {
        init_tracing();
        let host = LoopHandle::current().unwrap();
        let system = EventBatchSystem::init(&host, config, None).unwrap();
        system.enable();
        Self {
            host,
            system,
            log: Arc::default(),
        }
    }

    /// Builds an event whose callback appends to the dispatch log.
    pub fn event(&self, producer: u8, seq: u16, priority: Priority) -> QueuedEvent {
        let log = self.log.clone();
        let mut payload = vec![producer];
        payload.extend_from_slice(&seq.to_be_bytes());
        QueuedEvent::new(EventType::User(0), priority, payload).with_callback(move |payload| {
            log.lock().unwrap().push(Dispatched {
                producer: payload[0],
                seq: u16::from_be_bytes([payload[1], payload[2]]),
                priority: priority.0,
            });
            Ok(())
        })
    }

    pub fn dispatched(&self) -> Vec<Dispatched> {
        self.log.lock().unwrap().clone()
    }
}

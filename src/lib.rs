#![deny(clippy::expect_used, clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

//! The root of the event batching library.
//! 事件批处理库的根。

pub mod batch;
pub mod completion;
pub mod config;
pub mod error;
pub mod event;
pub mod host;

pub use batch::{
    BatchStats, BatchSystem, CompletionBatchSystem, CompletionHandler, EventBatchHandler,
    EventBatchSystem, FlushTrigger, OrderedBatch,
};
pub use completion::{CompletionEntry, ContinuationHandle};
pub use config::{BatchConfig, BatchFlags};
pub use error::{CallbackError, Error, Rejected, Result};
pub use event::{EventStatus, EventType, Priority, QueuedEvent};
pub use host::{LoopHandle, PollWake};

//! 批处理引擎
//! Batching engine
//!
//! 待处理条目在这里累积，并在容量、阈值或超时触发时按优先级一次性分发。
//!
//! Pending items accumulate here and are dispatched together, in priority
//! order, when the capacity, threshold or timeout trigger fires.

pub mod chain;
pub mod controller;
pub mod sorter;
pub mod stats;
pub mod storage;
pub mod system;

#[cfg(test)]
mod tests;

pub use chain::{EventChain, OrderedBatch};
pub use controller::{FlushDecision, FlushTrigger, adjust_timeout};
pub use sorter::sort_by_priority;
pub use stats::{BatchStats, DispatchReport};
pub use storage::{BatchStorage, CompletionHandler, EventBatchHandler};
pub use system::{BatchSystem, CompletionBatchSystem, EventBatchSystem};

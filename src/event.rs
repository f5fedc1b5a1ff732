//! 排队事件定义
//! Queued Event Definitions
//!
//! 该模块定义了批处理链中的高层事件：类型标签、优先级、状态、负载以及可选的完成回调。
//!
//! This module defines the higher-level events carried by the batch chain:
//! type tag, priority, status, payload and an optional completion callback.

use crate::config::MAX_EVENT_TYPES;
use crate::error::CallbackError;
use bytes::Bytes;
use std::fmt;
use tokio::time::Instant;

/// 单个事件的完成回调，接收事件负载的引用。
/// Per-event completion callback, receives a reference to the event payload.
pub type EventCallback = Box<dyn FnOnce(&Bytes) -> Result<(), CallbackError> + Send + 'static>;

/// 事件类型标签
/// Event type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Read,
    Write,
    Accept,
    Connect,
    Close,
    Timer,
    Signal,
    FileSystem,
    Resolve,
    Wakeup,
    /// 应用自定义的类型，取值必须小于 6。
    /// Application-defined type; the tag must be below 6.
    User(u8),
}

impl EventType {
    const BUILTIN: usize = 10;

    /// Statistics slot for this type, or `None` when the tag falls outside
    /// the tracked range.
    ///
    /// 该类型对应的统计槽位；标签超出跟踪范围时返回 `None`。
    pub fn index(self) -> Option<usize> {
        let index = match self {
            EventType::Read => 0,
            EventType::Write => 1,
            EventType::Accept => 2,
            EventType::Connect => 3,
            EventType::Close => 4,
            EventType::Timer => 5,
            EventType::Signal => 6,
            EventType::FileSystem => 7,
            EventType::Resolve => 8,
            EventType::Wakeup => 9,
            EventType::User(tag) => Self::BUILTIN + tag as usize,
        };
        (index < MAX_EVENT_TYPES).then_some(index)
    }
}

/// 事件优先级。数值越小优先级越高。
/// Event priority. A lower numeric value means higher precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub u8);

impl Priority {
    pub const CRITICAL: Priority = Priority(0);
    pub const HIGH: Priority = Priority(1);
    pub const NORMAL: Priority = Priority(2);
    pub const LOW: Priority = Priority(3);

    /// Whether `self` is dispatched strictly before `other`.
    /// `self` 是否严格先于 `other` 分发。
    pub fn precedes(self, other: Priority) -> bool {
        self.0 < other.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::NORMAL
    }
}

/// 事件状态
/// Event status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventStatus {
    #[default]
    Pending,
    Completed,
    Failed,
}

/// A batched work item. Owned by exactly one chain until it is unlinked for
/// dispatch; the engine drops it (and its payload) right after dispatch.
///
/// 批处理的工作条目。在被摘下分发之前只属于一条链；引擎在分发后立即释放它（及其负载）。
pub struct QueuedEvent {
    event_type: EventType,
    priority: Priority,
    status: EventStatus,
    arrived_at: Option<Instant>,
    payload: Bytes,
    callback: Option<EventCallback>,
    pub(crate) next: Option<Box<QueuedEvent>>,
}

impl QueuedEvent {
    /// 创建新的排队事件
    /// Create new queued event
    pub fn new(event_type: EventType, priority: Priority, payload: impl Into<Bytes>) -> Self {
        Self {
            event_type,
            priority,
            status: EventStatus::Pending,
            arrived_at: None,
            payload: payload.into(),
            callback: None,
            next: None,
        }
    }

    /// 附加完成回调
    /// Attach a completion callback
    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&Bytes) -> Result<(), CallbackError> + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn status(&self) -> EventStatus {
        self.status
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Arrival time, set when the event is linked into a batch.
    /// 到达时间，在事件链入批次时设置。
    pub fn arrived_at(&self) -> Option<Instant> {
        self.arrived_at
    }

    pub fn has_callback(&self) -> bool {
        self.callback.is_some()
    }

    pub(crate) fn stamp_arrival(&mut self, now: Instant) {
        self.arrived_at = Some(now);
    }

    /// Marks the event completed and runs its callback, if any. A callback
    /// error flips the status to `Failed` and is handed back to the caller.
    ///
    /// 将事件标记为完成并执行其回调（如果有）。回调出错时状态变为 `Failed` 并把错误交给调用者。
    pub(crate) fn complete(&mut self) -> Result<(), CallbackError> {
        self.status = EventStatus::Completed;
        let Some(callback) = self.callback.take() else {
            return Ok(());
        };
        callback(&self.payload).inspect_err(|_| {
            self.status = EventStatus::Failed;
        })
    }
}

impl fmt::Debug for QueuedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedEvent")
            .field("event_type", &self.event_type)
            .field("priority", &self.priority)
            .field("status", &self.status)
            .field("payload_len", &self.payload.len())
            .field("callback", &self.callback.as_ref().map(|_| "<closure>"))
            .finish()
    }
}

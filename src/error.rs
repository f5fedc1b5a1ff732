//! 定义了库中所有可能的错误类型。
//! Defines all possible error types in the library.

use thiserror::Error;

/// 单个回调返回的错误。
/// Error returned by a single dispatch callback.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The primary error type for the batching layer.
/// 批处理层的主要错误类型。
#[derive(Debug, Error)]
pub enum Error {
    /// A configuration value or argument was out of range.
    /// 配置值或参数超出范围。
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The loop already owns a batch system.
    /// 该事件循环已经拥有一个批处理系统。
    #[error("batch system already initialized for this loop")]
    AlreadyInitialized,

    /// Preallocating batch storage failed.
    /// 预分配批处理存储失败。
    #[error("out of memory while allocating batch storage")]
    OutOfMemory,

    /// The batch is at capacity and could not be flushed to make room.
    /// The caller should dispatch the item immediately instead.
    ///
    /// 批次已满且无法通过刷新腾出空间。调用方应改为立即分发该条目。
    #[error("batch is full")]
    BatchFull,

    /// The item does not fit into a preallocated storage slot.
    /// 条目超出预分配存储槽的大小。
    #[error("item of {size} bytes exceeds the {max} byte slot size")]
    ItemTooLarge { size: usize, max: usize },

    /// Batching is not enabled for the loop.
    /// 该事件循环未启用批处理。
    #[error("batching is disabled")]
    Disabled,

    /// The batch system was cleaned up or never attached.
    /// 批处理系统已被清理或从未附加。
    #[error("batch system is not initialized")]
    NotInitialized,

    /// No tokio runtime was available to drive the flush timer.
    /// 没有可用于驱动刷新定时器的 tokio 运行时。
    #[error("no tokio runtime available for the flush timer")]
    NoRuntime,

    /// One or more dispatch callbacks failed during a flush. The whole batch
    /// was still accounted and released before this error was returned.
    ///
    /// 刷新期间一个或多个分发回调失败。在返回该错误之前，整个批次已被统计并释放。
    #[error("{failed} callback(s) failed during flush: {source}")]
    Callback {
        failed: usize,
        #[source]
        source: CallbackError,
    },
}

impl Error {
    /// Whether the producer should fall back to immediate, unbatched dispatch.
    ///
    /// 生产者是否应回退到立即（非批处理）分发。
    pub fn is_fallback(&self) -> bool {
        matches!(
            self,
            Error::BatchFull | Error::Disabled | Error::NotInitialized | Error::ItemTooLarge { .. }
        )
    }
}

/// A specialized `Result` type for this library.
/// 本库专用的 `Result` 类型。
pub type Result<T> = std::result::Result<T, Error>;

/// An item the batching layer refused, handed back to the producer together
/// with the reason so it can go through the unbatched path.
///
/// 被批处理层拒绝的条目，连同原因一起交还给生产者，以便其走非批处理路径。
#[derive(Debug, Error)]
#[error("item rejected: {reason}")]
pub struct Rejected<T: std::fmt::Debug> {
    #[source]
    pub reason: Error,
    pub item: T,
}

impl<T: std::fmt::Debug> Rejected<T> {
    pub(crate) fn new(reason: Error, item: T) -> Self {
        Self { reason, item }
    }

    /// Takes the rejected item back.
    /// 取回被拒绝的条目。
    pub fn into_item(self) -> T {
        self.item
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        use std::io::ErrorKind;
        match err {
            Error::InvalidArgument(msg) => std::io::Error::new(ErrorKind::InvalidInput, msg),
            Error::AlreadyInitialized => ErrorKind::AlreadyExists.into(),
            Error::OutOfMemory => ErrorKind::OutOfMemory.into(),
            Error::BatchFull => ErrorKind::WouldBlock.into(),
            Error::ItemTooLarge { .. } => ErrorKind::InvalidInput.into(),
            Error::Disabled => ErrorKind::Unsupported.into(),
            Error::NotInitialized => ErrorKind::NotConnected.into(),
            Error::NoRuntime => ErrorKind::Unsupported.into(),
            e @ Error::Callback { .. } => std::io::Error::other(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_classification() {
        assert!(Error::BatchFull.is_fallback());
        assert!(Error::Disabled.is_fallback());
        assert!(Error::ItemTooLarge { size: 200, max: 100 }.is_fallback());
        assert!(!Error::AlreadyInitialized.is_fallback());
        assert!(!Error::InvalidArgument("batch_size").is_fallback());
    }

    #[test]
    fn test_rejected_hands_item_back() {
        let rejected = Rejected::new(Error::BatchFull, 42u32);
        assert_eq!(rejected.to_string(), "item rejected: batch is full");
        assert_eq!(rejected.into_item(), 42);
    }

    #[test]
    fn test_io_error_conversion() {
        let io: std::io::Error = Error::BatchFull.into();
        assert_eq!(io.kind(), std::io::ErrorKind::WouldBlock);

        let io: std::io::Error = Error::InvalidArgument("timeout").into();
        assert_eq!(io.kind(), std::io::ErrorKind::InvalidInput);
    }
}

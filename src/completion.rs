//! 原始I/O完成记录及其预分配存储
//! Raw I/O completion records and their preallocated store
//!
//! 完成条目是平台交付的纯数据记录（传输字节数、完成键、延续句柄）。
//! 它们按索引存放在按容量预分配的数组中，每个周期通过重置计数复用，从不单独释放。
//!
//! Completion entries are plain records delivered by the platform (bytes
//! transferred, completion key, continuation handle). They are stored by index
//! in an array preallocated to the batch capacity and reused across cycles by
//! resetting the count, never freed slot by slot.

use crate::error::{Error, Result};

/// 平台相关的延续句柄（例如 OVERLAPPED 指针或 io_uring user_data）。
/// Platform-specific continuation handle (e.g. an OVERLAPPED address or an
/// io_uring `user_data`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ContinuationHandle(pub u64);

/// A raw completion record.
/// 原始完成记录。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompletionEntry {
    /// 传输的字节数
    /// Bytes transferred
    pub bytes: u32,
    /// 完成键
    /// Completion key
    pub key: usize,
    /// 延续句柄
    /// Continuation handle
    pub continuation: ContinuationHandle,
}

impl CompletionEntry {
    pub fn new(bytes: u32, key: usize, continuation: ContinuationHandle) -> Self {
        Self {
            bytes,
            key,
            continuation,
        }
    }
}

/// Bounded, preallocated completion array.
///
/// Two buffers of `capacity` slots are reserved up front. Detaching a full
/// cycle swaps them, so producers can keep appending while the detached
/// buffer is dispatched, and the detached buffer comes back through
/// [`CompletionStore::recycle`] once it has been handed to the handler.
///
/// 有界的预分配完成数组。预先保留两块各 `capacity` 个槽位的缓冲区；
/// 摘下一个周期时交换两者，使生产者可以在分发期间继续追加。
#[derive(Debug)]
pub struct CompletionStore {
    active: Vec<CompletionEntry>,
    spare: Vec<CompletionEntry>,
    capacity: usize,
}

impl CompletionStore {
    /// Reserves both buffers. Fails with [`Error::OutOfMemory`] instead of
    /// aborting when the reservation cannot be satisfied.
    ///
    /// 预留两块缓冲区。无法满足预留时返回 [`Error::OutOfMemory`] 而不是中止。
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        let mut active = Vec::new();
        active
            .try_reserve_exact(capacity)
            .map_err(|_| Error::OutOfMemory)?;
        let mut spare = Vec::new();
        spare
            .try_reserve_exact(capacity)
            .map_err(|_| Error::OutOfMemory)?;
        Ok(Self {
            active,
            spare,
            capacity,
        })
    }

    /// A store with no slots; every push is rejected.
    /// 没有槽位的存储，所有追加都会被拒绝。
    pub fn empty() -> Self {
        Self {
            active: Vec::new(),
            spare: Vec::new(),
            capacity: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.active.len() >= self.capacity
    }

    /// Writes the entry into the next free slot.
    /// 将条目写入下一个空闲槽位。
    pub fn push(&mut self, entry: CompletionEntry) -> Result<()> {
        if self.is_full() {
            return Err(Error::BatchFull);
        }
        self.active.push(entry);
        Ok(())
    }

    pub fn as_slice(&self) -> &[CompletionEntry] {
        &self.active
    }

    /// Detaches the current cycle in arrival order and leaves an empty buffer
    /// in its place.
    ///
    /// 按到达顺序摘下当前周期，并留下一块空缓冲区。
    pub fn detach(&mut self) -> Vec<CompletionEntry> {
        std::mem::swap(&mut self.active, &mut self.spare);
        std::mem::take(&mut self.spare)
    }

    /// Returns a dispatched buffer so its slots are reused next cycle.
    /// 归还已分发的缓冲区，使其槽位在下个周期复用。
    pub fn recycle(&mut self, mut buffer: Vec<CompletionEntry>) {
        buffer.clear();
        if buffer.capacity() >= self.capacity && self.spare.capacity() < self.capacity {
            self.spare = buffer;
        }
    }
}

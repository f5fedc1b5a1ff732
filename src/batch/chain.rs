//! 事件链实现
//! Event chain implementation
//!
//! 待处理事件通过 `QueuedEvent::next` 侵入式链接。`EventChain` 只支持 O(1) 追加，
//! 刷新时整体摘下并转换为按分发顺序排列的 `OrderedBatch`。
//!
//! Pending events are linked intrusively through `QueuedEvent::next`. An
//! `EventChain` only supports O(1) appends; on flush it is detached as a whole
//! and turned into an `OrderedBatch` laid out in dispatch order.

use crate::event::QueuedEvent;
use std::fmt;

/// Append-only chain of pending events.
///
/// Nodes are linked newest-first so an append never walks the chain;
/// [`EventChain::into_nodes`] restores arrival order.
///
/// 仅追加的待处理事件链。节点按最新优先链接，因此追加时无需遍历；
/// [`EventChain::into_nodes`] 会恢复到达顺序。
#[derive(Default)]
pub struct EventChain {
    newest: Option<Box<QueuedEvent>>,
    len: usize,
}

impl EventChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.newest.is_none()
    }

    /// 追加事件
    /// Append an event
    pub fn push(&mut self, mut event: Box<QueuedEvent>) {
        debug_assert!(event.next.is_none(), "event already belongs to a chain");
        event.next = self.newest.take();
        self.newest = Some(event);
        self.len += 1;
    }

    /// Detaches every node, unlinked, in arrival order.
    /// 摘下所有节点（已解除链接），按到达顺序返回。
    pub fn into_nodes(mut self) -> Vec<Box<QueuedEvent>> {
        let mut nodes = Vec::with_capacity(self.len);
        let mut cursor = self.newest.take();
        while let Some(mut node) = cursor {
            cursor = node.next.take();
            nodes.push(node);
        }
        self.len = 0;
        nodes.reverse();
        nodes
    }
}

impl Drop for EventChain {
    fn drop(&mut self) {
        unlink_all(self.newest.take());
    }
}

impl fmt::Debug for EventChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventChain").field("len", &self.len).finish()
    }
}

/// A detached batch, linked head-first in the order it will be dispatched.
///
/// 已摘下的批次，按分发顺序从头链接。
#[derive(Default)]
pub struct OrderedBatch {
    head: Option<Box<QueuedEvent>>,
    len: usize,
}

impl OrderedBatch {
    /// Links the nodes so that `nodes[0]` is dispatched first.
    /// 链接节点，使 `nodes[0]` 最先分发。
    pub(crate) fn from_nodes(nodes: Vec<Box<QueuedEvent>>) -> Self {
        let len = nodes.len();
        let mut head = None;
        for mut node in nodes.into_iter().rev() {
            node.next = head;
            head = Some(node);
        }
        Self { head, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter {
            next: self.head.as_deref(),
        }
    }

    /// Unlinks the next event to dispatch. Ownership passes to the caller.
    /// 摘下下一个待分发的事件，所有权转移给调用者。
    pub(crate) fn pop_front(&mut self) -> Option<Box<QueuedEvent>> {
        let mut node = self.head.take()?;
        self.head = node.next.take();
        self.len -= 1;
        Some(node)
    }
}

impl Drop for OrderedBatch {
    fn drop(&mut self) {
        unlink_all(self.head.take());
    }
}

impl fmt::Debug for OrderedBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

/// Iterator over an [`OrderedBatch`] in dispatch order.
/// 按分发顺序遍历 [`OrderedBatch`] 的迭代器。
pub struct Iter<'a> {
    next: Option<&'a QueuedEvent>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a QueuedEvent;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = current.next.as_deref();
        Some(current)
    }
}

impl<'a> IntoIterator for &'a OrderedBatch {
    type Item = &'a QueuedEvent;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

// 迭代释放，避免长链递归析构
fn unlink_all(mut cursor: Option<Box<QueuedEvent>>) {
    while let Some(mut node) = cursor {
        cursor = node.next.take();
    }
}

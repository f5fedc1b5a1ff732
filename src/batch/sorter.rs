//! 优先级排序器
//! Priority sorter
//!
//! 在分发之前把待处理链稳定地按优先级排序：优先级高者在前，相同优先级保持到达顺序。
//!
//! Stable priority ordering applied right before dispatch: higher precedence
//! first, equal priorities keep their arrival order.

use super::chain::{EventChain, OrderedBatch};
use crate::event::QueuedEvent;

/// Orders a detached chain for dispatch.
///
/// A chain that is already in priority order is linked back untouched, so
/// sorting is a single comparison pass in the common case.
///
/// 为分发排序已摘下的链。已按优先级排列的链会原样重新链接，因此常见情况下只需一次比较遍历。
pub fn sort_by_priority(chain: EventChain) -> OrderedBatch {
    let mut nodes = chain.into_nodes();
    sort_nodes(&mut nodes);
    OrderedBatch::from_nodes(nodes)
}

/// Stable in-place ordering of an arrival-ordered node list.
/// 对按到达顺序排列的节点列表进行稳定的原地排序。
pub(crate) fn sort_nodes(nodes: &mut [Box<QueuedEvent>]) {
    if nodes.is_sorted_by_key(|event| event.priority()) {
        return;
    }
    // slice::sort_by_key 是稳定排序
    nodes.sort_by_key(|event| event.priority());
}

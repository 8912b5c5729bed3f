use crate::CLASSES;
use crate::class::PageClass;
use alloc::vec::Vec;
use core::ops::{Index, IndexMut};

/// Index of a node slot in the [`Arena`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) struct NodeIdx(u32);

impl NodeIdx {
    #[inline]
    pub(crate) const fn raw(self) -> u32 {
        self.0
    }
}

/// State of a node.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub(crate) enum NodeKind {
    #[default]
    Free,
    Used(PageClass),
    /// Zero-sized marker at the range start.
    SentinelLow,
    /// Zero-sized marker at the range end.
    SentinelHigh,
}

impl NodeKind {
    /// Page type a neighbouring free node has to respect. Sentinels count as
    /// small-page; free nodes have none.
    #[inline]
    pub(crate) const fn page_type(self) -> Option<PageClass> {
        match self {
            Self::Free => None,
            Self::Used(p) => Some(p),
            Self::SentinelLow | Self::SentinelHigh => Some(PageClass::Small),
        }
    }

    #[inline]
    const fn rank(self) -> i8 {
        match self {
            Self::SentinelLow => -1,
            Self::SentinelHigh => 1,
            Self::Free | Self::Used(_) => 0,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub(crate) struct Node {
    pub start: u64,
    pub size: u64,
    pub kind: NodeKind,
    pub gap: [u64; CLASSES],
    pub maxgap: [u64; CLASSES],
    pub prio: u64,
    pub parent: Option<NodeIdx>,
    pub left: Option<NodeIdx>,
    pub right: Option<NodeIdx>,
    /// Address-order neighbours.
    pub prev: Option<NodeIdx>,
    pub next: Option<NodeIdx>,
    /// Fragment chain of one allocation.
    pub frag_prev: Option<NodeIdx>,
    pub frag_next: Option<NodeIdx>,
}

impl Node {
    pub(crate) fn new(start: u64, size: u64, kind: NodeKind, prio: u64) -> Self {
        Self {
            start,
            size,
            kind,
            prio,
            ..Self::default()
        }
    }

    #[inline]
    pub(crate) const fn end(&self) -> u64 {
        self.start + self.size
    }

    /// Tree key: sentinels sort before and after every real node.
    #[inline]
    pub(crate) const fn key(&self) -> (i8, u64) {
        (self.kind.rank(), self.start)
    }

    #[inline]
    pub(crate) fn is_free(&self) -> bool {
        self.kind == NodeKind::Free
    }
}

struct Slot {
    generation: u32,
    live: bool,
    node: Node,
}

/// Slot storage with generation counters so stale handles are detectable.
#[derive(Default)]
pub(crate) struct Arena {
    slots: Vec<Slot>,
    vacant: Vec<u32>,
}

impl Arena {
    pub(crate) fn insert(&mut self, node: Node) -> NodeIdx {
        if let Some(i) = self.vacant.pop() {
            let slot = &mut self.slots[i as usize];
            slot.live = true;
            slot.node = node;
            return NodeIdx(i);
        }
        let i = u32::try_from(self.slots.len()).unwrap_or(u32::MAX);
        self.slots.push(Slot {
            generation: 0,
            live: true,
            node,
        });
        NodeIdx(i)
    }

    /// Release a slot; its generation moves on so old handles stop matching.
    pub(crate) fn remove(&mut self, i: NodeIdx) -> Node {
        let slot = &mut self.slots[i.0 as usize];
        slot.live = false;
        slot.generation = slot.generation.wrapping_add(1);
        self.vacant.push(i.0);
        core::mem::take(&mut slot.node)
    }

    /// Invalidate outstanding handles to a slot that stays live.
    pub(crate) fn bump_generation(&mut self, i: NodeIdx) {
        let slot = &mut self.slots[i.0 as usize];
        slot.generation = slot.generation.wrapping_add(1);
    }

    #[inline]
    pub(crate) fn generation(&self, i: NodeIdx) -> u32 {
        self.slots[i.0 as usize].generation
    }

    /// Resolve a raw `(index, generation)` pair to a live node.
    pub(crate) fn resolve(&self, index: u32, generation: u32) -> Option<NodeIdx> {
        let slot = self.slots.get(index as usize)?;
        (slot.live && slot.generation == generation).then_some(NodeIdx(index))
    }

    pub(crate) fn live(&self) -> usize {
        self.slots.len() - self.vacant.len()
    }
}

impl Index<NodeIdx> for Arena {
    type Output = Node;

    #[inline]
    fn index(&self, i: NodeIdx) -> &Node {
        &self.slots[i.0 as usize].node
    }
}

impl IndexMut<NodeIdx> for Arena {
    #[inline]
    fn index_mut(&mut self, i: NodeIdx) -> &mut Node {
        &mut self.slots[i.0 as usize].node
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reused_slot_gets_new_generation() {
        let mut arena = Arena::default();
        let a = arena.insert(Node::new(0, 1, NodeKind::Free, 0));
        let gen_a = arena.generation(a);
        arena.remove(a);
        assert!(arena.resolve(a.raw(), gen_a).is_none());

        let b = arena.insert(Node::new(4, 1, NodeKind::Free, 0));
        assert_eq!(a, b);
        assert_ne!(arena.generation(b), gen_a);
        assert_eq!(arena.resolve(b.raw(), arena.generation(b)), Some(b));
        assert_eq!(arena.live(), 1);
    }
}

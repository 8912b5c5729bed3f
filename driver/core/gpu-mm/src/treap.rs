//! Treap over arena nodes, ordered by [`Node::key`] and max-heap ordered by
//! priority, with the `maxgap` augmentation maintained on every change.

use crate::CLASSES;
use crate::arena::{Arena, Node, NodeIdx};
use alloc::vec::Vec;

#[derive(Default)]
pub(crate) struct Treap {
    pub arena: Arena,
    pub root: Option<NodeIdx>,
}

impl Treap {
    /// Store `node` and link it into the tree. List and fragment links are the
    /// caller's business.
    pub(crate) fn insert(&mut self, node: Node) -> NodeIdx {
        let key = node.key();
        let x = self.arena.insert(node);

        let mut parent = None;
        let mut cur = self.root;
        let mut go_left = false;
        while let Some(c) = cur {
            parent = Some(c);
            go_left = key < self.arena[c].key();
            cur = if go_left {
                self.arena[c].left
            } else {
                self.arena[c].right
            };
        }

        self.arena[x].parent = parent;
        match parent {
            None => self.root = Some(x),
            Some(p) if go_left => self.arena[p].left = Some(x),
            Some(p) => self.arena[p].right = Some(x),
        }
        self.refresh(x);

        while let Some(p) = self.arena[x].parent {
            if self.arena[x].prio <= self.arena[p].prio {
                break;
            }
            self.rotate_up(x);
        }
        self.refresh_upwards(Some(x));
        x
    }

    /// Unlink `x` from the tree and release its slot.
    pub(crate) fn remove(&mut self, x: NodeIdx) -> Node {
        // Rotate x down until it has at most one child.
        loop {
            let (l, r) = (self.arena[x].left, self.arena[x].right);
            match (l, r) {
                (Some(l), Some(r)) => {
                    let up = if self.arena[l].prio > self.arena[r].prio { l } else { r };
                    self.rotate_up(up);
                }
                _ => break,
            }
        }

        let child = self.arena[x].left.or(self.arena[x].right);
        let parent = self.arena[x].parent;
        if let Some(c) = child {
            self.arena[c].parent = parent;
        }
        self.replace_child(parent, x, child);
        self.refresh_upwards(parent);
        self.arena.remove(x)
    }

    /// Recompute `maxgap` of `x` from its own gap and its children.
    pub(crate) fn refresh(&mut self, x: NodeIdx) {
        let n = &self.arena[x];
        let mut maxgap = n.gap;
        for child in [n.left, n.right].into_iter().flatten() {
            let cm = &self.arena[child].maxgap;
            for c in 0..CLASSES {
                maxgap[c] = maxgap[c].max(cm[c]);
            }
        }
        self.arena[x].maxgap = maxgap;
    }

    /// Refresh every node from `x` up to the root.
    pub(crate) fn refresh_upwards(&mut self, mut x: Option<NodeIdx>) {
        while let Some(i) = x {
            self.refresh(i);
            x = self.arena[i].parent;
        }
    }

    /// Rotate `x` above its parent.
    fn rotate_up(&mut self, x: NodeIdx) {
        let Some(p) = self.arena[x].parent else {
            return;
        };
        let g = self.arena[p].parent;

        if self.arena[p].left == Some(x) {
            let inner = self.arena[x].right;
            self.arena[p].left = inner;
            if let Some(i) = inner {
                self.arena[i].parent = Some(p);
            }
            self.arena[x].right = Some(p);
        } else {
            let inner = self.arena[x].left;
            self.arena[p].right = inner;
            if let Some(i) = inner {
                self.arena[i].parent = Some(p);
            }
            self.arena[x].left = Some(p);
        }
        self.arena[p].parent = Some(x);
        self.arena[x].parent = g;
        self.replace_child(g, p, Some(x));

        self.refresh(p);
        self.refresh(x);
    }

    fn replace_child(&mut self, parent: Option<NodeIdx>, old: NodeIdx, new: Option<NodeIdx>) {
        match parent {
            None => self.root = new,
            Some(g) if self.arena[g].left == Some(old) => self.arena[g].left = new,
            Some(g) => self.arena[g].right = new,
        }
    }

    /// Node whose `[start, end)` contains `addr`.
    pub(crate) fn find_containing(&self, addr: u64) -> Option<NodeIdx> {
        let mut cur = self.root;
        while let Some(c) = cur {
            let n = &self.arena[c];
            if addr < n.start {
                cur = n.left;
            } else if addr >= n.end() {
                cur = n.right;
            } else {
                return Some(c);
            }
        }
        None
    }

    /// All nodes in key order.
    pub(crate) fn in_order(&self) -> Vec<NodeIdx> {
        let mut out = Vec::with_capacity(self.arena.live());
        let mut stack = Vec::new();
        let mut cur = self.root;
        while cur.is_some() || !stack.is_empty() {
            while let Some(c) = cur {
                stack.push(c);
                cur = self.arena[c].left;
            }
            if let Some(c) = stack.pop() {
                out.push(c);
                cur = self.arena[c].right;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::NodeKind;

    #[test]
    fn insert_remove_keeps_order_and_heap() {
        let mut t = Treap::default();
        let prios = [5_u64, 1, 9, 3, 7, 2, 8];
        let ids: Vec<_> = prios
            .iter()
            .enumerate()
            .map(|(i, &p)| t.insert(Node::new(i as u64 * 10, 10, NodeKind::Free, p)))
            .collect();

        let starts: Vec<_> = t.in_order().iter().map(|&i| t.arena[i].start).collect();
        assert_eq!(starts, vec![0, 10, 20, 30, 40, 50, 60]);
        assert_eq!(t.arena[t.root.unwrap()].prio, 9);

        t.remove(ids[2]);
        t.remove(ids[0]);
        let starts: Vec<_> = t.in_order().iter().map(|&i| t.arena[i].start).collect();
        assert_eq!(starts, vec![10, 30, 40, 50, 60]);
        assert_eq!(t.arena[t.root.unwrap()].prio, 8);
        assert_eq!(t.find_containing(45), Some(ids[4]));
        assert_eq!(t.find_containing(25), None);
    }

    #[test]
    fn maxgap_tracks_children() {
        let mut t = Treap::default();
        let a = t.insert(Node::new(0, 10, NodeKind::Free, 1));
        let b = t.insert(Node::new(10, 10, NodeKind::Free, 2));
        t.arena[a].gap = [4, 0, 0, 0];
        t.refresh_upwards(Some(a));
        assert_eq!(t.arena[b].maxgap[0], 4);
        t.arena[b].gap = [6, 1, 0, 0];
        t.refresh_upwards(Some(b));
        assert_eq!(t.arena[t.root.unwrap()].maxgap, [6, 1, 0, 0]);
    }
}

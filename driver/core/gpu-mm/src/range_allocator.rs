use crate::arena::{Node, NodeIdx, NodeKind};
use crate::class::{AllocClass, AllocFlags, PageClass, PageGeometry};
use crate::treap::Treap;
use crate::{CLASSES, MAX_REQUEST};
use alloc::vec::Vec;
use gpu_addresses::{AddressRange, align_down, align_up, round_down, round_up};
use rand_chacha::ChaCha8Rng;
use rand_core::{RngCore, SeedableRng};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum AllocError {
    /// No combination of free nodes inside the window satisfies the request.
    #[error("out of memory")]
    OutOfMemory,
    /// Zero or oversized request, or an empty/inverted window.
    #[error("invalid range")]
    InvalidRange,
    /// The handle does not name a live allocation (double free, or reused slot).
    #[error("stale allocation handle")]
    StaleHandle,
}

/// Handle to a (possibly fragmented) allocation.
///
/// Handles are generation-checked: once freed, a handle never resolves again,
/// even if its arena slot is reused.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Allocation {
    index: u32,
    generation: u32,
}

/// Result of [`RangeAllocator::find`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Found {
    pub allocation: Allocation,
    /// The fragment containing the queried address.
    pub fragment: AddressRange,
}

/// A search request for one fragment.
struct Request {
    size: u64,
    class: AllocClass,
    min: u64,
    from_back: bool,
    start: u64,
    end: u64,
}

/// Where a fragment will be carved out of a free node.
struct Placement {
    node: NodeIdx,
    start: u64,
    len: u64,
}

/// Best-fit range allocator over `[range.start, range.end)`.
pub struct RangeAllocator {
    name: &'static str,
    range: AddressRange,
    geometry: PageGeometry,
    tree: Treap,
    rng: ChaCha8Rng,
    low: NodeIdx,
    used: u64,
}

impl RangeAllocator {
    /// Create an allocator with one free node spanning `range`.
    ///
    /// `seed` drives the treap priorities; identical seeds and request
    /// sequences give identical layouts.
    ///
    /// # Errors
    /// [`AllocError::InvalidRange`] for an empty range or invalid geometry.
    pub fn new(
        name: &'static str,
        range: AddressRange,
        geometry: PageGeometry,
        seed: u64,
    ) -> Result<Self, AllocError> {
        if range.is_empty() || !geometry.is_valid() {
            return Err(AllocError::InvalidRange);
        }

        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut tree = Treap::default();
        let low = tree.insert(Node::new(range.start, 0, NodeKind::SentinelLow, rng.next_u64()));
        let free = tree.insert(Node::new(range.start, range.len(), NodeKind::Free, rng.next_u64()));
        let high = tree.insert(Node::new(range.end, 0, NodeKind::SentinelHigh, rng.next_u64()));
        tree.arena[low].next = Some(free);
        tree.arena[free].prev = Some(low);
        tree.arena[free].next = Some(high);
        tree.arena[high].prev = Some(free);

        let mut this = Self {
            name,
            range,
            geometry,
            tree,
            rng,
            low,
            used: 0,
        };
        this.recompute_gap(free);
        log::debug!("{name}: managing {range:?}");
        Ok(this)
    }

    #[inline]
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    #[must_use]
    pub const fn range(&self) -> AddressRange {
        self.range
    }

    #[inline]
    #[must_use]
    pub const fn geometry(&self) -> PageGeometry {
        self.geometry
    }

    #[inline]
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.range.len()
    }

    #[inline]
    #[must_use]
    pub const fn used_bytes(&self) -> u64 {
        self.used
    }

    #[inline]
    #[must_use]
    pub const fn free_bytes(&self) -> u64 {
        self.range.len() - self.used
    }

    /// Largest single fragment currently available for `class`.
    #[must_use]
    pub fn largest_free(&self, class: AllocClass) -> u64 {
        self.tree
            .root
            .map_or(0, |r| self.tree.arena[r].maxgap[class.index()])
    }

    /// Allocate `size` bytes of `class` inside `window`.
    ///
    /// Size and window are rounded to the class page size. Without
    /// [`AllocFlags::contiguous`] the request may be split into fragments of at
    /// least one page each.
    ///
    /// # Errors
    /// - [`AllocError::InvalidRange`] for a zero or oversized request, or a
    ///   window that is empty after rounding.
    /// - [`AllocError::OutOfMemory`] if the request cannot be completed; any
    ///   fragments taken so far are released.
    pub fn alloc(
        &mut self,
        size: u64,
        class: AllocClass,
        flags: AllocFlags,
        window: AddressRange,
    ) -> Result<Allocation, AllocError> {
        if size == 0 || size > MAX_REQUEST {
            return Err(AllocError::InvalidRange);
        }
        let page = self.geometry.page_size(class.page);
        let size = align_up(size, page);
        let start = align_up(window.start, page);
        let end = align_down(window.end, page);
        if start >= end {
            return Err(AllocError::InvalidRange);
        }

        let mut remaining = size;
        let mut head: Option<NodeIdx> = None;
        let mut tail: Option<NodeIdx> = None;
        while remaining > 0 {
            let rq = Request {
                size: remaining,
                class,
                min: if flags.contiguous() { remaining } else { page },
                from_back: flags.from_back(),
                start,
                end,
            };
            let Some(placement) = self.search(self.tree.root, &rq) else {
                log::debug!(
                    "{}: no room for 0x{remaining:x} of 0x{size:x} ({} page{})",
                    self.name,
                    class.page,
                    if class.tiled { ", tiled" } else { "" },
                );
                if let Some(h) = head {
                    self.release_chain(h);
                    log::debug!("{}: rolled back partial allocation", self.name);
                }
                return Err(AllocError::OutOfMemory);
            };

            let len = placement.len;
            let node = self.carve(&placement, class.page);
            self.used += len;
            remaining -= len;

            match tail {
                None => head = Some(node),
                Some(t) => {
                    self.tree.arena[t].frag_next = Some(node);
                    self.tree.arena[node].frag_prev = Some(t);
                }
            }
            tail = Some(node);
        }

        let head = head.ok_or(AllocError::OutOfMemory)?;
        Ok(Allocation {
            index: head.raw(),
            generation: self.tree.arena.generation(head),
        })
    }

    /// Free every fragment of `allocation`.
    ///
    /// # Errors
    /// [`AllocError::StaleHandle`] if the handle was already freed.
    pub fn free(&mut self, allocation: Allocation) -> Result<(), AllocError> {
        let head = self.resolve(allocation)?;
        self.release_chain(head);
        Ok(())
    }

    /// Fragments of `allocation` in allocation order.
    ///
    /// # Errors
    /// [`AllocError::StaleHandle`] if the handle was already freed.
    pub fn regions(&self, allocation: Allocation) -> Result<Vec<AddressRange>, AllocError> {
        let head = self.resolve(allocation)?;
        Ok(self
            .chain(head)
            .into_iter()
            .map(|i| {
                let n = &self.tree.arena[i];
                AddressRange::new(n.start, n.end())
            })
            .collect())
    }

    /// Total bytes of `allocation`.
    ///
    /// # Errors
    /// [`AllocError::StaleHandle`] if the handle was already freed.
    pub fn allocation_size(&self, allocation: Allocation) -> Result<u64, AllocError> {
        let head = self.resolve(allocation)?;
        Ok(self
            .chain(head)
            .into_iter()
            .map(|i| self.tree.arena[i].size)
            .sum())
    }

    /// Whether `allocation` still names a live allocation.
    #[must_use]
    pub fn contains(&self, allocation: Allocation) -> bool {
        self.resolve(allocation).is_ok()
    }

    /// The allocation whose fragment contains `addr`.
    #[must_use]
    pub fn find(&self, addr: u64) -> Option<Found> {
        let i = self.tree.find_containing(addr)?;
        let n = &self.tree.arena[i];
        if !matches!(n.kind, NodeKind::Used(_)) {
            return None;
        }
        let fragment = AddressRange::new(n.start, n.end());
        let mut head = i;
        while let Some(p) = self.tree.arena[head].frag_prev {
            head = p;
        }
        Some(Found {
            allocation: Allocation {
                index: head.raw(),
                generation: self.tree.arena.generation(head),
            },
            fragment,
        })
    }

    /// Every live allocation, in address order of its first fragment.
    #[must_use]
    pub fn allocations(&self) -> Vec<Allocation> {
        self.list()
            .into_iter()
            .filter(|&i| {
                let n = &self.tree.arena[i];
                matches!(n.kind, NodeKind::Used(_)) && n.frag_prev.is_none()
            })
            .map(|i| Allocation {
                index: i.raw(),
                generation: self.tree.arena.generation(i),
            })
            .collect()
    }

    /// Tear the allocator down, reporting every allocation still live.
    ///
    /// Returns the number of leaked allocations.
    pub fn take_down(self, mut report: impl FnMut(Allocation, &[AddressRange])) -> usize {
        let leaked = self.allocations();
        for &a in &leaked {
            if let Ok(regions) = self.regions(a) {
                report(a, &regions);
            }
        }
        if !leaked.is_empty() {
            log::warn!(
                "{}: taken down with {} live allocation(s), 0x{:x} bytes",
                self.name,
                leaked.len(),
                self.used
            );
        }
        leaked.len()
    }

    /// Validate ordering, conservation, no-overlap, merging and the `maxgap`
    /// augmentation.
    ///
    /// # Errors
    /// A description of the first violated invariant.
    pub fn check_invariants(&self) -> Result<(), &'static str> {
        let list = self.list();
        if self.tree.in_order() != list {
            return Err("tree order differs from address list");
        }
        if list.len() != self.tree.arena.live() {
            return Err("unreachable nodes in arena");
        }

        let (Some(&first), Some(&last)) = (list.first(), list.last()) else {
            return Err("empty node list");
        };
        if self.tree.arena[first].kind != NodeKind::SentinelLow
            || self.tree.arena[last].kind != NodeKind::SentinelHigh
        {
            return Err("sentinels missing");
        }

        let mut cursor = self.range.start;
        let (mut free, mut used) = (0_u64, 0_u64);
        let mut prev_free = false;
        for &i in &list {
            let n = &self.tree.arena[i];
            if n.start != cursor {
                return Err("gap or overlap between neighbouring nodes");
            }
            cursor = n.end();
            match n.kind {
                NodeKind::Free => {
                    if prev_free {
                        return Err("adjacent free nodes not merged");
                    }
                    if n.size == 0 {
                        return Err("empty free node");
                    }
                    free += n.size;
                }
                NodeKind::Used(_) => used += n.size,
                NodeKind::SentinelLow | NodeKind::SentinelHigh => {}
            }
            prev_free = n.is_free();

            if n.gap != self.gaps_of(i) {
                return Err("stale gap");
            }
            let mut expect = n.gap;
            for child in [n.left, n.right].into_iter().flatten() {
                let c = &self.tree.arena[child];
                if c.parent != Some(i) {
                    return Err("broken parent link");
                }
                if c.prio > n.prio {
                    return Err("heap order violated");
                }
                for k in 0..CLASSES {
                    expect[k] = expect[k].max(c.maxgap[k]);
                }
            }
            if n.maxgap != expect {
                return Err("stale maxgap");
            }
        }

        if cursor != self.range.end {
            return Err("nodes do not cover the range");
        }
        if used != self.used || free + used != self.range.len() {
            return Err("free + used != total");
        }
        Ok(())
    }

    fn resolve(&self, allocation: Allocation) -> Result<NodeIdx, AllocError> {
        let i = self
            .tree
            .arena
            .resolve(allocation.index, allocation.generation)
            .ok_or(AllocError::StaleHandle)?;
        let n = &self.tree.arena[i];
        if matches!(n.kind, NodeKind::Used(_)) && n.frag_prev.is_none() {
            Ok(i)
        } else {
            Err(AllocError::StaleHandle)
        }
    }

    fn chain(&self, head: NodeIdx) -> Vec<NodeIdx> {
        let mut out = Vec::new();
        let mut cur = Some(head);
        while let Some(i) = cur {
            out.push(i);
            cur = self.tree.arena[i].frag_next;
        }
        out
    }

    fn list(&self) -> Vec<NodeIdx> {
        let mut out = Vec::with_capacity(self.tree.arena.live());
        let mut cur = Some(self.low);
        while let Some(i) = cur {
            out.push(i);
            cur = self.tree.arena[i].next;
        }
        out
    }

    fn release_chain(&mut self, head: NodeIdx) {
        for i in self.chain(head) {
            self.free_node(i);
        }
    }

    /// Usable `[s, e)` of free node `i` for `class`, honouring the tile
    /// boundaries against differently-typed neighbours.
    fn usable(&self, i: NodeIdx, class: AllocClass) -> (u64, u64) {
        let n = &self.tree.arena[i];
        let tile = self.geometry.tile_size;
        let page = self.geometry.page_size(class.page);
        let mut s = n.start;
        let mut e = n.end();

        let neighbour_differs = |j: Option<NodeIdx>| {
            j.and_then(|j| self.tree.arena[j].kind.page_type()) != Some(class.page)
        };
        if class.tiled || neighbour_differs(n.prev) {
            s = round_up(s, tile);
        }
        if class.tiled || neighbour_differs(n.next) {
            e = round_down(e, tile);
        }
        s = align_up(s, page);
        e = align_down(e, page);
        (s, e.max(s))
    }

    fn gaps_of(&self, i: NodeIdx) -> [u64; CLASSES] {
        let mut gap = [0; CLASSES];
        if self.tree.arena[i].is_free() {
            for (c, g) in gap.iter_mut().enumerate() {
                let (s, e) = self.usable(i, AllocClass::from_index(c));
                *g = e - s;
            }
        }
        gap
    }

    fn recompute_gap(&mut self, i: NodeIdx) {
        self.tree.arena[i].gap = self.gaps_of(i);
        self.tree.refresh_upwards(Some(i));
    }

    /// In-order search pruned by `maxgap`; left-to-right unless `from_back`.
    fn search(&self, at: Option<NodeIdx>, rq: &Request) -> Option<Placement> {
        let i = at?;
        let n = &self.tree.arena[i];
        let c = rq.class.index();
        let lok = n.start > rq.start && n.left.is_some_and(|l| self.tree.arena[l].maxgap[c] >= rq.min);
        let rok = n.end() < rq.end && n.right.is_some_and(|r| self.tree.arena[r].maxgap[c] >= rq.min);

        if rq.from_back {
            if rok && let Some(p) = self.search(n.right, rq) {
                return Some(p);
            }
            if let Some(p) = self.fit(i, rq) {
                return Some(p);
            }
            if lok {
                return self.search(n.left, rq);
            }
        } else {
            if lok && let Some(p) = self.search(n.left, rq) {
                return Some(p);
            }
            if let Some(p) = self.fit(i, rq) {
                return Some(p);
            }
            if rok {
                return self.search(n.right, rq);
            }
        }
        None
    }

    fn fit(&self, i: NodeIdx, rq: &Request) -> Option<Placement> {
        if !self.tree.arena[i].is_free() {
            return None;
        }
        let (s, e) = self.usable(i, rq.class);
        let s = s.max(rq.start);
        let e = e.min(rq.end);
        if e <= s || e - s < rq.min {
            return None;
        }
        let len = rq.size.min(e - s);
        let start = if rq.from_back { e - len } else { s };
        Some(Placement { node: i, start, len })
    }

    /// Turn `[p.start, p.start + p.len)` of a free node into a used node,
    /// splitting off free remainders on either side.
    fn carve(&mut self, p: &Placement, page: PageClass) -> NodeIdx {
        let i = p.node;
        let (node_start, node_end) = {
            let n = &self.tree.arena[i];
            (n.start, n.end())
        };
        let end = p.start + p.len;

        // No other node has a key between node_start and p.start, so moving the
        // key in place keeps the tree ordered.
        {
            let n = &mut self.tree.arena[i];
            n.start = p.start;
            n.size = p.len;
            n.kind = NodeKind::Used(page);
            n.gap = [0; CLASSES];
        }
        self.tree.refresh_upwards(Some(i));

        if p.start > node_start {
            let prev = self.tree.arena[i].prev;
            let prio = self.rng.next_u64();
            let l = self.tree.insert(Node::new(node_start, p.start - node_start, NodeKind::Free, prio));
            self.link_between(prev, l, Some(i));
            self.recompute_gap(l);
        }
        if end < node_end {
            let next = self.tree.arena[i].next;
            let prio = self.rng.next_u64();
            let r = self.tree.insert(Node::new(end, node_end - end, NodeKind::Free, prio));
            self.link_between(Some(i), r, next);
            self.recompute_gap(r);
        }
        i
    }

    fn link_between(&mut self, prev: Option<NodeIdx>, x: NodeIdx, next: Option<NodeIdx>) {
        self.tree.arena[x].prev = prev;
        self.tree.arena[x].next = next;
        if let Some(p) = prev {
            self.tree.arena[p].next = Some(x);
        }
        if let Some(n) = next {
            self.tree.arena[n].prev = Some(x);
        }
    }

    fn unlink(&mut self, x: NodeIdx) {
        let (prev, next) = (self.tree.arena[x].prev, self.tree.arena[x].next);
        if let Some(p) = prev {
            self.tree.arena[p].next = next;
        }
        if let Some(n) = next {
            self.tree.arena[n].prev = prev;
        }
    }

    /// Mark `i` free and merge it with free neighbours.
    fn free_node(&mut self, i: NodeIdx) {
        {
            let n = &mut self.tree.arena[i];
            self.used -= n.size;
            n.kind = NodeKind::Free;
            n.frag_prev = None;
            n.frag_next = None;
        }
        self.tree.arena.bump_generation(i);

        let mut cur = i;
        if let Some(p) = self.tree.arena[cur].prev
            && self.tree.arena[p].is_free()
        {
            let size = self.tree.arena[cur].size;
            self.unlink(cur);
            self.tree.remove(cur);
            self.tree.arena[p].size += size;
            cur = p;
        }
        if let Some(nx) = self.tree.arena[cur].next
            && self.tree.arena[nx].is_free()
        {
            let size = self.tree.arena[nx].size;
            self.unlink(nx);
            self.tree.remove(nx);
            self.tree.arena[cur].size += size;
        }
        self.recompute_gap(cur);
    }
}

//! Clients and their chunk sets.
//!
//! Each swappable VRAM chunk of a client is in exactly one of three sets:
//!
//! ```text
//!              reduce                      reduce
//!  candidates ────────►  pending  ────────────────►  swapped
//!       ▲                 │   ▲                         │
//!       │    increase     │   │        increase         │
//!       └─────────────────┘   └─────────────────────────┘
//! ```
//!
//! A chunk sits in `pending` only while a migration owns it; a failed
//! migration returns it to the set it came from. The sets are guarded by one
//! lock per client and the counters are atomics readable without it.

use crate::handle::{ClientId, ObjectId};
use crate::vram::Counters;
use gpu_sync::SpinLock;
use rand_core::RngCore;

/// One chunk of one object.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ChunkRef {
    pub object: ObjectId,
    pub chunk: u32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ChunkSet {
    Candidate,
    Swapped,
    Pending,
}

#[derive(Debug, Default)]
struct Sets {
    candidates: Vec<ChunkRef>,
    swapped: Vec<ChunkRef>,
    /// With the set each chunk was taken from.
    pending: Vec<(ChunkRef, ChunkSet)>,
}

impl Sets {
    const fn list_mut(&mut self, set: ChunkSet) -> Option<&mut Vec<ChunkRef>> {
        match set {
            ChunkSet::Candidate => Some(&mut self.candidates),
            ChunkSet::Swapped => Some(&mut self.swapped),
            ChunkSet::Pending => None,
        }
    }

    fn find(&self, c: ChunkRef) -> Option<ChunkSet> {
        if self.candidates.contains(&c) {
            Some(ChunkSet::Candidate)
        } else if self.swapped.contains(&c) {
            Some(ChunkSet::Swapped)
        } else if self.pending.iter().any(|(p, _)| *p == c) {
            Some(ChunkSet::Pending)
        } else {
            None
        }
    }
}

#[derive(Debug)]
pub struct Client {
    pub id: ClientId,
    counters: Counters,
    sets: SpinLock<Sets>,
}

/// Sizes of the three sets.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SetSizes {
    pub candidates: usize,
    pub swapped: usize,
    pub pending: usize,
}

impl Client {
    #[must_use]
    pub fn new(id: ClientId) -> Self {
        Self {
            id,
            counters: Counters::default(),
            sets: SpinLock::new(Sets::default()),
        }
    }

    #[inline]
    #[must_use]
    pub const fn counters(&self) -> &Counters {
        &self.counters
    }

    #[must_use]
    pub fn set_of(&self, c: ChunkRef) -> Option<ChunkSet> {
        self.sets.lock().find(c)
    }

    #[must_use]
    pub fn set_sizes(&self) -> SetSizes {
        let s = self.sets.lock();
        SetSizes {
            candidates: s.candidates.len(),
            swapped: s.swapped.len(),
            pending: s.pending.len(),
        }
    }

    /// Add a chunk that is in no set yet. Returns `false` if it already is.
    pub(crate) fn insert(&self, c: ChunkRef, set: ChunkSet) -> bool {
        let mut s = self.sets.lock();
        if s.find(c).is_some() {
            return false;
        }
        match s.list_mut(set) {
            Some(list) => {
                list.push(c);
                true
            }
            None => false,
        }
    }

    /// Drop a chunk from whichever set holds it. Pending chunks stay put and
    /// are reported as such.
    pub(crate) fn remove(&self, c: ChunkRef) -> Option<ChunkSet> {
        let mut s = self.sets.lock();
        let set = s.find(c)?;
        if let Some(list) = s.list_mut(set)
            && let Some(pos) = list.iter().position(|x| *x == c)
        {
            list.swap_remove(pos);
        }
        Some(set)
    }

    /// Move a uniformly drawn chunk of `from` into `pending`.
    pub(crate) fn take_random(&self, from: ChunkSet, rng: &mut impl RngCore) -> Option<ChunkRef> {
        let mut s = self.sets.lock();
        let list = s.list_mut(from)?;
        if list.is_empty() {
            return None;
        }
        let len = list.len() as u64;
        #[allow(clippy::cast_possible_truncation)]
        let i = (rng.next_u64() % len) as usize;
        let c = list.swap_remove(i);
        s.pending.push((c, from));
        Some(c)
    }

    /// Move a pending chunk to `to`.
    pub(crate) fn finish(&self, c: ChunkRef, to: ChunkSet) {
        let mut s = self.sets.lock();
        if let Some(pos) = s.pending.iter().position(|(p, _)| *p == c) {
            s.pending.swap_remove(pos);
            if let Some(list) = s.list_mut(to) {
                list.push(c);
            }
        }
    }

    /// Return a pending chunk to the set it was taken from.
    pub(crate) fn unwind(&self, c: ChunkRef) {
        let from = {
            let s = self.sets.lock();
            s.pending.iter().find(|(p, _)| *p == c).map(|(_, f)| *f)
        };
        if let Some(from) = from {
            self.finish(c, from);
        }
    }

    /// Drop a pending chunk whose object went away.
    pub(crate) fn forget_pending(&self, c: ChunkRef) {
        let mut s = self.sets.lock();
        s.pending.retain(|(p, _)| *p != c);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::RawHandle;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;

    fn chunk(i: u32) -> ChunkRef {
        ChunkRef {
            object: ObjectId(RawHandle::from_bits(u64::from(i))),
            chunk: 0,
        }
    }

    fn client() -> Client {
        Client::new(ClientId(RawHandle::from_bits(0)))
    }

    #[test]
    fn chunk_is_in_one_set() {
        let c = client();
        assert!(c.insert(chunk(1), ChunkSet::Candidate));
        assert!(!c.insert(chunk(1), ChunkSet::Swapped));
        assert!(!c.insert(chunk(2), ChunkSet::Pending));
        assert_eq!(c.set_of(chunk(1)), Some(ChunkSet::Candidate));
        assert_eq!(c.remove(chunk(1)), Some(ChunkSet::Candidate));
        assert_eq!(c.set_of(chunk(1)), None);
    }

    #[test]
    fn random_draw_moves_through_pending() {
        let c = client();
        for i in 0..4 {
            c.insert(chunk(i), ChunkSet::Candidate);
        }
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let taken = c.take_random(ChunkSet::Candidate, &mut rng).unwrap();
        assert_eq!(c.set_of(taken), Some(ChunkSet::Pending));
        assert_eq!(
            c.set_sizes(),
            SetSizes {
                candidates: 3,
                swapped: 0,
                pending: 1
            }
        );
        c.finish(taken, ChunkSet::Swapped);
        assert_eq!(c.set_of(taken), Some(ChunkSet::Swapped));

        let back = c.take_random(ChunkSet::Swapped, &mut rng).unwrap();
        assert_eq!(back, taken);
        c.unwind(back);
        assert_eq!(c.set_of(back), Some(ChunkSet::Swapped));
    }

    #[test]
    fn pending_chunks_are_never_drawn() {
        let c = client();
        c.insert(chunk(1), ChunkSet::Candidate);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        assert!(c.take_random(ChunkSet::Candidate, &mut rng).is_some());
        assert!(c.take_random(ChunkSet::Candidate, &mut rng).is_none());
        assert_eq!(c.remove(chunk(1)), Some(ChunkSet::Pending));
        assert_eq!(c.set_of(chunk(1)), Some(ChunkSet::Pending));
        c.forget_pending(chunk(1));
        assert_eq!(c.set_of(chunk(1)), None);
    }
}

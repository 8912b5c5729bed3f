//! Generation-checked handle tables.
//!
//! Every slot carries a generation that is bumped when its value is removed,
//! so a handle to a freed slot never resolves again even after the slot is
//! reused.

use crate::error::{DriverError, DriverResult};
use core::fmt;

#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct RawHandle {
    index: u32,
    generation: u32,
}

impl RawHandle {
    #[inline]
    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }

    #[inline]
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }

    /// Pack into a `u64` (generation in the upper half).
    #[inline]
    #[must_use]
    pub const fn to_bits(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from_bits(bits: u64) -> Self {
        Self {
            index: bits as u32,
            generation: (bits >> 32) as u32,
        }
    }
}

impl fmt::Debug for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.index, self.generation)
    }
}

macro_rules! typed_handle {
    ($(#[$doc:meta])* $name:ident, $label:literal) => {
        $(#[$doc])*
        #[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
        pub struct $name(pub(crate) RawHandle);

        impl $name {
            #[inline]
            #[must_use]
            pub const fn raw(self) -> RawHandle {
                self.0
            }

            #[inline]
            #[must_use]
            pub const fn index(self) -> u32 {
                self.0.index()
            }
        }

        impl From<RawHandle> for $name {
            fn from(h: RawHandle) -> Self {
                Self(h)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($label, "#{:?}"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Debug::fmt(self, f)
            }
        }
    };
}

typed_handle!(
    /// A GPU address space.
    VspaceId,
    "vspace"
);
typed_handle!(
    /// A command-submission channel.
    ChannelId,
    "chan"
);
typed_handle!(
    /// A memory object.
    ObjectId,
    "obj"
);
typed_handle!(
    /// A process owning objects.
    ClientId,
    "client"
);

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Fixed-capacity slot map.
pub struct HandleTable<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    capacity: usize,
    len: usize,
}

impl<T> HandleTable<T> {
    #[must_use]
    pub const fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            capacity,
            len: 0,
        }
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert the value built by `make` from its own handle.
    ///
    /// # Errors
    /// [`DriverError::OutOfMemory`] if every slot is taken.
    pub fn insert_with(&mut self, make: impl FnOnce(RawHandle) -> T) -> DriverResult<RawHandle> {
        let index = match self.free.pop() {
            Some(i) => i,
            None if self.slots.len() < self.capacity => {
                let i = u32::try_from(self.slots.len()).map_err(|_| DriverError::OutOfMemory)?;
                self.slots.push(Slot {
                    generation: 0,
                    value: None,
                });
                i
            }
            None => return Err(DriverError::OutOfMemory),
        };
        let slot = &mut self.slots[index as usize];
        let handle = RawHandle {
            index,
            generation: slot.generation,
        };
        slot.value = Some(make(handle));
        self.len += 1;
        Ok(handle)
    }

    /// # Errors
    /// [`DriverError::OutOfMemory`] if every slot is taken.
    pub fn insert(&mut self, value: T) -> DriverResult<RawHandle> {
        self.insert_with(|_| value)
    }

    #[must_use]
    pub fn get(&self, h: RawHandle) -> Option<&T> {
        self.slots
            .get(h.index as usize)
            .filter(|s| s.generation == h.generation)
            .and_then(|s| s.value.as_ref())
    }

    pub fn get_mut(&mut self, h: RawHandle) -> Option<&mut T> {
        self.slots
            .get_mut(h.index as usize)
            .filter(|s| s.generation == h.generation)
            .and_then(|s| s.value.as_mut())
    }

    pub fn remove(&mut self, h: RawHandle) -> Option<T> {
        let slot = self
            .slots
            .get_mut(h.index as usize)
            .filter(|s| s.generation == h.generation)?;
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(h.index);
        self.len -= 1;
        Some(value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (RawHandle, &T)> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            let v = s.value.as_ref()?;
            Some((
                RawHandle {
                    index: u32::try_from(i).ok()?,
                    generation: s.generation,
                },
                v,
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_handles_do_not_alias() {
        let mut t = HandleTable::new(2);
        let a = t.insert("a").unwrap();
        assert_eq!(t.remove(a), Some("a"));
        let b = t.insert("b").unwrap();
        assert_eq!(a.index(), b.index());
        assert_ne!(a, b);
        assert!(t.get(a).is_none());
        assert_eq!(t.get(b), Some(&"b"));
        assert_eq!(t.remove(a), None);
    }

    #[test]
    fn capacity_is_enforced() {
        let mut t = HandleTable::new(2);
        t.insert(1).unwrap();
        t.insert(2).unwrap();
        assert_eq!(t.insert(3), Err(DriverError::OutOfMemory));
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn insert_with_sees_own_handle() {
        let mut t = HandleTable::new(4);
        let h = t.insert_with(|h| h.to_bits()).unwrap();
        assert_eq!(t.get(h), Some(&h.to_bits()));
        assert_eq!(RawHandle::from_bits(h.to_bits()), h);
        assert_eq!(t.iter().count(), 1);
    }

    #[test]
    fn typed_handles_print_their_kind() {
        let mut t = HandleTable::new(4);
        let h = ChannelId(t.insert(()).unwrap());
        assert_eq!(format!("{h}"), "chan#0.0");
    }
}

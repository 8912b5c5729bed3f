use core::fmt;

/// Half-open `[start, end)` range of raw addresses.
///
/// Used for allocator bounds, virtual placement windows and physical segments.
///
/// ```rust
/// # use gpu_addresses::AddressRange;
/// let r = AddressRange::new(0x1000, 0x3000);
/// assert_eq!(r.len(), 0x2000);
/// assert!(r.contains(0x2fff));
/// assert!(!r.contains(0x3000));
/// assert!(r.overlaps(&AddressRange::new(0x2000, 0x8000)));
/// ```
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct AddressRange {
    pub start: u64,
    pub end: u64,
}

impl AddressRange {
    #[inline]
    #[must_use]
    pub const fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Range starting at `start` spanning `len` bytes, or `None` on overflow.
    #[inline]
    #[must_use]
    pub const fn from_start_len(start: u64, len: u64) -> Option<Self> {
        match start.checked_add(len) {
            Some(end) => Some(Self { start, end }),
            None => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    #[inline]
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Whether `other` lies fully inside this range.
    #[inline]
    #[must_use]
    pub const fn encloses(&self, other: &Self) -> bool {
        other.start >= self.start && other.end <= self.end
    }
}

impl fmt::Debug for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[0x{:010X}, 0x{:010X})", self.start, self.end)
    }
}

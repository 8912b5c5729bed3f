use bitfield_struct::bitfield;
use core::fmt;

/// Page granularity of an allocation.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum PageClass {
    #[default]
    Small,
    Large,
}

impl fmt::Display for PageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Small => f.write_str("small"),
            Self::Large => f.write_str("large"),
        }
    }
}

/// Page class plus tiling requirement; selects one of the four gap classes.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct AllocClass {
    pub page: PageClass,
    pub tiled: bool,
}

impl AllocClass {
    pub const SMALL: Self = Self::new(PageClass::Small, false);
    pub const LARGE: Self = Self::new(PageClass::Large, false);

    #[inline]
    #[must_use]
    pub const fn new(page: PageClass, tiled: bool) -> Self {
        Self { page, tiled }
    }

    /// Index into the per-node gap arrays.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        let page = match self.page {
            PageClass::Small => 0,
            PageClass::Large => 1,
        };
        page | ((self.tiled as usize) << 1)
    }

    #[must_use]
    pub const fn from_index(index: usize) -> Self {
        let page = if index & 1 == 0 {
            PageClass::Small
        } else {
            PageClass::Large
        };
        Self::new(page, index & 2 != 0)
    }
}

/// Request modifiers.
#[bitfield(u8)]
#[derive(Eq, PartialEq)]
pub struct AllocFlags {
    /// The request must be satisfied by exactly one node.
    pub contiguous: bool,
    /// Search right-to-left and carve from the end of the chosen gap.
    pub from_back: bool,
    #[bits(6)]
    __: u8,
}

/// Page and tile granularities of one managed range.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PageGeometry {
    pub small_page: u64,
    pub large_page: u64,
    /// Boundary rounding between small- and large-page neighbours; `1` disables it.
    pub tile_size: u64,
}

impl PageGeometry {
    #[inline]
    #[must_use]
    pub const fn new(small_page: u64, large_page: u64, tile_size: u64) -> Self {
        Self {
            small_page,
            large_page,
            tile_size,
        }
    }

    #[inline]
    #[must_use]
    pub const fn page_size(&self, page: PageClass) -> u64 {
        match page {
            PageClass::Small => self.small_page,
            PageClass::Large => self.large_page,
        }
    }

    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.small_page.is_power_of_two()
            && self.large_page.is_power_of_two()
            && self.large_page >= self.small_page
            && self.tile_size != 0
    }
}

//! # Fixed Layout Constants

/// First VRAM byte handed to the range allocator.
pub const VRAM_FIRST_USABLE: u64 = 0x4_0000;

/// Bytes kept free at the end of VRAM.
pub const VRAM_TAIL_RESERVED: u64 = 0x2_0000;

/// VRAM withheld from the swap budget for driver-internal objects (12 MiB).
pub const VRAM_RESERVED: u64 = 12 << 20;

/// Tile granularity of the VRAM allocator (class boundary rounding).
pub const VRAM_TILE_SIZE: u64 = 0x1000;

/// Upper bound for a single object (1 TiB, exclusive).
pub const MAX_OBJECT_SIZE: u64 = 1 << 40;

/// Upper bound accepted by the range allocator for one request.
pub const MAX_REQUEST_SIZE: u64 = 1 << 60;

/// Capacity of the channel and vspace handle tables.
pub const MAX_CHANNELS: usize = 128;
pub const MAX_VSPACES: usize = 128;

/// Size of a channel's control page.
pub const CONTROL_PAGE_SIZE: u64 = 0x1000;

/// Offset of the indirect-buffer GET pointer in the control page.
pub const CTRL_IB_GET: u32 = 0x88;

/// Offset of the indirect-buffer PUT pointer in the control page.
pub const CTRL_IB_PUT: u32 = 0x8c;

/// Bytes per indirect-buffer entry; an IB of order `n` holds `1 << n` entries.
pub const IB_ENTRY_SIZE: u64 = 8;

/// Hardware storage type field of a PTE.
pub mod storage_type {
    pub const VRAM: u8 = 0x0;
    pub const SYSRAM_SNOOP: u8 = 0x5;
    pub const SYSRAM_NOSNOOP: u8 = 0x7;
}

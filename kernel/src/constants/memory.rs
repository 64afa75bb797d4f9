pub const PAGE_SIZE: u64 = 4096;

pub const BITMAP_ENTRY_SIZE: usize = 64;
pub const FULL_BITMAP_ENTRY: u64 = 0xFFFFFFFFFFFFFFFF;

/// Upper bound on zones taken from the boot memory map.
pub const MAX_MEMORY_ZONES: usize = 16;
/// Zone used when a policy names a zone that does not exist.
pub const DEFAULT_ZONE: usize = 0;

// 1 GiB, the largest page size any supported MMU maps
pub const MAX_ALIGNMENT: u64 = 1 << 30;

/// Fast path bound for the size-to-block-count table. Requests below this
/// resolve with one indexed load; larger requests fall through to a divide.
const SIZE_TABLE_LEN: usize = 4096;

/// Translates a byte size into its block-count size class.
///
/// The block size is fixed at construction, so the table is precomputed once
/// per allocator instance.
pub(crate) struct SizeClassMap {
    block_size: u32,
    table: Vec<u16>,
}

impl SizeClassMap {
    pub fn new(block_size: u32) -> Self {
        debug_assert!(block_size.is_power_of_two() && block_size >= 8);
        let mut table = Vec::with_capacity(SIZE_TABLE_LEN);
        for size in 0..SIZE_TABLE_LEN {
            table.push((size as u32).div_ceil(block_size) as u16);
        }
        Self { block_size, table }
    }

    /// Number of blocks covering `data_size` bytes: `ceil(data_size / B)`.
    #[inline]
    pub fn blocks_for(&self, data_size: u64) -> u64 {
        if (data_size as usize) < self.table.len() {
            u64::from(self.table[data_size as usize])
        } else {
            data_size.div_ceil(u64::from(self.block_size))
        }
    }
}

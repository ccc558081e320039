use super::pool::{EntryList, LargeEntrySet, SpaceEntryPool};
use super::region::{Region, RegionError};
use super::size_class::SizeClassMap;
use super::space::{NULL_OFFSET, Segment, SpaceEntry};
use super::stats;
use super::thread_cache::ThreadCache;
use super::thread_registry::ThreadRegistry;
use crate::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use crate::sync::{Arc, thread};
use std::path::Path;
use std::ptr::NonNull;
use std::time::Duration;

/// Free lists shorter than this are left alone by the rebalancer; conflict
/// between a worker thread and the rebalancer only happens past this point.
const MIN_MOVABLE_ENTRIES: usize = 8;

/// Hard cap on the classified block count.
const MAX_CLASSIFIED_BLOCKS: u64 = 255;

/// Configuration for [`PmemAllocator`]. All fields have sensible defaults.
#[derive(Clone, Debug)]
pub struct PmemAllocatorConfig {
    /// Segment size in bytes. Must be a multiple of `allocation_unit` and at
    /// least `max(1 MiB, max_allocation_size)`. Default: 1 MiB.
    pub segment_size: u64,

    /// Block size in bytes, the minimal allocation unit. Power of two >= 8.
    /// Default: 32.
    pub allocation_unit: u32,

    /// Background rebalance interval in seconds. Values <= 0 disable the
    /// worker entirely. Default: 1.0.
    pub bg_thread_interval: f64,

    /// Largest common allocation size in bytes; sets how many block classes
    /// get dedicated free lists. Default: 1024.
    pub max_allocation_size: u32,
}

impl Default for PmemAllocatorConfig {
    fn default() -> Self {
        Self {
            segment_size: 1 << 20,
            allocation_unit: 32,
            bg_thread_interval: 1.0,
            max_allocation_size: 1024,
        }
    }
}

impl PmemAllocatorConfig {
    fn validate(&self) -> Result<(), RegionError> {
        let unit = u64::from(self.allocation_unit);
        if !unit.is_power_of_two() || unit < 8 {
            return Err(RegionError::Config(format!(
                "allocation_unit {unit} must be a power of two >= 8"
            )));
        }
        if !self.segment_size.is_multiple_of(unit) {
            return Err(RegionError::Config(format!(
                "segment_size {} must be a multiple of allocation_unit {unit}",
                self.segment_size
            )));
        }
        let min_segment = std::cmp::max(1 << 20, u64::from(self.max_allocation_size));
        if self.segment_size < min_segment {
            return Err(RegionError::Config(format!(
                "segment_size {} is smaller than minimum required {min_segment}",
                self.segment_size
            )));
        }
        Ok(())
    }
}

/// Diagnostic snapshot of one allocator instance.
#[derive(Clone, Copy, Debug)]
pub struct AllocatorStats {
    /// Total bytes of the mapped region.
    pub region_size: u64,
    /// Bytes carved into segments so far (the segment head). Monotonic.
    pub carved_bytes: u64,
}

/// Manages allocation and de-allocation of a persistent-memory region at
/// block granularity.
///
/// The region consists of segments, a segment consists of blocks, and a
/// block is the minimal allocation unit. The largest single allocation must
/// be no bigger than a segment.
///
/// Worker threads cache a dedicated segment plus per-class free lists to
/// avoid contention; a background thread periodically moves accumulated
/// free entries into a shared pool so producer-heavy threads do not
/// monopolise reusable space.
///
/// The allocator keeps no metadata in the region itself: after a restart
/// all free-list state is gone and the region reads as one blank expanse.
/// Persistence of payload bytes is the caller's concern.
pub struct PmemAllocator {
    shared: Arc<Shared>,
    bg_worker: Option<thread::JoinHandle<()>>,
}

struct Shared {
    region: Region,
    block_size: u32,
    segment_size: u64,
    /// Largest block count with dedicated free lists (`M`).
    max_classified: u32,
    size_map: SizeClassMap,
    /// Next unused byte of the region. Only ever grows, by one segment per
    /// successful CAS.
    offset_head: AtomicU64,
    pool: SpaceEntryPool,
    large: LargeEntrySet,
    /// One cache bank per thread identity.
    caches: Box<[ThreadCache]>,
    registry: Arc<ThreadRegistry>,
    closing: AtomicBool,
}

impl PmemAllocator {
    /// Open (creating if necessary) and map a persistent-memory backing
    /// store, and build an allocator over it.
    ///
    /// With `devdax_mode` the path must be a DAX character device whose
    /// advertised size equals `region_size`; otherwise it must live on a
    /// DAX filesystem and the kernel must grant synchronous semantics.
    ///
    /// # Errors
    ///
    /// Returns [`RegionError`] on mapping failure, non-pmem paths, probe
    /// failures, size mismatch, or invalid configuration. The failure is
    /// also reported on stderr.
    #[cfg(target_os = "linux")]
    pub fn open(
        path: &Path,
        region_size: u64,
        max_threads: u32,
        devdax_mode: bool,
        config: PmemAllocatorConfig,
    ) -> Result<Self, RegionError> {
        let result = (|| {
            config.validate()?;
            let region = if devdax_mode {
                Region::map_devdax(path, region_size)?
            } else {
                Region::map_pmem_file(path, region_size)?
            };
            Self::with_region(region, max_threads, config)
        })();
        if let Err(e) = &result {
            eprintln!("pmem allocator: {e}");
        }
        result
    }

    /// Build an allocator over an already-mapped region.
    pub(crate) fn with_region(
        region: Region,
        max_threads: u32,
        config: PmemAllocatorConfig,
    ) -> Result<Self, RegionError> {
        config.validate()?;
        if max_threads == 0 {
            return Err(RegionError::Config(
                "max_threads must be at least 1".to_string(),
            ));
        }

        let block_size = config.allocation_unit;
        let size_map = SizeClassMap::new(block_size);
        let max_classified = size_map
            .blocks_for(u64::from(config.max_allocation_size))
            .clamp(1, MAX_CLASSIFIED_BLOCKS) as u32;
        let caches = (0..max_threads)
            .map(|_| ThreadCache::new(max_classified))
            .collect();

        let shared = Arc::new(Shared {
            region,
            block_size,
            segment_size: config.segment_size,
            max_classified,
            size_map,
            offset_head: AtomicU64::new(0),
            pool: SpaceEntryPool::new(max_classified),
            large: LargeEntrySet::new(),
            caches,
            registry: ThreadRegistry::new(max_threads),
            closing: AtomicBool::new(false),
        });

        let bg_worker = if config.bg_thread_interval > 0.0 {
            let shared = shared.clone();
            let interval = Duration::from_secs_f64(config.bg_thread_interval);
            Some(thread::spawn(move || background_work(&shared, interval)))
        } else {
            None
        };

        Ok(Self { shared, bg_worker })
    }

    /// Allocate at least `size` bytes of region space.
    ///
    /// The returned entry's size is `size` rounded up to a block multiple
    /// and may be an entire larger recycled run; the caller owns every byte
    /// of it and must pass the entry back unmodified to [`free`](Self::free).
    ///
    /// Returns `None` when `size` is zero or exceeds a segment, when more
    /// threads than configured access the allocator, or when the region is
    /// exhausted.
    pub fn allocate(&self, size: u64) -> Option<SpaceEntry> {
        self.shared.allocate(size)
    }

    /// Return a space entry to the allocator. The entry must come from a
    /// prior [`allocate`](Self::allocate) on this instance and must not be
    /// used afterwards. Zero-sized entries are a no-op.
    pub fn free(&self, entry: SpaceEntry) {
        self.shared.free(entry);
    }

    /// Relinquish the calling thread's identity early. The default is to
    /// release it when the thread exits.
    pub fn release_access_thread(&self) {
        self.shared.registry.release_thread();
    }

    /// Zero-fill the whole region so following accesses fault no pages.
    ///
    /// Warning: this wipes every payload byte in the region.
    pub fn populate_space(&self) {
        self.shared.region.populate();
    }

    /// Translate a region offset into a mapped address, or `None` if the
    /// offset is out of range.
    pub fn offset_to_addr(&self, offset: u64) -> Option<NonNull<u8>> {
        self.shared.offset_to_addr(offset)
    }

    /// Translate a mapped address back into its region offset, or `None` if
    /// the address is outside the region.
    pub fn addr_to_offset(&self, addr: NonNull<u8>) -> Option<u64> {
        self.shared.addr_to_offset(addr)
    }

    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            region_size: self.shared.region.len(),
            carved_bytes: self.shared.offset_head.load(Ordering::Relaxed),
        }
    }

    #[cfg(test)]
    pub(crate) fn rebalance_now(&self) {
        self.shared.rebalance();
    }
}

impl Drop for PmemAllocator {
    fn drop(&mut self) {
        self.shared.closing.store(true, Ordering::Release);
        if let Some(worker) = self.bg_worker.take() {
            drop(worker.join());
        }
        // The worker's Arc clone is gone after the join, so dropping our
        // `shared` unmaps the region last.
    }
}

impl Shared {
    #[inline]
    fn validate_offset(&self, offset: u64) -> bool {
        offset < self.region.len() && offset != NULL_OFFSET
    }

    fn offset_to_addr(&self, offset: u64) -> Option<NonNull<u8>> {
        self.validate_offset(offset).then(|| {
            // Safety: validated offset stays inside the mapping.
            unsafe { NonNull::new_unchecked(self.region.base().as_ptr().add(offset as usize)) }
        })
    }

    fn addr_to_offset(&self, addr: NonNull<u8>) -> Option<u64> {
        let offset = (addr.as_ptr() as u64).checked_sub(self.region.base().as_ptr() as u64)?;
        self.validate_offset(offset).then_some(offset)
    }

    fn entry(&self, offset: u64, size: u64) -> SpaceEntry {
        debug_assert!(self.validate_offset(offset));
        // Safety: offsets handed around internally are always in range.
        let addr =
            unsafe { NonNull::new_unchecked(self.region.base().as_ptr().add(offset as usize)) };
        SpaceEntry::new(addr, size)
    }

    /// Carve the next segment off the region head. The only place the
    /// region grows in use.
    fn carve_segment(&self) -> Option<u64> {
        let mut head = self.offset_head.load(Ordering::Relaxed);
        loop {
            if head + self.segment_size > self.region.len() {
                return None;
            }
            // The head publishes nothing by itself; entries always travel
            // through the per-class locks.
            match self.offset_head.compare_exchange_weak(
                head,
                head + self.segment_size,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    stats::SEGMENTS_CARVED.add(1);
                    return Some(head);
                }
                Err(current) => head = current,
            }
        }
    }

    /// Install a freshly carved segment for class `b_size`, surrendering any
    /// residual of the previous one as a single free entry.
    fn refill_segment(&self, cache: &ThreadCache, b_size: u32) -> bool {
        let Some(offset) = self.carve_segment() else {
            return false;
        };
        let old = {
            // Safety: segments are confined to the identity-holding thread.
            let seg = crate::sync::unsafe_cell_get_mut!(cache.segments[b_size as usize]);
            std::mem::replace(
                seg,
                Segment {
                    offset,
                    size: self.segment_size,
                },
            )
        };
        if old.size > 0 {
            self.push_free(cache, old.offset, old.size);
        }
        true
    }

    /// Hand out the front `aligned` bytes of the class-`i` partial segment.
    fn take_from_segment(&self, cache: &ThreadCache, i: u32, aligned: u64) -> SpaceEntry {
        // Safety: segments are confined to the identity-holding thread.
        let seg = crate::sync::unsafe_cell_get_mut!(cache.segments[i as usize]);
        debug_assert!(seg.size >= aligned);
        let offset = seg.offset;
        seg.offset += aligned;
        seg.size -= aligned;
        self.entry(offset, aligned)
    }

    fn push_free(&self, cache: &ThreadCache, offset: u64, size: u64) {
        debug_assert!(size > 0 && size.is_multiple_of(u64::from(self.block_size)));
        let b_size = size / u64::from(self.block_size);
        if b_size > u64::from(self.max_classified) {
            self.large.push(offset, size);
        } else {
            cache.freelists[b_size as usize].lock().push(offset);
        }
    }

    fn allocate(&self, size: u64) -> Option<SpaceEntry> {
        let Some(id) = self.registry.maybe_init_thread() else {
            eprintln!("pmem allocator: too many threads access allocator");
            return None;
        };

        let b_size = self.size_map.blocks_for(size);
        let aligned = b_size.saturating_mul(u64::from(self.block_size));
        if aligned == 0 || aligned > self.segment_size {
            eprintln!("pmem allocator: allocation size {size} is 0 or larger than a segment");
            return None;
        }
        let cache = &self.caches[id as usize];

        // First fit: the smallest classified class that might serve.
        let mut i = b_size;
        while i <= u64::from(self.max_classified) {
            let remaining = {
                // Safety: segments are confined to the identity-holding
                // thread.
                crate::sync::unsafe_cell_get!(cache.segments[i as usize]).size
            };
            if remaining < aligned {
                {
                    let mut freelist = cache.freelists[i as usize].lock();
                    if freelist.is_empty() {
                        self.pool.fetch_entry_list(&mut freelist, i as u32);
                    }
                    if let Some(offset) = freelist.pop() {
                        // A class-i entry is i blocks; its full size goes to
                        // the caller.
                        return Some(self.entry(offset, i * u64::from(self.block_size)));
                    }
                }
                if !self.refill_segment(cache, b_size as u32) {
                    i += 1;
                    continue;
                }
                // Fresh segment installed at the requested class; serve from
                // it directly.
                return Some(self.take_from_segment(cache, b_size as u32, aligned));
            }
            return Some(self.take_from_segment(cache, i as u32, aligned));
        }

        // Classified search failed (or the class is unclassified): take the
        // largest recycled run if it covers the request.
        if let Some(large) = self.large.fetch(aligned) {
            return Some(self.entry(large.offset, large.size));
        }

        // Unclassified classes are otherwise served by carving alone.
        if b_size > u64::from(self.max_classified) {
            let offset = self.carve_segment()?;
            let residual = self.segment_size - aligned;
            if residual > 0 {
                self.push_free(cache, offset + aligned, residual);
            }
            return Some(self.entry(offset, aligned));
        }
        None
    }

    fn free(&self, entry: SpaceEntry) {
        let Some(id) = self.registry.maybe_init_thread() else {
            // Degrade instead of aborting: the entry leaks, the process
            // keeps running. Hitting this means more concurrent callers
            // than the configured max_threads.
            eprintln!("pmem allocator: too many threads access allocator, dropping freed entry");
            return;
        };
        if entry.size == 0 {
            return;
        }
        let Some(offset) = self.addr_to_offset(entry.addr) else {
            debug_assert!(false, "freed address is outside the region");
            return;
        };
        self.push_free(&self.caches[id as usize], offset, entry.size);
    }

    /// One rebalance pass: move every free list that accumulated at least
    /// [`MIN_MOVABLE_ENTRIES`] into the shared pool, whole. The critical
    /// section under each per-class lock is a single list swap.
    fn rebalance(&self) {
        let mut moving = EntryList::new();
        for cache in self.caches.iter() {
            for b_size in 1..=self.max_classified {
                {
                    let mut freelist = cache.freelists[b_size as usize].lock();
                    if freelist.len() >= MIN_MOVABLE_ENTRIES {
                        std::mem::swap(&mut moving, &mut *freelist);
                    }
                }
                if !moving.is_empty() {
                    stats::ENTRIES_REBALANCED.add(moving.len());
                    self.pool.move_entry_list(&mut moving, b_size);
                }
            }
        }
    }
}

fn background_work(shared: &Shared, interval: Duration) {
    loop {
        if shared.closing.load(Ordering::Acquire) {
            return;
        }
        thread::sleep(interval);
        if shared.closing.load(Ordering::Acquire) {
            return;
        }
        shared.rebalance();
    }
}

use super::spin::SpinMutex;
use std::collections::BTreeSet;

/// An unordered batch of free block offsets, all of one size class. Batches
/// are the unit exchanged between thread caches and the shared pool.
pub(crate) type EntryList = Vec<u64>;

/// Shared exchange point for free space between threads.
///
/// Three levels: the first level indexes block-count size classes, each class
/// holds a stack of entry lists, and each list holds free block offsets. An
/// overflowing thread surrenders a whole list; an underflowing thread claims
/// a whole list. Exchanging batches rather than single entries means a thread
/// hits the shared structure at most once per batch.
pub(crate) struct SpaceEntryPool {
    /// Entry lists of a same block class guarded by one spin lock.
    classes: Box<[SpinMutex<Vec<EntryList>>]>,
}

impl SpaceEntryPool {
    /// `max_classified` is the largest classified block count; index 0 is
    /// unused so class `k` lives at slot `k`.
    pub fn new(max_classified: u32) -> Self {
        let classes = (0..=max_classified)
            .map(|_| SpinMutex::new(Vec::new()))
            .collect();
        Self { classes }
    }

    /// Move an entry list of class `b_size` into the pool; `src` is left
    /// empty. The list is moved, not copied.
    pub fn move_entry_list(&self, src: &mut EntryList, b_size: u32) {
        debug_assert!((b_size as usize) < self.classes.len());
        let batch = std::mem::take(src);
        self.classes[b_size as usize].lock().push(batch);
    }

    /// Try to claim an entry list of class `b_size` from the pool into `dst`.
    pub fn fetch_entry_list(&self, dst: &mut EntryList, b_size: u32) -> bool {
        debug_assert!((b_size as usize) < self.classes.len());
        if let Some(batch) = self.classes[b_size as usize].lock().pop() {
            *dst = batch;
            true
        } else {
            false
        }
    }
}

/// One free space entry larger than the classified range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct LargeEntry {
    pub size: u64,
    pub offset: u64,
}

// Ordered size-descending so the set's first element is the largest entry.
impl Ord for LargeEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .size
            .cmp(&self.size)
            .then(self.offset.cmp(&other.offset))
    }
}

impl PartialOrd for LargeEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Free entries whose block count exceeds the classified maximum, kept in a
/// single size-descending set under one spin lock. Consulted after the
/// classified search fails.
pub(crate) struct LargeEntrySet {
    entries: SpinMutex<BTreeSet<LargeEntry>>,
}

impl LargeEntrySet {
    pub fn new() -> Self {
        Self {
            entries: SpinMutex::new(BTreeSet::new()),
        }
    }

    pub fn push(&self, offset: u64, size: u64) {
        self.entries.lock().insert(LargeEntry { size, offset });
    }

    /// Take the largest entry if it covers at least `min_size` bytes. The
    /// entry is returned whole; its full size is exposed to the caller.
    pub fn fetch(&self, min_size: u64) -> Option<LargeEntry> {
        let mut entries = self.entries.lock();
        let largest = *entries.iter().next()?;
        if largest.size < min_size {
            return None;
        }
        entries.remove(&largest);
        Some(largest)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::sync::Arc;
    use crate::sync::thread;

    #[test]
    fn test_fetch_from_empty_pool() {
        let pool = SpaceEntryPool::new(8);
        let mut dst = EntryList::new();
        assert!(!pool.fetch_entry_list(&mut dst, 3));
        assert!(dst.is_empty());
    }

    #[test]
    fn test_move_then_fetch_round_trip() {
        let pool = SpaceEntryPool::new(8);
        let mut src: EntryList = vec![0, 64, 128];
        pool.move_entry_list(&mut src, 2);
        assert!(src.is_empty());

        let mut dst = EntryList::new();
        assert!(pool.fetch_entry_list(&mut dst, 2));
        assert_eq!(dst, vec![0, 64, 128]);
        // Pool slot is empty again.
        assert!(!pool.fetch_entry_list(&mut dst, 2));
    }

    #[test]
    fn test_batches_pop_lifo() {
        let pool = SpaceEntryPool::new(4);
        let mut a: EntryList = vec![1];
        let mut b: EntryList = vec![2];
        pool.move_entry_list(&mut a, 1);
        pool.move_entry_list(&mut b, 1);

        let mut dst = EntryList::new();
        assert!(pool.fetch_entry_list(&mut dst, 1));
        assert_eq!(dst, vec![2]);
        assert!(pool.fetch_entry_list(&mut dst, 1));
        assert_eq!(dst, vec![1]);
    }

    #[test]
    fn test_classes_are_isolated() {
        let pool = SpaceEntryPool::new(4);
        let mut src: EntryList = vec![32];
        pool.move_entry_list(&mut src, 1);

        let mut dst = EntryList::new();
        assert!(!pool.fetch_entry_list(&mut dst, 2));
        assert!(pool.fetch_entry_list(&mut dst, 1));
    }

    #[test]
    fn test_concurrent_move_fetch_conserves_entries() {
        const PRODUCERS: usize = 4;
        const BATCHES: usize = 50;

        let pool = Arc::new(SpaceEntryPool::new(4));
        let mut handles = Vec::new();
        for p in 0..PRODUCERS {
            let pool = pool.clone();
            handles.push(thread::spawn(move || {
                for i in 0..BATCHES {
                    let mut batch: EntryList = vec![(p * BATCHES + i) as u64];
                    pool.move_entry_list(&mut batch, 1);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let mut seen = std::collections::HashSet::new();
        let mut dst = EntryList::new();
        while pool.fetch_entry_list(&mut dst, 1) {
            for off in dst.drain(..) {
                assert!(seen.insert(off), "offset {off} surfaced twice");
            }
        }
        assert_eq!(seen.len(), PRODUCERS * BATCHES);
    }

    #[test]
    fn test_large_set_largest_first() {
        let set = LargeEntrySet::new();
        set.push(0, 1024);
        set.push(4096, 8192);
        set.push(1024, 2048);

        let e = set.fetch(1).unwrap();
        assert_eq!((e.offset, e.size), (4096, 8192));
        let e = set.fetch(1).unwrap();
        assert_eq!((e.offset, e.size), (1024, 2048));
        let e = set.fetch(1).unwrap();
        assert_eq!((e.offset, e.size), (0, 1024));
        assert!(set.fetch(1).is_none());
    }

    #[test]
    fn test_large_set_respects_min_size() {
        let set = LargeEntrySet::new();
        set.push(0, 1024);
        assert!(set.fetch(2048).is_none());
        // Entry is still there for a smaller request.
        assert!(set.fetch(512).is_some());
    }

    #[test]
    fn test_large_set_same_size_distinct_offsets() {
        let set = LargeEntrySet::new();
        set.push(0, 4096);
        set.push(8192, 4096);
        let a = set.fetch(1).unwrap();
        let b = set.fetch(1).unwrap();
        assert_ne!(a.offset, b.offset);
        assert!(set.fetch(1).is_none());
    }
}

use super::pool::EntryList;
use super::space::Segment;
use super::spin::SpinMutex;
use crate::sync::cell::UnsafeCell;

/// One thread's private allocation state: a free list and a partial segment
/// per classified size class, indexed by block count (slot 0 unused).
///
/// Free lists are shared with the background rebalancer and therefore sit
/// behind per-class spin locks. Partial segments are touched only by the
/// thread currently holding this bank's identity.
///
/// # Safety
///
/// `segments` is `UnsafeCell` because the registry guarantees at most one
/// live thread per identity; the registry lock orders a released identity's
/// last segment write before the next holder's first access.
#[repr(align(64))]
pub(crate) struct ThreadCache {
    pub freelists: Box<[SpinMutex<EntryList>]>,
    pub segments: Box<[UnsafeCell<Segment>]>,
}

// Safety: freelists are lock-guarded; segments are confined to the single
// thread holding the identity (see struct-level safety comment).
unsafe impl Send for ThreadCache {}
unsafe impl Sync for ThreadCache {}

impl ThreadCache {
    pub fn new(max_classified: u32) -> Self {
        let freelists = (0..=max_classified)
            .map(|_| SpinMutex::new(EntryList::new()))
            .collect();
        let segments = (0..=max_classified)
            .map(|_| UnsafeCell::new(Segment::empty()))
            .collect();
        Self {
            freelists,
            segments,
        }
    }
}

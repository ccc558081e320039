use std::ptr::NonNull;

/// Sentinel for "no offset". Never a valid region offset.
pub(crate) const NULL_OFFSET: u64 = u64::MAX;

/// A contiguous run of mapped persistent memory handed out by the allocator.
///
/// `size` is always a multiple of the configured allocation unit and may be
/// larger than the size originally requested (the caller owns the full run
/// and must pass the entry back unmodified to [`free`]).
///
/// [`free`]: crate::PmemAllocator::free
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpaceEntry {
    pub addr: NonNull<u8>,
    pub size: u64,
}

impl SpaceEntry {
    pub(crate) fn new(addr: NonNull<u8>, size: u64) -> Self {
        Self { addr, size }
    }
}

// Safety: SpaceEntry is a plain (address, size) pair; the memory it points
// into is owned by the allocator's mapping, not by the entry.
unsafe impl Send for SpaceEntry {}

/// The partial segment a thread is carving for one size class: the
/// still-unhanded-out prefix `[offset, offset + size)`.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Segment {
    pub offset: u64,
    pub size: u64,
}

impl Segment {
    pub(crate) fn empty() -> Self {
        Self {
            offset: NULL_OFFSET,
            size: 0,
        }
    }
}

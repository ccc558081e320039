use super::spin::SpinMutex;
use crate::sync::atomic::{AtomicU32, Ordering};
use crate::sync::{Arc, Weak};
use fixedbitset::FixedBitSet;
use std::cell::RefCell;

/// Issues each accessing thread an integer identity in `[0, max_threads)`.
///
/// Identities index the allocator's per-thread cache banks, so at most one
/// live thread holds a given identity at a time. A thread keeps its identity
/// until it exits (TLS destructor) or releases it explicitly; released
/// identities go back to a free set and are reissued smallest-first.
pub(crate) struct ThreadRegistry {
    max_threads: u32,
    /// Next never-issued identity. Only grows.
    issued: AtomicU32,
    /// Identities released by exited threads, available for reissue.
    usable: SpinMutex<FixedBitSet>,
}

impl ThreadRegistry {
    pub fn new(max_threads: u32) -> Arc<Self> {
        Arc::new(Self {
            max_threads,
            issued: AtomicU32::new(0),
            usable: SpinMutex::new(FixedBitSet::with_capacity(max_threads as usize)),
        })
    }

    /// Ensure the calling thread holds an identity issued by this registry.
    ///
    /// Idempotent; the bound case is a TLS read plus one weak upgrade. This
    /// runs at the top of every allocate/free call. Returns `None` when more
    /// distinct threads than `max_threads` are live at once.
    pub fn maybe_init_thread(self: &Arc<Self>) -> Option<u32> {
        ACCESS_THREAD.with(|slot| {
            let mut t = slot.borrow_mut();
            if t.id >= 0 {
                if let Some(owner) = t.owner.as_ref().and_then(Weak::upgrade)
                    && Arc::ptr_eq(&owner, self)
                {
                    return Some(t.id as u32);
                }
                // Bound to a different (or dropped) registry; rebind.
                t.release();
            }
            let id = self.acquire_id()?;
            t.id = i64::from(id);
            t.owner = Some(Arc::downgrade(self));
            Some(id)
        })
    }

    /// Relinquish the calling thread's identity if it was issued by this
    /// registry. No-op otherwise.
    pub fn release_thread(self: &Arc<Self>) {
        ACCESS_THREAD.with(|slot| {
            let mut t = slot.borrow_mut();
            let bound_here = t
                .owner
                .as_ref()
                .and_then(Weak::upgrade)
                .is_some_and(|owner| Arc::ptr_eq(&owner, self));
            if bound_here {
                t.release();
            }
        });
    }

    pub(crate) fn acquire_id(&self) -> Option<u32> {
        {
            let mut usable = self.usable.lock();
            if let Some(id) = usable.ones().next() {
                usable.set(id, false);
                return Some(id as u32);
            }
        }
        // Free set empty: issue a fresh identity. The counter keeps growing
        // past max_threads on failed attempts, matching the capacity check.
        let id = self.issued.fetch_add(1, Ordering::Relaxed);
        if id >= self.max_threads {
            return None;
        }
        Some(id)
    }

    pub(crate) fn return_id(&self, id: u32) {
        self.usable.lock().insert(id as usize);
    }
}

/// Per-thread binding: the identity plus a weak back-reference to the
/// registry that issued it, so the TLS destructor can return the identity
/// without keeping the registry alive.
struct AccessThread {
    id: i64,
    owner: Option<Weak<ThreadRegistry>>,
}

impl AccessThread {
    const fn unbound() -> Self {
        Self { id: -1, owner: None }
    }

    fn release(&mut self) {
        if self.id >= 0
            && let Some(owner) = self.owner.take().and_then(|w| w.upgrade())
        {
            owner.return_id(self.id as u32);
        }
        self.id = -1;
        self.owner = None;
    }
}

impl Drop for AccessThread {
    fn drop(&mut self) {
        self.release();
    }
}

thread_local! {
    static ACCESS_THREAD: RefCell<AccessThread> = const { RefCell::new(AccessThread::unbound()) };
}

//! Epoch-based reclamation.
//!
//! Process-wide registry: a global epoch counter, lazily-registered
//! per-thread reader slots, and a retired list. A reader guard snapshots
//! the global epoch into its thread's slot; writers tag retired blocks
//! with the epoch at unlink time and advance the counter. A retired
//! block is freed once its retire epoch is strictly below every active
//! reader's announced epoch, so any reader that could still hold a
//! pointer into it keeps it alive.
//!
//! Slots are never deallocated; a thread that exits marks its slot free
//! for reuse by the next thread that registers.

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::atomic::{fence, AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

const INACTIVE: u64 = u64::MAX;

/// Writers attempt reclamation once this many blocks are parked.
const RETIRE_THRESHOLD: usize = 64;

struct ReaderSlot {
    epoch: AtomicU64,
    in_use: AtomicBool,
}

struct Retired {
    ptr: *mut u8,
    epoch: u64,
    drop_fn: unsafe fn(*mut u8),
}

unsafe impl Send for Retired {}

struct Registry {
    epoch: AtomicU64,
    slots: Mutex<Vec<Arc<CachePadded<ReaderSlot>>>>,
    retired: Mutex<Vec<Retired>>,
}

static REGISTRY: Registry = Registry {
    epoch: AtomicU64::new(1),
    slots: Mutex::new(Vec::new()),
    retired: Mutex::new(Vec::new()),
};

struct ThreadHandle {
    slot: Arc<CachePadded<ReaderSlot>>,
    depth: Cell<usize>,
}

impl ThreadHandle {
    fn register() -> ThreadHandle {
        let mut slots = REGISTRY.slots.lock();
        let slot = slots
            .iter()
            .find(|s| !s.in_use.load(Ordering::Relaxed))
            .cloned();
        let slot = match slot {
            Some(s) => s,
            None => {
                let s = Arc::new(CachePadded::new(ReaderSlot {
                    epoch: AtomicU64::new(INACTIVE),
                    in_use: AtomicBool::new(false),
                }));
                slots.push(s.clone());
                s
            }
        };
        slot.in_use.store(true, Ordering::Relaxed);
        slot.epoch.store(INACTIVE, Ordering::Relaxed);
        drop(slots);
        ThreadHandle {
            slot,
            depth: Cell::new(0),
        }
    }
}

impl Drop for ThreadHandle {
    fn drop(&mut self) {
        self.slot.epoch.store(INACTIVE, Ordering::Release);
        self.slot.in_use.store(false, Ordering::Release);
    }
}

thread_local! {
    static HANDLE: ThreadHandle = ThreadHandle::register();
}

/// An active reader registration. While any guard is alive on a thread,
/// every block retired at or after the announced epoch stays allocated.
pub struct Guard {
    _not_send: PhantomData<*mut ()>,
}

/// Pins the current thread. Nested pins are counted; only the outermost
/// announces and clears the epoch.
pub(crate) fn pin() -> Guard {
    HANDLE.with(|h| {
        if h.depth.get() == 0 {
            let slot = &h.slot;
            let mut e = REGISTRY.epoch.load(Ordering::SeqCst);
            loop {
                slot.epoch.store(e, Ordering::SeqCst);
                fence(Ordering::SeqCst);
                let confirmed = REGISTRY.epoch.load(Ordering::SeqCst);
                if confirmed == e {
                    break;
                }
                e = confirmed;
            }
        }
        h.depth.set(h.depth.get() + 1);
    });
    Guard {
        _not_send: PhantomData,
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        HANDLE.with(|h| {
            let d = h.depth.get();
            h.depth.set(d - 1);
            if d == 1 {
                h.slot.epoch.store(INACTIVE, Ordering::Release);
            }
        });
    }
}

/// Parks a block for deferred destruction and advances the epoch. Must
/// be called after the block is unreachable from the live structure.
pub(crate) unsafe fn retire(ptr: *mut u8, drop_fn: unsafe fn(*mut u8)) {
    let epoch = REGISTRY.epoch.load(Ordering::SeqCst);
    let pending = {
        let mut retired = REGISTRY.retired.lock();
        retired.push(Retired {
            ptr,
            epoch,
            drop_fn,
        });
        retired.len()
    };
    REGISTRY.epoch.fetch_add(1, Ordering::SeqCst);
    if pending >= RETIRE_THRESHOLD {
        try_reclaim();
    }
}

fn min_active_epoch() -> u64 {
    fence(Ordering::SeqCst);
    let slots = REGISTRY.slots.lock();
    slots
        .iter()
        .map(|s| s.epoch.load(Ordering::SeqCst))
        .min()
        .unwrap_or(INACTIVE)
}

/// Frees every retired block whose retire epoch is strictly below the
/// minimum active reader epoch.
pub(crate) fn try_reclaim() {
    let min = min_active_epoch();
    let freeable = {
        let mut retired = REGISTRY.retired.lock();
        let mut freeable = Vec::new();
        retired.retain(|r| {
            if r.epoch < min {
                freeable.push((r.ptr, r.drop_fn));
                false
            } else {
                true
            }
        });
        freeable
    };
    for (ptr, drop_fn) in freeable {
        unsafe { drop_fn(ptr) };
    }
}

/// Advances the epoch and reclaims. With no reader guards held this
/// drains the retired list completely.
pub(crate) fn force_reclaim() {
    REGISTRY.epoch.fetch_add(1, Ordering::SeqCst);
    try_reclaim();
}

/// Number of blocks currently parked (all containers combined).
pub fn retired_len() -> usize {
    REGISTRY.retired.lock().len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    // The registry is process-global, so these tests serialize on a lock
    // and poll for the drops they expect instead of asserting global
    // list lengths.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    fn await_drops(counter: &AtomicUsize, expected: usize) {
        for _ in 0..1000 {
            force_reclaim();
            if counter.load(Ordering::SeqCst) >= expected {
                return;
            }
            std::thread::yield_now();
        }
        panic!("retired blocks were not reclaimed");
    }

    #[test]
    fn guard_blocks_reclaim_until_dropped() {
        static DROPS: AtomicUsize = AtomicUsize::new(0);
        unsafe fn count_drop(ptr: *mut u8) {
            drop(Box::from_raw(ptr as *mut u64));
            DROPS.fetch_add(1, Ordering::SeqCst);
        }

        let _serial = TEST_LOCK.lock();
        let guard = pin();
        unsafe {
            retire(Box::into_raw(Box::new(1u64)) as *mut u8, count_drop);
            retire(Box::into_raw(Box::new(2u64)) as *mut u8, count_drop);
        }
        force_reclaim();
        assert_eq!(DROPS.load(Ordering::SeqCst), 0);
        drop(guard);
        await_drops(&DROPS, 2);
    }

    #[test]
    fn nested_guards_keep_pin_until_last() {
        static DROPS: AtomicUsize = AtomicUsize::new(0);
        unsafe fn count_drop(ptr: *mut u8) {
            drop(Box::from_raw(ptr as *mut u64));
            DROPS.fetch_add(1, Ordering::SeqCst);
        }

        let _serial = TEST_LOCK.lock();
        let outer = pin();
        let inner = pin();
        drop(outer);
        unsafe {
            retire(Box::into_raw(Box::new(3u64)) as *mut u8, count_drop);
        }
        force_reclaim();
        assert_eq!(DROPS.load(Ordering::SeqCst), 0);
        drop(inner);
        await_drops(&DROPS, 1);
    }
}

use std::cell::RefCell;

use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Lock ranks, top-down. A thread may only acquire a lock whose rank is
/// strictly greater than every rank it already holds. Violations are fatal
/// in debug builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LatchRank {
    BufferPool = 0,
    LruList = 1,
    FlushList = 2,
    Doublewrite = 3,
    PageLatch = 4,
}

thread_local! {
    static HELD_RANKS: RefCell<Vec<LatchRank>> = const { RefCell::new(Vec::new()) };
}

fn push_rank(rank: LatchRank) {
    HELD_RANKS.with(|held| {
        let mut held = held.borrow_mut();
        if let Some(&top) = held.last() {
            // PageLatch is the only rank acquired more than once per thread
            // (multi-page operations latch in page order).
            if top > rank || (top == rank && rank != LatchRank::PageLatch) {
                panic!(
                    "latch order violation: acquiring {:?} while holding {:?} (held: {:?})",
                    rank, top, *held
                );
            }
        }
        held.push(rank);
    });
}

fn pop_rank(rank: LatchRank) {
    HELD_RANKS.with(|held| {
        let mut held = held.borrow_mut();
        match held.iter().rposition(|&r| r == rank) {
            Some(pos) => {
                held.remove(pos);
            }
            None => panic!("latch order violation: releasing {:?} not held", rank),
        }
    });
}

/// A mutex with an assigned rank in the engine-wide lock order.
/// Rank bookkeeping is compiled in only for debug builds; release builds
/// pay nothing beyond the parking_lot mutex itself.
pub struct RankedMutex<T> {
    rank: LatchRank,
    inner: Mutex<T>,
}

impl<T> RankedMutex<T> {
    pub fn new(rank: LatchRank, value: T) -> Self {
        Self {
            rank,
            inner: Mutex::new(value),
        }
    }

    pub fn lock(&self) -> RankedMutexGuard<'_, T> {
        if cfg!(debug_assertions) {
            push_rank(self.rank);
        }
        RankedMutexGuard {
            rank: self.rank,
            guard: Some(self.inner.lock()),
        }
    }

    pub fn rank(&self) -> LatchRank {
        self.rank
    }
}

pub struct RankedMutexGuard<'a, T> {
    rank: LatchRank,
    guard: Option<MutexGuard<'a, T>>,
}

impl<T> std::ops::Deref for RankedMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.as_ref().unwrap()
    }
}

impl<T> std::ops::DerefMut for RankedMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().unwrap()
    }
}

impl<T> Drop for RankedMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.guard.take();
        if cfg!(debug_assertions) {
            pop_rank(self.rank);
        }
    }
}

/// Per-page latch: shared for offset decodes, exclusive for structural
/// change. Ranked below every list mutex. A holder may downgrade
/// exclusive to shared; upgrades are not offered.
pub struct PageLatch {
    inner: RwLock<()>,
}

impl PageLatch {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(()),
        }
    }

    pub fn acquire_shared(&self) -> SharedLatchGuard<'_> {
        if cfg!(debug_assertions) {
            push_rank(LatchRank::PageLatch);
        }
        SharedLatchGuard {
            _guard: self.inner.read(),
        }
    }

    pub fn acquire_exclusive(&self) -> ExclusiveLatchGuard<'_> {
        if cfg!(debug_assertions) {
            push_rank(LatchRank::PageLatch);
        }
        ExclusiveLatchGuard {
            guard: Some(self.inner.write()),
        }
    }

    pub fn try_acquire_shared(&self) -> Option<SharedLatchGuard<'_>> {
        let guard = self.inner.try_read()?;
        if cfg!(debug_assertions) {
            push_rank(LatchRank::PageLatch);
        }
        Some(SharedLatchGuard { _guard: guard })
    }
}

impl Default for PageLatch {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SharedLatchGuard<'a> {
    _guard: RwLockReadGuard<'a, ()>,
}

impl Drop for SharedLatchGuard<'_> {
    fn drop(&mut self) {
        if cfg!(debug_assertions) {
            pop_rank(LatchRank::PageLatch);
        }
    }
}

pub struct ExclusiveLatchGuard<'a> {
    guard: Option<RwLockWriteGuard<'a, ()>>,
}

impl<'a> ExclusiveLatchGuard<'a> {
    /// Downgrades to a shared latch without releasing. Readers blocked on
    /// the exclusive latch proceed; writers keep waiting.
    pub fn downgrade(mut self) -> SharedLatchGuard<'a> {
        let write = self.guard.take().unwrap();
        // The rank entry stays: drop of self must not pop it.
        std::mem::forget(self);
        SharedLatchGuard {
            _guard: RwLockWriteGuard::downgrade(write),
        }
    }
}

impl Drop for ExclusiveLatchGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        if cfg!(debug_assertions) {
            pop_rank(LatchRank::PageLatch);
        }
    }
}

//! Lockable resources and their ownership protocol
//!
//! A [Lockable] is a single atomic ownership word, bit packed as follows:
//! - `bits[19:0]` = context slot index
//! - `bits[62:20]` = slot reuse stamp
//! - `bits[63]` = owned (i.e. the word denotes a context at all)
//!
//! Zero means "unowned". Packing the slot index together with the reuse
//! stamp means that one atomic load yields a *consistent* owner identity:
//! a context observing a stale owner can tell that the slot has since been
//! recycled for a different item, instead of chasing a dangling reference.
//! Slots themselves live in a fixed arena that is never freed mid-run, so
//! any slot index loaded from an ownership word is always safe to index.
//!
//! NOTE: the current packing limits the context arena to 2^20 slots, which
//! bounds `workers * window_size`.

use std::cell::UnsafeCell;
use std::fmt::Debug;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::Ordering;

use crate::loom_testing::*;

/// Set on every packed owner word so that no valid word is ever zero
const OWNER_VALID_BIT: u64 = 1 << 63;
/// An unowned lock
pub const OWNER_NONE: u64 = 0;
/// Number of low bits holding the slot index
const OWNER_SLOT_BITS: u32 = 20;
/// Largest slot index representable in an owner word
pub const MAX_SLOTS: usize = 1 << OWNER_SLOT_BITS;

/// Pack (slot, stamp) into an owner word
pub const fn pack_owner(slot: u32, stamp: u64) -> u64 {
    OWNER_VALID_BIT | ((stamp & 0x7FF_FFFF_FFFF) << OWNER_SLOT_BITS) | slot as u64
}
/// Extract the slot index
pub const fn owner_slot(word: u64) -> u32 {
    (word & ((1u64 << OWNER_SLOT_BITS) - 1)) as u32
}
/// Extract the reuse stamp
pub const fn owner_stamp(word: u64) -> u64 {
    (word >> OWNER_SLOT_BITS) & 0x7FF_FFFF_FFFF
}

/// Outcome of [Lockable::try_acquire]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AcquireStatus {
    /// CAS from unowned succeeded, caller is now the owner
    NewOwner,
    /// Caller already owned this lock
    AlreadyOwner,
    /// Owned by someone else; carries the observed owner word. The owner
    /// may be mid-abort, so a *later* [Lockable::owner_word] load can
    /// return [OWNER_NONE]; callers must tolerate that and retry.
    Fail(u64),
}

/// A resource that can be owned by at most one context at a time
///
/// Embed one of these in (or next to) any piece of shared data an operator
/// may touch. The executor serializes nothing else: a context owns a
/// `Lockable` from acquisition until its commit or abort releases it, and
/// has exclusive access to the guarded data for that interval.
///
/// Lockables must outlive every context that touches them, which the
/// executor's borrow of the operator enforces.
#[derive(Debug)]
pub struct Lockable {
    owner: AtomicU64,
}

impl Lockable {
    pub fn new() -> Self {
        Self {
            owner: AtomicU64::new(OWNER_NONE),
        }
    }

    /// Try to make `me` (a packed owner word) the owner
    pub fn try_acquire(&self, me: u64) -> AcquireStatus {
        match self
            .owner
            .compare_exchange(OWNER_NONE, me, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => AcquireStatus::NewOwner,
            Err(cur) => {
                if cur == me {
                    AcquireStatus::AlreadyOwner
                } else {
                    AcquireStatus::Fail(cur)
                }
            }
        }
    }

    /// Release iff currently owned by `me`
    ///
    /// Called with the *owning context's* word, not the calling thread's:
    /// a context helping another one abort releases the victim's locks on
    /// its behalf.
    pub fn release(&self, me: u64) {
        let _ = self
            .owner
            .compare_exchange(me, OWNER_NONE, Ordering::Release, Ordering::Relaxed);
    }

    /// Snapshot of the current owner word
    ///
    /// May be [OWNER_NONE] even immediately after a [AcquireStatus::Fail]:
    /// the previous owner may just have finished aborting.
    pub fn owner_word(&self) -> u64 {
        self.owner.load(Ordering::Acquire)
    }

    /// Whether this lock is owned by anyone
    pub fn is_owned(&self) -> bool {
        self.owner_word() != OWNER_NONE
    }
}

impl Default for Lockable {
    fn default() -> Self {
        Self::new()
    }
}

/// Reader/writer misuse flag: bit 31 = write borrow, low bits = read borrows
const BORROW_WRITE_BIT: u32 = 1 << 31;

/// A [Lockable] bundled with the data it protects
///
/// The executor core never looks inside; this exists so operators have a
/// data path that doesn't require hand-rolled unsafe. Access goes through
/// the iteration handle, which checks that the calling context actually
/// owns the lock. The borrow flag only catches aliasing misuse *within*
/// the owning context (taking a write guard while another guard is live),
/// since ownership already excludes every other context.
pub struct LockedValue<T> {
    lock: Lockable,
    borrows: AtomicU32,
    value: UnsafeCell<T>,
}

// safety: this is a wrapper for T where the ownership protocol plus the
// borrow flag enforce the shared xor mutable rules
unsafe impl<T: Send> Send for LockedValue<T> {}
unsafe impl<T: Send> Sync for LockedValue<T> {}

impl<T> LockedValue<T> {
    pub fn new(value: T) -> Self {
        Self {
            lock: Lockable::new(),
            borrows: AtomicU32::new(0),
            value: UnsafeCell::new(value),
        }
    }

    /// The embedded protocol object, for [IterationHandle::acquire]
    ///
    /// [IterationHandle::acquire]: crate::executor::IterationHandle::acquire
    pub fn lockable(&self) -> &Lockable {
        &self.lock
    }

    /// Direct access outside any run (exclusive borrow needs no protocol)
    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }

    pub(crate) fn borrow_read(&self) -> ReadGuard<'_, T> {
        let old = self.borrows.fetch_add(1, Ordering::AcqRel);
        if old & BORROW_WRITE_BIT != 0 {
            panic!("locked value already borrowed for writing");
        }
        ReadGuard { lv: self }
    }

    pub(crate) fn borrow_write(&self) -> WriteGuard<'_, T> {
        if self
            .borrows
            .compare_exchange(0, BORROW_WRITE_BIT, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            panic!("locked value already borrowed");
        }
        WriteGuard { lv: self }
    }
}

impl<T> Debug for LockedValue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // the payload may be mid-mutation by its owner, so don't touch it
        f.debug_struct("LockedValue")
            .field("lock", &self.lock)
            .finish_non_exhaustive()
    }
}

/// Shared borrow of a [LockedValue], handed out by the iteration handle
pub struct ReadGuard<'h, T> {
    lv: &'h LockedValue<T>,
}
impl<'h, T> Deref for ReadGuard<'h, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // safety: the borrow flag excludes a live write guard, and lock
        // ownership excludes every other context
        unsafe { &*self.lv.value.get() }
    }
}
impl<'h, T> Drop for ReadGuard<'h, T> {
    fn drop(&mut self) {
        self.lv.borrows.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Exclusive borrow of a [LockedValue], handed out by the iteration handle
pub struct WriteGuard<'h, T> {
    lv: &'h LockedValue<T>,
}
impl<'h, T> Deref for WriteGuard<'h, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // safety: the borrow flag holds the write bit, excluding all other guards
        unsafe { &*self.lv.value.get() }
    }
}
impl<'h, T> DerefMut for WriteGuard<'h, T> {
    fn deref_mut(&mut self) -> &mut T {
        // safety: as above
        unsafe { &mut *self.lv.value.get() }
    }
}
impl<'h, T> Drop for WriteGuard<'h, T> {
    fn drop(&mut self) {
        self.lv.borrows.store(0, Ordering::Release);
    }
}

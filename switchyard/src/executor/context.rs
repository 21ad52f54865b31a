//! Per-iteration context slots and the conflict-resolution protocol
//!
//! One [Context] represents one scheduled attempt at one work item. Slots
//! live in a fixed arena, are recycled through per-worker free lists, and
//! are never freed mid-run, so a slot index observed anywhere (notably in a
//! [Lockable] owner word) can always be dereferenced. A reuse stamp is
//! bumped on every re-initialization; protocol code validates it to tell a
//! live victim apart from a slot that has since been recycled.
//!
//! Cross-thread access discipline for the non-atomic fields (`item`,
//! `nhood`, `user`):
//! - the owning worker touches them freely between scheduling and the
//!   context's terminal state;
//! - priority-comparison reads of `item` (the reorder-buffer heap order
//!   and conflict verdicts) happen only under the reorder-buffer mutex;
//!   slot re-initialization is under that mutex too, so such a read can
//!   never observe a slot mid-recycle;
//! - the single commit or abort performer reads and drains `item`,
//!   `nhood`, and `user` directly, without the mutex: winning the CAS
//!   into `Committing`, `AbortHelp`, or `Aborting` (paired with the
//!   owner's release store of `executed` in the missed-signal path)
//!   orders it after every owner write, and the slot cannot be recycled
//!   before the performer itself publishes the terminal state.

use std::cell::UnsafeCell;
use std::sync::atomic::Ordering;

use crate::lockable::{
    owner_slot, owner_stamp, pack_owner, AcquireStatus, LockedValue, Lockable, ReadGuard,
    WriteGuard, OWNER_NONE,
};
use crate::loom_testing::*;

use super::ExecShared;

/// States of a context's lifecycle
///
/// Transitions are made with CAS except where a single thread already has
/// exclusive claim to the context (e.g. `AbortHelp -> Aborting`).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub(crate) enum State {
    Unscheduled = 0,
    Scheduled,
    ReadyToCommit,
    AbortSelf,
    AbortHelp,
    Committing,
    Aborting,
    CommitDone,
    AbortDone,
}

impl State {
    fn from_u8(x: u8) -> Self {
        match x {
            0 => State::Unscheduled,
            1 => State::Scheduled,
            2 => State::ReadyToCommit,
            3 => State::AbortSelf,
            4 => State::AbortHelp,
            5 => State::Committing,
            6 => State::Aborting,
            7 => State::CommitDone,
            8 => State::AbortDone,
            _ => unreachable!("corrupt context state"),
        }
    }
}

/// The current iteration lost a conflict and must unwind
///
/// Returned through operator code with `?`; the executor aborts the
/// iteration (rolling back side effects) and retries the item later.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Canceled;

/// Capability handed to rollback hooks while they run
///
/// Undo hooks execute on whichever thread performs the abort, *before* the
/// aborting iteration's locks are released, so they may still mutate the
/// values that iteration had acquired.
pub struct RollbackHandle {
    pub(crate) me: u64,
}

impl RollbackHandle {
    /// Shared access to a value the aborting iteration holds
    ///
    /// Panics if the aborting iteration does not hold the value's lock.
    pub fn read<'a, U>(&'a self, lv: &'a LockedValue<U>) -> ReadGuard<'a, U> {
        if lv.lockable().owner_word() != self.me {
            panic!("rollback hook touched a value the aborting iteration does not hold");
        }
        lv.borrow_read()
    }

    /// Exclusive access to a value the aborting iteration holds
    ///
    /// Panics if the aborting iteration does not hold the value's lock.
    pub fn write<'a, U>(&'a self, lv: &'a LockedValue<U>) -> WriteGuard<'a, U> {
        if lv.lockable().owner_word() != self.me {
            panic!("rollback hook touched a value the aborting iteration does not hold");
        }
        lv.borrow_write()
    }
}

/// Per-iteration buffers the operator fills in: newly produced items and
/// undo hooks for speculative side effects
pub(crate) struct UserContext<'l, T> {
    push_buffer: Vec<T>,
    rollback_hooks: Vec<Box<dyn FnOnce(&RollbackHandle) + Send + 'l>>,
}

impl<'l, T> UserContext<'l, T> {
    pub(crate) fn new() -> Self {
        Self {
            push_buffer: Vec::new(),
            rollback_hooks: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, x: T) {
        self.push_buffer.push(x);
    }

    pub(crate) fn defer_rollback(&mut self, hook: Box<dyn FnOnce(&RollbackHandle) + Send + 'l>) {
        self.rollback_hooks.push(hook);
    }

    /// Keep the side effects: discard the undo hooks, leave the push
    /// buffer for the executor to publish
    pub(crate) fn commit(&mut self) -> Vec<T> {
        self.rollback_hooks.clear();
        std::mem::take(&mut self.push_buffer)
    }

    /// Undo speculative side effects in reverse order and drop whatever
    /// the iteration wanted to push
    pub(crate) fn rollback(&mut self, h: &RollbackHandle) {
        for hook in self.rollback_hooks.drain(..).rev() {
            hook(h);
        }
        self.push_buffer.clear();
    }

    pub(crate) fn reset(&mut self) {
        self.push_buffer.clear();
        self.rollback_hooks.clear();
    }
}

/// One recyclable context slot
pub(crate) struct Context<'l, T> {
    state: AtomicU8,
    /// set by the owner once the operator has returned for this incarnation
    executed: AtomicBool,
    /// the self-abort was triggered by losing a lock contest (vs. a signal
    /// observed after executing)
    lost_conflict: AtomicBool,
    /// worker that scheduled this incarnation; its free list gets the slot
    /// back, and its tree parent gets the item on abort
    owner: AtomicU32,
    /// bumped on every re-initialization
    stamp: AtomicU64,
    item: UnsafeCell<Option<T>>,
    nhood: UnsafeCell<Vec<&'l Lockable>>,
    user: UnsafeCell<UserContext<'l, T>>,
}

// safety: the non-atomic fields follow the access discipline in the module
// docs; everything else is atomics. T: Sync because the item is compared
// (by shared reference) from threads other than the owner's; T: Send
// because aborts can move the item back to a pending heap from a helper
// thread.
unsafe impl<'l, T: Send + Sync> Sync for Context<'l, T> {}

impl<'l, T> Context<'l, T> {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(State::Unscheduled as u8),
            executed: AtomicBool::new(false),
            lost_conflict: AtomicBool::new(false),
            owner: AtomicU32::new(0),
            stamp: AtomicU64::new(0),
            item: UnsafeCell::new(None),
            nhood: UnsafeCell::new(Vec::new()),
            user: UnsafeCell::new(UserContext::new()),
        }
    }

    pub(crate) fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn cas_state(&self, old: State, new: State) -> bool {
        self.state
            .compare_exchange(old as u8, new as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn set_state(&self, s: State) {
        self.state.store(s as u8, Ordering::Release);
    }

    pub(crate) fn stamp(&self) -> u64 {
        self.stamp.load(Ordering::Acquire)
    }

    pub(crate) fn owner(&self) -> u32 {
        self.owner.load(Ordering::Relaxed)
    }

    pub(crate) fn has_executed(&self) -> bool {
        self.executed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_executed(&self) {
        self.executed.store(true, Ordering::Release);
    }

    pub(crate) fn lost_conflict(&self) -> bool {
        self.lost_conflict.load(Ordering::Relaxed)
    }

    pub(crate) fn set_lost_conflict(&self) {
        self.lost_conflict.store(true, Ordering::Relaxed);
    }

    /// Re-initialize a recycled slot with a fresh item.
    ///
    /// Only callable under the reorder-buffer mutex, on a slot popped off a
    /// free list (i.e. one whose previous incarnation reached a terminal
    /// state). The stamp bump is what retires the previous incarnation's
    /// identity.
    pub(crate) fn reinit(&self, item: T, wid: u32) {
        self.stamp.fetch_add(1, Ordering::AcqRel);
        self.owner.store(wid, Ordering::Relaxed);
        self.executed.store(false, Ordering::Relaxed);
        self.lost_conflict.store(false, Ordering::Relaxed);
        unsafe {
            // safety: terminal incarnation + rob mutex held, see above
            *self.item.get() = Some(item);
            (*self.nhood.get()).clear();
            (*self.user.get()).reset();
        }
        self.set_state(State::Scheduled);
    }

    /// Read the item of the current incarnation.
    ///
    /// # Safety
    /// Caller must be the owning worker (between schedule and terminal
    /// state) or hold the reorder-buffer mutex.
    pub(crate) unsafe fn item(&self) -> &T {
        (*self.item.get())
            .as_ref()
            .expect("context slot has no item")
    }

    /// # Safety
    /// Caller must be the owning worker mid-execution or the single
    /// commit/abort performer.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn user(&self) -> &mut UserContext<'l, T> {
        &mut *self.user.get()
    }

    /// # Safety
    /// As for [Context::user].
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn nhood(&self) -> &mut Vec<&'l Lockable> {
        &mut *self.nhood.get()
    }
}

enum Verdict {
    /// We are earlier than the victim and get to abort it
    Win,
    /// The victim is earlier; we must abort ourselves
    Lose,
    /// The lock changed hands while we were deciding; retry the acquire
    Gone,
}

impl<'l, T: Ord + Clone + Send + Sync> ExecShared<'l, T> {
    /// The packed owner word of a slot's current incarnation
    pub(crate) fn packed(&self, slot: u32) -> u64 {
        pack_owner(slot, self.arena[slot as usize].stamp())
    }

    /// Heap order over live context slots: item order with a slot-index
    /// tie-break (a slot is fixed for the life of an incarnation, so this
    /// is a consistent total order for the reorder buffer). Must be called
    /// under the reorder-buffer mutex (both items are read non-atomically).
    pub(crate) unsafe fn slot_less(&self, a: u32, b: u32) -> bool {
        let ia = self.arena[a as usize].item();
        let ib = self.arena[b as usize].item();
        match ia.cmp(ib) {
            std::cmp::Ordering::Less => true,
            std::cmp::Ordering::Equal => a < b,
            std::cmp::Ordering::Greater => false,
        }
    }

    /// Strict item order, no tie-break: what conflicts are decided by.
    /// Equal priorities mean the acquirer yields to the current owner, so
    /// two equal contexts can never keep aborting each other. Same rob
    /// mutex requirement as [ExecShared::slot_less].
    unsafe fn item_strictly_less(&self, a: u32, b: u32) -> bool {
        self.arena[a as usize].item() < self.arena[b as usize].item()
    }

    /// The retry loop behind every lock acquisition by an operator
    ///
    /// On `Fail` the conflict is resolved by priority; we either abort the
    /// owner and retry, or signal ourselves to abort and unwind with
    /// `Err(Canceled)`.
    pub(crate) fn acquire(&self, slot: u32, me: u64, l: &'l Lockable) -> Result<(), Canceled> {
        loop {
            match l.try_acquire(me) {
                AcquireStatus::NewOwner => {
                    unsafe {
                        // safety: owning worker mid-execution
                        self.arena[slot as usize].nhood().push(l);
                    }
                    return Ok(());
                }
                AcquireStatus::AlreadyOwner => return Ok(()),
                AcquireStatus::Fail(victim_word) => {
                    self.resolve_conflict(slot, victim_word, l)?;
                    // victim dealt with (or gone); go again
                }
            }
        }
    }

    /// Handle a failed acquire: priority-compare against the lock's owner
    /// and abort the later of the two. `Err(Canceled)` means we lost.
    fn resolve_conflict(&self, my_slot: u32, victim_word: u64, l: &Lockable) -> Result<(), Canceled> {
        debug_assert_ne!(victim_word, OWNER_NONE);
        let v_slot = owner_slot(victim_word);
        let v_stamp = owner_stamp(victim_word);

        // The compare must read the victim's item, which is only stable
        // against slot recycling under the rob mutex. Revalidating the
        // ownership word under the same mutex rules out reading a slot
        // that is mid-reinitialization.
        let verdict = {
            let _rob = self.rob.lock().unwrap();
            if l.owner_word() != victim_word {
                Verdict::Gone
            } else if unsafe { self.item_strictly_less(my_slot, v_slot) } {
                Verdict::Win
            } else {
                Verdict::Lose
            }
        };

        match verdict {
            Verdict::Gone => Ok(()),
            Verdict::Lose => {
                let me = &self.arena[my_slot as usize];
                tracing::event!(
                    name: "context::lose_conflict",
                    tracing::Level::TRACE,
                    slot = my_slot,
                    victim = v_slot,
                );
                me.set_lost_conflict();
                me.set_state(State::AbortSelf);
                Err(Canceled)
            }
            Verdict::Win => {
                self.abort_victim(my_slot, v_slot, v_stamp);
                Ok(())
            }
        }
    }

    /// We are strictly earlier than the victim: force it out of the way,
    /// then return so the caller can retry the acquire. Holds no mutex.
    fn abort_victim(&self, my_slot: u32, v_slot: u32, v_stamp: u64) {
        let victim = &self.arena[v_slot as usize];
        loop {
            let s = victim.state();
            if victim.stamp() != v_stamp {
                // the victim incarnation already reached a terminal state
                // and the slot was recycled
                return;
            }
            match s {
                State::Committing | State::CommitDone => {
                    // a committing context is the global earliest; nothing
                    // live can outrank it
                    panic!(
                        "context {v_slot} is committing with an earlier contender {my_slot} live"
                    );
                }
                State::AbortDone => return,
                State::Scheduled | State::AbortSelf => {
                    if victim.cas_state(State::Scheduled, State::AbortSelf)
                        || victim.state() == State::AbortSelf
                    {
                        tracing::event!(
                            name: "context::signal",
                            tracing::Level::TRACE,
                            slot = my_slot,
                            victim = v_slot,
                        );
                        self.wait_out_signaled_victim(v_slot, v_stamp);
                        return;
                    }
                    // state moved under us; re-examine
                }
                State::ReadyToCommit => {
                    if victim.cas_state(State::ReadyToCommit, State::AbortHelp) {
                        victim.set_state(State::Aborting);
                        tracing::event!(
                            name: "context::abort_rtc",
                            tracing::Level::TRACE,
                            slot = my_slot,
                            victim = v_slot,
                        );
                        self.do_abort(v_slot);
                        self.stats.abort_by_other.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                }
                State::Unscheduled | State::AbortHelp | State::Aborting => {
                    // settling (someone else is already aborting it)
                    spin_hint();
                }
            }
        }
    }

    /// After signaling a victim, wait until it has aborted itself, or
    /// claim the abort ourselves if it finished executing without ever
    /// observing the signal.
    fn wait_out_signaled_victim(&self, v_slot: u32, v_stamp: u64) {
        let victim = &self.arena[v_slot as usize];
        loop {
            if victim.stamp() != v_stamp {
                return;
            }
            let s = victim.state();
            if s == State::AbortDone {
                return;
            }
            if victim.has_executed() && victim.cas_state(State::AbortSelf, State::AbortHelp) {
                victim.set_state(State::Aborting);
                tracing::event!(
                    name: "context::abort_missed_signal",
                    tracing::Level::TRACE,
                    victim = v_slot,
                );
                self.do_abort(v_slot);
                self.stats.abort_by_other.fetch_add(1, Ordering::Relaxed);
                return;
            }
            spin_hint();
        }
    }

    /// Finalize a committing context: keep its side effects, release its
    /// locks, publish its pushed items. Runs under the reorder-buffer
    /// mutex (the commit sweep is the only caller) on the sweeping worker.
    pub(crate) fn do_commit(&self, slot: u32, wid: usize) {
        let ctx = &self.arena[slot as usize];
        debug_assert_eq!(ctx.state(), State::Committing);
        let me = self.packed(slot);

        unsafe {
            // safety: the sweep won the ReadyToCommit -> Committing
            // transition, so it is the single commit performer, ordered
            // after the owner's writes by that CAS
            let pushed = ctx.user().commit();
            for l in ctx.nhood().drain(..) {
                l.release(me);
            }
            if !pushed.is_empty() {
                self.push_batch(wid, pushed);
            }
            if let Some(observer) = &self.on_commit {
                observer(ctx.item());
            }
        }

        tracing::event!(
            name: "context::commit",
            tracing::Level::TRACE,
            slot = slot,
        );
        ctx.set_state(State::CommitDone);
    }

    /// Tear down an aborting context: run its undo hooks, release its
    /// locks, hand its item back to a pending queue. Runs on whichever
    /// thread won the transition into `Aborting`; holds no mutex on entry.
    pub(crate) fn do_abort(&self, slot: u32) {
        let ctx = &self.arena[slot as usize];
        debug_assert_eq!(ctx.state(), State::Aborting);
        let me = self.packed(slot);

        let item = unsafe {
            // safety: winning the transition into Aborting makes this
            // thread the single abort performer, ordered after the owner's
            // writes by the acquiring CAS (paired with the release store
            // of `executed` in the missed-signal path). The item is cloned
            // rather than moved: the slot keeps it until the next reinit
            // so reorder-buffer comparisons stay valid for this incarnation.
            ctx.user().rollback(&RollbackHandle { me });
            for l in ctx.nhood().drain(..) {
                l.release(me);
            }
            ctx.user().reset();
            ctx.item().clone()
        };
        self.push_abort(item, ctx.owner());

        tracing::event!(
            name: "context::abort",
            tracing::Level::TRACE,
            slot = slot,
        );
        ctx.set_state(State::AbortDone);
    }
}

/// Handle passed to operator code for one iteration
///
/// Carries the iteration's identity so lock acquisitions route through the
/// conflict-resolution protocol, and fronts the per-iteration push buffer
/// and rollback hooks.
pub struct IterationHandle<'e, 'l, T: Ord> {
    pub(crate) shared: &'e ExecShared<'l, T>,
    pub(crate) slot: u32,
    pub(crate) me: u64,
}

impl<'e, 'l, T: Ord + Clone + Send + Sync> IterationHandle<'e, 'l, T> {
    /// Acquire a lockable for the rest of this iteration
    ///
    /// `Err(Canceled)` means this iteration lost a conflict and must
    /// unwind; propagate it with `?`.
    pub fn acquire(&mut self, l: &'l Lockable) -> Result<(), Canceled> {
        self.shared.acquire(self.slot, self.me, l)
    }

    /// [IterationHandle::acquire] for the lock embedded in a [LockedValue]
    pub fn acquire_value<U>(&mut self, lv: &'l LockedValue<U>) -> Result<(), Canceled> {
        self.acquire(lv.lockable())
    }

    /// Shared access to an acquired value
    ///
    /// Panics if this iteration does not hold the value's lock.
    pub fn read<'h, U>(&'h self, lv: &'l LockedValue<U>) -> ReadGuard<'h, U> {
        if lv.lockable().owner_word() != self.me {
            panic!("tried to access a value whose lock this iteration does not hold");
        }
        lv.borrow_read()
    }

    /// Exclusive access to an acquired value
    ///
    /// Panics if this iteration does not hold the value's lock.
    pub fn write<'h, U>(&'h self, lv: &'l LockedValue<U>) -> WriteGuard<'h, U> {
        if lv.lockable().owner_word() != self.me {
            panic!("tried to access a value whose lock this iteration does not hold");
        }
        lv.borrow_write()
    }

    /// Produce a new work item, published if and when this iteration commits
    pub fn push(&mut self, item: T) {
        unsafe {
            // safety: owning worker mid-execution
            self.shared.arena[self.slot as usize].user().push(item);
        }
    }

    /// Register an undo hook, run (in reverse registration order) if this
    /// iteration aborts
    ///
    /// Hooks run before the iteration's locks are released and get a
    /// [RollbackHandle] for touching the values it holds.
    pub fn defer_rollback(&mut self, hook: impl FnOnce(&RollbackHandle) + Send + 'l) {
        unsafe {
            // safety: owning worker mid-execution
            self.shared.arena[self.slot as usize]
                .user()
                .defer_rollback(Box::new(hook));
        }
    }
}

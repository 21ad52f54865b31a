//! The speculative ordered executor
//!
//! Work items execute concurrently and optimistically on a pool of worker
//! threads, while a reorder buffer makes commits observable strictly in
//! priority order. The moving parts, per worker: a pending min-heap of
//! not-yet-scheduled items behind its own mutex, and a free list of
//! recyclable context slots. Globally: the reorder buffer of live contexts
//! behind a single mutex (which also covers the free lists and all slot
//! re-initialization), and the termination-detection ring.
//!
//! Scheduling promotes the globally smallest pending item into a context
//! slot and runs the operator against it. Conflicts on [Lockable]s are
//! resolved by priority: the later iteration aborts (itself, or with help)
//! and its item returns to a pending heap. The commit sweep retires the
//! reorder buffer's head once nothing pending or live is earlier.
//!
//! [Lockable]: crate::lockable::Lockable

use std::sync::atomic::Ordering;

use crossbeam::utils::CachePadded;

use crate::lockable::MAX_SLOTS;
use crate::loom_testing::*;
use crate::termination::TerminationDetector;
use crate::util::{heap_pop, heap_push, MinHeap};

mod context;
pub use context::{Canceled, IterationHandle, RollbackHandle};
use context::{Context, State};

/// An ordered-executor algorithm, split in the two phases the runtime
/// distinguishes
///
/// `neighborhood` should acquire every lockable the iteration may touch;
/// `apply` then performs the actual work (and may discover and acquire
/// more). Both unwind with `?` on [Canceled]. The `'l` lifetime ties every
/// lockable handed to [IterationHandle::acquire] (and every rollback hook)
/// to state that outlives the whole run.
pub trait OrderedOperator<'l, T: Ord + Send>: Send + Sync {
    fn neighborhood(
        &'l self,
        item: &T,
        iter: &mut IterationHandle<'_, 'l, T>,
    ) -> Result<(), Canceled>;

    fn apply(&'l self, item: &T, iter: &mut IterationHandle<'_, 'l, T>) -> Result<(), Canceled>;
}

/// Which pending heap the scheduler drains first
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SchedulePolicy {
    /// Scan every pending heap and take the globally smallest item.
    /// Best ordering quality, more lock traffic.
    GlobalMinFirst,
    /// Take from the first non-empty heap starting at the scheduling
    /// worker's own. Cheaper, weaker ordering, more aborts on skewed
    /// workloads.
    ThreadLocalFirst,
}

/// Executor configuration
#[derive(Clone, Debug)]
pub struct ExecOptions {
    /// Number of worker threads
    pub workers: usize,
    /// Context slots preallocated per worker; bounds how much speculation
    /// can be in flight
    pub window_size: usize,
    pub policy: SchedulePolicy,
    /// Tag for this run's tracing span and summary event
    pub name: Option<String>,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            window_size: 1024,
            policy: SchedulePolicy::GlobalMinFirst,
            name: None,
        }
    }
}

/// Counters reported after a run
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Iterations scheduled (commits plus aborts)
    pub num_total: usize,
    /// Iterations committed
    pub num_committed: usize,
    /// Self-aborts from losing a lock contest
    pub abort_self_by_conflict: usize,
    /// Self-aborts from observing a signal after executing
    pub abort_self_by_signal: usize,
    /// Aborts performed on an iteration's behalf by a conflict winner
    pub abort_by_other: usize,
    /// Times the deadlock-avoidance sweep of the reorder buffer ran
    pub num_global_cleanups: usize,
}

impl RunStats {
    pub fn num_aborted(&self) -> usize {
        self.num_total - self.num_committed
    }

    pub fn abort_ratio(&self) -> f64 {
        if self.num_total == 0 {
            0.0
        } else {
            self.num_aborted() as f64 / self.num_total as f64
        }
    }
}

pub(crate) struct Stats {
    num_total: CachePadded<AtomicUsize>,
    num_committed: CachePadded<AtomicUsize>,
    abort_self_by_conflict: CachePadded<AtomicUsize>,
    abort_self_by_signal: CachePadded<AtomicUsize>,
    pub(crate) abort_by_other: CachePadded<AtomicUsize>,
    num_global_cleanups: CachePadded<AtomicUsize>,
}

impl Stats {
    fn new() -> Self {
        Self {
            num_total: CachePadded::new(AtomicUsize::new(0)),
            num_committed: CachePadded::new(AtomicUsize::new(0)),
            abort_self_by_conflict: CachePadded::new(AtomicUsize::new(0)),
            abort_self_by_signal: CachePadded::new(AtomicUsize::new(0)),
            abort_by_other: CachePadded::new(AtomicUsize::new(0)),
            num_global_cleanups: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    fn snapshot(&self) -> RunStats {
        RunStats {
            num_total: self.num_total.load(Ordering::Relaxed),
            num_committed: self.num_committed.load(Ordering::Relaxed),
            abort_self_by_conflict: self.abort_self_by_conflict.load(Ordering::Relaxed),
            abort_self_by_signal: self.abort_self_by_signal.load(Ordering::Relaxed),
            abort_by_other: self.abort_by_other.load(Ordering::Relaxed),
            num_global_cleanups: self.num_global_cleanups.load(Ordering::Relaxed),
        }
    }
}

/// Everything under the reorder-buffer mutex: the buffer itself (a
/// min-heap of slot indices, ordered by each slot's current item) and the
/// per-worker free lists. Reclaiming a slot and scheduling into one both
/// happen here, which is what makes slot recycling safe.
struct RobInner {
    heap: Vec<u32>,
    free: Vec<Vec<u32>>,
}

/// Shared state of one run, borrowed by every worker thread
pub(crate) struct ExecShared<'l, T: Ord> {
    pub(crate) arena: Vec<Context<'l, T>>,
    pub(crate) rob: CachePadded<Mutex<RobInner>>,
    pending: Vec<CachePadded<Mutex<MinHeap<T>>>>,
    pub(crate) stats: Stats,
    term: TerminationDetector,
    workers: usize,
    policy: SchedulePolicy,
    pub(crate) on_commit: Option<Box<dyn Fn(&T) + Send + Sync + 'l>>,
}

impl<'l, T: Ord + Clone + Send + Sync> ExecShared<'l, T> {
    fn new(
        workers: usize,
        window_size: usize,
        policy: SchedulePolicy,
        on_commit: Option<Box<dyn Fn(&T) + Send + Sync + 'l>>,
    ) -> Self {
        let slots = workers * window_size;
        Self {
            arena: (0..slots).map(|_| Context::new()).collect(),
            rob: CachePadded::new(Mutex::new(RobInner {
                heap: Vec::new(),
                free: (0..workers)
                    .map(|w| ((w * window_size) as u32..((w + 1) * window_size) as u32).collect())
                    .collect(),
            })),
            pending: (0..workers)
                .map(|_| CachePadded::new(Mutex::new(MinHeap::new())))
                .collect(),
            stats: Stats::new(),
            term: TerminationDetector::new(workers),
            workers,
            policy,
            on_commit,
        }
    }

    fn push_initial(&self, items: Vec<T>) {
        for (i, x) in items.into_iter().enumerate() {
            self.pending[i % self.workers].lock().unwrap().push(x);
        }
    }

    /// Publish a committed iteration's pushed items onto the committing
    /// worker's own pending heap
    pub(crate) fn push_batch(&self, wid: usize, items: Vec<T>) {
        let mut q = self.pending[wid].lock().unwrap();
        for x in items {
            q.push(x);
        }
    }

    /// Return an aborted item to a pending heap. Tree-based serialization:
    /// funneling retries toward lower worker ids dampens convoying on hot
    /// items.
    pub(crate) fn push_abort(&self, item: T, owner: u32) {
        let next = (owner / 2) as usize;
        self.pending[next].lock().unwrap().push(item);
    }

    fn pending_all_empty(&self) -> bool {
        (0..self.workers).all(|i| self.pending[i].lock().unwrap().is_empty())
    }

    fn rob_is_empty(&self) -> bool {
        self.rob.lock().unwrap().heap.is_empty()
    }

    /// No pending heap holds an item strictly earlier than `x`
    fn is_earliest(&self, x: &T) -> bool {
        for i in 0..self.workers {
            let q = self.pending[i].lock().unwrap();
            if let Some(top) = q.peek() {
                if top < x {
                    return false;
                }
            }
        }
        true
    }

    fn schedule(&self, wid: usize) -> Option<u32> {
        match self.policy {
            SchedulePolicy::GlobalMinFirst => self.schedule_global_min_first(wid),
            SchedulePolicy::ThreadLocalFirst => self.schedule_thread_local_first(wid),
        }
    }

    /// Promote the globally smallest pending item into a context slot
    fn schedule_global_min_first(&self, wid: usize) -> Option<u32> {
        let mut rob = self.rob.lock().unwrap();
        if rob.free[wid].is_empty() {
            return None;
        }

        // Scan for the smallest top, holding at most one pending-heap
        // mutex at a time (the lock order is rob mutex, then one heap).
        // The peeked key is cloned so the comparison never reaches into an
        // unlocked heap.
        let mut min_tid: Option<usize> = None;
        let mut min_key: Option<T> = None;
        for i in 0..self.workers {
            let q = self.pending[i].lock().unwrap();
            if let Some(top) = q.peek() {
                if min_key.as_ref().map_or(true, |k| top < k) {
                    min_key = Some(top.clone());
                    min_tid = Some(i);
                }
            }
        }
        let min_tid = min_tid?;

        // Re-acquire only the winner. Its top may differ from the peeked
        // key by now (an abort can push a smaller item in between); popping
        // whatever is on top is fine, the commit gate re-checks pending.
        let mut q = self.pending[min_tid].lock().unwrap();
        let item = q.pop()?;
        drop(q);

        let slot = rob.free[wid].pop().unwrap();

        self.arena[slot as usize].reinit(item, wid as u32);
        heap_push(&mut rob.heap, slot, |a, b| unsafe { self.slot_less(a, b) });
        self.stats.num_total.fetch_add(1, Ordering::Relaxed);
        tracing::event!(
            name: "executor::schedule",
            tracing::Level::TRACE,
            wid = wid,
            slot = slot,
            from_heap = min_tid,
        );
        Some(slot)
    }

    /// Promote the top of the first non-empty pending heap, scanning from
    /// the scheduling worker's own
    fn schedule_thread_local_first(&self, wid: usize) -> Option<u32> {
        let mut rob = self.rob.lock().unwrap();
        if rob.free[wid].is_empty() {
            return None;
        }

        for i in wid..wid + self.workers {
            let tid = i % self.workers;
            let mut q = self.pending[tid].lock().unwrap();
            let Some(item) = q.pop() else { continue };
            drop(q);

            let slot = rob.free[wid].pop().unwrap();
            self.arena[slot as usize].reinit(item, wid as u32);
            heap_push(&mut rob.heap, slot, |a, b| unsafe { self.slot_less(a, b) });
            self.stats.num_total.fetch_add(1, Ordering::Relaxed);
            tracing::event!(
                name: "executor::schedule",
                tracing::Level::TRACE,
                wid = wid,
                slot = slot,
                from_heap = tid,
            );
            return Some(slot);
        }
        None
    }

    /// The commit sweep: retire the reorder buffer's head for as long as
    /// it is either already aborted, or ready to commit and not outranked
    /// by anything pending
    fn clear_rob(&self, wid: usize) -> bool {
        let mut did_work = false;
        let mut rob = self.rob.lock().unwrap();
        loop {
            let Some(&head) = rob.heap.first() else { break };
            match self.arena[head as usize].state() {
                State::AbortDone => {
                    let popped =
                        heap_pop(&mut rob.heap, |a, b| unsafe { self.slot_less(a, b) }).unwrap();
                    debug_assert_eq!(popped, head);
                    Self::reclaim(&self.arena, &mut rob, head);
                    did_work = true;
                }
                State::ReadyToCommit => {
                    // safety: item read under the rob mutex
                    if !self.is_earliest(unsafe { self.arena[head as usize].item() }) {
                        break;
                    }
                    if !self.arena[head as usize].cas_state(State::ReadyToCommit, State::Committing)
                    {
                        // only an abort-helper can move a context out of
                        // ReadyToCommit, and helpers outrank their victims,
                        // so the buffer's earliest entry has no such peer
                        panic!("reorder buffer head was aborted while eligible to commit");
                    }
                    self.do_commit(head, wid);
                    let popped =
                        heap_pop(&mut rob.heap, |a, b| unsafe { self.slot_less(a, b) }).unwrap();
                    debug_assert_eq!(popped, head);
                    Self::reclaim(&self.arena, &mut rob, head);
                    self.stats.num_committed.fetch_add(1, Ordering::Relaxed);
                    did_work = true;
                }
                _ => break,
            }
        }

        if !rob.heap.is_empty() && rob.free.iter().all(|f| f.is_empty()) {
            // nobody can schedule and the head is not retirable: pull
            // aborted entries out of the middle of the buffer
            self.reclaim_globally(&mut rob);
        }

        did_work
    }

    /// Give a terminal slot back to the free list of the worker that
    /// scheduled it. Caller holds the rob mutex.
    fn reclaim(arena: &[Context<'l, T>], rob: &mut RobInner, slot: u32) {
        let owner = arena[slot as usize].owner() as usize;
        rob.free[owner].push(slot);
    }

    /// Live-lock breaker: an `AbortDone` entry that is not the buffer's
    /// minimum is never popped by the sweep, and with every free list
    /// empty nothing can be scheduled to move it. Drain the whole buffer,
    /// reclaim the aborted entries, rebuild the rest.
    fn reclaim_globally(&self, rob: &mut RobInner) {
        self.stats.num_global_cleanups.fetch_add(1, Ordering::Relaxed);
        tracing::event!(
            name: "executor::global_cleanup",
            tracing::Level::DEBUG,
            live = rob.heap.len(),
        );

        let drained = std::mem::take(&mut rob.heap);
        let mut keep = Vec::with_capacity(drained.len());
        for slot in drained {
            if self.arena[slot as usize].state() == State::AbortDone {
                Self::reclaim(&self.arena, rob, slot);
            } else {
                keep.push(slot);
            }
        }
        for slot in keep {
            heap_push(&mut rob.heap, slot, |a, b| unsafe { self.slot_less(a, b) });
        }
    }

    /// Run the operator for a freshly scheduled context and drive the
    /// post-execution state transition
    fn run_iteration<A: OrderedOperator<'l, T>>(&self, slot: u32, operator: &'l A) {
        let ctx = &self.arena[slot as usize];
        let me = self.packed(slot);
        let mut iter = IterationHandle {
            shared: self,
            slot,
            me,
        };
        // safety: we are the owning worker, mid-incarnation
        let item = unsafe { ctx.item() };

        let mut outcome = operator.neighborhood(item, &mut iter);
        if outcome.is_ok() && ctx.state() == State::Scheduled {
            outcome = operator.apply(item, &mut iter);
        }
        if outcome.is_err() {
            // an operator bailing out for its own reasons still goes
            // through the abort path; losing a conflict already stored
            // AbortSelf so this is a no-op then
            ctx.cas_state(State::Scheduled, State::AbortSelf);
        }

        // Published before either transition below: the moment the context
        // reaches a terminal state it may be reclaimed and recycled, and a
        // late store here would corrupt the slot's next incarnation. A
        // signaler that sees `executed` may now claim the abort; the CAS
        // arbitrates so exactly one side performs it.
        ctx.mark_executed();

        if !ctx.cas_state(State::Scheduled, State::ReadyToCommit) {
            if ctx.cas_state(State::AbortSelf, State::Aborting) {
                if ctx.lost_conflict() {
                    self.stats
                        .abort_self_by_conflict
                        .fetch_add(1, Ordering::Relaxed);
                } else {
                    self.stats
                        .abort_self_by_signal
                        .fetch_add(1, Ordering::Relaxed);
                }
                self.do_abort(slot);
            }
        }
    }

    fn quiescent(&self) -> bool {
        self.rob_is_empty() && self.pending_all_empty()
    }

    fn worker_loop<A: OrderedOperator<'l, T>>(&self, wid: usize, operator: &'l A) {
        loop {
            let mut did_work = false;
            loop {
                if let Some(slot) = self.schedule(wid) {
                    did_work = true;
                    self.run_iteration(slot, operator);
                }
                if self.clear_rob(wid) {
                    did_work = true;
                }
                if self.quiescent() {
                    break;
                }
            }
            self.term.local_termination(wid, did_work);
            if self.term.global_termination() {
                break;
            }
        }
    }
}

/// Execute `items` with `operator`, committing in priority order
///
/// Returns once every initial and pushed item has committed exactly once.
pub fn run_ordered<'l, T, A>(items: Vec<T>, operator: &'l A, options: &ExecOptions) -> RunStats
where
    T: Ord + Clone + Send + Sync,
    A: OrderedOperator<'l, T>,
{
    run_ordered_inner(items, operator, options, None)
}

/// [run_ordered] with a commit observer, called once per committed item,
/// in commit order, from inside the commit sweep
pub fn run_ordered_observed<'l, T, A>(
    items: Vec<T>,
    operator: &'l A,
    options: &ExecOptions,
    on_commit: impl Fn(&T) + Send + Sync + 'l,
) -> RunStats
where
    T: Ord + Clone + Send + Sync,
    A: OrderedOperator<'l, T>,
{
    run_ordered_inner(items, operator, options, Some(Box::new(on_commit)))
}

fn run_ordered_inner<'l, T, A>(
    items: Vec<T>,
    operator: &'l A,
    options: &ExecOptions,
    on_commit: Option<Box<dyn Fn(&T) + Send + Sync + 'l>>,
) -> RunStats
where
    T: Ord + Clone + Send + Sync,
    A: OrderedOperator<'l, T>,
{
    let workers = options.workers.max(1);
    let window_size = options.window_size.max(1);
    assert!(
        workers * window_size <= MAX_SLOTS,
        "workers * window_size must not exceed {MAX_SLOTS}"
    );

    let run_span = tracing::span!(
        tracing::Level::DEBUG,
        "ordered_run",
        loopname = options.name.as_deref().unwrap_or("<unnamed>"),
        workers = workers,
    );
    let _span_enter = run_span.enter();

    let shared: ExecShared<'l, T> = ExecShared::new(workers, window_size, options.policy, on_commit);
    shared.push_initial(items);

    std::thread::scope(|s| {
        let shared = &shared;
        for wid in 0..workers {
            s.spawn(move || shared.worker_loop(wid, operator));
        }
    });

    // the run only terminates quiescent; anything else is a runtime bug
    assert!(shared.rob_is_empty());
    assert!(shared.pending_all_empty());
    {
        let rob = shared.rob.lock().unwrap();
        let free_total: usize = rob.free.iter().map(|f| f.len()).sum();
        assert_eq!(free_total, workers * window_size);
    }

    let stats = shared.stats.snapshot();
    tracing::event!(
        name: "executor::run_done",
        tracing::Level::DEBUG,
        num_total = stats.num_total,
        num_committed = stats.num_committed,
        abort_ratio = stats.abort_ratio(),
        num_global_cleanups = stats.num_global_cleanups,
    );
    stats
}

#[cfg(test)]
mod tests;

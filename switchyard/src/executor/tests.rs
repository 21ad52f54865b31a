use super::*;

use std::sync::atomic::AtomicUsize as StdAtomicUsize;
use std::sync::Mutex as StdMutex;

use rand::{Rng, SeedableRng};

use crate::lockable::LockedValue;

fn small_opts(workers: usize) -> ExecOptions {
    ExecOptions {
        workers,
        window_size: 4,
        policy: SchedulePolicy::GlobalMinFirst,
        name: None,
    }
}

/// Every run must satisfy: aborts are classified exhaustively
fn assert_stats_consistent(stats: &RunStats) {
    assert_eq!(
        stats.num_aborted(),
        stats.abort_self_by_conflict + stats.abort_self_by_signal + stats.abort_by_other,
    );
}

struct Noop;
impl<'l, T: Ord + Clone + Send + Sync> OrderedOperator<'l, T> for Noop {
    fn neighborhood(
        &'l self,
        _item: &T,
        _iter: &mut IterationHandle<'_, 'l, T>,
    ) -> Result<(), Canceled> {
        Ok(())
    }

    fn apply(&'l self, _item: &T, _iter: &mut IterationHandle<'_, 'l, T>) -> Result<(), Canceled> {
        Ok(())
    }
}

#[test]
fn rollback_hooks_run_in_reverse_order() {
    let log = StdMutex::new(Vec::new());
    let mut user: context::UserContext<'_, u32> = context::UserContext::new();
    user.defer_rollback(Box::new(|_| log.lock().unwrap().push(1)));
    user.defer_rollback(Box::new(|_| log.lock().unwrap().push(2)));
    user.push(99);
    user.rollback(&RollbackHandle { me: 0 });
    assert_eq!(*log.lock().unwrap(), vec![2, 1]);
    // the push buffer went with it
    assert!(user.commit().is_empty());
}

#[cfg(not(loom))]
#[test]
fn empty_input_terminates_immediately() {
    let stats = run_ordered(Vec::<u32>::new(), &Noop, &small_opts(2));
    assert_eq!(stats.num_total, 0);
    assert_eq!(stats.num_committed, 0);
    assert_stats_consistent(&stats);

    let stats = run_ordered(Vec::<u32>::new(), &Noop, &small_opts(4));
    assert_eq!(stats.num_total, 0);
    assert_eq!(stats.num_committed, 0);
}

#[cfg(not(loom))]
#[test]
fn single_item_commits_once() {
    let stats = run_ordered(vec![7u32], &Noop, &small_opts(2));
    assert_eq!(stats.num_total, 1);
    assert_eq!(stats.num_committed, 1);
    assert_eq!(stats.num_aborted(), 0);
    assert_stats_consistent(&stats);
}

struct DisjointLocks {
    cells: Vec<LockedValue<u64>>,
}
impl<'l> OrderedOperator<'l, u32> for DisjointLocks {
    fn neighborhood(
        &'l self,
        item: &u32,
        iter: &mut IterationHandle<'_, 'l, u32>,
    ) -> Result<(), Canceled> {
        iter.acquire_value(&self.cells[*item as usize])
    }

    fn apply(&'l self, item: &u32, iter: &mut IterationHandle<'_, 'l, u32>) -> Result<(), Canceled> {
        *iter.write(&self.cells[*item as usize]) += 1;
        // disjoint lock sets never conflict, so this hook must never fire
        let cell = &self.cells[*item as usize];
        iter.defer_rollback(move |rb| {
            *rb.write(cell) -= 1;
        });
        Ok(())
    }
}

#[cfg(not(loom))]
#[test]
fn independent_items_never_abort() {
    const N: usize = 16;
    let op = DisjointLocks {
        cells: (0..N).map(|_| LockedValue::new(0)).collect(),
    };
    let order = StdMutex::new(Vec::new());
    let stats = run_ordered_observed(
        (0..N as u32).rev().collect(),
        &op,
        &small_opts(4),
        |x: &u32| order.lock().unwrap().push(*x),
    );

    assert_eq!(stats.num_total, N);
    assert_eq!(stats.num_committed, N);
    assert_eq!(stats.num_aborted(), 0);
    assert_stats_consistent(&stats);

    // commits observed in priority order
    let order = order.into_inner().unwrap();
    assert_eq!(order, (0..N as u32).collect::<Vec<_>>());

    // no lock left owned, every increment survived
    for cell in &op.cells {
        assert!(!cell.lockable().is_owned());
    }
    assert!(op.cells.into_iter().all(|c| c.into_inner() == 1));
}

struct OneSharedCounter {
    counter: LockedValue<u64>,
}
impl<'l> OrderedOperator<'l, u32> for OneSharedCounter {
    fn neighborhood(
        &'l self,
        _item: &u32,
        iter: &mut IterationHandle<'_, 'l, u32>,
    ) -> Result<(), Canceled> {
        iter.acquire_value(&self.counter)
    }

    fn apply(&'l self, _item: &u32, iter: &mut IterationHandle<'_, 'l, u32>) -> Result<(), Canceled> {
        *iter.write(&self.counter) += 1;
        let counter = &self.counter;
        iter.defer_rollback(move |rb| {
            *rb.write(counter) -= 1;
        });
        Ok(())
    }
}

#[cfg(not(loom))]
#[test]
fn two_items_one_lock() {
    let op = OneSharedCounter {
        counter: LockedValue::new(0),
    };
    let order = StdMutex::new(Vec::new());
    let stats = run_ordered_observed(vec![2u32, 1], &op, &small_opts(2), |x: &u32| {
        order.lock().unwrap().push(*x)
    });

    assert_eq!(stats.num_committed, 2);
    assert_stats_consistent(&stats);
    assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    assert!(!op.counter.lockable().is_owned());
    assert_eq!(op.counter.into_inner(), 2);
}

#[cfg(not(loom))]
#[test]
fn cascading_aborts_still_commit_in_order() {
    const K: u32 = 24;
    let op = OneSharedCounter {
        counter: LockedValue::new(0),
    };
    let order = StdMutex::new(Vec::new());
    // arrive in reverse priority order to maximize mis-speculation
    let stats = run_ordered_observed((1..=K).rev().collect(), &op, &small_opts(4), |x: &u32| {
        order.lock().unwrap().push(*x)
    });

    assert_eq!(stats.num_committed, K as usize);
    assert!(stats.num_total >= K as usize);
    assert_stats_consistent(&stats);
    assert_eq!(*order.lock().unwrap(), (1..=K).collect::<Vec<_>>());
    assert_eq!(op.counter.into_inner(), K as u64);
}

struct Producer {
    counter: LockedValue<u64>,
}
impl<'l> OrderedOperator<'l, u32> for Producer {
    fn neighborhood(
        &'l self,
        _item: &u32,
        iter: &mut IterationHandle<'_, 'l, u32>,
    ) -> Result<(), Canceled> {
        iter.acquire_value(&self.counter)
    }

    fn apply(&'l self, item: &u32, iter: &mut IterationHandle<'_, 'l, u32>) -> Result<(), Canceled> {
        if *item == 1 {
            iter.push(3);
        }
        *iter.write(&self.counter) += 1;
        let counter = &self.counter;
        iter.defer_rollback(move |rb| {
            *rb.write(counter) -= 1;
        });
        Ok(())
    }
}

#[cfg(not(loom))]
#[test]
fn producer_item_publishes_on_commit_only() {
    let op = Producer {
        counter: LockedValue::new(0),
    };
    let order = StdMutex::new(Vec::new());
    let stats = run_ordered_observed(vec![1u32], &op, &small_opts(2), |x: &u32| {
        order.lock().unwrap().push(*x)
    });

    // the produced item was scheduled and committed exactly once, even if
    // the producing iteration itself had aborted attempts along the way
    assert_eq!(stats.num_committed, 2);
    assert_stats_consistent(&stats);
    assert_eq!(*order.lock().unwrap(), vec![1, 3]);
    assert_eq!(op.counter.into_inner(), 2);
}

#[cfg(not(loom))]
#[test]
fn duplicate_priorities_commit_as_a_multiset() {
    let op = OneSharedCounter {
        counter: LockedValue::new(0),
    };
    let items = vec![5u32, 3, 5, 3, 5, 1];
    let order = StdMutex::new(Vec::new());
    let stats = run_ordered_observed(items.clone(), &op, &small_opts(3), |x: &u32| {
        order.lock().unwrap().push(*x)
    });

    assert_eq!(stats.num_committed, items.len());
    assert_stats_consistent(&stats);
    let order = order.into_inner().unwrap();
    let mut sorted_input = items;
    sorted_input.sort();
    // ties commit in some consistent order; the sequence as a whole must
    // still be non-decreasing and the multisets must match
    assert_eq!(order, sorted_input);
    assert_eq!(op.counter.into_inner(), 6);
}

/// Pick a small pseudo-random lock set for an item, deterministically
fn lock_set(item: u32, pool: usize) -> Vec<usize> {
    let mut h = item.wrapping_mul(2654435761) as u64 + 1;
    let n = 1 + (h % 3) as usize;
    let mut set = Vec::with_capacity(n);
    for _ in 0..n {
        h ^= h << 13;
        h ^= h >> 7;
        h ^= h << 17;
        set.push((h % pool as u64) as usize);
    }
    set
}

struct RandomNeighborhoods {
    pool: Vec<LockedValue<u64>>,
}
impl<'l> OrderedOperator<'l, u32> for RandomNeighborhoods {
    fn neighborhood(
        &'l self,
        item: &u32,
        iter: &mut IterationHandle<'_, 'l, u32>,
    ) -> Result<(), Canceled> {
        for i in lock_set(*item, self.pool.len()) {
            iter.acquire_value(&self.pool[i])?;
        }
        Ok(())
    }

    fn apply(&'l self, item: &u32, iter: &mut IterationHandle<'_, 'l, u32>) -> Result<(), Canceled> {
        let idxs = lock_set(*item, self.pool.len());
        for &i in &idxs {
            *iter.write(&self.pool[i]) += 1;
        }
        let pool = &self.pool;
        iter.defer_rollback(move |rb| {
            for &i in &idxs {
                *rb.write(&pool[i]) -= 1;
            }
        });
        Ok(())
    }
}

#[cfg(not(loom))]
fn stress_run(policy: SchedulePolicy, workers: usize, window_size: usize, seed: u64) {
    const N: u32 = 400;
    const POOL: usize = 12;

    let mut rng = rand_xorshift::XorShiftRng::seed_from_u64(seed);
    let mut items: Vec<u32> = (0..N).collect();
    // shuffle arrival order
    for i in (1..items.len()).rev() {
        let j = rng.gen_range(0..=i);
        items.swap(i, j);
    }

    let op = RandomNeighborhoods {
        pool: (0..POOL).map(|_| LockedValue::new(0)).collect(),
    };
    let order = StdMutex::new(Vec::new());
    let stats = run_ordered_observed(
        items,
        &op,
        &ExecOptions {
            workers,
            window_size,
            policy,
            name: Some(format!("stress-{seed}")),
        },
        |x: &u32| order.lock().unwrap().push(*x),
    );

    assert_eq!(stats.num_committed, N as usize);
    assert!(stats.num_total >= N as usize);
    assert_stats_consistent(&stats);

    // external ordering holds regardless of scheduling policy
    let order = order.into_inner().unwrap();
    assert_eq!(order, (0..N).collect::<Vec<_>>());

    // all locks released, all speculative effects either committed or undone
    let expected: u64 = (0..N).map(|x| lock_set(x, POOL).len() as u64).sum();
    let mut total = 0;
    for cell in op.pool {
        assert!(!cell.lockable().is_owned());
        total += cell.into_inner();
    }
    assert_eq!(total, expected);
}

#[cfg(not(loom))]
#[test]
fn stress_global_min_first() {
    stress_run(SchedulePolicy::GlobalMinFirst, 4, 8, 0);
}

#[cfg(not(loom))]
#[test]
fn stress_thread_local_first() {
    stress_run(SchedulePolicy::ThreadLocalFirst, 4, 8, 1);
}

#[cfg(not(loom))]
#[test]
fn stress_tiny_window_forces_cleanups() {
    // window of 1 slot per worker starves the free lists under contention,
    // exercising the global-reclaim fallback path
    stress_run(SchedulePolicy::GlobalMinFirst, 4, 1, 2);
}

#[cfg(not(loom))]
#[test]
fn stress_single_worker_is_sequential() {
    let calls = StdAtomicUsize::new(0);
    struct CountingNoop<'c>(&'c StdAtomicUsize);
    impl<'l, 'c> OrderedOperator<'l, u32> for CountingNoop<'c> {
        fn neighborhood(
            &'l self,
            _item: &u32,
            _iter: &mut IterationHandle<'_, 'l, u32>,
        ) -> Result<(), Canceled> {
            Ok(())
        }
        fn apply(
            &'l self,
            _item: &u32,
            _iter: &mut IterationHandle<'_, 'l, u32>,
        ) -> Result<(), Canceled> {
            self.0.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            Ok(())
        }
    }

    let op = CountingNoop(&calls);
    let stats = run_ordered(
        (0..50u32).rev().collect(),
        &op,
        &ExecOptions {
            workers: 1,
            window_size: 4,
            policy: SchedulePolicy::GlobalMinFirst,
            name: None,
        },
    );
    // one worker cannot conflict with itself
    assert_eq!(stats.num_total, 50);
    assert_eq!(stats.num_committed, 50);
    assert_eq!(stats.num_aborted(), 0);
    assert_eq!(calls.load(std::sync::atomic::Ordering::Relaxed), 50);
}

//! Switchyard: a speculative ordered parallel runtime
//!
//! Executes a stream of prioritized work items concurrently on a pool of
//! worker threads while preserving, externally, the illusion that items
//! commit in strict priority order. Aimed at amorphous data-parallel
//! workloads (event simulations, priority-driven graph kernels) where the
//! dependency structure is only discovered at runtime, as the set of
//! [Lockable] resources each iteration happens to touch.
//!
//! Iterations run optimistically; conflicts on lockables are resolved by
//! priority (the later iteration aborts and retries), and a reorder buffer
//! gates commits so that no iteration's effects become visible before
//! every earlier item has committed.
//!
//! ```
//! use switchyard::{for_each_ordered, Canceled, IterationHandle, LockedValue, OrderedOperator};
//!
//! struct AppendInOrder {
//!     acc: LockedValue<Vec<u32>>,
//! }
//! impl<'l> OrderedOperator<'l, u32> for AppendInOrder {
//!     fn neighborhood(
//!         &'l self,
//!         _item: &u32,
//!         iter: &mut IterationHandle<'_, 'l, u32>,
//!     ) -> Result<(), Canceled> {
//!         iter.acquire_value(&self.acc)
//!     }
//!     fn apply(&'l self, item: &u32, iter: &mut IterationHandle<'_, 'l, u32>) -> Result<(), Canceled> {
//!         iter.write(&self.acc).push(*item);
//!         let acc = &self.acc;
//!         iter.defer_rollback(move |rb| {
//!             let _ = rb.write(acc).pop();
//!         });
//!         Ok(())
//!     }
//! }
//!
//! let op = AppendInOrder { acc: LockedValue::new(Vec::new()) };
//! let stats = for_each_ordered(vec![3u32, 1, 2], &op);
//! assert_eq!(stats.num_committed, 3);
//! ```

pub mod executor;
pub mod lockable;
pub mod loom_testing;
pub mod termination;
pub mod util;

pub use executor::{
    run_ordered, run_ordered_observed, Canceled, ExecOptions, IterationHandle, OrderedOperator,
    RollbackHandle, RunStats, SchedulePolicy,
};
pub use lockable::{AcquireStatus, Lockable, LockedValue};

/// [run_ordered] with default options
pub fn for_each_ordered<'l, T, A>(items: Vec<T>, operator: &'l A) -> RunStats
where
    T: Ord + Clone + Send + Sync,
    A: OrderedOperator<'l, T>,
{
    run_ordered(items, operator, &ExecOptions::default())
}

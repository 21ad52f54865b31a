//! Dijkstra-style two-pass ring termination detection
//!
//! Each worker stains itself black whenever it did work. A token circulates
//! the ring; the master (worker 0) declares global termination only after
//! two consecutive all-white passes, which closes the race where a worker
//! goes idle and is then handed new work from behind the token.

use std::sync::atomic::Ordering;

use crossbeam::utils::CachePadded;

use crate::loom_testing::*;

struct TokenHolder {
    has_token: AtomicBool,
    token_is_black: AtomicBool,
    process_is_black: AtomicBool,
    /// only meaningful on the master
    last_was_white: AtomicBool,
}

pub struct TerminationDetector {
    holders: Vec<CachePadded<TokenHolder>>,
    global_term: AtomicBool,
}

impl TerminationDetector {
    pub fn new(workers: usize) -> Self {
        assert!(workers > 0);
        Self {
            holders: (0..workers)
                .map(|wid| {
                    CachePadded::new(TokenHolder {
                        // master starts with the token
                        has_token: AtomicBool::new(wid == 0),
                        token_is_black: AtomicBool::new(false),
                        // everybody starts black so the very first pass
                        // cannot succeed before any work is even attempted
                        process_is_black: AtomicBool::new(true),
                        last_was_white: AtomicBool::new(true),
                    })
                })
                .collect(),
            global_term: AtomicBool::new(false),
        }
    }

    fn prop_token(&self, from: usize, is_black: bool) {
        let next = &self.holders[(from + 1) % self.holders.len()];
        next.token_is_black.store(is_black, Ordering::Relaxed);
        next.has_token.store(true, Ordering::Release);
    }

    /// One round of local termination bookkeeping for worker `wid`
    pub fn local_termination(&self, wid: usize, work_happened: bool) {
        debug_assert!(!(work_happened && self.global_termination()));
        let th = &self.holders[wid];
        if work_happened {
            th.process_is_black.store(true, Ordering::Relaxed);
        }
        if !th.has_token.load(Ordering::Acquire) {
            return;
        }

        let process_black = th.process_is_black.load(Ordering::Relaxed);
        let token_black = th.token_is_black.load(Ordering::Relaxed);
        if wid == 0 {
            let failed = token_black || process_black;
            th.token_is_black.store(false, Ordering::Relaxed);
            th.process_is_black.store(false, Ordering::Relaxed);
            if th.last_was_white.load(Ordering::Relaxed) && !failed {
                // second clean pass in a row
                tracing::event!(
                    name: "termination::global",
                    tracing::Level::DEBUG,
                    "global termination detected"
                );
                self.global_term.store(true, Ordering::Release);
                return;
            }
            th.last_was_white.store(!failed, Ordering::Relaxed);
            // recirculate a clean token
            th.has_token.store(false, Ordering::Relaxed);
            self.prop_token(wid, false);
        } else {
            let taint = process_black || token_black;
            th.process_is_black.store(false, Ordering::Relaxed);
            th.token_is_black.store(false, Ordering::Relaxed);
            th.has_token.store(false, Ordering::Relaxed);
            self.prop_token(wid, taint);
        }
    }

    /// Whether the master has published global termination
    pub fn global_termination(&self) -> bool {
        self.global_term.load(Ordering::Acquire)
    }
}

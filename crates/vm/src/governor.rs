//! Execution governor: the cooperative resource caps every frame step
//! checks against (§4.9, §5 Concurrency & Resource Model). A single
//! `Governor` is shared by every frame of one `run`/`run_with_*` call;
//! a fresh one is installed per top-level call so limits don't leak
//! across unrelated host calls into the same interpreter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Why a governor check failed — surfaces as the matching builtin
/// exception at the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GovernorTrip {
    Deadline,
    Cancelled,
    RecursionDepth,
    MemoryBudget,
    CollectionSize,
}

pub struct Governor {
    tick: u64,
    check_interval: u64,
    deadline: Option<Instant>,
    /// Settable from a different host thread while the interpreter runs
    /// single-threaded on its own — the one place this VM uses shared
    /// cross-thread state (§4.7 `run_with_cancellation`).
    cancelled: Arc<AtomicBool>,
    max_recursion_depth: usize,
    recursion_depth: usize,
    max_memory_bytes: Option<u64>,
    bytes_used: u64,
    max_collection_size: Option<usize>,
}

impl Default for Governor {
    fn default() -> Self {
        Governor {
            tick: 0,
            check_interval: 1000,
            deadline: None,
            cancelled: Arc::new(AtomicBool::new(false)),
            max_recursion_depth: 1000,
            recursion_depth: 0,
            max_memory_bytes: None,
            bytes_used: 0,
            max_collection_size: None,
        }
    }
}

impl Governor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancellation_handle(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    pub fn set_cancellation_handle(&mut self, handle: Arc<AtomicBool>) {
        self.cancelled = handle;
    }

    pub fn set_deadline(&mut self, d: Duration) {
        self.deadline = Some(Instant::now() + d);
    }

    pub fn set_check_interval(&mut self, n: u64) {
        self.check_interval = n.max(1);
    }

    pub fn set_max_recursion_depth(&mut self, n: usize) {
        self.max_recursion_depth = n;
    }

    pub fn set_max_memory_bytes(&mut self, n: Option<u64>) {
        self.max_memory_bytes = n;
    }

    pub fn set_max_collection_size(&mut self, n: Option<usize>) {
        self.max_collection_size = n;
    }

    /// Called once per compiled instruction; amortized so a deadline check
    /// (a syscall) doesn't run on every bytecode dispatch.
    pub fn tick(&mut self) -> Result<(), GovernorTrip> {
        self.tick += 1;
        if self.cancelled.load(Ordering::Relaxed) {
            return Err(GovernorTrip::Cancelled);
        }
        if self.tick % self.check_interval == 0 {
            if let Some(deadline) = self.deadline {
                if Instant::now() >= deadline {
                    return Err(GovernorTrip::Deadline);
                }
            }
        }
        Ok(())
    }

    pub fn enter_call(&mut self) -> Result<(), GovernorTrip> {
        self.recursion_depth += 1;
        if self.recursion_depth > self.max_recursion_depth {
            self.recursion_depth -= 1;
            return Err(GovernorTrip::RecursionDepth);
        }
        Ok(())
    }

    pub fn exit_call(&mut self) {
        self.recursion_depth = self.recursion_depth.saturating_sub(1);
    }

    pub fn charge_bytes(&mut self, n: u64) -> Result<(), GovernorTrip> {
        self.bytes_used += n;
        if let Some(max) = self.max_memory_bytes {
            if self.bytes_used > max {
                return Err(GovernorTrip::MemoryBudget);
            }
        }
        Ok(())
    }

    pub fn check_collection_size(&self, size: usize) -> Result<(), GovernorTrip> {
        if let Some(max) = self.max_collection_size {
            if size > max {
                return Err(GovernorTrip::CollectionSize);
            }
        }
        Ok(())
    }

    /// Clears the per-run transient state (tick count, deadline,
    /// cancellation flag, recursion depth, bytes charged) at the start of
    /// a fresh `run`/`run_with_*` call, while keeping the caps a host
    /// configured via `set_max_*`/env vars — those are interpreter-wide,
    /// not per-run.
    pub fn reset_for_run(&mut self) {
        self.tick = 0;
        self.deadline = None;
        self.cancelled = Arc::new(AtomicBool::new(false));
        self.recursion_depth = 0;
        self.bytes_used = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recursion_depth_trips_past_the_configured_max() {
        let mut g = Governor::new();
        g.set_max_recursion_depth(2);
        assert!(g.enter_call().is_ok());
        assert!(g.enter_call().is_ok());
        assert_eq!(g.enter_call(), Err(GovernorTrip::RecursionDepth));
        // A failed enter_call must not leave the depth counter bumped, so
        // a caller that catches the exception and keeps running doesn't
        // stay permanently wedged one level too deep.
        g.exit_call();
        assert!(g.enter_call().is_ok());
    }

    #[test]
    fn memory_budget_trips_once_bytes_used_exceeds_the_cap() {
        let mut g = Governor::new();
        g.set_max_memory_bytes(Some(100));
        assert!(g.charge_bytes(60).is_ok());
        assert_eq!(g.charge_bytes(60), Err(GovernorTrip::MemoryBudget));
    }

    #[test]
    fn collection_size_check_is_a_readonly_threshold() {
        let mut g = Governor::new();
        g.set_max_collection_size(Some(10));
        assert!(g.check_collection_size(10).is_ok());
        assert_eq!(g.check_collection_size(11), Err(GovernorTrip::CollectionSize));
    }

    #[test]
    fn cancellation_flag_trips_on_the_next_tick() {
        let mut g = Governor::new();
        let handle = g.cancellation_handle();
        assert!(g.tick().is_ok());
        handle.store(true, Ordering::Relaxed);
        assert_eq!(g.tick(), Err(GovernorTrip::Cancelled));
    }

    #[test]
    fn reset_for_run_clears_transient_state_but_keeps_configured_caps() {
        let mut g = Governor::new();
        g.set_max_recursion_depth(3);
        g.set_max_memory_bytes(Some(50));
        g.enter_call().unwrap();
        g.charge_bytes(20).unwrap();
        g.set_cancellation_handle(Arc::new(AtomicBool::new(true)));

        g.reset_for_run();

        assert!(g.charge_bytes(40).is_ok());
        assert_eq!(g.charge_bytes(40), Err(GovernorTrip::MemoryBudget));
        for _ in 0..3 {
            assert!(g.enter_call().is_ok());
        }
        assert_eq!(g.enter_call(), Err(GovernorTrip::RecursionDepth));
        assert!(g.tick().is_ok());
    }
}

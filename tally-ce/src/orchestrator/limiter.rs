//! Per-organization and global in-flight limits
//!
//! One limiter is constructed per orchestrator and shared by reference.
//! Admission hands out an [`InFlightPermit`]; dropping the permit releases
//! both counters, so every exit path (success, error, early return, panic
//! unwinding) gives its slot back.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct LimiterState {
    per_org: HashMap<String, usize>,
    global: usize,
}

/// Admission control for batch work
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    org_limit: usize,
    global_limit: usize,
    state: Mutex<LimiterState>,
}

/// Scoped admission token; releases on drop
#[derive(Debug)]
pub struct InFlightPermit {
    limiter: Arc<ConcurrencyLimiter>,
    org_id: String,
}

impl InFlightPermit {
    pub fn org_id(&self) -> &str {
        &self.org_id
    }
}

impl Drop for InFlightPermit {
    fn drop(&mut self) {
        self.limiter.release_slot(&self.org_id);
    }
}

impl ConcurrencyLimiter {
    /// Limits below 1 are raised to 1 so work can always make progress
    pub fn new(org_limit: usize, global_limit: usize) -> Arc<Self> {
        Arc::new(Self {
            org_limit: org_limit.max(1),
            global_limit: global_limit.max(1),
            state: Mutex::new(LimiterState::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, LimiterState> {
        // Counters stay consistent even if a holder panicked
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Admit one unit of work for `org_id` if both limits allow it
    pub fn try_acquire(self: &Arc<Self>, org_id: &str) -> Option<InFlightPermit> {
        let mut state = self.lock();
        if state.global >= self.global_limit {
            return None;
        }
        let org_count = state.per_org.get(org_id).copied().unwrap_or(0);
        if org_count >= self.org_limit {
            return None;
        }
        state.per_org.insert(org_id.to_string(), org_count + 1);
        state.global += 1;
        drop(state);

        Some(InFlightPermit {
            limiter: Arc::clone(self),
            org_id: org_id.to_string(),
        })
    }

    /// Explicit release; equivalent to dropping the permit
    pub fn release(&self, permit: InFlightPermit) {
        drop(permit);
    }

    fn release_slot(&self, org_id: &str) {
        let mut state = self.lock();
        if let Some(count) = state.per_org.get_mut(org_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.per_org.remove(org_id);
            }
        }
        state.global = state.global.saturating_sub(1);
    }

    pub fn in_flight(&self, org_id: &str) -> usize {
        self.lock().per_org.get(org_id).copied().unwrap_or(0)
    }

    pub fn global_in_flight(&self) -> usize {
        self.lock().global
    }

    pub fn org_limit(&self) -> usize {
        self.org_limit
    }

    pub fn global_limit(&self) -> usize {
        self.global_limit
    }
}

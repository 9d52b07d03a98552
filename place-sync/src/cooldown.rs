//! Per-identity placement cooldown.
//!
//! One table maps an identity to the time of its last accepted placement.
//! The table sits behind a single mutex: the check and the update are one
//! O(1) critical section, so simultaneous requests from the same identity
//! serialize and at most one of them is accepted per window.
//!
//! Identities are whatever the connection layer supplies (normally the
//! client IP). Clients behind one address share a cooldown, and a client
//! that changes address gets a fresh one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Default time between two accepted placements of one identity.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(10);

/// Outcome of [`AdmissionController::check_and_record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    /// Whole seconds until the identity may place again, rounded up.
    Rejected { remaining_secs: u64 },
}

/// Decision counters.
#[derive(Debug, Clone, Default)]
pub struct AdmissionStats {
    pub accepted: u64,
    pub rejected: u64,
    pub tracked_identities: usize,
}

/// Cooldown table with atomic check-and-record.
pub struct AdmissionController {
    /// identity → Unix millis of last accepted placement
    records: Mutex<HashMap<Arc<str>, u64>>,
    accepted: AtomicU64,
    rejected: AtomicU64,
}

impl AdmissionController {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Admit or reject a placement by `identity` at `request_time` (Unix
    /// millis).
    ///
    /// On acceptance the record moves to `request_time` before the lock is
    /// released. A rejection leaves the record untouched. A request time
    /// older than the record counts as no time elapsed.
    pub fn check_and_record(
        &self,
        identity: &Arc<str>,
        request_time: u64,
        cooldown: Duration,
    ) -> Admission {
        let cooldown_ms = u64::try_from(cooldown.as_millis()).unwrap_or(u64::MAX);
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(&last) = records.get(identity.as_ref()) {
            let elapsed = request_time.saturating_sub(last);
            if elapsed < cooldown_ms {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                return Admission::Rejected {
                    remaining_secs: remaining_secs(cooldown_ms - elapsed),
                };
            }
        }

        records.insert(identity.clone(), request_time);
        self.accepted.fetch_add(1, Ordering::Relaxed);
        Admission::Accepted
    }

    /// Time of the identity's last accepted placement, if any.
    pub fn last_accepted(&self, identity: &str) -> Option<u64> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(identity)
            .copied()
    }

    pub fn tracked_identities(&self) -> usize {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn stats(&self) -> AdmissionStats {
        AdmissionStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            tracked_identities: self.tracked_identities(),
        }
    }
}

impl Default for AdmissionController {
    fn default() -> Self {
        Self::new()
    }
}

/// Millis → whole seconds, rounded up.
fn remaining_secs(remaining_ms: u64) -> u64 {
    remaining_ms.div_ceil(1000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    const SECOND: u64 = 1000;

    fn id(name: &str) -> Arc<str> {
        Arc::from(name)
    }

    #[test]
    fn test_first_request_accepted() {
        let ctl = AdmissionController::new();
        assert_eq!(ctl.last_accepted("a"), None);
        assert_eq!(ctl.check_and_record(&id("a"), 0, DEFAULT_COOLDOWN), Admission::Accepted);
        assert_eq!(ctl.last_accepted("a"), Some(0));
    }

    #[test]
    fn test_rejected_within_window() {
        let ctl = AdmissionController::new();
        let a = id("a");
        ctl.check_and_record(&a, 0, DEFAULT_COOLDOWN);

        assert_eq!(
            ctl.check_and_record(&a, 3 * SECOND, DEFAULT_COOLDOWN),
            Admission::Rejected { remaining_secs: 7 }
        );
        // Record untouched by the rejection
        assert_eq!(ctl.last_accepted("a"), Some(0));
    }

    #[test]
    fn test_remaining_rounds_up() {
        let ctl = AdmissionController::new();
        let a = id("a");
        ctl.check_and_record(&a, 0, DEFAULT_COOLDOWN);

        assert_eq!(
            ctl.check_and_record(&a, 9_001, DEFAULT_COOLDOWN),
            Admission::Rejected { remaining_secs: 1 }
        );
        assert_eq!(
            ctl.check_and_record(&a, 2_500, DEFAULT_COOLDOWN),
            Admission::Rejected { remaining_secs: 8 }
        );
    }

    #[test]
    fn test_accepted_at_window_boundary() {
        let ctl = AdmissionController::new();
        let a = id("a");
        ctl.check_and_record(&a, 0, DEFAULT_COOLDOWN);
        assert_eq!(ctl.check_and_record(&a, 10 * SECOND, DEFAULT_COOLDOWN), Admission::Accepted);
        assert_eq!(ctl.last_accepted("a"), Some(10 * SECOND));
    }

    #[test]
    fn test_window_restarts_after_acceptance() {
        let ctl = AdmissionController::new();
        let a = id("a");
        ctl.check_and_record(&a, 0, DEFAULT_COOLDOWN);
        ctl.check_and_record(&a, 11 * SECOND, DEFAULT_COOLDOWN);

        assert_eq!(
            ctl.check_and_record(&a, 15 * SECOND, DEFAULT_COOLDOWN),
            Admission::Rejected { remaining_secs: 6 }
        );
    }

    #[test]
    fn test_clock_skew_counts_as_no_elapsed_time() {
        let ctl = AdmissionController::new();
        let a = id("a");
        ctl.check_and_record(&a, 50 * SECOND, DEFAULT_COOLDOWN);
        assert_eq!(
            ctl.check_and_record(&a, 40 * SECOND, DEFAULT_COOLDOWN),
            Admission::Rejected { remaining_secs: 10 }
        );
    }

    #[test]
    fn test_identities_independent() {
        let ctl = AdmissionController::new();
        assert_eq!(ctl.check_and_record(&id("a"), 0, DEFAULT_COOLDOWN), Admission::Accepted);
        assert_eq!(ctl.check_and_record(&id("b"), 1, DEFAULT_COOLDOWN), Admission::Accepted);
        assert_eq!(ctl.tracked_identities(), 2);
    }

    #[test]
    fn test_zero_cooldown_always_accepts() {
        let ctl = AdmissionController::new();
        let a = id("a");
        for t in 0..5 {
            assert_eq!(ctl.check_and_record(&a, t, Duration::ZERO), Admission::Accepted);
        }
    }

    #[test]
    fn test_concurrent_same_identity_single_acceptance() {
        let ctl = Arc::new(AdmissionController::new());
        let threads = 32;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let ctl = ctl.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    let a = id("same");
                    barrier.wait();
                    ctl.check_and_record(&a, 5 * SECOND, DEFAULT_COOLDOWN)
                })
            })
            .collect();

        let results: Vec<Admission> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let accepted = results.iter().filter(|r| **r == Admission::Accepted).count();
        assert_eq!(accepted, 1);
        assert!(results
            .iter()
            .filter(|r| **r != Admission::Accepted)
            .all(|r| *r == Admission::Rejected { remaining_secs: 10 }));

        let stats = ctl.stats();
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.rejected, threads as u64 - 1);
        assert_eq!(stats.tracked_identities, 1);
    }
}

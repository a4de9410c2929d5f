// src/fetch/circuit_breaker.rs
//! Per-source circuit breaker.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::BreakerSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Answer to "may this source hit the network now?".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// The single half-open trial; report its result or call `abandon_trial`.
    Trial,
    Rejected,
}

#[derive(Debug)]
struct Cell {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl Default for Cell {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_in_flight: false,
        }
    }
}

pub struct CircuitBreakers {
    failure_threshold: u32,
    recovery_timeout: Duration,
    cells: Mutex<HashMap<String, Arc<Mutex<Cell>>>>,
}

impl CircuitBreakers {
    pub fn new(s: &BreakerSettings) -> Self {
        Self {
            failure_threshold: s.failure_threshold.max(1),
            recovery_timeout: Duration::from_secs(s.recovery_timeout_secs),
            cells: Mutex::new(HashMap::new()),
        }
    }

    fn cell(&self, id: &str) -> Arc<Mutex<Cell>> {
        Arc::clone(self.cells.lock().entry(id.to_string()).or_default())
    }

    pub fn admit_at(&self, id: &str, now: Instant) -> Admission {
        let cell = self.cell(id);
        let mut c = cell.lock();
        match c.state {
            BreakerState::Closed => Admission::Allowed,
            BreakerState::Open => {
                let ready = c
                    .opened_at
                    .map(|t| now.saturating_duration_since(t) >= self.recovery_timeout)
                    .unwrap_or(true);
                if ready {
                    c.state = BreakerState::HalfOpen;
                    c.trial_in_flight = true;
                    tracing::info!(target: "fetch", source = %id, "breaker half-open; probing");
                    Admission::Trial
                } else {
                    Admission::Rejected
                }
            }
            BreakerState::HalfOpen if c.trial_in_flight => Admission::Rejected,
            BreakerState::HalfOpen => {
                c.trial_in_flight = true;
                Admission::Trial
            }
        }
    }

    pub fn admit(&self, id: &str) -> Admission {
        self.admit_at(id, Instant::now())
    }

    pub fn record_success(&self, id: &str) {
        let cell = self.cell(id);
        let mut c = cell.lock();
        if c.state != BreakerState::Closed {
            tracing::info!(target: "fetch", source = %id, "breaker closed");
        }
        *c = Cell::default();
    }

    pub fn record_failure_at(&self, id: &str, now: Instant) {
        let cell = self.cell(id);
        let mut c = cell.lock();
        c.consecutive_failures = c.consecutive_failures.saturating_add(1);
        let trip = match c.state {
            BreakerState::HalfOpen => true,
            BreakerState::Closed => c.consecutive_failures >= self.failure_threshold,
            BreakerState::Open => false,
        };
        if trip {
            c.state = BreakerState::Open;
            c.opened_at = Some(now);
            c.trial_in_flight = false;
            tracing::warn!(
                target: "fetch",
                source = %id,
                failures = c.consecutive_failures,
                "breaker opened"
            );
            metrics::counter!("aggregator_breaker_opened_total").increment(1);
        }
    }

    pub fn record_failure(&self, id: &str) {
        self.record_failure_at(id, Instant::now());
    }

    /// The trial never reached the network (e.g. rate limited); let the next
    /// caller take it instead.
    pub fn abandon_trial(&self, id: &str) {
        let cell = self.cell(id);
        let mut c = cell.lock();
        if c.state == BreakerState::HalfOpen {
            c.trial_in_flight = false;
        }
    }

    pub fn state(&self, id: &str) -> BreakerState {
        self.cells
            .lock()
            .get(id)
            .map(|c| c.lock().state)
            .unwrap_or(BreakerState::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breakers() -> CircuitBreakers {
        CircuitBreakers::new(&BreakerSettings {
            failure_threshold: 3,
            recovery_timeout_secs: 60,
        })
    }

    #[test]
    fn opens_after_threshold_and_admits_one_trial() {
        let b = breakers();
        let t = Instant::now();
        for _ in 0..3 {
            assert_eq!(b.admit_at("s", t), Admission::Allowed);
            b.record_failure_at("s", t);
        }
        assert_eq!(b.state("s"), BreakerState::Open);
        assert_eq!(b.admit_at("s", t + Duration::from_secs(59)), Admission::Rejected);

        let later = t + Duration::from_secs(60);
        assert_eq!(b.admit_at("s", later), Admission::Trial);
        assert_eq!(b.admit_at("s", later), Admission::Rejected);

        b.record_success("s");
        assert_eq!(b.state("s"), BreakerState::Closed);
        assert_eq!(b.admit_at("s", later), Admission::Allowed);
    }

    #[test]
    fn failed_trial_reopens() {
        let b = breakers();
        let t = Instant::now();
        for _ in 0..3 {
            b.record_failure_at("s", t);
        }
        let t1 = t + Duration::from_secs(61);
        assert_eq!(b.admit_at("s", t1), Admission::Trial);
        b.record_failure_at("s", t1);
        assert_eq!(b.state("s"), BreakerState::Open);
        assert_eq!(b.admit_at("s", t1 + Duration::from_secs(30)), Admission::Rejected);
    }

    #[test]
    fn abandoned_trial_can_be_retaken() {
        let b = breakers();
        let t = Instant::now();
        for _ in 0..3 {
            b.record_failure_at("s", t);
        }
        let t1 = t + Duration::from_secs(60);
        assert_eq!(b.admit_at("s", t1), Admission::Trial);
        b.abandon_trial("s");
        assert_eq!(b.admit_at("s", t1), Admission::Trial);
    }

    #[test]
    fn sources_are_isolated() {
        let b = breakers();
        let t = Instant::now();
        for _ in 0..3 {
            b.record_failure_at("bad", t);
        }
        assert_eq!(b.admit_at("good", t), Admission::Allowed);
    }
}

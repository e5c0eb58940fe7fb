//! Cooperative deadline checks
//!
//! Reading the clock on every iterator step is measurable overhead in tight
//! index scans, so deadline checks are amortised: the checker only consults
//! the clock every `period` calls. The period is a trade-off between
//! overshoot and overhead and stays well under 2^14.

use std::time::Instant;

/// Default number of calls between clock reads.
const DEFAULT_PERIOD: u32 = 128;

/// Amortised deadline checker.
#[derive(Debug, Clone)]
pub struct TimeoutChecker {
    deadline: Option<Instant>,
    counter: u32,
    period: u32,
    expired: bool,
}

impl TimeoutChecker {
    pub fn new(deadline: Option<Instant>) -> Self {
        Self::with_period(deadline, DEFAULT_PERIOD)
    }

    pub fn with_period(deadline: Option<Instant>, period: u32) -> Self {
        Self {
            deadline,
            counter: 0,
            period: period.max(1),
            expired: false,
        }
    }

    /// Returns `true` once the deadline has passed. Only consults the
    /// clock every `period` calls; once expired, stays expired.
    pub fn check(&mut self) -> bool {
        if self.expired {
            return true;
        }
        let Some(deadline) = self.deadline else {
            return false;
        };
        self.counter += 1;
        if self.counter < self.period {
            return false;
        }
        self.counter = 0;
        if Instant::now() >= deadline {
            self.expired = true;
        }
        self.expired
    }

    /// Unamortised check, for stages that are called rarely.
    pub fn check_now(&mut self) -> bool {
        if self.expired {
            return true;
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                self.expired = true;
            }
        }
        self.expired
    }
}

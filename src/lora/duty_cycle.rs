//! Hourly time-on-air budget.
//!
//! Tracks how much airtime (in milliseconds) the node may still use in the
//! current fixed-size cycle. Limiting is switched on once and stays on;
//! cycles roll forward by exactly one cycle length so their boundaries never
//! drift with the time they happen to be queried.
//!
//! The tracker never reads a clock itself; every call gets `now_ms`.
//!
//! # Example
//!
//! ```
//! use quark_gw::lora::ToaBudget;
//!
//! // 1% of an hour
//! let mut budget = ToaBudget::hourly();
//! budget.enable_limit(0);
//!
//! if budget.reserve(0, 1450) {
//!     // ... transmit ...
//!     budget.commit(0, 1450);
//! }
//! assert_eq!(budget.remaining(10), 36_000 - 1450);
//! ```

/// Airtime allowed per cycle: 1% of an hour.
pub const MAX_DUTY_CYCLE_PER_HOUR: i64 = 36_000;
/// Cycle length in milliseconds.
pub const DUTYCYCLE_DURATION: u64 = 3_600_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BudgetState {
    Uninitialized,
    Limiting { start_ms: u64, end_ms: u64 },
}

/// Duty-cycle budget with fixed, non-drifting cycles.
#[derive(Debug, Clone)]
pub struct ToaBudget {
    state: BudgetState,
    max_ms: i64,
    cycle_ms: u64,
    remaining_ms: i64,
}

impl Default for ToaBudget {
    fn default() -> Self {
        Self::hourly()
    }
}

impl ToaBudget {
    /// Budget with an explicit allowance and cycle length.
    pub fn new(max_ms: i64, cycle_ms: u64) -> Self {
        Self {
            state: BudgetState::Uninitialized,
            max_ms,
            cycle_ms,
            remaining_ms: max_ms,
        }
    }

    /// 36 s of airtime per hour.
    pub fn hourly() -> Self {
        Self::new(MAX_DUTY_CYCLE_PER_HOUR, DUTYCYCLE_DURATION)
    }

    /// Start limiting. Calling it again has no effect on the running cycle.
    ///
    /// Returns the remaining allowance.
    pub fn enable_limit(&mut self, now_ms: u64) -> i64 {
        if self.state == BudgetState::Uninitialized {
            self.state = BudgetState::Limiting {
                start_ms: now_ms,
                end_ms: now_ms + self.cycle_ms,
            };
            self.remaining_ms = self.max_ms;
        }
        self.remaining(now_ms)
    }

    pub fn is_limiting(&self) -> bool {
        matches!(self.state, BudgetState::Limiting { .. })
    }

    /// Remaining allowance, rolling into the next cycle if the current one
    /// has ended. Without limiting this is always the full allowance.
    pub fn remaining(&mut self, now_ms: u64) -> i64 {
        match self.state {
            BudgetState::Uninitialized => self.max_ms,
            BudgetState::Limiting { end_ms, .. } => {
                if now_ms > end_ms {
                    let start_ms = end_ms;
                    let end_ms = start_ms + self.cycle_ms;
                    self.state = BudgetState::Limiting { start_ms, end_ms };
                    self.remaining_ms = self.max_ms;
                    log::info!(
                        "new ToA cycle: begins at {} ends at {}",
                        start_ms,
                        end_ms
                    );
                }
                self.remaining_ms
            }
        }
    }

    /// Whether `airtime_ms` still fits in the current cycle.
    ///
    /// Nothing is deducted; call [`commit`](Self::commit) after the frame
    /// has actually gone out.
    pub fn reserve(&mut self, now_ms: u64, airtime_ms: u32) -> bool {
        self.remaining(now_ms) - airtime_ms as i64 >= 0
    }

    /// Deduct the airtime of a completed transmission.
    ///
    /// Returns the allowance left afterwards.
    pub fn commit(&mut self, now_ms: u64, airtime_ms: u32) -> i64 {
        if !self.is_limiting() {
            return self.max_ms;
        }
        self.remaining(now_ms);
        self.remaining_ms -= airtime_ms as i64;
        self.remaining_ms
    }

    /// Bounds of the current cycle, if limiting.
    pub fn cycle(&self) -> Option<(u64, u64)> {
        match self.state {
            BudgetState::Uninitialized => None,
            BudgetState::Limiting { start_ms, end_ms } => Some((start_ms, end_ms)),
        }
    }

    pub fn max(&self) -> i64 {
        self.max_ms
    }
}

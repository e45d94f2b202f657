use crate::config::ConcurrencyLimits;

const DECREASE_ERROR_RATE: f64 = 0.3;
const DECREASE_RATE_LIMIT_RATE: f64 = 0.2;
const INCREASE_ERROR_RATE: f64 = 0.1;
const INCREASE_RATE_LIMIT_RATE: f64 = 0.05;

/// Observations gathered while a window was processed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowStats {
    pub total: usize,
    pub failed: usize,
    pub rate_limited: usize,
}

impl WindowStats {
    pub fn record(&mut self, success: bool, rate_limited: bool) {
        self.total += 1;
        if !success {
            self.failed += 1;
        }
        if rate_limited {
            self.rate_limited += 1;
        }
    }

    pub fn merge(&mut self, other: WindowStats) {
        self.total += other.total;
        self.failed += other.failed;
        self.rate_limited += other.rate_limited;
    }

    pub fn error_rate(&self) -> f64 {
        ratio(self.failed, self.total)
    }

    pub fn rate_limit_rate(&self) -> f64 {
        ratio(self.rate_limited, self.total)
    }
}

fn ratio(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

/// What the controller did after an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    Increased,
    Decreased,
    Unchanged,
    /// Too few observations so far; they are kept for the next evaluation.
    Deferred,
}

/// Additive-increase/additive-decrease limit on in-flight scoring calls.
///
/// State is local to one batch run. Windows smaller than `min_samples` are accumulated
/// until enough observations exist, then the rates are evaluated over the accumulated
/// sample and the accumulator is reset.
#[derive(Debug, Clone)]
pub struct ConcurrencyController {
    limits: ConcurrencyLimits,
    current: usize,
    pending: WindowStats,
}

impl ConcurrencyController {
    pub fn new(limits: ConcurrencyLimits) -> Self {
        let limits = limits.normalized();
        Self {
            limits,
            current: limits.initial,
            pending: WindowStats::default(),
        }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn observe(&mut self, window: WindowStats) -> Adjustment {
        self.pending.merge(window);
        if self.pending.total < self.limits.min_samples.max(1) {
            return Adjustment::Deferred;
        }

        let sample = std::mem::take(&mut self.pending);
        let error_rate = sample.error_rate();
        let rate_limit_rate = sample.rate_limit_rate();

        let adjustment = if error_rate > DECREASE_ERROR_RATE
            || rate_limit_rate > DECREASE_RATE_LIMIT_RATE
        {
            if self.current > self.limits.min {
                self.current -= 1;
                Adjustment::Decreased
            } else {
                Adjustment::Unchanged
            }
        } else if error_rate < INCREASE_ERROR_RATE && rate_limit_rate < INCREASE_RATE_LIMIT_RATE {
            if self.current < self.limits.max {
                self.current += 1;
                Adjustment::Increased
            } else {
                Adjustment::Unchanged
            }
        } else {
            Adjustment::Unchanged
        };

        tracing::debug!(
            "Concurrency {:?} to {} (errors {:.2}, rate limited {:.2}, n={})",
            adjustment,
            self.current,
            error_rate,
            rate_limit_rate,
            sample.total
        );

        adjustment
    }
}

//! Termination tests for the three nested loops.
//!
//! Sub: moving-average plateau of the objective. Lambda: overflow is low and
//! hpwl stopped improving, or nothing is over capacity. Gamma: the same test
//! one level up, plus a fallback to the reserved iterate when overflow
//! oscillates.

use tracing::debug;

use crate::config::StageConfig;
use crate::metrics::{LambdaHistory, MetricRecord, SubHistory};

/// Relative improvement the sub-level moving average must beat.
pub const PLATEAU_THRESHOLD: f64 = 0.999;
/// Gamma-level oscillation checks need more sub-level records than this.
pub const OSCILLATION_MIN_RECORDS: usize = 100;
/// Iterations since the reserved record before oscillation is declared.
pub const OSCILLATION_MIN_DISTANCE: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GammaDecision {
    Continue,
    Stop,
    /// Stop and put the reserved iterate back.
    ReuseReserved,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoppingCriteria {
    pub stop_overflow: f64,
    pub target_density: f64,
    pub gamma_step_threshold: usize,
    pub oscillation_overflow: f64,
}

impl StoppingCriteria {
    pub fn for_stage(stage: &StageConfig) -> Self {
        StoppingCriteria {
            stop_overflow: stage.stop_overflow,
            target_density: stage.target_density,
            gamma_step_threshold: stage.gamma_step_threshold,
            oscillation_overflow: stage.oscillation_overflow,
        }
    }

    ///plateau test on the objective. with a window of 3:
    ///  0, 1, 2, 3, 4, 5, 6
    ///     prev      cur
    pub fn sub_stop(&self, sub_cap: usize, records: &[MetricRecord]) -> bool {
        let window = moving_average_window(sub_cap);
        if records.len() < 2 * window {
            return false;
        }
        let n = records.len();
        let cur: f64 = records[n - window..]
            .iter()
            .map(MetricRecord::objective_or_nan)
            .sum::<f64>()
            / window as f64;
        let prev: f64 = records[n - 2 * window..n - window]
            .iter()
            .map(MetricRecord::objective_or_nan)
            .sum::<f64>()
            / window as f64;

        if cur >= prev * PLATEAU_THRESHOLD {
            debug!("Lsub stopping criteria: {} and {:e} >= {:e} * {}", n, cur, prev, PLATEAU_THRESHOLD);
            return true;
        }
        false
    }

    /// Compares the terminal records of the last two lambda iterations.
    pub fn lambda_stop(&self, history: &[SubHistory]) -> bool {
        let n = history.len();
        if n < 2 {
            return false;
        }
        let (Some(cur), Some(prev)) = (history[n - 1].last(), history[n - 2].last()) else {
            return false;
        };
        let stop = (cur.overflow_or_max() < self.stop_overflow && cur.hpwl >= prev.hpwl)
            || cur.max_density_or_max() < 1.0;
        if stop {
            debug!(
                "Llambda stopping criteria: (( {:e} < {} and {:e} >= {:e} ) or {:e} < 1.0)",
                cur.overflow_or_max(),
                self.stop_overflow,
                cur.hpwl,
                prev.hpwl,
                cur.max_density_or_max()
            );
        }
        stop
    }

    /// `first_stage` gates the convergence test behind `gamma_step_threshold`.
    /// `total_sub_records` counts every descent record of the stage.
    pub fn gamma_stop(
        &self,
        gamma_step: usize,
        first_stage: bool,
        history: &[LambdaHistory],
        total_sub_records: usize,
        reserved: Option<&MetricRecord>,
    ) -> GammaDecision {
        let n = history.len();
        if n > 1 {
            if let (Some(cur), Some(prev)) = (terminal(&history[n - 1]), terminal(&history[n - 2])) {
                let converged = (cur.overflow_or_max() < self.stop_overflow && cur.hpwl >= prev.hpwl)
                    || cur.max_density_or_max() < self.target_density;
                let allowed = !first_stage || gamma_step > self.gamma_step_threshold;
                if allowed && converged {
                    debug!(
                        "Lgamma stopping criteria: {} > {} and (( {:e} < {} and {:e} >= {:e} ) or {:e} < {})",
                        gamma_step,
                        self.gamma_step_threshold,
                        cur.overflow_or_max(),
                        self.stop_overflow,
                        cur.hpwl,
                        prev.hpwl,
                        cur.max_density_or_max(),
                        self.target_density
                    );
                    return GammaDecision::Stop;
                }
            }
        }

        if total_sub_records > OSCILLATION_MIN_RECORDS {
            let cur = history.last().and_then(terminal);
            if let (Some(cur), Some(reserved)) = (cur, reserved) {
                if cur.overflow_or_max() < self.oscillation_overflow
                    && cur.iteration.saturating_sub(reserved.iteration) > OSCILLATION_MIN_DISTANCE
                {
                    debug!("overflow oscillation, reusing position of iteration {}", reserved.iteration);
                    return GammaDecision::ReuseReserved;
                }
            }
        }
        GammaDecision::Continue
    }
}

/// clamp(sub_cap / 2, 1, 3)
pub fn moving_average_window(sub_cap: usize) -> usize {
    (sub_cap / 2).clamp(1, 3)
}

/// Last record of the last sub history of a lambda history.
pub fn terminal(history: &LambdaHistory) -> Option<&MetricRecord> {
    history.last().and_then(|sub| sub.last())
}

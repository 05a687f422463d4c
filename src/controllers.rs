//! Annealing schedules for the wirelength smoothing factor and the density weight.

use crate::config::StageConfig;
use crate::metrics::MetricRecord;

pub trait GammaController {
    fn initial_gamma(&self) -> f64;

    /// New smoothing factor after gamma iteration `step` ended at `overflow`.
    fn update(&mut self, step: usize, overflow: f64) -> f64;
}

pub trait DensityWeightController {
    /// Called once before each stage starts its loops.
    fn begin_stage(&mut self, _stage: &StageConfig) {}

    ///called between lambda iterations with the terminal records of the two
    ///most recent ones and the flat lambda count of the stage
    fn update(
        &mut self,
        current: &MetricRecord,
        previous: &MetricRecord,
        flat_iteration: usize,
        weight: f64,
    ) -> f64;
}

/// gamma = base * 10^(k * overflow + b), base = factor * average bin size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EplaceGamma {
    pub base: f64,
    pub k: f64,
    pub b: f64,
}

impl EplaceGamma {
    pub fn new(gamma_factor: f64, bin_w: f64, bin_h: f64) -> Self {
        EplaceGamma {
            base: gamma_factor * (bin_w + bin_h) / 2.0,
            k: 20.0 / 9.0,
            b: -11.0 / 9.0,
        }
    }

    pub fn gamma_at(&self, overflow: f64) -> f64 {
        self.base * 10f64.powf(self.k * overflow + self.b)
    }
}

impl GammaController for EplaceGamma {
    fn initial_gamma(&self) -> f64 {
        self.gamma_at(1.0)
    }

    fn update(&mut self, _step: usize, overflow: f64) -> f64 {
        self.gamma_at(overflow.clamp(0.0, 1.0))
    }
}

///the RePlAce density weight schedule: grow fast while hpwl keeps dropping,
///slow down as it climbs, and never shrink while overflow is still high
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EplaceDensityWeight {
    pub lower: f64,
    pub upper: f64,
    pub ref_hpwl: f64,
    pub stop_overflow: f64,
}

impl EplaceDensityWeight {
    pub fn new(stop_overflow: f64) -> Self {
        EplaceDensityWeight {
            lower: 0.95,
            upper: 1.05,
            ref_hpwl: 350_000.0,
            stop_overflow,
        }
    }

    pub fn multiplier(&self, delta_hpwl: f64, flat_iteration: usize, overflow: f64) -> f64 {
        let mu = if delta_hpwl < 0.0 {
            self.upper * 0.9999f64.powi(flat_iteration as i32).max(0.98)
        } else {
            self.upper
                * self
                    .upper
                    .powf(-delta_hpwl / self.ref_hpwl)
                    .clamp(self.lower, self.upper)
        };
        if overflow > self.stop_overflow {
            mu.max(1.0)
        } else {
            mu
        }
    }
}

impl Default for EplaceDensityWeight {
    fn default() -> Self {
        EplaceDensityWeight::new(StageConfig::default().stop_overflow)
    }
}

impl DensityWeightController for EplaceDensityWeight {
    ///the overflow floor follows the stage's stop threshold
    fn begin_stage(&mut self, stage: &StageConfig) {
        self.stop_overflow = stage.stop_overflow;
    }

    fn update(
        &mut self,
        current: &MetricRecord,
        previous: &MetricRecord,
        flat_iteration: usize,
        weight: f64,
    ) -> f64 {
        let delta = current.hpwl - previous.hpwl;
        weight * self.multiplier(delta, flat_iteration, current.overflow_or_max())
    }
}

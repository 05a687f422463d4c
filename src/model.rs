//! Collaborator contracts the placement engine drives.
//!
//! The engine never looks inside wirelength, density or congestion kernels. It
//! only needs an objective with a gradient, a projector back into the legal
//! region and a handful of metric producers.

use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::position::PositionLayout;

const MIN_GRAD_NORM: f64 = 1e-9;

/// The annealed knobs every evaluation depends on. Owned by the placer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Hyperparams {
    pub gamma: f64,
    pub density_weight: f64,
}

/// Objective and gradient at a position, deterministic for fixed hyperparameters.
pub trait ObjectiveEvaluator {
    fn obj_and_grad(&self, pos: &Array1<f64>, hyper: &Hyperparams) -> (f64, Array1<f64>);

    /// Blocks until pending device work finishes. Called before timing measurements.
    fn synchronize(&self) {}
}

/// In-place, idempotent projection into the feasible region.
pub trait ConstraintProjector {
    fn project(&self, pos: &mut Array1<f64>);
}

pub trait MetricSource {
    fn hpwl(&self, pos: &Array1<f64>) -> f64;

    /// Returns `(overflow, max_density)`.
    fn overflow(&self, pos: &Array1<f64>) -> (f64, f64);

    fn route_utilization_map(&self, _pos: &Array1<f64>) -> Option<Array2<f64>> {
        None
    }

    fn pin_utilization_map(&self, _pos: &Array1<f64>) -> Option<Array2<f64>> {
        None
    }
}

/// Which area classes an adjustment round changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AreaAdjustment {
    pub area: bool,
    pub route_area: bool,
    pub pin_area: bool,
}

pub trait RoutabilityOps {
    fn adjust_node_area(
        &mut self,
        pos: &mut Array1<f64>,
        route_map: Option<&Array2<f64>>,
        pin_map: Option<&Array2<f64>>,
    ) -> AreaAdjustment;

    /// Rebuilds cached density state after node sizes change.
    fn reset_density_accumulators(&mut self);

    /// Puts back the pre-inflation sizes and pin offsets, keeping node centers fixed.
    fn restore_original_geometry(&mut self, pos: &mut Array1<f64>);
}

pub trait PlacementModel: ObjectiveEvaluator + ConstraintProjector + MetricSource {
    fn layout(&self) -> PositionLayout;

    /// `|grad wirelength|_1 / |grad density|_1`, the scale that balances the two terms.
    fn density_gradient_ratio(&self, pos: &Array1<f64>, hyper: &Hyperparams) -> f64;

    ///two point estimate of a step size: take a trial step of `lr` and compare
    ///how far we moved against how much the gradient changed
    fn estimate_initial_learning_rate(
        &self,
        pos: &Array1<f64>,
        lr: f64,
        hyper: &Hyperparams,
    ) -> f64 {
        let (_, g0) = self.obj_and_grad(pos, hyper);
        let mut trial = pos - &(lr * &g0);
        self.project(&mut trial);
        let (_, g1) = self.obj_and_grad(&trial, hyper);

        let dx = l2_distance(pos, &trial);
        let dg = l2_distance(&g0, &g1);
        let estimate = dx / (MIN_GRAD_NORM + dg);
        if estimate.is_finite() && estimate > 0.0 {
            estimate
        } else {
            lr
        }
    }

    fn add_noise(&self, pos: &mut Array1<f64>, ratio: f64, rng: &mut StdRng);

    /// Tells the gradient preconditioner the latest overflow.
    fn set_precondition_overflow(&mut self, _overflow: f64) {}

    /// `None` when the model cannot inflate node areas.
    fn routability(&mut self) -> Option<&mut dyn RoutabilityOps> {
        None
    }
}

pub(crate) fn l2_distance(a: &Array1<f64>, b: &Array1<f64>) -> f64 {
    squared_distance(a, b).sqrt()
}

pub(crate) fn squared_distance(a: &Array1<f64>, b: &Array1<f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

pub(crate) fn l1_norm(a: &Array1<f64>) -> f64 {
    a.iter().map(|x| x.abs()).sum()
}

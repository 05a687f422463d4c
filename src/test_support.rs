//! A separable quadratic stand-in for a placement model, for unit tests.

use ndarray::{Array1, Array2};
use rand::rngs::StdRng;

use crate::model::{
    AreaAdjustment, ConstraintProjector, Hyperparams, MetricSource, ObjectiveEvaluator,
    PlacementModel, RoutabilityOps,
};
use crate::position::{PositionLayout, Region, RegionProjector};

#[derive(Debug, Default, Clone)]
pub struct MockRoutability {
    pub result: AreaAdjustment,
    pub calls: usize,
    pub resets: usize,
    pub restores: usize,
    pub saw_route_map: bool,
    pub saw_pin_map: bool,
}

impl RoutabilityOps for MockRoutability {
    fn adjust_node_area(
        &mut self,
        _pos: &mut Array1<f64>,
        route_map: Option<&Array2<f64>>,
        pin_map: Option<&Array2<f64>>,
    ) -> AreaAdjustment {
        self.calls += 1;
        self.saw_route_map |= route_map.is_some();
        self.saw_pin_map |= pin_map.is_some();
        self.result
    }

    fn reset_density_accumulators(&mut self) {
        self.resets += 1;
    }

    fn restore_original_geometry(&mut self, _pos: &mut Array1<f64>) {
        self.restores += 1;
    }
}

///f(x) = c/2 |x - t|^2 + weight * ratio_hint, with overflow and max density fixed by the test
pub struct QuadraticModel {
    pub layout: PositionLayout,
    pub target: Array1<f64>,
    pub curvature: f64,
    pub projector: RegionProjector,
    pub overflow: f64,
    pub max_density: f64,
    pub density_ratio: f64,
    pub routability: Option<MockRoutability>,
    pub precondition_overflows: Vec<f64>,
}

impl QuadraticModel {
    pub fn new(target: Array1<f64>, curvature: f64) -> Self {
        let num_nodes = target.len() / 2;
        let layout = PositionLayout::new(num_nodes, num_nodes);
        QuadraticModel {
            layout,
            target,
            curvature,
            projector: RegionProjector::points(layout, Region::new(-1e3, -1e3, 1e3, 1e3)),
            overflow: 0.0,
            max_density: 0.0,
            density_ratio: 0.0,
            routability: None,
            precondition_overflows: Vec::new(),
        }
    }
}

impl ObjectiveEvaluator for QuadraticModel {
    fn obj_and_grad(&self, pos: &Array1<f64>, _hyper: &Hyperparams) -> (f64, Array1<f64>) {
        let d = pos - &self.target;
        (0.5 * self.curvature * d.dot(&d), self.curvature * &d)
    }
}

impl ConstraintProjector for QuadraticModel {
    fn project(&self, pos: &mut Array1<f64>) {
        self.projector.project(pos)
    }
}

impl MetricSource for QuadraticModel {
    fn hpwl(&self, pos: &Array1<f64>) -> f64 {
        (pos - &self.target).mapv(f64::abs).sum()
    }

    fn overflow(&self, _pos: &Array1<f64>) -> (f64, f64) {
        (self.overflow, self.max_density)
    }

    fn route_utilization_map(&self, _pos: &Array1<f64>) -> Option<Array2<f64>> {
        self.routability.as_ref().map(|_| Array2::from_elem((2, 2), 1.5))
    }

    fn pin_utilization_map(&self, _pos: &Array1<f64>) -> Option<Array2<f64>> {
        self.routability.as_ref().map(|_| Array2::from_elem((2, 2), 0.5))
    }
}

impl PlacementModel for QuadraticModel {
    fn layout(&self) -> PositionLayout {
        self.layout
    }

    fn density_gradient_ratio(&self, _pos: &Array1<f64>, _hyper: &Hyperparams) -> f64 {
        self.density_ratio
    }

    fn add_noise(&self, pos: &mut Array1<f64>, ratio: f64, _rng: &mut StdRng) {
        pos.mapv_inplace(|x| x + ratio);
        self.project(pos);
    }

    fn set_precondition_overflow(&mut self, overflow: f64) {
        self.precondition_overflows.push(overflow);
    }

    fn routability(&mut self) -> Option<&mut dyn RoutabilityOps> {
        self.routability
            .as_mut()
            .map(|ops| ops as &mut dyn RoutabilityOps)
    }
}

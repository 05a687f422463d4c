//! The reference placement model: WA wirelength plus ePlace electrostatic density.
//!
//! Every node is a positive charge of its own area. The density penalty is the
//! potential energy of that charge distribution, solved spectrally on the bin
//! grid, and its gradient on a node is the field it sits in times its charge.

use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use tracing::{debug, info};

use crate::congestion;
use crate::dct::{self, PoissonSolver};
use crate::density::{self, BinGrid, StretchedNodes};
use crate::design::Design;
use crate::model::{
    l1_norm, AreaAdjustment, ConstraintProjector, Hyperparams, MetricSource, ObjectiveEvaluator,
    PlacementModel, RoutabilityOps,
};
use crate::position::{self, PositionLayout, RegionProjector};
use crate::wirelength;

/// Best overflow below which the preconditioner starts weighing density harder.
pub const PRECONDITION_OVERFLOW: f64 = 0.3;
pub const PRECONDITION_ALPHA_MAX: f64 = 1024.0;

pub struct ElectrostaticModel {
    design: Design,
    grid: BinGrid,
    solver: PoissonSolver,
    projector: RegionProjector,
    stretched: StretchedNodes,
    fixed_map: Array2<f64>,
    pin_counts: Array1<f64>,
    node2pins: Vec<Vec<usize>>,
    precondition_alpha: f64,
    best_overflow: f64,
}

impl ElectrostaticModel {
    pub fn new(design: Design) -> Self {
        let grid = BinGrid::new(design.region, design.num_bins_x, design.num_bins_y);
        let solver = PoissonSolver::new(grid.num_bins_x, grid.num_bins_y, grid.bin_w, grid.bin_h);
        let mut node2pins = vec![Vec::new(); design.layout.num_nodes];
        for (pin, &node) in design.pin2node.iter().enumerate() {
            node2pins[node].push(pin);
        }

        let mut model = ElectrostaticModel {
            projector: projector_for(&design),
            stretched: StretchedNodes::new(&grid, design.layout, &design.size_x, &design.size_y),
            fixed_map: grid.zeros(),
            pin_counts: design.pin_counts(),
            node2pins,
            precondition_alpha: 1.0,
            best_overflow: f64::INFINITY,
            design,
            grid,
            solver,
        };
        model.reset_density_accumulators();
        model
    }

    pub fn design(&self) -> &Design {
        &self.design
    }

    pub fn grid(&self) -> &BinGrid {
        &self.grid
    }

    pub fn precondition_alpha(&self) -> f64 {
        self.precondition_alpha
    }

    ///potential energy of all charges and its gradient on the movable nodes
    pub fn density_energy(&self, pos: &Array1<f64>) -> (f64, Array1<f64>) {
        let layout = self.design.layout;
        let charge = self.stretched.density_map(&self.grid, layout, pos) + &self.fixed_map;
        let rho = &charge / self.grid.bin_area();
        let field = self.solver.solve(&rho);
        let energy = dct::energy(&charge, &field.potential);

        let mut grad = Array1::zeros(layout.len());
        for i in 0..layout.num_movable {
            let (xl, yl, xh, yh) = self.stretched.rect(layout, pos, i);
            let ratio = self.stretched.ratio[i];
            let (mut gx, mut gy) = (0.0, 0.0);
            self.grid.for_each_overlap(xl, yl, xh, yh, |bx, by, area| {
                gx -= ratio * area * field.field_x[[bx, by]];
                gy -= ratio * area * field.field_y[[bx, by]];
            });
            grad[layout.x(i)] = gx;
            grad[layout.y(i)] = gy;
        }
        (energy, grad)
    }

    ///divides each movable gradient by max(1, pins + alpha * density_weight * area)
    fn precondition(&self, grad: &mut Array1<f64>, density_weight: f64) {
        let layout = self.design.layout;
        for i in 0..layout.num_movable {
            let area = self.design.size_x[i] * self.design.size_y[i];
            let p = (self.pin_counts[i] + self.precondition_alpha * density_weight * area).max(1.0);
            grad[layout.x(i)] /= p;
            grad[layout.y(i)] /= p;
        }
    }

    fn movable_area_map(&self, pos: &Array1<f64>) -> Array2<f64> {
        let layout = self.design.layout;
        density::node_area_map(
            &self.grid,
            layout,
            &self.design.size_x,
            &self.design.size_y,
            pos,
            0..layout.num_movable,
        )
    }

    ///grows movable node `i` by `scale` in area around its center, pins move along
    fn inflate(&mut self, pos: &mut Array1<f64>, scale: &Array1<f64>) {
        let layout = self.design.layout;
        for i in 0..layout.num_movable {
            let t = scale[i].sqrt();
            let dx = (t - 1.0) * self.design.size_x[i] / 2.0;
            let dy = (t - 1.0) * self.design.size_y[i] / 2.0;
            pos[layout.x(i)] -= dx;
            pos[layout.y(i)] -= dy;
            for &pin in &self.node2pins[i] {
                self.design.pin_offset_x[pin] += dx;
                self.design.pin_offset_y[pin] += dy;
            }
            self.design.size_x[i] *= t;
            self.design.size_y[i] *= t;
        }
        self.projector = projector_for(&self.design);
    }
}

fn projector_for(design: &Design) -> RegionProjector {
    RegionProjector::new(
        design.layout,
        design.region,
        design.size_x.clone(),
        design.size_y.clone(),
    )
}

impl ObjectiveEvaluator for ElectrostaticModel {
    fn obj_and_grad(&self, pos: &Array1<f64>, hyper: &Hyperparams) -> (f64, Array1<f64>) {
        let (wl, wl_grad) = wirelength::weighted_average(&self.design, pos, hyper.gamma);
        let (energy, density_grad) = self.density_energy(pos);

        let mut grad = wl_grad + hyper.density_weight * density_grad;
        self.design.layout.mask_fixed(&mut grad);
        self.precondition(&mut grad, hyper.density_weight);
        (wl + hyper.density_weight * energy, grad)
    }
}

impl ConstraintProjector for ElectrostaticModel {
    fn project(&self, pos: &mut Array1<f64>) {
        self.projector.project(pos)
    }
}

impl MetricSource for ElectrostaticModel {
    fn hpwl(&self, pos: &Array1<f64>) -> f64 {
        wirelength::hpwl(&self.design, pos)
    }

    fn overflow(&self, pos: &Array1<f64>) -> (f64, f64) {
        density::overflow(
            &self.grid,
            &self.movable_area_map(pos),
            &self.fixed_map,
            self.design.target_density,
            self.design.movable_area(),
        )
    }

    fn route_utilization_map(&self, pos: &Array1<f64>) -> Option<Array2<f64>> {
        Some(congestion::rudy_map(&self.design, &self.grid, pos))
    }

    fn pin_utilization_map(&self, pos: &Array1<f64>) -> Option<Array2<f64>> {
        Some(congestion::pin_utilization_map(&self.design, &self.grid, pos))
    }
}

impl PlacementModel for ElectrostaticModel {
    fn layout(&self) -> PositionLayout {
        self.design.layout
    }

    fn density_gradient_ratio(&self, pos: &Array1<f64>, hyper: &Hyperparams) -> f64 {
        let layout = self.design.layout;
        let (_, mut wl_grad) = wirelength::weighted_average(&self.design, pos, hyper.gamma);
        let (_, mut density_grad) = self.density_energy(pos);
        layout.mask_fixed(&mut wl_grad);
        layout.mask_fixed(&mut density_grad);

        let ratio = l1_norm(&wl_grad) / l1_norm(&density_grad);
        if ratio.is_finite() {
            ratio
        } else {
            0.0
        }
    }

    fn add_noise(&self, pos: &mut Array1<f64>, ratio: f64, rng: &mut StdRng) {
        position::add_noise(
            pos,
            self.design.layout,
            &self.design.size_x,
            &self.design.size_y,
            ratio,
            rng,
        );
        self.project(pos);
    }

    fn set_precondition_overflow(&mut self, overflow: f64) {
        self.best_overflow = self.best_overflow.min(overflow);
        if self.best_overflow < PRECONDITION_OVERFLOW && self.precondition_alpha < PRECONDITION_ALPHA_MAX {
            self.precondition_alpha = (self.precondition_alpha * 2.0).min(PRECONDITION_ALPHA_MAX);
            debug!("preconditioner alpha = {}", self.precondition_alpha);
        }
    }

    fn routability(&mut self) -> Option<&mut dyn RoutabilityOps> {
        Some(self)
    }
}

impl RoutabilityOps for ElectrostaticModel {
    fn adjust_node_area(
        &mut self,
        pos: &mut Array1<f64>,
        route_map: Option<&Array2<f64>>,
        pin_map: Option<&Array2<f64>>,
    ) -> AreaAdjustment {
        let plan = congestion::plan_inflation(&self.design, &self.grid, pos, route_map, pin_map);
        let movable_area = self.design.movable_area();
        let adjustment = AreaAdjustment {
            area: plan.area_changed(movable_area),
            route_area: plan.route_changed(movable_area),
            pin_area: plan.pin_changed(movable_area),
        };
        info!(
            "area increase {:.3E} (route {:.3E}, pin {:.3E}) over movable area {:.3E}",
            plan.total_increase, plan.route_increase, plan.pin_increase, movable_area
        );
        if adjustment.area {
            self.inflate(pos, &plan.scale);
        }
        adjustment
    }

    fn reset_density_accumulators(&mut self) {
        let d = &self.design;
        self.stretched = StretchedNodes::new(&self.grid, d.layout, &d.size_x, &d.size_y);
        self.fixed_map = density::fixed_density_map(
            &self.grid,
            d.layout,
            &d.size_x,
            &d.size_y,
            &d.initial_position(),
            d.target_density,
        );
    }

    fn restore_original_geometry(&mut self, pos: &mut Array1<f64>) {
        let layout = self.design.layout;
        let d = &mut self.design;
        for i in 0..layout.num_movable {
            pos[layout.x(i)] += (d.size_x[i] - d.orig_size_x[i]) / 2.0;
            pos[layout.y(i)] += (d.size_y[i] - d.orig_size_y[i]) / 2.0;
        }
        d.size_x.assign(&d.orig_size_x);
        d.size_y.assign(&d.orig_size_y);
        d.pin_offset_x.assign(&d.orig_pin_offset_x);
        d.pin_offset_y.assign(&d.orig_pin_offset_y);
        self.projector = projector_for(&self.design);
        self.reset_density_accumulators();
    }
}

//! Routability-driven node inflation and the lambda-loop restart it triggers.

use ndarray::Array1;
use tracing::info;

use crate::config::RoutabilityParams;
use crate::error::{PlaceError, PlaceResult};
use crate::metrics::MetricRecord;
use crate::model::{Hyperparams, PlacementModel};
use crate::optimizer::{Optimizer, OptimizerSnapshot};

/// Density weight after a restart, relative to the gradient ratio.
pub const RESTART_DENSITY_WEIGHT_SCALE: f64 = 0.1;

///counters and flags carried across adjustment rounds of one stage
#[derive(Debug, Clone, PartialEq)]
pub struct RoutabilityState {
    pub num_area_adjust: usize,
    pub adjust_area: bool,
    pub adjust_route_area: bool,
    pub adjust_pin_area: bool,
    /// Optimizer as it was when the stage started.
    pub initial_snapshot: OptimizerSnapshot,
}

/// What changed when an adjustment restarted the lambda loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Restart {
    pub density_weight: f64,
    pub learning_rate: f64,
    pub sub_iteration: usize,
}

#[derive(Debug, Clone)]
pub struct RoutabilityAdjuster {
    params: RoutabilityParams,
    state: RoutabilityState,
}

impl RoutabilityAdjuster {
    pub fn new(params: &RoutabilityParams, initial_snapshot: OptimizerSnapshot) -> Self {
        RoutabilityAdjuster {
            params: params.clone(),
            state: RoutabilityState {
                num_area_adjust: 0,
                adjust_area: true,
                adjust_route_area: params.adjust_route_area,
                adjust_pin_area: params.adjust_pin_area,
                initial_snapshot,
            },
        }
    }

    pub fn state(&self) -> &RoutabilityState {
        &self.state
    }

    ///runs one adjustment round if the cap and overflow allow it. when areas changed the
    ///optimizer is rolled back to its stage-start snapshot and the caller must restart the lambda loop
    pub fn optimize<M: PlacementModel + ?Sized>(
        &mut self,
        model: &mut M,
        pos: &mut Array1<f64>,
        metric: &MetricRecord,
        optimizer: &mut Optimizer,
        hyper: &mut Hyperparams,
        learning_rate: f64,
    ) -> PlaceResult<Option<Restart>> {
        if self.state.num_area_adjust >= self.params.max_num_area_adjust
            || metric.overflow_or_max() >= self.params.node_area_adjust_overflow
        {
            return Ok(None);
        }

        let before = (
            self.state.adjust_area,
            self.state.adjust_route_area,
            self.state.adjust_pin_area,
        );
        let route_map = if self.state.adjust_route_area {
            model.route_utilization_map(pos)
        } else {
            None
        };
        let pin_map = if self.state.adjust_pin_area {
            model.pin_utilization_map(pos)
        } else {
            None
        };

        let ops = model
            .routability()
            .ok_or(PlaceError::RoutabilityUnsupported)?;
        let adjustment = ops.adjust_node_area(pos, route_map.as_ref(), pin_map.as_ref());
        self.state.adjust_area = adjustment.area;
        self.state.adjust_route_area = adjustment.route_area;
        self.state.adjust_pin_area = adjustment.pin_area;
        info!(
            "routability optimization round {}: adjust area flags = ({}, {}, {}) -> ({}, {}, {})",
            self.state.num_area_adjust,
            before.0 as u8,
            before.1 as u8,
            before.2 as u8,
            adjustment.area as u8,
            adjustment.route_area as u8,
            adjustment.pin_area as u8
        );
        if !adjustment.area {
            return Ok(None);
        }

        self.state.num_area_adjust += 1;
        ops.reset_density_accumulators();

        hyper.density_weight =
            model.density_gradient_ratio(pos, hyper) * RESTART_DENSITY_WEIGHT_SCALE;
        info!("density_weight = {:.6E}", hyper.density_weight);

        // the learning rate must be set after the state is loaded
        optimizer.restore(&self.state.initial_snapshot)?;
        let lr = model.estimate_initial_learning_rate(pos, learning_rate, hyper);
        optimizer.set_learning_rate(lr)?;

        Ok(Some(Restart {
            density_weight: hyper.density_weight,
            learning_rate: lr,
            sub_iteration: self.params.sub_iteration,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OptimizerKind;
    use crate::metrics::IterationId;
    use crate::model::{AreaAdjustment, ConstraintProjector, ObjectiveEvaluator};
    use crate::test_support::{MockRoutability, QuadraticModel};
    use ndarray::array;

    fn params() -> RoutabilityParams {
        RoutabilityParams {
            enabled: true,
            max_num_area_adjust: 2,
            node_area_adjust_overflow: 0.15,
            sub_iteration: 7,
            adjust_route_area: true,
            adjust_pin_area: false,
        }
    }

    fn model(result: AreaAdjustment) -> QuadraticModel {
        let mut model = QuadraticModel::new(array![1.0, 2.0, 3.0, 4.0], 1.0);
        model.density_ratio = 50.0;
        model.routability = Some(MockRoutability {
            result,
            ..MockRoutability::default()
        });
        model
    }

    fn metric(overflow: f64) -> MetricRecord {
        let hyper = Hyperparams {
            gamma: 1.0,
            density_weight: 1.0,
        };
        let mut r = MetricRecord::new(IterationId::default(), 0, &hyper);
        r.overflow = Some(overflow);
        r
    }

    fn changed() -> AreaAdjustment {
        AreaAdjustment {
            area: true,
            route_area: true,
            pin_area: false,
        }
    }

    #[test]
    fn restart_rolls_back_the_optimizer() {
        let mut model = model(changed());
        let mut optimizer = Optimizer::new(OptimizerKind::Nesterov, 0.01).unwrap();
        let initial = optimizer.snapshot();
        let mut adjuster = RoutabilityAdjuster::new(&params(), initial.clone());

        let mut hyper = Hyperparams {
            gamma: 1.0,
            density_weight: 3.0,
        };
        let mut pos = array![0.0, 0.0, 0.0, 0.0];
        for _ in 0..3 {
            optimizer.step(
                &mut pos,
                |p| model.obj_and_grad(p, &hyper),
                |p| model.project(p),
            );
        }
        assert_ne!(optimizer.snapshot(), initial);

        let restart = adjuster
            .optimize(&mut model, &mut pos, &metric(0.1), &mut optimizer, &mut hyper, 0.01)
            .unwrap()
            .expect("areas changed");

        assert_eq!(restart.sub_iteration, 7);
        assert_eq!(hyper.density_weight, 5.0);
        assert_eq!(restart.density_weight, 5.0);
        let expected_lr = model.estimate_initial_learning_rate(&pos, 0.01, &hyper);
        assert_eq!(restart.learning_rate, expected_lr);
        assert_eq!(optimizer.learning_rate(), expected_lr);
        match (optimizer.snapshot(), initial) {
            (OptimizerSnapshot::Nesterov(now), OptimizerSnapshot::Nesterov(then)) => {
                assert_eq!(now.state, then.state);
                assert!(now.state.is_none());
            }
            other => panic!("unexpected snapshots {other:?}"),
        }

        let ops = model.routability.as_ref().unwrap();
        assert_eq!(ops.resets, 1);
        assert!(ops.saw_route_map);
        assert!(!ops.saw_pin_map);
        assert_eq!(adjuster.state().num_area_adjust, 1);
    }

    #[test]
    fn never_exceeds_the_adjustment_cap() {
        let mut model = model(changed());
        let mut optimizer = Optimizer::new(OptimizerKind::Sgd, 0.01).unwrap();
        let mut adjuster = RoutabilityAdjuster::new(&params(), optimizer.snapshot());
        let mut hyper = Hyperparams {
            gamma: 1.0,
            density_weight: 1.0,
        };
        let mut pos = array![0.0, 0.0, 0.0, 0.0];
        let mut restarts = 0;
        for _ in 0..10 {
            if adjuster
                .optimize(&mut model, &mut pos, &metric(0.0), &mut optimizer, &mut hyper, 0.01)
                .unwrap()
                .is_some()
            {
                restarts += 1;
            }
        }
        assert_eq!(restarts, 2);
        assert_eq!(adjuster.state().num_area_adjust, 2);
        assert_eq!(model.routability.as_ref().unwrap().calls, 2);
    }

    #[test]
    fn high_overflow_skips_adjustment() {
        let mut model = model(changed());
        let mut optimizer = Optimizer::new(OptimizerKind::Sgd, 0.01).unwrap();
        let mut adjuster = RoutabilityAdjuster::new(&params(), optimizer.snapshot());
        let mut hyper = Hyperparams {
            gamma: 1.0,
            density_weight: 1.0,
        };
        let mut pos = array![0.0, 0.0, 0.0, 0.0];
        let result = adjuster
            .optimize(&mut model, &mut pos, &metric(0.5), &mut optimizer, &mut hyper, 0.01)
            .unwrap();
        assert!(result.is_none());
        assert_eq!(model.routability.as_ref().unwrap().calls, 0);
    }

    #[test]
    fn unchanged_area_keeps_going_and_remembers_flags() {
        let mut model = model(AreaAdjustment::default());
        let mut optimizer = Optimizer::new(OptimizerKind::Sgd, 0.01).unwrap();
        let mut adjuster = RoutabilityAdjuster::new(&params(), optimizer.snapshot());
        let mut hyper = Hyperparams {
            gamma: 1.0,
            density_weight: 1.0,
        };
        let mut pos = array![0.0, 0.0, 0.0, 0.0];
        let result = adjuster
            .optimize(&mut model, &mut pos, &metric(0.0), &mut optimizer, &mut hyper, 0.01)
            .unwrap();
        assert!(result.is_none());
        assert_eq!(hyper.density_weight, 1.0);
        assert!(!adjuster.state().adjust_route_area);
        assert_eq!(adjuster.state().num_area_adjust, 0);
    }

    #[test]
    fn model_without_area_ops_is_an_error() {
        let mut model = QuadraticModel::new(array![0.0, 0.0], 1.0);
        let mut optimizer = Optimizer::new(OptimizerKind::Sgd, 0.01).unwrap();
        let mut adjuster = RoutabilityAdjuster::new(&params(), optimizer.snapshot());
        let mut hyper = Hyperparams {
            gamma: 1.0,
            density_weight: 1.0,
        };
        let mut pos = array![0.0, 0.0];
        let err = adjuster
            .optimize(&mut model, &mut pos, &metric(0.0), &mut optimizer, &mut hyper, 0.01)
            .unwrap_err();
        assert!(matches!(err, PlaceError::RoutabilityUnsupported));
    }
}

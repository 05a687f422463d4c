//! Per-iteration metric snapshots.

use std::fmt;

use ndarray::Array1;
use serde::Serialize;

use crate::model::{Hyperparams, MetricSource};

///which (gamma, lambda, sub) step produced a record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IterationId {
    pub gamma: usize,
    pub lambda: usize,
    pub sub: usize,
}

impl IterationId {
    pub fn new(gamma: usize, lambda: usize, sub: usize) -> Self {
        IterationId { gamma, lambda, sub }
    }
}

/// Named metric producers a record can be populated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Hpwl,
    Overflow,
    RouteUtilization,
    PinUtilization,
}

impl MetricKind {
    pub fn name(&self) -> &'static str {
        match self {
            MetricKind::Hpwl => "hpwl",
            MetricKind::Overflow => "overflow",
            MetricKind::RouteUtilization => "route_utilization",
            MetricKind::PinUtilization => "pin_utilization",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricRecord {
    /// `None` for records taken outside the nested loop (post-processing).
    pub id: Option<IterationId>,
    pub iteration: usize,
    pub objective: Option<f64>,
    pub hpwl: f64,
    pub overflow: Option<f64>,
    pub max_density: Option<f64>,
    pub gamma: Option<f64>,
    pub density_weight: Option<f64>,
    pub route_utilization: Option<f64>,
    pub pin_utilization: Option<f64>,
    /// Wall-clock seconds spent on the step.
    pub eval_time: Option<f64>,
}

impl MetricRecord {
    /// A record for one descent step. Takes its own copy of the hyperparameters.
    pub fn new(id: IterationId, iteration: usize, hyper: &Hyperparams) -> Self {
        MetricRecord {
            id: Some(id),
            iteration,
            objective: None,
            hpwl: 0.0,
            overflow: None,
            max_density: None,
            gamma: Some(hyper.gamma),
            density_weight: Some(hyper.density_weight),
            route_utilization: None,
            pin_utilization: None,
            eval_time: None,
        }
    }

    /// A record outside the nested loop, e.g. after legalization.
    pub fn standalone(iteration: usize) -> Self {
        MetricRecord {
            id: None,
            iteration,
            objective: None,
            hpwl: 0.0,
            overflow: None,
            max_density: None,
            gamma: None,
            density_weight: None,
            route_utilization: None,
            pin_utilization: None,
            eval_time: None,
        }
    }

    pub fn evaluate<S: MetricSource + ?Sized>(
        &mut self,
        source: &S,
        kinds: &[MetricKind],
        pos: &Array1<f64>,
    ) {
        for kind in kinds {
            match kind {
                MetricKind::Hpwl => self.hpwl = source.hpwl(pos),
                MetricKind::Overflow => {
                    let (overflow, max_density) = source.overflow(pos);
                    self.overflow = Some(overflow);
                    self.max_density = Some(max_density);
                }
                MetricKind::RouteUtilization => {
                    self.route_utilization = source
                        .route_utilization_map(pos)
                        .map(|map| map.fold(0.0, |m: f64, &v| m.max(v)));
                }
                MetricKind::PinUtilization => {
                    self.pin_utilization = source
                        .pin_utilization_map(pos)
                        .map(|map| map.fold(0.0, |m: f64, &v| m.max(v)));
                }
            }
        }
    }

    ///overflow, treating a record that never measured it as fully overflowing
    pub fn overflow_or_max(&self) -> f64 {
        self.overflow.unwrap_or(f64::INFINITY)
    }

    pub fn max_density_or_max(&self) -> f64 {
        self.max_density.unwrap_or(f64::INFINITY)
    }

    pub fn objective_or_nan(&self) -> f64 {
        self.objective.unwrap_or(f64::NAN)
    }
}

impl fmt::Display for MetricRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "iteration {:4}", self.iteration)?;
        if let Some(id) = self.id {
            write!(f, ", ({:4}, {:2}, {:2})", id.gamma, id.lambda, id.sub)?;
        }
        if let Some(objective) = self.objective {
            write!(f, ", Obj {:.6E}", objective)?;
        }
        if let Some(weight) = self.density_weight {
            write!(f, ", DensityWeight {:.6E}", weight)?;
        }
        write!(f, ", HPWL {:.6E}", self.hpwl)?;
        if let Some(overflow) = self.overflow {
            write!(f, ", Overflow {:.6E}", overflow)?;
        }
        if let Some(max_density) = self.max_density {
            write!(f, ", MaxDensity {:.3E}", max_density)?;
        }
        if let Some(gamma) = self.gamma {
            write!(f, ", gamma {:.6E}", gamma)?;
        }
        if let Some(route) = self.route_utilization {
            write!(f, ", RouteOverflow {:.6E}", route)?;
        }
        if let Some(pin) = self.pin_utilization {
            write!(f, ", PinOverflow {:.6E}", pin)?;
        }
        if let Some(t) = self.eval_time {
            write!(f, ", time {:.3}ms", t * 1000.0)?;
        }
        Ok(())
    }
}

/// Records of one lambda iteration, in sub-step order.
pub type SubHistory = Vec<MetricRecord>;
/// Sub histories of one gamma iteration.
pub type LambdaHistory = Vec<SubHistory>;
/// Lambda histories of one stage.
pub type GammaHistory = Vec<LambdaHistory>;

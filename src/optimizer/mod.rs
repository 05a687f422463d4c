//! The descent methods a stage can run, behind one `Optimizer` front.

pub mod gradient;
pub mod nesterov;

use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::config::{OptimizerKind, StageConfig};
use crate::error::{PlaceError, PlaceResult};
use gradient::{GradientDescent, GradientSnapshot};
use nesterov::{NesterovLineSearch, NesterovSnapshot, StepRevert};

/// What one external step did.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StepReport {
    /// Objective at the position the step started from.
    pub start_objective: f64,
    /// Objective at the new iterate, when the method evaluated it.
    pub end_objective: Option<f64>,
    pub step_size: f64,
    pub backtracks: usize,
    pub evaluations: usize,
}

///exact copy of an optimizer, for rolling a stage back
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum OptimizerSnapshot {
    Nesterov(NesterovSnapshot),
    Gradient(GradientSnapshot),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Optimizer {
    Nesterov(NesterovLineSearch),
    Gradient(GradientDescent),
}

impl Optimizer {
    pub fn new(kind: OptimizerKind, learning_rate: f64) -> PlaceResult<Self> {
        match kind {
            OptimizerKind::Nesterov => Ok(Optimizer::Nesterov(NesterovLineSearch::new(learning_rate)?)),
            other => Ok(Optimizer::Gradient(GradientDescent::new(other, learning_rate)?)),
        }
    }

    pub fn for_stage(stage: &StageConfig) -> PlaceResult<Self> {
        let optimizer = Self::new(stage.optimizer, stage.learning_rate)?;
        Ok(match optimizer {
            Optimizer::Nesterov(nesterov) if stage.revert_step_size => {
                Optimizer::Nesterov(nesterov.with_revert(Some(StepRevert {
                    factor: stage.step_control_factor,
                })))
            }
            other => other,
        })
    }

    pub fn kind(&self) -> OptimizerKind {
        match self {
            Optimizer::Nesterov(_) => OptimizerKind::Nesterov,
            Optimizer::Gradient(g) => g.kind(),
        }
    }

    pub fn step<F, P>(&mut self, pos: &mut Array1<f64>, obj_and_grad: F, project: P) -> StepReport
    where
        F: FnMut(&Array1<f64>) -> (f64, Array1<f64>),
        P: Fn(&mut Array1<f64>),
    {
        match self {
            Optimizer::Nesterov(n) => n.step(pos, obj_and_grad, project),
            Optimizer::Gradient(g) => g.step(pos, obj_and_grad, project),
        }
    }

    pub fn learning_rate(&self) -> f64 {
        match self {
            Optimizer::Nesterov(n) => n.learning_rate(),
            Optimizer::Gradient(g) => g.learning_rate(),
        }
    }

    pub fn set_learning_rate(&mut self, learning_rate: f64) -> PlaceResult<()> {
        match self {
            Optimizer::Nesterov(n) => n.set_learning_rate(learning_rate),
            Optimizer::Gradient(g) => g.set_learning_rate(learning_rate),
        }
    }

    /// lr *= factor for the simple kinds; the line search picks its own step size.
    pub fn decay_learning_rate(&mut self, factor: f64) -> PlaceResult<()> {
        match self {
            Optimizer::Nesterov(_) => Ok(()),
            Optimizer::Gradient(g) => g.set_learning_rate(g.learning_rate() * factor),
        }
    }

    pub fn snapshot(&self) -> OptimizerSnapshot {
        match self {
            Optimizer::Nesterov(n) => OptimizerSnapshot::Nesterov(n.snapshot()),
            Optimizer::Gradient(g) => OptimizerSnapshot::Gradient(g.snapshot()),
        }
    }

    pub fn restore(&mut self, snapshot: &OptimizerSnapshot) -> PlaceResult<()> {
        match (self, snapshot) {
            (Optimizer::Nesterov(n), OptimizerSnapshot::Nesterov(s)) => {
                n.restore(s);
                Ok(())
            }
            (Optimizer::Gradient(g), OptimizerSnapshot::Gradient(s)) => g.restore(s),
            (optimizer, snapshot) => Err(PlaceError::SnapshotMismatch {
                expected: optimizer.kind().name(),
                found: snapshot.kind().name(),
            }),
        }
    }
}

impl OptimizerSnapshot {
    pub fn kind(&self) -> OptimizerKind {
        match self {
            OptimizerSnapshot::Nesterov(_) => OptimizerKind::Nesterov,
            OptimizerSnapshot::Gradient(g) => g.kind,
        }
    }
}

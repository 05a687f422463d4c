//! Single-evaluation descent kinds: plain SGD, heavy-ball and Nesterov momentum, Adam.

use ndarray::{Array1, Zip};
use serde::{Deserialize, Serialize};

use super::nesterov::check_learning_rate;
use super::StepReport;
use crate::config::OptimizerKind;
use crate::error::{PlaceError, PlaceResult};

pub const MOMENTUM: f64 = 0.9;
pub const ADAM_BETA1: f64 = 0.9;
pub const ADAM_BETA2: f64 = 0.999;
pub const ADAM_EPS: f64 = 1e-8;

///buffers for the momentum and adam variants, empty until the first step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GradientState {
    /// momentum buffer, or Adam's first moment
    pub buffer: Option<Array1<f64>>,
    /// Adam's second moment
    pub second_moment: Option<Array1<f64>>,
    pub steps: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradientSnapshot {
    pub kind: OptimizerKind,
    pub learning_rate: f64,
    pub state: GradientState,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GradientDescent {
    kind: OptimizerKind,
    learning_rate: f64,
    state: GradientState,
}

impl GradientDescent {
    pub fn new(kind: OptimizerKind, learning_rate: f64) -> PlaceResult<Self> {
        if kind == OptimizerKind::Nesterov {
            // the line search lives in its own type
            return Err(PlaceError::UnsupportedOptimizer(kind.name().to_string()));
        }
        check_learning_rate(learning_rate)?;
        Ok(GradientDescent {
            kind,
            learning_rate,
            state: GradientState::default(),
        })
    }

    pub fn kind(&self) -> OptimizerKind {
        self.kind
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn set_learning_rate(&mut self, learning_rate: f64) -> PlaceResult<()> {
        check_learning_rate(learning_rate)?;
        self.learning_rate = learning_rate;
        Ok(())
    }

    pub fn state(&self) -> &GradientState {
        &self.state
    }

    pub fn snapshot(&self) -> GradientSnapshot {
        GradientSnapshot {
            kind: self.kind,
            learning_rate: self.learning_rate,
            state: self.state.clone(),
        }
    }

    pub fn restore(&mut self, snapshot: &GradientSnapshot) -> PlaceResult<()> {
        if snapshot.kind != self.kind {
            return Err(PlaceError::SnapshotMismatch {
                expected: self.kind.name(),
                found: snapshot.kind.name(),
            });
        }
        self.learning_rate = snapshot.learning_rate;
        self.state = snapshot.state.clone();
        Ok(())
    }

    ///evaluate once at the projected position, apply one update, project again
    pub fn step<F, P>(&mut self, pos: &mut Array1<f64>, mut obj_and_grad: F, project: P) -> StepReport
    where
        F: FnMut(&Array1<f64>) -> (f64, Array1<f64>),
        P: Fn(&mut Array1<f64>),
    {
        project(pos);
        let (objective, grad) = obj_and_grad(pos);
        let lr = self.learning_rate;
        self.state.steps += 1;

        match self.kind {
            OptimizerKind::Sgd | OptimizerKind::Nesterov => {
                pos.scaled_add(-lr, &grad);
            }
            OptimizerKind::SgdMomentum => {
                let buffer = update_momentum(&mut self.state.buffer, &grad);
                pos.scaled_add(-lr, buffer);
            }
            OptimizerKind::SgdNesterov => {
                let buffer = update_momentum(&mut self.state.buffer, &grad);
                // g + mu * b
                let lookahead = &grad + &(MOMENTUM * &*buffer);
                pos.scaled_add(-lr, &lookahead);
            }
            OptimizerKind::Adam => {
                let t = self.state.steps as i32;
                let m = self
                    .state
                    .buffer
                    .get_or_insert_with(|| Array1::zeros(grad.len()));
                let v = self
                    .state
                    .second_moment
                    .get_or_insert_with(|| Array1::zeros(grad.len()));
                let bias1 = 1.0 - ADAM_BETA1.powi(t);
                let bias2 = 1.0 - ADAM_BETA2.powi(t);
                Zip::from(&mut *pos)
                    .and(&mut *m)
                    .and(&mut *v)
                    .and(&grad)
                    .for_each(|p, m, v, &g| {
                        *m = ADAM_BETA1 * *m + (1.0 - ADAM_BETA1) * g;
                        *v = ADAM_BETA2 * *v + (1.0 - ADAM_BETA2) * g * g;
                        let m_hat = *m / bias1;
                        let v_hat = *v / bias2;
                        *p -= lr * m_hat / (v_hat.sqrt() + ADAM_EPS);
                    });
            }
        }
        project(pos);

        StepReport {
            start_objective: objective,
            end_objective: None,
            step_size: lr,
            backtracks: 0,
            evaluations: 1,
        }
    }
}

/// b = mu * b + g, starting from b = 0 so the first step uses g itself
fn update_momentum<'a>(buffer: &'a mut Option<Array1<f64>>, grad: &Array1<f64>) -> &'a Array1<f64> {
    let b = buffer.get_or_insert_with(|| Array1::zeros(grad.len()));
    Zip::from(&mut *b)
        .and(grad)
        .for_each(|b, &g| *b = MOMENTUM * *b + g);
    b
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn linear(slope: Array1<f64>) -> impl FnMut(&Array1<f64>) -> (f64, Array1<f64>) {
        move |x: &Array1<f64>| (x.dot(&slope), slope.clone())
    }

    fn no_projection(_: &mut Array1<f64>) {}

    #[test]
    fn nesterov_kind_is_not_a_gradient_kind() {
        assert!(GradientDescent::new(OptimizerKind::Nesterov, 0.1).is_err());
        assert!(matches!(
            GradientDescent::new(OptimizerKind::Sgd, -0.1),
            Err(PlaceError::InvalidLearningRate(_))
        ));
    }

    #[test]
    fn sgd_step() {
        let mut opt = GradientDescent::new(OptimizerKind::Sgd, 0.5).unwrap();
        let mut pos = array![1.0, 1.0];
        let report = opt.step(&mut pos, linear(array![2.0, -4.0]), no_projection);
        assert_eq!(pos, array![0.0, 3.0]);
        assert_eq!(report.start_objective, -2.0);
        assert_eq!(report.evaluations, 1);
    }

    #[test]
    fn heavy_ball_accumulates() {
        let mut opt = GradientDescent::new(OptimizerKind::SgdMomentum, 1.0).unwrap();
        let mut pos = array![0.0];
        opt.step(&mut pos, linear(array![1.0]), no_projection);
        assert_relative_eq!(pos[0], -1.0);
        opt.step(&mut pos, linear(array![1.0]), no_projection);
        // b = 0.9 * 1 + 1
        assert_relative_eq!(pos[0], -2.9);
    }

    #[test]
    fn nesterov_momentum_looks_ahead() {
        let mut opt = GradientDescent::new(OptimizerKind::SgdNesterov, 1.0).unwrap();
        let mut pos = array![0.0];
        opt.step(&mut pos, linear(array![1.0]), no_projection);
        // g + mu * b with b = g
        assert_relative_eq!(pos[0], -1.9);
    }

    #[test]
    fn adam_first_step_moves_by_learning_rate() {
        let mut opt = GradientDescent::new(OptimizerKind::Adam, 0.1).unwrap();
        let mut pos = array![1.0, 1.0];
        opt.step(&mut pos, linear(array![3.0, -0.5]), no_projection);
        // bias correction makes the first update lr * sign(g)
        assert_relative_eq!(pos, array![0.9, 1.1], epsilon = 1e-6);
        assert_eq!(opt.state().steps, 1);
    }

    #[test]
    fn snapshot_restore_and_kind_check() {
        let mut opt = GradientDescent::new(OptimizerKind::Adam, 0.1).unwrap();
        let snapshot = opt.snapshot();
        let mut pos = array![1.0];
        opt.step(&mut pos, linear(array![1.0]), no_projection);
        assert_ne!(opt.snapshot(), snapshot);
        opt.restore(&snapshot).unwrap();
        assert_eq!(opt.snapshot(), snapshot);

        let other = GradientDescent::new(OptimizerKind::Sgd, 0.1).unwrap().snapshot();
        let err = opt.restore(&other).unwrap_err();
        assert!(matches!(
            err,
            PlaceError::SnapshotMismatch { expected: "adam", found: "sgd" }
        ));
    }
}

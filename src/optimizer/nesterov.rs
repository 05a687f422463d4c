//! Nesterov accelerated gradient with a backtracking step-size search.
//!
//! This is algorithm 2 of the ePlace paper: the step size is the inverse of a
//! local Lipschitz estimate taken from two consecutive extrapolated points and
//! their gradients, and the search backs off until that estimate stops
//! shrinking.

use ndarray::Array1;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::StepReport;
use crate::error::{PlaceError, PlaceResult};
use crate::model::{l2_distance, squared_distance};

/// Floor added to every gradient-delta denominator.
pub const MIN_GRAD_NORM: f64 = 1e-9;
/// Step size used when the bootstrap estimate degenerates and there is no learning rate to fall back on.
pub const MIN_ALPHA_VAL: f64 = 1.0;
pub const MAX_BACKTRACKS: usize = 10;
/// A candidate is accepted once its estimate is at least this fraction of the current one.
pub const ACCEPT_RATIO: f64 = 0.95;

///everything the method carries between steps, for its single variable group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NesterovState {
    /// major solution
    pub u_k: Array1<f64>,
    /// reference (extrapolated) solution, the one handed back to the caller
    pub v_k: Array1<f64>,
    /// gradient at `v_k`
    pub g_k: Array1<f64>,
    /// objective at `v_k`
    pub obj_k: f64,
    pub v_k_1: Array1<f64>,
    pub g_k_1: Array1<f64>,
    pub obj_k_1: f64,
    pub a_k: f64,
    pub alpha_k: f64,
    /// First step size estimate, the recovery target for the revert heuristic.
    pub init_alpha: f64,
    pub obj_eval_count: usize,
}

impl NesterovState {
    ///u_0 = v_0 = p, plus one plain gradient step to get a second point for the first step size estimate
    fn bootstrap<F>(p: &Array1<f64>, lr: f64, obj_and_grad: &mut F) -> Self
    where
        F: FnMut(&Array1<f64>) -> (f64, Array1<f64>),
    {
        let (obj_k, g_k) = obj_and_grad(p);
        let v_k_1 = p - &(lr * &g_k);
        let (obj_k_1, g_k_1) = obj_and_grad(&v_k_1);

        let estimate = l2_distance(p, &v_k_1) / (MIN_GRAD_NORM + l2_distance(&g_k, &g_k_1));
        let alpha_k = if is_positive(estimate) {
            estimate
        } else if lr > 0.0 {
            lr
        } else {
            MIN_ALPHA_VAL
        };

        NesterovState {
            u_k: p.clone(),
            v_k: p.clone(),
            g_k,
            obj_k,
            v_k_1,
            g_k_1,
            obj_k_1,
            a_k: 1.0,
            alpha_k,
            init_alpha: alpha_k,
            obj_eval_count: 2,
        }
    }
}

/// Optional clamp on step-size growth.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepRevert {
    /// Growth is capped at `factor * alpha_k`.
    pub factor: f64,
}

impl Default for StepRevert {
    fn default() -> Self {
        StepRevert { factor: 0.99 }
    }
}

/// Serializable copy of the whole optimizer, state included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NesterovSnapshot {
    pub learning_rate: f64,
    pub revert: Option<StepRevert>,
    pub state: Option<NesterovState>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NesterovLineSearch {
    learning_rate: f64,
    revert: Option<StepRevert>,
    state: Option<NesterovState>,
}

impl NesterovLineSearch {
    pub fn new(learning_rate: f64) -> PlaceResult<Self> {
        check_learning_rate(learning_rate)?;
        Ok(NesterovLineSearch {
            learning_rate,
            revert: None,
            state: None,
        })
    }

    pub fn with_revert(mut self, revert: Option<StepRevert>) -> Self {
        self.revert = revert;
        self
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    ///only read when the state is (re)bootstrapped
    pub fn set_learning_rate(&mut self, learning_rate: f64) -> PlaceResult<()> {
        check_learning_rate(learning_rate)?;
        self.learning_rate = learning_rate;
        Ok(())
    }

    pub fn state(&self) -> Option<&NesterovState> {
        self.state.as_ref()
    }

    /// Drops all state; the next step bootstraps again.
    pub fn reset(&mut self) {
        self.state = None;
    }

    pub fn snapshot(&self) -> NesterovSnapshot {
        NesterovSnapshot {
            learning_rate: self.learning_rate,
            revert: self.revert,
            state: self.state.clone(),
        }
    }

    pub fn restore(&mut self, snapshot: &NesterovSnapshot) {
        self.learning_rate = snapshot.learning_rate;
        self.revert = snapshot.revert;
        self.state = snapshot.state.clone();
    }

    /// One accelerated step. `pos` is the live extrapolated iterate: it seeds the
    /// state on the first call and receives `v_k` afterwards.
    pub fn step<F, P>(&mut self, pos: &mut Array1<f64>, mut obj_and_grad: F, project: P) -> StepReport
    where
        F: FnMut(&Array1<f64>) -> (f64, Array1<f64>),
        P: Fn(&mut Array1<f64>),
    {
        let lr = self.learning_rate;
        let revert = self.revert;
        let fresh = self.state.is_none();
        let state = self
            .state
            .get_or_insert_with(|| NesterovState::bootstrap(pos, lr, &mut obj_and_grad));

        let mut evaluations = 0;
        if fresh {
            evaluations += 2;
        } else {
            // v_k and the caller's position are the same iterate
            state.v_k.assign(pos);
        }

        //line search with alpha_k as hint
        let a_kp1 = next_acceleration(state.a_k);
        let coef = (state.a_k - 1.0) / a_kp1;
        debug!(
            alpha_k = state.alpha_k,
            coef,
            delta_grad_norm = l2_distance(&state.g_k, &state.g_k_1),
            "nesterov line search"
        );

        let mut backtracks = 0;
        let (u_kp1, v_kp1, f_kp1, g_kp1) = loop {
            let u_kp1 = &state.v_k - &(state.alpha_k * &state.g_k);
            let mut v_kp1 = &u_kp1 + &(coef * &(&u_kp1 - &state.u_k));
            // g_kp1 must belong to the projected point
            project(&mut v_kp1);
            let (f_kp1, g_kp1) = obj_and_grad(&v_kp1);

            let delta_grad = squared_distance(&g_kp1, &state.g_k);
            let alpha_kp1 =
                (squared_distance(&v_kp1, &state.v_k) / (MIN_GRAD_NORM + delta_grad)).sqrt();

            backtracks += 1;
            evaluations += 1;
            state.obj_eval_count += 1;
            debug!(
                alpha_k = state.alpha_k,
                alpha_kp1,
                delta_grad,
                obj_eval_count = state.obj_eval_count,
                "backtrack"
            );

            if alpha_kp1 > ACCEPT_RATIO * state.alpha_k || backtracks >= MAX_BACKTRACKS {
                let accepted = accepted_step_size(state.alpha_k, alpha_kp1, state.init_alpha, revert);
                if is_positive(accepted) {
                    state.alpha_k = accepted;
                }
                break (u_kp1, v_kp1, f_kp1, g_kp1);
            }
            if is_positive(alpha_kp1) {
                state.alpha_k = alpha_kp1;
            }
            if delta_grad < MIN_GRAD_NORM {
                break (u_kp1, v_kp1, f_kp1, g_kp1);
            }
        };

        state.v_k_1 = std::mem::replace(&mut state.v_k, v_kp1);
        state.g_k_1 = std::mem::replace(&mut state.g_k, g_kp1);
        state.obj_k_1 = state.obj_k;
        state.obj_k = f_kp1;
        state.u_k = u_kp1;
        state.a_k = a_kp1;

        // the solution is nominally u_k, but the gradient and the density weight update want v_k
        pos.assign(&state.v_k);

        StepReport {
            start_objective: state.obj_k_1,
            end_objective: Some(state.obj_k),
            step_size: state.alpha_k,
            backtracks,
            evaluations,
        }
    }
}

/// a_{k+1} = (1 + sqrt(4 a_k^2 + 1)) / 2
pub fn next_acceleration(a_k: f64) -> f64 {
    (1.0 + (4.0 * a_k * a_k + 1.0).sqrt()) / 2.0
}

///the step size kept once a candidate is accepted. With revert on, growth is capped at
///`factor * alpha_k`, and a step that has collapsed below 1% of the first estimate jumps back to it
pub fn accepted_step_size(
    alpha_k: f64,
    alpha_kp1: f64,
    init_alpha: f64,
    revert: Option<StepRevert>,
) -> f64 {
    match revert {
        Some(StepRevert { factor }) if alpha_kp1 > alpha_k => {
            let capped = (factor * alpha_k).min(alpha_kp1);
            if capped < 0.01 * init_alpha {
                debug!(init_alpha, "revert to init alpha_k");
                init_alpha
            } else {
                capped
            }
        }
        _ => alpha_kp1,
    }
}

fn is_positive(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

pub(crate) fn check_learning_rate(learning_rate: f64) -> PlaceResult<()> {
    if learning_rate >= 0.0 {
        Ok(())
    } else {
        Err(PlaceError::InvalidLearningRate(learning_rate))
    }
}

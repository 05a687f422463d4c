//! Spectral Poisson solve on the bin grid.
//!
//! With `w_u = pi*u/M` the density of an `M x N` grid expands as
//!
//! ```text
//! rho(i, j) = sum_u sum_v c_u c_v a_uv cos(w_u (i + 1/2)) cos(w_v (j + 1/2))
//! ```
//!
//! where `c_0 = 1/2` and `c_k = 1` otherwise, which is exactly what a DCT-III pass
//! along each axis evaluates. The potential divides each coefficient by
//! `k_u^2 + k_v^2` (the frequencies in layout units) and the field is the
//! negated potential gradient, one sine pass and one cosine pass per axis.

use std::sync::Arc;

use ndarray::{Array1, Array2, Axis};
use ndrustfft::{nddct2, DctHandler, Normalization};
use rustdct::{Dct3, DctPlanner, Dst3, TransformType2And3};

use crate::util::calc_w;

/// Potential and field sampled at bin centers.
#[derive(Debug, Clone, PartialEq)]
pub struct ElectricField {
    pub potential: Array2<f64>,
    pub field_x: Array2<f64>,
    pub field_y: Array2<f64>,
}

pub struct PoissonSolver {
    num_bins_x: usize,
    num_bins_y: usize,
    handler_x: DctHandler<f64>,
    handler_y: DctHandler<f64>,
    dct3_x: Arc<dyn TransformType2And3<f64>>,
    dst3_x: Arc<dyn TransformType2And3<f64>>,
    dct3_y: Arc<dyn TransformType2And3<f64>>,
    dst3_y: Arc<dyn TransformType2And3<f64>>,
    k_x: Array1<f64>,
    k_y: Array1<f64>,
    ///1 / (k_u^2 + k_v^2), zero at the DC term
    inv_k2: Array2<f64>,
}

impl PoissonSolver {
    pub fn new(num_bins_x: usize, num_bins_y: usize, bin_w: f64, bin_h: f64) -> Self {
        let k_x = Array1::from_iter((0..num_bins_x).map(|u| calc_w(u, num_bins_x) / bin_w));
        let k_y = Array1::from_iter((0..num_bins_y).map(|v| calc_w(v, num_bins_y) / bin_h));

        let mut inv_k2 = Array2::<f64>::zeros((num_bins_x, num_bins_y));
        for ((u, v), value) in inv_k2.indexed_iter_mut() {
            //the formula as written divides by zero here
            if u != 0 || v != 0 {
                *value = 1.0 / (k_x[u].powi(2) + k_y[v].powi(2));
            }
        }

        let mut planner = DctPlanner::new();
        PoissonSolver {
            num_bins_x,
            num_bins_y,
            handler_x: DctHandler::new(num_bins_x).normalization(Normalization::None),
            handler_y: DctHandler::new(num_bins_y).normalization(Normalization::None),
            dct3_x: planner.plan_dct3(num_bins_x),
            dst3_x: planner.plan_dst3(num_bins_x),
            dct3_y: planner.plan_dct3(num_bins_y),
            dst3_y: planner.plan_dst3(num_bins_y),
            k_x,
            k_y,
            inv_k2,
        }
    }

    ///the a_uv of the expansion above, via a DCT-II along each axis
    pub fn coefficients(&self, density: &Array2<f64>) -> Array2<f64> {
        let mut first_pass = Array2::<f64>::zeros(density.raw_dim());
        let mut coeffs = Array2::<f64>::zeros(density.raw_dim());
        nddct2(density, &mut first_pass, &self.handler_x, 0);
        nddct2(&first_pass, &mut coeffs, &self.handler_y, 1);

        let scale = 4.0 / (self.num_bins_x * self.num_bins_y) as f64;
        coeffs.mapv_inplace(|a| a * scale);
        coeffs
    }

    pub fn solve(&self, density: &Array2<f64>) -> ElectricField {
        let psi_coeffs = self.coefficients(density) * &self.inv_k2;

        let mut potential = psi_coeffs.clone();
        cos_pass(&mut potential, Axis(0), self.dct3_x.as_ref());
        cos_pass(&mut potential, Axis(1), self.dct3_y.as_ref());

        // E = -grad psi: each derivative turns a cosine into k * sine
        let mut field_x = &psi_coeffs * &self.k_x.view().insert_axis(Axis(1));
        sin_pass(&mut field_x, Axis(0), self.dst3_x.as_ref());
        cos_pass(&mut field_x, Axis(1), self.dct3_y.as_ref());

        let mut field_y = &psi_coeffs * &self.k_y;
        cos_pass(&mut field_y, Axis(0), self.dct3_x.as_ref());
        sin_pass(&mut field_y, Axis(1), self.dst3_y.as_ref());

        ElectricField {
            potential,
            field_x,
            field_y,
        }
    }
}

///sum over bins of charge times potential
pub fn energy(charge: &Array2<f64>, potential: &Array2<f64>) -> f64 {
    charge.iter().zip(potential.iter()).map(|(q, psi)| q * psi).sum()
}

fn cos_pass(map: &mut Array2<f64>, axis: Axis, plan: &dyn TransformType2And3<f64>) {
    for_each_lane(map, axis, |buffer| plan.process_dct3(buffer));
}

fn sin_pass(map: &mut Array2<f64>, axis: Axis, plan: &dyn TransformType2And3<f64>) {
    for_each_lane(map, axis, |buffer| {
        // DST-III starts at frequency 1, the zero frequency sine vanishes anyway
        buffer.rotate_left(1);
        if let Some(last) = buffer.last_mut() {
            *last = 0.0;
        }
        plan.process_dst3(buffer);
    });
}

fn for_each_lane(map: &mut Array2<f64>, axis: Axis, mut transform: impl FnMut(&mut [f64])) {
    let mut buffer = vec![0.0; map.len_of(axis)];
    for mut lane in map.lanes_mut(axis) {
        for (b, v) in buffer.iter_mut().zip(lane.iter()) {
            *b = *v;
        }
        transform(&mut buffer);
        for (v, b) in lane.iter_mut().zip(buffer.iter()) {
            *v = *b;
        }
    }
}

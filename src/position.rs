//! Flat position vectors and the rectangular-region projector.
//!
//! A position vector holds every node's lower-left corner as
//! `[x_0 .. x_{n-1}, y_0 .. y_{n-1}]`. The first `num_movable` nodes may move,
//! the rest are fixed.

use ndarray::Array1;
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{PlaceError, PlaceResult};
use crate::model::ConstraintProjector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionLayout {
    pub num_nodes: usize,
    pub num_movable: usize,
}

impl PositionLayout {
    pub fn new(num_nodes: usize, num_movable: usize) -> Self {
        PositionLayout {
            num_nodes,
            num_movable: num_movable.min(num_nodes),
        }
    }

    /// Length of the flat vector.
    pub fn len(&self) -> usize {
        2 * self.num_nodes
    }

    pub fn is_empty(&self) -> bool {
        self.num_nodes == 0
    }

    pub fn x(&self, node: usize) -> usize {
        node
    }

    pub fn y(&self, node: usize) -> usize {
        self.num_nodes + node
    }

    pub fn check(&self, pos: &Array1<f64>) -> PlaceResult<()> {
        if pos.len() != self.len() {
            return Err(PlaceError::PositionSize {
                expected: self.len(),
                found: pos.len(),
            });
        }
        Ok(())
    }

    /// Zeroes the gradient entries of fixed nodes.
    pub fn mask_fixed(&self, grad: &mut Array1<f64>) {
        for node in self.num_movable..self.num_nodes {
            grad[self.x(node)] = 0.0;
            grad[self.y(node)] = 0.0;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub xl: f64,
    pub yl: f64,
    pub xh: f64,
    pub yh: f64,
}

impl Region {
    pub fn new(xl: f64, yl: f64, xh: f64, yh: f64) -> Self {
        Region { xl, yl, xh, yh }
    }

    pub fn width(&self) -> f64 {
        self.xh - self.xl
    }

    pub fn height(&self) -> f64 {
        self.yh - self.yl
    }

    pub fn area(&self) -> f64 {
        self.width() * self.height()
    }
}

///clamps movable nodes back inside the region, using their current sizes so the whole footprint fits
#[derive(Debug, Clone, PartialEq)]
pub struct RegionProjector {
    layout: PositionLayout,
    region: Region,
    size_x: Array1<f64>,
    size_y: Array1<f64>,
}

impl RegionProjector {
    pub fn new(
        layout: PositionLayout,
        region: Region,
        size_x: Array1<f64>,
        size_y: Array1<f64>,
    ) -> Self {
        RegionProjector {
            layout,
            region,
            size_x,
            size_y,
        }
    }

    /// Projector for point-like nodes.
    pub fn points(layout: PositionLayout, region: Region) -> Self {
        let sizes = Array1::zeros(layout.num_nodes);
        Self::new(layout, region, sizes.clone(), sizes)
    }

    pub fn region(&self) -> Region {
        self.region
    }
}

impl ConstraintProjector for RegionProjector {
    fn project(&self, pos: &mut Array1<f64>) {
        let r = self.region;
        for node in 0..self.layout.num_movable {
            // a node wider than the region sticks to the low edge
            let x_hi = (r.xh - self.size_x[node]).max(r.xl);
            let y_hi = (r.yh - self.size_y[node]).max(r.yl);
            let ix = self.layout.x(node);
            let iy = self.layout.y(node);
            pos[ix] = clamp_finite(pos[ix], r.xl, x_hi);
            pos[iy] = clamp_finite(pos[iy], r.yl, y_hi);
        }
    }
}

fn clamp_finite(value: f64, lo: f64, hi: f64) -> f64 {
    if value.is_nan() {
        lo
    } else {
        value.clamp(lo, hi)
    }
}

///jitters movable nodes by up to half their size times `ratio`
pub fn add_noise(
    pos: &mut Array1<f64>,
    layout: PositionLayout,
    size_x: &Array1<f64>,
    size_y: &Array1<f64>,
    ratio: f64,
    rng: &mut StdRng,
) {
    for node in 0..layout.num_movable {
        pos[layout.x(node)] += (rng.gen::<f64>() - 0.5) * size_x[node] * ratio;
        pos[layout.y(node)] += (rng.gen::<f64>() - 0.5) * size_y[node] * ratio;
    }
}

//! Bin grid and the overlap-area density maps built on it.

use std::ops::Range;

use ndarray::{Array1, Array2, Zip};

use crate::position::{PositionLayout, Region};
use crate::util::{bin_range, overlap};

///a uniform grid of bins covering the placement region
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BinGrid {
    pub region: Region,
    pub num_bins_x: usize,
    pub num_bins_y: usize,
    pub bin_w: f64,
    pub bin_h: f64,
}

impl BinGrid {
    pub fn new(region: Region, num_bins_x: usize, num_bins_y: usize) -> Self {
        BinGrid {
            region,
            num_bins_x,
            num_bins_y,
            bin_w: region.width() / num_bins_x as f64,
            bin_h: region.height() / num_bins_y as f64,
        }
    }

    pub fn bin_area(&self) -> f64 {
        self.bin_w * self.bin_h
    }

    pub fn zeros(&self) -> Array2<f64> {
        Array2::zeros((self.num_bins_x, self.num_bins_y))
    }

    /// Bin holding a point, points outside go to the nearest edge bin.
    pub fn bin_of(&self, x: f64, y: f64) -> (usize, usize) {
        let bx = ((x - self.region.xl) / self.bin_w).floor().max(0.0) as usize;
        let by = ((y - self.region.yl) / self.bin_h).floor().max(0.0) as usize;
        (
            bx.min(self.num_bins_x.saturating_sub(1)),
            by.min(self.num_bins_y.saturating_sub(1)),
        )
    }

    ///calls `f(bx, by, area)` for every bin the rectangle overlaps with nonzero area
    pub fn for_each_overlap(
        &self,
        xl: f64,
        yl: f64,
        xh: f64,
        yh: f64,
        mut f: impl FnMut(usize, usize, f64),
    ) {
        let r = self.region;
        for bx in bin_range(xl, xh, r.xl, self.bin_w, self.num_bins_x) {
            let bin_xl = r.xl + bx as f64 * self.bin_w;
            let ox = overlap(xl, xh, bin_xl, bin_xl + self.bin_w);
            if ox <= 0.0 {
                continue;
            }
            for by in bin_range(yl, yh, r.yl, self.bin_h, self.num_bins_y) {
                let bin_yl = r.yl + by as f64 * self.bin_h;
                let oy = overlap(yl, yh, bin_yl, bin_yl + self.bin_h);
                if oy > 0.0 {
                    f(bx, by, ox * oy);
                }
            }
        }
    }
}

/// Movable node rectangles as the density sees them.
///
/// A node narrower than `sqrt(2)` bins is widened to that size around its
/// center and its charge scaled down by the same ratio, so tiny cells still
/// see a smooth field.
#[derive(Debug, Clone, PartialEq)]
pub struct StretchedNodes {
    pub size_x: Array1<f64>,
    pub size_y: Array1<f64>,
    /// Shift from the node's lower-left corner to the stretched one.
    pub offset_x: Array1<f64>,
    pub offset_y: Array1<f64>,
    /// Charge per unit of stretched area.
    pub ratio: Array1<f64>,
}

impl StretchedNodes {
    pub fn new(
        grid: &BinGrid,
        layout: PositionLayout,
        size_x: &Array1<f64>,
        size_y: &Array1<f64>,
    ) -> Self {
        let n = layout.num_movable;
        let min_w = std::f64::consts::SQRT_2 * grid.bin_w;
        let min_h = std::f64::consts::SQRT_2 * grid.bin_h;

        let mut nodes = StretchedNodes {
            size_x: Array1::zeros(n),
            size_y: Array1::zeros(n),
            offset_x: Array1::zeros(n),
            offset_y: Array1::zeros(n),
            ratio: Array1::ones(n),
        };
        for i in 0..n {
            let sx = size_x[i].max(min_w);
            let sy = size_y[i].max(min_h);
            nodes.size_x[i] = sx;
            nodes.size_y[i] = sy;
            nodes.offset_x[i] = (size_x[i] - sx) / 2.0;
            nodes.offset_y[i] = (size_y[i] - sy) / 2.0;
            if sx * sy > 0.0 {
                nodes.ratio[i] = size_x[i] * size_y[i] / (sx * sy);
            }
        }
        nodes
    }

    /// Stretched rectangle of movable node `i` as `(xl, yl, xh, yh)`.
    pub fn rect(&self, layout: PositionLayout, pos: &Array1<f64>, i: usize) -> (f64, f64, f64, f64) {
        let xl = pos[layout.x(i)] + self.offset_x[i];
        let yl = pos[layout.y(i)] + self.offset_y[i];
        (xl, yl, xl + self.size_x[i], yl + self.size_y[i])
    }

    /// Charge-weighted overlap area of every movable node, accumulated per bin.
    pub fn density_map(&self, grid: &BinGrid, layout: PositionLayout, pos: &Array1<f64>) -> Array2<f64> {
        let mut map = grid.zeros();
        for i in 0..layout.num_movable {
            let (xl, yl, xh, yh) = self.rect(layout, pos, i);
            let ratio = self.ratio[i];
            grid.for_each_overlap(xl, yl, xh, yh, |bx, by, area| {
                map[[bx, by]] += ratio * area;
            });
        }
        map
    }
}

/// Plain overlap area of the given nodes per bin, no stretching.
pub fn node_area_map(
    grid: &BinGrid,
    layout: PositionLayout,
    size_x: &Array1<f64>,
    size_y: &Array1<f64>,
    pos: &Array1<f64>,
    nodes: Range<usize>,
) -> Array2<f64> {
    let mut map = grid.zeros();
    for i in nodes {
        let xl = pos[layout.x(i)];
        let yl = pos[layout.y(i)];
        grid.for_each_overlap(xl, yl, xl + size_x[i], yl + size_y[i], |bx, by, area| {
            map[[bx, by]] += area;
        });
    }
    map
}

///overlap area of the fixed nodes, scaled by the target density so a fully
///blocked bin has no capacity left
pub fn fixed_density_map(
    grid: &BinGrid,
    layout: PositionLayout,
    size_x: &Array1<f64>,
    size_y: &Array1<f64>,
    pos: &Array1<f64>,
    target_density: f64,
) -> Array2<f64> {
    let mut map = node_area_map(grid, layout, size_x, size_y, pos, layout.num_movable..layout.num_nodes);
    // overlapping fixed nodes never block more than the whole bin
    let bin_area = grid.bin_area();
    map.mapv_inplace(|a| a.min(bin_area) * target_density);
    map
}

/// Returns `(overflow, max_density)`.
///
/// overflow = sum over bins of max(0, movable + fixed - bin_area * target) / total movable area
pub fn overflow(
    grid: &BinGrid,
    movable: &Array2<f64>,
    fixed: &Array2<f64>,
    target_density: f64,
    total_movable_area: f64,
) -> (f64, f64) {
    let capacity = grid.bin_area() * target_density;
    let mut excess = 0.0;
    let mut max_density = 0.0f64;
    Zip::from(movable).and(fixed).for_each(|&m, &f| {
        excess += (m + f - capacity).max(0.0);
        max_density = max_density.max((m + f) / grid.bin_area());
    });
    let overflow = if total_movable_area > 0.0 {
        excess / total_movable_area
    } else {
        0.0
    };
    (overflow, max_density)
}

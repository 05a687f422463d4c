//! Congestion estimates and the node inflation they drive.

use ndarray::{Array1, Array2};

use crate::density::BinGrid;
use crate::design::Design;

/// Relative area growth below which an adjustment counts as "nothing changed".
pub const AREA_ADJUST_STOP_RATIO: f64 = 0.01;

///RUDY: every net spreads (w + h) / (w * h) of wire over its bounding box,
///then each bin is divided by its routing supply
pub fn rudy_map(design: &Design, grid: &BinGrid, pos: &Array1<f64>) -> Array2<f64> {
    let (pin_x, pin_y) = design.pin_positions(pos);
    let mut map = grid.zeros();
    for net in design.nets.iter().filter(|net| net.len() >= 2) {
        let (xl, xh) = bounds(net, &pin_x);
        let (yl, yh) = bounds(net, &pin_y);
        // a flat box still needs wire, give it at least one bin of extent
        let w = (xh - xl).max(grid.bin_w);
        let h = (yh - yl).max(grid.bin_h);
        let cx = (xl + xh) / 2.0;
        let cy = (yl + yh) / 2.0;
        let wire = (w + h) / (w * h);
        grid.for_each_overlap(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0, |bx, by, area| {
            map[[bx, by]] += wire * area;
        });
    }
    let supply = design.route_capacity * grid.bin_area();
    map.mapv_inplace(|v| v / supply);
    map
}

/// Pins per bin over the bin's pin supply.
pub fn pin_utilization_map(design: &Design, grid: &BinGrid, pos: &Array1<f64>) -> Array2<f64> {
    let (pin_x, pin_y) = design.pin_positions(pos);
    let mut map = grid.zeros();
    for (x, y) in pin_x.iter().zip(pin_y.iter()) {
        map[grid.bin_of(*x, *y)] += 1.0;
    }
    let supply = design.pin_capacity * grid.bin_area();
    map.mapv_inplace(|v| v / supply);
    map
}

fn bounds(net: &[usize], coords: &Array1<f64>) -> (f64, f64) {
    net.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &p| {
        (lo.min(coords[p]), hi.max(coords[p]))
    })
}

///overlap-weighted average of `map` over the bins each movable node covers
pub fn node_utilization(design: &Design, grid: &BinGrid, pos: &Array1<f64>, map: &Array2<f64>) -> Array1<f64> {
    let layout = design.layout;
    Array1::from_iter((0..layout.num_movable).map(|i| {
        let xl = pos[layout.x(i)];
        let yl = pos[layout.y(i)];
        let mut covered = 0.0;
        let mut weighted = 0.0;
        grid.for_each_overlap(xl, yl, xl + design.size_x[i], yl + design.size_y[i], |bx, by, area| {
            covered += area;
            weighted += area * map[[bx, by]];
        });
        if covered > 0.0 {
            weighted / covered
        } else {
            0.0
        }
    }))
}

/// Proposed area scale per movable node and what drove it.
#[derive(Debug, Clone, PartialEq)]
pub struct Inflation {
    /// Area multiplier per movable node, at least 1.
    pub scale: Array1<f64>,
    pub route_increase: f64,
    pub pin_increase: f64,
    pub total_increase: f64,
}

impl Inflation {
    pub fn area_changed(&self, movable_area: f64) -> bool {
        self.total_increase > AREA_ADJUST_STOP_RATIO * movable_area
    }

    pub fn route_changed(&self, movable_area: f64) -> bool {
        self.route_increase > AREA_ADJUST_STOP_RATIO * movable_area
    }

    pub fn pin_changed(&self, movable_area: f64) -> bool {
        self.pin_increase > AREA_ADJUST_STOP_RATIO * movable_area
    }
}

///each node grows by the larger of its route and pin utilization, clamped to
///[1, max_inflation]. when the total growth would not fit in the whitespace left
///under the target density every increase shrinks by the same factor
pub fn plan_inflation(
    design: &Design,
    grid: &BinGrid,
    pos: &Array1<f64>,
    route_map: Option<&Array2<f64>>,
    pin_map: Option<&Array2<f64>>,
) -> Inflation {
    let layout = design.layout;
    let n = layout.num_movable;
    let ratio = |map: Option<&Array2<f64>>| match map {
        Some(map) => node_utilization(design, grid, pos, map).mapv(|r| r.clamp(1.0, design.max_inflation)),
        None => Array1::ones(n),
    };
    let route = ratio(route_map);
    let pin = ratio(pin_map);
    let area = Array1::from_iter((0..n).map(|i| design.size_x[i] * design.size_y[i]));
    let mut scale = Array1::from_iter(route.iter().zip(pin.iter()).map(|(r, p)| r.max(*p)));

    let mut route_increase: f64 = area.iter().zip(route.iter()).map(|(a, r)| a * (r - 1.0)).sum();
    let mut pin_increase: f64 = area.iter().zip(pin.iter()).map(|(a, p)| a * (p - 1.0)).sum();
    let mut total_increase: f64 = area.iter().zip(scale.iter()).map(|(a, s)| a * (s - 1.0)).sum();

    let fixed_area: f64 = (n..layout.num_nodes)
        .map(|i| design.size_x[i] * design.size_y[i])
        .sum();
    let movable_area: f64 = area.sum();
    let whitespace = design.target_density * design.region.area() - fixed_area - movable_area;
    if total_increase > whitespace {
        let factor = if total_increase > 0.0 {
            whitespace.max(0.0) / total_increase
        } else {
            0.0
        };
        scale.mapv_inplace(|s| 1.0 + (s - 1.0) * factor);
        route_increase *= factor;
        pin_increase *= factor;
        total_increase *= factor;
    }

    Inflation {
        scale,
        route_increase,
        pin_increase,
        total_increase,
    }
}

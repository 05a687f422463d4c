//! Netlist and geometry of a placement instance, plus a random benchmark generator.

use std::fs;
use std::path::Path;

use ndarray::Array1;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::position::{PositionLayout, Region};

/// The `[design]` table of the run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticDesign {
    pub num_movable: usize,
    /// I/O pads spread along the region boundary.
    pub num_fixed: usize,
    pub num_nets: usize,
    pub max_net_degree: usize,
    pub width: f64,
    pub height: f64,
    pub num_bins_x: usize,
    pub num_bins_y: usize,
    pub min_cell_size: f64,
    pub max_cell_size: f64,
    pub pad_size: f64,
    pub target_density: f64,
    /// Routing supply per unit area, used by the RUDY map.
    pub route_capacity: f64,
    /// Pins per unit area a bin can take.
    pub pin_capacity: f64,
    /// Largest area inflation one adjustment may apply to a node.
    pub max_inflation: f64,
}

impl Default for SyntheticDesign {
    fn default() -> Self {
        SyntheticDesign {
            num_movable: 256,
            num_fixed: 16,
            num_nets: 300,
            max_net_degree: 4,
            width: 64.0,
            height: 64.0,
            num_bins_x: 32,
            num_bins_y: 32,
            min_cell_size: 1.0,
            max_cell_size: 2.0,
            pad_size: 1.0,
            target_density: 0.9,
            route_capacity: 1.5,
            pin_capacity: 1.0,
            max_inflation: 2.0,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct DesignFile {
    #[serde(default)]
    design: SyntheticDesign,
}

/// Reads the `[design]` table, falling back to defaults when it is absent.
pub fn load_design(path: impl AsRef<Path>) -> Result<SyntheticDesign, ConfigError> {
    let content = fs::read_to_string(path)?;
    load_design_from_str(&content)
}

pub fn load_design_from_str(content: &str) -> Result<SyntheticDesign, ConfigError> {
    let file: DesignFile = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
    file.design.validate()?;
    Ok(file.design)
}

impl SyntheticDesign {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: String| Err(ConfigError::Validation(format!("design: {msg}")));
        if self.num_movable == 0 {
            return fail("num_movable must be at least 1".to_string());
        }
        if self.max_net_degree < 2 {
            return fail(format!("max_net_degree must be at least 2, got {}", self.max_net_degree));
        }
        if !(self.width > 0.0 && self.height > 0.0) {
            return fail("region width and height must be positive".to_string());
        }
        if self.num_bins_x < 2 || self.num_bins_y < 2 {
            return fail("need at least 2 bins along each axis".to_string());
        }
        if !(self.min_cell_size > 0.0 && self.min_cell_size <= self.max_cell_size) {
            return fail(format!(
                "cell size range [{}, {}] is empty",
                self.min_cell_size, self.max_cell_size
            ));
        }
        if !(self.target_density > 0.0 && self.target_density <= 1.0) {
            return fail(format!("target_density must be in (0, 1], got {}", self.target_density));
        }
        if !(self.route_capacity > 0.0 && self.pin_capacity > 0.0) {
            return fail("routing and pin capacities must be positive".to_string());
        }
        if !(self.max_inflation >= 1.0) {
            return fail(format!("max_inflation must be at least 1, got {}", self.max_inflation));
        }
        Ok(())
    }
}

/// A placement instance. Movable nodes come first, then fixed ones.
#[derive(Debug, Clone, PartialEq)]
pub struct Design {
    pub region: Region,
    pub layout: PositionLayout,
    pub num_bins_x: usize,
    pub num_bins_y: usize,
    pub size_x: Array1<f64>,
    pub size_y: Array1<f64>,
    /// Sizes before any routability inflation.
    pub orig_size_x: Array1<f64>,
    pub orig_size_y: Array1<f64>,
    /// Pin indices of every net.
    pub nets: Vec<Vec<usize>>,
    pub pin2node: Vec<usize>,
    /// Pin location relative to its node's lower-left corner.
    pub pin_offset_x: Array1<f64>,
    pub pin_offset_y: Array1<f64>,
    pub orig_pin_offset_x: Array1<f64>,
    pub orig_pin_offset_y: Array1<f64>,
    /// Lower-left corners of the fixed nodes.
    pub fixed_x: Array1<f64>,
    pub fixed_y: Array1<f64>,
    pub target_density: f64,
    pub route_capacity: f64,
    pub pin_capacity: f64,
    pub max_inflation: f64,
}

impl Design {
    ///builds a random benchmark: movable cells of random size, pads evenly spread
    ///around the boundary and nets of 2..=max_net_degree random pins. every
    ///movable cell gets at least one net when there are enough nets
    pub fn synthetic(cfg: &SyntheticDesign, rng: &mut StdRng) -> Result<Design, ConfigError> {
        cfg.validate()?;
        let num_nodes = cfg.num_movable + cfg.num_fixed;
        let layout = PositionLayout::new(num_nodes, cfg.num_movable);
        let region = Region::new(0.0, 0.0, cfg.width, cfg.height);

        let mut size_x = Array1::from_elem(num_nodes, cfg.pad_size);
        let mut size_y = Array1::from_elem(num_nodes, cfg.pad_size);
        for i in 0..cfg.num_movable {
            size_x[i] = rng.gen_range(cfg.min_cell_size..=cfg.max_cell_size);
            size_y[i] = rng.gen_range(cfg.min_cell_size..=cfg.max_cell_size);
        }

        let (fixed_x, fixed_y) = boundary_pads(cfg);

        let mut nets = Vec::with_capacity(cfg.num_nets);
        let mut pin2node = Vec::new();
        let mut offset_x = Vec::new();
        let mut offset_y = Vec::new();
        let all_nodes: Vec<usize> = (0..num_nodes).collect();
        for net in 0..cfg.num_nets {
            let degree = rng.gen_range(2..=cfg.max_net_degree).min(num_nodes);
            let mut members: Vec<usize> = all_nodes
                .choose_multiple(rng, degree)
                .copied()
                .collect();
            let anchor = net % cfg.num_movable;
            if !members.contains(&anchor) {
                members[0] = anchor;
            }

            let mut pins = Vec::with_capacity(members.len());
            for node in members {
                pins.push(pin2node.len());
                pin2node.push(node);
                offset_x.push(rng.gen::<f64>() * size_x[node]);
                offset_y.push(rng.gen::<f64>() * size_y[node]);
            }
            nets.push(pins);
        }

        let pin_offset_x = Array1::from(offset_x);
        let pin_offset_y = Array1::from(offset_y);
        Ok(Design {
            region,
            layout,
            num_bins_x: cfg.num_bins_x,
            num_bins_y: cfg.num_bins_y,
            orig_size_x: size_x.clone(),
            orig_size_y: size_y.clone(),
            size_x,
            size_y,
            nets,
            pin2node,
            orig_pin_offset_x: pin_offset_x.clone(),
            orig_pin_offset_y: pin_offset_y.clone(),
            pin_offset_x,
            pin_offset_y,
            fixed_x,
            fixed_y,
            target_density: cfg.target_density,
            route_capacity: cfg.route_capacity,
            pin_capacity: cfg.pin_capacity,
            max_inflation: cfg.max_inflation,
        })
    }

    pub fn num_pins(&self) -> usize {
        self.pin2node.len()
    }

    /// Pins per node.
    pub fn pin_counts(&self) -> Array1<f64> {
        let mut counts = Array1::zeros(self.layout.num_nodes);
        for &node in &self.pin2node {
            counts[node] += 1.0;
        }
        counts
    }

    pub fn movable_area(&self) -> f64 {
        (0..self.layout.num_movable)
            .map(|i| self.size_x[i] * self.size_y[i])
            .sum()
    }

    ///all movable cells stacked on the region center, fixed nodes where they belong
    pub fn initial_position(&self) -> Array1<f64> {
        let layout = self.layout;
        let mut pos = Array1::zeros(layout.len());
        let cx = (self.region.xl + self.region.xh) / 2.0;
        let cy = (self.region.yl + self.region.yh) / 2.0;
        for i in 0..layout.num_movable {
            pos[layout.x(i)] = cx - self.size_x[i] / 2.0;
            pos[layout.y(i)] = cy - self.size_y[i] / 2.0;
        }
        for (k, i) in (layout.num_movable..layout.num_nodes).enumerate() {
            pos[layout.x(i)] = self.fixed_x[k];
            pos[layout.y(i)] = self.fixed_y[k];
        }
        pos
    }

    /// Absolute pin locations.
    pub fn pin_positions(&self, pos: &Array1<f64>) -> (Array1<f64>, Array1<f64>) {
        let layout = self.layout;
        let x = Array1::from_iter(
            self.pin2node
                .iter()
                .zip(self.pin_offset_x.iter())
                .map(|(&node, off)| pos[layout.x(node)] + off),
        );
        let y = Array1::from_iter(
            self.pin2node
                .iter()
                .zip(self.pin_offset_y.iter())
                .map(|(&node, off)| pos[layout.y(node)] + off),
        );
        (x, y)
    }
}

///walks the boundary counter-clockwise and drops a pad every perimeter / n units
fn boundary_pads(cfg: &SyntheticDesign) -> (Array1<f64>, Array1<f64>) {
    let (w, h, s) = (cfg.width, cfg.height, cfg.pad_size);
    let perimeter = 2.0 * (w + h);
    let n = cfg.num_fixed;
    let mut xs = Array1::zeros(n);
    let mut ys = Array1::zeros(n);
    for k in 0..n {
        let t = perimeter * k as f64 / n as f64;
        let (x, y) = if t < w {
            (t, 0.0)
        } else if t < w + h {
            (w, t - w)
        } else if t < 2.0 * w + h {
            (w - (t - w - h), h)
        } else {
            (0.0, h - (t - 2.0 * w - h))
        };
        // keep the whole pad inside the region
        xs[k] = x.clamp(0.0, (w - s).max(0.0));
        ys[k] = y.clamp(0.0, (h - s).max(0.0));
    }
    (xs, ys)
}

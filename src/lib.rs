//! Nonlinear global placement: nested annealing of wirelength smoothing and
//! density weight around a Nesterov line-search descent, with an ePlace style
//! electrostatic reference model.

pub mod config;
pub mod controllers;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod optimizer;
pub mod placer;
pub mod position;
pub mod routability;
pub mod stopping;

pub mod congestion;
pub mod dct;
pub mod density;
pub mod design;
pub mod electrostatic;
pub mod util;
pub mod wirelength;

#[cfg(test)]
mod test_support;

pub use config::{OptimizerKind, PlaceParams, StageConfig};
pub use controllers::{EplaceDensityWeight, EplaceGamma};
pub use electrostatic::ElectrostaticModel;
pub use error::{PlaceError, PlaceResult};
pub use model::{Hyperparams, PlacementModel};
pub use placer::{post_process, NonLinearPlacer, PlacementOutcome, PostProcessor};

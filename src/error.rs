//! Error types for configuration loading and placement runs.
//!
//! Only configuration problems are errors. Numeric degeneracy, stagnation,
//! oscillation and an exhausted line search are absorbed by the optimizer and
//! the stopping criteria and never show up here.

use thiserror::Error;

/// Errors raised while reading or validating a placement configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// The TOML content could not be parsed.
    #[error("failed to parse configuration: {0}")]
    Parse(String),

    /// A configuration value failed validation.
    #[error("validation error: {0}")]
    Validation(String),
}

/// Crate-wide error for placement runs.
#[derive(Debug, Error)]
pub enum PlaceError {
    #[error("invalid learning rate: {0}")]
    InvalidLearningRate(f64),

    #[error("unsupported optimizer '{0}', expected one of nesterov, sgd, sgd_momentum, sgd_nesterov, adam")]
    UnsupportedOptimizer(String),

    #[error("cannot restore a {found} snapshot into a {expected} optimizer")]
    SnapshotMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("position vector has {found} entries, expected {expected}")]
    PositionSize { expected: usize, found: usize },

    #[error("routability optimization is enabled but the placement model cannot adjust node areas")]
    RoutabilityUnsupported,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type PlaceResult<T> = Result<T, PlaceError>;

//! Placement parameters: global options, ordered optimization stages and the
//! routability table, loaded from TOML.

use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, PlaceError};

///which descent method drives a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    #[default]
    Nesterov,
    Sgd,
    SgdMomentum,
    SgdNesterov,
    Adam,
}

impl OptimizerKind {
    pub fn name(&self) -> &'static str {
        match self {
            OptimizerKind::Nesterov => "nesterov",
            OptimizerKind::Sgd => "sgd",
            OptimizerKind::SgdMomentum => "sgd_momentum",
            OptimizerKind::SgdNesterov => "sgd_nesterov",
            OptimizerKind::Adam => "adam",
        }
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for OptimizerKind {
    type Err = PlaceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nesterov" => Ok(OptimizerKind::Nesterov),
            "sgd" => Ok(OptimizerKind::Sgd),
            "sgd_momentum" => Ok(OptimizerKind::SgdMomentum),
            "sgd_nesterov" => Ok(OptimizerKind::SgdNesterov),
            "adam" => Ok(OptimizerKind::Adam),
            other => Err(PlaceError::UnsupportedOptimizer(other.to_string())),
        }
    }
}

/// One optimization stage. Read-only while the stage runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    pub optimizer: OptimizerKind,
    pub learning_rate: f64,
    /// Multiplied into the learning rate once per gamma iteration (simple kinds only).
    pub learning_rate_decay: Option<f64>,
    /// Gamma-level iteration cap.
    pub iteration: usize,
    /// Lambda-level (density weight) iteration cap.
    pub lambda_iteration: usize,
    /// Sub-level (raw descent) iteration cap.
    pub sub_iteration: usize,
    pub stop_overflow: f64,
    pub target_density: f64,
    pub noise_ratio: f64,
    /// Overflow below which a stalled stage falls back to the reserved iterate. 0 disables it.
    pub oscillation_overflow: f64,
    /// Minimum gamma step before the first stage may stop on its gamma criterion.
    pub gamma_step_threshold: usize,
    pub revert_step_size: bool,
    pub step_control_factor: f64,
}

impl Default for StageConfig {
    fn default() -> Self {
        StageConfig {
            optimizer: OptimizerKind::Nesterov,
            learning_rate: 0.01,
            learning_rate_decay: None,
            iteration: 1000,
            lambda_iteration: 1,
            sub_iteration: 1,
            stop_overflow: 0.1,
            target_density: 1.0,
            noise_ratio: 0.0,
            oscillation_overflow: 0.0,
            gamma_step_threshold: 100,
            revert_step_size: false,
            step_control_factor: 0.99,
        }
    }
}

/// Routability-driven area inflation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutabilityParams {
    pub enabled: bool,
    pub max_num_area_adjust: usize,
    /// Area adjustment only happens once overflow drops below this.
    pub node_area_adjust_overflow: f64,
    /// Sub-level cap used after a restart.
    pub sub_iteration: usize,
    pub adjust_route_area: bool,
    pub adjust_pin_area: bool,
}

impl Default for RoutabilityParams {
    fn default() -> Self {
        RoutabilityParams {
            enabled: false,
            max_num_area_adjust: 3,
            node_area_adjust_overflow: 0.15,
            sub_iteration: 5,
            adjust_route_area: true,
            adjust_pin_area: true,
        }
    }
}

/// The whole placement configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaceParams {
    pub random_seed: u64,
    /// Scale applied to the initial wirelength/density gradient ratio.
    pub density_weight: f64,
    pub gamma_factor: f64,
    pub stages: Vec<StageConfig>,
    pub routability: RoutabilityParams,
    pub legalize: bool,
    pub detailed_place: bool,
}

impl Default for PlaceParams {
    fn default() -> Self {
        PlaceParams {
            random_seed: 1000,
            density_weight: 8e-5,
            gamma_factor: 4.0,
            stages: Vec::new(),
            routability: RoutabilityParams::default(),
            legalize: true,
            detailed_place: false,
        }
    }
}

/// Reads and validates a configuration file.
pub fn load_params(path: impl AsRef<Path>) -> Result<PlaceParams, ConfigError> {
    let content = fs::read_to_string(path)?;
    load_params_from_str(&content)
}

/// Parses and validates configuration text.
pub fn load_params_from_str(content: &str) -> Result<PlaceParams, ConfigError> {
    let params: PlaceParams =
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate(&params)?;
    Ok(params)
}

pub fn validate(params: &PlaceParams) -> Result<(), ConfigError> {
    if params.stages.is_empty() {
        return Err(ConfigError::Validation(
            "at least one [[stages]] entry is required".to_string(),
        ));
    }
    if !(params.density_weight > 0.0) {
        return Err(ConfigError::Validation(format!(
            "density_weight must be positive, got {}",
            params.density_weight
        )));
    }
    if !(params.gamma_factor > 0.0) {
        return Err(ConfigError::Validation(format!(
            "gamma_factor must be positive, got {}",
            params.gamma_factor
        )));
    }

    for (index, stage) in params.stages.iter().enumerate() {
        if !(stage.learning_rate >= 0.0) {
            return Err(ConfigError::Validation(format!(
                "stage {index}: invalid learning rate {}",
                stage.learning_rate
            )));
        }
        if stage.iteration == 0 || stage.lambda_iteration == 0 || stage.sub_iteration == 0 {
            return Err(ConfigError::Validation(format!(
                "stage {index}: iteration caps must be at least 1"
            )));
        }
        if !(0.0..1.0).contains(&stage.noise_ratio) {
            return Err(ConfigError::Validation(format!(
                "stage {index}: noise_ratio must be in [0, 1), got {}",
                stage.noise_ratio
            )));
        }
        if let Some(decay) = stage.learning_rate_decay {
            if !(decay > 0.0) {
                return Err(ConfigError::Validation(format!(
                    "stage {index}: learning_rate_decay must be positive, got {decay}"
                )));
            }
        }
        if !(stage.step_control_factor > 0.0) {
            return Err(ConfigError::Validation(format!(
                "stage {index}: step_control_factor must be positive"
            )));
        }
    }

    if params.routability.enabled && params.routability.sub_iteration == 0 {
        return Err(ConfigError::Validation(
            "routability.sub_iteration must be at least 1".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
random_seed = 7
density_weight = 1e-4

[[stages]]
optimizer = "nesterov"
learning_rate = 0.02
iteration = 200
lambda_iteration = 2
sub_iteration = 3

[[stages]]
optimizer = "adam"
learning_rate_decay = 0.9

[routability]
enabled = true
max_num_area_adjust = 2
"#;

    #[test]
    fn parses_stages_and_defaults() {
        let params = load_params_from_str(SAMPLE).unwrap();
        assert_eq!(params.random_seed, 7);
        assert_eq!(params.stages.len(), 2);
        assert_eq!(params.stages[0].lambda_iteration, 2);
        assert_eq!(params.stages[1].optimizer, OptimizerKind::Adam);
        assert_eq!(params.stages[1].learning_rate_decay, Some(0.9));
        assert_eq!(params.stages[1].iteration, 1000);
        assert!(params.routability.enabled);
        assert_eq!(params.routability.max_num_area_adjust, 2);
        assert_eq!(params.routability.sub_iteration, 5);
        assert!(params.legalize);
    }

    #[test]
    fn rejects_missing_stages() {
        let err = load_params_from_str("random_seed = 3").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn rejects_negative_learning_rate() {
        let err = load_params_from_str("[[stages]]\nlearning_rate = -1.0\n").unwrap_err();
        match err {
            ConfigError::Validation(msg) => assert!(msg.contains("learning rate")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn rejects_zero_caps() {
        let err = load_params_from_str("[[stages]]\nsub_iteration = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn unknown_optimizer_is_a_parse_error() {
        let err = load_params_from_str("[[stages]]\noptimizer = \"lbfgs\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn optimizer_kind_from_str() {
        assert_eq!("Nesterov".parse::<OptimizerKind>().unwrap(), OptimizerKind::Nesterov);
        assert_eq!(" SGD_momentum ".parse::<OptimizerKind>().unwrap(), OptimizerKind::SgdMomentum);
        let err = "cg".parse::<OptimizerKind>().unwrap_err();
        assert!(matches!(err, PlaceError::UnsupportedOptimizer(name) if name == "cg"));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let params = load_params(file.path()).unwrap();
        assert_eq!(params.stages[0].learning_rate, 0.02);
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_params(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}

use crate::cgr::{CgrChart, CgrSpec, ChartError, Engine, default_maxtheta};
use crate::hazard::{
    ConstantHazard, CumulativeHazard, HazardError, LinearRisk, PiecewiseHazard, WeibullHazard,
};
use crate::maximize::Detection;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write chart configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse chart configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize chart configuration: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Invalid baseline hazard: {0}")]
    Hazard(#[from] HazardError),
    #[error("Invalid chart parameters: {0}")]
    Chart(#[from] ChartError),
}

/// Cumulative baseline hazard supplied by the fitted in-control model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BaselineConfig {
    Constant { rate: f64 },
    Weibull { shape: f64, scale: f64 },
    Piecewise { times: Vec<f64>, cumulative: Vec<f64> },
}

impl BaselineConfig {
    pub fn build(&self) -> Result<Box<dyn CumulativeHazard>, HazardError> {
        Ok(match self {
            Self::Constant { rate } => Box::new(ConstantHazard::new(*rate)?),
            Self::Weibull { shape, scale } => Box::new(WeibullHazard::new(*shape, *scale)?),
            Self::Piecewise { times, cumulative } => {
                Box::new(PiecewiseHazard::new(times.clone(), cumulative.clone())?)
            }
        })
    }
}

/// Coefficients of an already fitted proportional-hazards risk model. An
/// empty table means no risk adjustment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskConfig {
    #[serde(default)]
    pub coefficients: BTreeMap<String, f64>,
    /// Covariate values at which the relative risk equals one.
    #[serde(default)]
    pub centre: BTreeMap<String, f64>,
}

impl RiskConfig {
    pub fn build(&self) -> LinearRisk {
        self.coefficients
            .iter()
            .fold(LinearRisk::new(), |model, (name, &coefficient)| {
                let centre = self.centre.get(name).copied().unwrap_or(0.0);
                model.with_term(name.clone(), coefficient, centre)
            })
    }
}

/// Everything needed to construct a chart, as stored in a TOML file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartConfig {
    #[serde(default)]
    pub detection: Detection,
    #[serde(default)]
    pub engine: Engine,
    #[serde(default = "default_maxtheta")]
    pub maxtheta: f64,
    #[serde(default = "default_workers")]
    pub workers: usize,
    pub control_limit: Option<f64>,
    pub stoptime: Option<f64>,
    pub followup: Option<f64>,
    pub construction_times: Option<Vec<f64>>,
    pub baseline: BaselineConfig,
    #[serde(default)]
    pub risk: RiskConfig,
}

fn default_workers() -> usize {
    1
}

impl Default for ChartConfig {
    fn default() -> Self {
        Self {
            detection: Detection::Upper,
            engine: Engine::Matrix,
            maxtheta: default_maxtheta(),
            workers: default_workers(),
            control_limit: None,
            stoptime: None,
            followup: None,
            construction_times: None,
            baseline: BaselineConfig::Constant { rate: 0.01 },
            risk: RiskConfig::default(),
        }
    }
}

impl ChartConfig {
    pub fn save(&self, path: &str) -> Result<(), ConfigError> {
        let toml_string = toml::to_string_pretty(self)?;
        fs::write(path, toml_string)?;
        Ok(())
    }

    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path)?;
        let config = toml::from_str(&toml_string)?;
        Ok(config)
    }

    pub fn chart(&self) -> Result<CgrChart, ConfigError> {
        Ok(CgrChart::new(CgrSpec {
            detection: self.detection,
            engine: self.engine,
            maxtheta: self.maxtheta,
            control_limit: self.control_limit,
            construction_times: self.construction_times.clone(),
            stoptime: self.stoptime,
            followup: self.followup,
            workers: self.workers,
        })?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hazard::RiskModel;
    use crate::subjects::{Subject, SubjectTable};
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use tempfile::NamedTempFile;

    const EXAMPLE: &str = r#"
detection = "lower"
engine = "recursive"
control_limit = -3.5
followup = 30.0

[baseline]
kind = "weibull"
shape = 1.5
scale = 100.0

[risk.coefficients]
age = 0.03

[risk.centre]
age = 65.0
"#;

    #[test]
    fn parses_documented_example() {
        let config: ChartConfig = toml::from_str(EXAMPLE).expect("parse");
        assert_eq!(config.detection, Detection::Lower);
        assert_eq!(config.engine, Engine::Recursive);
        assert_eq!(config.maxtheta, default_maxtheta());
        assert_eq!(config.workers, 1);
        assert_eq!(config.control_limit, Some(-3.5));
        assert_eq!(config.stoptime, None);

        let chart = config.chart().expect("chart");
        assert_eq!(chart.spec().followup, Some(30.0));

        let hazard = config.baseline.build().expect("hazard");
        assert_abs_diff_eq!(hazard.cumulative(100.0), 1.0, epsilon = 1e-12);

        let table = SubjectTable::with_covariates(
            vec![Subject::new(0.0, 1.0, true)],
            vec!["age".to_string()],
            array![[75.0]],
        )
        .expect("table");
        let scores = config.risk.build().risk_scores(&table).expect("scores");
        assert_abs_diff_eq!(scores[0], 0.3f64.exp(), epsilon = 1e-12);
    }

    #[test]
    fn save_then_load_preserves_config() {
        let config = ChartConfig {
            control_limit: Some(4.2),
            construction_times: Some(vec![1.0, 2.0, 4.0]),
            baseline: BaselineConfig::Piecewise {
                times: vec![1.0, 2.0],
                cumulative: vec![0.1, 0.3],
            },
            ..ChartConfig::default()
        };
        let file = NamedTempFile::new().expect("tempfile");
        let path = file.path().to_str().unwrap();
        config.save(path).expect("save");
        assert_eq!(ChartConfig::load(path).expect("load"), config);
    }

    #[test]
    fn invalid_values_surface_as_errors() {
        let config = ChartConfig {
            maxtheta: -1.0,
            ..ChartConfig::default()
        };
        assert!(matches!(
            config.chart(),
            Err(ConfigError::Chart(ChartError::InvalidMaxTheta(_)))
        ));
        let baseline = BaselineConfig::Constant { rate: -0.5 };
        assert!(baseline.build().is_err());
    }
}

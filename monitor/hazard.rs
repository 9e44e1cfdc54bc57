use crate::subjects::SubjectTable;
use ndarray::{Array1, ArrayView1};
use thiserror::Error;

/// Errors surfaced while building baseline hazards or applying a risk model.
#[derive(Debug, Error, PartialEq)]
pub enum HazardError {
    #[error("constant hazard rate must be positive and finite, got {0}")]
    InvalidRate(f64),
    #[error("Weibull shape and scale must be positive and finite (shape={shape}, scale={scale})")]
    InvalidWeibull { shape: f64, scale: f64 },
    #[error("piecewise hazard needs matching time and value vectors ({times} times, {values} values)")]
    KnotLengthMismatch { times: usize, values: usize },
    #[error("piecewise hazard knots must be finite, non-negative and strictly increasing in time")]
    InvalidKnotTimes,
    #[error("piecewise cumulative hazard values must be finite, non-negative and non-decreasing")]
    InvalidKnotValues,
    #[error("risk model needs covariate '{0}' which the subject table does not carry")]
    MissingCovariate(String),
    #[error("risk score of subject {index} is {value}; scores must be finite and non-negative")]
    InvalidRiskScore { index: usize, value: f64 },
}

/// Cumulative baseline hazard `Λ(t)`: non-decreasing with `Λ(0) = 0`.
///
/// Implementations are shared read-only with the worker threads that fill the
/// hazard-contribution matrix.
pub trait CumulativeHazard: Send + Sync {
    fn cumulative(&self, t: f64) -> f64;
}

impl<T: CumulativeHazard + ?Sized> CumulativeHazard for Box<T> {
    #[inline]
    fn cumulative(&self, t: f64) -> f64 {
        (**self).cumulative(t)
    }
}

/// Exponential baseline, `Λ(t) = rate · t`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConstantHazard {
    rate: f64,
}

impl ConstantHazard {
    pub fn new(rate: f64) -> Result<Self, HazardError> {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(HazardError::InvalidRate(rate));
        }
        Ok(Self { rate })
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }
}

impl CumulativeHazard for ConstantHazard {
    #[inline]
    fn cumulative(&self, t: f64) -> f64 {
        self.rate * t.max(0.0)
    }
}

/// Weibull baseline, `Λ(t) = (t / scale)^shape`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeibullHazard {
    shape: f64,
    scale: f64,
}

impl WeibullHazard {
    pub fn new(shape: f64, scale: f64) -> Result<Self, HazardError> {
        if !shape.is_finite() || shape <= 0.0 || !scale.is_finite() || scale <= 0.0 {
            return Err(HazardError::InvalidWeibull { shape, scale });
        }
        Ok(Self { shape, scale })
    }
}

impl CumulativeHazard for WeibullHazard {
    #[inline]
    fn cumulative(&self, t: f64) -> f64 {
        if t <= 0.0 {
            0.0
        } else {
            (t / self.scale).powf(self.shape)
        }
    }
}

/// Tabulated cumulative hazard (e.g. a Breslow estimate from a fitted Cox
/// model) evaluated by linear interpolation and held flat past the last knot.
#[derive(Debug, Clone, PartialEq)]
pub struct PiecewiseHazard {
    times: Vec<f64>,
    values: Vec<f64>,
}

impl PiecewiseHazard {
    /// A knot at the origin with value 0 is inserted when the table does not start there.
    pub fn new(times: Vec<f64>, values: Vec<f64>) -> Result<Self, HazardError> {
        if times.len() != values.len() || times.is_empty() {
            return Err(HazardError::KnotLengthMismatch {
                times: times.len(),
                values: values.len(),
            });
        }
        if times.iter().any(|t| !t.is_finite() || *t < 0.0)
            || times.windows(2).any(|pair| pair[1] <= pair[0])
        {
            return Err(HazardError::InvalidKnotTimes);
        }
        if values.iter().any(|v| !v.is_finite() || *v < 0.0)
            || values.windows(2).any(|pair| pair[1] < pair[0])
        {
            return Err(HazardError::InvalidKnotValues);
        }

        let (mut times, mut values) = (times, values);
        if times[0] > 0.0 {
            times.insert(0, 0.0);
            values.insert(0, 0.0);
        } else if values[0] != 0.0 {
            return Err(HazardError::InvalidKnotValues);
        }
        Ok(Self { times, values })
    }
}

impl CumulativeHazard for PiecewiseHazard {
    fn cumulative(&self, t: f64) -> f64 {
        if t <= 0.0 {
            return 0.0;
        }
        let upper = self.times.partition_point(|&knot| knot <= t);
        if upper >= self.times.len() {
            return self.values[self.values.len() - 1];
        }
        let lower = upper - 1;
        let (t0, t1) = (self.times[lower], self.times[upper]);
        let (v0, v1) = (self.values[lower], self.values[upper]);
        v0 + (v1 - v0) * (t - t0) / (t1 - t0)
    }
}

/// Any closure used as a cumulative baseline hazard.
pub struct FnHazard<F>(pub F);

impl<F> CumulativeHazard for FnHazard<F>
where
    F: Fn(f64) -> f64 + Send + Sync,
{
    #[inline]
    fn cumulative(&self, t: f64) -> f64 {
        (self.0)(t)
    }
}

/// Maps the covariates of a subject table to relative-risk multipliers.
pub trait RiskModel: Send + Sync {
    fn risk_scores(&self, table: &SubjectTable) -> Result<Array1<f64>, HazardError>;
}

/// No risk adjustment: every subject has multiplier 1.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnitRisk;

impl RiskModel for UnitRisk {
    fn risk_scores(&self, table: &SubjectTable) -> Result<Array1<f64>, HazardError> {
        Ok(Array1::ones(table.len()))
    }
}

/// Proportional-hazards risk `exp(Σ β_j (z_j − c_j))` with coefficients
/// fitted elsewhere.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LinearRisk {
    terms: Vec<LinearTerm>,
}

#[derive(Debug, Clone, PartialEq)]
struct LinearTerm {
    covariate: String,
    coefficient: f64,
    centre: f64,
}

impl LinearRisk {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_term(mut self, covariate: impl Into<String>, coefficient: f64, centre: f64) -> Self {
        self.terms.push(LinearTerm {
            covariate: covariate.into(),
            coefficient,
            centre,
        });
        self
    }
}

impl RiskModel for LinearRisk {
    fn risk_scores(&self, table: &SubjectTable) -> Result<Array1<f64>, HazardError> {
        let mut linear_predictor = Array1::<f64>::zeros(table.len());
        for term in &self.terms {
            let column = table
                .covariate(&term.covariate)
                .ok_or_else(|| HazardError::MissingCovariate(term.covariate.clone()))?;
            linear_predictor.scaled_add(term.coefficient, &column.mapv(|z| z - term.centre));
        }
        let scores = linear_predictor.mapv(f64::exp);
        check_risk_scores(scores.view())?;
        Ok(scores)
    }
}

/// Every multiplier must be finite and non-negative.
pub fn check_risk_scores(scores: ArrayView1<'_, f64>) -> Result<(), HazardError> {
    match scores
        .iter()
        .enumerate()
        .find(|(_, value)| !value.is_finite() || **value < 0.0)
    {
        Some((index, &value)) => Err(HazardError::InvalidRiskScore { index, value }),
        None => Ok(()),
    }
}

//! Control-limit calibration from simulated in-control units.
//!
//! The units themselves are produced elsewhere. Each one is charted up to the
//! monitoring horizon, the largest absolute chart value is recorded, and the
//! limit is the empirical `1 − alpha` quantile of those maxima, so that about
//! a fraction `alpha` of in-control units would signal within the horizon.

use crate::cgr::{CgrChart, CgrSpec, ChartError};
use crate::hazard::CumulativeHazard;
use crate::maximize::Detection;
use crate::subjects::SubjectTable;
use crate::workers::WorkerPlan;
use log::info;
use ndarray::Array1;
use rayon::prelude::*;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum LimitError {
    #[error("monitoring horizon must be positive and finite, got {0}")]
    InvalidHorizon(f64),
    #[error("false-alarm probability alpha must lie strictly between 0 and 1, got {0}")]
    InvalidAlpha(f64),
    #[error("limit precision must be positive and finite, got {0}")]
    InvalidPrecision(f64),
    #[error("search cap must be positive and finite, got {0}")]
    InvalidCap(f64),
    #[error("at least one in-control unit is required")]
    NoUnits,
    #[error("calibration chart derived from the monitoring chart is invalid: {0}")]
    InvalidCalibrationChart(#[source] ChartError),
    #[error("unit {unit}: {source}")]
    Chart {
        unit: usize,
        #[source]
        source: ChartError,
    },
}

/// Parameters of a control-limit search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationSpec {
    /// Monitoring horizon over which the false-alarm rate is controlled.
    pub time: f64,
    pub alpha: f64,
    /// The limit is rounded up to a multiple of this step.
    pub precision: f64,
    /// Charts stop early once they exceed this magnitude; maxima are capped at it.
    pub cap: Option<f64>,
}

impl CalibrationSpec {
    pub fn new(time: f64, alpha: f64) -> Self {
        Self {
            time,
            alpha,
            precision: 0.01,
            cap: None,
        }
    }

    fn validate(&self) -> Result<(), LimitError> {
        if !self.time.is_finite() || self.time <= 0.0 {
            return Err(LimitError::InvalidHorizon(self.time));
        }
        if !self.alpha.is_finite() || self.alpha <= 0.0 || self.alpha >= 1.0 {
            return Err(LimitError::InvalidAlpha(self.alpha));
        }
        if !self.precision.is_finite() || self.precision <= 0.0 {
            return Err(LimitError::InvalidPrecision(self.precision));
        }
        if let Some(cap) = self.cap {
            if !cap.is_finite() || cap <= 0.0 {
                return Err(LimitError::InvalidCap(cap));
            }
        }
        Ok(())
    }
}

/// One simulated in-control unit with its risk scores.
#[derive(Debug, Clone)]
pub struct InControlUnit {
    pub table: SubjectTable,
    pub risk: Array1<f64>,
}

/// Observer notified while units are charted. Called from worker threads.
pub trait CalibrationProgress: Sync {
    fn on_start(&self, total_units: usize) {
        let _ = total_units;
    }
    fn on_unit_finished(&self) {}
    fn on_finish(&self) {}
}

#[derive(Default)]
pub struct NoopCalibrationProgress;

impl CalibrationProgress for NoopCalibrationProgress {}

/// Calibrated control limit together with the per-unit maxima it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlLimit {
    /// Signed limit: positive when detecting increases, negative for decreases.
    pub h: f64,
    pub maxima: Vec<f64>,
}

impl ControlLimit {
    /// Fraction of the calibration units whose chart reached the limit.
    pub fn false_alarm_rate(&self) -> f64 {
        let signals = self.maxima.iter().filter(|&&m| m >= self.h.abs()).count();
        signals as f64 / self.maxima.len() as f64
    }
}

/// Determines the control limit of `chart` from simulated in-control units.
///
/// Units are charted concurrently, each one sequentially, with the horizon
/// applied as stop time and the optional cap as early-stopping limit.
pub fn calibrate_control_limit<H, P>(
    chart: &CgrChart,
    units: &[InControlUnit],
    hazard: &H,
    spec: &CalibrationSpec,
    progress: &P,
) -> Result<ControlLimit, LimitError>
where
    H: CumulativeHazard + ?Sized,
    P: CalibrationProgress + ?Sized,
{
    spec.validate()?;
    if units.is_empty() {
        return Err(LimitError::NoUnits);
    }

    let base = chart.spec();
    let detection = base.detection;
    let unit_chart = calibration_chart(base, spec)?;

    info!(
        "Calibrating {:?} control limit on {} units (horizon {}, alpha {}).",
        detection,
        units.len(),
        spec.time,
        spec.alpha
    );
    progress.on_start(units.len());

    let chart_unit = |(idx, unit): (usize, &InControlUnit)| -> Result<f64, LimitError> {
        let run = unit_chart
            .run(&unit.table, unit.risk.view(), hazard)
            .map_err(|source| LimitError::Chart { unit: idx, source })?;
        progress.on_unit_finished();
        let maximum = run.trace.max_abs_until(spec.time);
        Ok(spec.cap.map_or(maximum, |cap| maximum.min(cap)))
    };
    let maxima = WorkerPlan::new(base.workers).run("control-limit calibration", |parallel| {
        if parallel {
            units.par_iter().enumerate().map(chart_unit).collect::<Result<Vec<_>, _>>()
        } else {
            units.iter().enumerate().map(chart_unit).collect::<Result<Vec<_>, _>>()
        }
    })?;
    progress.on_finish();

    let quantile = empirical_quantile(&maxima, 1.0 - spec.alpha);
    let magnitude = round_up(quantile, spec.precision);
    let h = match detection {
        Detection::Upper => magnitude,
        Detection::Lower => -magnitude,
    };
    info!("Calibrated control limit h = {h}.");
    Ok(ControlLimit { h, maxima })
}

/// Chart run on every unit: stopped at the horizon, stopped early at the cap
/// and sequential, since the units themselves are spread over the workers.
fn calibration_chart(base: &CgrSpec, spec: &CalibrationSpec) -> Result<CgrChart, LimitError> {
    CgrChart::new(CgrSpec {
        stoptime: Some(base.stoptime.map_or(spec.time, |t| t.min(spec.time))),
        control_limit: spec.cap.map(|cap| base.detection.sign() * cap),
        workers: 1,
        ..base.clone()
    })
    .map_err(LimitError::InvalidCalibrationChart)
}

/// Sample quantile with linear interpolation between order statistics.
fn empirical_quantile(values: &[f64], probability: f64) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let position = probability * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let weight = position - lower as f64;
    sorted[lower] + weight * (sorted[upper] - sorted[lower])
}

fn round_up(value: f64, step: f64) -> f64 {
    let steps = (value / step - 1e-9).ceil().max(0.0);
    steps * step
}

//! Continuous-time Generalized Rapid-response CUSUM (CGR-CUSUM).

use crate::hazard::{CumulativeHazard, HazardError, RiskModel, check_risk_scores};
use crate::intensity::{HazardMatrix, IntensitySource, OnTheFlyIntensity};
use crate::maximize::{Detection, Maximizer, Reduction};
use crate::subjects::{StartTime, SubjectError, SubjectTable};
use crate::trace::ChartTrace;
use crate::workers::WorkerPlan;
use log::{debug, info};
use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use thiserror::Error;

/// Default bound on the excess log-hazard: a six-fold change in hazard rate.
pub fn default_maxtheta() -> f64 {
    6f64.ln()
}

#[derive(Debug, Error, PartialEq)]
pub enum ChartError {
    #[error("maxtheta must be positive and finite, got {0}")]
    InvalidMaxTheta(f64),
    #[error("control limit must be finite and non-zero, got {0}")]
    InvalidControlLimit(f64),
    #[error("stop time must be finite, got {0}")]
    InvalidStopTime(f64),
    #[error("construction time {0} is not finite")]
    NonFiniteConstructionTime(f64),
    #[error("{found} risk scores were supplied for {expected} subjects")]
    RiskLengthMismatch { expected: usize, found: usize },
    #[error("invalid subject table: {0}")]
    Subjects(#[from] SubjectError),
    #[error("invalid risk adjustment: {0}")]
    Hazard(#[from] HazardError),
}

/// How cumulative intensities are obtained during maximisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    /// Precompute the subjects × construction-times matrix. Faster, more memory.
    #[default]
    Matrix,
    /// Evaluate the baseline hazard whenever a segment is summed.
    Recursive,
}

/// Parameters of one chart construction.
#[derive(Debug, Clone, PartialEq)]
pub struct CgrSpec {
    pub detection: Detection,
    pub engine: Engine,
    pub maxtheta: f64,
    /// Stop constructing once the chart reaches this value.
    pub control_limit: Option<f64>,
    /// Times at which to evaluate the chart. Defaults to every entry and exit time.
    pub construction_times: Option<Vec<f64>>,
    /// Last time to evaluate the chart at.
    pub stoptime: Option<f64>,
    /// Maximum follow-up of a subject after entry.
    pub followup: Option<f64>,
    pub workers: usize,
}

impl Default for CgrSpec {
    fn default() -> Self {
        Self {
            detection: Detection::Upper,
            engine: Engine::Matrix,
            maxtheta: default_maxtheta(),
            control_limit: None,
            construction_times: None,
            stoptime: None,
            followup: None,
            workers: 1,
        }
    }
}

/// Output of one chart construction.
#[derive(Debug, Clone, PartialEq)]
pub struct ChartRun {
    pub trace: ChartTrace,
    /// Construction time at which the control limit was first reached.
    pub stopped_at: Option<f64>,
}

/// A validated CGR-CUSUM chart definition.
#[derive(Debug, Clone, PartialEq)]
pub struct CgrChart {
    spec: CgrSpec,
}

impl CgrChart {
    pub fn new(spec: CgrSpec) -> Result<Self, ChartError> {
        if !spec.maxtheta.is_finite() || spec.maxtheta <= 0.0 {
            return Err(ChartError::InvalidMaxTheta(spec.maxtheta));
        }
        if let Some(h) = spec.control_limit {
            if !h.is_finite() || h == 0.0 {
                return Err(ChartError::InvalidControlLimit(h));
            }
        }
        if let Some(stoptime) = spec.stoptime {
            if !stoptime.is_finite() {
                return Err(ChartError::InvalidStopTime(stoptime));
            }
        }
        if let Some(followup) = spec.followup {
            if !followup.is_finite() || followup <= 0.0 {
                return Err(SubjectError::InvalidFollowup(followup).into());
            }
        }
        if let Some(times) = &spec.construction_times {
            if let Some(&bad) = times.iter().find(|t| !t.is_finite()) {
                return Err(ChartError::NonFiniteConstructionTime(bad));
            }
        }
        Ok(Self { spec })
    }

    pub fn spec(&self) -> &CgrSpec {
        &self.spec
    }

    /// Builds the chart for `table` using the risk scores of `model`.
    pub fn run_with_model<R, H>(
        &self,
        table: &SubjectTable,
        model: &R,
        hazard: &H,
    ) -> Result<ChartRun, ChartError>
    where
        R: RiskModel + ?Sized,
        H: CumulativeHazard + ?Sized,
    {
        let risk = model.risk_scores(table)?;
        self.run(table, risk.view(), hazard)
    }

    /// Builds the chart for `table` with precomputed risk scores aligned to its rows.
    pub fn run<H: CumulativeHazard + ?Sized>(
        &self,
        table: &SubjectTable,
        risk: ArrayView1<'_, f64>,
        hazard: &H,
    ) -> Result<ChartRun, ChartError> {
        if risk.len() != table.len() {
            return Err(ChartError::RiskLengthMismatch {
                expected: table.len(),
                found: risk.len(),
            });
        }
        check_risk_scores(risk)?;

        let table = match self.spec.followup {
            Some(followup) => Cow::Owned(table.with_followup(followup)?),
            None => Cow::Borrowed(table),
        };
        let ctimes = self.construction_times(&table);
        let Some(earliest_entry) = table.earliest_entry() else {
            let origin = ctimes.first().copied().unwrap_or(0.0);
            return Ok(ChartRun {
                trace: ChartTrace::origin_only(origin),
                stopped_at: None,
            });
        };
        let origin = ctimes.first().map_or(earliest_entry, |&t| t.min(earliest_entry));
        let start_times = table.start_times();

        info!(
            "Constructing {:?} CGR-CUSUM over {} subjects at {} construction times ({:?} engine).",
            self.spec.detection,
            table.len(),
            ctimes.len(),
            self.spec.engine
        );

        let workers = WorkerPlan::new(self.spec.workers);
        let reduction = match self.spec.engine {
            Engine::Matrix => {
                let matrix = HazardMatrix::build(&table, risk, &ctimes, hazard, &workers);
                self.reduce(&table, &start_times, &ctimes, &matrix, &workers)
            }
            Engine::Recursive => {
                let source = OnTheFlyIntensity::new(&table, risk.reborrow(), &ctimes, hazard);
                self.reduce(&table, &start_times, &ctimes, &source, &workers)
            }
        };

        let stopped_at = reduction.stopped_at.map(|column| ctimes[column]);
        if let Some(time) = stopped_at {
            info!("Control limit reached at time {time}; remaining construction times skipped.");
        }
        Ok(ChartRun {
            trace: ChartTrace::assemble(origin, &ctimes, &reduction.results, &start_times),
            stopped_at,
        })
    }

    fn reduce<S: IntensitySource + ?Sized>(
        &self,
        table: &SubjectTable,
        start_times: &[StartTime],
        ctimes: &[f64],
        source: &S,
        workers: &WorkerPlan,
    ) -> Reduction {
        let maximizer = Maximizer::new(
            table,
            start_times,
            ctimes,
            source,
            self.spec.detection,
            self.spec.maxtheta,
        );
        match self.spec.control_limit {
            Some(h) => maximizer.scan_until(h),
            None => Reduction {
                results: maximizer.scan(workers),
                stopped_at: None,
            },
        }
    }

    /// Sorted distinct construction times, none before the earliest entry and
    /// none after the stop time.
    fn construction_times(&self, table: &SubjectTable) -> Vec<f64> {
        let mut ctimes = match &self.spec.construction_times {
            Some(times) => times.clone(),
            None => table.event_times(),
        };
        ctimes.sort_by(f64::total_cmp);
        ctimes.dedup();

        let requested = ctimes.len();
        if let Some(earliest) = table.earliest_entry() {
            ctimes.retain(|&t| t >= earliest);
        }
        if let Some(stoptime) = self.spec.stoptime {
            ctimes.retain(|&t| t <= stoptime);
        }
        if ctimes.len() < requested {
            debug!(
                "Dropped {} construction times outside the monitored window.",
                requested - ctimes.len()
            );
        }
        ctimes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hazard::{ConstantHazard, UnitRisk};
    use crate::subjects::Subject;
    use crate::trace::ChartPoint;
    use approx::assert_abs_diff_eq;
    use ndarray::Array1;

    fn chart(spec: CgrSpec) -> CgrChart {
        CgrChart::new(spec).expect("valid spec")
    }

    #[test]
    fn rejects_invalid_parameters() {
        let bad_theta = CgrSpec {
            maxtheta: 0.0,
            ..CgrSpec::default()
        };
        assert_eq!(CgrChart::new(bad_theta), Err(ChartError::InvalidMaxTheta(0.0)));

        let bad_limit = CgrSpec {
            control_limit: Some(f64::NAN),
            ..CgrSpec::default()
        };
        assert!(matches!(
            CgrChart::new(bad_limit),
            Err(ChartError::InvalidControlLimit(_))
        ));

        let bad_times = CgrSpec {
            construction_times: Some(vec![1.0, f64::INFINITY]),
            ..CgrSpec::default()
        };
        assert!(matches!(
            CgrChart::new(bad_times),
            Err(ChartError::NonFiniteConstructionTime(_))
        ));
    }

    #[test]
    fn single_subject_scenario() {
        let table = SubjectTable::new(vec![Subject::new(0.0, 5.0, true)]).expect("table");
        let hazard = ConstantHazard::new(0.1).expect("rate");
        let spec = CgrSpec {
            maxtheta: 5.0,
            construction_times: Some(vec![1.0, 3.0, 5.0]),
            ..CgrSpec::default()
        };
        let run = chart(spec)
            .run_with_model(&table, &UnitRisk, &hazard)
            .expect("chart");
        let points = run.trace.points();

        assert_eq!(points[0], ChartPoint::origin(0.0));
        assert_eq!(points.len(), 5);
        assert_eq!(points[1].value, 0.0);
        assert_eq!(points[2].value, 0.0);
        assert_eq!((points[3].time, points[3].value), (5.0, 0.0));
        assert_eq!(points[4].time, 5.0);
        assert_abs_diff_eq!(points[4].value, 2f64.ln() - 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(points[4].multiplier, 2.0, epsilon = 1e-12);
        assert_eq!(points[4].start_time, 0.0);
    }

    #[test]
    fn empty_table_yields_origin_only() {
        let table = SubjectTable::new(Vec::new()).expect("table");
        let hazard = ConstantHazard::new(0.1).expect("rate");
        let run = chart(CgrSpec::default())
            .run(&table, Array1::zeros(0).view(), &hazard)
            .expect("chart");
        assert_eq!(run.trace.points(), &[ChartPoint::origin(0.0)]);
    }

    #[test]
    fn construction_times_respect_window() {
        let table = SubjectTable::new(vec![
            Subject::new(1.0, 3.0, true),
            Subject::new(2.0, 6.0, false),
        ])
        .expect("table");
        let spec = CgrSpec {
            construction_times: Some(vec![4.0, 0.5, 2.0, 2.0, 7.0]),
            stoptime: Some(5.0),
            ..CgrSpec::default()
        };
        assert_eq!(chart(spec).construction_times(&table), vec![2.0, 4.0]);
        assert_eq!(
            chart(CgrSpec::default()).construction_times(&table),
            vec![1.0, 2.0, 3.0, 6.0]
        );
    }

    #[test]
    fn origin_precedes_first_entry() {
        let table = SubjectTable::new(vec![Subject::new(2.0, 3.0, true)]).expect("table");
        let hazard = ConstantHazard::new(0.5).expect("rate");
        let spec = CgrSpec {
            construction_times: Some(vec![1.0, 2.5, 3.0]),
            ..CgrSpec::default()
        };
        let run = chart(spec)
            .run(&table, Array1::ones(1).view(), &hazard)
            .expect("chart");
        assert_eq!(run.trace.points()[0].time, 2.0);
        assert_eq!(run.trace.points()[1].time, 2.5);
    }

    #[test]
    fn risk_scores_are_validated() {
        let table = SubjectTable::new(vec![Subject::new(0.0, 1.0, true)]).expect("table");
        let hazard = ConstantHazard::new(0.5).expect("rate");
        let chart = chart(CgrSpec::default());
        assert_eq!(
            chart.run(&table, Array1::ones(2).view(), &hazard),
            Err(ChartError::RiskLengthMismatch {
                expected: 1,
                found: 2
            })
        );
        assert!(matches!(
            chart.run(&table, Array1::from_elem(1, -1.0).view(), &hazard),
            Err(ChartError::Hazard(HazardError::InvalidRiskScore { .. }))
        ));
    }

    #[test]
    fn recursive_engine_matches_matrix_engine() {
        let table = SubjectTable::new(vec![
            Subject::new(0.0, 5.0, true),
            Subject::new(1.0, 9.0, true),
            Subject::new(1.0, 3.0, false),
        ])
        .expect("table");
        let hazard = ConstantHazard::new(0.1).expect("rate");
        let risk = Array1::from(vec![1.0, 2.0, 0.5]);
        for followup in [None, Some(6.0)] {
            let traces: Vec<ChartTrace> = [Engine::Matrix, Engine::Recursive]
                .into_iter()
                .map(|engine| {
                    chart(CgrSpec {
                        engine,
                        followup,
                        ..CgrSpec::default()
                    })
                    .run(&table, risk.view(), &hazard)
                    .expect("chart")
                    .trace
                })
                .collect();
            assert_eq!(traces[0].len(), traces[1].len());
            for (a, b) in traces[0].points().iter().zip(traces[1].points()) {
                assert_eq!(a.time, b.time);
                assert_abs_diff_eq!(a.value, b.value, epsilon = 1e-12);
                assert_abs_diff_eq!(a.multiplier, b.multiplier, epsilon = 1e-12);
                assert_eq!(a.start_time, b.start_time);
            }
        }
    }

    #[test]
    fn followup_cutoff_censors_failures() {
        let table = SubjectTable::new(vec![Subject::new(0.0, 5.0, true)]).expect("table");
        let hazard = ConstantHazard::new(0.1).expect("rate");
        let spec = CgrSpec {
            followup: Some(2.0),
            construction_times: Some(vec![5.0]),
            ..CgrSpec::default()
        };
        let run = chart(spec)
            .run(&table, Array1::ones(1).view(), &hazard)
            .expect("chart");
        assert!(run.trace.points().iter().all(|p| p.value == 0.0));
    }
}

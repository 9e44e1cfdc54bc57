//! Profile likelihood-ratio maximisation behind the CGR-CUSUM.
//!
//! For a construction time `t` and a candidate start time `k`, the subjects
//! entering in `[k, t]` form one segment. With `A` their summed cumulative
//! intensity at `t` and `D` their observed failures by `t`, the excess
//! log-hazard estimate is `θ̂ = ln(D / A)` clamped to one side of zero, and the
//! segment contributes `θ̂·D − (e^θ̂ − 1)·A`. The chart value at `t` is the
//! maximum over all eligible `k`.
//!
//! Every quantity is computed twice: once counting the failures that happen
//! exactly at `t` and once without them. The pair gives the value just before
//! and just after a jump of the continuous-time chart.

use crate::intensity::IntensitySource;
use crate::subjects::{StartTime, SubjectTable};
use crate::workers::WorkerPlan;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Direction of the hazard change the chart is meant to detect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Detection {
    /// Increase in failure rate; chart values are non-negative.
    #[default]
    Upper,
    /// Decrease in failure rate; chart values are non-positive.
    Lower,
}

impl Detection {
    /// Restricts an estimate to the detection side: `[0, maxtheta]` upwards,
    /// `[−maxtheta, 0]` downwards.
    #[inline]
    pub fn clamp_theta(self, theta: f64, maxtheta: f64) -> f64 {
        let bound = maxtheta.abs();
        match self {
            Detection::Upper => theta.max(0.0).min(bound),
            Detection::Lower => theta.min(0.0).max(-bound),
        }
    }

    #[inline]
    pub fn sign(self) -> f64 {
        match self {
            Detection::Upper => 1.0,
            Detection::Lower => -1.0,
        }
    }

    /// Whether `candidate` lies further in the detection direction than `incumbent`.
    #[inline]
    fn more_extreme(self, candidate: f64, incumbent: f64) -> bool {
        match self {
            Detection::Upper => candidate > incumbent,
            Detection::Lower => candidate < incumbent,
        }
    }
}

/// Maximum-likelihood estimate of the excess log-hazard for `failures`
/// against `intensity`, restricted to the detection side. A non-finite
/// estimate (no intensity accrued, or no failures observed) gives the neutral
/// estimate 0.
#[inline]
pub fn excess_log_hazard(failures: f64, intensity: f64, detection: Detection, maxtheta: f64) -> f64 {
    let theta = (failures / intensity).ln();
    if !theta.is_finite() {
        return 0.0;
    }
    detection.clamp_theta(theta, maxtheta)
}

/// Signed log-likelihood-ratio contribution of one segment.
#[inline]
fn segment_value(theta: f64, failures: f64, intensity: f64, detection: Detection) -> f64 {
    let llr = theta * failures - theta.exp_m1() * intensity;
    detection.sign() * llr
}

/// Result of evaluating one (start time, construction time) pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentStatistic {
    /// Chart contribution counting failures at the construction time.
    pub value: f64,
    /// Chart contribution ignoring failures at the construction time.
    pub value_excl: f64,
    pub theta: f64,
    pub theta_excl: f64,
}

/// Chart state at one construction time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeResult {
    pub value: f64,
    pub value_excl: f64,
    pub theta: f64,
    pub theta_excl: f64,
    /// Index into the candidate start times of the maximising segment.
    pub start: Option<usize>,
    pub start_excl: Option<usize>,
}

impl TimeResult {
    /// No eligible segment: no excess hazard and no breakpoint.
    pub const NEUTRAL: TimeResult = TimeResult {
        value: 0.0,
        value_excl: 0.0,
        theta: 0.0,
        theta_excl: 0.0,
        start: None,
        start_excl: None,
    };

    /// Whether either side of this instant reaches the control limit `h`.
    #[inline]
    pub fn crosses(&self, h: f64) -> bool {
        self.value.abs().max(self.value_excl.abs()) >= h.abs()
    }
}

/// Early-stopping state of one chart construction. Moves one way only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopState {
    Untripped,
    Tripped(usize),
}

/// Per-construction-time results together with the index at which the
/// control limit was first reached, if it was.
#[derive(Debug, Clone, PartialEq)]
pub struct Reduction {
    pub results: Vec<TimeResult>,
    pub stopped_at: Option<usize>,
}

/// Everything needed to maximise the likelihood ratio at any construction time.
pub struct Maximizer<'a, S: ?Sized> {
    table: &'a SubjectTable,
    start_times: &'a [StartTime],
    ctimes: &'a [f64],
    source: &'a S,
    detection: Detection,
    maxtheta: f64,
}

impl<'a, S: IntensitySource + ?Sized> Maximizer<'a, S> {
    pub fn new(
        table: &'a SubjectTable,
        start_times: &'a [StartTime],
        ctimes: &'a [f64],
        source: &'a S,
        detection: Detection,
        maxtheta: f64,
    ) -> Self {
        Self {
            table,
            start_times,
            ctimes,
            source,
            detection,
            maxtheta,
        }
    }

    /// Segment of subjects entering in `[start, ctimes[column]]`.
    pub fn over_start(&self, start: f64, column: usize) -> SegmentStatistic {
        let ctime = self.ctimes[column];
        let lower = self.table.lower_bound(start);
        let upper = self.table.upper_bound(ctime);
        if lower >= upper {
            return SegmentStatistic {
                value: 0.0,
                value_excl: 0.0,
                theta: 0.0,
                theta_excl: 0.0,
            };
        }

        let intensity = self.source.accumulated(lower..upper, column);
        let mut failures = 0usize;
        let mut failures_now = 0usize;
        for subject in &self.table.subjects()[lower..upper] {
            if subject.failed_by(ctime) {
                failures += 1;
                if subject.otime == ctime {
                    failures_now += 1;
                }
            }
        }
        let failures_excl = (failures - failures_now) as f64;
        let failures = failures as f64;

        let theta = excess_log_hazard(failures, intensity, self.detection, self.maxtheta);
        let theta_excl = excess_log_hazard(failures_excl, intensity, self.detection, self.maxtheta);
        SegmentStatistic {
            value: segment_value(theta, failures, intensity, self.detection),
            value_excl: segment_value(theta_excl, failures_excl, intensity, self.detection),
            theta,
            theta_excl,
        }
    }

    /// Maximises over every eligible start time at `ctimes[column]`.
    ///
    /// Start times after the construction time are never eligible. When
    /// detecting a decrease, a start time is also skipped until at least one
    /// of the subjects entering at it has left.
    pub fn over_starts(&self, column: usize) -> TimeResult {
        let ctime = self.ctimes[column];
        let mut best: Option<(usize, SegmentStatistic)> = None;
        let mut best_excl: Option<(usize, SegmentStatistic)> = None;

        for (idx, start) in self.start_times.iter().enumerate() {
            if start.time > ctime {
                break;
            }
            if self.detection == Detection::Lower && start.earliest_exit > ctime {
                continue;
            }
            let stat = self.over_start(start.time, column);
            if best.is_none_or(|(_, incumbent)| self.detection.more_extreme(stat.value, incumbent.value)) {
                best = Some((idx, stat));
            }
            if best_excl.is_none_or(|(_, incumbent)| {
                self.detection.more_extreme(stat.value_excl, incumbent.value_excl)
            }) {
                best_excl = Some((idx, stat));
            }
        }

        match (best, best_excl) {
            (Some((start, stat)), Some((start_excl, stat_excl))) => TimeResult {
                value: stat.value,
                value_excl: stat_excl.value_excl,
                theta: stat.theta,
                theta_excl: stat_excl.theta_excl,
                start: Some(start),
                start_excl: Some(start_excl),
            },
            _ => TimeResult::NEUTRAL,
        }
    }

    /// Evaluates every construction time, in parallel when `workers` allows.
    pub fn scan(&self, workers: &WorkerPlan) -> Vec<TimeResult> {
        let columns = 0..self.ctimes.len();
        workers.run("likelihood maximisation", |parallel| {
            if parallel {
                columns.into_par_iter().map(|column| self.over_starts(column)).collect()
            } else {
                columns.map(|column| self.over_starts(column)).collect()
            }
        })
    }

    /// Evaluates construction times in increasing order until the chart first
    /// reaches `h`; every later time receives the neutral result.
    pub fn scan_until(&self, h: f64) -> Reduction {
        let mut state = StopState::Untripped;
        let results = (0..self.ctimes.len())
            .map(|column| match state {
                StopState::Tripped(_) => TimeResult::NEUTRAL,
                StopState::Untripped => {
                    let result = self.over_starts(column);
                    if result.crosses(h) {
                        state = StopState::Tripped(column);
                    }
                    result
                }
            })
            .collect();
        Reduction {
            results,
            stopped_at: match state {
                StopState::Tripped(column) => Some(column),
                StopState::Untripped => None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hazard::ConstantHazard;
    use crate::intensity::HazardMatrix;
    use crate::subjects::Subject;
    use approx::assert_abs_diff_eq;
    use ndarray::Array1;

    fn build(
        subjects: Vec<Subject>,
        ctimes: &[f64],
        rate: f64,
    ) -> (SubjectTable, Vec<StartTime>, HazardMatrix) {
        let table = SubjectTable::new(subjects).expect("table");
        let hazard = ConstantHazard::new(rate).expect("rate");
        let risk = Array1::ones(table.len());
        let matrix =
            HazardMatrix::build(&table, risk.view(), ctimes, &hazard, &WorkerPlan::sequential());
        let starts = table.start_times();
        (table, starts, matrix)
    }

    #[test]
    fn clamp_respects_detection_side() {
        assert_eq!(Detection::Upper.clamp_theta(-1.0, 2.0), 0.0);
        assert_eq!(Detection::Upper.clamp_theta(3.0, 2.0), 2.0);
        assert_eq!(Detection::Lower.clamp_theta(1.0, 2.0), 0.0);
        assert_eq!(Detection::Lower.clamp_theta(-3.0, 2.0), -2.0);
        assert_eq!(Detection::Lower.clamp_theta(-1.5, -2.0), -1.5);
    }

    #[test]
    fn non_finite_ratio_gives_neutral_estimate() {
        assert_eq!(excess_log_hazard(1.0, 0.0, Detection::Upper, 5.0), 0.0);
        assert_eq!(excess_log_hazard(0.0, 0.0, Detection::Lower, 5.0), 0.0);
        assert_eq!(excess_log_hazard(0.0, 2.0, Detection::Upper, 5.0), 0.0);
        assert_eq!(excess_log_hazard(0.0, 2.0, Detection::Lower, 5.0), 0.0);
        assert_eq!(excess_log_hazard(1.0, 1e6, Detection::Lower, 5.0), -5.0);
    }

    #[test]
    fn single_failure_matches_closed_form() {
        let ctimes = [1.0, 3.0, 5.0];
        let (table, starts, matrix) = build(vec![Subject::new(0.0, 5.0, true)], &ctimes, 0.1);
        let maximizer = Maximizer::new(&table, &starts, &ctimes, &matrix, Detection::Upper, 5.0);

        let segment = maximizer.over_start(0.0, 2);
        assert_abs_diff_eq!(segment.theta, 2f64.ln(), epsilon = 1e-12);
        assert_abs_diff_eq!(segment.value, 2f64.ln() - 0.5, epsilon = 1e-12);
        assert_eq!(segment.theta_excl, 0.0);
        assert_eq!(segment.value_excl, 0.0);

        let early = maximizer.over_starts(1);
        assert_eq!(early.value, 0.0);
        assert_eq!(early.start, Some(0));
    }

    #[test]
    fn breakpoint_is_the_maximising_start_time() {
        // Quiet early cohort, then a cohort failing quickly.
        let subjects = vec![
            Subject::new(0.0, 10.0, false),
            Subject::new(0.0, 10.0, false),
            Subject::new(5.0, 6.0, true),
            Subject::new(5.0, 6.5, true),
        ];
        let ctimes = [7.0];
        let (table, starts, matrix) = build(subjects, &ctimes, 0.1);
        let maximizer = Maximizer::new(&table, &starts, &ctimes, &matrix, Detection::Upper, 5.0);
        let result = maximizer.over_starts(0);
        assert_eq!(result.start, Some(1));
        let late = maximizer.over_start(5.0, 0);
        assert_eq!(result.value, late.value);
        assert!(result.value > maximizer.over_start(0.0, 0).value);
    }

    #[test]
    fn no_eligible_start_gives_neutral_result() {
        let ctimes = [1.0];
        let (table, starts, matrix) = build(vec![Subject::new(2.0, 3.0, true)], &ctimes, 0.1);
        let maximizer = Maximizer::new(&table, &starts, &ctimes, &matrix, Detection::Upper, 5.0);
        assert_eq!(maximizer.over_starts(0), TimeResult::NEUTRAL);
    }

    #[test]
    fn lower_detection_waits_for_first_exit_of_a_start_time() {
        let subjects = vec![Subject::new(0.0, 4.0, true), Subject::new(2.0, 8.0, false)];
        let ctimes = [3.0, 5.0];
        let (table, starts, matrix) = build(subjects, &ctimes, 0.5);
        let maximizer = Maximizer::new(&table, &starts, &ctimes, &matrix, Detection::Lower, 2.0);

        assert_eq!(maximizer.over_starts(0), TimeResult::NEUTRAL);

        let later = maximizer.over_starts(1);
        assert_eq!(later.start, Some(0));
        assert!(later.value < 0.0);
        // One failure against 0.5 · (4 + 3) accrued intensity.
        assert_abs_diff_eq!(later.theta, (1.0f64 / 3.5).ln(), epsilon = 1e-12);
    }

    #[test]
    fn lower_detection_stays_neutral_without_failures() {
        let subjects = vec![Subject::new(0.0, 4.0, false), Subject::new(2.0, 8.0, false)];
        let ctimes = [5.0, 9.0];
        let (table, starts, matrix) = build(subjects, &ctimes, 0.5);
        let maximizer = Maximizer::new(&table, &starts, &ctimes, &matrix, Detection::Lower, 2.0);
        for result in maximizer.scan(&WorkerPlan::sequential()) {
            assert_eq!(result.value, 0.0);
            assert_eq!(result.theta, 0.0);
        }
    }

    #[test]
    fn early_stopping_trips_once() {
        let subjects: Vec<Subject> = (0..6)
            .map(|i| Subject::new(i as f64, i as f64 + 0.5, true))
            .collect();
        let ctimes: Vec<f64> = (0..6).map(|i| i as f64 + 0.5).collect();
        let (table, starts, matrix) = build(subjects, &ctimes, 0.05);
        let maximizer = Maximizer::new(&table, &starts, &ctimes, &matrix, Detection::Upper, 5.0);

        let full = maximizer.scan(&WorkerPlan::sequential());
        let threshold = full[2].value;
        let reduction = maximizer.scan_until(threshold);
        let stop = reduction.stopped_at.expect("tripped");
        assert!(stop <= 2);
        assert_eq!(&reduction.results[..=stop], &full[..=stop]);
        assert!(reduction.results[stop + 1..]
            .iter()
            .all(|result| *result == TimeResult::NEUTRAL));

        let never = maximizer.scan_until(1e6);
        assert_eq!(never.stopped_at, None);
        assert_eq!(never.results, full);
    }
}

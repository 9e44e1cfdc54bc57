use itertools::Itertools;
use ndarray::{Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced while validating a subject table.
#[derive(Debug, Error, PartialEq)]
pub enum SubjectError {
    #[error("entry time of subject {index} is not finite")]
    NonFiniteEntry { index: usize },
    #[error("observation time of subject {index} is not finite")]
    NonFiniteExit { index: usize },
    #[error("subject {index} leaves at {otime} before entering at {entrytime}")]
    ExitBeforeEntry {
        index: usize,
        entrytime: f64,
        otime: f64,
    },
    #[error(
        "subjects must be sorted by entry time: subject {index} enters at {entrytime} after a subject entering at {previous}"
    )]
    UnsortedEntryTimes {
        index: usize,
        entrytime: f64,
        previous: f64,
    },
    #[error("covariate matrix has {found} rows but the table holds {expected} subjects")]
    CovariateRowMismatch { expected: usize, found: usize },
    #[error("covariate matrix has {found} columns but {expected} names were given")]
    CovariateNameMismatch { expected: usize, found: usize },
    #[error("follow-up cutoff must be positive and finite, got {0}")]
    InvalidFollowup(f64),
}

/// One monitored subject: arrival, exit and whether the exit was a failure.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    pub entrytime: f64,
    pub otime: f64,
    pub censorid: bool,
}

impl Subject {
    pub fn new(entrytime: f64, otime: f64, censorid: bool) -> Self {
        Self {
            entrytime,
            otime,
            censorid,
        }
    }

    /// Whether an observed failure of this subject happened at or before `time`.
    #[inline]
    pub fn failed_by(&self, time: f64) -> bool {
        self.censorid && self.otime <= time
    }
}

/// A distinct entry time from which a change-point search may start.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StartTime {
    pub time: f64,
    /// Earliest observation time among the subjects entering at `time`.
    pub earliest_exit: f64,
}

/// Subjects of one unit, kept sorted by entry time.
///
/// The ordering is an invariant checked at construction; unsorted input is
/// rejected rather than re-sorted so that row indices stay aligned with any
/// externally computed risk scores.
#[derive(Debug, Clone, PartialEq)]
pub struct SubjectTable {
    subjects: Vec<Subject>,
    covariates: Array2<f64>,
    covariate_names: Vec<String>,
}

impl SubjectTable {
    pub fn new(subjects: Vec<Subject>) -> Result<Self, SubjectError> {
        let n = subjects.len();
        Self::with_covariates(subjects, Vec::new(), Array2::zeros((n, 0)))
    }

    pub fn with_covariates(
        subjects: Vec<Subject>,
        covariate_names: Vec<String>,
        covariates: Array2<f64>,
    ) -> Result<Self, SubjectError> {
        validate_subjects(&subjects)?;
        if covariates.nrows() != subjects.len() {
            return Err(SubjectError::CovariateRowMismatch {
                expected: subjects.len(),
                found: covariates.nrows(),
            });
        }
        if covariates.ncols() != covariate_names.len() {
            return Err(SubjectError::CovariateNameMismatch {
                expected: covariate_names.len(),
                found: covariates.ncols(),
            });
        }
        Ok(Self {
            subjects,
            covariates,
            covariate_names,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.subjects.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }

    #[inline]
    pub fn subjects(&self) -> &[Subject] {
        &self.subjects
    }

    pub fn covariate_names(&self) -> &[String] {
        &self.covariate_names
    }

    /// Column of the named covariate, if the table carries it.
    pub fn covariate(&self, name: &str) -> Option<ArrayView1<'_, f64>> {
        self.covariate_names
            .iter()
            .position(|candidate| candidate == name)
            .map(|idx| self.covariates.column(idx))
    }

    pub fn earliest_entry(&self) -> Option<f64> {
        self.subjects.first().map(|s| s.entrytime)
    }

    /// Index of the first subject entering at or after `time`.
    #[inline]
    pub fn lower_bound(&self, time: f64) -> usize {
        self.subjects.partition_point(|s| s.entrytime < time)
    }

    /// One past the index of the last subject entering at or before `time`.
    #[inline]
    pub fn upper_bound(&self, time: f64) -> usize {
        self.subjects.partition_point(|s| s.entrytime <= time)
    }

    /// Distinct entry times in ascending order, each with the earliest exit
    /// among the subjects entering at that time.
    pub fn start_times(&self) -> Vec<StartTime> {
        let mut starts: Vec<StartTime> = Vec::new();
        for subject in &self.subjects {
            match starts.last_mut() {
                Some(last) if last.time == subject.entrytime => {
                    last.earliest_exit = last.earliest_exit.min(subject.otime);
                }
                _ => starts.push(StartTime {
                    time: subject.entrytime,
                    earliest_exit: subject.otime,
                }),
            }
        }
        starts
    }

    /// Sorted distinct entry and observation times: every instant at which the
    /// chart can change slope or jump.
    pub fn event_times(&self) -> Vec<f64> {
        self.subjects
            .iter()
            .flat_map(|s| [s.entrytime, s.otime])
            .sorted_by(f64::total_cmp)
            .dedup()
            .collect()
    }

    /// Copy of the table where nobody is followed for longer than `followup`
    /// after entry. Subjects cut short become censored at the cutoff.
    pub fn with_followup(&self, followup: f64) -> Result<Self, SubjectError> {
        if !followup.is_finite() || followup <= 0.0 {
            return Err(SubjectError::InvalidFollowup(followup));
        }
        let subjects = self
            .subjects
            .iter()
            .map(|s| {
                let cutoff = s.entrytime + followup;
                if s.otime > cutoff {
                    Subject::new(s.entrytime, cutoff, false)
                } else {
                    *s
                }
            })
            .collect();
        Ok(Self {
            subjects,
            covariates: self.covariates.clone(),
            covariate_names: self.covariate_names.clone(),
        })
    }

    /// Table restricted to the given rows, in the given (sorted) order.
    pub fn select(&self, rows: &[usize]) -> Result<Self, SubjectError> {
        let subjects = rows.iter().map(|&i| self.subjects[i]).collect();
        let covariates = self.covariates.select(Axis(0), rows);
        Self::with_covariates(subjects, self.covariate_names.clone(), covariates)
    }
}

fn validate_subjects(subjects: &[Subject]) -> Result<(), SubjectError> {
    let mut previous = f64::NEG_INFINITY;
    for (index, subject) in subjects.iter().enumerate() {
        if !subject.entrytime.is_finite() {
            return Err(SubjectError::NonFiniteEntry { index });
        }
        if !subject.otime.is_finite() {
            return Err(SubjectError::NonFiniteExit { index });
        }
        if subject.otime < subject.entrytime {
            return Err(SubjectError::ExitBeforeEntry {
                index,
                entrytime: subject.entrytime,
                otime: subject.otime,
            });
        }
        if subject.entrytime < previous {
            return Err(SubjectError::UnsortedEntryTimes {
                index,
                entrytime: subject.entrytime,
                previous,
            });
        }
        previous = subject.entrytime;
    }
    Ok(())
}

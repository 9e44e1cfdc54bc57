//! Cumulative intensities `risk_i · Λ(min(t, otime_i) − entry_i)` of the
//! subjects in a unit, either materialised as a dense subjects × construction
//! times matrix or evaluated on demand.

use crate::hazard::CumulativeHazard;
use crate::subjects::{Subject, SubjectTable};
use crate::workers::WorkerPlan;
use log::debug;
use ndarray::{Array2, ArrayView1, ArrayView2, Axis, Zip};
use std::ops::Range;

/// Source of summed subject intensities at a construction time.
pub trait IntensitySource: Sync {
    /// Sum of the intensities of subjects `rows` at construction time
    /// `ctimes[column]`.
    fn accumulated(&self, rows: Range<usize>, column: usize) -> f64;
}

/// Baseline cumulative hazard a subject has accrued by `time`, before risk
/// adjustment. Zero until the subject enters; frozen once it leaves.
#[inline]
pub fn subject_baseline<H: CumulativeHazard + ?Sized>(subject: &Subject, time: f64, hazard: &H) -> f64 {
    if time < subject.entrytime {
        0.0
    } else {
        hazard.cumulative(time.min(subject.otime) - subject.entrytime)
    }
}

/// Dense hazard-contribution matrix: row `i`, column `j` holds the
/// risk-adjusted cumulative intensity of subject `i` at `ctimes[j]`.
#[derive(Debug, Clone, PartialEq)]
pub struct HazardMatrix {
    values: Array2<f64>,
}

impl HazardMatrix {
    /// Rows are filled in parallel when `workers` allows it; the risk scores are
    /// applied afterwards as one broadcast over the whole matrix.
    pub fn build<H: CumulativeHazard + ?Sized>(
        table: &SubjectTable,
        risk: ArrayView1<'_, f64>,
        ctimes: &[f64],
        hazard: &H,
        workers: &WorkerPlan,
    ) -> Self {
        let subjects = table.subjects();
        let mut values = Array2::<f64>::zeros((subjects.len(), ctimes.len()));
        debug!(
            "Building hazard-contribution matrix of {} subjects x {} construction times.",
            subjects.len(),
            ctimes.len()
        );

        workers.run("hazard-contribution matrix", |parallel| {
            let fill = |idx: usize, mut row: ndarray::ArrayViewMut1<'_, f64>| {
                let subject = &subjects[idx];
                for (cell, &time) in row.iter_mut().zip(ctimes) {
                    *cell = subject_baseline(subject, time, hazard);
                }
            };
            let rows = Zip::indexed(values.rows_mut());
            if parallel {
                rows.par_for_each(fill);
            } else {
                rows.for_each(fill);
            }
        });

        values *= &risk.insert_axis(Axis(1));
        Self { values }
    }

    pub fn values(&self) -> ArrayView2<'_, f64> {
        self.values.view()
    }
}

impl IntensitySource for HazardMatrix {
    #[inline]
    fn accumulated(&self, rows: Range<usize>, column: usize) -> f64 {
        self.values
            .column(column)
            .slice(ndarray::s![rows])
            .sum()
    }
}

/// Evaluates the cumulative hazard for every requested subject on each call,
/// trading repeated work for never materialising the matrix.
pub struct OnTheFlyIntensity<'a, H: ?Sized> {
    subjects: &'a [Subject],
    risk: ArrayView1<'a, f64>,
    ctimes: &'a [f64],
    hazard: &'a H,
}

impl<'a, H: CumulativeHazard + ?Sized> OnTheFlyIntensity<'a, H> {
    pub fn new(
        table: &'a SubjectTable,
        risk: ArrayView1<'a, f64>,
        ctimes: &'a [f64],
        hazard: &'a H,
    ) -> Self {
        Self {
            subjects: table.subjects(),
            risk,
            ctimes,
            hazard,
        }
    }
}

impl<H: CumulativeHazard + ?Sized> IntensitySource for OnTheFlyIntensity<'_, H> {
    fn accumulated(&self, rows: Range<usize>, column: usize) -> f64 {
        let time = self.ctimes[column];
        rows.map(|idx| subject_baseline(&self.subjects[idx], time, self.hazard) * self.risk[idx])
            .sum()
    }
}

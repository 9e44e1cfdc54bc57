use crate::maximize::TimeResult;
use crate::subjects::StartTime;
use serde::{Deserialize, Serialize};

/// One vertex of the chart's step path.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChartPoint {
    pub time: f64,
    pub value: f64,
    /// Estimated relative-hazard multiplier `e^θ̂`.
    pub multiplier: f64,
    /// Start time of the maximising segment; 0 when there is none.
    pub start_time: f64,
}

impl ChartPoint {
    pub fn origin(time: f64) -> Self {
        Self {
            time,
            value: 0.0,
            multiplier: 1.0,
            start_time: 0.0,
        }
    }
}

/// Ordered chart path, starting with a synthetic origin point.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChartTrace {
    points: Vec<ChartPoint>,
}

impl ChartTrace {
    /// Trace holding only the origin point.
    pub fn origin_only(time: f64) -> Self {
        Self {
            points: vec![ChartPoint::origin(time)],
        }
    }

    /// Unfolds per-construction-time results into a single path.
    ///
    /// When failures happen exactly at a construction time, the chart jumps
    /// there: the value before the jump (ignoring those failures) is emitted
    /// first, followed by the value after it. Otherwise a single point is
    /// emitted.
    pub fn assemble(
        origin: f64,
        ctimes: &[f64],
        results: &[TimeResult],
        start_times: &[StartTime],
    ) -> Self {
        let start_of = |idx: Option<usize>| idx.map_or(0.0, |i| start_times[i].time);
        let mut points = Vec::with_capacity(1 + 2 * results.len());
        points.push(ChartPoint::origin(origin));

        for (&time, result) in ctimes.iter().zip(results) {
            if result.value != result.value_excl {
                points.push(ChartPoint {
                    time,
                    value: result.value_excl,
                    multiplier: result.theta_excl.exp(),
                    start_time: start_of(result.start_excl),
                });
            }
            points.push(ChartPoint {
                time,
                value: result.value,
                multiplier: result.theta.exp(),
                start_time: start_of(result.start),
            });
        }
        Self { points }
    }

    pub fn points(&self) -> &[ChartPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Points at or before `time`.
    pub fn until(&self, time: f64) -> impl Iterator<Item = &ChartPoint> {
        self.points.iter().take_while(move |point| point.time <= time)
    }

    /// Largest absolute chart value reached at or before `time`.
    pub fn max_abs_until(&self, time: f64) -> f64 {
        self.until(time)
            .map(|point| point.value.abs())
            .fold(0.0, f64::max)
    }
}

/// Time at which the chart first reaches the control limit `h` in absolute
/// value, or `None` if it never does.
pub fn run_length(trace: &ChartTrace, h: f64) -> Option<f64> {
    trace
        .points()
        .iter()
        .find(|point| point.value.abs() >= h.abs())
        .map(|point| point.time)
}

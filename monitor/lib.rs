#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

//! Risk-adjusted continuous-time CUSUM charts for monitoring the failure
//! rate of subjects across units.
//!
//! The centrepiece is the CGR-CUSUM ([`cgr::CgrChart`]): at every construction
//! time it maximises a profile likelihood ratio over the excess log-hazard
//! and over the time the excess started. Risk scores and the baseline hazard
//! come from a model fitted elsewhere ([`hazard`]).

pub mod cgr;
pub mod config;
pub mod data;
pub mod hazard;
pub mod intensity;
pub mod limit;
pub mod maximize;
pub mod subjects;
pub mod trace;
pub mod workers;

pub use cgr::{CgrChart, CgrSpec, ChartError, ChartRun, Engine};
pub use maximize::Detection;
pub use subjects::{Subject, SubjectTable};
pub use trace::{ChartPoint, ChartTrace, run_length};

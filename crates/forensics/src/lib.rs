//! Post-session forensic analysis.
//!
//! One batch pass over the pipeline's frozen event snapshot produces the
//! report structure consumed by the renderer: category aggregates, burst
//! detection, entropy measures, third-party attribution, library
//! detection and a single normalized risk score. The analyzer is a pure
//! function of its inputs and never fails on a single malformed record.

pub mod domain;
pub mod model;

mod analyzer;

pub use analyzer::{analyze, AnalysisContext};
pub use model::{
    Burst, CategoryAggregate, CookieSummary, EntropySummary, ForensicReport, LibraryDetection,
    ThirdPartyDomain, Threat, TimelineBucket, WebsocketChannel,
};

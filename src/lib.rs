//! Pagewatch: forensic browser observation.
//!
//! Points a browser at a URL, attaches to every execution context the page
//! spawns, funnels protocol/probe/host events through a deduplicating
//! pipeline, and batch-analyzes the session into a scored report.

pub mod config;
pub mod session;

pub use config::CaptureConfig;
pub use session::{CaptureOutcome, CaptureSession};

//! Capture session configuration.

use std::path::PathBuf;
use std::time::Duration;

use pagewatch_cdp_observer::config::ObserverConfig;

/// Everything one capture run needs: the page under observation, the
/// wall-clock budget, and the observer tuning underneath.
#[derive(Clone, Debug)]
pub struct CaptureConfig {
    pub url: String,
    pub duration: Duration,
    /// Where to write the report artifact; `None` keeps it in memory only.
    pub output: Option<PathBuf>,
    pub pipeline_capacity: usize,
    pub observer: ObserverConfig,
}

impl CaptureConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            duration: Duration::from_secs(30),
            output: None,
            pipeline_capacity: 20_000,
            observer: ObserverConfig::default(),
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_output(mut self, output: PathBuf) -> Self {
        self.output = Some(output);
        self
    }
}

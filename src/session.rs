//! Capture session orchestration: observer in, report out.

use std::fs::File;
use std::io::BufWriter;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use pagewatch_cdp_observer::build_transport;
use pagewatch_cdp_observer::observer::TargetObserver;
use pagewatch_cdp_observer::transport::CdpTransport;
use pagewatch_cdp_observer::ObserverMode;
use pagewatch_core_types::{epoch_millis, CaptureId};
use pagewatch_event_pipeline::{EventPipeline, PipelineConfig};
use pagewatch_forensics::{analyze, AnalysisContext, ForensicReport};

use crate::config::CaptureConfig;

/// Grace window between freezing attachment and taking the snapshot, so
/// already-in-flight terminal notifications can still correlate.
const SNAPSHOT_GRACE: Duration = Duration::from_millis(250);

pub struct CaptureSession {
    cfg: CaptureConfig,
}

pub struct CaptureOutcome {
    pub capture_id: CaptureId,
    pub mode: ObserverMode,
    pub report: ForensicReport,
}

impl CaptureSession {
    pub fn new(cfg: CaptureConfig) -> Self {
        Self { cfg }
    }

    /// Runs one capture: observe for the configured budget, then freeze,
    /// snapshot and analyze. Only failing to establish the observation
    /// session at all is an error; everything else degrades in-band.
    pub async fn run(&self) -> Result<CaptureOutcome> {
        let mut observer_cfg = self.cfg.observer.clone();
        let (transport, mode) = build_transport(&mut observer_cfg);
        self.run_with_transport(transport, mode, observer_cfg).await
    }

    pub async fn run_with_transport(
        &self,
        transport: Arc<dyn CdpTransport>,
        mode: ObserverMode,
        observer_cfg: pagewatch_cdp_observer::config::ObserverConfig,
    ) -> Result<CaptureOutcome> {
        let capture_id = CaptureId::new();
        let started_at = epoch_millis();

        let pipeline = Arc::new(EventPipeline::new(PipelineConfig {
            capacity: self.cfg.pipeline_capacity,
            ..PipelineConfig::default()
        }));
        let observer = Arc::new(TargetObserver::new(
            observer_cfg,
            transport,
            Arc::clone(&pipeline),
        ));

        observer
            .start()
            .await
            .context("failed to establish observation session")?;

        if mode.is_stub() {
            warn!(
                target: "pagewatch",
                "running against the stub transport; the report will be empty"
            );
        } else {
            observer
                .open(&self.cfg.url)
                .await
                .context("failed to open page under observation")?;
            info!(target: "pagewatch", url = %self.cfg.url, "observation started");
        }

        let cancel_token = observer.cancel_token();
        tokio::select! {
            _ = sleep(self.cfg.duration) => {
                debug!(target: "pagewatch", "session budget expired");
            }
            _ = cancel_token.cancelled() => {
                debug!(target: "pagewatch", "session cancelled");
            }
        }

        // Budget expiry stops new attach/enable traffic but in-flight
        // correlation drains for one short grace window.
        observer.freeze_attach();
        sleep(SNAPSHOT_GRACE).await;
        let discarded = observer.discard_inflight();
        if discarded > 0 {
            debug!(target: "pagewatch", discarded, "outstanding requests dropped at snapshot");
        }

        let ended_at = epoch_millis();
        let targets = observer.registry().snapshot();
        let stats = pipeline.stats();
        let events = pipeline.drain();
        observer.shutdown().await;

        info!(
            target: "pagewatch",
            stored = events.len(),
            pushed = stats.total_pushed,
            targets = targets.len(),
            "snapshot frozen, analyzing"
        );

        let ctx = AnalysisContext {
            target_url: self.cfg.url.clone(),
            targets,
            started_at,
            ended_at,
            pipeline_stats: stats,
        };
        let report = analyze(&events, &ctx);

        if let Some(path) = &self.cfg.output {
            let file = File::create(path)
                .with_context(|| format!("failed to create report file {}", path.display()))?;
            serde_json::to_writer_pretty(BufWriter::new(file), &report)
                .context("failed to serialize report")?;
            info!(target: "pagewatch", path = %path.display(), "report written");
        }

        Ok(CaptureOutcome {
            capture_id,
            mode,
            report,
        })
    }
}

//! End-to-end smoke over the session runner against the stub transport:
//! no browser, but the whole observe -> freeze -> snapshot -> analyze ->
//! artifact path is exercised.

use std::sync::Arc;
use std::time::Duration;

use pagewatch_cdp_observer::config::ObserverConfig;
use pagewatch_cdp_observer::transport::NoopTransport;
use pagewatch_cdp_observer::ObserverMode;
use pagewatch_cli::{CaptureConfig, CaptureSession};

#[tokio::test]
async fn stub_session_produces_a_well_formed_report() {
    let output = tempfile::tempdir().expect("tempdir");
    let report_path = output.path().join("report.json");

    let cfg = CaptureConfig::new("https://shop.example.com/")
        .with_duration(Duration::from_millis(200))
        .with_output(report_path.clone());
    let session = CaptureSession::new(cfg);

    let outcome = session
        .run_with_transport(
            Arc::new(NoopTransport::default()),
            ObserverMode::Stub,
            ObserverConfig::default(),
        )
        .await
        .expect("stub session completes");

    assert!(outcome.mode.is_stub());
    // The stub transport rejects every command, which surfaces as
    // low-severity diagnostics rather than failures.
    let report = &outcome.report;
    // All stub events are low-severity diagnostics: weight 1 of 10.
    assert!(report.risk_score <= 10);
    assert!(report.pipeline_stats.total_pushed >= 2);
    assert!(report.categories.iter().any(|c| c.name == "diagnostic"));
    assert!(report.library_detections.is_empty());
    assert!(report.bursts.is_empty());

    // The artifact honors the renderer contract.
    let raw = std::fs::read_to_string(&report_path).expect("report file written");
    let value: serde_json::Value = serde_json::from_str(&raw).expect("report parses");
    for key in ["categories", "riskScore", "h5w", "pipelineStats", "timeline"] {
        assert!(value.get(key).is_some(), "missing report key {key}");
    }
}

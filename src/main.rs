use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pagewatch_cli::{CaptureConfig, CaptureSession};

/// Forensic browser observation: open a page, watch everything it and its
/// sub-contexts do for a bounded window, emit a scored report.
#[derive(Parser, Debug)]
#[command(name = "pagewatch", version, about)]
struct Cli {
    /// URL of the page to observe.
    url: String,

    /// Observation window, e.g. "30s" or "2m".
    #[arg(long, default_value = "30s")]
    duration: humantime::Duration,

    /// Report artifact path.
    #[arg(long, short, default_value = "pagewatch-report.json")]
    output: PathBuf,

    /// Run the browser with a visible window.
    #[arg(long)]
    headful: bool,

    /// Attach to an already-running browser instead of launching one.
    #[arg(long)]
    ws_url: Option<String>,

    /// Chrome/Chromium executable override.
    #[arg(long)]
    chrome_path: Option<PathBuf>,

    /// Event buffer capacity.
    #[arg(long, default_value_t = 20_000)]
    capacity: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    let mut cfg = CaptureConfig::new(&cli.url)
        .with_duration(cli.duration.into())
        .with_output(cli.output.clone());
    cfg.pipeline_capacity = cli.capacity;
    if cli.headful {
        cfg.observer.headless = false;
    }
    if let Some(ws_url) = cli.ws_url {
        cfg.observer.websocket_url = Some(ws_url);
    }
    if let Some(path) = cli.chrome_path {
        cfg.observer.executable = path;
    }

    let outcome = CaptureSession::new(cfg).run().await?;
    let report = &outcome.report;

    info!(
        target: "pagewatch",
        capture = %outcome.capture_id.0,
        mode = outcome.mode.as_str(),
        risk_score = report.risk_score,
        events = report.pipeline_stats.total_stored,
        categories = report.categories.len(),
        libraries = report.library_detections.len(),
        third_parties = report.third_parties.len(),
        bursts = report.bursts.len(),
        "capture complete"
    );

    println!("risk score: {}/100", report.risk_score);
    for detection in &report.library_detections {
        println!(
            "  detected: {} ({}, {} confidence)",
            detection.library, detection.category, detection.confidence
        );
    }
    for threat in report.threats.iter().take(5) {
        println!(
            "  threat: {}/{} x{} [{}]",
            threat.category, threat.api, threat.count, threat.risk
        );
    }
    println!("report: {}", cli.output.display());

    Ok(())
}

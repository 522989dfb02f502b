//! Contract tests bridging the observer to a real Chromium binary. They
//! are ignored by default because they require Chrome/Chromium on the
//! host machine.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use pagewatch_cdp_observer::build_transport;
use pagewatch_cdp_observer::config::ObserverConfig;
use pagewatch_cdp_observer::observer::TargetObserver;
use pagewatch_event_pipeline::{EventPipeline, PipelineConfig};

fn contract_enabled() -> bool {
    env::var("PAGEWATCH_CDP_CONTRACT")
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

#[tokio::test]
#[ignore = "requires Chrome/Chromium; set PAGEWATCH_CDP_CONTRACT=1 and PAGEWATCH_USE_REAL_CHROME=1"]
async fn contract_observes_a_real_page() {
    if !contract_enabled() {
        eprintln!("skipping CDP contract test (PAGEWATCH_CDP_CONTRACT not enabled)");
        return;
    }

    let mut cfg = ObserverConfig::default();
    let (transport, mode) = build_transport(&mut cfg);
    assert!(!mode.is_stub(), "contract test needs a real browser");

    let pipeline = Arc::new(EventPipeline::new(PipelineConfig::default()));
    let observer = Arc::new(TargetObserver::new(cfg, transport, pipeline.clone()));
    observer.start().await.expect("observer start");
    observer
        .open("https://example.com")
        .await
        .expect("open page");

    sleep(Duration::from_secs(10)).await;
    observer.freeze_attach();

    let stats = pipeline.stats();
    assert!(stats.total_pushed >= 1, "expected at least one event");
    assert!(
        stats.network_requests >= 1,
        "expected network observation on the attached page"
    );
    assert!(
        observer.registry().snapshot().len() >= 1,
        "the page target must be attached"
    );

    observer.shutdown().await;
}

//! Target-graph behavior against a scripted transport: attach fan-out,
//! auto-attach re-arming, request correlation and probe ingestion, with
//! no browser involved.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{Mutex, Notify};
use tokio::time::sleep;

use pagewatch_cdp_observer::config::ObserverConfig;
use pagewatch_cdp_observer::error::ObserverError;
use pagewatch_cdp_observer::observer::TargetObserver;
use pagewatch_cdp_observer::transport::{CdpTransport, CommandTarget, TransportEvent};
use pagewatch_core_types::{EventSource, Risk};
use pagewatch_event_pipeline::{EventPipeline, PipelineConfig};

#[derive(Clone, Debug)]
struct SentCommand {
    session: Option<String>,
    method: String,
    params: Value,
}

/// Feeds a fixed notification script and records every command sent.
struct ScriptedTransport {
    events: Mutex<VecDeque<TransportEvent>>,
    commands: StdMutex<Vec<SentCommand>>,
    drained: Notify,
}

impl ScriptedTransport {
    fn new(events: Vec<TransportEvent>) -> Self {
        Self {
            events: Mutex::new(events.into()),
            commands: StdMutex::new(Vec::new()),
            drained: Notify::new(),
        }
    }

    fn sent(&self) -> Vec<SentCommand> {
        self.commands.lock().unwrap().clone()
    }

    fn count(&self, method: &str) -> usize {
        self.sent().iter().filter(|c| c.method == method).count()
    }

    fn sessions_for(&self, method: &str) -> Vec<Option<String>> {
        self.sent()
            .iter()
            .filter(|c| c.method == method)
            .map(|c| c.session.clone())
            .collect()
    }
}

#[async_trait]
impl CdpTransport for ScriptedTransport {
    async fn start(&self) -> Result<(), ObserverError> {
        Ok(())
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        let mut guard = self.events.lock().await;
        if let Some(event) = guard.pop_front() {
            return Some(event);
        }
        drop(guard);
        // Script exhausted: park forever so the loop idles until shutdown.
        self.drained.notified().await;
        None
    }

    async fn send_command(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, ObserverError> {
        let session = match target {
            CommandTarget::Browser => None,
            CommandTarget::Session(id) => Some(id),
        };
        self.commands.lock().unwrap().push(SentCommand {
            session,
            method: method.to_string(),
            params,
        });
        match method {
            "Target.createTarget" => Ok(json!({ "targetId": "T-main" })),
            "Target.getTargets" => Ok(json!({ "targetInfos": [] })),
            _ => Ok(json!({})),
        }
    }
}

fn notification(method: &str, params: Value, session: Option<&str>) -> TransportEvent {
    TransportEvent {
        method: method.to_string(),
        params,
        session_id: session.map(str::to_string),
    }
}

fn test_config() -> ObserverConfig {
    ObserverConfig {
        popup_sweep_interval_ms: 30_000,
        ..ObserverConfig::default()
    }
}

async fn run_script(events: Vec<TransportEvent>) -> (Arc<ScriptedTransport>, Arc<EventPipeline>, Arc<TargetObserver>) {
    let transport = Arc::new(ScriptedTransport::new(events));
    let pipeline = Arc::new(EventPipeline::new(PipelineConfig::default()));
    let observer = Arc::new(TargetObserver::new(
        test_config(),
        transport.clone(),
        pipeline.clone(),
    ));
    observer.start().await.expect("observer start");
    // Let the event loop and the spawned per-session enables settle.
    sleep(Duration::from_millis(250)).await;
    (transport, pipeline, observer)
}

#[tokio::test]
async fn attach_enables_observation_and_rearms_auto_attach() {
    let events = vec![
        notification(
            "Target.attachedToTarget",
            json!({
                "sessionId": "S1",
                "targetInfo": {
                    "targetId": "T1",
                    "type": "page",
                    "url": "https://shop.example.com/",
                },
                "waitingForDebugger": true,
            }),
            None,
        ),
        notification(
            "Target.attachedToTarget",
            json!({
                "sessionId": "S2",
                "targetInfo": {
                    "targetId": "T2",
                    "type": "service_worker",
                    "url": "https://shop.example.com/sw.js",
                },
            }),
            Some("S1"),
        ),
    ];
    let (transport, pipeline, observer) = run_script(events).await;

    // Root declaration plus a re-arm scoped to every attached session.
    let auto_attach_sessions = transport.sessions_for("Target.setAutoAttach");
    assert!(auto_attach_sessions.contains(&None), "root auto-attach");
    assert!(
        auto_attach_sessions.contains(&Some("S1".to_string())),
        "auto-attach re-armed on the page session"
    );
    assert!(
        auto_attach_sessions.contains(&Some("S2".to_string())),
        "auto-attach re-armed on the worker session"
    );

    assert_eq!(transport.count("Target.setDiscoverTargets"), 1);
    assert_eq!(transport.count("Network.enable"), 2);
    // Page domain only for renderer contexts, never for workers.
    assert_eq!(
        transport.sessions_for("Page.enable"),
        vec![Some("S1".to_string())]
    );
    // The paused target was resumed before anything else.
    assert_eq!(
        transport.sessions_for("Runtime.runIfWaitingForDebugger"),
        vec![Some("S1".to_string())]
    );

    let drained = pipeline.drain();
    let worker_alert = drained
        .iter()
        .find(|e| e.category == "worker-detected")
        .expect("worker attachment raises a high-risk event");
    assert_eq!(worker_alert.risk, Risk::High);
    assert_eq!(worker_alert.detail, "https://shop.example.com/sw.js");

    let snapshot = observer.registry().snapshot();
    assert_eq!(snapshot.len(), 2);
    let worker = snapshot.iter().find(|t| t.target_id == "T2").unwrap();
    assert_eq!(worker.parent_session_id.as_deref(), Some("S1"));

    observer.shutdown().await;
}

#[tokio::test]
async fn network_notifications_are_correlated_into_joined_events() {
    let events = vec![
        notification(
            "Target.attachedToTarget",
            json!({
                "sessionId": "S1",
                "targetInfo": { "targetId": "T1", "type": "page", "url": "https://shop.example.com/" },
            }),
            None,
        ),
        notification(
            "Network.requestWillBeSent",
            json!({
                "requestId": "R1",
                "request": {
                    "url": "https://cdn.ads.io/x.js",
                    "method": "GET",
                    "headers": { "accept": "*/*" },
                },
                "type": "Script",
                "initiator": { "type": "parser" },
            }),
            Some("S1"),
        ),
        notification(
            "Network.responseReceived",
            json!({
                "requestId": "R1",
                "type": "Script",
                "response": { "url": "https://cdn.ads.io/x.js", "status": 200, "mimeType": "text/javascript" },
            }),
            Some("S1"),
        ),
        notification(
            "Network.loadingFailed",
            json!({ "requestId": "R-unseen", "errorText": "net::ERR_ABORTED" }),
            Some("S1"),
        ),
    ];
    let (_transport, pipeline, observer) = run_script(events).await;

    let drained = pipeline.drain();

    let request = drained
        .iter()
        .find(|e| e.category == "network-request")
        .expect("request event");
    assert_eq!(request.detail, "https://cdn.ads.io/x.js");
    assert_eq!(request.api, "script");
    assert_eq!(request.context_id, "S1");

    let response = drained
        .iter()
        .find(|e| e.category == "network-response")
        .expect("response joined to its request");
    assert_eq!(response.detail, "https://cdn.ads.io/x.js");
    assert_eq!(
        response.meta.as_ref().and_then(|m| m.get("status")).map(String::as_str),
        Some("200")
    );
    assert_eq!(
        response.meta.as_ref().and_then(|m| m.get("method")).map(String::as_str),
        Some("GET"),
        "joined response carries the originating request's method"
    );

    // A terminal notification with no matching begin still yields a
    // partial event instead of an error.
    let failure = drained
        .iter()
        .find(|e| e.category == "network-failure")
        .expect("partial failure event");
    assert_eq!(failure.detail, "");
    assert_eq!(
        failure.meta.as_ref().and_then(|m| m.get("errorText")).map(String::as_str),
        Some("net::ERR_ABORTED")
    );

    observer.shutdown().await;
}

#[tokio::test]
async fn large_cross_site_post_is_flagged_as_exfiltration() {
    let body = "f".repeat(600);
    let events = vec![notification(
        "Network.requestWillBeSent",
        json!({
            "requestId": "R1",
            "request": {
                "url": "https://collect.tracker.net/ingest",
                "method": "POST",
                "headers": {},
                "postData": body,
            },
            "type": "XHR",
        }),
        Some("S1"),
    )];

    let transport = Arc::new(ScriptedTransport::new(events));
    let pipeline = Arc::new(EventPipeline::new(PipelineConfig::default()));
    let observer = Arc::new(TargetObserver::new(
        test_config(),
        transport.clone(),
        pipeline.clone(),
    ));
    // Anchor the cross-site check before the event loop starts consuming
    // the scripted request.
    observer
        .open("https://shop.example.com/")
        .await
        .expect("open target page");
    observer.start().await.expect("observer start");
    sleep(Duration::from_millis(250)).await;

    let drained = pipeline.drain();
    let exfil = drained
        .iter()
        .find(|e| e.category == "exfiltration")
        .expect("cross-site POST flagged");
    assert_eq!(exfil.risk, Risk::High);
    assert_eq!(exfil.detail, "https://collect.tracker.net/ingest");
    assert!(exfil.value.as_deref().unwrap_or("").starts_with('f'));

    observer.shutdown().await;
}

#[tokio::test]
async fn probe_binding_payloads_flow_into_the_probe_stream() {
    let events = vec![
        notification(
            "Runtime.bindingCalled",
            json!({
                "name": "__pagewatch_probe",
                "payload": "{\"cat\":\"canvas\",\"api\":\"toDataURL\",\"risk\":\"high\",\"detail\":\"canvas read\"}",
            }),
            Some("S1"),
        ),
        notification(
            "Runtime.bindingCalled",
            json!({ "name": "__pagewatch_probe", "payload": "{not json" }),
            Some("S1"),
        ),
        notification(
            "Runtime.bindingCalled",
            json!({ "name": "someOtherBinding", "payload": "{}" }),
            Some("S1"),
        ),
    ];
    let (_transport, pipeline, observer) = run_script(events).await;

    let drained = pipeline.drain();
    let canvas = drained
        .iter()
        .find(|e| e.category == "canvas")
        .expect("probe event ingested");
    assert_eq!(canvas.source, EventSource::Probe);
    assert_eq!(canvas.risk, Risk::High);
    assert_eq!(canvas.context_id, "S1");

    // Malformed payloads degrade to one diagnostic, not an error.
    assert!(drained
        .iter()
        .any(|e| e.category == "diagnostic" && e.api == "probe-decode"));
    // Foreign bindings are ignored entirely.
    assert_eq!(drained.iter().filter(|e| e.source == EventSource::Probe).count(), 2);

    observer.shutdown().await;
}

#[tokio::test]
async fn lifecycle_notifications_update_the_registry() {
    let events = vec![
        notification(
            "Target.attachedToTarget",
            json!({
                "sessionId": "S1",
                "targetInfo": { "targetId": "T1", "type": "page", "url": "https://shop.example.com/" },
            }),
            None,
        ),
        notification(
            "Target.targetInfoChanged",
            json!({
                "targetInfo": { "targetId": "T1", "type": "page", "url": "https://shop.example.com/checkout" },
            }),
            None,
        ),
        notification(
            "Target.detachedFromTarget",
            json!({ "sessionId": "S1" }),
            None,
        ),
    ];
    let (_transport, pipeline, observer) = run_script(events).await;

    let drained = pipeline.drain();
    // The URL change on a top-level page doubles as host telemetry.
    let navigation = drained
        .iter()
        .find(|e| e.category == "navigation")
        .expect("host navigation event");
    assert_eq!(navigation.source, EventSource::Host);
    assert_eq!(navigation.detail, "https://shop.example.com/checkout");

    assert!(drained
        .iter()
        .any(|e| e.category == "lifecycle" && e.api == "detachedFromTarget"));
    assert_eq!(observer.registry().snapshot().len(), 0);

    observer.shutdown().await;
}

#[tokio::test]
async fn popup_sweep_attaches_unseen_pages() {
    struct PopupTransport {
        inner: ScriptedTransport,
    }

    #[async_trait]
    impl CdpTransport for PopupTransport {
        async fn start(&self) -> Result<(), ObserverError> {
            Ok(())
        }

        async fn next_event(&self) -> Option<TransportEvent> {
            self.inner.next_event().await
        }

        async fn send_command(
            &self,
            target: CommandTarget,
            method: &str,
            params: Value,
        ) -> Result<Value, ObserverError> {
            if method == "Target.getTargets" {
                let _ = self.inner.send_command(target, method, params).await;
                return Ok(json!({
                    "targetInfos": [
                        { "targetId": "T-popup", "type": "page", "url": "https://popup.ads.io/win", "attached": false },
                        { "targetId": "T-other", "type": "browser", "attached": false },
                    ]
                }));
            }
            self.inner.send_command(target, method, params).await
        }
    }

    let transport = Arc::new(PopupTransport {
        inner: ScriptedTransport::new(Vec::new()),
    });
    let pipeline = Arc::new(EventPipeline::new(PipelineConfig::default()));
    let cfg = ObserverConfig {
        popup_sweep_interval_ms: 25,
        ..ObserverConfig::default()
    };
    let observer = Arc::new(TargetObserver::new(
        cfg,
        transport.clone(),
        pipeline.clone(),
    ));
    observer.start().await.expect("observer start");
    sleep(Duration::from_millis(200)).await;

    assert!(
        transport.inner.count("Target.attachToTarget") >= 1,
        "sweep explicitly attaches the popup"
    );
    let drained = pipeline.drain();
    let popup = drained
        .iter()
        .find(|e| e.api == "popup-detected")
        .expect("popup surfaces as host event");
    assert_eq!(popup.source, EventSource::Host);
    assert_eq!(popup.detail, "https://popup.ads.io/win");

    observer.shutdown().await;
}

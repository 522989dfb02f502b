//! Target graph manager.
//!
//! Discovers and keeps observation coverage over every execution context a
//! browsing session spawns, to unbounded nesting depth. The recursion is
//! the protocol's own flattened session propagation: every newly attached
//! session gets the same auto-attach declaration re-issued against it, so
//! an iframe inside an iframe inside a worker-spawning iframe is found
//! transitively without any caller-side tree walking.
//!
//! Every protocol notification is normalized into a pipeline event here.
//! Individual command failures are demoted to low-severity diagnostic
//! events; the manager keeps running for the full session regardless.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pagewatch_core_types::{
    clamp, epoch_millis, Direction, Event, EventSource, ProbeRecord, RequestRecord, Risk, Target,
    TargetKind, POST_DATA_PREVIEW_CAP, VALUE_CAP,
};
use pagewatch_event_pipeline::EventPipeline;

use crate::config::ObserverConfig;
use crate::correlator::RequestCorrelator;
use crate::error::{ObserverError, ObserverErrorKind};
use crate::metrics;
use crate::registry::TargetRegistry;
use crate::transport::{CdpTransport, CommandTarget, TransportEvent};

/// POST bodies at least this large headed cross-site are flagged as
/// exfiltration candidates.
const EXFIL_MIN_BODY_BYTES: usize = 256;

pub struct TargetObserver {
    cfg: ObserverConfig,
    transport: Arc<dyn CdpTransport>,
    pipeline: Arc<EventPipeline>,
    registry: Arc<TargetRegistry>,
    correlator: RequestCorrelator,
    /// requestId -> channel URL for in-flight WebSockets.
    ws_channels: DashMap<String, String>,
    /// Host of the page under observation; anchors the cross-site check.
    target_host: RwLock<Option<String>>,
    shutdown: CancellationToken,
    /// Set at session budget expiry: no further attach/enable commands.
    attach_frozen: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TargetObserver {
    pub fn new(
        cfg: ObserverConfig,
        transport: Arc<dyn CdpTransport>,
        pipeline: Arc<EventPipeline>,
    ) -> Self {
        Self {
            cfg,
            transport,
            pipeline,
            registry: Arc::new(TargetRegistry::new()),
            correlator: RequestCorrelator::new(),
            ws_channels: DashMap::new(),
            target_host: RwLock::new(None),
            shutdown: CancellationToken::new(),
            attach_frozen: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn registry(&self) -> Arc<TargetRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Starts the observation loops. Failing to reach the debugging
    /// endpoint at all is the one terminal error in this layer; everything
    /// after that degrades to diagnostic events.
    pub async fn start(self: &Arc<Self>) -> Result<(), ObserverError> {
        {
            let guard = self.tasks.lock().await;
            if !guard.is_empty() {
                return Ok(());
            }
        }

        self.transport.start().await?;
        self.arm_root().await;

        let loop_task = tokio::spawn(Self::event_loop(Arc::clone(self)));
        let sweep_task = tokio::spawn(Self::popup_sweep(Arc::clone(self)));
        let mut guard = self.tasks.lock().await;
        guard.push(loop_task);
        guard.push(sweep_task);
        info!(target: "cdp-observer", "target observation started");
        Ok(())
    }

    /// Opens the page under observation and anchors third-party checks to
    /// its host. Auto-attach takes it from there.
    pub async fn open(&self, url: &str) -> Result<String, ObserverError> {
        if let Ok(parsed) = url::Url::parse(url) {
            let host = parsed.host_str().map(|h| h.to_ascii_lowercase());
            if let Ok(mut guard) = self.target_host.write() {
                *guard = host;
            }
        }
        let response = self
            .send(CommandTarget::Browser, "Target.createTarget", json!({ "url": url }))
            .await?;
        response
            .get("targetId")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                ObserverError::new(ObserverErrorKind::Protocol)
                    .with_hint("createTarget missing targetId")
            })
    }

    /// Session budget expired: stop issuing attach/enable commands while
    /// in-flight observation keeps draining.
    pub fn freeze_attach(&self) {
        self.attach_frozen.store(true, Ordering::Relaxed);
    }

    /// Discards outstanding request correlation at the snapshot boundary.
    pub fn discard_inflight(&self) -> usize {
        let pending = self.correlator.pending();
        self.correlator.clear();
        pending
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let mut handles = self.tasks.lock().await;
        while let Some(handle) = handles.pop() {
            let _ = handle.await;
        }
    }

    /// Root-session observation set-up; re-issued after a transport
    /// restart. Declaring auto-attach with `flatten` is what makes nested
    /// context discovery transitive.
    async fn arm_root(&self) {
        self.send_logged(
            CommandTarget::Browser,
            "Target.setDiscoverTargets",
            json!({ "discover": true }),
        )
        .await;
        self.send_logged(
            CommandTarget::Browser,
            "Target.setAutoAttach",
            json!({
                "autoAttach": true,
                "waitForDebuggerOnStart": false,
                "flatten": true,
            }),
        )
        .await;
    }

    async fn event_loop(self: Arc<Self>) {
        debug!(target: "cdp-observer", "event loop entered");
        const MIN_BACKOFF: Duration = Duration::from_millis(100);
        const MAX_BACKOFF: Duration = Duration::from_secs(5);
        let mut backoff = MIN_BACKOFF;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    break;
                }
                event = self.transport.next_event() => {
                    match event {
                        Some(ev) => {
                            backoff = MIN_BACKOFF;
                            self.handle_event(ev).await;
                        }
                        None => {
                            if self.shutdown.is_cancelled() {
                                break;
                            }
                            warn!(target: "cdp-observer", "transport stream ended; attempting restart");
                            if let Err(err) = self.transport.start().await {
                                warn!(target: "cdp-observer", ?err, "transport restart failed");
                            } else {
                                self.arm_root().await;
                            }
                            if self.shutdown.is_cancelled() {
                                break;
                            }
                            sleep(backoff).await;
                            backoff = (backoff + MIN_BACKOFF).min(MAX_BACKOFF);
                        }
                    }
                }
            }
        }
        debug!(target: "cdp-observer", "event loop exiting");
    }

    /// Host-layer sweep for top-level pages the child-target mechanism
    /// does not surface (`window.open` popups in particular).
    async fn popup_sweep(self: Arc<Self>) {
        let mut ticker = interval(Duration::from_millis(self.cfg.popup_sweep_interval_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if self.attach_frozen.load(Ordering::Relaxed) {
                break;
            }
            let Some(result) = self
                .send_logged(CommandTarget::Browser, "Target.getTargets", json!({}))
                .await
            else {
                continue;
            };
            let Ok(parsed) = serde_json::from_value::<GetTargetsResult>(result) else {
                continue;
            };
            for info in parsed.target_infos {
                if info.target_type != "page" || info.attached {
                    continue;
                }
                if self.registry.contains_target(&info.target_id) {
                    continue;
                }
                let url = info.url.clone().unwrap_or_default();
                self.pipeline.push_from_host(
                    Event::new(EventSource::Host, "lifecycle", "popup-detected", Risk::Medium)
                        .with_detail(url)
                        .with_meta_entry("targetId", info.target_id.clone()),
                );
                self.send_logged(
                    CommandTarget::Browser,
                    "Target.attachToTarget",
                    json!({ "targetId": info.target_id, "flatten": true }),
                )
                .await;
            }
        }
    }

    async fn handle_event(self: &Arc<Self>, event: TransportEvent) {
        metrics::record_event();
        if let Err(err) = self.process_event(event).await {
            // Malformed payloads degrade to a diagnostic; never abort.
            self.pipeline.push_from_protocol(
                Event::new(EventSource::Protocol, "diagnostic", "event-decode", Risk::Low)
                    .with_detail(err.to_string()),
            );
        }
    }

    async fn process_event(self: &Arc<Self>, event: TransportEvent) -> Result<(), ObserverError> {
        match event.method.as_str() {
            "Target.attachedToTarget" => self.on_attached(event).await?,
            "Target.detachedFromTarget" => self.on_detached(event)?,
            "Target.targetCreated" => self.on_target_created(event)?,
            "Target.targetInfoChanged" => self.on_target_info_changed(event)?,
            "Target.targetDestroyed" => self.on_target_destroyed(event)?,
            "Network.requestWillBeSent" => self.on_request(event)?,
            "Network.requestWillBeSentExtraInfo" => self.on_request_extra_info(event)?,
            "Network.responseReceived" => self.on_response(event)?,
            "Network.responseReceivedExtraInfo" => self.on_response_extra_info(event)?,
            "Network.loadingFinished" => self.on_loading_finished(event)?,
            "Network.loadingFailed" => self.on_loading_failed(event)?,
            "Network.webSocketCreated" => self.on_websocket_created(event)?,
            "Network.webSocketFrameSent" => self.on_websocket_frame(event, true)?,
            "Network.webSocketFrameReceived" => self.on_websocket_frame(event, false)?,
            "Network.webSocketClosed" => self.on_websocket_closed(event)?,
            "Security.visibleSecurityStateChanged" => self.on_security_state(event)?,
            "Security.certificateError" => self.on_certificate_error(event)?,
            "Runtime.bindingCalled" => self.on_binding_called(event)?,
            "Runtime.consoleAPICalled" => self.on_console_api(event)?,
            method if method.starts_with("Page.") => self.on_page_notification(event),
            _ => {
                debug!(target: "cdp-observer", method = %event.method, "unhandled cdp event");
            }
        }
        Ok(())
    }

    async fn on_attached(self: &Arc<Self>, event: TransportEvent) -> Result<(), ObserverError> {
        let payload: AttachedToTargetParams = decode(event.params)?;
        let kind = TargetKind::from_protocol(&payload.target_info.target_type);
        let session_id = payload.session_id.clone();
        let url = payload.target_info.url.clone().unwrap_or_default();

        metrics::record_attachment();
        self.registry.insert(Target {
            target_id: payload.target_info.target_id.clone(),
            session_id: session_id.clone(),
            kind,
            url: url.clone(),
            title: payload.target_info.title.clone(),
            parent_session_id: event.session_id.clone(),
            network_enabled: false,
            attached: true,
        });

        self.pipeline.push_from_protocol(
            Event::new(EventSource::Protocol, "lifecycle", "attachedToTarget", Risk::Info)
                .with_detail(&url)
                .with_context(session_id.clone())
                .with_meta_entry("targetId", payload.target_info.target_id.clone())
                .with_meta_entry("type", kind.as_str()),
        );

        if kind.is_worker() {
            self.pipeline.push_from_protocol(
                Event::new(EventSource::Protocol, "worker-detected", kind.as_str(), Risk::High)
                    .with_detail(&url)
                    .with_context(session_id.clone()),
            );
        }

        // A paused target must resume before anything else happens on it;
        // this is the one enable-path command worth awaiting.
        if payload.waiting_for_debugger {
            if let Err(err) = self
                .send(
                    CommandTarget::Session(session_id.clone()),
                    "Runtime.runIfWaitingForDebugger",
                    json!({}),
                )
                .await
            {
                self.diagnostic("Runtime.runIfWaitingForDebugger", &err);
            }
        }

        if !self.attach_frozen.load(Ordering::Relaxed) {
            let observer = Arc::clone(self);
            tokio::spawn(async move {
                observer.enable_session(session_id, kind).await;
            });
        }

        Ok(())
    }

    /// Per-session observation enablement, fire-and-forget: a slow or dead
    /// context must not stall the streams of the others.
    async fn enable_session(self: Arc<Self>, session_id: String, kind: TargetKind) {
        let session = CommandTarget::Session(session_id.clone());
        let enabled = self
            .send_logged(
                session.clone(),
                "Network.enable",
                json!({
                    "maxTotalBufferSize": self.cfg.network_total_buffer_bytes,
                    "maxResourceBufferSize": self.cfg.network_resource_buffer_bytes,
                }),
            )
            .await
            .is_some();
        if enabled {
            self.registry.mark_network_enabled(&session_id);
        }

        // Re-arm auto-attach on the child so its own children are
        // discovered too. This single line is the unbounded-depth part.
        self.send_logged(
            session.clone(),
            "Target.setAutoAttach",
            json!({
                "autoAttach": true,
                "waitForDebuggerOnStart": false,
                "flatten": true,
            }),
        )
        .await;

        if kind.has_page_domain() {
            self.send_logged(session.clone(), "Page.enable", json!({})).await;
            self.send_logged(session.clone(), "Security.enable", json!({})).await;
            self.send_logged(session.clone(), "Runtime.enable", json!({})).await;
            self.send_logged(
                session,
                "Runtime.addBinding",
                json!({ "name": self.cfg.probe_binding }),
            )
            .await;
        }
    }

    fn on_detached(&self, event: TransportEvent) -> Result<(), ObserverError> {
        let payload: DetachedFromTargetParams = decode(event.params)?;
        let removed = self.registry.remove_by_session(&payload.session_id);
        let detail = removed.map(|t| t.url).unwrap_or_default();
        self.pipeline.push_from_protocol(
            Event::new(EventSource::Protocol, "lifecycle", "detachedFromTarget", Risk::Info)
                .with_detail(detail)
                .with_context(payload.session_id),
        );
        Ok(())
    }

    fn on_target_created(&self, event: TransportEvent) -> Result<(), ObserverError> {
        let payload: TargetLifecycleParams = decode(event.params)?;
        self.pipeline.push_from_protocol(
            Event::new(EventSource::Protocol, "lifecycle", "targetCreated", Risk::Info)
                .with_detail(payload.target_info.url.unwrap_or_default())
                .with_meta_entry("targetId", payload.target_info.target_id)
                .with_meta_entry("type", payload.target_info.target_type),
        );
        Ok(())
    }

    fn on_target_info_changed(&self, event: TransportEvent) -> Result<(), ObserverError> {
        let payload: TargetLifecycleParams = decode(event.params)?;
        let url = payload.target_info.url.clone().unwrap_or_default();
        let updated = self.registry.update_info(
            &payload.target_info.target_id,
            payload.target_info.url.as_deref(),
            payload.target_info.title.as_deref(),
        );

        self.pipeline.push_from_protocol(
            Event::new(EventSource::Protocol, "lifecycle", "targetInfoChanged", Risk::Info)
                .with_detail(&url)
                .with_meta_entry("targetId", payload.target_info.target_id.clone()),
        );

        // Top-level navigations double as host telemetry.
        if let Some((target, url_changed)) = updated {
            if url_changed && target.kind == TargetKind::Page {
                self.pipeline.push_from_host(
                    Event::new(EventSource::Host, "navigation", "mainFrameNavigated", Risk::Info)
                        .with_detail(&target.url)
                        .with_context(target.session_id),
                );
            }
        }
        Ok(())
    }

    fn on_target_destroyed(&self, event: TransportEvent) -> Result<(), ObserverError> {
        let payload: TargetDestroyedParams = decode(event.params)?;
        let removed = self.registry.remove_by_target(&payload.target_id);
        self.pipeline.push_from_protocol(
            Event::new(EventSource::Protocol, "lifecycle", "targetDestroyed", Risk::Info)
                .with_detail(removed.map(|t| t.url).unwrap_or_default())
                .with_meta_entry("targetId", payload.target_id),
        );
        Ok(())
    }

    fn on_request(&self, event: TransportEvent) -> Result<(), ObserverError> {
        let context = context_of(&event);
        let payload: RequestWillBeSentParams = decode(event.params)?;
        let url = payload.request.url.clone();
        let method = payload.request.method.clone();
        let post_len = payload.request.post_data.as_deref().map(str::len).unwrap_or(0);
        let preview = payload
            .request
            .post_data
            .as_deref()
            .map(|d| clamp(d, POST_DATA_PREVIEW_CAP));
        let resource_type = payload.resource_type.clone();
        let initiator_type = payload.initiator.and_then(|i| i.initiator_type);

        self.correlator.begin(RequestRecord {
            request_id: payload.request_id.clone(),
            url: url.clone(),
            method: method.clone(),
            request_headers: header_map(&payload.request.headers),
            post_data_preview: preview.clone(),
            resource_type: resource_type.clone(),
            initiator_type: initiator_type.clone(),
            created_at: epoch_millis(),
        });

        let cross_site = self.is_cross_site(&url);
        let api = resource_type
            .as_deref()
            .map(|t| t.to_ascii_lowercase())
            .unwrap_or_else(|| "request".to_string());

        let mut out = if Self::looks_like_exfiltration(&method, post_len, cross_site) {
            Event::new(EventSource::Protocol, "exfiltration", "post-body", Risk::High)
        } else {
            let risk = if cross_site { Risk::Low } else { Risk::Info };
            Event::new(EventSource::Protocol, "network-request", api, risk)
        };
        out = out
            .with_detail(&url)
            .with_context(context)
            .with_meta_entry("requestId", payload.request_id)
            .with_meta_entry("method", method);
        if let Some(initiator) = initiator_type {
            out = out.with_meta_entry("initiator", initiator);
        }
        if let Some(preview) = preview {
            out = out.with_value(preview);
        }
        self.pipeline.push_from_protocol(out);
        Ok(())
    }

    fn on_request_extra_info(&self, event: TransportEvent) -> Result<(), ObserverError> {
        let payload: ExtraInfoParams = decode(event.params)?;
        self.correlator
            .attach_headers(&payload.request_id, header_map(&payload.headers));
        Ok(())
    }

    fn on_response(&self, event: TransportEvent) -> Result<(), ObserverError> {
        let context = context_of(&event);
        let payload: ResponseReceivedParams = decode(event.params)?;
        let record = self.correlator.complete(&payload.request_id);

        // Correlation miss is not an error: emit a partial event from what
        // the response alone provides.
        let url = record
            .as_ref()
            .map(|r| r.url.clone())
            .or_else(|| payload.response.url.clone())
            .unwrap_or_default();
        let api = record
            .as_ref()
            .and_then(|r| r.resource_type.clone())
            .or_else(|| payload.resource_type.clone())
            .map(|t| t.to_ascii_lowercase())
            .unwrap_or_else(|| "response".to_string());
        let risk = if payload.response.status >= 400 {
            Risk::Low
        } else {
            Risk::Info
        };

        let mut out = Event::new(EventSource::Protocol, "network-response", api, risk)
            .with_detail(url)
            .with_direction(Direction::Response)
            .with_context(context)
            .with_meta_entry("requestId", payload.request_id)
            .with_meta_entry("status", payload.response.status.to_string());
        if let Some(mime) = payload.response.mime_type {
            out = out.with_meta_entry("mimeType", mime);
        }
        if let Some(record) = record {
            out = out.with_meta_entry("method", record.method);
        }
        self.pipeline.push_from_protocol(out);
        Ok(())
    }

    fn on_response_extra_info(&self, event: TransportEvent) -> Result<(), ObserverError> {
        let context = context_of(&event);
        let payload: ExtraInfoParams = decode(event.params)?;
        for (name, value) in &payload.headers {
            if name.eq_ignore_ascii_case("set-cookie") {
                let rendered = value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string());
                for line in rendered.lines().filter(|l| !l.trim().is_empty()) {
                    self.pipeline.push_from_protocol(
                        Event::new(EventSource::Protocol, "cookie", "setCookie", Risk::Medium)
                            .with_detail(clamp(line, VALUE_CAP))
                            .with_context(context.clone())
                            .with_meta_entry("requestId", payload.request_id.clone()),
                    );
                }
            }
        }
        Ok(())
    }

    fn on_loading_finished(&self, event: TransportEvent) -> Result<(), ObserverError> {
        let context = context_of(&event);
        let payload: LoadingFinishedParams = decode(event.params)?;
        // Normally the response notification already consumed the record;
        // a leftover means we never saw one, so emit the partial join here.
        if let Some(record) = self.correlator.complete(&payload.request_id) {
            self.pipeline.push_from_protocol(
                Event::new(EventSource::Protocol, "network-response", "loadingFinished", Risk::Info)
                    .with_detail(record.url)
                    .with_direction(Direction::Response)
                    .with_context(context)
                    .with_meta_entry("requestId", payload.request_id)
                    .with_meta_entry(
                        "encodedDataLength",
                        (payload.encoded_data_length as u64).to_string(),
                    ),
            );
        }
        Ok(())
    }

    fn on_loading_failed(&self, event: TransportEvent) -> Result<(), ObserverError> {
        let context = context_of(&event);
        let payload: LoadingFailedParams = decode(event.params)?;
        let record = self.correlator.complete(&payload.request_id);
        let mut out = Event::new(
            EventSource::Protocol,
            "network-failure",
            "loadingFailed",
            Risk::Medium,
        )
        .with_detail(record.map(|r| r.url).unwrap_or_default())
        .with_direction(Direction::Response)
        .with_context(context)
        .with_meta_entry("requestId", payload.request_id)
        .with_meta_entry("errorText", payload.error_text);
        if payload.canceled {
            out = out.with_meta_entry("canceled", "true");
        }
        self.pipeline.push_from_protocol(out);
        Ok(())
    }

    fn on_websocket_created(&self, event: TransportEvent) -> Result<(), ObserverError> {
        let context = context_of(&event);
        let payload: WebSocketCreatedParams = decode(event.params)?;
        self.ws_channels
            .insert(payload.request_id.clone(), payload.url.clone());
        self.pipeline.push_from_protocol(
            Event::new(EventSource::Protocol, "websocket", "webSocketCreated", Risk::Medium)
                .with_detail(payload.url)
                .with_context(context)
                .with_meta_entry("requestId", payload.request_id),
        );
        Ok(())
    }

    fn on_websocket_frame(&self, event: TransportEvent, sent: bool) -> Result<(), ObserverError> {
        let context = context_of(&event);
        let payload: WebSocketFrameParams = decode(event.params)?;
        let url = self
            .ws_channels
            .get(&payload.request_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let api = if sent {
            "webSocketFrameSent"
        } else {
            "webSocketFrameReceived"
        };
        let direction = if sent { Direction::Call } else { Direction::Response };
        let risk = if sent { Risk::Low } else { Risk::Info };
        self.pipeline.push_from_protocol(
            Event::new(EventSource::Protocol, "websocket", api, risk)
                .with_detail(url)
                .with_value(payload.response.payload_data)
                .with_direction(direction)
                .with_context(context)
                .with_meta_entry("requestId", payload.request_id),
        );
        Ok(())
    }

    fn on_websocket_closed(&self, event: TransportEvent) -> Result<(), ObserverError> {
        let context = context_of(&event);
        let payload: WebSocketClosedParams = decode(event.params)?;
        let url = self
            .ws_channels
            .remove(&payload.request_id)
            .map(|(_, url)| url)
            .unwrap_or_default();
        self.pipeline.push_from_protocol(
            Event::new(EventSource::Protocol, "websocket", "webSocketClosed", Risk::Info)
                .with_detail(url)
                .with_context(context)
                .with_meta_entry("requestId", payload.request_id),
        );
        Ok(())
    }

    fn on_security_state(&self, event: TransportEvent) -> Result<(), ObserverError> {
        let context = context_of(&event);
        let payload: SecurityStateChangedParams = decode(event.params)?;
        let state = payload.visible_security_state.security_state;
        let risk = if state == "insecure" { Risk::Low } else { Risk::Info };
        self.pipeline.push_from_protocol(
            Event::new(
                EventSource::Protocol,
                "security",
                "visibleSecurityStateChanged",
                risk,
            )
            .with_detail(state)
            .with_context(context),
        );
        Ok(())
    }

    fn on_certificate_error(&self, event: TransportEvent) -> Result<(), ObserverError> {
        let context = context_of(&event);
        let payload: CertificateErrorParams = decode(event.params)?;
        self.pipeline.push_from_protocol(
            Event::new(EventSource::Protocol, "security", "certificateError", Risk::High)
                .with_detail(payload.request_url)
                .with_context(context)
                .with_meta_entry("errorType", payload.error_type),
        );
        Ok(())
    }

    fn on_binding_called(&self, event: TransportEvent) -> Result<(), ObserverError> {
        let context = context_of(&event);
        let payload: BindingCalledParams = decode(event.params)?;
        if payload.name != self.cfg.probe_binding {
            return Ok(());
        }
        self.push_probe_payload(&payload.payload, context);
        Ok(())
    }

    fn on_console_api(&self, event: TransportEvent) -> Result<(), ObserverError> {
        let context = context_of(&event);
        let payload: ConsoleApiParams = decode(event.params)?;

        // Fallback probe channel for contexts where the binding is
        // unavailable: a tagged first console argument.
        if let Some(first) = payload.args.first().and_then(|a| a.value.as_ref()).and_then(Value::as_str)
        {
            if let Some(raw) = first.strip_prefix("__pagewatch:") {
                self.push_probe_payload(raw, context);
                return Ok(());
            }
        }

        let rendered: Vec<String> = payload
            .args
            .iter()
            .map(|arg| {
                arg.value
                    .as_ref()
                    .map(render_value)
                    .or_else(|| arg.description.clone())
                    .unwrap_or_default()
            })
            .collect();
        self.pipeline.push_from_protocol(
            Event::new(EventSource::Protocol, "console", payload.kind, Risk::Info)
                .with_detail(rendered.join(" "))
                .with_context(context),
        );
        Ok(())
    }

    fn on_page_notification(&self, event: TransportEvent) {
        let api = event
            .method
            .strip_prefix("Page.")
            .unwrap_or(&event.method)
            .to_string();
        let detail = event
            .params
            .get("frame")
            .and_then(|f| f.get("url"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        self.pipeline.push_from_protocol(
            Event::new(EventSource::Protocol, "page", api, Risk::Info)
                .with_detail(detail)
                .with_context(context_of(&event)),
        );
    }

    fn push_probe_payload(&self, raw: &str, context: String) {
        match serde_json::from_str::<ProbeRecord>(raw) {
            Ok(record) => {
                let mut event = record.into_event();
                if event.context_id == "main" {
                    event = event.with_context(context);
                }
                self.pipeline.push_from_probe(event);
            }
            Err(err) => {
                self.pipeline.push_from_probe(
                    Event::new(EventSource::Probe, "diagnostic", "probe-decode", Risk::Low)
                        .with_detail(format!("malformed probe record: {err}"))
                        .with_context(context),
                );
            }
        }
    }

    fn looks_like_exfiltration(method: &str, post_len: usize, cross_site: bool) -> bool {
        matches!(method, "POST" | "PUT") && post_len >= EXFIL_MIN_BODY_BYTES && cross_site
    }

    fn is_cross_site(&self, raw_url: &str) -> bool {
        let Ok(guard) = self.target_host.read() else {
            return false;
        };
        let Some(target_host) = guard.as_deref() else {
            return false;
        };
        let Some(host) = url::Url::parse(raw_url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
        else {
            return false;
        };
        registrable(&host) != registrable(target_host)
    }

    async fn send(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, ObserverError> {
        let start = Instant::now();
        metrics::record_command(method);
        match self.transport.send_command(target, method, params).await {
            Ok(value) => {
                metrics::record_command_success(method, start.elapsed());
                Ok(value)
            }
            Err(err) => {
                metrics::record_command_failure(method);
                Err(err)
            }
        }
    }

    /// Command failures are expected (races with closing contexts) and
    /// never propagate; they surface as low-severity diagnostic events.
    async fn send_logged(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Option<Value> {
        match self.send(target, method, params).await {
            Ok(value) => Some(value),
            Err(err) => {
                self.diagnostic(method, &err);
                None
            }
        }
    }

    fn diagnostic(&self, method: &str, err: &ObserverError) {
        debug!(target: "cdp-observer", method, ?err, "protocol command failed");
        self.pipeline.push_from_protocol(
            Event::new(EventSource::Protocol, "diagnostic", method, Risk::Low)
                .with_detail(err.to_string()),
        );
    }
}

fn context_of(event: &TransportEvent) -> String {
    event
        .session_id
        .clone()
        .unwrap_or_else(|| "main".to_string())
}

fn decode<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, ObserverError> {
    serde_json::from_value(params)
        .map_err(|err| ObserverError::new(ObserverErrorKind::Protocol).with_hint(err.to_string()))
}

fn header_map(headers: &serde_json::Map<String, Value>) -> std::collections::BTreeMap<String, String> {
    headers
        .iter()
        .map(|(k, v)| {
            let rendered = v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string());
            (k.clone(), rendered)
        })
        .collect()
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Last two dot-separated labels; the cross-site check only needs this
/// approximation, mirroring the analyzer's classification.
fn registrable(host: &str) -> String {
    let labels: Vec<&str> = host.rsplitn(3, '.').collect();
    if labels.len() < 2 {
        return host.to_string();
    }
    format!("{}.{}", labels[1], labels[0])
}

#[derive(Debug, serde::Deserialize)]
struct AttachedToTargetParams {
    #[serde(rename = "sessionId")]
    session_id: String,
    #[serde(rename = "targetInfo")]
    target_info: TargetInfoPayload,
    #[serde(rename = "waitingForDebugger", default)]
    waiting_for_debugger: bool,
}

#[derive(Debug, serde::Deserialize)]
struct DetachedFromTargetParams {
    #[serde(rename = "sessionId")]
    session_id: String,
}

#[derive(Debug, serde::Deserialize)]
struct TargetLifecycleParams {
    #[serde(rename = "targetInfo")]
    target_info: TargetInfoPayload,
}

#[derive(Debug, serde::Deserialize)]
struct TargetDestroyedParams {
    #[serde(rename = "targetId")]
    target_id: String,
}

#[derive(Debug, serde::Deserialize)]
struct TargetInfoPayload {
    #[serde(rename = "targetId")]
    target_id: String,
    #[serde(rename = "type")]
    target_type: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    attached: bool,
}

#[derive(Debug, serde::Deserialize)]
struct GetTargetsResult {
    #[serde(rename = "targetInfos")]
    target_infos: Vec<TargetInfoPayload>,
}

#[derive(Debug, serde::Deserialize)]
struct RequestWillBeSentParams {
    #[serde(rename = "requestId")]
    request_id: String,
    request: RequestPayload,
    #[serde(rename = "type")]
    resource_type: Option<String>,
    #[serde(default)]
    initiator: Option<InitiatorPayload>,
}

#[derive(Debug, serde::Deserialize)]
struct RequestPayload {
    url: String,
    method: String,
    #[serde(default)]
    headers: serde_json::Map<String, Value>,
    #[serde(rename = "postData", default)]
    post_data: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct InitiatorPayload {
    #[serde(rename = "type")]
    initiator_type: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct ExtraInfoParams {
    #[serde(rename = "requestId")]
    request_id: String,
    #[serde(default)]
    headers: serde_json::Map<String, Value>,
}

#[derive(Debug, serde::Deserialize)]
struct ResponseReceivedParams {
    #[serde(rename = "requestId")]
    request_id: String,
    #[serde(rename = "type")]
    resource_type: Option<String>,
    response: ResponsePayload,
}

#[derive(Debug, serde::Deserialize)]
struct ResponsePayload {
    #[serde(default)]
    url: Option<String>,
    status: i64,
    #[serde(rename = "mimeType", default)]
    mime_type: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct LoadingFinishedParams {
    #[serde(rename = "requestId")]
    request_id: String,
    #[serde(rename = "encodedDataLength", default)]
    encoded_data_length: f64,
}

#[derive(Debug, serde::Deserialize)]
struct LoadingFailedParams {
    #[serde(rename = "requestId")]
    request_id: String,
    #[serde(rename = "errorText", default)]
    error_text: String,
    #[serde(default)]
    canceled: bool,
}

#[derive(Debug, serde::Deserialize)]
struct WebSocketCreatedParams {
    #[serde(rename = "requestId")]
    request_id: String,
    url: String,
}

#[derive(Debug, serde::Deserialize)]
struct WebSocketFrameParams {
    #[serde(rename = "requestId")]
    request_id: String,
    response: WsFramePayload,
}

#[derive(Debug, serde::Deserialize)]
struct WsFramePayload {
    #[serde(rename = "payloadData", default)]
    payload_data: String,
}

#[derive(Debug, serde::Deserialize)]
struct WebSocketClosedParams {
    #[serde(rename = "requestId")]
    request_id: String,
}

#[derive(Debug, serde::Deserialize)]
struct SecurityStateChangedParams {
    #[serde(rename = "visibleSecurityState")]
    visible_security_state: VisibleSecurityStatePayload,
}

#[derive(Debug, serde::Deserialize)]
struct VisibleSecurityStatePayload {
    #[serde(rename = "securityState")]
    security_state: String,
}

#[derive(Debug, serde::Deserialize)]
struct CertificateErrorParams {
    #[serde(rename = "errorType", default)]
    error_type: String,
    #[serde(rename = "requestURL", default)]
    request_url: String,
}

#[derive(Debug, serde::Deserialize)]
struct BindingCalledParams {
    name: String,
    payload: String,
}

#[derive(Debug, serde::Deserialize)]
struct ConsoleApiParams {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    args: Vec<RemoteObjectPayload>,
}

#[derive(Debug, serde::Deserialize)]
struct RemoteObjectPayload {
    #[serde(default)]
    value: Option<Value>,
    #[serde(default)]
    description: Option<String>,
}

//! Shared vocabulary types for the pagewatch observation stack.
//!
//! Everything that crosses a crate boundary lives here: the event record
//! flowing through the pipeline, the target inventory maintained by the
//! observer, the in-flight request record, and the probe wire shape.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum stored length for an event `detail` field.
pub const DETAIL_CAP: usize = 512;
/// Maximum stored length for an event `value` field.
pub const VALUE_CAP: usize = 256;
/// Maximum stored length for a request body preview.
pub const POST_DATA_PREVIEW_CAP: usize = 512;

/// Identifier for one capture session (one browser observation run).
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct CaptureId(pub String);

impl CaptureId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for CaptureId {
    fn default() -> Self {
        Self::new()
    }
}

/// Ordinal severity attached to every observed event.
///
/// Ordering matters: dedup bypass and risk scoring both compare ordinals.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Risk {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Risk {
    pub fn as_str(&self) -> &'static str {
        match self {
            Risk::Info => "info",
            Risk::Low => "low",
            Risk::Medium => "medium",
            Risk::High => "high",
            Risk::Critical => "critical",
        }
    }

    /// Scoring weight used by the forensic analyzer.
    pub fn weight(&self) -> u32 {
        match self {
            Risk::Info => 0,
            Risk::Low => 1,
            Risk::Medium => 2,
            Risk::High => 5,
            Risk::Critical => 10,
        }
    }

    /// Severe events are exempt from dedup suppression.
    pub fn is_severe(&self) -> bool {
        matches!(self, Risk::High | Risk::Critical)
    }
}

impl Default for Risk {
    fn default() -> Self {
        Risk::Info
    }
}

impl fmt::Display for Risk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which of the three observation streams produced an event.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    Probe,
    Protocol,
    Host,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::Probe => "probe",
            EventSource::Protocol => "protocol",
            EventSource::Host => "host",
        }
    }
}

/// Call vs. response leg of an observed interaction.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Call,
    Response,
}

impl Default for Direction {
    fn default() -> Self {
        Direction::Call
    }
}

/// Kind of debuggable execution context.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Page,
    Iframe,
    Worker,
    SharedWorker,
    ServiceWorker,
    Other,
}

impl TargetKind {
    /// Maps a `Target.targetInfo.type` string to our enum.
    pub fn from_protocol(raw: &str) -> Self {
        match raw {
            "page" => TargetKind::Page,
            "iframe" => TargetKind::Iframe,
            "worker" => TargetKind::Worker,
            "shared_worker" => TargetKind::SharedWorker,
            "service_worker" => TargetKind::ServiceWorker,
            _ => TargetKind::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Page => "page",
            TargetKind::Iframe => "iframe",
            TargetKind::Worker => "worker",
            TargetKind::SharedWorker => "shared_worker",
            TargetKind::ServiceWorker => "service_worker",
            TargetKind::Other => "other",
        }
    }

    pub fn is_worker(&self) -> bool {
        matches!(
            self,
            TargetKind::Worker | TargetKind::SharedWorker | TargetKind::ServiceWorker
        )
    }

    /// Contexts that carry a renderer and accept `Page.enable`.
    pub fn has_page_domain(&self) -> bool {
        matches!(self, TargetKind::Page | TargetKind::Iframe)
    }
}

/// One attached execution context. Owned exclusively by the target
/// observer; everything else sees read-only snapshots.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub target_id: String,
    pub session_id: String,
    pub kind: TargetKind,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<String>,
    pub network_enabled: bool,
    pub attached: bool,
}

/// In-flight network request awaiting its terminal notification.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    pub request_id: String,
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub request_headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_data_preview: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initiator_type: Option<String>,
    pub created_at: u64,
}

/// The unit flowing through the event pipeline.
///
/// `id` and (when absent) `ts` are assigned by the pipeline at ingestion;
/// producers leave `id` zero and may leave `ts` zero.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: u64,
    pub ts: u64,
    pub source: EventSource,
    pub category: String,
    pub api: String,
    pub risk: Risk,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<BTreeMap<String, String>>,
    pub direction: Direction,
    pub context_id: String,
}

impl Event {
    pub fn new(
        source: EventSource,
        category: impl Into<String>,
        api: impl Into<String>,
        risk: Risk,
    ) -> Self {
        Self {
            id: 0,
            ts: 0,
            source,
            category: category.into(),
            api: api.into(),
            risk,
            detail: String::new(),
            value: None,
            meta: None,
            direction: Direction::Call,
            context_id: "main".to_string(),
        }
    }

    pub fn with_ts(mut self, ts: u64) -> Self {
        self.ts = ts;
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = clamp(&detail.into(), DETAIL_CAP);
        self
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(clamp(&value.into(), VALUE_CAP));
        self
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_context(mut self, context_id: impl Into<String>) -> Self {
        self.context_id = context_id.into();
        self
    }

    pub fn with_meta_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// URL carried by this event, if any: `detail` when it parses as a
    /// URL, else the `url` meta field.
    pub fn url_hint(&self) -> Option<&str> {
        if self.detail.starts_with("http://") || self.detail.starts_with("https://") {
            return Some(&self.detail);
        }
        self.meta
            .as_ref()
            .and_then(|m| m.get("url"))
            .map(|s| s.as_str())
    }
}

/// Wire shape emitted by the in-page instrumentation probe.
///
/// Unknown fields are preserved into the event `meta` map so new probe
/// hooks do not require a lockstep upgrade here.
#[derive(Clone, Debug, Deserialize)]
pub struct ProbeRecord {
    pub cat: String,
    pub api: String,
    #[serde(default)]
    pub risk: Risk,
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub val: Option<String>,
    #[serde(default)]
    pub dir: Option<String>,
    #[serde(default)]
    pub fid: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ProbeRecord {
    /// Normalizes the probe record into a pipeline event.
    pub fn into_event(self) -> Event {
        let mut event = Event::new(EventSource::Probe, self.cat, self.api, self.risk);
        if let Some(detail) = self.detail {
            event = event.with_detail(detail);
        }
        if let Some(val) = self.val {
            event = event.with_value(val);
        }
        if matches!(self.dir.as_deref(), Some("response")) {
            event = event.with_direction(Direction::Response);
        }
        if let Some(fid) = self.fid {
            event = event.with_context(fid);
        }
        for (key, value) in self.extra {
            let rendered = match value {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            event = event.with_meta_entry(key, rendered);
        }
        event
    }
}

/// Truncates a string to at most `cap` characters on a char boundary.
pub fn clamp(input: &str, cap: usize) -> String {
    if input.chars().count() <= cap {
        return input.to_string();
    }
    input.chars().take(cap).collect()
}

/// Wall-clock epoch milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

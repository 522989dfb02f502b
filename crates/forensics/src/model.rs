//! Report structures handed to the (out-of-process) renderer.
//!
//! Field names serialize in camelCase; this is the stable contract with
//! the report templates and must not drift.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use pagewatch_core_types::{Event, Risk};
use pagewatch_event_pipeline::PipelineStats;
use pagewatch_signature_db::SignatureMatch;

/// Per-category aggregate over the whole session.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryAggregate {
    pub name: String,
    pub count: u64,
    pub first_seen: u64,
    pub last_seen: u64,
    /// Maximum-ordinal risk observed in the category.
    pub risk: Risk,
    pub risk_histogram: BTreeMap<String, u64>,
    pub source_histogram: BTreeMap<String, u64>,
}

/// A distinct severe signal: one (category, api) pair at high or critical.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Threat {
    pub category: String,
    pub api: String,
    pub risk: Risk,
    pub count: u64,
    pub first_seen: u64,
    pub sample_detail: String,
}

/// One detected library with the evidence that triggered it.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryDetection {
    pub library: String,
    pub category: String,
    pub risk: Risk,
    /// "high" with two or more independent hits, else "medium".
    pub confidence: String,
    pub hits: Vec<SignatureMatch>,
}

/// Per-host attribution of third-party network destinations.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThirdPartyDomain {
    pub domain: String,
    pub request_count: u64,
    pub categories: Vec<String>,
    pub max_risk: Risk,
}

/// High-frequency window found by burst detection.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Burst {
    pub start_ts: u64,
    pub count: u64,
    pub dominant_category: String,
}

/// Shannon entropy (base 2, 3 decimals) over two distributions.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntropySummary {
    pub category: f64,
    pub api: f64,
}

/// One second of session activity.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineBucket {
    pub ts: u64,
    pub count: u64,
}

/// Cookie activity summary feeding the WHY synthesis.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CookieSummary {
    pub set_count: u64,
    pub domains: Vec<String>,
}

/// One observed WebSocket channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebsocketChannel {
    pub url: String,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub closed: bool,
}

/// The who/what/when/where/why/how synthesis.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct H5w {
    pub who: H5wWho,
    pub what: BTreeMap<String, u64>,
    pub when: H5wWhen,
    #[serde(rename = "where")]
    pub where_: H5wWhere,
    pub why: H5wWhy,
    pub how: H5wHow,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct H5wWho {
    pub origins: Vec<String>,
    pub total_events: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct H5wWhen {
    pub start: String,
    pub end: String,
    pub duration_ms: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct H5wWhere {
    pub origins: Vec<String>,
    pub frame_urls: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct H5wWhy {
    pub libraries: Vec<String>,
    pub cookie_sets: u64,
    pub exfiltration_attempts: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct H5wHow {
    pub channels: Vec<String>,
}

/// Full analyzer output, serialized as the session's report artifact.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForensicReport {
    pub categories: Vec<CategoryAggregate>,
    pub threats: Vec<Threat>,
    pub library_detections: Vec<LibraryDetection>,
    pub network_conversation: Vec<Event>,
    pub exfiltration: Vec<Event>,
    pub cookies: CookieSummary,
    pub websockets: Vec<WebsocketChannel>,
    pub third_parties: Vec<ThirdPartyDomain>,
    pub bursts: Vec<Burst>,
    pub entropy: EntropySummary,
    pub h5w: H5w,
    pub risk_score: u32,
    pub timeline: Vec<TimelineBucket>,
    pub pipeline_stats: PipelineStats,
}

//! Single point of ingestion for the three observation streams.
//!
//! Every event from the protocol observer, the in-page probe and the host
//! layer funnels through one pipeline instance per capture session. The
//! pipeline assigns ids and timestamps, keeps running counters, suppresses
//! near-duplicate reports of the same browser action, and bounds memory.
//!
//! Dedup granularity: the probe and the protocol observer frequently report
//! the same action through different paths within a few milliseconds, so
//! the key buckets timestamps at 100 ms. High and critical events bypass
//! the dedup set entirely so nothing of analytical value is collapsed away.

use std::collections::HashSet;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use pagewatch_core_types::{clamp, epoch_millis, Event, EventSource};

/// Timestamp bucket width for the dedup key.
const DEDUP_BUCKET_MS: u64 = 100;
/// Characters of `detail` participating in the dedup key.
const DEDUP_DETAIL_LEN: usize = 80;

/// Tuning knobs for one pipeline instance.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Hard cap on stored events. Once reached, non-severe events are
    /// counted but not stored; stored events are never evicted so report
    /// ordering stays reproducible.
    pub capacity: usize,
    /// Slice of `capacity` reserved for high/critical events so that the
    /// low-severity flood can never starve them out of storage.
    pub severe_reserve: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            capacity: 20_000,
            severe_reserve: 2_000,
        }
    }
}

/// Aggregate counters maintained across the whole session, independent of
/// whether individual events were stored.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStats {
    pub total_pushed: u64,
    pub total_stored: u64,
    pub dedup_suppressed: u64,
    pub capacity_dropped: u64,
    pub probe_events: u64,
    pub protocol_events: u64,
    pub host_events: u64,
    pub network_requests: u64,
    pub network_responses: u64,
    pub console_messages: u64,
    pub dom_mutations: u64,
    pub worker_events: u64,
}

impl PipelineStats {
    fn count_source(&mut self, source: EventSource) {
        match source {
            EventSource::Probe => self.probe_events += 1,
            EventSource::Protocol => self.protocol_events += 1,
            EventSource::Host => self.host_events += 1,
        }
    }

    fn count_category(&mut self, event: &Event) {
        match event.category.as_str() {
            "network-request" => self.network_requests += 1,
            "network-response" | "network-failure" => self.network_responses += 1,
            "console" | "log" => self.console_messages += 1,
            "dom-mutation" => self.dom_mutations += 1,
            other if other.contains("worker") => self.worker_events += 1,
            _ => {}
        }
    }
}

#[derive(Default)]
struct PipelineState {
    events: Vec<Event>,
    dedup: HashSet<String>,
    next_id: u64,
    stats: PipelineStats,
}

/// Shared ingestion point; safe to call from any number of concurrent
/// producer streams. Each push is atomic with respect to counter updates
/// and dedup-set mutation.
pub struct EventPipeline {
    config: PipelineConfig,
    state: Mutex<PipelineState>,
}

impl EventPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            state: Mutex::new(PipelineState::default()),
        }
    }

    pub fn push_from_probe(&self, mut event: Event) {
        event.source = EventSource::Probe;
        self.ingest(event);
    }

    pub fn push_from_protocol(&self, mut event: Event) {
        event.source = EventSource::Protocol;
        self.ingest(event);
    }

    pub fn push_from_host(&self, mut event: Event) {
        event.source = EventSource::Host;
        self.ingest(event);
    }

    fn ingest(&self, mut event: Event) {
        if event.ts == 0 {
            event.ts = epoch_millis();
        }

        let mut state = self.state.lock();
        state.next_id += 1;
        event.id = state.next_id;

        state.stats.total_pushed += 1;
        state.stats.count_source(event.source);
        state.stats.count_category(&event);

        if event.risk.is_severe() {
            // Severe events skip the dedup set; volume itself is signal.
            if state.events.len() < self.config.capacity {
                state.events.push(event);
                state.stats.total_stored += 1;
            } else {
                state.stats.capacity_dropped += 1;
            }
            return;
        }

        let key = dedup_key(&event);
        if state.dedup.contains(&key) {
            state.stats.dedup_suppressed += 1;
            return;
        }

        let soft_cap = self.config.capacity.saturating_sub(self.config.severe_reserve);
        if state.events.len() >= soft_cap {
            state.stats.capacity_dropped += 1;
            debug!(target: "event-pipeline", category = %event.category, "buffer full, event counted but not stored");
            return;
        }

        state.dedup.insert(key);
        state.events.push(event);
        state.stats.total_stored += 1;
    }

    /// All stored events in ascending `(ts, id)` order. The id tiebreak
    /// keeps ordering deterministic when timestamps collide.
    pub fn drain(&self) -> Vec<Event> {
        let state = self.state.lock();
        let mut events = state.events.clone();
        events.sort_by(|a, b| a.ts.cmp(&b.ts).then_with(|| a.id.cmp(&b.id)));
        events
    }

    pub fn stats(&self) -> PipelineStats {
        self.state.lock().stats.clone()
    }

    /// Clears all state. Only valid between independent capture sessions,
    /// never mid-session.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        *state = PipelineState::default();
    }
}

impl Default for EventPipeline {
    fn default() -> Self {
        Self::new(PipelineConfig::default())
    }
}

fn dedup_key(event: &Event) -> String {
    format!(
        "{}|{}|{}|{}|{}",
        event.ts / DEDUP_BUCKET_MS,
        event.source.as_str(),
        event.category,
        event.api,
        clamp(&event.detail, DEDUP_DETAIL_LEN),
    )
}

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use tracing::debug;

use pagewatch_core_types::{Event, Risk, Target};
use pagewatch_event_pipeline::PipelineStats;
use pagewatch_signature_db::match_url;

use crate::domain::{host_of, is_third_party};
use crate::model::{
    Burst, CategoryAggregate, CookieSummary, EntropySummary, ForensicReport, H5w, H5wHow, H5wWhen,
    H5wWhere, H5wWho, H5wWhy, LibraryDetection, ThirdPartyDomain, Threat, TimelineBucket,
    WebsocketChannel,
};

/// Sliding burst window width.
const BURST_WINDOW_MS: u64 = 1_000;
/// Event count within one window that qualifies as a burst.
const BURST_THRESHOLD: usize = 20;

/// Ancillary inputs alongside the event snapshot.
#[derive(Clone, Debug, Default)]
pub struct AnalysisContext {
    /// URL the capture was pointed at; anchors third-party classification.
    pub target_url: String,
    /// Final target inventory from the observer.
    pub targets: Vec<Target>,
    pub started_at: u64,
    pub ended_at: u64,
    pub pipeline_stats: PipelineStats,
}

/// One-shot batch transformation of the frozen event snapshot into the
/// report structure. Deterministic for a given input; never fails on a
/// single malformed record.
pub fn analyze(events: &[Event], ctx: &AnalysisContext) -> ForensicReport {
    // Cross-source ordering is only guaranteed by (ts, id).
    let mut ordered: Vec<&Event> = events.iter().collect();
    ordered.sort_by(|a, b| a.ts.cmp(&b.ts).then_with(|| a.id.cmp(&b.id)));

    let target_host = host_of(&ctx.target_url).unwrap_or_default();

    let categories = categorize(&ordered);
    let threats = collect_threats(&ordered);
    let library_detections = detect_libraries(&ordered);
    let third_parties = extract_third_parties(&ordered, &target_host);
    let bursts = detect_bursts(&ordered);
    let timeline = build_timeline(&ordered);
    let entropy = EntropySummary {
        category: shannon(ordered.iter().map(|e| category_of(e))),
        api: shannon(ordered.iter().map(|e| api_of(e))),
    };
    let cookies = summarize_cookies(&ordered);
    let websockets = summarize_websockets(&ordered);

    let network_conversation: Vec<Event> = ordered
        .iter()
        .filter(|e| e.category.starts_with("network"))
        .map(|e| (*e).clone())
        .collect();
    let exfiltration: Vec<Event> = ordered
        .iter()
        .filter(|e| category_of(e) == "exfiltration")
        .map(|e| (*e).clone())
        .collect();

    let risk_score = score(&ordered);
    let h5w = synthesize_h5w(
        &ordered,
        ctx,
        &library_detections,
        &cookies,
        exfiltration.len() as u64,
        &websockets,
    );

    debug!(
        target: "forensics",
        events = ordered.len(),
        categories = categories.len(),
        bursts = bursts.len(),
        risk_score,
        "analysis pass complete"
    );

    ForensicReport {
        categories,
        threats,
        library_detections,
        network_conversation,
        exfiltration,
        cookies,
        websockets,
        third_parties,
        bursts,
        entropy,
        h5w,
        risk_score,
        timeline,
        pipeline_stats: ctx.pipeline_stats.clone(),
    }
}

/// Missing fields never abort the batch; they default to "unknown".
fn category_of<'a>(event: &'a Event) -> &'a str {
    if event.category.is_empty() {
        "unknown"
    } else {
        &event.category
    }
}

fn api_of<'a>(event: &'a Event) -> &'a str {
    if event.api.is_empty() {
        "unknown"
    } else {
        &event.api
    }
}

fn categorize(ordered: &[&Event]) -> Vec<CategoryAggregate> {
    let mut groups: BTreeMap<String, CategoryAggregate> = BTreeMap::new();
    for event in ordered {
        let name = category_of(event).to_string();
        let entry = groups.entry(name.clone()).or_insert_with(|| CategoryAggregate {
            name,
            count: 0,
            first_seen: event.ts,
            last_seen: event.ts,
            risk: event.risk,
            risk_histogram: BTreeMap::new(),
            source_histogram: BTreeMap::new(),
        });
        entry.count += 1;
        entry.first_seen = entry.first_seen.min(event.ts);
        entry.last_seen = entry.last_seen.max(event.ts);
        entry.risk = entry.risk.max(event.risk);
        *entry
            .risk_histogram
            .entry(event.risk.as_str().to_string())
            .or_insert(0) += 1;
        *entry
            .source_histogram
            .entry(event.source.as_str().to_string())
            .or_insert(0) += 1;
    }
    let mut aggregates: Vec<CategoryAggregate> = groups.into_values().collect();
    aggregates.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
    aggregates
}

fn collect_threats(ordered: &[&Event]) -> Vec<Threat> {
    let mut groups: BTreeMap<(String, String), Threat> = BTreeMap::new();
    for event in ordered.iter().filter(|e| e.risk.is_severe()) {
        let key = (category_of(event).to_string(), api_of(event).to_string());
        let entry = groups.entry(key.clone()).or_insert_with(|| Threat {
            category: key.0,
            api: key.1,
            risk: event.risk,
            count: 0,
            first_seen: event.ts,
            sample_detail: event.detail.clone(),
        });
        entry.count += 1;
        entry.risk = entry.risk.max(event.risk);
        entry.first_seen = entry.first_seen.min(event.ts);
    }
    let mut threats: Vec<Threat> = groups.into_values().collect();
    threats.sort_by(|a, b| b.risk.cmp(&a.risk).then_with(|| b.count.cmp(&a.count)));
    threats
}

fn detect_libraries(ordered: &[&Event]) -> Vec<LibraryDetection> {
    let mut by_library: BTreeMap<String, LibraryDetection> = BTreeMap::new();
    let mut seen_evidence: BTreeSet<(String, String)> = BTreeSet::new();

    for event in ordered {
        let Some(url) = event.url_hint() else { continue };
        let Some(hit) = match_url(url) else { continue };
        // One (pattern, url) pair counts once, however often it recurs.
        if !seen_evidence.insert((hit.pattern.clone(), hit.url.clone())) {
            continue;
        }
        let entry = by_library
            .entry(hit.library.clone())
            .or_insert_with(|| LibraryDetection {
                library: hit.library.clone(),
                category: hit.category.clone(),
                risk: hit.risk,
                confidence: "medium".to_string(),
                hits: Vec::new(),
            });
        entry.risk = entry.risk.max(hit.risk);
        entry.hits.push(hit);
        if entry.hits.len() >= 2 {
            entry.confidence = "high".to_string();
        }
    }
    by_library.into_values().collect()
}

fn extract_third_parties(ordered: &[&Event], target_host: &str) -> Vec<ThirdPartyDomain> {
    let mut hosts: BTreeMap<String, (u64, BTreeSet<String>, Risk)> = BTreeMap::new();
    for event in ordered {
        let Some(url) = event.url_hint() else { continue };
        let Some(host) = host_of(url) else { continue };
        if target_host.is_empty() || is_third_party(&host, target_host) {
            let entry = hosts
                .entry(host)
                .or_insert_with(|| (0, BTreeSet::new(), Risk::Info));
            entry.0 += 1;
            entry.1.insert(category_of(event).to_string());
            entry.2 = entry.2.max(event.risk);
        }
    }
    let mut domains: Vec<ThirdPartyDomain> = hosts
        .into_iter()
        .map(|(domain, (request_count, categories, max_risk))| ThirdPartyDomain {
            domain,
            request_count,
            categories: categories.into_iter().collect(),
            max_risk,
        })
        .collect();
    domains.sort_by(|a, b| b.request_count.cmp(&a.request_count).then_with(|| a.domain.cmp(&b.domain)));
    domains
}

fn detect_bursts(ordered: &[&Event]) -> Vec<Burst> {
    let mut bursts = Vec::new();
    let mut i = 0;
    while i < ordered.len() {
        let window_start = ordered[i].ts;
        let window_end = window_start + BURST_WINDOW_MS;
        let mut j = i;
        while j < ordered.len() && ordered[j].ts < window_end {
            j += 1;
        }
        let count = j - i;
        if count >= BURST_THRESHOLD {
            let mut modes: HashMap<&str, usize> = HashMap::new();
            for event in &ordered[i..j] {
                *modes.entry(category_of(event)).or_insert(0) += 1;
            }
            let dominant = modes
                .into_iter()
                .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)))
                .map(|(name, _)| name.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            bursts.push(Burst {
                start_ts: window_start,
                count: count as u64,
                dominant_category: dominant,
            });
            // Advance past the window so one volume spike reports once.
            i = j;
        } else {
            i += 1;
        }
    }
    bursts
}

fn build_timeline(ordered: &[&Event]) -> Vec<TimelineBucket> {
    let mut buckets: BTreeMap<u64, u64> = BTreeMap::new();
    for event in ordered {
        *buckets.entry((event.ts / 1_000) * 1_000).or_insert(0) += 1;
    }
    buckets
        .into_iter()
        .map(|(ts, count)| TimelineBucket { ts, count })
        .collect()
}

/// Shannon entropy (base 2) of the label distribution, rounded to three
/// decimals. Zero for an empty stream.
fn shannon<'a>(labels: impl Iterator<Item = &'a str>) -> f64 {
    let mut counts: HashMap<&str, u64> = HashMap::new();
    let mut total = 0u64;
    for label in labels {
        *counts.entry(label).or_insert(0) += 1;
        total += 1;
    }
    if total == 0 {
        return 0.0;
    }
    let total = total as f64;
    let entropy: f64 = counts
        .values()
        .map(|&count| {
            let p = count as f64 / total;
            -p * p.log2()
        })
        .sum();
    (entropy * 1_000.0).round() / 1_000.0
}

fn summarize_cookies(ordered: &[&Event]) -> CookieSummary {
    let mut set_count = 0;
    let mut domains: BTreeSet<String> = BTreeSet::new();
    for event in ordered.iter().filter(|e| category_of(e) == "cookie") {
        set_count += 1;
        let domain = event
            .meta
            .as_ref()
            .and_then(|m| m.get("domain").cloned())
            .or_else(|| event.url_hint().and_then(host_of));
        if let Some(domain) = domain {
            domains.insert(domain);
        }
    }
    CookieSummary {
        set_count,
        domains: domains.into_iter().collect(),
    }
}

fn summarize_websockets(ordered: &[&Event]) -> Vec<WebsocketChannel> {
    let mut channels: BTreeMap<String, WebsocketChannel> = BTreeMap::new();
    for event in ordered.iter().filter(|e| category_of(e) == "websocket") {
        let url = event
            .url_hint()
            .map(str::to_string)
            .or_else(|| event.meta.as_ref().and_then(|m| m.get("url").cloned()))
            .unwrap_or_else(|| event.detail.clone());
        let entry = channels.entry(url.clone()).or_insert_with(|| WebsocketChannel {
            url,
            frames_sent: 0,
            frames_received: 0,
            closed: false,
        });
        match event.api.as_str() {
            "webSocketFrameSent" => entry.frames_sent += 1,
            "webSocketFrameReceived" => entry.frames_received += 1,
            "webSocketClosed" => entry.closed = true,
            _ => {}
        }
    }
    channels.into_values().collect()
}

/// Normalized risk score: the fraction of maximum-possible severity
/// actually observed, scaled to 0-100. Deterministic across sessions of
/// different lengths, unlike an additive count-based score.
fn score(ordered: &[&Event]) -> u32 {
    if ordered.is_empty() {
        return 0;
    }
    let total_weight: u64 = ordered.iter().map(|e| e.risk.weight() as u64).sum();
    let max_weight = 10 * ordered.len() as u64;
    let ratio = 100.0 * total_weight as f64 / max_weight as f64;
    (ratio.round() as u32).min(100)
}

fn iso(ts: u64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ts as i64)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| "unknown".to_string())
}

fn synthesize_h5w(
    ordered: &[&Event],
    ctx: &AnalysisContext,
    libraries: &[LibraryDetection],
    cookies: &CookieSummary,
    exfiltration_attempts: u64,
    websockets: &[WebsocketChannel],
) -> H5w {
    let mut origins: BTreeSet<String> = BTreeSet::new();
    for event in ordered {
        if let Some(url) = event.url_hint() {
            if let Ok(parsed) = url::Url::parse(url) {
                if let Some(host) = parsed.host_str() {
                    origins.insert(format!("{}://{}", parsed.scheme(), host));
                }
            }
        }
    }

    let frame_urls: BTreeSet<String> = ctx
        .targets
        .iter()
        .filter(|t| !t.url.is_empty())
        .map(|t| t.url.clone())
        .collect();

    let mut channels: BTreeSet<String> = websockets.iter().map(|w| w.url.clone()).collect();
    for event in ordered.iter().filter(|e| category_of(e) == "exfiltration") {
        let channel = event
            .url_hint()
            .and_then(host_of)
            .unwrap_or_else(|| api_of(event).to_string());
        channels.insert(channel);
    }

    let what: BTreeMap<String, u64> =
        ordered.iter().fold(BTreeMap::new(), |mut acc, event| {
            *acc.entry(category_of(event).to_string()).or_insert(0) += 1;
            acc
        });

    H5w {
        who: H5wWho {
            origins: origins.iter().cloned().collect(),
            total_events: ordered.len() as u64,
        },
        what,
        when: H5wWhen {
            start: iso(ctx.started_at),
            end: iso(ctx.ended_at),
            duration_ms: ctx.ended_at.saturating_sub(ctx.started_at),
        },
        where_: H5wWhere {
            origins: origins.into_iter().collect(),
            frame_urls: frame_urls.into_iter().collect(),
        },
        why: H5wWhy {
            libraries: libraries.iter().map(|l| l.library.clone()).collect(),
            cookie_sets: cookies.set_count,
            exfiltration_attempts,
        },
        how: H5wHow {
            channels: channels.into_iter().collect(),
        },
    }
}

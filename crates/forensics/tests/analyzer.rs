//! Behavioral tests for the batch analyzer against synthetic event sets.

use pagewatch_core_types::{Direction, Event, EventSource, Risk};
use pagewatch_event_pipeline::PipelineStats;
use pagewatch_forensics::{analyze, AnalysisContext};

fn ev(id: u64, ts: u64, category: &str, api: &str, risk: Risk, detail: &str) -> Event {
    let mut event = Event::new(EventSource::Probe, category, api, risk)
        .with_ts(ts)
        .with_detail(detail);
    event.id = id;
    event
}

fn ctx(target_url: &str) -> AnalysisContext {
    AnalysisContext {
        target_url: target_url.to_string(),
        targets: Vec::new(),
        started_at: 1_000,
        ended_at: 31_000,
        pipeline_stats: PipelineStats::default(),
    }
}

#[test]
fn burst_detection_on_dense_stream() {
    // 25 events inside 500 ms, all category "x" -> exactly one burst.
    let events: Vec<Event> = (0..25)
        .map(|i| ev(i + 1, 10_000 + i * 20, "x", "call", Risk::Low, "tick"))
        .collect();
    let report = analyze(&events, &ctx("https://shop.example.com"));

    assert_eq!(report.bursts.len(), 1);
    let burst = &report.bursts[0];
    assert!(burst.count >= 20);
    assert_eq!(burst.dominant_category, "x");
    assert_eq!(burst.start_ts, 10_000);
}

#[test]
fn sparse_stream_has_no_bursts() {
    let events: Vec<Event> = (0..30)
        .map(|i| ev(i + 1, 10_000 + i * 2_000, "x", "call", Risk::Low, "tick"))
        .collect();
    let report = analyze(&events, &ctx("https://shop.example.com"));
    assert!(report.bursts.is_empty());
}

#[test]
fn entropy_of_single_category_is_zero() {
    let events: Vec<Event> = (0..40)
        .map(|i| ev(i + 1, 1_000 + i * 500, "canvas", "toDataURL", Risk::Low, "read"))
        .collect();
    let report = analyze(&events, &ctx("https://shop.example.com"));
    assert_eq!(report.entropy.category, 0.0);
    assert_eq!(report.entropy.api, 0.0);
}

#[test]
fn entropy_of_even_split_approaches_log2_k() {
    // 64 events evenly split over 4 categories -> exactly log2(4) = 2.
    let categories = ["a", "b", "c", "d"];
    let events: Vec<Event> = (0..64u64)
        .map(|i| {
            ev(
                i + 1,
                1_000 + i * 100,
                categories[(i % 4) as usize],
                "call",
                Risk::Low,
                "x",
            )
        })
        .collect();
    let report = analyze(&events, &ctx("https://shop.example.com"));
    assert!((report.entropy.category - 2.0).abs() < 1e-9);
}

#[test]
fn empty_input_yields_zero_entropy_and_score() {
    let report = analyze(&[], &ctx("https://shop.example.com"));
    assert_eq!(report.entropy.category, 0.0);
    assert_eq!(report.risk_score, 0);
    assert!(report.categories.is_empty());
    assert!(report.timeline.is_empty());
}

#[test]
fn third_party_classification_uses_registrable_domain() {
    let events = vec![
        ev(
            1,
            1_000,
            "network-request",
            "fetch",
            Risk::Low,
            "https://cdn.ads.io/x.js",
        ),
        ev(
            2,
            1_100,
            "network-request",
            "fetch",
            Risk::Low,
            "https://static.shop.example.com/a.js",
        ),
    ];
    let report = analyze(&events, &ctx("https://shop.example.com"));

    let domains: Vec<&str> = report
        .third_parties
        .iter()
        .map(|d| d.domain.as_str())
        .collect();
    assert!(domains.contains(&"cdn.ads.io"));
    assert!(
        !domains.contains(&"static.shop.example.com"),
        "same registrable domain must not be classified third-party"
    );
}

#[test]
fn risk_score_is_ratio_normalized() {
    // Two critical events out of two -> full severity ratio -> 100.
    let events = vec![
        ev(1, 1_000, "canvas", "toDataURL", Risk::Critical, "read"),
        ev(2, 1_100, "webgl", "readPixels", Risk::Critical, "read"),
    ];
    let report = analyze(&events, &ctx("https://shop.example.com"));
    assert_eq!(report.risk_score, 100);

    // One high (weight 5) out of one event -> 50.
    let events = vec![ev(1, 1_000, "canvas", "toDataURL", Risk::High, "read")];
    let report = analyze(&events, &ctx("https://shop.example.com"));
    assert_eq!(report.risk_score, 50);

    // All-info sessions score zero regardless of volume.
    let events: Vec<Event> = (0..50)
        .map(|i| ev(i + 1, 1_000 + i * 300, "page", "lifecycle", Risk::Info, "load"))
        .collect();
    let report = analyze(&events, &ctx("https://shop.example.com"));
    assert_eq!(report.risk_score, 0);
}

#[test]
fn categorize_tracks_max_risk_and_histograms() {
    let events = vec![
        ev(1, 1_000, "canvas", "toDataURL", Risk::Low, "read"),
        ev(2, 2_000, "canvas", "getImageData", Risk::High, "read"),
        ev(3, 3_000, "canvas", "toDataURL", Risk::Low, "read again"),
    ];
    let report = analyze(&events, &ctx("https://shop.example.com"));

    let canvas = report
        .categories
        .iter()
        .find(|c| c.name == "canvas")
        .expect("canvas aggregate");
    assert_eq!(canvas.count, 3);
    assert_eq!(canvas.risk, Risk::High);
    assert_eq!(canvas.first_seen, 1_000);
    assert_eq!(canvas.last_seen, 3_000);
    assert_eq!(canvas.risk_histogram.get("low"), Some(&2));
    assert_eq!(canvas.risk_histogram.get("high"), Some(&1));
    assert_eq!(canvas.source_histogram.get("probe"), Some(&3));
}

#[test]
fn library_confidence_scales_with_independent_hits() {
    let events = vec![
        ev(
            1,
            1_000,
            "network-request",
            "script",
            Risk::Low,
            "https://fpcdn.io/v3/loader.js",
        ),
        ev(
            2,
            2_000,
            "network-request",
            "xhr",
            Risk::Low,
            "https://api.fpjs.io/visitors",
        ),
        ev(
            3,
            3_000,
            "network-request",
            "script",
            Risk::Low,
            "https://static.hotjar.com/c/hotjar.js",
        ),
    ];
    let report = analyze(&events, &ctx("https://shop.example.com"));

    let fpjs = report
        .library_detections
        .iter()
        .find(|d| d.library == "FingerprintJS")
        .expect("fingerprintjs detected");
    assert_eq!(fpjs.confidence, "high");
    assert_eq!(fpjs.hits.len(), 2);

    let hotjar = report
        .library_detections
        .iter()
        .find(|d| d.library == "Hotjar")
        .expect("hotjar detected");
    assert_eq!(hotjar.confidence, "medium");
}

#[test]
fn websocket_channels_aggregate_frames() {
    let mut created = ev(
        1,
        1_000,
        "websocket",
        "webSocketCreated",
        Risk::Medium,
        "wss://track.ads.io/ws",
    );
    created.direction = Direction::Call;
    let events = vec![
        created,
        ev(
            2,
            1_100,
            "websocket",
            "webSocketFrameSent",
            Risk::Low,
            "wss://track.ads.io/ws",
        ),
        ev(
            3,
            1_200,
            "websocket",
            "webSocketFrameSent",
            Risk::Low,
            "wss://track.ads.io/ws",
        ),
        ev(
            4,
            1_300,
            "websocket",
            "webSocketFrameReceived",
            Risk::Low,
            "wss://track.ads.io/ws",
        ),
        ev(
            5,
            1_400,
            "websocket",
            "webSocketClosed",
            Risk::Info,
            "wss://track.ads.io/ws",
        ),
    ];
    let report = analyze(&events, &ctx("https://shop.example.com"));

    assert_eq!(report.websockets.len(), 1);
    let channel = &report.websockets[0];
    assert_eq!(channel.frames_sent, 2);
    assert_eq!(channel.frames_received, 1);
    assert!(channel.closed);
    assert!(report.h5w.how.channels.contains(&channel.url));
}

#[test]
fn h5w_synthesis_covers_all_six_questions() {
    let mut cookie = ev(
        3,
        3_000,
        "cookie",
        "setCookie",
        Risk::Medium,
        "session id cookie",
    );
    cookie = cookie.with_meta_entry("domain", "shop.example.com");
    let events = vec![
        ev(
            1,
            1_000,
            "network-request",
            "script",
            Risk::Low,
            "https://fpcdn.io/v3/loader.js",
        ),
        ev(
            2,
            2_000,
            "exfiltration",
            "sendBeacon",
            Risk::High,
            "https://collect.tracker.net/beacon",
        ),
        cookie,
    ];
    let report = analyze(&events, &ctx("https://shop.example.com"));

    assert_eq!(report.h5w.who.total_events, 3);
    assert!(report
        .h5w
        .who
        .origins
        .iter()
        .any(|o| o.contains("fpcdn.io")));
    assert_eq!(report.h5w.what.get("exfiltration"), Some(&1));
    assert_eq!(report.h5w.when.duration_ms, 30_000);
    assert!(report.h5w.why.libraries.contains(&"FingerprintJS".to_string()));
    assert_eq!(report.h5w.why.cookie_sets, 1);
    assert_eq!(report.h5w.why.exfiltration_attempts, 1);
    assert!(report
        .h5w
        .how
        .channels
        .contains(&"collect.tracker.net".to_string()));
    assert_eq!(report.cookies.domains, vec!["shop.example.com".to_string()]);
}

#[test]
fn malformed_records_are_defaulted_not_fatal() {
    let mut broken = ev(1, 0, "", "", Risk::Low, "");
    broken.ts = 0;
    let events = vec![
        broken,
        ev(2, 2_000, "canvas", "toDataURL", Risk::High, "read"),
    ];
    let report = analyze(&events, &ctx("not even a url"));

    // Both events are counted; the empty fields fold into "unknown".
    let total: u64 = report.categories.iter().map(|c| c.count).sum();
    assert_eq!(total, 2);
    assert!(report.categories.iter().any(|c| c.name == "unknown"));
    assert_eq!(report.threats.len(), 1);
}

#[test]
fn threats_surface_only_severe_events() {
    let events = vec![
        ev(1, 1_000, "canvas", "toDataURL", Risk::High, "read"),
        ev(2, 1_100, "canvas", "toDataURL", Risk::High, "read"),
        ev(3, 1_200, "page", "lifecycle", Risk::Info, "load"),
    ];
    let report = analyze(&events, &ctx("https://shop.example.com"));
    assert_eq!(report.threats.len(), 1);
    assert_eq!(report.threats[0].count, 2);
    assert_eq!(report.threats[0].category, "canvas");
}

#[test]
fn report_serializes_with_camel_case_contract() {
    let events = vec![ev(1, 1_000, "canvas", "toDataURL", Risk::High, "read")];
    let report = analyze(&events, &ctx("https://shop.example.com"));
    let value = serde_json::to_value(&report).expect("report serializes");

    for key in [
        "categories",
        "threats",
        "libraryDetections",
        "networkConversation",
        "exfiltration",
        "cookies",
        "websockets",
        "thirdParties",
        "bursts",
        "entropy",
        "h5w",
        "riskScore",
        "timeline",
        "pipelineStats",
    ] {
        assert!(value.get(key).is_some(), "missing report key {key}");
    }
}

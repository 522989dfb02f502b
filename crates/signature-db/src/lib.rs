//! Static signature table for known fingerprinting, bot-detection and
//! analytics libraries, matched against URLs observed during a capture.
//!
//! Matching is deliberately dumb: case-insensitive substring over the URL.
//! These patterns are vendor hostnames and well-known script paths, not
//! generic words, so substring precision is sufficient in practice.

use serde::{Deserialize, Serialize};

use pagewatch_core_types::Risk;

/// Broad purpose bucket for a signature.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignatureCategory {
    Fingerprinting,
    BotDetection,
    Analytics,
    Advertising,
    SessionReplay,
}

impl SignatureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureCategory::Fingerprinting => "fingerprinting",
            SignatureCategory::BotDetection => "bot-detection",
            SignatureCategory::Analytics => "analytics",
            SignatureCategory::Advertising => "advertising",
            SignatureCategory::SessionReplay => "session-replay",
        }
    }
}

/// One known library and the URL fragments that identify it.
pub struct Signature {
    pub library: &'static str,
    pub category: SignatureCategory,
    pub risk: Risk,
    pub patterns: &'static [&'static str],
}

/// A successful match, carrying the pattern that triggered it.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureMatch {
    pub library: String,
    pub category: String,
    pub risk: Risk,
    pub pattern: String,
    pub url: String,
}

pub const SIGNATURES: &[Signature] = &[
    Signature {
        library: "FingerprintJS",
        category: SignatureCategory::Fingerprinting,
        risk: Risk::High,
        patterns: &["fpjs.io", "fingerprintjs", "fpcdn.io", "fp.min.js"],
    },
    Signature {
        library: "CreepJS",
        category: SignatureCategory::Fingerprinting,
        risk: Risk::High,
        patterns: &["creepjs", "creep.js"],
    },
    Signature {
        library: "ThreatMetrix",
        category: SignatureCategory::Fingerprinting,
        risk: Risk::High,
        patterns: &["online-metrix.net", "threatmetrix"],
    },
    Signature {
        library: "Sift",
        category: SignatureCategory::Fingerprinting,
        risk: Risk::Medium,
        patterns: &["cdn.sift.com", "sift.js", "siftscience"],
    },
    Signature {
        library: "Iovation",
        category: SignatureCategory::Fingerprinting,
        risk: Risk::Medium,
        patterns: &["iovation.com", "iesnare"],
    },
    Signature {
        library: "DataDome",
        category: SignatureCategory::BotDetection,
        risk: Risk::High,
        patterns: &["datadome.co", "ct.datadome", "js.datadome"],
    },
    Signature {
        library: "PerimeterX",
        category: SignatureCategory::BotDetection,
        risk: Risk::High,
        patterns: &["perimeterx.net", "px-cdn.net", "px-cloud.net", "/px.js"],
    },
    Signature {
        library: "Akamai Bot Manager",
        category: SignatureCategory::BotDetection,
        risk: Risk::High,
        patterns: &["akam/13", "akam/11", "/akam/", "abck"],
    },
    Signature {
        library: "Cloudflare Bot Management",
        category: SignatureCategory::BotDetection,
        risk: Risk::Medium,
        patterns: &["cdn-cgi/challenge-platform", "turnstile"],
    },
    Signature {
        library: "Imperva",
        category: SignatureCategory::BotDetection,
        risk: Risk::Medium,
        patterns: &["incapsula", "imperva", "_incapsula_"],
    },
    Signature {
        library: "Kasada",
        category: SignatureCategory::BotDetection,
        risk: Risk::High,
        patterns: &["kasada.io", "/ips.js", "kpsdk"],
    },
    Signature {
        library: "Arkose Labs",
        category: SignatureCategory::BotDetection,
        risk: Risk::Medium,
        patterns: &["arkoselabs.com", "funcaptcha"],
    },
    Signature {
        library: "hCaptcha",
        category: SignatureCategory::BotDetection,
        risk: Risk::Low,
        patterns: &["hcaptcha.com"],
    },
    Signature {
        library: "reCAPTCHA",
        category: SignatureCategory::BotDetection,
        risk: Risk::Low,
        patterns: &["recaptcha", "gstatic.com/recaptcha"],
    },
    Signature {
        library: "Google Analytics",
        category: SignatureCategory::Analytics,
        risk: Risk::Low,
        patterns: &["google-analytics.com", "googletagmanager.com", "/gtag/js", "analytics.js"],
    },
    Signature {
        library: "Meta Pixel",
        category: SignatureCategory::Advertising,
        risk: Risk::Medium,
        patterns: &["connect.facebook.net", "fbevents.js"],
    },
    Signature {
        library: "DoubleClick",
        category: SignatureCategory::Advertising,
        risk: Risk::Low,
        patterns: &["doubleclick.net", "googlesyndication.com"],
    },
    Signature {
        library: "Segment",
        category: SignatureCategory::Analytics,
        risk: Risk::Low,
        patterns: &["cdn.segment.com", "segment.io"],
    },
    Signature {
        library: "Mixpanel",
        category: SignatureCategory::Analytics,
        risk: Risk::Low,
        patterns: &["mixpanel.com", "mxpnl.com"],
    },
    Signature {
        library: "Amplitude",
        category: SignatureCategory::Analytics,
        risk: Risk::Low,
        patterns: &["amplitude.com", "cdn.amplitude"],
    },
    Signature {
        library: "Hotjar",
        category: SignatureCategory::SessionReplay,
        risk: Risk::Medium,
        patterns: &["hotjar.com", "hotjar.io"],
    },
    Signature {
        library: "FullStory",
        category: SignatureCategory::SessionReplay,
        risk: Risk::Medium,
        patterns: &["fullstory.com", "fs.js"],
    },
    Signature {
        library: "LogRocket",
        category: SignatureCategory::SessionReplay,
        risk: Risk::Medium,
        patterns: &["logrocket.com", "logrocket.io", "lr-ingest"],
    },
];

/// Matches a URL against the signature table. First hit wins; the table is
/// ordered so the more specific vendors come before generic analytics.
pub fn match_url(url: &str) -> Option<SignatureMatch> {
    let lowered = url.to_ascii_lowercase();
    for signature in SIGNATURES {
        for pattern in signature.patterns {
            if lowered.contains(pattern) {
                return Some(SignatureMatch {
                    library: signature.library.to_string(),
                    category: signature.category.as_str().to_string(),
                    risk: signature.risk,
                    pattern: (*pattern).to_string(),
                    url: url.to_string(),
                });
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_fingerprinting_vendor() {
        let hit = match_url("https://fpcdn.io/v3/abcdef/loader_v3.11.js").expect("match");
        assert_eq!(hit.library, "FingerprintJS");
        assert_eq!(hit.category, "fingerprinting");
        assert_eq!(hit.risk, Risk::High);
        assert_eq!(hit.pattern, "fpcdn.io");
    }

    #[test]
    fn matches_are_case_insensitive() {
        let hit = match_url("https://JS.DATADOME.co/tags.js").expect("match");
        assert_eq!(hit.library, "DataDome");
    }

    #[test]
    fn unknown_url_returns_none() {
        assert!(match_url("https://static.shop.example.com/app.js").is_none());
    }

    #[test]
    fn bot_detection_before_generic_analytics() {
        // A URL carrying both a bot-detection path and an analytics-ish name
        // must resolve to the more specific vendor.
        let hit = match_url("https://x.example/cdn-cgi/challenge-platform/analytics.js")
            .expect("match");
        assert_eq!(hit.library, "Cloudflare Bot Management");
    }
}

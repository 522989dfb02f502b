//! Host extraction and third-party classification.

use url::Url;

/// Host component of a URL string, lowercased. Returns `None` for
/// anything that does not parse as an absolute URL with a host.
pub fn host_of(raw: &str) -> Option<String> {
    let parsed = Url::parse(raw).ok()?;
    parsed.host_str().map(|h| h.to_ascii_lowercase())
}

/// The last two dot-separated labels of a host. This is the "registrable
/// domain" approximation used for first/third-party classification:
/// `static.shop.example.com` -> `example.com`.
pub fn registrable(host: &str) -> String {
    let labels: Vec<&str> = host.rsplitn(3, '.').collect();
    if labels.len() < 2 {
        return host.to_string();
    }
    format!("{}.{}", labels[1], labels[0])
}

/// A host is third-party when its registrable domain differs from the
/// observed page's.
pub fn is_third_party(host: &str, target_host: &str) -> bool {
    registrable(host) != registrable(target_host)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_host() {
        assert_eq!(
            host_of("https://cdn.ads.io/x.js"),
            Some("cdn.ads.io".to_string())
        );
        assert_eq!(host_of("not a url"), None);
        assert_eq!(host_of("data:text/plain,hello"), None);
    }

    #[test]
    fn registrable_is_last_two_labels() {
        assert_eq!(registrable("static.shop.example.com"), "example.com");
        assert_eq!(registrable("example.com"), "example.com");
        assert_eq!(registrable("localhost"), "localhost");
    }

    #[test]
    fn third_party_classification() {
        assert!(is_third_party("cdn.ads.io", "shop.example.com"));
        assert!(!is_third_party("static.shop.example.com", "shop.example.com"));
        assert!(!is_third_party("example.com", "shop.example.com"));
    }
}

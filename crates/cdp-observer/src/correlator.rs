//! Joins the split protocol notifications that describe one logical
//! network request. `requestWillBeSent` begins a record; the first
//! terminal notification (response, finished, failed) consumes it.

use dashmap::DashMap;

use pagewatch_core_types::RequestRecord;

pub struct RequestCorrelator {
    inflight: DashMap<String, RequestRecord>,
}

impl RequestCorrelator {
    pub fn new() -> Self {
        Self {
            inflight: DashMap::new(),
        }
    }

    /// Inserts an in-flight record. A reused request id (legitimate after
    /// eviction) overwrites the stale record.
    pub fn begin(&self, record: RequestRecord) {
        self.inflight.insert(record.request_id.clone(), record);
    }

    /// Merges late header information (`requestWillBeSentExtraInfo`) into
    /// an in-flight record, if it is still there.
    pub fn attach_headers(
        &self,
        request_id: &str,
        headers: impl IntoIterator<Item = (String, String)>,
    ) {
        if let Some(mut record) = self.inflight.get_mut(request_id) {
            record.request_headers.extend(headers);
        }
    }

    /// Removes and returns the matching record. Absence is normal:
    /// protocol ordering is not strictly guaranteed, and the caller emits
    /// a partial event from whatever fields it does have.
    pub fn complete(&self, request_id: &str) -> Option<RequestRecord> {
        self.inflight.remove(request_id).map(|(_, record)| record)
    }

    /// Records still in flight; discarded wholesale at the snapshot
    /// boundary, which is what bounds the map.
    pub fn pending(&self) -> usize {
        self.inflight.len()
    }

    pub fn clear(&self) {
        self.inflight.clear();
    }
}

impl Default for RequestCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn record(id: &str, url: &str) -> RequestRecord {
        RequestRecord {
            request_id: id.to_string(),
            url: url.to_string(),
            method: "GET".to_string(),
            request_headers: BTreeMap::new(),
            post_data_preview: None,
            resource_type: Some("Fetch".to_string()),
            initiator_type: Some("script".to_string()),
            created_at: 1_000,
        }
    }

    #[test]
    fn begin_then_complete_returns_original() {
        let correlator = RequestCorrelator::new();
        correlator.begin(record("r1", "https://example.com/a"));
        let joined = correlator.complete("r1").expect("record present");
        assert_eq!(joined.url, "https://example.com/a");
        assert_eq!(correlator.pending(), 0);
    }

    #[test]
    fn complete_without_begin_is_absent_not_error() {
        let correlator = RequestCorrelator::new();
        assert!(correlator.complete("never-seen").is_none());
    }

    #[test]
    fn complete_is_at_most_once() {
        let correlator = RequestCorrelator::new();
        correlator.begin(record("r1", "https://example.com/a"));
        assert!(correlator.complete("r1").is_some());
        assert!(correlator.complete("r1").is_none());
    }

    #[test]
    fn reused_request_id_overwrites() {
        let correlator = RequestCorrelator::new();
        correlator.begin(record("r1", "https://example.com/old"));
        correlator.begin(record("r1", "https://example.com/new"));
        assert_eq!(correlator.pending(), 1);
        let joined = correlator.complete("r1").expect("record present");
        assert_eq!(joined.url, "https://example.com/new");
    }

    #[test]
    fn extra_info_headers_merge_into_record() {
        let correlator = RequestCorrelator::new();
        correlator.begin(record("r1", "https://example.com/a"));
        correlator.attach_headers(
            "r1",
            vec![("cookie".to_string(), "sid=abc".to_string())],
        );
        // Headers for an evicted record are dropped silently.
        correlator.attach_headers(
            "gone",
            vec![("x".to_string(), "y".to_string())],
        );
        let joined = correlator.complete("r1").expect("record present");
        assert_eq!(
            joined.request_headers.get("cookie").map(String::as_str),
            Some("sid=abc")
        );
    }
}

//! Target registry: the live inventory of attached execution contexts.
//!
//! Owned by the observer; everything else (the analyzer, the session
//! runner) only ever sees cloned snapshots.

use dashmap::DashMap;

use pagewatch_core_types::Target;

pub struct TargetRegistry {
    /// Keyed by protocol session id, unique per attachment.
    sessions: DashMap<String, Target>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    pub fn insert(&self, target: Target) {
        self.sessions.insert(target.session_id.clone(), target);
    }

    pub fn remove_by_session(&self, session_id: &str) -> Option<Target> {
        self.sessions.remove(session_id).map(|(_, mut target)| {
            target.attached = false;
            target
        })
    }

    pub fn remove_by_target(&self, target_id: &str) -> Option<Target> {
        let session_key = self
            .sessions
            .iter()
            .find(|entry| entry.value().target_id == target_id)
            .map(|entry| entry.key().clone())?;
        self.remove_by_session(&session_key)
    }

    pub fn get_by_session(&self, session_id: &str) -> Option<Target> {
        self.sessions.get(session_id).map(|e| e.value().clone())
    }

    pub fn contains_target(&self, target_id: &str) -> bool {
        self.sessions
            .iter()
            .any(|entry| entry.value().target_id == target_id)
    }

    pub fn mark_network_enabled(&self, session_id: &str) {
        if let Some(mut entry) = self.sessions.get_mut(session_id) {
            entry.network_enabled = true;
        }
    }

    /// Applies a `targetInfoChanged` update. Returns the refreshed target
    /// and whether its URL actually changed.
    pub fn update_info(
        &self,
        target_id: &str,
        url: Option<&str>,
        title: Option<&str>,
    ) -> Option<(Target, bool)> {
        let mut url_changed = false;
        let mut updated = None;
        for mut entry in self.sessions.iter_mut() {
            if entry.value().target_id == target_id {
                if let Some(url) = url {
                    if !url.is_empty() && entry.url != url {
                        entry.url = url.to_string();
                        url_changed = true;
                    }
                }
                if let Some(title) = title {
                    if !title.is_empty() {
                        entry.title = Some(title.to_string());
                    }
                }
                updated = Some(entry.value().clone());
                break;
            }
        }
        updated.map(|t| (t, url_changed))
    }

    pub fn snapshot(&self) -> Vec<Target> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    pub fn attached_count(&self) -> usize {
        self.sessions.len()
    }
}

impl Default for TargetRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagewatch_core_types::TargetKind;

    fn target(session: &str, target_id: &str, kind: TargetKind) -> Target {
        Target {
            target_id: target_id.to_string(),
            session_id: session.to_string(),
            kind,
            url: "https://example.com/".to_string(),
            title: None,
            parent_session_id: None,
            network_enabled: false,
            attached: true,
        }
    }

    #[test]
    fn insert_update_remove_round_trip() {
        let registry = TargetRegistry::new();
        registry.insert(target("s1", "t1", TargetKind::Page));
        assert!(registry.contains_target("t1"));
        assert_eq!(registry.attached_count(), 1);

        let (updated, changed) = registry
            .update_info("t1", Some("https://example.com/next"), Some("Next"))
            .expect("target exists");
        assert!(changed);
        assert_eq!(updated.url, "https://example.com/next");
        assert_eq!(updated.title.as_deref(), Some("Next"));

        // Same URL again is not a change.
        let (_, changed) = registry
            .update_info("t1", Some("https://example.com/next"), None)
            .expect("target exists");
        assert!(!changed);

        let removed = registry.remove_by_session("s1").expect("removed");
        assert!(!removed.attached);
        assert_eq!(registry.attached_count(), 0);
    }

    #[test]
    fn remove_by_target_resolves_session() {
        let registry = TargetRegistry::new();
        registry.insert(target("s1", "t1", TargetKind::Iframe));
        registry.insert(target("s2", "t2", TargetKind::ServiceWorker));
        assert!(registry.remove_by_target("t2").is_some());
        assert!(registry.contains_target("t1"));
        assert!(!registry.contains_target("t2"));
    }
}

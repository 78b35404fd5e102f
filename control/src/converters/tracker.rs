//! Dependency Tracker - cross-resource link graph
//!
//! ## Model
//!
//! ```text
//! left (changed)            right (depends on left)
//! Secret:default/site-tls ──► Backend:default_web_8080
//! Node:node-a             ──► Backend:default_web_8080
//! Ingress:default/web     ──► AcmeData:default/site-tls
//! ```
//!
//! A link `left -> right` reads "right depends on left". Converters record
//! links while building the model; the reconciler queries them with the
//! refs of the objects that changed to find what must be recomputed.
//!
//! `query_links` with `remove_matches` reads and deletes the matched edges
//! inside one critical section, so a link recorded concurrently is either
//! returned by this query or left for the next one.

use gatehouse_common::{ResourceType, TrackingLinks, TrackingRef};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// Safe Mutex lock helper that recovers from poisoning
#[inline]
pub(crate) fn safe_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(|poisoned| {
        warn!("Mutex poisoned during lock, recovering (data is still valid)");
        poisoned.into_inner()
    })
}

/// Process-lifetime dependency graph
#[derive(Debug, Default)]
pub struct Tracker {
    links: Mutex<HashMap<TrackingRef, BTreeSet<TrackingRef>>>,
}

impl Tracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `right` depends on `left`. Idempotent.
    ///
    /// Returns `true` if the link was new.
    pub fn track_names(
        &self,
        left_context: ResourceType,
        left_name: &str,
        right_context: ResourceType,
        right_name: &str,
    ) -> bool {
        self.track_refs(
            TrackingRef::new(left_context, left_name),
            TrackingRef::new(right_context, right_name),
        )
    }

    /// Record that `right` depends on every ref of `left_refs`
    pub fn track_ref_name(
        &self,
        left_refs: &[TrackingRef],
        right_context: ResourceType,
        right_name: &str,
    ) {
        let right = TrackingRef::new(right_context, right_name);
        let mut links = safe_lock(&self.links);
        for left in left_refs {
            links.entry(left.clone()).or_default().insert(right.clone());
        }
    }

    pub fn track_refs(&self, left: TrackingRef, right: TrackingRef) -> bool {
        let mut links = safe_lock(&self.links);
        links.entry(left).or_default().insert(right)
    }

    /// Names linked from any (type, name) pair of `input`
    ///
    /// Results are merged across inputs, de-duplicated and sorted per type.
    /// With `remove_matches` the returned edges are removed from the graph.
    pub fn query_links(&self, input: &TrackingLinks, remove_matches: bool) -> TrackingLinks {
        let mut output = TrackingLinks::new();
        let mut links = safe_lock(&self.links);
        for left in input.refs() {
            if remove_matches {
                if let Some(rights) = links.remove(&left) {
                    for right in &rights {
                        output.insert_ref(right);
                    }
                }
            } else if let Some(rights) = links.get(&left) {
                for right in rights {
                    output.insert_ref(right);
                }
            }
        }
        debug!(
            input = %input,
            output = %output,
            remove_matches,
            "Tracker query"
        );
        output
    }

    /// Drop the whole graph (full synchronization)
    pub fn clear_links(&self) {
        let mut links = safe_lock(&self.links);
        let count: usize = links.values().map(BTreeSet::len).sum();
        links.clear();
        debug!(count, "Tracker cleared");
    }

    /// Number of recorded edges
    pub fn link_count(&self) -> usize {
        safe_lock(&self.links).values().map(BTreeSet::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn input(pairs: &[(ResourceType, &str)]) -> TrackingLinks {
        pairs
            .iter()
            .map(|(context, name)| (*context, name.to_string()))
            .collect()
    }

    #[test]
    fn test_track_names_is_idempotent() {
        let tracker = Tracker::new();
        assert!(tracker.track_names(
            ResourceType::Secret,
            "default/site-tls",
            ResourceType::Backend,
            "default_web_8080"
        ));
        assert!(!tracker.track_names(
            ResourceType::Secret,
            "default/site-tls",
            ResourceType::Backend,
            "default_web_8080"
        ));
        assert_eq!(tracker.link_count(), 1);
    }

    #[test]
    fn test_query_merges_and_sorts() {
        let tracker = Tracker::new();
        tracker.track_ref_name(
            &[
                TrackingRef::new(ResourceType::Service, "default/web"),
                TrackingRef::new(ResourceType::Endpoints, "default/web"),
            ],
            ResourceType::Backend,
            "default_web_8080",
        );
        tracker.track_names(
            ResourceType::Endpoints,
            "default/web",
            ResourceType::Backend,
            "default_web_443",
        );
        tracker.track_names(
            ResourceType::Ingress,
            "default/web",
            ResourceType::AcmeData,
            "default/site-tls",
        );

        let output = tracker.query_links(
            &input(&[
                (ResourceType::Service, "default/web"),
                (ResourceType::Endpoints, "default/web"),
                (ResourceType::Pod, "default/unrelated"),
            ]),
            false,
        );

        assert_eq!(
            output.get(ResourceType::Backend),
            &["default_web_443".to_string(), "default_web_8080".to_string()]
        );
        assert!(output.get(ResourceType::AcmeData).is_empty());
    }

    #[test]
    fn test_query_without_prune_is_repeatable() {
        let tracker = Tracker::new();
        tracker.track_names(ResourceType::Node, "node-a", ResourceType::Backend, "b1");
        let query = input(&[(ResourceType::Node, "node-a")]);

        let first = tracker.query_links(&query, false);
        let second = tracker.query_links(&query, false);
        assert_eq!(first, second);
        assert_eq!(first.len(), 1);
    }

    #[test]
    fn test_query_with_prune_consumes_once() {
        let tracker = Tracker::new();
        tracker.track_names(ResourceType::Secret, "default/tls", ResourceType::Backend, "b1");
        tracker.track_names(
            ResourceType::Secret,
            "default/tls",
            ResourceType::Hostname,
            "example.com",
        );
        let query = input(&[(ResourceType::Secret, "default/tls")]);

        let first = tracker.query_links(&query, true);
        assert_eq!(first.len(), 2);

        let second = tracker.query_links(&query, true);
        assert!(second.is_empty());
        assert_eq!(tracker.link_count(), 0);
    }

    #[test]
    fn test_clear_links() {
        let tracker = Tracker::new();
        tracker.track_refs(
            TrackingRef::new(ResourceType::Service, "default/web"),
            TrackingRef::new(ResourceType::Backend, "default_web_80"),
        );
        tracker.clear_links();
        assert_eq!(tracker.link_count(), 0);
        assert!(tracker
            .query_links(&input(&[(ResourceType::Service, "default/web")]), false)
            .is_empty());
    }

    /// Pruning queries racing with inserts never lose or duplicate a link
    #[test]
    fn test_concurrent_prune_delivers_each_link_once() {
        let tracker = Arc::new(Tracker::new());
        let query = input(&[(ResourceType::Secret, "default/tls")]);

        let writer = {
            let tracker = tracker.clone();
            std::thread::spawn(move || {
                for i in 0..500 {
                    tracker.track_names(
                        ResourceType::Secret,
                        "default/tls",
                        ResourceType::Backend,
                        &format!("b{:03}", i),
                    );
                }
            })
        };

        let mut delivered = Vec::new();
        while !writer.is_finished() {
            let out = tracker.query_links(&query, true);
            delivered.extend(out.get(ResourceType::Backend).iter().cloned());
        }
        writer.join().expect("Writer thread should not panic");
        let out = tracker.query_links(&query, true);
        delivered.extend(out.get(ResourceType::Backend).iter().cloned());

        delivered.sort();
        let before = delivered.len();
        delivered.dedup();
        assert_eq!(before, delivered.len(), "No link delivered twice");
        assert_eq!(delivered.len(), 500, "Every link delivered");
    }
}

//! Trackers: thin persistent maps for roots, requests, and alerts.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::model::RootAnalysis;
use crate::request::{AnalysisRequest, RequestStatus};

/// Tracked root analyses keyed by uuid.
#[derive(Debug, Default)]
pub struct AnalysisTracker {
    roots: DashMap<Uuid, RootAnalysis>,
}

impl AnalysisTracker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            roots: DashMap::new(),
        }
    }

    /// Store (or replace) the tracked state of a root.
    pub fn track(&self, root: RootAnalysis) {
        self.roots.insert(root.uuid, root);
    }

    #[must_use]
    pub fn get(&self, uuid: &Uuid) -> Option<RootAnalysis> {
        self.roots.get(uuid).map(|root| root.clone())
    }

    pub fn delete(&self, uuid: &Uuid) -> bool {
        self.roots.remove(uuid).is_some()
    }

    #[must_use]
    pub fn contains(&self, uuid: &Uuid) -> bool {
        self.roots.contains_key(uuid)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.roots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

/// Outstanding analysis requests keyed by id.
#[derive(Debug, Default)]
pub struct RequestTracker {
    by_id: DashMap<Uuid, AnalysisRequest>,
}

impl RequestTracker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_id: DashMap::new(),
        }
    }

    /// Store (or replace) a request's tracked state.
    pub fn track(&self, request: AnalysisRequest) {
        self.by_id.insert(request.id, request);
    }

    #[must_use]
    pub fn get(&self, id: &Uuid) -> Option<AnalysisRequest> {
        self.by_id.get(id).map(|request| request.clone())
    }

    pub fn delete(&self, id: &Uuid) -> bool {
        self.by_id.remove(id).is_some()
    }

    /// All requests belonging to the given root.
    #[must_use]
    pub fn by_root(&self, root_uuid: &Uuid) -> Vec<AnalysisRequest> {
        self.by_id
            .iter()
            .filter(|entry| entry.root_uuid == *root_uuid)
            .map(|entry| entry.clone())
            .collect()
    }

    /// Drop every request created for the named module type. Returns the
    /// number removed.
    pub fn clear_by_module_type(&self, amt_name: &str) -> usize {
        let targets: Vec<Uuid> = self
            .by_id
            .iter()
            .filter(|entry| {
                entry
                    .module_type
                    .as_ref()
                    .is_some_and(|amt| amt.name == amt_name)
            })
            .map(|entry| *entry.key())
            .collect();

        for id in &targets {
            self.by_id.remove(id);
        }
        if !targets.is_empty() {
            debug!(module = amt_name, count = targets.len(), "cleared request tracking");
        }
        targets.len()
    }

    /// Leased requests whose lease has lapsed.
    #[must_use]
    pub fn expired(&self) -> Vec<AnalysisRequest> {
        let now = Utc::now();
        self.by_id
            .iter()
            .filter(|entry| {
                entry.status == RequestStatus::Leased
                    && entry.lease_expires_at.is_some_and(|expiry| now >= expiry)
            })
            .map(|entry| entry.clone())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

/// Pluggable alert escalation contract. The request processor calls this
/// once per root per detection-point growth.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn track_alert(&self, root: &RootAnalysis);
}

/// Default sink: records every escalation in memory. Tests inspect it;
/// deployments swap in a real alert management backend.
#[derive(Debug, Default)]
pub struct InMemoryAlertSink {
    escalations: Mutex<Vec<Uuid>>,
}

impl InMemoryAlertSink {
    #[must_use]
    pub fn new() -> Self {
        Self {
            escalations: Mutex::new(Vec::new()),
        }
    }

    /// How many times the given root has been escalated.
    #[must_use]
    pub fn times_alerted(&self, uuid: &Uuid) -> usize {
        self.escalations
            .lock()
            .iter()
            .filter(|alerted| *alerted == uuid)
            .count()
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.escalations.lock().len()
    }
}

#[async_trait]
impl AlertSink for InMemoryAlertSink {
    async fn track_alert(&self, root: &RootAnalysis) {
        debug!(root = %root.uuid, detections = root.detection_count(), "tracking alert");
        self.escalations.lock().push(root.uuid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AnalysisModuleType, ObservableId};

    #[test]
    fn analysis_tracker_round_trip() {
        let tracker = AnalysisTracker::new();
        let root = RootAnalysis::new();
        let uuid = root.uuid;

        tracker.track(root);
        assert!(tracker.contains(&uuid));
        assert_eq!(tracker.get(&uuid).unwrap().uuid, uuid);
        assert!(tracker.delete(&uuid));
        assert!(!tracker.delete(&uuid));
    }

    #[test]
    fn request_tracker_clears_by_module_type() {
        let tracker = RequestTracker::new();
        let root = RootAnalysis::new();
        let id = ObservableId::new("ipv4", "8.8.8.8");

        tracker.track(AnalysisRequest::observable_analysis(
            root.clone(),
            id.clone(),
            AnalysisModuleType::new("amt_x", "1.0.0"),
        ));
        tracker.track(AnalysisRequest::observable_analysis(
            root,
            id,
            AnalysisModuleType::new("amt_y", "1.0.0"),
        ));

        assert_eq!(tracker.clear_by_module_type("amt_x"), 1);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn expired_leases_are_reported() {
        let tracker = RequestTracker::new();
        let root = RootAnalysis::new();

        let mut live = AnalysisRequest::observable_analysis(
            root.clone(),
            ObservableId::new("ipv4", "8.8.8.8"),
            AnalysisModuleType::new("amt_x", "1.0.0"),
        );
        live.status = RequestStatus::Leased;
        live.lease_expires_at = Some(Utc::now() + chrono::Duration::seconds(60));
        tracker.track(live);

        let mut lapsed = AnalysisRequest::observable_analysis(
            root,
            ObservableId::new("ipv4", "8.8.4.4"),
            AnalysisModuleType::new("amt_x", "1.0.0"),
        );
        lapsed.status = RequestStatus::Leased;
        lapsed.lease_expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        let lapsed_id = lapsed.id;
        tracker.track(lapsed);

        let expired = tracker.expired();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, lapsed_id);
    }

    #[tokio::test]
    async fn in_memory_sink_counts_escalations() {
        let sink = InMemoryAlertSink::new();
        let root = RootAnalysis::new();

        sink.track_alert(&root).await;
        sink.track_alert(&root).await;

        assert_eq!(sink.times_alerted(&root.uuid), 2);
        assert_eq!(sink.total(), 2);
    }
}

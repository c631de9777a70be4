//! Subsystem composition.
//!
//! [`CoreSystem`] wires the registry, queues, locks, cache, events,
//! trackers, blob store, and alert sink into one explicit value passed by
//! reference into every operation. Tests and the local-vs-remote dual
//! backend hold multiple systems simultaneously without collision.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use crate::cache::ResultCache;
use crate::config::CoreConfig;
use crate::constants::{
    EVENT_MODULE_DELETED, EVENT_MODULE_MODIFIED, EVENT_MODULE_NEW, EVENT_WORK_ASSIGNED,
};
use crate::error::{CoreError, CoreResult};
use crate::events::{Event, EventBus};
use crate::locking::LockManager;
use crate::model::{AnalysisModuleType, RootAnalysis};
use crate::registry::{ModuleRegistry, RegisterOutcome};
use crate::request::{AnalysisRequest, RequestStatus};
use crate::storage::{BlobStore, LocalBlobStore, MemoryBlobStore};
use crate::tracking::{AlertSink, AnalysisTracker, InMemoryAlertSink, RequestTracker};

/// One analysis correlation engine instance.
pub struct CoreSystem {
    pub(crate) config: CoreConfig,
    pub(crate) registry: ModuleRegistry,
    pub(crate) locks: LockManager,
    pub(crate) cache: ResultCache,
    pub(crate) events: EventBus,
    pub(crate) roots: AnalysisTracker,
    pub(crate) requests: RequestTracker,
    pub(crate) blobs: Arc<dyn BlobStore>,
    pub(crate) alert_sink: Arc<dyn AlertSink>,
    // detection-point count at the last alert emission, per root
    pub(crate) alerted: DashMap<Uuid, usize>,
}

impl CoreSystem {
    /// An in-process system with memory-backed storage and the default
    /// alert sink. The composition used by unit tests and the CLI.
    #[must_use]
    pub fn new(config: CoreConfig) -> Self {
        Self::with_subsystems(
            config,
            Arc::new(MemoryBlobStore::new()),
            Arc::new(InMemoryAlertSink::new()),
        )
    }

    /// A system with filesystem blob storage under `config.storage_root`.
    pub fn with_local_storage(config: CoreConfig) -> CoreResult<Self> {
        let blobs = Arc::new(LocalBlobStore::new(config.storage_root.clone())?);
        Ok(Self::with_subsystems(
            config,
            blobs,
            Arc::new(InMemoryAlertSink::new()),
        ))
    }

    /// Full plug-in wiring: caller supplies the blob store and alert sink.
    #[must_use]
    pub fn with_subsystems(
        config: CoreConfig,
        blobs: Arc<dyn BlobStore>,
        alert_sink: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            config,
            registry: ModuleRegistry::new(),
            locks: LockManager::new(),
            cache: ResultCache::new(),
            events: EventBus::new(),
            roots: AnalysisTracker::new(),
            requests: RequestTracker::new(),
            blobs,
            alert_sink,
            alerted: DashMap::new(),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &CoreConfig {
        &self.config
    }

    #[must_use]
    pub const fn locks(&self) -> &LockManager {
        &self.locks
    }

    #[must_use]
    pub const fn cache(&self) -> &ResultCache {
        &self.cache
    }

    //
    // module registry
    //

    /// Register an analysis module type, binding a work queue to it. A
    /// version change atomically replaces the record and invalidates the old
    /// queue; leased-from-old requests still return but their results drop.
    pub fn register_analysis_module_type(
        &self,
        amt: AnalysisModuleType,
    ) -> CoreResult<AnalysisModuleType> {
        let outcome = self.registry.register(amt.clone())?;
        match outcome {
            RegisterOutcome::New => {
                self.events.emit(
                    EVENT_MODULE_NEW,
                    json!({"name": amt.name, "version": amt.version}),
                );
            }
            RegisterOutcome::Replaced => {
                self.cache.invalidate_module(&amt.name);
                self.events.emit(
                    EVENT_MODULE_MODIFIED,
                    json!({"name": amt.name, "version": amt.version}),
                );
            }
            RegisterOutcome::Unchanged => {}
        }
        Ok(amt)
    }

    #[must_use]
    pub fn get_analysis_module_type(&self, name: &str) -> Option<AnalysisModuleType> {
        self.registry.get(name)
    }

    #[must_use]
    pub fn get_all_analysis_module_types(&self) -> Vec<AnalysisModuleType> {
        self.registry.all()
    }

    /// Unregister a module type: the queue is dropped, outstanding request
    /// tracking is cleared, and its cached results are invalidated.
    pub fn delete_analysis_module_type(&self, name: &str) -> bool {
        if !self.registry.unregister(name) {
            return false;
        }
        self.requests.clear_by_module_type(name);
        self.cache.invalidate_module(name);
        self.events.emit(EVENT_MODULE_DELETED, json!({"name": name}));
        true
    }

    //
    // work distribution
    //

    /// Lease the next request for a module instance. Returns `None` when no
    /// work is available within `wait`, or when the supplied version no
    /// longer matches the registration (the module must re-register).
    pub async fn get_next_analysis_request(
        &self,
        owner: &str,
        amt_name: &str,
        version: &str,
        wait: Duration,
    ) -> CoreResult<Option<AnalysisRequest>> {
        let registered = self
            .registry
            .get(amt_name)
            .ok_or_else(|| CoreError::not_found("analysis_module_type", amt_name))?;

        if registered.version != version {
            info!(
                module = amt_name,
                requested = version,
                registered = %registered.version,
                "version mismatch on work request"
            );
            return Ok(None);
        }

        let queue = self
            .registry
            .queue(amt_name)
            .ok_or_else(|| CoreError::unavailable("work_queue", amt_name.to_string()))?;

        let deadline = deadline_after(wait);
        loop {
            let remaining = remaining_until(deadline);
            let Some(leased) = queue
                .get_wait(owner, registered.timeout_secs, remaining)
                .await
            else {
                return Ok(None);
            };

            // requests deleted while queued are skipped
            let Some(mut tracked) = self.requests.get(&leased.id) else {
                debug!(request = %leased.id, "leased request no longer tracked, skipping");
                queue.ack(leased.id);
                continue;
            };

            tracked.status = RequestStatus::Leased;
            tracked.owner = leased.owner.clone();
            tracked.lease_expires_at = leased.lease_expires_at;
            self.requests.track(tracked.clone());
            self.events.emit(
                EVENT_WORK_ASSIGNED,
                json!({"request_id": tracked.id, "module": amt_name, "owner": owner}),
            );
            return Ok(Some(tracked));
        }
    }

    /// Acknowledge a leased request after its result has been posted.
    pub fn ack_analysis_request(&self, id: Uuid) -> CoreResult<bool> {
        // the request may already be gone if its result was processed
        let amt_name = self
            .requests
            .get(&id)
            .and_then(|request| request.module_type.map(|amt| amt.name));

        match amt_name {
            Some(name) => match self.registry.queue(&name) {
                Some(queue) => Ok(queue.ack(id)),
                None => Ok(false),
            },
            None => Ok(false),
        }
    }

    /// Queued entries for a module type's work queue.
    #[must_use]
    pub fn queue_size(&self, amt_name: &str) -> usize {
        self.registry.queue(amt_name).map_or(0, |queue| queue.size())
    }

    //
    // roots
    //

    /// Submit a root analysis for processing. Re-submission of a known uuid
    /// direct-merges into the tracked root.
    pub async fn submit(&self, root: RootAnalysis) -> CoreResult<Uuid> {
        let uuid = root.uuid;
        self.process_analysis_request(AnalysisRequest::root_submission(root))
            .await?;
        Ok(uuid)
    }

    /// Post a completed observable analysis result.
    pub async fn post_result(&self, request: AnalysisRequest) -> CoreResult<()> {
        if !request.is_result() {
            return Err(CoreError::validation(
                "posted request carries no result baseline",
            ));
        }
        self.process_analysis_request(request).await
    }

    #[must_use]
    pub fn get_root(&self, uuid: &Uuid) -> Option<RootAnalysis> {
        self.roots.get(uuid)
    }

    /// Delete a tracked root and its outstanding request tracking.
    pub fn delete_root(&self, uuid: &Uuid) -> bool {
        let existed = self.roots.delete(uuid);
        if existed {
            for request in self.requests.by_root(uuid) {
                self.requests.delete(&request.id);
            }
            self.alerted.remove(uuid);
        }
        existed
    }

    #[must_use]
    pub fn get_analysis_request(&self, id: &Uuid) -> Option<AnalysisRequest> {
        self.requests.get(id)
    }

    //
    // blobs and details
    //

    pub fn store_blob(&self, data: &[u8]) -> CoreResult<String> {
        self.blobs.store(data)
    }

    pub fn load_blob(&self, sha256: &str) -> CoreResult<Option<Vec<u8>>> {
        self.blobs.load(sha256)
    }

    /// Serialize and store a details value, returning its blob handle.
    pub fn store_details(&self, details: &serde_json::Value) -> CoreResult<String> {
        self.blobs.store(&serde_json::to_vec(details)?)
    }

    /// Load a details value by blob handle.
    pub fn load_details(&self, sha256: &str) -> CoreResult<Option<serde_json::Value>> {
        match self.blobs.load(sha256)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    //
    // events
    //

    /// Subscribe to an event topic.
    #[must_use]
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<Event> {
        self.events.subscribe(topic)
    }
}

fn deadline_after(wait: Duration) -> DateTime<Utc> {
    Utc::now() + ChronoDuration::from_std(wait).unwrap_or_else(|_| ChronoDuration::seconds(0))
}

fn remaining_until(deadline: DateTime<Utc>) -> Duration {
    (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn systems_are_independent() {
        let a = CoreSystem::new(CoreConfig::default());
        let b = CoreSystem::new(CoreConfig::default());

        a.register_analysis_module_type(AnalysisModuleType::new("amt_x", "1.0.0"))
            .unwrap();
        assert!(a.get_analysis_module_type("amt_x").is_some());
        assert!(b.get_analysis_module_type("amt_x").is_none());
    }

    #[test]
    fn details_round_trip() {
        let system = CoreSystem::new(CoreConfig::default());
        let details = json!({"registrar": "example", "asn": 15169});

        let handle = system.store_details(&details).unwrap();
        assert_eq!(system.load_details(&handle).unwrap(), Some(details));
    }
}

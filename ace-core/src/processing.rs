//! The request processor: the core logic of the system.
//!
//! [`CoreSystem::process_analysis_request`] drives a root through the
//! registered module types. All mutation of a root happens under its root
//! lock; the tracked state is only committed at the end of the critical
//! section, so any error rolls the section back. Work-queue placement and
//! event emission are deferred to after the commit.

use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::generate_cache_key;
use crate::constants::{
    root_lock_name, EVENT_ALERT, EVENT_CACHE_HIT, EVENT_REQUEST_NEW, EVENT_ROOT_COMPLETED,
    EVENT_ROOT_EXPIRED, EVENT_ROOT_MODIFIED, EVENT_ROOT_NEW,
};
use crate::error::{CoreError, CoreResult};
use crate::model::{AnalysisModuleType, ObservableId, RootAnalysis};
use crate::request::AnalysisRequest;
use crate::system::CoreSystem;

// upper bound on cache-replay rounds; the dispatch scan converges long
// before this under any sane module registry
const MAX_DISPATCH_ROUNDS: usize = 100;

type PendingEvent = (&'static str, serde_json::Value);

enum DispatchAction {
    Replay {
        observable: ObservableId,
        amt_name: String,
        root_before: RootAnalysis,
        root_after: RootAnalysis,
    },
    Enqueue {
        observable: ObservableId,
        amt: AnalysisModuleType,
    },
}

impl CoreSystem {
    /// Process one analysis request: a fresh root submission or a returned
    /// observable analysis result.
    pub async fn process_analysis_request(&self, request: AnalysisRequest) -> CoreResult<()> {
        let lock_name = root_lock_name(&request.root_uuid);
        let lock_owner = format!("processor:{}", Uuid::new_v4());

        let acquired = self
            .locks
            .acquire(
                &lock_name,
                &lock_owner,
                self.config.lock_lease_secs,
                self.config.lock_wait_secs,
            )
            .await?;
        if !acquired {
            return Err(CoreError::timeout(
                format!("acquiring {lock_name}"),
                self.config.lock_wait_secs,
            ));
        }

        let result = self.process_under_root_lock(request).await;
        self.locks.release(&lock_name, &lock_owner);
        result
    }

    async fn process_under_root_lock(&self, request: AnalysisRequest) -> CoreResult<()> {
        let root_uuid = request.root_uuid;
        let mut pending_events: Vec<PendingEvent> = Vec::new();
        let mut to_enqueue: Vec<AnalysisRequest> = Vec::new();

        let mut target = match self.roots.get(&root_uuid) {
            None => {
                if request.is_result() {
                    return Err(CoreError::not_found("root_analysis", root_uuid.to_string()));
                }
                debug!(root = %root_uuid, "tracking new root analysis");
                pending_events.push((EVENT_ROOT_NEW, json!({ "uuid": root_uuid })));
                request.root.clone()
            }
            Some(mut tracked) => {
                if request.is_result() {
                    // a stale result is dropped without a merge; the scan
                    // below still runs so the observable re-queues onto the
                    // replacement module version
                    if self.absorb_result(&mut tracked, &request)? {
                        pending_events.push((
                            EVENT_ROOT_MODIFIED,
                            json!({ "uuid": root_uuid, "request_id": request.id }),
                        ));
                    }
                } else {
                    tracked.apply_merge(&request.root)?;
                    pending_events.push((EVENT_ROOT_MODIFIED, json!({ "uuid": root_uuid })));
                }
                tracked
            }
        };

        if !target.canceled {
            self.dispatch_observables(&mut target, &mut pending_events, &mut to_enqueue)?;
        }

        // escalate once per detection-point growth
        if !target.canceled && target.has_detections() {
            let count = target.detection_count();
            let previously = self.alerted.get(&root_uuid).map_or(0, |entry| *entry);
            if count > previously {
                info!(root = %root_uuid, detections = count, "escalating root to alert sink");
                self.alert_sink.track_alert(&target).await;
                self.alerted.insert(root_uuid, count);
                pending_events
                    .push((EVENT_ALERT, json!({ "uuid": root_uuid, "detections": count })));
            }
        }

        let mut expire = false;
        if target.outstanding_requests.is_empty() {
            if !target.completed {
                target.completed = true;
                pending_events.push((EVENT_ROOT_COMPLETED, json!({ "uuid": root_uuid })));
            }
            if target.expires {
                expire = true;
                pending_events.push((EVENT_ROOT_EXPIRED, json!({ "uuid": root_uuid })));
            }
        } else {
            target.completed = false;
        }

        // commit point: everything above mutated only local copies
        if expire {
            debug!(root = %root_uuid, "deleting expired root analysis");
            self.roots.delete(&root_uuid);
            self.alerted.remove(&root_uuid);
        } else {
            self.roots.track(target);
        }

        for queued in to_enqueue {
            let amt_name = queued
                .module_type
                .as_ref()
                .map(|amt| amt.name.clone())
                .unwrap_or_default();
            self.requests.track(queued.clone());
            if let Some(queue) = self.registry.queue(&amt_name) {
                queue.put(queued);
            }
        }

        for (topic, payload) in pending_events {
            self.events.emit(topic, payload);
        }
        Ok(())
    }

    /// Merge a returned result into the tracked root. Returns `false` when
    /// the result is stale and was silently dropped.
    fn absorb_result(
        &self,
        tracked: &mut RootAnalysis,
        request: &AnalysisRequest,
    ) -> CoreResult<bool> {
        let known = self
            .requests
            .get(&request.id)
            .ok_or_else(|| CoreError::not_found("analysis_request", request.id.to_string()))?;

        // the lease moved to another owner while this one was running
        if known.owner != request.owner {
            return Err(CoreError::conflict(format!(
                "request {} is owned by {:?}, not {:?}",
                request.id, known.owner, request.owner
            )));
        }

        let amt = request
            .module_type
            .as_ref()
            .ok_or_else(|| CoreError::validation("result carries no module type"))?;
        let before = request
            .root_before
            .as_ref()
            .ok_or_else(|| CoreError::validation("result carries no baseline"))?;

        // a result from a replaced module version is wasted work, not an
        // error: clear the tracking and drop it
        let current = self.registry.get(&amt.name);
        if !current.is_some_and(|registered| registered.version == amt.version) {
            warn!(
                request = %request.id,
                module = %amt.name,
                version = %amt.version,
                "dropping stale analysis result"
            );
            tracked.clear_request(request.id);
            self.requests.delete(&request.id);
            return Ok(false);
        }

        if let (Some(key), Some(ttl)) = (&request.cache_key, amt.cache_ttl) {
            self.cache.put(
                key.clone(),
                &amt.name,
                before.clone(),
                request.root.clone(),
                Some(ttl),
            );
        }

        tracked.apply_diff_merge(before, &request.root)?;
        tracked.clear_request(request.id);
        self.requests.delete(&request.id);
        if let Some(queue) = self.registry.queue(&amt.name) {
            queue.ack(request.id);
        }
        Ok(true)
    }

    /// Drive every observable through every applicable module type, to a
    /// fixed point: cache replays may surface new observables, which are
    /// scanned in the next round.
    fn dispatch_observables(
        &self,
        target: &mut RootAnalysis,
        pending_events: &mut Vec<PendingEvent>,
        to_enqueue: &mut Vec<AnalysisRequest>,
    ) -> CoreResult<()> {
        let module_types = self.registry.all();

        for _ in 0..MAX_DISPATCH_ROUNDS {
            let mut actions: Vec<DispatchAction> = Vec::new();

            for observable in &target.observables {
                for amt in &module_types {
                    if amt.manual
                        || observable.is_excluded(&amt.name)
                        || !amt.accepts(observable)
                        || observable.analysis_completed(&amt.name)
                        || observable.outstanding_request(&amt.name).is_some()
                    {
                        continue;
                    }

                    let identity = observable.identity();
                    if let Some(key) = generate_cache_key(&identity, amt) {
                        if let Some(cached) = self.cache.get(&key) {
                            actions.push(DispatchAction::Replay {
                                observable: identity,
                                amt_name: amt.name.clone(),
                                root_before: cached.root_before,
                                root_after: cached.root_after,
                            });
                            continue;
                        }
                    }

                    actions.push(DispatchAction::Enqueue {
                        observable: identity,
                        amt: amt.clone(),
                    });
                }
            }

            if actions.is_empty() {
                return Ok(());
            }

            for action in actions {
                match action {
                    DispatchAction::Replay {
                        observable,
                        amt_name,
                        root_before,
                        root_after,
                    } => {
                        debug!(
                            root = %target.uuid,
                            observable = %observable,
                            module = %amt_name,
                            "replaying cached analysis result"
                        );
                        target.apply_diff_merge(&root_before, &root_after)?;
                        pending_events.push((
                            EVENT_CACHE_HIT,
                            json!({
                                "uuid": target.uuid,
                                "observable": observable.to_string(),
                                "module": amt_name,
                            }),
                        ));
                    }
                    DispatchAction::Enqueue { observable, amt } => {
                        // a replay in this round may have satisfied the pair
                        if target.analysis_completed(&observable, &amt.name)
                            || target.analysis_tracked(&observable, &amt.name)
                        {
                            continue;
                        }

                        let queued = AnalysisRequest::observable_analysis(
                            target.clone(),
                            observable.clone(),
                            amt.clone(),
                        );
                        debug!(
                            root = %target.uuid,
                            observable = %observable,
                            module = %amt.name,
                            request = %queued.id,
                            "creating analysis request"
                        );
                        target.track_request(&observable, &amt.name, queued.id);
                        pending_events.push((
                            EVENT_REQUEST_NEW,
                            json!({
                                "uuid": target.uuid,
                                "request_id": queued.id,
                                "module": amt.name,
                            }),
                        ));
                        to_enqueue.push(queued);
                    }
                }
            }
        }

        Err(CoreError::fatal(format!(
            "dispatch of root {} did not converge",
            target.uuid
        )))
    }
}

//! Per-module-type work queues with lease discipline.
//!
//! Each registered module type owns one FIFO. Leased requests are invisible
//! until the lease expires, at which point they return to the head of the
//! queue with ownership cleared. Fairness holds within a queue (FIFO modulo
//! requeues) but not across queues.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use crate::request::{AnalysisRequest, RequestStatus};

const WAIT_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug)]
struct LeasedRequest {
    request: AnalysisRequest,
    expires_at: DateTime<Utc>,
}

/// FIFO work queue for a single analysis module type.
#[derive(Debug, Default)]
pub struct WorkQueue {
    queue: Mutex<VecDeque<AnalysisRequest>>,
    leased: DashMap<Uuid, LeasedRequest>,
    available: Notify,
}

impl WorkQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            leased: DashMap::new(),
            available: Notify::new(),
        }
    }

    /// Append a request to the tail of the queue.
    pub fn put(&self, mut request: AnalysisRequest) {
        request.status = RequestStatus::Queued;
        request.owner = None;
        request.lease_expires_at = None;
        self.queue.lock().push_back(request);
        self.available.notify_waiters();
    }

    /// Lease the next request for `owner`, or `None` when the queue is
    /// empty. Expired leases are reclaimed to the head first.
    #[must_use]
    pub fn get(&self, owner: &str, visibility_timeout_secs: u64) -> Option<AnalysisRequest> {
        self.reclaim_expired();

        let mut request = self.queue.lock().pop_front()?;
        let expires_at =
            Utc::now() + ChronoDuration::seconds(visibility_timeout_secs as i64);
        request.status = RequestStatus::Leased;
        request.owner = Some(owner.to_string());
        request.lease_expires_at = Some(expires_at);

        self.leased.insert(
            request.id,
            LeasedRequest {
                request: request.clone(),
                expires_at,
            },
        );
        Some(request)
    }

    /// Lease the next request, waiting up to `wait` for one to arrive.
    pub async fn get_wait(
        &self,
        owner: &str,
        visibility_timeout_secs: u64,
        wait: Duration,
    ) -> Option<AnalysisRequest> {
        let deadline = Utc::now()
            + ChronoDuration::from_std(wait).unwrap_or_else(|_| ChronoDuration::seconds(0));

        loop {
            let notified = self.available.notified();

            if let Some(request) = self.get(owner, visibility_timeout_secs) {
                return Some(request);
            }

            let remaining = deadline - Utc::now();
            if remaining <= ChronoDuration::zero() {
                return None;
            }

            let slice = remaining
                .to_std()
                .map_or(WAIT_SLICE, |r| r.min(WAIT_SLICE));
            let _ = tokio::time::timeout(slice, notified).await;
        }
    }

    /// Acknowledge a leased request, removing it from the queue for good.
    pub fn ack(&self, id: Uuid) -> bool {
        self.leased.remove(&id).is_some()
    }

    /// Return a leased request to the head of the queue.
    pub fn nack(&self, id: Uuid) -> bool {
        match self.leased.remove(&id) {
            Some((_, leased)) => {
                let mut request = leased.request;
                request.status = RequestStatus::Queued;
                request.owner = None;
                request.lease_expires_at = None;
                self.queue.lock().push_front(request);
                self.available.notify_waiters();
                true
            }
            None => false,
        }
    }

    /// Extend the lease held by `owner` on the given request.
    pub fn renew(&self, id: Uuid, owner: &str, visibility_timeout_secs: u64) -> bool {
        match self.leased.get_mut(&id) {
            Some(mut leased) if leased.request.owner.as_deref() == Some(owner) => {
                let expires_at =
                    Utc::now() + ChronoDuration::seconds(visibility_timeout_secs as i64);
                leased.expires_at = expires_at;
                leased.request.lease_expires_at = Some(expires_at);
                true
            }
            _ => false,
        }
    }

    /// Queued entries, not counting live leases.
    #[must_use]
    pub fn size(&self) -> usize {
        self.reclaim_expired();
        self.queue.lock().len()
    }

    // move expired leases back to the head with ownership cleared
    fn reclaim_expired(&self) {
        let now = Utc::now();
        let expired: Vec<Uuid> = self
            .leased
            .iter()
            .filter(|entry| now >= entry.expires_at)
            .map(|entry| *entry.key())
            .collect();

        for id in expired {
            if let Some((_, leased)) = self.leased.remove(&id) {
                debug!(request = %id, "work queue lease expired, requeueing");
                let mut request = leased.request;
                request.status = RequestStatus::Queued;
                request.owner = None;
                request.lease_expires_at = None;
                self.queue.lock().push_front(request);
                self.available.notify_waiters();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AnalysisModuleType, ObservableId, RootAnalysis};

    fn sample_request() -> AnalysisRequest {
        AnalysisRequest::observable_analysis(
            RootAnalysis::new(),
            ObservableId::new("ipv4", "8.8.8.8"),
            AnalysisModuleType::new("amt_whois", "1.0.0"),
        )
    }

    #[test]
    fn fifo_order() {
        let queue = WorkQueue::new();
        let first = sample_request();
        let second = sample_request();
        queue.put(first.clone());
        queue.put(second.clone());

        assert_eq!(queue.get("worker", 60).unwrap().id, first.id);
        assert_eq!(queue.get("worker", 60).unwrap().id, second.id);
        assert!(queue.get("worker", 60).is_none());
    }

    #[test]
    fn leased_requests_are_invisible_until_acked() {
        let queue = WorkQueue::new();
        let request = sample_request();
        queue.put(request.clone());

        let leased = queue.get("worker", 60).unwrap();
        assert_eq!(leased.status, RequestStatus::Leased);
        assert_eq!(leased.owner.as_deref(), Some("worker"));
        assert_eq!(queue.size(), 0);

        assert!(queue.ack(request.id));
        assert!(!queue.ack(request.id), "ack is one-shot");
    }

    #[test]
    fn expired_lease_returns_to_head_with_cleared_owner() {
        let queue = WorkQueue::new();
        let request = sample_request();
        queue.put(request.clone());

        let _ = queue.get("worker", 0).unwrap();
        assert_eq!(queue.size(), 1, "zero visibility expires immediately");

        let retried = queue.get("other-worker", 60).unwrap();
        assert_eq!(retried.id, request.id);
        assert_eq!(retried.owner.as_deref(), Some("other-worker"));
    }

    #[test]
    fn nack_requeues_at_head() {
        let queue = WorkQueue::new();
        let first = sample_request();
        let second = sample_request();
        queue.put(first.clone());
        queue.put(second.clone());

        let leased = queue.get("worker", 60).unwrap();
        assert!(queue.nack(leased.id));

        assert_eq!(queue.get("worker", 60).unwrap().id, first.id);
    }

    #[test]
    fn renewal_extends_the_lease() {
        let queue = WorkQueue::new();
        let request = sample_request();
        queue.put(request.clone());

        let _ = queue.get("worker", 60).unwrap();
        assert!(queue.renew(request.id, "worker", 120));
        assert!(!queue.renew(request.id, "intruder", 120));
    }

    #[tokio::test]
    async fn get_wait_wakes_on_put() {
        let queue = std::sync::Arc::new(WorkQueue::new());
        let waiter = std::sync::Arc::clone(&queue);

        let handle = tokio::spawn(async move {
            waiter
                .get_wait("worker", 60, Duration::from_secs(5))
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.put(sample_request());

        let leased = handle.await.unwrap();
        assert!(leased.is_some());
    }
}

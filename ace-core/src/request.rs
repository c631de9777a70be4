//! Analysis requests: the queued unit of work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::cache::generate_cache_key;
use crate::constants::SCHEMA_VERSION;
use crate::model::{AnalysisModuleType, ObservableId, RootAnalysis};

const fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

/// Tracking state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Queued,
    Leased,
    Completed,
    Failed,
    Expired,
}

impl RequestStatus {
    pub(crate) const fn queued() -> Self {
        Self::Queued
    }
}

/// A request to analyze one observable with one module type, or to absorb a
/// new root submission.
///
/// For observable requests, `root` is a deep copy of the tracked root taken
/// at enqueue time. The module manager calls [`AnalysisRequest::initialize_result`]
/// before running user code, then mutates `root` in place; the untouched
/// baseline in `root_before` is what makes the differential merge possible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRequest {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub id: Uuid,
    pub root_uuid: Uuid,
    /// Identity of the observable to analyze. `None` for root submissions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observable: Option<ObservableId>,
    /// Snapshot of the module type the request was created for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_type: Option<AnalysisModuleType>,
    /// The root being submitted, or the (possibly mutated) result root.
    pub root: RootAnalysis,
    /// The pre-analysis baseline. Present once a result has been initialized.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_before: Option<RootAnalysis>,
    #[serde(default = "RequestStatus::queued")]
    pub status: RequestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Deterministic cache key, absent when the module type does not cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<String>,
}

impl AnalysisRequest {
    /// A fresh root submission.
    #[must_use]
    pub fn root_submission(root: RootAnalysis) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            id: Uuid::new_v4(),
            root_uuid: root.uuid,
            observable: None,
            module_type: None,
            root,
            root_before: None,
            status: RequestStatus::Queued,
            owner: None,
            lease_expires_at: None,
            cache_key: None,
        }
    }

    /// A request to analyze `observable` with `module_type`, carrying a deep
    /// copy of the tracked root as the diff baseline.
    #[must_use]
    pub fn observable_analysis(
        root_snapshot: RootAnalysis,
        observable: ObservableId,
        module_type: AnalysisModuleType,
    ) -> Self {
        let cache_key = generate_cache_key(&observable, &module_type);
        Self {
            schema_version: SCHEMA_VERSION,
            id: Uuid::new_v4(),
            root_uuid: root_snapshot.uuid,
            observable: Some(observable),
            module_type: Some(module_type),
            root: root_snapshot,
            root_before: None,
            status: RequestStatus::Queued,
            owner: None,
            lease_expires_at: None,
            cache_key,
        }
    }

    #[must_use]
    pub const fn is_root_submission(&self) -> bool {
        self.observable.is_none()
    }

    /// True once the request carries a result (`root_before` is populated).
    #[must_use]
    pub const fn is_result(&self) -> bool {
        self.observable.is_some() && self.root_before.is_some()
    }

    /// True when the module type caches results.
    #[must_use]
    pub const fn is_cachable(&self) -> bool {
        self.cache_key.is_some()
    }

    /// Freeze the current root as the diff baseline. Called by the module
    /// manager before user code mutates `root`.
    pub fn initialize_result(&mut self) {
        if self.root_before.is_none() {
            self.root_before = Some(self.root.clone());
        }
    }
}

impl fmt::Display for AnalysisRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.observable, &self.module_type) {
            (Some(observable), Some(amt)) => write!(
                f,
                "AnalysisRequest({} {} via {}@{})",
                self.id, observable, amt.name, amt.version
            ),
            _ => write!(f, "AnalysisRequest({} root {})", self.id, self.root_uuid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Observable;

    #[test]
    fn result_requires_initialized_baseline() {
        let mut root = RootAnalysis::new();
        root.add_observable(Observable::new("ipv4", "8.8.8.8"));
        let identity = ObservableId::new("ipv4", "8.8.8.8");
        let amt = AnalysisModuleType::new("amt_whois", "1.0.0");

        let mut request = AnalysisRequest::observable_analysis(root, identity, amt);
        assert!(!request.is_result());

        request.initialize_result();
        assert!(request.is_result());
        assert_eq!(request.root_before.as_ref().unwrap(), &request.root);
    }

    #[test]
    fn cache_key_follows_module_cache_policy() {
        let root = RootAnalysis::new();
        let identity = ObservableId::new("ipv4", "8.8.8.8");

        let uncached = AnalysisRequest::observable_analysis(
            root.clone(),
            identity.clone(),
            AnalysisModuleType::new("amt_a", "1.0.0"),
        );
        assert!(!uncached.is_cachable());

        let cached = AnalysisRequest::observable_analysis(
            root,
            identity,
            AnalysisModuleType::new("amt_whois", "1.0.0").with_cache_ttl(3600),
        );
        assert!(cached.is_cachable());
    }
}

//! Analysis output records.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use super::{diff_merge_scalar, diff_merge_set, merge_set, DetectionPoint, ObservableId};

/// Completion state of an analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Pending,
    Complete,
    Failed { reason: String },
}

impl AnalysisStatus {
    pub(crate) const fn pending() -> Self {
        Self::Pending
    }
}

/// The output of one analysis module type run against one observable.
///
/// `details` is a content-addressed blob handle, never the body; load it
/// explicitly through the blob store. Child observables are identity
/// references into the owning root's observable store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// sha256 handle of the details blob, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Observables added by this analysis, by identity.
    #[serde(default)]
    pub observables: Vec<ObservableId>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub detection_points: BTreeSet<DetectionPoint>,
    #[serde(default)]
    pub directives: BTreeSet<String>,
    #[serde(default = "AnalysisStatus::pending")]
    pub status: AnalysisStatus,
}

impl Analysis {
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            summary: None,
            details: None,
            observables: Vec::new(),
            tags: BTreeSet::new(),
            detection_points: BTreeSet::new(),
            directives: BTreeSet::new(),
            status: AnalysisStatus::Pending,
        }
    }

    #[must_use]
    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    #[must_use]
    pub fn with_details_handle(mut self, sha256: impl Into<String>) -> Self {
        self.details = Some(sha256.into());
        self
    }

    #[must_use]
    pub fn completed(mut self) -> Self {
        self.status = AnalysisStatus::Complete;
        self
    }

    pub fn add_observable_reference(&mut self, id: ObservableId) {
        if !self.observables.contains(&id) {
            self.observables.push(id);
        }
    }

    /// Direct merge: additive only, scalar fields of `self` are untouched.
    pub fn apply_merge(&mut self, source: &Self) {
        merge_set(&mut self.tags, &source.tags);
        merge_set(&mut self.detection_points, &source.detection_points);
        merge_set(&mut self.directives, &source.directives);
        for id in &source.observables {
            self.add_observable_reference(id.clone());
        }
    }

    /// Differential merge against a `before`/`after` pair.
    pub fn apply_diff_merge(&mut self, before: &Self, after: &Self) {
        diff_merge_set(&mut self.tags, &before.tags, &after.tags);
        diff_merge_set(
            &mut self.detection_points,
            &before.detection_points,
            &after.detection_points,
        );
        diff_merge_set(&mut self.directives, &before.directives, &after.directives);

        diff_merge_scalar(&mut self.summary, &before.summary, &after.summary);
        diff_merge_scalar(&mut self.details, &before.details, &after.details);
        diff_merge_scalar(&mut self.status, &before.status, &after.status);

        for id in &after.observables {
            if !before.observables.contains(id) {
                self.add_observable_reference(id.clone());
            }
        }
    }
}

impl Default for Analysis {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_merge_is_idempotent() {
        let mut source = Analysis::new();
        source.tags.insert("malicious".to_string());
        source.add_observable_reference(ObservableId::new("ipv4", "1.2.3.4"));

        let mut target = Analysis::new();
        target.apply_merge(&source);
        let once = target.clone();
        target.apply_merge(&source);

        assert_eq!(target.tags, once.tags);
        assert_eq!(target.observables, once.observables);
    }

    #[test]
    fn diff_merge_updates_changed_status_only() {
        let before = Analysis::new();
        let after = before.clone().completed();

        let mut target = before.clone();
        target.apply_diff_merge(&before, &before);
        assert_eq!(target.status, AnalysisStatus::Pending);

        target.apply_diff_merge(&before, &after);
        assert_eq!(target.status, AnalysisStatus::Complete);
    }
}

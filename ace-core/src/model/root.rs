//! The root analysis: top-level container of one analysis job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

use crate::constants::SCHEMA_VERSION;
use crate::error::{CoreError, CoreResult};

use super::{
    diff_merge_scalar, diff_merge_set, merge_set, DetectionPoint, Observable, ObservableId,
};

const fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

fn default_analysis_mode() -> String {
    "analysis".to_string()
}

/// The tree root: a container of observables driven through analysis modules
/// until no outstanding requests remain.
///
/// All mutation happens under the root lock inside the request processor.
/// Observables live in a flat, order-insensitive store keyed by identity;
/// duplicates collapse on identity at merge time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootAnalysis {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub uuid: Uuid,
    #[serde(default)]
    pub description: String,
    /// Drives which module types apply. Mutable over the root's lifetime.
    #[serde(default = "default_analysis_mode")]
    pub analysis_mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_instance: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_time: Option<DateTime<Utc>>,
    /// Routing label for downstream alert consumers.
    #[serde(default)]
    pub queue: String,
    /// sha256 handle of the details blob, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub detection_points: BTreeSet<DetectionPoint>,
    #[serde(default)]
    pub directives: BTreeSet<String>,
    #[serde(default)]
    pub observables: Vec<Observable>,
    /// All outstanding request ids for this root, root-level and
    /// per-observable alike.
    #[serde(default)]
    pub outstanding_requests: BTreeSet<Uuid>,
    /// Delete this root once analysis completes.
    #[serde(default)]
    pub expires: bool,
    /// A canceled root absorbs results but spawns no further requests and
    /// never alerts.
    #[serde(default)]
    pub canceled: bool,
    #[serde(default)]
    pub completed: bool,
}

impl RootAnalysis {
    #[must_use]
    pub fn new() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            uuid: Uuid::new_v4(),
            description: String::new(),
            analysis_mode: default_analysis_mode(),
            tool: None,
            tool_instance: None,
            event_time: None,
            queue: String::new(),
            details: None,
            tags: BTreeSet::new(),
            detection_points: BTreeSet::new(),
            directives: BTreeSet::new(),
            observables: Vec::new(),
            outstanding_requests: BTreeSet::new(),
            expires: false,
            canceled: false,
            completed: false,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn with_analysis_mode(mut self, mode: impl Into<String>) -> Self {
        self.analysis_mode = mode.into();
        self
    }

    #[must_use]
    pub fn with_tool(mut self, tool: impl Into<String>, instance: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self.tool_instance = Some(instance.into());
        self
    }

    #[must_use]
    pub fn get_observable(&self, id: &ObservableId) -> Option<&Observable> {
        self.observables.iter().find(|o| o.identity() == *id)
    }

    pub fn get_observable_mut(&mut self, id: &ObservableId) -> Option<&mut Observable> {
        self.observables.iter_mut().find(|o| o.identity() == *id)
    }

    /// Add an observable, collapsing on identity: an existing observable
    /// with the same identity absorbs the new one by direct merge.
    pub fn add_observable(&mut self, observable: Observable) -> &mut Observable {
        let identity = observable.identity();
        if let Some(index) = self
            .observables
            .iter()
            .position(|o| o.identity() == identity)
        {
            self.observables[index].apply_merge(&observable);
            &mut self.observables[index]
        } else {
            self.observables.push(observable);
            self.observables.last_mut().expect("just pushed")
        }
    }

    pub fn add_tag(&mut self, tag: impl Into<String>) -> &mut Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn add_detection_point(&mut self, detection: DetectionPoint) -> &mut Self {
        self.detection_points.insert(detection);
        self
    }

    /// Total detection points across the root, its observables, and their
    /// analyses.
    #[must_use]
    pub fn detection_count(&self) -> usize {
        self.detection_points.len()
            + self
                .observables
                .iter()
                .map(Observable::detection_count)
                .sum::<usize>()
    }

    #[must_use]
    pub fn has_detections(&self) -> bool {
        self.detection_count() > 0
    }

    /// Record an outstanding request for `(observable, module type)`.
    pub fn track_request(&mut self, observable: &ObservableId, amt_name: &str, request_id: Uuid) {
        if let Some(target) = self.get_observable_mut(observable) {
            target
                .request_tracking
                .insert(amt_name.to_string(), request_id);
        }
        self.outstanding_requests.insert(request_id);
    }

    /// Drop an outstanding request from the root and whichever observable
    /// tracks it.
    pub fn clear_request(&mut self, request_id: Uuid) {
        self.outstanding_requests.remove(&request_id);
        for observable in &mut self.observables {
            observable
                .request_tracking
                .retain(|_, tracked| *tracked != request_id);
        }
    }

    /// True when an analysis of the given module type already exists for the
    /// observable.
    #[must_use]
    pub fn analysis_completed(&self, observable: &ObservableId, amt_name: &str) -> bool {
        self.get_observable(observable)
            .is_some_and(|o| o.analysis_completed(amt_name))
    }

    /// True when a request for `(observable, module type)` is already
    /// outstanding.
    #[must_use]
    pub fn analysis_tracked(&self, observable: &ObservableId, amt_name: &str) -> bool {
        self.get_observable(observable)
            .is_some_and(|o| o.outstanding_request(amt_name).is_some())
    }

    /// Direct merge: integrate a fresh submission with no baseline. Copies
    /// every element of `source` not already present; scalar fields of
    /// `self` are untouched.
    pub fn apply_merge(&mut self, source: &Self) -> CoreResult<()> {
        if self.uuid != source.uuid {
            return Err(CoreError::conflict(format!(
                "cannot merge root {} into root {}",
                source.uuid, self.uuid
            )));
        }

        merge_set(&mut self.tags, &source.tags);
        merge_set(&mut self.detection_points, &source.detection_points);
        merge_set(&mut self.directives, &source.directives);

        for observable in &source.observables {
            self.add_observable(observable.clone());
        }

        Ok(())
    }

    /// Differential merge: apply the `before`→`after` delta. Scalars follow
    /// last-writer-wins-on-actual-change; sets are monotonic; observable
    /// removal is never propagated.
    ///
    /// Only `before` and `after` must describe the same root. The target may
    /// be a different root entirely: cached result diffs are replayed onto
    /// any root carrying the same observable.
    pub fn apply_diff_merge(&mut self, before: &Self, after: &Self) -> CoreResult<()> {
        if before.uuid != after.uuid {
            return Err(CoreError::conflict(format!(
                "diff merge across distinct baselines {} / {}",
                before.uuid, after.uuid
            )));
        }

        diff_merge_scalar(
            &mut self.analysis_mode,
            &before.analysis_mode,
            &after.analysis_mode,
        );
        diff_merge_scalar(&mut self.description, &before.description, &after.description);
        diff_merge_scalar(&mut self.queue, &before.queue, &after.queue);
        diff_merge_scalar(&mut self.details, &before.details, &after.details);
        diff_merge_scalar(&mut self.canceled, &before.canceled, &after.canceled);
        diff_merge_scalar(&mut self.expires, &before.expires, &after.expires);

        diff_merge_set(&mut self.tags, &before.tags, &after.tags);
        diff_merge_set(
            &mut self.detection_points,
            &before.detection_points,
            &after.detection_points,
        );
        diff_merge_set(&mut self.directives, &before.directives, &after.directives);

        for after_observable in &after.observables {
            let identity = after_observable.identity();
            match before.get_observable(&identity) {
                None => {
                    // newly discovered observable, direct merge
                    self.add_observable(after_observable.clone());
                }
                Some(before_observable) => {
                    if let Some(target) = self.get_observable_mut(&identity) {
                        target.apply_diff_merge(before_observable, after_observable);
                    }
                }
            }
        }

        Ok(())
    }
}

impl Default for RootAnalysis {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RootAnalysis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RootAnalysis({})", self.uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root_with_observable() -> RootAnalysis {
        let mut root = RootAnalysis::new().with_description("suspicious login");
        root.add_observable(Observable::new("ipv4", "3.127.0.4"));
        root
    }

    #[test]
    fn duplicates_collapse_on_identity() {
        let mut root = root_with_observable();
        let mut dup = Observable::new("ipv4", "3.127.0.4");
        dup.add_tag("seen-twice");
        root.add_observable(dup);

        assert_eq!(root.observables.len(), 1);
        assert!(root.observables[0].has_tag("seen-twice"));
    }

    #[test]
    fn direct_merge_leaves_scalars_untouched() {
        let mut tracked = root_with_observable();
        let mut resubmission = tracked.clone();
        resubmission.analysis_mode = "correlation".to_string();
        resubmission.add_observable(Observable::new("user", "jdoe"));

        tracked.apply_merge(&resubmission).unwrap();
        assert_eq!(tracked.analysis_mode, "analysis");
        assert_eq!(tracked.observables.len(), 2);
    }

    #[test]
    fn direct_merge_rejects_foreign_root() {
        let mut tracked = root_with_observable();
        let other = RootAnalysis::new();
        assert!(matches!(
            tracked.apply_merge(&other),
            Err(CoreError::Conflict { .. })
        ));
    }

    #[test]
    fn empty_diff_is_a_no_op() {
        let tracked = root_with_observable();
        let snapshot = tracked.clone();

        let mut target = tracked.clone();
        target.apply_diff_merge(&snapshot, &snapshot).unwrap();
        assert_eq!(target, tracked);
    }

    #[test]
    fn diff_merge_carries_mode_change() {
        let before = root_with_observable();
        let mut after = before.clone();
        after.analysis_mode = "correlation".to_string();

        let mut target = before.clone();
        target.apply_diff_merge(&before, &after).unwrap();
        assert_eq!(target.analysis_mode, "correlation");
    }

    #[test]
    fn diff_merge_never_removes_observables() {
        let mut before = root_with_observable();
        before.add_observable(Observable::new("url", "http://evil.test/"));
        let mut after = before.clone();
        after.observables.retain(|o| o.observable_type != "url");

        let mut target = before.clone();
        target.apply_diff_merge(&before, &after).unwrap();
        assert_eq!(target.observables.len(), 2);
    }

    #[test]
    fn request_tracking_round_trip() {
        let mut root = root_with_observable();
        let identity = ObservableId::new("ipv4", "3.127.0.4");
        let request_id = Uuid::new_v4();

        root.track_request(&identity, "amt_whois", request_id);
        assert!(root.analysis_tracked(&identity, "amt_whois"));
        assert!(root.outstanding_requests.contains(&request_id));

        root.clear_request(request_id);
        assert!(!root.analysis_tracked(&identity, "amt_whois"));
        assert!(root.outstanding_requests.is_empty());
    }
}

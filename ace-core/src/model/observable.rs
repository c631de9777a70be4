//! Observables: the typed values being analyzed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

use super::{diff_merge_set, merge_set, Analysis, DetectionPoint};

/// Observable identity: `(type, value, time?)`. Everything else on an
/// observable is mergeable state; equality and merge keying use only this
/// triple.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObservableId {
    #[serde(rename = "type")]
    pub observable_type: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
}

impl ObservableId {
    pub fn new(observable_type: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            observable_type: observable_type.into(),
            value: value.into(),
            time: None,
        }
    }

    #[must_use]
    pub fn at(mut self, time: DateTime<Utc>) -> Self {
        self.time = Some(time);
        self
    }
}

impl fmt::Display for ObservableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.time {
            Some(time) => write!(f, "{}({}@{})", self.observable_type, self.value, time),
            None => write!(f, "{}({})", self.observable_type, self.value),
        }
    }
}

/// A typed value record under analysis.
///
/// The `id` is a stable uuid handle used for blob tracking and logging;
/// merge discipline keys on [`ObservableId`] identity, never on the uuid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observable {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub observable_type: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub detection_points: BTreeSet<DetectionPoint>,
    #[serde(default)]
    pub directives: BTreeSet<String>,
    /// Module type names that must never analyze this observable.
    #[serde(default)]
    pub excluded_analysis: BTreeSet<String>,
    /// Analysis results keyed by module type name. At most one per name.
    #[serde(default)]
    pub analysis: BTreeMap<String, Analysis>,
    /// Outstanding request ids keyed by module type name.
    #[serde(default)]
    pub request_tracking: BTreeMap<String, Uuid>,
}

impl Observable {
    pub fn new(observable_type: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            observable_type: observable_type.into(),
            value: value.into(),
            time: None,
            tags: BTreeSet::new(),
            detection_points: BTreeSet::new(),
            directives: BTreeSet::new(),
            excluded_analysis: BTreeSet::new(),
            analysis: BTreeMap::new(),
            request_tracking: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_time(mut self, time: DateTime<Utc>) -> Self {
        self.time = Some(time);
        self
    }

    #[must_use]
    pub fn identity(&self) -> ObservableId {
        ObservableId {
            observable_type: self.observable_type.clone(),
            value: self.value.clone(),
            time: self.time,
        }
    }

    pub fn add_tag(&mut self, tag: impl Into<String>) -> &mut Self {
        self.tags.insert(tag.into());
        self
    }

    #[must_use]
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    pub fn add_directive(&mut self, directive: impl Into<String>) -> &mut Self {
        self.directives.insert(directive.into());
        self
    }

    #[must_use]
    pub fn has_directive(&self, directive: &str) -> bool {
        self.directives.contains(directive)
    }

    pub fn add_detection_point(&mut self, detection: DetectionPoint) -> &mut Self {
        self.detection_points.insert(detection);
        self
    }

    /// Directs the core to never dispatch this observable to the named
    /// module type.
    pub fn exclude_analysis(&mut self, amt_name: impl Into<String>) -> &mut Self {
        self.excluded_analysis.insert(amt_name.into());
        self
    }

    #[must_use]
    pub fn is_excluded(&self, amt_name: &str) -> bool {
        self.excluded_analysis.contains(amt_name)
    }

    #[must_use]
    pub fn get_analysis(&self, amt_name: &str) -> Option<&Analysis> {
        self.analysis.get(amt_name)
    }

    /// Attach an analysis result under the given module type name. An
    /// existing record under the same name absorbs the new one by merge.
    pub fn add_analysis(&mut self, amt_name: impl Into<String>, analysis: Analysis) -> &mut Analysis {
        let name = amt_name.into();
        match self.analysis.entry(name) {
            std::collections::btree_map::Entry::Vacant(slot) => slot.insert(analysis),
            std::collections::btree_map::Entry::Occupied(slot) => {
                let existing = slot.into_mut();
                existing.apply_merge(&analysis);
                existing
            }
        }
    }

    #[must_use]
    pub fn analysis_completed(&self, amt_name: &str) -> bool {
        self.analysis.contains_key(amt_name)
    }

    /// The outstanding request id for the given module type, if any.
    #[must_use]
    pub fn outstanding_request(&self, amt_name: &str) -> Option<Uuid> {
        self.request_tracking.get(amt_name).copied()
    }

    /// Total detection points on this observable and its analyses.
    #[must_use]
    pub fn detection_count(&self) -> usize {
        self.detection_points.len()
            + self
                .analysis
                .values()
                .map(|a| a.detection_points.len())
                .sum::<usize>()
    }

    /// Direct merge: copy everything in `source` not already present.
    /// Identity fields and request tracking are left alone.
    pub fn apply_merge(&mut self, source: &Self) {
        merge_set(&mut self.tags, &source.tags);
        merge_set(&mut self.detection_points, &source.detection_points);
        merge_set(&mut self.directives, &source.directives);
        merge_set(&mut self.excluded_analysis, &source.excluded_analysis);

        for (name, analysis) in &source.analysis {
            self.add_analysis(name.clone(), analysis.clone());
        }
    }

    /// Differential merge: apply only the `before`→`after` delta.
    pub fn apply_diff_merge(&mut self, before: &Self, after: &Self) {
        diff_merge_set(&mut self.tags, &before.tags, &after.tags);
        diff_merge_set(
            &mut self.detection_points,
            &before.detection_points,
            &after.detection_points,
        );
        diff_merge_set(&mut self.directives, &before.directives, &after.directives);
        diff_merge_set(
            &mut self.excluded_analysis,
            &before.excluded_analysis,
            &after.excluded_analysis,
        );

        for (name, after_analysis) in &after.analysis {
            match before.analysis.get(name) {
                None => {
                    // newly added analysis, direct merge
                    self.add_analysis(name.clone(), after_analysis.clone());
                }
                Some(before_analysis) => {
                    // present in both sides of the diff: recurse into the
                    // tracked record if there is one. An absent record
                    // predates the baseline and belongs to some other
                    // result's delta, so this diff carries nothing for it.
                    if let Some(target_analysis) = self.analysis.get_mut(name) {
                        target_analysis.apply_diff_merge(before_analysis, after_analysis);
                    }
                }
            }
        }
    }
}

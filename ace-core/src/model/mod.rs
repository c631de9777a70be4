//! The analysis tree data model.
//!
//! A [`RootAnalysis`] owns a flat store of [`Observable`]s keyed by identity
//! `(type, value, time?)`; each observable maps analysis module type names to
//! [`Analysis`] records. References between nodes are identities, never
//! pointers, so the whole tree serializes trivially and merges key on
//! identity.

mod analysis;
mod module_type;
mod observable;
mod root;

pub use analysis::{Analysis, AnalysisStatus};
pub use module_type::AnalysisModuleType;
pub use observable::{Observable, ObservableId};
pub use root::RootAnalysis;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A marker that promotes the enclosing root into an alert.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DetectionPoint {
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl DetectionPoint {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            details: None,
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Direct merge for monotonic sets: add everything in `source` missing from
/// `target`.
pub(crate) fn merge_set<T: Ord + Clone>(target: &mut BTreeSet<T>, source: &BTreeSet<T>) {
    for item in source {
        if !target.contains(item) {
            target.insert(item.clone());
        }
    }
}

/// Differential merge for monotonic sets: add `after \ before` to `target`.
/// Removals are never propagated.
pub(crate) fn diff_merge_set<T: Ord + Clone>(
    target: &mut BTreeSet<T>,
    before: &BTreeSet<T>,
    after: &BTreeSet<T>,
) {
    for item in after.difference(before) {
        target.insert(item.clone());
    }
}

/// Differential merge for a scalar: an actual change between `before` and
/// `after` wins; an unchanged value leaves the target alone.
pub(crate) fn diff_merge_scalar<T: PartialEq + Clone>(target: &mut T, before: &T, after: &T) {
    if before != after {
        *target = after.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_merge_set_ignores_removals() {
        let mut target: BTreeSet<String> = ["kept".to_string()].into();
        let before: BTreeSet<String> = ["kept".to_string(), "removed".to_string()].into();
        let after: BTreeSet<String> = ["kept".to_string(), "added".to_string()].into();

        diff_merge_set(&mut target, &before, &after);
        assert!(target.contains("kept"));
        assert!(target.contains("added"));
        // "removed" was never in target and the diff must not resurrect it
        assert!(!target.contains("removed"));
    }

    #[test]
    fn diff_merge_scalar_only_applies_actual_change() {
        let mut target = "correlation".to_string();
        diff_merge_scalar(&mut target, &"analysis".to_string(), &"analysis".to_string());
        assert_eq!(target, "correlation");

        diff_merge_scalar(&mut target, &"analysis".to_string(), &"triage".to_string());
        assert_eq!(target, "triage");
    }
}

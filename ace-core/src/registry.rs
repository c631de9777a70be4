//! Analysis module type registry.
//!
//! Each registered type is bound to its own work queue. Re-registration at
//! the same version is idempotent; at a different version the record is
//! atomically replaced and a fresh queue is bound, invalidating the old one.
//! Requests leased from an invalidated queue still return, but the request
//! processor drops their results on the version check.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{CoreError, CoreResult};
use crate::model::AnalysisModuleType;
use crate::work_queue::WorkQueue;

const DEPENDENCY_SCAN_LIMIT: usize = 64;

/// What a registration did, so the caller can emit the matching event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// First registration under this name.
    New,
    /// Same name and version: idempotent re-registration.
    Unchanged,
    /// Different version: record replaced, old queue invalidated.
    Replaced,
}

#[derive(Clone)]
struct AmtRecord {
    amt: AnalysisModuleType,
    queue: Arc<WorkQueue>,
}

/// Registry of analysis module types and their bound work queues.
#[derive(Default)]
pub struct ModuleRegistry {
    records: DashMap<String, AmtRecord>,
}

impl ModuleRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    /// Register a module type, validating its dependency graph first.
    pub fn register(&self, amt: AnalysisModuleType) -> CoreResult<RegisterOutcome> {
        self.check_dependencies(&amt)?;

        let outcome = match self.records.entry(amt.name.clone()) {
            Entry::Vacant(slot) => {
                info!(module = %amt.name, version = %amt.version, "registering analysis module type");
                slot.insert(AmtRecord {
                    amt,
                    queue: Arc::new(WorkQueue::new()),
                });
                RegisterOutcome::New
            }
            Entry::Occupied(mut slot) => {
                if slot.get().amt.version_matches(&amt) {
                    // idempotent, but pick up non-version field changes
                    slot.get_mut().amt = amt;
                    RegisterOutcome::Unchanged
                } else {
                    info!(
                        module = %amt.name,
                        old_version = %slot.get().amt.version,
                        new_version = %amt.version,
                        "replacing analysis module type, invalidating old queue"
                    );
                    *slot.get_mut() = AmtRecord {
                        amt,
                        queue: Arc::new(WorkQueue::new()),
                    };
                    RegisterOutcome::Replaced
                }
            }
        };

        Ok(outcome)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<AnalysisModuleType> {
        self.records.get(name).map(|record| record.amt.clone())
    }

    /// The live work queue for a registered type.
    #[must_use]
    pub fn queue(&self, name: &str) -> Option<Arc<WorkQueue>> {
        self.records.get(name).map(|record| Arc::clone(&record.queue))
    }

    /// All currently registered types.
    #[must_use]
    pub fn all(&self) -> Vec<AnalysisModuleType> {
        let mut types: Vec<_> = self
            .records
            .iter()
            .map(|record| record.amt.clone())
            .collect();
        types.sort_by(|a, b| a.name.cmp(&b.name));
        types
    }

    /// Unregister a type, dropping its queue. Returns whether it existed.
    pub fn unregister(&self, name: &str) -> bool {
        let removed = self.records.remove(name).is_some();
        if removed {
            debug!(module = name, "unregistered analysis module type");
        }
        removed
    }

    // every dependency must already be registered, and following the
    // dependency edges must never lead back to the type being registered
    fn check_dependencies(&self, amt: &AnalysisModuleType) -> CoreResult<()> {
        for dep in &amt.dependencies {
            if dep == &amt.name {
                return Err(CoreError::validation(format!(
                    "module type {} depends on itself",
                    amt.name
                )));
            }
            if !self.records.contains_key(dep) {
                return Err(CoreError::validation(format!(
                    "module type {} depends on unknown type {dep}",
                    amt.name
                )));
            }
        }

        let mut frontier: Vec<String> = amt.dependencies.clone();
        let mut scanned = 0;
        while let Some(current) = frontier.pop() {
            scanned += 1;
            if scanned > DEPENDENCY_SCAN_LIMIT {
                return Err(CoreError::validation(format!(
                    "dependency graph of module type {} is too deep",
                    amt.name
                )));
            }
            if current == amt.name {
                return Err(CoreError::validation(format!(
                    "circular dependency through module type {}",
                    amt.name
                )));
            }
            if let Some(record) = self.records.get(&current) {
                frontier.extend(record.amt.dependencies.iter().cloned());
            }
        }

        Ok(())
    }
}

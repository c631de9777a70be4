//! Event topic paths and shared constants.

/// A new root analysis was stored.
pub const EVENT_ROOT_NEW: &str = "/core/analysis/root/new";
/// A tracked root analysis was modified by a merge.
pub const EVENT_ROOT_MODIFIED: &str = "/core/analysis/root/modified";
/// A root analysis has no outstanding requests left.
pub const EVENT_ROOT_COMPLETED: &str = "/core/analysis/root/completed";
/// A completed root analysis reached its expiry and was deleted.
pub const EVENT_ROOT_EXPIRED: &str = "/core/analysis/root/expired";

/// A new observable analysis request was enqueued.
pub const EVENT_REQUEST_NEW: &str = "/core/request/new";
/// A work item was leased to a module instance.
pub const EVENT_WORK_ASSIGNED: &str = "/core/work/assigned";

/// A root analysis accumulated detection points and was escalated.
pub const EVENT_ALERT: &str = "/core/alert";

/// An analysis module type was registered for the first time.
pub const EVENT_MODULE_NEW: &str = "/core/module/new";
/// An analysis module type was re-registered at a different version.
pub const EVENT_MODULE_MODIFIED: &str = "/core/module/modified";
/// An analysis module type was unregistered.
pub const EVENT_MODULE_DELETED: &str = "/core/module/deleted";

/// A cached analysis result was replayed instead of a queue round-trip.
pub const EVENT_CACHE_HIT: &str = "/core/cache/hit";

/// Current wire schema version carried by serialized entities.
pub const SCHEMA_VERSION: u32 = 1;

/// Lock name for the root analysis with the given uuid.
#[must_use]
pub fn root_lock_name(uuid: &uuid::Uuid) -> String {
    format!("root:{uuid}")
}

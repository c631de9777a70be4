//! Analysis correlation engine core.
//!
//! A recursive, pluggable analysis orchestration engine: callers submit a
//! [`RootAnalysis`] of observables, the core drives those observables
//! through registered [`AnalysisModuleType`]s, absorbs each result through
//! the differential merge discipline, re-queues newly discovered
//! observables, and converges to a fixed point. Roots that accumulate
//! detection points escalate to the alert sink.
//!
//! The core only routes work; module execution lives in external module
//! manager processes that lease requests from the work queues and post
//! results back. Every subsystem (trackers, queues, locks, cache, events,
//! blob storage, alerting) is a pluggable contract so the same logic runs
//! in-process, against a database backend, or behind the remote facade.

pub mod cache;
pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod locking;
pub mod model;
pub mod processing;
pub mod registry;
pub mod request;
pub mod storage;
pub mod system;
pub mod tracking;
pub mod work_queue;

pub use cache::{generate_cache_key, CachedResult, ResultCache};
pub use config::{CoreConfig, CryptoSettings};
pub use error::{CoreError, CoreResult};
pub use events::{Event, EventBus};
pub use locking::LockManager;
pub use model::{
    Analysis, AnalysisModuleType, AnalysisStatus, DetectionPoint, Observable, ObservableId,
    RootAnalysis,
};
pub use registry::{ModuleRegistry, RegisterOutcome};
pub use request::{AnalysisRequest, RequestStatus};
pub use storage::{BlobStore, LocalBlobStore, MemoryBlobStore};
pub use system::CoreSystem;
pub use tracking::{AlertSink, AnalysisTracker, InMemoryAlertSink, RequestTracker};
pub use work_queue::WorkQueue;

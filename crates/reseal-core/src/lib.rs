//! Reseal Core - unseal boundary and re-encryption orchestration
//!
//! This crate contains the logic shared by every reseal frontend
//! (CLI, HTTP boundary, future controllers):
//! - the authorization boundary that is the only producer of plaintext
//! - the object store contract and an in-memory store
//! - the concurrent, restartable re-encryption run

pub mod boundary;
pub mod cancel;
pub mod error;
pub mod job;
pub mod limiter;
pub mod object;
pub mod orchestrator;
pub mod report;
pub mod retry;
pub mod store;

pub use boundary::{
    AccessDenied, AccessPolicy, CallerIdentity, LocalUnsealer, UnsealBoundary, UnsealError,
    UnsealRequest, UnsealService, ALL_NAMESPACES,
};
pub use cancel::CancelSignal;
pub use error::{Classify, FailureKind, ResealError};
pub use job::{JobState, ReencryptionJob};
pub use limiter::RateLimiter;
pub use object::{ObjectRef, SealedObject, VersionToken, Versioned};
pub use orchestrator::{Orchestrator, ReencryptConfig};
pub use report::{Outcome, Report, ReportBuilder, RunStatus, Status, Totals};
pub use retry::RetryPolicy;
pub use store::{BackupRecord, BackupSink, ListScope, MemoryStore, ObjectStore, StoreError};

//! Synchronization engine: change tracking, conflict resolution, pull and
//! push stages, and the scheduler that serializes runs.

mod context;
mod controller;
pub mod diff;
mod error;
mod events;
mod observer;
mod pull;
mod push;
mod request;
pub mod resolver;
mod scheduler;
pub mod tracker;

pub use context::SyncContext;
pub use controller::SyncController;
pub use error::{SyncError, SyncResult};
pub use events::{SyncEvent, SyncOutcome, SyncPhase};
pub use observer::ChangeObserver;
pub use push::push_single;
pub use request::{SyncKind, SyncRequest, SyncScope};
pub use resolver::ConflictPolicy;
pub use scheduler::{SchedulerHandle, SyncScheduler};
pub use tracker::MarkForResyncRequest;

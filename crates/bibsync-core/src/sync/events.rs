//! Events published by the sync controller.

use serde::Serialize;

use super::request::SyncRequest;
use crate::models::{LibraryIdentifier, ObjectType};

/// Stage of a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "phase", content = "object_type")]
pub enum SyncPhase {
    Idle,
    ResolvingLibraries,
    FetchingVersions(ObjectType),
    FetchingObjects(ObjectType),
    ApplyingConflicts,
    PushingLocalChanges,
    UploadingAttachments,
    Finished,
    Aborted,
}

/// Summary of a completed run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
    pub libraries: Vec<LibraryIdentifier>,
    pub pulled: usize,
    pub pushed: usize,
    pub conflicts: usize,
    /// Per-object and per-step failures that did not abort the run.
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum SyncEvent {
    Started {
        request: SyncRequest,
    },
    Progress {
        library: Option<LibraryIdentifier>,
        phase: SyncPhase,
    },
    Finished {
        outcome: SyncOutcome,
    },
    Aborted {
        reason: String,
    },
}

impl SyncEvent {
    /// Whether this event ends a run.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished { .. } | Self::Aborted { .. })
    }
}

//! Sync requests and how concurrent requests coalesce.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::resolver::ConflictPolicy;
use crate::models::LibraryIdentifier;

/// What triggered a run, in increasing order of urgency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncKind {
    Background,
    ChangeObserver,
    AppForeground,
    Manual,
    /// Authoritative resync of every object.
    FullResync,
}

impl SyncKind {
    /// Conflict policy used when applying remote data.
    #[must_use]
    pub const fn policy(self) -> ConflictPolicy {
        match self {
            Self::FullResync => ConflictPolicy::PreferRemote,
            Self::Background | Self::ChangeObserver | Self::AppForeground | Self::Manual => {
                ConflictPolicy::PreferLocalIfConflicting
            }
        }
    }

    /// Whether a request of this kind interrupts a run in progress.
    #[must_use]
    pub const fn preempts(self) -> bool {
        matches!(self, Self::Manual | Self::FullResync)
    }
}

/// Libraries a run covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncScope {
    All,
    Libraries(BTreeSet<LibraryIdentifier>),
}

impl SyncScope {
    #[must_use]
    pub fn includes(&self, library: LibraryIdentifier) -> bool {
        match self {
            Self::All => true,
            Self::Libraries(libraries) => libraries.contains(&library),
        }
    }

    /// Union of two scopes; `All` absorbs everything.
    #[must_use]
    pub fn union(self, other: Self) -> Self {
        match (self, other) {
            (Self::Libraries(mut left), Self::Libraries(right)) => {
                left.extend(right);
                Self::Libraries(left)
            }
            _ => Self::All,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub kind: SyncKind,
    pub scope: SyncScope,
}

impl SyncRequest {
    #[must_use]
    pub const fn all(kind: SyncKind) -> Self {
        Self {
            kind,
            scope: SyncScope::All,
        }
    }

    #[must_use]
    pub fn libraries(kind: SyncKind, libraries: impl IntoIterator<Item = LibraryIdentifier>) -> Self {
        Self {
            kind,
            scope: SyncScope::Libraries(libraries.into_iter().collect()),
        }
    }

    /// Folds `other` into one request: the more urgent kind wins and the
    /// scopes are united.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        Self {
            kind: self.kind.max(other.kind),
            scope: self.scope.union(other.scope),
        }
    }

    #[must_use]
    pub const fn policy(&self) -> ConflictPolicy {
        self.kind.policy()
    }

    #[must_use]
    pub const fn force_all(&self) -> bool {
        matches!(self.kind, SyncKind::FullResync)
    }
}

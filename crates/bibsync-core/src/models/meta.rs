//! Sync bookkeeping shared by every syncable object.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Reconciliation state of a syncable object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Matches the server version.
    Synced,
    /// Needs reconciliation with the server. With a non-empty change mask this
    /// means local edits wait to be pushed; with an empty mask the object is a
    /// placeholder waiting to be filled by the next pull.
    Dirty,
    /// Known to exist remotely at a newer version; pending re-fetch.
    Outdated,
    /// Created locally and unknown to the server.
    New,
}

impl SyncState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::Dirty => "dirty",
            Self::Outdated => "outdated",
            Self::New => "new",
        }
    }
}

impl FromStr for SyncState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "synced" => Ok(Self::Synced),
            "dirty" => Ok(Self::Dirty),
            "outdated" => Ok(Self::Outdated),
            "new" => Ok(Self::New),
            other => Err(Error::InvalidInput(format!("Unknown sync state: {other}"))),
        }
    }
}

/// Origin of the pending change on an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    /// Interactive edit; survives conflicting remote data.
    User,
    /// Mechanical bookkeeping by the sync engine.
    Sync,
}

impl ChangeType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Sync => "sync",
        }
    }
}

impl FromStr for ChangeType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "sync" => Ok(Self::Sync),
            other => Err(Error::InvalidInput(format!("Unknown change type: {other}"))),
        }
    }
}

/// Kinds of per-library syncable objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    Collection,
    Search,
    Item,
}

impl ObjectType {
    /// Pull and push order: containers before their members.
    pub const SYNC_ORDER: [Self; 3] = [Self::Collection, Self::Search, Self::Item];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Collection => "collection",
            Self::Search => "search",
            Self::Item => "item",
        }
    }

    /// Path segment used by the REST API.
    #[must_use]
    pub const fn api_path(self) -> &'static str {
        match self {
            Self::Collection => "collections",
            Self::Search => "searches",
            Self::Item => "items",
        }
    }

    /// Query parameter used to select objects by key.
    #[must_use]
    pub const fn key_param(self) -> &'static str {
        match self {
            Self::Collection => "collectionKey",
            Self::Search => "searchKey",
            Self::Item => "itemKey",
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "collection" => Ok(Self::Collection),
            "search" => Ok(Self::Search),
            "item" => Ok(Self::Item),
            other => Err(Error::InvalidInput(format!("Unknown object type: {other}"))),
        }
    }
}

/// Version and sync bookkeeping embedded in every syncable object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMeta {
    /// Server version; 0 for never-synced objects.
    pub version: i64,
    pub sync_state: SyncState,
    pub change_type: ChangeType,
    /// Raw changed-field mask; typed views live on each object type.
    pub changed: u32,
    /// Tombstone: the server must still be told about a delete.
    pub deleted: bool,
    pub sync_retries: u32,
    /// Last sync attempt (Unix ms).
    pub last_sync_date: Option<i64>,
}

impl SyncMeta {
    /// Bookkeeping for an object created by a user action.
    #[must_use]
    pub const fn new_local(changed: u32) -> Self {
        Self {
            version: 0,
            sync_state: SyncState::New,
            change_type: ChangeType::User,
            changed,
            deleted: false,
            sync_retries: 0,
            last_sync_date: None,
        }
    }

    /// Bookkeeping for an object that matches the given server version.
    #[must_use]
    pub const fn synced(version: i64) -> Self {
        Self {
            version,
            sync_state: SyncState::Synced,
            change_type: ChangeType::Sync,
            changed: 0,
            deleted: false,
            sync_retries: 0,
            last_sync_date: None,
        }
    }

    /// Bookkeeping for a referenced-but-unfetched key.
    #[must_use]
    pub const fn placeholder(now_ms: i64) -> Self {
        Self {
            version: 0,
            sync_state: SyncState::Dirty,
            change_type: ChangeType::Sync,
            changed: 0,
            deleted: false,
            sync_retries: 1,
            last_sync_date: Some(now_ms),
        }
    }

    /// Whether the object carries local edits or a pending delete.
    #[must_use]
    pub const fn is_changed(&self) -> bool {
        self.changed != 0 || self.deleted
    }

    /// State with the `dirty`-without-changes contradiction normalized to
    /// `synced` for everything concerning local edits.
    #[must_use]
    pub const fn effective_state(&self) -> SyncState {
        match self.sync_state {
            SyncState::Dirty if !self.is_changed() => SyncState::Synced,
            state => state,
        }
    }

    /// Whether the next push must carry this object.
    #[must_use]
    pub const fn needs_push(&self) -> bool {
        matches!(self.sync_state, SyncState::New) || self.is_changed()
    }

    /// Whether the object waits to be re-fetched regardless of the manifest.
    #[must_use]
    pub const fn needs_resync(&self) -> bool {
        match self.sync_state {
            SyncState::Outdated => true,
            SyncState::Dirty => self.changed == 0 && !self.deleted,
            SyncState::Synced | SyncState::New => false,
        }
    }
}

//! Library records and per-library version slots.

use async_trait::async_trait;
use libsql::{Connection, Row};

use crate::db::{DbRequest, StoreContext};
use crate::error::Result;
use crate::models::{ChangeType, Library, LibraryIdentifier, ObjectType};

const LIBRARY_COLUMNS: &str =
    "library_key, name, version, metadata_editable, files_editable";

/// Named version counter kept per library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VersionSlot {
    /// Last fully applied object version for one object type.
    Objects(ObjectType),
    /// Last applied remote deletion log version.
    Deletions,
}

impl VersionSlot {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Objects(object_type) => object_type.as_str(),
            Self::Deletions => "deletions",
        }
    }
}

fn library_from_row(row: &Row) -> Result<Library> {
    let key: String = row.get(0)?;
    Ok(Library {
        identifier: key.parse()?,
        name: row.get(1)?,
        version: row.get(2)?,
        metadata_editable: row.get::<i64>(3)? != 0,
        files_editable: row.get::<i64>(4)? != 0,
    })
}

async fn load_library(conn: &Connection, identifier: LibraryIdentifier) -> Result<Option<Library>> {
    let mut rows = conn
        .query(
            &format!("SELECT {LIBRARY_COLUMNS} FROM libraries WHERE library_key = ?"),
            [identifier.as_key()],
        )
        .await?;
    match rows.next().await? {
        Some(row) => Ok(Some(library_from_row(&row)?)),
        None => Ok(None),
    }
}

async fn upsert_library(conn: &Connection, library: &Library) -> Result<()> {
    let kind = if library.identifier.is_group() {
        "group"
    } else {
        "custom"
    };
    conn.execute(
        "INSERT INTO libraries (library_key, kind, name, version, metadata_editable, files_editable)
         VALUES (?, ?, ?, ?, ?, ?)
         ON CONFLICT(library_key) DO UPDATE SET
            name = excluded.name,
            version = excluded.version,
            metadata_editable = excluded.metadata_editable,
            files_editable = excluded.files_editable",
        libsql::params![
            library.identifier.as_key(),
            kind,
            library.name.clone(),
            library.version,
            i64::from(library.metadata_editable),
            i64::from(library.files_editable)
        ],
    )
    .await?;
    Ok(())
}

/// Fetches the library record, creating it when absent.
///
/// Auto-created groups stay read-only until their metadata is fetched.
pub(crate) async fn ensure_library(
    conn: &Connection,
    identifier: LibraryIdentifier,
) -> Result<Library> {
    if let Some(library) = load_library(conn, identifier).await? {
        return Ok(library);
    }

    let library = match identifier {
        LibraryIdentifier::Custom(_) => Library::my_library(),
        LibraryIdentifier::Group(id) => Library {
            identifier,
            name: format!("Group {id}"),
            version: 0,
            metadata_editable: false,
            files_editable: false,
        },
    };
    upsert_library(conn, &library).await?;
    tracing::debug!(library = %identifier, "Created library record");
    Ok(library)
}

/// Raises a version slot; lower versions are ignored.
pub(crate) async fn set_version(
    conn: &Connection,
    library: LibraryIdentifier,
    slot: VersionSlot,
    version: i64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO library_versions (library_key, slot, version) VALUES (?, ?, ?)
         ON CONFLICT(library_key, slot) DO UPDATE SET
            version = MAX(library_versions.version, excluded.version)",
        libsql::params![library.as_key(), slot.as_str(), version],
    )
    .await?;
    Ok(())
}

/// Autocreate-or-fetch by primary key.
pub struct EnsureLibraryRequest {
    pub identifier: LibraryIdentifier,
}

#[async_trait]
impl DbRequest for EnsureLibraryRequest {
    type Output = Library;

    async fn process(&self, ctx: &mut StoreContext<'_>) -> Result<Library> {
        ensure_library(ctx.conn(), self.identifier).await
    }
}

/// All known libraries, custom library first.
pub struct ReadLibrariesRequest;

#[async_trait]
impl DbRequest for ReadLibrariesRequest {
    type Output = Vec<Library>;

    async fn process(&self, ctx: &mut StoreContext<'_>) -> Result<Vec<Library>> {
        let mut rows = ctx
            .conn()
            .query(&format!("SELECT {LIBRARY_COLUMNS} FROM libraries"), ())
            .await?;
        let mut libraries = Vec::new();
        while let Some(row) = rows.next().await? {
            libraries.push(library_from_row(&row)?);
        }
        libraries.sort_by_key(|library| library.identifier);
        Ok(libraries)
    }
}

/// Creates or refreshes a group record from remote metadata.
pub struct StoreGroupRequest {
    pub library: Library,
}

#[async_trait]
impl DbRequest for StoreGroupRequest {
    type Output = ();

    async fn process(&self, ctx: &mut StoreContext<'_>) -> Result<()> {
        upsert_library(ctx.conn(), &self.library).await
    }
}

/// Purges a group and everything in it.
///
/// Collections go first, then top-level items, then their children, then the
/// group record itself. Returns the number of purged objects.
pub struct DeleteGroupRequest {
    pub identifier: LibraryIdentifier,
}

#[async_trait]
impl DbRequest for DeleteGroupRequest {
    type Output = u64;

    async fn process(&self, ctx: &mut StoreContext<'_>) -> Result<u64> {
        let conn = ctx.conn();
        let library_key = self.identifier.as_key();

        let mut removed = Vec::new();
        for object_type in ObjectType::SYNC_ORDER {
            let mut rows = conn
                .query(
                    "SELECT key FROM objects WHERE library_key = ? AND object_type = ?",
                    [library_key.as_str(), object_type.as_str()],
                )
                .await?;
            let mut keys = Vec::new();
            while let Some(row) = rows.next().await? {
                keys.push(row.get::<String>(0)?);
            }
            removed.push((object_type, keys));
        }

        let statements = [
            "DELETE FROM objects WHERE library_key = ? AND object_type = 'collection'",
            "DELETE FROM objects WHERE library_key = ? AND object_type = 'search'",
            "DELETE FROM objects WHERE library_key = ? AND object_type = 'item' AND parent_key IS NULL",
            "DELETE FROM objects WHERE library_key = ?",
        ];
        let mut purged = 0;
        for statement in statements {
            purged += conn.execute(statement, [library_key.as_str()]).await?;
        }

        for statement in [
            "DELETE FROM sync_conflicts WHERE library_key = ?",
            "DELETE FROM upload_sessions WHERE library_key = ?",
            "DELETE FROM library_versions WHERE library_key = ?",
            "DELETE FROM libraries WHERE library_key = ?",
        ] {
            conn.execute(statement, [library_key.as_str()]).await?;
        }

        for (object_type, keys) in removed {
            ctx.notify(self.identifier, object_type, keys, ChangeType::Sync);
        }
        tracing::info!(library = %self.identifier, purged, "Removed group");
        Ok(purged)
    }
}

/// Reads a version slot; 0 when never set.
pub struct ReadVersionRequest {
    pub library: LibraryIdentifier,
    pub slot: VersionSlot,
}

#[async_trait]
impl DbRequest for ReadVersionRequest {
    type Output = i64;

    async fn process(&self, ctx: &mut StoreContext<'_>) -> Result<i64> {
        let mut rows = ctx
            .conn()
            .query(
                "SELECT version FROM library_versions WHERE library_key = ? AND slot = ?",
                [self.library.as_key().as_str(), self.slot.as_str()],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(row.get(0)?),
            None => Ok(0),
        }
    }
}

/// Highest version recorded in any slot: the library version the local
/// replica is consistent with.
pub struct ReadLibraryVersionRequest {
    pub library: LibraryIdentifier,
}

#[async_trait]
impl DbRequest for ReadLibraryVersionRequest {
    type Output = i64;

    async fn process(&self, ctx: &mut StoreContext<'_>) -> Result<i64> {
        let mut rows = ctx
            .conn()
            .query(
                "SELECT COALESCE(MAX(version), 0) FROM library_versions WHERE library_key = ?",
                [self.library.as_key()],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(row.get(0)?),
            None => Ok(0),
        }
    }
}

/// Stores a version slot. Versions never move backwards.
pub struct SetVersionRequest {
    pub library: LibraryIdentifier,
    pub slot: VersionSlot,
    pub version: i64,
    pub now_ms: i64,
}

#[async_trait]
impl DbRequest for SetVersionRequest {
    type Output = ();

    async fn process(&self, ctx: &mut StoreContext<'_>) -> Result<()> {
        let conn = ctx.conn();
        ensure_library(conn, self.library).await?;
        set_version(conn, self.library, self.slot, self.version).await?;
        conn.execute(
            "UPDATE libraries SET last_sync_date = ? WHERE library_key = ?",
            libsql::params![self.now_ms, self.library.as_key()],
        )
        .await?;
        Ok(())
    }
}

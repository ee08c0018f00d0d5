//! Database migrations

use crate::error::Result;
use libsql::Connection;

/// Current schema version
const CURRENT_VERSION: i32 = 3;

/// Run all pending migrations
pub async fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn).await?;

    if version < 1 {
        migrate_v1(conn).await?;
    }
    if version < 2 {
        migrate_v2(conn).await?;
    }
    if version < 3 {
        migrate_v3(conn).await?;
    }

    Ok(())
}

/// Get the current schema version
async fn get_version(conn: &Connection) -> Result<i32> {
    let mut rows = conn
        .query(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
            (),
        )
        .await?;

    let exists: bool = if let Some(row) = rows.next().await? {
        row.get::<i32>(0)? != 0
    } else {
        false
    };

    if !exists {
        return Ok(0);
    }

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await?;

    let version: i32 = if let Some(row) = rows.next().await? {
        row.get(0)?
    } else {
        0
    };

    Ok(version)
}

/// Runs one migration's statements in a single transaction.
async fn apply(conn: &Connection, version: i32, statements: &[&str]) -> Result<()> {
    // libsql doesn't have execute_batch, so we run each statement separately
    conn.execute("BEGIN TRANSACTION", ()).await?;

    for stmt in statements {
        if let Err(e) = conn.execute(stmt, ()).await {
            conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }
    }

    if let Err(e) = conn
        .execute("INSERT INTO schema_version (version) VALUES (?)", [version])
        .await
    {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    if let Err(e) = conn.execute("COMMIT", ()).await {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    tracing::info!("Migrated database to version {version}");
    Ok(())
}

/// Migration to version 1: libraries, version slots and syncable objects
async fn migrate_v1(conn: &Connection) -> Result<()> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )",
        "CREATE TABLE IF NOT EXISTS libraries (
            library_key TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            name TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 0,
            metadata_editable INTEGER NOT NULL DEFAULT 1,
            files_editable INTEGER NOT NULL DEFAULT 1,
            last_sync_date INTEGER
        )",
        // Last fully applied server version per (library, object type) and deletions
        "CREATE TABLE IF NOT EXISTS library_versions (
            library_key TEXT NOT NULL REFERENCES libraries(library_key) ON DELETE CASCADE,
            slot TEXT NOT NULL,
            version INTEGER NOT NULL,
            PRIMARY KEY (library_key, slot)
        )",
        "CREATE TABLE IF NOT EXISTS objects (
            library_key TEXT NOT NULL REFERENCES libraries(library_key) ON DELETE CASCADE,
            object_type TEXT NOT NULL,
            key TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 0,
            sync_state TEXT NOT NULL,
            change_type TEXT NOT NULL,
            changed_fields INTEGER NOT NULL DEFAULT 0,
            deleted INTEGER NOT NULL DEFAULT 0,
            sync_retries INTEGER NOT NULL DEFAULT 0,
            last_sync_date INTEGER,
            parent_key TEXT,
            payload TEXT NOT NULL,
            PRIMARY KEY (library_key, object_type, key)
        )",
        "CREATE INDEX IF NOT EXISTS idx_objects_state ON objects(library_key, object_type, sync_state)",
        "CREATE INDEX IF NOT EXISTS idx_objects_parent ON objects(library_key, parent_key)",
    ];
    apply(conn, 1, &statements).await
}

/// Migration to version 2: conflict queue
async fn migrate_v2(conn: &Connection) -> Result<()> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS sync_conflicts (
            id TEXT PRIMARY KEY,
            library_key TEXT NOT NULL REFERENCES libraries(library_key) ON DELETE CASCADE,
            object_type TEXT NOT NULL,
            key TEXT NOT NULL,
            kind TEXT NOT NULL,
            local_version INTEGER NOT NULL,
            remote_version INTEGER,
            recorded_at INTEGER NOT NULL,
            UNIQUE (library_key, object_type, key)
        )",
        "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_recorded_at ON sync_conflicts(recorded_at DESC)",
    ];
    apply(conn, 2, &statements).await
}

/// Migration to version 3: durable upload sessions
async fn migrate_v3(conn: &Connection) -> Result<()> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS upload_sessions (
            id TEXT PRIMARY KEY,
            attachment_key TEXT NOT NULL,
            library_key TEXT NOT NULL,
            user_id INTEGER NOT NULL,
            remote_url TEXT NOT NULL,
            method TEXT NOT NULL,
            local_path TEXT NOT NULL,
            upload_token TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            headers TEXT NOT NULL,
            state TEXT NOT NULL,
            claimed_by TEXT,
            claimed_at INTEGER,
            last_error TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS idx_upload_sessions_state ON upload_sessions(state, updated_at)",
        "CREATE INDEX IF NOT EXISTS idx_upload_sessions_attachment ON upload_sessions(library_key, attachment_key)",
    ];
    apply(conn, CURRENT_VERSION, &statements).await
}

//! Durable upload sessions for the background transfer queue.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use libsql::{Connection, Row};

use crate::db::{DbRequest, StoreContext};
use crate::error::{Error, Result};
use crate::models::{UploadSession, UploadState};

const SESSION_COLUMNS: &str = "id, attachment_key, library_key, user_id, remote_url, method, \
                               local_path, upload_token, content_hash, headers, state, \
                               claimed_by, claimed_at, last_error, created_at, updated_at";

fn session_from_row(row: &Row) -> Result<UploadSession> {
    let library: String = row.get(2)?;
    let local_path: String = row.get(6)?;
    let headers: String = row.get(9)?;
    let state: String = row.get(10)?;
    Ok(UploadSession {
        id: row.get(0)?,
        attachment_key: row.get(1)?,
        library: library.parse()?,
        user_id: row.get(3)?,
        remote_url: row.get(4)?,
        method: row.get(5)?,
        local_path: PathBuf::from(local_path),
        upload_token: row.get(7)?,
        content_hash: row.get(8)?,
        headers: serde_json::from_str::<BTreeMap<String, String>>(&headers)?,
        state: state.parse()?,
        claimed_by: row.get::<Option<String>>(11)?,
        claimed_at: row.get::<Option<i64>>(12)?,
        last_error: row.get::<Option<String>>(13)?,
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
    })
}

async fn load_session(conn: &Connection, id: &str) -> Result<Option<UploadSession>> {
    let mut rows = conn
        .query(
            &format!("SELECT {SESSION_COLUMNS} FROM upload_sessions WHERE id = ?"),
            [id],
        )
        .await?;
    match rows.next().await? {
        Some(row) => Ok(Some(session_from_row(&row)?)),
        None => Ok(None),
    }
}

/// Persists a new session before any transfer starts.
pub struct InsertUploadSessionRequest {
    pub session: UploadSession,
}

#[async_trait]
impl DbRequest for InsertUploadSessionRequest {
    type Output = ();

    async fn process(&self, ctx: &mut StoreContext<'_>) -> Result<()> {
        let session = &self.session;
        ctx.conn()
            .execute(
                &format!(
                    "INSERT INTO upload_sessions ({SESSION_COLUMNS})
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
                ),
                libsql::params![
                    session.id.clone(),
                    session.attachment_key.clone(),
                    session.library.as_key(),
                    session.user_id,
                    session.remote_url.clone(),
                    session.method.clone(),
                    session.local_path.to_string_lossy().into_owned(),
                    session.upload_token.clone(),
                    session.content_hash.clone(),
                    serde_json::to_string(&session.headers)?,
                    session.state.as_str(),
                    session.claimed_by.clone(),
                    session.claimed_at,
                    session.last_error.clone(),
                    session.created_at,
                    session.updated_at
                ],
            )
            .await?;
        Ok(())
    }
}

pub struct ReadUploadSessionRequest {
    pub id: String,
}

#[async_trait]
impl DbRequest for ReadUploadSessionRequest {
    type Output = Option<UploadSession>;

    async fn process(&self, ctx: &mut StoreContext<'_>) -> Result<Option<UploadSession>> {
        load_session(ctx.conn(), &self.id).await
    }
}

/// Sessions in creation order, optionally filtered by state.
pub struct ReadUploadSessionsRequest {
    pub state: Option<UploadState>,
}

#[async_trait]
impl DbRequest for ReadUploadSessionsRequest {
    type Output = Vec<UploadSession>;

    async fn process(&self, ctx: &mut StoreContext<'_>) -> Result<Vec<UploadSession>> {
        let mut rows = match self.state {
            Some(state) => {
                ctx.conn()
                    .query(
                        &format!(
                            "SELECT {SESSION_COLUMNS} FROM upload_sessions
                             WHERE state = ? ORDER BY created_at, id"
                        ),
                        [state.as_str()],
                    )
                    .await?
            }
            None => {
                ctx.conn()
                    .query(
                        &format!(
                            "SELECT {SESSION_COLUMNS} FROM upload_sessions ORDER BY created_at, id"
                        ),
                        (),
                    )
                    .await?
            }
        };
        let mut sessions = Vec::new();
        while let Some(row) = rows.next().await? {
            sessions.push(session_from_row(&row)?);
        }
        Ok(sessions)
    }
}

/// Claims runnable sessions for one worker.
///
/// Pending sessions are runnable, as are in-flight sessions whose claim is
/// older than `stale_after_ms` (their worker is presumed gone).
pub struct ClaimUploadSessionsRequest {
    pub worker: String,
    pub limit: u32,
    pub now_ms: i64,
    pub stale_after_ms: i64,
}

#[async_trait]
impl DbRequest for ClaimUploadSessionsRequest {
    type Output = Vec<UploadSession>;

    async fn process(&self, ctx: &mut StoreContext<'_>) -> Result<Vec<UploadSession>> {
        let conn = ctx.conn();
        let stale_before = self.now_ms.saturating_sub(self.stale_after_ms);
        let mut rows = conn
            .query(
                "SELECT id FROM upload_sessions
                 WHERE state = 'pending'
                    OR (state = 'in_flight' AND (claimed_at IS NULL OR claimed_at < ?))
                 ORDER BY created_at, id
                 LIMIT ?",
                libsql::params![stale_before, i64::from(self.limit)],
            )
            .await?;
        let mut ids = Vec::new();
        while let Some(row) = rows.next().await? {
            ids.push(row.get::<String>(0)?);
        }

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            conn.execute(
                "UPDATE upload_sessions
                 SET state = 'in_flight', claimed_by = ?, claimed_at = ?, updated_at = ?
                 WHERE id = ?",
                libsql::params![self.worker.clone(), self.now_ms, self.now_ms, id.clone()],
            )
            .await?;
            if let Some(session) = load_session(conn, &id).await? {
                claimed.push(session);
            }
        }
        Ok(claimed)
    }
}

/// Claims finished transfers so exactly one process finalizes each.
///
/// The state is left as reported; the claim marks the session as taken.
pub struct ClaimCompletedSessionsRequest {
    pub process: String,
    pub now_ms: i64,
}

#[async_trait]
impl DbRequest for ClaimCompletedSessionsRequest {
    type Output = Vec<UploadSession>;

    async fn process(&self, ctx: &mut StoreContext<'_>) -> Result<Vec<UploadSession>> {
        let conn = ctx.conn();
        let mut rows = conn
            .query(
                "SELECT id FROM upload_sessions
                 WHERE state IN ('succeeded', 'failed') AND claimed_by IS NULL
                 ORDER BY updated_at, id",
                (),
            )
            .await?;
        let mut ids = Vec::new();
        while let Some(row) = rows.next().await? {
            ids.push(row.get::<String>(0)?);
        }

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            conn.execute(
                "UPDATE upload_sessions SET claimed_by = ?, claimed_at = ? WHERE id = ?",
                libsql::params![self.process.clone(), self.now_ms, id.clone()],
            )
            .await?;
            if let Some(session) = load_session(conn, &id).await? {
                claimed.push(session);
            }
        }
        Ok(claimed)
    }
}

/// Claims one finished transfer by id.
pub struct ClaimCompletedSessionRequest {
    pub id: String,
    pub process: String,
    pub now_ms: i64,
}

#[async_trait]
impl DbRequest for ClaimCompletedSessionRequest {
    type Output = UploadSession;

    async fn process(&self, ctx: &mut StoreContext<'_>) -> Result<UploadSession> {
        let conn = ctx.conn();
        let claimed = conn
            .execute(
                "UPDATE upload_sessions SET claimed_by = ?, claimed_at = ?
                 WHERE id = ? AND claimed_by IS NULL AND state IN ('succeeded', 'failed')",
                libsql::params![self.process.clone(), self.now_ms, self.id.clone()],
            )
            .await?;
        if claimed == 0 {
            return Err(match load_session(conn, &self.id).await? {
                Some(session) => Error::InvalidInput(format!(
                    "upload session {} is {} and claimed by {}",
                    self.id,
                    session.state,
                    session.claimed_by.as_deref().unwrap_or("nobody")
                )),
                None => Error::NotFound(format!("upload session {}", self.id)),
            });
        }
        load_session(conn, &self.id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("upload session {}", self.id)))
    }
}

/// Moves a session to a new state, releasing its claim when it leaves
/// `in_flight`.
pub struct UpdateUploadSessionRequest {
    pub id: String,
    pub state: UploadState,
    pub last_error: Option<String>,
    pub now_ms: i64,
}

#[async_trait]
impl DbRequest for UpdateUploadSessionRequest {
    type Output = UploadSession;

    async fn process(&self, ctx: &mut StoreContext<'_>) -> Result<UploadSession> {
        let conn = ctx.conn();
        let in_flight = self.state == UploadState::InFlight;
        let updated = conn
            .execute(
                "UPDATE upload_sessions SET
                    state = ?,
                    last_error = ?,
                    claimed_by = CASE WHEN ? THEN claimed_by ELSE NULL END,
                    claimed_at = CASE WHEN ? THEN claimed_at ELSE NULL END,
                    updated_at = ?
                 WHERE id = ?",
                libsql::params![
                    self.state.as_str(),
                    self.last_error.clone(),
                    i64::from(in_flight),
                    i64::from(in_flight),
                    self.now_ms,
                    self.id.clone()
                ],
            )
            .await?;
        if updated == 0 {
            return Err(Error::NotFound(format!("upload session {}", self.id)));
        }
        load_session(conn, &self.id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("upload session {}", self.id)))
    }
}

/// Deletes a session record; returns whether it existed.
pub struct DeleteUploadSessionRequest {
    pub id: String,
}

#[async_trait]
impl DbRequest for DeleteUploadSessionRequest {
    type Output = bool;

    async fn process(&self, ctx: &mut StoreContext<'_>) -> Result<bool> {
        let deleted = ctx
            .conn()
            .execute("DELETE FROM upload_sessions WHERE id = ?", [self.id.as_str()])
            .await?;
        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::LibraryStore;
    use crate::models::LibraryIdentifier;
    use pretty_assertions::assert_eq;

    fn session(key: &str, now_ms: i64) -> UploadSession {
        UploadSession::new(
            key.to_string(),
            LibraryIdentifier::MY_LIBRARY,
            42,
            "https://uploads.example.org/bucket".to_string(),
            "POST".to_string(),
            PathBuf::from("/tmp/paper.pdf"),
            "token-1".to_string(),
            "ab".repeat(32),
            BTreeMap::from([("content-type".to_string(), "application/pdf".to_string())]),
            now_ms,
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sessions_round_trip_through_the_store() {
        let store = LibraryStore::open_in_memory().await.unwrap();
        let original = session("A1", 10);
        store
            .perform(InsertUploadSessionRequest {
                session: original.clone(),
            })
            .await
            .unwrap();

        let loaded = store
            .read(ReadUploadSessionRequest {
                id: original.id.clone(),
            })
            .await
            .unwrap();
        assert_eq!(loaded, Some(original));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn claims_skip_fresh_in_flight_sessions() {
        let store = LibraryStore::open_in_memory().await.unwrap();
        let first = session("A1", 10);
        let second = session("B2", 11);
        for session in [first.clone(), second.clone()] {
            store
                .perform(InsertUploadSessionRequest { session })
                .await
                .unwrap();
        }

        let claimed = store
            .perform(ClaimUploadSessionsRequest {
                worker: "w1".to_string(),
                limit: 1,
                now_ms: 100,
                stale_after_ms: 1_000,
            })
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, first.id);
        assert_eq!(claimed[0].state, UploadState::InFlight);
        assert_eq!(claimed[0].claimed_by.as_deref(), Some("w1"));

        let claimed = store
            .perform(ClaimUploadSessionsRequest {
                worker: "w2".to_string(),
                limit: 10,
                now_ms: 200,
                stale_after_ms: 1_000,
            })
            .await
            .unwrap();
        assert_eq!(
            claimed.iter().map(|s| s.id.clone()).collect::<Vec<_>>(),
            vec![second.id.clone()]
        );

        // w1 went away; its claim becomes stale
        let reclaimed = store
            .perform(ClaimUploadSessionsRequest {
                worker: "w3".to_string(),
                limit: 10,
                now_ms: 1_150,
                stale_after_ms: 1_000,
            })
            .await
            .unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, first.id);
        assert_eq!(reclaimed[0].claimed_by.as_deref(), Some("w3"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn finishing_a_session_releases_the_claim() {
        let store = LibraryStore::open_in_memory().await.unwrap();
        let session = session("A1", 10);
        let id = session.id.clone();
        store
            .perform(InsertUploadSessionRequest { session })
            .await
            .unwrap();
        store
            .perform(ClaimUploadSessionsRequest {
                worker: "w1".to_string(),
                limit: 1,
                now_ms: 20,
                stale_after_ms: 1_000,
            })
            .await
            .unwrap();

        let failed = store
            .perform(UpdateUploadSessionRequest {
                id: id.clone(),
                state: UploadState::Failed,
                last_error: Some("HTTP 500".to_string()),
                now_ms: 30,
            })
            .await
            .unwrap();
        assert_eq!(failed.claimed_by, None);
        assert_eq!(failed.last_error.as_deref(), Some("HTTP 500"));
        assert_eq!(failed.updated_at, 30);

        let failed_only = store
            .read(ReadUploadSessionsRequest {
                state: Some(UploadState::Failed),
            })
            .await
            .unwrap();
        assert_eq!(failed_only.len(), 1);

        assert!(store
            .perform(DeleteUploadSessionRequest { id: id.clone() })
            .await
            .unwrap());
        assert!(!store
            .perform(DeleteUploadSessionRequest { id })
            .await
            .unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn completed_sessions_are_claimed_once() {
        let store = LibraryStore::open_in_memory().await.unwrap();
        let done = session("A1", 10);
        let waiting = session("B2", 10);
        for session in [done.clone(), waiting.clone()] {
            store
                .perform(InsertUploadSessionRequest { session })
                .await
                .unwrap();
        }
        store
            .perform(UpdateUploadSessionRequest {
                id: done.id.clone(),
                state: UploadState::Succeeded,
                last_error: None,
                now_ms: 20,
            })
            .await
            .unwrap();

        let claimed = store
            .perform(ClaimCompletedSessionsRequest {
                process: "p1".to_string(),
                now_ms: 30,
            })
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, done.id);
        assert_eq!(claimed[0].state, UploadState::Succeeded);
        assert_eq!(claimed[0].claimed_by.as_deref(), Some("p1"));

        let again = store
            .perform(ClaimCompletedSessionsRequest {
                process: "p2".to_string(),
                now_ms: 40,
            })
            .await
            .unwrap();
        assert!(again.is_empty());
    }
}

//! Transactional object store with live change notifications.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use libsql::Connection;
use tokio::sync::{broadcast, Mutex};

use super::Database;
use crate::error::Result;
use crate::models::{ChangeType, LibraryIdentifier, ObjectType};

const EVENT_CAPACITY: usize = 256;

/// Emitted after a write transaction commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub library: LibraryIdentifier,
    pub object_type: ObjectType,
    pub keys: Vec<String>,
    pub origin: ChangeType,
}

/// Execution context handed to every request.
pub struct StoreContext<'a> {
    conn: &'a Connection,
    events: Vec<StoreEvent>,
}

impl<'a> StoreContext<'a> {
    pub(crate) const fn new(conn: &'a Connection) -> Self {
        Self {
            conn,
            events: Vec::new(),
        }
    }

    pub const fn conn(&self) -> &'a Connection {
        self.conn
    }

    /// Queues a change notification, published only if the transaction commits.
    pub fn notify(
        &mut self,
        library: LibraryIdentifier,
        object_type: ObjectType,
        keys: Vec<String>,
        origin: ChangeType,
    ) {
        if keys.is_empty() {
            return;
        }
        self.events.push(StoreEvent {
            library,
            object_type,
            keys,
            origin,
        });
    }

    /// Runs a nested request inside the current transaction.
    pub async fn run<R: DbRequest + ?Sized>(&mut self, request: &R) -> Result<R::Output> {
        request.process(self).await
    }

    fn into_events(self) -> Vec<StoreEvent> {
        self.events
    }
}

/// A unit of work against the store.
#[async_trait]
pub trait DbRequest: Send + Sync {
    type Output: Send;

    async fn process(&self, ctx: &mut StoreContext<'_>) -> Result<Self::Output>;
}

/// Shared handle to the local replica.
///
/// All access goes through one mutex, so at most one transaction is open per
/// process; cross-process writers serialize on the database file lock.
#[derive(Clone)]
pub struct LibraryStore {
    db: Arc<Mutex<Database>>,
    events: broadcast::Sender<StoreEvent>,
}

impl LibraryStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::from_database(Database::open(path).await?))
    }

    /// Open an in-memory store (primarily for tests).
    pub async fn open_in_memory() -> Result<Self> {
        Ok(Self::from_database(Database::open_in_memory().await?))
    }

    #[must_use]
    pub fn from_database(db: Database) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            db: Arc::new(Mutex::new(db)),
            events,
        }
    }

    /// Live change notifications for committed writes.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Runs a write request in one `BEGIN IMMEDIATE` transaction.
    pub async fn perform<R: DbRequest>(&self, request: R) -> Result<R::Output> {
        let db = self.db.lock().await;
        let conn = db.connection();
        conn.execute("BEGIN IMMEDIATE", ()).await?;

        let mut ctx = StoreContext::new(conn);
        let output = match request.process(&mut ctx).await {
            Ok(output) => output,
            Err(e) => {
                conn.execute("ROLLBACK", ()).await.ok();
                return Err(e);
            }
        };

        if let Err(e) = conn.execute("COMMIT", ()).await {
            conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }

        let events = ctx.into_events();
        drop(db);
        for event in events {
            // No subscribers is fine
            let _ = self.events.send(event);
        }
        Ok(output)
    }

    /// Runs a read-only request without opening a write transaction.
    pub async fn read<R: DbRequest>(&self, request: R) -> Result<R::Output> {
        let db = self.db.lock().await;
        let mut ctx = StoreContext::new(db.connection());
        request.process(&mut ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    struct InsertLibrary(&'static str, bool);

    #[async_trait]
    impl DbRequest for InsertLibrary {
        type Output = ();

        async fn process(&self, ctx: &mut StoreContext<'_>) -> Result<()> {
            ctx.conn()
                .execute(
                    "INSERT INTO libraries (library_key, kind, name) VALUES (?, 'group', 'Test')",
                    [self.0],
                )
                .await?;
            ctx.notify(
                LibraryIdentifier::MY_LIBRARY,
                ObjectType::Item,
                vec![self.0.to_string()],
                ChangeType::User,
            );
            if self.1 {
                return Err(Error::InvalidInput("forced failure".into()));
            }
            Ok(())
        }
    }

    struct CountLibraries;

    #[async_trait]
    impl DbRequest for CountLibraries {
        type Output = i64;

        async fn process(&self, ctx: &mut StoreContext<'_>) -> Result<i64> {
            let mut rows = ctx.conn().query("SELECT COUNT(*) FROM libraries", ()).await?;
            match rows.next().await? {
                Some(row) => Ok(row.get(0)?),
                None => Ok(0),
            }
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn perform_commits_and_publishes_events() {
        let store = LibraryStore::open_in_memory().await.unwrap();
        let mut events = store.subscribe();

        store.perform(InsertLibrary("g1", false)).await.unwrap();

        assert_eq!(store.read(CountLibraries).await.unwrap(), 1);
        let event = events.try_recv().unwrap();
        assert_eq!(event.keys, vec!["g1".to_string()]);
        assert_eq!(event.origin, ChangeType::User);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_request_rolls_back_without_events() {
        let store = LibraryStore::open_in_memory().await.unwrap();
        let mut events = store.subscribe();

        assert!(store.perform(InsertLibrary("g1", true)).await.is_err());

        assert_eq!(store.read(CountLibraries).await.unwrap(), 0);
        assert!(events.try_recv().is_err());
    }
}

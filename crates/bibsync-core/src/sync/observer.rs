//! Turns user edits in the store into debounced sync requests.

use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::request::{SyncKind, SyncRequest, SyncScope};
use super::scheduler::SchedulerHandle;
use crate::db::{LibraryStore, StoreEvent};
use crate::models::ChangeType;

/// Watches store notifications and asks for a `ChangeObserver` sync once
/// user edits have been quiet for the debounce window.
pub struct ChangeObserver;

impl ChangeObserver {
    pub fn spawn(
        store: &LibraryStore,
        scheduler: SchedulerHandle,
        debounce: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(observe(store.subscribe(), scheduler, debounce, shutdown))
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn widen(scope: Option<SyncScope>, other: SyncScope) -> SyncScope {
    match scope {
        Some(scope) => scope.union(other),
        None => other,
    }
}

async fn observe(
    mut events: broadcast::Receiver<StoreEvent>,
    scheduler: SchedulerHandle,
    debounce: Duration,
    shutdown: CancellationToken,
) {
    let mut touched: Option<SyncScope> = None;
    let mut deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            received = events.recv() => match received {
                Ok(event) if event.origin == ChangeType::User => {
                    let scope = SyncScope::Libraries([event.library].into_iter().collect());
                    touched = Some(widen(touched.take(), scope));
                    deadline = Some(Instant::now() + debounce);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Change notifications lagged; syncing everything");
                    touched = Some(SyncScope::All);
                    deadline = Some(Instant::now() + debounce);
                }
                Err(RecvError::Closed) => break,
            },
            () = wait_until(deadline) => {
                deadline = None;
                if let Some(scope) = touched.take() {
                    tracing::debug!(scope = ?scope, "Local changes settled; requesting sync");
                    scheduler.request(SyncRequest {
                        kind: SyncKind::ChangeObserver,
                        scope,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::clock::ManualClock;
    use crate::config::EngineConfig;
    use crate::db::requests::SaveObjectRequest;
    use crate::models::{Collection, LibraryIdentifier};
    use crate::sync::context::SyncContext;
    use crate::sync::controller::SyncController;
    use crate::sync::events::SyncEvent;
    use crate::sync::scheduler::SyncScheduler;
    use crate::testing::FakeApi;

    #[tokio::test(flavor = "multi_thread")]
    async fn user_edits_schedule_a_scoped_sync() {
        let store = LibraryStore::open_in_memory().await.unwrap();
        let config = EngineConfig::new("https://api.example.org", "key", 1, "/tmp/bibsync-test");
        let context = SyncContext::new(
            store.clone(),
            Arc::new(FakeApi::new()),
            config.clone(),
            Arc::new(ManualClock::new(0)),
        );
        let scheduler = SyncScheduler::spawn(Arc::new(SyncController::new(context)), &config);
        let mut events = scheduler.subscribe();
        let shutdown = CancellationToken::new();
        let observer = ChangeObserver::spawn(
            &store,
            scheduler.clone(),
            Duration::from_millis(20),
            shutdown.clone(),
        );

        for key in ["C1", "C2"] {
            store
                .perform(SaveObjectRequest {
                    object: Collection::new_local(
                        LibraryIdentifier::MY_LIBRARY,
                        key.to_string(),
                        "Draft",
                    ),
                    origin: ChangeType::User,
                })
                .await
                .unwrap();
        }

        let started = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let SyncEvent::Started { request } = events.recv().await.unwrap() {
                    return request;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(
            started,
            SyncRequest::libraries(SyncKind::ChangeObserver, [LibraryIdentifier::MY_LIBRARY])
        );

        shutdown.cancel();
        observer.await.unwrap();
        scheduler.shutdown().await;
    }
}

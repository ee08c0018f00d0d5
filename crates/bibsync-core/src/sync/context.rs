//! Collaborators shared by every stage of a sync run.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::error::{SyncError, SyncResult};
use super::events::{SyncEvent, SyncPhase};
use crate::api::SyncApi;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::db::LibraryStore;
use crate::models::LibraryIdentifier;

/// Store, API client, configuration and clock of one engine instance.
#[derive(Clone)]
pub struct SyncContext {
    pub store: LibraryStore,
    pub api: Arc<dyn SyncApi>,
    pub config: Arc<EngineConfig>,
    pub clock: Arc<dyn Clock>,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncContext {
    pub fn new(
        store: LibraryStore,
        api: Arc<dyn SyncApi>,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            store,
            api,
            config: Arc::new(config),
            clock,
            events,
        }
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: SyncEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub(crate) fn progress(&self, library: Option<LibraryIdentifier>, phase: SyncPhase) {
        tracing::debug!(library = ?library, phase = ?phase, "Sync progress");
        self.emit(SyncEvent::Progress { library, phase });
    }

    /// Runs one network step, retrying transient failures per the sync delay
    /// table. Waiting between attempts observes cancellation.
    pub(crate) async fn with_retry<T, F, Fut>(
        &self,
        token: &CancellationToken,
        label: &str,
        mut step: F,
    ) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match step().await {
                Err(error) if error.is_transient() && attempt + 1 < attempts => {
                    let delay = self.config.delays.sync.delay(attempt);
                    tracing::warn!(
                        step = label,
                        attempt = attempt + 1,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %error,
                        "Transient failure; retrying"
                    );
                    attempt += 1;
                    tokio::select! {
                        () = token.cancelled() => return Err(SyncError::Cancelled),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                result => return result,
            }
        }
    }
}

/// Cancellation checkpoint between steps.
pub(crate) fn checkpoint(token: &CancellationToken) -> SyncResult<()> {
    if token.is_cancelled() {
        return Err(SyncError::Cancelled);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{DelayIntervals, DelayTable};
    use crate::testing::FakeApi;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn context() -> SyncContext {
        let config = EngineConfig::new("https://api.example.org", "key", 1, "/tmp")
            .with_delays(DelayIntervals {
                sync: DelayTable::from_millis(&[1]),
                conflict: DelayTable::from_millis(&[1]),
            })
            .with_max_attempts(3);
        SyncContext::new(
            LibraryStore::open_in_memory().await.unwrap(),
            Arc::new(FakeApi::new()),
            config,
            Arc::new(ManualClock::new(0)),
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn transient_failures_are_retried_until_the_limit() {
        let context = context().await;
        let token = CancellationToken::new();
        let counter = AtomicUsize::new(0);
        let calls = &counter;

        let result: SyncResult<()> = context
            .with_retry(&token, "test", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SyncError::TransientNetwork("down".to_string()))
            })
            .await;
        assert!(matches!(result, Err(SyncError::TransientNetwork(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn terminal_failures_are_not_retried() {
        let context = context().await;
        let token = CancellationToken::new();
        let counter = AtomicUsize::new(0);
        let calls = &counter;

        let result: SyncResult<()> = context
            .with_retry(&token, "test", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SyncError::Remote("bad request".to_string()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}

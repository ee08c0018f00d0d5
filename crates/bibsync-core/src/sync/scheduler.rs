//! Serializes sync runs: at most one at a time, later requests coalesced.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::controller::SyncController;
use super::events::SyncEvent;
use super::request::{SyncKind, SyncRequest};
use crate::config::EngineConfig;

#[derive(Debug)]
enum Command {
    Request(SyncRequest),
    /// Cancels the run in progress and drops anything pending.
    Cancel,
}

/// Cheap handle to a running scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    commands: mpsc::UnboundedSender<Command>,
    controller: Arc<SyncController>,
    shutdown: CancellationToken,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SchedulerHandle {
    /// Queues a request. It runs now when idle, otherwise it is merged into
    /// the pending request; `Manual` and `FullResync` interrupt the current run.
    pub fn request(&self, request: SyncRequest) {
        if self.commands.send(Command::Request(request)).is_err() {
            tracing::debug!("Scheduler stopped; dropping sync request");
        }
    }

    pub fn cancel(&self) {
        if self.commands.send(Command::Cancel).is_err() {
            tracing::debug!("Scheduler stopped; nothing to cancel");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.controller.subscribe()
    }

    /// Cancels any run and waits for the scheduler task to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        join(&self.task).await;
    }
}

async fn join(task: &Mutex<Option<JoinHandle<()>>>) {
    let handle = task.lock().await.take();
    if let Some(handle) = handle {
        if let Err(error) = handle.await {
            tracing::error!(error = %error, "Scheduler task failed");
        }
    }
}

pub struct SyncScheduler;

impl SyncScheduler {
    /// Starts the scheduler loop on the current runtime.
    pub fn spawn(controller: Arc<SyncController>, config: &EngineConfig) -> SchedulerHandle {
        let (commands, receiver) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run_loop(
            Arc::clone(&controller),
            receiver,
            shutdown.clone(),
            config.background_interval(),
        ));
        SchedulerHandle {
            commands,
            controller,
            shutdown,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }
}

fn merge(pending: Option<SyncRequest>, request: SyncRequest) -> SyncRequest {
    match pending {
        Some(pending) => pending.merge(request),
        None => request,
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn run_loop(
    controller: Arc<SyncController>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    shutdown: CancellationToken,
    background: Option<Duration>,
) {
    let mut ticker = background.map(|period| {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick would fire immediately
        ticker.reset();
        ticker
    });
    let mut pending: Option<SyncRequest> = None;
    let mut running: Option<(SyncRequest, CancellationToken)> = None;
    let mut runs = JoinSet::new();

    loop {
        if runs.is_empty() {
            if let Some(request) = pending.take() {
                let token = shutdown.child_token();
                running = Some((request.clone(), token.clone()));
                let controller = Arc::clone(&controller);
                runs.spawn(async move { controller.run(&request, &token).await });
            }
        }

        tokio::select! {
            () = shutdown.cancelled() => break,
            command = commands.recv() => match command {
                Some(Command::Request(request)) => match &running {
                    Some((current, token)) if request.kind.preempts() => {
                        tracing::info!(kind = ?request.kind, "Interrupting current sync");
                        token.cancel();
                        pending = Some(merge(pending.take(), current.clone()).merge(request));
                    }
                    _ => pending = Some(merge(pending.take(), request)),
                },
                Some(Command::Cancel) => {
                    if let Some((_, token)) = &running {
                        token.cancel();
                    }
                    pending = None;
                }
                None => break,
            },
            Some(joined) = runs.join_next(), if !runs.is_empty() => {
                running = None;
                if let Err(error) = joined {
                    tracing::error!(error = %error, "Sync task failed");
                }
            }
            () = next_tick(&mut ticker) => {
                pending = Some(merge(pending.take(), SyncRequest::all(SyncKind::Background)));
            }
        }
    }

    if let Some((_, token)) = &running {
        if shutdown.is_cancelled() {
            token.cancel();
        }
    }
    while runs.join_next().await.is_some() {}
    tracing::debug!("Scheduler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{DelayIntervals, DelayTable};
    use crate::db::LibraryStore;
    use crate::sync::context::SyncContext;
    use crate::testing::FakeApi;
    use tokio::sync::Semaphore;

    async fn scheduler(api: FakeApi) -> SchedulerHandle {
        let config = EngineConfig::new("https://api.example.org", "key", 1, "/tmp/bibsync-test")
            .with_delays(DelayIntervals {
                sync: DelayTable::from_millis(&[1]),
                conflict: DelayTable::from_millis(&[1]),
            });
        let context = SyncContext::new(
            LibraryStore::open_in_memory().await.unwrap(),
            Arc::new(api),
            config.clone(),
            Arc::new(ManualClock::new(0)),
        );
        SyncScheduler::spawn(Arc::new(SyncController::new(context)), &config)
    }

    async fn next_matching(
        events: &mut broadcast::Receiver<SyncEvent>,
        predicate: impl Fn(&SyncEvent) -> bool,
    ) -> SyncEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = events.recv().await.unwrap();
                if predicate(&event) {
                    return event;
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn request_runs_to_completion() {
        let handle = scheduler(FakeApi::new()).await;
        let mut events = handle.subscribe();

        handle.request(SyncRequest::all(SyncKind::Manual));
        let event = next_matching(&mut events, SyncEvent::is_terminal).await;
        assert!(matches!(event, SyncEvent::Finished { .. }));
        handle.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn requests_during_a_run_coalesce_into_one_more_run() {
        let gate = Arc::new(Semaphore::new(0));
        let handle = scheduler(FakeApi::gated(Arc::clone(&gate))).await;
        let mut events = handle.subscribe();

        handle.request(SyncRequest::all(SyncKind::Background));
        next_matching(&mut events, |event| matches!(event, SyncEvent::Started { .. })).await;

        handle.request(SyncRequest::all(SyncKind::ChangeObserver));
        handle.request(SyncRequest::all(SyncKind::Background));
        handle.request(SyncRequest::all(SyncKind::ChangeObserver));
        gate.add_permits(10);

        next_matching(&mut events, SyncEvent::is_terminal).await;
        let second = next_matching(&mut events, |event| matches!(event, SyncEvent::Started { .. })).await;
        let SyncEvent::Started { request } = second else {
            unreachable!();
        };
        assert_eq!(request.kind, SyncKind::ChangeObserver);
        next_matching(&mut events, SyncEvent::is_terminal).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut extra_runs = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SyncEvent::Started { .. }) {
                extra_runs += 1;
            }
        }
        assert_eq!(extra_runs, 0);
        handle.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn manual_request_interrupts_a_running_sync() {
        let gate = Arc::new(Semaphore::new(0));
        let handle = scheduler(FakeApi::gated(Arc::clone(&gate))).await;
        let mut events = handle.subscribe();

        handle.request(SyncRequest::all(SyncKind::Background));
        next_matching(&mut events, |event| matches!(event, SyncEvent::Started { .. })).await;

        handle.request(SyncRequest::all(SyncKind::Manual));
        gate.add_permits(10);

        let first = next_matching(&mut events, SyncEvent::is_terminal).await;
        assert!(matches!(first, SyncEvent::Aborted { .. }));
        let second = next_matching(&mut events, |event| matches!(event, SyncEvent::Started { .. })).await;
        let SyncEvent::Started { request } = second else {
            unreachable!();
        };
        assert_eq!(request.kind, SyncKind::Manual);
        let last = next_matching(&mut events, SyncEvent::is_terminal).await;
        assert!(matches!(last, SyncEvent::Finished { .. }));
        handle.shutdown().await;
    }
}

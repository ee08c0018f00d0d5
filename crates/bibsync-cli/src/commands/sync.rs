use bibsync_core::sync::{
    ChangeObserver, SyncEvent, SyncKind, SyncOutcome, SyncRequest, SyncScheduler,
};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::commands::common::{parse_libraries, Engine};
use crate::error::CliError;

pub fn build_request(full: bool, libraries: &[String]) -> Result<SyncRequest, CliError> {
    let kind = if full {
        SyncKind::FullResync
    } else {
        SyncKind::Manual
    };
    let libraries = parse_libraries(libraries)?;
    if libraries.is_empty() {
        Ok(SyncRequest::all(kind))
    } else {
        Ok(SyncRequest::libraries(kind, libraries))
    }
}

pub fn format_outcome(outcome: &SyncOutcome) -> Vec<String> {
    let mut lines = vec![format!(
        "Synced {} librar{}: {} pulled, {} pushed, {} conflict{}",
        outcome.libraries.len(),
        if outcome.libraries.len() == 1 { "y" } else { "ies" },
        outcome.pulled,
        outcome.pushed,
        outcome.conflicts,
        if outcome.conflicts == 1 { "" } else { "s" },
    )];
    lines.extend(outcome.errors.iter().map(|error| format!("  warning: {error}")));
    lines
}

fn print_outcome(outcome: &SyncOutcome, as_json: bool) -> Result<(), CliError> {
    if as_json {
        println!("{}", serde_json::to_string_pretty(outcome)?);
    } else {
        for line in format_outcome(outcome) {
            println!("{line}");
        }
    }
    Ok(())
}

pub async fn run_sync(
    engine: Engine,
    full: bool,
    libraries: &[String],
    watch: bool,
    as_json: bool,
) -> Result<(), CliError> {
    let request = build_request(full, libraries)?;
    if watch {
        return run_watch(engine, request, as_json).await;
    }

    let token = CancellationToken::new();
    let interrupt = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let outcome = engine.controller.run(&request, &token).await?;
    print_outcome(&outcome, as_json)
}

async fn run_watch(engine: Engine, request: SyncRequest, as_json: bool) -> Result<(), CliError> {
    let config = engine.config().clone();
    let scheduler = SyncScheduler::spawn(engine.controller.clone(), &config);
    let mut events = scheduler.subscribe();
    let shutdown = CancellationToken::new();
    let observer = ChangeObserver::spawn(
        &engine.store,
        scheduler.clone(),
        config.debounce(),
        shutdown.clone(),
    );

    scheduler.request(request);
    eprintln!("Watching for changes. Press Ctrl-C to stop.");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            received = events.recv() => match received {
                Ok(SyncEvent::Finished { outcome }) => print_outcome(&outcome, as_json)?,
                Ok(SyncEvent::Aborted { reason }) => eprintln!("Sync aborted: {reason}"),
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
        }
    }

    shutdown.cancel();
    scheduler.shutdown().await;
    if let Err(error) = observer.await {
        tracing::warn!(error = %error, "Change observer task failed");
    }
    Ok(())
}

use bibsync_core::models::UploadState;
use bibsync_core::upload::{HttpTransferWorker, UploadStatus};
use tokio_util::sync::CancellationToken;

use crate::cli::{TransferCommands, TransferStateFilter};
use crate::commands::common::{format_session_lines, Engine};
use crate::error::CliError;

pub const fn upload_state(filter: TransferStateFilter) -> UploadState {
    match filter {
        TransferStateFilter::Pending => UploadState::Pending,
        TransferStateFilter::InFlight => UploadState::InFlight,
        TransferStateFilter::Succeeded => UploadState::Succeeded,
        TransferStateFilter::Failed => UploadState::Failed,
    }
}

pub async fn run_transfers(engine: &Engine, command: TransferCommands) -> Result<(), CliError> {
    match command {
        TransferCommands::Run { limit } => run_worker(engine, limit).await,
        TransferCommands::Finalize { id } => run_finalize(engine, id.as_deref()).await,
        TransferCommands::List { state, json } => {
            run_list(engine, state.map(upload_state), json).await
        }
    }
}

async fn run_worker(engine: &Engine, limit: u32) -> Result<(), CliError> {
    let worker = HttpTransferWorker::new(engine.queue.clone())?;
    let succeeded = worker.run_once(limit).await?;
    println!("{succeeded} transfer(s) finished");

    // Register right away instead of waiting for the next sync
    let finalized = engine.uploader.resume(&CancellationToken::new()).await?;
    if finalized > 0 {
        println!("{finalized} transfer(s) finalized");
    }
    Ok(())
}

async fn run_finalize(engine: &Engine, id: Option<&str>) -> Result<(), CliError> {
    let token = CancellationToken::new();
    let Some(id) = id else {
        let finalized = engine.uploader.resume(&token).await?;
        println!("{finalized} transfer(s) finalized");
        return Ok(());
    };

    match engine.uploader.finalize_by_id(id, &token).await? {
        UploadStatus::Registered => println!("Upload registered."),
        UploadStatus::AlreadyOnServer => println!("The server already holds this file."),
        UploadStatus::Enqueued { session_id } => {
            println!("Transfer failed; re-queued as {session_id}.");
        }
    }
    Ok(())
}

async fn run_list(
    engine: &Engine,
    state: Option<UploadState>,
    as_json: bool,
) -> Result<(), CliError> {
    let sessions = engine.queue.list(state).await?;
    if as_json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
        return Ok(());
    }
    if sessions.is_empty() {
        println!("No transfers.");
        return Ok(());
    }
    for line in format_session_lines(&sessions) {
        println!("{line}");
    }
    Ok(())
}

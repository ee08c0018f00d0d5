//! Upload side of a sync run: local edits and tombstones.

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::context::{checkpoint, SyncContext};
use super::error::{SyncError, SyncResult};
use super::events::{SyncOutcome, SyncPhase};
use super::pull::{absorb, pull_type};
use super::resolver::ConflictPolicy;
use crate::api::WriteResult;
use crate::db::requests::{
    MarkPushedRequest, PushedObject, ReadLibraryVersionRequest, ReadObjectRequest,
    ReadPushQueueRequest, RecordFailuresRequest, RemoveObjectsRequest, SetVersionRequest,
    VersionSlot,
};
use crate::models::{Collection, Item, LibraryIdentifier, ObjectType, Search, Syncable};

/// Pushes every object type of one writable library.
pub(crate) async fn push_library(
    ctx: &SyncContext,
    library: LibraryIdentifier,
    token: &CancellationToken,
    outcome: &mut SyncOutcome,
) -> SyncResult<()> {
    for object_type in ObjectType::SYNC_ORDER {
        checkpoint(token)?;
        let result = match object_type {
            ObjectType::Collection => push_type::<Collection>(ctx, library, token, outcome).await,
            ObjectType::Search => push_type::<Search>(ctx, library, token, outcome).await,
            ObjectType::Item => push_type::<Item>(ctx, library, token, outcome).await,
        };
        absorb(outcome, result)?;
    }
    Ok(())
}

/// Pushes the queue of one type. A version conflict triggers one pull of
/// that type followed by one more push attempt.
pub(crate) async fn push_type<T: Syncable>(
    ctx: &SyncContext,
    library: LibraryIdentifier,
    token: &CancellationToken,
    outcome: &mut SyncOutcome,
) -> SyncResult<()> {
    match push_queue::<T>(ctx, library, token, outcome).await {
        Err(SyncError::VersionConflict { .. }) => {
            resolve_version_conflict::<T>(ctx, library, token, outcome).await?;
            push_queue::<T>(ctx, library, token, outcome).await
        }
        other => other,
    }
}

/// Pushes one object right away and returns its acknowledged version.
pub async fn push_single<T: Syncable>(
    ctx: &SyncContext,
    library: LibraryIdentifier,
    key: &str,
    token: &CancellationToken,
) -> SyncResult<i64> {
    let mut outcome = SyncOutcome::default();
    let mut retried = false;
    loop {
        let object = ctx
            .store
            .read(ReadObjectRequest::<T>::new(library, key))
            .await?
            .ok_or_else(|| SyncError::ObjectNotFound(key.to_string()))?;
        if !object.meta().needs_push() {
            return Ok(object.meta().version);
        }
        if object.meta().deleted {
            return Err(SyncError::ObjectNotFound(key.to_string()));
        }

        match submit_batch(ctx, library, std::slice::from_ref(&object), token, &mut outcome).await {
            Err(SyncError::VersionConflict { .. }) if !retried => {
                retried = true;
                resolve_version_conflict::<T>(ctx, library, token, &mut outcome).await?;
            }
            Err(error) => return Err(error),
            Ok(()) if !outcome.errors.is_empty() => {
                return Err(SyncError::Remote(outcome.errors.join("; ")));
            }
            Ok(()) => {
                let object = ctx
                    .store
                    .read(ReadObjectRequest::<T>::new(library, key))
                    .await?
                    .ok_or_else(|| SyncError::ObjectNotFound(key.to_string()))?;
                return Ok(object.meta().version);
            }
        }
    }
}

async fn resolve_version_conflict<T: Syncable>(
    ctx: &SyncContext,
    library: LibraryIdentifier,
    token: &CancellationToken,
    outcome: &mut SyncOutcome,
) -> SyncResult<()> {
    let delay = ctx.config.delays.conflict.delay(0);
    tracing::info!(
        library = %library,
        object_type = %T::OBJECT_TYPE,
        "Library changed remotely; pulling before retrying push"
    );
    tokio::select! {
        () = token.cancelled() => return Err(SyncError::Cancelled),
        () = tokio::time::sleep(delay) => {}
    }
    pull_type::<T>(
        ctx,
        library,
        ConflictPolicy::PreferLocalIfConflicting,
        false,
        token,
        outcome,
    )
    .await
}

async fn push_queue<T: Syncable>(
    ctx: &SyncContext,
    library: LibraryIdentifier,
    token: &CancellationToken,
    outcome: &mut SyncOutcome,
) -> SyncResult<()> {
    let queue = ctx
        .store
        .read(ReadPushQueueRequest::<T>::new(library))
        .await?;
    if queue.is_empty() {
        return Ok(());
    }
    ctx.progress(Some(library), SyncPhase::PushingLocalChanges);

    let (tombstones, updates): (Vec<T>, Vec<T>) =
        queue.into_iter().partition(|object| object.meta().deleted);
    let batch_size = ctx.config.batch_size.max(1);

    for batch in updates.chunks(batch_size) {
        checkpoint(token)?;
        submit_batch(ctx, library, batch, token, outcome).await?;
    }
    for batch in tombstones.chunks(batch_size) {
        checkpoint(token)?;
        delete_batch(ctx, library, batch, token, outcome).await?;
    }
    Ok(())
}

async fn submit_batch<T: Syncable>(
    ctx: &SyncContext,
    library: LibraryIdentifier,
    objects: &[T],
    token: &CancellationToken,
    outcome: &mut SyncOutcome,
) -> SyncResult<()> {
    let object_type = T::OBJECT_TYPE;
    let params: Vec<Value> = objects.iter().map(Syncable::update_params).collect();
    let since = ctx
        .store
        .read(ReadLibraryVersionRequest { library })
        .await?;

    let api = &ctx.api;
    let sent: &[Value] = &params;
    let write = ctx
        .with_retry(token, "submit", || async move {
            api.submit(library, object_type, sent, since)
                .await
                .map_err(|error| SyncError::from_api(error, library, object_type))
        })
        .await?;
    record_write::<T>(ctx, library, objects, &params, write, outcome).await
}

/// Stores the per-object outcome of one submission.
///
/// Per-object 412 failures surface as a version conflict once the rest of
/// the batch is recorded.
async fn record_write<T: Syncable>(
    ctx: &SyncContext,
    library: LibraryIdentifier,
    objects: &[T],
    params: &[Value],
    write: WriteResult,
    outcome: &mut SyncOutcome,
) -> SyncResult<()> {
    let mut pushed = Vec::new();
    for (index, key, version) in write.successful {
        if let Some(sent) = params.get(index) {
            pushed.push(PushedObject {
                key,
                params: sent.clone(),
                version,
            });
        }
    }
    for (index, key) in write.unchanged {
        if let Some(sent) = params.get(index) {
            let version = sent
                .get("version")
                .and_then(Value::as_i64)
                .unwrap_or(write.last_modified_version);
            pushed.push(PushedObject {
                key,
                params: sent.clone(),
                version,
            });
        }
    }

    let mut failed = Vec::new();
    let mut precondition_failed = false;
    for failure in write.failed {
        let key = failure
            .key
            .clone()
            .or_else(|| objects.get(failure.index).map(|object| object.key().to_string()));
        tracing::warn!(
            library = %library,
            object_type = %T::OBJECT_TYPE,
            key = ?key,
            code = failure.code,
            message = %failure.message,
            "Server rejected object"
        );
        precondition_failed |= failure.code == 412;
        outcome.errors.push(format!(
            "{}: {} {}",
            key.as_deref().unwrap_or("?"),
            failure.code,
            failure.message
        ));
        if let Some(key) = key {
            failed.push(key);
        }
    }

    let synced = ctx
        .store
        .perform(MarkPushedRequest::<T>::new(
            library,
            pushed,
            Some(write.last_modified_version),
        ))
        .await?;
    outcome.pushed += synced.len();

    if !failed.is_empty() {
        ctx.store
            .perform(RecordFailuresRequest {
                library,
                object_type: T::OBJECT_TYPE,
                keys: failed,
                now_ms: ctx.now_ms(),
            })
            .await?;
    }
    if precondition_failed {
        return Err(SyncError::VersionConflict {
            library,
            object_type: T::OBJECT_TYPE,
        });
    }
    Ok(())
}

async fn delete_batch<T: Syncable>(
    ctx: &SyncContext,
    library: LibraryIdentifier,
    objects: &[T],
    token: &CancellationToken,
    outcome: &mut SyncOutcome,
) -> SyncResult<()> {
    let object_type = T::OBJECT_TYPE;
    let keys: Vec<String> = objects.iter().map(|object| object.key().to_string()).collect();
    let since = ctx
        .store
        .read(ReadLibraryVersionRequest { library })
        .await?;

    let api = &ctx.api;
    let sent: &[String] = &keys;
    let version = ctx
        .with_retry(token, "delete", || async move {
            api.delete(library, object_type, sent, since)
                .await
                .map_err(|error| SyncError::from_api(error, library, object_type))
        })
        .await?;

    let count = keys.len();
    ctx.store
        .perform(RemoveObjectsRequest {
            library,
            object_type,
            keys,
        })
        .await?;
    ctx.store
        .perform(SetVersionRequest {
            library,
            slot: VersionSlot::Objects(object_type),
            version,
            now_ms: ctx.now_ms(),
        })
        .await?;
    tracing::info!(library = %library, object_type = %object_type, count, "Pushed deletions");
    outcome.pushed += count;
    Ok(())
}

//! Download side of a sync run: libraries, versions, objects and deletions.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde_json::Value;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::context::{checkpoint, SyncContext};
use super::diff::{diff, diff_groups, resync_candidates};
use super::error::{SyncError, SyncResult};
use super::events::{SyncOutcome, SyncPhase};
use super::request::SyncRequest;
use super::resolver::ConflictPolicy;
use super::tracker::MarkForResyncRequest;
use crate::api::Fetched;
use crate::db::requests::{
    ApplyRemoteDeletionsRequest, DeleteGroupRequest, EnsureLibraryRequest,
    ReadConflictKeysRequest, ReadLibrariesRequest, ReadLocalVersionsRequest, ReadVersionRequest,
    RecordFailuresRequest, SetVersionRequest, StoreGroupRequest, StoreRemoteObjectsRequest,
    VersionSlot,
};
use crate::models::{
    Collection, Item, Library, LibraryIdentifier, ObjectType, Search, Syncable,
};

/// Folds a non-fatal step failure into the outcome; fatal ones propagate.
pub(crate) fn absorb(outcome: &mut SyncOutcome, result: SyncResult<()>) -> SyncResult<()> {
    match result {
        Ok(()) => Ok(()),
        Err(error) if error.is_fatal() => Err(error),
        Err(error) => {
            tracing::warn!(error = %error, "Sync step failed; continuing");
            outcome.errors.push(error.to_string());
            Ok(())
        }
    }
}

/// Brings the local library list in line with the accessible groups and
/// returns the libraries the request covers.
pub(crate) async fn resolve_libraries(
    ctx: &SyncContext,
    request: &SyncRequest,
    token: &CancellationToken,
    outcome: &mut SyncOutcome,
) -> SyncResult<Vec<Library>> {
    ctx.progress(None, SyncPhase::ResolvingLibraries);
    ctx.store
        .perform(EnsureLibraryRequest {
            identifier: LibraryIdentifier::MY_LIBRARY,
        })
        .await?;

    let api = &ctx.api;
    let manifest = ctx
        .with_retry(token, "group versions", || async move {
            api.group_versions().await.map_err(SyncError::from)
        })
        .await?;
    let local = ctx.store.read(ReadLibrariesRequest).await?;
    let groups = diff_groups(&manifest, &local, request.force_all());

    for group_id in groups.fetch {
        checkpoint(token)?;
        let fetched = ctx
            .with_retry(token, "group", || async move {
                api.group(group_id).await.map_err(SyncError::from)
            })
            .await;
        match fetched {
            Ok(group) => {
                let library = group.into_library(ctx.config.user_id);
                tracing::info!(library = %library.identifier, name = %library.name, "Refreshed group");
                ctx.store.perform(StoreGroupRequest { library }).await?;
            }
            Err(error) => absorb(outcome, Err(error))?,
        }
    }

    for identifier in groups.remove {
        checkpoint(token)?;
        ctx.store.perform(DeleteGroupRequest { identifier }).await?;
    }

    let libraries = ctx.store.read(ReadLibrariesRequest).await?;
    Ok(libraries
        .into_iter()
        .filter(|library| request.scope.includes(library.identifier))
        .collect())
}

/// Pulls every object type of one library, then its deletions.
pub(crate) async fn pull_library(
    ctx: &SyncContext,
    library: LibraryIdentifier,
    request: &SyncRequest,
    token: &CancellationToken,
    outcome: &mut SyncOutcome,
) -> SyncResult<()> {
    let policy = request.policy();
    let force_all = request.force_all();
    for object_type in ObjectType::SYNC_ORDER {
        checkpoint(token)?;
        let result = match object_type {
            ObjectType::Collection => {
                pull_type::<Collection>(ctx, library, policy, force_all, token, outcome).await
            }
            ObjectType::Search => {
                pull_type::<Search>(ctx, library, policy, force_all, token, outcome).await
            }
            ObjectType::Item => {
                pull_type::<Item>(ctx, library, policy, force_all, token, outcome).await
            }
        };
        absorb(outcome, result)?;
    }

    checkpoint(token)?;
    let result = pull_deletions(ctx, library, policy, force_all, token, outcome).await;
    absorb(outcome, result)
}

/// Fetches and applies changed objects of one type.
///
/// The version slot only advances when every requested object was applied
/// or queued as a conflict.
pub(crate) async fn pull_type<T: Syncable>(
    ctx: &SyncContext,
    library: LibraryIdentifier,
    policy: ConflictPolicy,
    force_all: bool,
    token: &CancellationToken,
    outcome: &mut SyncOutcome,
) -> SyncResult<()> {
    let object_type = T::OBJECT_TYPE;
    let slot = VersionSlot::Objects(object_type);
    let since = if force_all {
        0
    } else {
        ctx.store.read(ReadVersionRequest { library, slot }).await?
    };

    ctx.progress(Some(library), SyncPhase::FetchingVersions(object_type));
    let api = &ctx.api;
    let fetched = ctx
        .with_retry(token, "versions", || async move {
            api.versions(library, object_type, since)
                .await
                .map_err(SyncError::from)
        })
        .await?;
    let (manifest, target_version) = match fetched {
        Fetched::Unchanged => (BTreeMap::new(), None),
        Fetched::Changed(manifest) => (manifest.versions, Some(manifest.last_modified_version)),
    };

    let local = ctx
        .store
        .read(ReadLocalVersionsRequest {
            library,
            object_type,
        })
        .await?;
    let mut keys = diff(&manifest, &local, force_all);
    let mut queued: BTreeSet<String> = keys.iter().cloned().collect();
    for key in resync_candidates(&local, ctx.now_ms(), &ctx.config.delays.sync) {
        if queued.insert(key.clone()) {
            keys.push(key);
        }
    }
    if policy == ConflictPolicy::PreferLocalIfConflicting {
        let open = ctx
            .store
            .read(ReadConflictKeysRequest {
                library,
                object_type,
            })
            .await?;
        keys.retain(|key| !open.contains(key));
    }

    tracing::debug!(
        library = %library,
        object_type = %object_type,
        since,
        count = keys.len(),
        "Objects to fetch"
    );
    checkpoint(token)?;
    let failures = fetch_and_apply::<T>(ctx, library, keys, policy, token, outcome).await?;

    match target_version {
        Some(version) if failures == 0 => {
            ctx.store
                .perform(SetVersionRequest {
                    library,
                    slot,
                    version,
                    now_ms: ctx.now_ms(),
                })
                .await?;
        }
        Some(_) => tracing::warn!(
            library = %library,
            object_type = %object_type,
            failures,
            "Keeping version slot; some objects were not applied"
        ),
        None => {}
    }
    Ok(())
}

/// Fetches `keys` in batches, at most `fetch_concurrency` in flight, and
/// applies each batch as it arrives. Returns the number of keys that failed.
async fn fetch_and_apply<T: Syncable>(
    ctx: &SyncContext,
    library: LibraryIdentifier,
    keys: Vec<String>,
    policy: ConflictPolicy,
    token: &CancellationToken,
    outcome: &mut SyncOutcome,
) -> SyncResult<usize> {
    if keys.is_empty() {
        return Ok(0);
    }
    ctx.progress(Some(library), SyncPhase::FetchingObjects(T::OBJECT_TYPE));

    let mut batches: VecDeque<Vec<String>> = keys
        .chunks(ctx.config.batch_size.max(1))
        .map(<[String]>::to_vec)
        .collect();
    let concurrency = ctx.config.fetch_concurrency.max(1);
    let mut tasks = JoinSet::new();
    let mut failures = 0;

    loop {
        while tasks.len() < concurrency && !token.is_cancelled() {
            let Some(batch) = batches.pop_front() else {
                break;
            };
            let task_ctx = ctx.clone();
            let task_token = token.clone();
            tasks.spawn(async move {
                let api = &task_ctx.api;
                let keys: &[String] = &batch;
                let result = task_ctx
                    .with_retry(&task_token, "fetch objects", || async move {
                        api.fetch_objects(library, T::OBJECT_TYPE, keys)
                            .await
                            .map_err(SyncError::from)
                    })
                    .await;
                (batch, result)
            });
        }

        let Some(joined) = tasks.join_next().await else {
            break;
        };
        let (batch, result) =
            joined.map_err(|error| SyncError::Remote(format!("fetch task failed: {error}")))?;

        if token.is_cancelled() {
            // In-flight batches finish but their results are dropped.
            while tasks.join_next().await.is_some() {}
            return Err(SyncError::Cancelled);
        }

        match result {
            Ok(values) => {
                failures += apply_batch::<T>(ctx, library, &batch, values, policy, outcome).await?;
            }
            Err(error) if error.is_fatal() => {
                while tasks.join_next().await.is_some() {}
                return Err(error);
            }
            Err(error) => {
                tracing::warn!(
                    library = %library,
                    object_type = %T::OBJECT_TYPE,
                    count = batch.len(),
                    error = %error,
                    "Fetch batch failed"
                );
                outcome.errors.push(error.to_string());
                failures += batch.len();
                mark_failed(ctx, library, T::OBJECT_TYPE, batch).await?;
            }
        }
    }

    checkpoint(token)?;
    Ok(failures)
}

/// Parses and stores one fetched batch. Returns the number of failed keys.
async fn apply_batch<T: Syncable>(
    ctx: &SyncContext,
    library: LibraryIdentifier,
    requested: &[String],
    values: Vec<Value>,
    policy: ConflictPolicy,
    outcome: &mut SyncOutcome,
) -> SyncResult<usize> {
    let mut remotes = Vec::with_capacity(values.len());
    let mut returned = BTreeSet::new();
    let mut failed = Vec::new();

    for value in values {
        let key = value.get("key").and_then(Value::as_str).map(str::to_string);
        match serde_json::from_value::<T::Remote>(value) {
            Ok(remote) => {
                returned.insert(T::remote_key(&remote).to_string());
                remotes.push(remote);
            }
            Err(error) => {
                let error = match key {
                    Some(key) => {
                        returned.insert(key.clone());
                        let message = format!("{key}: {error}");
                        failed.push(key);
                        SyncError::Remote(message)
                    }
                    None => SyncError::PrimaryKeyUnavailable(error.to_string()),
                };
                tracing::warn!(library = %library, error = %error, "Skipping unparseable object");
                outcome.errors.push(error.to_string());
            }
        }
    }

    for key in requested {
        if !returned.contains(key) {
            let error = SyncError::ObjectNotFound(key.clone());
            tracing::warn!(library = %library, error = %error, "Requested object was not returned");
            outcome.errors.push(error.to_string());
            failed.push(key.clone());
        }
    }

    ctx.progress(Some(library), SyncPhase::ApplyingConflicts);
    let report = ctx
        .store
        .perform(StoreRemoteObjectsRequest::<T> {
            library,
            remotes,
            policy,
            now_ms: ctx.now_ms(),
        })
        .await?;
    outcome.pulled += report.applied();
    outcome.conflicts += report.conflicts.len();

    let count = failed.len();
    if !failed.is_empty() {
        mark_failed(ctx, library, T::OBJECT_TYPE, failed).await?;
    }
    Ok(count)
}

/// Flags keys for a later re-fetch and counts the failed attempt.
async fn mark_failed(
    ctx: &SyncContext,
    library: LibraryIdentifier,
    object_type: ObjectType,
    keys: Vec<String>,
) -> SyncResult<()> {
    let now_ms = ctx.now_ms();
    let touched: BTreeSet<String> = ctx
        .store
        .perform(MarkForResyncRequest {
            library,
            object_type,
            keys: keys.clone(),
            now_ms,
        })
        .await?
        .into_iter()
        .collect();
    let rest: Vec<String> = keys
        .into_iter()
        .filter(|key| !touched.contains(key))
        .collect();
    if !rest.is_empty() {
        ctx.store
            .perform(RecordFailuresRequest {
                library,
                object_type,
                keys: rest,
                now_ms,
            })
            .await?;
    }
    Ok(())
}

/// Applies the remote deletion log, children before containers.
async fn pull_deletions(
    ctx: &SyncContext,
    library: LibraryIdentifier,
    policy: ConflictPolicy,
    force_all: bool,
    token: &CancellationToken,
    outcome: &mut SyncOutcome,
) -> SyncResult<()> {
    let since = if force_all {
        0
    } else {
        ctx.store
            .read(ReadVersionRequest {
                library,
                slot: VersionSlot::Deletions,
            })
            .await?
    };

    let api = &ctx.api;
    let fetched = ctx
        .with_retry(token, "deletions", || async move {
            api.deletions(library, since).await.map_err(SyncError::from)
        })
        .await?;
    let Fetched::Changed(deletions) = fetched else {
        return Ok(());
    };

    for object_type in ObjectType::SYNC_ORDER.into_iter().rev() {
        let keys = deletions.keys(object_type).to_vec();
        if keys.is_empty() {
            continue;
        }
        let report = ctx
            .store
            .perform(ApplyRemoteDeletionsRequest {
                library,
                object_type,
                keys,
                policy,
                now_ms: ctx.now_ms(),
            })
            .await?;
        if !report.removed.is_empty() {
            tracing::info!(
                library = %library,
                object_type = %object_type,
                count = report.removed.len(),
                "Applied remote deletions"
            );
        }
        outcome.conflicts += report.conflicts.len();
    }

    ctx.store
        .perform(SetVersionRequest {
            library,
            slot: VersionSlot::Deletions,
            version: deletions.last_modified_version,
            now_ms: ctx.now_ms(),
        })
        .await?;
    Ok(())
}

//! Attachment import: place the file, create metadata, push it, authorize
//! the upload and hand the transfer off.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::error::{UploadError, UploadResult};
use super::files::{AttachmentFiles, PlaceMode, PlacedFile};
use super::transfer::BackgroundTransfer;
use crate::api::{UploadAuthorization, UploadRequest};
use crate::db::requests::{
    DeleteObjectRequest, EditObjectRequest, EnsureLibraryRequest, ReadObjectRequest,
    SaveObjectRequest,
};
use crate::db::{DbRequest, StoreContext};
use crate::error::Result;
use crate::models::{
    AttachmentState, ChangeType, Creator, Item, ItemChanges, LibraryIdentifier, ObjectType,
    Tag, UploadSession, UploadState, ATTACHMENT_TYPE,
};
use crate::sync::{push_single, SyncContext, SyncError, SyncResult};
use crate::util::generate_key;

/// Metadata produced by a web translator for a downloaded file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranslatedItem {
    pub item_type: String,
    pub fields: Vec<(String, String)>,
    pub creators: Vec<Creator>,
    pub tags: Vec<Tag>,
}

/// Where an attachment's bytes stand after import or finalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadStatus {
    /// The server already held identical bytes.
    AlreadyOnServer,
    /// A background transfer owns the upload now.
    Enqueued { session_id: String },
    /// The transfer finished and was registered.
    Registered,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedAttachment {
    pub attachment: Item,
    /// Parent created from translated metadata, if any.
    pub parent: Option<Item>,
    pub status: UploadStatus,
}

fn transfer_failure(session: &UploadSession) -> UploadError {
    if session.authorization_expired() {
        return UploadError::AuthorizationExpired {
            key: session.attachment_key.clone(),
        };
    }
    let message = session.last_error.as_deref().unwrap_or("transfer failed");
    UploadError::Sync(SyncError::Remote(message.to_string()))
}

/// Writes an optional parent and its attachment in one transaction.
struct CreateAttachmentRequest {
    parent: Option<Item>,
    attachment: Item,
}

#[async_trait]
impl DbRequest for CreateAttachmentRequest {
    type Output = ();

    async fn process(&self, ctx: &mut StoreContext<'_>) -> Result<()> {
        if let Some(parent) = &self.parent {
            ctx.run(&SaveObjectRequest {
                object: parent.clone(),
                origin: ChangeType::User,
            })
            .await?;
        }
        ctx.run(&SaveObjectRequest {
            object: self.attachment.clone(),
            origin: ChangeType::User,
        })
        .await
    }
}

fn content_type_for(filename: &str) -> &'static str {
    let extension = filename
        .rsplit_once('.')
        .map(|(_, extension)| extension.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "pdf" => "application/pdf",
        "epub" => "application/epub+zip",
        "html" | "htm" => "text/html",
        "txt" => "text/plain",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        _ => "application/octet-stream",
    }
}

fn attachment_item(
    library: LibraryIdentifier,
    key: String,
    parent_key: Option<String>,
    placed: &PlacedFile,
) -> Item {
    let mut item = Item::new_local(
        library,
        key,
        ATTACHMENT_TYPE,
        [("title".to_string(), placed.filename.clone())],
    );
    item.data.parent_key = parent_key;
    item.data.attachment = Some(AttachmentState {
        content_type: Some(content_type_for(&placed.filename).to_string()),
        filename: Some(placed.filename.clone()),
        content_hash: Some(placed.content_hash.clone()),
        size: Some(placed.size),
        has_local_file: true,
        needs_upload: true,
    });
    item
}

/// Runs the attachment import steps and finalizes background transfers.
pub struct AttachmentUploader {
    context: SyncContext,
    files: AttachmentFiles,
    transfers: Arc<dyn BackgroundTransfer>,
    process_id: String,
}

impl AttachmentUploader {
    pub fn new(context: SyncContext, transfers: Arc<dyn BackgroundTransfer>) -> Self {
        let files = AttachmentFiles::new(context.config.attachments_dir.clone());
        Self {
            context,
            files,
            transfers,
            process_id: format!("process-{}", uuid::Uuid::new_v4()),
        }
    }

    pub const fn files(&self) -> &AttachmentFiles {
        &self.files
    }

    /// Imports a user-picked file (copied) as an attachment of `parent_key`.
    pub async fn import_local_file(
        &self,
        library: LibraryIdentifier,
        parent_key: Option<&str>,
        path: &Path,
        token: &CancellationToken,
    ) -> UploadResult<ImportedAttachment> {
        self.import(
            library,
            None,
            parent_key.map(str::to_string),
            path,
            PlaceMode::Copy,
            token,
        )
        .await
    }

    /// Imports a downloaded file (moved) under a new parent item built from
    /// translated metadata.
    pub async fn import_downloaded(
        &self,
        library: LibraryIdentifier,
        translated: TranslatedItem,
        temp_path: &Path,
        token: &CancellationToken,
    ) -> UploadResult<ImportedAttachment> {
        let mut parent = Item::new_local(
            library,
            generate_key(),
            translated.item_type,
            translated.fields,
        );
        parent.data.creators = translated.creators;
        parent.data.tags = translated.tags;
        parent.data.recompute_derived();
        let parent_key = parent.key.clone();

        self.import(
            library,
            Some(parent),
            Some(parent_key),
            temp_path,
            PlaceMode::Move,
            token,
        )
        .await
    }

    async fn import(
        &self,
        library: LibraryIdentifier,
        parent: Option<Item>,
        parent_key: Option<String>,
        source: &Path,
        mode: PlaceMode,
        token: &CancellationToken,
    ) -> UploadResult<ImportedAttachment> {
        let record = self
            .context
            .store
            .perform(EnsureLibraryRequest {
                identifier: library,
            })
            .await?;
        if !record.metadata_editable || !record.files_editable {
            return Err(UploadError::ReadOnly(library));
        }

        let key = generate_key();
        let placed = self.files.place(library, &key, source, mode).await?;
        let attachment = attachment_item(library, key.clone(), parent_key, &placed);

        let created = self
            .context
            .store
            .perform(CreateAttachmentRequest {
                parent: parent.clone(),
                attachment: attachment.clone(),
            })
            .await;
        if let Err(error) = created {
            self.files.remove(&placed.path).await;
            return Err(error.into());
        }

        if let Err(error) = self.push_created(library, parent.as_ref(), &key, token).await {
            tracing::warn!(key = %key, error = %error, "Attachment metadata push failed; rolling back");
            self.roll_back(library, parent.as_ref(), &key, &placed).await?;
            return Err(error.into());
        }

        let status = self.authorize_and_enqueue(library, &key, token).await?;
        let attachment = self.load_attachment(library, &key).await?;
        let parent = match parent {
            Some(parent) => self
                .context
                .store
                .read(ReadObjectRequest::<Item>::new(library, parent.key))
                .await?,
            None => None,
        };
        Ok(ImportedAttachment {
            attachment,
            parent,
            status,
        })
    }

    async fn push_created(
        &self,
        library: LibraryIdentifier,
        parent: Option<&Item>,
        key: &str,
        token: &CancellationToken,
    ) -> SyncResult<i64> {
        if let Some(parent) = parent {
            push_single::<Item>(&self.context, library, &parent.key, token).await?;
        }
        push_single::<Item>(&self.context, library, key, token).await
    }

    async fn roll_back(
        &self,
        library: LibraryIdentifier,
        parent: Option<&Item>,
        key: &str,
        placed: &PlacedFile,
    ) -> UploadResult<()> {
        let keys = std::iter::once(key.to_string()).chain(parent.map(|parent| parent.key.clone()));
        for key in keys {
            self.context
                .store
                .perform(DeleteObjectRequest {
                    library,
                    object_type: ObjectType::Item,
                    key,
                })
                .await?;
        }
        self.files.remove(&placed.path).await;
        Ok(())
    }

    async fn load_attachment(&self, library: LibraryIdentifier, key: &str) -> UploadResult<Item> {
        self.context
            .store
            .read(ReadObjectRequest::<Item>::new(library, key))
            .await?
            .filter(|item| item.data.attachment.is_some())
            .ok_or_else(|| UploadError::NotFound(key.to_string()))
    }

    /// Asks the server where to upload and hands a new transfer off.
    pub async fn authorize_and_enqueue(
        &self,
        library: LibraryIdentifier,
        key: &str,
        token: &CancellationToken,
    ) -> UploadResult<UploadStatus> {
        let item = self.load_attachment(library, key).await?;
        let state = item
            .data
            .attachment
            .clone()
            .ok_or_else(|| UploadError::NotFound(key.to_string()))?;
        let filename = state.filename.clone().unwrap_or_else(|| "file".to_string());
        let local_path = self.files.canonical_path(library, key, &filename);
        let content_hash = state
            .content_hash
            .clone()
            .ok_or_else(|| UploadError::FileMissing(local_path.display().to_string()))?;

        let request = UploadRequest {
            content_hash: content_hash.clone(),
            size: state.size.unwrap_or_default(),
            filename,
            mtime_ms: self.context.now_ms(),
        };
        let api = &self.context.api;
        let sent = &request;
        let authorization = self
            .context
            .with_retry(token, "authorize upload", || async move {
                api.authorize_upload(library, key, sent)
                    .await
                    .map_err(SyncError::from)
            })
            .await?;

        match authorization {
            UploadAuthorization::Exists => {
                tracing::info!(key = %key, "Server already holds the file");
                self.mark_uploaded(library, key).await?;
                Ok(UploadStatus::AlreadyOnServer)
            }
            UploadAuthorization::New(target) => {
                let session = UploadSession::new(
                    key.to_string(),
                    library,
                    self.context.config.user_id,
                    target.url,
                    target.method,
                    local_path,
                    target.upload_key,
                    content_hash,
                    target.headers,
                    self.context.now_ms(),
                );
                let session_id = session.id.clone();
                self.transfers.enqueue(session).await?;
                Ok(UploadStatus::Enqueued { session_id })
            }
        }
    }

    async fn mark_uploaded(&self, library: LibraryIdentifier, key: &str) -> UploadResult<()> {
        self.context
            .store
            .perform(EditObjectRequest::new(library, key, |item: &mut Item| {
                if let Some(attachment) = item.data.attachment.as_mut() {
                    attachment.needs_upload = false;
                    attachment.has_local_file = true;
                }
                ItemChanges::empty()
            }))
            .await?;
        Ok(())
    }

    /// Completes a session this process has claimed.
    ///
    /// Success registers the upload; failure re-authorizes and enqueues a
    /// fresh session.
    async fn finalize(
        &self,
        session: &UploadSession,
        token: &CancellationToken,
    ) -> UploadResult<UploadStatus> {
        let result = self.finalize_claimed(session, token).await;
        match &result {
            Ok(_) => self.transfers.forget(&session.id).await?,
            Err(error) => self.transfers.release(session, &error.to_string()).await?,
        }
        result
    }

    /// Claims one finished session by id and finalizes it.
    pub async fn finalize_by_id(
        &self,
        session_id: &str,
        token: &CancellationToken,
    ) -> UploadResult<UploadStatus> {
        let session = self.transfers.claim(session_id, &self.process_id).await?;
        self.finalize(&session, token).await
    }

    async fn finalize_claimed(
        &self,
        session: &UploadSession,
        token: &CancellationToken,
    ) -> UploadResult<UploadStatus> {
        let library = session.library;
        let key = session.attachment_key.as_str();
        match session.state {
            UploadState::Succeeded => {
                let api = &self.context.api;
                let upload_key = session.upload_token.as_str();
                self.context
                    .with_retry(token, "register upload", || async move {
                        api.register_upload(library, key, upload_key)
                            .await
                            .map_err(SyncError::from)
                    })
                    .await?;
                self.mark_uploaded(library, key).await?;
                tracing::info!(session = %session.id, key = %key, "Upload registered");
                Ok(UploadStatus::Registered)
            }
            UploadState::Failed => {
                let cause = transfer_failure(session);
                tracing::info!(
                    session = %session.id,
                    key = %key,
                    error = %cause,
                    "Transfer failed; re-authorizing"
                );
                self.authorize_and_enqueue(library, key, token).await
            }
            UploadState::Pending | UploadState::InFlight => {
                Err(UploadError::Sync(SyncError::Remote(format!(
                    "upload session {} has not finished",
                    session.id
                ))))
            }
        }
    }

    /// Claims every finished transfer not yet finalized by any process and
    /// finalizes it. Returns the number of sessions handled.
    pub async fn resume(&self, token: &CancellationToken) -> UploadResult<usize> {
        let sessions = self.transfers.claim_completed(&self.process_id).await?;
        let mut handled = 0;
        for session in sessions {
            if token.is_cancelled() {
                self.transfers.release(&session, "sync cancelled").await?;
                continue;
            }
            match self.finalize(&session, token).await {
                Ok(_) => handled += 1,
                Err(UploadError::Store(error)) => return Err(UploadError::Store(error)),
                Err(error) => {
                    tracing::warn!(session = %session.id, error = %error, "Could not finalize transfer");
                }
            }
        }
        Ok(handled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::UploadTarget;
    use crate::clock::ManualClock;
    use crate::config::{DelayIntervals, DelayTable, EngineConfig};
    use crate::db::requests::ReadObjectsRequest;
    use crate::db::LibraryStore;
    use crate::models::{SyncState, AUTHORIZATION_EXPIRED};
    use crate::testing::FakeApi;
    use crate::upload::transfer::{TransferOutcome, TransferQueue};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    const MY: LibraryIdentifier = LibraryIdentifier::MY_LIBRARY;

    struct Harness {
        api: FakeApi,
        queue: TransferQueue,
        uploader: AttachmentUploader,
        dir: tempfile::TempDir,
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::new("https://api.example.org", "key", 1, dir.path().join("files"))
            .with_delays(DelayIntervals {
                sync: DelayTable::from_millis(&[1]),
                conflict: DelayTable::from_millis(&[1]),
            })
            .with_max_attempts(2);
        let api = FakeApi::new();
        let clock = Arc::new(ManualClock::new(1_000));
        let store = LibraryStore::open_in_memory().await.unwrap();
        let queue = TransferQueue::new(store.clone(), clock.clone());
        let context = SyncContext::new(store, Arc::new(api.clone()), config, clock);
        let uploader = AttachmentUploader::new(context, Arc::new(queue.clone()));
        Harness {
            api,
            queue,
            uploader,
            dir,
        }
    }

    fn target() -> UploadAuthorization {
        UploadAuthorization::New(UploadTarget {
            url: "https://uploads.example.org/bucket".to_string(),
            method: "POST".to_string(),
            upload_key: "up-1".to_string(),
            headers: BTreeMap::new(),
        })
    }

    fn source(harness: &Harness, name: &str) -> std::path::PathBuf {
        let path = harness.dir.path().join(name);
        std::fs::write(&path, b"%PDF-1.7 test").unwrap();
        path
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn existing_file_needs_no_transfer() {
        let harness = harness().await;
        let path = source(&harness, "paper.pdf");

        let imported = harness
            .uploader
            .import_local_file(MY, None, &path, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(imported.status, UploadStatus::AlreadyOnServer);
        assert!(path.exists());
        let attachment = imported.attachment.data.attachment.unwrap();
        assert!(!attachment.needs_upload);
        assert_eq!(attachment.content_type.as_deref(), Some("application/pdf"));
        assert_eq!(imported.attachment.meta.sync_state, SyncState::Synced);
        assert!(harness
            .api
            .state()
            .object(MY, ObjectType::Item, &imported.attachment.key)
            .is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn new_file_is_handed_to_the_transfer_queue_then_registered() {
        let harness = harness().await;
        harness.api.state().authorizations.push_back(target());
        let path = source(&harness, "paper.pdf");
        let token = CancellationToken::new();

        let imported = harness
            .uploader
            .import_local_file(MY, None, &path, &token)
            .await
            .unwrap();
        let UploadStatus::Enqueued { session_id } = imported.status else {
            panic!("expected a transfer");
        };
        assert!(imported.attachment.data.attachment.unwrap().needs_upload);

        harness.queue.claim_pending("w1", 1).await.unwrap();
        harness
            .queue
            .report(&session_id, TransferOutcome::Succeeded)
            .await
            .unwrap();

        assert_eq!(harness.uploader.resume(&token).await.unwrap(), 1);
        assert_eq!(
            harness.api.state().registered,
            vec![(imported.attachment.key.clone(), "up-1".to_string())]
        );
        let attachment = harness
            .uploader
            .load_attachment(MY, &imported.attachment.key)
            .await
            .unwrap();
        assert!(!attachment.data.attachment.unwrap().needs_upload);
        assert!(harness.queue.list(None).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_transfer_is_reauthorized() {
        let harness = harness().await;
        harness.api.state().authorizations.push_back(target());
        harness.api.state().authorizations.push_back(target());
        let path = source(&harness, "paper.pdf");
        let token = CancellationToken::new();

        let imported = harness
            .uploader
            .import_local_file(MY, None, &path, &token)
            .await
            .unwrap();
        let UploadStatus::Enqueued { session_id } = imported.status else {
            panic!("expected a transfer");
        };
        harness.queue.claim_pending("w1", 1).await.unwrap();
        harness
            .queue
            .report(&session_id, TransferOutcome::Failed("HTTP 403".to_string()))
            .await
            .unwrap();

        harness.uploader.resume(&token).await.unwrap();
        let sessions = harness.queue.list(None).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_ne!(sessions[0].id, session_id);
        assert_eq!(sessions[0].state, UploadState::Pending);
        assert_eq!(harness.api.state().authorized.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn downloaded_file_creates_parent_and_consumes_source() {
        let harness = harness().await;
        let path = source(&harness, "download.tmp.pdf");
        let translated = TranslatedItem {
            item_type: "journalArticle".to_string(),
            fields: vec![("title".to_string(), "On Sync".to_string())],
            ..TranslatedItem::default()
        };

        let imported = harness
            .uploader
            .import_downloaded(MY, translated, &path, &CancellationToken::new())
            .await
            .unwrap();

        assert!(!path.exists());
        let parent = imported.parent.unwrap();
        assert_eq!(parent.data.derived.display_title, "On Sync");
        assert_eq!(
            imported.attachment.data.parent_key.as_deref(),
            Some(parent.key.as_str())
        );
        assert_eq!(parent.meta.sync_state, SyncState::Synced);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_metadata_push_removes_file_and_records() {
        let harness = harness().await;
        harness.api.state().transient_failures = 10;
        let path = source(&harness, "paper.pdf");

        let result = harness
            .uploader
            .import_local_file(MY, None, &path, &CancellationToken::new())
            .await;
        assert!(result.is_err());

        let items = harness
            .uploader
            .context
            .store
            .read(ReadObjectsRequest::<Item>::new(MY))
            .await
            .unwrap();
        assert!(items.is_empty());
        let library_dir = harness.uploader.files().root().join(MY.as_key());
        let leftovers = std::fs::read_dir(&library_dir)
            .map(|entries| entries.count())
            .unwrap_or(0);
        assert_eq!(leftovers, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn session_claimed_elsewhere_is_not_finalized_again() {
        let harness = harness().await;
        harness.api.state().authorizations.push_back(target());
        harness.api.state().authorizations.push_back(target());
        let path = source(&harness, "paper.pdf");
        let token = CancellationToken::new();

        let imported = harness
            .uploader
            .import_local_file(MY, None, &path, &token)
            .await
            .unwrap();
        let UploadStatus::Enqueued { session_id } = imported.status else {
            panic!("expected a transfer");
        };
        harness.queue.claim_pending("w1", 1).await.unwrap();
        harness
            .queue
            .report(&session_id, TransferOutcome::Failed("HTTP 500".to_string()))
            .await
            .unwrap();
        assert_eq!(harness.queue.claim_completed("extension").await.unwrap().len(), 1);

        let result = harness.uploader.finalize_by_id(&session_id, &token).await;
        assert!(matches!(result, Err(UploadError::Store(_))));
        let sessions = harness.queue.list(None).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, session_id);
        assert_eq!(sessions[0].claimed_by.as_deref(), Some("extension"));
        assert_eq!(harness.api.state().authorized.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn expired_authorization_is_renewed_on_finalize() {
        let harness = harness().await;
        harness.api.state().authorizations.push_back(target());
        harness.api.state().authorizations.push_back(target());
        let path = source(&harness, "paper.pdf");
        let token = CancellationToken::new();

        let imported = harness
            .uploader
            .import_local_file(MY, None, &path, &token)
            .await
            .unwrap();
        let UploadStatus::Enqueued { session_id } = imported.status else {
            panic!("expected a transfer");
        };
        harness.queue.claim_pending("w1", 1).await.unwrap();
        harness
            .queue
            .report(
                &session_id,
                TransferOutcome::Failed(format!("{AUTHORIZATION_EXPIRED} (HTTP 403): expired")),
            )
            .await
            .unwrap();

        let failed = harness.queue.list(Some(UploadState::Failed)).await.unwrap();
        assert!(failed[0].authorization_expired());
        let cause = SyncError::from(transfer_failure(&failed[0]));
        assert!(matches!(
            cause,
            SyncError::UploadAuthorizationExpired { ref key } if *key == imported.attachment.key
        ));

        let status = harness
            .uploader
            .finalize_by_id(&session_id, &token)
            .await
            .unwrap();
        let UploadStatus::Enqueued { session_id: renewed } = status else {
            panic!("expected a fresh transfer");
        };
        assert_ne!(renewed, session_id);
        let sessions = harness.queue.list(None).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].state, UploadState::Pending);
        assert_eq!(harness.api.state().authorized.len(), 2);
    }

    struct RejectObjectWrites;

    #[async_trait]
    impl DbRequest for RejectObjectWrites {
        type Output = ();

        async fn process(&self, ctx: &mut StoreContext<'_>) -> Result<()> {
            ctx.conn()
                .execute(
                    "CREATE TRIGGER reject_object_writes BEFORE INSERT ON objects
                     BEGIN SELECT RAISE(ABORT, 'disk full'); END",
                    (),
                )
                .await?;
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_metadata_write_removes_placed_file() {
        let harness = harness().await;
        let path = source(&harness, "paper.pdf");
        harness
            .uploader
            .context
            .store
            .perform(RejectObjectWrites)
            .await
            .unwrap();

        let result = harness
            .uploader
            .import_local_file(MY, None, &path, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(UploadError::Store(_))));

        assert!(path.exists());
        let library_dir = harness.uploader.files().root().join(MY.as_key());
        let leftovers = std::fs::read_dir(&library_dir)
            .map(|entries| entries.count())
            .unwrap_or(0);
        assert_eq!(leftovers, 0);
        assert!(harness.api.state().submissions.is_empty());
        assert!(harness.queue.list(None).await.unwrap().is_empty());
    }
}

//! Runs one sync request end to end.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::context::{checkpoint, SyncContext};
use super::error::{SyncError, SyncResult};
use super::events::{SyncEvent, SyncOutcome, SyncPhase};
use super::pull::{pull_library, resolve_libraries};
use super::push::push_library;
use super::request::SyncRequest;
use crate::upload::AttachmentUploader;

/// Drives the stages of a run: libraries, pull, push, attachments.
pub struct SyncController {
    context: SyncContext,
    uploads: Option<Arc<AttachmentUploader>>,
}

impl SyncController {
    pub fn new(context: SyncContext) -> Self {
        Self {
            context,
            uploads: None,
        }
    }

    /// Adds the attachment stage to every run.
    #[must_use]
    pub fn with_uploads(mut self, uploads: Arc<AttachmentUploader>) -> Self {
        self.uploads = Some(uploads);
        self
    }

    pub fn context(&self) -> &SyncContext {
        &self.context
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.context.subscribe()
    }

    /// Executes `request`. Per-object failures end up in the outcome; only
    /// cancellation and fatal errors abort the run.
    pub async fn run(
        &self,
        request: &SyncRequest,
        token: &CancellationToken,
    ) -> SyncResult<SyncOutcome> {
        let ctx = &self.context;
        tracing::info!(kind = ?request.kind, scope = ?request.scope, "Sync started");
        ctx.emit(SyncEvent::Started {
            request: request.clone(),
        });

        let mut outcome = SyncOutcome::default();
        match self.run_stages(request, token, &mut outcome).await {
            Ok(()) => {
                tracing::info!(
                    libraries = outcome.libraries.len(),
                    pulled = outcome.pulled,
                    pushed = outcome.pushed,
                    conflicts = outcome.conflicts,
                    errors = outcome.errors.len(),
                    "Sync finished"
                );
                ctx.progress(None, SyncPhase::Finished);
                ctx.emit(SyncEvent::Finished {
                    outcome: outcome.clone(),
                });
                Ok(outcome)
            }
            Err(error) => {
                if matches!(error, SyncError::Cancelled) {
                    tracing::info!("Sync cancelled");
                } else {
                    tracing::error!(error = %error, "Sync aborted");
                }
                ctx.progress(None, SyncPhase::Aborted);
                ctx.emit(SyncEvent::Aborted {
                    reason: error.to_string(),
                });
                Err(error)
            }
        }
    }

    async fn run_stages(
        &self,
        request: &SyncRequest,
        token: &CancellationToken,
        outcome: &mut SyncOutcome,
    ) -> SyncResult<()> {
        let ctx = &self.context;
        checkpoint(token)?;
        let libraries = resolve_libraries(ctx, request, token, outcome).await?;
        outcome.libraries = libraries.iter().map(|library| library.identifier).collect();

        for library in &libraries {
            checkpoint(token)?;
            pull_library(ctx, library.identifier, request, token, outcome).await?;

            checkpoint(token)?;
            if library.metadata_editable {
                push_library(ctx, library.identifier, token, outcome).await?;
            } else {
                tracing::debug!(library = %library.identifier, "Library is read-only; skipping push");
            }
        }

        let any_writable = libraries.iter().any(|library| library.files_editable);
        if let Some(uploads) = self.uploads.as_ref().filter(|_| any_writable) {
            checkpoint(token)?;
            ctx.progress(None, SyncPhase::UploadingAttachments);
            match uploads.resume(token).await {
                Ok(count) if count > 0 => {
                    tracing::info!(count, "Resumed attachment uploads");
                }
                Ok(_) => {}
                Err(_) if token.is_cancelled() => return Err(SyncError::Cancelled),
                Err(error) => {
                    tracing::warn!(error = %error, "Attachment stage failed");
                    outcome.errors.push(error.to_string());
                }
            }
        }
        Ok(())
    }
}

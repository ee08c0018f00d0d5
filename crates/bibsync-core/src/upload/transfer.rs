//! Background transfer subsystem: a durable session queue and the worker
//! that moves bytes to pre-signed destinations.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;

use super::error::{UploadError, UploadResult};
use crate::clock::Clock;
use crate::db::requests::{
    ClaimCompletedSessionRequest, ClaimCompletedSessionsRequest, ClaimUploadSessionsRequest,
    DeleteUploadSessionRequest,
    InsertUploadSessionRequest, ReadUploadSessionsRequest, UpdateUploadSessionRequest,
};
use crate::db::LibraryStore;
use crate::models::{UploadSession, UploadState, AUTHORIZATION_EXPIRED};
use crate::util::compact_text;

/// In-flight claims older than this are presumed abandoned.
const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(15 * 60);

/// How a transfer ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Succeeded,
    Failed(String),
}

/// Accepts fully described sessions and reports their completion, possibly
/// to a different process than the one that enqueued them.
#[async_trait]
pub trait BackgroundTransfer: Send + Sync {
    async fn enqueue(&self, session: UploadSession) -> UploadResult<()>;

    async fn report(&self, session_id: &str, outcome: TransferOutcome) -> UploadResult<()>;

    /// Takes ownership of finished sessions nobody has finalized yet.
    async fn claim_completed(&self, process: &str) -> UploadResult<Vec<UploadSession>>;

    /// Takes ownership of one finished session; fails if another process
    /// already holds it or the transfer is still running.
    async fn claim(&self, session_id: &str, process: &str) -> UploadResult<UploadSession>;

    /// Gives a claimed session back, recording why.
    async fn release(&self, session: &UploadSession, error: &str) -> UploadResult<()>;

    /// Drops a finalized session.
    async fn forget(&self, session_id: &str) -> UploadResult<()>;
}

/// Session queue persisted in the `upload_sessions` table.
#[derive(Clone)]
pub struct TransferQueue {
    store: LibraryStore,
    clock: Arc<dyn Clock>,
    stale_after: Duration,
}

impl TransferQueue {
    pub fn new(store: LibraryStore, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            stale_after: DEFAULT_STALE_AFTER,
        }
    }

    #[must_use]
    pub const fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Claims pending (or abandoned) sessions for `worker`.
    pub async fn claim_pending(&self, worker: &str, limit: u32) -> UploadResult<Vec<UploadSession>> {
        let stale_after_ms = i64::try_from(self.stale_after.as_millis()).unwrap_or(i64::MAX);
        Ok(self
            .store
            .perform(ClaimUploadSessionsRequest {
                worker: worker.to_string(),
                limit,
                now_ms: self.clock.now_ms(),
                stale_after_ms,
            })
            .await?)
    }

    pub async fn list(&self, state: Option<UploadState>) -> UploadResult<Vec<UploadSession>> {
        Ok(self.store.read(ReadUploadSessionsRequest { state }).await?)
    }
}

#[async_trait]
impl BackgroundTransfer for TransferQueue {
    async fn enqueue(&self, session: UploadSession) -> UploadResult<()> {
        tracing::info!(
            session = %session.id,
            key = %session.attachment_key,
            library = %session.library,
            "Enqueued attachment transfer"
        );
        self.store
            .perform(InsertUploadSessionRequest { session })
            .await?;
        Ok(())
    }

    async fn report(&self, session_id: &str, outcome: TransferOutcome) -> UploadResult<()> {
        let (state, last_error) = match outcome {
            TransferOutcome::Succeeded => (UploadState::Succeeded, None),
            TransferOutcome::Failed(error) => {
                tracing::warn!(session = %session_id, error = %error, "Transfer failed");
                (UploadState::Failed, Some(error))
            }
        };
        self.store
            .perform(UpdateUploadSessionRequest {
                id: session_id.to_string(),
                state,
                last_error,
                now_ms: self.clock.now_ms(),
            })
            .await?;
        Ok(())
    }

    async fn claim_completed(&self, process: &str) -> UploadResult<Vec<UploadSession>> {
        Ok(self
            .store
            .perform(ClaimCompletedSessionsRequest {
                process: process.to_string(),
                now_ms: self.clock.now_ms(),
            })
            .await?)
    }

    async fn claim(&self, session_id: &str, process: &str) -> UploadResult<UploadSession> {
        Ok(self
            .store
            .perform(ClaimCompletedSessionRequest {
                id: session_id.to_string(),
                process: process.to_string(),
                now_ms: self.clock.now_ms(),
            })
            .await?)
    }

    async fn release(&self, session: &UploadSession, error: &str) -> UploadResult<()> {
        self.store
            .perform(UpdateUploadSessionRequest {
                id: session.id.clone(),
                state: session.state,
                last_error: Some(error.to_string()),
                now_ms: self.clock.now_ms(),
            })
            .await?;
        Ok(())
    }

    async fn forget(&self, session_id: &str) -> UploadResult<()> {
        self.store
            .perform(DeleteUploadSessionRequest {
                id: session_id.to_string(),
            })
            .await?;
        Ok(())
    }
}

/// Uploads claimed sessions over HTTP and reports each outcome.
pub struct HttpTransferWorker {
    queue: TransferQueue,
    client: reqwest::Client,
    worker_id: String,
}

impl HttpTransferWorker {
    pub fn new(queue: TransferQueue) -> UploadResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|error| UploadError::Api(error.into()))?;
        Ok(Self {
            queue,
            client,
            worker_id: format!("worker-{}", uuid::Uuid::new_v4()),
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Claims up to `limit` sessions, transfers them and returns how many
    /// succeeded.
    pub async fn run_once(&self, limit: u32) -> UploadResult<usize> {
        let sessions = self.queue.claim_pending(&self.worker_id, limit).await?;
        let mut succeeded = 0;
        for session in sessions {
            let outcome = self.transfer(&session).await;
            if outcome == TransferOutcome::Succeeded {
                succeeded += 1;
            }
            self.queue.report(&session.id, outcome).await?;
        }
        Ok(succeeded)
    }

    async fn transfer(&self, session: &UploadSession) -> TransferOutcome {
        let bytes = match tokio::fs::read(&session.local_path).await {
            Ok(bytes) => bytes,
            Err(error) => {
                return TransferOutcome::Failed(format!(
                    "Attachment file is missing: {}: {error}",
                    session.local_path.display()
                ))
            }
        };
        let method = match Method::from_bytes(session.method.as_bytes()) {
            Ok(method) => method,
            Err(error) => return TransferOutcome::Failed(format!("Unsupported HTTP method: {error}")),
        };

        let mut request = self.client.request(method, &session.remote_url);
        for (name, value) in &session.headers {
            if name.eq_ignore_ascii_case("host") {
                continue;
            }
            request = request.header(name.as_str(), value.as_str());
        }
        let response = match request.body(bytes).send().await {
            Ok(response) => response,
            Err(error) => return TransferOutcome::Failed(format!("Upload request failed: {error}")),
        };

        let status = response.status();
        if status.is_success() {
            tracing::info!(session = %session.id, key = %session.attachment_key, "Transfer finished");
            return TransferOutcome::Succeeded;
        }
        let body = response.text().await.unwrap_or_default();
        rejected(status.as_u16(), &body)
    }
}

/// Maps a non-success response from the destination to a failure.
fn rejected(status: u16, body: &str) -> TransferOutcome {
    let detail = compact_text(body);
    match status {
        403 | 410 => {
            TransferOutcome::Failed(format!("{AUTHORIZATION_EXPIRED} (HTTP {status}): {detail}"))
        }
        _ => TransferOutcome::Failed(format!("Upload request failed with HTTP {status}: {detail}")),
    }
}

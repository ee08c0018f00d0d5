//! Attachment upload pipeline and the background transfer subsystem.

mod error;
mod files;
mod pipeline;
mod transfer;

pub use error::{UploadError, UploadResult};
pub use files::{hash_file, AttachmentFiles, PlaceMode, PlacedFile};
pub use pipeline::{AttachmentUploader, ImportedAttachment, TranslatedItem, UploadStatus};
pub use transfer::{BackgroundTransfer, HttpTransferWorker, TransferOutcome, TransferQueue};

use std::path::Path;

use bibsync_core::upload::UploadStatus;
use tokio_util::sync::CancellationToken;

use crate::commands::common::{parse_library, Engine};
use crate::error::CliError;

pub async fn run_upload(
    engine: &Engine,
    path: &Path,
    library: &str,
    parent: Option<&str>,
) -> Result<(), CliError> {
    let library = parse_library(library)?;
    let parent = parent.map(str::trim).filter(|key| !key.is_empty());

    let imported = engine
        .uploader
        .import_local_file(library, parent, path, &CancellationToken::new())
        .await?;

    println!("Imported attachment {}", imported.attachment.key);
    match imported.status {
        UploadStatus::AlreadyOnServer => println!("The server already holds this file."),
        UploadStatus::Enqueued { session_id } => {
            println!("Transfer queued as {session_id}. Run `bibsync transfers run` to upload it.");
        }
        UploadStatus::Registered => println!("Upload registered."),
    }
    Ok(())
}

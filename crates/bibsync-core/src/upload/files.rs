//! Canonical on-disk location of attachment files.

use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use super::error::{UploadError, UploadResult};
use crate::models::LibraryIdentifier;
use crate::util::sanitize_file_name;

const HASH_BUFFER: usize = 64 * 1024;

/// How a source file reaches its canonical location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceMode {
    /// The source stays where it is (user-picked files).
    Copy,
    /// The source is consumed (downloads in a temporary directory).
    Move,
}

/// A file at its canonical location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacedFile {
    pub path: PathBuf,
    pub filename: String,
    /// SHA-256 of the contents (hex).
    pub content_hash: String,
    pub size: u64,
}

/// Attachment files laid out as `<root>/<library>/<key>/<filename>`.
#[derive(Debug, Clone)]
pub struct AttachmentFiles {
    root: PathBuf,
}

impl AttachmentFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn canonical_path(&self, library: LibraryIdentifier, key: &str, filename: &str) -> PathBuf {
        self.root
            .join(library.as_key())
            .join(key)
            .join(sanitize_file_name(filename))
    }

    /// Copies or moves `source` into place and hashes the result.
    ///
    /// Nothing is left at the destination when any step fails.
    pub async fn place(
        &self,
        library: LibraryIdentifier,
        key: &str,
        source: &Path,
        mode: PlaceMode,
    ) -> UploadResult<PlacedFile> {
        let metadata = tokio::fs::metadata(source)
            .await
            .map_err(|error| UploadError::FileMissing(format!("{}: {error}", source.display())))?;
        if !metadata.is_file() || metadata.len() == 0 {
            return Err(UploadError::FileMissing(format!(
                "{} is empty or not a file",
                source.display()
            )));
        }

        let original_name = source
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let filename = sanitize_file_name(&original_name);
        let destination = self.canonical_path(library, key, &filename);
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|error| not_copied(&destination, &error))?;
        }

        match mode {
            PlaceMode::Copy => {
                tokio::fs::copy(source, &destination)
                    .await
                    .map_err(|error| not_copied(&destination, &error))?;
            }
            PlaceMode::Move => {
                if tokio::fs::rename(source, &destination).await.is_err() {
                    // Different filesystems: copy, then drop the source
                    tokio::fs::copy(source, &destination)
                        .await
                        .map_err(|error| not_copied(&destination, &error))?;
                    if let Err(error) = tokio::fs::remove_file(source).await {
                        tracing::warn!(path = %source.display(), error = %error, "Could not remove moved source");
                    }
                }
            }
        }

        match hash_file(&destination).await {
            Ok((content_hash, size)) => {
                tracing::debug!(path = %destination.display(), size, "Placed attachment file");
                Ok(PlacedFile {
                    path: destination,
                    filename,
                    content_hash,
                    size,
                })
            }
            Err(error) => {
                self.remove(&destination).await;
                Err(error)
            }
        }
    }

    /// Deletes a placed file and its key directory when empty.
    pub async fn remove(&self, path: &Path) {
        if let Err(error) = tokio::fs::remove_file(path).await {
            if error.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %error, "Could not remove attachment file");
            }
        }
        if let Some(parent) = path.parent() {
            // Fails while other files remain, which is fine
            let _ = tokio::fs::remove_dir(parent).await;
        }
    }
}

fn not_copied(destination: &Path, error: &std::io::Error) -> UploadError {
    UploadError::FileNotCopied(format!("{}: {error}", destination.display()))
}

/// SHA-256 (hex) and size of a file.
pub async fn hash_file(path: &Path) -> UploadResult<(String, u64)> {
    let owned = path.to_path_buf();
    let hashed = tokio::task::spawn_blocking(move || -> std::io::Result<(String, u64)> {
        let mut file = std::fs::File::open(&owned)?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0_u8; HASH_BUFFER];
        let mut size = 0_u64;
        loop {
            let read = file.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
            size += read as u64;
        }
        Ok((format!("{:x}", hasher.finalize()), size))
    })
    .await
    .map_err(|error| UploadError::FileNotCopied(format!("hashing task failed: {error}")))?;
    hashed.map_err(|error| not_copied(path, &error))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[tokio::test(flavor = "multi_thread")]
    async fn copy_keeps_source_and_hashes_destination() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("My Paper.pdf");
        std::fs::write(&source, b"hello").unwrap();
        let files = AttachmentFiles::new(dir.path().join("store"));

        let placed = files
            .place(LibraryIdentifier::MY_LIBRARY, "ABCD2345", &source, PlaceMode::Copy)
            .await
            .unwrap();

        assert!(source.exists());
        assert_eq!(placed.content_hash, HELLO_SHA256);
        assert_eq!(placed.size, 5);
        assert_eq!(
            placed.path,
            files.canonical_path(LibraryIdentifier::MY_LIBRARY, "ABCD2345", "My Paper.pdf")
        );
        assert!(placed.path.starts_with(dir.path().join("store").join("u").join("ABCD2345")));
        assert_eq!(std::fs::read(&placed.path).unwrap(), b"hello");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn move_consumes_source() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("download.pdf");
        std::fs::write(&source, b"hello").unwrap();
        let files = AttachmentFiles::new(dir.path().join("store"));

        let placed = files
            .place(LibraryIdentifier::Group(3), "ZZZZ2345", &source, PlaceMode::Move)
            .await
            .unwrap();
        assert!(!source.exists());
        assert!(placed.path.exists());

        files.remove(&placed.path).await;
        assert!(!placed.path.exists());
        assert!(!placed.path.parent().unwrap().exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn empty_or_missing_sources_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let files = AttachmentFiles::new(dir.path().join("store"));
        let empty = dir.path().join("empty.pdf");
        std::fs::write(&empty, b"").unwrap();

        for source in [empty, dir.path().join("missing.pdf")] {
            let error = files
                .place(LibraryIdentifier::MY_LIBRARY, "ABCD2345", &source, PlaceMode::Copy)
                .await
                .unwrap_err();
            assert!(matches!(error, UploadError::FileMissing(_)));
        }
    }
}

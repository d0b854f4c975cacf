//! Upload staging and durable face image storage.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use image::ImageFormat;
use tempfile::NamedTempFile;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("uploaded file is not a recognized image")]
    NotAnImage,
    #[error("image storage I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// Blob storage with public links: an upload/get-public-url pair.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(&self, path: &str, data: Vec<u8>, content_type: &str)
        -> Result<(), StorageError>;

    fn public_url(&self, path: &str) -> String;
}

/// Blob store backed by a local directory, published under `base_url`.
pub struct LocalBlobStore {
    root: PathBuf,
    base_url: String,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>, base_url: &str) -> Self {
        Self {
            root: root.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn upload(
        &self,
        path: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError> {
        let target = self.root.join(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, &data).await?;
        tracing::debug!(path, content_type, bytes = data.len(), "blob stored");
        Ok(())
    }

    fn public_url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }
}

/// An uploaded image staged on local disk. The file is removed on drop.
#[derive(Debug)]
pub struct TempImage {
    file: NamedTempFile,
    format: ImageFormat,
}

impl TempImage {
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn extension(&self) -> &'static str {
        self.format.extensions_str().first().copied().unwrap_or("jpg")
    }

    pub fn content_type(&self) -> &'static str {
        self.format.to_mime_type()
    }
}

/// Keeps only characters that are safe inside a single path segment.
fn path_segment(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

/// Stages uploads in a temp directory and publishes them to a [`BlobStore`].
#[derive(Clone)]
pub struct ImageStorage {
    temp_dir: PathBuf,
    blobs: Arc<dyn BlobStore>,
}

impl ImageStorage {
    pub fn new(temp_dir: impl Into<PathBuf>, blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            temp_dir: temp_dir.into(),
            blobs,
        }
    }

    /// Write upload bytes to a uniquely named temp file.
    ///
    /// The format is sniffed from the bytes, not trusted from the client's
    /// file name.
    pub async fn save_upload(&self, bytes: Vec<u8>) -> Result<TempImage, StorageError> {
        let format = image::guess_format(&bytes).map_err(|_| StorageError::NotAnImage)?;
        let temp_dir = self.temp_dir.clone();

        let image = tokio::task::spawn_blocking(move || -> Result<TempImage, StorageError> {
            std::fs::create_dir_all(&temp_dir)?;
            let ext = format.extensions_str().first().copied().unwrap_or("jpg");
            let mut file = tempfile::Builder::new()
                .prefix("face-")
                .suffix(&format!(".{ext}"))
                .tempfile_in(&temp_dir)?;
            file.write_all(&bytes)?;
            file.flush()?;
            Ok(TempImage { file, format })
        })
        .await
        .map_err(std::io::Error::other)??;

        tracing::debug!(path = %image.path().display(), format = ?image.format, "saved upload");
        Ok(image)
    }

    /// Upload a staged image to durable storage and return its public URL.
    ///
    /// If the upload fails the staged file's local path is returned instead.
    pub async fn publish(&self, image: &TempImage, pair_id: &str, person_name: &str) -> String {
        let storage_path = format!(
            "{}/{}_{}.{}",
            path_segment(pair_id),
            path_segment(person_name),
            Uuid::new_v4().simple(),
            image.extension()
        );

        let result = match tokio::fs::read(image.path()).await {
            Ok(data) => {
                self.blobs
                    .upload(&storage_path, data, image.content_type())
                    .await
            }
            Err(e) => Err(e.into()),
        };

        match result {
            Ok(()) => {
                tracing::info!(path = %storage_path, "uploaded face image");
                self.blobs.public_url(&storage_path)
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    path = %storage_path,
                    "image upload failed; falling back to local path"
                );
                image.path().to_string_lossy().into_owned()
            }
        }
    }
}

//! Face embedding provider.
//!
//! Embedding extraction runs in an external face-recognition service. The
//! daemon only knows its contract: an image goes in, a fixed-length vector
//! (or "no face detected") comes out.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::types::{Embedding, EmbeddingError};

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("failed to read image: {0}")]
    Io(#[from] std::io::Error),
    #[error("embedding service request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("embedding service returned {0}")]
    Embedding(#[from] EmbeddingError),
    #[error("embedding service unavailable")]
    Unavailable,
}

/// Turns a face image on disk into an embedding.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// `Ok(None)` means the image contained no detectable face.
    async fn generate_embedding(&self, image_path: &Path)
        -> Result<Option<Embedding>, ProviderError>;

    /// Output embedding dimensions.
    fn dimensions(&self) -> usize;
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: Option<Vec<f32>>,
}

/// Client for an HTTP face-recognition service.
///
/// POSTs the image as multipart field `image` to `<base_url>/embed` and
/// expects `{"embedding": [...]}` or `{"embedding": null}`.
pub struct HttpEmbeddingProvider {
    client: reqwest::Client,
    endpoint: String,
    dims: usize,
}

impl HttpEmbeddingProvider {
    pub fn new(base_url: &str, dims: usize, timeout: Duration) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let endpoint = format!("{}/embed", base_url.trim_end_matches('/'));
        tracing::info!(endpoint = %endpoint, dims, ?timeout, "embedding provider configured");
        Ok(Self {
            client,
            endpoint,
            dims,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn generate_embedding(
        &self,
        image_path: &Path,
    ) -> Result<Option<Embedding>, ProviderError> {
        let bytes = tokio::fs::read(image_path).await?;
        let file_name = image_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_string());

        let form = reqwest::multipart::Form::new().part(
            "image",
            reqwest::multipart::Part::bytes(bytes).file_name(file_name),
        );

        let response: EmbedResponse = self
            .client
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let Some(raw) = response.embedding.filter(|v| !v.is_empty()) else {
            tracing::debug!(path = %image_path.display(), "no face detected");
            return Ok(None);
        };

        let mut embedding = Embedding::new(raw);
        embedding.check_dimensions(self.dims)?;
        embedding.normalize();
        Ok(Some(embedding))
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}

/// Mock provider for testing.
///
/// Maps exact image bytes to embeddings; any other image has no face.
/// Records every path it was asked to read.
pub struct MockEmbeddingProvider {
    dims: usize,
    faces: Mutex<HashMap<Vec<u8>, Vec<f32>>>,
    calls: Mutex<Vec<PathBuf>>,
    failing: AtomicBool,
}

impl MockEmbeddingProvider {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            faces: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
        }
    }

    /// Register `image` as containing a face with the given embedding.
    pub fn with_face(self, image: &[u8], embedding: Vec<f32>) -> Self {
        self.add_face(image, embedding);
        self
    }

    pub fn add_face(&self, image: &[u8], embedding: Vec<f32>) {
        if let Ok(mut faces) = self.faces.lock() {
            faces.insert(image.to_vec(), embedding);
        }
    }

    /// Make every subsequent call fail with [`ProviderError::Unavailable`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Paths passed to `generate_embedding`, in call order.
    pub fn calls(&self) -> Vec<PathBuf> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbeddingProvider {
    async fn generate_embedding(
        &self,
        image_path: &Path,
    ) -> Result<Option<Embedding>, ProviderError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(image_path.to_path_buf());
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(ProviderError::Unavailable);
        }

        let bytes = tokio::fs::read(image_path).await?;
        let found = self
            .faces
            .lock()
            .ok()
            .and_then(|faces| faces.get(&bytes).cloned());
        Ok(found.map(Embedding::new))
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}

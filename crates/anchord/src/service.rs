use std::sync::Arc;

use anchor_core::{
    find_best_match, Candidate, Embedding, EmbeddingProvider, NewPerson, Person, PersonId,
    PersonPatch, ProviderError,
};
use serde::Serialize;
use thiserror::Error;

use crate::storage::{ImageStorage, StorageError};
use crate::store::{Store, StoreError};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("{0}")]
    InvalidInput(String),
    #[error("No face detected in image. Please upload a clear face photo.")]
    NoFaceDetected,
    #[error("No face detected in new image")]
    NoFaceInNewImage,
    #[error("No fields to update")]
    NothingToUpdate,
    #[error("Person {0} not found")]
    PersonNotFound(PersonId),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Result of matching a probe face against a pair's enrolled people.
#[derive(Debug, Clone, Serialize)]
pub struct ScanOutcome {
    pub matched: bool,
    pub score: Option<f32>,
    pub person: Option<Person>,
}

impl ScanOutcome {
    pub fn unmatched() -> Self {
        Self {
            matched: false,
            score: None,
            person: None,
        }
    }
}

/// Orchestrates the embedding provider, person store and image storage.
/// Clone-safe; every clone shares the same underlying handles.
#[derive(Clone)]
pub struct FaceService {
    store: Store,
    provider: Arc<dyn EmbeddingProvider>,
    images: ImageStorage,
    threshold: f32,
    embedding_dim: usize,
}

fn require_pair(pair_id: &str) -> Result<(), ServiceError> {
    if pair_id.trim().is_empty() {
        return Err(ServiceError::InvalidInput("pair_id is required".into()));
    }
    Ok(())
}

impl FaceService {
    pub fn new(
        store: Store,
        provider: Arc<dyn EmbeddingProvider>,
        images: ImageStorage,
        threshold: f32,
    ) -> Self {
        let embedding_dim = provider.dimensions();
        Self {
            store,
            provider,
            images,
            threshold,
            embedding_dim,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    /// Stage `image`, ask the provider for an embedding, and verify its
    /// dimensionality. The staged file lives as long as the returned
    /// [`TempImage`](crate::storage::TempImage) and is removed when it drops.
    async fn embed_upload(
        &self,
        image: Vec<u8>,
    ) -> Result<(Option<Embedding>, crate::storage::TempImage), ServiceError> {
        let staged = self.images.save_upload(image).await?;
        let embedding = self.provider.generate_embedding(staged.path()).await?;
        if let Some(e) = &embedding {
            e.check_dimensions(self.embedding_dim)
                .map_err(ProviderError::from)?;
        }
        Ok((embedding, staged))
    }

    /// Enroll a person: detect a face, store the photo, create the person
    /// and then its embedding.
    ///
    /// A failed embedding insert is logged and tolerated; the person stays
    /// enrolled without a usable embedding until the next image update.
    pub async fn enroll(&self, person: NewPerson, image: Vec<u8>) -> Result<Person, ServiceError> {
        if let Some(field) = person.blank_field() {
            return Err(ServiceError::InvalidInput(format!("{field} is required")));
        }
        tracing::info!(pair_id = %person.pair_id, name = %person.name, "adding person");

        let (embedding, staged) = self.embed_upload(image).await?;
        let Some(embedding) = embedding else {
            tracing::info!(pair_id = %person.pair_id, "enroll: no face detected");
            return Err(ServiceError::NoFaceDetected);
        };

        let image_url = self
            .images
            .publish(&staged, &person.pair_id, &person.name)
            .await;
        let created = self.store.insert_person(&person, &image_url).await?;

        if let Err(e) = self.store.insert_embedding(created.id, &embedding).await {
            tracing::warn!(
                person_id = created.id,
                error = %e,
                "failed to save embedding; person enrolled without one"
            );
        }
        drop(staged);

        tracing::info!(person_id = created.id, name = %created.name, "person added");
        Ok(created)
    }

    pub async fn list_people(&self, pair_id: &str) -> Result<Vec<Person>, ServiceError> {
        require_pair(pair_id)?;
        let people = self.store.list_people(pair_id).await?;
        tracing::info!(pair_id, count = people.len(), "fetched people");
        Ok(people)
    }

    /// Match a precomputed embedding against every enrolled person in the pair.
    pub async fn scan_embedding(
        &self,
        pair_id: &str,
        embedding: &Embedding,
    ) -> Result<ScanOutcome, ServiceError> {
        require_pair(pair_id)?;
        embedding
            .check_dimensions(self.embedding_dim)
            .map_err(|e| ServiceError::InvalidInput(format!("invalid embedding: {e}")))?;

        let people = self.store.list_people(pair_id).await?;
        if people.is_empty() {
            tracing::info!(pair_id, "scan: no people enrolled");
            return Ok(ScanOutcome::unmatched());
        }

        let mut gallery = Vec::new();
        for row in self.store.stored_embeddings(pair_id).await? {
            let person_id = row.person_id;
            if row.dimensions != self.embedding_dim {
                tracing::warn!(
                    person_id,
                    dimensions = row.dimensions,
                    expected = self.embedding_dim,
                    "skipping stored embedding of another dimension"
                );
                continue;
            }
            let stored = match Embedding::from_le_bytes(&row.blob)
                .and_then(|e| e.check_dimensions(self.embedding_dim).map(|()| e))
            {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!(person_id, error = %e, "skipping unusable stored embedding");
                    continue;
                }
            };
            gallery.push(Candidate::new(person_id, stored));
        }

        if gallery.is_empty() {
            tracing::info!(pair_id, "scan: no embeddings enrolled");
            return Ok(ScanOutcome::unmatched());
        }

        let Some(best) = find_best_match(embedding, &gallery, self.threshold) else {
            tracing::info!(pair_id, candidates = gallery.len(), "scan: no match above threshold");
            return Ok(ScanOutcome::unmatched());
        };

        let Some(person) = people.into_iter().find(|p| p.id == best.person_id) else {
            tracing::error!(person_id = best.person_id, "matched person vanished during scan");
            return Ok(ScanOutcome::unmatched());
        };

        tracing::info!(
            pair_id,
            person_id = person.id,
            name = %person.name,
            score = best.score,
            "scan: match found"
        );
        Ok(ScanOutcome {
            matched: true,
            score: Some(best.score),
            person: Some(person),
        })
    }

    /// Generate an embedding from `image` and delegate to [`scan_embedding`].
    /// An image without a face is an unmatched scan, not an error.
    ///
    /// [`scan_embedding`]: Self::scan_embedding
    pub async fn scan_image(&self, pair_id: &str, image: Vec<u8>) -> Result<ScanOutcome, ServiceError> {
        require_pair(pair_id)?;
        tracing::info!(pair_id, "scanning face from image");

        let (embedding, staged) = self.embed_upload(image).await?;
        drop(staged);

        match embedding {
            Some(embedding) => self.scan_embedding(pair_id, &embedding).await,
            None => {
                tracing::info!(pair_id, "scan: no face detected");
                Ok(ScanOutcome::unmatched())
            }
        }
    }

    /// Apply a partial update. A new image replaces both the stored photo
    /// and the embedding.
    pub async fn update(
        &self,
        person_id: PersonId,
        mut patch: PersonPatch,
        image: Option<Vec<u8>>,
    ) -> Result<Person, ServiceError> {
        patch.image_url = None;
        if patch.is_empty() && image.is_none() {
            return Err(ServiceError::NothingToUpdate);
        }
        tracing::info!(person_id, "updating person");

        let mut new_embedding = None;
        if let Some(image) = image {
            let existing = self
                .store
                .get_person(person_id)
                .await?
                .ok_or(ServiceError::PersonNotFound(person_id))?;

            let (embedding, staged) = self.embed_upload(image).await?;
            let Some(embedding) = embedding else {
                return Err(ServiceError::NoFaceInNewImage);
            };

            let image_url = self
                .images
                .publish(&staged, &existing.pair_id, &existing.name)
                .await;
            patch.image_url = Some(image_url);
            new_embedding = Some(embedding);
        }

        let updated = self
            .store
            .update_person(person_id, &patch, new_embedding.as_ref())
            .await?
            .ok_or(ServiceError::PersonNotFound(person_id))?;

        tracing::info!(person_id, "person updated");
        Ok(updated)
    }

    pub async fn delete(&self, person_id: PersonId) -> Result<(), ServiceError> {
        tracing::info!(person_id, "deleting person");
        if !self.store.delete_person(person_id).await? {
            return Err(ServiceError::PersonNotFound(person_id));
        }
        tracing::info!(person_id, "person deleted");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::storage::tests::png;
    use crate::storage::LocalBlobStore;
    use anchor_core::MockEmbeddingProvider;

    pub(crate) const DIM: usize = 3;

    pub(crate) struct Harness {
        pub service: FaceService,
        pub store: Store,
        pub provider: Arc<MockEmbeddingProvider>,
        pub dir: tempfile::TempDir,
    }

    impl Harness {
        /// Files currently staged in the temp upload directory.
        pub fn staged_files(&self) -> usize {
            std::fs::read_dir(self.dir.path().join("tmp"))
                .map(|entries| entries.count())
                .unwrap_or(0)
        }
    }

    pub(crate) async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().await.unwrap();
        let provider = Arc::new(
            MockEmbeddingProvider::new(DIM)
                .with_face(&png(b"alice"), vec![1.0, 0.0, 0.0])
                .with_face(&png(b"alice-2"), vec![0.95, 0.05, 0.0])
                .with_face(&png(b"bob"), vec![0.0, 1.0, 0.0])
                .with_face(&png(b"carol"), vec![0.0, 0.0, 1.0]),
        );
        let blobs = Arc::new(LocalBlobStore::new(
            dir.path().join("blobs"),
            "http://cdn.test/images",
        ));
        let images = ImageStorage::new(dir.path().join("tmp"), blobs);
        let service = FaceService::new(store.clone(), provider.clone(), images, 0.6);
        Harness {
            service,
            store,
            provider,
            dir,
        }
    }

    pub(crate) fn new_person(pair_id: &str, name: &str) -> NewPerson {
        NewPerson {
            pair_id: pair_id.into(),
            name: name.into(),
            relationship: "Son".into(),
            occupation: "Engineer".into(),
            age: Some(29),
            notes: Some("Calls every evening".into()),
        }
    }

    #[tokio::test]
    async fn enroll_stores_person_and_embedding() {
        let h = harness().await;
        let person = h
            .service
            .enroll(new_person("pair-1", "Alice"), png(b"alice"))
            .await
            .unwrap();

        assert_eq!(person.pair_id, "pair-1");
        assert!(person.image_url.starts_with("http://cdn.test/images/pair-1/Alice_"));
        let blob = h.store.get_embedding(person.id).await.unwrap().unwrap();
        let stored = Embedding::from_le_bytes(&blob).unwrap();
        assert_eq!(stored.values, vec![1.0, 0.0, 0.0]);
        assert_eq!(h.staged_files(), 0);
    }

    #[tokio::test]
    async fn enroll_without_face_creates_nothing() {
        let h = harness().await;
        let err = h
            .service
            .enroll(new_person("pair-1", "Nobody"), png(b"landscape"))
            .await
            .unwrap_err();

        assert!(matches!(err, ServiceError::NoFaceDetected));
        assert!(h.store.list_people("pair-1").await.unwrap().is_empty());
        assert_eq!(h.provider.calls().len(), 1);
        assert!(!h.provider.calls()[0].exists());
        assert_eq!(h.staged_files(), 0);
    }

    #[tokio::test]
    async fn enroll_rejects_blank_fields_before_any_work() {
        let h = harness().await;
        let mut person = new_person("pair-1", "Alice");
        person.occupation = String::new();
        let err = h.service.enroll(person, png(b"alice")).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidInput(ref m) if m == "occupation is required"));
        assert!(h.provider.calls().is_empty());
    }

    #[tokio::test]
    async fn enroll_rejects_non_image_upload() {
        let h = harness().await;
        let err = h
            .service
            .enroll(new_person("pair-1", "Alice"), b"plain text".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Storage(StorageError::NotAnImage)));
    }

    #[tokio::test]
    async fn enroll_tolerates_embedding_insert_failure() {
        let h = harness().await;
        h.store
            .execute_batch(
                "CREATE TRIGGER reject_embeddings BEFORE INSERT ON face_embeddings \
                 BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
            )
            .await
            .unwrap();

        let person = h
            .service
            .enroll(new_person("pair-1", "Alice"), png(b"alice"))
            .await
            .unwrap();
        assert!(h.store.get_person(person.id).await.unwrap().is_some());
        assert!(h.store.get_embedding(person.id).await.unwrap().is_none());

        // Without an embedding the person cannot be matched.
        let outcome = h
            .service
            .scan_embedding("pair-1", &Embedding::new(vec![1.0, 0.0, 0.0]))
            .await
            .unwrap();
        assert!(!outcome.matched);
    }

    #[tokio::test]
    async fn enroll_with_wrong_dimension_provider_output_fails() {
        let h = harness().await;
        h.provider.add_face(&png(b"wide"), vec![1.0, 0.0, 0.0, 0.0]);
        let err = h
            .service
            .enroll(new_person("pair-1", "Wide"), png(b"wide"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Provider(ProviderError::Embedding(_))));
        assert!(h.store.list_people("pair-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn scan_finds_best_match_within_pair() {
        let h = harness().await;
        let alice = h
            .service
            .enroll(new_person("pair-1", "Alice"), png(b"alice"))
            .await
            .unwrap();
        h.service
            .enroll(new_person("pair-1", "Bob"), png(b"bob"))
            .await
            .unwrap();
        h.service
            .enroll(new_person("pair-2", "Carol"), png(b"carol"))
            .await
            .unwrap();

        let outcome = h
            .service
            .scan_embedding("pair-1", &Embedding::new(vec![0.9, 0.1, 0.0]))
            .await
            .unwrap();
        assert!(outcome.matched);
        assert_eq!(outcome.person.unwrap().id, alice.id);
        assert!(outcome.score.unwrap() > 0.9);

        // Carol is enrolled, but in another pair.
        let outcome = h
            .service
            .scan_embedding("pair-1", &Embedding::new(vec![0.0, 0.0, 1.0]))
            .await
            .unwrap();
        assert!(!outcome.matched);
        assert!(outcome.score.is_none());
        assert!(outcome.person.is_none());
    }

    #[tokio::test]
    async fn scan_empty_pair_is_unmatched() {
        let h = harness().await;
        let outcome = h
            .service
            .scan_embedding("pair-empty", &Embedding::new(vec![1.0, 0.0, 0.0]))
            .await
            .unwrap();
        assert!(!outcome.matched);
    }

    #[tokio::test]
    async fn scan_rejects_wrong_dimensions() {
        let h = harness().await;
        let err = h
            .service
            .scan_embedding("pair-1", &Embedding::new(vec![1.0, 0.0]))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn scan_skips_stored_embeddings_of_wrong_dimension() {
        let h = harness().await;
        let legacy = h
            .store
            .insert_person(&new_person("pair-1", "Legacy"), "u")
            .await
            .unwrap();
        h.store
            .insert_embedding(legacy.id, &Embedding::new(vec![1.0, 0.0]))
            .await
            .unwrap();

        let outcome = h
            .service
            .scan_embedding("pair-1", &Embedding::new(vec![1.0, 0.0, 0.0]))
            .await
            .unwrap();
        assert!(!outcome.matched);
    }

    #[tokio::test]
    async fn scan_trusts_recorded_dimension_column() {
        let h = harness().await;
        let alice = h
            .service
            .enroll(new_person("pair-1", "Alice"), png(b"alice"))
            .await
            .unwrap();
        let probe = Embedding::new(vec![1.0, 0.0, 0.0]);
        let outcome = h.service.scan_embedding("pair-1", &probe).await.unwrap();
        assert_eq!(outcome.person.unwrap().id, alice.id);

        // The blob still decodes to 3 values, but the row claims otherwise.
        h.store
            .execute_batch("UPDATE face_embeddings SET dimensions = 512;")
            .await
            .unwrap();
        let outcome = h.service.scan_embedding("pair-1", &probe).await.unwrap();
        assert!(!outcome.matched);
    }

    #[tokio::test]
    async fn embedding_dim_follows_provider() {
        let h = harness().await;
        assert_eq!(h.service.embedding_dim(), DIM);

        let provider = Arc::new(MockEmbeddingProvider::new(7));
        let images = ImageStorage::new(
            h.dir.path().join("tmp"),
            Arc::new(LocalBlobStore::new(h.dir.path().join("blobs"), "http://cdn.test")),
        );
        let service = FaceService::new(h.store.clone(), provider, images, 0.6);
        assert_eq!(service.embedding_dim(), 7);
    }

    #[tokio::test]
    async fn scan_image_delegates_and_cleans_up() {
        let h = harness().await;
        let bob = h
            .service
            .enroll(new_person("pair-1", "Bob"), png(b"bob"))
            .await
            .unwrap();

        let outcome = h.service.scan_image("pair-1", png(b"bob")).await.unwrap();
        assert!(outcome.matched);
        assert_eq!(outcome.person.unwrap().id, bob.id);
        assert!((outcome.score.unwrap() - 1.0).abs() < 1e-6);

        let outcome = h
            .service
            .scan_image("pair-1", png(b"landscape"))
            .await
            .unwrap();
        assert!(!outcome.matched);
        assert_eq!(h.staged_files(), 0);
    }

    #[tokio::test]
    async fn scan_image_provider_failure_is_error() {
        let h = harness().await;
        h.provider.set_failing(true);
        let err = h.service.scan_image("pair-1", png(b"bob")).await.unwrap_err();
        assert!(matches!(err, ServiceError::Provider(ProviderError::Unavailable)));
        assert_eq!(h.staged_files(), 0);
    }

    #[tokio::test]
    async fn update_fields_only() {
        let h = harness().await;
        let alice = h
            .service
            .enroll(new_person("pair-1", "Alice"), png(b"alice"))
            .await
            .unwrap();

        let patch = PersonPatch {
            occupation: Some("Architect".into()),
            age: Some(30),
            ..Default::default()
        };
        let updated = h.service.update(alice.id, patch, None).await.unwrap();
        assert_eq!(updated.occupation, "Architect");
        assert_eq!(updated.age, Some(30));
        assert_eq!(updated.name, alice.name);
        assert_eq!(updated.image_url, alice.image_url);
        assert_eq!(updated.notes, alice.notes);
    }

    #[tokio::test]
    async fn update_image_replaces_photo_and_embedding() {
        let h = harness().await;
        let alice = h
            .service
            .enroll(new_person("pair-1", "Alice"), png(b"alice"))
            .await
            .unwrap();

        let updated = h
            .service
            .update(alice.id, PersonPatch::default(), Some(png(b"bob")))
            .await
            .unwrap();

        assert_ne!(updated.image_url, alice.image_url);
        assert_eq!(updated.name, alice.name);
        assert_eq!(updated.relationship, alice.relationship);
        assert_eq!(updated.occupation, alice.occupation);
        assert_eq!(updated.age, alice.age);
        assert_eq!(updated.notes, alice.notes);

        let blob = h.store.get_embedding(alice.id).await.unwrap().unwrap();
        assert_eq!(Embedding::from_le_bytes(&blob).unwrap().values, vec![0.0, 1.0, 0.0]);
        assert_eq!(h.staged_files(), 0);
    }

    #[tokio::test]
    async fn update_image_without_face_leaves_person_untouched() {
        let h = harness().await;
        let alice = h
            .service
            .enroll(new_person("pair-1", "Alice"), png(b"alice"))
            .await
            .unwrap();

        let patch = PersonPatch {
            name: Some("Renamed".into()),
            ..Default::default()
        };
        let err = h
            .service
            .update(alice.id, patch, Some(png(b"landscape")))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NoFaceInNewImage));

        let stored = h.store.get_person(alice.id).await.unwrap().unwrap();
        assert_eq!(stored, alice);
        let blob = h.store.get_embedding(alice.id).await.unwrap().unwrap();
        assert_eq!(Embedding::from_le_bytes(&blob).unwrap().values, vec![1.0, 0.0, 0.0]);
    }

    #[tokio::test]
    async fn update_with_nothing_is_rejected() {
        let h = harness().await;
        let err = h
            .service
            .update(1, PersonPatch::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NothingToUpdate));
    }

    #[tokio::test]
    async fn update_missing_person() {
        let h = harness().await;
        let patch = PersonPatch {
            name: Some("Ghost".into()),
            ..Default::default()
        };
        let err = h.service.update(404, patch, None).await.unwrap_err();
        assert!(matches!(err, ServiceError::PersonNotFound(404)));

        // The existence check runs before the image reaches the provider.
        let err = h
            .service
            .update(404, PersonPatch::default(), Some(png(b"alice")))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::PersonNotFound(404)));
        assert!(h.provider.calls().is_empty());
    }

    #[tokio::test]
    async fn delete_removes_person_and_embedding() {
        let h = harness().await;
        let alice = h
            .service
            .enroll(new_person("pair-1", "Alice"), png(b"alice"))
            .await
            .unwrap();

        h.service.delete(alice.id).await.unwrap();
        assert!(h.store.get_person(alice.id).await.unwrap().is_none());
        assert_eq!(h.store.count_embeddings().await.unwrap(), 0);

        let err = h.service.delete(alice.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::PersonNotFound(id) if id == alice.id));
    }

    #[tokio::test]
    async fn list_requires_pair() {
        let h = harness().await;
        let err = h.service.list_people(" ").await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidInput(_)));
    }
}

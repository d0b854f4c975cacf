use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Generated identifier of an enrolled person.
pub type PersonId = i64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EmbeddingError {
    #[error("expected {expected}-dim embedding, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("embedding blob length {0} is not a multiple of 4")]
    MalformedBlob(usize),
}

/// Face embedding vector (512-dimensional for Facenet512).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dimensions(&self) -> usize {
        self.values.len()
    }

    /// Reject vectors whose length differs from the configured dimensionality.
    pub fn check_dimensions(&self, expected: usize) -> Result<(), EmbeddingError> {
        if self.values.len() != expected {
            return Err(EmbeddingError::DimensionMismatch {
                expected,
                got: self.values.len(),
            });
        }
        Ok(())
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar. A zero vector on
    /// either side yields 0.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            (dot / denom).clamp(-1.0, 1.0)
        } else {
            0.0
        }
    }

    /// L2-normalize in place. Zero vectors are left untouched.
    pub fn normalize(&mut self) {
        let norm: f32 = self.values.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut self.values {
                *v /= norm;
            }
        }
    }

    /// Little-endian f32 encoding used for BLOB storage.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.values.len() * 4);
        for &val in &self.values {
            bytes.extend_from_slice(&val.to_le_bytes());
        }
        bytes
    }

    pub fn from_le_bytes(bytes: &[u8]) -> Result<Self, EmbeddingError> {
        if bytes.len() % 4 != 0 {
            return Err(EmbeddingError::MalformedBlob(bytes.len()));
        }
        let values = bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        Ok(Self { values })
    }
}

/// An enrolled person within a pair namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub id: PersonId,
    pub pair_id: String,
    pub name: String,
    pub relationship: String,
    pub occupation: String,
    pub age: Option<u32>,
    pub notes: Option<String>,
    pub image_url: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Profile fields supplied at enrollment time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPerson {
    pub pair_id: String,
    pub name: String,
    pub relationship: String,
    pub occupation: String,
    pub age: Option<u32>,
    pub notes: Option<String>,
}

impl NewPerson {
    /// Name of the first required field that is blank, if any.
    pub fn blank_field(&self) -> Option<&'static str> {
        [
            ("pair_id", &self.pair_id),
            ("name", &self.name),
            ("relationship", &self.relationship),
            ("occupation", &self.occupation),
        ]
        .into_iter()
        .find(|(_, value)| value.trim().is_empty())
        .map(|(field, _)| field)
    }
}

/// Partial update of a person. Every `Some` field overwrites the stored
/// value; `None` leaves it untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersonPatch {
    pub name: Option<String>,
    pub relationship: Option<String>,
    pub occupation: Option<String>,
    pub age: Option<u32>,
    pub notes: Option<String>,
    pub image_url: Option<String>,
}

impl PersonPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.relationship.is_none()
            && self.occupation.is_none()
            && self.age.is_none()
            && self.notes.is_none()
            && self.image_url.is_none()
    }

    pub fn apply(&self, person: &mut Person) {
        if let Some(name) = &self.name {
            person.name.clone_from(name);
        }
        if let Some(relationship) = &self.relationship {
            person.relationship.clone_from(relationship);
        }
        if let Some(occupation) = &self.occupation {
            person.occupation.clone_from(occupation);
        }
        if let Some(age) = self.age {
            person.age = Some(age);
        }
        if let Some(notes) = &self.notes {
            person.notes = Some(notes.clone());
        }
        if let Some(image_url) = &self.image_url {
            person.image_url.clone_from(image_url);
        }
    }
}

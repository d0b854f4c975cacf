//! anchor-core: face matching for the Cogni Anchor enrollment service.
//!
//! Holds the person and embedding types, the cosine best-match policy, and
//! the client contract for the external embedding provider.

pub mod matcher;
pub mod provider;
pub mod types;

pub use matcher::{
    find_best_match, BestMatch, Candidate, CosineMatcher, Matcher, DEFAULT_SIMILARITY_THRESHOLD,
};
pub use provider::{EmbeddingProvider, HttpEmbeddingProvider, MockEmbeddingProvider, ProviderError};
pub use types::{Embedding, EmbeddingError, NewPerson, Person, PersonId, PersonPatch};

//! Best-match selection over a pair's enrolled face embeddings.

use crate::types::{Embedding, PersonId};

/// Default similarity gate for a positive match.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.6;

/// An enrolled person's stored embedding.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub person_id: PersonId,
    pub embedding: Embedding,
}

impl Candidate {
    pub fn new(person_id: PersonId, embedding: Embedding) -> Self {
        Self {
            person_id,
            embedding,
        }
    }
}

/// The winning candidate and its similarity score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BestMatch {
    pub person_id: PersonId,
    pub score: f32,
}

/// Strategy for comparing a probe embedding against a gallery of enrolled faces.
pub trait Matcher {
    fn best_match(&self, probe: &Embedding, gallery: &[Candidate], threshold: f32)
        -> Option<BestMatch>;
}

/// Cosine similarity matcher.
///
/// Always scores every gallery entry. Only a strictly greater score replaces
/// the current best, so among equal maxima the earliest entry wins.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn best_match(
        &self,
        probe: &Embedding,
        gallery: &[Candidate],
        threshold: f32,
    ) -> Option<BestMatch> {
        let mut best: Option<BestMatch> = None;

        for candidate in gallery {
            let score = probe.similarity(&candidate.embedding);
            let is_better = match &best {
                None => !score.is_nan(),
                Some(prev) => score > prev.score,
            };
            if is_better {
                best = Some(BestMatch {
                    person_id: candidate.person_id,
                    score,
                });
            }
        }

        let best = best?;
        tracing::debug!(
            person_id = best.person_id,
            score = best.score,
            threshold,
            gallery = gallery.len(),
            "best candidate"
        );
        (best.score >= threshold).then_some(best)
    }
}

/// Return the highest-scoring candidate whose cosine similarity to `query`
/// reaches `threshold`, or `None` when the gallery is empty or every score
/// falls below it.
pub fn find_best_match(
    query: &Embedding,
    candidates: &[Candidate],
    threshold: f32,
) -> Option<BestMatch> {
    CosineMatcher.best_match(query, candidates, threshold)
}

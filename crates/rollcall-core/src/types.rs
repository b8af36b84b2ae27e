use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Dimensionality of a face embedding. The upstream face pipeline always
/// produces 128-dimensional descriptors; any other length is invalid.
pub const EMBEDDING_DIM: usize = 128;

#[derive(Error, Debug)]
pub enum MatchError {
    #[error("probe embedding has {0} dimensions, expected {EMBEDDING_DIM}")]
    BadProbe(usize),
}

/// Face embedding vector (128-dimensional).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// Whether this embedding is usable for matching: exactly
    /// [`EMBEDDING_DIM`] values, all finite.
    pub fn is_valid(&self) -> bool {
        self.values.len() == EMBEDDING_DIM && self.values.iter().all(|v| v.is_finite())
    }

    /// Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// An enrolled staff face: identity plus its registered embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrolledFace {
    pub staff_id: String,
    pub name: String,
    pub embedding: Embedding,
}

/// Best match found for a probe embedding.
#[derive(Debug, Clone, Serialize)]
pub struct MatchResult {
    pub staff_id: String,
    pub name: String,
    /// Euclidean distance of the winning candidate.
    pub distance: f32,
}

/// Strategy for resolving a probe embedding against a gallery of
/// enrolled faces.
pub trait Matcher {
    fn find_match(
        &self,
        probe: &Embedding,
        gallery: &[EnrolledFace],
        threshold: f32,
    ) -> Result<Option<MatchResult>, MatchError>;
}

/// Euclidean nearest-neighbor matcher with full-gallery traversal.
///
/// Always iterates every gallery entry, no early exit. A match is
/// accepted only when the global minimum distance is strictly below the
/// threshold; a distance exactly equal to the threshold is rejected.
/// Ties keep the first candidate encountered.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn find_match(
        &self,
        probe: &Embedding,
        gallery: &[EnrolledFace],
        threshold: f32,
    ) -> Result<Option<MatchResult>, MatchError> {
        if probe.values.len() != EMBEDDING_DIM {
            return Err(MatchError::BadProbe(probe.values.len()));
        }

        let mut best_dist = f32::INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, face) in gallery.iter().enumerate() {
            // Malformed gallery entries are a data-quality problem, not a
            // matching failure: skip them.
            if !face.embedding.is_valid() {
                tracing::debug!(staff_id = %face.staff_id, "skipping malformed embedding");
                continue;
            }
            let dist = probe.euclidean_distance(&face.embedding);
            if !dist.is_finite() {
                continue;
            }
            if dist < best_dist {
                best_dist = dist;
                best_idx = Some(i);
            }
        }

        match best_idx {
            Some(idx) if best_dist < threshold => Ok(Some(MatchResult {
                staff_id: gallery[idx].staff_id.clone(),
                name: gallery[idx].name.clone(),
                distance: best_dist,
            })),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn embedding(fill: f32) -> Embedding {
        Embedding::new(vec![fill; EMBEDDING_DIM])
    }

    fn face(staff_id: &str, name: &str, embedding: Embedding) -> EnrolledFace {
        EnrolledFace {
            staff_id: staff_id.into(),
            name: name.into(),
            embedding,
        }
    }

    #[test]
    fn test_euclidean_distance_identical_is_zero() {
        let a = embedding(0.5);
        assert_eq!(a.euclidean_distance(&a), 0.0);
    }

    #[test]
    fn test_euclidean_distance_known_offset() {
        // Differ by 0.1 in every one of 128 dimensions:
        // sqrt(128 * 0.01) ≈ 1.1314
        let a = embedding(0.0);
        let b = embedding(0.1);
        let d = a.euclidean_distance(&b);
        assert!((d - (128.0f32 * 0.01).sqrt()).abs() < 1e-5, "got {d}");
    }

    #[test]
    fn test_empty_gallery_no_match() {
        let result = EuclideanMatcher
            .find_match(&embedding(0.0), &[], 0.6)
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_self_match_any_positive_threshold() {
        let probe = embedding(0.3);
        let gallery = vec![face("s1", "Alice", probe.clone())];
        let result = EuclideanMatcher
            .find_match(&probe, &gallery, 1e-6)
            .unwrap()
            .expect("distance 0 is below any positive threshold");
        assert_eq!(result.staff_id, "s1");
        assert_eq!(result.distance, 0.0);
    }

    #[test]
    fn test_threshold_boundary_is_exclusive() {
        // One dimension differs by exactly 0.5 — distance is 0.5.
        let probe = embedding(0.0);
        let mut other = embedding(0.0);
        other.values[0] = 0.5;
        let gallery = vec![face("s1", "Alice", other)];

        let at = EuclideanMatcher.find_match(&probe, &gallery, 0.5).unwrap();
        assert!(at.is_none(), "distance == threshold must reject");

        let above = EuclideanMatcher
            .find_match(&probe, &gallery, 0.5 + 1e-4)
            .unwrap();
        assert!(above.is_some(), "distance < threshold must accept");
    }

    #[test]
    fn test_global_minimum_wins() {
        let probe = embedding(0.0);
        let gallery = vec![
            face("far", "Far", embedding(0.2)),
            face("near", "Near", embedding(0.01)),
            face("mid", "Mid", embedding(0.1)),
        ];
        let result = EuclideanMatcher
            .find_match(&probe, &gallery, 10.0)
            .unwrap()
            .unwrap();
        assert_eq!(result.staff_id, "near");
    }

    #[test]
    fn test_tie_break_first_encountered() {
        let probe = embedding(0.0);
        let gallery = vec![
            face("first", "First", embedding(0.1)),
            face("second", "Second", embedding(0.1)),
        ];
        let result = EuclideanMatcher
            .find_match(&probe, &gallery, 10.0)
            .unwrap()
            .unwrap();
        assert_eq!(result.staff_id, "first");
    }

    #[test]
    fn test_malformed_candidates_skipped() {
        let probe = embedding(0.0);
        let mut nan = embedding(0.0);
        nan.values[7] = f32::NAN;
        let gallery = vec![
            face("short", "Short", Embedding::new(vec![0.0; 3])),
            face("nan", "NaN", nan),
            face("ok", "Ok", embedding(0.05)),
        ];
        let result = EuclideanMatcher
            .find_match(&probe, &gallery, 10.0)
            .unwrap()
            .unwrap();
        assert_eq!(result.staff_id, "ok");
    }

    #[test]
    fn test_bad_probe_fails_fast() {
        let probe = Embedding::new(vec![0.0; 64]);
        let err = EuclideanMatcher
            .find_match(&probe, &[], 0.6)
            .unwrap_err();
        assert!(matches!(err, MatchError::BadProbe(64)));
    }
}

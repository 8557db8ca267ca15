//! Nearest-neighbor matching of a query descriptor against the gallery.

use crate::gallery::Gallery;
use crate::types::{Descriptor, MatchResult};

/// Default maximum Euclidean distance for a positive match.
///
/// Tuned for 128-d face-api descriptors. On L2-normalised ArcFace
/// embeddings it corresponds to a cosine similarity of at least ~0.83,
/// which is strict for webcam footage; deployments using those models
/// usually raise it towards 1.0.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.58;

/// Strategy for comparing a query descriptor against a gallery of enrolled faces.
pub trait Matcher {
    fn find_best(&self, query: &Descriptor, gallery: &Gallery) -> MatchResult;
}

/// Exhaustive Euclidean nearest-neighbor matcher.
///
/// Scans every reference descriptor of every identity; the global minimum
/// wins when it is within `threshold`. Exact ties resolve to the identity
/// that comes first in gallery order.
#[derive(Debug, Clone, Copy)]
pub struct EuclideanMatcher {
    threshold: f32,
}

impl EuclideanMatcher {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }
}

impl Default for EuclideanMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_MATCH_THRESHOLD)
    }
}

impl Matcher for EuclideanMatcher {
    fn find_best(&self, query: &Descriptor, gallery: &Gallery) -> MatchResult {
        let mut best_dist = f32::INFINITY;
        let mut best_label: Option<&str> = None;

        for identity in gallery.iter() {
            for reference in identity.descriptors() {
                let dist = query.distance(reference);
                // Strict comparison keeps the earliest identity on ties.
                if dist < best_dist {
                    best_dist = dist;
                    best_label = Some(identity.label());
                }
            }
        }

        match best_label {
            Some(label) if best_dist <= self.threshold => MatchResult {
                identity: Some(label.to_string()),
                distance: best_dist,
            },
            _ => MatchResult::unknown(best_dist),
        }
    }
}

//! Nearest-neighbour matching of a probe descriptor against the enrolled gallery.

use crate::types::{Descriptor, FaceDescriptor, Subject};

/// Default maximum Euclidean distance for a positive match (inclusive).
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

/// Best gallery entry for a probe.
#[derive(Debug, Clone, PartialEq)]
pub struct Match {
    pub subject: Subject,
    /// Id of the enrolled record that produced the minimum distance.
    pub descriptor_id: String,
    pub distance: f32,
}

/// Result of comparing a probe against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    /// The gallery held nothing comparable to the probe.
    NoCandidates,
    /// Nearest entry was farther than the threshold.
    Rejected { distance: f32 },
    Matched(Match),
}

impl MatchOutcome {
    pub fn into_match(self) -> Option<Match> {
        match self {
            MatchOutcome::Matched(m) => Some(m),
            _ => None,
        }
    }

    /// Distance to the nearest comparable entry, matched or not.
    pub fn nearest_distance(&self) -> Option<f32> {
        match self {
            MatchOutcome::NoCandidates => None,
            MatchOutcome::Rejected { distance } => Some(*distance),
            MatchOutcome::Matched(m) => Some(m.distance),
        }
    }
}

/// Strategy for comparing a probe descriptor against enrolled faces.
pub trait Matcher {
    fn compare(&self, probe: &Descriptor, gallery: &[FaceDescriptor], threshold: f32) -> MatchOutcome;
}

/// Brute-force Euclidean matcher.
///
/// O(n) in the gallery size. Entries whose length differs from the probe,
/// or whose distance is not finite, are skipped. Ties keep the first entry seen.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(&self, probe: &Descriptor, gallery: &[FaceDescriptor], threshold: f32) -> MatchOutcome {
        let mut best: Option<(usize, f32)> = None;

        for (i, entry) in gallery.iter().enumerate() {
            if entry.descriptor.len() != probe.len() {
                tracing::debug!(
                    id = %entry.id,
                    expected = probe.len(),
                    actual = entry.descriptor.len(),
                    "skipping descriptor with mismatched length"
                );
                continue;
            }
            let distance = probe.euclidean_distance(&entry.descriptor);
            if !distance.is_finite() {
                tracing::debug!(id = %entry.id, "skipping descriptor with non-finite distance");
                continue;
            }
            if best.map_or(true, |(_, d)| distance < d) {
                best = Some((i, distance));
            }
        }

        match best {
            None => MatchOutcome::NoCandidates,
            Some((idx, distance)) if distance <= threshold => {
                let entry = &gallery[idx];
                MatchOutcome::Matched(Match {
                    subject: entry.subject(),
                    descriptor_id: entry.id.clone(),
                    distance,
                })
            }
            Some((_, distance)) => MatchOutcome::Rejected { distance },
        }
    }
}

/// Map a distance to a confidence in [0, 1]: 1 at zero distance, 0 at the threshold.
pub fn confidence(distance: f32, threshold: f32) -> f32 {
    if threshold <= 0.0 {
        return if distance <= 0.0 { 1.0 } else { 0.0 };
    }
    (1.0 - distance / threshold).clamp(0.0, 1.0)
}

use crate::gallery::Gallery;
use crate::types::{Encoding, MatchResult};

/// Default maximum Euclidean distance for a positive identification.
pub const DEFAULT_TOLERANCE: f32 = 0.7;

/// Compares a query encoding against an enrolled gallery.
pub trait Matcher {
    fn compare(&self, query: &Encoding, gallery: &Gallery, tolerance: f32) -> MatchResult;
}

/// Nearest-neighbour matcher over Euclidean distance.
///
/// Linear scan; the candidate is the entry with the smallest distance and
/// the first one in gallery order wins an exact tie. Acceptance is
/// `distance <= tolerance`.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(&self, query: &Encoding, gallery: &Gallery, tolerance: f32) -> MatchResult {
        let mut best: Option<(&str, f32)> = None;

        for entry in gallery.entries() {
            let distance = query.distance(&entry.encoding);
            // Strict `<` keeps the earliest entry on ties.
            if best.map_or(true, |(_, d)| distance < d) {
                best = Some((&entry.name, distance));
            }
        }

        match best {
            Some((name, distance)) if distance <= tolerance => MatchResult {
                name: name.to_string(),
                distance,
                accepted: true,
            },
            Some((_, distance)) => MatchResult::unknown(distance),
            None => MatchResult::unknown(f32::INFINITY),
        }
    }
}

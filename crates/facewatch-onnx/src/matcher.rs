//! Brute-force gallery search by cosine distance.

use facewatch_core::gateway::SearchAcceleration;
use facewatch_core::{DatabaseElement, SearchResult, Template};
use std::collections::HashSet;

#[derive(Default)]
pub struct Matcher {
    elements: Vec<DatabaseElement>,
    acceleration: SearchAcceleration,
}

impl Matcher {
    pub fn new(elements: Vec<DatabaseElement>, acceleration: SearchAcceleration) -> Self {
        Self {
            elements,
            acceleration,
        }
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Up to `k` elements within their distance threshold, nearest first.
    ///
    /// When nothing qualifies, the result is a single not-found entry carrying
    /// the nearest distance seen (infinity for an empty gallery).
    pub fn search(&self, query: &Template, k: usize) -> Vec<SearchResult> {
        let mut hits: Vec<SearchResult> = Vec::new();
        let mut nearest = f32::INFINITY;
        let mut settled: HashSet<u64> = HashSet::new();

        for element in &self.elements {
            if self.acceleration == SearchAcceleration::Heuristic
                && settled.contains(&element.person_id)
            {
                continue;
            }

            let distance = query.distance(&element.template);
            nearest = nearest.min(distance);
            if distance > element.distance_threshold {
                continue;
            }

            if distance < element.distance_threshold / 2.0 {
                settled.insert(element.person_id);
            }
            hits.push(SearchResult {
                element_id: Some(element.element_id),
                person_id: Some(element.person_id),
                distance,
            });
        }

        if hits.is_empty() {
            return vec![SearchResult::not_found(nearest)];
        }

        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        hits.truncate(k.max(1));
        hits
    }
}

//! Sensor-reading token and its per-node merge step.

use crate::acquisition::window::SlidingWindowReducer;
use crate::types::{NodeId, Reading};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, trace};
use uuid::Uuid;

/// Token that collects one reading per ring member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReadingsToken {
    /// Distinguishes one round from the next.
    pub generation_id: String,
    pub last_measurements: BTreeMap<NodeId, Reading>,
}

impl SensorReadingsToken {
    /// Start a new generation with no readings.
    pub fn mint() -> Self {
        Self {
            generation_id: Uuid::new_v4().to_string(),
            last_measurements: BTreeMap::new(),
        }
    }

    /// Whether `id` already contributed to this round.
    pub fn contains(&self, id: NodeId) -> bool {
        self.last_measurements.contains_key(&id)
    }

    /// Whether every id in `members` contributed.
    pub fn covers(&self, members: &BTreeSet<NodeId>) -> bool {
        members.iter().all(|id| self.contains(*id))
    }

    fn with_measurement(mut self, id: NodeId, reading: Reading) -> Self {
        self.last_measurements.insert(id, reading);
        self
    }
}

/// Readings of a finished round.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedRound {
    pub generation_id: String,
    pub readings: BTreeMap<NodeId, Reading>,
}

/// Result of merging the local reading into a token.
#[derive(Debug, Clone, PartialEq)]
pub struct Circulation {
    /// Token to hand on.
    pub token: SensorReadingsToken,
    /// Set when this step completed a round.
    pub completed: Option<CompletedRound>,
}

/// Number of completed generations remembered for duplicate detection.
const COMPLETED_GENERATIONS_KEPT: usize = 16;

/// Merges local readings into passing sensor tokens.
pub struct TokenCirculationEngine {
    my_id: NodeId,
    reducer: Arc<SlidingWindowReducer>,
    /// Generations this node completed, oldest first.
    completed: Mutex<VecDeque<String>>,
}

impl TokenCirculationEngine {
    pub fn new(my_id: NodeId, reducer: Arc<SlidingWindowReducer>) -> Self {
        Self {
            my_id,
            reducer,
            completed: Mutex::new(VecDeque::with_capacity(COMPLETED_GENERATIONS_KEPT)),
        }
    }

    /// Whether this node already completed `generation_id`.
    pub fn has_completed(&self, generation_id: &str) -> bool {
        self.completed.lock().iter().any(|g| g == generation_id)
    }

    fn record_completed(&self, generation_id: &str) {
        let mut completed = self.completed.lock();
        if completed.len() == COMPLETED_GENERATIONS_KEPT {
            completed.pop_front();
        }
        completed.push_back(generation_id.to_string());
    }

    /// Add this node's reading if missing and detect round completion.
    ///
    /// Completion hands back the collected readings and a fresh generation.
    /// Returns `None` for a copy of a generation this node already completed;
    /// such a copy is dropped so every generation is published at most once.
    pub fn merge_and_check_completion(
        &self,
        token: SensorReadingsToken,
        known_ids: &BTreeSet<NodeId>,
    ) -> Option<Circulation> {
        if self.has_completed(&token.generation_id) {
            debug!(
                node_id = self.my_id,
                generation = %token.generation_id,
                "Dropping copy of an already completed generation"
            );
            return None;
        }

        let token = if token.contains(self.my_id) {
            trace!(node_id = self.my_id, "Token already holds a reading from this node");
            token
        } else {
            match self.reducer.poll_reduced() {
                Some(reading) => token.with_measurement(self.my_id, reading),
                None => {
                    trace!(node_id = self.my_id, "No reading available yet");
                    token
                }
            }
        };

        if !token.covers(known_ids) {
            return Some(Circulation {
                token,
                completed: None,
            });
        }

        self.record_completed(&token.generation_id);
        let next = SensorReadingsToken::mint();
        debug!(
            node_id = self.my_id,
            generation = %token.generation_id,
            next_generation = %next.generation_id,
            "Sensor round complete"
        );

        Some(Circulation {
            token: next,
            completed: Some(CompletedRound {
                generation_id: token.generation_id,
                readings: token.last_measurements,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WindowConfig;

    fn engine_with_readings(id: NodeId, readings: &[f64]) -> TokenCirculationEngine {
        let reducer = Arc::new(SlidingWindowReducer::new(WindowConfig {
            capacity: 1,
            overlap: 1.0,
        }));
        for r in readings {
            reducer.push(*r);
        }
        TokenCirculationEngine::new(id, reducer)
    }

    fn ids(ids: &[NodeId]) -> BTreeSet<NodeId> {
        ids.iter().copied().collect()
    }

    #[test]
    fn test_merge_adds_reading_once() {
        let engine = engine_with_readings(2, &[5.0, 7.0]);
        let members = ids(&[1, 2, 3]);

        let first = engine
            .merge_and_check_completion(SensorReadingsToken::mint(), &members)
            .unwrap();
        assert!(first.completed.is_none());
        assert_eq!(first.token.last_measurements.get(&2), Some(&5.0));

        let second = engine
            .merge_and_check_completion(first.token.clone(), &members)
            .unwrap();
        assert_eq!(second.token, first.token);
        // The second reading stays queued for the next round.
        assert_eq!(engine.reducer.pending(), 1);
    }

    #[test]
    fn test_token_passes_through_without_reading() {
        let engine = engine_with_readings(2, &[]);
        let token = SensorReadingsToken::mint();
        let out = engine
            .merge_and_check_completion(token.clone(), &ids(&[1, 2]))
            .unwrap();
        assert_eq!(out.token, token);
        assert!(out.completed.is_none());
    }

    #[test]
    fn test_completion_yields_fresh_generation() {
        let engine = engine_with_readings(3, &[9.0]);
        let mut token = SensorReadingsToken::mint();
        token.last_measurements.insert(1, 1.0);
        token.last_measurements.insert(2, 2.0);
        let generation = token.generation_id.clone();

        let out = engine
            .merge_and_check_completion(token, &ids(&[1, 2, 3]))
            .unwrap();
        let round = out.completed.unwrap();
        assert_eq!(round.generation_id, generation);
        assert_eq!(round.readings.keys().copied().collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(round.readings[&3], 9.0);

        assert!(out.token.last_measurements.is_empty());
        assert_ne!(out.token.generation_id, generation);
    }

    #[test]
    fn test_completion_on_superset_of_members() {
        // A member that left the ring still counts as covered.
        let engine = engine_with_readings(1, &[]);
        let mut token = SensorReadingsToken::mint();
        token.last_measurements.insert(1, 1.0);
        token.last_measurements.insert(4, 4.0);

        let out = engine.merge_and_check_completion(token, &ids(&[1])).unwrap();
        assert!(out.completed.is_some());
    }

    #[test]
    fn test_completed_generation_is_not_published_twice() {
        let engine = engine_with_readings(3, &[3.0, 4.0]);
        let members = ids(&[1, 2, 3]);
        let mut token = SensorReadingsToken::mint();
        token.last_measurements.insert(1, 1.0);
        token.last_measurements.insert(2, 2.0);

        let first = engine
            .merge_and_check_completion(token.clone(), &members)
            .unwrap();
        assert!(first.completed.is_some());
        assert!(engine.has_completed(&token.generation_id));

        // A second copy of the same generation is dropped and keeps its reading queued.
        assert!(engine.merge_and_check_completion(token, &members).is_none());
        assert_eq!(engine.reducer.pending(), 1);

        // The fresh generation still circulates.
        let next = engine
            .merge_and_check_completion(first.token, &members)
            .unwrap();
        assert!(next.completed.is_none());
    }

    #[test]
    fn test_completed_generations_are_bounded() {
        let engine = engine_with_readings(1, &[]);
        let members = ids(&[1]);
        let mut oldest = None;
        for i in 0..=COMPLETED_GENERATIONS_KEPT {
            let mut token = SensorReadingsToken::mint();
            token.last_measurements.insert(1, i as f64);
            if i == 0 {
                oldest = Some(token.generation_id.clone());
            }
            assert!(engine
                .merge_and_check_completion(token, &members)
                .unwrap()
                .completed
                .is_some());
        }

        assert_eq!(engine.completed.lock().len(), COMPLETED_GENERATIONS_KEPT);
        assert!(!engine.has_completed(&oldest.unwrap()));
    }
}

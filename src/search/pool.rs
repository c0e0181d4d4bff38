//! Running-score pool over every prompt candidate seen so far.
//!
//! The pool is keyed by exact prompt text. A candidate scored in several
//! rounds accumulates a running mean of its per-round batch scores, so
//! prompts that survive across rounds are judged on more data than
//! one-round wonders.

use crate::models::{CandidateOrigin, PromptCandidate, ScoredPrompt};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Accumulated scoring state for one prompt text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolEntry {
    /// Exact prompt text (pool identity).
    pub text: String,
    /// Origin recorded the first time the text was seen.
    pub origin: CandidateOrigin,
    /// Step at which the text first entered the pool.
    pub first_seen_step: usize,
    /// Number of scoring rounds folded into the mean.
    pub rounds: usize,
    /// Running mean of per-round average log-probabilities.
    pub mean_avg_logprob: f64,
    /// Held-out accuracy, filled in by the final rescoring pass.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    /// Total examples this prompt has been scored against.
    pub n_examples_scored: usize,
    /// Whether the text matched the run's answer check.
    #[serde(default)]
    pub matched_check: bool,
}

impl PoolEntry {
    fn to_scored(&self) -> ScoredPrompt {
        ScoredPrompt {
            text: self.text.clone(),
            origin: self.origin.clone(),
            avg_logprob: self.mean_avg_logprob,
            accuracy: self.accuracy,
            n_examples_scored: self.n_examples_scored,
            matched_check: self.matched_check,
            first_seen_step: self.first_seen_step,
        }
    }
}

/// Orders entries best-first: higher mean log-probability wins, ties fall
/// back to accuracy, then to the text itself so ranking is deterministic.
fn rank_order(a: &PoolEntry, b: &PoolEntry) -> Ordering {
    b.mean_avg_logprob
        .partial_cmp(&a.mean_avg_logprob)
        .unwrap_or(Ordering::Equal)
        .then_with(|| {
            let (aa, ba) = (
                a.accuracy.unwrap_or(f64::NEG_INFINITY),
                b.accuracy.unwrap_or(f64::NEG_INFINITY),
            );
            ba.partial_cmp(&aa).unwrap_or(Ordering::Equal)
        })
        .then_with(|| a.text.cmp(&b.text))
}

/// Pool of scored prompt candidates.
#[derive(Debug, Default)]
pub struct PromptPool {
    entries: HashMap<String, PoolEntry>,
}

impl PromptPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fold one round's batch score into the candidate's running mean.
    ///
    /// The first sighting of a text fixes its origin and first-seen step;
    /// later rounds only move the mean and the example count.
    pub fn record_round(
        &mut self,
        candidate: &PromptCandidate,
        avg_logprob: f64,
        n_examples: usize,
        matched_check: bool,
    ) {
        let entry = self
            .entries
            .entry(candidate.text.clone())
            .or_insert_with(|| PoolEntry {
                text: candidate.text.clone(),
                origin: candidate.origin.clone(),
                first_seen_step: candidate.created_step,
                rounds: 0,
                mean_avg_logprob: 0.0,
                accuracy: None,
                n_examples_scored: 0,
                matched_check,
            });

        let folded = entry.mean_avg_logprob * entry.rounds as f64 + avg_logprob;
        entry.rounds += 1;
        entry.mean_avg_logprob = folded / entry.rounds as f64;
        entry.n_examples_scored += n_examples;
        entry.matched_check |= matched_check;
    }

    pub fn get(&self, text: &str) -> Option<&PoolEntry> {
        self.entries.get(text)
    }

    /// Attach a held-out accuracy to an already-scored prompt.
    pub fn set_accuracy(&mut self, text: &str, accuracy: f64) {
        if let Some(entry) = self.entries.get_mut(text) {
            entry.accuracy = Some(accuracy);
        }
    }

    /// Best entry under the ranking order, if any prompt has been scored.
    pub fn best(&self) -> Option<&PoolEntry> {
        self.entries.values().min_by(|a, b| rank_order(a, b))
    }

    /// Top `k` entries, best first.
    pub fn topk(&self, k: usize) -> Vec<&PoolEntry> {
        let mut all: Vec<&PoolEntry> = self.entries.values().collect();
        all.sort_by(|a, b| rank_order(a, b));
        all.truncate(k);
        all
    }

    /// Texts of the top `k` entries, used as the survivor population.
    pub fn population(&self, k: usize) -> Vec<String> {
        self.topk(k).into_iter().map(|e| e.text.clone()).collect()
    }

    /// Every entry as a `ScoredPrompt`, best first.
    pub fn ranked(&self) -> Vec<ScoredPrompt> {
        let mut all: Vec<&PoolEntry> = self.entries.values().collect();
        all.sort_by(|a, b| rank_order(a, b));
        all.into_iter().map(PoolEntry::to_scored).collect()
    }

    /// Serializable snapshot, sorted for stable checkpoint diffs.
    pub fn snapshot(&self) -> Vec<PoolEntry> {
        let mut all: Vec<PoolEntry> = self.entries.values().cloned().collect();
        all.sort_by(rank_order);
        all
    }

    /// Rebuild a pool from a checkpoint snapshot.
    pub fn restore(snapshot: Vec<PoolEntry>) -> Self {
        let entries = snapshot
            .into_iter()
            .map(|e| (e.text.clone(), e))
            .collect();
        Self { entries }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(text: &str, step: usize) -> PromptCandidate {
        PromptCandidate::new(text.to_string(), CandidateOrigin::Generated, step)
    }

    #[test]
    fn test_running_mean_folds_rounds() {
        let mut pool = PromptPool::new();
        let c = candidate("add the numbers", 0);
        pool.record_round(&c, -2.0, 4, false);
        pool.record_round(&c, -1.0, 4, false);

        let entry = pool.get("add the numbers").unwrap();
        assert_eq!(entry.rounds, 2);
        assert!((entry.mean_avg_logprob - (-1.5)).abs() < 1e-9);
        assert_eq!(entry.n_examples_scored, 8);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_first_sighting_fixes_origin_and_step() {
        let mut pool = PromptPool::new();
        pool.record_round(&candidate("same text", 1), -3.0, 2, false);

        let later = PromptCandidate::new(
            "same text".to_string(),
            CandidateOrigin::Resampled,
            5,
        );
        pool.record_round(&later, -1.0, 2, true);

        let entry = pool.get("same text").unwrap();
        assert_eq!(entry.first_seen_step, 1);
        assert!(matches!(entry.origin, CandidateOrigin::Generated));
        assert!(entry.matched_check);
    }

    #[test]
    fn test_topk_orders_by_score_then_accuracy_then_text() {
        let mut pool = PromptPool::new();
        pool.record_round(&candidate("bravo", 0), -1.0, 2, false);
        pool.record_round(&candidate("alpha", 0), -1.0, 2, false);
        pool.record_round(&candidate("charlie", 0), -0.5, 2, false);
        pool.set_accuracy("bravo", 0.9);

        let top = pool.topk(3);
        assert_eq!(top[0].text, "charlie");
        // Equal scores: the one with accuracy set wins the tie.
        assert_eq!(top[1].text, "bravo");
        assert_eq!(top[2].text, "alpha");
        assert_eq!(pool.best().unwrap().text, "charlie");
    }

    #[test]
    fn test_population_shorter_than_k() {
        let mut pool = PromptPool::new();
        pool.record_round(&candidate("only one", 0), -1.0, 2, false);
        assert_eq!(pool.population(8), vec!["only one".to_string()]);
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let mut pool = PromptPool::new();
        pool.record_round(&candidate("keep", 0), -2.0, 4, false);
        pool.record_round(&candidate("keep", 0), -1.0, 4, false);
        pool.record_round(&candidate("drop", 1), -4.0, 4, false);

        let restored = PromptPool::restore(pool.snapshot());
        assert_eq!(restored.len(), 2);
        let entry = restored.get("keep").unwrap();
        assert_eq!(entry.rounds, 2);
        assert!((entry.mean_avg_logprob - (-1.5)).abs() < 1e-9);
        assert_eq!(restored.best().unwrap().text, "keep");
    }
}

//! Candidate prompts, their scored form, and run statistics.

use serde::{Deserialize, Serialize};

use super::{ExegeteError, Result};

/// A prompt under evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptCandidate {
    /// Unique identifier for this candidate
    pub id: String,

    /// The prompt text itself
    pub text: String,

    /// How this candidate entered the search
    pub origin: CandidateOrigin,

    /// Step at which the candidate was first proposed
    pub created_step: usize,
}

impl PromptCandidate {
    pub fn new(text: impl Into<String>, origin: CandidateOrigin, created_step: usize) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            text: text.into(),
            origin,
            created_step,
        }
    }
}

/// How a candidate entered the search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CandidateOrigin {
    /// Supplied by the user before the search started
    Seeded,
    /// Sampled fresh from the demonstrations
    Generated,
    /// Truncated-and-extended from a surviving candidate
    Mutated { parent: String },
    /// Pool survivor rescored on a later batch
    Resampled,
}

/// The reportable form of a candidate: text plus its standing after the
/// search. Sort key is `avg_logprob` descending, higher is better.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredPrompt {
    /// The prompt text
    pub text: String,

    /// How the prompt first entered the search
    pub origin: CandidateOrigin,

    /// Mean per-token log-likelihood of outputs under this prompt
    pub avg_logprob: f64,

    /// Fraction of examples the greedy probe answered correctly
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,

    /// Examples that contributed to the score
    pub n_examples_scored: usize,

    /// Whether the prompt matched the known ground-truth pattern
    pub matched_check: bool,

    /// Step at which the prompt was first scored
    pub first_seen_step: usize,
}

/// Why the search stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// No improvement for the configured number of steps
    EarlyStopping,
    /// Step cap reached
    MaxSteps,
    /// Example cap reached
    MaxExamples,
    /// Cost cap reached
    BudgetExhausted,
    /// A candidate matched the known ground-truth pattern
    CheckMatched,
    /// Cooperative cancellation
    Cancelled,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::EarlyStopping => "early stopping",
            Self::MaxSteps => "max steps",
            Self::MaxExamples => "max examples",
            Self::BudgetExhausted => "budget exhausted",
            Self::CheckMatched => "check matched",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Statistics for one search run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchStats {
    /// Steps completed
    pub steps_run: usize,

    /// Candidates proposed (before dedup)
    pub candidates_proposed: usize,

    /// Candidate scoring rounds completed
    pub candidates_scored: usize,

    /// Examples consumed across all scoring rounds
    pub examples_consumed: usize,

    /// HTTP requests issued
    pub api_calls: u64,

    /// Prompt tokens billed
    pub tokens_in: u64,

    /// Completion tokens billed
    pub tokens_out: u64,

    /// Accumulated API cost (USD)
    pub cost_usd: f64,

    /// Wall-clock runtime in seconds
    pub runtime_secs: f64,

    /// Best running mean observed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_avg_logprob: Option<f64>,

    /// Why the search stopped
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,

    /// Examples scored per minute (derived)
    pub examples_per_min: f64,

    /// Cost per completed step (derived)
    pub cost_per_step_usd: f64,
}

impl SearchStats {
    /// Calculate derived stats.
    pub fn finalize(&mut self) {
        if self.runtime_secs > 0.0 {
            self.examples_per_min = self.examples_consumed as f64 / self.runtime_secs * 60.0;
        }
        if self.steps_run > 0 {
            self.cost_per_step_usd = self.cost_usd / self.steps_run as f64;
        }
    }
}

/// Final product of a search: the ranked explanations of the dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Explanation {
    /// The top-ranked prompt (always equals `ranked[0]`)
    pub best: ScoredPrompt,

    /// All surviving prompts, best first
    pub ranked: Vec<ScoredPrompt>,

    /// Run statistics
    pub stats: SearchStats,
}

impl Explanation {
    /// Assemble from an already-sorted ranking.
    pub fn from_ranked(ranked: Vec<ScoredPrompt>, stats: SearchStats) -> Result<Self> {
        let best = ranked.first().cloned().ok_or(ExegeteError::NoCandidates)?;
        Ok(Self {
            best,
            ranked,
            stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_serializes_with_kind_tag() {
        let origin = CandidateOrigin::Mutated {
            parent: "Return the sum".to_string(),
        };
        let json = serde_json::to_value(&origin).unwrap();
        assert_eq!(json["kind"], "mutated");
        assert_eq!(json["parent"], "Return the sum");

        let back: CandidateOrigin = serde_json::from_value(json).unwrap();
        assert_eq!(back, origin);
    }

    #[test]
    fn explanation_requires_candidates() {
        let err = Explanation::from_ranked(vec![], SearchStats::default()).unwrap_err();
        assert!(matches!(err, ExegeteError::NoCandidates));
    }

    #[test]
    fn stats_finalize_derives_rates() {
        let mut stats = SearchStats {
            steps_run: 4,
            examples_consumed: 120,
            cost_usd: 0.2,
            runtime_secs: 60.0,
            ..Default::default()
        };
        stats.finalize();
        assert!((stats.examples_per_min - 120.0).abs() < 1e-9);
        assert!((stats.cost_per_step_usd - 0.05).abs() < 1e-9);
    }
}

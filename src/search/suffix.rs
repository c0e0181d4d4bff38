//! Breadth-first beam decoding of a shared explanation suffix.
//!
//! Instead of sampling whole candidates, this strategy grows one prompt
//! token by token. At each frontier node the model reports its top-K
//! next tokens for every example with the partial suffix appended after
//! the rendered data; the per-token probabilities are averaged across
//! examples and the strongest tokens extend the frontier. A token that
//! no example predicts contributes zero mass for that example, so only
//! tokens plausible across the whole dataset survive.

use crate::client::{CompletionsClient, TopKNextToken};
use crate::models::{Dataset, ModelSpec, PromptCheck, RenderTemplate, Result, SuffixConfig};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};

/// Reported candidates are capped to the strongest finishers.
const MAX_REPORTED: usize = 32;

/// Common English words never worth a beam slot on their own.
const STOPWORDS: &[&str] = &[
    "a", "about", "after", "all", "also", "an", "and", "any", "are", "as", "at", "be", "because",
    "been", "but", "by", "can", "could", "did", "do", "does", "each", "for", "from", "had", "has",
    "have", "he", "her", "his", "how", "i", "if", "in", "into", "is", "it", "its", "just", "like",
    "me", "my", "no", "not", "of", "on", "one", "only", "or", "other", "our", "out", "she", "so",
    "some", "such", "than", "that", "the", "their", "them", "then", "there", "these", "they",
    "this", "to", "up", "was", "we", "were", "what", "when", "which", "who", "will", "with",
    "would", "you", "your",
];

/// A (possibly partial) suffix produced by the beam search.
#[derive(Debug, Clone, Serialize)]
pub struct SuffixCandidate {
    /// Trimmed suffix text
    pub text: String,
    /// Product of averaged token probabilities along the path
    pub running_prob: f64,
    /// Tokens grown
    pub depth: usize,
    /// Whether the text matched the run's answer check
    pub matched_check: bool,
}

/// Outcome of a suffix decoding run.
#[derive(Debug, Clone, Serialize)]
pub struct SuffixOutcome {
    /// Candidates sorted by running probability, best first
    pub candidates: Vec<SuffixCandidate>,
    /// First candidate that matched the answer check, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched: Option<SuffixCandidate>,
    /// Frontier expansions performed (one next-token request each)
    pub expansions: usize,
}

#[derive(Debug, Clone)]
struct SuffixState {
    text: String,
    running_prob: f64,
    depth: usize,
}

/// Grows a shared suffix over the dataset by BFS beam search.
pub struct SuffixSearcher {
    client: Arc<CompletionsClient>,
    model: ModelSpec,
    template: RenderTemplate,
    stem: String,
    config: SuffixConfig,
}

impl SuffixSearcher {
    /// `stem` is placed between the rendered example and the growing
    /// suffix, the same text the proposer uses to elicit candidates.
    pub fn new(
        client: Arc<CompletionsClient>,
        model: ModelSpec,
        template: RenderTemplate,
        stem: String,
        config: SuffixConfig,
    ) -> Self {
        Self {
            client,
            model,
            template,
            stem,
            config,
        }
    }

    /// Run the beam search over the dataset.
    pub async fn run(
        &self,
        dataset: &Dataset,
        check: Option<&PromptCheck>,
    ) -> Result<SuffixOutcome> {
        let data = dataset.clone().truncated(self.config.max_examples);
        let base_texts: Vec<String> = data
            .examples()
            .iter()
            .map(|e| {
                format!(
                    "{}{}{}",
                    self.template.render_shot(e),
                    self.template.example_separator,
                    self.stem
                )
            })
            .collect();

        info!(
            examples = base_texts.len(),
            beam_width = self.config.beam_width,
            max_new_tokens = self.config.max_new_tokens,
            "Starting suffix beam search"
        );

        let pb = ProgressBar::new(self.expansion_bound() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({percent}%) {msg}")
                .unwrap()
                .progress_chars("##-"),
        );

        let mut frontier: VecDeque<SuffixState> = VecDeque::new();
        frontier.push_back(SuffixState {
            text: String::new(),
            running_prob: 1.0,
            depth: 0,
        });

        let mut completed: Vec<SuffixCandidate> = Vec::new();
        let mut expansions = 0usize;

        while let Some(state) = frontier.pop_front() {
            let capped =
                self.config.max_expansions > 0 && expansions >= self.config.max_expansions;
            if state.depth >= self.config.max_new_tokens || capped {
                if let Some(candidate) = finish_state(&state, check) {
                    completed.push(candidate);
                }
                continue;
            }

            let texts: Vec<String> = base_texts
                .iter()
                .map(|base| format!("{base}{}", state.text))
                .collect();
            let distributions = self
                .client
                .next_token_topk(&self.model, &texts, self.config.top_k as u32)
                .await?;
            expansions += 1;
            pb.inc(1);
            pb.set_message(format!("depth {}", state.depth + 1));

            let averaged = average_token_probs(&distributions);
            let choices = select_extensions(
                averaged,
                self.config.beam_width,
                self.config.beam_width_extra,
                self.config.allow_stopwords,
            );

            debug!(
                depth = state.depth,
                suffix = %state.text.trim(),
                choices = choices.len(),
                "Expanded frontier node"
            );

            for choice in choices {
                let text = format!("{}{}", state.text, choice.token);
                let running_prob = state.running_prob * choice.prob;

                if let Some(pattern) = check {
                    if pattern.matches(text.trim()) {
                        let matched = SuffixCandidate {
                            text: text.trim().to_string(),
                            running_prob,
                            depth: state.depth + 1,
                            matched_check: true,
                        };
                        pb.finish_with_message(format!("matched: {}", matched.text));
                        info!(suffix = %matched.text, expansions, "Suffix matched the answer check");

                        completed.push(matched.clone());
                        return Ok(SuffixOutcome {
                            candidates: rank_candidates(completed),
                            matched: Some(matched),
                            expansions,
                        });
                    }
                }

                // BFS order: children queue behind the current frontier.
                if choice.extend {
                    frontier.push_back(SuffixState {
                        text,
                        running_prob,
                        depth: state.depth + 1,
                    });
                }
            }
        }

        pb.finish_with_message(format!("{expansions} expansions"));
        let candidates = rank_candidates(completed);
        info!(
            expansions,
            candidates = candidates.len(),
            "Suffix beam search finished"
        );

        Ok(SuffixOutcome {
            candidates,
            matched: None,
            expansions,
        })
    }

    /// Internal nodes of the full beam tree, capped by `max_expansions`.
    fn expansion_bound(&self) -> usize {
        let mut bound = 0usize;
        let mut layer = 1usize;
        for _ in 0..self.config.max_new_tokens {
            bound = bound.saturating_add(layer);
            layer = layer.saturating_mul(self.config.beam_width);
        }
        if self.config.max_expansions > 0 {
            bound = bound.min(self.config.max_expansions);
        }
        bound
    }
}

fn finish_state(state: &SuffixState, check: Option<&PromptCheck>) -> Option<SuffixCandidate> {
    let trimmed = state.text.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(SuffixCandidate {
        text: trimmed.to_string(),
        running_prob: state.running_prob,
        depth: state.depth,
        matched_check: check.map(|c| c.matches(trimmed)).unwrap_or(false),
    })
}

fn rank_candidates(mut candidates: Vec<SuffixCandidate>) -> Vec<SuffixCandidate> {
    candidates.sort_by(|a, b| {
        b.running_prob
            .partial_cmp(&a.running_prob)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.text.cmp(&b.text))
    });
    candidates.truncate(MAX_REPORTED);
    candidates
}

/// Average per-token probabilities across per-example top-K
/// distributions. A token absent from an example's top-K contributes
/// zero mass for that example, so the divisor is always the example
/// count.
pub(crate) fn average_token_probs(distributions: &[TopKNextToken]) -> Vec<(String, f64)> {
    if distributions.is_empty() {
        return Vec::new();
    }

    let mut mass: HashMap<String, f64> = HashMap::new();
    for dist in distributions {
        for (token, logprob) in &dist.tokens {
            *mass.entry(token.clone()).or_insert(0.0) += logprob.exp();
        }
    }

    let n = distributions.len() as f64;
    let mut averaged: Vec<(String, f64)> = mass.into_iter().map(|(t, m)| (t, m / n)).collect();
    averaged.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    averaged
}

/// A token the beam may act on.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TokenChoice {
    pub token: String,
    pub prob: f64,
    /// Extend the frontier with this token; scan-only tokens still
    /// participate in the answer check.
    pub extend: bool,
}

/// Apply the token filters and split the averaged distribution into the
/// `beam_width` tokens to extend plus `beam_width_extra` scan-only ones.
pub(crate) fn select_extensions(
    averaged: Vec<(String, f64)>,
    beam_width: usize,
    beam_width_extra: usize,
    allow_stopwords: bool,
) -> Vec<TokenChoice> {
    let mut choices = Vec::new();
    for (token, prob) in averaged {
        if choices.len() >= beam_width + beam_width_extra {
            break;
        }
        if !is_word_token(&token) {
            continue;
        }
        if !allow_stopwords && is_stopword(&token) {
            continue;
        }
        let extend = choices.len() < beam_width;
        choices.push(TokenChoice {
            token,
            prob,
            extend,
        });
    }
    choices
}

/// Tokens with no letters or digits (pure whitespace or punctuation)
/// never extend a suffix.
pub(crate) fn is_word_token(token: &str) -> bool {
    token.chars().any(|c| c.is_alphanumeric())
}

pub(crate) fn is_stopword(token: &str) -> bool {
    let normalized = token.trim().to_lowercase();
    STOPWORDS.contains(&normalized.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dist(tokens: &[(&str, f64)]) -> TopKNextToken {
        TopKNextToken {
            tokens: tokens
                .iter()
                .map(|(t, p)| (t.to_string(), p.ln()))
                .collect(),
        }
    }

    #[test]
    fn test_average_divides_by_example_count() {
        let dists = vec![
            dist(&[(" add", 0.5), (" the", 0.25)]),
            dist(&[(" add", 0.25)]),
        ];
        let averaged = average_token_probs(&dists);

        assert_eq!(averaged[0].0, " add");
        assert!((averaged[0].1 - 0.375).abs() < 1e-9);
        // Missing from the second example: half its single-example mass.
        assert_eq!(averaged[1].0, " the");
        assert!((averaged[1].1 - 0.125).abs() < 1e-9);
    }

    #[test]
    fn test_average_breaks_ties_lexicographically() {
        let dists = vec![dist(&[(" b", 0.5), (" a", 0.5)])];
        let averaged = average_token_probs(&dists);
        assert_eq!(averaged[0].0, " a");
        assert_eq!(averaged[1].0, " b");
    }

    #[test]
    fn test_word_token_filter() {
        assert!(is_word_token(" add"));
        assert!(is_word_token("7"));
        assert!(!is_word_token("   "));
        assert!(!is_word_token("..."));
        assert!(!is_word_token(" ,"));
    }

    #[test]
    fn test_stopword_filter_normalizes() {
        assert!(is_stopword(" The"));
        assert!(is_stopword("and"));
        assert!(!is_stopword(" sum"));
    }

    #[test]
    fn test_select_extensions_splits_beam_and_scan() {
        let averaged = vec![
            ("...".to_string(), 0.5),
            (" add".to_string(), 0.3),
            (" the".to_string(), 0.2),
            (" sum".to_string(), 0.1),
            (" of".to_string(), 0.05),
            (" product".to_string(), 0.01),
        ];
        let choices = select_extensions(averaged, 2, 1, false);

        // Punctuation and stopwords never reach a slot.
        let tokens: Vec<&str> = choices.iter().map(|c| c.token.as_str()).collect();
        assert_eq!(tokens, vec![" add", " sum", " product"]);
        assert!(choices[0].extend);
        assert!(choices[1].extend);
        assert!(!choices[2].extend);
    }

    #[test]
    fn test_select_extensions_can_keep_stopwords() {
        let averaged = vec![(" the".to_string(), 0.5), (" add".to_string(), 0.3)];
        let choices = select_extensions(averaged, 1, 0, true);
        assert_eq!(choices.len(), 1);
        assert_eq!(choices[0].token, " the");
    }

    #[test]
    fn test_rank_orders_by_probability() {
        let candidates = vec![
            SuffixCandidate {
                text: "weak".to_string(),
                running_prob: 0.1,
                depth: 2,
                matched_check: false,
            },
            SuffixCandidate {
                text: "strong".to_string(),
                running_prob: 0.4,
                depth: 2,
                matched_check: false,
            },
        ];
        let ranked = rank_candidates(candidates);
        assert_eq!(ranked[0].text, "strong");
    }
}

//! Candidate proposal: fresh generations and mutations of survivors.
//!
//! Both paths go through the sampling primitive. The model sees the
//! current data batch rendered as demonstrations and continues either
//! the configured stem (fresh candidates) or a truncated survivor
//! (mutations). The stem steers generation but is never part of the
//! candidate text.

use crate::client::{CompletionsClient, SamplingParams};
use crate::models::{Example, ModelSpec, ProposerConfig, RenderTemplate, Result};
use rand::rngs::StdRng;
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Proposes candidate prompts by sampling from the generation model.
pub struct Proposer {
    client: Arc<CompletionsClient>,
    model: ModelSpec,
    template: RenderTemplate,
    temperature: f64,
    top_p: f64,
    frequency_penalty: f64,
    max_prompt_tokens: u32,
    generation_stem: String,
    seed_text: String,
    max_prompt_chars: usize,
}

impl Proposer {
    pub fn new(
        client: Arc<CompletionsClient>,
        config: &ProposerConfig,
        template: RenderTemplate,
    ) -> Self {
        Self {
            client,
            model: config.model.clone(),
            template,
            temperature: config.temperature,
            top_p: config.top_p,
            frequency_penalty: config.frequency_penalty,
            max_prompt_tokens: config.max_prompt_tokens,
            generation_stem: config.generation_stem.clone(),
            seed_text: config.seed_text.clone(),
            max_prompt_chars: config.max_prompt_chars,
        }
    }

    /// Fixed text every candidate starts with (may be empty).
    pub fn seed_text(&self) -> &str {
        &self.seed_text
    }

    fn params(&self, n: usize) -> SamplingParams {
        SamplingParams {
            max_tokens: self.max_prompt_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
            frequency_penalty: self.frequency_penalty,
            n: n as u32,
            stop: Some(vec!["\n".to_string()]),
        }
    }

    /// Sample `n` fresh candidates conditioned on the batch.
    pub async fn generate(&self, batch: &[Example], n: usize) -> Result<Vec<String>> {
        if n == 0 {
            return Ok(Vec::new());
        }

        let demos = self.template.render_block(batch);
        let prompt = build_extension_prompt(
            &demos,
            &self.template.example_separator,
            &self.generation_stem,
            &self.seed_text,
        );

        let completions = self
            .client
            .sample(&self.model, &prompt, &self.params(n))
            .await?;

        let raw: Vec<String> = completions
            .into_iter()
            .map(|c| format!("{}{}", self.seed_text, first_line(&c.text)))
            .collect();
        let candidates = finalize_candidates(raw, self.max_prompt_chars);

        debug!(
            requested = n,
            kept = candidates.len(),
            "Sampled fresh candidates"
        );
        Ok(candidates)
    }

    /// Mutate a survivor: cut it at a random word boundary and sample
    /// `n` extensions of the remaining stub, conditioned on the batch.
    pub async fn mutate(
        &self,
        parent: &str,
        batch: &[Example],
        n: usize,
        rng: &mut StdRng,
    ) -> Result<Vec<String>> {
        if n == 0 {
            return Ok(Vec::new());
        }

        let stub = truncate_at_word(parent, &self.seed_text, rng);
        let demos = self.template.render_block(batch);
        let prompt = build_extension_prompt(
            &demos,
            &self.template.example_separator,
            &self.generation_stem,
            &stub,
        );

        let completions = self
            .client
            .sample(&self.model, &prompt, &self.params(n))
            .await?;

        let raw: Vec<String> = completions
            .into_iter()
            .map(|c| format!("{stub}{}", first_line(&c.text)))
            .collect();
        let candidates = finalize_candidates(raw, self.max_prompt_chars);

        debug!(
            parent_chars = parent.chars().count(),
            stub_chars = stub.chars().count(),
            kept = candidates.len(),
            "Mutated candidate"
        );
        Ok(candidates)
    }
}

/// Prompt asking the model to continue `partial` into a full candidate,
/// conditioned on the rendered demonstrations.
pub(crate) fn build_extension_prompt(
    demos: &str,
    separator: &str,
    stem: &str,
    partial: &str,
) -> String {
    format!("{demos}{separator}{stem}{partial}")
}

/// Everything before the first newline.
pub(crate) fn first_line(text: &str) -> &str {
    text.split('\n').next().unwrap_or("")
}

/// Cut `parent` at a random word boundary, always dropping at least the
/// final word. `keep_prefix` (the configured seed text) survives every
/// cut. Parents that do not carry the prefix are cut as-is.
pub(crate) fn truncate_at_word(parent: &str, keep_prefix: &str, rng: &mut StdRng) -> String {
    let (prefix, body) = match parent.strip_prefix(keep_prefix) {
        Some(rest) => (keep_prefix, rest),
        None => ("", parent),
    };

    // Valid cut points: the start of the body plus the index of every
    // whitespace run that follows a word.
    let mut cuts = vec![0usize];
    let mut prev_ws = true;
    for (i, ch) in body.char_indices() {
        if ch.is_whitespace() && !prev_ws {
            cuts.push(i);
        }
        prev_ws = ch.is_whitespace();
    }

    let cut = cuts[rng.gen_range(0..cuts.len())];
    format!("{prefix}{}", &body[..cut])
}

/// Trim, cap at `max_chars` on a char boundary, drop empties, dedupe
/// preserving order.
pub(crate) fn finalize_candidates(raw: Vec<String>, max_chars: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(raw.len());
    for text in raw {
        let capped: String = text.trim().chars().take(max_chars).collect();
        let capped = capped.trim_end().to_string();
        if capped.is_empty() {
            continue;
        }
        if seen.insert(capped.clone()) {
            out.push(capped);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_first_line_cuts_at_newline() {
        assert_eq!(first_line("add the numbers\nInput: 3"), "add the numbers");
        assert_eq!(first_line("no newline here"), "no newline here");
        assert_eq!(first_line(""), "");
    }

    #[test]
    fn test_extension_prompt_layout() {
        let prompt = build_extension_prompt(
            "Input: 1 2\nOutput: 3",
            "\n\n",
            "To compute the output from the input, ",
            "add",
        );
        assert_eq!(
            prompt,
            "Input: 1 2\nOutput: 3\n\nTo compute the output from the input, add"
        );
    }

    #[test]
    fn test_truncate_lands_on_word_boundary() {
        let mut rng = StdRng::seed_from_u64(7);
        let parent = "return the sum of both numbers";
        for _ in 0..20 {
            let stub = truncate_at_word(parent, "", &mut rng);
            assert!(parent.starts_with(&stub));
            assert!(stub.len() < parent.len());
            if !stub.is_empty() {
                assert!(!stub.ends_with(' '));
                assert_eq!(parent.as_bytes()[stub.len()], b' ');
            }
        }
    }

    #[test]
    fn test_truncate_is_seeded() {
        let parent = "multiply the first number by the second";
        let a = truncate_at_word(parent, "", &mut StdRng::seed_from_u64(42));
        let b = truncate_at_word(parent, "", &mut StdRng::seed_from_u64(42));
        assert_eq!(a, b);
    }

    #[test]
    fn test_truncate_preserves_seed_prefix() {
        let mut rng = StdRng::seed_from_u64(3);
        let parent = "Return the sum of the inputs";
        for _ in 0..10 {
            let stub = truncate_at_word(parent, "Return the", &mut rng);
            assert!(stub.starts_with("Return the"));
        }
    }

    #[test]
    fn test_truncate_bare_prefix_stays_put() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(truncate_at_word("Return", "Return", &mut rng), "Return");
    }

    #[test]
    fn test_truncate_unprefixed_parent_cut_as_is() {
        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..10 {
            let stub = truncate_at_word("add them up", "Return the", &mut rng);
            assert!("add them up".starts_with(&stub));
        }
    }

    #[test]
    fn test_finalize_dedupes_and_caps() {
        let raw = vec![
            "  add the numbers  ".to_string(),
            "add the numbers".to_string(),
            "   ".to_string(),
            "a very long candidate text".to_string(),
        ];
        let out = finalize_candidates(raw, 10);
        assert_eq!(out, vec!["add the nu".to_string(), "a very lon".to_string()]);
    }

    #[test]
    fn test_finalize_trims_after_cap() {
        let out = finalize_candidates(vec!["abc def".to_string()], 4);
        assert_eq!(out, vec!["abc".to_string()]);
    }
}

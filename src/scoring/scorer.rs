//! Likelihood scoring of candidate prompts.
//!
//! A candidate's score is the mean per-token log-probability the frozen
//! model assigns to example outputs when the candidate is prepended.
//! Scoring texts are submitted with `echo=true, max_tokens=0` and the
//! output span is located by character offset in the echoed logprobs.

use crate::client::{CompletionsClient, SamplingParams, TokenLogprobs};
use crate::models::{Example, ExegeteError, ModelSpec, RenderTemplate, Result, ScorerConfig};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::debug;

/// Logprob mass of one scored span.
#[derive(Debug, Clone, Copy)]
pub struct ScoreOutcome {
    /// Sum of logprobs over the span's tokens
    pub sum_logprob: f64,
    /// Tokens in the span
    pub n_tokens: usize,
    /// `sum_logprob / n_tokens`
    pub avg_logprob: f64,
}

/// Aggregate over one scoring round.
#[derive(Debug, Clone, Copy)]
pub struct BatchScore {
    /// Mean of per-example `avg_logprob`
    pub mean_avg_logprob: f64,
    /// Examples that contributed
    pub n_examples: usize,
}

/// Scores candidate prompts against a frozen model.
pub struct Scorer {
    client: Arc<CompletionsClient>,
    model: ModelSpec,
    template: RenderTemplate,
    /// Texts per echo request
    batch_size: usize,
    /// Completion budget for the greedy accuracy probe
    accuracy_max_tokens: u32,
    /// Bounds concurrent scoring requests
    semaphore: Arc<Semaphore>,
}

impl Scorer {
    pub fn new(
        client: Arc<CompletionsClient>,
        config: &ScorerConfig,
        template: RenderTemplate,
    ) -> Self {
        Self {
            client,
            model: config.model.clone(),
            template,
            batch_size: config.batch_size.max(1),
            accuracy_max_tokens: config.accuracy_max_tokens,
            semaphore: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
        }
    }

    pub fn model(&self) -> &ModelSpec {
        &self.model
    }

    pub fn template(&self) -> &RenderTemplate {
        &self.template
    }

    /// Score one example under a prompt.
    pub async fn score_example(
        &self,
        prompt: &str,
        context: &[Example],
        target: &Example,
    ) -> Result<ScoreOutcome> {
        let (text, span_chars) = build_scoring_text(&self.template, prompt, context, target);
        let logprobs = self.client.echo_logprobs(&self.model, &[text.clone()]).await?;
        span_logprob(&logprobs[0], &text, span_chars)
    }

    /// Score a prompt over grouped examples. Each group is scored
    /// shot-by-shot: the i-th target sees the preceding shots as
    /// completed context. With `single_shot` only the final shot of each
    /// group is scored.
    ///
    /// Any failed chunk fails the whole round for this prompt.
    pub async fn score_candidate(
        &self,
        prompt: &str,
        groups: &[Vec<Example>],
        single_shot: bool,
    ) -> Result<BatchScore> {
        let mut texts = Vec::new();
        let mut spans = Vec::new();
        for group in groups {
            if group.is_empty() {
                continue;
            }
            let first_target = if single_shot { group.len() - 1 } else { 0 };
            for i in first_target..group.len() {
                let (text, span_chars) =
                    build_scoring_text(&self.template, prompt, &group[..i], &group[i]);
                texts.push(text);
                spans.push(span_chars);
            }
        }
        if texts.is_empty() {
            return Err(ExegeteError::InvalidInput(
                "no examples to score".to_string(),
            ));
        }

        let outcomes = self.fan_out_echo(texts, spans).await?;
        let n = outcomes.len();
        let mean = outcomes.iter().map(|o| o.avg_logprob).sum::<f64>() / n as f64;

        debug!(
            model = %self.model.id,
            n_examples = n,
            mean_avg_logprob = mean,
            "Candidate scored"
        );

        Ok(BatchScore {
            mean_avg_logprob: mean,
            n_examples: n,
        })
    }

    /// Chunked, semaphore-bounded echo scoring. Outcomes come back in
    /// input order.
    async fn fan_out_echo(
        &self,
        texts: Vec<String>,
        spans: Vec<usize>,
    ) -> Result<Vec<ScoreOutcome>> {
        let chunk_size = self.batch_size;
        let mut handles = Vec::new();

        for (chunk_idx, chunk) in texts.chunks(chunk_size).enumerate() {
            let chunk = chunk.to_vec();
            let client = Arc::clone(&self.client);
            let model = self.model.clone();
            let semaphore = Arc::clone(&self.semaphore);
            handles.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|_| ExegeteError::Internal("Semaphore closed".to_string()))?;
                let logprobs = client.echo_logprobs(&model, &chunk).await?;
                Ok::<_, ExegeteError>((chunk_idx, chunk, logprobs))
            }));
        }

        let mut per_chunk: Vec<Option<(Vec<String>, Vec<TokenLogprobs>)>> =
            (0..handles.len()).map(|_| None).collect();
        for handle in handles {
            let (chunk_idx, chunk, logprobs) = handle
                .await
                .map_err(|e| ExegeteError::Internal(format!("scoring task panicked: {e}")))??;
            per_chunk[chunk_idx] = Some((chunk, logprobs));
        }

        let mut outcomes = Vec::with_capacity(texts.len());
        let mut span_iter = spans.into_iter();
        for slot in per_chunk {
            let (chunk, logprobs) = slot
                .ok_or_else(|| ExegeteError::Internal("missing scoring chunk".to_string()))?;
            for (text, lp) in chunk.iter().zip(logprobs.iter()) {
                let span_chars = span_iter
                    .next()
                    .ok_or_else(|| ExegeteError::Internal("span bookkeeping drift".to_string()))?;
                outcomes.push(span_logprob(lp, text, span_chars)?);
            }
        }
        Ok(outcomes)
    }

    /// Fraction of groups whose output the model reproduces greedily.
    /// One generation per group, continuing from the final shot's query.
    pub async fn accuracy_probe(&self, prompt: &str, groups: &[Vec<Example>]) -> Result<f64> {
        let mut total = 0usize;
        let mut correct = 0usize;

        let params = SamplingParams {
            max_tokens: self.accuracy_max_tokens,
            temperature: 0.0,
            top_p: 1.0,
            frequency_penalty: 0.0,
            n: 1,
            stop: Some(vec!["\n".to_string()]),
        };

        let mut handles = Vec::new();
        for group in groups {
            let Some((target, context)) = group.split_last() else {
                continue;
            };
            let text = build_probe_text(&self.template, prompt, context, target);
            let expected = target.output.clone();
            let client = Arc::clone(&self.client);
            let model = self.model.clone();
            let params = params.clone();
            let semaphore = Arc::clone(&self.semaphore);
            handles.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|_| ExegeteError::Internal("Semaphore closed".to_string()))?;
                let completions = client.sample(&model, &text, &params).await?;
                let generated = completions
                    .first()
                    .map(|c| c.text.clone())
                    .unwrap_or_default();
                Ok::<_, ExegeteError>(continuation_matches(&generated, &expected))
            }));
        }

        for handle in handles {
            let matched = handle
                .await
                .map_err(|e| ExegeteError::Internal(format!("probe task panicked: {e}")))??;
            total += 1;
            if matched {
                correct += 1;
            }
        }

        if total == 0 {
            return Err(ExegeteError::InvalidInput(
                "no examples to probe".to_string(),
            ));
        }
        Ok(correct as f64 / total as f64)
    }
}

/// Build the text scored for one target example, and the span length in
/// characters. `context` examples render as completed shots before the
/// target's query.
pub(crate) fn build_scoring_text(
    template: &RenderTemplate,
    prompt: &str,
    context: &[Example],
    target: &Example,
) -> (String, usize) {
    let mut text = build_probe_text(template, prompt, context, target);
    text.push_str(&target.output);

    // Tokenizers fold the whitespace before the output into the output's
    // first token, so the span starts one character early.
    let span_chars = (target.output.chars().count() + 1).min(text.chars().count());
    (text, span_chars)
}

/// The text the greedy probe continues from (the scoring text minus the
/// output).
pub(crate) fn build_probe_text(
    template: &RenderTemplate,
    prompt: &str,
    context: &[Example],
    target: &Example,
) -> String {
    let sep = &template.example_separator;
    let mut text = String::new();
    if !prompt.is_empty() {
        text.push_str(prompt);
        text.push_str(sep);
    }
    if !context.is_empty() {
        text.push_str(&template.render_block(context));
        text.push_str(sep);
    }
    text.push_str(&template.render_query(target));
    text
}

/// Sum the logprobs of the last `span_chars` characters of `text`.
///
/// A token belongs to the span when its offset falls at or after the
/// span start. Tokens without a logprob (the first echoed token) never
/// count.
pub(crate) fn span_logprob(
    logprobs: &TokenLogprobs,
    text: &str,
    span_chars: usize,
) -> Result<ScoreOutcome> {
    let total_chars = text.chars().count();
    let span_start = total_chars.saturating_sub(span_chars);

    let mut sum = 0.0;
    let mut n_tokens = 0usize;
    for (i, offset) in logprobs.text_offset.iter().enumerate() {
        if *offset < span_start {
            continue;
        }
        if let Some(Some(lp)) = logprobs.token_logprobs.get(i) {
            sum += lp;
            n_tokens += 1;
        }
    }

    if n_tokens == 0 {
        return Err(ExegeteError::InvalidInput(
            "output span produced no scored tokens".to_string(),
        ));
    }

    Ok(ScoreOutcome {
        sum_logprob: sum,
        n_tokens,
        avg_logprob: sum / n_tokens as f64,
    })
}

/// Compare a greedy continuation against the expected output. Both sides
/// are cut at the first newline, trimmed, and lowercased.
pub(crate) fn continuation_matches(generated: &str, expected: &str) -> bool {
    normalize_answer(generated) == normalize_answer(expected)
}

fn normalize_answer(s: &str) -> String {
    s.split('\n').next().unwrap_or("").trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DataConfig;

    fn template() -> RenderTemplate {
        RenderTemplate::from(&DataConfig::default())
    }

    fn ex(input: &str, output: &str) -> Example {
        Example {
            input: input.to_string(),
            output: output.to_string(),
        }
    }

    #[test]
    fn scoring_text_ends_with_output_and_span_covers_it() {
        let (text, span_chars) =
            build_scoring_text(&template(), "Add the numbers.", &[], &ex("2 5", "7"));
        assert_eq!(text, "Add the numbers.\n\nInput: 2 5\nOutput: 7");
        // Span is the output plus the space before it.
        assert_eq!(span_chars, 2);
        let tail: String = text
            .chars()
            .skip(text.chars().count() - span_chars)
            .collect();
        assert_eq!(tail, " 7");
    }

    #[test]
    fn context_shots_render_before_the_query() {
        let (text, _) = build_scoring_text(&template(), "", &[ex("1 2", "3")], &ex("2 5", "7"));
        assert_eq!(text, "Input: 1 2\nOutput: 3\n\nInput: 2 5\nOutput: 7");
    }

    #[test]
    fn probe_text_is_a_strict_prefix_of_scoring_text() {
        let target = ex("2 5", "7");
        let probe = build_probe_text(&template(), "Add.", &[], &target);
        let (full, _) = build_scoring_text(&template(), "Add.", &[], &target);
        assert!(full.starts_with(&probe));
        assert_eq!(&full[probe.len()..], "7");
    }

    #[test]
    fn span_logprob_selects_trailing_tokens() {
        let text = "Output: 7";
        let logprobs = TokenLogprobs {
            tokens: vec!["Output".into(), ":".into(), " 7".into()],
            token_logprobs: vec![None, Some(-0.5), Some(-1.0)],
            top_logprobs: None,
            text_offset: vec![0, 6, 7],
        };
        let outcome = span_logprob(&logprobs, text, 2).unwrap();
        assert_eq!(outcome.n_tokens, 1);
        assert!((outcome.sum_logprob + 1.0).abs() < 1e-9);
        assert!((outcome.avg_logprob + 1.0).abs() < 1e-9);
    }

    #[test]
    fn span_logprob_skips_null_entries() {
        // Span start of 0: everything echoed is in-span, but the first
        // token carries no logprob.
        let text = " 7";
        let logprobs = TokenLogprobs {
            tokens: vec![" 7".into()],
            token_logprobs: vec![None],
            top_logprobs: None,
            text_offset: vec![0],
        };
        assert!(span_logprob(&logprobs, text, 2).is_err());
    }

    #[test]
    fn span_logprob_excludes_prefix_tokens() {
        let text = "Input: 2 5\nOutput: 7";
        let logprobs = TokenLogprobs {
            tokens: vec![
                "Input".into(),
                ": 2".into(),
                " 5".into(),
                "\n".into(),
                "Output".into(),
                ":".into(),
                " 7".into(),
            ],
            token_logprobs: vec![
                None,
                Some(-2.0),
                Some(-2.0),
                Some(-0.1),
                Some(-0.1),
                Some(-0.1),
                Some(-0.25),
            ],
            top_logprobs: None,
            text_offset: vec![0, 5, 8, 10, 11, 17, 18],
        };
        let outcome = span_logprob(&logprobs, text, 2).unwrap();
        assert_eq!(outcome.n_tokens, 1);
        assert!((outcome.avg_logprob + 0.25).abs() < 1e-9);
    }

    #[test]
    fn continuation_matching_normalizes() {
        assert!(continuation_matches(" 7\nInput: 9 9", "7"));
        assert!(continuation_matches("Paris", "paris"));
        assert!(!continuation_matches("749", "7"));
        assert!(!continuation_matches("", "7"));
    }
}

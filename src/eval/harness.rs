//! Held-out evaluation of fixed prompts, no search involved.

use crate::models::{Dataset, Example, ExegeteError, Result};
use crate::scoring::Scorer;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tracing::{info, warn};

/// Scores for one fixed prompt over a dataset.
#[derive(Debug, Clone, Serialize)]
pub struct PromptEvaluation {
    /// Row label ("rank_1", "manual", "empty", ...)
    pub label: String,
    pub prompt: String,
    pub avg_logprob: f64,
    pub accuracy: f64,
    pub n_examples: usize,
}

/// Evaluates fixed prompts the same way the engine scores candidates.
pub struct EvalHarness {
    scorer: Scorer,
    n_shots: usize,
    single_shot: bool,
}

impl EvalHarness {
    pub fn new(scorer: Scorer, n_shots: usize, single_shot: bool) -> Self {
        Self {
            scorer,
            n_shots: n_shots.max(1),
            single_shot,
        }
    }

    fn groups(&self, dataset: &Dataset) -> Vec<Vec<Example>> {
        dataset
            .examples()
            .chunks(self.n_shots)
            .map(|c| c.to_vec())
            .collect()
    }

    /// Mean avg-logprob and greedy accuracy of one prompt.
    pub async fn evaluate_prompt(
        &self,
        label: &str,
        prompt: &str,
        dataset: &Dataset,
    ) -> Result<PromptEvaluation> {
        let groups = self.groups(dataset);
        let score = self
            .scorer
            .score_candidate(prompt, &groups, self.single_shot)
            .await?;
        let accuracy = self.scorer.accuracy_probe(prompt, &groups).await?;

        Ok(PromptEvaluation {
            label: label.to_string(),
            prompt: prompt.to_string(),
            avg_logprob: score.mean_avg_logprob,
            accuracy,
            n_examples: score.n_examples,
        })
    }

    /// Evaluate labeled prompts plus the reference rows: a `manual`
    /// description when supplied, and always the empty-prompt baseline.
    pub async fn evaluate_many(
        &self,
        prompts: &[(String, String)],
        dataset: &Dataset,
        manual: Option<&str>,
    ) -> Result<Vec<PromptEvaluation>> {
        let mut rows: Vec<(String, String)> = prompts.to_vec();
        if let Some(text) = manual {
            rows.push(("manual".to_string(), text.to_string()));
        }
        rows.push(("empty".to_string(), String::new()));

        info!(
            prompts = rows.len(),
            examples = dataset.len(),
            "Evaluating prompts"
        );

        let pb = ProgressBar::new(rows.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({percent}%) {msg}")
                .unwrap()
                .progress_chars("##-"),
        );

        let mut results = Vec::with_capacity(rows.len());
        for (label, prompt) in rows {
            pb.set_message(label.clone());
            match self.evaluate_prompt(&label, &prompt, dataset).await {
                Ok(row) => results.push(row),
                Err(e) => warn!(label = %label, error = %e, "Evaluation failed"),
            }
            pb.inc(1);
        }
        pb.finish_and_clear();

        if results.is_empty() {
            return Err(ExegeteError::InvalidInput(
                "no prompt could be evaluated".to_string(),
            ));
        }
        Ok(results)
    }
}

//! The iterative propose / score / select loop.
//!
//! Each step draws the next data batch, assembles a candidate set from
//! pool survivors, mutations, and fresh generations, scores every
//! candidate on the batch, and folds the results into the pool. The
//! loop checkpoints between steps so a run can be killed and resumed.

use crate::checkpoint::CheckpointManager;
use crate::client::CompletionsClient;
use crate::models::{
    CandidateOrigin, Dataset, Example, Explanation, ExegeteError, PromptCandidate, PromptCheck,
    Result, SearchConfig, StopReason,
};
use crate::scoring::Scorer;
use crate::search::{PromptPool, Proposer};
use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// One line of `history.jsonl`: the state of the search after a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub step: usize,
    pub proposed: usize,
    pub scored: usize,
    pub pool_size: usize,
    pub best_text: String,
    pub best_avg_logprob: f64,
    pub examples_consumed: usize,
    pub cost_usd: f64,
    pub timestamp: DateTime<Utc>,
}

/// Create a fresh run directory under `base`: UTC stamp plus a short
/// random suffix so concurrent runs never collide.
pub fn create_run_dir(base: &Path) -> Result<PathBuf> {
    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    let suffix = &uuid::Uuid::new_v4().simple().to_string()[..6];
    let dir = base.join(format!("{stamp}_{suffix}"));
    std::fs::create_dir_all(&dir).map_err(|e| ExegeteError::io("creating run dir", e))?;
    Ok(dir)
}

/// Iterative prompt search engine.
pub struct SearchEngine {
    proposer: Proposer,
    scorer: Scorer,
    config: SearchConfig,
    seeds: Vec<String>,
    check: Option<PromptCheck>,
    clients: Vec<Arc<CompletionsClient>>,
    run_dir: PathBuf,
    cancel: Arc<AtomicBool>,
}

impl SearchEngine {
    /// Build an engine around already-constructed components.
    ///
    /// `clients` are used for cost and request accounting; duplicates of
    /// the same underlying client are collapsed so shared proposer and
    /// scorer endpoints are not double-counted.
    pub fn new(
        proposer: Proposer,
        scorer: Scorer,
        config: SearchConfig,
        seeds: Vec<String>,
        check: Option<PromptCheck>,
        clients: Vec<Arc<CompletionsClient>>,
        run_dir: PathBuf,
    ) -> Result<Self> {
        if config.population_size == 0 {
            return Err(ExegeteError::InvalidInput(
                "population_size must be at least 1".to_string(),
            ));
        }

        let mut unique: Vec<Arc<CompletionsClient>> = Vec::new();
        for client in clients {
            if !unique.iter().any(|c| Arc::ptr_eq(c, &client)) {
                unique.push(client);
            }
        }

        Ok(Self {
            proposer,
            scorer,
            config,
            seeds,
            check,
            clients: unique,
            run_dir,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Flag that stops the loop at the next step boundary when set.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Directory this run writes its artifacts into.
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    fn process_cost_usd(&self) -> f64 {
        self.clients.iter().map(|c| c.total_cost_usd()).sum()
    }

    fn process_requests(&self) -> u64 {
        self.clients.iter().map(|c| c.total_requests()).sum()
    }

    fn process_tokens(&self) -> (u64, u64) {
        self.clients.iter().fold((0, 0), |(i, o), c| {
            let (ci, co) = c.total_tokens();
            (i + ci, o + co)
        })
    }

    /// Run the search to completion and return the ranked explanation.
    ///
    /// `eval_split`, when present, is held back from the loop and used
    /// only for the final accuracy rescoring of the top prompts.
    pub async fn run(
        &self,
        train: &Dataset,
        eval_split: Option<&Dataset>,
    ) -> Result<Explanation> {
        let start = Instant::now();

        let run_id = self
            .run_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "run".to_string());

        let mut checkpoint = CheckpointManager::new(&self.run_dir)?;
        checkpoint.init_or_load(&run_id, self.config.seed)?;
        let resumed = checkpoint.state().unwrap().clone();

        let mut pool = PromptPool::restore(resumed.pool);
        let mut cursor = resumed.examples_cursor;
        let mut stats = resumed.stats;
        let mut best_score = resumed.best_avg_logprob;
        let mut stale_rounds = resumed.rounds_since_improvement;
        let start_step = resumed.step;

        // Client counters start at zero in this process; checkpointed
        // totals from an earlier process are carried as a base.
        let base_cost = stats.cost_usd;
        let base_calls = stats.api_calls;
        let base_tokens = (stats.tokens_in, stats.tokens_out);
        let base_runtime = stats.runtime_secs;

        // One deterministic shuffle; the cursor walks this order cyclically.
        let data = train.clone().shuffled(self.config.seed);

        info!(
            examples = data.len(),
            start_step,
            max_steps = self.config.max_steps,
            population = self.config.population_size,
            "Starting prompt search"
        );

        let pb = ProgressBar::new(self.config.max_steps as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({percent}%) {msg}")
                .unwrap()
                .progress_chars("##-"),
        );
        pb.set_position(start_step as u64);

        let history_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.run_dir.join("history.jsonl"))
            .map_err(|e| ExegeteError::io("opening history file", e))?;
        let mut history = BufWriter::new(history_file);

        let save_every = self.config.save_interval.max(1);
        let mut step = start_step;

        let stop = 'steps: loop {
            if step >= self.config.max_steps {
                break 'steps StopReason::MaxSteps;
            }
            if self.cancel.load(Ordering::Relaxed) {
                break 'steps StopReason::Cancelled;
            }
            if self.config.max_examples > 0 && stats.examples_consumed >= self.config.max_examples
            {
                break 'steps StopReason::MaxExamples;
            }
            if self.config.max_cost_usd > 0.0 && stats.cost_usd >= self.config.max_cost_usd {
                break 'steps StopReason::BudgetExhausted;
            }

            // Truncation points and any other step randomness derive
            // from seed + step, so a resumed run replays identically.
            let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(step as u64));

            let (batch, next_cursor) = data.batch_at(cursor, self.config.batch_size);
            let groups: Vec<Vec<Example>> = batch
                .chunks(self.config.n_shots.max(1))
                .map(|c| c.to_vec())
                .collect();

            let candidates = self.propose_round(&batch, &pool, step, &mut rng).await;
            stats.candidates_proposed += candidates.len();

            // Duplicate texts within a round are scored once.
            let mut seen = HashSet::new();
            let candidates: Vec<PromptCandidate> = candidates
                .into_iter()
                .filter(|c| seen.insert(c.text.clone()))
                .collect();

            debug!(step, candidates = candidates.len(), "Scoring round");

            let mut round_scored = 0usize;
            let mut matched_text: Option<String> = None;
            for candidate in &candidates {
                match self
                    .scorer
                    .score_candidate(&candidate.text, &groups, self.config.single_shot_loss)
                    .await
                {
                    Ok(score) => {
                        let matched = self
                            .check
                            .as_ref()
                            .map(|c| c.matches(&candidate.text))
                            .unwrap_or(false);
                        pool.record_round(
                            candidate,
                            score.mean_avg_logprob,
                            score.n_examples,
                            matched,
                        );
                        stats.candidates_scored += 1;
                        stats.examples_consumed += score.n_examples;
                        round_scored += 1;
                        if matched {
                            matched_text = Some(candidate.text.clone());
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(candidate = %candidate.text, error = %e, "Scoring failed")
                    }
                }
            }

            if round_scored == 0 {
                if pool.is_empty() {
                    pb.abandon_with_message("no candidate could be scored");
                    return Err(ExegeteError::NoCandidates);
                }
                warn!(step, "No candidate scored this round, skipping");
            }

            cursor = next_cursor;
            stats.steps_run += 1;

            let current_best = pool.best().map(|e| e.mean_avg_logprob);
            match (current_best, best_score) {
                (Some(now), Some(before)) if now > before => {
                    best_score = Some(now);
                    stale_rounds = 0;
                }
                (Some(now), None) => {
                    best_score = Some(now);
                    stale_rounds = 0;
                }
                _ => stale_rounds += 1,
            }

            stats.cost_usd = base_cost + self.process_cost_usd();
            stats.api_calls = base_calls + self.process_requests();
            let (tin, tout) = self.process_tokens();
            stats.tokens_in = base_tokens.0 + tin;
            stats.tokens_out = base_tokens.1 + tout;
            stats.runtime_secs = base_runtime + start.elapsed().as_secs_f64();
            stats.best_avg_logprob = best_score;

            let finishing = matched_text.is_some()
                || (self.config.early_stopping_rounds > 0
                    && stale_rounds >= self.config.early_stopping_rounds);

            if (step + 1) % save_every == 0 || finishing {
                if let Some(best) = pool.best() {
                    let record = HistoryRecord {
                        step,
                        proposed: candidates.len(),
                        scored: round_scored,
                        pool_size: pool.len(),
                        best_text: best.text.clone(),
                        best_avg_logprob: best.mean_avg_logprob,
                        examples_consumed: stats.examples_consumed,
                        cost_usd: stats.cost_usd,
                        timestamp: Utc::now(),
                    };
                    let json = serde_json::to_string(&record).map_err(|e| {
                        ExegeteError::Internal(format!("Serializing history record: {}", e))
                    })?;
                    writeln!(history, "{}", json)
                        .map_err(|e| ExegeteError::io("writing history", e))?;
                    history
                        .flush()
                        .map_err(|e| ExegeteError::io("flushing history", e))?;
                }

                let state = checkpoint.state_mut().unwrap();
                state.advance(step + 1, cursor, pool.snapshot());
                state.best_avg_logprob = best_score;
                state.rounds_since_improvement = stale_rounds;
                state.stats = stats.clone();
                checkpoint.save()?;
            }

            pb.inc(1);
            if let Some(best) = pool.best() {
                pb.set_message(format!(
                    "best {:.4}: {}",
                    best.mean_avg_logprob,
                    ellipsize(&best.text, 48)
                ));
            }

            step += 1;

            if let Some(text) = matched_text {
                info!(prompt = %text, "Candidate matched the answer check");
                break 'steps StopReason::CheckMatched;
            }
            if self.config.early_stopping_rounds > 0
                && stale_rounds >= self.config.early_stopping_rounds
            {
                break 'steps StopReason::EarlyStopping;
            }
        };

        pb.finish_with_message(format!("stopped: {stop}"));
        info!(reason = %stop, steps = stats.steps_run, pool = pool.len(), "Search loop finished");

        for client in &self.clients {
            let throttling = client.rate_limiter().stats();
            if throttling.total_429s > 0 {
                warn!(
                    endpoint = client.name(),
                    strikes = throttling.total_429s,
                    waited_secs = format!("{:.1}", throttling.total_wait_secs),
                    "Endpoint throttled this run"
                );
            }
        }

        if pool.is_empty() {
            return Err(ExegeteError::NoCandidates);
        }

        // Rescore the winners for accuracy on held-back data.
        if let Some(eval) = eval_split {
            self.rescore_accuracy(&mut pool, eval).await;
        }

        stats.cost_usd = base_cost + self.process_cost_usd();
        stats.api_calls = base_calls + self.process_requests();
        let (tin, tout) = self.process_tokens();
        stats.tokens_in = base_tokens.0 + tin;
        stats.tokens_out = base_tokens.1 + tout;
        stats.runtime_secs = base_runtime + start.elapsed().as_secs_f64();
        stats.best_avg_logprob = pool.best().map(|e| e.mean_avg_logprob);
        stats.stop_reason = Some(stop);
        stats.finalize();

        let state = checkpoint.state_mut().unwrap();
        state.advance(step, cursor, pool.snapshot());
        state.best_avg_logprob = stats.best_avg_logprob;
        state.rounds_since_improvement = stale_rounds;
        state.stats = stats.clone();
        checkpoint.save()?;

        let explanation = Explanation::from_ranked(pool.ranked(), stats)?;
        self.write_result(&explanation)?;

        info!(
            best = %explanation.best.text,
            avg_logprob = explanation.best.avg_logprob,
            cost = format!("${:.4}", explanation.stats.cost_usd),
            "Search complete"
        );

        Ok(explanation)
    }

    /// Assemble one round's candidate set: seeds on the first step, pool
    /// survivors, mutations of survivors, and fresh generations.
    async fn propose_round(
        &self,
        batch: &[Example],
        pool: &PromptPool,
        step: usize,
        rng: &mut StdRng,
    ) -> Vec<PromptCandidate> {
        let mut candidates = Vec::new();

        if step == 0 {
            for text in &self.seeds {
                candidates.push(PromptCandidate::new(
                    text.clone(),
                    CandidateOrigin::Seeded,
                    step,
                ));
            }
        }

        let survivors = pool.population(self.config.population_size);
        for text in &survivors {
            candidates.push(PromptCandidate::new(
                text.clone(),
                CandidateOrigin::Resampled,
                step,
            ));
        }

        if !survivors.is_empty() {
            for i in 0..self.config.num_mutations {
                let parent = &survivors[i % survivors.len()];
                match self.proposer.mutate(parent, batch, 1, rng).await {
                    Ok(texts) => {
                        for text in texts {
                            candidates.push(PromptCandidate::new(
                                text,
                                CandidateOrigin::Mutated {
                                    parent: parent.clone(),
                                },
                                step,
                            ));
                        }
                    }
                    Err(e) => warn!(parent = %parent, error = %e, "Mutation failed"),
                }
            }
        }

        match self
            .proposer
            .generate(batch, self.config.num_random_generations)
            .await
        {
            Ok(texts) => {
                for text in texts {
                    candidates.push(PromptCandidate::new(
                        text,
                        CandidateOrigin::Generated,
                        step,
                    ));
                }
            }
            Err(e) => warn!(error = %e, "Generation failed"),
        }

        candidates
    }

    /// Probe held-back accuracy for the top prompts.
    async fn rescore_accuracy(&self, pool: &mut PromptPool, eval: &Dataset) {
        let groups: Vec<Vec<Example>> = eval
            .examples()
            .chunks(self.config.n_shots.max(1))
            .map(|c| c.to_vec())
            .collect();

        let top = pool.population(self.config.population_size);
        info!(prompts = top.len(), eval_examples = eval.len(), "Rescoring accuracy");

        for text in top {
            match self.scorer.accuracy_probe(&text, &groups).await {
                Ok(acc) => {
                    debug!(prompt = %text, accuracy = acc, "Rescored");
                    pool.set_accuracy(&text, acc);
                }
                Err(e) => warn!(prompt = %text, error = %e, "Accuracy rescoring failed"),
            }
        }
    }

    fn write_result(&self, explanation: &Explanation) -> Result<()> {
        let path = self.run_dir.join("result.json");
        let file = File::create(&path).map_err(|e| ExegeteError::io("creating result file", e))?;
        serde_json::to_writer_pretty(BufWriter::new(file), explanation)
            .map_err(|e| ExegeteError::Internal(format!("Serializing result: {}", e)))?;
        info!(path = %path.display(), "Result written");
        Ok(())
    }
}

/// Clip a prompt to `max` characters for progress display.
fn ellipsize(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let clipped: String = text.chars().take(max.saturating_sub(1)).collect();
        format!("{clipped}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_run_dir_name_shape() {
        let base = TempDir::new().unwrap();
        let dir = create_run_dir(base.path()).unwrap();
        assert!(dir.exists());

        let name = dir.file_name().unwrap().to_string_lossy().to_string();
        // 20260101_120000_ab12cd
        assert_eq!(name.len(), 22);
        let parts: Vec<&str> = name.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 8);
        assert_eq!(parts[1].len(), 6);
        assert_eq!(parts[2].len(), 6);
        assert!(parts[0].chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_run_dirs_do_not_collide() {
        let base = TempDir::new().unwrap();
        let a = create_run_dir(base.path()).unwrap();
        let b = create_run_dir(base.path()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_ellipsize_respects_char_boundaries() {
        assert_eq!(ellipsize("short", 10), "short");
        assert_eq!(ellipsize("abcdefghij", 5), "abcd…");
        assert_eq!(ellipsize("ααααααα", 5), "αααα…");
    }

    #[test]
    fn test_history_record_round_trips() {
        let record = HistoryRecord {
            step: 3,
            proposed: 12,
            scored: 11,
            pool_size: 20,
            best_text: "add the numbers".to_string(),
            best_avg_logprob: -1.25,
            examples_consumed: 96,
            cost_usd: 0.04,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&record).unwrap();
        let back: HistoryRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.step, 3);
        assert_eq!(back.best_text, "add the numbers");
    }
}

//! Aggregation of results across prior run directories.

use crate::models::{ExegeteError, Explanation, Result, StopReason};
use glob::glob;
use serde::Serialize;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::{debug, warn};

/// One row per discovered run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_dir: String,
    pub best_prompt: String,
    pub best_avg_logprob: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_accuracy: Option<f64>,
    pub prompts_ranked: usize,
    pub steps_run: usize,
    pub examples_consumed: usize,
    pub cost_usd: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
}

/// Aggregate over every run a glob matched.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Summaries sorted best-first by avg logprob
    pub runs: Vec<RunSummary>,
    pub total_cost_usd: f64,
}

/// Discover `result.json` files under run directories matching the glob
/// and fold them into one report. Unreadable results are skipped with a
/// warning.
pub fn collect_runs(pattern: &str) -> Result<RunReport> {
    let full_pattern = if pattern.ends_with("result.json") {
        pattern.to_string()
    } else {
        format!("{}/result.json", pattern.trim_end_matches('/'))
    };

    let paths = glob(&full_pattern)
        .map_err(|e| ExegeteError::InvalidInput(format!("bad runs glob {pattern:?}: {e}")))?;

    let mut runs = Vec::new();
    for entry in paths {
        let path = match entry {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "Skipping unreadable glob entry");
                continue;
            }
        };
        match read_summary(&path) {
            Ok(summary) => {
                debug!(run = %summary.run_dir, "Collected run");
                runs.push(summary);
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping run"),
        }
    }

    runs.sort_by(|a, b| {
        b.best_avg_logprob
            .partial_cmp(&a.best_avg_logprob)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.run_dir.cmp(&b.run_dir))
    });
    let total_cost_usd = runs.iter().map(|r| r.cost_usd).sum();

    Ok(RunReport {
        runs,
        total_cost_usd,
    })
}

fn read_summary(path: &Path) -> Result<RunSummary> {
    let file = File::open(path).map_err(|e| ExegeteError::io("opening result file", e))?;
    let explanation: Explanation = serde_json::from_reader(BufReader::new(file))
        .map_err(|e| ExegeteError::ParseError(format!("{}: {}", path.display(), e)))?;

    let run_dir = path
        .parent()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| path.display().to_string());

    Ok(RunSummary {
        run_dir,
        best_prompt: explanation.best.text,
        best_avg_logprob: explanation.best.avg_logprob,
        best_accuracy: explanation.best.accuracy,
        prompts_ranked: explanation.ranked.len(),
        steps_run: explanation.stats.steps_run,
        examples_consumed: explanation.stats.examples_consumed,
        cost_usd: explanation.stats.cost_usd,
        stop_reason: explanation.stats.stop_reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CandidateOrigin, ScoredPrompt, SearchStats};
    use std::io::Write;
    use tempfile::TempDir;

    fn explanation(text: &str, avg_logprob: f64, cost: f64) -> Explanation {
        let ranked = vec![ScoredPrompt {
            text: text.to_string(),
            origin: CandidateOrigin::Generated,
            avg_logprob,
            accuracy: Some(0.75),
            n_examples_scored: 32,
            matched_check: false,
            first_seen_step: 2,
        }];
        let stats = SearchStats {
            steps_run: 5,
            cost_usd: cost,
            ..Default::default()
        };
        Explanation::from_ranked(ranked, stats).unwrap()
    }

    fn write_result(dir: &Path, explanation: &Explanation) {
        std::fs::create_dir_all(dir).unwrap();
        let file = File::create(dir.join("result.json")).unwrap();
        serde_json::to_writer_pretty(file, explanation).unwrap();
    }

    #[test]
    fn test_collects_and_sorts_runs() {
        let base = TempDir::new().unwrap();
        write_result(
            &base.path().join("runs/20260101_000000_aaaaaa"),
            &explanation("weaker prompt", -2.0, 0.10),
        );
        write_result(
            &base.path().join("runs/20260102_000000_bbbbbb"),
            &explanation("stronger prompt", -1.0, 0.25),
        );

        let pattern = format!("{}/runs/*", base.path().display());
        let report = collect_runs(&pattern).unwrap();

        assert_eq!(report.runs.len(), 2);
        assert_eq!(report.runs[0].best_prompt, "stronger prompt");
        assert_eq!(report.runs[1].best_prompt, "weaker prompt");
        assert!((report.total_cost_usd - 0.35).abs() < 1e-9);
        assert_eq!(report.runs[0].best_accuracy, Some(0.75));
    }

    #[test]
    fn test_skips_corrupt_results() {
        let base = TempDir::new().unwrap();
        write_result(
            &base.path().join("runs/good"),
            &explanation("solid prompt", -1.5, 0.05),
        );

        let bad_dir = base.path().join("runs/bad");
        std::fs::create_dir_all(&bad_dir).unwrap();
        let mut bad = File::create(bad_dir.join("result.json")).unwrap();
        writeln!(bad, "not json").unwrap();

        let pattern = format!("{}/runs/*", base.path().display());
        let report = collect_runs(&pattern).unwrap();
        assert_eq!(report.runs.len(), 1);
        assert_eq!(report.runs[0].best_prompt, "solid prompt");
    }

    #[test]
    fn test_empty_glob_is_empty_report() {
        let base = TempDir::new().unwrap();
        let pattern = format!("{}/nothing/*", base.path().display());
        let report = collect_runs(&pattern).unwrap();
        assert!(report.runs.is_empty());
        assert_eq!(report.total_cost_usd, 0.0);
    }
}

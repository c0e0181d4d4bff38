//! Resumable search state, persisted atomically between steps.
//!
//! The checkpoint holds everything the engine needs to pick a run back
//! up: the pool snapshot, the data cursor, the improvement counter, and
//! the accumulated statistics. Writes go to a temp file first and are
//! renamed into place; the previous checkpoint survives as a backup.

use crate::models::{ExegeteError, Result, SearchStats};
use crate::search::PoolEntry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Snapshot of a search run between steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchCheckpoint {
    /// Run identifier (the run directory stamp)
    pub run_id: String,
    /// Next step to execute
    pub step: usize,
    /// Position of the cycling data cursor
    pub examples_cursor: usize,
    /// Pool snapshot, best first
    pub pool: Vec<PoolEntry>,
    /// Best running mean seen so far
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_avg_logprob: Option<f64>,
    /// Steps since the best score last improved
    pub rounds_since_improvement: usize,
    /// Config seed; each step derives its RNG stream from seed + step
    pub seed: u64,
    /// Accumulated run statistics
    pub stats: SearchStats,
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
}

impl SearchCheckpoint {
    /// Fresh state for a new run.
    pub fn new(run_id: &str, seed: u64) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.to_string(),
            step: 0,
            examples_cursor: 0,
            pool: Vec::new(),
            best_avg_logprob: None,
            rounds_since_improvement: 0,
            seed,
            stats: SearchStats::default(),
            started_at: now,
            updated_at: now,
        }
    }

    /// Fold one completed step into the state.
    pub fn advance(&mut self, next_step: usize, cursor: usize, pool: Vec<PoolEntry>) {
        self.step = next_step;
        self.examples_cursor = cursor;
        self.pool = pool;
        self.updated_at = Utc::now();
    }
}

/// Persists and loads search checkpoints.
pub struct CheckpointManager {
    dir: PathBuf,
    checkpoint_path: PathBuf,
    backup_path: PathBuf,
    state: Option<SearchCheckpoint>,
}

impl CheckpointManager {
    /// Create a manager rooted at the run directory.
    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| ExegeteError::io("creating run dir", e))?;

        Ok(Self {
            dir: dir.to_path_buf(),
            checkpoint_path: dir.join("checkpoint.json"),
            backup_path: dir.join("checkpoint.backup.json"),
            state: None,
        })
    }

    /// Check if a checkpoint exists on disk.
    pub fn exists(&self) -> bool {
        self.checkpoint_path.exists()
    }

    /// Load an existing checkpoint or initialize a fresh one.
    pub fn init_or_load(&mut self, run_id: &str, seed: u64) -> Result<&SearchCheckpoint> {
        if self.exists() {
            self.load()?;
            let state = self.state.as_ref().unwrap();
            info!(
                step = state.step,
                pool = state.pool.len(),
                "Resuming from checkpoint"
            );
            if state.seed != seed {
                return Err(ExegeteError::InvalidInput(format!(
                    "checkpoint was written with seed {}, config says {}",
                    state.seed, seed
                )));
            }
        } else {
            self.state = Some(SearchCheckpoint::new(run_id, seed));
            self.save()?;
            info!(run_id, "Created new checkpoint");
        }
        Ok(self.state.as_ref().unwrap())
    }

    /// Load checkpoint from disk.
    pub fn load(&mut self) -> Result<&SearchCheckpoint> {
        let file = File::open(&self.checkpoint_path)
            .map_err(|e| ExegeteError::io("opening checkpoint", e))?;
        let reader = BufReader::new(file);
        let state: SearchCheckpoint = serde_json::from_reader(reader)
            .map_err(|e| ExegeteError::ParseError(format!("Invalid checkpoint: {}", e)))?;

        self.state = Some(state);
        Ok(self.state.as_ref().unwrap())
    }

    /// Save checkpoint to disk (atomic write).
    pub fn save(&self) -> Result<()> {
        let state = self
            .state
            .as_ref()
            .ok_or_else(|| ExegeteError::Internal("No checkpoint state to save".to_string()))?;

        // Backup existing checkpoint
        if self.checkpoint_path.exists() {
            fs::copy(&self.checkpoint_path, &self.backup_path)
                .map_err(|e| ExegeteError::io("backing up checkpoint", e))?;
        }

        // Write to temp file
        let temp_path = self.dir.join("checkpoint.tmp.json");
        let file = File::create(&temp_path)
            .map_err(|e| ExegeteError::io("creating temp checkpoint", e))?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, state)
            .map_err(|e| ExegeteError::Internal(format!("Serializing checkpoint: {}", e)))?;

        // Atomic rename
        fs::rename(&temp_path, &self.checkpoint_path)
            .map_err(|e| ExegeteError::io("renaming checkpoint", e))?;

        debug!("Checkpoint saved");
        Ok(())
    }

    /// Get reference to state.
    pub fn state(&self) -> Option<&SearchCheckpoint> {
        self.state.as_ref()
    }

    /// Get mutable reference to state.
    pub fn state_mut(&mut self) -> Option<&mut SearchCheckpoint> {
        self.state.as_mut()
    }

    /// Get the run directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CandidateOrigin, PromptCandidate};
    use crate::search::PromptPool;
    use tempfile::TempDir;

    fn pool_with_one() -> Vec<PoolEntry> {
        let mut pool = PromptPool::new();
        let c = PromptCandidate::new(
            "add the numbers".to_string(),
            CandidateOrigin::Generated,
            0,
        );
        pool.record_round(&c, -1.5, 4, false);
        pool.snapshot()
    }

    #[test]
    fn test_init_creates_checkpoint_file() {
        let dir = TempDir::new().unwrap();
        let mut mgr = CheckpointManager::new(dir.path()).unwrap();
        assert!(!mgr.exists());

        mgr.init_or_load("20260101_000000_abc123", 1).unwrap();
        assert!(mgr.exists());
        assert_eq!(mgr.state().unwrap().step, 0);
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut mgr = CheckpointManager::new(dir.path()).unwrap();
        mgr.init_or_load("run", 7).unwrap();

        {
            let state = mgr.state_mut().unwrap();
            state.advance(3, 24, pool_with_one());
            state.best_avg_logprob = Some(-1.5);
            state.rounds_since_improvement = 2;
            state.stats.steps_run = 3;
        }
        mgr.save().unwrap();

        let mut fresh = CheckpointManager::new(dir.path()).unwrap();
        let loaded = fresh.load().unwrap();
        assert_eq!(loaded.step, 3);
        assert_eq!(loaded.examples_cursor, 24);
        assert_eq!(loaded.pool.len(), 1);
        assert_eq!(loaded.best_avg_logprob, Some(-1.5));
        assert_eq!(loaded.rounds_since_improvement, 2);
        assert_eq!(loaded.seed, 7);
    }

    #[test]
    fn test_resume_rejects_seed_mismatch() {
        let dir = TempDir::new().unwrap();
        let mut mgr = CheckpointManager::new(dir.path()).unwrap();
        mgr.init_or_load("run", 1).unwrap();

        let mut again = CheckpointManager::new(dir.path()).unwrap();
        let err = again.init_or_load("run", 2).unwrap_err();
        assert!(matches!(err, ExegeteError::InvalidInput(_)));
    }

    #[test]
    fn test_second_save_keeps_backup() {
        let dir = TempDir::new().unwrap();
        let mut mgr = CheckpointManager::new(dir.path()).unwrap();
        mgr.init_or_load("run", 1).unwrap();

        mgr.state_mut().unwrap().advance(1, 8, pool_with_one());
        mgr.save().unwrap();

        assert!(dir.path().join("checkpoint.json").exists());
        assert!(dir.path().join("checkpoint.backup.json").exists());

        // Backup holds the previous step.
        let backup: SearchCheckpoint = serde_json::from_reader(BufReader::new(
            File::open(dir.path().join("checkpoint.backup.json")).unwrap(),
        ))
        .unwrap();
        assert_eq!(backup.step, 0);
    }
}

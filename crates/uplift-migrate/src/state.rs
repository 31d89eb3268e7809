//! Durable migration state
//!
//! One JSON record per schema under the platform data directory. The file
//! is rewritten on every phase or step transition, atomically via a temp
//! file in the same directory, so a crash never leaves a torn record.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// The linear migration phases; no skip-ahead transitions exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    Preflight,
    Analysis,
    Recommendation,
    Execution,
    Validation,
    Completed,
}

impl MigrationPhase {
    pub fn successor(&self) -> Option<MigrationPhase> {
        match self {
            MigrationPhase::Preflight => Some(MigrationPhase::Analysis),
            MigrationPhase::Analysis => Some(MigrationPhase::Recommendation),
            MigrationPhase::Recommendation => Some(MigrationPhase::Execution),
            MigrationPhase::Execution => Some(MigrationPhase::Validation),
            MigrationPhase::Validation => Some(MigrationPhase::Completed),
            MigrationPhase::Completed => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MigrationPhase::Preflight => "preflight",
            MigrationPhase::Analysis => "analysis",
            MigrationPhase::Recommendation => "recommendation",
            MigrationPhase::Execution => "execution",
            MigrationPhase::Validation => "validation",
            MigrationPhase::Completed => "completed",
        }
    }
}

/// The persisted record for one schema's migration run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationState {
    pub schema: String,
    pub phase: MigrationPhase,
    pub total_issues: usize,
    pub completed_steps: Vec<usize>,
    pub pending_steps: Vec<usize>,
    pub fixed_issues: usize,
    pub rollback_sql_path: Option<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MigrationState {
    pub fn new(schema: &str, total_issues: usize) -> Self {
        let now = Utc::now();
        Self {
            schema: schema.to_string(),
            phase: MigrationPhase::Preflight,
            total_issues,
            completed_steps: Vec::new(),
            pending_steps: (0..total_issues).collect(),
            fixed_issues: 0,
            rollback_sql_path: None,
            error: None,
            started_at: now,
            updated_at: now,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.phase == MigrationPhase::Completed
    }

    /// Coarse progress for display: phase weight plus per-step progress
    /// inside the execution phase
    pub fn progress_percent(&self) -> u8 {
        match self.phase {
            MigrationPhase::Preflight => 0,
            MigrationPhase::Analysis => 20,
            MigrationPhase::Recommendation => 40,
            MigrationPhase::Execution => {
                if self.total_issues == 0 {
                    50
                } else {
                    let done = self.completed_steps.len().min(self.total_issues);
                    (50 + done * 40 / self.total_issues) as u8
                }
            }
            MigrationPhase::Validation => 90,
            MigrationPhase::Completed => 100,
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "{}: {} ({}%), {}/{} issues fixed",
            self.schema,
            self.phase.name(),
            self.progress_percent(),
            self.fixed_issues,
            self.total_issues
        )
    }
}

/// Loads and saves `MigrationState` records, one JSON file per schema
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    /// Store under the platform data directory
    pub fn new() -> anyhow::Result<Self> {
        let base = dirs::data_dir().context("no platform data directory")?;
        Ok(Self::with_dir(base.join("uplift").join("migrations")))
    }

    /// Store under an explicit directory
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn state_path(&self, schema: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize_schema_name(schema)))
    }

    pub fn save(&self, state: &mut MigrationState) -> anyhow::Result<()> {
        state.updated_at = Utc::now();
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating state directory {}", self.dir.display()))?;

        let json = serde_json::to_string_pretty(state).context("serializing migration state")?;
        let path = self.state_path(&state.schema);
        write_atomically(&self.dir, &path, &json)?;

        debug!(schema = %state.schema, phase = state.phase.name(), "saved migration state");
        Ok(())
    }

    pub fn load(&self, schema: &str) -> anyhow::Result<Option<MigrationState>> {
        let path = self.state_path(schema);
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&path)
            .with_context(|| format!("reading state file {}", path.display()))?;
        let state = serde_json::from_str(&json)
            .with_context(|| format!("parsing state file {}", path.display()))?;
        Ok(Some(state))
    }

    pub fn delete(&self, schema: &str) -> anyhow::Result<()> {
        let path = self.state_path(schema);
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("deleting state file {}", path.display()))?;
        }
        Ok(())
    }

    /// True when a persisted, non-completed record exists for `schema`
    pub fn can_resume(&self, schema: &str) -> anyhow::Result<bool> {
        Ok(self
            .load(schema)?
            .is_some_and(|state| !state.is_completed()))
    }

    /// Move to the next phase; completed runs have nowhere to go
    pub fn advance_phase(&self, state: &mut MigrationState) -> anyhow::Result<()> {
        let next = state
            .phase
            .successor()
            .with_context(|| format!("migration of {} is already completed", state.schema))?;
        state.phase = next;
        state.error = None;
        self.save(state)
    }

    /// Move one step index from pending to completed
    pub fn mark_step_completed(
        &self,
        state: &mut MigrationState,
        step_index: usize,
    ) -> anyhow::Result<()> {
        state.pending_steps.retain(|&i| i != step_index);
        if !state.completed_steps.contains(&step_index) {
            state.completed_steps.push(step_index);
        }
        state.fixed_issues = state.completed_steps.len();
        self.save(state)
    }

    pub fn set_error(&self, state: &mut MigrationState, error: &str) -> anyhow::Result<()> {
        state.error = Some(error.to_string());
        self.save(state)
    }

    pub fn set_rollback_path(
        &self,
        state: &mut MigrationState,
        path: &str,
    ) -> anyhow::Result<()> {
        state.rollback_sql_path = Some(path.to_string());
        self.save(state)
    }

    /// Every persisted non-completed run, most recently touched first
    pub fn list_incomplete(&self) -> anyhow::Result<Vec<MigrationState>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut states = Vec::new();
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("listing state directory {}", self.dir.display()))?
        {
            let path = entry.context("reading state directory entry")?.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let Ok(json) = fs::read_to_string(&path) else {
                continue;
            };
            // Unreadable records are skipped, not fatal
            let Ok(state) = serde_json::from_str::<MigrationState>(&json) else {
                continue;
            };
            if !state.is_completed() {
                states.push(state);
            }
        }
        states.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(states)
    }
}

/// Keep only filesystem-safe characters in the schema name
fn sanitize_schema_name(schema: &str) -> String {
    schema
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Write via a temp file in the same directory, then rename over the
/// target, so readers never observe a half-written record
fn write_atomically(dir: &Path, path: &Path, contents: &str) -> anyhow::Result<()> {
    let temp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("creating temp file in {}", dir.display()))?;
    fs::write(temp.path(), contents)
        .with_context(|| format!("writing temp state file {}", temp.path().display()))?;
    temp.persist(path)
        .with_context(|| format!("renaming temp state file over {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn store() -> (tempfile::TempDir, StateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::with_dir(dir.path());
        (dir, store)
    }

    #[test]
    fn save_and_load_round_trip() {
        let (_dir, store) = store();
        let mut state = MigrationState::new("shop", 3);
        store.save(&mut state).unwrap();

        let loaded = store.load("shop").unwrap().unwrap();
        assert_eq!(loaded.schema, "shop");
        assert_eq!(loaded.phase, MigrationPhase::Preflight);
        assert_eq!(loaded.pending_steps, vec![0, 1, 2]);
    }

    #[test]
    fn schema_names_are_sanitized_for_the_filesystem() {
        let (_dir, store) = store();
        let mut state = MigrationState::new("my/prod db", 0);
        store.save(&mut state).unwrap();

        assert!(store.state_path("my/prod db").ends_with("my_prod_db.json"));
        assert!(store.load("my/prod db").unwrap().is_some());
    }

    #[test]
    fn phases_advance_linearly_and_stop_at_completed() {
        let (_dir, store) = store();
        let mut state = MigrationState::new("shop", 1);

        let mut seen = vec![state.phase];
        while state.phase.successor().is_some() {
            store.advance_phase(&mut state).unwrap();
            seen.push(state.phase);
        }
        assert_eq!(
            seen,
            vec![
                MigrationPhase::Preflight,
                MigrationPhase::Analysis,
                MigrationPhase::Recommendation,
                MigrationPhase::Execution,
                MigrationPhase::Validation,
                MigrationPhase::Completed,
            ]
        );
        assert!(store.advance_phase(&mut state).is_err());
    }

    #[test]
    fn completing_a_step_moves_it_and_recounts() {
        let (_dir, store) = store();
        let mut state = MigrationState::new("shop", 3);

        store.mark_step_completed(&mut state, 1).unwrap();
        assert_eq!(state.pending_steps, vec![0, 2]);
        assert_eq!(state.completed_steps, vec![1]);
        assert_eq!(state.fixed_issues, 1);

        // Marking the same step twice is harmless
        store.mark_step_completed(&mut state, 1).unwrap();
        assert_eq!(state.fixed_issues, 1);
    }

    #[test]
    fn can_resume_only_while_incomplete() {
        let (_dir, store) = store();
        assert!(!store.can_resume("shop").unwrap());

        let mut state = MigrationState::new("shop", 1);
        store.save(&mut state).unwrap();
        assert!(store.can_resume("shop").unwrap());

        state.phase = MigrationPhase::Completed;
        store.save(&mut state).unwrap();
        assert!(!store.can_resume("shop").unwrap());
    }

    #[test]
    fn list_incomplete_returns_newest_first() {
        let (_dir, store) = store();
        let mut older = MigrationState::new("alpha", 1);
        store.save(&mut older).unwrap();
        // save() stamps updated_at, so beta ends up newer than alpha
        let mut newer = MigrationState::new("beta", 1);
        store.save(&mut newer).unwrap();

        let mut done = MigrationState::new("gamma", 1);
        done.phase = MigrationPhase::Completed;
        store.save(&mut done).unwrap();

        let incomplete = store.list_incomplete().unwrap();
        let schemas: Vec<&str> = incomplete.iter().map(|s| s.schema.as_str()).collect();
        assert_eq!(schemas, vec!["beta", "alpha"]);
    }

    #[test]
    fn progress_tracks_execution_steps() {
        let mut state = MigrationState::new("shop", 4);
        assert_eq!(state.progress_percent(), 0);

        state.phase = MigrationPhase::Execution;
        assert_eq!(state.progress_percent(), 50);
        state.completed_steps = vec![0, 1];
        assert_eq!(state.progress_percent(), 70);

        state.phase = MigrationPhase::Completed;
        assert_eq!(state.progress_percent(), 100);
        assert!(state.summary().contains("completed (100%)"));
    }

    #[test]
    fn error_is_cleared_on_phase_advance() {
        let (_dir, store) = store();
        let mut state = MigrationState::new("shop", 1);
        store.set_error(&mut state, "lost connection").unwrap();
        assert_eq!(state.error.as_deref(), Some("lost connection"));

        store.advance_phase(&mut state).unwrap();
        assert!(state.error.is_none());
    }
}

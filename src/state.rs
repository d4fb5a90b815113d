//! Durable task workflow state with phase transition validation.
//!
//! One JSON record per task, replaced atomically on every transition so
//! a concurrent reader always observes a fully-formed prior or new
//! record, never a torn mix. The orchestrator is the only writer; all
//! other components are read-only consumers.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::panel::Decision;
use crate::role::{Role, TaskId};
use crate::qlog_debug;

/// Workflow phases, in order. Persisted as stable snake_case names;
/// the derived `Ord` follows declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Both writers produce candidate implementations in parallel.
    Writers,
    /// The judge panel compares the two candidates.
    Panel,
    /// The winning writer applies panel feedback / merge instructions.
    Synthesis,
    /// The panel re-reviews the synthesized result.
    PeerReview,
    /// The task produced an approved, mergeable result.
    Complete,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Writers => write!(f, "writers"),
            Phase::Panel => write!(f, "panel"),
            Phase::Synthesis => write!(f, "synthesis"),
            Phase::PeerReview => write!(f, "peer_review"),
            Phase::Complete => write!(f, "complete"),
        }
    }
}

/// Which candidate the panel chose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChosenPath {
    #[default]
    Undecided,
    A,
    B,
    Tie,
}

impl std::fmt::Display for ChosenPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChosenPath::Undecided => write!(f, "undecided"),
            ChosenPath::A => write!(f, "A"),
            ChosenPath::B => write!(f, "B"),
            ChosenPath::Tie => write!(f, "tie"),
        }
    }
}

/// Overall workflow status for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Active,
    Complete,
    Failed,
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStatus::Active => write!(f, "active"),
            WorkflowStatus::Complete => write!(f, "complete"),
            WorkflowStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A record of a phase transition with timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseHistoryEntry {
    pub phase: Phase,
    pub entered_at: DateTime<Utc>,
}

/// The single authoritative state record for a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub task_id: TaskId,
    pub phase: Phase,
    pub path: ChosenPath,
    pub winner: Option<Role>,
    pub status: WorkflowStatus,
    /// Set when progression is blocked (e.g. a writer failed).
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    phase_history: Vec<PhaseHistoryEntry>,
}

impl WorkflowState {
    pub fn new(task_id: TaskId) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            phase: Phase::Writers,
            path: ChosenPath::Undecided,
            winner: None,
            status: WorkflowStatus::Active,
            error: None,
            created_at: now,
            updated_at: now,
            phase_history: vec![PhaseHistoryEntry {
                phase: Phase::Writers,
                entered_at: now,
            }],
        }
    }

    /// Valid transitions follow the strict phase order, with the single
    /// PeerReview -> Synthesis loop edge.
    pub fn can_transition(&self, target: Phase) -> bool {
        matches!(
            (self.phase, target),
            (Phase::Writers, Phase::Panel)
                | (Phase::Panel, Phase::Synthesis)
                | (Phase::Synthesis, Phase::PeerReview)
                | (Phase::PeerReview, Phase::Synthesis)
                | (Phase::PeerReview, Phase::Complete)
        )
    }

    pub fn transition(&mut self, target: Phase) -> Result<()> {
        if !self.can_transition(target) {
            return Err(Error::InvalidPhaseTransition {
                from: self.phase.to_string(),
                to: target.to_string(),
            });
        }

        self.phase = target;
        self.updated_at = Utc::now();
        self.phase_history.push(PhaseHistoryEntry {
            phase: target,
            entered_at: self.updated_at,
        });
        if target == Phase::Complete {
            self.status = WorkflowStatus::Complete;
        }
        Ok(())
    }

    pub fn phase_history(&self) -> &[PhaseHistoryEntry] {
        &self.phase_history
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// File-backed store for [`WorkflowState`] records and decision history.
pub struct TaskStateStore {
    root: PathBuf,
}

impl TaskStateStore {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    fn state_path(&self, task_id: &TaskId) -> PathBuf {
        self.root.join(task_id.as_str()).join("state.json")
    }

    fn decisions_path(&self, task_id: &TaskId) -> PathBuf {
        self.root.join(task_id.as_str()).join("decisions.json")
    }

    pub fn load(&self, task_id: &TaskId) -> Result<Option<WorkflowState>> {
        let path = self.state_path(task_id);
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    /// Atomic whole-record replace: write to a temp file in the same
    /// directory, then rename over the target.
    pub fn save(&self, state: &WorkflowState) -> Result<()> {
        let path = self.state_path(&state.task_id);
        qlog_debug!(
            "TaskStateStore::save task={} phase={} status={}",
            state.task_id,
            state.phase,
            state.status
        );
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(state)?;
        atomic_replace(&path, contents.as_bytes())
    }

    /// Append a decision to the task's history. History is retained;
    /// the latest entry is authoritative.
    pub fn append_decision(&self, task_id: &TaskId, decision: &Decision) -> Result<()> {
        let mut history = self.load_decisions(task_id)?;
        history.push(decision.clone());
        let path = self.decisions_path(task_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(&history)?;
        atomic_replace(&path, contents.as_bytes())
    }

    pub fn load_decisions(&self, task_id: &TaskId) -> Result<Vec<Decision>> {
        let path = self.decisions_path(task_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// All task ids with a stored state record.
    pub fn list(&self) -> Result<Vec<TaskId>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.path().join("state.json").exists() {
                continue;
            }
            let name = entry.file_name();
            if let Some(name) = name.to_str() {
                if let Ok(id) = TaskId::new(name) {
                    out.push(id);
                }
            }
        }
        out.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(out)
    }

    /// Remove a task record entirely (explicit cleanup only).
    pub fn remove_task(&self, task_id: &TaskId) -> Result<()> {
        let dir = self.root.join(task_id.as_str());
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }
}

fn atomic_replace(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    temp.write_all(data)?;
    temp.flush()?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

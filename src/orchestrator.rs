//! Top-level task orchestrator.
//!
//! Sequences one task through the full workflow: both writers run
//! concurrently and are joined, the judge panel decides between them,
//! then the synthesis/peer-review loop runs until approval or
//! escalation. The orchestrator is the sole writer of task state;
//! every phase transition persists exactly one new record. All
//! collaborators are injected, file-backed components.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::git::GitOps;
use crate::panel::{Decision, PanelEngine, VoteValue};
use crate::review::{LoopOutcome, ReviewLoop};
use crate::role::{Role, TaskId};
use crate::runner::{AgentRunner, RunOptions, RunOutcome};
use crate::session::SessionRegistry;
use crate::state::{ChosenPath, Phase, TaskStateStore, WorkflowState};
use crate::workspace::{Workspace, WorkspaceManager};
use crate::{qlog, qlog_warn};

/// Root directories the orchestrator works under.
pub struct Paths {
    pub tasks: PathBuf,
    pub sessions: PathBuf,
    pub logs: PathBuf,
    pub workspaces: PathBuf,
}

impl Paths {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            tasks: Config::tasks_dir()?,
            sessions: Config::sessions_dir()?,
            logs: Config::logs_dir()?,
            workspaces: config.workspaces_dir()?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionEntry {
    pub role: String,
    pub handle: String,
}

/// Read-only projection of a task for external consumers.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub task_id: TaskId,
    pub phase: Phase,
    pub path: ChosenPath,
    pub winner: Option<Role>,
    pub status: crate::state::WorkflowStatus,
    pub error: Option<String>,
    pub branches: Vec<String>,
    pub sessions: Vec<SessionEntry>,
}

pub struct Orchestrator {
    config: Config,
    workspaces: WorkspaceManager,
    sessions: SessionRegistry,
    store: TaskStateStore,
    runner: AgentRunner,
    cancel: CancellationToken,
    /// One child token per task, so cancelling one task's runs never
    /// touches another's.
    task_tokens: Mutex<HashMap<String, CancellationToken>>,
}

impl Orchestrator {
    pub fn new(config: Config, repo_path: &Path, paths: Paths) -> Result<Self> {
        let git = GitOps::new(repo_path)?;
        let runner = AgentRunner::new(config.effective_command(), &paths.logs)?;
        let workspaces =
            WorkspaceManager::new(git, &paths.workspaces, &config.remote, config.push_attempts);
        Ok(Self {
            workspaces,
            sessions: SessionRegistry::new(&paths.sessions),
            store: TaskStateStore::new(&paths.tasks),
            runner,
            cancel: CancellationToken::new(),
            task_tokens: Mutex::new(HashMap::new()),
            config,
        })
    }

    /// Token cancelling every in-flight agent run owned by this
    /// orchestrator.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn task_token(&self, task_id: &TaskId) -> CancellationToken {
        let mut tokens = self
            .task_tokens
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tokens
            .entry(task_id.to_string())
            .or_insert_with(|| self.cancel.child_token())
            .clone()
    }

    fn panel_engine(&self) -> PanelEngine<'_> {
        PanelEngine::new(
            &self.runner,
            &self.sessions,
            self.config.judge_timeout(),
            self.config.tie_breaks.clone(),
        )
    }

    /// Run a brand-new task end to end: writers, panel, synthesis and
    /// peer review until the task completes or escalates.
    pub async fn start(
        &self,
        task_id: &TaskId,
        prompt: &str,
        events: Option<mpsc::Sender<Event>>,
    ) -> Result<WorkflowState> {
        if self.store.load(task_id)?.is_some() {
            return Err(Error::Validation(format!(
                "Task '{}' already exists; resume it or clean it up first",
                task_id
            )));
        }

        let mut state = WorkflowState::new(task_id.clone());
        self.store.save(&state)?;
        qlog!("Task {} started", task_id);

        let ws_a = self.workspaces.acquire(task_id, Role::WriterA, None)?;
        let ws_b = self.workspaces.acquire(task_id, Role::WriterB, None)?;

        // Both writers run concurrently; a failure in one never aborts
        // the other, the join always waits for both.
        let (res_a, res_b) = tokio::join!(
            self.run_agent(task_id, &ws_a, prompt, false, events.clone()),
            self.run_agent(task_id, &ws_b, prompt, false, events.clone()),
        );
        self.check_writer(&mut state, Role::WriterA, res_a)?;
        self.check_writer(&mut state, Role::WriterB, res_b)?;

        self.workspaces.finalize(&ws_a, &writer_commit_message(task_id, Role::WriterA))?;
        self.workspaces.finalize(&ws_b, &writer_commit_message(task_id, Role::WriterB))?;

        state.transition(Phase::Panel)?;
        self.store.save(&state)?;

        self.panel_and_loop(task_id, state, &ws_a, &ws_b, events)
            .await
    }

    /// Re-enter an existing task from its persisted phase. This is the
    /// external decision that re-arms a blocked or escalated task: the
    /// error flag is cleared and the review loop (when reached) gets a
    /// fresh retry cap and time budget.
    ///
    /// From Writers both candidates must already be in place (re-run a
    /// failed writer with [`resume`](Self::resume) first); from
    /// Synthesis or PeerReview the loop restarts with `feedback` as the
    /// next synthesis prompt.
    pub async fn continue_task(
        &self,
        task_id: &TaskId,
        feedback: &str,
        events: Option<mpsc::Sender<Event>>,
    ) -> Result<WorkflowState> {
        let mut state = self
            .store
            .load(task_id)?
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;
        if state.phase == Phase::Complete {
            return Err(Error::Validation(format!(
                "Task '{}' is already complete",
                task_id
            )));
        }

        state.error = None;
        state.touch();
        qlog!("Continuing task {} from phase {}", task_id, state.phase);

        let ws_a = self.workspaces.acquire(task_id, Role::WriterA, None)?;
        let ws_b = self.workspaces.acquire(task_id, Role::WriterB, None)?;

        match state.phase {
            Phase::Writers => {
                self.workspaces
                    .finalize(&ws_a, &writer_commit_message(task_id, Role::WriterA))?;
                self.workspaces
                    .finalize(&ws_b, &writer_commit_message(task_id, Role::WriterB))?;
                state.transition(Phase::Panel)?;
                self.store.save(&state)?;
                self.panel_and_loop(task_id, state, &ws_a, &ws_b, events)
                    .await
            }
            Phase::Panel => {
                self.store.save(&state)?;
                self.panel_and_loop(task_id, state, &ws_a, &ws_b, events)
                    .await
            }
            Phase::Synthesis | Phase::PeerReview => {
                let Some(winner) = state.winner else {
                    return Err(Error::Validation(format!(
                        "Task '{}' has no recorded winner to continue with",
                        task_id
                    )));
                };
                if state.phase == Phase::PeerReview {
                    state.transition(Phase::Synthesis)?;
                }
                self.store.save(&state)?;
                let winner_ws = if winner == Role::WriterA { &ws_a } else { &ws_b };
                let judges = self.acquire_judges(task_id)?;
                self.review_loop(
                    task_id,
                    state,
                    winner,
                    winner_ws,
                    &judges,
                    feedback.to_string(),
                    events,
                )
                .await
            }
            Phase::Complete => unreachable!("guarded above"),
        }
    }

    /// Panel over the two candidates, then the review loop. Requires
    /// `state` in the Panel phase.
    async fn panel_and_loop(
        &self,
        task_id: &TaskId,
        mut state: WorkflowState,
        ws_a: &Workspace,
        ws_b: &Workspace,
        events: Option<mpsc::Sender<Event>>,
    ) -> Result<WorkflowState> {
        let judges = self.acquire_judges(task_id)?;
        let decision = self
            .panel_engine()
            .run_panel(task_id, &judges, ws_a, ws_b, self.task_token(task_id))
            .await?;
        self.store.append_decision(task_id, &decision)?;

        state.path = chosen_path(decision.chosen);
        state.winner = decision.winner;
        let Some(winner) = decision.winner else {
            state.error = Some("Panel produced no determinable winner".to_string());
            state.touch();
            self.store.save(&state)?;
            return Err(Error::NoQuorum(task_id.to_string()));
        };
        self.store.save(&state)?;

        state.transition(Phase::Synthesis)?;
        self.store.save(&state)?;
        let winner_ws = if winner == Role::WriterA { ws_a } else { ws_b };
        let prompt = synthesis_prompt(&decision, winner);
        self.review_loop(task_id, state, winner, winner_ws, &judges, prompt, events)
            .await
    }

    /// Drive the bounded synthesis/peer-review loop to completion.
    /// Requires `state` in the Synthesis phase; `prompt` seeds the
    /// first synthesis run.
    #[allow(clippy::too_many_arguments)]
    async fn review_loop(
        &self,
        task_id: &TaskId,
        mut state: WorkflowState,
        winner: Role,
        winner_ws: &Workspace,
        judges: &[Workspace],
        mut prompt: String,
        events: Option<mpsc::Sender<Event>>,
    ) -> Result<WorkflowState> {
        let mut rl = ReviewLoop::new(self.config.retry_cap, self.config.time_budget());
        rl.on_winner_decided()?;

        loop {
            let outcome = self
                .run_agent(task_id, winner_ws, &prompt, true, events.clone())
                .await;
            self.check_writer(&mut state, winner, outcome)?;
            self.workspaces.finalize(
                winner_ws,
                &format!("{}: synthesis cycle {}", task_id, rl.cycles() + 1),
            )?;
            rl.on_synthesis_finalized()?;

            state.transition(Phase::PeerReview)?;
            self.store.save(&state)?;

            let review = self
                .panel_engine()
                .run_peer_review(task_id, judges, winner_ws, self.task_token(task_id))
                .await?;
            self.store.append_decision(task_id, &review)?;

            match rl.on_review(review.approved)? {
                LoopOutcome::Approved => {
                    state.transition(Phase::Complete)?;
                    self.store.save(&state)?;
                    qlog!("Task {} complete, winner {}", task_id, winner);
                    return Ok(state);
                }
                LoopOutcome::Continue => {
                    state.transition(Phase::Synthesis)?;
                    self.store.save(&state)?;
                    prompt = revision_prompt(&review);
                }
                LoopOutcome::Escalated => {
                    state.error = Some(format!(
                        "Escalated after {} rejection cycles",
                        rl.cycles()
                    ));
                    state.touch();
                    self.store.save(&state)?;
                    return Err(Error::Escalated {
                        task: task_id.to_string(),
                        cycles: rl.cycles(),
                    });
                }
            }
        }
    }

    async fn run_agent(
        &self,
        task_id: &TaskId,
        workspace: &Workspace,
        prompt: &str,
        resume: bool,
        events: Option<mpsc::Sender<Event>>,
    ) -> Result<RunOutcome> {
        let opts = RunOptions {
            resume,
            ..Default::default()
        };
        self.runner
            .run(
                task_id,
                workspace.role,
                &workspace.path,
                prompt,
                &opts,
                &self.sessions,
                events,
                self.task_token(task_id),
            )
            .await
    }

    /// A failed writer blocks progression: the task stays in its
    /// current phase with the error recorded, never silently advanced.
    fn check_writer(
        &self,
        state: &mut WorkflowState,
        role: Role,
        outcome: Result<RunOutcome>,
    ) -> Result<()> {
        let err = match outcome {
            Ok(run) if run.ok => return Ok(()),
            Ok(run) => Error::WriterFailed {
                role: role.to_string(),
                code: run.exit_code,
            },
            Err(e) => e,
        };
        state.error = Some(err.to_string());
        state.touch();
        self.store.save(state)?;
        qlog_warn!("Writer {} blocked task {}: {}", role, state.task_id, err);
        Err(err)
    }

    fn acquire_judges(&self, task_id: &TaskId) -> Result<Vec<Workspace>> {
        Role::judges(self.config.judge_count)
            .into_iter()
            .map(|role| self.workspaces.acquire(task_id, role, None))
            .collect()
    }

    /// Re-run a single role with its stored session and new feedback.
    /// Clears a recorded error: invoking resume is the external
    /// decision that re-arms a blocked or escalated task.
    pub async fn resume(
        &self,
        task_id: &TaskId,
        role: Role,
        feedback: &str,
        events: Option<mpsc::Sender<Event>>,
    ) -> Result<RunOutcome> {
        let mut state = self
            .store
            .load(task_id)?
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;

        let workspace = self.workspaces.acquire(task_id, role, None)?;
        let outcome = self
            .run_agent(task_id, &workspace, feedback, true, events)
            .await?;
        if outcome.ok && role.is_writer() {
            self.workspaces
                .finalize(&workspace, &format!("{}: {} resumed", task_id, role))?;
        }

        if outcome.ok && state.error.is_some() {
            state.error = None;
            state.touch();
            self.store.save(&state)?;
        }
        Ok(outcome)
    }

    /// Cancel the task's in-flight runs and remove everything it owns:
    /// worktrees, branches, sessions and the state record. Raw agent
    /// logs are retained. Other tasks on this orchestrator are
    /// untouched.
    pub fn cleanup(&self, task_id: &TaskId) -> Result<()> {
        let token = {
            let mut tokens = self
                .task_tokens
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            tokens.remove(task_id.as_str())
        };
        if let Some(token) = token {
            token.cancel();
        }
        let report = self.workspaces.cleanup_task(task_id);
        for (path, err) in &report.failed {
            qlog_warn!("Cleanup of {} left {}: {}", task_id, path.display(), err);
        }
        self.sessions.remove_task(task_id)?;
        self.store.remove_task(task_id)?;
        qlog!(
            "Task {} cleaned up ({} worktrees, {} branches)",
            task_id,
            report.removed.len(),
            report.branches_deleted.len()
        );
        Ok(())
    }

    /// Read-only status projection combining state, branches and
    /// session handles.
    pub fn status(&self, task_id: &TaskId) -> Result<StatusReport> {
        let state = self
            .store
            .load(task_id)?
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;
        let branches = self
            .workspaces
            .git()
            .branches_with_prefix(&format!("quorum/{}/", task_id))?;
        let sessions = self
            .sessions
            .list(task_id)?
            .into_iter()
            .map(|(role, handle)| SessionEntry {
                role: role.to_string(),
                handle: handle.as_str().to_string(),
            })
            .collect();

        Ok(StatusReport {
            task_id: state.task_id.clone(),
            phase: state.phase,
            path: state.path,
            winner: state.winner,
            status: state.status,
            error: state.error.clone(),
            branches,
            sessions,
        })
    }

    /// All known tasks, for the status overview.
    pub fn list_tasks(&self) -> Result<Vec<TaskId>> {
        self.store.list()
    }
}

fn chosen_path(chosen: Option<VoteValue>) -> ChosenPath {
    match chosen {
        Some(VoteValue::A) => ChosenPath::A,
        Some(VoteValue::B) => ChosenPath::B,
        Some(VoteValue::Tie) => ChosenPath::Tie,
        _ => ChosenPath::Undecided,
    }
}

fn writer_commit_message(task_id: &TaskId, role: Role) -> String {
    format!("{}: {} candidate", task_id, role)
}

/// Prompt for the winner's synthesis run. With a compatible pair the
/// merge instructions drive the run; otherwise the winner polishes its
/// own candidate using the panel rationales. A tied panel gets honest
/// wording: the candidate was picked as primary, not as winner.
fn synthesis_prompt(decision: &Decision, winner: Role) -> String {
    let rationales: Vec<String> = decision
        .votes
        .iter()
        .filter(|v| !v.rationale.is_empty())
        .map(|v| format!("- judge {}: {}", v.judge, v.rationale))
        .collect();

    let opening = if decision.chosen == Some(VoteValue::Tie) {
        "The panel could not separate the two candidates; yours was picked \
         as the primary merge target."
    } else {
        "Your candidate won the panel review."
    };

    match &decision.synthesis {
        Some(payload) => {
            let other = if winner == Role::WriterA {
                ("B", &payload.highlights.b)
            } else {
                ("A", &payload.highlights.a)
            };
            let mut prompt = format!(
                "{} Merge the best elements of \
                 candidate {} into your branch.\n\nMerge instructions:\n{}\n",
                opening, other.0, payload.merge_instructions
            );
            if !other.1.is_empty() {
                prompt.push_str("\nHighlights to adopt:\n");
                for h in other.1 {
                    prompt.push_str("- ");
                    prompt.push_str(h);
                    prompt.push('\n');
                }
            }
            if !rationales.is_empty() {
                prompt.push_str("\nPanel rationale:\n");
                prompt.push_str(&rationales.join("\n"));
            }
            prompt
        }
        None => format!(
            "{} The candidates were not mergeable, so proceed with your own \
             implementation. Address the panel feedback below, then ensure \
             checks pass.\n\nPanel rationale:\n{}",
            opening,
            rationales.join("\n")
        ),
    }
}

/// Prompt for a revision cycle after a blocking peer review.
fn revision_prompt(review: &Decision) -> String {
    let mut prompt = String::from(
        "Peer review requested changes on your synthesized result. Address \
         every issue below and resubmit.\n",
    );
    for vote in &review.votes {
        if vote.vote == VoteValue::RequestChanges && !vote.rationale.is_empty() {
            prompt.push_str(&format!("\nJudge {}: {}\n", vote.judge, vote.rationale));
        }
        for issue in &vote.blockers {
            prompt.push_str("- ");
            prompt.push_str(issue);
            prompt.push('\n');
        }
    }
    prompt
}

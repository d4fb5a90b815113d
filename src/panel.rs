//! Panel decision engine.
//!
//! Runs N judges concurrently over two candidate workspaces, collects
//! their structured vote artifacts, and aggregates them into a single
//! immutable [`Decision`]. A judge that times out or writes an invalid
//! artifact contributes no vote; the panel proceeds as long as at least
//! one valid vote arrives. Aggregation is a pure function of the votes,
//! so the same inputs always yield the same decision.
//!
//! Peer-review cycles reuse the same collection mechanics but aggregate
//! APPROVE / REQUEST_CHANGES / COMMENT instead of A / B / TIE.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::role::{Role, TaskId};
use crate::runner::{AgentRunner, RunOptions};
use crate::session::SessionRegistry;
use crate::workspace::Workspace;
use crate::{qlog, qlog_warn};

/// Relative path of the vote artifact inside a judge's workspace.
pub const VOTE_FILE: &str = ".quorum/vote.json";

/// Tie-break criteria, applied in configured order when the vote has
/// no strict majority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Architecture/tooling compliance. A recorded FAIL eliminates the
    /// candidate outright, before any counting.
    ArchitectureCompliance,
    /// Fewer simplicity violations wins.
    Simplicity,
    /// Lower total blocker count wins.
    BlockerCount,
}

/// Which kind of review a panel cycle is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewKind {
    Panel,
    PeerReview,
}

/// A single judge's vote value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoteValue {
    A,
    B,
    #[serde(rename = "TIE")]
    Tie,
    #[serde(rename = "APPROVE")]
    Approve,
    #[serde(rename = "REQUEST_CHANGES")]
    RequestChanges,
    #[serde(rename = "COMMENT")]
    Comment,
}

impl VoteValue {
    /// Parse a decision string from a vote artifact. `REJECTED` is an
    /// accepted alias for `REQUEST_CHANGES`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A" => Some(VoteValue::A),
            "B" => Some(VoteValue::B),
            "TIE" => Some(VoteValue::Tie),
            "APPROVE" => Some(VoteValue::Approve),
            "REQUEST_CHANGES" | "REJECTED" => Some(VoteValue::RequestChanges),
            "COMMENT" => Some(VoteValue::Comment),
            _ => None,
        }
    }

    fn valid_for(&self, kind: ReviewKind) -> bool {
        match kind {
            ReviewKind::Panel => {
                matches!(self, VoteValue::A | VoteValue::B | VoteValue::Tie)
            }
            ReviewKind::PeerReview => matches!(
                self,
                VoteValue::Approve | VoteValue::RequestChanges | VoteValue::Comment
            ),
        }
    }
}

/// Per-candidate compliance assessment inside a vote artifact.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CandidateScore {
    #[serde(default)]
    pub architecture_pass: Option<bool>,
    #[serde(default)]
    pub simplicity_pass: Option<bool>,
    /// Whether the candidate passes its own checks (build/tests).
    #[serde(default)]
    pub checks_pass: Option<bool>,
    #[serde(default)]
    pub blockers: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Scores {
    #[serde(default)]
    pub a: Option<CandidateScore>,
    #[serde(default)]
    pub b: Option<CandidateScore>,
}

/// A judge's compatibility assessment of the two candidates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Compatibility {
    #[serde(default)]
    pub same_interface: bool,
    #[serde(default)]
    pub no_file_conflicts: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Highlights {
    #[serde(default)]
    pub a: Vec<String>,
    #[serde(default)]
    pub b: Vec<String>,
}

/// The on-disk artifact a judge writes at [`VOTE_FILE`].
///
/// `judge`, `task_id` and `decision` are mandatory; everything else is
/// optional. An artifact with a missing or unrecognized `decision` is
/// treated as a non-responsive judge, never as a panel failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteArtifact {
    pub judge: u32,
    pub task_id: String,
    pub decision: String,
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub scores: Option<Scores>,
    #[serde(default)]
    pub compatibility: Option<Compatibility>,
    #[serde(default)]
    pub merge_instructions: Option<String>,
    #[serde(default)]
    pub highlights: Option<Highlights>,
    #[serde(default)]
    pub blocker_issues: Vec<String>,
    #[serde(default)]
    pub remaining_issues: Vec<String>,
}

/// A validated vote as recorded in a [`Decision`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeVote {
    pub judge: u32,
    pub vote: VoteValue,
    pub rationale: String,
    #[serde(default)]
    pub scores: Option<Scores>,
    #[serde(default)]
    pub compatibility: Option<Compatibility>,
    #[serde(default)]
    pub merge_instructions: Option<String>,
    #[serde(default)]
    pub highlights: Option<Highlights>,
    #[serde(default)]
    pub blockers: Vec<String>,
}

impl JudgeVote {
    fn from_artifact(artifact: VoteArtifact, vote: VoteValue) -> Self {
        // Panel artifacts report blocker_issues, peer reviews report
        // remaining_issues; both feed the same revision feedback.
        let mut blockers = artifact.blocker_issues;
        blockers.extend(artifact.remaining_issues);
        Self {
            judge: artifact.judge,
            vote,
            rationale: artifact.rationale,
            scores: artifact.scores,
            compatibility: artifact.compatibility,
            merge_instructions: artifact.merge_instructions,
            highlights: artifact.highlights,
            blockers,
        }
    }
}

/// What the orchestrator should do after a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextAction {
    /// Merge the best of both candidates into the winner's branch.
    Synthesize,
    /// Take the winner as-is; candidates are not mergeable.
    PickPrimary,
    /// Peer review passed.
    Approve,
    /// Peer review blocked; the winner revises and resubmits.
    Revise,
}

/// Instructions for the synthesis run, present only when the
/// compatibility gate passed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisPayload {
    pub compatible: bool,
    pub merge_instructions: String,
    pub highlights: Highlights,
}

/// Aggregated, immutable output of one panel or peer-review cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub task_id: TaskId,
    pub kind: ReviewKind,
    pub votes: Vec<JudgeVote>,
    /// Panel outcome in {A, B, TIE}; absent for peer review.
    pub chosen: Option<VoteValue>,
    pub winner: Option<Role>,
    /// Strict majority (panel) or unanimous approval (peer review).
    pub consensus: bool,
    /// Peer-review verdict; always false for panel decisions.
    pub approved: bool,
    pub next_action: NextAction,
    pub synthesis: Option<SynthesisPayload>,
    pub created_at: DateTime<Utc>,
}

/// Aggregate panel votes into a decision. Pure and deterministic.
///
/// A strict majority on A or B wins directly. An architecture FAIL
/// recorded against a candidate eliminates it regardless of votes.
/// Without a strict majority the tie-break chain runs in the given
/// order; an unresolved tie falls back to writer A as primary.
pub fn aggregate_panel(
    task_id: &TaskId,
    votes: Vec<JudgeVote>,
    tie_breaks: &[TieBreak],
) -> Decision {
    let n = votes.len();
    let count = |v: VoteValue| votes.iter().filter(|j| j.vote == v).count();
    let votes_a = count(VoteValue::A);
    let votes_b = count(VoteValue::B);

    let arch_fail = |pick: fn(&Scores) -> &Option<CandidateScore>| {
        votes.iter().any(|j| {
            j.scores
                .as_ref()
                .and_then(|s| pick(s).as_ref())
                .and_then(|c| c.architecture_pass)
                == Some(false)
        })
    };
    let elim_a = arch_fail(|s| &s.a);
    let elim_b = arch_fail(|s| &s.b);

    let (chosen, winner, consensus) = if elim_a && elim_b {
        (Some(VoteValue::Tie), None, false)
    } else if elim_a {
        (Some(VoteValue::B), Some(Role::WriterB), votes_b * 2 > n)
    } else if elim_b {
        (Some(VoteValue::A), Some(Role::WriterA), votes_a * 2 > n)
    } else if votes_a * 2 > n {
        (Some(VoteValue::A), Some(Role::WriterA), true)
    } else if votes_b * 2 > n {
        (Some(VoteValue::B), Some(Role::WriterB), true)
    } else if count(VoteValue::Tie) * 2 > n {
        // An explicit TIE majority asks for a merge of both, with
        // writer A as the primary branch.
        (Some(VoteValue::Tie), Some(Role::WriterA), true)
    } else {
        match run_tie_breaks(&votes, tie_breaks) {
            Some(Role::WriterA) => (Some(VoteValue::A), Some(Role::WriterA), false),
            Some(Role::WriterB) => (Some(VoteValue::B), Some(Role::WriterB), false),
            _ => (Some(VoteValue::Tie), Some(Role::WriterA), false),
        }
    };

    let synthesis = winner.and(assess_compatibility(&votes));
    let next_action = if synthesis.is_some() {
        NextAction::Synthesize
    } else {
        NextAction::PickPrimary
    };

    Decision {
        task_id: task_id.clone(),
        kind: ReviewKind::Panel,
        votes,
        chosen,
        winner,
        consensus,
        approved: false,
        next_action,
        synthesis,
        created_at: Utc::now(),
    }
}

/// Score one tie-break criterion for both candidates; lower is better.
fn tie_break_scores(votes: &[JudgeVote], criterion: TieBreak) -> (u32, u32) {
    let score = |pick: fn(&Scores) -> &Option<CandidateScore>| {
        votes
            .iter()
            .filter_map(|j| j.scores.as_ref().and_then(|s| pick(s).as_ref()))
            .map(|c| match criterion {
                TieBreak::ArchitectureCompliance => u32::from(c.architecture_pass == Some(false)),
                TieBreak::Simplicity => u32::from(c.simplicity_pass == Some(false)),
                TieBreak::BlockerCount => c.blockers,
            })
            .sum()
    };
    (score(|s| &s.a), score(|s| &s.b))
}

fn run_tie_breaks(votes: &[JudgeVote], tie_breaks: &[TieBreak]) -> Option<Role> {
    for criterion in tie_breaks {
        let (a, b) = tie_break_scores(votes, *criterion);
        if a < b {
            return Some(Role::WriterA);
        }
        if b < a {
            return Some(Role::WriterB);
        }
    }
    None
}

/// Synthesis is offered only when every judge that assessed
/// compatibility affirmed both conditions, at least one did, and no
/// judge reported a candidate failing its own checks.
fn assess_compatibility(votes: &[JudgeVote]) -> Option<SynthesisPayload> {
    let assessments: Vec<&Compatibility> =
        votes.iter().filter_map(|j| j.compatibility.as_ref()).collect();
    if assessments.is_empty() {
        return None;
    }
    if !assessments
        .iter()
        .all(|c| c.same_interface && c.no_file_conflicts)
    {
        return None;
    }

    let checks_fail = |pick: fn(&Scores) -> &Option<CandidateScore>| {
        votes.iter().any(|j| {
            j.scores
                .as_ref()
                .and_then(|s| pick(s).as_ref())
                .and_then(|c| c.checks_pass)
                == Some(false)
        })
    };
    if checks_fail(|s| &s.a) || checks_fail(|s| &s.b) {
        return None;
    }

    let merge_instructions = votes
        .iter()
        .filter_map(|j| j.merge_instructions.as_deref())
        .collect::<Vec<_>>()
        .join("\n");
    let mut highlights = Highlights::default();
    for j in votes {
        if let Some(h) = &j.highlights {
            highlights.a.extend(h.a.iter().cloned());
            highlights.b.extend(h.b.iter().cloned());
        }
    }

    Some(SynthesisPayload {
        compatible: true,
        merge_instructions,
        highlights,
    })
}

/// Aggregate peer-review votes. Any REQUEST_CHANGES blocks approval;
/// COMMENT never blocks; approval requires at least one APPROVE.
pub fn aggregate_review(task_id: &TaskId, votes: Vec<JudgeVote>) -> Decision {
    let any_block = votes.iter().any(|j| j.vote == VoteValue::RequestChanges);
    let any_approve = votes.iter().any(|j| j.vote == VoteValue::Approve);
    let approved = any_approve && !any_block;
    let consensus = !votes.is_empty() && votes.iter().all(|j| j.vote == VoteValue::Approve);

    Decision {
        task_id: task_id.clone(),
        kind: ReviewKind::PeerReview,
        votes,
        chosen: None,
        winner: None,
        consensus,
        approved,
        next_action: if approved {
            NextAction::Approve
        } else {
            NextAction::Revise
        },
        synthesis: None,
        created_at: Utc::now(),
    }
}

/// Validate a raw artifact against (task, kind) and extract the vote.
/// Returns `None` for anything that should count as a missing vote.
pub fn validate_artifact(
    artifact: VoteArtifact,
    task_id: &TaskId,
    kind: ReviewKind,
) -> Option<JudgeVote> {
    if artifact.task_id != task_id.as_str() {
        qlog_warn!(
            "Vote from judge {} is for task {}, expected {}",
            artifact.judge,
            artifact.task_id,
            task_id
        );
        return None;
    }
    let vote = match VoteValue::parse(&artifact.decision) {
        Some(v) if v.valid_for(kind) => v,
        _ => {
            qlog_warn!(
                "Judge {} wrote unrecognized decision '{}'",
                artifact.judge,
                artifact.decision
            );
            return None;
        }
    };
    Some(JudgeVote::from_artifact(artifact, vote))
}

/// Drives judge agent runs and turns their artifacts into decisions.
pub struct PanelEngine<'a> {
    runner: &'a AgentRunner,
    sessions: &'a SessionRegistry,
    judge_timeout: Duration,
    tie_breaks: Vec<TieBreak>,
}

impl<'a> PanelEngine<'a> {
    pub fn new(
        runner: &'a AgentRunner,
        sessions: &'a SessionRegistry,
        judge_timeout: Duration,
        tie_breaks: Vec<TieBreak>,
    ) -> Self {
        Self {
            runner,
            sessions,
            judge_timeout,
            tie_breaks,
        }
    }

    fn vote_path(workspace: &Workspace) -> PathBuf {
        workspace.path.join(VOTE_FILE)
    }

    /// Run a full panel: each judge compares the two candidates and
    /// votes. Errors only when no judge produces a valid vote.
    pub async fn run_panel(
        &self,
        task_id: &TaskId,
        judges: &[Workspace],
        candidate_a: &Workspace,
        candidate_b: &Workspace,
        cancel: CancellationToken,
    ) -> Result<Decision> {
        let prompt = panel_prompt(task_id, candidate_a, candidate_b);
        let votes = self
            .collect_votes(task_id, judges, &prompt, ReviewKind::Panel, cancel)
            .await?;
        let decision = aggregate_panel(task_id, votes, &self.tie_breaks);
        qlog!(
            "Panel for {}: chosen={:?} winner={:?} consensus={} next={:?}",
            task_id,
            decision.chosen,
            decision.winner,
            decision.consensus,
            decision.next_action
        );
        Ok(decision)
    }

    /// Run a peer-review cycle over the synthesized result.
    pub async fn run_peer_review(
        &self,
        task_id: &TaskId,
        judges: &[Workspace],
        target: &Workspace,
        cancel: CancellationToken,
    ) -> Result<Decision> {
        let prompt = review_prompt(task_id, target);
        let votes = self
            .collect_votes(task_id, judges, &prompt, ReviewKind::PeerReview, cancel)
            .await?;
        let decision = aggregate_review(task_id, votes);
        qlog!(
            "Peer review for {}: approved={} consensus={} ({} votes)",
            task_id,
            decision.approved,
            decision.consensus,
            decision.votes.len()
        );
        Ok(decision)
    }

    async fn collect_votes(
        &self,
        task_id: &TaskId,
        judges: &[Workspace],
        prompt: &str,
        kind: ReviewKind,
        cancel: CancellationToken,
    ) -> Result<Vec<JudgeVote>> {
        // Stale artifacts from a previous cycle must not count.
        for judge in judges {
            let path = Self::vote_path(judge);
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
        }

        let opts = RunOptions {
            timeout: Some(self.judge_timeout),
            ..Default::default()
        };
        let runs = judges.iter().map(|judge| {
            let opts = opts.clone();
            let cancel = cancel.clone();
            async move {
                let outcome = self
                    .runner
                    .run(
                        task_id,
                        judge.role,
                        &judge.path,
                        prompt,
                        &opts,
                        self.sessions,
                        None,
                        cancel,
                    )
                    .await;
                (judge, outcome)
            }
        });

        let mut votes = Vec::new();
        for (judge, outcome) in futures::future::join_all(runs).await {
            match outcome {
                Ok(run) if run.ok => {}
                Ok(_) => {
                    qlog_warn!("Judge {} for {} exited unsuccessfully", judge.role, task_id);
                }
                Err(Error::Timeout(_)) => {
                    qlog_warn!("Judge {} for {} timed out", judge.role, task_id);
                    continue;
                }
                Err(e) => {
                    qlog_warn!("Judge {} for {} failed: {}", judge.role, task_id, e);
                    continue;
                }
            }
            match self.read_vote(judge) {
                Some(artifact) => {
                    if let Some(vote) = validate_artifact(artifact, task_id, kind) {
                        votes.push(vote);
                    }
                }
                None => {
                    qlog_warn!("Judge {} for {} produced no artifact", judge.role, task_id);
                }
            }
        }

        if votes.is_empty() {
            return Err(Error::NoQuorum(task_id.to_string()));
        }
        votes.sort_by_key(|v| v.judge);
        Ok(votes)
    }

    fn read_vote(&self, judge: &Workspace) -> Option<VoteArtifact> {
        let path = Self::vote_path(judge);
        let contents = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&contents) {
            Ok(artifact) => Some(artifact),
            Err(e) => {
                qlog_warn!("Invalid vote artifact at {}: {}", path.display(), e);
                None
            }
        }
    }
}

fn panel_prompt(task_id: &TaskId, a: &Workspace, b: &Workspace) -> String {
    format!(
        "You are a review judge for task {task}. Two candidate implementations exist:\n\
         - Candidate A: branch {ba} at {pa}\n\
         - Candidate B: branch {bb} at {pb}\n\
         Review both candidates. Then write your vote as JSON to {vote} in your \
         working directory, with top-level fields: judge (your index), \
         task_id (\"{task}\"), decision (\"A\", \"B\" or \"TIE\"), rationale, and \
         optionally scores, compatibility, merge_instructions, highlights and \
         blocker_issues.",
        task = task_id,
        ba = a.branch,
        pa = a.path.display(),
        bb = b.branch,
        pb = b.path.display(),
        vote = VOTE_FILE,
    )
}

fn review_prompt(task_id: &TaskId, target: &Workspace) -> String {
    format!(
        "You are a peer reviewer for task {task}. Review the synthesized result \
         on branch {branch} at {path}. Then write your verdict as JSON to {vote} \
         in your working directory, with top-level fields: judge (your index), \
         task_id (\"{task}\"), decision (\"APPROVE\", \"REQUEST_CHANGES\" or \
         \"COMMENT\"), rationale, and optionally remaining_issues.",
        task = task_id,
        branch = target.branch,
        path = target.path.display(),
        vote = VOTE_FILE,
    )
}

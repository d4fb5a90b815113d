//! Synthesis/review loop controller.
//!
//! Tracks the bounded retry loop in which the winning writer applies
//! panel feedback and resubmits to peer review. The controller is a
//! plain state machine; the orchestrator drives it with panel outcomes
//! and performs the actual agent runs. Exceeding either the retry cap
//! or the wall-clock budget forces `Escalated`, which is terminal for
//! this loop instance; continuing afterwards is an explicit external
//! decision that builds a fresh loop with a fresh cap and budget.

use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::qlog_warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    AwaitingPanel,
    AwaitingSynthesis,
    AwaitingPeerReview,
    Approved,
    Escalated,
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoopState::AwaitingPanel => write!(f, "awaiting_panel"),
            LoopState::AwaitingSynthesis => write!(f, "awaiting_synthesis"),
            LoopState::AwaitingPeerReview => write!(f, "awaiting_peer_review"),
            LoopState::Approved => write!(f, "approved"),
            LoopState::Escalated => write!(f, "escalated"),
        }
    }
}

/// What the orchestrator should do after a processed review.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    /// Peer review passed; the task can complete.
    Approved,
    /// Rejected within budget; run another synthesis cycle.
    Continue,
    /// Cap or budget exceeded; automation stops here.
    Escalated,
}

/// Bounded synthesis/peer-review retry loop for one task.
pub struct ReviewLoop {
    state: LoopState,
    cycles: u32,
    retry_cap: u32,
    deadline: Instant,
    budget: Duration,
}

impl ReviewLoop {
    pub fn new(retry_cap: u32, time_budget: Duration) -> Self {
        Self {
            state: LoopState::AwaitingPanel,
            cycles: 0,
            retry_cap,
            deadline: Instant::now() + time_budget,
            budget: time_budget,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Completed rejection cycles so far.
    pub fn cycles(&self) -> u32 {
        self.cycles
    }

    fn invalid(&self, expected: LoopState) -> Error {
        Error::InvalidPhaseTransition {
            from: self.state.to_string(),
            to: expected.to_string(),
        }
    }

    /// The panel named a winner; synthesis can start.
    pub fn on_winner_decided(&mut self) -> Result<()> {
        if self.state != LoopState::AwaitingPanel {
            return Err(self.invalid(LoopState::AwaitingSynthesis));
        }
        self.state = LoopState::AwaitingSynthesis;
        Ok(())
    }

    /// The synthesis run finished and its workspace was finalized.
    pub fn on_synthesis_finalized(&mut self) -> Result<()> {
        if self.state != LoopState::AwaitingSynthesis {
            return Err(self.invalid(LoopState::AwaitingPeerReview));
        }
        self.state = LoopState::AwaitingPeerReview;
        Ok(())
    }

    /// Process one peer-review verdict.
    ///
    /// Each rejection counts one cycle. Escalation happens exactly when
    /// the cap is exceeded: with a cap of N, rejection N+1 escalates,
    /// so the loop never runs an (N+1)-th synthesis cycle.
    pub fn on_review(&mut self, approved: bool) -> Result<LoopOutcome> {
        if self.state != LoopState::AwaitingPeerReview {
            return Err(self.invalid(LoopState::AwaitingPeerReview));
        }

        if approved {
            self.state = LoopState::Approved;
            return Ok(LoopOutcome::Approved);
        }

        self.cycles += 1;
        if self.cycles > self.retry_cap {
            qlog_warn!(
                "Review loop escalating: {} rejection cycles exceed cap {}",
                self.cycles,
                self.retry_cap
            );
            self.state = LoopState::Escalated;
            return Ok(LoopOutcome::Escalated);
        }
        if Instant::now() >= self.deadline {
            qlog_warn!(
                "Review loop escalating: time budget of {:?} exhausted",
                self.budget
            );
            self.state = LoopState::Escalated;
            return Ok(LoopOutcome::Escalated);
        }

        self.state = LoopState::AwaitingSynthesis;
        Ok(LoopOutcome::Continue)
    }
}

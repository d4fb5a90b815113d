//! Agent process runner.
//!
//! Spawns one coding agent per (task, role) in its workspace with
//! stream-json output and drives an explicit line pipeline: every
//! stdout line is appended verbatim to a raw log, normalized into an
//! [`Event`](crate::event::Event), and forwarded to an optional
//! subscriber channel. Session ids are captured from the init frame
//! and persisted immediately, so a crash mid-run still leaves a
//! resumable handle behind.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::event::{normalize, Event, EventKind};
use crate::role::{Role, TaskId};
use crate::session::{SessionHandle, SessionRegistry};
use crate::{qlog, qlog_debug, qlog_trace, qlog_warn};

/// Options for a single agent run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Resume the agent's previous session instead of starting fresh.
    /// Fails before spawning if no session handle is stored.
    pub resume: bool,
    /// Model override passed through to the agent.
    pub model: Option<String>,
    /// Overall wall-clock bound for the run.
    pub timeout: Option<Duration>,
}

/// What a finished (or interrupted) agent run produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub role: Role,
    /// True when the agent emitted a successful result frame and exited 0.
    pub ok: bool,
    pub exit_code: Option<i32>,
    pub session: Option<SessionHandle>,
    /// Duration the agent itself reported, when present.
    pub duration_ms: Option<u64>,
    /// Final result text from the agent, when present.
    pub result_text: Option<String>,
    /// Path to the verbatim stream-json log for this run.
    pub raw_log: PathBuf,
    /// True when the run was stopped by cancellation rather than exit.
    pub cancelled: bool,
}

/// Spawns and supervises agent processes.
///
/// The configured command may carry fixed leading arguments
/// (e.g. `claude --dangerously-skip-permissions`); the first token is
/// the program, the rest are prepended to every invocation.
#[derive(Debug)]
pub struct AgentRunner {
    program: String,
    fixed_args: Vec<String>,
    logs_dir: PathBuf,
}

impl AgentRunner {
    /// Create a runner, verifying the agent program resolves on PATH.
    pub fn new(command: &str, logs_dir: &Path) -> Result<Self> {
        let runner = Self::with_command_unchecked(command, logs_dir);
        which::which(&runner.program)
            .map_err(|_| Error::AgentNotAvailable(runner.program.clone()))?;
        Ok(runner)
    }

    /// Construct without probing PATH. For tests with absolute paths.
    pub fn with_command_unchecked(command: &str, logs_dir: &Path) -> Self {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next().unwrap_or_default();
        Self {
            program,
            fixed_args: parts.collect(),
            logs_dir: logs_dir.to_path_buf(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Run one agent to completion inside `workspace`.
    ///
    /// Every stdout line lands in the raw log before normalization, so
    /// the log is a faithful record even when frames are malformed.
    /// Events are delivered to `events` in stdout order; a lagging or
    /// dropped subscriber never stalls the pipeline.
    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &self,
        task_id: &TaskId,
        role: Role,
        workspace: &Path,
        prompt: &str,
        opts: &RunOptions,
        sessions: &SessionRegistry,
        events: Option<mpsc::Sender<Event>>,
        cancel: CancellationToken,
    ) -> Result<RunOutcome> {
        let resume_session = if opts.resume {
            match sessions.get(role, task_id)? {
                Some(handle) => Some(handle),
                None => {
                    return Err(Error::NoSessionToResume {
                        role: role.to_string(),
                        task: task_id.to_string(),
                    })
                }
            }
        } else {
            None
        };

        tokio::fs::create_dir_all(&self.logs_dir).await?;
        // Millisecond start time keeps back-to-back runs of the same
        // role from sharing a log file.
        let started_unix = Utc::now().timestamp_millis();
        let raw_log = self
            .logs_dir
            .join(format!("{}_{}_{}.jsonl", task_id, role, started_unix));
        let mut log_file = tokio::fs::File::create(&raw_log).await?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.fixed_args)
            .arg("-p")
            .arg(prompt)
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .current_dir(workspace)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if let Some(handle) = &resume_session {
            cmd.arg("--resume").arg(handle.as_str());
        }
        if let Some(model) = &opts.model {
            cmd.arg("--model").arg(model);
        }

        qlog!(
            "Spawning agent {} for task {} (resume={})",
            role,
            task_id,
            resume_session.is_some()
        );
        let mut child = cmd.spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Validation("Agent stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Validation("Agent stderr not captured".to_string()))?;

        // Stderr is drained concurrently so a chatty agent cannot block
        // on a full pipe. Only a tail is kept for diagnostics.
        let stderr_role = role;
        let stderr_task = tokio::spawn(async move {
            let mut tail: Vec<String> = Vec::new();
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                qlog_debug!("[{} stderr] {}", stderr_role, line);
                if tail.len() >= 20 {
                    tail.remove(0);
                }
                tail.push(line);
            }
            tail
        });

        let deadline = opts.timeout.map(|t| tokio::time::Instant::now() + t);
        let mut lines = BufReader::new(stdout).lines();

        let mut session: Option<SessionHandle> = resume_session;
        let mut result_ok = false;
        let mut result_seen = false;
        let mut duration_ms = None;
        let mut result_text = None;
        let mut cancelled = false;

        loop {
            let next = async { lines.next_line().await };
            let line = tokio::select! {
                line = next => line?,
                _ = cancel.cancelled() => {
                    qlog_warn!("Run of {} for {} cancelled", role, task_id);
                    cancelled = true;
                    break;
                }
                _ = sleep_until_opt(deadline) => {
                    log_file.flush().await?;
                    child.start_kill()?;
                    let _ = child.wait().await;
                    stderr_task.abort();
                    return Err(Error::Timeout(opts.timeout.unwrap_or_default()));
                }
            };
            let Some(line) = line else { break };

            log_file.write_all(line.as_bytes()).await?;
            log_file.write_all(b"\n").await?;
            qlog_trace!("[{} stdout] {}", role, line);

            let Some(kind) = normalize(&line) else {
                continue;
            };

            match &kind {
                EventKind::Init { session_id } => {
                    let handle = SessionHandle::new(session_id);
                    sessions.put(role, task_id, &handle)?;
                    session = Some(handle);
                }
                EventKind::Result {
                    ok,
                    duration_ms: d,
                    text,
                } => {
                    result_seen = true;
                    result_ok = *ok;
                    duration_ms = *d;
                    result_text = Some(text.clone());
                }
                _ => {}
            }

            if let Some(tx) = &events {
                // A closed subscriber is not an error for the run.
                let _ = tx.send(Event::new(role, kind)).await;
            }
        }

        log_file.flush().await?;

        if cancelled {
            child.start_kill()?;
        }
        let status = child.wait().await?;
        let stderr_tail = stderr_task.await.unwrap_or_default();

        let exit_code = status.code();
        let ok = !cancelled && status.success() && (result_ok || !result_seen);

        if !ok && !cancelled {
            qlog_warn!(
                "Agent {} for {} failed (exit={:?}): {}",
                role,
                task_id,
                exit_code,
                stderr_tail.join(" | ")
            );
        } else {
            qlog!(
                "Agent {} for {} finished (exit={:?}, result_ok={})",
                role,
                task_id,
                exit_code,
                result_ok
            );
        }

        Ok(RunOutcome {
            role,
            ok,
            exit_code,
            session,
            duration_ms,
            result_text,
            raw_log,
            cancelled,
        })
    }
}

async fn sleep_until_opt(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

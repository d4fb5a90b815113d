use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use quorum::config::Config;
use quorum::event::{Event, EventKind};
use quorum::orchestrator::{Orchestrator, Paths};
use quorum::{qlog, qlog_error, Result, Role, TaskId};

/// Quorum - competing-writer agent orchestrator with judge panels
#[derive(Parser, Debug)]
#[command(name = "quorum")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    QUORUM_DEBUG=1     Enable debug logging (alternative to --debug)\n    QUORUM_LOG=LEVEL   Set the log level (error, warn, info, debug, trace)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.quorum/quorum.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Repository to orchestrate (defaults to the current directory)
    #[arg(long)]
    pub repo: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Start a new task: two writers, a judge panel, then the
    /// synthesis/peer-review loop until approval or escalation
    Start {
        /// Task identifier (letters, digits, '-' and '_')
        task_id: String,

        /// File containing the task prompt
        prompt_file: PathBuf,
    },

    /// Re-enter a blocked or escalated task from its persisted phase,
    /// with fresh retry and time budgets
    Continue {
        /// Task identifier
        task_id: String,

        /// Feedback to seed the next synthesis run with
        feedback: String,
    },

    /// Resume a single role's agent session with new feedback
    Resume {
        /// Role to resume (writer-a, writer-b, judge-N)
        role: String,

        /// Task identifier
        task_id: String,

        /// Feedback to feed into the resumed session
        feedback: String,
    },

    /// Show status for one task (or all tasks)
    Status {
        /// Task identifier; omit to list all tasks
        task_id: Option<String>,
    },

    /// Cancel in-flight runs and remove a task's worktrees, branches,
    /// sessions and state (raw logs are kept)
    Cleanup {
        /// Task identifier
        task_id: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    quorum::log::init_with_debug(cli.debug);

    if let Err(e) = run(cli).await {
        qlog_error!("{}", e);
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    config.ensure_dirs()?;
    let paths = Paths::from_config(&config)?;
    let repo = cli.repo.unwrap_or_else(|| PathBuf::from("."));
    let orchestrator = Orchestrator::new(config, &repo, paths)?;

    match cli.command {
        Command::Start {
            task_id,
            prompt_file,
        } => {
            let task_id = TaskId::new(&task_id)?;
            let prompt = read_prompt(&prompt_file)?;
            let (tx, rx) = mpsc::channel(256);
            let printer = tokio::spawn(print_events(rx));

            qlog!("Starting task {}", task_id);
            let state = orchestrator.start(&task_id, &prompt, Some(tx)).await?;
            let _ = printer.await;
            println!(
                "Task {} complete: winner {}",
                task_id,
                state
                    .winner
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "-".to_string())
            );
        }
        Command::Continue { task_id, feedback } => {
            let task_id = TaskId::new(&task_id)?;
            let (tx, rx) = mpsc::channel(256);
            let printer = tokio::spawn(print_events(rx));

            qlog!("Continuing task {}", task_id);
            let state = orchestrator
                .continue_task(&task_id, &feedback, Some(tx))
                .await?;
            let _ = printer.await;
            println!(
                "Task {} complete: winner {}",
                task_id,
                state
                    .winner
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "-".to_string())
            );
        }
        Command::Resume {
            role,
            task_id,
            feedback,
        } => {
            let role: Role = role.parse()?;
            let task_id = TaskId::new(&task_id)?;
            let (tx, rx) = mpsc::channel(256);
            let printer = tokio::spawn(print_events(rx));

            let outcome = orchestrator
                .resume(&task_id, role, &feedback, Some(tx))
                .await?;
            let _ = printer.await;
            println!(
                "{} for {}: {}",
                role,
                task_id,
                if outcome.ok { "ok" } else { "failed" }
            );
        }
        Command::Status { task_id } => match task_id {
            Some(id) => {
                let report = orchestrator.status(&TaskId::new(&id)?)?;
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            None => {
                for id in orchestrator.list_tasks()? {
                    let report = orchestrator.status(&id)?;
                    println!(
                        "{}  phase={} path={} status={}",
                        id, report.phase, report.path, report.status
                    );
                }
            }
        },
        Command::Cleanup { task_id } => {
            let task_id = TaskId::new(&task_id)?;
            orchestrator.cleanup(&task_id)?;
            println!("Cleaned up task {}", task_id);
        }
    }

    Ok(())
}

fn read_prompt(path: &Path) -> Result<String> {
    let prompt = std::fs::read_to_string(path)?;
    if prompt.trim().is_empty() {
        return Err(quorum::Error::Validation(format!(
            "Prompt file {} is empty",
            path.display()
        )));
    }
    Ok(prompt)
}

/// Print the live event stream in a compact one-line-per-event form.
async fn print_events(mut rx: mpsc::Receiver<Event>) {
    while let Some(event) = rx.recv().await {
        match &event.kind {
            EventKind::Init { session_id } => {
                println!("[{}] session {}", event.role, session_id);
            }
            EventKind::Thinking { text } => {
                println!("[{}] {}", event.role, text);
            }
            EventKind::ToolCallStarted { kind, label } => {
                println!("[{}] {:?}: {}", event.role, kind, label);
            }
            EventKind::ToolCallCompleted { ok, summary } => {
                if !ok {
                    println!("[{}] tool failed: {}", event.role, summary);
                }
            }
            EventKind::Result {
                ok, duration_ms, ..
            } => {
                println!(
                    "[{}] finished ({}) in {}ms",
                    event.role,
                    if *ok { "ok" } else { "error" },
                    duration_ms.unwrap_or(0)
                );
            }
            EventKind::Malformed { .. } => {}
        }
    }
}

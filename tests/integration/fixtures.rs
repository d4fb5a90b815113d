//! Test fixtures for integration tests.
//!
//! Provides temporary git repositories, scripted stand-in agents that
//! speak the stream-json protocol, and a harness that wires a full
//! orchestrator onto isolated directories.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;

use quorum::config::Config;
use quorum::orchestrator::{Orchestrator, Paths};

/// A test repository with a temporary directory and initialized git.
pub struct TestRepo {
    pub temp_dir: TempDir,
    pub path: PathBuf,
}

impl TestRepo {
    /// Create a new test repository with an initial commit.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("repo");
        fs::create_dir_all(&path).expect("Failed to create repo dir");

        let git = |args: &[&str]| {
            let out = Command::new("git")
                .args(args)
                .current_dir(&path)
                .output()
                .expect("Failed to run git");
            assert!(out.status.success(), "git {:?} failed", args);
        };
        git(&["init", "-b", "main"]);
        git(&["config", "user.email", "test@test.com"]);
        git(&["config", "user.name", "Test User"]);
        fs::write(path.join("README.md"), "# test repo\n").unwrap();
        git(&["add", "."]);
        git(&["commit", "-m", "Initial commit"]);

        Self { temp_dir, path }
    }
}

/// Full orchestrator wired onto temporary directories and a scripted
/// agent. Keeps the temp dirs alive for the test's duration.
pub struct Harness {
    pub repo: TestRepo,
    pub orchestrator: Orchestrator,
    root: TempDir,
}

impl Harness {
    pub fn new(agent_script: &Path, retry_cap: u32) -> Self {
        let repo = TestRepo::new();
        let root = TempDir::new().unwrap();
        let config = Config {
            command: Some(agent_script.to_str().unwrap().to_string()),
            retry_cap,
            push_attempts: 1,
            ..Default::default()
        };
        let paths = Paths {
            tasks: root.path().join("tasks"),
            sessions: root.path().join("sessions"),
            logs: root.path().join("logs"),
            workspaces: root.path().join("workspaces"),
        };
        let orchestrator =
            Orchestrator::new(config, &repo.path, paths).expect("Failed to build orchestrator");
        Self {
            repo,
            orchestrator,
            root,
        }
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.path().join("logs")
    }

    pub fn workspaces_dir(&self) -> PathBuf {
        self.root.path().join("workspaces")
    }
}

/// Write an executable shell script and return its path.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }
    path
}

/// Build a scripted agent covering a whole workflow for `task_id`.
///
/// Writers create a file and succeed. Judges count their own
/// invocations: the first one is the panel (votes from `panel_votes`
/// by judge index), later ones are peer review (votes from
/// `review_votes`). `fail_role` (if set) exits 2 before emitting a
/// result frame.
pub fn workflow_agent(
    dir: &Path,
    task_id: &str,
    panel_votes: &[&str],
    review_votes: &[&str],
    fail_role: Option<&str>,
) -> PathBuf {
    let mut panel_cases = String::new();
    for (i, vote) in panel_votes.iter().enumerate() {
        let judge = i + 1;
        panel_cases.push_str(&format!(
            "    judge-{j}) printf '{{\"judge\":{j},\"task_id\":\"{t}\",\"decision\":\"{v}\",\"rationale\":\"panel vote\"}}' > .quorum/vote.json ;;\n",
            j = judge,
            t = task_id,
            v = vote
        ));
    }
    let mut review_cases = String::new();
    for (i, vote) in review_votes.iter().enumerate() {
        let judge = i + 1;
        review_cases.push_str(&format!(
            "    judge-{j}) printf '{{\"judge\":{j},\"task_id\":\"{t}\",\"decision\":\"{v}\",\"rationale\":\"review vote\"}}' > .quorum/vote.json ;;\n",
            j = judge,
            t = task_id,
            v = vote
        ));
    }
    let fail_case = match fail_role {
        Some(role) => format!(
            "if [ \"$base\" = \"{}\" ]; then\n  echo '{{\"type\":\"system\",\"subtype\":\"init\",\"session_id\":\"sess-'$base'\"}}'\n  echo 'writer crashed' >&2\n  exit 2\nfi\n",
            role
        ),
        None => String::new(),
    };

    let body = format!(
        r#"base=$(basename "$PWD")
{fail_case}
echo '{{"type":"system","subtype":"init","session_id":"sess-'$base'"}}'
case "$base" in
  writer-*)
    echo "work by $base" > impl.txt
    ;;
  judge-*)
    mkdir -p .quorum
    n=0
    [ -f .cycle ] && n=$(cat .cycle)
    n=$((n+1))
    echo $n > .cycle
    if [ "$n" -eq 1 ]; then
      case "$base" in
{panel_cases}      esac
    else
      case "$base" in
{review_cases}      esac
    fi
    ;;
esac
echo '{{"type":"result","subtype":"success","duration_ms":5}}'"#,
        fail_case = fail_case,
        panel_cases = panel_cases,
        review_cases = review_cases,
    );
    write_script(dir, "agent.sh", &body)
}

//! Workspace manager: one isolated git worktree per (task, role).
//!
//! Each agent gets its own worktree on its own branch, so parallel
//! writers and judges never touch each other's files. Acquisition is
//! idempotent; re-acquiring an existing workspace reuses it so a task
//! can be resumed after a crash without losing work.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::git::GitOps;
use crate::role::{branch_name, Role, TaskId};
use crate::{qlog, qlog_warn};

/// Base delay between push retries; attempt N waits N-1 times this.
const PUSH_BACKOFF_MS: u64 = 250;

/// A lease on an isolated working directory for one agent.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub task_id: TaskId,
    pub role: Role,
    pub path: PathBuf,
    pub branch: String,
}

/// Outcome of finalizing a workspace.
#[derive(Debug, Clone)]
pub struct FinalizeOutcome {
    /// Commit the branch head points at after finalization.
    pub commit: String,
    /// Whether that commit is known to be on the remote.
    pub pushed: bool,
}

/// Report from a task-wide cleanup pass. Failures are collected, not
/// short-circuited, so one stuck worktree never blocks the rest.
#[derive(Debug, Default)]
pub struct CleanupReport {
    pub removed: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
    pub branches_deleted: Vec<String>,
}

/// Creates, reuses, finalizes and removes per-agent worktrees.
pub struct WorkspaceManager {
    git: GitOps,
    workspaces_dir: PathBuf,
    remote: String,
    push_attempts: u32,
}

impl WorkspaceManager {
    pub fn new(git: GitOps, workspaces_dir: &Path, remote: &str, push_attempts: u32) -> Self {
        Self {
            git,
            workspaces_dir: workspaces_dir.to_path_buf(),
            remote: remote.to_string(),
            push_attempts: push_attempts.max(1),
        }
    }

    pub fn git(&self) -> &GitOps {
        &self.git
    }

    fn workspace_path(&self, task_id: &TaskId, role: Role, model: Option<&str>) -> PathBuf {
        let mut leaf = role.to_string();
        if let Some(m) = model {
            leaf.push('-');
            leaf.push_str(m);
        }
        self.workspaces_dir.join(task_id.as_str()).join(leaf)
    }

    /// Acquire a workspace for an agent. Idempotent:
    ///
    /// - worktree and branch both exist: reuse them as-is (resume);
    /// - branch exists but the worktree is gone: re-check it out;
    /// - neither exists: create a fresh branch off HEAD.
    pub fn acquire(&self, task_id: &TaskId, role: Role, model: Option<&str>) -> Result<Workspace> {
        let path = self.workspace_path(task_id, role, model);
        let branch = branch_name(role, task_id, model);

        let dir_exists = path.join(".git").exists();
        let branch_exists = self.git.branch_exists(&branch)?;

        match (dir_exists, branch_exists) {
            (true, true) => {
                qlog!("Reusing workspace for {} at {}", role, path.display());
            }
            (true, false) => {
                // A directory without its branch is a leftover from an
                // interrupted cleanup. Replace it rather than guess.
                qlog_warn!(
                    "Workspace dir {} exists without branch {}; recreating",
                    path.display(),
                    branch
                );
                self.git.remove_worktree(&path)?;
                self.create(&path, &branch, false)?;
            }
            (false, true) => {
                qlog!("Re-checking out branch {} at {}", branch, path.display());
                self.create(&path, &branch, true)?;
            }
            (false, false) => {
                qlog!("Creating workspace for {} on {}", role, branch);
                self.create(&path, &branch, false)?;
            }
        }

        Ok(Workspace {
            task_id: task_id.clone(),
            role,
            path,
            branch,
        })
    }

    fn create(&self, path: &Path, branch: &str, from_existing: bool) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        if from_existing {
            self.git.create_worktree_from_branch(branch, path)
        } else {
            self.git.create_worktree(branch, path)
        }
    }

    /// Commit anything left in the worktree and push the branch.
    ///
    /// A clean tree is not an error: the branch head is finalized as-is.
    /// Pushes are retried up to the configured attempt count with a
    /// bounded backoff between attempts. A missing remote or exhausted
    /// retries both yield a local-only result with `pushed: false`;
    /// only commit failures error.
    pub fn finalize(&self, workspace: &Workspace, message: &str) -> Result<FinalizeOutcome> {
        let commit = if self.git.is_dirty(&workspace.path)? {
            self.git.commit_all(&workspace.path, message)?
        } else {
            self.git.head_commit_of(&workspace.path)?
        };

        if !self.git.has_remote(&self.remote) {
            qlog_warn!(
                "No remote '{}'; branch {} finalized locally at {}",
                self.remote,
                workspace.branch,
                commit
            );
            return Ok(FinalizeOutcome {
                commit,
                pushed: false,
            });
        }

        let mut last_err: Option<Error> = None;
        for attempt in 1..=self.push_attempts {
            if attempt > 1 {
                // Bounded linear backoff between attempts.
                std::thread::sleep(Duration::from_millis(
                    PUSH_BACKOFF_MS * u64::from(attempt - 1),
                ));
            }
            match self.git.push_branch(&workspace.path, &self.remote, &workspace.branch) {
                Ok(()) => {
                    if self
                        .git
                        .remote_has_head(&workspace.path, &self.remote, &workspace.branch)
                    {
                        qlog!("Pushed {} at {} (attempt {})", workspace.branch, commit, attempt);
                        return Ok(FinalizeOutcome {
                            commit,
                            pushed: true,
                        });
                    }
                    last_err = Some(Error::Validation(format!(
                        "Remote head of {} does not match {}",
                        workspace.branch, commit
                    )));
                }
                Err(e) => {
                    qlog_warn!(
                        "Push attempt {}/{} for {} failed: {}",
                        attempt,
                        self.push_attempts,
                        workspace.branch,
                        e
                    );
                    last_err = Some(e);
                }
            }
        }

        // Push failure is transient infrastructure trouble: the commit
        // exists locally and the workflow carries on without it.
        qlog_warn!(
            "Push of {} gave up after {} attempts ({}); branch kept local at {}",
            workspace.branch,
            self.push_attempts,
            last_err.map(|e| e.to_string()).unwrap_or_default(),
            commit
        );
        Ok(FinalizeOutcome {
            commit,
            pushed: false,
        })
    }

    /// Remove one workspace's worktree. The branch is kept for reference.
    pub fn release(&self, workspace: &Workspace) -> Result<()> {
        self.git.remove_worktree(&workspace.path)
    }

    /// Remove every worktree and branch belonging to a task.
    pub fn cleanup_task(&self, task_id: &TaskId) -> CleanupReport {
        let mut report = CleanupReport::default();
        let task_dir = self.workspaces_dir.join(task_id.as_str());

        if task_dir.exists() {
            if let Ok(entries) = fs::read_dir(&task_dir) {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if !path.is_dir() {
                        continue;
                    }
                    match self.git.remove_worktree(&path) {
                        Ok(()) => report.removed.push(path),
                        Err(e) => report.failed.push((path, e.to_string())),
                    }
                }
            }
            if let Err(e) = fs::remove_dir_all(&task_dir) {
                qlog_warn!("Could not remove {}: {}", task_dir.display(), e);
            }
        }

        let prefix = format!("quorum/{}/", task_id);
        if let Ok(branches) = self.git.branches_with_prefix(&prefix) {
            for branch in branches {
                match self.git.delete_branch(&branch) {
                    Ok(()) => report.branches_deleted.push(branch),
                    Err(e) => qlog_warn!("Could not delete branch {}: {}", branch, e),
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::TempDir;

    fn setup_repo() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let repo_path = dir.path().join("repo");
        fs::create_dir_all(&repo_path).unwrap();

        let run = |args: &[&str]| {
            Command::new("git")
                .args(args)
                .current_dir(&repo_path)
                .output()
                .unwrap()
        };
        run(&["init", "-b", "main"]);
        run(&["config", "user.name", "Test"]);
        run(&["config", "user.email", "test@test.com"]);
        fs::write(repo_path.join("README.md"), "# test\n").unwrap();
        run(&["add", "."]);
        run(&["commit", "-m", "init"]);

        (dir, repo_path)
    }

    fn manager(dir: &TempDir, repo: &Path) -> WorkspaceManager {
        let git = GitOps::new(repo).unwrap();
        WorkspaceManager::new(git, &dir.path().join("workspaces"), "origin", 3)
    }

    fn task(id: &str) -> TaskId {
        TaskId::new(id).unwrap()
    }

    #[test]
    fn test_acquire_creates_worktree_and_branch() {
        let (dir, repo) = setup_repo();
        let mgr = manager(&dir, &repo);

        let ws = mgr.acquire(&task("t1"), Role::WriterA, None).unwrap();
        assert!(ws.path.exists());
        assert_eq!(ws.branch, "quorum/t1/writer-a");

        let git = GitOps::new(&repo).unwrap();
        assert!(git.branch_exists("quorum/t1/writer-a").unwrap());
    }

    #[test]
    fn test_acquire_is_idempotent() {
        let (dir, repo) = setup_repo();
        let mgr = manager(&dir, &repo);

        let first = mgr.acquire(&task("t1"), Role::WriterB, None).unwrap();
        fs::write(first.path.join("in-progress.txt"), "keep me").unwrap();

        let second = mgr.acquire(&task("t1"), Role::WriterB, None).unwrap();
        assert_eq!(first.path, second.path);
        assert_eq!(first.branch, second.branch);
        assert!(second.path.join("in-progress.txt").exists());
    }

    #[test]
    fn test_acquire_recreates_worktree_from_surviving_branch() {
        let (dir, repo) = setup_repo();
        let mgr = manager(&dir, &repo);

        let ws = mgr.acquire(&task("t1"), Role::WriterA, None).unwrap();
        fs::write(ws.path.join("work.txt"), "committed work").unwrap();
        let git = GitOps::new(&repo).unwrap();
        git.commit_all(&ws.path, "wip").unwrap();
        mgr.release(&ws).unwrap();
        assert!(!ws.path.exists());

        let again = mgr.acquire(&task("t1"), Role::WriterA, None).unwrap();
        assert!(again.path.join("work.txt").exists());
    }

    #[test]
    fn test_roles_get_disjoint_paths_and_branches() {
        let (dir, repo) = setup_repo();
        let mgr = manager(&dir, &repo);

        let a = mgr.acquire(&task("t1"), Role::WriterA, None).unwrap();
        let b = mgr.acquire(&task("t1"), Role::WriterB, None).unwrap();
        let j = mgr.acquire(&task("t1"), Role::Judge(1), None).unwrap();

        assert_ne!(a.path, b.path);
        assert_ne!(a.branch, b.branch);
        assert_ne!(j.path, a.path);

        // Writes in one workspace are invisible to the others.
        fs::write(a.path.join("only-a.txt"), "a").unwrap();
        assert!(!b.path.join("only-a.txt").exists());
    }

    #[test]
    fn test_model_suffix_in_path_and_branch() {
        let (dir, repo) = setup_repo();
        let mgr = manager(&dir, &repo);

        let ws = mgr.acquire(&task("t1"), Role::WriterA, Some("opus")).unwrap();
        assert_eq!(ws.branch, "quorum/t1/writer-a-opus");
        assert!(ws.path.ends_with("t1/writer-a-opus"));
    }

    #[test]
    fn test_finalize_commits_dirty_tree() {
        let (dir, repo) = setup_repo();
        let mgr = manager(&dir, &repo);

        let ws = mgr.acquire(&task("t1"), Role::WriterA, None).unwrap();
        fs::write(ws.path.join("impl.rs"), "fn main() {}\n").unwrap();

        let outcome = mgr.finalize(&ws, "writer-a result").unwrap();
        assert!(!outcome.pushed); // no remote configured
        assert!(!outcome.commit.is_empty());

        let git = GitOps::new(&repo).unwrap();
        assert!(!git.is_dirty(&ws.path).unwrap());
        assert_eq!(git.head_commit_of(&ws.path).unwrap(), outcome.commit);
    }

    #[test]
    fn test_finalize_clean_tree_uses_existing_head() {
        let (dir, repo) = setup_repo();
        let mgr = manager(&dir, &repo);

        let ws = mgr.acquire(&task("t1"), Role::WriterA, None).unwrap();
        let git = GitOps::new(&repo).unwrap();
        let head = git.head_commit_of(&ws.path).unwrap();

        let outcome = mgr.finalize(&ws, "noop").unwrap();
        assert_eq!(outcome.commit, head);
    }

    #[test]
    fn test_unreachable_remote_exhausts_retries_and_stays_local() {
        let (dir, repo) = setup_repo();
        Command::new("git")
            .args(["remote", "add", "origin", "/nonexistent/remote/path"])
            .current_dir(&repo)
            .output()
            .unwrap();
        let git = GitOps::new(&repo).unwrap();
        let mgr = WorkspaceManager::new(git, &dir.path().join("workspaces"), "origin", 2);

        let ws = mgr.acquire(&task("t1"), Role::WriterA, None).unwrap();
        fs::write(ws.path.join("impl.rs"), "fn main() {}\n").unwrap();

        let started = std::time::Instant::now();
        let outcome = mgr.finalize(&ws, "writer-a result").unwrap();
        // Commit succeeded, push gave up after its attempts.
        assert!(!outcome.pushed);
        assert!(!outcome.commit.is_empty());
        // The second attempt waited before retrying.
        assert!(started.elapsed() >= Duration::from_millis(PUSH_BACKOFF_MS));

        let git = GitOps::new(&repo).unwrap();
        assert!(!git.is_dirty(&ws.path).unwrap());
    }

    #[test]
    fn test_cleanup_task_removes_worktrees_and_branches() {
        let (dir, repo) = setup_repo();
        let mgr = manager(&dir, &repo);

        let a = mgr.acquire(&task("t1"), Role::WriterA, None).unwrap();
        let b = mgr.acquire(&task("t1"), Role::WriterB, None).unwrap();
        let other = mgr.acquire(&task("t2"), Role::WriterA, None).unwrap();

        let report = mgr.cleanup_task(&task("t1"));
        assert_eq!(report.removed.len(), 2);
        assert!(report.failed.is_empty());
        assert!(!a.path.exists());
        assert!(!b.path.exists());

        let git = GitOps::new(&repo).unwrap();
        assert!(!git.branch_exists("quorum/t1/writer-a").unwrap());
        assert!(!git.branch_exists("quorum/t1/writer-b").unwrap());
        // Unrelated task untouched.
        assert!(other.path.exists());
        assert!(git.branch_exists("quorum/t2/writer-a").unwrap());
    }
}

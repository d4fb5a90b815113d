use std::path::{Path, PathBuf};

use git2::{ErrorCode, IndexAddOption, Repository, Signature};

use crate::{qlog_debug, qlog_warn, Error, Result};

pub struct GitOps {
    repo_path: PathBuf,
}

impl GitOps {
    pub fn new(repo_path: &Path) -> Result<Self> {
        qlog_debug!("GitOps::new path={}", repo_path.display());
        let _ = Repository::discover(repo_path)?;
        Ok(Self {
            repo_path: repo_path.to_path_buf(),
        })
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::discover(&self.repo_path)?)
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Create a branch off HEAD and check it out as a new worktree.
    pub fn create_worktree(&self, branch: &str, worktree_path: &Path) -> Result<()> {
        qlog_debug!(
            "GitOps::create_worktree branch={} path={}",
            branch,
            worktree_path.display()
        );
        let repo = self.repo()?;
        let head = repo.head()?;
        let commit = head.peel_to_commit()?;
        let branch_obj = repo.branch(branch, &commit, false)?;
        let branch_ref = branch_obj.into_reference();
        let mut opts = git2::WorktreeAddOptions::new();
        opts.reference(Some(&branch_ref));
        // Use the folder name as worktree name (branch contains slashes)
        let worktree_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(branch);
        repo.worktree(worktree_name, worktree_path, Some(&opts))?;
        qlog_debug!("Worktree created for branch {}", branch);
        Ok(())
    }

    /// Check out an existing branch as a new worktree.
    pub fn create_worktree_from_branch(&self, branch: &str, worktree_path: &Path) -> Result<()> {
        let repo = self.repo()?;
        let branch_ref = repo.find_branch(branch, git2::BranchType::Local)?;
        let reference = branch_ref.into_reference();

        let mut opts = git2::WorktreeAddOptions::new();
        opts.reference(Some(&reference));

        let worktree_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(branch);

        repo.worktree(worktree_name, worktree_path, Some(&opts))?;
        Ok(())
    }

    /// Remove a worktree and its administrative files, keeping the branch.
    /// Cleanup continues even if individual steps fail.
    pub fn remove_worktree(&self, worktree_path: &Path) -> Result<()> {
        qlog_debug!("GitOps::remove_worktree path={}", worktree_path.display());
        let repo = self.repo()?;
        let worktrees = repo.worktrees()?;

        let folder_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|s| s.to_string());

        let worktree_name: Option<String> = worktrees
            .iter()
            .flatten()
            .find(|name| {
                repo.find_worktree(name)
                    .map(|wt| wt.path() == worktree_path)
                    .unwrap_or(false)
                    || folder_name.as_deref() == Some(name)
            })
            .map(|s| s.to_string());

        if let Some(ref name) = worktree_name {
            if let Ok(worktree) = repo.find_worktree(name) {
                let _ = worktree.unlock();
                let prune_result = worktree.prune(Some(
                    git2::WorktreePruneOptions::new()
                        .valid(true)
                        .working_tree(true)
                        .locked(true),
                ));
                if let Err(e) = prune_result {
                    qlog_warn!("Worktree prune failed for '{}': {}", name, e);
                }
            }
        }

        if worktree_path.exists() {
            std::fs::remove_dir_all(worktree_path)?;
        }

        // If the admin dir (.git/worktrees/<name>) survives, git still
        // considers the branch checked out.
        if let Some(ref name) = worktree_name {
            let admin_dir = repo.path().join("worktrees").join(name);
            if admin_dir.exists() {
                let _ = std::fs::remove_dir_all(&admin_dir);
            }
        }

        Ok(())
    }

    /// Stage everything in a worktree and commit. No-op detection is the
    /// caller's job via [`GitOps::is_dirty`].
    pub fn commit_all(&self, worktree_path: &Path, message: &str) -> Result<String> {
        qlog_debug!(
            "GitOps::commit_all path={} message={}",
            worktree_path.display(),
            message
        );
        let repo = Repository::open(worktree_path)?;
        let mut index = repo.index()?;
        index.add_all(["."].iter(), IndexAddOption::DEFAULT, None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let sig = repo
            .signature()
            .or_else(|_| Signature::now("Quorum", "quorum@localhost"))?;

        let parent = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(e) if e.code() == ErrorCode::UnbornBranch => None,
            Err(e) => return Err(e.into()),
        };

        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        qlog_debug!("Commit created: {}", commit_id);
        Ok(commit_id.to_string())
    }

    pub fn head_commit_of(&self, worktree_path: &Path) -> Result<String> {
        let repo = Repository::open(worktree_path)?;
        let head = repo.head()?;
        let commit = head.peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let repo = self.repo()?;
        let exists = match repo.find_branch(branch, git2::BranchType::Local) {
            Ok(_) => Ok(true),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        };
        exists
    }

    /// List local branches under the given prefix.
    pub fn branches_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let repo = self.repo()?;
        let mut out = Vec::new();
        for branch_result in repo.branches(Some(git2::BranchType::Local))? {
            let (branch, _) = branch_result?;
            if let Ok(Some(name)) = branch.name() {
                if name.starts_with(prefix) {
                    out.push(name.to_string());
                }
            }
        }
        out.sort();
        Ok(out)
    }

    /// Delete a local branch. Missing branch is fine; other failures are
    /// logged as warnings, not errors.
    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        qlog_debug!("GitOps::delete_branch branch={}", branch);
        let repo = self.repo()?;
        match repo.find_branch(branch, git2::BranchType::Local) {
            Ok(mut branch_ref) => {
                if let Err(e) = branch_ref.delete() {
                    qlog_warn!("Failed to delete branch '{}': {}", branch, e);
                }
            }
            Err(e) if e.code() == ErrorCode::NotFound => {}
            Err(e) => {
                qlog_warn!("Error looking up branch '{}': {}", branch, e);
            }
        }
        Ok(())
    }

    /// Check if a worktree has uncommitted changes (staged or unstaged).
    pub fn is_dirty(&self, worktree_path: &Path) -> Result<bool> {
        let repo = Repository::open(worktree_path)?;
        let mut opts = git2::StatusOptions::new();
        opts.include_untracked(true);
        let statuses = repo.statuses(Some(&mut opts))?;
        Ok(!statuses.is_empty())
    }

    /// Whether the remote exists in the backing repository's config.
    pub fn has_remote(&self, remote: &str) -> bool {
        self.repo()
            .and_then(|r| r.find_remote(remote).map(|_| ()).map_err(Into::into))
            .is_ok()
    }

    /// Push a branch to the remote. Shells out to `git` so the user's
    /// credential helpers work unchanged.
    pub fn push_branch(&self, worktree_path: &Path, remote: &str, branch: &str) -> Result<()> {
        qlog_debug!("GitOps::push_branch remote={} branch={}", remote, branch);
        let output = std::process::Command::new("git")
            .arg("push")
            .arg("--set-upstream")
            .arg(remote)
            .arg(branch)
            .current_dir(worktree_path)
            .output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Validation(format!(
                "git push failed for '{}': {}",
                branch,
                stderr.trim()
            )));
        }
        Ok(())
    }

    /// Whether the remote already has the branch at the local head.
    pub fn remote_has_head(&self, worktree_path: &Path, remote: &str, branch: &str) -> bool {
        let local = match self.head_commit_of(worktree_path) {
            Ok(c) => c,
            Err(_) => return false,
        };
        let output = std::process::Command::new("git")
            .arg("ls-remote")
            .arg(remote)
            .arg(format!("refs/heads/{}", branch))
            .current_dir(worktree_path)
            .output();
        match output {
            Ok(out) if out.status.success() => {
                String::from_utf8_lossy(&out.stdout).starts_with(&local)
            }
            _ => false,
        }
    }
}

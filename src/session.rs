//! Session registry: durable resume handles per (role, task).
//!
//! Each handle is one flat plain-text file at
//! `<root>/<task-id>/<role-slug>`, holding nothing but the opaque handle
//! string. The format is the interchange contract: any compliant
//! implementation can read or write these files without version
//! negotiation, and external tooling can inspect them with `cat`.
//!
//! Writes are atomic replaces (write-to-temp then rename), which is all
//! the coordination needed since each (role, task) pair has a single
//! writer by construction.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::role::{Role, TaskId};
use crate::{qlog_debug, Result};

/// An opaque resumption token issued by the underlying agent tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionHandle(String);

impl SessionHandle {
    pub fn new(handle: &str) -> Self {
        Self(handle.trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub struct SessionRegistry {
    root: PathBuf,
}

impl SessionRegistry {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    fn handle_path(&self, role: Role, task_id: &TaskId) -> PathBuf {
        self.root.join(task_id.as_str()).join(role.slug())
    }

    /// Look up the stored handle. Absence is `Ok(None)`, never an error.
    pub fn get(&self, role: Role, task_id: &TaskId) -> Result<Option<SessionHandle>> {
        let path = self.handle_path(role, task_id);
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)?;
        let trimmed = contents.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        Ok(Some(SessionHandle::new(trimmed)))
    }

    /// Store a handle, replacing any previous one (last write wins).
    pub fn put(&self, role: Role, task_id: &TaskId, handle: &SessionHandle) -> Result<()> {
        let path = self.handle_path(role, task_id);
        qlog_debug!(
            "SessionRegistry::put role={} task={} path={}",
            role,
            task_id,
            path.display()
        );
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Temp file in the same directory so the rename stays on one
        // filesystem and is atomic.
        let dir = path.parent().unwrap_or(Path::new("."));
        let mut temp = tempfile::NamedTempFile::new_in(dir)?;
        writeln!(temp, "{}", handle.as_str())?;
        temp.flush()?;
        temp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    }

    /// All handles stored for a task, for the status projection.
    pub fn list(&self, task_id: &TaskId) -> Result<Vec<(Role, SessionHandle)>> {
        let dir = self.root.join(task_id.as_str());
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Ok(role) = name.parse::<Role>() else {
                continue;
            };
            if let Some(handle) = self.get(role, task_id)? {
                out.push((role, handle));
            }
        }
        out.sort_by_key(|(role, _)| *role);
        Ok(out)
    }

    /// Remove all handles for a task (explicit cleanup only).
    pub fn remove_task(&self, task_id: &TaskId) -> Result<()> {
        let dir = self.root.join(task_id.as_str());
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }
}

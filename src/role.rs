//! Participant roles and task identifiers.
//!
//! A role is a logical slot in the workflow (writer-a, writer-b,
//! judge-1..N), distinct from the underlying agent tool that fills it.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

const MAX_TASK_ID_LENGTH: usize = 64;

/// A logical participant slot in the workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Role {
    WriterA,
    WriterB,
    /// Judge index, 1-based.
    Judge(u8),
}

impl Role {
    /// The slug used in branch names, session files, and log files.
    pub fn slug(&self) -> String {
        self.to_string()
    }

    pub fn is_writer(&self) -> bool {
        matches!(self, Role::WriterA | Role::WriterB)
    }

    pub fn is_judge(&self) -> bool {
        matches!(self, Role::Judge(_))
    }

    /// The two writer roles, in stable order.
    pub fn writers() -> [Role; 2] {
        [Role::WriterA, Role::WriterB]
    }

    /// Judge roles 1..=count.
    pub fn judges(count: usize) -> Vec<Role> {
        (1..=count as u8).map(Role::Judge).collect()
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::WriterA => write!(f, "writer-a"),
            Role::WriterB => write!(f, "writer-b"),
            Role::Judge(n) => write!(f, "judge-{}", n),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "writer-a" => Ok(Role::WriterA),
            "writer-b" => Ok(Role::WriterB),
            other => {
                if let Some(n) = other.strip_prefix("judge-") {
                    let idx: u8 = n
                        .parse()
                        .map_err(|_| Error::Validation(format!("Invalid role: {}", other)))?;
                    if idx == 0 {
                        return Err(Error::Validation("Judge index starts at 1".to_string()));
                    }
                    return Ok(Role::Judge(idx));
                }
                Err(Error::Validation(format!("Invalid role: {}", other)))
            }
        }
    }
}

impl Serialize for Role {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Role {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Unique string identifier for a task.
///
/// Task ids are user-supplied slugs; they appear in branch names,
/// directory names, and log file names, so they are validated on
/// construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: &str) -> Result<Self> {
        validate_task_id(id)?;
        Ok(Self(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

fn validate_task_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::Validation("Task id cannot be empty".to_string()));
    }

    if id.len() > MAX_TASK_ID_LENGTH {
        return Err(Error::Validation(format!(
            "Task id too long (max {} characters)",
            MAX_TASK_ID_LENGTH
        )));
    }

    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::Validation(
            "Task id may only contain alphanumerics, '-' and '_'".to_string(),
        ));
    }

    Ok(())
}

/// Deterministic branch name for a (role, task) pair.
///
/// Branch names are unique per (role, task) by construction, which is
/// what makes concurrent branch creation conflict-free.
pub fn branch_name(role: Role, task_id: &TaskId, model_slug: Option<&str>) -> String {
    match model_slug {
        Some(model) => format!("quorum/{}/{}-{}", task_id, role.slug(), model),
        None => format!("quorum/{}/{}", task_id, role.slug()),
    }
}

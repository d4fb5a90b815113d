use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Agent not available: {0}")]
    AgentNotAvailable(String),

    #[error("No session to resume for {role} on task '{task}'")]
    NoSessionToResume { role: String, task: String },

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Invalid phase transition from {from} to {to}")]
    InvalidPhaseTransition { from: String, to: String },

    #[error("Panel produced no usable votes for task '{0}'")]
    NoQuorum(String),

    #[error("Writer {role} failed with exit code {code:?}")]
    WriterFailed { role: String, code: Option<i32> },

    #[error("Review loop escalated for task '{task}' after {cycles} cycles")]
    Escalated { task: String, cycles: u32 },

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),
}

pub type Result<T> = std::result::Result<T, Error>;

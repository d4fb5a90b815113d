use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::panel::TieBreak;
use crate::{qlog_debug, Error, Result};

fn default_judge_count() -> usize {
    3
}

fn default_retry_cap() -> u32 {
    5
}

fn default_time_budget_mins() -> u64 {
    60
}

fn default_judge_timeout_secs() -> u64 {
    600
}

fn default_push_attempts() -> u32 {
    3
}

fn default_remote() -> String {
    "origin".to_string()
}

fn default_tie_breaks() -> Vec<TieBreak> {
    vec![
        TieBreak::ArchitectureCompliance,
        TieBreak::Simplicity,
        TieBreak::BlockerCount,
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Command used to launch an agent process (binary plus fixed args).
    pub command: Option<String>,
    /// Number of judges on a panel.
    #[serde(default = "default_judge_count")]
    pub judge_count: usize,
    /// Synthesis/peer-review cycles before escalation.
    #[serde(default = "default_retry_cap")]
    pub retry_cap: u32,
    /// Wall-clock budget for the review loop, in minutes.
    #[serde(default = "default_time_budget_mins")]
    pub time_budget_mins: u64,
    /// Per-judge timeout, in seconds.
    #[serde(default = "default_judge_timeout_secs")]
    pub judge_timeout_secs: u64,
    /// Bounded attempts for pushing a finalized branch.
    #[serde(default = "default_push_attempts")]
    pub push_attempts: u32,
    /// Git remote branches are pushed to.
    #[serde(default = "default_remote")]
    pub remote: String,
    /// Override for the workspaces directory.
    pub workspace_dir: Option<String>,
    /// Tie-break rules applied in order when a panel has no majority.
    #[serde(default = "default_tie_breaks")]
    pub tie_breaks: Vec<TieBreak>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            command: None,
            judge_count: default_judge_count(),
            retry_cap: default_retry_cap(),
            time_budget_mins: default_time_budget_mins(),
            judge_timeout_secs: default_judge_timeout_secs(),
            push_attempts: default_push_attempts(),
            remote: default_remote(),
            workspace_dir: None,
            tie_breaks: default_tie_breaks(),
        }
    }
}

impl Config {
    pub fn quorum_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".quorum"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::quorum_dir()?.join("quorum.toml"))
    }

    pub fn tasks_dir() -> Result<PathBuf> {
        Ok(Self::quorum_dir()?.join("tasks"))
    }

    pub fn sessions_dir() -> Result<PathBuf> {
        Ok(Self::quorum_dir()?.join("sessions"))
    }

    pub fn logs_dir() -> Result<PathBuf> {
        Ok(Self::quorum_dir()?.join("logs"))
    }

    pub fn workspaces_dir(&self) -> Result<PathBuf> {
        match &self.workspace_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::quorum_dir()?.join("workspaces")),
        }
    }

    pub fn effective_command(&self) -> &str {
        self.command.as_deref().unwrap_or("claude")
    }

    pub fn judge_timeout(&self) -> Duration {
        Duration::from_secs(self.judge_timeout_secs)
    }

    pub fn time_budget(&self) -> Duration {
        Duration::from_secs(self.time_budget_mins * 60)
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        qlog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            qlog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        qlog_debug!(
            "Config loaded: judges={} retry_cap={} command={:?}",
            config.judge_count,
            config.retry_cap,
            config.command
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let quorum_dir = Self::quorum_dir()?;
        if !quorum_dir.exists() {
            fs::create_dir_all(&quorum_dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        qlog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            Self::quorum_dir()?,
            Self::tasks_dir()?,
            Self::sessions_dir()?,
            Self::logs_dir()?,
            self.workspaces_dir()?,
        ] {
            if !dir.exists() {
                qlog_debug!("Creating directory: {}", dir.display());
                fs::create_dir_all(&dir)?;
            }
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.judge_count, 3);
        assert_eq!(config.retry_cap, 5);
        assert_eq!(config.time_budget_mins, 60);
        assert_eq!(config.push_attempts, 3);
        assert_eq!(config.remote, "origin");
        assert_eq!(config.effective_command(), "claude");
        assert_eq!(
            config.tie_breaks,
            vec![
                TieBreak::ArchitectureCompliance,
                TieBreak::Simplicity,
                TieBreak::BlockerCount
            ]
        );
    }

    #[test]
    fn test_expand_tilde() {
        let expanded = expand_tilde("~/foo/bar");
        assert!(expanded.ends_with("foo/bar"));
        assert!(!expanded.to_string_lossy().contains('~'));

        let absolute = expand_tilde("/absolute/path");
        assert_eq!(absolute, PathBuf::from("/absolute/path"));
    }

    #[test]
    fn test_config_roundtrip() {
        let config = Config {
            command: Some("claude --dangerously-skip-permissions".to_string()),
            judge_count: 5,
            retry_cap: 2,
            ..Default::default()
        };
        let toml = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.judge_count, 5);
        assert_eq!(parsed.retry_cap, 2);
        assert_eq!(
            parsed.command,
            Some("claude --dangerously-skip-permissions".to_string())
        );
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let parsed: Config = toml::from_str(r#"command = "claude""#).unwrap();
        assert_eq!(parsed.judge_count, 3);
        assert_eq!(parsed.retry_cap, 5);
        assert_eq!(parsed.remote, "origin");
    }

    #[test]
    fn test_durations() {
        let config = Config::default();
        assert_eq!(config.judge_timeout(), Duration::from_secs(600));
        assert_eq!(config.time_budget(), Duration::from_secs(3600));
    }
}

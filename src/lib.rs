pub mod config;
pub mod error;
pub mod event;
pub mod git;
pub mod log;
pub mod orchestrator;
pub mod panel;
pub mod review;
pub mod role;
pub mod runner;
pub mod session;
pub mod state;
pub mod util;
pub mod workspace;

pub use error::{Error, Result};
pub use role::{Role, TaskId};
pub use state::{ChosenPath, Phase, WorkflowState, WorkflowStatus};

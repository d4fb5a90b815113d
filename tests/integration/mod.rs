//! Integration test suite for quorum.
//!
//! These tests drive the orchestrator through complete workflows using
//! scripted stand-in agents and temporary git repositories, so they run
//! without any real agent tool installed.
//!
//! # Test Categories
//!
//! - `workflow_e2e`: full start-to-complete workflow scenarios
//! - `control_surface`: status, resume and cleanup commands

mod fixtures;

mod control_surface;
mod workflow_e2e;

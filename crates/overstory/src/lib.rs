//! Overstory orchestration core.
//!
//! Turns a single interactive coding-assistant session into a supervised
//! team: worker agents run in isolated git worktrees inside multiplexer
//! panes, communicate through a durable mailbox, and have their branches
//! reintegrated through a FIFO merge queue with four-tier conflict
//! escalation. The Zero-Failure-Crash watchdog reconciles recorded session
//! state with observable liveness and walks a progressive escalation
//! ladder before killing anything.
//!
//! The crate is the core only: the CLI front end, the concrete multiplexer,
//! and the agent launcher talk to it through the stores and the driver
//! traits ([`infra::git::GitClient`], [`infra::mux::MuxClient`],
//! [`infra::ai::AiClient`]).

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod infra;
pub mod telemetry;

pub use config::{OverstoryConfig, StateDir};
pub use error::{Error, Result};

//! Core types and error definitions for the Conductor orchestration engine.
//!
//! This crate provides the foundational pieces shared across all Conductor
//! crates: the unified error type and the string identifiers used for agents,
//! tasks and goals.
//!
//! # Main types
//!
//! - [`ConductorError`]: Unified error enum for all Conductor subsystems.
//! - [`ConductorResult`]: Convenience alias for `Result<T, ConductorError>`.
//! - [`AgentId`], [`TaskId`], [`GoalId`]: Typed string identifiers.

/// Error types.
pub mod error;
/// Typed identifiers and id generation.
pub mod id;

pub use error::{ConductorError, ConductorResult};
pub use id::{AgentId, GoalId, TaskId};

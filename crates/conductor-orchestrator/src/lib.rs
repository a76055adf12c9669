//! In-memory orchestration engine for agents, tasks and goals.
//!
//! Agents register with capabilities; tasks declare required capabilities
//! and dependencies; goals expand into one task per planned task type. A
//! periodic dispatch loop hands ready tasks to the best-scoring agent, a
//! health-check loop takes silent agents offline and reassigns their work,
//! and a metrics loop aggregates system figures.
//!
//! # Main types
//!
//! - [`OrchestrationEngine`]: Owns all state and applies every transition.
//! - [`EngineRuntime`]: Runs the dispatch, health-check and metrics loops.
//! - [`EventBus`]: Topic-keyed publish/subscribe for [`EngineEvent`]s.
//! - [`TaskQueue`]: Dispatch queue plus reverse dependency index.
//! - [`EngineConfig`]: Loop periods, heartbeat timeout and retry backoff.

/// Task-to-agent fitness scoring.
pub mod assignment;
/// Injectable time source.
pub mod clock;
/// Engine timing configuration.
pub mod config;
/// The orchestration engine.
pub mod engine;
/// Event topics, payloads and the in-process bus.
pub mod events;
/// System metrics and status snapshots.
pub mod monitor;
/// Periodic loop runtime.
pub mod scheduler;
/// Dispatch queue and dependency index.
pub mod task_queue;
/// Agent, task and goal records.
pub mod types;

pub use assignment::{fitness_score, select_agent};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use engine::OrchestrationEngine;
pub use events::{EngineEvent, EventBus, EventTopic, HandlerError, Subscription};
pub use monitor::{AnalyticsSink, SystemMetrics, SystemStatus, TracingAnalytics};
pub use scheduler::EngineRuntime;
pub use task_queue::TaskQueue;
pub use types::{
    Agent, AgentKind, AgentPerformance, AgentSpec, AgentStatus, Goal, GoalSpec, GoalStatus,
    GoalWork, Task, TaskPriority, TaskSpec, TaskStatus, TaskType, DEFAULT_MAX_RETRIES,
};

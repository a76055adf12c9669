/// Top-level error type for Conductor.
///
/// Each variant corresponds to a class of failure a caller can act on.
/// Unknown entity ids are not represented here: engine
/// operations treat them as no-ops.
#[derive(Debug, thiserror::Error)]
pub enum ConductorError {
    /// A generic error raised by the orchestration engine.
    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A task status change that the task lifecycle does not allow.
    #[error("Invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        /// The task whose status was being changed.
        task_id: String,
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },

    /// A goal operation that does not fit the goal's current state.
    #[error("Goal error: {0}")]
    GoalState(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`ConductorError`].
pub type ConductorResult<T> = Result<T, ConductorError>;

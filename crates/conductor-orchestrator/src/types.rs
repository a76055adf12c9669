use chrono::{DateTime, Utc};
use conductor_core::{AgentId, GoalId, TaskId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Default retry budget for tasks synthesized from a goal.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Kind of agent in the multi-agent system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    /// Coordinates other agents.
    Orchestrator,
    /// Oversees a group of workers.
    Supervisor,
    /// Checks the output of other agents.
    Validator,
    /// Executes tasks.
    Worker,
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentKind::Orchestrator => write!(f, "orchestrator"),
            AgentKind::Supervisor => write!(f, "supervisor"),
            AgentKind::Validator => write!(f, "validator"),
            AgentKind::Worker => write!(f, "worker"),
        }
    }
}

/// Liveness / load state of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Online and working, but may take more.
    Active,
    /// Online with nothing assigned.
    Idle,
    /// Holding at least one task.
    Busy,
    /// Reported a fault; not offered work.
    Error,
    /// Missed its heartbeat window or was taken down.
    Offline,
}

impl AgentStatus {
    /// Lowercase name used in events and status snapshots.
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Active => "active",
            AgentStatus::Idle => "idle",
            AgentStatus::Busy => "busy",
            AgentStatus::Error => "error",
            AgentStatus::Offline => "offline",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Running performance figures for an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentPerformance {
    /// Number of tasks completed.
    pub tasks_completed: u64,
    /// Running mean of completed task durations, in milliseconds.
    pub average_response_time_ms: f64,
    /// Approximate fraction of failed tasks, in `[0, 1]`.
    pub error_rate: f64,
    /// Last heartbeat or status update.
    pub last_health_check: DateTime<Utc>,
}

impl AgentPerformance {
    /// A zeroed performance block with the heartbeat stamped at `now`.
    pub fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            tasks_completed: 0,
            average_response_time_ms: 0.0,
            error_rate: 0.0,
            last_health_check: now,
        }
    }
}

/// Registration data for an agent; the engine adds the performance block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    /// Unique agent id.
    pub id: AgentId,
    /// Role of the agent.
    #[serde(rename = "type")]
    pub kind: AgentKind,
    /// Display name.
    pub name: String,
    /// Initial status. Defaults to `idle`; `busy` is registered as `idle`.
    #[serde(default = "default_agent_status")]
    pub status: AgentStatus,
    /// Capabilities the agent offers.
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    /// Accepted for wire compatibility and ignored at registration.
    #[serde(default)]
    pub current_tasks: Vec<TaskId>,
}

fn default_agent_status() -> AgentStatus {
    AgentStatus::Idle
}

impl AgentSpec {
    /// An idle agent with no capabilities.
    pub fn new(id: impl Into<AgentId>, kind: AgentKind, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            name: name.into(),
            status: AgentStatus::Idle,
            capabilities: BTreeSet::new(),
            current_tasks: Vec::new(),
        }
    }

    /// Set the initial status.
    pub fn with_status(mut self, status: AgentStatus) -> Self {
        self.status = status;
        self
    }

    /// Replace the capability set.
    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }
}

/// An agent registered with the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    /// Unique agent id.
    pub id: AgentId,
    /// Role of the agent.
    #[serde(rename = "type")]
    pub kind: AgentKind,
    /// Display name.
    pub name: String,
    /// Current status.
    pub status: AgentStatus,
    /// Capabilities the agent offers.
    pub capabilities: BTreeSet<String>,
    /// Tasks currently assigned to this agent, in assignment order.
    pub current_tasks: Vec<TaskId>,
    /// Running performance figures.
    pub performance: AgentPerformance,
}

impl Agent {
    /// Build a fresh record. The task list starts empty since only the
    /// dispatcher hands out tasks, and a `busy` status with nothing to
    /// work on starts out `idle`.
    pub fn from_spec(spec: AgentSpec, now: DateTime<Utc>) -> Self {
        let status = match spec.status {
            AgentStatus::Busy => AgentStatus::Idle,
            other => other,
        };
        Self {
            id: spec.id,
            kind: spec.kind,
            name: spec.name,
            status,
            capabilities: spec.capabilities,
            current_tasks: Vec::new(),
            performance: AgentPerformance::fresh(now),
        }
    }

    /// Whether the dispatcher may hand this agent a new task.
    pub fn is_available(&self) -> bool {
        matches!(self.status, AgentStatus::Active | AgentStatus::Idle)
    }

    /// Whether this agent has every capability in `required`.
    pub fn covers(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.capabilities)
    }

    /// Drop a task from the agent's list, idling the agent once it holds
    /// nothing. Offline and errored agents keep their status.
    pub fn release_task(&mut self, task_id: &TaskId) -> bool {
        let before = self.current_tasks.len();
        self.current_tasks.retain(|t| t != task_id);
        let removed = self.current_tasks.len() != before;
        if self.current_tasks.is_empty()
            && matches!(self.status, AgentStatus::Busy | AgentStatus::Active)
        {
            self.status = AgentStatus::Idle;
        }
        removed
    }

    /// Fold a completed task's duration into the running mean.
    pub fn record_completion(&mut self, duration_ms: u64) {
        let perf = &mut self.performance;
        perf.tasks_completed += 1;
        let n = perf.tasks_completed as f64;
        perf.average_response_time_ms =
            (perf.average_response_time_ms * (n - 1.0) + duration_ms as f64) / n;
    }

    /// Bump the error rate for one more failure.
    ///
    /// The previous error count is reconstructed from the rate, so the
    /// result is an approximation rather than an exact running count.
    pub fn record_failure(&mut self) {
        let perf = &mut self.performance;
        let completed = perf.tasks_completed as f64;
        let previous_errors = (perf.error_rate * completed).round();
        perf.error_rate = ((previous_errors + 1.0) / (completed + 1.0)).clamp(0.0, 1.0);
    }
}

/// Task urgency. Ordering is `Low < Medium < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    /// Served last.
    Low,
    /// Default urgency.
    Medium,
    /// Served before medium.
    High,
    /// Served first.
    Critical,
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskPriority::Low => write!(f, "low"),
            TaskPriority::Medium => write!(f, "medium"),
            TaskPriority::High => write!(f, "high"),
            TaskPriority::Critical => write!(f, "critical"),
        }
    }
}

/// Status of a task in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting in the queue for its dependencies or an agent.
    Pending,
    /// Handed to an agent, not started.
    Assigned,
    /// Reported started by its agent.
    Running,
    /// Finished successfully.
    Completed,
    /// Failed; may still have a retry scheduled.
    Failed,
    /// Cancelled directly or because a dependency died.
    Cancelled,
}

impl TaskStatus {
    /// Lowercase name used in events and status snapshots.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Completed, failed and cancelled tasks take no further external updates.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Transitions a caller may request through a status update.
    ///
    /// `Pending` is only re-entered by reassignment and `Assigned` only by
    /// the dispatcher, so neither is a valid target here.
    pub fn accepts_update_to(&self, next: TaskStatus) -> bool {
        match (self, next) {
            (TaskStatus::Assigned, TaskStatus::Running) => true,
            (TaskStatus::Assigned | TaskStatus::Running, TaskStatus::Failed) => true,
            (TaskStatus::Running, TaskStatus::Completed) => true,
            (current, TaskStatus::Cancelled) => !current.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a task does. Each known type maps to a fixed capability set;
/// anything else falls back to `general`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskType {
    /// `api-validation`
    ApiValidation,
    /// `data-processing`
    DataProcessing,
    /// `monitoring`
    Monitoring,
    /// `security-audit`
    SecurityAudit,
    /// `documentation`
    Documentation,
    /// `testing`
    Testing,
    /// Any other name; needs the `general` capability.
    Other(String),
}

impl TaskType {
    /// Wire name of the type.
    pub fn as_str(&self) -> &str {
        match self {
            TaskType::ApiValidation => "api-validation",
            TaskType::DataProcessing => "data-processing",
            TaskType::Monitoring => "monitoring",
            TaskType::SecurityAudit => "security-audit",
            TaskType::Documentation => "documentation",
            TaskType::Testing => "testing",
            TaskType::Other(name) => name,
        }
    }

    /// Capabilities an agent needs to take a task of this type.
    pub fn required_capabilities(&self) -> BTreeSet<String> {
        let caps: &[&str] = match self {
            TaskType::ApiValidation => &["api-testing", "http-client"],
            TaskType::DataProcessing => &["data-processing"],
            TaskType::Monitoring => &["monitoring", "metrics"],
            TaskType::SecurityAudit => &["security", "vulnerability-scan"],
            TaskType::Documentation => &["documentation"],
            TaskType::Testing => &["testing", "validation"],
            TaskType::Other(_) => &["general"],
        };
        caps.iter().map(|c| (*c).to_string()).collect()
    }
}

impl From<String> for TaskType {
    fn from(name: String) -> Self {
        match name.as_str() {
            "api-validation" => TaskType::ApiValidation,
            "data-processing" => TaskType::DataProcessing,
            "monitoring" => TaskType::Monitoring,
            "security-audit" => TaskType::SecurityAudit,
            "documentation" => TaskType::Documentation,
            "testing" => TaskType::Testing,
            _ => TaskType::Other(name),
        }
    }
}

impl From<&str> for TaskType {
    fn from(name: &str) -> Self {
        TaskType::from(name.to_string())
    }
}

impl From<TaskType> for String {
    fn from(task_type: TaskType) -> Self {
        task_type.as_str().to_string()
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-supplied data for a new task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// What the task does.
    #[serde(rename = "type")]
    pub task_type: TaskType,
    /// Dispatch urgency.
    pub priority: TaskPriority,
    /// Tasks that must complete first.
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    /// Capabilities an agent needs to take the task.
    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,
    /// Opaque caller data.
    #[serde(default)]
    pub payload: HashMap<String, serde_json::Value>,
    /// Informational deadline.
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    /// Caller's duration estimate.
    #[serde(default)]
    pub estimated_duration_ms: Option<u64>,
    /// Retry budget. Defaults to 3.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl TaskSpec {
    /// A spec requiring the capabilities of `task_type`, with no dependencies.
    pub fn new(task_type: impl Into<TaskType>, priority: TaskPriority) -> Self {
        let task_type = task_type.into();
        Self {
            required_capabilities: task_type.required_capabilities(),
            task_type,
            priority,
            dependencies: Vec::new(),
            payload: HashMap::new(),
            deadline: None,
            estimated_duration_ms: None,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Set the tasks that must complete first.
    pub fn with_dependencies(mut self, deps: Vec<TaskId>) -> Self {
        self.dependencies = deps;
        self
    }

    /// Replace the capability set derived from the task type.
    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    /// Add one payload entry.
    pub fn with_payload(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    /// Set the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the deadline.
    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set the duration estimate.
    pub fn with_estimated_duration(mut self, duration_ms: u64) -> Self {
        self.estimated_duration_ms = Some(duration_ms);
        self
    }
}

/// A unit of work tracked by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task id.
    pub id: TaskId,
    /// What the task does.
    #[serde(rename = "type")]
    pub task_type: TaskType,
    /// Dispatch urgency.
    pub priority: TaskPriority,
    /// Lifecycle status.
    pub status: TaskStatus,
    /// Back-reference to the agent holding the task; not ownership.
    pub assigned_agent: Option<AgentId>,
    /// Tasks that must complete first.
    pub dependencies: Vec<TaskId>,
    /// Capabilities an agent needs to take the task.
    pub required_capabilities: BTreeSet<String>,
    /// Opaque caller data.
    pub payload: HashMap<String, serde_json::Value>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time of the last transition.
    pub updated_at: DateTime<Utc>,
    /// Informational deadline.
    pub deadline: Option<DateTime<Utc>>,
    /// Caller's duration estimate.
    pub estimated_duration_ms: Option<u64>,
    /// Creation-to-completion time, set on completion.
    pub actual_duration_ms: Option<u64>,
    /// Reassignments used so far.
    pub retry_count: u32,
    /// Retry budget.
    pub max_retries: u32,
    /// Result reported with a status update.
    pub result: Option<serde_json::Value>,
    /// Last failure or cancellation reason.
    pub error: Option<String>,
}

impl Task {
    /// A pending task built from `spec`.
    pub fn from_spec(id: TaskId, spec: TaskSpec, now: DateTime<Utc>) -> Self {
        Self {
            id,
            task_type: spec.task_type,
            priority: spec.priority,
            status: TaskStatus::Pending,
            assigned_agent: None,
            dependencies: spec.dependencies,
            required_capabilities: spec.required_capabilities,
            payload: spec.payload,
            created_at: now,
            updated_at: now,
            deadline: spec.deadline,
            estimated_duration_ms: spec.estimated_duration_ms,
            actual_duration_ms: None,
            retry_count: 0,
            max_retries: spec.max_retries,
            result: None,
            error: None,
        }
    }

    /// Pending and every dependency reported complete by `is_completed`.
    pub fn is_ready(&self, is_completed: impl Fn(&TaskId) -> bool) -> bool {
        self.status == TaskStatus::Pending && self.dependencies.iter().all(is_completed)
    }
}

/// Lifecycle stage of a goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GoalStatus {
    /// Created, not yet decomposed.
    Planning,
    /// Decomposed; member tasks in flight.
    Executing,
    /// Every member task completed.
    Completed,
    /// A member task can no longer complete.
    Failed,
}

impl GoalStatus {
    /// Lowercase name used in status snapshots.
    pub fn as_str(&self) -> &'static str {
        match self {
            GoalStatus::Planning => "planning",
            GoalStatus::Executing => "executing",
            GoalStatus::Completed => "completed",
            GoalStatus::Failed => "failed",
        }
    }
}

/// The work attached to a goal.
///
/// Before decomposition a goal only names task types; afterwards it owns
/// the ids of the tasks created for it. Progress is measured against
/// `Decomposed` only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "lowercase")]
pub enum GoalWork {
    /// Not yet decomposed.
    Planned {
        /// Task types to create on decomposition, in order.
        task_types: Vec<TaskType>,
    },
    /// Decomposed into member tasks.
    Decomposed {
        /// Tasks created for the goal, in planned order.
        task_ids: Vec<TaskId>,
    },
}

/// Caller-supplied data for a new goal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoalSpec {
    /// Display name.
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Priority given to every member task.
    pub priority: TaskPriority,
    /// Initial status. Defaults to `planning`.
    #[serde(default = "default_goal_status")]
    pub status: GoalStatus,
    /// One task is created per entry.
    #[serde(default)]
    pub task_types: Vec<TaskType>,
    /// Informational goal dependencies.
    #[serde(default)]
    pub dependencies: Vec<GoalId>,
    /// Informational deadline.
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
}

fn default_goal_status() -> GoalStatus {
    GoalStatus::Planning
}

impl GoalSpec {
    /// A planning goal with no task types.
    pub fn new(name: impl Into<String>, priority: TaskPriority) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            priority,
            status: GoalStatus::Planning,
            task_types: Vec::new(),
            dependencies: Vec::new(),
            deadline: None,
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the task types to plan.
    pub fn with_task_types<I, T>(mut self, task_types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskType>,
    {
        self.task_types = task_types.into_iter().map(Into::into).collect();
        self
    }
}

/// A high-level objective broken down into tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    /// Unique goal id.
    pub id: GoalId,
    /// Display name.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// Priority given to every member task.
    pub priority: TaskPriority,
    /// Lifecycle status.
    pub status: GoalStatus,
    /// Planned task types or created member tasks.
    pub work: GoalWork,
    /// Informational goal dependencies.
    pub dependencies: Vec<GoalId>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Informational deadline.
    pub deadline: Option<DateTime<Utc>>,
    /// Completed member tasks over total member tasks, in `[0, 1]`.
    pub progress: f64,
}

impl Goal {
    /// A goal built from `spec` with zero progress.
    pub fn from_spec(id: GoalId, spec: GoalSpec, now: DateTime<Utc>) -> Self {
        Self {
            id,
            name: spec.name,
            description: spec.description,
            priority: spec.priority,
            status: spec.status,
            work: GoalWork::Planned {
                task_types: spec.task_types,
            },
            dependencies: spec.dependencies,
            created_at: now,
            deadline: spec.deadline,
            progress: 0.0,
        }
    }

    /// Member task ids; empty until the goal is decomposed.
    pub fn task_ids(&self) -> &[TaskId] {
        match &self.work {
            GoalWork::Decomposed { task_ids } => task_ids,
            GoalWork::Planned { .. } => &[],
        }
    }

    /// Whether `task_id` is a member task.
    pub fn contains_task(&self, task_id: &TaskId) -> bool {
        self.task_ids().contains(task_id)
    }
}

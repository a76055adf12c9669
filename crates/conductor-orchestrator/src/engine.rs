use crate::assignment::select_agent;
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::events::{EngineEvent, EventBus, EventTopic, HandlerError, Subscription};
use crate::monitor::{AnalyticsSink, SystemMetrics, SystemStatus, TracingAnalytics};
use crate::task_queue::TaskQueue;
use crate::types::{
    Agent, AgentSpec, AgentStatus, Goal, GoalSpec, GoalStatus, GoalWork, Task, TaskSpec,
    TaskStatus, DEFAULT_MAX_RETRIES,
};
use chrono::{DateTime, Duration, Utc};
use conductor_core::{AgentId, ConductorError, ConductorResult, GoalId, TaskId};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Events produced while the state lock is held, published after release.
type Outbox = Vec<EngineEvent>;

/// Everything the engine owns. All transitions live here so that every
/// path (status updates, reassignment, health checks) applies the same
/// side effects.
#[derive(Default)]
struct EngineState {
    agents: BTreeMap<AgentId, Agent>,
    tasks: HashMap<TaskId, Task>,
    goals: HashMap<GoalId, Goal>,
    queue: TaskQueue,
    /// Outstanding retry reassignments and when they become due.
    retries: HashMap<TaskId, DateTime<Utc>>,
    last_metrics: Option<SystemMetrics>,
}

impl EngineState {
    fn create_task(&mut self, spec: TaskSpec, now: DateTime<Utc>, out: &mut Outbox) -> TaskId {
        let id = TaskId::generate(now);
        for dep in &spec.dependencies {
            if !self.tasks.contains_key(dep) {
                warn!(task_id = %id, dependency = %dep, "Task depends on an unknown task");
            }
        }
        let task = Task::from_spec(id.clone(), spec, now);
        self.queue.index_dependencies(&id, &task.dependencies);
        let doomed = task
            .dependencies
            .iter()
            .find(|dep| self.is_dead(dep))
            .cloned();

        debug!(task_id = %id, task_type = %task.task_type, priority = %task.priority, "Task created");
        out.push(EngineEvent::TaskCreated {
            task_id: id.clone(),
            task_type: task.task_type.clone(),
            priority: task.priority,
        });
        self.tasks.insert(id.clone(), task);
        self.queue.enqueue(id.clone());

        if let Some(dep) = doomed {
            self.cancel(&id, format!("Dependency {dep} can no longer complete"), now, out);
        }
        id
    }

    fn is_dead(&self, id: &TaskId) -> bool {
        is_dead(&self.tasks, &self.retries, id)
    }

    /// Failed, but with a retry still scheduled.
    fn awaiting_retry(&self, id: &TaskId) -> bool {
        self.retries.contains_key(id)
            && self
                .tasks
                .get(id)
                .is_some_and(|t| t.status == TaskStatus::Failed)
    }

    fn release_from_agent(&mut self, task_id: &TaskId, agent_id: &AgentId) {
        if let Some(agent) = self.agents.get_mut(agent_id) {
            agent.release_task(task_id);
        }
    }

    fn assign(
        &mut self,
        task_id: &TaskId,
        agent_id: &AgentId,
        score: f64,
        now: DateTime<Utc>,
        out: &mut Outbox,
    ) {
        let (Some(task), Some(agent)) = (self.tasks.get_mut(task_id), self.agents.get_mut(agent_id))
        else {
            return;
        };
        task.assigned_agent = Some(agent_id.clone());
        task.status = TaskStatus::Assigned;
        task.updated_at = now;
        agent.current_tasks.push(task_id.clone());
        agent.status = AgentStatus::Busy;
        self.queue.remove(task_id);

        info!(task_id = %task_id, agent_id = %agent_id, score, "Task assigned");
        out.push(EngineEvent::TaskAssigned {
            task_id: task_id.clone(),
            agent_id: agent_id.clone(),
            score,
        });
    }

    fn mark_running(&mut self, task_id: &TaskId, now: DateTime<Utc>) {
        if let Some(task) = self.tasks.get_mut(task_id) {
            task.status = TaskStatus::Running;
            task.updated_at = now;
        }
    }

    fn complete(&mut self, task_id: &TaskId, now: DateTime<Utc>, out: &mut Outbox) {
        let Some(task) = self.tasks.get_mut(task_id) else {
            return;
        };
        let duration_ms = u64::try_from((now - task.created_at).num_milliseconds()).unwrap_or(0);
        task.status = TaskStatus::Completed;
        task.actual_duration_ms = Some(duration_ms);
        task.updated_at = now;
        if let Some(agent_id) = task.assigned_agent.clone() {
            if let Some(agent) = self.agents.get_mut(&agent_id) {
                agent.record_completion(duration_ms);
                agent.release_task(task_id);
            }
        }
        self.retries.remove(task_id);
        self.queue.remove(task_id);
        info!(task_id = %task_id, duration_ms, "Task completed");

        for dependent in self.queue.dependents_of(task_id) {
            let ready = self.tasks.get(&dependent).is_some_and(|t| {
                t.is_ready(|dep| {
                    self.tasks
                        .get(dep)
                        .is_some_and(|d| d.status == TaskStatus::Completed)
                })
            });
            if ready {
                self.queue.enqueue(dependent);
            }
        }

        self.refresh_goals(task_id, out);
    }

    /// The single failure transition: agent metrics, retry scheduling or
    /// terminal cascade, goal refresh.
    fn fail_task(
        &mut self,
        task_id: &TaskId,
        error: String,
        now: DateTime<Utc>,
        config: &EngineConfig,
        out: &mut Outbox,
    ) {
        let Some(task) = self.tasks.get_mut(task_id) else {
            return;
        };
        task.status = TaskStatus::Failed;
        task.error = Some(error.clone());
        task.updated_at = now;
        let retry_count = task.retry_count;
        let max_retries = task.max_retries;
        if let Some(agent_id) = task.assigned_agent.clone() {
            if let Some(agent) = self.agents.get_mut(&agent_id) {
                agent.record_failure();
                agent.release_task(task_id);
            }
        }
        self.queue.remove(task_id);

        warn!(task_id = %task_id, error = %error, retry_count, max_retries, "Task failed");
        out.push(EngineEvent::TaskFailed {
            task_id: task_id.clone(),
            error,
        });

        if retry_count < max_retries {
            let due_at = retry_due_at(now, config.retry_delay_ms(retry_count));
            self.retries.insert(task_id.clone(), due_at);
            info!(task_id = %task_id, attempt = retry_count + 1, due_at = %due_at, "Retry scheduled");
            out.push(EngineEvent::TaskRetryScheduled {
                task_id: task_id.clone(),
                retry_count: retry_count + 1,
                due_at,
            });
        } else {
            self.retries.remove(task_id);
            self.cascade_cancel(task_id, true, now, out);
        }

        self.refresh_goals(task_id, out);
    }

    fn cancel(&mut self, task_id: &TaskId, reason: String, now: DateTime<Utc>, out: &mut Outbox) -> bool {
        if !self.mark_cancelled(task_id, reason, now, out) {
            return false;
        }
        self.cascade_cancel(task_id, false, now, out);
        true
    }

    fn mark_cancelled(
        &mut self,
        task_id: &TaskId,
        reason: String,
        now: DateTime<Utc>,
        out: &mut Outbox,
    ) -> bool {
        let awaiting_retry = self.awaiting_retry(task_id);
        let Some(task) = self.tasks.get_mut(task_id) else {
            return false;
        };
        if task.status.is_terminal() && !awaiting_retry {
            return false;
        }
        task.status = TaskStatus::Cancelled;
        task.error = Some(reason.clone());
        task.updated_at = now;
        let agent_id = task.assigned_agent.take();
        if let Some(agent_id) = agent_id {
            self.release_from_agent(task_id, &agent_id);
        }
        self.retries.remove(task_id);
        self.queue.remove(task_id);

        info!(task_id = %task_id, reason = %reason, "Task cancelled");
        out.push(EngineEvent::TaskCancelled {
            task_id: task_id.clone(),
            reason,
        });
        self.refresh_goals(task_id, out);
        true
    }

    /// Cancel every pending task downstream of `root`.
    fn cascade_cancel(&mut self, root: &TaskId, root_failed: bool, now: DateTime<Utc>, out: &mut Outbox) {
        let mut frontier = vec![(root.clone(), root_failed)];
        while let Some((parent, failed)) = frontier.pop() {
            for dependent in self.queue.dependents_of(&parent) {
                let pending = self
                    .tasks
                    .get(&dependent)
                    .is_some_and(|t| t.status == TaskStatus::Pending);
                if !pending {
                    continue;
                }
                let reason = if failed {
                    format!("Dependency {parent} failed")
                } else {
                    format!("Dependency {parent} was cancelled")
                };
                if self.mark_cancelled(&dependent, reason, now, out) {
                    frontier.push((dependent, false));
                }
            }
        }
    }

    /// Detach a task from its agent and put it back in the queue, or fail it
    /// once the retry budget is spent.
    fn reassign(
        &mut self,
        task_id: &TaskId,
        now: DateTime<Utc>,
        config: &EngineConfig,
        out: &mut Outbox,
    ) -> bool {
        let Some(task) = self.tasks.get_mut(task_id) else {
            return false;
        };
        let reassignable = match task.status {
            TaskStatus::Assigned | TaskStatus::Running => true,
            TaskStatus::Failed => self.retries.contains_key(task_id),
            _ => false,
        };
        if !reassignable {
            debug!(task_id = %task_id, status = %task.status, "Task not reassignable");
            return false;
        }
        self.retries.remove(task_id);
        task.retry_count += 1;

        if task.retry_count > task.max_retries {
            self.fail_task(task_id, "Max retries exceeded".to_string(), now, config, out);
            return false;
        }

        let previous_agent = task.assigned_agent.take();
        task.status = TaskStatus::Pending;
        task.updated_at = now;
        let retry_count = task.retry_count;
        if let Some(agent_id) = &previous_agent {
            self.release_from_agent(task_id, agent_id);
        }
        self.queue.enqueue(task_id.clone());

        info!(task_id = %task_id, retry_count, "Task reassigned");
        out.push(EngineEvent::TaskReassigned {
            task_id: task_id.clone(),
            previous_agent,
            retry_count,
        });
        true
    }

    fn fire_due_retries(&mut self, now: DateTime<Utc>, config: &EngineConfig, out: &mut Outbox) -> usize {
        let mut due: Vec<TaskId> = self
            .retries
            .iter()
            .filter(|(_, due_at)| **due_at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        due.sort();
        for task_id in &due {
            self.reassign(task_id, now, config, out);
        }
        due.len()
    }

    /// Recompute progress for every goal containing `task_id`.
    fn refresh_goals(&mut self, task_id: &TaskId, out: &mut Outbox) {
        let tasks = &self.tasks;
        let retries = &self.retries;
        for goal in self.goals.values_mut() {
            if !goal.contains_task(task_id) {
                continue;
            }
            let members = goal.task_ids();
            let total = members.len();
            let completed = members
                .iter()
                .filter(|id| {
                    tasks
                        .get(*id)
                        .is_some_and(|t| t.status == TaskStatus::Completed)
                })
                .count();
            let dead = members
                .iter()
                .find(|id| is_dead(tasks, retries, id))
                .cloned();

            goal.progress = if total == 0 {
                0.0
            } else {
                completed as f64 / total as f64
            };

            if total > 0 && completed == total {
                if goal.status != GoalStatus::Completed {
                    goal.status = GoalStatus::Completed;
                    info!(goal_id = %goal.id, "Goal completed");
                    out.push(EngineEvent::GoalCompleted {
                        goal_id: goal.id.clone(),
                    });
                }
            } else if let Some(dead) = dead {
                if goal.status == GoalStatus::Executing {
                    goal.status = GoalStatus::Failed;
                    warn!(goal_id = %goal.id, task_id = %dead, "Goal failed");
                    out.push(EngineEvent::GoalFailed {
                        goal_id: goal.id.clone(),
                        task_id: dead,
                    });
                }
            }

            out.push(EngineEvent::GoalProgressUpdated {
                goal_id: goal.id.clone(),
                progress: goal.progress,
            });
        }
    }
}

/// Cancelled, or failed with no retry left. Such a task can never complete.
fn is_dead(
    tasks: &HashMap<TaskId, Task>,
    retries: &HashMap<TaskId, DateTime<Utc>>,
    id: &TaskId,
) -> bool {
    match tasks.get(id).map(|t| t.status) {
        Some(TaskStatus::Cancelled) => true,
        Some(TaskStatus::Failed) => !retries.contains_key(id),
        _ => false,
    }
}

fn retry_due_at(now: DateTime<Utc>, delay_ms: u64) -> DateTime<Utc> {
    i64::try_from(delay_ms)
        .ok()
        .and_then(Duration::try_milliseconds)
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// In-memory orchestration engine for agents, tasks and goals.
///
/// One instance is built by the composition root and shared via `Arc`.
/// The periodic loops are plain methods ([`run_dispatch_cycle`],
/// [`run_health_check`], [`collect_metrics`]) so tests can drive them
/// directly; [`crate::scheduler::EngineRuntime`] runs them on timers.
///
/// Unknown agent, task or goal ids are ignored rather than reported.
///
/// [`run_dispatch_cycle`]: OrchestrationEngine::run_dispatch_cycle
/// [`run_health_check`]: OrchestrationEngine::run_health_check
/// [`collect_metrics`]: OrchestrationEngine::collect_metrics
pub struct OrchestrationEngine {
    state: RwLock<EngineState>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    analytics: Arc<dyn AnalyticsSink>,
}

impl OrchestrationEngine {
    /// Create an engine on the system clock, logging metrics via tracing.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            state: RwLock::new(EngineState::default()),
            events: EventBus::new(),
            clock: Arc::new(SystemClock),
            config,
            analytics: Arc::new(TracingAnalytics),
        }
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the metrics collaborator.
    pub fn with_analytics(mut self, analytics: Arc<dyn AnalyticsSink>) -> Self {
        self.analytics = analytics;
        self
    }

    /// Timing configuration the engine was built with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The bus every engine event is published on.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Shorthand for `events().on(..)`.
    pub fn on<F>(&self, topic: EventTopic, handler: F) -> Subscription
    where
        F: Fn(&EngineEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.events.on(topic, handler)
    }

    fn publish(&self, out: Outbox) {
        for event in &out {
            self.events.emit(event);
        }
    }

    // --- Agents ---

    /// Register an agent with a zeroed performance block. Re-registering an
    /// id replaces the record after reassigning the tasks it held.
    pub async fn register_agent(&self, spec: AgentSpec) {
        let now = self.clock.now();
        let mut out = Outbox::new();
        {
            let mut guard = self.state.write().await;
            let state = &mut *guard;
            if let Some(previous) = state.agents.get(&spec.id) {
                warn!(agent_id = %spec.id, "Agent re-registered, replacing previous record");
                let held = previous.current_tasks.clone();
                for task_id in &held {
                    state.reassign(task_id, now, &self.config, &mut out);
                }
            }
            if !spec.current_tasks.is_empty() {
                warn!(
                    agent_id = %spec.id,
                    ignored = spec.current_tasks.len(),
                    "Ignoring tasks listed at registration"
                );
            }
            let agent = Agent::from_spec(spec, now);
            info!(agent_id = %agent.id, kind = %agent.kind, "Agent registered");
            out.push(EngineEvent::AgentRegistered {
                agent_id: agent.id.clone(),
            });
            state.agents.insert(agent.id.clone(), agent);
        }
        self.publish(out);
    }

    /// Reassign the agent's tasks, then remove it.
    pub async fn unregister_agent(&self, agent_id: &AgentId) {
        let now = self.clock.now();
        let mut out = Outbox::new();
        {
            let mut guard = self.state.write().await;
            let state = &mut *guard;
            let Some(agent) = state.agents.get(agent_id) else {
                debug!(agent_id = %agent_id, "Unregister ignored: unknown agent");
                return;
            };
            let held = agent.current_tasks.clone();
            for task_id in &held {
                state.reassign(task_id, now, &self.config, &mut out);
            }
            // Retries still pointing at this agent fire now instead of later.
            let mut orphaned: Vec<TaskId> = state
                .retries
                .keys()
                .filter(|id| {
                    state
                        .tasks
                        .get(*id)
                        .is_some_and(|t| t.assigned_agent.as_ref() == Some(agent_id))
                })
                .cloned()
                .collect();
            orphaned.sort();
            for task_id in &orphaned {
                state.reassign(task_id, now, &self.config, &mut out);
            }
            state.agents.remove(agent_id);
            info!(agent_id = %agent_id, reassigned = held.len() + orphaned.len(), "Agent unregistered");
            out.push(EngineEvent::AgentUnregistered {
                agent_id: agent_id.clone(),
            });
        }
        self.publish(out);
    }

    /// Set an agent's status and refresh its heartbeat.
    pub async fn update_agent_status(&self, agent_id: &AgentId, status: AgentStatus) {
        let now = self.clock.now();
        let event = {
            let mut state = self.state.write().await;
            let Some(agent) = state.agents.get_mut(agent_id) else {
                debug!(agent_id = %agent_id, "Status update ignored: unknown agent");
                return;
            };
            let old_status = agent.status;
            agent.status = status;
            agent.performance.last_health_check = now;
            debug!(agent_id = %agent_id, old = %old_status, new = %status, "Agent status updated");
            EngineEvent::AgentStatusUpdated {
                agent_id: agent_id.clone(),
                old_status,
                new_status: status,
            }
        };
        self.events.emit(&event);
    }

    /// Refresh an agent's heartbeat. An offline agent comes back as idle,
    /// or busy if it still holds tasks.
    pub async fn heartbeat(&self, agent_id: &AgentId) {
        let now = self.clock.now();
        let mut out = Outbox::new();
        {
            let mut state = self.state.write().await;
            let Some(agent) = state.agents.get_mut(agent_id) else {
                debug!(agent_id = %agent_id, "Heartbeat ignored: unknown agent");
                return;
            };
            agent.performance.last_health_check = now;
            if agent.status == AgentStatus::Offline {
                let new_status = if agent.current_tasks.is_empty() {
                    AgentStatus::Idle
                } else {
                    AgentStatus::Busy
                };
                agent.status = new_status;
                info!(agent_id = %agent_id, status = %new_status, "Agent back online");
                out.push(EngineEvent::AgentStatusUpdated {
                    agent_id: agent_id.clone(),
                    old_status: AgentStatus::Offline,
                    new_status,
                });
            }
            out.push(EngineEvent::AgentHeartbeat {
                agent_id: agent_id.clone(),
            });
        }
        self.publish(out);
    }

    // --- Tasks ---

    /// Create a pending task and queue it for dispatch.
    pub async fn create_task(&self, spec: TaskSpec) -> TaskId {
        let now = self.clock.now();
        let mut out = Outbox::new();
        let id = {
            let mut state = self.state.write().await;
            state.create_task(spec, now, &mut out)
        };
        self.publish(out);
        id
    }

    /// Apply a caller-reported status change.
    ///
    /// Unknown ids are ignored. Transitions the lifecycle does not allow
    /// return [`ConductorError::InvalidTransition`] and change nothing.
    pub async fn update_task_status(
        &self,
        task_id: &TaskId,
        status: TaskStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> ConductorResult<()> {
        let now = self.clock.now();
        let mut out = Outbox::new();
        {
            let mut guard = self.state.write().await;
            let state = &mut *guard;
            let awaiting_retry = state.awaiting_retry(task_id);
            let Some(task) = state.tasks.get_mut(task_id) else {
                debug!(task_id = %task_id, "Status update ignored: unknown task");
                return Ok(());
            };
            let old_status = task.status;
            // A failure with a retry still scheduled is not final yet.
            let cancels_retry = awaiting_retry && status == TaskStatus::Cancelled;
            if !old_status.accepts_update_to(status) && !cancels_retry {
                return Err(ConductorError::InvalidTransition {
                    task_id: task_id.to_string(),
                    from: old_status.to_string(),
                    to: status.to_string(),
                });
            }
            if result.is_some() {
                task.result = result;
            }
            task.updated_at = now;

            out.push(EngineEvent::TaskStatusUpdated {
                task_id: task_id.clone(),
                old_status,
                new_status: status,
            });
            match status {
                TaskStatus::Running => state.mark_running(task_id, now),
                TaskStatus::Completed => state.complete(task_id, now, &mut out),
                TaskStatus::Failed => {
                    let error = error.unwrap_or_else(|| "Task failed".to_string());
                    state.fail_task(task_id, error, now, &self.config, &mut out);
                }
                TaskStatus::Cancelled => {
                    let reason = error.unwrap_or_else(|| "Cancelled on request".to_string());
                    state.cancel(task_id, reason, now, &mut out);
                }
                TaskStatus::Pending | TaskStatus::Assigned => {}
            }
        }
        self.publish(out);
        Ok(())
    }

    /// Cancel a task and every pending task downstream of it. Returns false
    /// for unknown or already finished tasks.
    pub async fn cancel_task(&self, task_id: &TaskId, reason: impl Into<String>) -> bool {
        let now = self.clock.now();
        let mut out = Outbox::new();
        let cancelled = {
            let mut state = self.state.write().await;
            state.cancel(task_id, reason.into(), now, &mut out)
        };
        self.publish(out);
        cancelled
    }

    /// Put an assigned, running or retry-pending task back in the queue,
    /// counting one retry. Fails the task once its retry budget is spent.
    pub async fn reassign_task(&self, task_id: &TaskId) -> bool {
        let now = self.clock.now();
        let mut out = Outbox::new();
        let requeued = {
            let mut state = self.state.write().await;
            state.reassign(task_id, now, &self.config, &mut out)
        };
        self.publish(out);
        requeued
    }

    /// Run retry reassignments whose backoff has elapsed.
    pub async fn fire_due_retries(&self) -> usize {
        let now = self.clock.now();
        let mut out = Outbox::new();
        let fired = {
            let mut state = self.state.write().await;
            state.fire_due_retries(now, &self.config, &mut out)
        };
        self.publish(out);
        fired
    }

    /// When a task's pending retry becomes due, if one is scheduled.
    pub async fn retry_due_at(&self, task_id: &TaskId) -> Option<DateTime<Utc>> {
        self.state.read().await.retries.get(task_id).copied()
    }

    // --- Goals ---

    /// Create a goal in its initial status. Tasks are only created by
    /// [`OrchestrationEngine::decompose_goal`].
    pub async fn create_goal(&self, spec: GoalSpec) -> GoalId {
        let now = self.clock.now();
        let id = GoalId::generate(now);
        {
            let mut state = self.state.write().await;
            let goal = Goal::from_spec(id.clone(), spec, now);
            info!(goal_id = %id, name = %goal.name, "Goal created");
            state.goals.insert(id.clone(), goal);
        }
        self.events.emit(&EngineEvent::GoalCreated {
            goal_id: id.clone(),
        });
        id
    }

    /// Create one task per planned task type and move the goal to
    /// `executing`. Unknown goals yield no tasks; a goal that was already
    /// decomposed is an error.
    pub async fn decompose_goal(&self, goal_id: &GoalId) -> ConductorResult<Vec<TaskId>> {
        let now = self.clock.now();
        let mut out = Outbox::new();
        let task_ids = {
            let mut guard = self.state.write().await;
            let state = &mut *guard;
            let Some(goal) = state.goals.get(goal_id) else {
                debug!(goal_id = %goal_id, "Decompose ignored: unknown goal");
                return Ok(Vec::new());
            };
            let task_types = match &goal.work {
                GoalWork::Planned { task_types } => task_types.clone(),
                GoalWork::Decomposed { .. } => {
                    return Err(ConductorError::GoalState(format!(
                        "goal {goal_id} is already decomposed"
                    )));
                }
            };
            let priority = goal.priority;

            let mut task_ids = Vec::with_capacity(task_types.len());
            for task_type in task_types {
                let spec = TaskSpec::new(task_type, priority)
                    .with_payload("goalId", serde_json::Value::String(goal_id.to_string()))
                    .with_max_retries(DEFAULT_MAX_RETRIES);
                task_ids.push(state.create_task(spec, now, &mut out));
            }

            if let Some(goal) = state.goals.get_mut(goal_id) {
                goal.work = GoalWork::Decomposed {
                    task_ids: task_ids.clone(),
                };
                goal.status = GoalStatus::Executing;
                info!(goal_id = %goal_id, tasks = task_ids.len(), "Goal decomposed");
                out.push(EngineEvent::GoalDecomposed {
                    goal_id: goal_id.clone(),
                    task_ids: task_ids.clone(),
                });
                if task_ids.is_empty() {
                    goal.status = GoalStatus::Completed;
                    goal.progress = 1.0;
                    out.push(EngineEvent::GoalCompleted {
                        goal_id: goal_id.clone(),
                    });
                    out.push(EngineEvent::GoalProgressUpdated {
                        goal_id: goal_id.clone(),
                        progress: 1.0,
                    });
                }
            }
            task_ids
        };
        self.publish(out);
        Ok(task_ids)
    }

    // --- Loops ---

    /// One dispatch pass: fire due retries, then hand every ready task (by
    /// priority, then age) to the fittest qualifying agent. Returns the
    /// assignments made.
    pub async fn run_dispatch_cycle(&self) -> Vec<(TaskId, AgentId)> {
        let now = self.clock.now();
        let mut out = Outbox::new();
        let mut assignments = Vec::new();
        {
            let mut guard = self.state.write().await;
            let state = &mut *guard;
            state.fire_due_retries(now, &self.config, &mut out);
            state.queue.prune(&state.tasks);

            for task_id in state.queue.ready(&state.tasks) {
                let Some(task) = state.tasks.get(&task_id) else {
                    continue;
                };
                let Some((agent, score)) = select_agent(state.agents.values(), task) else {
                    debug!(task_id = %task_id, "No suitable agent, task stays pending");
                    continue;
                };
                let agent_id = agent.id.clone();
                state.assign(&task_id, &agent_id, score, now, &mut out);
                assignments.push((task_id, agent_id));
            }
        }
        self.publish(out);
        assignments
    }

    /// Mark agents with a stale heartbeat offline and reassign their tasks.
    /// Returns the agents taken offline.
    pub async fn run_health_check(&self) -> Vec<AgentId> {
        let now = self.clock.now();
        let timeout_ms = i64::try_from(self.config.heartbeat_timeout_ms).unwrap_or(i64::MAX);
        let mut out = Outbox::new();
        let stale = {
            let mut guard = self.state.write().await;
            let state = &mut *guard;
            let stale: Vec<AgentId> = state
                .agents
                .values()
                .filter(|a| a.status != AgentStatus::Offline)
                .filter(|a| (now - a.performance.last_health_check).num_milliseconds() > timeout_ms)
                .map(|a| a.id.clone())
                .collect();

            for agent_id in &stale {
                let Some(agent) = state.agents.get_mut(agent_id) else {
                    continue;
                };
                agent.status = AgentStatus::Offline;
                let held = agent.current_tasks.clone();
                let last_health_check = agent.performance.last_health_check;
                warn!(agent_id = %agent_id, last_seen = %last_health_check, tasks = held.len(), "Agent health check failed");
                out.push(EngineEvent::AgentHealthCheckFailed {
                    agent_id: agent_id.clone(),
                    last_health_check,
                    reassigned_tasks: held.clone(),
                });
                for task_id in &held {
                    state.reassign(task_id, now, &self.config, &mut out);
                }
                if let Some(agent) = state.agents.get_mut(agent_id) {
                    agent.current_tasks.clear();
                }
            }
            stale
        };
        self.publish(out);
        stale
    }

    /// Aggregate system metrics, publish them and forward them to the
    /// analytics sink.
    pub async fn collect_metrics(&self) -> SystemMetrics {
        let now = self.clock.now();
        let metrics = {
            let mut state = self.state.write().await;
            let metrics = SystemMetrics::aggregate(state.agents.values(), state.tasks.values(), now);
            state.last_metrics = Some(metrics.clone());
            metrics
        };
        self.events.emit(&EngineEvent::SystemPerformanceUpdated {
            metrics: metrics.clone(),
        });
        self.analytics.record_metrics(&metrics).await;
        metrics
    }

    // --- Queries ---

    /// Snapshot of one agent.
    pub async fn get_agent(&self, agent_id: &AgentId) -> Option<Agent> {
        self.state.read().await.agents.get(agent_id).cloned()
    }

    /// Snapshot of one task.
    pub async fn get_task(&self, task_id: &TaskId) -> Option<Task> {
        self.state.read().await.tasks.get(task_id).cloned()
    }

    /// Snapshot of one goal.
    pub async fn get_goal(&self, goal_id: &GoalId) -> Option<Goal> {
        self.state.read().await.goals.get(goal_id).cloned()
    }

    /// All agents in id order.
    pub async fn get_all_agents(&self) -> Vec<Agent> {
        self.state.read().await.agents.values().cloned().collect()
    }

    /// All tasks, oldest first.
    pub async fn get_all_tasks(&self) -> Vec<Task> {
        let state = self.state.read().await;
        let mut tasks: Vec<Task> = state.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        tasks
    }

    /// All goals, oldest first.
    pub async fn get_all_goals(&self) -> Vec<Goal> {
        let state = self.state.read().await;
        let mut goals: Vec<Goal> = state.goals.values().cloned().collect();
        goals.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        goals
    }

    /// Deterministic counts by status, queue length and the latest metrics.
    pub async fn get_system_status(&self) -> SystemStatus {
        let state = self.state.read().await;
        SystemStatus::collect(
            state.agents.values(),
            state.tasks.values(),
            state.goals.values(),
            state.queue.len(),
            state.retries.len(),
            state.last_metrics.clone(),
        )
    }

    /// Full state as JSON for a dashboard.
    pub async fn dashboard_json(&self) -> serde_json::Value {
        let status = self.get_system_status().await;
        let agents = self.get_all_agents().await;
        let tasks = self.get_all_tasks().await;
        let goals = self.get_all_goals().await;
        serde_json::json!({
            "status": status,
            "agents": agents,
            "tasks": tasks,
            "goals": goals,
        })
    }
}

use crate::monitor::SystemMetrics;
use crate::types::{AgentStatus, TaskPriority, TaskStatus, TaskType};
use chrono::{DateTime, Utc};
use conductor_core::{AgentId, GoalId, TaskId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{error, warn};

/// Named topics on the engine's event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventTopic {
    /// `agent:registered`
    AgentRegistered,
    /// `agent:unregistered`
    AgentUnregistered,
    /// `agent:status-updated`
    AgentStatusUpdated,
    /// `agent:heartbeat`
    AgentHeartbeat,
    /// `agent:health-check-failed`
    AgentHealthCheckFailed,
    /// `task:created`
    TaskCreated,
    /// `task:assigned`
    TaskAssigned,
    /// `task:status-updated`
    TaskStatusUpdated,
    /// `task:retry-scheduled`
    TaskRetryScheduled,
    /// `task:reassigned`
    TaskReassigned,
    /// `task:failed`
    TaskFailed,
    /// `task:cancelled`
    TaskCancelled,
    /// `goal:created`
    GoalCreated,
    /// `goal:decomposed`
    GoalDecomposed,
    /// `goal:progress-updated`
    GoalProgressUpdated,
    /// `goal:completed`
    GoalCompleted,
    /// `goal:failed`
    GoalFailed,
    /// `system:performance-updated`
    SystemPerformanceUpdated,
}

impl EventTopic {
    /// Wire name of the topic, e.g. `task:assigned`.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventTopic::AgentRegistered => "agent:registered",
            EventTopic::AgentUnregistered => "agent:unregistered",
            EventTopic::AgentStatusUpdated => "agent:status-updated",
            EventTopic::AgentHeartbeat => "agent:heartbeat",
            EventTopic::AgentHealthCheckFailed => "agent:health-check-failed",
            EventTopic::TaskCreated => "task:created",
            EventTopic::TaskAssigned => "task:assigned",
            EventTopic::TaskStatusUpdated => "task:status-updated",
            EventTopic::TaskRetryScheduled => "task:retry-scheduled",
            EventTopic::TaskReassigned => "task:reassigned",
            EventTopic::TaskFailed => "task:failed",
            EventTopic::TaskCancelled => "task:cancelled",
            EventTopic::GoalCreated => "goal:created",
            EventTopic::GoalDecomposed => "goal:decomposed",
            EventTopic::GoalProgressUpdated => "goal:progress-updated",
            EventTopic::GoalCompleted => "goal:completed",
            EventTopic::GoalFailed => "goal:failed",
            EventTopic::SystemPerformanceUpdated => "system:performance-updated",
        }
    }
}

impl fmt::Display for EventTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the engine announces to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// An agent was added or replaced.
    AgentRegistered {
        /// Registered agent.
        agent_id: AgentId,
    },
    /// An agent was removed after its tasks were requeued.
    AgentUnregistered {
        /// Removed agent.
        agent_id: AgentId,
    },
    /// An agent's status changed.
    AgentStatusUpdated {
        /// Agent whose status changed.
        agent_id: AgentId,
        /// Status before the change.
        old_status: AgentStatus,
        /// Status after the change.
        new_status: AgentStatus,
    },
    /// An agent reported in.
    AgentHeartbeat {
        /// Agent that reported in.
        agent_id: AgentId,
    },
    /// An agent missed its heartbeat window and went offline.
    AgentHealthCheckFailed {
        /// Agent taken offline.
        agent_id: AgentId,
        /// Last time the agent was heard from.
        last_health_check: DateTime<Utc>,
        /// Tasks it held, now requeued or failed.
        reassigned_tasks: Vec<TaskId>,
    },
    /// A task was created and queued.
    TaskCreated {
        /// New task.
        task_id: TaskId,
        /// Its type.
        task_type: TaskType,
        /// Its priority.
        priority: TaskPriority,
    },
    /// The dispatcher handed a task to an agent.
    TaskAssigned {
        /// Assigned task.
        task_id: TaskId,
        /// Chosen agent.
        agent_id: AgentId,
        /// Fitness score that won the assignment.
        score: f64,
    },
    /// A caller-reported status change was accepted.
    TaskStatusUpdated {
        /// Updated task.
        task_id: TaskId,
        /// Status before the update.
        old_status: TaskStatus,
        /// Requested status.
        new_status: TaskStatus,
    },
    /// A failed task will be reassigned once its backoff elapses.
    TaskRetryScheduled {
        /// Failed task.
        task_id: TaskId,
        /// Attempt number the retry will start.
        retry_count: u32,
        /// Earliest time the retry fires.
        due_at: DateTime<Utc>,
    },
    /// A task went back to the queue.
    TaskReassigned {
        /// Requeued task.
        task_id: TaskId,
        /// Agent that held it, if any.
        previous_agent: Option<AgentId>,
        /// Retries used so far, including this one.
        retry_count: u32,
    },
    /// A task failed.
    TaskFailed {
        /// Failed task.
        task_id: TaskId,
        /// Reported failure.
        error: String,
    },
    /// A task was cancelled, directly or by a dependency.
    TaskCancelled {
        /// Cancelled task.
        task_id: TaskId,
        /// Why it was cancelled.
        reason: String,
    },
    /// A goal was created in `planning`.
    GoalCreated {
        /// New goal.
        goal_id: GoalId,
    },
    /// A goal was expanded into tasks.
    GoalDecomposed {
        /// Decomposed goal.
        goal_id: GoalId,
        /// Tasks created for it, in planned order.
        task_ids: Vec<TaskId>,
    },
    /// A goal's progress was recomputed.
    GoalProgressUpdated {
        /// Goal concerned.
        goal_id: GoalId,
        /// Completed fraction in `[0, 1]`.
        progress: f64,
    },
    /// Every member task of a goal completed.
    GoalCompleted {
        /// Completed goal.
        goal_id: GoalId,
    },
    /// A member task can no longer complete, so neither can the goal.
    GoalFailed {
        /// Failed goal.
        goal_id: GoalId,
        /// Member task that failed or was cancelled.
        task_id: TaskId,
    },
    /// The metrics loop aggregated a new snapshot.
    SystemPerformanceUpdated {
        /// The snapshot.
        metrics: SystemMetrics,
    },
}

impl EngineEvent {
    /// Topic this event is published under.
    pub fn topic(&self) -> EventTopic {
        match self {
            EngineEvent::AgentRegistered { .. } => EventTopic::AgentRegistered,
            EngineEvent::AgentUnregistered { .. } => EventTopic::AgentUnregistered,
            EngineEvent::AgentStatusUpdated { .. } => EventTopic::AgentStatusUpdated,
            EngineEvent::AgentHeartbeat { .. } => EventTopic::AgentHeartbeat,
            EngineEvent::AgentHealthCheckFailed { .. } => EventTopic::AgentHealthCheckFailed,
            EngineEvent::TaskCreated { .. } => EventTopic::TaskCreated,
            EngineEvent::TaskAssigned { .. } => EventTopic::TaskAssigned,
            EngineEvent::TaskStatusUpdated { .. } => EventTopic::TaskStatusUpdated,
            EngineEvent::TaskRetryScheduled { .. } => EventTopic::TaskRetryScheduled,
            EngineEvent::TaskReassigned { .. } => EventTopic::TaskReassigned,
            EngineEvent::TaskFailed { .. } => EventTopic::TaskFailed,
            EngineEvent::TaskCancelled { .. } => EventTopic::TaskCancelled,
            EngineEvent::GoalCreated { .. } => EventTopic::GoalCreated,
            EngineEvent::GoalDecomposed { .. } => EventTopic::GoalDecomposed,
            EngineEvent::GoalProgressUpdated { .. } => EventTopic::GoalProgressUpdated,
            EngineEvent::GoalCompleted { .. } => EventTopic::GoalCompleted,
            EngineEvent::GoalFailed { .. } => EventTopic::GoalFailed,
            EngineEvent::SystemPerformanceUpdated { .. } => EventTopic::SystemPerformanceUpdated,
        }
    }
}

/// Error type handlers may return; it is logged and otherwise ignored.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A subscriber callback.
pub type EventHandler = Arc<dyn Fn(&EngineEvent) -> Result<(), HandlerError> + Send + Sync>;

struct Registration {
    id: u64,
    /// `None` subscribes to every topic.
    topic: Option<EventTopic>,
    handler: EventHandler,
}

#[derive(Default)]
struct BusInner {
    next_id: AtomicU64,
    handlers: RwLock<Vec<Registration>>,
}

/// In-process publish/subscribe bus keyed by [`EventTopic`].
///
/// A handler that returns an error or panics is logged and skipped; the
/// remaining handlers still run.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// An empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to one topic.
    pub fn on<F>(&self, topic: EventTopic, handler: F) -> Subscription
    where
        F: Fn(&EngineEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.register(Some(topic), Arc::new(handler))
    }

    /// Subscribe to every topic.
    pub fn on_all<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&EngineEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.register(None, Arc::new(handler))
    }

    fn register(&self, topic: Option<EventTopic>, handler: EventHandler) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.handlers.write().push(Registration { id, topic, handler });
        Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver an event to its subscribers. Returns how many handlers
    /// completed without error.
    pub fn emit(&self, event: &EngineEvent) -> usize {
        let topic = event.topic();
        // Snapshot so handlers may subscribe or unsubscribe while running.
        let handlers: Vec<EventHandler> = self
            .inner
            .handlers
            .read()
            .iter()
            .filter(|r| r.topic.map_or(true, |t| t == topic))
            .map(|r| Arc::clone(&r.handler))
            .collect();

        let mut delivered = 0;
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => warn!(topic = %topic, error = %e, "Event handler failed"),
                Err(_) => error!(topic = %topic, "Event handler panicked"),
            }
        }
        delivered
    }

    /// Number of live subscriptions.
    pub fn handler_count(&self) -> usize {
        self.inner.handlers.read().len()
    }
}

/// Handle returned by [`EventBus::on`]; call [`Subscription::unsubscribe`]
/// to stop receiving events. Dropping the handle keeps the subscription.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    bus: Weak<BusInner>,
}

impl Subscription {
    /// Remove the handler. Returns false if the bus is gone or the handler
    /// was already removed.
    pub fn unsubscribe(self) -> bool {
        let Some(bus) = self.bus.upgrade() else {
            return false;
        };
        let mut handlers = bus.handlers.write();
        let before = handlers.len();
        handlers.retain(|r| r.id != self.id);
        handlers.len() != before
    }
}

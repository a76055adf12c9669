use crate::types::{Agent, AgentStatus, Goal, Task, TaskStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

/// Aggregate figures produced by the metrics loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    /// Registered agents.
    pub total_agents: usize,
    /// Agents that can be reached: active, idle or busy.
    pub reachable_agents: usize,
    /// Tasks ever created.
    pub total_tasks: usize,
    /// Tasks in `completed`.
    pub completed_tasks: usize,
    /// Tasks in `failed`, including those awaiting a retry.
    pub failed_tasks: usize,
    /// Mean `actual_duration_ms` over completed tasks that recorded one.
    pub average_task_duration_ms: f64,
    /// `failed / (failed + completed)`, or 0 when neither has happened.
    pub system_error_rate: f64,
    /// When the figures were aggregated.
    pub timestamp: DateTime<Utc>,
}

impl SystemMetrics {
    /// Aggregate figures over the given agents and tasks.
    pub fn aggregate<'a>(
        agents: impl IntoIterator<Item = &'a Agent>,
        tasks: impl IntoIterator<Item = &'a Task>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut total_agents = 0;
        let mut reachable_agents = 0;
        for agent in agents {
            total_agents += 1;
            if matches!(
                agent.status,
                AgentStatus::Active | AgentStatus::Idle | AgentStatus::Busy
            ) {
                reachable_agents += 1;
            }
        }

        let mut total_tasks = 0;
        let mut completed_tasks = 0;
        let mut failed_tasks = 0;
        let mut duration_sum = 0u64;
        let mut duration_count = 0u64;
        for task in tasks {
            total_tasks += 1;
            match task.status {
                TaskStatus::Completed => {
                    completed_tasks += 1;
                    if let Some(ms) = task.actual_duration_ms {
                        duration_sum = duration_sum.saturating_add(ms);
                        duration_count += 1;
                    }
                }
                TaskStatus::Failed => failed_tasks += 1,
                _ => {}
            }
        }

        let average_task_duration_ms = if duration_count == 0 {
            0.0
        } else {
            duration_sum as f64 / duration_count as f64
        };
        let finished = completed_tasks + failed_tasks;
        let system_error_rate = if finished == 0 {
            0.0
        } else {
            failed_tasks as f64 / finished as f64
        };

        Self {
            total_agents,
            reachable_agents,
            total_tasks,
            completed_tasks,
            failed_tasks,
            average_task_duration_ms,
            system_error_rate,
            timestamp: now,
        }
    }
}

/// Point-in-time view of the engine for dashboards.
///
/// Contains no wall-clock reading of its own, so two snapshots taken
/// without an intervening mutation compare equal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemStatus {
    /// Registered agents.
    pub total_agents: usize,
    /// Tasks ever created.
    pub total_tasks: usize,
    /// Goals ever created.
    pub total_goals: usize,
    /// Agent count per status name.
    pub agents_by_status: BTreeMap<String, usize>,
    /// Task count per status name.
    pub tasks_by_status: BTreeMap<String, usize>,
    /// Goal count per status name.
    pub goals_by_status: BTreeMap<String, usize>,
    /// Task ids waiting in the dispatch queue.
    pub queue_length: usize,
    /// Failed tasks with a retry scheduled.
    pub pending_retries: usize,
    /// Latest metrics loop output, if it has run.
    pub last_metrics: Option<SystemMetrics>,
}

impl SystemStatus {
    /// Count entities by status.
    pub fn collect<'a>(
        agents: impl IntoIterator<Item = &'a Agent>,
        tasks: impl IntoIterator<Item = &'a Task>,
        goals: impl IntoIterator<Item = &'a Goal>,
        queue_length: usize,
        pending_retries: usize,
        last_metrics: Option<SystemMetrics>,
    ) -> Self {
        let mut agents_by_status = BTreeMap::new();
        let mut total_agents = 0;
        for agent in agents {
            total_agents += 1;
            *agents_by_status
                .entry(agent.status.as_str().to_string())
                .or_insert(0) += 1;
        }

        let mut tasks_by_status = BTreeMap::new();
        let mut total_tasks = 0;
        for task in tasks {
            total_tasks += 1;
            *tasks_by_status
                .entry(task.status.as_str().to_string())
                .or_insert(0) += 1;
        }

        let mut goals_by_status = BTreeMap::new();
        let mut total_goals = 0;
        for goal in goals {
            total_goals += 1;
            *goals_by_status
                .entry(goal.status.as_str().to_string())
                .or_insert(0) += 1;
        }

        Self {
            total_agents,
            total_tasks,
            total_goals,
            agents_by_status,
            tasks_by_status,
            goals_by_status,
            queue_length,
            pending_retries,
            last_metrics,
        }
    }
}

/// External consumer of aggregated metrics (analytics, dashboards).
#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    /// Receive one aggregated snapshot.
    async fn record_metrics(&self, metrics: &SystemMetrics);
}

/// Default sink: writes the metrics to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAnalytics;

#[async_trait]
impl AnalyticsSink for TracingAnalytics {
    async fn record_metrics(&self, metrics: &SystemMetrics) {
        info!(
            total_agents = metrics.total_agents,
            reachable_agents = metrics.reachable_agents,
            total_tasks = metrics.total_tasks,
            completed = metrics.completed_tasks,
            failed = metrics.failed_tasks,
            avg_duration_ms = metrics.average_task_duration_ms,
            error_rate = metrics.system_error_rate,
            "System performance"
        );
    }
}

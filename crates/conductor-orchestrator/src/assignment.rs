//! Task-to-agent matching.
//!
//! An agent qualifies for a task when it is `active` or `idle` and its
//! capability set covers the task's required capabilities. Among qualifying
//! agents the highest fitness score wins:
//!
//! ```text
//! availability + (1 - error_rate) * 5
//!     + max(0, 5 - avg_response_ms / 1000)
//!     - current_tasks * 2
//!     + min(extra_capabilities, 3)
//! ```

use crate::types::{Agent, AgentStatus, Task};

const IDLE_BONUS: f64 = 10.0;
const ACTIVE_EMPTY_BONUS: f64 = 8.0;
const RELIABILITY_WEIGHT: f64 = 5.0;
const RESPONSE_CEILING: f64 = 5.0;
const LOAD_PENALTY: f64 = 2.0;
const MAX_EXTRA_CAPABILITIES: usize = 3;

/// Fitness of `agent` for `task`. Higher is better.
pub fn fitness_score(agent: &Agent, task: &Task) -> f64 {
    let availability = match agent.status {
        AgentStatus::Idle => IDLE_BONUS,
        AgentStatus::Active if agent.current_tasks.is_empty() => ACTIVE_EMPTY_BONUS,
        _ => 0.0,
    };
    let reliability = (1.0 - agent.performance.error_rate) * RELIABILITY_WEIGHT;
    let speed =
        (RESPONSE_CEILING - agent.performance.average_response_time_ms / 1000.0).max(0.0);
    let load = agent.current_tasks.len() as f64 * LOAD_PENALTY;
    let extra = agent
        .capabilities
        .iter()
        .filter(|cap| !task.required_capabilities.contains(*cap))
        .count()
        .min(MAX_EXTRA_CAPABILITIES) as f64;

    availability + reliability + speed - load + extra
}

/// Pick the best qualifying agent for `task`, with its score.
///
/// Ties go to the agent seen first, so callers iterating a sorted map get
/// a deterministic winner.
pub fn select_agent<'a, I>(agents: I, task: &Task) -> Option<(&'a Agent, f64)>
where
    I: IntoIterator<Item = &'a Agent>,
{
    let mut best: Option<(&'a Agent, f64)> = None;
    for agent in agents {
        if !agent.is_available() || !agent.covers(&task.required_capabilities) {
            continue;
        }
        let score = fitness_score(agent, task);
        match best {
            Some((_, best_score)) if score <= best_score => {}
            _ => best = Some((agent, score)),
        }
    }
    best
}

use crate::types::{Task, TaskStatus};
use conductor_core::TaskId;
use std::collections::{BTreeSet, HashMap, VecDeque};

/// FIFO of task ids waiting for dispatch, plus the reverse dependency index
/// (task id -> ids of tasks that depend on it).
///
/// The index is derived data: [`TaskQueue::rebuild_index`] reconstructs it
/// from `Task::dependencies` alone.
#[derive(Debug, Default)]
pub struct TaskQueue {
    order: VecDeque<TaskId>,
    dependents: HashMap<TaskId, BTreeSet<TaskId>>,
}

impl TaskQueue {
    /// An empty queue and index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a task id unless it is already queued.
    pub fn enqueue(&mut self, id: TaskId) -> bool {
        if self.order.contains(&id) {
            return false;
        }
        self.order.push_back(id);
        true
    }

    /// Remove a task id from the queue.
    pub fn remove(&mut self, id: &TaskId) -> bool {
        let before = self.order.len();
        self.order.retain(|queued| queued != id);
        self.order.len() != before
    }

    /// Whether the id is queued.
    pub fn contains(&self, id: &TaskId) -> bool {
        self.order.contains(id)
    }

    /// Number of queued ids.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Record that `task_id` depends on each of `dependencies`.
    pub fn index_dependencies(&mut self, task_id: &TaskId, dependencies: &[TaskId]) {
        for dep in dependencies {
            self.dependents
                .entry(dep.clone())
                .or_default()
                .insert(task_id.clone());
        }
    }

    /// Direct dependents of a task, in id order.
    pub fn dependents_of(&self, id: &TaskId) -> Vec<TaskId> {
        self.dependents
            .get(id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Rebuild the dependency index from scratch.
    pub fn rebuild_index<'a>(&mut self, tasks: impl IntoIterator<Item = &'a Task>) {
        self.dependents.clear();
        for task in tasks {
            self.index_dependencies(&task.id, &task.dependencies);
        }
    }

    /// Drop queued ids that no longer refer to a pending task.
    pub fn prune(&mut self, tasks: &HashMap<TaskId, Task>) {
        self.order.retain(|id| {
            tasks
                .get(id)
                .is_some_and(|t| t.status == TaskStatus::Pending)
        });
    }

    /// Queued tasks whose dependencies are all completed, ordered by
    /// priority (critical first) and then by creation time.
    pub fn ready(&self, tasks: &HashMap<TaskId, Task>) -> Vec<TaskId> {
        let is_completed = |id: &TaskId| {
            tasks
                .get(id)
                .is_some_and(|t| t.status == TaskStatus::Completed)
        };
        let mut ready: Vec<&Task> = self
            .order
            .iter()
            .filter_map(|id| tasks.get(id))
            .filter(|t| t.is_ready(is_completed))
            .collect();
        // Stable sort keeps queue order for equal keys.
        ready.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        ready.into_iter().map(|t| t.id.clone()).collect()
    }
}

//! Session task tree: a flat id-indexed map with parent and dependency
//! edges as indices, never owning references. Construction validates
//! acyclicity; ready-set queries preserve FIFO insertion order.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::{EngineError, Result};
use crate::session::AgentState;

use super::{Task, TaskResult};

#[derive(Debug, Default)]
pub struct TaskTree {
    nodes: HashMap<String, Task>,
    /// Insertion order, used for FIFO scheduling (ties broken by id at
    /// insertion since ids are appended in creation order).
    order: Vec<String>,
}

impl TaskTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a tree from a persisted task list, preserving order.
    pub fn from_tasks(tasks: Vec<Task>) -> Self {
        let mut tree = Self::new();
        for task in tasks {
            tree.order.push(task.id.clone());
            tree.nodes.insert(task.id.clone(), task);
        }
        tree
    }

    /// Inserts a task, validating that its parent and dependencies exist
    /// and that no dependency cycle is introduced.
    pub fn insert(&mut self, task: Task) -> Result<()> {
        if self.nodes.contains_key(&task.id) {
            return Err(EngineError::InvalidTaskGraph(format!(
                "duplicate task id: {}",
                task.id
            )));
        }
        if let Some(parent) = &task.parent_id
            && !self.nodes.contains_key(parent)
        {
            return Err(EngineError::InvalidTaskGraph(format!(
                "unknown parent: {} for task {}",
                parent, task.id
            )));
        }
        for dep in &task.dependencies {
            if dep == &task.id {
                return Err(EngineError::InvalidTaskGraph(format!(
                    "task {} depends on itself",
                    task.id
                )));
            }
            if !self.nodes.contains_key(dep) {
                return Err(EngineError::InvalidTaskGraph(format!(
                    "unknown dependency: {} for task {}",
                    dep, task.id
                )));
            }
        }
        if self.would_create_cycle(&task.id, &task.dependencies) {
            return Err(EngineError::InvalidTaskGraph(format!(
                "dependency cycle through task {}",
                task.id
            )));
        }

        self.order.push(task.id.clone());
        self.nodes.insert(task.id.clone(), task);
        Ok(())
    }

    fn would_create_cycle(&self, id: &str, dependencies: &[String]) -> bool {
        // BFS from each dependency through existing dependency edges.
        let mut visited = HashSet::new();
        let mut queue: VecDeque<&str> = dependencies.iter().map(|s| s.as_str()).collect();
        while let Some(current) = queue.pop_front() {
            if current == id {
                return true;
            }
            if visited.insert(current)
                && let Some(node) = self.nodes.get(current)
            {
                for dep in &node.dependencies {
                    queue.push_back(dep);
                }
            }
        }
        false
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.nodes.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.nodes.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Tasks whose dependencies are all in terminal success, in FIFO
    /// insertion order. Only idle tasks are ready.
    pub fn ready_tasks(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| {
                let Some(task) = self.nodes.get(*id) else {
                    return false;
                };
                task.status == AgentState::Idle
                    && task.dependencies.iter().all(|dep| {
                        self.nodes
                            .get(dep)
                            .map(|d| d.status.is_success())
                            .unwrap_or(false)
                    })
            })
            .cloned()
            .collect()
    }

    /// Non-terminal tasks blocked behind a failed or interrupted dependency.
    pub fn blocked_tasks(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| {
                let Some(task) = self.nodes.get(*id) else {
                    return false;
                };
                !task.is_terminal()
                    && task.dependencies.iter().any(|dep| {
                        self.nodes
                            .get(dep)
                            .map(|d| d.is_terminal() && !d.status.is_success())
                            .unwrap_or(false)
                    })
            })
            .cloned()
            .collect()
    }

    pub fn running_tasks(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| {
                self.nodes
                    .get(*id)
                    .map(|t| t.status.is_active())
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    pub fn children_of(&self, parent_id: &str) -> Vec<&Task> {
        self.order
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .filter(|t| t.parent_id.as_deref() == Some(parent_id))
            .collect()
    }

    /// Weighted mean of direct children progress; leaf tasks report their
    /// own progress. Propagates bottom-up through the parent chain.
    pub fn rolled_progress(&self, id: &str) -> f64 {
        let children = self.children_of(id);
        if children.is_empty() {
            return self.nodes.get(id).map(|t| t.progress).unwrap_or(0.0);
        }
        let total_weight: f64 = children.iter().map(|c| c.weight).sum();
        if total_weight <= 0.0 {
            return 0.0;
        }
        children
            .iter()
            .map(|c| self.rolled_progress(&c.id) * c.weight)
            .sum::<f64>()
            / total_weight
    }

    /// Updates a parent's stored progress from its children and returns it.
    pub fn roll_up(&mut self, id: &str) -> f64 {
        let value = self.rolled_progress(id);
        if let Some(task) = self.nodes.get_mut(id) {
            task.set_progress(value);
        }
        value
    }

    pub fn start(&mut self, id: &str) -> Result<()> {
        self.with_task(id, |t| t.start())
    }

    pub fn succeed(&mut self, id: &str, result: TaskResult) -> Result<()> {
        self.with_task(id, |t| t.succeed(result))
    }

    pub fn fail(&mut self, id: &str, error: impl Into<String>) -> Result<()> {
        let error = error.into();
        self.with_task(id, |t| t.fail(error))
    }

    pub fn interrupt(&mut self, id: &str) -> Result<()> {
        self.with_task(id, |t| t.interrupt())
    }

    /// Marks a failed task idle again for an in-place retry.
    pub fn reset_for_retry(&mut self, id: &str) -> Result<u32> {
        let task = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| EngineError::InvalidTaskGraph(format!("unknown task: {}", id)))?;
        task.status = AgentState::Idle;
        task.retry_count += 1;
        task.completed_at = None;
        Ok(task.retry_count)
    }

    fn with_task(&mut self, id: &str, f: impl FnOnce(&mut Task)) -> Result<()> {
        let task = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| EngineError::InvalidTaskGraph(format!("unknown task: {}", id)))?;
        f(task);
        Ok(())
    }

    pub fn all_terminal(&self) -> bool {
        self.nodes.values().all(|t| t.is_terminal())
    }

    /// Snapshot of all tasks in insertion order, for persistence.
    pub fn snapshot(&self) -> Vec<Task> {
        self.order
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .cloned()
            .collect()
    }
}

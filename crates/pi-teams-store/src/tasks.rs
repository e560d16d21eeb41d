//! Persistent task list for one `(teamId, taskListId)`.
//!
//! One JSON file mutated read-modify-write under the file lock. The
//! dependency graph is stored as adjacency lists keyed by id; `blockedBy`
//! is authoritative and `blocks` is kept symmetric in the same atomic
//! write. Tasks are never physically deleted; unassignment clears the
//! owner.

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;

use anyhow::{Context, Result};
use pi_teams_core::{subject_of, task_meta, CoordError, Task, TaskStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::lock::{with_lock, LockOptions};
use crate::{now_rfc3339, write_atomic, TeamPaths};

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskListFile {
    #[serde(default)]
    next_id: u64,
    #[serde(default)]
    tasks: Vec<Task>,
}

/// Input for [`TaskStore::create_task`]. The subject defaults to the
/// first line of the description.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub subject: Option<String>,
    pub description: String,
    pub owner: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TaskStore {
    file: PathBuf,
    lock: PathBuf,
}

impl TaskStore {
    pub fn open(paths: &TeamPaths, task_list_id: &str) -> Self {
        Self {
            file: paths.task_list_file(task_list_id),
            lock: paths.task_list_lock(task_list_id),
        }
    }

    /// Total read: a missing or torn file is an empty list.
    fn load(&self) -> TaskListFile {
        let content = match std::fs::read_to_string(&self.file) {
            Ok(c) => c,
            Err(_) => return TaskListFile::default(),
        };
        serde_json::from_str(&content).unwrap_or_default()
    }

    /// Persist atomically. Skips the write when the serialized bytes are
    /// identical to what is on disk, so idempotent mutations leave the
    /// file byte-for-byte unchanged.
    fn save(&self, list: &TaskListFile) -> Result<()> {
        let data = serde_json::to_string_pretty(list)?;
        if let Ok(existing) = std::fs::read_to_string(&self.file) {
            if existing == data {
                return Ok(());
            }
        }
        write_atomic(&self.file, data.as_bytes())
            .with_context(|| format!("saving task list: {}", self.file.display()))
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut TaskListFile) -> Result<T>) -> Result<T> {
        with_lock(&self.lock, LockOptions::default(), || {
            let mut list = self.load();
            let out = f(&mut list)?;
            self.save(&list)?;
            Ok(out)
        })
    }

    /// Create a task with a fresh id, `pending` status, and empty
    /// dependency sets.
    pub fn create_task(&self, new: NewTask) -> Result<Task> {
        self.mutate(|list| {
            list.next_id += 1;
            let task = Task {
                id: list.next_id.to_string(),
                subject: new
                    .subject
                    .clone()
                    .unwrap_or_else(|| subject_of(&new.description)),
                description: new.description.clone(),
                status: TaskStatus::Pending,
                owner: new.owner.clone(),
                blocked_by: Vec::new(),
                blocks: Vec::new(),
                metadata: serde_json::Map::new(),
            };
            list.tasks.push(task.clone());
            Ok(task)
        })
    }

    pub fn get_task(&self, id: &str) -> Option<Task> {
        self.load().tasks.into_iter().find(|t| t.id == id)
    }

    /// All tasks in insertion order.
    pub fn list_tasks(&self) -> Vec<Task> {
        self.load().tasks
    }

    /// Read-modify-write one task through a pure transform. The id is
    /// preserved; `blockedBy` edits are honored and `blocks` re-derived
    /// for symmetry; a transform that would introduce a dependency cycle
    /// is rejected with the store unchanged.
    pub fn update_task(&self, id: &str, f: impl FnOnce(Task) -> Task) -> Result<Task> {
        self.mutate(|list| {
            let pos = position_of(&list.tasks, id)?;
            let before = list.tasks[pos].clone();
            let mut after = f(before.clone());
            after.id = before.id.clone();
            list.tasks[pos] = after;

            if before.blocked_by != list.tasks[pos].blocked_by {
                rebuild_blocks(&mut list.tasks);
                if has_cycle(&list.tasks) {
                    return Err(CoordError::Conflict(format!(
                        "update of task {id} would create a dependency cycle"
                    ))
                    .into());
                }
            } else {
                // blocks is derived; ignore direct edits to it.
                list.tasks[pos].blocks = before.blocks;
            }
            Ok(list.tasks[pos].clone())
        })
    }

    /// Add `dep_id` to `task_id`'s `blockedBy`, maintaining symmetry in
    /// one atomic write. Rejected when either id is missing or the edge
    /// would create a cycle.
    pub fn add_dependency(&self, task_id: &str, dep_id: &str) -> Result<()> {
        self.mutate(|list| {
            position_of(&list.tasks, task_id)?;
            position_of(&list.tasks, dep_id)?;
            if task_id == dep_id {
                return Err(
                    CoordError::Conflict(format!("task {task_id} cannot block itself")).into(),
                );
            }
            if reachable(&list.tasks, dep_id, task_id) {
                return Err(CoordError::Conflict(format!(
                    "dependency {task_id} -> {dep_id} would create a cycle"
                ))
                .into());
            }
            let task = task_mut(&mut list.tasks, task_id);
            if !task.blocked_by.iter().any(|d| d == dep_id) {
                task.blocked_by.push(dep_id.to_string());
            }
            let dep = task_mut(&mut list.tasks, dep_id);
            if !dep.blocks.iter().any(|d| d == task_id) {
                dep.blocks.push(task_id.to_string());
            }
            Ok(())
        })
    }

    /// Remove the edge from both adjacency lists in one atomic write.
    pub fn remove_dependency(&self, task_id: &str, dep_id: &str) -> Result<()> {
        self.mutate(|list| {
            position_of(&list.tasks, task_id)?;
            position_of(&list.tasks, dep_id)?;
            task_mut(&mut list.tasks, task_id)
                .blocked_by
                .retain(|d| d != dep_id);
            task_mut(&mut list.tasks, dep_id)
                .blocks
                .retain(|d| d != task_id);
            Ok(())
        })
    }

    /// A task is blocked iff any task in its transitive `blockedBy`
    /// closure is not completed.
    pub fn is_blocked(&self, task: &Task) -> bool {
        is_task_blocked(&self.load().tasks, &task.id)
    }

    /// Transition a task's status per the state machine, stamping
    /// metadata. Setting the current status again is a no-op.
    pub fn set_status(&self, id: &str, status: TaskStatus) -> Result<Task> {
        self.mutate(|list| {
            let pos = position_of(&list.tasks, id)?;
            let task = &mut list.tasks[pos];
            if task.status == status {
                return Ok(task.clone());
            }
            let allowed = matches!(
                (task.status, status),
                (TaskStatus::Pending, TaskStatus::InProgress)
                    | (TaskStatus::InProgress, TaskStatus::Completed)
                    | (TaskStatus::InProgress, TaskStatus::Pending)
                    | (TaskStatus::Completed, TaskStatus::Pending)
            );
            if !allowed {
                return Err(CoordError::Conflict(format!(
                    "invalid status transition for task {id}: {} -> {}",
                    task.status.as_str(),
                    status.as_str()
                ))
                .into());
            }
            match (task.status, status) {
                (TaskStatus::InProgress, TaskStatus::Completed) => {
                    task.metadata
                        .insert(task_meta::COMPLETED_AT.into(), Value::String(now_rfc3339()));
                }
                (TaskStatus::Completed, TaskStatus::Pending) => {
                    task.metadata
                        .insert(task_meta::REOPENED_AT.into(), Value::String(now_rfc3339()));
                }
                (TaskStatus::InProgress, TaskStatus::Pending) => {
                    task.owner = None;
                }
                _ => {}
            }
            task.status = status;
            Ok(task.clone())
        })
    }

    /// Rewrite the owner. Assigning the current owner is a no-op. A
    /// non-completed task drops back to `pending`; a completed task keeps
    /// its status and records reassignment attribution.
    pub fn assign(&self, id: &str, owner: &str, by: &str) -> Result<Task> {
        self.mutate(|list| {
            let pos = position_of(&list.tasks, id)?;
            let task = &mut list.tasks[pos];
            if task.owner.as_deref() == Some(owner) {
                return Ok(task.clone());
            }
            task.owner = Some(owner.to_string());
            if task.status == TaskStatus::Completed {
                let now = now_rfc3339();
                task.metadata
                    .insert(task_meta::REASSIGNED_AT.into(), Value::String(now));
                task.metadata
                    .insert(task_meta::REASSIGNED_TO.into(), Value::String(owner.into()));
                task.metadata
                    .insert(task_meta::REASSIGNED_BY.into(), Value::String(by.into()));
            } else {
                task.status = TaskStatus::Pending;
            }
            Ok(task.clone())
        })
    }

    /// Clear the owner of every non-completed task owned by `agent`,
    /// resetting status to `pending` and stamping attribution metadata.
    /// Returns the affected task ids.
    pub fn unassign_for_agent(&self, agent: &str, by: &str, reason: &str) -> Result<Vec<String>> {
        self.mutate(|list| {
            let now = now_rfc3339();
            let mut affected = Vec::new();
            for task in list.tasks.iter_mut() {
                if task.owner.as_deref() != Some(agent) || task.status == TaskStatus::Completed {
                    continue;
                }
                task.owner = None;
                task.status = TaskStatus::Pending;
                task.metadata
                    .insert(task_meta::UNASSIGNED_AT.into(), Value::String(now.clone()));
                task.metadata
                    .insert(task_meta::UNASSIGNED_BY.into(), Value::String(by.into()));
                task.metadata.insert(
                    task_meta::UNASSIGNED_REASON.into(),
                    Value::String(reason.into()),
                );
                affected.push(task.id.clone());
            }
            Ok(affected)
        })
    }
}

// ── Graph helpers ──

fn position_of(tasks: &[Task], id: &str) -> Result<usize> {
    tasks
        .iter()
        .position(|t| t.id == id)
        .ok_or_else(|| CoordError::NotFound(format!("task {id}")).into())
}

fn task_mut<'a>(tasks: &'a mut [Task], id: &str) -> &'a mut Task {
    tasks
        .iter_mut()
        .find(|t| t.id == id)
        .expect("id checked before lookup")
}

/// Whether `to` is reachable from `from` via `blockedBy` edges.
fn reachable(tasks: &[Task], from: &str, to: &str) -> bool {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::new();
    queue.push_back(from);
    while let Some(id) = queue.pop_front() {
        if id == to {
            return true;
        }
        if !seen.insert(id) {
            continue;
        }
        if let Some(task) = tasks.iter().find(|t| t.id == id) {
            for dep in &task.blocked_by {
                queue.push_back(dep);
            }
        }
    }
    false
}

/// Transitive blockedness: any incomplete task in the closure blocks.
pub fn is_task_blocked(tasks: &[Task], id: &str) -> bool {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::new();
    if let Some(task) = tasks.iter().find(|t| t.id == id) {
        queue.extend(task.blocked_by.iter().map(|s| s.as_str()));
    }
    while let Some(dep_id) = queue.pop_front() {
        if !seen.insert(dep_id) {
            continue;
        }
        if let Some(dep) = tasks.iter().find(|t| t.id == dep_id) {
            if dep.status != TaskStatus::Completed {
                return true;
            }
            queue.extend(dep.blocked_by.iter().map(|s| s.as_str()));
        }
    }
    false
}

/// Re-derive every `blocks` list from the `blockedBy` adjacency.
fn rebuild_blocks(tasks: &mut [Task]) {
    let edges: Vec<(String, String)> = tasks
        .iter()
        .flat_map(|t| {
            t.blocked_by
                .iter()
                .map(move |dep| (dep.clone(), t.id.clone()))
        })
        .collect();
    for task in tasks.iter_mut() {
        task.blocks.clear();
    }
    for (dep, blocked) in edges {
        if let Some(task) = tasks.iter_mut().find(|t| t.id == dep) {
            if !task.blocks.contains(&blocked) {
                task.blocks.push(blocked);
            }
        }
    }
}

/// Kahn's algorithm over `blockedBy`: a leftover node means a cycle.
fn has_cycle(tasks: &[Task]) -> bool {
    let mut in_degree: std::collections::HashMap<&str, usize> = tasks
        .iter()
        .map(|t| (t.id.as_str(), t.blocked_by.len()))
        .collect();
    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut visited = 0;
    while let Some(id) = queue.pop_front() {
        visited += 1;
        for task in tasks {
            if task.blocked_by.iter().any(|d| d == id) {
                let deg = in_degree.get_mut(task.id.as_str()).expect("known id");
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(task.id.as_str());
                }
            }
        }
    }
    visited != tasks.len()
}

//! Widget projection: derive renderable lines from (rpc, tasks, config).
//!
//! Referentially transparent on purpose: the interactive widget is a
//! read-only projection of the data model.

use pi_teams_core::{MemberStatus, Task, TaskStatus, TeamConfig};

use crate::rpc::RpcStatus;

/// Derive the widget lines. Returns an empty projection when there are
/// no live teammates, no tasks, and no online workers.
pub fn widget_lines(
    rpc_statuses: &[(String, RpcStatus)],
    tasks: &[Task],
    config: &TeamConfig,
    delegate_mode: bool,
) -> Vec<String> {
    let online_workers: Vec<&str> = config
        .workers()
        .filter(|m| m.status == MemberStatus::Online)
        .map(|m| m.name.as_str())
        .collect();

    if rpc_statuses.is_empty() && tasks.is_empty() && online_workers.is_empty() {
        return Vec::new();
    }

    let mut lines = Vec::new();
    let suffix = if delegate_mode { " · delegating" } else { "" };
    lines.push(format!("team {}{suffix}", config.team_id));

    let mut names: Vec<&str> = rpc_statuses.iter().map(|(n, _)| n.as_str()).collect();
    for name in &online_workers {
        if !names.contains(name) {
            names.push(name);
        }
    }

    for name in names {
        let rpc = rpc_statuses
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, s)| *s);
        let owns_in_progress = tasks
            .iter()
            .any(|t| t.owner.as_deref() == Some(name) && t.status == TaskStatus::InProgress);
        let label = display_status(rpc, owns_in_progress);
        lines.push(format!("  {name} - {label}"));
    }

    if !tasks.is_empty() {
        let count = |s: TaskStatus| tasks.iter().filter(|t| t.status == s).count();
        lines.push(format!(
            "  tasks: {} pending · {} in progress · {} done",
            count(TaskStatus::Pending),
            count(TaskStatus::InProgress),
            count(TaskStatus::Completed),
        ));
    }

    lines
}

/// A worker whose RPC reports idle but who owns an in-progress task is
/// displayed as working.
fn display_status(rpc: Option<RpcStatus>, owns_in_progress: bool) -> &'static str {
    match rpc {
        Some(RpcStatus::Idle) if owns_in_progress => "working",
        Some(RpcStatus::Idle) => "idle",
        Some(RpcStatus::Streaming) => "working",
        Some(RpcStatus::Starting) => "starting",
        Some(RpcStatus::Stopped) => "stopped",
        Some(RpcStatus::Error) => "error",
        None if owns_in_progress => "working",
        None => "offline",
    }
}

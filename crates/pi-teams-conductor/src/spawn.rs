//! Worker spawning: name selection, workspace setup, launch seam.
//!
//! The launcher is a trait so the coordinator can be driven by a mock in
//! tests; the real implementation starts a [`TeammateRpc`] child.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::rpc::{StartOptions, TeammateRpc};

// ── Modes ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContextMode {
    /// Start the worker with an empty context.
    #[default]
    Fresh,
    /// Seed the worker from the leader's conversation branch.
    Branch,
}

impl ContextMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fresh" => Some(Self::Fresh),
            "branch" => Some(Self::Branch),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContextMode::Fresh => "fresh",
            ContextMode::Branch => "branch",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkspaceMode {
    /// Share the leader's working directory.
    #[default]
    Shared,
    /// Isolate the worker in its own git worktree.
    Worktree,
}

impl WorkspaceMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "shared" => Some(Self::Shared),
            "worktree" => Some(Self::Worktree),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkspaceMode::Shared => "shared",
            WorkspaceMode::Worktree => "worktree",
        }
    }
}

/// Parameters of one `member_spawn` request.
#[derive(Debug, Clone, Default)]
pub struct SpawnRequest {
    pub name: Option<String>,
    pub mode: ContextMode,
    pub workspace_mode: WorkspaceMode,
    pub plan_required: bool,
    pub model: Option<String>,
    pub thinking: Option<String>,
}

/// Result of a successful spawn.
#[derive(Debug, Clone)]
pub struct SpawnOutcome {
    pub name: String,
    pub mode: ContextMode,
    pub workspace_mode: WorkspaceMode,
    pub note: Option<String>,
    pub warnings: Vec<String>,
}

// ── Launcher seam ──

/// Everything a launcher needs to start one worker.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
}

/// A launched worker. `rpc` is absent for launchers that do not manage a
/// real child (mock, re-attached history).
#[derive(Clone)]
pub struct WorkerHandle {
    pub name: String,
    pub rpc: Option<Arc<TeammateRpc>>,
}

impl WorkerHandle {
    pub fn live(rpc: Arc<TeammateRpc>) -> Self {
        Self {
            name: rpc.name().to_string(),
            rpc: Some(rpc),
        }
    }

    pub fn detached(name: &str) -> Self {
        Self {
            name: name.to_string(),
            rpc: None,
        }
    }

    pub fn is_running(&self) -> bool {
        match &self.rpc {
            Some(rpc) => rpc.status().is_running(),
            None => true,
        }
    }
}

#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, spec: &WorkerSpec) -> Result<WorkerHandle>;
}

/// Launches real worker children over stdio.
pub struct ProcessLauncher;

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, spec: &WorkerSpec) -> Result<WorkerHandle> {
        let opts = StartOptions {
            program: spec.program.clone(),
            args: spec.args.clone(),
            cwd: spec.cwd.clone(),
            env: spec.env.clone(),
            ..StartOptions::new(&spec.program)
        };
        let rpc = TeammateRpc::start(&spec.name, opts).await?;
        Ok(WorkerHandle::live(rpc))
    }
}

/// Records launch requests without starting processes.
#[derive(Default)]
pub struct MockLauncher {
    pub launched: std::sync::Mutex<Vec<WorkerSpec>>,
}

impl MockLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn launched_names(&self) -> Vec<String> {
        self.launched
            .lock()
            .expect("mock state poisoned")
            .iter()
            .map(|s| s.name.clone())
            .collect()
    }
}

#[async_trait]
impl WorkerLauncher for MockLauncher {
    async fn launch(&self, spec: &WorkerSpec) -> Result<WorkerHandle> {
        self.launched
            .lock()
            .expect("mock state poisoned")
            .push(spec.clone());
        Ok(WorkerHandle::detached(&spec.name))
    }
}

// ── Helpers ──

/// Deterministic worker names: `agent1, agent2, …`, skipping taken ones.
pub fn auto_worker_names(taken: &HashSet<String>, count: usize) -> Vec<String> {
    let mut names = Vec::with_capacity(count);
    let mut i = 1;
    while names.len() < count {
        let candidate = format!("agent{i}");
        if !taken.contains(&candidate) {
            names.push(candidate);
        }
        i += 1;
    }
    names
}

/// Split a worker command line into program + args on whitespace.
pub fn parse_worker_command(command: &str) -> Option<(String, Vec<String>)> {
    let mut parts = command.split_whitespace().map(|s| s.to_string());
    let program = parts.next()?;
    Some((program, parts.collect()))
}

/// Create an isolated working directory for a worker via `git worktree`.
/// The worktree implementation itself is the host's concern; this is the
/// seam the spawner calls.
pub fn create_worktree(repo_cwd: &Path, name: &str) -> Result<PathBuf> {
    let dir = repo_cwd.join(".pi-teams").join("worktrees").join(name);
    std::fs::create_dir_all(dir.parent().expect("worktree parent"))?;
    let output = std::process::Command::new("git")
        .args(["worktree", "add", "--detach"])
        .arg(&dir)
        .current_dir(repo_cwd)
        .output()?;
    if !output.status.success() {
        anyhow::bail!(
            "git worktree add failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_names_are_deterministic_and_skip_taken() {
        let taken = HashSet::new();
        assert_eq!(auto_worker_names(&taken, 2), vec!["agent1", "agent2"]);

        let taken: HashSet<String> = ["agent1".to_string(), "agent3".to_string()].into();
        assert_eq!(
            auto_worker_names(&taken, 3),
            vec!["agent2", "agent4", "agent5"]
        );
    }

    #[test]
    fn worker_command_splits_on_whitespace() {
        let (program, args) = parse_worker_command("pi-worker --stdio --quiet").unwrap();
        assert_eq!(program, "pi-worker");
        assert_eq!(args, vec!["--stdio", "--quiet"]);
        assert!(parse_worker_command("   ").is_none());
    }

    #[test]
    fn mode_parsing() {
        assert_eq!(ContextMode::parse("fresh"), Some(ContextMode::Fresh));
        assert_eq!(ContextMode::parse("branch"), Some(ContextMode::Branch));
        assert!(ContextMode::parse("clone").is_none());
        assert_eq!(WorkspaceMode::parse("worktree"), Some(WorkspaceMode::Worktree));
        assert!(WorkspaceMode::parse("separate").is_none());
    }

    #[tokio::test]
    async fn mock_launcher_records_specs() {
        let mock = MockLauncher::new();
        let spec = WorkerSpec {
            name: "agent1".into(),
            program: "pi-worker".into(),
            args: vec![],
            cwd: PathBuf::from("."),
            env: vec![],
        };
        let handle = mock.launch(&spec).await.unwrap();
        assert!(handle.is_running());
        assert_eq!(mock.launched_names(), vec!["agent1"]);
    }
}

//! Post-completion hook execution.
//!
//! Hooks are external commands run through the shell: non-zero exit means
//! failure and stderr is the diagnostic, captured under `hook-logs/`.

use std::path::PathBuf;
use std::time::Duration;

use pi_teams_store::{now_ms, TeamPaths};
use tokio::process::Command;

#[derive(Debug, Clone)]
pub struct HookOutcome {
    pub ok: bool,
    /// Failure diagnostic: `exit N: <stderr>` or a timeout/spawn note.
    pub detail: Option<String>,
    pub log_path: Option<PathBuf>,
}

impl HookOutcome {
    fn passed() -> Self {
        Self {
            ok: true,
            detail: None,
            log_path: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HookRunner {
    pub enabled: bool,
    pub timeout_ms: u64,
}

impl HookRunner {
    pub fn new(enabled: bool, timeout_ms: u64) -> Self {
        Self {
            enabled,
            timeout_ms,
        }
    }

    /// Run the configured post-completion commands in order, stopping at
    /// the first failure. `identity` is exported into each hook's
    /// environment alongside the leader's own.
    pub async fn run_post_completion(
        &self,
        paths: &TeamPaths,
        commands: &[String],
        task_id: &str,
        worker: &str,
        identity: &[(String, String)],
    ) -> HookOutcome {
        if !self.enabled || commands.is_empty() {
            return HookOutcome::passed();
        }

        for command in commands {
            let mut cmd = Command::new("sh");
            cmd.arg("-c")
                .arg(command)
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::piped())
                .kill_on_drop(true);
            for (k, v) in identity {
                cmd.env(k, v);
            }

            let timeout = Duration::from_millis(self.timeout_ms);
            let detail = match tokio::time::timeout(timeout, cmd.output()).await {
                Ok(Ok(output)) if output.status.success() => continue,
                Ok(Ok(output)) => {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    format!(
                        "exit {}: {}",
                        output.status.code().unwrap_or(-1),
                        truncate(stderr.trim(), 2000)
                    )
                }
                Ok(Err(e)) => format!("spawn error: {e}"),
                Err(_) => format!("hook timed out after {}ms: {command}", self.timeout_ms),
            };

            let log_path = write_hook_log(paths, task_id, worker, command, &detail);
            return HookOutcome {
                ok: false,
                detail: Some(detail),
                log_path,
            };
        }

        HookOutcome::passed()
    }
}

/// Best-effort diagnostic capture; a failed write never fails the hook
/// pipeline.
fn write_hook_log(
    paths: &TeamPaths,
    task_id: &str,
    worker: &str,
    command: &str,
    detail: &str,
) -> Option<PathBuf> {
    let path = paths
        .hook_logs_dir
        .join(format!("{}-task{}.log", now_ms(), task_id));
    let body = format!("task: {task_id}\nworker: {worker}\ncommand: {command}\n\n{detail}\n");
    std::fs::create_dir_all(&paths.hook_logs_dir).ok()?;
    std::fs::write(&path, body).ok()?;
    Some(path)
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        format!("{}...", &s[..max_len])
    }
}

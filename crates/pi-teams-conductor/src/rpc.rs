//! RPC supervisor for one teammate child process.
//!
//! The wire is newline-delimited JSON over the child's stdio. Requests
//! carry a monotonically increasing `id`; responses echo it. Anything
//! else on stdout that looks like `{"type": "..."}` is treated as an
//! asynchronous event; unparseable lines are discarded silently.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use pi_teams_core::CoordError;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{broadcast, oneshot, watch};

/// Default deadline for one request/response round trip.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Settle time after spawn before the worker is considered idle.
pub const BOOT_DELAY: Duration = Duration::from_millis(120);

/// Grace period between SIGTERM and SIGKILL during stop.
pub const KILL_GRACE: Duration = Duration::from_secs(1);

// ── Wire types ──

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcStatus {
    Starting,
    Idle,
    Streaming,
    Stopped,
    Error,
}

impl RpcStatus {
    /// Terminal states are sinks.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RpcStatus::Stopped | RpcStatus::Error)
    }

    pub fn is_running(&self) -> bool {
        !self.is_terminal()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcResponse {
    pub id: u64,
    pub command: String,
    pub success: bool,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// An asynchronous event from the worker. The raw object is retained so
/// listeners (activity tracking, UI) can read fields the kernel ignores.
#[derive(Debug, Clone)]
pub struct RpcEvent {
    pub event_type: String,
    pub raw: Value,
}

impl RpcEvent {
    /// Text delta carried by `message_update` events.
    pub fn text_delta(&self) -> Option<&str> {
        self.raw
            .get("delta")
            .or_else(|| self.raw.get("text"))
            .and_then(|v| v.as_str())
    }

    /// Tool name carried by `tool_execution_*` events.
    pub fn tool_name(&self) -> Option<&str> {
        self.raw
            .get("toolName")
            .or_else(|| self.raw.get("tool"))
            .and_then(|v| v.as_str())
    }

    /// Token count carried by usage-bearing events.
    pub fn tokens(&self) -> Option<u64> {
        self.raw.get("tokens").and_then(|v| v.as_u64())
    }
}

#[derive(Debug)]
pub enum RpcLine {
    Response(RpcResponse),
    Event(RpcEvent),
    Noise,
}

/// Classify one stdout line. Only objects structurally recognized as
/// responses resolve pending requests; any other object with a string
/// `type` is tentatively an event; everything else is noise.
pub fn classify_line(line: &str) -> RpcLine {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return RpcLine::Noise;
    }
    let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
        return RpcLine::Noise;
    };
    if !value.is_object() {
        return RpcLine::Noise;
    }
    match value.get("type").and_then(|t| t.as_str()) {
        Some("response") => match serde_json::from_value::<RpcResponse>(value) {
            Ok(resp) => RpcLine::Response(resp),
            Err(_) => RpcLine::Noise,
        },
        Some(t) => RpcLine::Event(RpcEvent {
            event_type: t.to_string(),
            raw: value,
        }),
        None => RpcLine::Noise,
    }
}

// ── Supervisor ──

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitState {
    Running,
    Exited(Option<i32>),
}

#[derive(Debug)]
struct RpcShared {
    status: RpcStatus,
    last_assistant_text: String,
    last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StartOptions {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub request_timeout: Duration,
}

impl StartOptions {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            env: Vec::new(),
            request_timeout: REQUEST_TIMEOUT,
        }
    }
}

/// One supervised worker child.
pub struct TeammateRpc {
    name: String,
    pid: u32,
    stdin: tokio::sync::Mutex<ChildStdin>,
    child: tokio::sync::Mutex<Option<Child>>,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<RpcResponse>>>,
    shared: Mutex<RpcShared>,
    events: broadcast::Sender<RpcEvent>,
    exit_rx: watch::Receiver<ExitState>,
    request_timeout: Duration,
    stopping: AtomicBool,
}

impl TeammateRpc {
    /// Spawn the worker and begin pumping its stdout. After a short boot
    /// delay the status settles from `starting` to `idle`.
    pub async fn start(name: &str, opts: StartOptions) -> Result<Arc<Self>> {
        let mut cmd = Command::new(&opts.program);
        cmd.args(&opts.args)
            .current_dir(&opts.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        for (k, v) in &opts.env {
            cmd.env(k, v);
        }
        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning worker \"{name}\" ({})", opts.program))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("failed to capture stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("failed to capture stdout"))?;

        let (events, _) = broadcast::channel(256);
        let (exit_tx, exit_rx) = watch::channel(ExitState::Running);
        let pid = child.id().unwrap_or_default();

        let rpc = Arc::new(Self {
            name: name.to_string(),
            pid,
            stdin: tokio::sync::Mutex::new(stdin),
            child: tokio::sync::Mutex::new(Some(child)),
            next_id: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            shared: Mutex::new(RpcShared {
                status: RpcStatus::Starting,
                last_assistant_text: String::new(),
                last_error: None,
            }),
            events,
            exit_rx,
            request_timeout: opts.request_timeout,
            stopping: AtomicBool::new(false),
        });

        tokio::spawn(Self::pump(rpc.clone(), stdout, exit_tx));

        tokio::time::sleep(BOOT_DELAY).await;
        {
            let mut shared = rpc.shared.lock().expect("rpc state poisoned");
            if shared.status == RpcStatus::Starting {
                shared.status = RpcStatus::Idle;
            }
        }
        Ok(rpc)
    }

    /// Read stdout until EOF, routing responses and events, then reap the
    /// child and finalize state.
    async fn pump(self: Arc<Self>, stdout: ChildStdout, exit_tx: watch::Sender<ExitState>) {
        let mut reader = BufReader::new(stdout);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            match classify_line(&line) {
                RpcLine::Response(resp) => {
                    let sender = self
                        .pending
                        .lock()
                        .expect("rpc state poisoned")
                        .remove(&resp.id);
                    if let Some(tx) = sender {
                        let _ = tx.send(resp);
                    }
                }
                RpcLine::Event(event) => {
                    self.apply_event(&event);
                    let _ = self.events.send(event);
                }
                RpcLine::Noise => {}
            }
        }

        let code = {
            let mut guard = self.child.lock().await;
            match guard.take() {
                Some(mut child) => child.wait().await.ok().and_then(|s| s.code()),
                None => None,
            }
        };

        {
            let mut shared = self.shared.lock().expect("rpc state poisoned");
            if !shared.status.is_terminal() {
                if code == Some(0) || self.stopping.load(Ordering::SeqCst) {
                    shared.status = RpcStatus::Stopped;
                } else {
                    shared.status = RpcStatus::Error;
                    shared.last_error = Some(match code {
                        Some(c) => format!("worker exited with code {c}"),
                        None => "worker terminated by signal".to_string(),
                    });
                }
            }
        }

        // Reject every in-flight request by dropping its sender.
        self.pending.lock().expect("rpc state poisoned").clear();
        let _ = exit_tx.send(ExitState::Exited(code));
        tracing::debug!(worker = %self.name, ?code, "worker closed");
    }

    fn apply_event(&self, event: &RpcEvent) {
        let mut shared = self.shared.lock().expect("rpc state poisoned");
        if shared.status.is_terminal() {
            return;
        }
        match event.event_type.as_str() {
            "agent_start" => {
                shared.status = RpcStatus::Streaming;
                shared.last_assistant_text.clear();
            }
            "agent_end" => {
                shared.status = RpcStatus::Idle;
            }
            "message_update" => {
                if let Some(delta) = event.text_delta() {
                    shared.last_assistant_text.push_str(delta);
                }
            }
            _ => {}
        }
    }

    /// Send one request and await its response. Times out after the
    /// configured deadline; a child exit rejects all pending requests.
    pub async fn send(&self, command: &str, params: Value) -> Result<RpcResponse, CoordError> {
        if self.status().is_terminal() {
            return Err(CoordError::ProcessExit {
                name: self.name.clone(),
                code: self.exit_code(),
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mut body = match params {
            Value::Object(map) => map,
            Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("params".into(), other);
                map
            }
        };
        body.insert("id".into(), Value::from(id));
        body.insert("type".into(), Value::from(command));
        let line = Value::Object(body).to_string();

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("rpc state poisoned")
            .insert(id, tx);

        {
            let mut stdin = self.stdin.lock().await;
            let write = async {
                stdin.write_all(line.as_bytes()).await?;
                stdin.write_all(b"\n").await?;
                stdin.flush().await
            };
            if write.await.is_err() {
                self.pending
                    .lock()
                    .expect("rpc state poisoned")
                    .remove(&id);
                return Err(CoordError::ProcessExit {
                    name: self.name.clone(),
                    code: self.exit_code(),
                });
            }
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => Err(CoordError::ProcessExit {
                name: self.name.clone(),
                code: self.exit_code(),
            }),
            Err(_) => {
                self.pending
                    .lock()
                    .expect("rpc state poisoned")
                    .remove(&id);
                Err(CoordError::Timeout {
                    what: format!("{} request to \"{}\"", command, self.name),
                    after_ms: self.request_timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Subscribe to the event stream. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<RpcEvent> {
        self.events.subscribe()
    }

    /// Wait for the child to close; returns the exit code when known.
    pub async fn wait_closed(&self) -> Option<i32> {
        let mut rx = self.exit_rx.clone();
        loop {
            if let ExitState::Exited(code) = *rx.borrow() {
                return code;
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    }

    fn exit_code(&self) -> Option<i32> {
        match *self.exit_rx.borrow() {
            ExitState::Exited(code) => code,
            ExitState::Running => None,
        }
    }

    /// Stop the worker: best-effort abort, then SIGTERM, then SIGKILL
    /// after the grace period. Idempotent; pending requests are rejected
    /// when the child exits.
    pub async fn stop(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            let _ = tokio::time::timeout(KILL_GRACE * 2, self.wait_closed()).await;
            return;
        }
        if matches!(*self.exit_rx.borrow(), ExitState::Exited(_)) {
            return;
        }

        let _ = tokio::time::timeout(
            Duration::from_millis(300),
            self.send("abort", Value::Null),
        )
        .await;

        // SIGTERM so a worker that ignores the app-level abort can still
        // flush state before exiting.
        send_sigterm(self.pid);

        if tokio::time::timeout(KILL_GRACE, self.wait_closed())
            .await
            .is_err()
        {
            let mut guard = self.child.lock().await;
            if let Some(child) = guard.as_mut() {
                let _ = child.start_kill();
            }
            drop(guard);
            let _ = tokio::time::timeout(KILL_GRACE * 2, self.wait_closed()).await;
        }

        let mut shared = self.shared.lock().expect("rpc state poisoned");
        if !shared.status.is_terminal() {
            shared.status = RpcStatus::Stopped;
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> RpcStatus {
        self.shared.lock().expect("rpc state poisoned").status
    }

    pub fn last_assistant_text(&self) -> String {
        self.shared
            .lock()
            .expect("rpc state poisoned")
            .last_assistant_text
            .clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared
            .lock()
            .expect("rpc state poisoned")
            .last_error
            .clone()
    }
}

/// Ask a process to terminate gracefully. A pid of 0 (unknown) is skipped.
#[cfg(unix)]
fn send_sigterm(pid: u32) {
    if pid == 0 {
        return;
    }
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) {}

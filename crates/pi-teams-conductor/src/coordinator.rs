//! Leader core: the `teams` tool, inbound envelope handling, and the
//! quality-gate remediation loop.
//!
//! The coordinator owns the map of running teammates, pending plan
//! approvals, and the activity tracker. It never throws across the tool
//! boundary: every action returns a structured [`ActionResult`].

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use pi_teams_core::policy::{resolve_model, ModelPolicyInput};
use pi_teams_core::protocol::{encode_envelope, parse_envelope, Envelope};
use pi_teams_core::{
    meta_keys, sanitize_name, CoordError, HookPolicy, HookPolicyConfig, MailboxMessage,
    MemberStatus, TaskStatus, TeamConfig,
};
use pi_teams_store::claim::{self, AcquireOptions, AcquireOutcome, HeartbeatOutcome};
use pi_teams_store::config::{
    ensure_team_config, load_team_config, set_member_status, update_hooks_policy,
};
use pi_teams_store::mailbox::{mark_read, read_inbox, write_to_mailbox};
use pi_teams_store::tasks::{NewTask, TaskStore};
use pi_teams_store::{now_rfc3339, rfc3339_to_ms, TeamPaths, TEAM_NAMESPACE};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::activity::ActivityTracker;
use crate::env::TeamsEnv;
use crate::hooks::HookRunner;
use crate::remediate::apply_remediation;
use crate::rpc::RpcStatus;
use crate::spawn::{
    auto_worker_names, create_worktree, parse_worker_command, SpawnOutcome, SpawnRequest,
    WorkerHandle, WorkerLauncher, WorkerSpec, WorkspaceMode,
};
use crate::widget::widget_lines;

/// Offline cutoff for `member_prune` without `all`.
pub const PRUNE_CUTOFF_MS: u64 = 3_600_000;

/// Attribution recorded on pruned members.
pub const PRUNED_BY: &str = "teams-tool";

// ── Tool surface ──

#[derive(Debug, Clone)]
pub struct DelegatedTask {
    pub text: String,
    pub assignee: Option<String>,
}

#[derive(Debug, Clone)]
pub enum TeamsAction {
    Delegate {
        tasks: Vec<DelegatedTask>,
        teammates: Vec<String>,
        max_teammates: usize,
    },
    TaskAssign {
        task_id: String,
        assignee: String,
    },
    TaskUnassign {
        task_id: String,
    },
    TaskSetStatus {
        task_id: String,
        status: TaskStatus,
    },
    TaskDepAdd {
        task_id: String,
        depends_on: String,
    },
    TaskDepRm {
        task_id: String,
        depends_on: String,
    },
    TaskDepLs {
        task_id: String,
    },
    MessageDm {
        to: String,
        text: String,
    },
    MessageBroadcast {
        text: String,
    },
    MessageSteer {
        to: String,
        text: String,
    },
    MemberSpawn(SpawnRequest),
    MemberShutdown {
        name: Option<String>,
    },
    MemberKill {
        name: String,
    },
    MemberPrune {
        all: bool,
    },
    PlanApprove {
        name: String,
        feedback: Option<String>,
    },
    PlanReject {
        name: String,
        feedback: Option<String>,
    },
    HooksPolicyGet,
    HooksPolicySet {
        patch: HookPolicyConfig,
        reset: bool,
    },
}

impl TeamsAction {
    /// Actions still served after the attach claim is lost.
    fn is_read_only(&self) -> bool {
        matches!(self, TeamsAction::TaskDepLs { .. } | TeamsAction::HooksPolicyGet)
    }
}

#[derive(Debug, Clone)]
pub struct ActionResult {
    pub ok: bool,
    pub content: String,
    pub details: Value,
}

impl ActionResult {
    fn ok(content: impl Into<String>, details: Value) -> Self {
        Self {
            ok: true,
            content: content.into(),
            details,
        }
    }

    fn from_error(err: anyhow::Error) -> Self {
        let kind = err
            .downcast_ref::<CoordError>()
            .map(|e| e.kind())
            .unwrap_or("io_fault");
        Self {
            ok: false,
            content: format!("{err:#}"),
            details: json!({ "error": kind }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PendingApproval {
    pub request_id: String,
    pub from: String,
    pub plan: String,
    pub task_id: Option<String>,
}

// ── Coordinator ──

pub struct Coordinator {
    env: TeamsEnv,
    paths: TeamPaths,
    team_id: String,
    task_list_id: String,
    lead_name: String,
    session_id: String,
    store: TaskStore,
    launcher: Arc<dyn WorkerLauncher>,
    workers: Mutex<HashMap<String, WorkerHandle>>,
    pending_approvals: Mutex<HashMap<String, PendingApproval>>,
    activity: Arc<Mutex<ActivityTracker>>,
    seen_messages: Mutex<HashSet<String>>,
    seen_request_ids: Mutex<HashSet<String>>,
    hook_runner: HookRunner,
    detached: AtomicBool,
}

impl Coordinator {
    /// Open (auto-ensuring) the team directory and construct the leader
    /// core. Does not take the attach claim; call [`Coordinator::attach`].
    pub fn new(
        env: TeamsEnv,
        team_id: &str,
        session_id: &str,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Result<Self> {
        let paths = TeamPaths::discover(&env.root_dir, team_id);
        paths.ensure_layout()?;
        let lead_name = sanitize_name(&env.lead_name);
        let config = ensure_team_config(&paths, TeamConfig::new(team_id, &lead_name))?;
        let task_list_id = env
            .task_list_id
            .clone()
            .unwrap_or_else(|| config.task_list_id.clone());
        let store = TaskStore::open(&paths, &task_list_id);
        let hook_runner = HookRunner::new(env.hooks_enabled, env.hook_timeout_ms);

        Ok(Self {
            paths,
            team_id: team_id.to_string(),
            task_list_id,
            lead_name,
            session_id: session_id.to_string(),
            store,
            launcher,
            workers: Mutex::new(HashMap::new()),
            pending_approvals: Mutex::new(HashMap::new()),
            activity: Arc::new(Mutex::new(ActivityTracker::new())),
            seen_messages: Mutex::new(HashSet::new()),
            seen_request_ids: Mutex::new(HashSet::new()),
            hook_runner,
            detached: AtomicBool::new(false),
            env,
        })
    }

    pub fn team_id(&self) -> &str {
        &self.team_id
    }

    pub fn lead_name(&self) -> &str {
        &self.lead_name
    }

    pub fn paths(&self) -> &TeamPaths {
        &self.paths
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    fn config(&self) -> TeamConfig {
        load_team_config(&self.paths)
            .unwrap_or_else(|| TeamConfig::new(&self.team_id, &self.lead_name))
    }

    /// Resolved hook policy plus the configured post-completion commands.
    fn hook_policy(&self) -> (HookPolicy, Vec<String>) {
        let config = self.config();
        let hooks = config.hooks.unwrap_or_default();
        let policy = hooks.resolve(&self.env.default_hook_policy);
        (policy, hooks.post_completion)
    }

    fn is_worker_running(&self, name: &str) -> bool {
        self.workers
            .lock()
            .expect("coordinator state poisoned")
            .get(name)
            .map(|h| h.is_running())
            .unwrap_or(false)
    }

    fn running_worker_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .workers
            .lock()
            .expect("coordinator state poisoned")
            .iter()
            .filter(|(_, h)| h.is_running())
            .map(|(n, _)| n.clone())
            .collect();
        names.sort();
        names
    }

    fn identity_env(&self, agent_name: &str) -> Vec<(String, String)> {
        vec![
            (
                "PI_TEAMS_ROOT_DIR".into(),
                self.env.root_dir.to_string_lossy().into_owned(),
            ),
            ("PI_TEAMS_TEAM_ID".into(), self.team_id.clone()),
            ("PI_TEAMS_AGENT_NAME".into(), agent_name.to_string()),
            ("PI_TEAMS_TASK_LIST_ID".into(), self.task_list_id.clone()),
            ("PI_TEAMS_LEAD_NAME".into(), self.lead_name.clone()),
        ]
    }

    // ── Attach lifecycle ──

    pub fn attach(&self, force: bool) -> Result<AcquireOutcome> {
        let outcome = claim::acquire(
            &self.paths,
            &self.session_id,
            AcquireOptions {
                force,
                ..Default::default()
            },
        )?;
        if matches!(outcome, AcquireOutcome::Acquired { .. }) {
            self.detached.store(false, Ordering::SeqCst);
        }
        Ok(outcome)
    }

    pub fn detach(&self) -> Result<()> {
        claim::release(&self.paths, &self.session_id, false)?;
        self.detached.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Refresh the claim heartbeat; losing the claim transitions the
    /// coordinator to the detached state.
    pub fn heartbeat_tick(&self) {
        match claim::heartbeat(&self.paths, &self.session_id) {
            Ok(HeartbeatOutcome::Updated) => {}
            Ok(HeartbeatOutcome::NotOwner) | Ok(HeartbeatOutcome::Missing) => {
                if !self.detached.swap(true, Ordering::SeqCst) {
                    tracing::warn!(
                        team = %self.team_id,
                        "attach claim lost; only read commands accepted"
                    );
                }
            }
            Err(e) => tracing::warn!(team = %self.team_id, "claim heartbeat failed: {e:#}"),
        }
    }

    // ── The `teams` tool ──

    /// Dispatch one tool action. Never errors across this boundary.
    pub async fn handle(&self, action: TeamsAction, cancel: &CancellationToken) -> ActionResult {
        if self.is_detached() && !action.is_read_only() {
            return ActionResult::from_error(
                CoordError::Conflict(
                    "detached: the attach claim is not held; only read commands are accepted"
                        .into(),
                )
                .into(),
            );
        }
        match self.dispatch(action, cancel).await {
            Ok(result) => result,
            Err(err) => ActionResult::from_error(err),
        }
    }

    async fn dispatch(
        &self,
        action: TeamsAction,
        cancel: &CancellationToken,
    ) -> Result<ActionResult> {
        match action {
            TeamsAction::Delegate {
                tasks,
                teammates,
                max_teammates,
            } => self.delegate(tasks, teammates, max_teammates, cancel).await,
            TeamsAction::TaskAssign { task_id, assignee } => self.task_assign(&task_id, &assignee),
            TeamsAction::TaskUnassign { task_id } => self.task_unassign(&task_id),
            TeamsAction::TaskSetStatus { task_id, status } => {
                let task = self.store.set_status(&task_id, status)?;
                Ok(ActionResult::ok(
                    format!("task #{} is now {}", task.id, task.status.as_str()),
                    json!({ "id": task.id, "status": task.status.as_str() }),
                ))
            }
            TeamsAction::TaskDepAdd {
                task_id,
                depends_on,
            } => {
                self.store.add_dependency(&task_id, &depends_on)?;
                Ok(ActionResult::ok(
                    format!("task #{task_id} is now blocked by #{depends_on}"),
                    json!({ "id": task_id, "blockedBy": depends_on }),
                ))
            }
            TeamsAction::TaskDepRm {
                task_id,
                depends_on,
            } => {
                self.store.remove_dependency(&task_id, &depends_on)?;
                Ok(ActionResult::ok(
                    format!("task #{task_id} no longer blocked by #{depends_on}"),
                    json!({ "id": task_id, "removed": depends_on }),
                ))
            }
            TeamsAction::TaskDepLs { task_id } => self.task_dep_ls(&task_id),
            TeamsAction::MessageDm { to, text } => self.message_dm(&to, &text),
            TeamsAction::MessageBroadcast { text } => self.message_broadcast(&text),
            TeamsAction::MessageSteer { to, text } => self.message_steer(&to, &text).await,
            TeamsAction::MemberSpawn(req) => {
                let outcome = self.spawn_worker(req).await?;
                Ok(spawn_result(&outcome))
            }
            TeamsAction::MemberShutdown { name } => self.member_shutdown(name.as_deref()),
            TeamsAction::MemberKill { name } => self.member_kill(&name).await,
            TeamsAction::MemberPrune { all } => self.member_prune(all),
            TeamsAction::PlanApprove { name, feedback } => {
                self.resolve_plan(&name, true, feedback)
            }
            TeamsAction::PlanReject { name, feedback } => {
                self.resolve_plan(&name, false, feedback)
            }
            TeamsAction::HooksPolicyGet => self.hooks_policy_get(),
            TeamsAction::HooksPolicySet { patch, reset } => self.hooks_policy_set(patch, reset),
        }
    }

    // ── Delegation ──

    async fn delegate(
        &self,
        tasks: Vec<DelegatedTask>,
        teammates: Vec<String>,
        max_teammates: usize,
        cancel: &CancellationToken,
    ) -> Result<ActionResult> {
        if tasks.is_empty() {
            return Err(CoordError::InvalidInput("delegate requires at least one task".into()).into());
        }

        let names: Vec<String> = if !teammates.is_empty() {
            teammates.iter().map(|n| sanitize_name(n)).collect()
        } else {
            let want = max_teammates.max(1).min(tasks.len());
            let mut names = self.running_worker_names();
            names.truncate(want);
            if names.len() < want {
                let mut taken: HashSet<String> =
                    self.config().members.iter().map(|m| m.name.clone()).collect();
                taken.extend(names.iter().cloned());
                names.extend(auto_worker_names(&taken, want - names.len()));
            }
            names
        };

        let mut spawned = Vec::new();
        for name in &names {
            if cancel.is_cancelled() {
                return Ok(delegate_aborted(&spawned, &[]));
            }
            if !self.is_worker_running(name) {
                self.spawn_worker(SpawnRequest {
                    name: Some(name.clone()),
                    ..Default::default()
                })
                .await?;
                spawned.push(name.clone());
            }
        }

        let mut created = Vec::new();
        let mut round_robin = 0usize;
        for input in &tasks {
            if cancel.is_cancelled() {
                return Ok(delegate_aborted(&spawned, &created));
            }
            let assignee = match &input.assignee {
                Some(a) => sanitize_name(a),
                None => {
                    let a = names[round_robin % names.len()].clone();
                    round_robin += 1;
                    a
                }
            };
            let task = self.store.create_task(NewTask {
                description: input.text.clone(),
                owner: Some(assignee.clone()),
                ..Default::default()
            })?;
            self.send_assignment(&task.id, &assignee)?;
            created.push(json!({ "id": task.id, "owner": assignee, "subject": task.subject }));
        }

        Ok(ActionResult::ok(
            format!(
                "delegated {} task(s) across {} worker(s)",
                created.len(),
                names.len()
            ),
            json!({ "workers": names, "spawned": spawned, "tasks": created }),
        ))
    }

    fn send_assignment(&self, task_id: &str, assignee: &str) -> Result<()> {
        let task = self
            .store
            .get_task(task_id)
            .ok_or_else(|| CoordError::NotFound(format!("task {task_id}")))?;
        let envelope = Envelope::TaskAssignment {
            task_id: task.id.clone(),
            subject: Some(task.subject.clone()),
            description: Some(task.description.clone()),
            assigned_by: Some(self.lead_name.clone()),
        };
        write_to_mailbox(
            &self.paths,
            &self.task_list_id,
            assignee,
            MailboxMessage::new(&self.lead_name, &encode_envelope(&envelope), &now_rfc3339()),
        )
    }

    // ── Task actions ──

    fn task_assign(&self, task_id: &str, assignee: &str) -> Result<ActionResult> {
        let assignee = sanitize_name(assignee);
        if assignee.is_empty() {
            return Err(CoordError::InvalidInput("assignee must not be empty".into()).into());
        }
        let task = self.store.assign(task_id, &assignee, &self.lead_name)?;
        self.send_assignment(task_id, &assignee)?;
        Ok(ActionResult::ok(
            format!("task #{} assigned to {assignee}", task.id),
            json!({ "id": task.id, "owner": assignee, "status": task.status.as_str() }),
        ))
    }

    fn task_unassign(&self, task_id: &str) -> Result<ActionResult> {
        let lead = self.lead_name.clone();
        let task = self.store.update_task(task_id, |mut t| {
            t.owner = None;
            if t.status != TaskStatus::Completed {
                t.status = TaskStatus::Pending;
            }
            let now = now_rfc3339();
            t.metadata.insert(
                pi_teams_core::task_meta::UNASSIGNED_AT.into(),
                Value::String(now),
            );
            t.metadata.insert(
                pi_teams_core::task_meta::UNASSIGNED_BY.into(),
                Value::String(lead.clone()),
            );
            t
        })?;
        Ok(ActionResult::ok(
            format!("task #{} unassigned", task.id),
            json!({ "id": task.id, "status": task.status.as_str() }),
        ))
    }

    fn task_dep_ls(&self, task_id: &str) -> Result<ActionResult> {
        let task = self
            .store
            .get_task(task_id)
            .ok_or_else(|| CoordError::NotFound(format!("task {task_id}")))?;
        let blocked = self.store.is_blocked(&task);
        let label = if blocked { "blocked" } else { "unblocked" };
        let fmt = |ids: &[String]| {
            if ids.is_empty() {
                "none".to_string()
            } else {
                ids.join(", ")
            }
        };
        Ok(ActionResult::ok(
            format!(
                "task #{} - {} [{label}]\n  blocked by: {}\n  blocks: {}",
                task.id,
                task.subject,
                fmt(&task.blocked_by),
                fmt(&task.blocks),
            ),
            json!({
                "id": task.id,
                "blocked": blocked,
                "blockedBy": task.blocked_by,
                "blocks": task.blocks,
            }),
        ))
    }

    // ── Messaging ──

    fn message_dm(&self, to: &str, text: &str) -> Result<ActionResult> {
        let to = sanitize_name(to);
        if self.config().member(&to).is_none() && !self.is_worker_running(&to) {
            return Err(CoordError::NotFound(format!("member {to}")).into());
        }
        write_to_mailbox(
            &self.paths,
            TEAM_NAMESPACE,
            &to,
            MailboxMessage::new(&self.lead_name, text, &now_rfc3339()),
        )?;
        Ok(ActionResult::ok(
            format!("message delivered to {to}"),
            json!({ "to": to }),
        ))
    }

    /// Broadcast to the union of config workers, live teammates, and
    /// current task owners (lead excluded) with one shared timestamp.
    fn message_broadcast(&self, text: &str) -> Result<ActionResult> {
        let config = self.config();
        let mut recipients: BTreeSet<String> =
            config.workers().map(|m| m.name.clone()).collect();
        recipients.extend(self.running_worker_names());
        for task in self.store.list_tasks() {
            if let Some(owner) = task.owner {
                recipients.insert(owner);
            }
        }
        recipients.remove(&self.lead_name);

        let now = now_rfc3339();
        for recipient in &recipients {
            write_to_mailbox(
                &self.paths,
                TEAM_NAMESPACE,
                recipient,
                MailboxMessage::new(&self.lead_name, text, &now),
            )?;
        }
        Ok(ActionResult::ok(
            format!("broadcast to {} member(s)", recipients.len()),
            json!({ "recipients": recipients }),
        ))
    }

    /// Steer a live worker over RPC; a worker without a live pipe gets
    /// the text as durable mailbox prose instead.
    async fn message_steer(&self, to: &str, text: &str) -> Result<ActionResult> {
        let to = sanitize_name(to);
        let rpc = self
            .workers
            .lock()
            .expect("coordinator state poisoned")
            .get(&to)
            .and_then(|h| h.rpc.clone());

        match rpc {
            Some(rpc) if rpc.status().is_running() => {
                rpc.send("steer", json!({ "text": text }))
                    .await
                    .map_err(anyhow::Error::from)?;
                Ok(ActionResult::ok(
                    format!("steered {to}"),
                    json!({ "to": to, "via": "rpc" }),
                ))
            }
            _ => {
                if self.config().member(&to).is_none() && !self.is_worker_running(&to) {
                    return Err(CoordError::NotFound(format!("member {to}")).into());
                }
                write_to_mailbox(
                    &self.paths,
                    TEAM_NAMESPACE,
                    &to,
                    MailboxMessage::new(&self.lead_name, text, &now_rfc3339()),
                )?;
                Ok(ActionResult::ok(
                    format!("steer queued for {to}"),
                    json!({ "to": to, "via": "mailbox" }),
                ))
            }
        }
    }

    // ── Members ──

    /// Spawn one worker: validate the name, resolve the model, set up the
    /// workspace, launch, and mark the member online.
    pub async fn spawn_worker(&self, req: SpawnRequest) -> Result<SpawnOutcome> {
        let name = match &req.name {
            Some(raw) => {
                let name = sanitize_name(raw);
                if name.is_empty() {
                    return Err(CoordError::InvalidInput("worker name must not be empty".into()).into());
                }
                name
            }
            None => {
                let mut taken: HashSet<String> =
                    self.config().members.iter().map(|m| m.name.clone()).collect();
                taken.extend(self.running_worker_names());
                auto_worker_names(&taken, 1).remove(0)
            }
        };

        if self.is_worker_running(&name) {
            return Err(CoordError::Conflict(format!(
                "worker \"{name}\" is already running; use member_kill first"
            ))
            .into());
        }

        let choice = resolve_model(ModelPolicyInput {
            model_override: req.model.as_deref(),
            leader_provider: self.env.leader_provider.as_deref(),
            leader_model_id: self.env.leader_model_id.as_deref(),
        })
        .map_err(|e| CoordError::InvalidInput(format!("model override rejected: {e}")))?;

        let leader_cwd = std::env::current_dir()?;
        let (cwd, note) = match req.workspace_mode {
            WorkspaceMode::Shared => (leader_cwd, None),
            WorkspaceMode::Worktree => {
                let dir = create_worktree(&leader_cwd, &name)?;
                let note = format!("worktree at {}", dir.display());
                (dir, Some(note))
            }
        };

        let command = self.env.worker_command.as_deref().ok_or_else(|| {
            CoordError::InvalidInput("PI_TEAMS_WORKER is not configured".into())
        })?;
        let (program, args) = parse_worker_command(command).ok_or_else(|| {
            CoordError::InvalidInput("PI_TEAMS_WORKER is empty".into())
        })?;

        let mut env = self.identity_env(&name);
        if let Some(provider) = &choice.provider {
            env.push(("PI_TEAMS_MODEL_PROVIDER".into(), provider.clone()));
        }
        if let Some(model_id) = &choice.model_id {
            env.push(("PI_TEAMS_MODEL_ID".into(), model_id.clone()));
        }
        if let Some(thinking) = &req.thinking {
            env.push(("PI_TEAMS_THINKING_LEVEL".into(), thinking.clone()));
        }
        if req.plan_required {
            env.push(("PI_TEAMS_PLAN_REQUIRED".into(), "1".into()));
        }

        let spec = WorkerSpec {
            name: name.clone(),
            program,
            args,
            cwd,
            env,
        };
        let handle = self.launcher.launch(&spec).await?;

        if let Some(rpc) = &handle.rpc {
            let mut events = rpc.subscribe();
            let activity = self.activity.clone();
            let worker = name.clone();
            tokio::spawn(async move {
                while let Ok(event) = events.recv().await {
                    activity
                        .lock()
                        .expect("activity state poisoned")
                        .advance(&worker, &event);
                }
            });
            let _ = tokio::time::timeout(
                Duration::from_secs(1),
                rpc.send("set_session_name", json!({ "name": name })),
            )
            .await;
        }

        self.workers
            .lock()
            .expect("coordinator state poisoned")
            .insert(name.clone(), handle);

        let mut meta = BTreeMap::new();
        if let Some(model_id) = &choice.model_id {
            let model = match &choice.provider {
                Some(provider) => format!("{provider}/{model_id}"),
                None => model_id.clone(),
            };
            meta.insert(meta_keys::MODEL.to_string(), Value::String(model));
        }
        if let Some(thinking) = &req.thinking {
            meta.insert(
                meta_keys::THINKING_LEVEL.to_string(),
                Value::String(thinking.clone()),
            );
        }
        meta.insert(
            meta_keys::SPAWNED_AT.to_string(),
            Value::String(now_rfc3339()),
        );
        meta.insert(
            meta_keys::MODE.to_string(),
            Value::String(req.mode.as_str().into()),
        );
        meta.insert(
            meta_keys::WORKSPACE_MODE.to_string(),
            Value::String(req.workspace_mode.as_str().into()),
        );
        set_member_status(&self.paths, &name, MemberStatus::Online, meta)?;

        tracing::info!(worker = %name, source = choice.source.as_str(), "worker spawned");
        Ok(SpawnOutcome {
            name,
            mode: req.mode,
            workspace_mode: req.workspace_mode,
            note,
            warnings: choice.warnings,
        })
    }

    /// Write a `shutdown_request` to one worker, or to every online
    /// worker when no name is given.
    fn member_shutdown(&self, name: Option<&str>) -> Result<ActionResult> {
        let config = self.config();
        let targets: Vec<String> = match name {
            Some(raw) => {
                let wanted = sanitize_name(raw);
                if config.member(&wanted).is_none() {
                    return Err(CoordError::NotFound(format!("member {wanted}")).into());
                }
                vec![wanted]
            }
            None => config
                .workers()
                .filter(|m| m.status == MemberStatus::Online)
                .map(|m| m.name.clone())
                .collect(),
        };
        if targets.is_empty() {
            return Err(CoordError::NotFound("no online workers to shut down".into()).into());
        }

        let now = now_rfc3339();
        for target in &targets {
            let envelope = Envelope::ShutdownRequest {
                request_id: uuid::Uuid::new_v4().to_string(),
                from: Some(self.lead_name.clone()),
                reason: None,
                timestamp: Some(now.clone()),
            };
            write_to_mailbox(
                &self.paths,
                TEAM_NAMESPACE,
                target,
                MailboxMessage::new(&self.lead_name, &encode_envelope(&envelope), &now),
            )?;
            let status = config
                .member(target)
                .map(|m| m.status)
                .unwrap_or(MemberStatus::Online);
            let mut meta = BTreeMap::new();
            meta.insert(
                meta_keys::SHUTDOWN_REQUESTED_AT.to_string(),
                Value::String(now.clone()),
            );
            set_member_status(&self.paths, target, status, meta)?;
        }

        Ok(ActionResult::ok(
            format!("shutdown requested for {} worker(s)", targets.len()),
            json!({ "targets": targets }),
        ))
    }

    /// Hard-stop one worker: kill the child, reopen its work, mark it
    /// offline.
    async fn member_kill(&self, name: &str) -> Result<ActionResult> {
        let name = sanitize_name(name);
        let handle = self
            .workers
            .lock()
            .expect("coordinator state poisoned")
            .remove(&name);
        if handle.is_none() && self.config().member(&name).is_none() {
            return Err(CoordError::NotFound(format!("member {name}")).into());
        }
        if let Some(WorkerHandle { rpc: Some(rpc), .. }) = handle {
            rpc.stop().await;
        }

        let unassigned = self
            .store
            .unassign_for_agent(&name, "member_kill", "worker killed")?;
        let mut meta = BTreeMap::new();
        meta.insert(
            meta_keys::KILLED_AT.to_string(),
            Value::String(now_rfc3339()),
        );
        set_member_status(&self.paths, &name, MemberStatus::Offline, meta)?;
        self.activity
            .lock()
            .expect("activity state poisoned")
            .reset(&name);

        Ok(ActionResult::ok(
            format!("killed {name}; {} task(s) returned to pending", unassigned.len()),
            json!({ "name": name, "unassigned": unassigned }),
        ))
    }

    /// Mark dead workers offline. Without `all`, workers seen within the
    /// last hour are spared; workers owning in-progress tasks always are.
    fn member_prune(&self, all: bool) -> Result<ActionResult> {
        let config = self.config();
        let tasks = self.store.list_tasks();
        let now = pi_teams_store::now_ms();
        let mut pruned = Vec::new();

        for member in config.workers().filter(|m| m.status == MemberStatus::Online) {
            if self.is_worker_running(&member.name) {
                continue;
            }
            let owns_in_progress = tasks.iter().any(|t| {
                t.owner.as_deref() == Some(member.name.as_str())
                    && t.status == TaskStatus::InProgress
            });
            if owns_in_progress {
                continue;
            }
            if !all {
                let seen_recently = member
                    .last_seen_at
                    .as_deref()
                    .and_then(rfc3339_to_ms)
                    .map(|ts| now.saturating_sub(ts) < PRUNE_CUTOFF_MS)
                    .unwrap_or(false);
                if seen_recently {
                    continue;
                }
            }
            let mut meta = BTreeMap::new();
            meta.insert(
                meta_keys::PRUNED_AT.to_string(),
                Value::String(now_rfc3339()),
            );
            meta.insert(
                meta_keys::PRUNED_BY.to_string(),
                Value::String(PRUNED_BY.into()),
            );
            set_member_status(&self.paths, &member.name, MemberStatus::Offline, meta)?;
            pruned.push(member.name.clone());
        }

        Ok(ActionResult::ok(
            format!("pruned {} worker(s)", pruned.len()),
            json!({ "pruned": pruned }),
        ))
    }

    // ── Plan approvals ──

    fn resolve_plan(
        &self,
        name: &str,
        approve: bool,
        feedback: Option<String>,
    ) -> Result<ActionResult> {
        let name = sanitize_name(name);
        let pending = self
            .pending_approvals
            .lock()
            .expect("coordinator state poisoned")
            .remove(&name)
            .ok_or_else(|| {
                CoordError::NotFound(format!("no pending plan approval for {name}"))
            })?;

        let envelope = if approve {
            Envelope::PlanApproved {
                request_id: pending.request_id.clone(),
                from: self.lead_name.clone(),
                feedback,
            }
        } else {
            Envelope::PlanRejected {
                request_id: pending.request_id.clone(),
                from: self.lead_name.clone(),
                feedback,
            }
        };
        write_to_mailbox(
            &self.paths,
            TEAM_NAMESPACE,
            &name,
            MailboxMessage::new(&self.lead_name, &encode_envelope(&envelope), &now_rfc3339()),
        )?;

        let verdict = if approve { "approved" } else { "rejected" };
        Ok(ActionResult::ok(
            format!("plan {verdict} for {name}"),
            json!({ "name": name, "requestId": pending.request_id, "approved": approve }),
        ))
    }

    pub fn pending_approval(&self, name: &str) -> Option<PendingApproval> {
        self.pending_approvals
            .lock()
            .expect("coordinator state poisoned")
            .get(&sanitize_name(name))
            .cloned()
    }

    // ── Hook policy ──

    fn hooks_policy_get(&self) -> Result<ActionResult> {
        let (policy, commands) = self.hook_policy();
        Ok(ActionResult::ok(
            format!(
                "hooks: {:?}, max reopens {}, follow-up owner {:?}, {} command(s)",
                policy.failure_action,
                policy.max_reopens_per_task,
                policy.followup_owner,
                commands.len()
            ),
            json!({
                "policy": {
                    "failureAction": policy.failure_action,
                    "maxReopensPerTask": policy.max_reopens_per_task,
                    "followupOwner": policy.followup_owner,
                },
                "postCompletion": commands,
            }),
        ))
    }

    fn hooks_policy_set(&self, patch: HookPolicyConfig, reset: bool) -> Result<ActionResult> {
        update_hooks_policy(&self.paths, |current| {
            if reset {
                return None;
            }
            let mut config = current.unwrap_or_default();
            config.merge(&patch);
            Some(config)
        })?;
        let content = if reset {
            "hook policy reset to defaults".to_string()
        } else {
            "hook policy updated".to_string()
        };
        Ok(ActionResult::ok(content, json!({ "reset": reset })))
    }

    // ── Inbound envelopes & remediation ──

    /// Process one worker→leader envelope. Duplicates (by `requestId`)
    /// are dropped.
    pub async fn handle_envelope(&self, from: &str, envelope: Envelope) -> Result<()> {
        if let Some(request_id) = envelope.request_id() {
            let mut seen = self
                .seen_request_ids
                .lock()
                .expect("coordinator state poisoned");
            if !seen.insert(request_id.to_string()) {
                return Ok(());
            }
        }

        match envelope {
            Envelope::IdleNotification {
                from: worker,
                completed_task_id,
                completed_status,
                failure_reason,
            } => {
                let worker = sanitize_name(&worker);
                if completed_status.as_deref() == Some("completed") {
                    if let Some(task_id) = completed_task_id {
                        self.run_quality_gate(&worker, &task_id).await?;
                    }
                } else if let Some(reason) = failure_reason {
                    tracing::warn!(worker = %worker, "worker reported failure: {reason}");
                } else {
                    tracing::debug!(worker = %worker, "worker idle");
                }
            }
            Envelope::PlanApprovalRequest {
                request_id,
                from: worker,
                plan,
                task_id,
            } => {
                let worker = sanitize_name(&worker);
                tracing::info!(worker = %worker, "plan approval requested");
                self.pending_approvals
                    .lock()
                    .expect("coordinator state poisoned")
                    .insert(
                        worker.clone(),
                        PendingApproval {
                            request_id,
                            from: worker,
                            plan,
                            task_id,
                        },
                    );
            }
            Envelope::ShutdownApproved { .. } => {
                let name = sanitize_name(from);
                let handle = self
                    .workers
                    .lock()
                    .expect("coordinator state poisoned")
                    .remove(&name);
                if let Some(WorkerHandle { rpc: Some(rpc), .. }) = handle {
                    rpc.stop().await;
                }
                set_member_status(&self.paths, &name, MemberStatus::Offline, BTreeMap::new())?;
                self.activity
                    .lock()
                    .expect("activity state poisoned")
                    .reset(&name);
                tracing::info!(worker = %name, "worker shut down");
            }
            Envelope::ShutdownRejected { reason, .. } => {
                tracing::info!(worker = %from, "shutdown rejected: {}", reason.unwrap_or_default());
            }
            Envelope::PeerDmSent { from, to, summary } => {
                tracing::info!(%from, %to, "peer DM: {summary}");
            }
            // Leader→worker kinds echoed back are not ours to act on.
            _ => {}
        }
        Ok(())
    }

    /// Run post-completion hooks for a completed task and drive the
    /// remediation state machine on failure.
    async fn run_quality_gate(&self, worker: &str, task_id: &str) -> Result<()> {
        let Some(task) = self.store.get_task(task_id) else {
            tracing::warn!(worker = %worker, task = %task_id, "completed task not found");
            return Ok(());
        };
        let (policy, commands) = self.hook_policy();
        let identity = self.identity_env(worker);
        let outcome = self
            .hook_runner
            .run_post_completion(&self.paths, &commands, task_id, worker, &identity)
            .await;
        if outcome.ok {
            return Ok(());
        }

        tracing::warn!(
            worker = %worker,
            task = %task_id,
            "quality gate failed: {}",
            outcome.detail.as_deref().unwrap_or("hook failed")
        );
        let report = apply_remediation(
            &self.store,
            &self.paths,
            &self.task_list_id,
            &self.lead_name,
            &policy,
            &task,
            worker,
            outcome.detail.as_deref(),
        )?;
        tracing::info!(
            task = %report.task_id,
            reopened = report.reopened,
            followup = report.followup_id.as_deref().unwrap_or("-"),
            "remediation applied"
        );
        Ok(())
    }

    /// Drain the lead's team mailbox: parse envelopes, handle them, and
    /// acknowledge everything processed. A faulted message never stops
    /// the batch.
    pub async fn poll_team_mailbox(&self) -> Result<usize> {
        let inbox = read_inbox(&self.paths, TEAM_NAMESPACE, &self.lead_name, true);
        if inbox.is_empty() {
            return Ok(0);
        }

        let mut processed: Vec<(String, String, String)> = Vec::new();
        for msg in inbox {
            let key = format!("{}|{}|{}", msg.from, msg.timestamp, msg.text);
            let duplicate = !self
                .seen_messages
                .lock()
                .expect("coordinator state poisoned")
                .insert(key);
            if !duplicate {
                if let Some(envelope) = parse_envelope(&msg.text) {
                    if let Err(e) = self.handle_envelope(&msg.from, envelope).await {
                        tracing::warn!(from = %msg.from, "envelope handling failed: {e:#}");
                    }
                } else {
                    tracing::info!(from = %msg.from, "message: {}", msg.text);
                }
            }
            processed.push((msg.from, msg.timestamp, msg.text));
        }

        let count = processed.len();
        mark_read(&self.paths, TEAM_NAMESPACE, &self.lead_name, |m| {
            processed
                .iter()
                .any(|(f, ts, text)| *f == m.from && *ts == m.timestamp && *text == m.text)
        })?;
        Ok(count)
    }

    /// Background loop: drain the mailbox and keep the claim warm until
    /// cancelled. A faulted iteration logs and continues.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut poll = tokio::time::interval(Duration::from_millis(500));
        let mut beat = tokio::time::interval(Duration::from_secs(10));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = poll.tick() => {
                    if let Err(e) = self.poll_team_mailbox().await {
                        tracing::warn!("mailbox poll failed: {e:#}");
                    }
                }
                _ = beat.tick() => self.heartbeat_tick(),
            }
        }
    }

    /// Widget projection over the current data model.
    pub fn widget(&self, delegate_mode: bool) -> Vec<String> {
        let statuses: Vec<(String, RpcStatus)> = self
            .workers
            .lock()
            .expect("coordinator state poisoned")
            .iter()
            .map(|(name, handle)| {
                let status = handle
                    .rpc
                    .as_ref()
                    .map(|r| r.status())
                    .unwrap_or(RpcStatus::Idle);
                (name.clone(), status)
            })
            .collect();
        widget_lines(&statuses, &self.store.list_tasks(), &self.config(), delegate_mode)
    }
}

fn spawn_result(outcome: &SpawnOutcome) -> ActionResult {
    let mut content = format!(
        "spawned {} ({}, {})",
        outcome.name,
        outcome.mode.as_str(),
        outcome.workspace_mode.as_str()
    );
    if let Some(note) = &outcome.note {
        content.push_str(&format!(" - {note}"));
    }
    ActionResult::ok(
        content,
        json!({
            "name": outcome.name,
            "mode": outcome.mode.as_str(),
            "workspaceMode": outcome.workspace_mode.as_str(),
            "warnings": outcome.warnings,
        }),
    )
}

fn delegate_aborted(spawned: &[String], created: &[Value]) -> ActionResult {
    ActionResult {
        ok: false,
        content: format!(
            "delegate aborted after {} spawn(s) and {} task(s)",
            spawned.len(),
            created.len()
        ),
        details: json!({ "error": "aborted", "spawned": spawned, "tasks": created }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remediate::REMEDIATION_NUDGE;
    use crate::spawn::MockLauncher;
    use pi_teams_core::{task_meta, FailureAction, FollowupOwner};
    use pi_teams_store::ms_to_rfc3339;

    fn fixture() -> (tempfile::TempDir, Coordinator, Arc<MockLauncher>) {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_string_lossy().into_owned();
        let env = TeamsEnv::from_lookup(move |key| match key {
            "PI_TEAMS_ROOT_DIR" => Some(root.clone()),
            "PI_TEAMS_WORKER" => Some("pi-worker --stdio".to_string()),
            _ => None,
        });
        let mock = Arc::new(MockLauncher::new());
        let coord = Coordinator::new(env, "t1", "session-1", mock.clone()).unwrap();
        (tmp, coord, mock)
    }

    fn delegated(text: &str) -> DelegatedTask {
        DelegatedTask {
            text: text.into(),
            assignee: None,
        }
    }

    fn inbox_envelopes(coord: &Coordinator, ns: &str, name: &str) -> Vec<Envelope> {
        read_inbox(coord.paths(), ns, name, false)
            .iter()
            .filter_map(|m| parse_envelope(&m.text))
            .collect()
    }

    #[tokio::test]
    async fn delegate_autonames_and_round_robins() {
        let (_tmp, coord, mock) = fixture();
        let cancel = CancellationToken::new();

        let result = coord
            .handle(
                TeamsAction::Delegate {
                    tasks: vec![delegated("A"), delegated("B"), delegated("C")],
                    teammates: vec![],
                    max_teammates: 2,
                },
                &cancel,
            )
            .await;
        assert!(result.ok, "{}", result.content);
        assert_eq!(mock.launched_names(), vec!["agent1", "agent2"]);

        let owners: Vec<_> = coord
            .store()
            .list_tasks()
            .into_iter()
            .map(|t| t.owner.unwrap())
            .collect();
        assert_eq!(owners, vec!["agent1", "agent2", "agent1"]);

        let a1 = inbox_envelopes(&coord, "t1", "agent1");
        let a2 = inbox_envelopes(&coord, "t1", "agent2");
        assert_eq!(a1.len() + a2.len(), 3);
        assert!(a1
            .iter()
            .all(|e| matches!(e, Envelope::TaskAssignment { .. })));
    }

    #[tokio::test]
    async fn delegate_requires_tasks() {
        let (_tmp, coord, _mock) = fixture();
        let result = coord
            .handle(
                TeamsAction::Delegate {
                    tasks: vec![],
                    teammates: vec![],
                    max_teammates: 2,
                },
                &CancellationToken::new(),
            )
            .await;
        assert!(!result.ok);
        assert_eq!(result.details["error"], "invalid_input");
    }

    #[tokio::test]
    async fn delegate_honors_abort_signal() {
        let (_tmp, coord, mock) = fixture();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = coord
            .handle(
                TeamsAction::Delegate {
                    tasks: vec![delegated("A")],
                    teammates: vec![],
                    max_teammates: 2,
                },
                &cancel,
            )
            .await;
        assert!(!result.ok);
        assert_eq!(result.details["error"], "aborted");
        assert!(mock.launched_names().is_empty());
        assert!(coord.store().list_tasks().is_empty());
    }

    #[tokio::test]
    async fn task_assign_and_unassign() {
        let (_tmp, coord, _mock) = fixture();
        let cancel = CancellationToken::new();
        let task = coord
            .store()
            .create_task(NewTask {
                description: "do it".into(),
                ..Default::default()
            })
            .unwrap();

        let result = coord
            .handle(
                TeamsAction::TaskAssign {
                    task_id: task.id.clone(),
                    assignee: "w one".into(),
                },
                &cancel,
            )
            .await;
        assert!(result.ok);
        let task2 = coord.store().get_task(&task.id).unwrap();
        assert_eq!(task2.owner.as_deref(), Some("w-one"));
        assert_eq!(inbox_envelopes(&coord, "t1", "w-one").len(), 1);

        let result = coord
            .handle(
                TeamsAction::TaskUnassign {
                    task_id: task.id.clone(),
                },
                &cancel,
            )
            .await;
        assert!(result.ok);
        let task3 = coord.store().get_task(&task.id).unwrap();
        assert!(task3.owner.is_none());
        assert!(task3.metadata.contains_key(task_meta::UNASSIGNED_AT));
    }

    #[tokio::test]
    async fn dep_ls_labels_blockedness() {
        let (_tmp, coord, _mock) = fixture();
        let cancel = CancellationToken::new();
        let t1 = coord
            .store()
            .create_task(NewTask {
                description: "first".into(),
                ..Default::default()
            })
            .unwrap();
        let t2 = coord
            .store()
            .create_task(NewTask {
                description: "second".into(),
                ..Default::default()
            })
            .unwrap();
        coord
            .handle(
                TeamsAction::TaskDepAdd {
                    task_id: t1.id.clone(),
                    depends_on: t2.id.clone(),
                },
                &cancel,
            )
            .await;

        let result = coord
            .handle(TeamsAction::TaskDepLs { task_id: t1.id }, &cancel)
            .await;
        assert!(result.ok);
        assert!(result.content.contains("[blocked]"));
        assert!(result.content.contains("blocked by: 2"));
        assert_eq!(result.details["blocked"], true);
    }

    #[tokio::test]
    async fn dep_cycle_surfaces_as_conflict() {
        let (_tmp, coord, _mock) = fixture();
        let cancel = CancellationToken::new();
        for text in ["a", "b"] {
            coord
                .store()
                .create_task(NewTask {
                    description: text.into(),
                    ..Default::default()
                })
                .unwrap();
        }
        coord
            .handle(
                TeamsAction::TaskDepAdd {
                    task_id: "1".into(),
                    depends_on: "2".into(),
                },
                &cancel,
            )
            .await;
        let result = coord
            .handle(
                TeamsAction::TaskDepAdd {
                    task_id: "2".into(),
                    depends_on: "1".into(),
                },
                &cancel,
            )
            .await;
        assert!(!result.ok);
        assert_eq!(result.details["error"], "conflict");
    }

    #[tokio::test]
    async fn broadcast_reaches_union_with_shared_timestamp() {
        let (_tmp, coord, _mock) = fixture();
        let cancel = CancellationToken::new();
        coord
            .spawn_worker(SpawnRequest {
                name: Some("agent1".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        // A task owner who is not a live teammate still hears broadcasts.
        coord
            .store()
            .create_task(NewTask {
                description: "orphaned".into(),
                owner: Some("historic".into()),
                ..Default::default()
            })
            .unwrap();

        let result = coord
            .handle(
                TeamsAction::MessageBroadcast {
                    text: "all hands".into(),
                },
                &cancel,
            )
            .await;
        assert!(result.ok);

        let a1 = read_inbox(coord.paths(), TEAM_NAMESPACE, "agent1", false);
        let historic = read_inbox(coord.paths(), TEAM_NAMESPACE, "historic", false);
        let lead = read_inbox(coord.paths(), TEAM_NAMESPACE, coord.lead_name(), false);
        assert_eq!(a1.len(), 1);
        assert_eq!(historic.len(), 1);
        assert!(lead.is_empty());
        assert_eq!(a1[0].timestamp, historic[0].timestamp);
    }

    #[tokio::test]
    async fn dm_to_unknown_member_is_not_found() {
        let (_tmp, coord, _mock) = fixture();
        let result = coord
            .handle(
                TeamsAction::MessageDm {
                    to: "ghost".into(),
                    text: "hello".into(),
                },
                &CancellationToken::new(),
            )
            .await;
        assert!(!result.ok);
        assert_eq!(result.details["error"], "not_found");
    }

    #[tokio::test]
    async fn steer_falls_back_to_mailbox_without_live_pipe() {
        let (_tmp, coord, _mock) = fixture();
        coord
            .spawn_worker(SpawnRequest {
                name: Some("agent1".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        let result = coord
            .handle(
                TeamsAction::MessageSteer {
                    to: "agent1".into(),
                    text: "focus on tests".into(),
                },
                &CancellationToken::new(),
            )
            .await;
        assert!(result.ok);
        assert_eq!(result.details["via"], "mailbox");
        let inbox = read_inbox(coord.paths(), TEAM_NAMESPACE, "agent1", false);
        assert_eq!(inbox[0].text, "focus on tests");
    }

    #[tokio::test]
    async fn spawn_refuses_duplicate_and_bad_override() {
        let (_tmp, coord, _mock) = fixture();
        coord
            .spawn_worker(SpawnRequest {
                name: Some("agent1".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        let result = coord
            .handle(
                TeamsAction::MemberSpawn(SpawnRequest {
                    name: Some("agent1".into()),
                    ..Default::default()
                }),
                &CancellationToken::new(),
            )
            .await;
        assert!(!result.ok);
        assert_eq!(result.details["error"], "conflict");

        let result = coord
            .handle(
                TeamsAction::MemberSpawn(SpawnRequest {
                    name: Some("agent2".into()),
                    model: Some("openai-codex/".into()),
                    ..Default::default()
                }),
                &CancellationToken::new(),
            )
            .await;
        assert!(!result.ok);
        assert_eq!(result.details["error"], "invalid_input");
    }

    #[tokio::test]
    async fn spawn_records_member_meta() {
        let (_tmp, coord, mock) = fixture();
        coord
            .spawn_worker(SpawnRequest {
                name: Some("agent1".into()),
                model: Some("openai-codex/codex-mini".into()),
                thinking: Some("high".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        let config = load_team_config(coord.paths()).unwrap();
        let member = config.member("agent1").unwrap();
        assert_eq!(member.status, MemberStatus::Online);
        assert_eq!(
            member.meta[meta_keys::MODEL],
            Value::String("openai-codex/codex-mini".into())
        );
        assert_eq!(
            member.meta[meta_keys::THINKING_LEVEL],
            Value::String("high".into())
        );
        assert!(member.meta.contains_key(meta_keys::SPAWNED_AT));

        let launched = mock.launched.lock().unwrap();
        let spec = &launched[0];
        assert_eq!(spec.program, "pi-worker");
        assert!(spec
            .env
            .iter()
            .any(|(k, v)| k == "PI_TEAMS_AGENT_NAME" && v == "agent1"));
        assert!(spec
            .env
            .iter()
            .any(|(k, v)| k == "PI_TEAMS_MODEL_ID" && v == "codex-mini"));
    }

    #[tokio::test]
    async fn shutdown_writes_request_and_meta() {
        let (_tmp, coord, _mock) = fixture();
        coord
            .spawn_worker(SpawnRequest {
                name: Some("agent1".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        let result = coord
            .handle(
                TeamsAction::MemberShutdown { name: None },
                &CancellationToken::new(),
            )
            .await;
        assert!(result.ok);

        let envelopes = inbox_envelopes(&coord, TEAM_NAMESPACE, "agent1");
        assert!(matches!(
            envelopes[0],
            Envelope::ShutdownRequest { .. }
        ));
        let config = load_team_config(coord.paths()).unwrap();
        let member = config.member("agent1").unwrap();
        assert!(member
            .meta
            .contains_key(meta_keys::SHUTDOWN_REQUESTED_AT));
    }

    #[tokio::test]
    async fn kill_unassigns_and_marks_offline() {
        let (_tmp, coord, _mock) = fixture();
        coord
            .spawn_worker(SpawnRequest {
                name: Some("agent1".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        let task = coord
            .store()
            .create_task(NewTask {
                description: "work".into(),
                owner: Some("agent1".into()),
                ..Default::default()
            })
            .unwrap();
        coord
            .store()
            .set_status(&task.id, TaskStatus::InProgress)
            .unwrap();

        let result = coord
            .handle(
                TeamsAction::MemberKill {
                    name: "agent1".into(),
                },
                &CancellationToken::new(),
            )
            .await;
        assert!(result.ok);

        let task = coord.store().get_task(&task.id).unwrap();
        assert!(task.owner.is_none());
        assert_eq!(task.status, TaskStatus::Pending);

        let config = load_team_config(coord.paths()).unwrap();
        let member = config.member("agent1").unwrap();
        assert_eq!(member.status, MemberStatus::Offline);
        assert!(member.meta.contains_key(meta_keys::KILLED_AT));
        assert!(!coord.is_worker_running("agent1"));
    }

    /// Rewrite one member's `lastSeenAt` directly on disk (test backdoor).
    fn backdate_member(coord: &Coordinator, name: &str, ms_ago: u64) {
        let mut config = load_team_config(coord.paths()).unwrap();
        let member = config
            .members
            .iter_mut()
            .find(|m| m.name == name)
            .unwrap();
        member.last_seen_at = Some(ms_to_rfc3339(pi_teams_store::now_ms() - ms_ago));
        let data = serde_json::to_string_pretty(&config).unwrap();
        std::fs::write(&coord.paths().config_json, data).unwrap();
    }

    #[tokio::test]
    async fn prune_respects_the_hour_cutoff() {
        let (_tmp, coord, _mock) = fixture();
        coord
            .spawn_worker(SpawnRequest {
                name: Some("w1".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        // Simulate a dead process: forget the handle, keep config online.
        coord.workers.lock().unwrap().clear();
        backdate_member(&coord, "w1", 600_000); // 10 minutes

        let result = coord
            .handle(
                TeamsAction::MemberPrune { all: false },
                &CancellationToken::new(),
            )
            .await;
        assert!(result.ok);
        let config = load_team_config(coord.paths()).unwrap();
        assert_eq!(config.member("w1").unwrap().status, MemberStatus::Online);

        let result = coord
            .handle(
                TeamsAction::MemberPrune { all: true },
                &CancellationToken::new(),
            )
            .await;
        assert!(result.ok);
        let config = load_team_config(coord.paths()).unwrap();
        let member = config.member("w1").unwrap();
        assert_eq!(member.status, MemberStatus::Offline);
        assert_eq!(
            member.meta[meta_keys::PRUNED_BY],
            Value::String(PRUNED_BY.into())
        );
    }

    #[tokio::test]
    async fn prune_spares_stale_workers_with_in_progress_tasks() {
        let (_tmp, coord, _mock) = fixture();
        coord
            .spawn_worker(SpawnRequest {
                name: Some("w1".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        coord.workers.lock().unwrap().clear();
        backdate_member(&coord, "w1", 2 * PRUNE_CUTOFF_MS);

        let task = coord
            .store()
            .create_task(NewTask {
                description: "busy".into(),
                owner: Some("w1".into()),
                ..Default::default()
            })
            .unwrap();
        coord
            .store()
            .set_status(&task.id, TaskStatus::InProgress)
            .unwrap();

        coord
            .handle(
                TeamsAction::MemberPrune { all: true },
                &CancellationToken::new(),
            )
            .await;
        let config = load_team_config(coord.paths()).unwrap();
        assert_eq!(config.member("w1").unwrap().status, MemberStatus::Online);
    }

    #[tokio::test]
    async fn plan_approval_gate_roundtrip() {
        let (_tmp, coord, _mock) = fixture();
        coord
            .handle_envelope(
                "w1",
                Envelope::PlanApprovalRequest {
                    request_id: "r1".into(),
                    from: "w1".into(),
                    plan: "1. refactor\n2. test".into(),
                    task_id: Some("3".into()),
                },
            )
            .await
            .unwrap();
        assert!(coord.pending_approval("w1").is_some());

        let result = coord
            .handle(
                TeamsAction::PlanApprove {
                    name: "w1".into(),
                    feedback: Some("looks good".into()),
                },
                &CancellationToken::new(),
            )
            .await;
        assert!(result.ok);
        assert!(coord.pending_approval("w1").is_none());

        let envelopes = inbox_envelopes(&coord, TEAM_NAMESPACE, "w1");
        match &envelopes[0] {
            Envelope::PlanApproved {
                request_id,
                feedback,
                ..
            } => {
                assert_eq!(request_id, "r1");
                assert_eq!(feedback.as_deref(), Some("looks good"));
            }
            other => panic!("expected PlanApproved, got {other:?}"),
        }

        // The approval is consumed: a second verdict has nothing to act on.
        let result = coord
            .handle(
                TeamsAction::PlanReject {
                    name: "w1".into(),
                    feedback: None,
                },
                &CancellationToken::new(),
            )
            .await;
        assert!(!result.ok);
        assert_eq!(result.details["error"], "not_found");
    }

    #[tokio::test]
    async fn duplicate_request_ids_are_dropped() {
        let (_tmp, coord, _mock) = fixture();
        for plan in ["first", "second"] {
            coord
                .handle_envelope(
                    "w1",
                    Envelope::PlanApprovalRequest {
                        request_id: "r1".into(),
                        from: "w1".into(),
                        plan: plan.into(),
                        task_id: None,
                    },
                )
                .await
                .unwrap();
        }
        assert_eq!(coord.pending_approval("w1").unwrap().plan, "first");
    }

    #[tokio::test]
    async fn hooks_policy_set_get_and_reset() {
        let (_tmp, coord, _mock) = fixture();
        let cancel = CancellationToken::new();
        let result = coord
            .handle(
                TeamsAction::HooksPolicySet {
                    patch: HookPolicyConfig {
                        failure_action: Some(FailureAction::Reopen),
                        max_reopens_per_task: Some(7),
                        ..Default::default()
                    },
                    reset: false,
                },
                &cancel,
            )
            .await;
        assert!(result.ok);

        let result = coord.handle(TeamsAction::HooksPolicyGet, &cancel).await;
        assert!(result.ok);
        assert_eq!(result.details["policy"]["maxReopensPerTask"], 7);
        assert_eq!(result.details["policy"]["failureAction"], "reopen");

        coord
            .handle(
                TeamsAction::HooksPolicySet {
                    patch: HookPolicyConfig::default(),
                    reset: true,
                },
                &cancel,
            )
            .await;
        let result = coord.handle(TeamsAction::HooksPolicyGet, &cancel).await;
        assert_eq!(result.details["policy"]["maxReopensPerTask"], 2);
    }

    #[tokio::test]
    async fn quality_gate_reopen_followup_end_to_end() {
        let (_tmp, coord, _mock) = fixture();
        coord
            .handle(
                TeamsAction::HooksPolicySet {
                    patch: HookPolicyConfig {
                        failure_action: Some(FailureAction::ReopenFollowup),
                        max_reopens_per_task: Some(2),
                        followup_owner: Some(FollowupOwner::Member),
                        post_completion: vec!["echo gate broke >&2; false".into()],
                    },
                    reset: false,
                },
                &CancellationToken::new(),
            )
            .await;

        let task = coord
            .store()
            .create_task(NewTask {
                description: "implement the parser".into(),
                owner: Some("w1".into()),
                ..Default::default()
            })
            .unwrap();
        coord
            .store()
            .set_status(&task.id, TaskStatus::InProgress)
            .unwrap();
        coord
            .store()
            .set_status(&task.id, TaskStatus::Completed)
            .unwrap();

        coord
            .handle_envelope(
                "w1",
                Envelope::IdleNotification {
                    from: "w1".into(),
                    completed_task_id: Some(task.id.clone()),
                    completed_status: Some("completed".into()),
                    failure_reason: None,
                },
            )
            .await
            .unwrap();

        let original = coord.store().get_task(&task.id).unwrap();
        assert_eq!(original.status, TaskStatus::Pending);
        assert_eq!(original.reopen_count(), 1);
        assert_eq!(
            original.metadata[task_meta::QUALITY_GATE_STATUS],
            Value::String("failed".into())
        );

        let followup = coord
            .store()
            .list_tasks()
            .into_iter()
            .find(|t| t.id != task.id)
            .expect("follow-up task exists");
        assert!(followup.subject.starts_with("Quality gate failed:"));
        assert_eq!(followup.owner.as_deref(), Some("w1"));
        assert_eq!(followup.blocked_by, vec![task.id.clone()]);

        let inbox = read_inbox(coord.paths(), "t1", "w1", false);
        let has_assignment = inbox.iter().any(|m| {
            matches!(
                parse_envelope(&m.text),
                Some(Envelope::TaskAssignment { task_id, .. }) if task_id == followup.id
            )
        });
        let has_nudge = inbox.iter().any(|m| m.text.contains(REMEDIATION_NUDGE));
        assert!(has_assignment);
        assert!(has_nudge);

        // Hook diagnostics land under hook-logs/.
        let logs: Vec<_> = std::fs::read_dir(&coord.paths().hook_logs_dir)
            .unwrap()
            .collect();
        assert!(!logs.is_empty());
    }

    #[tokio::test]
    async fn passing_hooks_leave_the_task_alone() {
        let (_tmp, coord, _mock) = fixture();
        coord
            .handle(
                TeamsAction::HooksPolicySet {
                    patch: HookPolicyConfig {
                        failure_action: Some(FailureAction::ReopenFollowup),
                        post_completion: vec!["true".into()],
                        ..Default::default()
                    },
                    reset: false,
                },
                &CancellationToken::new(),
            )
            .await;

        let task = coord
            .store()
            .create_task(NewTask {
                description: "easy win".into(),
                owner: Some("w1".into()),
                ..Default::default()
            })
            .unwrap();
        coord
            .store()
            .set_status(&task.id, TaskStatus::InProgress)
            .unwrap();
        coord
            .store()
            .set_status(&task.id, TaskStatus::Completed)
            .unwrap();

        coord
            .handle_envelope(
                "w1",
                Envelope::IdleNotification {
                    from: "w1".into(),
                    completed_task_id: Some(task.id.clone()),
                    completed_status: Some("completed".into()),
                    failure_reason: None,
                },
            )
            .await
            .unwrap();

        let task = coord.store().get_task(&task.id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(coord.store().list_tasks().len(), 1);
    }

    #[tokio::test]
    async fn mailbox_poll_handles_and_acknowledges() {
        let (_tmp, coord, _mock) = fixture();
        let envelope = Envelope::PlanApprovalRequest {
            request_id: "r9".into(),
            from: "w1".into(),
            plan: "the plan".into(),
            task_id: None,
        };
        write_to_mailbox(
            coord.paths(),
            TEAM_NAMESPACE,
            coord.lead_name(),
            MailboxMessage::new("w1", &encode_envelope(&envelope), &now_rfc3339()),
        )
        .unwrap();

        let processed = coord.poll_team_mailbox().await.unwrap();
        assert_eq!(processed, 1);
        assert!(coord.pending_approval("w1").is_some());
        assert!(read_inbox(coord.paths(), TEAM_NAMESPACE, coord.lead_name(), true).is_empty());

        // Nothing new: the second poll is a no-op.
        assert_eq!(coord.poll_team_mailbox().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn lost_claim_detaches_and_gates_writes() {
        let (_tmp, coord, _mock) = fixture();
        coord.attach(false).unwrap();

        // Another session force-takes the claim.
        claim::acquire(
            coord.paths(),
            "session-2",
            AcquireOptions {
                force: true,
                ..Default::default()
            },
        )
        .unwrap();
        coord.heartbeat_tick();
        assert!(coord.is_detached());

        let result = coord
            .handle(
                TeamsAction::MessageBroadcast {
                    text: "hello".into(),
                },
                &CancellationToken::new(),
            )
            .await;
        assert!(!result.ok);
        assert_eq!(result.details["error"], "conflict");

        // Read commands still work.
        let result = coord
            .handle(TeamsAction::HooksPolicyGet, &CancellationToken::new())
            .await;
        assert!(result.ok);
    }

    #[tokio::test]
    async fn widget_projection_reflects_workers_and_tasks() {
        let (_tmp, coord, _mock) = fixture();
        assert!(coord.widget(false).is_empty());

        coord
            .spawn_worker(SpawnRequest {
                name: Some("agent1".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        let task = coord
            .store()
            .create_task(NewTask {
                description: "render".into(),
                owner: Some("agent1".into()),
                ..Default::default()
            })
            .unwrap();
        coord
            .store()
            .set_status(&task.id, TaskStatus::InProgress)
            .unwrap();

        let lines = coord.widget(false);
        assert!(lines[0].contains("team t1"));
        assert!(lines.iter().any(|l| l.contains("agent1 - working")));
    }
}

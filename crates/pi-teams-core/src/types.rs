use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Names ──

/// Maximum length of a task subject (first line of the description).
pub const MAX_SUBJECT_LEN: usize = 120;

/// Sanitize a member name: every character outside `[A-Za-z0-9_-]`
/// becomes `-`. Names are the primary key for members and mailbox files.
pub fn sanitize_name(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Derive a task subject from its description: first line, truncated
/// to [`MAX_SUBJECT_LEN`] characters.
pub fn subject_of(description: &str) -> String {
    let first = description.lines().next().unwrap_or("").trim();
    first.chars().take(MAX_SUBJECT_LEN).collect()
}

// ── Members ──

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Lead,
    Worker,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    Online,
    Offline,
}

/// A team member. `meta` carries optional scalar annotations such as
/// `model`, `thinkingLevel`, `shutdownRequestedAt`, `killedAt`,
/// `prunedAt`, `prunedBy`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub name: String,
    pub role: Role,
    pub status: MemberStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, Value>,
}

impl Member {
    pub fn worker(name: &str) -> Self {
        Self {
            name: sanitize_name(name),
            role: Role::Worker,
            status: MemberStatus::Offline,
            last_seen_at: None,
            meta: BTreeMap::new(),
        }
    }

    pub fn lead(name: &str) -> Self {
        Self {
            name: sanitize_name(name),
            role: Role::Lead,
            status: MemberStatus::Online,
            last_seen_at: None,
            meta: BTreeMap::new(),
        }
    }
}

/// Well-known member meta keys.
pub mod meta_keys {
    pub const MODEL: &str = "model";
    pub const THINKING_LEVEL: &str = "thinkingLevel";
    pub const SPAWNED_AT: &str = "spawnedAt";
    pub const MODE: &str = "mode";
    pub const WORKSPACE_MODE: &str = "workspaceMode";
    pub const SHUTDOWN_REQUESTED_AT: &str = "shutdownRequestedAt";
    pub const KILLED_AT: &str = "killedAt";
    pub const PRUNED_AT: &str = "prunedAt";
    pub const PRUNED_BY: &str = "prunedBy";
}

// ── Hook policy ──

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureAction {
    Warn,
    Followup,
    Reopen,
    ReopenFollowup,
}

impl FailureAction {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "warn" => Some(Self::Warn),
            "followup" => Some(Self::Followup),
            "reopen" => Some(Self::Reopen),
            "reopen_followup" => Some(Self::ReopenFollowup),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FollowupOwner {
    Member,
    Lead,
    None,
}

impl FollowupOwner {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "member" => Some(Self::Member),
            "lead" => Some(Self::Lead),
            "none" => Some(Self::None),
            _ => None,
        }
    }
}

/// Fully resolved hook policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookPolicy {
    pub failure_action: FailureAction,
    pub max_reopens_per_task: u32,
    pub followup_owner: FollowupOwner,
}

impl Default for HookPolicy {
    fn default() -> Self {
        Self {
            failure_action: FailureAction::Warn,
            max_reopens_per_task: 2,
            followup_owner: FollowupOwner::Member,
        }
    }
}

/// Partially configured hook policy as stored in the team config.
/// Missing fields fall back to an environment-supplied default at
/// resolution time. `post_completion` is the list of shell commands run
/// after a worker reports a task completed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HookPolicyConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_action: Option<FailureAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_reopens_per_task: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub followup_owner: Option<FollowupOwner>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_completion: Vec<String>,
}

impl HookPolicyConfig {
    /// Resolve against defaults: configured fields win, gaps are filled.
    pub fn resolve(&self, defaults: &HookPolicy) -> HookPolicy {
        HookPolicy {
            failure_action: self.failure_action.unwrap_or(defaults.failure_action),
            max_reopens_per_task: self
                .max_reopens_per_task
                .unwrap_or(defaults.max_reopens_per_task),
            followup_owner: self.followup_owner.unwrap_or(defaults.followup_owner),
        }
    }

    /// Merge a partial update into this config. `Some` fields overwrite.
    pub fn merge(&mut self, patch: &HookPolicyConfig) {
        if patch.failure_action.is_some() {
            self.failure_action = patch.failure_action;
        }
        if patch.max_reopens_per_task.is_some() {
            self.max_reopens_per_task = patch.max_reopens_per_task;
        }
        if patch.followup_owner.is_some() {
            self.followup_owner = patch.followup_owner;
        }
        if !patch.post_completion.is_empty() {
            self.post_completion = patch.post_completion.clone();
        }
    }
}

// ── Team config ──

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TeamConfig {
    pub team_id: String,
    pub task_list_id: String,
    pub lead_name: String,
    /// Cosmetic style tag for worker name pools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hooks: Option<HookPolicyConfig>,
    #[serde(default)]
    pub members: Vec<Member>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl TeamConfig {
    pub fn new(team_id: &str, lead_name: &str) -> Self {
        Self {
            team_id: team_id.to_string(),
            task_list_id: team_id.to_string(),
            lead_name: sanitize_name(lead_name),
            style: None,
            hooks: None,
            members: vec![Member::lead(lead_name)],
            created_at: None,
            updated_at: None,
        }
    }

    pub fn member(&self, name: &str) -> Option<&Member> {
        let wanted = sanitize_name(name);
        self.members.iter().find(|m| m.name == wanted)
    }

    /// Worker members only (lead excluded).
    pub fn workers(&self) -> impl Iterator<Item = &Member> {
        self.members.iter().filter(|m| m.role == Role::Worker)
    }
}

// ── Tasks ──

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// A unit of delegated work. Dependencies are stored as adjacency lists
/// keyed by task id; `blocked_by` and `blocks` are kept symmetric by the
/// task store. `metadata` is the open extension point for timestamps,
/// remediation counters, and attribution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub subject: String,
    pub description: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked_by: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocks: Vec<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, Value>,
}

/// Well-known task metadata keys.
pub mod task_meta {
    pub const COMPLETED_AT: &str = "completedAt";
    pub const REOPENED_AT: &str = "reopenedAt";
    pub const REASSIGNED_AT: &str = "reassignedAt";
    pub const REASSIGNED_TO: &str = "reassignedTo";
    pub const REASSIGNED_BY: &str = "reassignedBy";
    pub const UNASSIGNED_AT: &str = "unassignedAt";
    pub const UNASSIGNED_BY: &str = "unassignedBy";
    pub const UNASSIGNED_REASON: &str = "unassignedReason";
    pub const REOPENED_BY_QUALITY_GATE_COUNT: &str = "reopenedByQualityGateCount";
    pub const QUALITY_GATE_STATUS: &str = "qualityGateStatus";
}

impl Task {
    /// Current quality-gate reopen counter (0 when absent).
    pub fn reopen_count(&self) -> u32 {
        self.metadata
            .get(task_meta::REOPENED_BY_QUALITY_GATE_COUNT)
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32
    }
}

// ── Attach claim ──

/// Heartbeated exclusive lease on a team directory. One JSON file per
/// team dir; at most one claim at a time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AttachClaim {
    pub holder_session_id: String,
    pub claimed_at: String,
    pub heartbeat_at: String,
    pub pid: u32,
}

// ── Mailbox ──

/// One entry in a per-recipient mailbox file. `text` is either free
/// prose or a JSON-encoded protocol envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MailboxMessage {
    pub from: String,
    pub text: String,
    pub timestamp: String,
    #[serde(default)]
    pub read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

impl MailboxMessage {
    pub fn new(from: &str, text: &str, timestamp: &str) -> Self {
        Self {
            from: from.to_string(),
            text: text.to_string(),
            timestamp: timestamp.to_string(),
            read: false,
            color: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_forbidden_chars() {
        assert_eq!(sanitize_name("worker one"), "worker-one");
        assert_eq!(sanitize_name("a/b\\c"), "a-b-c");
        assert_eq!(sanitize_name("ok_name-1"), "ok_name-1");
        assert_eq!(sanitize_name("émile"), "-mile");
    }

    #[test]
    fn subject_is_first_line_truncated() {
        assert_eq!(subject_of("fix the bug\nmore detail"), "fix the bug");
        let long = "x".repeat(200);
        assert_eq!(subject_of(&long).chars().count(), MAX_SUBJECT_LEN);
    }

    #[test]
    fn member_serde_roundtrip() {
        let mut m = Member::worker("w1");
        m.status = MemberStatus::Online;
        m.meta
            .insert(meta_keys::MODEL.into(), Value::String("gpt-5".into()));
        let json = serde_json::to_string(&m).unwrap();
        assert!(json.contains("\"status\":\"online\""));
        let back: Member = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn hook_policy_resolves_gaps_from_defaults() {
        let cfg = HookPolicyConfig {
            failure_action: Some(FailureAction::Reopen),
            ..Default::default()
        };
        let resolved = cfg.resolve(&HookPolicy::default());
        assert_eq!(resolved.failure_action, FailureAction::Reopen);
        assert_eq!(resolved.max_reopens_per_task, 2);
        assert_eq!(resolved.followup_owner, FollowupOwner::Member);
    }

    #[test]
    fn hook_policy_merge_is_partial() {
        let mut cfg = HookPolicyConfig {
            failure_action: Some(FailureAction::Warn),
            max_reopens_per_task: Some(1),
            ..Default::default()
        };
        cfg.merge(&HookPolicyConfig {
            followup_owner: Some(FollowupOwner::Lead),
            ..Default::default()
        });
        assert_eq!(cfg.failure_action, Some(FailureAction::Warn));
        assert_eq!(cfg.max_reopens_per_task, Some(1));
        assert_eq!(cfg.followup_owner, Some(FollowupOwner::Lead));
    }

    #[test]
    fn team_config_member_lookup_sanitizes() {
        let mut cfg = TeamConfig::new("t1", "lead");
        cfg.members.push(Member::worker("w one"));
        assert!(cfg.member("w one").is_some());
        assert!(cfg.member("w-one").is_some());
        assert_eq!(cfg.workers().count(), 1);
    }

    #[test]
    fn task_status_parse_rejects_unknown() {
        assert_eq!(TaskStatus::parse("pending"), Some(TaskStatus::Pending));
        assert_eq!(TaskStatus::parse("in_progress"), Some(TaskStatus::InProgress));
        assert!(TaskStatus::parse("done").is_none());
    }

    #[test]
    fn reopen_count_defaults_to_zero() {
        let task = Task {
            id: "1".into(),
            subject: "s".into(),
            description: "s".into(),
            status: TaskStatus::Pending,
            owner: None,
            blocked_by: Vec::new(),
            blocks: Vec::new(),
            metadata: serde_json::Map::new(),
        };
        assert_eq!(task.reopen_count(), 0);
    }

    #[test]
    fn mailbox_message_defaults_unread() {
        let json = r#"{"from":"lead","text":"hi","timestamp":"2026-01-01T00:00:00Z"}"#;
        let msg: MailboxMessage = serde_json::from_str(json).unwrap();
        assert!(!msg.read);
        assert!(msg.color.is_none());
    }
}

//! Environment snapshot for the leader process.
//!
//! Variables are read once at startup; the rest of the kernel only sees
//! this struct.

use std::path::PathBuf;

use pi_teams_core::{FailureAction, FollowupOwner, HookPolicy};

/// Default hook subprocess timeout.
pub const DEFAULT_HOOK_TIMEOUT_MS: u64 = 120_000;

#[derive(Debug, Clone)]
pub struct TeamsEnv {
    /// Root of all team directories (`PI_TEAMS_ROOT_DIR`).
    pub root_dir: PathBuf,
    /// Worker command line for spawned teammates (`PI_TEAMS_WORKER`).
    pub worker_command: Option<String>,
    pub team_id: Option<String>,
    pub agent_name: Option<String>,
    pub task_list_id: Option<String>,
    pub lead_name: String,
    pub auto_claim: bool,
    pub hooks_enabled: bool,
    pub hook_timeout_ms: u64,
    /// Env-supplied defaults for partially configured team hook policies.
    pub default_hook_policy: HookPolicy,
    /// The leader's own provider/model, consulted by the model policy.
    pub leader_provider: Option<String>,
    pub leader_model_id: Option<String>,
}

impl TeamsEnv {
    /// Snapshot the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok().filter(|v| !v.is_empty()))
    }

    /// Build from an arbitrary lookup, so tests can inject values without
    /// mutating the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = HookPolicy::default();
        let default_hook_policy = HookPolicy {
            failure_action: lookup("PI_TEAMS_FAILURE_ACTION")
                .as_deref()
                .and_then(FailureAction::parse)
                .unwrap_or(defaults.failure_action),
            max_reopens_per_task: lookup("PI_TEAMS_MAX_REOPENS_PER_TASK")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_reopens_per_task),
            followup_owner: lookup("PI_TEAMS_FOLLOWUP_OWNER")
                .as_deref()
                .and_then(FollowupOwner::parse)
                .unwrap_or(defaults.followup_owner),
        };

        Self {
            root_dir: lookup("PI_TEAMS_ROOT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(pi_teams_store::default_teams_root),
            worker_command: lookup("PI_TEAMS_WORKER"),
            team_id: lookup("PI_TEAMS_TEAM_ID"),
            agent_name: lookup("PI_TEAMS_AGENT_NAME"),
            task_list_id: lookup("PI_TEAMS_TASK_LIST_ID"),
            lead_name: lookup("PI_TEAMS_LEAD_NAME").unwrap_or_else(|| "lead".to_string()),
            auto_claim: lookup("PI_TEAMS_AUTO_CLAIM")
                .map(|v| is_truthy(&v))
                .unwrap_or(false),
            hooks_enabled: lookup("PI_TEAMS_HOOKS_ENABLED")
                .map(|v| is_truthy(&v))
                .unwrap_or(true),
            hook_timeout_ms: lookup("PI_TEAMS_HOOK_TIMEOUT_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_HOOK_TIMEOUT_MS),
            default_hook_policy,
            leader_provider: lookup("PI_TEAMS_LEAD_PROVIDER"),
            leader_model_id: lookup("PI_TEAMS_LEAD_MODEL_ID"),
        }
    }
}

fn is_truthy(v: &str) -> bool {
    matches!(v, "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> TeamsEnv {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        TeamsEnv::from_lookup(move |key| map.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let env = env_of(&[]);
        assert_eq!(env.lead_name, "lead");
        assert!(!env.auto_claim);
        assert!(env.hooks_enabled);
        assert_eq!(env.hook_timeout_ms, DEFAULT_HOOK_TIMEOUT_MS);
        assert_eq!(env.default_hook_policy, HookPolicy::default());
    }

    #[test]
    fn policy_defaults_come_from_env() {
        let env = env_of(&[
            ("PI_TEAMS_FAILURE_ACTION", "reopen_followup"),
            ("PI_TEAMS_MAX_REOPENS_PER_TASK", "5"),
            ("PI_TEAMS_FOLLOWUP_OWNER", "lead"),
        ]);
        assert_eq!(
            env.default_hook_policy.failure_action,
            FailureAction::ReopenFollowup
        );
        assert_eq!(env.default_hook_policy.max_reopens_per_task, 5);
        assert_eq!(env.default_hook_policy.followup_owner, FollowupOwner::Lead);
    }

    #[test]
    fn bad_policy_values_fall_back() {
        let env = env_of(&[
            ("PI_TEAMS_FAILURE_ACTION", "explode"),
            ("PI_TEAMS_MAX_REOPENS_PER_TASK", "many"),
        ]);
        assert_eq!(env.default_hook_policy.failure_action, FailureAction::Warn);
        assert_eq!(env.default_hook_policy.max_reopens_per_task, 2);
    }

    #[test]
    fn identity_fields_are_read() {
        let env = env_of(&[
            ("PI_TEAMS_ROOT_DIR", "/tmp/teams"),
            ("PI_TEAMS_TEAM_ID", "alpha"),
            ("PI_TEAMS_WORKER", "pi-worker --stdio"),
            ("PI_TEAMS_AUTO_CLAIM", "1"),
            ("PI_TEAMS_HOOKS_ENABLED", "0"),
        ]);
        assert_eq!(env.root_dir, PathBuf::from("/tmp/teams"));
        assert_eq!(env.team_id.as_deref(), Some("alpha"));
        assert_eq!(env.worker_command.as_deref(), Some("pi-worker --stdio"));
        assert!(env.auto_claim);
        assert!(!env.hooks_enabled);
    }
}

//! Team config persistence: members, status, hook policy, style.
//!
//! All writes go through write-temp-then-rename under the config lock.

use std::collections::BTreeMap;

use anyhow::Result;
use pi_teams_core::{
    sanitize_name, HookPolicyConfig, Member, MemberStatus, Role, TeamConfig,
};
use serde_json::Value;

use crate::lock::{with_lock, LockOptions};
use crate::{now_rfc3339, write_atomic, TeamPaths};

/// Total read: missing or torn config reads as `None`.
pub fn load_team_config(paths: &TeamPaths) -> Option<TeamConfig> {
    let content = std::fs::read_to_string(&paths.config_json).ok()?;
    serde_json::from_str(&content).ok()
}

fn save(paths: &TeamPaths, config: &TeamConfig) -> Result<()> {
    let data = serde_json::to_string_pretty(config)?;
    write_atomic(&paths.config_json, data.as_bytes())
}

/// Upsert the team config. When a config exists, only `updatedAt` is
/// refreshed and missing members / leadName / style are filled from
/// `defaults`; existing fields are preserved. Otherwise `defaults` is
/// written with fresh timestamps.
pub fn ensure_team_config(paths: &TeamPaths, defaults: TeamConfig) -> Result<TeamConfig> {
    with_lock(&paths.config_lock, LockOptions::default(), || {
        let now = now_rfc3339();
        let config = match load_team_config(paths) {
            Some(mut existing) => {
                if existing.lead_name.is_empty() {
                    existing.lead_name = defaults.lead_name.clone();
                }
                if existing.style.is_none() {
                    existing.style = defaults.style.clone();
                }
                if existing.members.is_empty() {
                    existing.members = defaults.members.clone();
                }
                if existing.hooks.is_none() {
                    existing.hooks = defaults.hooks.clone();
                }
                existing.updated_at = Some(now);
                existing
            }
            None => TeamConfig {
                created_at: Some(now.clone()),
                updated_at: Some(now),
                ..defaults
            },
        };
        save(paths, &config)?;
        Ok(config)
    })
}

/// Set a member's status, refresh `lastSeenAt`, and merge `meta` keys.
/// Unknown members are inserted as workers so history survives restarts.
pub fn set_member_status(
    paths: &TeamPaths,
    name: &str,
    status: MemberStatus,
    meta: BTreeMap<String, Value>,
) -> Result<Member> {
    with_lock(&paths.config_lock, LockOptions::default(), || {
        let mut config = load_team_config(paths)
            .ok_or_else(|| anyhow::anyhow!("team config missing: {}", paths.config_json.display()))?;
        let wanted = sanitize_name(name);
        let now = now_rfc3339();

        let idx = match config.members.iter().position(|m| m.name == wanted) {
            Some(i) => i,
            None => {
                config.members.push(Member {
                    name: wanted.clone(),
                    role: Role::Worker,
                    status: MemberStatus::Offline,
                    last_seen_at: None,
                    meta: BTreeMap::new(),
                });
                config.members.len() - 1
            }
        };
        let member = &mut config.members[idx];
        member.status = status;
        member.last_seen_at = Some(now.clone());
        member.meta.extend(meta);
        let updated = member.clone();

        config.updated_at = Some(now);
        save(paths, &config)?;
        Ok(updated)
    })
}

/// Mutate the team hook policy through a transform on the current value.
pub fn update_hooks_policy(
    paths: &TeamPaths,
    f: impl FnOnce(Option<HookPolicyConfig>) -> Option<HookPolicyConfig>,
) -> Result<TeamConfig> {
    with_lock(&paths.config_lock, LockOptions::default(), || {
        let mut config = load_team_config(paths)
            .ok_or_else(|| anyhow::anyhow!("team config missing: {}", paths.config_json.display()))?;
        config.hooks = f(config.hooks.take());
        config.updated_at = Some(now_rfc3339());
        save(paths, &config)?;
        Ok(config)
    })
}

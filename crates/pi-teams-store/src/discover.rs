//! Enumerate teams on disk with claim freshness.

use std::path::Path;

use pi_teams_core::{AttachClaim, TeamConfig};

use crate::claim::{freshness, read_claim, DEFAULT_CLAIM_STALE_MS};
use crate::config::load_team_config;
use crate::{now_ms, TeamPaths};

#[derive(Debug, Clone)]
pub struct DiscoveredTeam {
    pub team_id: String,
    pub config: TeamConfig,
    pub claim: Option<AttachClaim>,
    /// Whether the claim (if any) has a live heartbeat.
    pub claim_fresh: bool,
}

/// List every team under `root`, newest first by `updatedAt`.
/// Directories starting with `_` are ignored, as are directories without
/// a readable config.
pub fn list_discovered_teams(root: &Path) -> Vec<DiscoveredTeam> {
    let entries = match std::fs::read_dir(root) {
        Ok(e) => e,
        Err(_) => return Vec::new(),
    };

    let now = now_ms();
    let mut teams = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('_') || !entry.path().is_dir() {
            continue;
        }
        let paths = TeamPaths::discover(root, &name);
        let Some(config) = load_team_config(&paths) else {
            continue;
        };
        let claim = read_claim(&paths);
        let claim_fresh = claim
            .as_ref()
            .map(|c| !freshness(c, now, DEFAULT_CLAIM_STALE_MS).is_stale)
            .unwrap_or(false);
        teams.push(DiscoveredTeam {
            team_id: name,
            config,
            claim,
            claim_fresh,
        });
    }

    teams.sort_by(|a, b| b.config.updated_at.cmp(&a.config.updated_at));
    teams
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claim::{acquire, AcquireOptions};
    use crate::config::ensure_team_config;

    fn seed_team(root: &Path, team_id: &str) -> TeamPaths {
        let paths = TeamPaths::discover(root, team_id);
        paths.ensure_layout().unwrap();
        ensure_team_config(&paths, TeamConfig::new(team_id, "lead")).unwrap();
        paths
    }

    #[test]
    fn lists_teams_and_skips_underscored() {
        let tmp = tempfile::tempdir().unwrap();
        seed_team(tmp.path(), "alpha");
        seed_team(tmp.path(), "beta");
        seed_team(tmp.path(), "_scratch");
        std::fs::create_dir_all(tmp.path().join("no-config")).unwrap();

        let teams = list_discovered_teams(tmp.path());
        let ids: Vec<_> = teams.iter().map(|t| t.team_id.as_str()).collect();
        assert_eq!(teams.len(), 2);
        assert!(ids.contains(&"alpha") && ids.contains(&"beta"));
    }

    #[test]
    fn claim_freshness_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = seed_team(tmp.path(), "alpha");
        seed_team(tmp.path(), "beta");
        acquire(&paths, "s1", AcquireOptions::default()).unwrap();

        let teams = list_discovered_teams(tmp.path());
        let alpha = teams.iter().find(|t| t.team_id == "alpha").unwrap();
        let beta = teams.iter().find(|t| t.team_id == "beta").unwrap();
        assert!(alpha.claim_fresh);
        assert_eq!(
            alpha.claim.as_ref().unwrap().holder_session_id,
            "s1"
        );
        assert!(!beta.claim_fresh);
        assert!(beta.claim.is_none());
    }

    #[test]
    fn stale_claims_are_not_fresh() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = seed_team(tmp.path(), "alpha");
        acquire(
            &paths,
            "s1",
            AcquireOptions {
                now_ms: Some(now_ms() - 120_000),
                ..Default::default()
            },
        )
        .unwrap();

        let teams = list_discovered_teams(tmp.path());
        assert!(!teams[0].claim_fresh);
        assert!(teams[0].claim.is_some());
    }

    #[test]
    fn missing_root_is_empty() {
        let teams = list_discovered_teams(Path::new("/definitely/not/here"));
        assert!(teams.is_empty());
    }
}

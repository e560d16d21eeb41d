pub mod claim;
pub mod config;
pub mod discover;
pub mod lock;
pub mod mailbox;
pub mod tasks;

use std::io::Write;
use std::path::{Path, PathBuf};

use pi_teams_core::sanitize_name;

// ── Team directory layout ──

/// All well-known paths under one team directory. Pure computation.
#[derive(Debug, Clone)]
pub struct TeamPaths {
    pub root: PathBuf,
    pub team_dir: PathBuf,
    pub config_json: PathBuf,
    pub config_lock: PathBuf,
    pub claim_file: PathBuf,
    pub claim_lock: PathBuf,
    pub tasklists_dir: PathBuf,
    pub mailbox_dir: PathBuf,
    pub hook_logs_dir: PathBuf,
}

impl TeamPaths {
    /// Derive all paths for a team under a teams root.
    pub fn discover(root: impl Into<PathBuf>, team_id: &str) -> Self {
        let root = root.into();
        let team_dir = root.join(team_id);
        Self {
            config_json: team_dir.join("config.json"),
            config_lock: team_dir.join("config.json.lock"),
            claim_file: team_dir.join(".attach-claim.json"),
            claim_lock: team_dir.join(".attach-claim.json.lock"),
            tasklists_dir: team_dir.join("tasklists"),
            mailbox_dir: team_dir.join("mailbox"),
            hook_logs_dir: team_dir.join("hook-logs"),
            team_dir,
            root,
        }
    }

    /// Create the directory skeleton. Idempotent.
    pub fn ensure_layout(&self) -> anyhow::Result<()> {
        for dir in [
            &self.team_dir,
            &self.tasklists_dir,
            &self.mailbox_dir,
            &self.hook_logs_dir,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn task_list_file(&self, task_list_id: &str) -> PathBuf {
        self.tasklists_dir.join(format!("{task_list_id}.json"))
    }

    pub fn task_list_lock(&self, task_list_id: &str) -> PathBuf {
        self.tasklists_dir.join(format!("{task_list_id}.json.lock"))
    }

    /// One mailbox file per recipient per namespace.
    pub fn mailbox_file(&self, namespace: &str, recipient: &str) -> PathBuf {
        self.mailbox_dir
            .join(namespace)
            .join(format!("{}.json", sanitize_name(recipient)))
    }

    pub fn mailbox_lock(&self, namespace: &str, recipient: &str) -> PathBuf {
        self.mailbox_dir
            .join(namespace)
            .join(format!("{}.json.lock", sanitize_name(recipient)))
    }
}

/// Mailbox namespace for control traffic (DMs, broadcasts, shutdown).
pub const TEAM_NAMESPACE: &str = "team";

/// Resolve the teams root: `PI_TEAMS_ROOT_DIR`, else the per-user data
/// dir, else a dot-dir fallback.
pub fn default_teams_root() -> PathBuf {
    if let Ok(dir) = std::env::var("PI_TEAMS_ROOT_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    if let Some(data_dir) = dirs::data_dir() {
        data_dir.join("pi-teams").join("teams")
    } else if let Some(home) = dirs::home_dir() {
        home.join(".pi-teams").join("teams")
    } else {
        PathBuf::from(".pi-teams-store")
    }
}

// ── Atomic writes ──

/// Atomic write: write to a temp file in the same dir, then rename.
/// A concurrent reader sees either the prior version or the new one,
/// never a partial file.
pub fn write_atomic(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("no parent dir for {}", path.display()))?;
    std::fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(data)?;
    tmp.flush()?;
    tmp.persist(path)?;
    Ok(())
}

// ── Time ──

/// Current wall clock as an RFC 3339 UTC string.
pub fn now_rfc3339() -> String {
    let now = time::OffsetDateTime::now_utc();
    now.format(&time::format_description::well_known::Rfc3339)
        .expect("RFC3339 formatting should not fail")
}

/// Current wall clock in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Format a millisecond epoch as RFC 3339 UTC.
pub fn ms_to_rfc3339(ms: u64) -> String {
    time::OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000)
        .unwrap_or(time::OffsetDateTime::UNIX_EPOCH)
        .format(&time::format_description::well_known::Rfc3339)
        .expect("RFC3339 formatting should not fail")
}

/// Parse an RFC 3339 timestamp to millisecond epoch. `None` on any
/// malformed input.
pub fn rfc3339_to_ms(ts: &str) -> Option<u64> {
    let parsed =
        time::OffsetDateTime::parse(ts, &time::format_description::well_known::Rfc3339).ok()?;
    let nanos = parsed.unix_timestamp_nanos();
    if nanos < 0 {
        return None;
    }
    Some((nanos / 1_000_000) as u64)
}

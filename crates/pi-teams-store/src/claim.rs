//! Attach claim: a heartbeated exclusive lease on a team directory.
//!
//! At most one leader session owns a team directory at a time. A claim
//! whose heartbeat is older than the staleness threshold (or unparseable)
//! may be taken over.

use anyhow::Result;
use pi_teams_core::AttachClaim;

use crate::lock::{with_lock, LockOptions};
use crate::{ms_to_rfc3339, now_ms, rfc3339_to_ms, write_atomic, TeamPaths};

/// Default claim staleness threshold: 30 seconds without a heartbeat.
pub const DEFAULT_CLAIM_STALE_MS: u64 = 30_000;

#[derive(Debug, Clone, Copy)]
pub struct AcquireOptions {
    pub force: bool,
    pub stale_ms: u64,
    /// Injectable clock for tests; `None` reads the system clock.
    pub now_ms: Option<u64>,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            force: false,
            stale_ms: DEFAULT_CLAIM_STALE_MS,
            now_ms: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AcquireOutcome {
    /// The claim is held by `claim`. `replaced` carries the displaced
    /// claim when a stale or forced takeover happened.
    Acquired {
        claim: AttachClaim,
        replaced: Option<AttachClaim>,
    },
    /// A fresh claim by another session refused the acquire.
    ClaimedByOther { claim: AttachClaim },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Updated,
    NotOwner,
    Missing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    NotOwner,
    NoClaim,
}

/// Freshness assessment of a claim against a clock. Pure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Freshness {
    pub is_stale: bool,
    pub age_ms: u64,
}

/// A claim is stale iff its heartbeat is older than `stale_ms` or
/// unparseable.
pub fn freshness(claim: &AttachClaim, now_ms: u64, stale_ms: u64) -> Freshness {
    match rfc3339_to_ms(&claim.heartbeat_at) {
        Some(hb) => {
            let age_ms = now_ms.saturating_sub(hb);
            Freshness {
                is_stale: age_ms > stale_ms,
                age_ms,
            }
        }
        None => Freshness {
            is_stale: true,
            age_ms: u64::MAX,
        },
    }
}

/// Read the current claim. Total: missing or torn files read as `None`.
pub fn read_claim(paths: &TeamPaths) -> Option<AttachClaim> {
    let content = std::fs::read_to_string(&paths.claim_file).ok()?;
    serde_json::from_str(&content).ok()
}

fn write_claim(paths: &TeamPaths, claim: &AttachClaim) -> Result<()> {
    let data = serde_json::to_string_pretty(claim)?;
    write_atomic(&paths.claim_file, data.as_bytes())
}

/// Acquire or refresh the claim for `holder_session_id`.
///
/// - no current claim → write a new one
/// - same holder → refresh `heartbeatAt`, keep `claimedAt`
/// - stale or `force` → overwrite, reporting the displaced claim
/// - otherwise → refuse
pub fn acquire(
    paths: &TeamPaths,
    holder_session_id: &str,
    opts: AcquireOptions,
) -> Result<AcquireOutcome> {
    with_lock(&paths.claim_lock, LockOptions::default(), || {
        let now = opts.now_ms.unwrap_or_else(now_ms);
        let now_ts = ms_to_rfc3339(now);

        let current = read_claim(paths);
        match current {
            None => {
                let claim = AttachClaim {
                    holder_session_id: holder_session_id.to_string(),
                    claimed_at: now_ts.clone(),
                    heartbeat_at: now_ts,
                    pid: std::process::id(),
                };
                write_claim(paths, &claim)?;
                Ok(AcquireOutcome::Acquired {
                    claim,
                    replaced: None,
                })
            }
            Some(cur) if cur.holder_session_id == holder_session_id => {
                let claim = AttachClaim {
                    heartbeat_at: now_ts,
                    ..cur
                };
                write_claim(paths, &claim)?;
                Ok(AcquireOutcome::Acquired {
                    claim,
                    replaced: None,
                })
            }
            Some(cur) => {
                if opts.force || freshness(&cur, now, opts.stale_ms).is_stale {
                    let claim = AttachClaim {
                        holder_session_id: holder_session_id.to_string(),
                        claimed_at: now_ts.clone(),
                        heartbeat_at: now_ts,
                        pid: std::process::id(),
                    };
                    write_claim(paths, &claim)?;
                    Ok(AcquireOutcome::Acquired {
                        claim,
                        replaced: Some(cur),
                    })
                } else {
                    Ok(AcquireOutcome::ClaimedByOther { claim: cur })
                }
            }
        }
    })
}

/// Refresh the heartbeat of a held claim.
pub fn heartbeat(paths: &TeamPaths, holder_session_id: &str) -> Result<HeartbeatOutcome> {
    with_lock(&paths.claim_lock, LockOptions::default(), || {
        match read_claim(paths) {
            None => Ok(HeartbeatOutcome::Missing),
            Some(cur) if cur.holder_session_id != holder_session_id => {
                Ok(HeartbeatOutcome::NotOwner)
            }
            Some(cur) => {
                let claim = AttachClaim {
                    heartbeat_at: ms_to_rfc3339(now_ms()),
                    ..cur
                };
                write_claim(paths, &claim)?;
                Ok(HeartbeatOutcome::Updated)
            }
        }
    })
}

/// Release a held claim. A missing file is tolerated.
pub fn release(paths: &TeamPaths, holder_session_id: &str, force: bool) -> Result<ReleaseOutcome> {
    with_lock(&paths.claim_lock, LockOptions::default(), || {
        match read_claim(paths) {
            None => Ok(ReleaseOutcome::NoClaim),
            Some(cur) if cur.holder_session_id != holder_session_id && !force => {
                Ok(ReleaseOutcome::NotOwner)
            }
            Some(_) => {
                std::fs::remove_file(&paths.claim_file).ok();
                Ok(ReleaseOutcome::Released)
            }
        }
    })
}

//! Cross-process mutual exclusion on a lock path.
//!
//! Acquisition creates the lock file exclusively; contention retries with
//! bounded exponential backoff. The lock body records the holder's pid and
//! acquire timestamp so a crashed holder can be displaced once stale.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Default staleness threshold before a held lock may be broken.
pub const DEFAULT_LOCK_STALE_MS: u64 = 10_000;

/// Default total wait before acquisition gives up.
pub const DEFAULT_LOCK_WAIT_MS: u64 = 5_000;

#[derive(Debug, Clone, Copy)]
pub struct LockOptions {
    pub stale_ms: u64,
    pub max_wait_ms: u64,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            stale_ms: DEFAULT_LOCK_STALE_MS,
            max_wait_ms: DEFAULT_LOCK_WAIT_MS,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LockBody {
    pid: u32,
    acquired_at_ms: u64,
}

/// A held lock. Released on drop, including unwind paths.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Acquire the lock at `lock_path`, breaking stale holders.
pub fn acquire(lock_path: &Path, opts: LockOptions) -> Result<LockGuard> {
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut waited = Duration::ZERO;
    let mut backoff = Duration::from_millis(5);

    loop {
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(lock_path)
        {
            Ok(file) => {
                let body = LockBody {
                    pid: std::process::id(),
                    acquired_at_ms: crate::now_ms(),
                };
                serde_json::to_writer(&file, &body)
                    .with_context(|| format!("writing lock body: {}", lock_path.display()))?;
                file.sync_all().ok();
                return Ok(LockGuard {
                    path: lock_path.to_path_buf(),
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if holder_is_stale(lock_path, opts.stale_ms) {
                    // Break the stale lock; the create_new retry arbitrates
                    // between concurrent breakers.
                    let _ = std::fs::remove_file(lock_path);
                    continue;
                }
                if waited.as_millis() as u64 >= opts.max_wait_ms {
                    bail!(
                        "lock busy after {}ms: {}",
                        opts.max_wait_ms,
                        lock_path.display()
                    );
                }
                std::thread::sleep(backoff);
                waited += backoff;
                backoff = (backoff * 2).min(Duration::from_millis(100));
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("creating lock file: {}", lock_path.display()))
            }
        }
    }
}

/// A lock whose body is unreadable or older than `stale_ms` may be broken.
fn holder_is_stale(lock_path: &Path, stale_ms: u64) -> bool {
    let content = match std::fs::read_to_string(lock_path) {
        Ok(c) => c,
        // Racing with a release: treat as breakable and let create_new decide.
        Err(_) => return true,
    };
    match serde_json::from_str::<LockBody>(&content) {
        Ok(body) => crate::now_ms().saturating_sub(body.acquired_at_ms) > stale_ms,
        Err(_) => true,
    }
}

/// Run `f` while holding the lock at `lock_path`. The lock is released on
/// every exit path, including when `f` fails.
pub fn with_lock<T>(
    lock_path: &Path,
    opts: LockOptions,
    f: impl FnOnce() -> Result<T>,
) -> Result<T> {
    let guard = acquire(lock_path, opts)?;
    let out = f();
    drop(guard);
    out
}

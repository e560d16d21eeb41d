//! Error kinds shared across the coordination kernel.
//!
//! The coordinator never throws across the tool boundary; these kinds
//! classify expected failures so callers can render them without string
//! matching.

#[derive(Debug, thiserror::Error)]
pub enum CoordError {
    /// Missing team, task, member, or pending approval. Non-fatal.
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed override, bad enum value, missing required argument.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Claimed by another session, dependency cycle, already-running worker.
    #[error("conflict: {0}")]
    Conflict(String),

    /// RPC deadline exceeded. The worker is not assumed dead.
    #[error("{what} timed out after {after_ms}ms")]
    Timeout { what: String, after_ms: u64 },

    /// Worker terminated before responding.
    #[error("worker \"{name}\" exited{}", code.map(|c| format!(" with code {c}")).unwrap_or_default())]
    ProcessExit { name: String, code: Option<i32> },

    /// Filesystem write failure. Read faults are recovered locally as
    /// missing data and never reach this variant.
    #[error("io fault: {0}")]
    IoFault(String),
}

impl CoordError {
    /// Stable kind tag for structured results.
    pub fn kind(&self) -> &'static str {
        match self {
            CoordError::NotFound(_) => "not_found",
            CoordError::InvalidInput(_) => "invalid_input",
            CoordError::Conflict(_) => "conflict",
            CoordError::Timeout { .. } => "timeout",
            CoordError::ProcessExit { .. } => "process_exit",
            CoordError::IoFault(_) => "io_fault",
        }
    }
}

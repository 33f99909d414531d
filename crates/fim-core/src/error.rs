//! Error taxonomy shared by every FIM component.
//!
//! Only a failure to open the entry store at startup is fatal to the agent;
//! every other variant is logged by the caller and the monitoring loop keeps
//! going.

use std::io;
use std::path::PathBuf;

pub type Result<T, E = FimError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum FimError {
    /// Bad or missing watched path at registration time. The path is kept
    /// pending and retried at the next scheduled scan.
    #[error("configuration error for {path}: {reason}")]
    Configuration { path: PathBuf, reason: String },

    /// stat/read failure on a path. Treated as a deletion candidate and
    /// resolved by the next scheduled scan.
    #[error("cannot access {path}: {source}")]
    Access {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Path filtered out by ignore/restrict/depth rules. Never surfaced as an
    /// error condition to the operator.
    #[error("{path} filtered by policy: {reason}")]
    Policy { path: PathBuf, reason: String },

    /// Kernel watch table full, audit queue overflow and the like.
    #[error("resource exhausted: {0}")]
    ResourceExhaustion(String),

    /// Audit mechanism could not be initialised or failed its health check.
    #[error("audit subsystem unavailable: {0}")]
    AuditUnavailable(String),

    #[error("sync round {round} timed out")]
    SyncTimeout { round: usize },

    #[error("sync protocol error: {0}")]
    Protocol(String),

    #[error("real-time backend closed")]
    BackendClosed,

    /// No usable mechanism for a requested capability on this platform.
    #[error("unsupported on this platform: {0}")]
    Unsupported(String),

    #[error("entry store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl FimError {
    pub fn access(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Access {
            path: path.into(),
            source,
        }
    }

    pub fn policy(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Policy {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn configuration(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Policy rejections are expected traffic, not failures.
    pub fn is_policy(&self) -> bool {
        matches!(self, Self::Policy { .. })
    }
}

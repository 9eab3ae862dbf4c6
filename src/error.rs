//! Error types for the devbox engine.

use std::time::Duration;
use thiserror::Error;

/// Top-level error type for engine operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The instance belongs to a different team than the caller.
    #[error("instance {instance_id} does not belong to team {team_id}")]
    Forbidden { instance_id: String, team_id: String },

    /// The caller may not act for the team.
    #[error("caller {caller} may not act for team {team_id}")]
    CallerForbidden { caller: String, team_id: String },

    /// The provider has no record of the instance.
    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    /// Required network services never appeared on the instance.
    #[error("instance {instance_id} is missing required services on ports {missing:?}")]
    ServiceUnavailable {
        instance_id: String,
        missing: Vec<u16>,
    },

    /// The primary repository could not be cloned or checked out.
    #[error("failed to hydrate {repo}: {reason}")]
    Hydration { repo: String, reason: String },

    /// Input was rejected before any remote side effect.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The source host rejected the credentials.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// A remote command exited non-zero.
    #[error("remote command failed: code={code:?}, output={output}")]
    Exec { code: Option<i32>, output: String },

    /// A remote call exceeded its time budget.
    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),

    /// Transport or HTTP failure talking to the sandbox provider.
    #[error("provider error: {0}")]
    Provider(String),

    /// Tooling required inside the sandbox is not installed.
    #[error("required tooling missing in sandbox: {0}")]
    ToolingMissing(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Secret store operation failed.
    #[error("secret store error: {0}")]
    Store(String),

    /// IO error on the local side.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns true for failures that a retry may fix.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Exec { .. } | Error::Timeout(_) | Error::Provider(_)
        )
    }
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

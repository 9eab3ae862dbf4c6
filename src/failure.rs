//! Failure classification for remote command output.
//!
//! Pattern-matches the output of git and source-host tooling to decide
//! whether a failure is an authentication rejection (never retried),
//! missing tooling (never retried) or transient.

use serde::{Deserialize, Serialize};

/// Classification of a failed remote command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The source host rejected the credentials or access.
    Authentication,
    /// The CLI tooling the command needs is not installed.
    ToolingMissing,
    /// Anything else; worth retrying.
    Transient,
}

/// Detects failure signatures in captured output.
pub struct FailureDetector {
    /// Known patterns for rejected credentials or access.
    auth_patterns: Vec<&'static str>,
    /// Known patterns for missing binaries.
    tooling_patterns: Vec<&'static str>,
}

impl Default for FailureDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl FailureDetector {
    /// Creates a detector with the default pattern set.
    pub fn new() -> Self {
        Self {
            auth_patterns: vec![
                "permission denied",
                "repository not found",
                "invalid credentials",
                "invalid username or password",
                "authentication failed",
                "bad credentials",
                "could not read username",
                "could not read password",
                "the requested url returned error: 403",
                "http 403",
                "error: 403",
                "403 forbidden",
            ],
            tooling_patterns: vec![
                "command not found",
                "not installed",
                "no such file or directory: gh",
                "tooling-missing",
            ],
        }
    }

    /// Classifies a failed command from its exit code and output.
    pub fn classify(&self, exit_code: Option<i32>, output: &str) -> FailureKind {
        let lower = output.to_lowercase();
        if Self::matches_any(&lower, &self.auth_patterns) {
            return FailureKind::Authentication;
        }
        if exit_code == Some(127) || Self::matches_any(&lower, &self.tooling_patterns) {
            return FailureKind::ToolingMissing;
        }
        FailureKind::Transient
    }

    /// Returns true if the output carries an authentication signature.
    pub fn is_auth_failure(&self, output: &str) -> bool {
        Self::matches_any(&output.to_lowercase(), &self.auth_patterns)
    }

    fn matches_any(lower: &str, patterns: &[&str]) -> bool {
        patterns.iter().any(|p| lower.contains(p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_git_permission_denied() {
        let detector = FailureDetector::new();
        let output = "remote: Permission to acme/api.git denied to bot.\n\
                      fatal: unable to access 'https://github.com/acme/api.git/': \
                      The requested URL returned error: 403";
        assert_eq!(detector.classify(Some(128), output), FailureKind::Authentication);
    }

    #[test]
    fn detects_repository_not_found() {
        let detector = FailureDetector::new();
        let output = "remote: Repository not found.\nfatal: repository 'https://github.com/acme/x.git/' not found";
        assert!(detector.is_auth_failure(output));
    }

    #[test]
    fn detects_ssh_permission_denied() {
        let detector = FailureDetector::new();
        assert_eq!(
            detector.classify(Some(128), "git@github.com: Permission denied (publickey)."),
            FailureKind::Authentication
        );
    }

    #[test]
    fn detects_missing_tooling() {
        let detector = FailureDetector::new();
        assert_eq!(
            detector.classify(Some(127), "bash: gh: command not found"),
            FailureKind::ToolingMissing
        );
        assert_eq!(detector.classify(Some(127), ""), FailureKind::ToolingMissing);
    }

    #[test]
    fn network_errors_are_transient() {
        let detector = FailureDetector::new();
        assert_eq!(
            detector.classify(
                Some(128),
                "fatal: unable to access 'https://github.com/a/b.git/': Could not resolve host: github.com"
            ),
            FailureKind::Transient
        );
        assert_eq!(
            detector.classify(Some(128), "error: RPC failed; curl 56 early EOF"),
            FailureKind::Transient
        );
    }
}

//! Repository reconciliation.
//!
//! Converges a workspace on a desired set of repositories: switches the
//! layout when the set size demands it, removes stale checkouts, then
//! clones what is missing. Tokens are minted once per installation and
//! clones run concurrently. A failing repository is reported in the
//! outcome without stopping the others.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::backoff::{retry, RetryPolicy};
use crate::collab::SourceHost;
use crate::config::RetryConfig;
use crate::error::{Error, Result};
use crate::failure::{FailureDetector, FailureKind};
use crate::repos::{
    validate_desired, LayoutMode, ObservedLayout, ObservedRepo, ObservedRepoState,
    ReconciliationPlan, RepoName, RepositoryBinding,
};
use crate::secrets::SecretsManager;
use crate::workspace::Workspace;

/// A repository that could not be converged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoFailure {
    pub repo: String,
    /// Redacted error message.
    pub error: String,
    pub is_auth_error: bool,
}

/// Result of one reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileOutcome {
    pub cloned: Vec<String>,
    pub removed: Vec<String>,
    pub failed: Vec<RepoFailure>,
}

impl ReconcileOutcome {
    /// Returns the failure recorded for `repo`, if any.
    pub fn failure_for(&self, repo: &RepoName) -> Option<&RepoFailure> {
        self.failed
            .iter()
            .find(|f| f.repo.eq_ignore_ascii_case(&repo.full_name()))
    }
}

fn display_name(repo: &ObservedRepo) -> String {
    repo.remote_repo()
        .map(|r| r.full_name())
        .unwrap_or_else(|| repo.name.clone())
}

/// Holds back clones whose target is still being removed.
struct RemovalGate {
    names: Vec<String>,
    everything: bool,
    done: watch::Receiver<bool>,
}

impl RemovalGate {
    fn new(to_remove: &[ObservedRepo], layout: ObservedLayout, done: watch::Receiver<bool>) -> Self {
        Self {
            names: to_remove.iter().map(|r| r.name.clone()).collect(),
            // Removing the root checkout empties the whole workspace.
            everything: layout == ObservedLayout::Single && !to_remove.is_empty(),
            done,
        }
    }

    fn blocks(&self, binding: &RepositoryBinding) -> bool {
        self.everything
            || self
                .names
                .iter()
                .any(|n| n.eq_ignore_ascii_case(binding.repo.name()))
    }

    async fn pass(&self, binding: &RepositoryBinding) {
        if self.blocks(binding) {
            let mut done = self.done.clone();
            // A dropped sender means removals are over as well.
            let _ = done.wait_for(|finished| *finished).await;
        }
    }
}

/// Drives a [`Workspace`] towards a desired repository set.
pub struct Reconciler {
    workspace: Arc<dyn Workspace>,
    source_host: Arc<dyn SourceHost>,
    policy: RetryPolicy,
    secrets: SecretsManager,
    detector: FailureDetector,
}

impl Reconciler {
    pub fn new(
        workspace: Arc<dyn Workspace>,
        source_host: Arc<dyn SourceHost>,
        retry_config: &RetryConfig,
        secrets: SecretsManager,
    ) -> Self {
        Self {
            workspace,
            source_host,
            policy: RetryPolicy::linear(
                retry_config.clone_max_attempts,
                Duration::from_millis(retry_config.clone_delay_ms),
            ),
            secrets,
            detector: FailureDetector::new(),
        }
    }

    /// Converges the workspace on `desired`.
    pub async fn reconcile(&self, desired: &[RepositoryBinding]) -> Result<ReconcileOutcome> {
        self.reconcile_with(desired, None).await
    }

    /// Like [`reconcile`](Self::reconcile), but clones only `only` when
    /// given. Layout and removals are still computed from the full set, so
    /// a later full call clones the rest without touching `only`.
    pub async fn reconcile_with(
        &self,
        desired: &[RepositoryBinding],
        only: Option<&RepoName>,
    ) -> Result<ReconcileOutcome> {
        let desired = validate_desired(desired)?;
        let mode = LayoutMode::for_count(desired.len());
        let mut outcome = ReconcileOutcome::default();

        let mut observed = self.observe().await?;
        if observed.layout.conflicts_with(mode) {
            observed = self.switch_layout(&observed, mode, &mut outcome).await?;
        }

        let plan = ReconciliationPlan::diff(&observed, &desired);
        tracing::info!(
            mode = ?mode,
            remove = plan.to_remove.len(),
            clone = plan.to_clone.len(),
            unchanged = plan.unchanged.len(),
            "reconciliation plan"
        );

        let to_clone: Vec<&RepositoryBinding> = plan
            .to_clone
            .iter()
            .filter(|b| only.map_or(true, |o| b.repo.same_repo(o)))
            .collect();

        let (removed_tx, removed_rx) = watch::channel(false);
        let gate = RemovalGate::new(&plan.to_remove, observed.layout, removed_rx);
        let removals = async {
            let results = self.remove_all(&plan.to_remove, observed.layout).await;
            let _ = removed_tx.send(true);
            results
        };
        let (removals, clones) = tokio::join!(removals, self.clone_all(&to_clone, mode, &gate));

        for (name, result) in removals {
            match result {
                Ok(()) => {
                    tracing::info!(repo = %name, "removed repository");
                    outcome.removed.push(name);
                }
                Err(err) => {
                    let error = self.secrets.redact(&err.to_string());
                    tracing::warn!(repo = %name, error = %error, "failed to remove repository");
                    outcome.failed.push(RepoFailure {
                        repo: name,
                        error,
                        is_auth_error: false,
                    });
                }
            }
        }
        for (repo, result) in clones {
            match result {
                Ok(()) => outcome.cloned.push(repo.full_name()),
                Err(err) => outcome.failed.push(self.failure(&repo, &err)),
            }
        }

        Ok(outcome)
    }

    async fn observe(&self) -> Result<ObservedRepoState> {
        retry(&self.policy, "observe workspace", |_| self.workspace.observe()).await
    }

    /// Clears a workspace whose layout disagrees with `mode`.
    ///
    /// An interrupted clear leaves the workspace to be emptied again by the
    /// next call; there is no rollback.
    async fn switch_layout(
        &self,
        observed: &ObservedRepoState,
        mode: LayoutMode,
        outcome: &mut ReconcileOutcome,
    ) -> Result<ObservedRepoState> {
        tracing::info!(from = ?observed.layout, to = ?mode, "switching workspace layout");
        let reset_failed = |reason: String| Error::Hydration {
            repo: "workspace".into(),
            reason: format!("workspace reset incomplete: {}", self.secrets.redact(&reason)),
        };

        retry(&self.policy, "clear workspace", |_| self.workspace.clear())
            .await
            .map_err(|e| reset_failed(e.to_string()))?;
        let after = self.observe().await?;
        if !after.repos.is_empty() {
            return Err(reset_failed(format!("{} checkouts remain", after.repos.len())));
        }

        outcome
            .removed
            .extend(observed.repos.iter().map(display_name));
        Ok(after)
    }

    async fn remove_all(
        &self,
        repos: &[ObservedRepo],
        layout: ObservedLayout,
    ) -> Vec<(String, Result<()>)> {
        join_all(repos.iter().map(|repo| async move {
            let name = display_name(repo);
            let label = format!("remove {}", name);
            let result = retry(&self.policy, &label, |_| self.workspace.remove(repo, layout)).await;
            (name, result)
        }))
        .await
    }

    async fn clone_all(
        &self,
        to_clone: &[&RepositoryBinding],
        mode: LayoutMode,
        gate: &RemovalGate,
    ) -> Vec<(RepoName, Result<()>)> {
        let mut results = Vec::new();

        // Group by installation, keeping first-seen order.
        let mut groups: Vec<(String, Vec<&RepositoryBinding>)> = Vec::new();
        for binding in to_clone.iter().copied() {
            match self.source_host.installation_for(&binding.repo).await {
                Ok(installation) => match groups.iter_mut().find(|(i, _)| *i == installation) {
                    Some((_, members)) => members.push(binding),
                    None => groups.push((installation, vec![binding])),
                },
                Err(err) => results.push((binding.repo.clone(), Err(err))),
            }
        }

        let cloned = join_all(
            groups
                .iter()
                .map(|(installation, members)| self.clone_group(installation, members, mode, gate)),
        )
        .await;

        results.extend(
            cloned
                .into_iter()
                .flatten()
                .map(|(binding, result)| (binding.repo.clone(), result)),
        );
        results
    }

    async fn clone_group<'b>(
        &self,
        installation: &str,
        members: &[&'b RepositoryBinding],
        mode: LayoutMode,
        gate: &RemovalGate,
    ) -> Vec<(&'b RepositoryBinding, Result<()>)> {
        let repos: Vec<RepoName> = members.iter().map(|b| b.repo.clone()).collect();
        let token = match self.source_host.mint_token(installation, &repos).await {
            Ok(token) => token,
            Err(err) => {
                let message = self.secrets.redact(&err.to_string());
                return members
                    .iter()
                    .map(|b| {
                        let err = match &err {
                            Error::Authentication(_) => Error::Authentication(message.clone()),
                            _ => Error::Provider(message.clone()),
                        };
                        (*b, Err(err))
                    })
                    .collect();
            }
        };

        let mut secrets = self.secrets.clone();
        if let Some(token) = &token {
            secrets.register("clone_token", token);
        }
        tracing::debug!(installation, repos = members.len(), "minted clone token");

        let token = token.as_ref();
        let secrets = &secrets;
        join_all(members.iter().map(|binding| async move {
            gate.pass(binding).await;
            let result = self.clone_one(binding, mode, token, secrets).await;
            (*binding, result)
        }))
        .await
    }

    async fn clone_one(
        &self,
        binding: &RepositoryBinding,
        mode: LayoutMode,
        token: Option<&SecretString>,
        secrets: &SecretsManager,
    ) -> Result<()> {
        let label = format!("clone {}", binding.repo);
        retry(&self.policy, &label, |attempt| async move {
            tracing::debug!(repo = %binding.repo, attempt, "cloning");
            match self.workspace.clone_repo(binding, mode, token).await {
                Ok(()) => {
                    tracing::info!(repo = %binding.repo, attempt, "cloned repository");
                    Ok(())
                }
                Err(Error::Exec { code, output }) => {
                    let output = secrets.redact(&output);
                    Err(match self.detector.classify(code, &output) {
                        FailureKind::Authentication => Error::Authentication(output),
                        FailureKind::ToolingMissing => Error::ToolingMissing(output),
                        FailureKind::Transient => Error::Exec { code, output },
                    })
                }
                Err(other) => Err(other),
            }
        })
        .await
    }

    fn failure(&self, repo: &RepoName, err: &Error) -> RepoFailure {
        let error = self.secrets.redact(&err.to_string());
        let is_auth_error = matches!(err, Error::Authentication(_));
        tracing::warn!(repo = %repo, auth = is_auth_error, error = %error, "repository not converged");
        RepoFailure {
            repo: repo.full_name(),
            error,
            is_auth_error,
        }
    }
}

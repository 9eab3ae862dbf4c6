//! Collaborator contracts consumed by the engine.
//!
//! The engine depends on these traits only; the in-process
//! implementations back the CLI and the tests.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use secrecy::SecretString;

use crate::error::{Error, Result};
use crate::repos::RepoName;

/// Source-hosting provider issuing repository access tokens.
#[async_trait]
pub trait SourceHost: Send + Sync {
    /// Resolves the app installation governing `repo`.
    async fn installation_for(&self, repo: &RepoName) -> Result<String>;

    /// Mints a short-lived token scoped to `repos` under `installation`.
    ///
    /// `None` means the repositories are cloned anonymously.
    async fn mint_token(&self, installation: &str, repos: &[RepoName])
        -> Result<Option<SecretString>>;
}

/// Source host with preconfigured tokens keyed by owner.
///
/// The installation of a repository is its owner (case-folded).
#[derive(Default)]
pub struct StaticTokenSourceHost {
    tokens: HashMap<String, SecretString>,
    default_token: Option<SecretString>,
}

impl StaticTokenSourceHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses `token` for every owner without a specific one.
    pub fn with_default_token(mut self, token: SecretString) -> Self {
        self.default_token = Some(token);
        self
    }

    /// Uses `token` for repositories of `owner`.
    pub fn with_owner_token(mut self, owner: &str, token: SecretString) -> Self {
        self.tokens.insert(owner.to_ascii_lowercase(), token);
        self
    }
}

#[async_trait]
impl SourceHost for StaticTokenSourceHost {
    async fn installation_for(&self, repo: &RepoName) -> Result<String> {
        Ok(repo.owner().to_ascii_lowercase())
    }

    async fn mint_token(
        &self,
        installation: &str,
        _repos: &[RepoName],
    ) -> Result<Option<SecretString>> {
        Ok(self
            .tokens
            .get(installation)
            .or(self.default_token.as_ref())
            .cloned())
    }
}

/// Opaque key-value store for secret payloads.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<SecretString>>;
    async fn set(&self, key: &str, value: SecretString) -> Result<()>;
}

/// Key under which an environment's `.env` payload is stored.
pub fn env_payload_key(environment_id: &str) -> String {
    format!("env/{}", environment_id)
}

/// In-memory [`SecretStore`].
#[derive(Default)]
pub struct MemorySecretStore {
    entries: RwLock<HashMap<String, SecretString>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(&self, key: &str) -> Result<Option<SecretString>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| Error::Store("secret store lock poisoned".into()))?;
        Ok(entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: SecretString) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| Error::Store("secret store lock poisoned".into()))?;
        entries.insert(key.to_string(), value);
        Ok(())
    }
}

/// Decides whether a caller may act on behalf of a team.
pub trait TeamAccess: Send + Sync {
    /// Fails with [`Error::CallerForbidden`] when `caller` may not act for
    /// `team_id`.
    fn authorize(&self, caller: &str, team_id: &str) -> Result<()>;
}

/// Fixed caller-to-teams table.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    grants: HashMap<String, Vec<String>>,
}

impl AllowList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(mut self, caller: &str, team_id: &str) -> Self {
        self.grants
            .entry(caller.to_string())
            .or_default()
            .push(team_id.to_string());
        self
    }
}

impl TeamAccess for AllowList {
    fn authorize(&self, caller: &str, team_id: &str) -> Result<()> {
        let allowed = self
            .grants
            .get(caller)
            .is_some_and(|teams| teams.iter().any(|t| t == team_id));
        if allowed {
            Ok(())
        } else {
            Err(Error::CallerForbidden {
                caller: caller.to_string(),
                team_id: team_id.to_string(),
            })
        }
    }
}

/// Accepts every caller. For single-user CLI use.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrustCaller;

impl TeamAccess for TrustCaller {
    fn authorize(&self, _caller: &str, _team_id: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[tokio::test]
    async fn static_host_prefers_owner_token() {
        let host = StaticTokenSourceHost::new()
            .with_default_token(SecretString::new("default".into()))
            .with_owner_token("Acme", SecretString::new("acme-token".into()));

        let acme: RepoName = "ACME/api".parse().unwrap();
        let other: RepoName = "other/web".parse().unwrap();

        let inst = host.installation_for(&acme).await.unwrap();
        assert_eq!(inst, "acme");
        let token = host.mint_token(&inst, &[acme]).await.unwrap().unwrap();
        assert_eq!(token.expose_secret(), "acme-token");

        let inst = host.installation_for(&other).await.unwrap();
        let token = host.mint_token(&inst, &[other]).await.unwrap().unwrap();
        assert_eq!(token.expose_secret(), "default");
    }

    #[tokio::test]
    async fn static_host_without_tokens_is_anonymous() {
        let host = StaticTokenSourceHost::new();
        assert!(host.mint_token("acme", &[]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemorySecretStore::new();
        let key = env_payload_key("env_1");
        assert_eq!(key, "env/env_1");
        assert!(store.get(&key).await.unwrap().is_none());

        store.set(&key, SecretString::new("A=1".into())).await.unwrap();
        let value = store.get(&key).await.unwrap().unwrap();
        assert_eq!(value.expose_secret(), "A=1");
    }

    #[test]
    fn allow_list_checks_grants() {
        let access = AllowList::new().grant("alice", "team-a");
        assert!(access.authorize("alice", "team-a").is_ok());
        assert!(access.authorize("alice", "team-b").is_err());
        assert!(matches!(
            access.authorize("bob", "team-a"),
            Err(Error::CallerForbidden { .. })
        ));
        assert!(TrustCaller.authorize("anyone", "team-x").is_ok());
    }
}

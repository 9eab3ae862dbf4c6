//! Request-level orchestration.
//!
//! [`Engine`] is what the rest of an application calls: provisioning,
//! reconcile-only, script updates and the plain lifecycle calls. Work the
//! caller should not wait for runs as tracked background tasks.

use std::collections::BTreeMap;
use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::bootstrap::{encode_env_payload, parse_dotenv, Bootstrapper, EnvTarget, GitIdentity};
use crate::collab::{env_payload_key, SecretStore, SourceHost, TeamAccess};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::lifecycle::{InstanceManager, StartOptions};
use crate::reconcile::{ReconcileOutcome, Reconciler, RepoFailure};
use crate::repos::{validate_desired, RepoName, RepositoryBinding};
use crate::sandbox::{InstanceStatus, SandboxHandle, SandboxProvider};
use crate::scripts::{ScriptFailure, ScriptSupervisor};
use crate::secrets::SecretsManager;
use crate::tasks::TaskTracker;
use crate::workspace::RemoteWorkspace;

/// Provisioning request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionRequest {
    pub team_id: String,
    pub existing_instance_id: Option<String>,
    pub snapshot_id: Option<String>,
    /// Environment whose `.env` payload is applied.
    pub environment_id: Option<String>,
    /// Desired repositories; the workspace is left alone when absent.
    pub repos: Option<Vec<RepositoryBinding>>,
    /// Repository hydrated before the response; the first desired one
    /// when absent.
    pub primary_repo: Option<RepoName>,
    pub ttl_secs: Option<u64>,
    pub git_identity: Option<GitIdentity>,
    pub maintenance_script: Option<String>,
    pub dev_script: Option<String>,
}

/// Provisioning result. Background task IDs are included so callers can
/// follow convergence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionResponse {
    pub instance_id: String,
    pub resumed: bool,
    pub editor_url: String,
    pub worker_url: String,
    pub cloned: Vec<String>,
    pub removed: Vec<String>,
    pub failed: Vec<RepoFailure>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<String>,
}

/// Reconcile-only request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileRequest {
    pub instance_id: String,
    pub team_id: String,
    #[serde(default)]
    pub repos: Vec<RepositoryBinding>,
}

/// Script update request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptUpdateRequest {
    pub instance_id: String,
    pub team_id: String,
    pub maintenance_script: Option<String>,
    pub dev_script: Option<String>,
}

/// Script update result; empty when every requested script ran.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptUpdateResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintenance_error: Option<ScriptFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev_error: Option<ScriptFailure>,
}

/// The sandbox lifecycle and reconciliation engine.
pub struct Engine {
    config: EngineConfig,
    instances: InstanceManager,
    source_host: Arc<dyn SourceHost>,
    secret_store: Arc<dyn SecretStore>,
    access: Arc<dyn TeamAccess>,
    tasks: TaskTracker,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        provider: Arc<dyn SandboxProvider>,
        source_host: Arc<dyn SourceHost>,
        secret_store: Arc<dyn SecretStore>,
        access: Arc<dyn TeamAccess>,
    ) -> Self {
        let instances = InstanceManager::new(
            provider,
            config.services.clone(),
            config.instance.clone(),
        );
        let tasks = TaskTracker::with_retention(
            config.tasks.retain_per_instance,
            config.tasks.retain_for(),
        );
        Self {
            config,
            instances,
            source_host,
            secret_store,
            access,
            tasks,
        }
    }

    /// Background tasks spawned by this engine.
    pub fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    /// Starts or resumes an instance and hydrates it.
    ///
    /// The primary repository is cloned before this returns; identity,
    /// source-host login, the remaining repositories and scripts converge
    /// in background tasks listed in the response.
    pub async fn provision(&self, caller: &str, req: ProvisionRequest) -> Result<ProvisionResponse> {
        self.access.authorize(caller, &req.team_id)?;
        let desired = req.repos.as_deref().map(validate_desired).transpose()?;
        let primary = primary_repo(&req, desired.as_deref())?;
        if let Some(identity) = &req.git_identity {
            identity.validate()?;
        }

        let opts = StartOptions {
            team_id: req.team_id.clone(),
            existing_instance_id: req.existing_instance_id.clone(),
            snapshot_id: req.snapshot_id.clone(),
            environment_id: req.environment_id.clone(),
            ttl_secs: req.ttl_secs,
        };
        let (started, env_payload) = tokio::join!(
            self.instances.start_or_resume(&opts),
            self.load_env(req.environment_id.as_deref())
        );
        let (instance, resumed) = started?;
        let fresh = !resumed;
        let urls = self.instances.ensure_services(&instance, fresh).await?;

        let handle = self.handle(&instance.id);
        let mut secrets = SecretsManager::new();
        let mut warnings = Vec::new();

        match env_payload {
            Ok(Some(raw)) => {
                if let Err(err) = self.apply_env(&handle, &mut secrets, &raw).await {
                    let message = secrets.redact(&err.to_string());
                    tracing::warn!(instance_id = %instance.id, error = %message, "env not applied");
                    warnings.push(format!("env not applied: {}", message));
                }
            }
            Ok(None) => {}
            Err(err) => warnings.push(format!("env not loaded: {}", secrets.redact(&err.to_string()))),
        }

        let reconciler = Arc::new(self.reconciler(handle.clone(), secrets.clone()));
        let mut outcome = ReconcileOutcome::default();
        if let (Some(desired), Some(primary)) = (&desired, &primary) {
            let hydrated = match reconciler.reconcile_with(desired, Some(primary)).await {
                Ok(result) => match result.failure_for(primary) {
                    Some(failure) => Err(Error::Hydration {
                        repo: primary.full_name(),
                        reason: failure.error.clone(),
                    }),
                    None => Ok(result),
                },
                Err(err @ Error::Hydration { .. }) => Err(err),
                Err(err) => Err(Error::Hydration {
                    repo: primary.full_name(),
                    reason: secrets.redact(&err.to_string()),
                }),
            };
            match hydrated {
                Ok(result) => outcome = result,
                Err(err) => {
                    tracing::error!(instance_id = %instance.id, repo = %primary, error = %err, "primary hydration failed");
                    if fresh {
                        self.instances.stop_quietly(&instance.id).await;
                    }
                    return Err(err);
                }
            }
        }

        let mut task_ids = Vec::new();

        if let Some(identity) = req.git_identity.clone() {
            let bootstrapper = self.bootstrapper(handle.clone(), secrets.clone());
            task_ids.push(self.tasks.spawn(&instance.id, "git-identity", secrets.clone(), async move {
                bootstrapper.configure_git_identity(&identity).await
            }));
        }

        if let Some(primary) = primary.clone() {
            let bootstrapper = self.bootstrapper(handle.clone(), secrets.clone());
            let source_host = self.source_host.clone();
            task_ids.push(self.tasks.spawn(&instance.id, "source-host-auth", secrets.clone(), async move {
                let installation = source_host.installation_for(&primary).await?;
                match source_host.mint_token(&installation, &[primary]).await? {
                    Some(token) => bootstrapper.configure_source_host_access(&token).await,
                    None => {
                        tracing::debug!(installation = %installation, "no token issued, skipping source host login");
                        Ok(())
                    }
                }
            }));
        }

        let has_scripts = req.maintenance_script.is_some() || req.dev_script.is_some();
        if desired.is_some() || has_scripts || resumed {
            let supervisor = self.supervisor(handle.clone(), secrets.clone());
            let maintenance = req.maintenance_script.clone();
            let dev = req.dev_script.clone();
            task_ids.push(self.tasks.spawn(&instance.id, "workspace-refresh", secrets.clone(), async move {
                if let Some(desired) = desired {
                    let refreshed = reconciler.reconcile(&desired).await?;
                    if !refreshed.failed.is_empty() {
                        return Err(not_converged(&refreshed.failed));
                    }
                }
                run_scripts(&supervisor, maintenance.as_deref(), dev.as_deref(), resumed).await
            }));
        }

        tracing::info!(
            instance_id = %instance.id,
            resumed,
            cloned = outcome.cloned.len(),
            removed = outcome.removed.len(),
            failed = outcome.failed.len(),
            "instance provisioned"
        );
        Ok(ProvisionResponse {
            instance_id: instance.id,
            resumed,
            editor_url: urls.editor,
            worker_url: urls.worker,
            cloned: outcome.cloned,
            removed: outcome.removed,
            failed: outcome.failed,
            warnings,
            tasks: task_ids,
        })
    }

    /// Converges an existing instance on `req.repos` and waits for it.
    pub async fn reconcile(&self, caller: &str, req: ReconcileRequest) -> Result<ReconcileOutcome> {
        self.access.authorize(caller, &req.team_id)?;
        let desired = validate_desired(&req.repos)?;
        let instance = self.instances.get_owned(&req.team_id, &req.instance_id).await?;
        ensure_ready(instance.status, &instance.id)?;

        let handle = self.handle(&instance.id);
        self.reconciler(handle, SecretsManager::new())
            .reconcile(&desired)
            .await
    }

    /// Runs the maintenance script, then replaces the dev run.
    pub async fn update_scripts(
        &self,
        caller: &str,
        req: ScriptUpdateRequest,
    ) -> Result<ScriptUpdateResponse> {
        self.access.authorize(caller, &req.team_id)?;
        let instance = self.instances.get_owned(&req.team_id, &req.instance_id).await?;
        ensure_ready(instance.status, &instance.id)?;

        let supervisor = self.supervisor(self.handle(&instance.id), SecretsManager::new());
        let mut response = ScriptUpdateResponse::default();
        if let Some(content) = &req.maintenance_script {
            response.maintenance_error = supervisor.run_maintenance(content).await.err();
        }
        if let Some(content) = &req.dev_script {
            response.dev_error = supervisor.start_dev(content).await.err();
        }
        Ok(response)
    }

    pub async fn pause(&self, caller: &str, team_id: &str, instance_id: &str) -> Result<()> {
        self.access.authorize(caller, team_id)?;
        self.instances.pause(team_id, instance_id).await
    }

    pub async fn stop(&self, caller: &str, team_id: &str, instance_id: &str) -> Result<()> {
        self.access.authorize(caller, team_id)?;
        self.instances.stop(team_id, instance_id).await
    }

    pub async fn publish_ports(
        &self,
        caller: &str,
        team_id: &str,
        instance_id: &str,
        ports: &[u16],
    ) -> Result<BTreeMap<u16, String>> {
        self.access.authorize(caller, team_id)?;
        self.instances.publish_ports(team_id, instance_id, ports).await
    }

    pub async fn snapshot(&self, caller: &str, team_id: &str, instance_id: &str) -> Result<String> {
        self.access.authorize(caller, team_id)?;
        self.instances.snapshot(team_id, instance_id).await
    }

    /// Stores a `.env` payload for an environment after checking it parses.
    pub async fn store_env(
        &self,
        caller: &str,
        team_id: &str,
        environment_id: &str,
        raw: SecretString,
    ) -> Result<()> {
        self.access.authorize(caller, team_id)?;
        let entries = parse_dotenv(raw.expose_secret())?;
        self.secret_store
            .set(&env_payload_key(environment_id), raw)
            .await?;
        tracing::info!(environment_id, vars = entries.len(), "stored env payload");
        Ok(())
    }

    async fn load_env(&self, environment_id: Option<&str>) -> Result<Option<SecretString>> {
        match environment_id {
            Some(id) => self.secret_store.get(&env_payload_key(id)).await,
            None => Ok(None),
        }
    }

    async fn apply_env(
        &self,
        handle: &Arc<SandboxHandle>,
        secrets: &mut SecretsManager,
        raw: &SecretString,
    ) -> Result<EnvTarget> {
        let entries = parse_dotenv(raw.expose_secret())?;
        secrets.register_env_values(&entries);
        let blob = encode_env_payload(raw.expose_secret())?;
        self.bootstrapper(handle.clone(), secrets.clone())
            .apply_env(&blob)
            .await
    }

    fn handle(&self, instance_id: &str) -> Arc<SandboxHandle> {
        Arc::new(
            self.instances
                .handle(instance_id, self.config.exec.timeout())
                .with_env_loader(&self.config.env.loader),
        )
    }

    fn reconciler(&self, handle: Arc<SandboxHandle>, secrets: SecretsManager) -> Reconciler {
        let workspace = RemoteWorkspace::new(
            handle,
            self.config.workspace.clone(),
            self.config.exec.clone_timeout(),
        );
        Reconciler::new(
            Arc::new(workspace),
            self.source_host.clone(),
            &self.config.retry,
            secrets,
        )
    }

    fn bootstrapper(&self, handle: Arc<SandboxHandle>, secrets: SecretsManager) -> Bootstrapper {
        Bootstrapper::new(
            handle,
            self.config.env.clone(),
            self.config.retry.clone(),
            self.config.workspace.git_host.clone(),
            secrets,
        )
    }

    fn supervisor(&self, handle: Arc<SandboxHandle>, secrets: SecretsManager) -> ScriptSupervisor {
        ScriptSupervisor::new(
            handle,
            self.config.scripts.clone(),
            self.config.workspace.root.clone(),
            secrets,
        )
    }
}

fn primary_repo(req: &ProvisionRequest, desired: Option<&[RepositoryBinding]>) -> Result<Option<RepoName>> {
    let desired = desired.unwrap_or_default();
    match &req.primary_repo {
        Some(primary) if desired.iter().any(|b| b.repo.same_repo(primary)) => Ok(Some(primary.clone())),
        Some(primary) => Err(Error::Validation(format!(
            "primary repository {} is not in the desired set",
            primary
        ))),
        None => Ok(desired.first().map(|b| b.repo.clone())),
    }
}

fn ensure_ready(status: InstanceStatus, instance_id: &str) -> Result<()> {
    if status == InstanceStatus::Ready {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "instance {} is {:?}, not ready",
            instance_id, status
        )))
    }
}

fn not_converged(failed: &[RepoFailure]) -> Error {
    let repos: Vec<&str> = failed.iter().map(|f| f.repo.as_str()).collect();
    Error::Hydration {
        repo: repos.join(", "),
        reason: failed
            .first()
            .map(|f| f.error.clone())
            .unwrap_or_default(),
    }
}

async fn run_scripts(
    supervisor: &ScriptSupervisor,
    maintenance: Option<&str>,
    dev: Option<&str>,
    resumed: bool,
) -> Result<()> {
    let script_error = |failure: ScriptFailure| Error::Exec {
        code: failure.exit_code,
        output: match &failure.log_tail {
            Some(tail) if !tail.is_empty() => format!("{}\n{}", failure, tail),
            _ => failure.to_string(),
        },
    };

    if let Some(content) = maintenance {
        supervisor.run_maintenance(content).await.map_err(script_error)?;
    }
    match dev {
        Some(content) => {
            supervisor.start_dev(content).await.map_err(script_error)?;
        }
        None if resumed => {
            supervisor.restart_dev().await.map_err(script_error)?;
        }
        None => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{AllowList, MemorySecretStore, StaticTokenSourceHost, TrustCaller};
    use crate::sandbox::{Instance, LocalShellProvider, META_TEAM_ID};
    use crate::tasks::TaskStatus;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.workspace.root = dir.path().join("ws").to_string_lossy().to_string();
        config.scripts.dir = dir.path().join("scripts").to_string_lossy().to_string();
        config.env.loader = "devbox-test-no-such-loader".into();
        config.env.dotfile = dir.path().join("env").to_string_lossy().to_string();
        config.env.shell_rc = dir.path().join(".bashrc").to_string_lossy().to_string();
        config.env.git_config_file = Some(dir.path().join(".gitconfig").to_string_lossy().to_string());
        config
    }

    fn engine(dir: &TempDir, provider: &Arc<LocalShellProvider>, access: Arc<dyn TeamAccess>) -> Engine {
        Engine::new(
            config(dir),
            provider.clone(),
            Arc::new(StaticTokenSourceHost::new()),
            Arc::new(MemorySecretStore::new()),
            access,
        )
    }

    fn request(team: &str) -> ProvisionRequest {
        ProvisionRequest {
            team_id: team.into(),
            snapshot_id: Some("snap-base".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn invalid_repos_are_rejected_before_any_call() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(LocalShellProvider::new());
        let engine = engine(&dir, &provider, Arc::new(TrustCaller));

        let mut req = request("team-a");
        req.repos = Some(vec![
            RepositoryBinding::new("acme/api".parse().unwrap()),
            RepositoryBinding::new("other/api".parse().unwrap()),
        ]);
        let err = engine.provision("cli", req).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn primary_must_be_desired() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(LocalShellProvider::new());
        let engine = engine(&dir, &provider, Arc::new(TrustCaller));

        let mut req = request("team-a");
        req.repos = Some(vec![RepositoryBinding::new("acme/api".parse().unwrap())]);
        req.primary_repo = Some("acme/web".parse().unwrap());
        assert!(matches!(
            engine.provision("cli", req).await,
            Err(Error::Validation(_))
        ));
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn caller_without_grant_is_rejected() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(LocalShellProvider::new());
        let engine = engine(
            &dir,
            &provider,
            Arc::new(AllowList::new().grant("alice", "team-a")),
        );

        assert!(matches!(
            engine.provision("mallory", request("team-a")).await,
            Err(Error::CallerForbidden { .. })
        ));
        assert!(engine.provision("alice", request("team-a")).await.is_ok());
        assert_eq!(
            provider.calls().iter().filter(|c| c.starts_with("start:")).count(),
            1
        );
    }

    #[tokio::test]
    async fn bare_provision_returns_service_urls() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(LocalShellProvider::new());
        let engine = engine(&dir, &provider, Arc::new(TrustCaller));

        let resp = engine.provision("cli", request("team-a")).await.unwrap();
        assert!(!resp.resumed);
        assert_eq!(resp.editor_url, "http://127.0.0.1:39378");
        assert_eq!(resp.worker_url, "http://127.0.0.1:39377");
        assert!(resp.tasks.is_empty());
        assert!(resp.cloned.is_empty());
    }

    #[tokio::test]
    async fn missing_service_fails_and_stops_new_instance() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(LocalShellProvider::new().with_unavailable_port(39378));
        let engine = engine(&dir, &provider, Arc::new(TrustCaller));

        let err = engine.provision("cli", request("team-a")).await.unwrap_err();
        assert!(matches!(err, Error::ServiceUnavailable { .. }));
        assert!(provider.calls().iter().any(|c| c.starts_with("stop:")));
    }

    #[tokio::test]
    async fn env_payload_reaches_dotfile() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(LocalShellProvider::new());
        let engine = engine(&dir, &provider, Arc::new(TrustCaller));
        engine
            .store_env(
                "cli",
                "team-a",
                "env_1",
                SecretString::new("API_KEY=sk_live_123456\nGREETING=\"hi \\\"there\\\"\"\n".into()),
            )
            .await
            .unwrap();

        let mut req = request("team-a");
        req.environment_id = Some("env_1".into());
        let resp = engine.provision("cli", req).await.unwrap();
        assert!(resp.warnings.is_empty(), "{:?}", resp.warnings);

        let dotfile = std::fs::read_to_string(dir.path().join("env")).unwrap();
        assert!(dotfile.contains("API_KEY=\"sk_live_123456\""));
        let rc = std::fs::read_to_string(dir.path().join(".bashrc")).unwrap();
        assert!(rc.contains(crate::bootstrap::SHELL_RC_MARKER));
    }

    #[tokio::test]
    async fn malformed_env_payload_is_not_stored() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(LocalShellProvider::new());
        let engine = engine(&dir, &provider, Arc::new(TrustCaller));
        let err = engine
            .store_env("cli", "team-a", "env_1", SecretString::new("1BAD=x\n".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn git_identity_runs_in_background() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(LocalShellProvider::new());
        let engine = engine(&dir, &provider, Arc::new(TrustCaller));

        let mut req = request("team-a");
        req.git_identity = Some(GitIdentity {
            name: "Ada Lovelace".into(),
            email: "ada@example.com".into(),
        });
        let resp = engine.provision("cli", req).await.unwrap();
        assert_eq!(resp.tasks.len(), 1);

        let record = engine.tasks().wait(&resp.tasks[0]).await.unwrap();
        assert_eq!(record.name, "git-identity");
        assert_eq!(record.status, TaskStatus::Succeeded);
        let gitconfig = std::fs::read_to_string(dir.path().join(".gitconfig")).unwrap();
        assert!(gitconfig.contains("Ada Lovelace"));
    }

    #[tokio::test]
    async fn reconcile_requires_ready_owned_instance() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(LocalShellProvider::new());
        provider.insert_instance(Instance {
            id: "inst_1".into(),
            status: InstanceStatus::Paused,
            metadata: HashMap::from([(META_TEAM_ID.to_string(), "team-a".to_string())]),
            services: Vec::new(),
        });
        let engine = engine(&dir, &provider, Arc::new(TrustCaller));

        let req = |team: &str| ReconcileRequest {
            instance_id: "inst_1".into(),
            team_id: team.into(),
            repos: Vec::new(),
        };
        assert!(matches!(
            engine.reconcile("cli", req("team-b")).await,
            Err(Error::Forbidden { .. })
        ));
        assert!(matches!(
            engine.reconcile("cli", req("team-a")).await,
            Err(Error::Validation(_))
        ));
        assert!(!provider.calls().iter().any(|c| c.starts_with("exec:")));
    }

    /// Fails every workspace observation with a transport error.
    struct UnobservableWorkspace {
        inner: Arc<LocalShellProvider>,
    }

    #[async_trait::async_trait]
    impl SandboxProvider for UnobservableWorkspace {
        async fn start(&self, req: crate::sandbox::StartRequest) -> Result<Instance> {
            self.inner.start(req).await
        }

        async fn get(&self, instance_id: &str) -> Result<Instance> {
            self.inner.get(instance_id).await
        }

        async fn exec(
            &self,
            instance_id: &str,
            command: &str,
            timeout: std::time::Duration,
        ) -> Result<crate::sandbox::ExecOutput> {
            if command.contains("layout=") {
                return Err(Error::Provider("connection reset by peer".into()));
            }
            self.inner.exec(instance_id, command, timeout).await
        }

        async fn pause(&self, instance_id: &str) -> Result<()> {
            self.inner.pause(instance_id).await
        }

        async fn resume(&self, instance_id: &str) -> Result<Instance> {
            self.inner.resume(instance_id).await
        }

        async fn stop(&self, instance_id: &str) -> Result<()> {
            self.inner.stop(instance_id).await
        }

        async fn expose_service(&self, instance_id: &str, port: u16, name: &str) -> Result<String> {
            self.inner.expose_service(instance_id, port, name).await
        }

        async fn snapshot(&self, instance_id: &str) -> Result<String> {
            self.inner.snapshot(instance_id).await
        }
    }

    #[tokio::test]
    async fn unreachable_workspace_fails_primary_hydration() {
        let dir = TempDir::new().unwrap();
        let local = Arc::new(LocalShellProvider::new());
        let mut config = config(&dir);
        config.retry.clone_delay_ms = 1;
        let engine = Engine::new(
            config,
            Arc::new(UnobservableWorkspace { inner: local.clone() }),
            Arc::new(StaticTokenSourceHost::new()),
            Arc::new(MemorySecretStore::new()),
            Arc::new(TrustCaller),
        );

        let mut req = request("team-a");
        req.repos = Some(vec![RepositoryBinding::new("acme/api".parse().unwrap())]);
        match engine.provision("cli", req).await.unwrap_err() {
            Error::Hydration { repo, reason } => {
                assert_eq!(repo, "acme/api");
                assert!(reason.contains("connection reset"));
            }
            other => panic!("unexpected error {other}"),
        }
        assert!(local.calls().iter().any(|c| c.starts_with("stop:")));
    }
}

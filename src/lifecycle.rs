//! Instance lifecycle management.
//!
//! Every operation on an existing instance first checks that the caller's
//! team matches the team recorded in the instance metadata at creation.
//! A mismatch fails with [`Error::Forbidden`] before any mutating call.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};

use crate::config::{InstanceConfig, ServicesConfig};
use crate::error::{Error, Result};
use crate::sandbox::{
    Instance, InstanceStatus, SandboxHandle, SandboxProvider, StartRequest, META_ENVIRONMENT_ID,
    META_TEAM_ID,
};

/// Parameters of [`InstanceManager::start_or_resume`].
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub team_id: String,
    pub existing_instance_id: Option<String>,
    pub snapshot_id: Option<String>,
    pub environment_id: Option<String>,
    pub ttl_secs: Option<u64>,
}

/// Public URLs of the two required services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceUrls {
    pub editor: String,
    pub worker: String,
}

/// Creates, resumes and tears down instances.
pub struct InstanceManager {
    provider: Arc<dyn SandboxProvider>,
    services: ServicesConfig,
    defaults: InstanceConfig,
}

impl InstanceManager {
    pub fn new(
        provider: Arc<dyn SandboxProvider>,
        services: ServicesConfig,
        defaults: InstanceConfig,
    ) -> Self {
        Self {
            provider,
            services,
            defaults,
        }
    }

    pub fn provider(&self) -> &Arc<dyn SandboxProvider> {
        &self.provider
    }

    /// Wraps an instance for command execution.
    pub fn handle(&self, instance_id: &str, exec_timeout: Duration) -> SandboxHandle {
        SandboxHandle::new(self.provider.clone(), instance_id, exec_timeout)
    }

    /// Fetches an instance and verifies it belongs to `team_id`.
    pub async fn get_owned(&self, team_id: &str, instance_id: &str) -> Result<Instance> {
        let instance = self.provider.get(instance_id).await?;
        authorize(&instance, team_id)?;
        Ok(instance)
    }

    /// Reuses `existing_instance_id` when given, otherwise boots a new
    /// instance. Returns the instance and whether it was reused.
    pub async fn start_or_resume(&self, opts: &StartOptions) -> Result<(Instance, bool)> {
        if let Some(id) = &opts.existing_instance_id {
            let instance = self.get_owned(&opts.team_id, id).await?;
            let instance = match instance.status {
                InstanceStatus::Paused => {
                    tracing::info!(instance_id = %id, "resuming paused instance");
                    self.provider.resume(id).await?
                }
                InstanceStatus::Stopped => {
                    return Err(Error::Validation(format!(
                        "instance {} is stopped and cannot be reused",
                        id
                    )))
                }
                InstanceStatus::Ready | InstanceStatus::Creating => instance,
            };
            tracing::info!(instance_id = %id, team_id = %opts.team_id, "reusing instance");
            return Ok((instance, true));
        }

        let snapshot_id = opts
            .snapshot_id
            .clone()
            .ok_or_else(|| Error::Validation("a snapshot is required to start an instance".into()))?;

        let mut metadata = HashMap::from([(META_TEAM_ID.to_string(), opts.team_id.clone())]);
        if let Some(env) = &opts.environment_id {
            metadata.insert(META_ENVIRONMENT_ID.to_string(), env.clone());
        }

        let instance = self
            .provider
            .start(StartRequest {
                snapshot_id,
                ttl_seconds: opts.ttl_secs.unwrap_or(self.defaults.default_ttl_secs),
                ttl_action: self.defaults.ttl_action,
                metadata,
            })
            .await?;
        tracing::info!(instance_id = %instance.id, team_id = %opts.team_id, "started instance");
        Ok((instance, false))
    }

    /// Resolves the editor and worker services, exposing them if needed.
    ///
    /// When either stays missing the call fails with
    /// [`Error::ServiceUnavailable`]; a `fresh` instance is stopped first.
    pub async fn ensure_services(&self, instance: &Instance, fresh: bool) -> Result<ServiceUrls> {
        let editor = self
            .resolve_service(instance, self.services.editor_port, "editor")
            .await;
        let worker = self
            .resolve_service(instance, self.services.worker_port, "worker")
            .await;

        match (editor, worker) {
            (Some(editor), Some(worker)) => Ok(ServiceUrls { editor, worker }),
            (editor, worker) => {
                let mut missing = Vec::new();
                if editor.is_none() {
                    missing.push(self.services.editor_port);
                }
                if worker.is_none() {
                    missing.push(self.services.worker_port);
                }
                tracing::error!(instance_id = %instance.id, ?missing, "required services unavailable");
                if fresh {
                    self.stop_quietly(&instance.id).await;
                }
                Err(Error::ServiceUnavailable {
                    instance_id: instance.id.clone(),
                    missing,
                })
            }
        }
    }

    async fn resolve_service(&self, instance: &Instance, port: u16, name: &str) -> Option<String> {
        if let Some(url) = instance.service_url(port) {
            return Some(url.to_string());
        }
        match self.provider.expose_service(&instance.id, port, name).await {
            Ok(url) => Some(url),
            Err(err) => {
                tracing::warn!(instance_id = %instance.id, port, error = %err, "failed to expose service");
                None
            }
        }
    }

    /// Stops an instance, logging instead of failing. Used for cleanup.
    pub async fn stop_quietly(&self, instance_id: &str) {
        match self.provider.stop(instance_id).await {
            Ok(()) => tracing::info!(instance_id, "stopped half-provisioned instance"),
            Err(err) => tracing::error!(instance_id, error = %err, "failed to stop instance"),
        }
    }

    /// Pauses an instance. Pausing a paused instance succeeds without a call.
    pub async fn pause(&self, team_id: &str, instance_id: &str) -> Result<()> {
        let instance = self.get_owned(team_id, instance_id).await?;
        match instance.status {
            InstanceStatus::Paused => Ok(()),
            InstanceStatus::Stopped => Err(Error::Validation(format!(
                "instance {} is stopped",
                instance_id
            ))),
            _ => {
                self.provider.pause(instance_id).await?;
                tracing::info!(instance_id, "paused instance");
                Ok(())
            }
        }
    }

    /// Stops an instance. Stopping a stopped instance succeeds without a call.
    pub async fn stop(&self, team_id: &str, instance_id: &str) -> Result<()> {
        let instance = self.get_owned(team_id, instance_id).await?;
        if instance.status == InstanceStatus::Stopped {
            return Ok(());
        }
        self.provider.stop(instance_id).await?;
        tracing::info!(instance_id, "stopped instance");
        Ok(())
    }

    /// Exposes every candidate port that is not reserved and returns the
    /// ports the provider confirms, with their URLs.
    pub async fn publish_ports(
        &self,
        team_id: &str,
        instance_id: &str,
        ports: &[u16],
    ) -> Result<BTreeMap<u16, String>> {
        self.get_owned(team_id, instance_id).await?;

        let candidates: BTreeSet<u16> = ports
            .iter()
            .copied()
            .filter(|p| {
                let reserved = self.services.is_reserved(*p);
                if reserved {
                    tracing::debug!(instance_id, port = *p, "skipping reserved port");
                }
                !reserved && *p != 0
            })
            .collect();

        let results = join_all(candidates.iter().map(|port| async move {
            let name = format!("port-{}", port);
            (*port, self.provider.expose_service(instance_id, *port, &name).await)
        }))
        .await;

        let mut exposed = BTreeSet::new();
        for (port, result) in results {
            match result {
                Ok(_) => {
                    exposed.insert(port);
                }
                Err(err) => tracing::warn!(instance_id, port, error = %err, "failed to publish port"),
            }
        }

        let confirmed = self.provider.get(instance_id).await?;
        Ok(confirmed
            .services
            .into_iter()
            .filter(|s| exposed.contains(&s.port))
            .map(|s| (s.port, s.url))
            .collect())
    }

    /// Snapshots an instance.
    pub async fn snapshot(&self, team_id: &str, instance_id: &str) -> Result<String> {
        self.get_owned(team_id, instance_id).await?;
        let snapshot_id = self.provider.snapshot(instance_id).await?;
        tracing::info!(instance_id, snapshot_id = %snapshot_id, "snapshotted instance");
        Ok(snapshot_id)
    }
}

fn authorize(instance: &Instance, team_id: &str) -> Result<()> {
    if instance.team_id() == Some(team_id) {
        Ok(())
    } else {
        tracing::warn!(instance_id = %instance.id, team_id, "ownership check failed");
        Err(Error::Forbidden {
            instance_id: instance.id.clone(),
            team_id: team_id.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{HttpService, LocalShellProvider};

    fn manager(provider: &Arc<LocalShellProvider>) -> InstanceManager {
        InstanceManager::new(
            provider.clone(),
            ServicesConfig::default(),
            InstanceConfig::default(),
        )
    }

    fn owned_instance(id: &str, team: &str, status: InstanceStatus) -> Instance {
        Instance {
            id: id.into(),
            status,
            metadata: HashMap::from([(META_TEAM_ID.to_string(), team.to_string())]),
            services: Vec::new(),
        }
    }

    fn fresh_opts(team: &str) -> StartOptions {
        StartOptions {
            team_id: team.into(),
            snapshot_id: Some("snap-base".into()),
            environment_id: Some("env_1".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn new_instance_records_owner() {
        let provider = Arc::new(LocalShellProvider::new());
        let (instance, resumed) = manager(&provider)
            .start_or_resume(&fresh_opts("team-a"))
            .await
            .unwrap();
        assert!(!resumed);
        assert_eq!(instance.team_id(), Some("team-a"));
        assert_eq!(
            instance.metadata.get(META_ENVIRONMENT_ID).map(String::as_str),
            Some("env_1")
        );
    }

    #[tokio::test]
    async fn foreign_instance_is_forbidden_after_lookup_only() {
        let provider = Arc::new(LocalShellProvider::new());
        provider.insert_instance(owned_instance("inst_1", "team-a", InstanceStatus::Paused));

        let err = manager(&provider)
            .start_or_resume(&StartOptions {
                team_id: "team-b".into(),
                existing_instance_id: Some("inst_1".into()),
                ..Default::default()
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Forbidden { .. }));
        assert_eq!(provider.calls(), vec!["get:inst_1"]);
        assert_eq!(
            provider.instance("inst_1").unwrap().status,
            InstanceStatus::Paused
        );
    }

    #[tokio::test]
    async fn unknown_instance_is_not_found() {
        let provider = Arc::new(LocalShellProvider::new());
        let err = manager(&provider)
            .start_or_resume(&StartOptions {
                team_id: "team-a".into(),
                existing_instance_id: Some("ghost".into()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InstanceNotFound(_)));
    }

    #[tokio::test]
    async fn paused_instance_is_resumed() {
        let provider = Arc::new(LocalShellProvider::new());
        provider.insert_instance(owned_instance("inst_1", "team-a", InstanceStatus::Paused));

        let (instance, resumed) = manager(&provider)
            .start_or_resume(&StartOptions {
                team_id: "team-a".into(),
                existing_instance_id: Some("inst_1".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(resumed);
        assert_eq!(instance.status, InstanceStatus::Ready);
    }

    #[tokio::test]
    async fn missing_snapshot_is_rejected() {
        let provider = Arc::new(LocalShellProvider::new());
        let err = manager(&provider)
            .start_or_resume(&StartOptions {
                team_id: "team-a".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn services_are_exposed() {
        let provider = Arc::new(LocalShellProvider::new());
        let mgr = manager(&provider);
        let (instance, _) = mgr.start_or_resume(&fresh_opts("team-a")).await.unwrap();

        let urls = mgr.ensure_services(&instance, true).await.unwrap();
        assert_eq!(urls.editor, "http://127.0.0.1:39378");
        assert_eq!(urls.worker, "http://127.0.0.1:39377");
    }

    #[tokio::test]
    async fn missing_service_stops_fresh_instance() {
        let provider = Arc::new(LocalShellProvider::new().with_unavailable_port(39377));
        let mgr = manager(&provider);
        let (instance, _) = mgr.start_or_resume(&fresh_opts("team-a")).await.unwrap();

        let err = mgr.ensure_services(&instance, true).await.unwrap_err();
        match err {
            Error::ServiceUnavailable { missing, .. } => assert_eq!(missing, vec![39377]),
            other => panic!("unexpected error {other}"),
        }
        assert_eq!(
            provider.instance(&instance.id).unwrap().status,
            InstanceStatus::Stopped
        );
    }

    #[tokio::test]
    async fn missing_service_leaves_reused_instance_running() {
        let provider = Arc::new(LocalShellProvider::new().with_unavailable_port(39378));
        provider.insert_instance(owned_instance("inst_1", "team-a", InstanceStatus::Ready));
        let mgr = manager(&provider);
        let instance = mgr.get_owned("team-a", "inst_1").await.unwrap();

        assert!(mgr.ensure_services(&instance, false).await.is_err());
        assert_eq!(
            provider.instance("inst_1").unwrap().status,
            InstanceStatus::Ready
        );
    }

    #[tokio::test]
    async fn pause_and_stop_are_idempotent() {
        let provider = Arc::new(LocalShellProvider::new());
        provider.insert_instance(owned_instance("inst_1", "team-a", InstanceStatus::Ready));
        let mgr = manager(&provider);

        mgr.pause("team-a", "inst_1").await.unwrap();
        mgr.pause("team-a", "inst_1").await.unwrap();
        let pauses = provider.calls().iter().filter(|c| c.starts_with("pause:")).count();
        assert_eq!(pauses, 1);

        mgr.stop("team-a", "inst_1").await.unwrap();
        mgr.stop("team-a", "inst_1").await.unwrap();
        let stops = provider.calls().iter().filter(|c| c.starts_with("stop:")).count();
        assert_eq!(stops, 1);

        assert!(matches!(
            mgr.stop("team-b", "inst_1").await,
            Err(Error::Forbidden { .. })
        ));
    }

    #[tokio::test]
    async fn publish_skips_reserved_and_failing_ports() {
        let provider = Arc::new(LocalShellProvider::new().with_unavailable_port(5000));
        let mut instance = owned_instance("inst_1", "team-a", InstanceStatus::Ready);
        instance.services.push(HttpService {
            name: "port-8080".into(),
            port: 8080,
            url: "http://127.0.0.1:8080".into(),
        });
        provider.insert_instance(instance);

        let published = manager(&provider)
            .publish_ports("team-a", "inst_1", &[3000, 5000, 39378, 39376, 3000])
            .await
            .unwrap();

        assert_eq!(
            published,
            BTreeMap::from([(3000, "http://127.0.0.1:3000".to_string())])
        );
        let exposes = provider
            .calls()
            .iter()
            .filter(|c| c.starts_with("expose_service:"))
            .count();
        assert_eq!(exposes, 2);
    }

    #[tokio::test]
    async fn snapshot_checks_owner() {
        let provider = Arc::new(LocalShellProvider::new());
        provider.insert_instance(owned_instance("inst_1", "team-a", InstanceStatus::Ready));
        let mgr = manager(&provider);

        assert_eq!(mgr.snapshot("team-a", "inst_1").await.unwrap(), "snap-of-inst_1");
        assert!(matches!(
            mgr.snapshot("team-b", "inst_1").await,
            Err(Error::Forbidden { .. })
        ));
    }
}

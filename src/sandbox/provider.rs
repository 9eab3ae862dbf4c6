//! Sandbox provider trait and wire types.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Metadata key recording the owning team at creation time.
pub const META_TEAM_ID: &str = "teamId";

/// Metadata key recording the environment an instance was built from.
pub const META_ENVIRONMENT_ID: &str = "environmentId";

/// Provider-reported lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Creating,
    Ready,
    Paused,
    Stopped,
}

/// What the provider does when an instance's TTL expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TtlAction {
    #[default]
    Pause,
    Stop,
}

/// An HTTP service exposed by an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpService {
    /// Service name.
    pub name: String,
    /// Port inside the instance.
    pub port: u16,
    /// Public URL.
    pub url: String,
}

/// A remote compute unit as reported by the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    /// Opaque provider ID.
    pub id: String,
    /// Current status.
    pub status: InstanceStatus,
    /// Metadata recorded at creation.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Exposed HTTP services.
    #[serde(default)]
    pub services: Vec<HttpService>,
}

impl Instance {
    /// Returns the team recorded in creation metadata.
    pub fn team_id(&self) -> Option<&str> {
        self.metadata.get(META_TEAM_ID).map(String::as_str)
    }

    /// Returns the public URL of the service on `port`, if exposed.
    pub fn service_url(&self, port: u16) -> Option<&str> {
        self.services
            .iter()
            .find(|s| s.port == port)
            .map(|s| s.url.as_str())
    }
}

/// Parameters for starting a new instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest {
    /// Snapshot to boot from.
    pub snapshot_id: String,
    /// Time to live in seconds.
    pub ttl_seconds: u64,
    /// Action taken when the TTL expires.
    pub ttl_action: TtlAction,
    /// Metadata stored with the instance.
    pub metadata: HashMap<String, String>,
}

/// Captured result of a remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
    /// Exit code.
    pub exit_code: i32,
}

impl ExecOutput {
    /// Returns true if the command exited zero.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Returns stderr followed by stdout, trimmed.
    pub fn combined(&self) -> String {
        let mut out = String::new();
        let stderr = self.stderr.trim();
        let stdout = self.stdout.trim();
        out.push_str(stderr);
        if !stderr.is_empty() && !stdout.is_empty() {
            out.push('\n');
        }
        out.push_str(stdout);
        out
    }
}

/// Remote sandbox provider.
///
/// Every call is a network RPC. `exec` delivers the command text to a shell
/// on stdin, never as a process argument.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Boots a new instance from a snapshot.
    async fn start(&self, req: StartRequest) -> Result<Instance>;

    /// Fetches an instance. Fails with `InstanceNotFound` if unknown.
    async fn get(&self, instance_id: &str) -> Result<Instance>;

    /// Runs a shell command inside the instance.
    async fn exec(&self, instance_id: &str, command: &str, timeout: Duration)
        -> Result<ExecOutput>;

    /// Pauses a running instance.
    async fn pause(&self, instance_id: &str) -> Result<()>;

    /// Resumes a paused instance.
    async fn resume(&self, instance_id: &str) -> Result<Instance>;

    /// Stops an instance for good.
    async fn stop(&self, instance_id: &str) -> Result<()>;

    /// Exposes `port` as a public HTTP service and returns its URL.
    async fn expose_service(&self, instance_id: &str, port: u16, name: &str) -> Result<String>;

    /// Snapshots an instance and returns the new snapshot ID.
    async fn snapshot(&self, instance_id: &str) -> Result<String>;
}

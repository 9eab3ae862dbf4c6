//! Local host provider.
//!
//! Runs commands on this machine with `bash -s`, feeding the script on
//! stdin exactly as a remote provider would. Instances are in-memory
//! records. NOT a security boundary; meant for development against a
//! local workspace directory and for exercising the engine in tests.

use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{Error, Result};

use super::provider::{
    ExecOutput, HttpService, Instance, InstanceStatus, SandboxProvider, StartRequest,
};

/// Provider executing everything on the local host.
#[derive(Default)]
pub struct LocalShellProvider {
    instances: Mutex<HashMap<String, Instance>>,
    /// Ports whose exposure fails, to model a broken service.
    unavailable_ports: HashSet<u16>,
    calls: Mutex<Vec<String>>,
    counter: AtomicU64,
}

impl LocalShellProvider {
    /// Creates a provider with no instances.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes exposing `port` fail on every instance.
    pub fn with_unavailable_port(mut self, port: u16) -> Self {
        self.unavailable_ports.insert(port);
        self
    }

    /// Registers an existing instance (as if created earlier).
    pub fn insert_instance(&self, instance: Instance) {
        if let Ok(mut map) = self.instances.lock() {
            map.insert(instance.id.clone(), instance);
        }
    }

    /// Returns the operations invoked so far, e.g. `get:inst_1`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Returns the current record of an instance.
    pub fn instance(&self, instance_id: &str) -> Option<Instance> {
        self.instances
            .lock()
            .ok()
            .and_then(|m| m.get(instance_id).cloned())
    }

    fn record(&self, op: &str, instance_id: &str) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(format!("{}:{}", op, instance_id));
        }
    }

    fn with_instance<T>(
        &self,
        instance_id: &str,
        f: impl FnOnce(&mut Instance) -> T,
    ) -> Result<T> {
        let mut map = self
            .instances
            .lock()
            .map_err(|_| Error::Provider("instance table poisoned".into()))?;
        let instance = map
            .get_mut(instance_id)
            .ok_or_else(|| Error::InstanceNotFound(instance_id.to_string()))?;
        Ok(f(instance))
    }
}

#[async_trait]
impl SandboxProvider for LocalShellProvider {
    async fn start(&self, req: StartRequest) -> Result<Instance> {
        let seq = self.counter.fetch_add(1, Ordering::SeqCst);
        let id = format!("local-{}-{}", req.snapshot_id, seq);
        self.record("start", &id);
        let instance = Instance {
            id: id.clone(),
            status: InstanceStatus::Ready,
            metadata: req.metadata,
            services: Vec::new(),
        };
        self.insert_instance(instance.clone());
        tracing::info!(instance_id = %id, "local instance started");
        Ok(instance)
    }

    async fn get(&self, instance_id: &str) -> Result<Instance> {
        self.record("get", instance_id);
        self.with_instance(instance_id, |i| i.clone())
    }

    async fn exec(
        &self,
        instance_id: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecOutput> {
        self.record("exec", instance_id);
        let status = self.with_instance(instance_id, |i| i.status)?;
        if status != InstanceStatus::Ready {
            return Err(Error::Provider(format!(
                "instance {} is {:?}",
                instance_id, status
            )));
        }

        let mut child = Command::new("bash")
            .arg("-s")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(command.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| Error::Timeout(timeout))??;

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn pause(&self, instance_id: &str) -> Result<()> {
        self.record("pause", instance_id);
        self.with_instance(instance_id, |i| i.status = InstanceStatus::Paused)
    }

    async fn resume(&self, instance_id: &str) -> Result<Instance> {
        self.record("resume", instance_id);
        self.with_instance(instance_id, |i| {
            i.status = InstanceStatus::Ready;
            i.clone()
        })
    }

    async fn stop(&self, instance_id: &str) -> Result<()> {
        self.record("stop", instance_id);
        self.with_instance(instance_id, |i| i.status = InstanceStatus::Stopped)
    }

    async fn expose_service(&self, instance_id: &str, port: u16, name: &str) -> Result<String> {
        self.record("expose_service", instance_id);
        if self.unavailable_ports.contains(&port) {
            return Err(Error::Provider(format!("port {} is not listening", port)));
        }
        let url = format!("http://127.0.0.1:{}", port);
        self.with_instance(instance_id, |i| {
            if i.service_url(port).is_none() {
                i.services.push(HttpService {
                    name: name.to_string(),
                    port,
                    url: url.clone(),
                });
            }
        })?;
        Ok(url)
    }

    async fn snapshot(&self, instance_id: &str) -> Result<String> {
        self.record("snapshot", instance_id);
        self.with_instance(instance_id, |i| format!("snap-of-{}", i.id))
    }
}

//! HTTP client for a remote sandbox provider API.
//!
//! API: POST /instances, GET /instances/{id}, POST /instances/{id}/exec,
//! POST /instances/{id}/{pause,resume,stop,snapshot},
//! POST /instances/{id}/services

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Response, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::provider::{ExecOutput, Instance, SandboxProvider, StartRequest};

#[derive(Debug, Serialize)]
struct ExecRequest<'a> {
    command: &'a str,
    timeout_secs: u64,
}

#[derive(Debug, Serialize)]
struct ExposeRequest<'a> {
    port: u16,
    name: &'a str,
}

#[derive(Debug, Deserialize)]
struct ExposeResponse {
    url: String,
}

#[derive(Debug, Deserialize)]
struct SnapshotResponse {
    snapshot_id: String,
}

/// REST client implementing [`SandboxProvider`].
pub struct HttpSandboxProvider {
    base_url: Url,
    api_key: SecretString,
    client: reqwest::Client,
}

impl HttpSandboxProvider {
    /// Creates a client for `base_url`, authenticating with `api_key`.
    pub fn new(base_url: &str, api_key: SecretString, request_timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| Error::Config(format!("invalid provider base_url '{}': {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(Error::Config(format!(
                "provider base_url '{}' cannot carry a path",
                base_url
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            base_url,
            api_key,
            client,
        })
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        url: Url,
        body: Option<&B>,
        timeout: Option<Duration>,
        op: &str,
    ) -> Result<Response> {
        let mut req = self
            .client
            .post(url)
            .bearer_auth(self.api_key.expose_secret());
        if let Some(body) = body {
            req = req.json(body);
        }
        if let Some(timeout) = timeout {
            req = req.timeout(timeout);
        }
        req.send()
            .await
            .map_err(|e| transport_error(op, e, timeout))
    }

    async fn post_empty(&self, instance_id: &str, action: &str) -> Result<Response> {
        let url = self.url(&["instances", instance_id, action]);
        let resp = self.post::<()>(url, None, None, action).await?;
        check(resp, instance_id, action).await
    }
}

fn transport_error(op: &str, err: reqwest::Error, timeout: Option<Duration>) -> Error {
    match timeout {
        Some(t) if err.is_timeout() => Error::Timeout(t),
        _ => Error::Provider(format!("{} request failed: {}", op, err)),
    }
}

async fn check(resp: Response, instance_id: &str, op: &str) -> Result<Response> {
    let status = resp.status();
    if status.as_u16() == 404 {
        return Err(Error::InstanceNotFound(instance_id.to_string()));
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(Error::Provider(format!("{} returned {}: {}", op, status, body)));
    }
    Ok(resp)
}

async fn parse<T: serde::de::DeserializeOwned>(resp: Response, op: &str) -> Result<T> {
    resp.json::<T>()
        .await
        .map_err(|e| Error::Provider(format!("failed to parse {} response: {}", op, e)))
}

#[async_trait]
impl SandboxProvider for HttpSandboxProvider {
    async fn start(&self, req: StartRequest) -> Result<Instance> {
        tracing::info!(snapshot_id = %req.snapshot_id, ttl_seconds = req.ttl_seconds, "starting instance");
        let resp = self
            .post(self.url(&["instances"]), Some(&req), None, "start")
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Provider(format!("start returned {}: {}", status, body)));
        }
        let instance: Instance = parse(resp, "start").await?;
        tracing::info!(instance_id = %instance.id, "instance started");
        Ok(instance)
    }

    async fn get(&self, instance_id: &str) -> Result<Instance> {
        let resp = self
            .client
            .get(self.url(&["instances", instance_id]))
            .bearer_auth(self.api_key.expose_secret())
            .send()
            .await
            .map_err(|e| transport_error("get", e, None))?;
        let resp = check(resp, instance_id, "get").await?;
        parse(resp, "get").await
    }

    async fn exec(
        &self,
        instance_id: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecOutput> {
        let body = ExecRequest {
            command,
            timeout_secs: timeout.as_secs().max(1),
        };
        let url = self.url(&["instances", instance_id, "exec"]);
        let resp = self.post(url, Some(&body), Some(timeout), "exec").await?;
        let resp = check(resp, instance_id, "exec").await?;
        parse(resp, "exec").await
    }

    async fn pause(&self, instance_id: &str) -> Result<()> {
        self.post_empty(instance_id, "pause").await.map(|_| ())
    }

    async fn resume(&self, instance_id: &str) -> Result<Instance> {
        let resp = self.post_empty(instance_id, "resume").await?;
        parse(resp, "resume").await
    }

    async fn stop(&self, instance_id: &str) -> Result<()> {
        self.post_empty(instance_id, "stop").await.map(|_| ())
    }

    async fn expose_service(&self, instance_id: &str, port: u16, name: &str) -> Result<String> {
        let url = self.url(&["instances", instance_id, "services"]);
        let body = ExposeRequest { port, name };
        let resp = self.post(url, Some(&body), None, "expose_service").await?;
        let resp = check(resp, instance_id, "expose_service").await?;
        let exposed: ExposeResponse = parse(resp, "expose_service").await?;
        Ok(exposed.url)
    }

    async fn snapshot(&self, instance_id: &str) -> Result<String> {
        let resp = self.post_empty(instance_id, "snapshot").await?;
        let snap: SnapshotResponse = parse(resp, "snapshot").await?;
        Ok(snap.snapshot_id)
    }
}

//! Per-instance wrapper around a provider.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::OnceCell;

use crate::error::{Error, Result};
use crate::shell::Script;

use super::provider::{ExecOutput, SandboxProvider};

/// Extra wait on top of the provider-side timeout before giving up locally.
const TIMEOUT_GRACE: Duration = Duration::from_secs(5);

/// Tooling detected inside an instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// The privileged env loader is installed.
    pub env_loader: bool,
    /// `tmux` is installed.
    pub tmux: bool,
    /// The source-host CLI (`gh`) is installed.
    pub gh: bool,
}

/// Handle to one running instance.
///
/// Capability probes are memoized for the lifetime of the handle; a new
/// handle probes again.
pub struct SandboxHandle {
    provider: Arc<dyn SandboxProvider>,
    instance_id: String,
    exec_timeout: Duration,
    env_loader: String,
    capabilities: OnceCell<Capabilities>,
}

impl SandboxHandle {
    /// Wraps `instance_id` on `provider`.
    pub fn new(
        provider: Arc<dyn SandboxProvider>,
        instance_id: impl Into<String>,
        exec_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            instance_id: instance_id.into(),
            exec_timeout,
            env_loader: "envctl".to_string(),
            capabilities: OnceCell::new(),
        }
    }

    /// Sets the env loader binary probed by [`capabilities`](Self::capabilities).
    pub fn with_env_loader(mut self, loader: impl Into<String>) -> Self {
        self.env_loader = loader.into();
        self
    }

    /// Returns the instance ID.
    pub fn id(&self) -> &str {
        &self.instance_id
    }

    /// Returns the underlying provider.
    pub fn provider(&self) -> &Arc<dyn SandboxProvider> {
        &self.provider
    }

    /// Runs a script with the default timeout.
    pub async fn exec(&self, script: &Script) -> Result<ExecOutput> {
        self.exec_with_timeout(script, self.exec_timeout).await
    }

    /// Runs a script, bounding the wait locally as well as remotely.
    pub async fn exec_with_timeout(&self, script: &Script, timeout: Duration) -> Result<ExecOutput> {
        let command = script.render();
        let call = self.provider.exec(&self.instance_id, &command, timeout);
        match tokio::time::timeout(timeout + TIMEOUT_GRACE, call).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(timeout)),
        }
    }

    /// Runs a script and turns a non-zero exit into [`Error::Exec`].
    pub async fn exec_checked(&self, script: &Script) -> Result<ExecOutput> {
        let out = self.exec(script).await?;
        if !out.success() {
            return Err(Error::Exec {
                code: Some(out.exit_code),
                output: out.combined(),
            });
        }
        Ok(out)
    }

    /// Probes installed tooling once per handle.
    pub async fn capabilities(&self) -> Result<Capabilities> {
        self.capabilities
            .get_or_try_init(|| async {
                let script = Script::new()
                    .assign("loader", &self.env_loader)
                    .raw(r#"for t in "$loader" tmux gh; do"#)
                    .raw(r#"  if command -v "$t" >/dev/null 2>&1; then echo 1; else echo 0; fi"#)
                    .raw("done");
                let out = self.exec_checked(&script).await?;
                let flags: Vec<bool> = out.stdout.lines().map(|l| l.trim() == "1").collect();
                let caps = Capabilities {
                    env_loader: flags.first().copied().unwrap_or(false),
                    tmux: flags.get(1).copied().unwrap_or(false),
                    gh: flags.get(2).copied().unwrap_or(false),
                };
                tracing::debug!(instance_id = %self.instance_id, ?caps, "probed sandbox tooling");
                Ok::<_, Error>(caps)
            })
            .await
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::local::LocalShellProvider;
    use crate::sandbox::provider::StartRequest;
    use std::collections::HashMap;

    async fn handle() -> (Arc<LocalShellProvider>, SandboxHandle) {
        let provider = Arc::new(LocalShellProvider::new());
        let instance = provider
            .start(StartRequest {
                snapshot_id: "base".into(),
                ttl_seconds: 60,
                ttl_action: Default::default(),
                metadata: HashMap::new(),
            })
            .await
            .unwrap();
        let handle = SandboxHandle::new(provider.clone(), instance.id, Duration::from_secs(10));
        (provider, handle)
    }

    #[tokio::test]
    async fn capabilities_are_probed_once() {
        let (provider, handle) = handle().await;
        let handle = handle.with_env_loader("definitely-not-a-real-loader");

        let first = handle.capabilities().await.unwrap();
        let second = handle.capabilities().await.unwrap();

        assert_eq!(first, second);
        assert!(!first.env_loader);
        let execs = provider.calls().iter().filter(|c| c.starts_with("exec:")).count();
        assert_eq!(execs, 1);
    }

    #[tokio::test]
    async fn exec_checked_reports_exit_code() {
        let (_provider, handle) = handle().await;
        let err = handle
            .exec_checked(&Script::new().raw("echo boom >&2; exit 4"))
            .await
            .unwrap_err();
        match err {
            Error::Exec { code, output } => {
                assert_eq!(code, Some(4));
                assert_eq!(output, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}

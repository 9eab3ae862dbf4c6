//! Workspace operations inside a sandbox.
//!
//! [`Workspace`] is the seam between the reconciler's decisions and the
//! commands that carry them out. [`RemoteWorkspace`] issues builder-made
//! scripts through a [`SandboxHandle`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::config::WorkspaceConfig;
use crate::error::{Error, Result};
use crate::repos::{
    LayoutMode, ObservedLayout, ObservedRepo, ObservedRepoState, RepoName, RepositoryBinding,
};
use crate::sandbox::SandboxHandle;
use crate::shell::{Cmd, Script};

/// Git credential helper reading the token from `$DEVBOX_CRED_FILE`.
///
/// The first, empty `credential.helper` drops any helper configured in the
/// sandbox so only this one answers.
const CREDENTIAL_HELPER: &str =
    r#"'credential.helper=!f() { echo username=x-access-token; echo "password=$(cat "$DEVBOX_CRED_FILE")"; }; f'"#;

/// Operations the reconciler needs from a workspace.
#[async_trait]
pub trait Workspace: Send + Sync {
    /// Reads the current layout and every checkout with its remote.
    async fn observe(&self) -> Result<ObservedRepoState>;

    /// Deletes one observed checkout.
    async fn remove(&self, repo: &ObservedRepo, layout: ObservedLayout) -> Result<()>;

    /// Deletes everything under the workspace root.
    async fn clear(&self) -> Result<()>;

    /// Clones `binding` into its target for `mode`.
    ///
    /// A failed attempt leaves no partial checkout behind. Non-zero exits
    /// are reported as [`Error::Exec`] with the captured output.
    async fn clone_repo(
        &self,
        binding: &RepositoryBinding,
        mode: LayoutMode,
        token: Option<&SecretString>,
    ) -> Result<()>;
}

/// Workspace living in a remote sandbox.
pub struct RemoteWorkspace {
    handle: Arc<SandboxHandle>,
    config: WorkspaceConfig,
    clone_timeout: Duration,
}

impl RemoteWorkspace {
    pub fn new(handle: Arc<SandboxHandle>, config: WorkspaceConfig, clone_timeout: Duration) -> Self {
        Self {
            handle,
            config,
            clone_timeout,
        }
    }

    fn root(&self) -> &str {
        let trimmed = self.config.root.trim_end_matches('/');
        if trimmed.is_empty() {
            "/"
        } else {
            trimmed
        }
    }

    fn clear_script(&self) -> Script {
        Script::strict()
            .assign("root", self.root())
            .raw(r#"mkdir -p -- "$root""#)
            .raw(r#"find "$root" -mindepth 1 -maxdepth 1 -exec rm -rf -- {} +"#)
    }

    fn observe_script(&self) -> Script {
        Script::strict()
            .assign("root", self.root())
            .raw(r#"remote_of() { git config --file "$1/.git/config" --get remote.origin.url 2>/dev/null || true; }"#)
            .raw(r#"if [ ! -d "$root" ] || [ -z "$(ls -A -- "$root")" ]; then"#)
            .raw("  echo layout=empty")
            .raw(r#"elif [ -e "$root/.git" ]; then"#)
            .raw("  echo layout=single")
            .raw(r#"  printf 'repo\t%s\t%s\n' "$(basename -- "$root")" "$(remote_of "$root")""#)
            .raw("else")
            .raw("  echo layout=multi")
            .raw(r#"  find "$root" -mindepth 1 -maxdepth 1 -type d | sort | while IFS= read -r d; do"#)
            .raw(r#"    if [ -e "$d/.git" ]; then"#)
            .raw(r#"      printf 'repo\t%s\t%s\n' "$(basename -- "$d")" "$(remote_of "$d")""#)
            .raw("    fi")
            .raw("  done")
            .raw("fi")
    }

    fn clone_script(
        &self,
        binding: &RepositoryBinding,
        mode: LayoutMode,
        token: Option<&SecretString>,
    ) -> Script {
        let target = binding.target_path(self.root(), mode);
        let url = self
            .config
            .clone_url(binding.repo.owner(), binding.repo.name());

        let mut script = Script::strict()
            .raw("export GIT_TERMINAL_PROMPT=0")
            .assign("root", self.root())
            .assign("target", &target)
            .raw(r#"mkdir -p -- "$root""#);

        script = match mode {
            LayoutMode::Single => script
                .raw(r#"find "$root" -mindepth 1 -maxdepth 1 -exec rm -rf -- {} +"#),
            LayoutMode::Multi => script.raw(r#"rm -rf -- "$target""#),
        };

        let mut clone = Cmd::new("git");
        if let Some(token) = token {
            let cred_file = format!("/tmp/devbox-cred-{}", uuid::Uuid::new_v4().simple());
            script = script
                .raw("prev_umask=$(umask)")
                .raw("umask 077")
                .assign("DEVBOX_CRED_FILE", &cred_file)
                .raw("export DEVBOX_CRED_FILE")
                .raw(r#"trap 'rm -f -- "$DEVBOX_CRED_FILE"' EXIT"#)
                .write_file(&cred_file, token.expose_secret())
                .raw(r#"umask "$prev_umask""#);
            clone = clone
                .arg("-c")
                .arg("credential.helper=")
                .arg("-c")
                .arg(CREDENTIAL_HELPER);
        }

        clone = clone.arg("clone").arg("--quiet");
        if let Some(depth) = self.config.clone_depth {
            clone = clone.option("--depth", depth.to_string());
        }
        if let Some(branch) = &binding.branch {
            clone = clone.option("--branch", branch);
        }
        clone = clone.arg("--").value(url).arg(r#""$target""#);

        let cleanup = match mode {
            LayoutMode::Single => r#"  find "$root" -mindepth 1 -maxdepth 1 -exec rm -rf -- {} +"#,
            LayoutMode::Multi => r#"  rm -rf -- "$target""#,
        };

        script
            .raw("set +e")
            .cmd(clone)
            .raw("status=$?")
            .raw("set -e")
            .raw(r#"if [ "$status" -ne 0 ]; then"#)
            .raw(cleanup)
            .raw(r#"  exit "$status""#)
            .raw("fi")
    }
}

/// Parses the output of the observe script.
fn parse_observation(stdout: &str) -> Result<ObservedRepoState> {
    let mut layout = None;
    let mut repos = Vec::new();

    for line in stdout.lines() {
        if let Some(value) = line.strip_prefix("layout=") {
            layout = Some(match value.trim() {
                "empty" => ObservedLayout::Empty,
                "single" => ObservedLayout::Single,
                "multi" => ObservedLayout::Multi,
                other => {
                    return Err(Error::Provider(format!(
                        "unexpected workspace layout '{}'",
                        other
                    )))
                }
            });
        } else if let Some(rest) = line.strip_prefix("repo\t") {
            let (name, url) = rest.split_once('\t').unwrap_or((rest, ""));
            let url = url.trim();
            repos.push(ObservedRepo {
                name: name.to_string(),
                remote_url: (!url.is_empty()).then(|| url.to_string()),
            });
        }
    }

    let layout = layout
        .ok_or_else(|| Error::Provider("workspace observation produced no layout".into()))?;

    // The root checkout is known by the short name of its remote.
    if layout == ObservedLayout::Single {
        for repo in &mut repos {
            if let Some(remote) = repo.remote_url.as_deref().and_then(RepoName::from_remote_url) {
                repo.name = remote.name().to_string();
            }
        }
    }

    Ok(ObservedRepoState { layout, repos })
}

fn is_safe_entry_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/')
}

#[async_trait]
impl Workspace for RemoteWorkspace {
    async fn observe(&self) -> Result<ObservedRepoState> {
        let out = self.handle.exec_checked(&self.observe_script()).await?;
        let state = parse_observation(&out.stdout)?;
        tracing::debug!(
            instance_id = %self.handle.id(),
            layout = ?state.layout,
            repos = state.repos.len(),
            "observed workspace"
        );
        Ok(state)
    }

    async fn remove(&self, repo: &ObservedRepo, layout: ObservedLayout) -> Result<()> {
        match layout {
            ObservedLayout::Single => self.clear().await,
            ObservedLayout::Empty => Ok(()),
            ObservedLayout::Multi => {
                if !is_safe_entry_name(&repo.name) {
                    return Err(Error::Validation(format!(
                        "refusing to remove workspace entry '{}'",
                        repo.name
                    )));
                }
                let script = Script::strict()
                    .assign("target", format!("{}/{}", self.root(), repo.name))
                    .raw(r#"rm -rf -- "$target""#);
                self.handle.exec_checked(&script).await?;
                tracing::info!(instance_id = %self.handle.id(), repo = %repo.name, "removed checkout");
                Ok(())
            }
        }
    }

    async fn clear(&self) -> Result<()> {
        self.handle.exec_checked(&self.clear_script()).await?;
        tracing::info!(instance_id = %self.handle.id(), root = %self.root(), "cleared workspace");
        Ok(())
    }

    async fn clone_repo(
        &self,
        binding: &RepositoryBinding,
        mode: LayoutMode,
        token: Option<&SecretString>,
    ) -> Result<()> {
        let script = self.clone_script(binding, mode, token);
        let out = self
            .handle
            .exec_with_timeout(&script, self.clone_timeout)
            .await?;
        if !out.success() {
            return Err(Error::Exec {
                code: Some(out.exit_code),
                output: out.combined(),
            });
        }
        Ok(())
    }
}

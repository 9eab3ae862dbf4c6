//! Environment and credential bootstrap for a sandbox.
//!
//! Env payloads are normalized to one double-quoted `KEY="value"` line per
//! variable and base64-encoded for transport. Tokens reach the sandbox
//! only as heredoc bodies written to short-lived files.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::backoff::{retry, RetryPolicy};
use crate::config::{EnvConfig, RetryConfig};
use crate::error::{Error, Result};
use crate::failure::{FailureDetector, FailureKind};
use crate::sandbox::SandboxHandle;
use crate::secrets::SecretsManager;
use crate::shell::{quote, Script};

/// Comment line guarding the dotfile source line in the shell rc file.
pub const SHELL_RC_MARKER: &str = "# devbox: load environment";

/// Parses `.env` text into ordered key/value pairs.
///
/// Blank lines and `#` comments are skipped, an `export ` prefix is
/// accepted. Double-quoted values may span lines; inside them a backslash
/// escapes only `"`, `\`, `$` and `` ` ``, as in a POSIX shell. Single-quoted
/// values are literal. Unquoted values end at a ` #` comment.
pub fn parse_dotenv(text: &str) -> Result<Vec<(String, String)>> {
    let mut entries = Vec::new();
    let mut lines = text.lines().enumerate();

    while let Some((idx, line)) = lines.next() {
        let line = line.trim_start();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line).trim_start();
        let (key, rest) = line.split_once('=').ok_or_else(|| {
            Error::Validation(format!("env line {} has no '='", idx + 1))
        })?;
        let key = key.trim();
        if !is_valid_env_key(key) {
            return Err(Error::Validation(format!(
                "env line {} has invalid key '{}'",
                idx + 1,
                key
            )));
        }

        let rest = rest.trim_start();
        let value = if let Some(body) = rest.strip_prefix('"') {
            read_quoted(body, '"', &mut lines).ok_or_else(|| {
                Error::Validation(format!("unterminated double quote for {}", key))
            })?
        } else if let Some(body) = rest.strip_prefix('\'') {
            read_quoted(body, '\'', &mut lines).ok_or_else(|| {
                Error::Validation(format!("unterminated single quote for {}", key))
            })?
        } else {
            strip_inline_comment(rest).trim_end().to_string()
        };
        entries.push((key.to_string(), value));
    }
    Ok(entries)
}

fn is_valid_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn strip_inline_comment(value: &str) -> &str {
    let bytes = value.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if *b == b'#' && i > 0 && bytes[i - 1].is_ascii_whitespace() {
            return &value[..i];
        }
    }
    value
}

/// Reads a quoted value starting after the opening quote, pulling further
/// lines until the closing quote. Text after the closing quote is ignored.
fn read_quoted<'a>(
    first: &'a str,
    delim: char,
    lines: &mut impl Iterator<Item = (usize, &'a str)>,
) -> Option<String> {
    let mut out = String::new();
    let mut current = first;
    loop {
        let mut chars = current.chars();
        while let Some(c) = chars.next() {
            if c == delim {
                return Some(out);
            }
            if delim == '"' && c == '\\' {
                match chars.next() {
                    Some(n @ ('"' | '\\' | '$' | '`')) => out.push(n),
                    Some(n) => {
                        out.push('\\');
                        out.push(n);
                    }
                    None => out.push('\\'),
                }
                continue;
            }
            out.push(c);
        }
        let (_, next) = lines.next()?;
        out.push('\n');
        current = next;
    }
}

fn double_quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if matches!(c, '"' | '\\' | '$' | '`') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Renders parsed entries as normalized dotenv text.
pub fn render_env(entries: &[(String, String)]) -> String {
    entries
        .iter()
        .map(|(k, v)| format!("{}={}\n", k, double_quote(v)))
        .collect()
}

/// Normalizes `.env` text and encodes it for transport.
pub fn encode_env_payload(raw: &str) -> Result<String> {
    let entries = parse_dotenv(raw)?;
    Ok(BASE64.encode(render_env(&entries)))
}

/// Decodes a transport blob back into key/value pairs.
pub fn decode_env_payload(blob: &str) -> Result<Vec<(String, String)>> {
    let bytes = BASE64
        .decode(blob.trim())
        .map_err(|e| Error::Validation(format!("env payload is not base64: {}", e)))?;
    let text = String::from_utf8(bytes)
        .map_err(|_| Error::Validation("env payload is not UTF-8".into()))?;
    parse_dotenv(&text)
}

/// Where an env payload ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvTarget {
    /// Handed to the privileged loader.
    Loader,
    /// Written to the dotfile sourced by the shell rc file.
    Dotfile,
}

/// Commit identity configured in the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitIdentity {
    pub name: String,
    pub email: String,
}

impl GitIdentity {
    /// Rejects empty fields and control characters.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [("name", &self.name), ("email", &self.email)] {
            if value.trim().is_empty() {
                return Err(Error::Validation(format!("git identity {} is empty", field)));
            }
            if value.chars().any(|c| c.is_control()) {
                return Err(Error::Validation(format!(
                    "git identity {} contains control characters",
                    field
                )));
            }
        }
        Ok(())
    }
}

/// Runs env, identity and source-host setup against one sandbox.
pub struct Bootstrapper {
    handle: Arc<SandboxHandle>,
    env: EnvConfig,
    retry: RetryConfig,
    git_host: String,
    secrets: SecretsManager,
    detector: FailureDetector,
}

impl Bootstrapper {
    pub fn new(
        handle: Arc<SandboxHandle>,
        env: EnvConfig,
        retry: RetryConfig,
        git_host: impl Into<String>,
        secrets: SecretsManager,
    ) -> Self {
        Self {
            handle,
            env,
            retry,
            git_host: git_host.into(),
            secrets,
            detector: FailureDetector::new(),
        }
    }

    /// Loads an encoded env payload into the sandbox.
    ///
    /// Uses the privileged loader when installed, else writes the dotfile
    /// and makes the shell rc source it. Re-applying only rewrites the
    /// dotfile; the source line is appended once.
    pub async fn apply_env(&self, blob: &str) -> Result<EnvTarget> {
        let entries = decode_env_payload(blob)?;
        let caps = self.handle.capabilities().await?;

        if caps.env_loader {
            let script = Script::strict()
                .assign("loader", &self.env.loader)
                .assign("blob", blob)
                .raw(r#""$loader" load "$blob""#);
            self.run_redacted(&script, "env loader").await?;
            tracing::info!(instance_id = %self.handle.id(), vars = entries.len(), "env loaded via loader");
            return Ok(EnvTarget::Loader);
        }

        let source_line = format!(
            "[ -f {q} ] && {{ set -a; . {q}; set +a; }}",
            q = quote(&self.env.dotfile)
        );
        let script = Script::strict()
            .raw("umask 077")
            .assign("dotfile", &self.env.dotfile)
            .assign("rc", &self.env.shell_rc)
            .assign("marker", SHELL_RC_MARKER)
            .assign("line", source_line)
            .raw(r#"mkdir -p -- "$(dirname -- "$dotfile")""#)
            .write_file(&self.env.dotfile, &render_env(&entries))
            .raw(r#"touch -- "$rc""#)
            .raw(r#"if ! grep -qxF -- "$marker" "$rc"; then"#)
            .raw(r#"  printf '\n%s\n%s\n' "$marker" "$line" >> "$rc""#)
            .raw("fi");
        self.run_redacted(&script, "env dotfile").await?;
        tracing::info!(
            instance_id = %self.handle.id(),
            vars = entries.len(),
            dotfile = %self.env.dotfile,
            "env written to dotfile"
        );
        Ok(EnvTarget::Dotfile)
    }

    /// Sets the commit identity and default branch, then reads them back.
    pub async fn configure_git_identity(&self, identity: &GitIdentity) -> Result<()> {
        identity.validate()?;

        let mut script = Script::strict()
            .assign("name", &identity.name)
            .assign("email", &identity.email)
            .assign("branch", &self.env.default_branch);
        script = match &self.env.git_config_file {
            Some(file) => script
                .assign("cfgfile", file)
                .raw(r#"mkdir -p -- "$(dirname -- "$cfgfile")""#)
                .raw(r#"gitcfg() { git config --file "$cfgfile" "$@"; }"#),
            None => script.raw(r#"gitcfg() { git config --global "$@"; }"#),
        };
        let script = script
            .raw(r#"gitcfg user.name "$name""#)
            .raw(r#"gitcfg user.email "$email""#)
            .raw(r#"gitcfg init.defaultBranch "$branch""#)
            .raw(r#"printf '%s\n' "$(gitcfg --get user.name)" "$(gitcfg --get user.email)" "$(gitcfg --get init.defaultBranch)""#);

        let out = self.run_redacted(&script, "git identity").await?;
        let read_back: Vec<&str> = out.lines().collect();
        let expected = [
            identity.name.as_str(),
            identity.email.as_str(),
            self.env.default_branch.as_str(),
        ];
        if read_back != expected {
            return Err(Error::Exec {
                code: None,
                output: format!("git identity read back as {:?}", read_back),
            });
        }

        tracing::info!(
            instance_id = %self.handle.id(),
            name = %identity.name,
            email = %identity.email,
            "git identity configured"
        );
        Ok(())
    }

    /// Authenticates the source-host CLI with `token` and wires it into git.
    ///
    /// Missing tooling and rejected credentials fail at once; anything else
    /// is retried with capped, jittered exponential backoff.
    pub async fn configure_source_host_access(&self, token: &SecretString) -> Result<()> {
        let mut secrets = self.secrets.clone();
        secrets.register("source_host_token", token);

        let caps = self.handle.capabilities().await?;
        if !caps.gh {
            return Err(Error::ToolingMissing("gh".into()));
        }

        let policy = RetryPolicy::exponential(
            self.retry.auth_max_attempts,
            std::time::Duration::from_millis(self.retry.auth_initial_delay_ms),
            std::time::Duration::from_millis(self.retry.auth_max_delay_ms),
        );

        retry(&policy, "source-host login", |_attempt| {
            let secrets = &secrets;
            async move {
                let script = self.login_script(token);
                let out = self.handle.exec(&script).await?;
                if out.success() {
                    return Ok(());
                }
                let output = secrets.redact(&out.combined());
                match self.detector.classify(Some(out.exit_code), &output) {
                    FailureKind::ToolingMissing => Err(Error::ToolingMissing(output)),
                    FailureKind::Authentication => Err(Error::Authentication(output)),
                    FailureKind::Transient => Err(Error::Exec {
                        code: Some(out.exit_code),
                        output,
                    }),
                }
            }
        })
        .await?;

        tracing::info!(instance_id = %self.handle.id(), host = %self.git_host, "source host access configured");
        Ok(())
    }

    fn login_script(&self, token: &SecretString) -> Script {
        let token_file = format!("/tmp/devbox-gh-{}", uuid::Uuid::new_v4().simple());
        Script::strict()
            .raw(r#"command -v gh >/dev/null 2>&1 || { echo "tooling-missing: gh" >&2; exit 127; }"#)
            .raw("umask 077")
            .assign("host", &self.git_host)
            .assign("tokfile", &token_file)
            .raw(r#"trap 'rm -f -- "$tokfile"' EXIT"#)
            .write_file(&token_file, token.expose_secret())
            .raw(r#"gh auth login --hostname "$host" --with-token < "$tokfile""#)
            .raw(r#"gh auth setup-git --hostname "$host""#)
    }

    /// Runs `script`, failing with redacted output on non-zero exit.
    async fn run_redacted(&self, script: &Script, what: &str) -> Result<String> {
        let out = self.handle.exec(script).await?;
        if !out.success() {
            let output = self.secrets.redact(&out.combined());
            tracing::warn!(instance_id = %self.handle.id(), step = what, code = out.exit_code, output = %output, "bootstrap step failed");
            return Err(Error::Exec {
                code: Some(out.exit_code),
                output,
            });
        }
        Ok(out.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{LocalShellProvider, SandboxProvider, StartRequest};
    use std::collections::HashMap;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn bootstrapper(dir: &TempDir) -> (Arc<LocalShellProvider>, Bootstrapper) {
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
        let handle = SandboxHandle::new(provider.clone(), instance.id, Duration::from_secs(20))
            .with_env_loader("devbox-test-no-such-loader");
        let env = EnvConfig {
            loader: "devbox-test-no-such-loader".into(),
            dotfile: dir.path().join("env/.devbox-env").to_string_lossy().to_string(),
            shell_rc: dir.path().join(".bashrc").to_string_lossy().to_string(),
            git_config_file: Some(dir.path().join(".gitconfig").to_string_lossy().to_string()),
            default_branch: "trunk".into(),
        };
        let retry = RetryConfig {
            auth_initial_delay_ms: 1,
            auth_max_delay_ms: 2,
            ..RetryConfig::default()
        };
        let b = Bootstrapper::new(Arc::new(handle), env, retry, "github.com", SecretsManager::new());
        (provider, b)
    }

    fn sh(script: &str) -> String {
        let out = std::process::Command::new("bash")
            .arg("-c")
            .arg(script)
            .output()
            .expect("failed to run bash");
        assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
        String::from_utf8(out.stdout).unwrap()
    }

    #[test]
    fn parses_comments_exports_and_quotes() {
        let text = r#"
# comment
export API_URL=https://api.example.com # trailing
EMPTY=
SINGLE='literal $HOME "x"'
DOUBLE="say \"hi\" \$HOME"
MULTI="line one
line two"
"#;
        let entries = parse_dotenv(text).unwrap();
        assert_eq!(
            entries,
            vec![
                ("API_URL".to_string(), "https://api.example.com".to_string()),
                ("EMPTY".to_string(), String::new()),
                ("SINGLE".to_string(), r#"literal $HOME "x""#.to_string()),
                ("DOUBLE".to_string(), r#"say "hi" $HOME"#.to_string()),
                ("MULTI".to_string(), "line one\nline two".to_string()),
            ]
        );
    }

    #[test]
    fn rejects_bad_keys_and_unterminated_quotes() {
        assert!(parse_dotenv("1BAD=x").is_err());
        assert!(parse_dotenv("NOEQUALS").is_err());
        assert!(parse_dotenv("A=\"open").is_err());
        assert!(parse_dotenv("A-B=x").is_err());
    }

    #[test]
    fn payload_decodes_to_same_pairs() {
        let raw = "A=\"multi\nline \\\"quoted\\\"\"\nB='it''s'\nC=plain value\n";
        let blob = encode_env_payload(raw).unwrap();
        assert!(!blob.contains('\n'));
        assert_eq!(decode_env_payload(&blob).unwrap(), parse_dotenv(raw).unwrap());
    }

    #[test]
    fn rendered_env_survives_shell_sourcing() {
        let entries = vec![
            ("Q".to_string(), "a \"b\" 'c' $HOME `id` \\n".to_string()),
            ("ML".to_string(), "first\nsecond".to_string()),
        ];
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("env");
        std::fs::write(&file, render_env(&entries)).unwrap();
        let out = sh(&format!(
            "set -a; . {}; set +a; printf '%s\\0%s' \"$Q\" \"$ML\"",
            quote(file.to_str().unwrap())
        ));
        let values: Vec<&str> = out.split('\0').collect();
        assert_eq!(values, vec![entries[0].1.as_str(), entries[1].1.as_str()]);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_env_payload("!!!not base64").is_err());
    }

    #[tokio::test]
    async fn apply_env_falls_back_to_dotfile_once() {
        let dir = TempDir::new().unwrap();
        let (_provider, b) = bootstrapper(&dir).await;
        let blob = encode_env_payload("TOKEN=\"abc def\"\n").unwrap();

        assert_eq!(b.apply_env(&blob).await.unwrap(), EnvTarget::Dotfile);
        assert_eq!(b.apply_env(&blob).await.unwrap(), EnvTarget::Dotfile);

        let rc = std::fs::read_to_string(dir.path().join(".bashrc")).unwrap();
        assert_eq!(rc.matches(SHELL_RC_MARKER).count(), 1);

        let out = sh(&format!(
            ". {}; printf '%s' \"$TOKEN\"",
            quote(dir.path().join(".bashrc").to_str().unwrap())
        ));
        assert_eq!(out, "abc def");
    }

    #[tokio::test]
    async fn git_identity_is_written_and_verified() {
        let dir = TempDir::new().unwrap();
        let (_provider, b) = bootstrapper(&dir).await;
        let identity = GitIdentity {
            name: "Dev O'Brien".into(),
            email: "dev@example.com".into(),
        };
        b.configure_git_identity(&identity).await.unwrap();

        let cfg = std::fs::read_to_string(dir.path().join(".gitconfig")).unwrap();
        assert!(cfg.contains("Dev O'Brien"));
        assert!(cfg.contains("defaultBranch = trunk"));
    }

    #[tokio::test]
    async fn git_identity_rejects_control_characters() {
        let dir = TempDir::new().unwrap();
        let (provider, b) = bootstrapper(&dir).await;
        let identity = GitIdentity {
            name: "x\ny".into(),
            email: "dev@example.com".into(),
        };
        assert!(matches!(
            b.configure_git_identity(&identity).await,
            Err(Error::Validation(_))
        ));
        assert!(!provider.calls().iter().any(|c| c.starts_with("exec:")));
    }

    #[tokio::test]
    async fn login_script_keeps_token_in_heredoc_only() {
        let dir = TempDir::new().unwrap();
        let (_provider, b) = bootstrapper(&dir).await;
        let script = b
            .login_script(&SecretString::new("ghp_tok123".into()))
            .render();
        let hits: Vec<&str> = script.lines().filter(|l| l.contains("ghp_tok123")).collect();
        assert_eq!(hits, vec!["ghp_tok123"]);
        assert!(script.contains("trap 'rm -f -- \"$tokfile\"' EXIT"));
    }

    #[tokio::test]
    async fn missing_gh_short_circuits() {
        let dir = TempDir::new().unwrap();
        let (provider, b) = bootstrapper(&dir).await;
        let has_gh = std::process::Command::new("sh")
            .args(["-c", "command -v gh"])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false);
        if has_gh {
            return;
        }

        let err = b
            .configure_source_host_access(&SecretString::new("ghp_tok123".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ToolingMissing(_)));
        let execs = provider.calls().iter().filter(|c| c.starts_with("exec:")).count();
        assert_eq!(execs, 1, "only the capability probe should run");
    }
}

//! Engine configuration and validation.
//!
//! Loaded from TOML or YAML; every field has a default so an empty file
//! is a valid configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::sandbox::TtlAction;

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation errors (fatal).
    pub errors: Vec<String>,
    /// List of validation warnings (non-fatal).
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Adds an error to the result.
    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    /// Adds a warning to the result.
    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Merges another validation result into this one.
    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Converts to a Result, failing if there are errors.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    /// Validates the configuration and returns any issues found.
    fn validate(&self) -> ValidationResult;
}

/// Sandbox provider connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Base URL of the provider API.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Environment variable holding the provider API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Timeout for non-exec HTTP requests.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://127.0.0.1:8080/v1".to_string()
}

fn default_api_key_env() -> String {
    "DEVBOX_PROVIDER_API_KEY".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl ProviderConfig {
    /// Returns the request timeout as a Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Ports of the services every sandbox must expose.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicesConfig {
    /// Editor service port.
    #[serde(default = "default_editor_port")]
    pub editor_port: u16,
    /// Worker service port.
    #[serde(default = "default_worker_port")]
    pub worker_port: u16,
    /// Further ports that are never published on request.
    #[serde(default = "default_reserved_ports")]
    pub reserved_ports: Vec<u16>,
}

fn default_editor_port() -> u16 {
    39378
}

fn default_worker_port() -> u16 {
    39377
}

fn default_reserved_ports() -> Vec<u16> {
    vec![39376]
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            editor_port: default_editor_port(),
            worker_port: default_worker_port(),
            reserved_ports: default_reserved_ports(),
        }
    }
}

impl ServicesConfig {
    /// Returns true if `port` may not be published on request.
    pub fn is_reserved(&self, port: u16) -> bool {
        port == self.editor_port || port == self.worker_port || self.reserved_ports.contains(&port)
    }
}

/// Instance creation defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// TTL used when a request does not carry one.
    #[serde(default = "default_ttl")]
    pub default_ttl_secs: u64,
    /// Action on TTL expiry.
    #[serde(default)]
    pub ttl_action: TtlAction,
}

fn default_ttl() -> u64 {
    3600
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_ttl(),
            ttl_action: TtlAction::default(),
        }
    }
}

/// Workspace layout inside the sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Workspace root.
    #[serde(default = "default_workspace_root")]
    pub root: String,
    /// Clone URL with `{owner}` and `{name}` placeholders.
    #[serde(default = "default_clone_url_template")]
    pub clone_url_template: String,
    /// Shallow clone depth, if any.
    #[serde(default)]
    pub clone_depth: Option<u32>,
    /// Host the source-host CLI authenticates against.
    #[serde(default = "default_git_host")]
    pub git_host: String,
}

fn default_workspace_root() -> String {
    "/root/workspace".to_string()
}

fn default_clone_url_template() -> String {
    "https://github.com/{owner}/{name}.git".to_string()
}

fn default_git_host() -> String {
    "github.com".to_string()
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: default_workspace_root(),
            clone_url_template: default_clone_url_template(),
            clone_depth: None,
            git_host: default_git_host(),
        }
    }
}

impl WorkspaceConfig {
    /// Expands the clone URL template for a repository.
    pub fn clone_url(&self, owner: &str, name: &str) -> String {
        self.clone_url_template
            .replace("{owner}", owner)
            .replace("{name}", name)
    }
}

/// Retry ceilings and delays.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts per clone.
    #[serde(default = "default_clone_max_attempts")]
    pub clone_max_attempts: u32,
    /// Linear backoff step between clone attempts.
    #[serde(default = "default_clone_delay_ms")]
    pub clone_delay_ms: u64,
    /// Attempts for source-host CLI authentication.
    #[serde(default = "default_auth_max_attempts")]
    pub auth_max_attempts: u32,
    /// First delay of the authentication backoff.
    #[serde(default = "default_auth_initial_delay_ms")]
    pub auth_initial_delay_ms: u64,
    /// Delay cap of the authentication backoff.
    #[serde(default = "default_auth_max_delay_ms")]
    pub auth_max_delay_ms: u64,
}

fn default_clone_max_attempts() -> u32 {
    3
}

fn default_clone_delay_ms() -> u64 {
    1000
}

fn default_auth_max_attempts() -> u32 {
    5
}

fn default_auth_initial_delay_ms() -> u64 {
    500
}

fn default_auth_max_delay_ms() -> u64 {
    8000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            clone_max_attempts: default_clone_max_attempts(),
            clone_delay_ms: default_clone_delay_ms(),
            auth_max_attempts: default_auth_max_attempts(),
            auth_initial_delay_ms: default_auth_initial_delay_ms(),
            auth_max_delay_ms: default_auth_max_delay_ms(),
        }
    }
}

/// Remote command timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecConfig {
    /// Timeout for ordinary commands.
    #[serde(default = "default_exec_timeout")]
    pub timeout_secs: u64,
    /// Timeout for a single clone attempt.
    #[serde(default = "default_clone_timeout")]
    pub clone_timeout_secs: u64,
}

fn default_exec_timeout() -> u64 {
    60
}

fn default_clone_timeout() -> u64 {
    300
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_exec_timeout(),
            clone_timeout_secs: default_clone_timeout(),
        }
    }
}

impl ExecConfig {
    /// Returns the ordinary command timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Returns the per-attempt clone timeout.
    pub fn clone_timeout(&self) -> Duration {
        Duration::from_secs(self.clone_timeout_secs)
    }
}

/// How long finished background task records are kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TasksConfig {
    /// Finished records kept per instance, newest first.
    #[serde(default = "default_retain_per_instance")]
    pub retain_per_instance: usize,
    /// Finished records older than this are dropped.
    #[serde(default = "default_retain_secs")]
    pub retain_secs: u64,
}

fn default_retain_per_instance() -> usize {
    32
}

fn default_retain_secs() -> u64 {
    24 * 60 * 60
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            retain_per_instance: default_retain_per_instance(),
            retain_secs: default_retain_secs(),
        }
    }
}

impl TasksConfig {
    pub fn retain_for(&self) -> Duration {
        Duration::from_secs(self.retain_secs)
    }
}

/// How scripts are hosted inside the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalMode {
    /// tmux when installed, otherwise detached processes.
    #[default]
    Auto,
    /// Always tmux.
    Tmux,
    /// Detached background processes.
    Detached,
}

/// Script supervision settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptsConfig {
    /// Directory for script files, logs and PID files.
    #[serde(default = "default_scripts_dir")]
    pub dir: String,
    /// Terminal session name.
    #[serde(default = "default_session")]
    pub session: String,
    /// Session hosting mode.
    #[serde(default)]
    pub terminal: TerminalMode,
    /// Wait bound for a maintenance run.
    #[serde(default = "default_maintenance_timeout")]
    pub maintenance_timeout_secs: u64,
    /// Delay before the dev-run health check.
    #[serde(default = "default_dev_health_delay")]
    pub dev_health_delay_ms: u64,
    /// Wait bound for a stopped dev run to die.
    #[serde(default = "default_stop_wait")]
    pub stop_wait_ms: u64,
}

fn default_scripts_dir() -> String {
    "/var/tmp/devbox".to_string()
}

fn default_session() -> String {
    "devbox".to_string()
}

fn default_maintenance_timeout() -> u64 {
    600
}

fn default_dev_health_delay() -> u64 {
    1500
}

fn default_stop_wait() -> u64 {
    5000
}

impl Default for ScriptsConfig {
    fn default() -> Self {
        Self {
            dir: default_scripts_dir(),
            session: default_session(),
            terminal: TerminalMode::default(),
            maintenance_timeout_secs: default_maintenance_timeout(),
            dev_health_delay_ms: default_dev_health_delay(),
            stop_wait_ms: default_stop_wait(),
        }
    }
}

impl ScriptsConfig {
    /// Returns the maintenance timeout.
    pub fn maintenance_timeout(&self) -> Duration {
        Duration::from_secs(self.maintenance_timeout_secs)
    }

    /// Returns the dev-run health-check delay.
    pub fn dev_health_delay(&self) -> Duration {
        Duration::from_millis(self.dev_health_delay_ms)
    }

    /// Returns the wait bound for stopping a dev run.
    pub fn stop_wait(&self) -> Duration {
        Duration::from_millis(self.stop_wait_ms)
    }
}

/// Environment injection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvConfig {
    /// Privileged in-sandbox env loader.
    #[serde(default = "default_loader")]
    pub loader: String,
    /// Fallback dotfile path.
    #[serde(default = "default_dotfile")]
    pub dotfile: String,
    /// Shell startup file that sources the dotfile.
    #[serde(default = "default_shell_rc")]
    pub shell_rc: String,
    /// Git config file for the commit identity; the global one when unset.
    #[serde(default)]
    pub git_config_file: Option<String>,
    /// Branch name new repositories start on.
    #[serde(default = "default_branch")]
    pub default_branch: String,
}

fn default_loader() -> String {
    "envctl".to_string()
}

fn default_dotfile() -> String {
    "/root/.devbox/env".to_string()
}

fn default_shell_rc() -> String {
    "/root/.bashrc".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            loader: default_loader(),
            dotfile: default_dotfile(),
            shell_rc: default_shell_rc(),
            git_config_file: None,
            default_branch: default_branch(),
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub services: ServicesConfig,
    #[serde(default)]
    pub instance: InstanceConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub exec: ExecConfig,
    #[serde(default)]
    pub scripts: ScriptsConfig,
    #[serde(default)]
    pub env: EnvConfig,
    #[serde(default)]
    pub tasks: TasksConfig,
}

impl EngineConfig {
    /// Loads a configuration file, choosing the format by extension.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)
                .map_err(|e| Error::Config(format!("failed to parse {}: {}", path.display(), e)))?,
            _ => toml::from_str(&content)
                .map_err(|e| Error::Config(format!("failed to parse {}: {}", path.display(), e)))?,
        };

        for warning in config.validate().into_result()? {
            tracing::warn!(config = %path.display(), "{}", warning);
        }
        Ok(config)
    }
}

fn is_valid_session_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl Validate for EngineConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.services.editor_port == self.services.worker_port {
            result.add_error("services.editor_port and services.worker_port must differ");
        }

        if self.retry.clone_max_attempts == 0 {
            result.add_error("retry.clone_max_attempts must be at least 1");
        }
        if self.retry.auth_max_attempts == 0 {
            result.add_error("retry.auth_max_attempts must be at least 1");
        }
        if self.retry.auth_initial_delay_ms > self.retry.auth_max_delay_ms {
            result.add_warning("retry.auth_initial_delay_ms exceeds retry.auth_max_delay_ms");
        }

        let template = &self.workspace.clone_url_template;
        if !template.contains("{owner}") || !template.contains("{name}") {
            result.add_error("workspace.clone_url_template must contain {owner} and {name}");
        }

        if !self.workspace.root.starts_with('/') || self.workspace.root.trim_end_matches('/').is_empty()
        {
            result.add_error("workspace.root must be an absolute path below /");
        }

        if !self.scripts.dir.starts_with('/') {
            result.add_error("scripts.dir must be an absolute path");
        }

        if !is_valid_session_name(&self.scripts.session) {
            result.add_error("scripts.session may only contain [A-Za-z0-9_-], max 64 chars");
        }

        if self.instance.default_ttl_secs < 300 {
            result.add_warning("instance.default_ttl_secs under 5 minutes may pause sandboxes mid-setup");
        }

        if self.exec.timeout_secs == 0 || self.exec.clone_timeout_secs == 0 {
            result.add_error("exec timeouts must be positive");
        }

        if self.tasks.retain_per_instance == 0 {
            result.add_warning("tasks.retain_per_instance is 0; task outcomes are dropped once finished");
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_toml_gives_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config.services.editor_port, 39378);
        assert_eq!(config.services.worker_port, 39377);
        assert_eq!(config.workspace.root, "/root/workspace");
        assert_eq!(config.retry.clone_max_attempts, 3);
        assert_eq!(config.scripts.terminal, TerminalMode::Auto);
        assert_eq!(config.instance.ttl_action, TtlAction::Pause);
        assert_eq!(config.tasks.retain_per_instance, 32);
        assert!(config.validate().is_valid());
    }

    #[test]
    fn toml_overrides_nested_fields() {
        let toml = r#"
[workspace]
root = "/home/dev/ws"
clone_depth = 1

[scripts]
terminal = "detached"
dev_health_delay_ms = 200
"#;
        let config: EngineConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.workspace.root, "/home/dev/ws");
        assert_eq!(config.workspace.clone_depth, Some(1));
        assert_eq!(config.scripts.terminal, TerminalMode::Detached);
        assert_eq!(config.scripts.dev_health_delay(), Duration::from_millis(200));
        assert_eq!(config.scripts.session, "devbox");
    }

    #[test]
    fn load_reads_yaml_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "services:\n  editor_port: 8443\ninstance:\n  ttl_action: stop").unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.services.editor_port, 8443);
        assert_eq!(config.instance.ttl_action, TtlAction::Stop);
    }

    #[test]
    fn clone_url_expands_placeholders() {
        let ws = WorkspaceConfig::default();
        assert_eq!(ws.clone_url("acme", "api"), "https://github.com/acme/api.git");
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = EngineConfig::default();
        config.services.worker_port = config.services.editor_port;
        config.retry.clone_max_attempts = 0;
        config.workspace.clone_url_template = "https://github.com/fixed.git".into();
        config.workspace.root = "relative".into();
        config.scripts.session = "bad name;".into();

        let result = config.validate();
        assert_eq!(result.errors.len(), 5);
        assert!(result.into_result().is_err());
    }

    #[test]
    fn short_ttl_is_only_a_warning() {
        let mut config = EngineConfig::default();
        config.instance.default_ttl_secs = 60;
        let result = config.validate();
        assert!(result.is_valid());
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn reserved_ports_include_required_services() {
        let services = ServicesConfig::default();
        assert!(services.is_reserved(39378));
        assert!(services.is_reserved(39377));
        assert!(services.is_reserved(39376));
        assert!(!services.is_reserved(3000));
    }
}

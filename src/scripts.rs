//! Maintenance and dev script supervision inside a sandbox.
//!
//! Both kinds run from files under the scripts directory through a small
//! wrapper that records the PID (and, for maintenance, the exit code)
//! next to the log. Runs are hosted in a tmux session when available,
//! otherwise as detached session leaders, so output stays on disk after
//! the request that started them returns.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{ScriptsConfig, TerminalMode};
use crate::error::{Error, Result};
use crate::sandbox::SandboxHandle;
use crate::secrets::SecretsManager;
use crate::shell::{quote, Script};

const POLL_INTERVAL_MS: u64 = 200;
const LOG_TAIL_LINES: &str = "40";

/// Liveness check treating zombies as dead. Falls back to `kill -0`
/// without procfs.
const ALIVE_FN: [&str; 10] = [
    "alive() {",
    "  if [ -d /proc/self ]; then",
    r#"    [ -r "/proc/$1/stat" ] || return 1"#,
    r#"    st=$(sed 's/^.*) //' "/proc/$1/stat" 2>/dev/null | cut -c1)"#,
    r#"    [ -n "$st" ] && [ "$st" != Z ]"#,
    "  else",
    r#"    kill -0 "$1" 2>/dev/null"#,
    "  fi",
    "}",
    r#"readpid() { p=$(cat "$1" 2>/dev/null || true); case "$p" in ''|*[!0-9]*) p= ;; esac; echo "$p"; }"#,
];

/// Kind of supervised script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptKind {
    /// One-shot setup run.
    Maintenance,
    /// Long-running process.
    Dev,
}

impl ScriptKind {
    fn stem(self) -> &'static str {
        match self {
            ScriptKind::Maintenance => "maintenance",
            ScriptKind::Dev => "dev",
        }
    }
}

impl fmt::Display for ScriptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.stem())
    }
}

/// A started script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptRun {
    pub kind: ScriptKind,
    pub path: String,
    pub pid_file: Option<String>,
    pub log_file: String,
    /// `tmux:<session>:<window>` or `detached`.
    pub terminal: String,
    pub pid: Option<u32>,
}

/// A script that failed to run or exited badly. Messages are redacted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptFailure {
    pub kind: ScriptKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_tail: Option<String>,
}

impl fmt::Display for ScriptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} script: {}", self.kind, self.message)?;
        if let Some(code) = self.exit_code {
            write!(f, " (exit {})", code)?;
        }
        Ok(())
    }
}

/// Hosting chosen for this sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Host {
    Tmux,
    Detached,
}

struct Paths {
    script: String,
    wrapper: String,
    log: String,
    pid: String,
    exit: String,
}

/// Runs and replaces scripts in one sandbox.
pub struct ScriptSupervisor {
    handle: Arc<SandboxHandle>,
    config: ScriptsConfig,
    workdir: String,
    secrets: SecretsManager,
}

impl ScriptSupervisor {
    /// Scripts start in `workdir`.
    pub fn new(
        handle: Arc<SandboxHandle>,
        config: ScriptsConfig,
        workdir: impl Into<String>,
        secrets: SecretsManager,
    ) -> Self {
        Self {
            handle,
            config,
            workdir: workdir.into(),
            secrets,
        }
    }

    fn paths(&self, kind: ScriptKind) -> Paths {
        let dir = self.config.dir.trim_end_matches('/');
        let stem = kind.stem();
        Paths {
            script: format!("{}/{}.sh", dir, stem),
            wrapper: format!("{}/{}-wrapper.sh", dir, stem),
            log: format!("{}/{}.log", dir, stem),
            pid: format!("{}/{}.pid", dir, stem),
            exit: format!("{}/{}.log.exit", dir, stem),
        }
    }

    async fn host(&self) -> Result<Host> {
        let caps = self.handle.capabilities().await?;
        match self.config.terminal {
            TerminalMode::Detached => Ok(Host::Detached),
            TerminalMode::Tmux if caps.tmux => Ok(Host::Tmux),
            TerminalMode::Tmux => Err(Error::ToolingMissing("tmux".into())),
            TerminalMode::Auto if caps.tmux => Ok(Host::Tmux),
            TerminalMode::Auto => Ok(Host::Detached),
        }
    }

    fn terminal_label(&self, host: Host, kind: ScriptKind) -> String {
        match host {
            Host::Tmux => format!("tmux:{}:{}", self.config.session, kind.stem()),
            Host::Detached => "detached".to_string(),
        }
    }

    /// Wrapper executed by the host. Records its PID, then becomes the
    /// script (dev) or waits for it and records the exit code (maintenance).
    fn wrapper(&self, kind: ScriptKind, paths: &Paths) -> String {
        let mut text = String::from("#!/bin/bash\n");
        text.push_str(&format!(
            "echo $$ > {tmp} && mv -f {tmp} {pid}\n",
            tmp = quote(&format!("{}.tmp", paths.pid)),
            pid = quote(&paths.pid)
        ));
        text.push_str(&format!("cd {} 2>/dev/null || true\n", quote(&self.workdir)));
        match kind {
            ScriptKind::Dev => {
                text.push_str(&format!(
                    "exec bash {} >> {} 2>&1\n",
                    quote(&paths.script),
                    quote(&paths.log)
                ));
            }
            ScriptKind::Maintenance => {
                text.push_str(&format!(
                    "bash {} >> {} 2>&1\n",
                    quote(&paths.script),
                    quote(&paths.log)
                ));
                text.push_str("code=$?\n");
                text.push_str(&format!(
                    "echo \"$code\" > {tmp} && mv -f {tmp} {exit}\n",
                    tmp = quote(&format!("{}.tmp", paths.exit)),
                    exit = quote(&paths.exit)
                ));
            }
        }
        text
    }

    fn with_alive(mut script: Script) -> Script {
        for line in ALIVE_FN {
            script = script.raw(line);
        }
        script
    }

    fn stop_ticks(&self) -> u64 {
        (self.config.stop_wait_ms / 100).max(1)
    }

    /// Stops the run recorded in `kind`'s PID file and waits until it is
    /// gone. SIGTERM goes to the process group first, SIGKILL after the
    /// stop wait.
    pub async fn stop(&self, kind: ScriptKind) -> Result<()> {
        let paths = self.paths(kind);
        let mut script = Script::strict()
            .assign("pidfile", &paths.pid)
            .assign("ticks", self.stop_ticks().to_string())
            .assign("session", &self.config.session)
            .assign("window", kind.stem());
        script = Self::with_alive(script)
            .raw("if command -v tmux >/dev/null 2>&1; then")
            .raw(r#"  tmux kill-window -t "$session:$window" 2>/dev/null || true"#)
            .raw("fi")
            .raw(r#"pid=$(readpid "$pidfile")"#)
            .raw(r#"if [ -n "$pid" ] && alive "$pid"; then"#)
            .raw(r#"  kill -TERM -- "-$pid" 2>/dev/null || kill -TERM "$pid" 2>/dev/null || true"#)
            .raw("  i=0")
            .raw(r#"  while alive "$pid" && [ "$i" -lt "$ticks" ]; do sleep 0.1; i=$((i+1)); done"#)
            .raw(r#"  if alive "$pid"; then"#)
            .raw(r#"    kill -KILL -- "-$pid" 2>/dev/null || kill -KILL "$pid" 2>/dev/null || true"#)
            .raw("    i=0")
            .raw(r#"    while alive "$pid" && [ "$i" -lt 20 ]; do sleep 0.1; i=$((i+1)); done"#)
            .raw("  fi")
            .raw(r#"  if alive "$pid"; then echo "process $pid survived SIGKILL" >&2; exit 1; fi"#)
            .raw(r#"  echo "stopped=$pid""#)
            .raw("fi")
            .raw(r#"rm -f -- "$pidfile""#);

        let timeout = self.config.stop_wait() * 2 + Duration::from_secs(10);
        let out = self.handle.exec_with_timeout(&script, timeout).await?;
        if !out.success() {
            return Err(Error::Exec {
                code: Some(out.exit_code),
                output: self.secrets.redact(&out.combined()),
            });
        }
        if let Some(pid) = out.stdout.lines().find_map(|l| l.strip_prefix("stopped=")) {
            tracing::info!(instance_id = %self.handle.id(), kind = %kind, pid, "stopped previous run");
        }
        Ok(())
    }

    /// Writes the script (when given) and the wrapper, then launches it.
    /// Returns the PID the wrapper recorded.
    async fn launch(&self, kind: ScriptKind, host: Host, content: Option<&str>) -> Result<u32> {
        let paths = self.paths(kind);
        let mut script = Script::strict()
            .raw("umask 077")
            .assign("dir", &self.config.dir)
            .assign("script", &paths.script)
            .assign("wrapper", &paths.wrapper)
            .assign("log", &paths.log)
            .assign("pidfile", &paths.pid)
            .assign("exitfile", &paths.exit)
            .raw(r#"mkdir -p -- "$dir""#);
        if let Some(content) = content {
            script = script.write_file(&paths.script, content);
        }
        script = script
            .raw(r#"[ -f "$script" ] || { echo "no $script to run" >&2; exit 1; }"#)
            .write_file(&paths.wrapper, &self.wrapper(kind, &paths))
            .raw(r#": > "$log""#)
            .raw(r#"rm -f -- "$pidfile" "$exitfile""#);

        script = match host {
            Host::Detached => script
                .raw("if command -v setsid >/dev/null 2>&1; then")
                .raw(r#"  nohup setsid bash "$wrapper" </dev/null >/dev/null 2>&1 &"#)
                .raw("else")
                .raw(r#"  nohup bash "$wrapper" </dev/null >/dev/null 2>&1 &"#)
                .raw("fi"),
            Host::Tmux => script
                .assign("session", &self.config.session)
                .assign("window", kind.stem())
                .assign("cmd", format!("bash {}", quote(&paths.wrapper)))
                .raw(r#"tmux has-session -t "$session" 2>/dev/null || tmux new-session -d -s "$session" -n shell"#)
                .raw(r#"tmux kill-window -t "$session:$window" 2>/dev/null || true"#)
                .raw(r#"tmux new-window -d -t "$session:" -n "$window" "$cmd""#),
        };

        let script = script
            .raw("i=0")
            .raw(r#"while [ ! -s "$pidfile" ]; do"#)
            .raw(r#"  if [ "$i" -ge 100 ]; then echo "run did not record a pid" >&2; exit 1; fi"#)
            .raw("  sleep 0.05; i=$((i+1))")
            .raw("done")
            .raw(r#"echo "pid=$(cat "$pidfile")""#);

        let out = self.handle.exec(&script).await?;
        if !out.success() {
            return Err(Error::Exec {
                code: Some(out.exit_code),
                output: self.secrets.redact(&out.combined()),
            });
        }
        out.stdout
            .lines()
            .find_map(|l| l.strip_prefix("pid=").and_then(|p| p.trim().parse().ok()))
            .ok_or_else(|| Error::Exec {
                code: None,
                output: "launch did not report a pid".into(),
            })
    }

    fn failure(&self, kind: ScriptKind, err: &Error) -> ScriptFailure {
        ScriptFailure {
            kind,
            message: self.secrets.redact(&err.to_string()),
            exit_code: match err {
                Error::Exec { code, .. } => *code,
                _ => None,
            },
            log_tail: None,
        }
    }

    fn run_record(&self, kind: ScriptKind, host: Host, pid: u32) -> ScriptRun {
        let paths = self.paths(kind);
        ScriptRun {
            kind,
            path: paths.script,
            pid_file: (kind == ScriptKind::Dev).then_some(paths.pid),
            log_file: paths.log,
            terminal: self.terminal_label(host, kind),
            pid: Some(pid),
        }
    }

    /// Runs the maintenance script to completion.
    ///
    /// The file is rewritten before every run. A non-zero exit or a run
    /// exceeding the maintenance timeout is reported with the log tail.
    pub async fn run_maintenance(&self, content: &str) -> std::result::Result<ScriptRun, ScriptFailure> {
        let kind = ScriptKind::Maintenance;
        let attempt = async {
            let host = self.host().await?;
            self.stop(kind).await?;
            let pid = self.launch(kind, host, Some(content)).await?;
            tracing::info!(instance_id = %self.handle.id(), pid, terminal = %self.terminal_label(host, kind), "maintenance started");
            let outcome = self.await_exit().await?;
            Ok::<_, Error>((host, pid, outcome))
        };

        let (host, pid, outcome) = attempt.await.map_err(|e| self.failure(kind, &e))?;
        match outcome {
            MaintenanceExit::Code(0) => {
                tracing::info!(instance_id = %self.handle.id(), "maintenance succeeded");
                Ok(self.run_record(kind, host, pid))
            }
            MaintenanceExit::Code(code) => {
                let failure = ScriptFailure {
                    kind,
                    message: "maintenance script failed".into(),
                    exit_code: Some(code),
                    log_tail: Some(self.log_tail(kind).await),
                };
                tracing::warn!(instance_id = %self.handle.id(), code, "maintenance failed");
                Err(failure)
            }
            MaintenanceExit::TimedOut => {
                let mut message = format!(
                    "maintenance script exceeded {:?}",
                    self.config.maintenance_timeout()
                );
                if let Err(err) = self.stop(kind).await {
                    let err = self.secrets.redact(&err.to_string());
                    tracing::warn!(instance_id = %self.handle.id(), error = %err, "timed out maintenance run could not be stopped");
                    message.push_str(&format!("; run could not be stopped: {}", err));
                }
                Err(ScriptFailure {
                    kind,
                    message,
                    exit_code: None,
                    log_tail: Some(self.log_tail(kind).await),
                })
            }
        }
    }

    async fn await_exit(&self) -> Result<MaintenanceExit> {
        let paths = self.paths(ScriptKind::Maintenance);
        let ticks = (self.config.maintenance_timeout().as_millis() as u64 / POLL_INTERVAL_MS).max(1);
        let script = Script::strict()
            .assign("exitfile", &paths.exit)
            .assign("ticks", ticks.to_string())
            .raw("i=0")
            .raw(r#"while [ ! -f "$exitfile" ]; do"#)
            .raw(r#"  if [ "$i" -ge "$ticks" ]; then echo status=timeout; exit 0; fi"#)
            .raw("  sleep 0.2; i=$((i+1))")
            .raw("done")
            .raw(r#"echo "status=$(cat "$exitfile")""#);

        let timeout = self.config.maintenance_timeout() + Duration::from_secs(30);
        let out = self.handle.exec_with_timeout(&script, timeout).await?;
        let status = out
            .stdout
            .lines()
            .find_map(|l| l.strip_prefix("status="))
            .map(str::trim)
            .unwrap_or_default();
        match status {
            "timeout" => Ok(MaintenanceExit::TimedOut),
            code => code.parse().map(MaintenanceExit::Code).map_err(|_| Error::Exec {
                code: Some(out.exit_code),
                output: format!("unexpected maintenance status '{}'", code),
            }),
        }
    }

    /// Returns the last lines of a run's log, redacted.
    pub async fn log_tail(&self, kind: ScriptKind) -> String {
        let paths = self.paths(kind);
        let script = Script::new()
            .assign("log", &paths.log)
            .assign("lines", LOG_TAIL_LINES)
            .raw(r#"tail -n "$lines" -- "$log" 2>/dev/null || true"#);
        match self.handle.exec(&script).await {
            Ok(out) => self.secrets.redact(out.stdout.trim_end()),
            Err(err) => format!("log unavailable: {}", self.secrets.redact(&err.to_string())),
        }
    }

    /// Replaces the dev run with `content`.
    ///
    /// The previous run is verified dead before the new one starts. After
    /// the health delay the new process must still be alive.
    pub async fn start_dev(&self, content: &str) -> std::result::Result<ScriptRun, ScriptFailure> {
        self.start_dev_inner(Some(content)).await
    }

    /// Restarts the dev run from the script file already in the sandbox.
    /// Returns `None` when no dev script was ever written.
    pub async fn restart_dev(&self) -> std::result::Result<Option<ScriptRun>, ScriptFailure> {
        let paths = self.paths(ScriptKind::Dev);
        let probe = Script::new()
            .assign("script", &paths.script)
            .raw(r#"if [ -f "$script" ]; then echo present; fi"#);
        let present = self
            .handle
            .exec(&probe)
            .await
            .map_err(|e| self.failure(ScriptKind::Dev, &e))?
            .stdout
            .contains("present");
        if !present {
            return Ok(None);
        }
        self.start_dev_inner(None).await.map(Some)
    }

    async fn start_dev_inner(
        &self,
        content: Option<&str>,
    ) -> std::result::Result<ScriptRun, ScriptFailure> {
        let kind = ScriptKind::Dev;
        let started = async {
            let host = self.host().await?;
            self.stop(kind).await?;
            let pid = self.launch(kind, host, content).await?;
            Ok::<_, Error>((host, pid))
        };
        let (host, pid) = started.await.map_err(|e| self.failure(kind, &e))?;
        tracing::info!(instance_id = %self.handle.id(), pid, terminal = %self.terminal_label(host, kind), "dev run started");

        tokio::time::sleep(self.config.dev_health_delay()).await;
        let healthy = self
            .is_alive(pid)
            .await
            .map_err(|e| self.failure(kind, &e))?;
        if !healthy {
            let tail = self.log_tail(kind).await;
            tracing::warn!(instance_id = %self.handle.id(), pid, "dev run exited during health check");
            return Err(ScriptFailure {
                kind,
                message: "dev script exited shortly after start".into(),
                exit_code: None,
                log_tail: Some(tail),
            });
        }
        Ok(self.run_record(kind, host, pid))
    }

    /// Returns true if `pid` is a live, non-zombie process in the sandbox.
    pub async fn is_alive(&self, pid: u32) -> Result<bool> {
        let script = Self::with_alive(Script::new().assign("pid", pid.to_string()))
            .raw(r#"if alive "$pid"; then echo alive; else echo dead; fi"#);
        let out = self.handle.exec_checked(&script).await?;
        Ok(out.stdout.trim() == "alive")
    }

    /// Returns the PID recorded for the current dev run, if it is alive.
    pub async fn dev_pid(&self) -> Result<Option<u32>> {
        let paths = self.paths(ScriptKind::Dev);
        let script = Self::with_alive(Script::new().assign("pidfile", &paths.pid))
            .raw(r#"pid=$(readpid "$pidfile")"#)
            .raw(r#"if [ -n "$pid" ] && alive "$pid"; then echo "$pid"; fi"#);
        let out = self.handle.exec_checked(&script).await?;
        Ok(out.stdout.trim().parse().ok())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MaintenanceExit {
    Code(i32),
    TimedOut,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{LocalShellProvider, SandboxProvider, StartRequest};
    use secrecy::SecretString;
    use std::collections::HashMap;
    use tempfile::TempDir;

    async fn supervisor(dir: &TempDir, secrets: SecretsManager) -> ScriptSupervisor {
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
        let handle = Arc::new(SandboxHandle::new(provider, instance.id, Duration::from_secs(30)));
        let config = ScriptsConfig {
            dir: dir.path().join("scripts").to_string_lossy().to_string(),
            session: "devbox-test".into(),
            terminal: TerminalMode::Detached,
            maintenance_timeout_secs: 10,
            dev_health_delay_ms: 300,
            stop_wait_ms: 2000,
        };
        ScriptSupervisor::new(handle, config, dir.path().to_string_lossy().to_string(), secrets)
    }

    #[tokio::test]
    async fn maintenance_success_runs_in_workdir() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir, SecretsManager::new()).await;

        let run = sup.run_maintenance("echo built > marker.txt\n").await.unwrap();
        assert_eq!(run.kind, ScriptKind::Maintenance);
        assert_eq!(run.terminal, "detached");
        let marker = std::fs::read_to_string(dir.path().join("marker.txt")).unwrap();
        assert_eq!(marker, "built\n");
    }

    #[tokio::test]
    async fn maintenance_failure_reports_redacted_log_tail() {
        let dir = TempDir::new().unwrap();
        let mut secrets = SecretsManager::new();
        secrets.register("token", &SecretString::new("tok_s3cr3t".into()));
        let sup = supervisor(&dir, secrets).await;

        let failure = sup
            .run_maintenance("echo using tok_s3cr3t\necho broken >&2\nexit 3\n")
            .await
            .unwrap_err();
        assert_eq!(failure.exit_code, Some(3));
        let tail = failure.log_tail.unwrap();
        assert!(tail.contains("broken"));
        assert!(tail.contains("[REDACTED]"));
        assert!(!tail.contains("tok_s3cr3t"));
    }

    #[tokio::test]
    async fn timed_out_maintenance_reports_failed_stop() {
        let dir = TempDir::new().unwrap();
        let mut sup = supervisor(&dir, SecretsManager::new()).await;
        sup.config.maintenance_timeout_secs = 2;
        let pidfile = dir.path().join("scripts/maintenance.pid");

        let failure = sup
            .run_maintenance(&format!(
                "sleep 1\nrm -f '{pid}'\nmkdir '{pid}'\nsleep 4\n",
                pid = pidfile.display()
            ))
            .await
            .unwrap_err();
        assert_eq!(failure.exit_code, None);
        assert!(failure.message.contains("exceeded"), "{}", failure.message);
        assert!(failure.message.contains("could not be stopped"), "{}", failure.message);
    }

    #[tokio::test]
    async fn maintenance_file_is_rewritten_each_run() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir, SecretsManager::new()).await;

        sup.run_maintenance("echo one > out.txt\n").await.unwrap();
        sup.run_maintenance("echo two > out.txt\n").await.unwrap();
        let out = std::fs::read_to_string(dir.path().join("out.txt")).unwrap();
        assert_eq!(out, "two\n");
    }

    #[tokio::test]
    async fn dev_run_replacement_leaves_one_process() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir, SecretsManager::new()).await;

        let first = sup.start_dev("while true; do sleep 1; done\n").await.unwrap();
        let second = sup.start_dev("while true; do sleep 1; done\n").await.unwrap();

        let first_pid = first.pid.unwrap();
        let second_pid = second.pid.unwrap();
        assert_ne!(first_pid, second_pid);
        assert!(!sup.is_alive(first_pid).await.unwrap());
        assert!(sup.is_alive(second_pid).await.unwrap());
        assert_eq!(sup.dev_pid().await.unwrap(), Some(second_pid));

        sup.stop(ScriptKind::Dev).await.unwrap();
        assert!(!sup.is_alive(second_pid).await.unwrap());
        assert_eq!(sup.dev_pid().await.unwrap(), None);
    }

    #[tokio::test]
    async fn crashing_dev_run_fails_health_check() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir, SecretsManager::new()).await;

        let failure = sup
            .start_dev("echo cannot bind port >&2\nexit 1\n")
            .await
            .unwrap_err();
        assert_eq!(failure.kind, ScriptKind::Dev);
        assert!(failure.log_tail.unwrap().contains("cannot bind port"));
    }

    #[tokio::test]
    async fn restart_without_script_is_noop() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir, SecretsManager::new()).await;
        assert_eq!(sup.restart_dev().await.unwrap(), None);
    }

    #[tokio::test]
    async fn restart_reuses_existing_script() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir, SecretsManager::new()).await;
        let first = sup.start_dev("sleep 30\n").await.unwrap();

        let restarted = sup.restart_dev().await.unwrap().unwrap();
        assert_ne!(restarted.pid, first.pid);
        assert!(!sup.is_alive(first.pid.unwrap()).await.unwrap());
        sup.stop(ScriptKind::Dev).await.unwrap();
    }

    #[tokio::test]
    async fn wrapper_quotes_paths() {
        let paths = Paths {
            script: "/tmp/a b/dev.sh".into(),
            wrapper: "/tmp/a b/dev-wrapper.sh".into(),
            log: "/tmp/a b/dev.log".into(),
            pid: "/tmp/a b/dev.pid".into(),
            exit: "/tmp/a b/dev.log.exit".into(),
        };
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir, SecretsManager::new()).await;
        let text = sup.wrapper(ScriptKind::Dev, &paths);
        assert!(text.contains("exec bash '/tmp/a b/dev.sh' >> '/tmp/a b/dev.log' 2>&1"));
    }
}

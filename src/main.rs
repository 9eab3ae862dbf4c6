//! devbox CLI
//!
//! Drives the sandbox engine from request files and prints JSON results.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use secrecy::SecretString;
use serde::de::DeserializeOwned;
use serde::Serialize;

use devbox_engine::collab::{MemorySecretStore, StaticTokenSourceHost, TrustCaller};
use devbox_engine::config::{EngineConfig, Validate};
use devbox_engine::engine::{Engine, ProvisionRequest, ReconcileRequest, ScriptUpdateRequest};
use devbox_engine::sandbox::{HttpSandboxProvider, LocalShellProvider, SandboxProvider};
use devbox_engine::secrets::{SecretRef, SecretSource};
use devbox_engine::{Error, Result};

#[derive(Parser)]
#[command(name = "devbox", about = "Provision and reconcile remote dev sandboxes")]
struct Cli {
    /// Engine configuration file (.toml, .yaml or .yml)
    #[arg(long, short, env = "DEVBOX_CONFIG")]
    config: Option<PathBuf>,

    /// Run sandboxes on this host instead of the provider API
    #[arg(long)]
    local: bool,

    /// Caller identity checked against the team
    #[arg(long, default_value = "cli")]
    caller: String,

    /// Source-host token used for clones and CLI login
    #[arg(long, env = "DEVBOX_SOURCE_TOKEN", hide_env_values = true)]
    source_token: Option<String>,

    /// File holding the source-host token
    #[arg(long, conflicts_with = "source_token")]
    source_token_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start or resume an instance and hydrate it
    Provision {
        /// Provisioning request (.json, .yaml or .yml)
        #[arg(long)]
        request: PathBuf,
        /// .env file stored for the request's environment first
        #[arg(long)]
        env_file: Option<PathBuf>,
        /// Include background task records in the output
        #[arg(long)]
        wait: bool,
    },
    /// Converge an instance on a repository set
    Reconcile {
        #[arg(long)]
        request: PathBuf,
    },
    /// Run maintenance and replace the dev run
    Scripts {
        #[arg(long)]
        request: PathBuf,
    },
    /// Pause an instance
    Pause(InstanceArgs),
    /// Stop an instance
    Stop(InstanceArgs),
    /// Publish extra ports
    PublishPorts {
        #[command(flatten)]
        target: InstanceArgs,
        #[arg(long = "port", required = true)]
        ports: Vec<u16>,
    },
    /// Snapshot an instance
    Snapshot(InstanceArgs),
}

#[derive(clap::Args)]
struct InstanceArgs {
    #[arg(long)]
    team: String,
    #[arg(long)]
    instance: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => {
            let config = EngineConfig::default();
            config.validate().into_result()?;
            config
        }
    };

    let provider: Arc<dyn SandboxProvider> = if cli.local {
        tracing::warn!("using local shell provider; commands run on this host");
        Arc::new(LocalShellProvider::new())
    } else {
        let key = SecretRef {
            name: "provider_api_key".into(),
            source: SecretSource::EnvVar(config.provider.api_key_env.clone()),
        }
        .resolve()?;
        Arc::new(HttpSandboxProvider::new(
            &config.provider.base_url,
            key,
            config.provider.request_timeout(),
        )?)
    };

    let source_token = match (&cli.source_token, &cli.source_token_file) {
        (Some(token), _) => Some(SecretString::new(token.clone())),
        (None, Some(path)) => Some(
            SecretRef {
                name: "source_token".into(),
                source: SecretSource::File(path.display().to_string()),
            }
            .resolve()?,
        ),
        (None, None) => None,
    };
    let mut source_host = StaticTokenSourceHost::new();
    if let Some(token) = source_token {
        source_host = source_host.with_default_token(token);
    }

    let engine = Engine::new(
        config,
        provider,
        Arc::new(source_host),
        Arc::new(MemorySecretStore::new()),
        Arc::new(TrustCaller),
    );
    let caller = cli.caller.as_str();

    match cli.command {
        Command::Provision {
            request,
            env_file,
            wait,
        } => {
            let req: ProvisionRequest = read_request(&request)?;
            if let Some(path) = env_file {
                let environment_id = req.environment_id.clone().ok_or_else(|| {
                    Error::Validation("--env-file needs environment_id in the request".into())
                })?;
                let raw = std::fs::read_to_string(&path)?;
                engine
                    .store_env(caller, &req.team_id, &environment_id, SecretString::new(raw))
                    .await?;
            }
            print_json(&provision(&engine, caller, req, wait).await?)
        }
        Command::Reconcile { request } => {
            let req: ReconcileRequest = read_request(&request)?;
            print_json(&engine.reconcile(caller, req).await?)
        }
        Command::Scripts { request } => {
            let req: ScriptUpdateRequest = read_request(&request)?;
            print_json(&engine.update_scripts(caller, req).await?)
        }
        Command::Pause(t) => {
            engine.pause(caller, &t.team, &t.instance).await?;
            print_json(&serde_json::json!({ "instance_id": t.instance, "status": "paused" }))
        }
        Command::Stop(t) => {
            engine.stop(caller, &t.team, &t.instance).await?;
            print_json(&serde_json::json!({ "instance_id": t.instance, "status": "stopped" }))
        }
        Command::PublishPorts { target, ports } => {
            let published = engine
                .publish_ports(caller, &target.team, &target.instance, &ports)
                .await?;
            print_json(&published)
        }
        Command::Snapshot(t) => {
            let snapshot_id = engine.snapshot(caller, &t.team, &t.instance).await?;
            print_json(&serde_json::json!({ "instance_id": t.instance, "snapshot_id": snapshot_id }))
        }
    }
}

/// Provisions and settles the instance's background tasks. Tasks do not
/// outlive the runtime, so the command returns only after they finish.
async fn provision(
    engine: &Engine,
    caller: &str,
    req: ProvisionRequest,
    with_tasks: bool,
) -> Result<serde_json::Value> {
    let resp = engine.provision(caller, req).await?;
    if !resp.tasks.is_empty() {
        tracing::info!(instance_id = %resp.instance_id, tasks = resp.tasks.len(), "waiting for background tasks");
    }
    let records = engine.tasks().wait_all(&resp.instance_id).await;
    let value = if with_tasks {
        serde_json::json!({ "provision": resp, "tasks": records })
    } else {
        serde_json::to_value(&resp)
            .map_err(|e| Error::Config(format!("failed to encode output: {}", e)))?
    };
    Ok(value)
}

fn read_request<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)?;
    let is_json = path.extension().and_then(|e| e.to_str()) == Some("json");
    if is_json {
        serde_json::from_str(&content)
            .map_err(|e| Error::Validation(format!("invalid request {}: {}", path.display(), e)))
    } else {
        serde_yaml::from_str(&content)
            .map_err(|e| Error::Validation(format!("invalid request {}: {}", path.display(), e)))
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value)
        .map_err(|e| Error::Config(format!("failed to encode output: {}", e)))?;
    println!("{}", out);
    Ok(())
}

//! Devbox Engine - sandbox lifecycle and repository reconciliation
//!
//! This library provisions remote development sandboxes, converges their
//! workspaces on a desired set of repositories, injects environment and
//! credentials, and supervises maintenance and dev scripts inside them.

pub mod backoff;
pub mod bootstrap;
pub mod collab;
pub mod config;
pub mod engine;
pub mod error;
pub mod failure;
pub mod lifecycle;
pub mod reconcile;
pub mod repos;
pub mod sandbox;
pub mod scripts;
pub mod secrets;
pub mod shell;
pub mod tasks;
pub mod workspace;

pub use error::{Error, Result};

pub use backoff::{retry, Backoff, RetryPolicy};
pub use bootstrap::{decode_env_payload, encode_env_payload, Bootstrapper, EnvTarget, GitIdentity};
pub use collab::{
    AllowList, MemorySecretStore, SecretStore, SourceHost, StaticTokenSourceHost, TeamAccess,
    TrustCaller,
};
pub use config::{EngineConfig, Validate, ValidationResult};
pub use engine::{
    Engine, ProvisionRequest, ProvisionResponse, ReconcileRequest, ScriptUpdateRequest,
    ScriptUpdateResponse,
};
pub use failure::{FailureDetector, FailureKind};
pub use lifecycle::{InstanceManager, ServiceUrls, StartOptions};
pub use reconcile::{ReconcileOutcome, Reconciler, RepoFailure};
pub use repos::{
    LayoutMode, ObservedLayout, ObservedRepo, ObservedRepoState, ReconciliationPlan, RepoName,
    RepositoryBinding,
};
pub use sandbox::{
    HttpSandboxProvider, Instance, InstanceStatus, LocalShellProvider, SandboxHandle,
    SandboxProvider,
};
pub use scripts::{ScriptFailure, ScriptKind, ScriptRun, ScriptSupervisor};
pub use secrets::{SecretError, SecretRef, SecretSource, SecretsManager};
pub use shell::{mask_secret, quote, Cmd, Script};
pub use tasks::{TaskRecord, TaskStatus, TaskTracker};
pub use workspace::{RemoteWorkspace, Workspace};

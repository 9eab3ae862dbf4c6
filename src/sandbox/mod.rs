//! Sandbox module for remote development instances.
//!
//! This module provides the [`SandboxProvider`] trait for talking to a
//! sandbox provider, the [`HttpSandboxProvider`] REST implementation, a
//! local-host [`LocalShellProvider`], and the per-instance [`SandboxHandle`].

mod handle;
mod http;
mod local;
mod provider;

pub use handle::{Capabilities, SandboxHandle};
pub use http::HttpSandboxProvider;
pub use local::LocalShellProvider;
pub use provider::{
    ExecOutput, HttpService, Instance, InstanceStatus, SandboxProvider, StartRequest, TtlAction,
    META_ENVIRONMENT_ID, META_TEAM_ID,
};

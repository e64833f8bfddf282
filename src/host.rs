//! Collaborators the plugin expects from the host server.
//!
//! The host hands these in explicitly; nothing is looked up by key at runtime.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

use crate::{plugin::HookError, tunneling::process::ProcessHandle};

/// A listener owned by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub name: String,
    /// listen address, empty when the server does not listen
    pub addr: String,
}

#[cfg_attr(test, automock)]
pub trait ServerRegistry: Send + Sync {
    fn servers(&self) -> Vec<ServerInfo>;
}

/// Fixed list of servers, for hosts that know their listeners up front.
#[derive(Debug, Clone, Default)]
pub struct StaticServers(pub Vec<ServerInfo>);

impl ServerRegistry for StaticServers {
    fn servers(&self) -> Vec<ServerInfo> {
        self.0.clone()
    }
}

/// The registry gave the process back instead of supervising it.
#[derive(Error, Debug)]
#[error("task registry rejected process: {reason}")]
pub struct RejectedTask {
    pub task: ProcessHandle,
    pub reason: String,
}

/// Background tasks supervised alongside the host's own lifecycle.
#[cfg_attr(test, automock)]
pub trait TaskRegistry: Send + Sync {
    fn add_task(&self, task: ProcessHandle) -> Result<(), RejectedTask>;
}

/// Callbacks the host runs once, after its main loop has returned.
pub trait PostRunHooks: Send + Sync {
    fn post_run(&self, hook: Box<dyn FnOnce() + Send>);
}

/// What the host passes to a pre-serve hook.
pub struct ServeContext<'a> {
    pub tasks: &'a dyn TaskRegistry,
    pub post_run: &'a dyn PostRunHooks,
}

/// Fired once per server startup, after listeners are bound and before
/// requests are served.
///
/// Hosts must abort startup when this returns an error: it is only returned
/// for conditions that leave an unsupervised child behind otherwise.
#[async_trait]
pub trait PreServeHook: Send + Sync {
    async fn pre_serve(&self, ctx: ServeContext<'_>) -> Result<(), HookError>;
}

#[cfg_attr(test, automock)]
pub trait PreServeRegistry: Send + Sync {
    fn pre_serve(&self, hook: Arc<dyn PreServeHook>);
}

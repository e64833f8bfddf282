//! The plugin a host server embeds: resolves the configuration at init,
//! exposes the `tunnel` subcommand and launches the client when the host
//! starts serving.

use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use clap::{ArgMatches, Command};
use thiserror::Error;
use tracing::{Instrument, Span};

use crate::{
    cli::{self, CommandError},
    config::{self, Config, ConfigDir, LoadOutcome, PreConfigFn},
    host::{PreServeHook, PreServeRegistry, RejectedTask, ServeContext, ServerRegistry},
    tunneling::{build_command, start},
};

/// Errors a host must treat as fatal for its startup.
#[derive(Error, Debug)]
pub enum HookError {
    #[error("tunnel client (pid {pid:?}) left unsupervised: {reason}")]
    Unsupervised { pid: Option<u32>, reason: String },
}

pub struct TunnelPlugin {
    config_dir: ConfigDir,
    servers: Arc<dyn ServerRegistry>,
    binary: PathBuf,
    pre_config: Option<PreConfigFn>,
    span: Span,
    config: Option<Config>,
    cli_registered: bool,
}

impl TunnelPlugin {
    pub fn new(config_dir: ConfigDir, servers: Arc<dyn ServerRegistry>, binary: PathBuf) -> Self {
        TunnelPlugin {
            config_dir,
            servers,
            binary,
            pre_config: None,
            span: tracing::info_span!("tunnel"),
            config: None,
            cli_registered: false,
        }
    }

    /// Last chance for the embedder to adjust the config before the `main`
    /// tunnel is derived.
    pub fn with_pre_config(
        mut self,
        pre_config: impl Fn(&mut Config) + Send + Sync + 'static,
    ) -> Self {
        self.pre_config = Some(Box::new(pre_config));
        self
    }

    /// Span every log line of this plugin is recorded in.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn config(&self) -> Option<&Config> {
        self.config.as_ref()
    }

    /// Loads and prepares the configuration. Any failure leaves the plugin
    /// inert; the host keeps starting.
    pub fn init(&mut self) {
        let span = self.span.clone();
        let _guard = span.enter();

        self.config = match config::load_config(&self.config_dir) {
            Ok(LoadOutcome::Loaded(mut config)) => {
                match config::prepare(&mut config, self.servers.as_ref(), self.pre_config.as_ref())
                {
                    Ok(()) => Some(config),
                    Err(err) => {
                        tracing::error!(error = %err, "prepare tunnel config");
                        None
                    }
                }
            }
            Ok(LoadOutcome::Skipped) => {
                tracing::warn!(
                    dir = %self.config_dir.root().display(),
                    "SKIP because tunnel config file does not exist"
                );
                None
            }
            Err(err) => {
                tracing::error!(error = %err, "load tunnel config");
                None
            }
        };
    }

    /// Adds the `tunnel` subcommand to the host's root command when a
    /// configuration was resolved.
    pub fn register_cli(&mut self, root: Command) -> Command {
        if self.config.is_none() {
            return root;
        }
        self.cli_registered = true;
        root.subcommand(cli::command())
    }

    /// Registers the pre-serve hook when the client should start with the host.
    pub fn attach(self: &Arc<Self>, registry: &dyn PreServeRegistry) {
        let _guard = self.span.enter();
        match &self.config {
            Some(config) if config.main.auto_start => {
                if self.target_addr(config).is_empty() {
                    tracing::info!(
                        server_index = config.main.server_index,
                        "target server does not listen, auto start disabled"
                    );
                    return;
                }
                registry.pre_serve(self.clone());
            }
            _ => tracing::debug!("auto start disabled"),
        }
    }

    /// Runs the invoked `tunnel` subcommand in the foreground.
    pub async fn run_command(&self, root: &str, matches: &ArgMatches) -> Result<(), CommandError> {
        let config = self.config.as_ref().ok_or(CommandError::NotConfigured)?;
        cli::run(&self.binary, config, root, matches)
            .instrument(self.span.clone())
            .await
    }

    fn target_addr(&self, config: &Config) -> String {
        self.servers
            .servers()
            .get(config.main.server_index)
            .map(|server| server.addr.clone())
            .unwrap_or_default()
    }

    fn autostart_config(&self) -> Option<&Config> {
        let config = self.config.as_ref()?;
        if !config.main.auto_start || !self.cli_registered || self.target_addr(config).is_empty() {
            return None;
        }
        Some(config)
    }

    async fn launch(&self, ctx: ServeContext<'_>) -> Result<(), HookError> {
        let Some(config) = self.autostart_config() else {
            tracing::debug!("tunnel client not started");
            return Ok(());
        };

        let plan = match build_command(&self.binary, config, Vec::new()) {
            Ok(plan) => plan,
            Err(err) => {
                tracing::error!(error = %err, "build tunnel client command");
                return Ok(());
            }
        };
        let handle = match start(plan).await {
            Ok(handle) => handle,
            Err(err) => {
                tracing::error!(error = %err, "start tunnel client");
                return Ok(());
            }
        };

        let log_files = handle.log_files();
        ctx.post_run.post_run(Box::new(move || {
            log_files.release();
        }));

        if let Err(RejectedTask { mut task, reason }) = ctx.tasks.add_task(handle) {
            let pid = task.id();
            if let Err(err) = task.kill().await {
                tracing::warn!(error = %err, ?pid, "kill rejected tunnel client");
            }
            tracing::error!(?pid, %reason, "tunnel client rejected by task registry");
            return Err(HookError::Unsupervised { pid, reason });
        }
        Ok(())
    }
}

#[async_trait]
impl PreServeHook for TunnelPlugin {
    async fn pre_serve(&self, ctx: ServeContext<'_>) -> Result<(), HookError> {
        self.launch(ctx).instrument(self.span.clone()).await
    }
}

use std::{
    path::PathBuf,
    process::ExitCode,
    sync::{Arc, Mutex, PoisonError},
};

use clap::{Command, CommandFactory, FromArgMatches, Parser};
use tracing_subscriber::EnvFilter;
use tunnel_plugin::{
    ConfigDir, HookError, TunnelPlugin, cli,
    host::{
        PostRunHooks, PreServeHook, PreServeRegistry, RejectedTask, ServeContext, ServerInfo,
        StaticServers, TaskRegistry,
    },
    tunneling::{ProcessHandle, binary},
};

const SERVE: &str = "serve";

#[derive(Parser, Debug)]
#[command(name = "tunnel-host", version, about = "Minimal host running the tunnel client plugin", long_about = None)]
struct HostCli {
    /// configuration directory, the plugin reads `<dir>/tunnel/*`
    #[arg(long, env = "TUNNEL_CONFIG_DIR", default_value = "config")]
    config_dir: PathBuf,
    /// tunnel client binary, searched under `<bin-base>/_private/bin` when omitted
    #[arg(long, env = "TUNNEL_BIN")]
    bin: Option<PathBuf>,
    #[arg(long, default_value = ".")]
    bin_base: PathBuf,
    /// listen address of a host server, repeat for more servers
    #[arg(long = "server-addr")]
    server_addrs: Vec<String>,
}

/// In-process stand-in for a real server: it owns the hooks, the background
/// tasks and the post-run callbacks.
#[derive(Default)]
struct LocalHost {
    hooks: Mutex<Vec<Arc<dyn PreServeHook>>>,
    tasks: Mutex<Vec<ProcessHandle>>,
    post_run: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl PreServeRegistry for LocalHost {
    fn pre_serve(&self, hook: Arc<dyn PreServeHook>) {
        self.hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(hook);
    }
}

impl TaskRegistry for LocalHost {
    fn add_task(&self, task: ProcessHandle) -> Result<(), RejectedTask> {
        tracing::info!(pid = ?task.id(), "background task added");
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
        Ok(())
    }
}

impl PostRunHooks for LocalHost {
    fn post_run(&self, hook: Box<dyn FnOnce() + Send>) {
        self.post_run
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(hook);
    }
}

impl LocalHost {
    async fn serve(&self) -> Result<(), HookError> {
        let hooks = self
            .hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for hook in hooks {
            hook.pre_serve(ServeContext {
                tasks: self,
                post_run: self,
            })
            .await?;
        }

        tracing::info!("serving, ctrl-c to stop");
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "waiting for ctrl-c");
        }

        let mut tasks =
            std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        // signal everything first so the tasks wind down in parallel
        for task in &mut tasks {
            if let Err(err) = task.start_kill() {
                tracing::warn!(error = %err, pid = ?task.id(), "stopping background task");
            }
        }
        for mut task in tasks {
            match task.wait().await {
                Ok(status) => tracing::info!(%status, binary = %task.binary().display(), "background task stopped"),
                Err(err) => tracing::warn!(error = %err, "reaping background task"),
            }
        }
        let post_run =
            std::mem::take(&mut *self.post_run.lock().unwrap_or_else(PoisonError::into_inner));
        for hook in post_run {
            hook();
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let root = HostCli::command()
        .subcommand(Command::new(SERVE).about("Serve until interrupted"))
        .subcommand_required(true)
        .arg_required_else_help(true);
    let root_name = root.get_name().to_string();

    // host options decide where the plugin config lives, so read them before
    // the plugin gets a chance to register its subcommand
    let early = root.clone().ignore_errors(true).get_matches();
    let opts = match HostCli::from_arg_matches(&early) {
        Ok(opts) => opts,
        Err(err) => err.exit(),
    };

    let binary = match opts.bin {
        Some(bin) => bin,
        None => match binary::locate(&opts.bin_base) {
            Ok(bin) => bin,
            Err(err) => {
                tracing::error!(error = %err, "locate tunnel client");
                return ExitCode::FAILURE;
            }
        },
    };
    let servers = StaticServers(
        opts.server_addrs
            .into_iter()
            .enumerate()
            .map(|(index, addr)| ServerInfo {
                name: format!("server-{index}"),
                addr,
            })
            .collect(),
    );

    let mut plugin = TunnelPlugin::new(ConfigDir::new(opts.config_dir), Arc::new(servers), binary);
    plugin.init();
    let matches = plugin.register_cli(root).get_matches();

    match matches.subcommand_name() {
        Some(cli::COMMAND_NAME) => match plugin.run_command(&root_name, &matches).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                tracing::error!(error = %err, "tunnel command failed");
                ExitCode::from(u8::try_from(err.exit_code()).unwrap_or(1))
            }
        },
        _ => {
            let host = LocalHost::default();
            Arc::new(plugin).attach(&host);
            match host.serve().await {
                Ok(()) => ExitCode::SUCCESS,
                Err(err) => {
                    tracing::error!(error = %err, "host startup aborted");
                    ExitCode::FAILURE
                }
            }
        }
    }
}

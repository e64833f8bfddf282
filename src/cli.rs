use std::{path::Path, process::ExitStatus};

use clap::{ArgMatches, Args, Command, FromArgMatches};
use thiserror::Error;

use crate::{
    config::Config,
    tunneling::{LaunchError, build_command, command::DEFAULT_ACTION, start},
};

pub const COMMAND_NAME: &str = "tunnel";

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("tunnel plugin has no configuration")]
    NotConfigured,
    #[error(transparent)]
    Usage(#[from] clap::Error),
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error("wait for tunnel client: {0}")]
    Wait(std::io::Error),
    #[error("tunnel client exited with {0}")]
    Exited(ExitStatus),
}

impl CommandError {
    /// Process exit code mirroring the client's own when it ran.
    pub fn exit_code(&self) -> i32 {
        match self {
            CommandError::Exited(status) => status.code().unwrap_or(1),
            _ => 1,
        }
    }
}

/// Arguments of the `tunnel` subcommand.
#[derive(Args, Debug, Clone, Default, PartialEq)]
pub struct TunnelArgs {
    /// arguments passed to the tunnel client (default: start-all)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

pub fn command() -> Command {
    TunnelArgs::augment_args(Command::new(COMMAND_NAME).about("Initialize tunnel client"))
}

/// Names from the root down to the invoked command, plus that command's matches.
pub fn invocation_path<'m>(root: &str, matches: &'m ArgMatches) -> (Vec<String>, &'m ArgMatches) {
    let mut path = vec![root.to_string()];
    let mut current = matches;
    while let Some((name, sub)) = current.subcommand() {
        path.push(name.to_string());
        current = sub;
    }
    (path, current)
}

/// Client arguments for a foreground run: the invocation path first, then the
/// user's arguments (`start-all` when there are none).
pub fn foreground_args(path: &[String], mut args: Vec<String>) -> Vec<String> {
    if args.is_empty() {
        args.push(DEFAULT_ACTION.to_string());
    }
    args.insert(0, path.join(" "));
    args
}

/// Parses the invoked `tunnel` command and runs the client until it exits.
pub async fn run(
    binary: &Path,
    config: &Config,
    root: &str,
    matches: &ArgMatches,
) -> Result<(), CommandError> {
    let (path, leaf) = invocation_path(root, matches);
    let TunnelArgs { args } = TunnelArgs::from_arg_matches(leaf)?;
    run_foreground(binary, config, foreground_args(&path, args)).await
}

pub async fn run_foreground(
    binary: &Path,
    config: &Config,
    args: Vec<String>,
) -> Result<(), CommandError> {
    let plan = build_command(binary, config, args)?;
    let mut handle = start(plan).await?;
    let status = handle.wait().await.map_err(CommandError::Wait)?;
    tracing::info!(%status, "tunnel client exited");
    if !status.success() {
        return Err(CommandError::Exited(status));
    }
    Ok(())
}

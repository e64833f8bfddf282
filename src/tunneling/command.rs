use std::{
    fs::File,
    path::{Path, PathBuf},
    process::Stdio,
};

use tokio::process::Command;

use crate::config::{Config, MainConfig};

use super::{LaunchError, process::LogFiles};

pub const DEFAULT_ACTION: &str = "start-all";
pub const LOG_LEVEL_FLAG: &str = "-logLevel";
/// log setting value that throws the stream away
pub const DISCARD: &str = "-";

/// Where one of the child's output streams ends up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTarget {
    Inherit,
    Discard,
    File(PathBuf),
    /// our own stdout, for a combined stderr when stdout is inherited
    ParentStdout,
}

impl StreamTarget {
    pub fn from_setting(value: &str) -> Self {
        match value {
            "" => StreamTarget::Inherit,
            DISCARD => StreamTarget::Discard,
            path => StreamTarget::File(PathBuf::from(path)),
        }
    }
}

/// stdout and stderr targets for a config; stdout and stderr are independent
/// unless `log_combined` is set
pub fn stream_targets(main: &MainConfig) -> (StreamTarget, StreamTarget) {
    let stdout = StreamTarget::from_setting(&main.log_stdout);
    let stderr = if main.log_combined {
        match &stdout {
            StreamTarget::Inherit => StreamTarget::ParentStdout,
            other => other.clone(),
        }
    } else {
        StreamTarget::from_setting(&main.log_stderr)
    };
    (stdout, stderr)
}

/// Argument vector handed to the client, binary path excluded.
pub fn client_args(main: &MainConfig, mut extra_args: Vec<String>) -> Vec<String> {
    if extra_args.is_empty() {
        extra_args.push(DEFAULT_ACTION.to_string());
    }
    if main.log_level != 0 && !extra_args.iter().any(|arg| arg == LOG_LEVEL_FLAG) {
        extra_args.push(LOG_LEVEL_FLAG.to_string());
        extra_args.push(main.log_level.to_string());
    }
    let mut args = vec![String::from("-config"), String::from("-")];
    args.extend(extra_args);
    args
}

/// A fully wired client invocation, ready for [`super::process::start`].
#[derive(Debug)]
pub struct CommandPlan {
    pub(super) command: Command,
    pub(super) binary: PathBuf,
    pub(super) args: Vec<String>,
    pub(super) stdout: StreamTarget,
    pub(super) stderr: StreamTarget,
    /// serialized tunnel config, written to stdin once the child is up
    pub(super) payload: Vec<u8>,
    /// our own handles on the log files, released once the child is gone
    pub(super) log_files: LogFiles,
}

impl CommandPlan {
    pub fn binary(&self) -> &Path {
        &self.binary
    }
    pub fn args(&self) -> &[String] {
        &self.args
    }
    pub fn stdout(&self) -> &StreamTarget {
        &self.stdout
    }
    pub fn stderr(&self) -> &StreamTarget {
        &self.stderr
    }
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
    pub fn log_files(&self) -> LogFiles {
        self.log_files.clone()
    }
}

/// Builds the client command for `config`.
///
/// The client always reads its configuration from stdin (`-config -`); no
/// config file is ever written. Log files are created (truncated) here.
pub fn build_command(
    binary: &Path,
    config: &Config,
    extra_args: Vec<String>,
) -> Result<CommandPlan, LaunchError> {
    let args = client_args(&config.main, extra_args);
    let payload = serde_yaml::to_string(&config.tunnel)?.into_bytes();
    let (stdout, stderr) = stream_targets(&config.main);

    let mut log_files = Vec::new();
    let stdout_file = open_log(&stdout, "stdout")?;
    let stderr_file = if config.main.log_combined {
        match &stdout_file {
            Some(file) => Some(duplicate(file, &stdout, "stderr")?),
            None => None,
        }
    } else {
        open_log(&stderr, "stderr")?
    };

    let stdout_stdio = stdio_for(&stdout, stdout_file.as_ref(), "stdout")?;
    let stderr_stdio = stdio_for(&stderr, stderr_file.as_ref(), "stderr")?;
    log_files.extend(stdout_file);
    log_files.extend(stderr_file);

    let mut command = Command::new(binary);
    command
        .args(&args)
        .stdin(Stdio::piped())
        .stdout(stdout_stdio)
        .stderr(stderr_stdio);
    // signals sent to our process group must not reach the client
    #[cfg(unix)]
    command.process_group(0);

    tracing::debug!(binary = %binary.display(), ?args, ?stdout, ?stderr, "tunnel client command built");

    Ok(CommandPlan {
        command,
        binary: binary.to_path_buf(),
        args,
        stdout,
        stderr,
        payload,
        log_files: LogFiles::new(log_files),
    })
}

fn open_log(target: &StreamTarget, stream: &'static str) -> Result<Option<File>, LaunchError> {
    match target {
        StreamTarget::File(path) => File::create(path)
            .map(Some)
            .map_err(|source| LaunchError::OpenLogFile {
                stream,
                path: path.clone(),
                source,
            }),
        _ => Ok(None),
    }
}

fn duplicate(
    file: &File,
    target: &StreamTarget,
    stream: &'static str,
) -> Result<File, LaunchError> {
    file.try_clone().map_err(|source| LaunchError::OpenLogFile {
        stream,
        path: match target {
            StreamTarget::File(path) => path.clone(),
            _ => PathBuf::new(),
        },
        source,
    })
}

fn stdio_for(
    target: &StreamTarget,
    file: Option<&File>,
    stream: &'static str,
) -> Result<Stdio, LaunchError> {
    Ok(match (target, file) {
        (StreamTarget::File(_), Some(file)) => Stdio::from(duplicate(file, target, stream)?),
        (StreamTarget::Discard, _) => Stdio::null(),
        (StreamTarget::ParentStdout, _) => parent_stdout()?,
        _ => Stdio::inherit(),
    })
}

#[cfg(unix)]
fn parent_stdout() -> Result<Stdio, LaunchError> {
    use std::os::fd::AsFd;

    let fd = std::io::stdout()
        .as_fd()
        .try_clone_to_owned()
        .map_err(LaunchError::ParentStdout)?;
    Ok(Stdio::from(fd))
}

#[cfg(windows)]
fn parent_stdout() -> Result<Stdio, LaunchError> {
    use std::os::windows::io::AsHandle;

    let handle = std::io::stdout()
        .as_handle()
        .try_clone_to_owned()
        .map_err(LaunchError::ParentStdout)?;
    Ok(Stdio::from(handle))
}

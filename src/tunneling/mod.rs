//! Everything that touches the operating system: locating the client binary,
//! wiring its streams and spawning it.

use std::{io, path::PathBuf};

use thiserror::Error;

pub mod binary;
pub mod command;
pub mod process;

pub use command::{CommandPlan, StreamTarget, build_command};
pub use process::{LogFiles, ProcessHandle, start};

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("open {stream} log file {path:?}: {source}")]
    OpenLogFile {
        stream: &'static str,
        path: PathBuf,
        source: io::Error,
    },
    #[error("duplicate our stdout for the client's stderr: {0}")]
    ParentStdout(io::Error),
    #[error("marshal tunnel config: {0}")]
    Serialize(#[from] serde_yaml::Error),
    #[error("stdin pipe, {context}: {source}")]
    Pipe {
        context: &'static str,
        source: io::Error,
    },
    #[error("start of {binary:?} failed: {source}")]
    Spawn { binary: PathBuf, source: io::Error },
}

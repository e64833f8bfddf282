use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
    process::ExitStatus,
    sync::{Arc, Mutex, PoisonError},
};

use tokio::{io::AsyncWriteExt, process::Child};

use super::{CommandPlan, LaunchError};

/// Shared, single-shot ownership of the log files of one client process.
///
/// Clones refer to the same handles; whichever clone calls
/// [`LogFiles::release`] first closes them.
#[derive(Debug, Clone, Default)]
pub struct LogFiles {
    files: Arc<Mutex<Option<Vec<File>>>>,
}

impl LogFiles {
    pub(super) fn new(files: Vec<File>) -> Self {
        LogFiles {
            files: Arc::new(Mutex::new(Some(files))),
        }
    }

    /// Closes the handles. Returns false when they were already released.
    pub fn release(&self) -> bool {
        let files = self
            .files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match files {
            Some(files) => {
                tracing::debug!(count = files.len(), "releasing tunnel client log files");
                drop(files);
                true
            }
            None => false,
        }
    }

    pub fn is_released(&self) -> bool {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    #[cfg(test)]
    pub(super) fn open_count(&self) -> usize {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, Vec::len)
    }
}

/// A started client process.
///
/// Whoever holds the handle is responsible for stopping the child; this crate
/// never re-supervises it.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    binary: PathBuf,
    log_files: LogFiles,
}

impl ProcessHandle {
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }
    pub fn binary(&self) -> &Path {
        &self.binary
    }
    pub fn log_files(&self) -> LogFiles {
        self.log_files.clone()
    }

    /// Waits for the child to exit, then releases its log files.
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        let status = self.child.wait().await;
        self.log_files.release();
        status
    }

    /// Sends the kill signal without reaping; follow up with [`Self::wait`].
    pub fn start_kill(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    /// Kills the child and reaps it.
    pub async fn kill(&mut self) -> io::Result<()> {
        let result = self.child.kill().await;
        self.log_files.release();
        result
    }
}

/// Spawns the planned command and feeds it its configuration.
///
/// Returns once the child exists and stdin has been written and closed; it
/// does not wait for the child to exit.
pub async fn start(plan: CommandPlan) -> Result<ProcessHandle, LaunchError> {
    let CommandPlan {
        mut command,
        binary,
        payload,
        log_files,
        ..
    } = plan;

    let spawned = command.spawn();
    // the child holds its own copies of the log descriptors now
    drop(command);
    let child = match spawned {
        Ok(child) => child,
        Err(source) => {
            log_files.release();
            return Err(LaunchError::Spawn { binary, source });
        }
    };
    let mut handle = ProcessHandle {
        child,
        binary,
        log_files,
    };

    if let Err(err) = feed_config(&mut handle, &payload).await {
        if let Err(kill_err) = handle.kill().await {
            tracing::warn!(error = %kill_err, "killing tunnel client after a stdin failure");
        }
        return Err(err);
    }

    tracing::info!(pid = ?handle.id(), binary = %handle.binary.display(), "tunnel client started");
    Ok(handle)
}

async fn feed_config(handle: &mut ProcessHandle, payload: &[u8]) -> Result<(), LaunchError> {
    let mut stdin = handle.child.stdin.take().ok_or_else(|| LaunchError::Pipe {
        context: "open",
        source: io::Error::other("stdin was not captured"),
    })?;
    stdin
        .write_all(payload)
        .await
        .map_err(|source| LaunchError::Pipe {
            context: "write config",
            source,
        })?;
    stdin.shutdown().await.map_err(|source| LaunchError::Pipe {
        context: "close",
        source,
    })?;
    Ok(())
}

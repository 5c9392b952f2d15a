use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{anyhow, Context, Result};

/// Grants permission to start downloading. Best effort: without a permit
/// the transaction proceeds anyway.
pub trait DownloadScheduler {
    fn request_permit(&self, scope: &str) -> Option<DownloadPermit>;
}

/// Held for the duration of a transaction; releases its slot on drop.
pub struct DownloadPermit {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl DownloadPermit {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }
}

impl fmt::Debug for DownloadPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadPermit")
            .field("held", &self.release.is_some())
            .finish()
    }
}

impl Drop for DownloadPermit {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Runs privileged operations on system scopes out of process.
pub trait PrivilegedHelper {
    fn refresh_metadata(&self, scope: &str, remote: &str) -> Result<()>;
}

/// Invokes an external helper binary as
/// `<program> refresh-metadata --scope <scope> <remote>`.
#[derive(Debug, Clone)]
pub struct CommandHelper {
    program: PathBuf,
}

impl CommandHelper {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl PrivilegedHelper for CommandHelper {
    fn refresh_metadata(&self, scope: &str, remote: &str) -> Result<()> {
        let mut command = Command::new(&self.program);
        command
            .arg("refresh-metadata")
            .arg("--scope")
            .arg(scope)
            .arg(remote);
        run_command(
            &mut command,
            &format!("failed to refresh metadata for remote '{remote}' in scope '{scope}'"),
        )
    }
}

fn run_command(command: &mut Command, context_message: &str) -> Result<()> {
    let output = command
        .output()
        .with_context(|| format!("{context_message}: command failed to start"))?;
    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    Err(anyhow!(
        "{context_message}: status={} stdout='{}' stderr='{}'",
        output.status,
        stdout.trim(),
        stderr.trim()
    ))
}

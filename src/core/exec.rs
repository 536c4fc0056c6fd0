//! Process invocation of the iptables binary
//!
//! One short-lived child per call, run to completion with stdout and stderr
//! captured. There is no retry at this layer: a failed mutation is returned to
//! the caller as-is, since re-running a rule insertion could duplicate the rule.

use crate::core::error::{CommandError, Error, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use tracing::{debug, warn};

/// Runs the tool at a fixed path.
#[derive(Debug, Clone)]
pub struct Executor {
    path: PathBuf,
}

impl Executor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs the tool with `args` (program name excluded) and returns its stdout.
    ///
    /// # Errors
    ///
    /// - [`Error::ToolUnavailable`] if the binary is missing or not executable
    /// - [`Error::Command`] if the tool exits with a non-zero status
    /// - [`Error::Io`] for any other spawn failure
    pub fn run<S: AsRef<str>>(&self, args: &[S]) -> Result<String> {
        let command_line = self.command_line(args);
        debug!(cmd = ?command_line, "Running iptables");

        let output = Command::new(&self.path)
            .args(args.iter().map(AsRef::as_ref))
            .stdin(Stdio::null())
            .output()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound | ErrorKind::PermissionDenied => Error::ToolUnavailable {
                    path: self.path.clone(),
                    source: e,
                },
                _ => Error::Io(e),
            })?;

        stdout_from_output(command_line, &output)
    }

    fn command_line<S: AsRef<str>>(&self, args: &[S]) -> Vec<String> {
        std::iter::once(self.path.to_string_lossy().into_owned())
            .chain(args.iter().map(|a| a.as_ref().to_string()))
            .collect()
    }
}

/// Converts a finished process into its stdout, or a [`CommandError`] carrying
/// stderr followed by stdout.
fn stdout_from_output(command_line: Vec<String>, output: &Output) -> Result<String> {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    if output.status.success() {
        if !stderr.trim().is_empty() {
            warn!(cmd = ?command_line, %stderr, "Non empty stderr on successful command");
        }
        return Ok(stdout.into_owned());
    }

    debug!(
        cmd = ?command_line,
        status_code = ?output.status.code(),
        %stdout,
        %stderr,
        "iptables exited with failure"
    );
    Err(CommandError::new(
        command_line,
        format!("{stderr}{stdout}"),
        output.status.code(),
    )
    .into())
}

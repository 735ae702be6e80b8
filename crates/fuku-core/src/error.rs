//! Error types shared by every fuku module

use std::path::PathBuf;
use thiserror::Error;

use crate::object_store::ObjectStoreError;

/// Errors raised by the module framework and its local collaborators.
#[derive(Debug, Error)]
pub enum FukuError {
    /// Invalid user input or an operation that cannot proceed in the current state
    #[error("{0}")]
    Usage(String),

    /// A context value another module was expected to provide is absent
    #[error("missing context value: {0}")]
    MissingContext(String),

    #[error("no module named {0}")]
    UnknownModule(String),

    #[error("duplicate modules: {0}")]
    DuplicateModule(String),

    #[error("module {0} does not support selection")]
    NotSelectable(String),

    #[error("failed to access store at {path}: {source}")]
    Store {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("store at {path} is not valid JSON: {source}")]
    StoreFormat {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A local shell command exited unsuccessfully
    #[error("command failed{}: {command}{}", status_suffix(.status), stderr_suffix(.stderr))]
    Command {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("command output is not valid JSON: {0}")]
    CommandOutput(#[source] serde_json::Error),

    #[error("no secure key file found: {0}")]
    SecureFileMissing(String),

    #[error(transparent)]
    ObjectStore(#[from] ObjectStoreError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FukuError {
    pub fn usage(message: impl Into<String>) -> Self {
        Self::Usage(message.into())
    }

    /// Create a command failure from an exit status and captured stderr
    pub fn command(command: impl Into<String>, status: Option<i32>, stderr: impl Into<String>) -> Self {
        Self::Command {
            command: command.into(),
            status,
            stderr: stderr.into(),
        }
    }
}

fn status_suffix(status: &Option<i32>) -> String {
    match status {
        Some(code) => format!(" (exit {})", code),
        None => " (terminated by signal)".to_string(),
    }
}

fn stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!("\n{}", stderr)
    }
}

pub type Result<T, E = FukuError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_error_display() {
        let err = FukuError::command("gpg -c key.pem", Some(2), "");
        assert_eq!(err.to_string(), "command failed (exit 2): gpg -c key.pem");

        let err = FukuError::command("ssh-add key.pem", None, "agent refused");
        assert_eq!(
            err.to_string(),
            "command failed (terminated by signal): ssh-add key.pem\nagent refused"
        );
    }

    #[test]
    fn test_usage_error_is_bare_message() {
        let err = FukuError::usage("no cluster currently selected");
        assert_eq!(err.to_string(), "no cluster currently selected");
    }
}

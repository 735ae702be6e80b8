//! Local shell execution (`ssh`, `gpg`, `docker`, `psql`, ...)

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::io::Write;
use std::process::{Command, Stdio};
use tracing::debug;

use crate::error::{FukuError, Result};

/// What happens to a command's standard output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Capture {
    /// Attached to the terminal
    #[default]
    Stream,
    /// Thrown away
    Discard,
    /// Collected and returned as trimmed text
    Text,
    /// Collected and parsed as JSON
    Json,
}

/// A command line run through `sh -c`.
#[derive(Debug, Clone, Default)]
pub struct ShellCommand {
    pub line: String,
    pub capture: Capture,
    pub env: Vec<(String, String)>,
    pub stdin: Option<Vec<u8>>,
    pub ignore_errors: bool,
}

impl ShellCommand {
    pub fn new(line: impl Into<String>) -> Self {
        Self {
            line: line.into(),
            ..Default::default()
        }
    }

    pub fn capture(mut self, capture: Capture) -> Self {
        self.capture = capture;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn ignore_errors(mut self) -> Self {
        self.ignore_errors = true;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    pub status: Option<i32>,
    pub text: String,
    pub json: Option<Value>,
}

impl CommandOutput {
    pub fn success() -> Self {
        Self {
            status: Some(0),
            ..Default::default()
        }
    }

    pub fn with_text(text: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            text: text.into(),
            json: None,
        }
    }
}

pub trait CommandRunner: Send + Sync {
    fn run(&self, command: ShellCommand) -> Result<CommandOutput>;
}

/// Runs commands with the system shell.
#[derive(Debug, Default)]
pub struct ShellRunner;

impl CommandRunner for ShellRunner {
    fn run(&self, command: ShellCommand) -> Result<CommandOutput> {
        debug!(command = %command.line, capture = ?command.capture, "running command");

        let mut process = Command::new("sh");
        process.arg("-c").arg(&command.line);
        for (key, value) in &command.env {
            process.env(key, value);
        }

        let collect = matches!(command.capture, Capture::Text | Capture::Json);
        process.stdout(match command.capture {
            Capture::Stream => Stdio::inherit(),
            Capture::Discard => Stdio::null(),
            Capture::Text | Capture::Json => Stdio::piped(),
        });
        process.stderr(if collect {
            Stdio::piped()
        } else {
            Stdio::inherit()
        });
        process.stdin(if command.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::inherit()
        });

        let mut child = process.spawn()?;
        if let (Some(input), Some(mut pipe)) = (command.stdin.as_ref(), child.stdin.take()) {
            pipe.write_all(input)?;
        }
        let output = child.wait_with_output()?;

        let status = output.status.code();
        if !output.status.success() && !command.ignore_errors {
            return Err(FukuError::command(
                command.line,
                status,
                String::from_utf8_lossy(&output.stderr).trim(),
            ));
        }

        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let json = if command.capture == Capture::Json && !text.is_empty() {
            Some(serde_json::from_str(&text).map_err(FukuError::CommandOutput)?)
        } else {
            None
        };
        Ok(CommandOutput { status, text, json })
    }
}

/// Records commands instead of running them, replying with queued outputs.
#[derive(Debug, Default)]
pub struct RecordingRunner {
    commands: Mutex<Vec<ShellCommand>>,
    replies: Mutex<VecDeque<Result<CommandOutput, String>>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the output returned by the next unanswered command.
    pub fn reply(&self, output: CommandOutput) {
        self.replies.lock().push_back(Ok(output));
    }

    /// Queue a failure for the next unanswered command.
    pub fn fail(&self, stderr: impl Into<String>) {
        self.replies.lock().push_back(Err(stderr.into()));
    }

    pub fn lines(&self) -> Vec<String> {
        self.commands.lock().iter().map(|c| c.line.clone()).collect()
    }

    pub fn commands(&self) -> Vec<ShellCommand> {
        self.commands.lock().clone()
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&self, command: ShellCommand) -> Result<CommandOutput> {
        let reply = self.replies.lock().pop_front();
        let line = command.line.clone();
        let ignore_errors = command.ignore_errors;
        self.commands.lock().push(command);
        match reply {
            Some(Ok(output)) => Ok(output),
            Some(Err(stderr)) if !ignore_errors => Err(FukuError::command(line, Some(1), stderr)),
            Some(Err(_)) => Ok(CommandOutput {
                status: Some(1),
                ..Default::default()
            }),
            None => Ok(CommandOutput::success()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_runner_captures_text() {
        let output = ShellRunner
            .run(ShellCommand::new("echo '  hello  '").capture(Capture::Text))
            .unwrap();
        assert_eq!(output.text, "hello");
        assert_eq!(output.status, Some(0));
    }

    #[test]
    fn test_shell_runner_parses_json() {
        let output = ShellRunner
            .run(ShellCommand::new(r#"echo '{"a": [1, 2]}'"#).capture(Capture::Json))
            .unwrap();
        assert_eq!(output.json, Some(serde_json::json!({"a": [1, 2]})));
    }

    #[test]
    fn test_shell_runner_env_and_stdin() {
        let output = ShellRunner
            .run(
                ShellCommand::new("cat; echo \" $GREETING\"")
                    .env("GREETING", "there")
                    .stdin("hi")
                    .capture(Capture::Text),
            )
            .unwrap();
        assert_eq!(output.text, "hi there");
    }

    #[test]
    fn test_shell_runner_failure() {
        let err = ShellRunner
            .run(ShellCommand::new("echo oops >&2; exit 3").capture(Capture::Text))
            .unwrap_err();
        match err {
            FukuError::Command { status, stderr, .. } => {
                assert_eq!(status, Some(3));
                assert_eq!(stderr, "oops");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_shell_runner_ignore_errors() {
        let output = ShellRunner
            .run(ShellCommand::new("exit 4").capture(Capture::Discard).ignore_errors())
            .unwrap();
        assert_eq!(output.status, Some(4));
    }

    #[test]
    fn test_recording_runner_replies_in_order() {
        let runner = RecordingRunner::new();
        runner.reply(CommandOutput::with_text("first"));
        runner.fail("denied");

        assert_eq!(runner.run(ShellCommand::new("a")).unwrap().text, "first");
        assert!(runner.run(ShellCommand::new("b")).is_err());
        assert_eq!(runner.run(ShellCommand::new("c")).unwrap().status, Some(0));
        assert_eq!(runner.lines(), vec!["a", "b", "c"]);
    }
}

//! Remote command execution on hypervisor hosts.

use std::io::Write;
use std::process::{Command, Stdio};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("failed to spawn {program}: {message}")]
    Spawn { program: String, message: String },
    #[error("command on {host} exited with {code:?}: {command}: {stderr}")]
    Failed {
        host: String,
        command: String,
        code: Option<i32>,
        stderr: String,
    },
}

impl CommandError {
    pub fn stderr(&self) -> &str {
        match self {
            Self::Failed { stderr, .. } => stderr,
            Self::Spawn { .. } => "",
        }
    }
}

/// Runs a shell command line on a host. Fakes implement this in tests.
pub trait CommandRunner: Send + Sync {
    fn run(
        &self,
        host: &str,
        command: &str,
        stdin: Option<&str>,
    ) -> Result<CommandOutput, CommandError>;

    /// Runs the command and returns stdout, failing on a non-zero exit.
    fn cmd(&self, host: &str, command: &str, stdin: Option<&str>) -> Result<String, CommandError> {
        let output = self.run(host, command, stdin)?;
        if output.is_success() {
            Ok(output.stdout)
        } else {
            Err(CommandError::Failed {
                host: host.to_string(),
                command: command.to_string(),
                code: output.code,
                stderr: output.stderr,
            })
        }
    }
}

/// Shells out to the local `ssh` client.
#[derive(Clone, Debug)]
pub struct SshCommandRunner {
    user: String,
    program: String,
    options: Vec<String>,
}

impl SshCommandRunner {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            program: "ssh".to_string(),
            options: vec![
                "-o".to_string(),
                "BatchMode=yes".to_string(),
                "-o".to_string(),
                "ConnectTimeout=10".to_string(),
            ],
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_option(mut self, option: impl Into<String>) -> Self {
        self.options.push("-o".to_string());
        self.options.push(option.into());
        self
    }

    fn args(&self, host: &str, command: &str) -> Vec<String> {
        let mut args = self.options.clone();
        args.push(format!("{}@{}", self.user, host));
        args.push("--".to_string());
        args.push(command.to_string());
        args
    }
}

impl CommandRunner for SshCommandRunner {
    fn run(
        &self,
        host: &str,
        command: &str,
        stdin: Option<&str>,
    ) -> Result<CommandOutput, CommandError> {
        let spawn_err = |err: std::io::Error| CommandError::Spawn {
            program: self.program.clone(),
            message: err.to_string(),
        };
        let mut child = Command::new(&self.program)
            .args(self.args(host, command))
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(spawn_err)?;
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes()).map_err(spawn_err)?;
        }
        let output = child.wait_with_output().map_err(spawn_err)?;
        tracing::debug!(host, code = ?output.status.code(), "remote command finished");
        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

//! Runs the external tools the mount sequence depends on.
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, trace};
use tokio::process::Command;
use tokio::time::timeout;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I, timeout: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            timeout,
        }
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `-1` when the process was killed by a signal.
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == 0
    }
}

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Runs the command to completion. A spawn failure or timeout is an
    /// `io::Error`; a non-zero exit is a normal [`CommandOutput`].
    async fn run(&self, spec: &CommandSpec) -> io::Result<CommandOutput>;
}

/// Spawns real processes.
#[derive(Default)]
pub struct SystemExecutor {}

#[async_trait]
impl CommandExecutor for SystemExecutor {
    async fn run(&self, spec: &CommandSpec) -> io::Result<CommandOutput> {
        debug!("executing `{spec}`");
        let child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = timeout(spec.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("`{spec}` did not finish within {:?}", spec.timeout),
                )
            })??;

        let result = CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        trace!("`{spec}` exited with {}: {}", result.status, result.stdout);
        Ok(result)
    }
}

/// Replays queued outputs in order and records every command it was asked to
/// run. With the queue empty every command succeeds with no output.
#[derive(Default)]
pub struct ScriptedExecutor {
    outputs: Mutex<VecDeque<io::Result<CommandOutput>>>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_output(&self, output: CommandOutput) -> &Self {
        self.outputs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Ok(output));
        self
    }

    pub fn push_error(&self, kind: io::ErrorKind, message: &str) -> &Self {
        self.outputs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Err(io::Error::new(kind, message.to_string())));
        self
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl CommandExecutor for ScriptedExecutor {
    async fn run(&self, spec: &CommandSpec) -> io::Result<CommandOutput> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(spec.clone());
        self.outputs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| Ok(CommandOutput::ok("")))
    }
}

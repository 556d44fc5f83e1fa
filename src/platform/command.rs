// file: src/platform/command.rs
// version: 1.0.0
// guid: 0f3c8e0b-7d0a-4d4e-9f53-61c3b1f0e2a7

//! Subprocess execution behind a trait so host strategies can be scripted in tests

use super::Subphase;
use crate::error::ProvisionError;
use crate::Result;
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, trace};

/// Captured result of a finished subprocess
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    /// Exit status, `-1` when killed by a signal
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

/// Build an argument vector from string slices
pub fn argv(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Runs external tools on behalf of a host strategy
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` to completion or until `timeout` elapses.
    ///
    /// A non-zero exit is not an error here; spawn failures and timeouts are.
    async fn run(
        &self,
        subphase: Subphase,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput>;

    /// Run and turn a non-zero exit into a failure of `subphase`, returning stdout
    async fn run_checked(
        &self,
        subphase: Subphase,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<String> {
        let output = self.run(subphase, program, args, timeout).await?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(ProvisionError::platform(
                subphase,
                format!(
                    "{} {} exited with {}: {}",
                    program,
                    args.join(" "),
                    output.status,
                    output.stderr.trim()
                ),
            ))
        }
    }
}

/// Runs real processes with `tokio::process`
#[derive(Debug, Default, Clone)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(
        &self,
        subphase: Subphase,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput> {
        debug!("[{}] {} {}", subphase, program, args.join(" "));

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ProvisionError::platform(subphase, format!("failed to start {}: {}", program, e))
            })?;

        // Dropping the future on timeout drops the child, which kills it
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| ProvisionError::Timeout {
                subphase,
                secs: timeout.as_secs(),
            })?
            .map_err(|e| {
                ProvisionError::platform(subphase, format!("failed to wait for {}: {}", program, e))
            })?;

        let result = CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        trace!("{} exited with {}", program, result.status);
        Ok(result)
    }
}

/// Canned response for a [`ScriptedRunner`] rule
#[derive(Debug, Clone)]
pub enum Scripted {
    Output(CommandOutput),
    Timeout,
    SpawnFailure(String),
}

/// A call observed by [`ScriptedRunner`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub subphase: Subphase,
    pub program: String,
    pub args: Vec<String>,
}

impl RecordedCall {
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

#[derive(Debug)]
struct Rule {
    program: String,
    needle: Option<String>,
    response: Scripted,
    sticky: bool,
}

/// Runner that answers from a script and records every call.
///
/// Rules match on program name and, optionally, a substring of the joined
/// argument list. One-shot rules are consumed in order; unmatched calls
/// succeed with empty output.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer the next matching call once
    pub fn respond(self, program: &str, needle: Option<&str>, response: Scripted) -> Self {
        self.push(program, needle, response, false)
    }

    /// Answer every matching call
    pub fn always(self, program: &str, needle: Option<&str>, response: Scripted) -> Self {
        self.push(program, needle, response, true)
    }

    fn push(self, program: &str, needle: Option<&str>, response: Scripted, sticky: bool) -> Self {
        self.rules
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(Rule {
                program: program.to_string(),
                needle: needle.map(str::to_string),
                response,
                sticky,
            });
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn command_lines(&self) -> Vec<String> {
        self.calls().iter().map(RecordedCall::command_line).collect()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(
        &self,
        subphase: Subphase,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput> {
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(RecordedCall {
                subphase,
                program: program.to_string(),
                args: args.to_vec(),
            });

        let joined = args.join(" ");
        let response = {
            let mut rules = self.rules.lock().unwrap_or_else(|p| p.into_inner());
            let position = rules.iter().position(|r| {
                r.program == program
                    && r.needle.as_deref().map_or(true, |n| joined.contains(n))
            });
            match position {
                Some(i) if rules[i].sticky => Some(rules[i].response.clone()),
                Some(i) => Some(rules.remove(i).response),
                None => None,
            }
        };

        match response {
            None => Ok(CommandOutput::ok("")),
            Some(Scripted::Output(output)) => Ok(output),
            Some(Scripted::Timeout) => Err(ProvisionError::Timeout {
                subphase,
                secs: timeout.as_secs(),
            }),
            Some(Scripted::SpawnFailure(msg)) => Err(ProvisionError::platform(
                subphase,
                format!("failed to start {}: {}", program, msg),
            )),
        }
    }
}

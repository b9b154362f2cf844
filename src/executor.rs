//! The execution collaborator seam.
//!
//! The scheduler never looks inside a worker execution. It hands an
//! [`Executor`] a prompt and options and reads back a stream of updates that
//! ends in a final result (with usage) or an error.

use crate::types::{Dependency, Task};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::debug;

/// Buffered updates per execution stream.
const STREAM_CAPACITY: usize = 64;

/// Bytes of stderr kept for the failure message.
const STDERR_TAIL: usize = 8 * 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionOptions {
    pub role: String,
    pub task_id: String,
    pub instance_id: String,
    /// Checkout the execution should work in, when isolation is enabled.
    pub workdir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub duration_ms: u64,
    pub turns: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub output: String,
    pub usage: Usage,
}

#[derive(Debug, Clone)]
pub enum ExecutionUpdate {
    Partial(String),
    Final(ExecutionResult),
    Error(String),
}

pub type ExecutionStream = mpsc::Receiver<ExecutionUpdate>;

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("failed to start execution: {0}")]
    Start(String),

    #[error("execution failed: {0}")]
    Failed(String),

    #[error("execution stream closed without a result")]
    StreamClosed,
}

#[async_trait]
pub trait Executor: Send + Sync {
    async fn start(
        &self,
        prompt: String,
        options: ExecutionOptions,
    ) -> Result<ExecutionStream, ExecutionError>;
}

/// Drain a stream to its final result.
pub async fn collect(mut stream: ExecutionStream) -> Result<ExecutionResult, ExecutionError> {
    while let Some(update) = stream.recv().await {
        match update {
            ExecutionUpdate::Partial(chunk) => debug!(bytes = chunk.len(), "Partial output"),
            ExecutionUpdate::Final(result) => return Ok(result),
            ExecutionUpdate::Error(message) => return Err(ExecutionError::Failed(message)),
        }
    }
    Err(ExecutionError::StreamClosed)
}

/// Context string handed to the executor for one task.
pub fn build_prompt(task: &Task, instructions: Option<&str>, blockers: &[Dependency]) -> String {
    let mut prompt = String::new();
    if let Some(instructions) = instructions {
        prompt.push_str(instructions.trim());
        prompt.push_str("\n\n");
    }

    prompt.push_str(&format!("# Task {}: {}\n", task.id, task.title));
    prompt.push_str(&format!("- type: {}\n", task.task_type));
    prompt.push_str(&format!("- priority: {}\n", task.priority));
    prompt.push_str(&format!("- group: {}\n", task.group_id));
    if let Some(parent) = &task.parent_id {
        prompt.push_str(&format!("- parent: {}\n", parent));
    }
    if let Some(previous) = &task.revision_of {
        prompt.push_str(&format!("- revises: {}\n", previous));
    }
    if !blockers.is_empty() {
        let ids: Vec<&str> = blockers.iter().map(|d| d.blocked_by.as_str()).collect();
        prompt.push_str(&format!("- builds on: {}\n", ids.join(", ")));
    }
    if let Some(description) = &task.description {
        prompt.push_str("\n## Description\n");
        prompt.push_str(description);
        prompt.push('\n');
    }
    prompt
}

/// Runs an external command per task: the prompt goes to stdin, each stdout
/// line is streamed as partial output, and exit status decides the outcome.
///
/// The command learns its task through `TGS_TASK_ID`, `TGS_ROLE` and
/// `TGS_INSTANCE_ID`. Usage is reported as wall-clock time only.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    program: String,
    args: Vec<String>,
}

impl ProcessExecutor {
    /// Build from `[program, args...]`. `None` for an empty command.
    pub fn from_command(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

#[async_trait]
impl Executor for ProcessExecutor {
    async fn start(
        &self,
        prompt: String,
        options: ExecutionOptions,
    ) -> Result<ExecutionStream, ExecutionError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env("TGS_TASK_ID", &options.task_id)
            .env("TGS_ROLE", &options.role)
            .env("TGS_INSTANCE_ID", &options.instance_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &options.workdir {
            command.current_dir(dir);
        }

        let started = Instant::now();
        let mut child = command
            .spawn()
            .map_err(|e| ExecutionError::Start(format!("{}: {}", self.program, e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ExecutionError::Start("stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecutionError::Start("stdout unavailable".into()))?;
        let stderr = child.stderr.take();

        // Each pipe gets its own reader so a chatty stderr cannot fill its
        // buffer and stall the child while stdout is being drained.
        let writer = tokio::spawn(async move {
            // A command that ignores stdin closes it early; that is not an error.
            let _ = stdin.write_all(prompt.as_bytes()).await;
        });
        let error_reader = tokio::spawn(async move {
            let mut error_text = String::new();
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    push_tail(&mut error_text, &line);
                }
            }
            error_text
        });

        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        tokio::spawn(async move {
            let mut output = String::new();
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                output.push_str(&line);
                output.push('\n');
                let _ = tx.send(ExecutionUpdate::Partial(line)).await;
            }

            let _ = writer.await;
            let error_text = error_reader.await.unwrap_or_default();

            let update = match child.wait().await {
                Ok(status) if status.success() => ExecutionUpdate::Final(ExecutionResult {
                    output,
                    usage: Usage {
                        duration_ms: started.elapsed().as_millis() as u64,
                        turns: 1,
                        ..Usage::default()
                    },
                }),
                Ok(status) => ExecutionUpdate::Error(format!(
                    "exited with {}: {}",
                    status,
                    error_text.trim()
                )),
                Err(e) => ExecutionUpdate::Error(e.to_string()),
            };
            let _ = tx.send(update).await;
        });

        Ok(rx)
    }
}

/// Append a line, keeping only the last `STDERR_TAIL` bytes.
fn push_tail(buf: &mut String, line: &str) {
    buf.push_str(line);
    buf.push('\n');
    if buf.len() > STDERR_TAIL {
        let mut cut = buf.len() - STDERR_TAIL;
        while !buf.is_char_boundary(cut) {
            cut += 1;
        }
        buf.drain(..cut);
    }
}

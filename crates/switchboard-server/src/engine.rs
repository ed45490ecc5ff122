//! Task engine that drives an external program over newline-delimited JSON.
//!
//! The program receives the goal as its last argument and writes one message
//! per line to stdout:
//!
//! ```text
//! {"type":"step","evaluation":"...","memory":"...","next_goal":"...","actions":[...]}
//! {"type":"screenshot","data":"<base64>"}   or   {"type":"screenshot","path":"/tmp/s.png"}
//! {"type":"result","content":"..."}
//! {"type":"error","message":"..."}
//! ```
//!
//! Lines that are not protocol messages are logged and skipped.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use parking_lot::Mutex;
use serde::Deserialize;
use switchboard_core::errors::TaskError;
use switchboard_core::step::StepOutput;
use switchboard_core::task::{StepCallback, TaskAgent, TaskEngine, TaskOutcome};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

const EXIT_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum EngineMessage {
    Step {
        #[serde(default)]
        step: Option<u32>,
        #[serde(default, alias = "evaluation_previous_goal")]
        evaluation: String,
        #[serde(default)]
        memory: String,
        #[serde(default)]
        next_goal: String,
        #[serde(default)]
        actions: Vec<serde_json::Value>,
    },
    Screenshot {
        #[serde(default)]
        data: Option<String>,
        #[serde(default)]
        path: Option<PathBuf>,
    },
    #[serde(rename = "result")]
    Finished {
        #[serde(default)]
        content: Option<String>,
    },
    Error {
        message: String,
    },
}

#[derive(Clone, Debug)]
pub struct CommandEngine {
    program: String,
    args: Vec<String>,
}

impl CommandEngine {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Split a whitespace-separated command line. `None` when it is blank.
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

#[async_trait]
impl TaskEngine for CommandEngine {
    async fn launch(&self) -> Result<Arc<dyn TaskAgent>, TaskError> {
        if self.program.trim().is_empty() {
            return Err(TaskError::Launch("no engine program configured".into()));
        }
        Ok(Arc::new(CommandAgent {
            engine: self.clone(),
            screenshot: Mutex::new(None),
        }))
    }
}

/// One external process per task. The latest reported screenshot is kept so
/// the progress relay can attach it to each step.
struct CommandAgent {
    engine: CommandEngine,
    screenshot: Mutex<Option<String>>,
}

impl CommandAgent {
    fn spawn(&self, goal: &str) -> Result<Child, TaskError> {
        Command::new(&self.engine.program)
            .args(&self.engine.args)
            .arg(goal)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TaskError::Launch(format!("{}: {e}", self.engine.program)))
    }

    async fn store_screenshot(&self, data: Option<String>, path: Option<PathBuf>) {
        let encoded = match (data, path) {
            (Some(data), _) => Some(data),
            (None, Some(path)) => match tokio::fs::read(&path).await {
                Ok(bytes) => Some(base64::engine::general_purpose::STANDARD.encode(bytes)),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to read screenshot");
                    None
                }
            },
            (None, None) => None,
        };
        if let Some(encoded) = encoded {
            *self.screenshot.lock() = Some(encoded);
        }
    }
}

async fn reap(child: &mut Child) -> Result<ExitStatus, TaskError> {
    match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
        Ok(status) => Ok(status?),
        Err(_) => {
            tracing::warn!("Engine did not exit after reporting, killing it");
            child.kill().await?;
            Ok(child.wait().await?)
        }
    }
}

#[async_trait]
impl TaskAgent for CommandAgent {
    async fn run(&self, goal: &str, on_step: StepCallback) -> Result<TaskOutcome, TaskError> {
        let mut child = self.spawn(goal)?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TaskError::Launch("engine stdout unavailable".into()))?;

        if let Some(stderr) = child.stderr.take() {
            let program = self.engine.program.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(program = %program, "engine: {line}");
                }
            });
        }

        let mut lines = BufReader::new(stdout).lines();
        let mut outcome = None;
        let mut last_index = 0;
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<EngineMessage>(line) {
                Ok(EngineMessage::Step {
                    step,
                    evaluation,
                    memory,
                    next_goal,
                    actions,
                }) => {
                    last_index = step.unwrap_or(last_index + 1);
                    on_step(
                        StepOutput {
                            evaluation,
                            memory,
                            next_goal,
                            actions,
                        },
                        last_index,
                    );
                }
                Ok(EngineMessage::Screenshot { data, path }) => self.store_screenshot(data, path).await,
                Ok(EngineMessage::Finished { content }) => {
                    outcome = Some(Ok(content.filter(|c| !c.is_empty())));
                    break;
                }
                Ok(EngineMessage::Error { message }) => {
                    outcome = Some(Err(TaskError::Failed(message)));
                    break;
                }
                Err(e) => tracing::debug!(error = %e, line = line, "Skipping non-protocol engine output"),
            }
        }

        let status = reap(&mut child).await?;
        match outcome {
            Some(outcome) => outcome,
            None if status.success() => Ok(None),
            None => Err(TaskError::Failed(format!("engine exited with {status}"))),
        }
    }

    async fn screenshot(&self) -> Option<String> {
        self.screenshot.lock().clone()
    }
}

//! Task engine collaborator.
//!
//! The engine is opaque: it accepts a natural-language goal, reports each step
//! through a synchronous callback, and eventually returns a result or failure.

use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::TaskError;
use crate::step::StepOutput;

/// Invoked synchronously by the engine for every step, with the step index.
/// Implementations must return quickly and hand real work off elsewhere.
pub type StepCallback = Arc<dyn Fn(StepOutput, u32) + Send + Sync>;

/// Final text produced by a task. `None` when the task finished without
/// extracting anything.
pub type TaskOutcome = Option<String>;

/// Launches one isolated agent per task.
#[async_trait]
pub trait TaskEngine: Send + Sync {
    async fn launch(&self) -> Result<Arc<dyn TaskAgent>, TaskError>;
}

/// A single running agent with its own execution context.
#[async_trait]
pub trait TaskAgent: Send + Sync {
    async fn run(&self, goal: &str, on_step: StepCallback) -> Result<TaskOutcome, TaskError>;

    /// Current screenshot of the agent's context as base64, if it has one.
    async fn screenshot(&self) -> Option<String> {
        None
    }

    /// Release the agent's resources. Called once after `run` returns.
    async fn close(&self) {}
}

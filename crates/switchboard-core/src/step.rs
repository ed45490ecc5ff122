use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Raw output of one task step, as reported by the task engine.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StepOutput {
    /// The agent's evaluation of its previous goal.
    #[serde(default)]
    pub evaluation: String,
    #[serde(default)]
    pub memory: String,
    #[serde(default)]
    pub next_goal: String,
    /// Planned operations, in execution order.
    #[serde(default)]
    pub actions: Vec<serde_json::Value>,
}

/// One progress record of a running task. Immutable once appended to a session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub step: u32,
    pub screenshot: Option<String>,
    pub action: String,
    pub memory: String,
    pub next_goal: String,
    pub actions: Vec<String>,
    pub recorded_at: DateTime<Utc>,
}

impl Step {
    pub fn from_output(step: u32, output: StepOutput, screenshot: Option<String>) -> Self {
        let actions = output
            .actions
            .iter()
            .map(|a| serde_json::to_string(a).unwrap_or_default())
            .collect();
        Self {
            step,
            screenshot,
            action: output.evaluation,
            memory: output.memory,
            next_goal: output.next_goal,
            actions,
            recorded_at: Utc::now(),
        }
    }

    /// Plain-text progress line for the conversational channel.
    pub fn summary(&self) -> String {
        if self.next_goal.is_empty() {
            format!("Step {}: {}", self.step, self.action)
        } else {
            format!("Step {}: {}\nNext: {}", self.step, self.action, self.next_goal)
        }
    }
}

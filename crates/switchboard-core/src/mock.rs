//! Deterministic collaborators for tests and local runs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::conversation::{
    Activity, ContinuationFn, ConversationAdapter, ConversationReference, ResourceResponse,
    TurnContext,
};
use crate::errors::{BridgeError, TaskError};
use crate::step::StepOutput;
use crate::task::{StepCallback, TaskAgent, TaskEngine, TaskOutcome};

#[derive(Default)]
struct Recorded {
    continuations: Vec<(ConversationReference, String)>,
    sent: Vec<Activity>,
    updated: Vec<(String, Activity)>,
}

/// Conversation adapter that records every call instead of talking to a channel.
#[derive(Clone, Default)]
pub struct RecordingAdapter {
    recorded: Arc<Mutex<Recorded>>,
    next_id: Arc<AtomicUsize>,
    fail_sends: bool,
}

impl RecordingAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adapter whose `send_activity` always fails.
    pub fn failing_sends() -> Self {
        Self {
            fail_sends: true,
            ..Self::default()
        }
    }

    /// References passed to `continue_conversation`, in call order.
    pub fn continuations(&self) -> Vec<ConversationReference> {
        self.recorded
            .lock()
            .continuations
            .iter()
            .map(|(r, _)| r.clone())
            .collect()
    }

    pub fn continuation_app_ids(&self) -> Vec<String> {
        self.recorded
            .lock()
            .continuations
            .iter()
            .map(|(_, app)| app.clone())
            .collect()
    }

    pub fn sent(&self) -> Vec<Activity> {
        self.recorded.lock().sent.clone()
    }

    /// Text of every sent message, in order.
    pub fn sent_texts(&self) -> Vec<String> {
        self.recorded
            .lock()
            .sent
            .iter()
            .filter_map(|a| a.text.clone())
            .collect()
    }

    pub fn updated(&self) -> Vec<(String, Activity)> {
        self.recorded.lock().updated.clone()
    }
}

#[async_trait]
impl ConversationAdapter for RecordingAdapter {
    async fn continue_conversation(
        &self,
        reference: &ConversationReference,
        app_id: &str,
        work: ContinuationFn,
    ) -> Result<(), BridgeError> {
        self.recorded
            .lock()
            .continuations
            .push((reference.clone(), app_id.to_string()));
        let ctx = TurnContext::continuation(Arc::new(self.clone()), reference.clone());
        work(ctx).await
    }

    async fn send_activity(
        &self,
        reference: &ConversationReference,
        activity: Activity,
    ) -> Result<ResourceResponse, BridgeError> {
        if self.fail_sends {
            return Err(BridgeError::Adapter("send rejected".into()));
        }
        let id = format!("act-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let mut activity = activity.addressed_to(reference);
        activity.id = Some(id.clone());
        self.recorded.lock().sent.push(activity);
        Ok(ResourceResponse { id })
    }

    async fn update_activity(
        &self,
        reference: &ConversationReference,
        activity_id: &str,
        activity: Activity,
    ) -> Result<(), BridgeError> {
        let activity = activity.addressed_to(reference);
        self.recorded
            .lock()
            .updated
            .push((activity_id.to_string(), activity));
        Ok(())
    }
}

/// Pre-programmed task: replays steps, then returns a fixed outcome.
#[derive(Clone)]
pub struct ScriptedEngine {
    steps: Vec<StepOutput>,
    outcome: Result<TaskOutcome, TaskError>,
    step_delay: Option<Duration>,
    launches: Arc<AtomicUsize>,
}

impl ScriptedEngine {
    pub fn new(steps: Vec<StepOutput>, outcome: Result<TaskOutcome, TaskError>) -> Self {
        Self {
            steps,
            outcome,
            step_delay: None,
            launches: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Convenience: `n` numbered steps followed by `result`.
    pub fn succeeding(n: usize, result: &str) -> Self {
        let steps = (1..=n)
            .map(|i| StepOutput {
                evaluation: format!("step {i}"),
                memory: format!("memory {i}"),
                next_goal: format!("goal {i}"),
                actions: vec![serde_json::json!({ "click": { "index": i } })],
            })
            .collect();
        Self::new(steps, Ok(Some(result.to_string())))
    }

    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = Some(delay);
        self
    }

    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TaskEngine for ScriptedEngine {
    async fn launch(&self) -> Result<Arc<dyn TaskAgent>, TaskError> {
        self.launches.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(ScriptedAgent {
            script: self.clone(),
            shots: AtomicUsize::new(0),
        }))
    }
}

struct ScriptedAgent {
    script: ScriptedEngine,
    shots: AtomicUsize,
}

#[async_trait]
impl TaskAgent for ScriptedAgent {
    async fn run(&self, _goal: &str, on_step: StepCallback) -> Result<TaskOutcome, TaskError> {
        for (i, step) in self.script.steps.iter().enumerate() {
            on_step(step.clone(), i as u32 + 1);
            if let Some(delay) = self.script.step_delay {
                tokio::time::sleep(delay).await;
            }
        }
        self.script.outcome.clone()
    }

    async fn screenshot(&self) -> Option<String> {
        let n = self.shots.fetch_add(1, Ordering::Relaxed) + 1;
        Some(format!("shot-{n}"))
    }
}

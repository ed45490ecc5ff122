//! Bridges a task engine's synchronous step callback to async delivery.
//!
//! The callback only enqueues. A single worker per task drains the queue in
//! order, so steps are recorded and delivered in the order the engine
//! reported them.

use std::sync::Arc;

use parking_lot::Mutex;
use switchboard_core::conversation::{Activity, ConversationReference};
use switchboard_core::ids::Identity;
use switchboard_core::step::{Step, StepOutput};
use switchboard_core::task::{StepCallback, TaskAgent};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::dispatcher::EventDispatcher;

/// The conversational message that mirrors a task's progress.
#[derive(Clone, Debug)]
pub struct StatusMessage {
    pub reference: ConversationReference,
    pub activity_id: String,
}

impl StatusMessage {
    pub fn new(reference: ConversationReference, activity_id: impl Into<String>) -> Self {
        Self {
            reference,
            activity_id: activity_id.into(),
        }
    }
}

struct PendingStep {
    output: StepOutput,
    index: u32,
}

type Sender = Arc<Mutex<Option<mpsc::UnboundedSender<PendingStep>>>>;

pub struct ProgressRelay {
    tx: Sender,
    worker: JoinHandle<usize>,
}

impl ProgressRelay {
    /// Start the worker for one task. Steps are recorded against `identity`
    /// when it is known; `status` receives a best-effort text update per step.
    pub fn spawn(
        identity: Option<Identity>,
        dispatcher: Arc<EventDispatcher>,
        agent: Arc<dyn TaskAgent>,
        status: Option<StatusMessage>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(drain(rx, identity, dispatcher, agent, status));
        Self {
            tx: Arc::new(Mutex::new(Some(tx))),
            worker,
        }
    }

    /// Step callback for the engine. Never blocks; steps reported after
    /// `finish` are dropped.
    pub fn callback(&self) -> StepCallback {
        let tx = Arc::clone(&self.tx);
        Arc::new(move |output: StepOutput, index: u32| {
            let guard = tx.lock();
            let Some(sender) = guard.as_ref() else {
                tracing::debug!(step = index, "Step reported after relay finished");
                return;
            };
            if sender.send(PendingStep { output, index }).is_err() {
                tracing::warn!(step = index, "Progress worker gone, step dropped");
            }
        })
    }

    /// Stop accepting steps and wait until every queued step is processed.
    /// Returns how many steps were processed.
    pub async fn finish(self) -> usize {
        self.tx.lock().take();
        match self.worker.await {
            Ok(processed) => processed,
            Err(e) => {
                tracing::error!(error = %e, "Progress worker panicked");
                0
            }
        }
    }
}

async fn drain(
    mut rx: mpsc::UnboundedReceiver<PendingStep>,
    identity: Option<Identity>,
    dispatcher: Arc<EventDispatcher>,
    agent: Arc<dyn TaskAgent>,
    status: Option<StatusMessage>,
) -> usize {
    let mut processed = 0;
    while let Some(pending) = rx.recv().await {
        let screenshot = agent.screenshot().await;
        let step = Step::from_output(pending.index, pending.output, screenshot);
        let summary = step.summary();

        match &identity {
            Some(identity) => {
                dispatcher.publish_step(identity, step);
            }
            None => tracing::debug!(step = pending.index, "Step for anonymous task not recorded"),
        }

        if let Some(status) = &status {
            if let Err(e) = dispatcher
                .adapter()
                .update_activity(&status.reference, &status.activity_id, Activity::message(summary))
                .await
            {
                tracing::warn!(step = pending.index, error = %e, "Status update failed");
            }
        }
        processed += 1;
    }
    processed
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_core::frame::Frame;
    use switchboard_core::mock::{RecordingAdapter, ScriptedEngine};
    use switchboard_core::task::TaskEngine;
    use switchboard_store::{ReferenceCache, SessionStore};

    use crate::connection::{Connection, ConnectionRegistry};

    fn dispatcher(adapter: &RecordingAdapter) -> Arc<EventDispatcher> {
        Arc::new(EventDispatcher::new(
            Arc::new(ConnectionRegistry::new()),
            Arc::new(ReferenceCache::new()),
            Arc::new(SessionStore::new()),
            Arc::new(adapter.clone()),
            "app-id",
        ))
    }

    #[tokio::test]
    async fn steps_are_recorded_in_order_with_screenshots() {
        let adapter = RecordingAdapter::new();
        let dispatcher = dispatcher(&adapter);
        let u1 = Identity::from_raw("u1");
        let session = dispatcher.sessions().get_or_create(&u1);
        let (conn, mut rx) = Connection::new(16);
        dispatcher.on_connect(Some("u1"), conn).await;

        let agent = ScriptedEngine::succeeding(3, "done").launch().await.unwrap();
        let relay = ProgressRelay::spawn(Some(u1.clone()), Arc::clone(&dispatcher), Arc::clone(&agent), None);
        agent.run("goal", relay.callback()).await.unwrap();
        assert_eq!(relay.finish().await, 3);

        let steps = session.steps();
        let indexes: Vec<u32> = steps.iter().map(|s| s.step).collect();
        assert_eq!(indexes, vec![1, 2, 3]);
        let shots: Vec<Option<String>> = steps.iter().map(|s| s.screenshot.clone()).collect();
        assert_eq!(
            shots,
            vec![Some("shot-1".into()), Some("shot-2".into()), Some("shot-3".into())]
        );

        for expected in ["step 1", "step 2", "step 3"] {
            let frame: Frame = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
            assert_eq!(frame.data["action"], expected);
        }
    }

    #[tokio::test]
    async fn status_message_is_updated_per_step() {
        let adapter = RecordingAdapter::new();
        let dispatcher = dispatcher(&adapter);
        let status = StatusMessage::new(ConversationReference::default(), "act-1");

        let agent = ScriptedEngine::succeeding(2, "done").launch().await.unwrap();
        let relay = ProgressRelay::spawn(None, Arc::clone(&dispatcher), Arc::clone(&agent), Some(status));
        agent.run("goal", relay.callback()).await.unwrap();
        relay.finish().await;

        let updated = adapter.updated();
        assert_eq!(updated.len(), 2);
        assert!(updated.iter().all(|(id, _)| id == "act-1"));
        assert_eq!(
            updated[1].1.text.as_deref(),
            Some("Step 2: step 2\nNext: goal 2")
        );
    }

    #[tokio::test]
    async fn steps_after_finish_are_dropped() {
        let adapter = RecordingAdapter::new();
        let dispatcher = dispatcher(&adapter);
        let u1 = Identity::from_raw("u1");
        let session = dispatcher.sessions().get_or_create(&u1);

        let agent = ScriptedEngine::succeeding(0, "done").launch().await.unwrap();
        let relay = ProgressRelay::spawn(Some(u1), Arc::clone(&dispatcher), agent, None);
        let callback = relay.callback();
        assert_eq!(relay.finish().await, 0);

        callback(StepOutput::default(), 1);
        assert_eq!(session.step_count(), 0);
    }

    #[tokio::test]
    async fn steps_survive_without_a_connection() {
        let adapter = RecordingAdapter::new();
        let dispatcher = dispatcher(&adapter);
        let u1 = Identity::from_raw("u1");
        let session = dispatcher.sessions().get_or_create(&u1);

        let agent = ScriptedEngine::succeeding(2, "done").launch().await.unwrap();
        let relay = ProgressRelay::spawn(Some(u1), Arc::clone(&dispatcher), Arc::clone(&agent), None);
        agent.run("goal", relay.callback()).await.unwrap();
        relay.finish().await;

        assert_eq!(session.step_count(), 2);
    }
}

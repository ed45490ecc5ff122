//! The operator bot: starts browser tasks from chat and keeps the web client
//! in sync with them.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use futures::FutureExt;
use regex::Regex;
use serde_json::json;
use switchboard_core::conversation::{
    Activity, ConversationReference, TurnContext, ACTIVITY_CONVERSATION_UPDATE, ACTIVITY_MESSAGE,
};
use switchboard_core::errors::{BridgeError, TaskError};
use switchboard_core::frame::{EVENT_INITIALIZE_GOAL, EVENT_INITIALIZE_STATE, EVENT_MESSAGE, EVENT_RESET};
use switchboard_core::ids::Identity;
use switchboard_core::task::{TaskEngine, TaskOutcome};
use switchboard_store::{Session, SessionStore};
use tokio_util::task::TaskTracker;

use crate::connection::ScopedEmitter;
use crate::dispatcher::{ConnectHandler, EventDispatcher, EventHandler};
use crate::middleware::{TurnHandler, TurnState};
use crate::relay::{ProgressRelay, StatusMessage};

pub const GREETING: &str = "How can I help you today?";
pub const STARTING: &str = "Starting up the browser agent to do this work.";
pub const NO_RESULTS: &str = "No results found";

static OPERATOR_COMMAND: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)^operator:\s*(.+)$").unwrap());

/// Goal text of an `operator: <goal>` message.
pub fn parse_goal(text: &str) -> Option<&str> {
    OPERATOR_COMMAND
        .captures(text.trim())
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
        .filter(|g| !g.is_empty())
}

pub struct OperatorBot {
    dispatcher: Arc<EventDispatcher>,
    engine: Arc<dyn TaskEngine>,
    tasks: TaskTracker,
}

impl OperatorBot {
    pub fn new(dispatcher: Arc<EventDispatcher>, engine: Arc<dyn TaskEngine>) -> Self {
        Self {
            dispatcher,
            engine,
            tasks: TaskTracker::new(),
        }
    }

    /// Number of tasks still running.
    pub fn running_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Wait for every task spawned so far to finish.
    pub async fn wait_idle(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    async fn greet(&self, ctx: &TurnContext) -> Result<(), BridgeError> {
        let activity = ctx.activity();
        let bot_id = activity.recipient.as_ref().map(|r| r.id.as_str());
        for member in &activity.members_added {
            if Some(member.id.as_str()) == bot_id {
                continue;
            }
            ctx.send_text(GREETING).await?;
        }
        Ok(())
    }

    async fn start(&self, ctx: &TurnContext, state: &TurnState, goal: &str) -> Result<(), BridgeError> {
        if let Some(session) = &state.session {
            session.reset();
            session.set_goal(goal);
        }
        if let Some(emitter) = &state.emitter {
            emit_best_effort(emitter, EVENT_RESET, json!({}));
            emit_best_effort(emitter, EVENT_INITIALIZE_GOAL, json!(goal));
        }

        let started = ctx.send_text(STARTING).await?;
        let status = (!started.id.is_empty())
            .then(|| StatusMessage::new(ctx.reference().clone(), started.id));

        tracing::info!(
            identity = ?state.identity.as_ref().map(Identity::as_str),
            goal = goal,
            "Starting operator task"
        );

        let task = OperatorTask {
            dispatcher: Arc::clone(&self.dispatcher),
            engine: Arc::clone(&self.engine),
            identity: state.identity.clone(),
            session: state.session.clone(),
            reference: ctx.reference().clone(),
            status,
            goal: goal.to_string(),
        };
        self.tasks.spawn(task.run());
        Ok(())
    }
}

#[async_trait]
impl TurnHandler for OperatorBot {
    async fn on_turn(&self, ctx: &TurnContext, state: &TurnState) -> Result<(), BridgeError> {
        let activity = ctx.activity();
        match activity.kind.as_str() {
            ACTIVITY_CONVERSATION_UPDATE if !activity.members_added.is_empty() => self.greet(ctx).await,
            ACTIVITY_MESSAGE => {
                let text = activity.text.as_deref().unwrap_or_default();
                match parse_goal(text) {
                    Some(goal) => self.start(ctx, state, goal).await,
                    None => {
                        tracing::debug!("Ignoring message without operator command");
                        Ok(())
                    }
                }
            }
            _ => Ok(()),
        }
    }
}

fn emit_best_effort(emitter: &ScopedEmitter, event: &str, data: serde_json::Value) {
    if let Err(e) = emitter.emit(event, data) {
        tracing::warn!(
            connection_id = %emitter.connection_id(),
            event = event,
            error = %e,
            "Emit failed"
        );
    }
}

/// One background run of the task engine, from launch to result delivery.
struct OperatorTask {
    dispatcher: Arc<EventDispatcher>,
    engine: Arc<dyn TaskEngine>,
    identity: Option<Identity>,
    session: Option<Arc<Session>>,
    reference: ConversationReference,
    status: Option<StatusMessage>,
    goal: String,
}

impl OperatorTask {
    /// Launch and run the agent. A panic anywhere in the engine becomes a
    /// task failure so it still reaches the user.
    async fn execute(&self) -> Result<TaskOutcome, TaskError> {
        let agent = match AssertUnwindSafe(self.engine.launch()).catch_unwind().await {
            Ok(launched) => launched?,
            Err(panic) => return Err(TaskError::from_panic(panic.as_ref())),
        };

        let relay = ProgressRelay::spawn(
            self.identity.clone(),
            Arc::clone(&self.dispatcher),
            Arc::clone(&agent),
            self.status.clone(),
        );
        let outcome = AssertUnwindSafe(agent.run(&self.goal, relay.callback()))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(TaskError::from_panic(panic.as_ref())));
        let steps = relay.finish().await;
        if AssertUnwindSafe(agent.close()).catch_unwind().await.is_err() {
            tracing::warn!(goal = %self.goal, "Task agent panicked while closing");
        }
        tracing::debug!(steps = steps, "Task agent finished");
        outcome
    }

    async fn run(self) {
        let outcome = self.execute().await;

        let (text, headline) = match outcome {
            Ok(Some(result)) => {
                self.record(|s| s.complete());
                (result, "Task completed")
            }
            Ok(None) => {
                self.record(|s| s.complete());
                (NO_RESULTS.to_string(), "Task completed")
            }
            Err(e) => {
                tracing::warn!(goal = %self.goal, error = %e, "Task failed");
                let message = format!("Error during browser agent execution: {e}");
                self.record(|s| s.fail(message.clone()));
                (message, "Error occurred")
            }
        };

        if let Some(status) = &self.status {
            let update = Activity::message(format!("{headline}\n{text}"));
            if let Err(e) = self
                .dispatcher
                .adapter()
                .update_activity(&status.reference, &status.activity_id, update)
                .await
            {
                tracing::warn!(error = %e, "Final status update failed");
            }
        }

        let delivered = self
            .dispatcher
            .adapter()
            .continue_conversation(
                &self.reference,
                self.dispatcher.app_id(),
                Box::new(move |ctx: TurnContext| async move { ctx.send_text(text).await.map(|_| ()) }.boxed()),
            )
            .await;
        if let Err(e) = delivered {
            tracing::error!(
                conversation = %self.reference.conversation.id,
                error = %e,
                kind = e.error_kind(),
                "Failed to deliver task result"
            );
        }
    }

    fn record(&self, apply: impl FnOnce(&Session)) {
        if let Some(session) = &self.session {
            apply(session);
        }
    }
}

/// Replays the identity's session to a freshly connected client.
pub struct StateReplay {
    sessions: Arc<SessionStore>,
}

impl StateReplay {
    pub fn new(sessions: Arc<SessionStore>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl ConnectHandler for StateReplay {
    async fn on_connect(&self, identity: &Identity, emitter: &ScopedEmitter) -> Result<(), BridgeError> {
        let snapshot = self.sessions.get_or_create(identity).snapshot();
        tracing::debug!(identity = %identity, steps = snapshot.messages.len(), "Replaying session state");
        emitter.emit(EVENT_INITIALIZE_STATE, serde_json::to_value(&snapshot)?)
    }
}

/// Logs free text sent from the web client.
pub struct MessageLog {
    sessions: Arc<SessionStore>,
}

impl MessageLog {
    pub fn new(sessions: Arc<SessionStore>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl EventHandler for MessageLog {
    async fn handle(
        &self,
        identity: &Identity,
        ctx: Option<&TurnContext>,
        payload: &serde_json::Value,
    ) -> Result<(), BridgeError> {
        let steps = self.sessions.get(identity).map(|s| s.step_count()).unwrap_or(0);
        let text = payload
            .as_str()
            .or_else(|| payload.get("text").and_then(|t| t.as_str()))
            .unwrap_or_default();
        tracing::info!(
            identity = %identity,
            steps = steps,
            has_context = ctx.is_some(),
            text = text,
            "Web client message"
        );
        Ok(())
    }
}

/// Register the streaming handlers every deployment runs with.
pub fn install_default_handlers(dispatcher: &mut EventDispatcher, sessions: &Arc<SessionStore>) {
    dispatcher.register_connect_handler(Arc::new(StateReplay::new(Arc::clone(sessions))));
    dispatcher.register_handler(EVENT_MESSAGE, Arc::new(MessageLog::new(Arc::clone(sessions))));
}

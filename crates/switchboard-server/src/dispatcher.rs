use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use switchboard_core::conversation::{ConversationAdapter, TurnContext};
use switchboard_core::errors::{panic_message, BridgeError};
use switchboard_core::frame::{Frame, EVENT_MESSAGE};
use switchboard_core::ids::{ConnectionId, Identity};
use switchboard_core::step::Step;
use switchboard_store::{ReferenceCache, SessionStore};

use crate::connection::{Connection, ConnectionRegistry, ScopedEmitter};

/// Handler for a named inbound streaming event. `ctx` is `None` when the
/// identity has no cached conversation reference yet.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(
        &self,
        identity: &Identity,
        ctx: Option<&TurnContext>,
        payload: &serde_json::Value,
    ) -> Result<(), BridgeError>;
}

/// Runs after a streaming connection is accepted.
#[async_trait]
pub trait ConnectHandler: Send + Sync {
    async fn on_connect(&self, identity: &Identity, emitter: &ScopedEmitter) -> Result<(), BridgeError>;
}

/// Routes inbound streaming events into the conversational channel and task
/// progress out to streaming connections.
///
/// Handlers are registered on the owned value during startup; once the
/// dispatcher is shared behind an `Arc` the handler tables are read-only.
pub struct EventDispatcher {
    registry: Arc<ConnectionRegistry>,
    references: Arc<ReferenceCache>,
    sessions: Arc<SessionStore>,
    adapter: Arc<dyn ConversationAdapter>,
    app_id: String,
    handlers: HashMap<String, Vec<Arc<dyn EventHandler>>>,
    connect_handlers: Vec<Arc<dyn ConnectHandler>>,
}

impl EventDispatcher {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        references: Arc<ReferenceCache>,
        sessions: Arc<SessionStore>,
        adapter: Arc<dyn ConversationAdapter>,
        app_id: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            references,
            sessions,
            adapter,
            app_id: app_id.into(),
            handlers: HashMap::new(),
            connect_handlers: Vec::new(),
        }
    }

    pub fn register_handler(&mut self, event: impl Into<String>, handler: Arc<dyn EventHandler>) {
        self.handlers.entry(event.into()).or_default().push(handler);
    }

    pub fn register_connect_handler(&mut self, handler: Arc<dyn ConnectHandler>) {
        self.connect_handlers.push(handler);
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn references(&self) -> &Arc<ReferenceCache> {
        &self.references
    }

    pub fn adapter(&self) -> &Arc<dyn ConversationAdapter> {
        &self.adapter
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// Accept a handshake and run connect handlers. Handler failures are
    /// logged; they never undo the acceptance.
    pub async fn on_connect(&self, identity: Option<&str>, connection: Arc<Connection>) -> bool {
        if !self.accept(identity, Arc::clone(&connection)) {
            return false;
        }
        self.run_connect_handlers(connection).await;
        true
    }

    /// Install the identity mapping for a new connection without running
    /// connect handlers.
    pub fn accept(&self, identity: Option<&str>, connection: Arc<Connection>) -> bool {
        self.registry.connect(identity, connection)
    }

    /// Run connect handlers for an accepted connection in registration order.
    /// A failing or panicking handler is logged and the next one still runs.
    pub async fn run_connect_handlers(&self, connection: Arc<Connection>) {
        let Some(identity) = connection.identity().cloned() else {
            return;
        };

        let emitter = ScopedEmitter::new(connection);
        for handler in &self.connect_handlers {
            match AssertUnwindSafe(handler.on_connect(&identity, &emitter))
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(
                    identity = %identity,
                    error = %e,
                    kind = e.error_kind(),
                    "Connect handler failed"
                ),
                Err(panic) => tracing::error!(
                    identity = %identity,
                    panic = %panic_message(panic.as_ref()),
                    "Connect handler panicked"
                ),
            }
        }
    }

    pub fn on_disconnect(&self, connection_id: &ConnectionId) -> Option<Identity> {
        let identity = self.registry.disconnect(connection_id);
        if identity.is_none() {
            tracing::debug!(connection_id = %connection_id, "Disconnect for unknown connection");
        }
        identity
    }

    /// Deliver an inbound streaming event to its registered handlers.
    ///
    /// Orphaned events (no identity for the connection) are dropped. With a
    /// cached reference the handlers run inside one continued conversational
    /// turn; without one they run with no context. Handlers run in
    /// registration order and the first failure stops the chain.
    pub async fn on_inbound_event(
        &self,
        connection_id: &ConnectionId,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<(), BridgeError> {
        let Some(identity) = self.registry.resolve_identity(connection_id) else {
            tracing::warn!(connection_id = %connection_id, event = event, "Orphaned event dropped");
            return Ok(());
        };

        let handlers = match self.handlers.get(event) {
            Some(h) if !h.is_empty() => h.clone(),
            _ => {
                tracing::debug!(identity = %identity, event = event, "No handlers for event");
                return Ok(());
            }
        };

        let Some(reference) = self.references.get(&identity) else {
            tracing::debug!(identity = %identity, event = event, "No conversation reference, delivering without context");
            return run_handlers(&handlers, event, &identity, None, &payload).await;
        };

        let event_name = event.to_string();
        self.adapter
            .continue_conversation(
                &reference,
                &self.app_id,
                Box::new(move |ctx: TurnContext| {
                    async move { run_handlers(&handlers, &event_name, &identity, Some(&ctx), &payload).await }
                        .boxed()
                }),
            )
            .await
    }

    /// Push a progress payload to the identity's current connection without
    /// waiting. Returns whether it was queued; failures are only logged.
    pub fn emit_progress(&self, identity: &Identity, payload: serde_json::Value) -> bool {
        let Some(connection) = self.registry.lookup(identity) else {
            tracing::trace!(identity = %identity, "No connection for progress");
            return false;
        };
        match connection.send(&Frame::new(EVENT_MESSAGE, payload)) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    identity = %identity,
                    connection_id = %connection.id,
                    error = %e,
                    "Progress delivery failed"
                );
                false
            }
        }
    }

    /// Record a step in the identity's session and push it to their
    /// connection. The append happens regardless of delivery.
    pub fn publish_step(&self, identity: &Identity, step: Step) -> bool {
        let payload = match serde_json::to_value(&step) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(identity = %identity, error = %e, "Failed to serialize step");
                serde_json::Value::Null
            }
        };
        self.sessions.append_step(identity, step);
        if payload.is_null() {
            return false;
        }
        self.emit_progress(identity, payload)
    }
}

async fn run_handlers(
    handlers: &[Arc<dyn EventHandler>],
    event: &str,
    identity: &Identity,
    ctx: Option<&TurnContext>,
    payload: &serde_json::Value,
) -> Result<(), BridgeError> {
    for (index, handler) in handlers.iter().enumerate() {
        if let Err(e) = handler.handle(identity, ctx, payload).await {
            let skipped = handlers.len() - index - 1;
            tracing::warn!(
                identity = %identity,
                event = event,
                error = %e,
                skipped = skipped,
                "Event handler failed"
            );
            return Err(e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use switchboard_core::conversation::{ConversationAccount, ConversationReference};
    use switchboard_core::mock::RecordingAdapter;
    use switchboard_core::step::StepOutput;

    struct Fixture {
        adapter: RecordingAdapter,
        registry: Arc<ConnectionRegistry>,
        references: Arc<ReferenceCache>,
        sessions: Arc<SessionStore>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                adapter: RecordingAdapter::new(),
                registry: Arc::new(ConnectionRegistry::new()),
                references: Arc::new(ReferenceCache::new()),
                sessions: Arc::new(SessionStore::new()),
            }
        }

        fn dispatcher(&self) -> EventDispatcher {
            EventDispatcher::new(
                Arc::clone(&self.registry),
                Arc::clone(&self.references),
                Arc::clone(&self.sessions),
                Arc::new(self.adapter.clone()),
                "app-id",
            )
        }
    }

    fn reference(conversation: &str) -> ConversationReference {
        ConversationReference {
            conversation: ConversationAccount {
                id: conversation.into(),
            },
            channel_id: "msteams".into(),
            ..Default::default()
        }
    }

    fn step(n: u32) -> Step {
        Step::from_output(
            n,
            StepOutput {
                evaluation: format!("action {n}"),
                ..Default::default()
            },
            None,
        )
    }

    /// Records (name, had_context, payload) per invocation into a shared log.
    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<(String, bool, serde_json::Value)>>>,
        fail: bool,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle(
            &self,
            _identity: &Identity,
            ctx: Option<&TurnContext>,
            payload: &serde_json::Value,
        ) -> Result<(), BridgeError> {
            self.log
                .lock()
                .push((self.name.to_string(), ctx.is_some(), payload.clone()));
            if self.fail {
                Err(BridgeError::handler("ping", format!("{} failed", self.name)))
            } else {
                Ok(())
            }
        }
    }

    fn recorder(
        name: &'static str,
        log: &Arc<Mutex<Vec<(String, bool, serde_json::Value)>>>,
        fail: bool,
    ) -> Arc<dyn EventHandler> {
        Arc::new(Recorder {
            name,
            log: Arc::clone(log),
            fail,
        })
    }

    struct Greeter;

    #[async_trait]
    impl ConnectHandler for Greeter {
        async fn on_connect(&self, identity: &Identity, emitter: &ScopedEmitter) -> Result<(), BridgeError> {
            emitter.emit("hello", serde_json::json!(identity.as_str()))
        }
    }

    struct Broken;

    #[async_trait]
    impl ConnectHandler for Broken {
        async fn on_connect(&self, _identity: &Identity, _emitter: &ScopedEmitter) -> Result<(), BridgeError> {
            Err(BridgeError::Delivery("replay failed".into()))
        }
    }

    #[tokio::test]
    async fn on_connect_runs_connect_handlers_in_order() {
        let f = Fixture::new();
        let mut dispatcher = f.dispatcher();
        dispatcher.register_connect_handler(Arc::new(Broken));
        dispatcher.register_connect_handler(Arc::new(Greeter));

        let (conn, mut rx) = Connection::new(8);
        assert!(dispatcher.on_connect(Some("u1"), Arc::clone(&conn)).await);

        // The failing handler did not stop acceptance or the next handler.
        let raw = rx.recv().await.unwrap();
        assert!(raw.contains("\"hello\""));
        assert!(f.registry.lookup(&Identity::from_raw("u1")).is_some());
    }

    #[tokio::test]
    async fn on_connect_rejects_missing_identity() {
        let f = Fixture::new();
        let mut dispatcher = f.dispatcher();
        dispatcher.register_connect_handler(Arc::new(Greeter));

        let (conn, mut rx) = Connection::new(8);
        assert!(!dispatcher.on_connect(None, conn).await);
        assert_eq!(f.registry.count(), 0);
        assert!(rx.try_recv().is_err());
    }

    struct Panicky;

    #[async_trait]
    impl ConnectHandler for Panicky {
        async fn on_connect(&self, _identity: &Identity, _emitter: &ScopedEmitter) -> Result<(), BridgeError> {
            panic!("replay exploded");
        }
    }

    #[tokio::test]
    async fn panicking_connect_handler_does_not_undo_acceptance() {
        let f = Fixture::new();
        let mut dispatcher = f.dispatcher();
        dispatcher.register_connect_handler(Arc::new(Panicky));
        dispatcher.register_connect_handler(Arc::new(Greeter));

        let (conn, mut rx) = Connection::new(8);
        assert!(dispatcher.on_connect(Some("u1"), Arc::clone(&conn)).await);

        let raw = rx.recv().await.unwrap();
        assert!(raw.contains("\"hello\""));
        let current = f.registry.lookup(&Identity::from_raw("u1")).unwrap();
        assert_eq!(current.id, conn.id);
        assert!(conn.is_connected());
    }

    #[tokio::test]
    async fn reset_keeps_connection_and_reference() {
        let f = Fixture::new();
        let dispatcher = f.dispatcher();
        let u1 = Identity::from_raw("u1");
        let (conn, mut rx) = Connection::new(8);
        assert!(dispatcher.on_connect(Some("u1"), Arc::clone(&conn)).await);
        f.references.put(&u1, reference("conv-1"));
        f.sessions.get_or_create(&u1);
        assert!(dispatcher.publish_step(&u1, step(1)));
        assert!(dispatcher.publish_step(&u1, step(2)));

        assert!(f.sessions.reset(&u1));

        assert_eq!(f.registry.lookup(&u1).map(|c| c.id.clone()), Some(conn.id.clone()));
        assert_eq!(f.references.get(&u1), Some(reference("conv-1")));
        assert_eq!(f.sessions.get(&u1).unwrap().step_count(), 0);

        // Steps after the reset are recorded and still reach the same connection.
        assert!(dispatcher.publish_step(&u1, step(3)));
        let recorded: Vec<u32> = f.sessions.get(&u1).unwrap().steps().iter().map(|s| s.step).collect();
        assert_eq!(recorded, vec![3]);
        let delivered: Vec<Frame> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|raw| serde_json::from_str(&raw).unwrap())
            .collect();
        let numbers: Vec<u64> = delivered.iter().filter_map(|frame| frame.data["step"].as_u64()).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn orphaned_event_is_dropped() {
        let f = Fixture::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = f.dispatcher();
        dispatcher.register_handler("ping", recorder("a", &log, false));

        let result = dispatcher
            .on_inbound_event(&ConnectionId::new(), "ping", serde_json::json!({}))
            .await;
        assert!(result.is_ok());
        assert!(log.lock().is_empty());
        assert!(f.adapter.continuations().is_empty());
    }

    #[tokio::test]
    async fn event_without_reference_runs_handlers_without_context() {
        let f = Fixture::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = f.dispatcher();
        dispatcher.register_handler("ping", recorder("a", &log, false));

        let (conn, _rx) = Connection::new(8);
        dispatcher.on_connect(Some("u1"), Arc::clone(&conn)).await;
        dispatcher
            .on_inbound_event(&conn.id, "ping", serde_json::json!({"n": 1}))
            .await
            .unwrap();

        let log = log.lock().clone();
        assert_eq!(log, vec![("a".to_string(), false, serde_json::json!({"n": 1}))]);
        assert!(f.adapter.continuations().is_empty());
    }

    #[tokio::test]
    async fn event_with_reference_continues_conversation_once() {
        let f = Fixture::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = f.dispatcher();
        dispatcher.register_handler("ping", recorder("a", &log, false));
        dispatcher.register_handler("ping", recorder("b", &log, false));

        f.references.put(&Identity::from_raw("u1"), reference("conv-1"));
        let (conn, _rx) = Connection::new(8);
        dispatcher.on_connect(Some("u1"), Arc::clone(&conn)).await;

        dispatcher
            .on_inbound_event(&conn.id, "ping", serde_json::json!({}))
            .await
            .unwrap();

        assert_eq!(f.adapter.continuations(), vec![reference("conv-1")]);
        assert_eq!(f.adapter.continuation_app_ids(), vec!["app-id".to_string()]);
        let names: Vec<(String, bool)> = log.lock().iter().map(|(n, c, _)| (n.clone(), *c)).collect();
        assert_eq!(names, vec![("a".to_string(), true), ("b".to_string(), true)]);
    }

    #[tokio::test]
    async fn first_handler_failure_skips_the_rest() {
        let f = Fixture::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = f.dispatcher();
        dispatcher.register_handler("ping", recorder("a", &log, false));
        dispatcher.register_handler("ping", recorder("b", &log, true));
        dispatcher.register_handler("ping", recorder("c", &log, false));

        f.references.put(&Identity::from_raw("u1"), reference("conv-1"));
        let (conn, _rx) = Connection::new(8);
        dispatcher.on_connect(Some("u1"), Arc::clone(&conn)).await;

        let result = dispatcher
            .on_inbound_event(&conn.id, "ping", serde_json::json!({}))
            .await;

        assert!(matches!(result, Err(BridgeError::Handler { .. })));
        let names: Vec<String> = log.lock().iter().map(|(n, _, _)| n.clone()).collect();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
        // The connection is unaffected.
        assert!(conn.is_connected());
    }

    #[tokio::test]
    async fn unregistered_event_is_ignored() {
        let f = Fixture::new();
        let dispatcher = f.dispatcher();
        f.references.put(&Identity::from_raw("u1"), reference("conv-1"));
        let (conn, _rx) = Connection::new(8);
        dispatcher.on_connect(Some("u1"), Arc::clone(&conn)).await;

        dispatcher
            .on_inbound_event(&conn.id, "unknown", serde_json::json!({}))
            .await
            .unwrap();
        assert!(f.adapter.continuations().is_empty());
    }

    #[tokio::test]
    async fn event_after_disconnect_is_orphaned() {
        let f = Fixture::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = f.dispatcher();
        dispatcher.register_handler("ping", recorder("a", &log, false));

        let (conn, _rx) = Connection::new(8);
        dispatcher.on_connect(Some("u1"), Arc::clone(&conn)).await;
        assert_eq!(dispatcher.on_disconnect(&conn.id), Some(Identity::from_raw("u1")));

        dispatcher
            .on_inbound_event(&conn.id, "ping", serde_json::json!({}))
            .await
            .unwrap();
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn emit_progress_without_connection_has_no_side_effects() {
        let f = Fixture::new();
        let dispatcher = f.dispatcher();
        let session = f.sessions.get_or_create(&Identity::from_raw("u1"));

        assert!(!dispatcher.emit_progress(&Identity::from_raw("u1"), serde_json::json!({"x": 1})));
        assert_eq!(session.step_count(), 0);
    }

    #[tokio::test]
    async fn publish_step_appends_even_without_connection() {
        let f = Fixture::new();
        let dispatcher = f.dispatcher();
        let u1 = Identity::from_raw("u1");
        let session = f.sessions.get_or_create(&u1);

        assert!(!dispatcher.publish_step(&u1, step(1)));
        assert_eq!(session.step_count(), 1);
    }

    #[tokio::test]
    async fn publish_step_targets_latest_connection() {
        let f = Fixture::new();
        let dispatcher = f.dispatcher();
        let u1 = Identity::from_raw("u1");
        f.sessions.get_or_create(&u1);

        let (c1, mut rx1) = Connection::new(8);
        let (c2, mut rx2) = Connection::new(8);
        dispatcher.on_connect(Some("u1"), Arc::clone(&c1)).await;
        dispatcher.on_connect(Some("u1"), Arc::clone(&c2)).await;

        assert!(dispatcher.publish_step(&u1, step(1)));
        assert!(rx1.try_recv().is_err());
        let frame: Frame = serde_json::from_str(&rx2.recv().await.unwrap()).unwrap();
        assert_eq!(frame.event, EVENT_MESSAGE);
        assert_eq!(frame.data["action"], "action 1");

        // Stale disconnect of c1 leaves c2 addressable.
        dispatcher.on_disconnect(&c1.id);
        assert!(dispatcher.publish_step(&u1, step(2)));
        assert!(rx2.recv().await.unwrap().contains("action 2"));
    }

    #[tokio::test]
    async fn emit_progress_failure_is_swallowed() {
        let f = Fixture::new();
        let dispatcher = f.dispatcher();
        let (conn, rx) = Connection::new(8);
        dispatcher.on_connect(Some("u1"), Arc::clone(&conn)).await;
        drop(rx);

        assert!(!dispatcher.emit_progress(&Identity::from_raw("u1"), serde_json::json!({})));
    }
}

//! Context injection for inbound conversational turns.
//!
//! Before any business handler runs, the injector records the turn's
//! conversation reference, loads (or creates) the sender's session and looks
//! up their live streaming connection. The results travel to the handler in a
//! typed [`TurnState`].

use std::sync::Arc;

use async_trait::async_trait;
use switchboard_core::conversation::TurnContext;
use switchboard_core::errors::BridgeError;
use switchboard_core::ids::Identity;
use switchboard_store::{ReferenceCache, Session, SessionStore};

use crate::connection::{ConnectionRegistry, ScopedEmitter};

/// Per-turn attachments. `session` is present whenever `identity` is;
/// `emitter` only while the identity has a live connection.
#[derive(Clone, Default)]
pub struct TurnState {
    pub identity: Option<Identity>,
    pub session: Option<Arc<Session>>,
    pub emitter: Option<ScopedEmitter>,
}

/// Business logic for one conversational turn.
#[async_trait]
pub trait TurnHandler: Send + Sync {
    async fn on_turn(&self, ctx: &TurnContext, state: &TurnState) -> Result<(), BridgeError>;
}

pub struct ContextInjector {
    sessions: Arc<SessionStore>,
    references: Arc<ReferenceCache>,
    registry: Arc<ConnectionRegistry>,
}

impl ContextInjector {
    pub fn new(
        sessions: Arc<SessionStore>,
        references: Arc<ReferenceCache>,
        registry: Arc<ConnectionRegistry>,
    ) -> Self {
        Self {
            sessions,
            references,
            registry,
        }
    }

    /// Build the turn's state. Each store is consulted on its own; no two
    /// locks are held together.
    pub fn inject(&self, ctx: &TurnContext) -> TurnState {
        let Some(identity) = ctx.identity() else {
            tracing::debug!(activity_type = %ctx.activity().kind, "Turn without identity, skipping injection");
            return TurnState::default();
        };

        self.references.put(&identity, ctx.reference().clone());
        let session = self.sessions.get_or_create(&identity);
        let emitter = match self.registry.lookup(&identity) {
            Some(conn) => Some(ScopedEmitter::new(conn)),
            None => {
                tracing::debug!(identity = %identity, "No live connection for turn");
                None
            }
        };

        TurnState {
            identity: Some(identity),
            session: Some(session),
            emitter,
        }
    }

    /// Inject, then run `handler`. Its result is returned unchanged.
    pub async fn on_turn(&self, ctx: &TurnContext, handler: &dyn TurnHandler) -> Result<(), BridgeError> {
        let state = self.inject(ctx);
        handler.on_turn(ctx, &state).await
    }
}

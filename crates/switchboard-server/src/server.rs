use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use switchboard_core::conversation::{Activity, ConversationAdapter, TurnContext};
use switchboard_core::errors::BridgeError;
use switchboard_core::ids::Identity;
use switchboard_core::task::TaskEngine;
use switchboard_store::{ReferenceCache, SessionStore};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::connection::{self, Connection, ConnectionRegistry};
use crate::dispatcher::EventDispatcher;
use crate::middleware::ContextInjector;
use crate::operator::{install_default_handlers, OperatorBot};
use crate::socket::handle_ws_connection;

/// Sent to the user when a conversational turn fails.
pub const TURN_ERROR_REPLY: &str = "The bot encountered an error or bug.";

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_send_queue: usize,
    /// Bot application id used when continuing conversations.
    pub app_id: String,
    pub cleanup_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3978,
            max_send_queue: 256,
            app_id: String::new(),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<EventDispatcher>,
    pub injector: Arc<ContextInjector>,
    pub bot: Arc<OperatorBot>,
    pub max_send_queue: usize,
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Wire the stores, dispatcher and bot around `adapter` and `engine`.
    pub fn new(
        config: &ServerConfig,
        adapter: Arc<dyn ConversationAdapter>,
        engine: Arc<dyn TaskEngine>,
        shutdown: CancellationToken,
    ) -> Self {
        let sessions = Arc::new(SessionStore::new());
        let references = Arc::new(ReferenceCache::new());
        let registry = Arc::new(ConnectionRegistry::new());

        let mut dispatcher = EventDispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&references),
            Arc::clone(&sessions),
            adapter,
            config.app_id.clone(),
        );
        install_default_handlers(&mut dispatcher, &sessions);
        let dispatcher = Arc::new(dispatcher);

        Self {
            injector: Arc::new(ContextInjector::new(sessions, references, registry)),
            bot: Arc::new(OperatorBot::new(Arc::clone(&dispatcher), engine)),
            dispatcher,
            max_send_queue: config.max_send_queue,
            shutdown,
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/messages", post(messages_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Create and start the server. Returns a handle to shut it down.
pub async fn start(
    config: ServerConfig,
    adapter: Arc<dyn ConversationAdapter>,
    engine: Arc<dyn TaskEngine>,
) -> Result<ServerHandle, std::io::Error> {
    let shutdown = CancellationToken::new();
    let state = AppState::new(&config, adapter, engine, shutdown.clone());
    let dispatcher = Arc::clone(&state.dispatcher);
    let bot = Arc::clone(&state.bot);

    let cleanup = connection::start_cleanup_task(
        Arc::clone(dispatcher.registry()),
        config.cleanup_interval,
        shutdown.clone(),
    );

    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(addr = %local_addr, "Switchboard server started");

    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        let serve = axum::serve(listener, router)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await });
        if let Err(e) = serve.await {
            tracing::error!(error = %e, "Server stopped with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        addr: local_addr,
        dispatcher,
        bot,
        shutdown,
        server,
        cleanup,
    })
}

/// Handle returned by `start()`. Keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    pub addr: SocketAddr,
    dispatcher: Arc<EventDispatcher>,
    bot: Arc<OperatorBot>,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
    cleanup: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    pub fn bot(&self) -> &Arc<OperatorBot> {
        &self.bot
    }

    /// Stop accepting requests, close open sockets and wait for the listener
    /// and cleanup task. Running tasks are not cancelled.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.server.await {
            tracing::warn!(error = %e, "Server task ended abnormally");
        }
        let _ = self.cleanup.await;
        tracing::info!(running_tasks = self.bot.running_tasks(), "Switchboard server stopped");
    }
}

#[derive(Debug, Default, Deserialize)]
struct HandshakeQuery {
    #[serde(default)]
    identity: Option<String>,
    #[serde(default, rename = "userAadId")]
    user_aad_id: Option<String>,
}

impl HandshakeQuery {
    /// `identity` wins when both are given and non-blank.
    fn identity(&self) -> Option<Identity> {
        Identity::parse(self.identity.as_deref()).or_else(|| Identity::parse(self.user_aad_id.as_deref()))
    }
}

/// WebSocket upgrade handler. The identity must be present before upgrading.
async fn ws_handler(
    Query(query): Query<HandshakeQuery>,
    State(state): State<AppState>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Some(identity) = query.identity() else {
        tracing::warn!("Rejected streaming handshake without identity");
        let body = serde_json::json!({ "error": BridgeError::RejectedConnection.to_string() });
        return (StatusCode::UNAUTHORIZED, Json(body)).into_response();
    };
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };
    ws.on_upgrade(move |socket| handle_socket(socket, identity, state))
        .into_response()
}

/// Connect handlers run on their own task so a slow replay never delays
/// reading inbound frames.
async fn handle_socket(socket: WebSocket, identity: Identity, state: AppState) {
    let (connection, rx) = Connection::new(state.max_send_queue);
    if !state
        .dispatcher
        .accept(Some(identity.as_str()), Arc::clone(&connection))
    {
        return;
    }

    let dispatcher = Arc::clone(&state.dispatcher);
    let accepted = Arc::clone(&connection);
    tokio::spawn(async move { dispatcher.run_connect_handlers(accepted).await });

    handle_ws_connection(
        socket,
        connection,
        rx,
        state.dispatcher,
        state.shutdown.child_token(),
    )
    .await;
}

/// Conversational channel webhook.
async fn messages_handler(State(state): State<AppState>, Json(activity): Json<Activity>) -> StatusCode {
    let ctx = TurnContext::new(Arc::clone(state.dispatcher.adapter()), activity);
    if let Err(e) = state.injector.on_turn(&ctx, state.bot.as_ref()).await {
        tracing::error!(
            activity_type = %ctx.activity().kind,
            error = %e,
            kind = e.error_kind(),
            "Unhandled turn error"
        );
        if let Err(e) = ctx.send_text(TURN_ERROR_REPLY).await {
            tracing::warn!(error = %e, "Failed to report turn error");
        }
    }
    StatusCode::OK
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "connections": state.dispatcher.registry().count(),
        "sessions": state.dispatcher.sessions().len(),
    }))
}

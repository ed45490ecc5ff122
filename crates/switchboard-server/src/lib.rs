//! Streaming side of the bridge and its HTTP surface.
//!
//! Web clients hold a WebSocket keyed by identity; the conversational channel
//! posts activities to `/api/messages`. The [`EventDispatcher`] joins the two.

pub mod adapter;
pub mod connection;
pub mod dispatcher;
pub mod engine;
pub mod middleware;
pub mod operator;
pub mod relay;
pub mod server;
pub mod socket;

pub use adapter::HttpConversationAdapter;
pub use connection::{Connection, ConnectionRegistry, ConnectionState, ScopedEmitter};
pub use dispatcher::{ConnectHandler, EventDispatcher, EventHandler};
pub use engine::CommandEngine;
pub use middleware::{ContextInjector, TurnHandler, TurnState};
pub use operator::{install_default_handlers, MessageLog, OperatorBot, StateReplay};
pub use relay::{ProgressRelay, StatusMessage};
pub use server::{start, AppState, ServerConfig, ServerHandle};

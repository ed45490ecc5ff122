/// Errors raised by the bridge between the conversational and streaming channels.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("connection rejected: missing identity")]
    RejectedConnection,

    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("handler for '{event}' failed: {message}")]
    Handler { event: String, message: String },

    #[error("adapter error: {0}")]
    Adapter(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BridgeError {
    pub fn handler(event: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Handler {
            event: event.into(),
            message: message.into(),
        }
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::RejectedConnection => "rejected_connection",
            Self::Delivery(_) => "delivery_failure",
            Self::Handler { .. } => "handler_failure",
            Self::Adapter(_) => "adapter_failure",
            Self::Serialization(_) => "serialization",
        }
    }
}

/// Failure of a long-running task. Always surfaced to the end user.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TaskError {
    #[error("failed to launch task: {0}")]
    Launch(String),

    #[error("{0}")]
    Failed(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl TaskError {
    /// Failure for a task whose code panicked instead of returning.
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        TaskError::Failed(format!("task panicked: {}", panic_message(payload)))
    }
}

/// Best-effort text of a caught panic payload.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl From<std::io::Error> for TaskError {
    fn from(e: std::io::Error) -> Self {
        TaskError::Io(e.to_string())
    }
}

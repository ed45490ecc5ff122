use serde::{Deserialize, Serialize};

/// Progress step of a running task (outbound) or free text from the web client (inbound).
pub const EVENT_MESSAGE: &str = "message";
/// Full step history, sent when a client connects.
pub const EVENT_INITIALIZE_STATE: &str = "initializeState";
/// Goal of a newly started task.
pub const EVENT_INITIALIZE_GOAL: &str = "initializeGoal";
/// The session was cleared for a new task.
pub const EVENT_RESET: &str = "reset";
/// Protocol error reported back to the client.
pub const EVENT_ERROR: &str = "error";

/// Unit of the streaming wire protocol, used in both directions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Frame {
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::new(
            EVENT_ERROR,
            serde_json::json!({ "code": code, "message": message.into() }),
        )
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_inbound_frame() {
        let frame: Frame = serde_json::from_str(r#"{"event":"message","data":"hello"}"#).unwrap();
        assert_eq!(frame.event, "message");
        assert_eq!(frame.data, serde_json::json!("hello"));
    }

    #[test]
    fn data_defaults_to_null() {
        let frame: Frame = serde_json::from_str(r#"{"event":"ping"}"#).unwrap();
        assert!(frame.data.is_null());
    }

    #[test]
    fn missing_event_is_rejected() {
        assert!(serde_json::from_str::<Frame>(r#"{"data":1}"#).is_err());
    }

    #[test]
    fn error_frame_shape() {
        let json = Frame::error("PARSE_ERROR", "bad json").to_json().unwrap();
        assert!(json.contains("\"event\":\"error\""));
        assert!(json.contains("\"code\":\"PARSE_ERROR\""));
    }
}

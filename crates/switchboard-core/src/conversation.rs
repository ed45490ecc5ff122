//! Conversational channel types and the adapter collaborator.
//!
//! Field names follow the Bot Framework activity schema (camelCase on the wire)
//! so inbound webhook payloads deserialize directly.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::errors::BridgeError;
use crate::ids::Identity;

pub const ACTIVITY_MESSAGE: &str = "message";
pub const ACTIVITY_CONVERSATION_UPDATE: &str = "conversationUpdate";
pub const ACTIVITY_EVENT: &str = "event";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelAccount {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aad_object_id: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationAccount {
    pub id: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<ChannelAccount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<ChannelAccount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation: Option<ConversationAccount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members_added: Vec<ChannelAccount>,
}

impl Activity {
    pub fn message(text: impl Into<String>) -> Self {
        Self {
            kind: ACTIVITY_MESSAGE.into(),
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn is_message(&self) -> bool {
        self.kind == ACTIVITY_MESSAGE
    }

    /// Sender identity from structured metadata.
    pub fn identity(&self) -> Option<Identity> {
        Identity::parse(self.from.as_ref().and_then(|f| f.aad_object_id.as_deref()))
    }

    /// Address this activity as an outbound message on `reference`'s conversation.
    pub fn addressed_to(mut self, reference: &ConversationReference) -> Self {
        self.conversation = Some(reference.conversation.clone());
        self.from = reference.bot.clone();
        self.recipient = reference.user.clone();
        self.channel_id = Some(reference.channel_id.clone());
        self.service_url = Some(reference.service_url.clone());
        if self.reply_to_id.is_none() {
            self.reply_to_id = reference.activity_id.clone();
        }
        self
    }
}

/// Everything needed to message a user outside of an inbound turn.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<ChannelAccount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot: Option<ChannelAccount>,
    #[serde(default)]
    pub conversation: ConversationAccount,
    #[serde(default)]
    pub channel_id: String,
    #[serde(default)]
    pub service_url: String,
}

impl ConversationReference {
    pub fn from_activity(activity: &Activity) -> Self {
        Self {
            activity_id: activity.id.clone(),
            user: activity.from.clone(),
            bot: activity.recipient.clone(),
            conversation: activity.conversation.clone().unwrap_or_default(),
            channel_id: activity.channel_id.clone().unwrap_or_default(),
            service_url: activity.service_url.clone().unwrap_or_default(),
        }
    }

    pub fn identity(&self) -> Option<Identity> {
        Identity::parse(self.user.as_ref().and_then(|u| u.aad_object_id.as_deref()))
    }

    /// Synthetic activity that opens a continued turn on this conversation.
    pub fn continuation_activity(&self) -> Activity {
        Activity {
            kind: ACTIVITY_EVENT.into(),
            from: self.user.clone(),
            recipient: self.bot.clone(),
            conversation: Some(self.conversation.clone()),
            channel_id: Some(self.channel_id.clone()),
            service_url: Some(self.service_url.clone()),
            reply_to_id: self.activity_id.clone(),
            ..Default::default()
        }
    }
}

/// Returned by the channel for every sent activity.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceResponse {
    #[serde(default)]
    pub id: String,
}

/// Work run inside a continued turn.
pub type ContinuationFn =
    Box<dyn FnOnce(TurnContext) -> BoxFuture<'static, Result<(), BridgeError>> + Send>;

/// The conversational channel protocol adapter.
#[async_trait]
pub trait ConversationAdapter: Send + Sync {
    /// Re-enter a fresh turn bound to `reference` and run `work` inside it.
    async fn continue_conversation(
        &self,
        reference: &ConversationReference,
        app_id: &str,
        work: ContinuationFn,
    ) -> Result<(), BridgeError>;

    async fn send_activity(
        &self,
        reference: &ConversationReference,
        activity: Activity,
    ) -> Result<ResourceResponse, BridgeError>;

    async fn update_activity(
        &self,
        reference: &ConversationReference,
        activity_id: &str,
        activity: Activity,
    ) -> Result<(), BridgeError>;
}

/// One turn on the conversational channel: the triggering activity plus the
/// adapter used to answer it.
#[derive(Clone)]
pub struct TurnContext {
    adapter: Arc<dyn ConversationAdapter>,
    activity: Activity,
    reference: ConversationReference,
}

impl TurnContext {
    pub fn new(adapter: Arc<dyn ConversationAdapter>, activity: Activity) -> Self {
        let reference = ConversationReference::from_activity(&activity);
        Self {
            adapter,
            activity,
            reference,
        }
    }

    /// Context for a turn resumed from a cached reference.
    pub fn continuation(adapter: Arc<dyn ConversationAdapter>, reference: ConversationReference) -> Self {
        Self {
            adapter,
            activity: reference.continuation_activity(),
            reference,
        }
    }

    pub fn activity(&self) -> &Activity {
        &self.activity
    }

    pub fn reference(&self) -> &ConversationReference {
        &self.reference
    }

    pub fn adapter(&self) -> &Arc<dyn ConversationAdapter> {
        &self.adapter
    }

    pub fn identity(&self) -> Option<Identity> {
        self.reference.identity()
    }

    pub async fn send_activity(&self, activity: Activity) -> Result<ResourceResponse, BridgeError> {
        self.adapter.send_activity(&self.reference, activity).await
    }

    pub async fn send_text(&self, text: impl Into<String> + Send) -> Result<ResourceResponse, BridgeError> {
        self.send_activity(Activity::message(text)).await
    }

    pub async fn update_activity(&self, activity_id: &str, activity: Activity) -> Result<(), BridgeError> {
        self.adapter
            .update_activity(&self.reference, activity_id, activity)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INBOUND: &str = r#"{
        "type": "message",
        "id": "1700000000",
        "text": "operator: find flights",
        "from": {"id": "29:abc", "name": "Ada", "aadObjectId": "aad-u1"},
        "recipient": {"id": "28:bot", "name": "Operator"},
        "conversation": {"id": "a:conv1"},
        "channelId": "msteams",
        "serviceUrl": "https://smba.example.net/emea/"
    }"#;

    #[test]
    fn inbound_activity_deserializes() {
        let activity: Activity = serde_json::from_str(INBOUND).unwrap();
        assert!(activity.is_message());
        assert_eq!(activity.text.as_deref(), Some("operator: find flights"));
        assert_eq!(activity.identity().unwrap().as_str(), "aad-u1");
    }

    #[test]
    fn reference_captures_conversation() {
        let activity: Activity = serde_json::from_str(INBOUND).unwrap();
        let reference = ConversationReference::from_activity(&activity);
        assert_eq!(reference.conversation.id, "a:conv1");
        assert_eq!(reference.channel_id, "msteams");
        assert_eq!(reference.bot.as_ref().unwrap().id, "28:bot");
        assert_eq!(reference.identity().unwrap().as_str(), "aad-u1");
    }

    #[test]
    fn identity_absent_without_aad_object_id() {
        let activity = Activity {
            kind: ACTIVITY_MESSAGE.into(),
            from: Some(ChannelAccount {
                id: "29:anon".into(),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(activity.identity().is_none());
    }

    #[test]
    fn addressed_to_swaps_sender_and_recipient() {
        let activity: Activity = serde_json::from_str(INBOUND).unwrap();
        let reference = ConversationReference::from_activity(&activity);
        let reply = Activity::message("hi").addressed_to(&reference);
        assert_eq!(reply.from.unwrap().id, "28:bot");
        assert_eq!(reply.recipient.unwrap().id, "29:abc");
        assert_eq!(reply.reply_to_id.as_deref(), Some("1700000000"));
        assert_eq!(reply.conversation.unwrap().id, "a:conv1");
    }

    #[test]
    fn outbound_serialization_uses_camel_case() {
        let json = serde_json::to_value(Activity::message("hi")).unwrap();
        assert_eq!(json["type"], "message");
        assert!(json.get("membersAdded").is_none());
        assert!(json.get("serviceUrl").is_none());
    }

    #[test]
    fn continuation_activity_keeps_user_as_sender() {
        let activity: Activity = serde_json::from_str(INBOUND).unwrap();
        let reference = ConversationReference::from_activity(&activity);
        let resumed = reference.continuation_activity();
        assert_eq!(resumed.kind, ACTIVITY_EVENT);
        assert_eq!(resumed.identity().unwrap().as_str(), "aad-u1");
    }
}

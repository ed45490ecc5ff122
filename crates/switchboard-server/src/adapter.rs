use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use switchboard_core::conversation::{
    Activity, ContinuationFn, ConversationAdapter, ConversationReference, ResourceResponse,
    TurnContext,
};
use switchboard_core::errors::BridgeError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Conversation adapter speaking the Bot Framework connector REST shape.
#[derive(Clone)]
pub struct HttpConversationAdapter {
    client: reqwest::Client,
}

impl Default for HttpConversationAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpConversationAdapter {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent("Switchboard/0.1")
            .build()
            .unwrap_or_default();
        Self { client }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

/// `{serviceUrl}/v3/conversations/{conversation}/activities[/{activity}]`
pub fn activities_url(
    reference: &ConversationReference,
    activity_id: Option<&str>,
) -> Result<Url, BridgeError> {
    if reference.service_url.is_empty() {
        return Err(BridgeError::Adapter("reference has no service url".into()));
    }
    let mut url = Url::parse(&reference.service_url)
        .map_err(|e| BridgeError::Adapter(format!("invalid service url: {e}")))?;
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| BridgeError::Adapter("service url cannot be a base".into()))?;
        segments
            .pop_if_empty()
            .extend(["v3", "conversations", reference.conversation.id.as_str(), "activities"]);
        if let Some(id) = activity_id {
            segments.push(id);
        }
    }
    Ok(url)
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, BridgeError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(BridgeError::Adapter(format!("HTTP {status}: {body}")))
}

#[async_trait]
impl ConversationAdapter for HttpConversationAdapter {
    async fn continue_conversation(
        &self,
        reference: &ConversationReference,
        app_id: &str,
        work: ContinuationFn,
    ) -> Result<(), BridgeError> {
        tracing::debug!(
            conversation = %reference.conversation.id,
            app_id = app_id,
            "Continuing conversation"
        );
        let ctx = TurnContext::continuation(Arc::new(self.clone()), reference.clone());
        work(ctx).await
    }

    async fn send_activity(
        &self,
        reference: &ConversationReference,
        activity: Activity,
    ) -> Result<ResourceResponse, BridgeError> {
        let url = activities_url(reference, None)?;
        let activity = activity.addressed_to(reference);
        let response = self
            .client
            .post(url)
            .json(&activity)
            .send()
            .await
            .map_err(|e| BridgeError::Adapter(format!("send failed: {e}")))?;
        let response = check(response).await?;
        // Some channels answer with an empty body.
        let body = response
            .bytes()
            .await
            .map_err(|e| BridgeError::Adapter(format!("failed to read response: {e}")))?;
        if body.is_empty() {
            return Ok(ResourceResponse::default());
        }
        Ok(serde_json::from_slice(&body)?)
    }

    async fn update_activity(
        &self,
        reference: &ConversationReference,
        activity_id: &str,
        activity: Activity,
    ) -> Result<(), BridgeError> {
        let url = activities_url(reference, Some(activity_id))?;
        let mut activity = activity.addressed_to(reference);
        activity.id = Some(activity_id.to_string());
        let response = self
            .client
            .put(url)
            .json(&activity)
            .send()
            .await
            .map_err(|e| BridgeError::Adapter(format!("update failed: {e}")))?;
        check(response).await?;
        Ok(())
    }
}

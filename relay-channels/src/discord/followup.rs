//! Interaction follow-up messages as an output surface.
//!
//! Replies to a deferred slash command go through the interaction webhook:
//! `POST /webhooks/{application_id}/{token}?wait=true` posts a message and
//! `PATCH /webhooks/{application_id}/{token}/messages/{id}` edits it.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::json;

use crate::traits::{DeliveryError, MessageHandle, OutputChannel};

/// Discord REST API base URL.
pub const DISCORD_API_BASE: &str = "https://discord.com/api/v10";

/// Message flag that hides a message from everyone but the invoking user.
const EPHEMERAL_FLAG: u64 = 1 << 6;

/// Interaction response type: acknowledge now, follow up later.
const DEFERRED_CHANNEL_MESSAGE: u64 = 5;

/// Longest rate-limit wait honoured before giving up on a call.
const MAX_RETRY_WAIT_MS: u64 = 5_000;

/// Follow-up surface for one interaction.
pub struct DiscordFollowup {
    client: Client,
    api_base: String,
    application_id: String,
    token: String,
    ephemeral: bool,
}

impl DiscordFollowup {
    pub fn new(
        client: Client,
        api_base: impl Into<String>,
        application_id: impl Into<String>,
        token: impl Into<String>,
        ephemeral: bool,
    ) -> Self {
        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            application_id: application_id.into(),
            token: token.into(),
            ephemeral,
        }
    }

    /// Acknowledge the interaction so follow-ups can be posted later.
    pub async fn defer(&self, interaction_id: &str) -> Result<(), DeliveryError> {
        let url = format!(
            "{}/interactions/{}/{}/callback",
            self.api_base, interaction_id, self.token
        );
        let mut body = json!({ "type": DEFERRED_CHANNEL_MESSAGE });
        if self.ephemeral {
            body["data"] = json!({ "flags": EPHEMERAL_FLAG });
        }

        self.execute(|| self.client.post(&url).json(&body)).await?;
        Ok(())
    }

    fn webhook_url(&self) -> String {
        format!(
            "{}/webhooks/{}/{}",
            self.api_base, self.application_id, self.token
        )
    }

    async fn execute<F>(&self, build: F) -> Result<Response, DeliveryError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut retried = false;

        loop {
            let response = build()
                .send()
                .await
                .map_err(|e| DeliveryError::Failed(format!("Discord request error: {e}")))?;

            match response.status() {
                status if status.is_success() => return Ok(response),
                StatusCode::NOT_FOUND => return Err(DeliveryError::NotFound),
                StatusCode::TOO_MANY_REQUESTS => {
                    let retry_after_ms = retry_after_ms(response).await;
                    if retried || retry_after_ms > MAX_RETRY_WAIT_MS {
                        return Err(DeliveryError::RateLimited { retry_after_ms });
                    }
                    tracing::debug!(retry_after_ms, "Discord rate limit hit, retrying once");
                    tokio::time::sleep(Duration::from_millis(retry_after_ms)).await;
                    retried = true;
                }
                status => {
                    let error = response.text().await.unwrap_or_default();
                    return Err(DeliveryError::Failed(format!(
                        "Discord API error ({status}): {error}"
                    )));
                }
            }
        }
    }
}

/// Read the retry delay from a 429 response, in milliseconds.
async fn retry_after_ms(response: Response) -> u64 {
    let header_secs = response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<f64>().ok());

    let body_secs = response
        .json::<serde_json::Value>()
        .await
        .ok()
        .and_then(|body| body.get("retry_after").and_then(serde_json::Value::as_f64));

    let secs = body_secs.or(header_secs).unwrap_or(1.0).max(0.0);
    (secs * 1000.0).ceil() as u64
}

#[async_trait]
impl OutputChannel for DiscordFollowup {
    fn name(&self) -> &'static str {
        "discord"
    }

    async fn send(&self, content: &str) -> Result<MessageHandle, DeliveryError> {
        let url = format!("{}?wait=true", self.webhook_url());
        let mut body = json!({ "content": content });
        if self.ephemeral {
            body["flags"] = json!(EPHEMERAL_FLAG);
        }

        let response = self.execute(|| self.client.post(&url).json(&body)).await?;

        let message: serde_json::Value = response
            .json()
            .await
            .map_err(|e| DeliveryError::Failed(format!("Failed to parse response: {e}")))?;

        message
            .get("id")
            .and_then(|id| id.as_str())
            .map(MessageHandle::new)
            .ok_or_else(|| DeliveryError::Failed("Discord response has no message id".into()))
    }

    async fn edit(&self, handle: &MessageHandle, content: &str) -> Result<(), DeliveryError> {
        let url = format!("{}/messages/{}", self.webhook_url(), handle);
        let body = json!({ "content": content });

        self.execute(|| self.client.patch(&url).json(&body)).await?;
        Ok(())
    }
}

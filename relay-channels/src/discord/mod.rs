//! Discord channel.
//!
//! Receives slash commands over the Gateway WebSocket and answers each one
//! through its interaction follow-up webhook. Commands are registered
//! globally at startup.

pub mod followup;
pub mod interaction;

pub use followup::{DiscordFollowup, DISCORD_API_BASE};
pub use interaction::{command_definitions, Interaction};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use reqwest::Client;
use serde_json::json;
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;

use relay_common::util::truncate_with_ellipsis;
use relay_common::DiscordConfig;

use crate::message::{ChannelType, InboundCommand, Requester};
use crate::traits::{Channel, ChannelError, ChannelResult, OutputChannel};

/// Gateway intents: GUILDS. Interactions are delivered regardless of intents.
const GATEWAY_INTENTS: u64 = 1;

const MAX_RECONNECT_BACKOFF: Duration = Duration::from_secs(60);

/// How a gateway session ended.
enum SessionEnd {
    /// Closed or asked to reconnect; connect again
    Reconnect,
    Shutdown,
}

/// Discord channel using Gateway WebSocket for slash command interactions.
pub struct DiscordChannel {
    bot_token: String,
    application_id: String,
    allowed_users: Vec<String>,
    ephemeral: bool,
    register_commands: bool,
    api_base: String,
    client: Client,
    connected: Arc<RwLock<bool>>,
}

impl DiscordChannel {
    /// Create a new Discord channel.
    pub fn new(config: &DiscordConfig) -> Self {
        Self {
            bot_token: config.bot_token.clone(),
            application_id: config.application_id.clone(),
            allowed_users: config.allowed_users.clone(),
            ephemeral: config.ephemeral,
            register_commands: config.register_commands,
            api_base: DISCORD_API_BASE.to_string(),
            client: Client::new(),
            connected: Arc::new(RwLock::new(false)),
        }
    }

    /// Point REST calls at another base URL.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    /// Check if a Discord user ID is in the allowlist.
    pub fn is_user_allowed(&self, user_id: &str) -> bool {
        self.allowed_users.iter().any(|u| u == "*" || u == user_id)
    }

    /// Register (overwrite) the global slash commands.
    pub async fn register_slash_commands(&self) -> ChannelResult<()> {
        let url = format!(
            "{}/applications/{}/commands",
            self.api_base, self.application_id
        );

        let resp = self
            .client
            .put(&url)
            .header("Authorization", format!("Bot {}", self.bot_token))
            .json(&command_definitions())
            .send()
            .await
            .map_err(|e| ChannelError::Connection(format!("Failed to register commands: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let error = resp.text().await.unwrap_or_default();
            return Err(ChannelError::Internal(format!(
                "Discord API error ({status}): {error}"
            )));
        }

        tracing::info!("Discord: slash commands registered");
        Ok(())
    }

    fn followup(&self, token: &str) -> DiscordFollowup {
        DiscordFollowup::new(
            self.client.clone(),
            self.api_base.clone(),
            self.application_id.clone(),
            token,
            self.ephemeral,
        )
    }

    /// Acknowledge an interaction and hand it to `callback`.
    fn spawn_interaction<F>(&self, interaction: Interaction, callback: Arc<F>)
    where
        F: Fn(InboundCommand) + Send + Sync + 'static,
    {
        let followup = Arc::new(self.followup(&interaction.token));
        let allowed = self.is_user_allowed(&interaction.user_id);

        tokio::spawn(async move {
            if let Err(e) = followup.defer(&interaction.id).await {
                tracing::warn!(
                    user_id = %interaction.user_id,
                    error = %e,
                    "Discord: failed to acknowledge interaction"
                );
                return;
            }

            if !allowed {
                tracing::warn!(
                    "Discord: ignoring command from unauthorized user: {}",
                    interaction.user_id
                );
                if let Err(e) = followup
                    .send("⛔ You are not allowed to use this bot.")
                    .await
                {
                    tracing::debug!(error = %e, "Discord: failed to send refusal");
                }
                return;
            }

            let command = match interaction.command {
                Ok(command) => command,
                Err(usage) => {
                    if let Err(e) = followup.send(&usage).await {
                        tracing::debug!(error = %e, "Discord: failed to send usage");
                    }
                    return;
                }
            };

            let mut requester =
                Requester::new(interaction.user_id, interaction.username, ChannelType::Discord);
            if let Some(guild_id) = interaction.guild_id {
                requester = requester.with_guild(guild_id);
            }

            let output: Arc<dyn OutputChannel> = followup;
            callback(InboundCommand::new(requester, command, output));
        });
    }

    /// Run one gateway session until it closes.
    async fn run_gateway<F>(&self, callback: &Arc<F>) -> ChannelResult<SessionEnd>
    where
        F: Fn(InboundCommand) + Send + Sync + 'static,
    {
        // Get Gateway URL
        let gw_resp: serde_json::Value = self
            .client
            .get(format!("{}/gateway/bot", self.api_base))
            .header("Authorization", format!("Bot {}", self.bot_token))
            .send()
            .await
            .map_err(|e| ChannelError::Connection(format!("Failed to get gateway: {e}")))?
            .json()
            .await
            .map_err(|e| ChannelError::Connection(format!("Invalid gateway response: {e}")))?;

        let gw_url = gw_resp
            .get("url")
            .and_then(|u| u.as_str())
            .unwrap_or("wss://gateway.discord.gg");

        let ws_url = format!("{gw_url}/?v=10&encoding=json");
        tracing::info!("Discord: connecting to gateway...");

        let (ws_stream, _) = tokio_tungstenite::connect_async(&ws_url)
            .await
            .map_err(|e| ChannelError::Connection(format!("WebSocket connection failed: {e}")))?;

        let (mut write, mut read) = ws_stream.split();

        // Read Hello (opcode 10)
        let hello = read
            .next()
            .await
            .ok_or_else(|| ChannelError::Connection("No hello from gateway".into()))?
            .map_err(|e| ChannelError::Connection(format!("WebSocket error: {e}")))?;

        let hello_data: serde_json::Value = serde_json::from_str(&hello.to_string())
            .map_err(|e| ChannelError::Connection(format!("Invalid hello: {e}")))?;

        let heartbeat_interval = hello_data
            .get("d")
            .and_then(|d| d.get("heartbeat_interval"))
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(41250);

        // Send Identify (opcode 2)
        let identify = json!({
            "op": 2,
            "d": {
                "token": self.bot_token,
                "intents": GATEWAY_INTENTS,
                "properties": {
                    "os": std::env::consts::OS,
                    "browser": "ollama-relay",
                    "device": "ollama-relay"
                }
            }
        });

        write
            .send(Message::Text(identify.to_string()))
            .await
            .map_err(|e| ChannelError::Connection(format!("Failed to identify: {e}")))?;

        tracing::info!("Discord: connected and identified");

        let mut heartbeat = tokio::time::interval(Duration::from_millis(heartbeat_interval));
        let mut last_sequence: Option<u64> = None;

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    let hb = json!({"op": 1, "d": last_sequence});
                    if write.send(Message::Text(hb.to_string())).await.is_err() {
                        return Ok(SessionEnd::Reconnect);
                    }
                }
                msg = read.next() => {
                    let msg = match msg {
                        Some(Ok(Message::Text(t))) => t,
                        Some(Ok(Message::Close(frame))) => {
                            tracing::info!(?frame, "Discord: gateway closed the connection");
                            return Ok(SessionEnd::Reconnect);
                        }
                        None => return Ok(SessionEnd::Reconnect),
                        Some(Err(e)) => {
                            return Err(ChannelError::Connection(format!("WebSocket error: {e}")));
                        }
                        _ => continue,
                    };

                    let event: serde_json::Value = match serde_json::from_str(&msg) {
                        Ok(e) => e,
                        Err(_) => continue,
                    };

                    if let Some(seq) = event.get("s").and_then(serde_json::Value::as_u64) {
                        last_sequence = Some(seq);
                    }

                    match event.get("op").and_then(serde_json::Value::as_u64) {
                        // Heartbeat request
                        Some(1) => {
                            let hb = json!({"op": 1, "d": last_sequence});
                            if write.send(Message::Text(hb.to_string())).await.is_err() {
                                return Ok(SessionEnd::Reconnect);
                            }
                            continue;
                        }
                        // Reconnect / invalid session
                        Some(7) | Some(9) => {
                            tracing::info!("Discord: gateway requested a new session");
                            return Ok(SessionEnd::Reconnect);
                        }
                        _ => {}
                    }

                    if !*self.connected.read().await {
                        return Ok(SessionEnd::Shutdown);
                    }

                    let event_type = event.get("t").and_then(|t| t.as_str()).unwrap_or("");
                    if event_type != "INTERACTION_CREATE" {
                        continue;
                    }

                    let Some(d) = event.get("d") else {
                        continue;
                    };

                    let Some(interaction) = Interaction::from_gateway(d) else {
                        continue;
                    };

                    let summary = match &interaction.command {
                        Ok(command) => truncate_with_ellipsis(&format!("{command:?}"), 120),
                        Err(_) => "invalid".to_string(),
                    };
                    tracing::info!(
                        channel = "discord",
                        user_id = %interaction.user_id,
                        guild_id = interaction.guild_id.as_deref().unwrap_or("DM"),
                        command = %summary,
                        "Slash command received"
                    );

                    self.spawn_interaction(interaction, callback.clone());
                }
            }
        }
    }
}

#[async_trait]
impl Channel for DiscordChannel {
    fn name(&self) -> &'static str {
        "discord"
    }

    async fn init(&mut self) -> ChannelResult<()> {
        // Verify token by calling auth endpoint
        let resp = self
            .client
            .get(format!("{}/users/@me", self.api_base))
            .header("Authorization", format!("Bot {}", self.bot_token))
            .send()
            .await
            .map_err(|e| ChannelError::Auth(format!("Failed to verify Discord token: {e}")))?;

        if !resp.status().is_success() {
            return Err(ChannelError::Auth("Invalid Discord bot token".into()));
        }

        if self.register_commands {
            self.register_slash_commands().await?;
        }

        *self.connected.write().await = true;
        tracing::info!("Discord channel initialized");
        Ok(())
    }

    async fn listen<F>(&self, callback: F) -> ChannelResult<()>
    where
        F: Fn(InboundCommand) + Send + Sync + 'static,
    {
        let callback = Arc::new(callback);
        let mut backoff = Duration::from_secs(1);

        while *self.connected.read().await {
            match self.run_gateway(&callback).await {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::Reconnect) => backoff = Duration::from_secs(1),
                Err(e) => {
                    tracing::warn!(error = %e, backoff_secs = backoff.as_secs(), "Discord: gateway session failed");
                    backoff = (backoff * 2).min(MAX_RECONNECT_BACKOFF);
                }
            }

            if !*self.connected.read().await {
                break;
            }
            tokio::time::sleep(backoff).await;
        }

        Ok(())
    }

    async fn health_check(&self) -> ChannelResult<()> {
        let resp = self
            .client
            .get(format!("{}/users/@me", self.api_base))
            .header("Authorization", format!("Bot {}", self.bot_token))
            .send()
            .await
            .map_err(|e| ChannelError::Connection(format!("Health check failed: {e}")))?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(ChannelError::Auth("Discord authentication failed".into()))
        }
    }

    async fn shutdown(&self) -> ChannelResult<()> {
        *self.connected.write().await = false;
        tracing::info!("Discord channel shutdown");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(allowed_users: Vec<String>) -> DiscordChannel {
        DiscordChannel::new(&DiscordConfig {
            enabled: true,
            bot_token: "fake".into(),
            application_id: "app".into(),
            allowed_users,
            ..Default::default()
        })
    }

    #[test]
    fn discord_channel_name() {
        assert_eq!(channel(vec![]).name(), "discord");
    }

    #[test]
    fn empty_allowlist_denies_everyone() {
        let ch = channel(vec![]);
        assert!(!ch.is_user_allowed("12345"));
    }

    #[test]
    fn wildcard_allows_everyone() {
        let ch = channel(vec!["*".into()]);
        assert!(ch.is_user_allowed("12345"));
    }

    #[test]
    fn specific_allowlist_filters() {
        let ch = channel(vec!["111".into(), "222".into()]);
        assert!(ch.is_user_allowed("111"));
        assert!(!ch.is_user_allowed("333"));
    }

    #[test]
    fn api_base_override_trims_slash() {
        let ch = channel(vec![]).with_api_base("http://127.0.0.1:9999/api/");
        assert_eq!(ch.api_base, "http://127.0.0.1:9999/api");
    }
}

//! Relay Channels - stream Ollama generations into chat messages.
//!
//! Users talk to a local Ollama server through Discord slash commands or the
//! terminal. Each user keeps their own model, system prompt and conversation.
//! Responses stream into size-limited messages that are edited in place as
//! text arrives.
//!
//! ## Architecture
//!
//! ```text
//! Discord / CLI ─▶ InboundCommand ─▶ CommandHandler ─▶ SessionCoordinator ─▶ Ollama
//!                                                             │
//!       chat messages ◀── ChunkedMessageDeliverer ◀── StreamAggregator
//! ```

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod activity;
pub mod aggregator;
pub mod backend;
pub mod cli;
pub mod commands;
pub mod coordinator;
pub mod deliverer;
pub mod discord;
pub mod message;
pub mod store;
pub mod traits;

// Re-export commonly used types
pub use activity::{ActivityEntry, ActivityLogger, InteractionStatus};
pub use aggregator::{split_into_chunks, StreamAggregator};
pub use backend::{
    BackendError, ContinuationToken, GenerateRequest, GenerationChunk, GenerationStream,
    ModelBackend, OllamaClient,
};
pub use cli::{CliChannel, CliOutput};
pub use commands::{Command, CommandHandler};
pub use coordinator::{
    ChatRequest, GenerationReport, GenerationStatus, SessionCoordinator, SessionError,
};
pub use deliverer::{ChunkedMessageDeliverer, DeliveredMessage, Reconciliation};
pub use discord::{DiscordChannel, DiscordFollowup};
pub use message::{ChannelType, InboundCommand, Requester};
pub use store::{ConversationStore, ConversationTurn, GenerationState, Role, UserSession};
pub use traits::{Channel, ChannelError, ChannelResult, DeliveryError, MessageHandle, OutputChannel};

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::Instrument;

use relay_common::config::{Config, OllamaConfig};

/// Pick the model new sessions start on.
///
/// Keeps the configured default when the backend has it. Otherwise, when
/// auto-selection is on, falls back to the first installed model.
pub async fn resolve_default_model(backend: &dyn ModelBackend, config: &OllamaConfig) -> String {
    let models = match backend.list_models().await {
        Ok(models) => models,
        Err(e) => {
            tracing::warn!(error = %e, "Could not list models, keeping configured default");
            return config.default_model.clone();
        }
    };

    tracing::info!(count = models.len(), "Found Ollama models");

    if models.iter().any(|m| *m == config.default_model) || !config.auto_select_model {
        return config.default_model.clone();
    }

    match models.first() {
        Some(first) => {
            tracing::info!(
                configured = %config.default_model,
                selected = %first,
                "Configured default model not installed, using the first available"
            );
            first.clone()
        }
        None => {
            tracing::warn!("No models installed. Pull one with `ollama pull <model>`");
            config.default_model.clone()
        }
    }
}

/// Consume inbound commands, running each in its own task.
pub fn spawn_processor(
    handler: Arc<CommandHandler>,
    mut rx: mpsc::Receiver<InboundCommand>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(inbound) = rx.recv().await {
            let handler = handler.clone();
            let span = relay_common::channel_span!(
                inbound.requester.channel.as_str(),
                inbound.trace_id,
                inbound.requester.user_id,
                command = inbound.command.name()
            );
            tokio::spawn(
                async move {
                    handler
                        .dispatch(&inbound.requester, inbound.command, inbound.output)
                        .await;
                }
                .instrument(span),
            );
        }
    })
}

fn forwarder(tx: mpsc::Sender<InboundCommand>) -> impl Fn(InboundCommand) + Send + Sync + 'static {
    move |inbound| {
        if let Err(e) = tx.try_send(inbound) {
            tracing::warn!(error = %e, "Dropping command, processor queue unavailable");
        }
    }
}

/// Start the relay with every enabled channel. Returns when all channels
/// stop or on Ctrl-C.
pub async fn start(config: &Config) -> anyhow::Result<()> {
    if !config.discord_enabled() && !config.cli_enabled() {
        anyhow::bail!("No channels enabled. Enable channels.discord or channels.cli in the config");
    }

    let backend: Arc<dyn ModelBackend> = Arc::new(OllamaClient::from_config(&config.llm.ollama));

    if backend.check_connection().await {
        tracing::info!(base_url = %config.llm.ollama.base_url, "Connected to Ollama");
    } else {
        tracing::warn!(
            base_url = %config.llm.ollama.base_url,
            "Cannot reach Ollama. Make sure it is running (`ollama serve`)"
        );
    }

    let default_model = resolve_default_model(backend.as_ref(), &config.llm.ollama).await;
    tracing::info!(model = %default_model, "Default model");

    let store = Arc::new(ConversationStore::new(
        default_model,
        config.session.max_history_entries,
    ));
    let coordinator = Arc::new(SessionCoordinator::new(
        store,
        backend,
        config.streaming.clone(),
    ));
    let activity = Arc::new(ActivityLogger::new(config.activity_log.clone()));
    let handler = Arc::new(CommandHandler::new(coordinator, activity));

    let (tx, rx) = mpsc::channel::<InboundCommand>(256);
    let processor_handle = spawn_processor(handler, rx);

    let mut channel_handles = Vec::new();

    if let Some(discord_config) = config.channels.discord.as_ref().filter(|d| d.enabled) {
        let mut discord = DiscordChannel::new(discord_config);
        discord.init().await?;
        let callback = forwarder(tx.clone());
        channel_handles.push(tokio::spawn(async move {
            if let Err(e) = discord.listen(callback).await {
                tracing::error!(error = %e, "Discord channel stopped");
            }
        }));
    }

    if let Some(cli_config) = config.channels.cli.as_ref().filter(|c| c.enabled) {
        let cli = CliChannel::new(cli_config.user_id.clone());
        let callback = forwarder(tx.clone());
        channel_handles.push(tokio::spawn(async move {
            if let Err(e) = cli.listen(callback).await {
                tracing::error!(error = %e, "CLI channel stopped");
            }
        }));
    }

    drop(tx);

    tracing::info!(channels = channel_handles.len(), "Relay started");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown requested");
        }
        _ = futures_util::future::join_all(channel_handles.iter_mut()) => {
            tracing::info!("All channels stopped");
        }
    }

    for handle in &channel_handles {
        handle.abort();
    }
    processor_handle.abort();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct FixedModels(Result<Vec<String>, BackendError>);

    #[async_trait]
    impl ModelBackend for FixedModels {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn generate(&self, _request: GenerateRequest) -> Result<GenerationStream, BackendError> {
            Err(BackendError::Unavailable("not used".into()))
        }

        async fn list_models(&self) -> Result<Vec<String>, BackendError> {
            self.0.clone()
        }

        async fn check_connection(&self) -> bool {
            true
        }
    }

    fn ollama_config(default_model: &str, auto_select_model: bool) -> OllamaConfig {
        OllamaConfig {
            default_model: default_model.into(),
            auto_select_model,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_default_model_kept_when_installed() {
        let backend = FixedModels(Ok(vec!["mistral".into(), "llama3".into()]));
        let model = resolve_default_model(&backend, &ollama_config("llama3", true)).await;
        assert_eq!(model, "llama3");
    }

    #[tokio::test]
    async fn test_first_model_selected_when_default_missing() {
        let backend = FixedModels(Ok(vec!["mistral".into(), "phi3".into()]));
        let model = resolve_default_model(&backend, &ollama_config("llama3", true)).await;
        assert_eq!(model, "mistral");
    }

    #[tokio::test]
    async fn test_auto_select_disabled() {
        let backend = FixedModels(Ok(vec!["mistral".into()]));
        let model = resolve_default_model(&backend, &ollama_config("llama3", false)).await;
        assert_eq!(model, "llama3");
    }

    #[tokio::test]
    async fn test_backend_down_keeps_default() {
        let backend = FixedModels(Err(BackendError::Unavailable("down".into())));
        let model = resolve_default_model(&backend, &ollama_config("llama3", true)).await;
        assert_eq!(model, "llama3");
    }
}

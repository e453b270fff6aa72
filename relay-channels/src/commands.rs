//! User commands and their handling.
//!
//! Both channels speak the same command set. Discord delivers them as slash
//! commands; the CLI parses `/name args` lines, treating bare text as `chat`.

use std::sync::Arc;

use crate::activity::{ActivityLogger, InteractionStatus};
use crate::aggregator::split_into_chunks;
use crate::coordinator::{ChatRequest, GenerationStatus, SessionCoordinator, SessionError};
use crate::message::Requester;
use crate::traits::OutputChannel;

/// A user command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Generate a response
    Chat { message: String },
    /// Select another model; resets the conversation
    SwitchModel { model: String },
    ListModels,
    CurrentModel,
    /// Set the system prompt, or clear it with `None`; resets the conversation
    SystemPrompt { prompt: Option<String> },
    ClearContext,
    /// Stop the running generation
    Cancel,
    Help,
}

impl Command {
    /// Command names, as registered on Discord.
    pub const NAMES: [&'static str; 8] = [
        "chat",
        "switch_model",
        "list_models",
        "current_model",
        "system_prompt",
        "clear_context",
        "cancel",
        "help",
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Chat { .. } => "chat",
            Self::SwitchModel { .. } => "switch_model",
            Self::ListModels => "list_models",
            Self::CurrentModel => "current_model",
            Self::SystemPrompt { .. } => "system_prompt",
            Self::ClearContext => "clear_context",
            Self::Cancel => "cancel",
            Self::Help => "help",
        }
    }

    /// Build a command from its name and single optional argument.
    pub fn from_parts(name: &str, argument: Option<&str>) -> Result<Self, String> {
        let argument = argument.map(str::trim).filter(|a| !a.is_empty());

        match name {
            "chat" => argument
                .map(|message| Self::Chat {
                    message: message.to_string(),
                })
                .ok_or_else(|| "Usage: /chat <message>".to_string()),
            "switch_model" => argument
                .map(|model| Self::SwitchModel {
                    model: model.to_string(),
                })
                .ok_or_else(|| "Usage: /switch_model <model_name>".to_string()),
            "list_models" => Ok(Self::ListModels),
            "current_model" => Ok(Self::CurrentModel),
            "system_prompt" => Ok(Self::SystemPrompt {
                prompt: argument.map(str::to_string),
            }),
            "clear_context" => Ok(Self::ClearContext),
            "cancel" => Ok(Self::Cancel),
            "help" => Ok(Self::Help),
            other => Err(format!("Unknown command: /{other}. Try /help.")),
        }
    }

    /// Parse a CLI line. Returns `None` for blank input.
    pub fn parse_cli(line: &str) -> Option<Result<Self, String>> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let Some(rest) = line.strip_prefix('/') else {
            return Some(Ok(Self::Chat {
                message: line.to_string(),
            }));
        };

        let (name, argument) = match rest.split_once(char::is_whitespace) {
            Some((name, argument)) => (name, Some(argument)),
            None => (rest, None),
        };

        Some(Self::from_parts(name, argument))
    }
}

/// Help text listing every command.
pub const HELP_TEXT: &str = "**Ollama Relay Commands:**\n\n\
**/chat <message>** - Chat with the current model\n\
**/switch_model <model_name>** - Switch to a different model\n\
**/list_models** - List all available models\n\
**/current_model** - Show your current model and settings\n\
**/system_prompt [prompt]** - Set a system prompt (leave empty to clear)\n\
**/clear_context** - Clear conversation history\n\
**/cancel** - Stop the response being generated\n\
**/help** - Show this help message\n\n\
Each user has their own model selection and conversation context.";

/// Executes commands against the coordinator.
pub struct CommandHandler {
    coordinator: Arc<SessionCoordinator>,
    activity: Arc<ActivityLogger>,
}

impl CommandHandler {
    pub fn new(coordinator: Arc<SessionCoordinator>, activity: Arc<ActivityLogger>) -> Self {
        Self {
            coordinator,
            activity,
        }
    }

    pub fn coordinator(&self) -> &Arc<SessionCoordinator> {
        &self.coordinator
    }

    /// Run a command and post its reply to `output`.
    pub async fn dispatch(
        &self,
        requester: &Requester,
        command: Command,
        output: Arc<dyn OutputChannel>,
    ) {
        if let Some(reply) = self.handle(requester, command, output.clone()).await {
            send_reply(output.as_ref(), &reply, self.max_chunk_size()).await;
        }
    }

    /// Run a command. Returns the reply text, or `None` when the command
    /// already delivered its output (a streamed chat).
    pub async fn handle(
        &self,
        requester: &Requester,
        command: Command,
        output: Arc<dyn OutputChannel>,
    ) -> Option<String> {
        let user_id = requester.user_id.as_str();

        tracing::info!(
            user_id = %user_id,
            channel = %requester.channel,
            command = command.name(),
            "Handling command"
        );

        match command {
            Command::Chat { message } => self.chat(requester, message, output).await,
            Command::SwitchModel { model } => Some(self.switch_model(user_id, &model).await),
            Command::ListModels => Some(self.list_models(user_id).await),
            Command::CurrentModel => Some(self.current_model(user_id)),
            Command::SystemPrompt { prompt } => Some(self.system_prompt(user_id, prompt)),
            Command::ClearContext => Some(self.clear_context(user_id)),
            Command::Cancel => Some(self.cancel(user_id).await),
            Command::Help => Some(HELP_TEXT.to_string()),
        }
    }

    fn max_chunk_size(&self) -> usize {
        self.coordinator.settings().max_chunk_size
    }

    async fn chat(
        &self,
        requester: &Requester,
        message: String,
        output: Arc<dyn OutputChannel>,
    ) -> Option<String> {
        let request = ChatRequest::new(requester.user_id.as_str(), message.as_str());

        match self.coordinator.start(request, output).await {
            Ok(report) => {
                let status = match report.status {
                    GenerationStatus::Completed => InteractionStatus::Success,
                    GenerationStatus::Cancelled => InteractionStatus::Cancelled,
                };
                self.activity
                    .log_interaction(requester, &report.model, &message, &report.response, status);
                None
            }
            Err(SessionError::SessionBusy) => Some(
                "⏳ A response is still being generated for you. Wait for it to finish or use /cancel."
                    .to_string(),
            ),
            Err(SessionError::BackendUnavailable(e)) => {
                let model = self.coordinator.session(&requester.user_id).model_name;
                self.activity
                    .log_error(requester, &model, &message, &e.to_string());
                Some(format!("❌ Error: {e}"))
            }
            Err(SessionError::BackendStream { source, model, .. }) => {
                // The partial response and error note are already posted.
                self.activity
                    .log_error(requester, &model, &message, &source.to_string());
                None
            }
        }
    }

    async fn switch_model(&self, user_id: &str, model: &str) -> String {
        let models = match self.coordinator.backend().list_models().await {
            Ok(models) if !models.is_empty() => models,
            Ok(_) => {
                return "❌ Could not retrieve models from Ollama. Make sure Ollama is running."
                    .to_string()
            }
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "Failed to list models for switch");
                return "❌ Could not retrieve models from Ollama. Make sure Ollama is running."
                    .to_string();
            }
        };

        if !models.iter().any(|m| m == model) {
            let available = models
                .iter()
                .map(|m| format!("• {m}"))
                .collect::<Vec<_>>()
                .join("\n");
            return format!("❌ Model '{model}' not found.\n\n**Available models:**\n{available}");
        }

        self.coordinator.set_model(user_id, model);
        self.coordinator.clear_history(user_id);

        format!("✓ Switched to model: **{model}**\nConversation context has been reset.")
    }

    async fn list_models(&self, user_id: &str) -> String {
        let models = match self.coordinator.backend().list_models().await {
            Ok(models) if !models.is_empty() => models,
            Ok(_) => {
                return "❌ No models found. Make sure Ollama is running and you have pulled at least one model.\n\nPull a model with: `ollama pull llama3`"
                    .to_string()
            }
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "Failed to list models");
                return "❌ Could not retrieve models from Ollama. Make sure Ollama is running."
                    .to_string();
            }
        };

        let current = self.coordinator.session(user_id).model_name;
        let list = models
            .iter()
            .map(|m| {
                if *m == current {
                    format!("➤ **{m}** (current)")
                } else {
                    format!("• {m}")
                }
            })
            .collect::<Vec<_>>()
            .join("\n");

        format!("**Available Ollama Models:**\n{list}\n\n(➤ = currently selected)")
    }

    fn current_model(&self, user_id: &str) -> String {
        let session = self.coordinator.session(user_id);
        let system_prompt = session
            .system_prompt
            .as_deref()
            .map(|p| format!("```{p}```"))
            .unwrap_or_else(|| "None".to_string());
        let context = if session.has_context() {
            "Active"
        } else {
            "Empty"
        };

        format!(
            "**Current Settings:**\n• Model: **{}**\n• System Prompt: {}\n• Conversation Context: {}",
            session.model_name, system_prompt, context
        )
    }

    fn system_prompt(&self, user_id: &str, prompt: Option<String>) -> String {
        self.coordinator.set_system_prompt(user_id, prompt.as_deref());
        self.coordinator.clear_history(user_id);

        match prompt {
            Some(prompt) => format!(
                "✓ System prompt set to:\n```{prompt}```\nConversation context has been reset."
            ),
            None => "✓ System prompt cleared. Using model defaults.\nConversation context has been reset."
                .to_string(),
        }
    }

    fn clear_context(&self, user_id: &str) -> String {
        if self.coordinator.clear_history(user_id) {
            "✓ Conversation context cleared. Starting fresh!".to_string()
        } else {
            "ℹ️ Your conversation context is already empty.".to_string()
        }
    }

    async fn cancel(&self, user_id: &str) -> String {
        if self.coordinator.cancel(user_id).await {
            "⏹ Generation cancelled.".to_string()
        } else {
            "ℹ️ Nothing is being generated right now.".to_string()
        }
    }
}

/// Post a reply, split to fit the platform limit.
pub async fn send_reply(output: &dyn OutputChannel, text: &str, max_chars: usize) {
    for chunk in split_into_chunks(text, max_chars) {
        if let Err(e) = output.send(&chunk).await {
            tracing::warn!(output = output.name(), error = %e, "Failed to send reply");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_text_is_chat() {
        assert_eq!(
            Command::parse_cli("  hello there "),
            Some(Ok(Command::Chat {
                message: "hello there".into()
            }))
        );
    }

    #[test]
    fn test_parse_blank_line() {
        assert_eq!(Command::parse_cli("   "), None);
    }

    #[test]
    fn test_parse_command_with_argument() {
        assert_eq!(
            Command::parse_cli("/switch_model mistral:7b"),
            Some(Ok(Command::SwitchModel {
                model: "mistral:7b".into()
            }))
        );
        assert_eq!(
            Command::parse_cli("/system_prompt You are a pirate."),
            Some(Ok(Command::SystemPrompt {
                prompt: Some("You are a pirate.".into())
            }))
        );
    }

    #[test]
    fn test_parse_system_prompt_without_argument_clears() {
        assert_eq!(
            Command::parse_cli("/system_prompt"),
            Some(Ok(Command::SystemPrompt { prompt: None }))
        );
    }

    #[test]
    fn test_parse_missing_required_argument() {
        assert!(matches!(Command::parse_cli("/chat"), Some(Err(ref e)) if e.contains("Usage")));
        assert!(matches!(Command::parse_cli("/switch_model  "), Some(Err(_))));
    }

    #[test]
    fn test_parse_unknown_command() {
        assert!(matches!(Command::parse_cli("/dance"), Some(Err(ref e)) if e.contains("/dance")));
    }

    #[test]
    fn test_names_cover_every_command() {
        for name in Command::NAMES {
            let command = Command::from_parts(name, Some("x")).unwrap();
            assert_eq!(command.name(), name);
        }
    }

    #[test]
    fn test_help_mentions_every_command() {
        for name in Command::NAMES {
            assert!(HELP_TEXT.contains(&format!("/{name}")), "missing /{name}");
        }
    }
}

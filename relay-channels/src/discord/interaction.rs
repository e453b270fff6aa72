//! Slash command interactions.

use serde_json::{json, Value};

use crate::commands::Command;

/// Gateway interaction type for application (slash) commands.
const APPLICATION_COMMAND: u64 = 2;

/// Discord option type for string arguments.
const STRING_OPTION: u64 = 3;

/// A slash command invocation received over the gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct Interaction {
    pub id: String,
    /// Interaction token; authorizes the follow-up webhook
    pub token: String,
    pub user_id: String,
    pub username: String,
    pub guild_id: Option<String>,
    /// Parsed command, or a usage message to show the user
    pub command: Result<Command, String>,
}

impl Interaction {
    /// Parse the `d` payload of an `INTERACTION_CREATE` event.
    ///
    /// Returns `None` for interactions that are not slash commands.
    pub fn from_gateway(d: &Value) -> Option<Self> {
        if d.get("type").and_then(Value::as_u64) != Some(APPLICATION_COMMAND) {
            return None;
        }

        let id = d.get("id").and_then(Value::as_str)?.to_string();
        let token = d.get("token").and_then(Value::as_str)?.to_string();

        // Guild invocations nest the user under `member`; DMs carry it directly.
        let user = d
            .get("member")
            .and_then(|m| m.get("user"))
            .or_else(|| d.get("user"))?;
        let user_id = user.get("id").and_then(Value::as_str)?.to_string();
        let username = user
            .get("global_name")
            .and_then(Value::as_str)
            .or_else(|| user.get("username").and_then(Value::as_str))
            .unwrap_or("unknown")
            .to_string();

        let guild_id = d
            .get("guild_id")
            .and_then(Value::as_str)
            .map(str::to_string);

        let data = d.get("data")?;
        let name = data.get("name").and_then(Value::as_str)?;
        let argument = data
            .get("options")
            .and_then(Value::as_array)
            .and_then(|options| options.first())
            .and_then(|option| option.get("value"))
            .and_then(Value::as_str);

        Some(Self {
            id,
            token,
            user_id,
            username,
            guild_id,
            command: Command::from_parts(name, argument),
        })
    }
}

/// Slash command definitions for bulk registration.
pub fn command_definitions() -> Value {
    let string_option = |name: &str, description: &str, required: bool| {
        json!({
            "type": STRING_OPTION,
            "name": name,
            "description": description,
            "required": required,
        })
    };

    json!([
        {
            "name": "chat",
            "description": "Chat with the current Ollama model",
            "options": [string_option("message", "Your message", true)],
        },
        {
            "name": "switch_model",
            "description": "Switch to a different Ollama model",
            "options": [string_option("model_name", "Name of the model to use", true)],
        },
        {
            "name": "list_models",
            "description": "List all available Ollama models",
        },
        {
            "name": "current_model",
            "description": "Show your current model and settings",
        },
        {
            "name": "system_prompt",
            "description": "Set a system prompt (leave empty to clear)",
            "options": [string_option("prompt", "System prompt for the model", false)],
        },
        {
            "name": "clear_context",
            "description": "Clear your conversation history",
        },
        {
            "name": "cancel",
            "description": "Stop the response being generated",
        },
        {
            "name": "help",
            "description": "Show help information",
        },
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guild_payload() -> Value {
        json!({
            "id": "111",
            "type": 2,
            "token": "tok",
            "guild_id": "999",
            "member": { "user": { "id": "42", "username": "alice", "global_name": "Alice" } },
            "data": {
                "name": "chat",
                "options": [{ "name": "message", "type": 3, "value": "Tell me a story" }]
            }
        })
    }

    #[test]
    fn test_parse_guild_chat() {
        let interaction = Interaction::from_gateway(&guild_payload()).unwrap();
        assert_eq!(interaction.id, "111");
        assert_eq!(interaction.token, "tok");
        assert_eq!(interaction.user_id, "42");
        assert_eq!(interaction.username, "Alice");
        assert_eq!(interaction.guild_id.as_deref(), Some("999"));
        assert_eq!(
            interaction.command,
            Ok(Command::Chat {
                message: "Tell me a story".into()
            })
        );
    }

    #[test]
    fn test_parse_dm_without_options() {
        let payload = json!({
            "id": "1",
            "type": 2,
            "token": "t",
            "user": { "id": "7", "username": "bob" },
            "data": { "name": "system_prompt" }
        });
        let interaction = Interaction::from_gateway(&payload).unwrap();
        assert_eq!(interaction.user_id, "7");
        assert_eq!(interaction.username, "bob");
        assert!(interaction.guild_id.is_none());
        assert_eq!(interaction.command, Ok(Command::SystemPrompt { prompt: None }));
    }

    #[test]
    fn test_ignores_non_command_interactions() {
        let mut payload = guild_payload();
        payload["type"] = json!(3);
        assert!(Interaction::from_gateway(&payload).is_none());
    }

    #[test]
    fn test_unknown_command_is_kept_as_error() {
        let mut payload = guild_payload();
        payload["data"] = json!({ "name": "dance" });
        let interaction = Interaction::from_gateway(&payload).unwrap();
        assert!(interaction.command.is_err());
    }

    #[test]
    fn test_definitions_match_command_names() {
        let definitions = command_definitions();
        let names: Vec<&str> = definitions
            .as_array()
            .unwrap()
            .iter()
            .map(|d| d["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, Command::NAMES.to_vec());
    }
}

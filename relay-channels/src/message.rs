//! Message types shared by the channel adapters.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::commands::Command;
use crate::traits::OutputChannel;

/// Channel type enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    Discord,
    Cli,
}

impl ChannelType {
    /// Get the channel type as a string.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Discord => "discord",
            Self::Cli => "cli",
        }
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who issued a command, and from where.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requester {
    /// Stable user identifier; keys the conversation store
    pub user_id: String,
    /// Display name, used for the activity log only
    pub username: String,
    /// Guild (server) name; `None` for direct messages and the CLI
    #[serde(default)]
    pub guild: Option<String>,
    /// Channel the command arrived on
    pub channel: ChannelType,
}

impl Requester {
    /// Create a requester with no guild.
    pub fn new(
        user_id: impl Into<String>,
        username: impl Into<String>,
        channel: ChannelType,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
            guild: None,
            channel,
        }
    }

    /// Set the guild name.
    pub fn with_guild(mut self, guild: impl Into<String>) -> Self {
        self.guild = Some(guild.into());
        self
    }

    /// Guild name as recorded in the activity log.
    pub fn guild_label(&self) -> &str {
        self.guild.as_deref().unwrap_or("DM")
    }
}

/// A parsed command together with the surface its replies go to.
#[derive(Clone)]
pub struct InboundCommand {
    /// Trace ID for this command
    pub trace_id: String,
    pub requester: Requester,
    pub command: Command,
    /// Where replies and streamed output are delivered
    pub output: Arc<dyn OutputChannel>,
}

impl InboundCommand {
    /// Create an inbound command with a fresh trace ID.
    pub fn new(requester: Requester, command: Command, output: Arc<dyn OutputChannel>) -> Self {
        Self {
            trace_id: relay_common::logging::generate_trace_id(),
            requester,
            command,
            output,
        }
    }
}

impl fmt::Debug for InboundCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundCommand")
            .field("trace_id", &self.trace_id)
            .field("requester", &self.requester)
            .field("command", &self.command)
            .field("output", &self.output.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_type_as_str() {
        assert_eq!(ChannelType::Discord.as_str(), "discord");
        assert_eq!(ChannelType::Cli.to_string(), "cli");
    }

    #[test]
    fn test_guild_label_defaults_to_dm() {
        let requester = Requester::new("42", "alice", ChannelType::Discord);
        assert_eq!(requester.guild_label(), "DM");
        let requester = requester.with_guild("Rustaceans");
        assert_eq!(requester.guild_label(), "Rustaceans");
    }

    #[test]
    fn test_requester_serialization() {
        let requester = Requester::new("42", "alice", ChannelType::Cli);
        let json = serde_json::to_string(&requester).unwrap();
        assert!(json.contains("\"channel\":\"cli\""));
        let parsed: Requester = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, requester);
    }
}

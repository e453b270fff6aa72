//! CLI channel adapter for interactive terminal sessions.
//!
//! Reads commands from stdin and streams responses to stdout. Bare lines are
//! chat messages; `/name args` runs a command; `/quit` exits.

use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{self, AsyncBufReadExt, BufReader};

use crate::commands::Command;
use crate::message::{ChannelType, InboundCommand, Requester};
use crate::traits::{Channel, ChannelResult, DeliveryError, MessageHandle, OutputChannel};

/// CLI channel - stdin/stdout, always available.
pub struct CliChannel {
    user_id: String,
    output: Arc<CliOutput>,
}

impl CliChannel {
    /// Create a new CLI channel acting as `user_id`.
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            output: Arc::new(CliOutput::stdout()),
        }
    }

    fn requester(&self) -> Requester {
        Requester::new(self.user_id.as_str(), self.user_id.as_str(), ChannelType::Cli)
    }

    fn report(&self, text: &str) {
        self.output.write_line(text);
    }
}

#[async_trait]
impl Channel for CliChannel {
    fn name(&self) -> &'static str {
        "cli"
    }

    async fn init(&mut self) -> ChannelResult<()> {
        Ok(())
    }

    async fn listen<F>(&self, callback: F) -> ChannelResult<()>
    where
        F: Fn(InboundCommand) + Send + Sync + 'static,
    {
        let stdin = io::stdin();
        let reader = BufReader::new(stdin);
        let mut lines = reader.lines();

        self.report("Type a message to chat, /help for commands, /quit to exit.");

        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            if line == "/quit" || line == "/exit" {
                break;
            }

            match Command::parse_cli(line) {
                None => continue,
                Some(Ok(command)) => {
                    let output: Arc<dyn OutputChannel> = self.output.clone();
                    callback(InboundCommand::new(self.requester(), command, output));
                }
                Some(Err(usage)) => self.report(&usage),
            }
        }
        Ok(())
    }

    async fn health_check(&self) -> ChannelResult<()> {
        Ok(())
    }

    async fn shutdown(&self) -> ChannelResult<()> {
        Ok(())
    }
}

// ============================================================================
// Terminal output
// ============================================================================

/// Writes messages to a terminal.
///
/// Edits that only extend a message print just the new text, so a streamed
/// response reads as continuous output.
pub struct CliOutput {
    writer: Mutex<Box<dyn Write + Send>>,
    shown: Mutex<HashMap<MessageHandle, String>>,
}

impl CliOutput {
    pub fn stdout() -> Self {
        Self::with_writer(Box::new(std::io::stdout()))
    }

    pub fn with_writer(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Mutex::new(writer),
            shown: Mutex::new(HashMap::new()),
        }
    }

    fn write_line(&self, text: &str) {
        let _ = self.write(&format!("\n{text}\n"));
    }

    fn write(&self, text: &str) -> Result<(), DeliveryError> {
        let mut writer = self
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        writer
            .write_all(text.as_bytes())
            .and_then(|()| writer.flush())
            .map_err(|e| DeliveryError::Failed(format!("terminal write failed: {e}")))
    }
}

#[async_trait]
impl OutputChannel for CliOutput {
    fn name(&self) -> &'static str {
        "cli"
    }

    async fn send(&self, content: &str) -> Result<MessageHandle, DeliveryError> {
        self.write(&format!("\n{content}"))?;
        let handle = MessageHandle::new(uuid::Uuid::new_v4().to_string());
        self.shown
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(handle.clone(), content.to_string());
        Ok(handle)
    }

    async fn edit(&self, handle: &MessageHandle, content: &str) -> Result<(), DeliveryError> {
        let previous = {
            let mut shown = self
                .shown
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let Some(current) = shown.get_mut(handle) else {
                return Err(DeliveryError::NotFound);
            };
            std::mem::replace(current, content.to_string())
        };

        match content.strip_prefix(previous.as_str()) {
            Some(suffix) => self.write(suffix),
            None => self.write(&format!("\n[edited] {content}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuffer {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    #[test]
    fn cli_channel_name() {
        assert_eq!(CliChannel::new("cli-user").name(), "cli");
    }

    #[tokio::test]
    async fn cli_channel_init() {
        let mut ch = CliChannel::new("cli-user");
        assert!(ch.init().await.is_ok());
    }

    #[tokio::test]
    async fn cli_channel_health_check() {
        let ch = CliChannel::new("cli-user");
        assert!(ch.health_check().await.is_ok());
        assert!(ch.shutdown().await.is_ok());
    }

    #[test]
    fn cli_requester_has_no_guild() {
        let requester = CliChannel::new("me").requester();
        assert_eq!(requester.user_id, "me");
        assert_eq!(requester.channel, ChannelType::Cli);
        assert_eq!(requester.guild_label(), "DM");
    }

    #[tokio::test]
    async fn cli_output_prints_only_appended_text() {
        let buffer = SharedBuffer::default();
        let output = CliOutput::with_writer(Box::new(buffer.clone()));

        let handle = output.send("Hello").await.unwrap();
        output.edit(&handle, "Hello, world").await.unwrap();

        assert_eq!(buffer.contents(), "\nHello, world");
    }

    #[tokio::test]
    async fn cli_output_reprints_rewritten_message() {
        let buffer = SharedBuffer::default();
        let output = CliOutput::with_writer(Box::new(buffer.clone()));

        let handle = output.send("draft").await.unwrap();
        output.edit(&handle, "final").await.unwrap();

        assert!(buffer.contents().ends_with("[edited] final"));
    }

    #[tokio::test]
    async fn cli_output_unknown_handle() {
        let output = CliOutput::with_writer(Box::new(SharedBuffer::default()));
        let result = output.edit(&MessageHandle::new("nope"), "x").await;
        assert_eq!(result, Err(DeliveryError::NotFound));
    }
}

//! Channel traits for implementing channel adapters.
//!
//! Two seams live here:
//! - [`Channel`]: an inbound adapter that turns platform events into [`InboundCommand`]s
//! - [`OutputChannel`]: a surface that can post a message and later edit it in place

use std::fmt;

use async_trait::async_trait;

use crate::message::InboundCommand;

/// Result type for channel operations.
pub type ChannelResult<T> = Result<T, ChannelError>;

/// Channel error type.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Rate limited: retry after {retry_after_secs} seconds")]
    RateLimited { retry_after_secs: u64 },

    #[error("Message send failed: {0}")]
    SendFailed(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Channel not ready")]
    NotReady,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Channel adapter trait.
///
/// Implement this trait to add support for a new messaging channel.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Get the channel name.
    fn name(&self) -> &'static str;

    /// Initialize the channel (connect, authenticate, etc.).
    async fn init(&mut self) -> ChannelResult<()>;

    /// Listen for incoming commands until the channel closes.
    ///
    /// The callback must return quickly; long work belongs in a spawned task.
    async fn listen<F>(&self, callback: F) -> ChannelResult<()>
    where
        F: Fn(InboundCommand) + Send + Sync + 'static;

    /// Check if the channel is healthy.
    async fn health_check(&self) -> ChannelResult<()>;

    /// Shutdown the channel gracefully.
    async fn shutdown(&self) -> ChannelResult<()>;
}

// ============================================================================
// Output surface
// ============================================================================

/// Opaque identifier of a posted message, used to edit it later.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageHandle(String);

impl MessageHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Failure of a single send or edit.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// The message behind a handle is gone (deleted, expired)
    #[error("message not found")]
    NotFound,

    #[error("rate limited: retry after {retry_after_ms} ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("delivery failed: {0}")]
    Failed(String),
}

/// A surface that can post messages and edit them in place.
///
/// Callers never pass content longer than the platform limit; splitting is
/// done before delivery.
#[async_trait]
pub trait OutputChannel: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Post a new message.
    async fn send(&self, content: &str) -> Result<MessageHandle, DeliveryError>;

    /// Replace the content of a previously posted message.
    async fn edit(&self, handle: &MessageHandle, content: &str) -> Result<(), DeliveryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_handle_display() {
        let handle = MessageHandle::new("1234");
        assert_eq!(handle.as_str(), "1234");
        assert_eq!(handle.to_string(), "1234");
    }

    #[test]
    fn test_delivery_error_display() {
        assert_eq!(DeliveryError::NotFound.to_string(), "message not found");
        assert_eq!(
            DeliveryError::RateLimited { retry_after_ms: 1500 }.to_string(),
            "rate limited: retry after 1500 ms"
        );
    }
}

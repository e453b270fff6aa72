//! Relay Common - Shared configuration, errors and logging for the Ollama relay.
//!
//! This crate provides:
//! - Configuration types and loading
//! - Configuration validation
//! - Error types and handling utilities
//! - Logging setup and structured logging helpers
//! - Small string utilities used by the channel adapters

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod logging;
pub mod util;
pub mod validation;

pub use config::{
    ActivityLogConfig, ChannelsConfig, CliChannelConfig, ConcurrentRequestPolicy, Config,
    DiscordConfig, LlmConfig, ObservabilityConfig, OllamaConfig, SessionConfig, StreamingConfig,
};
pub use error::{Error, Result};
pub use validation::{Validate, ValidationError, ValidationResult};

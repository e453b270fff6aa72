//! Configuration validation for the relay.
//!
//! Provides validation logic for configuration fields to ensure
//! all required values are present and within valid ranges.

use thiserror::Error;

use crate::config::{
    ChannelsConfig, Config, ObservabilityConfig, SessionConfig, StreamingConfig,
};

/// Largest message Discord accepts; chunks must stay at or below it.
pub const PLATFORM_MESSAGE_LIMIT: usize = 2000;

/// Configuration validation error.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Multiple validation errors: {0:?}")]
    Multiple(Vec<ValidationError>),
}

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Trait for validatable configuration sections.
pub trait Validate {
    /// Validate this configuration section.
    fn validate(&self) -> ValidationResult<()>;
}

impl Config {
    /// Validate the entire configuration.
    pub fn validate(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.streaming.validate() {
            errors.push(e);
        }

        if let Err(e) = self.session.validate() {
            errors.push(e);
        }

        if let Err(e) = self.channels.validate() {
            errors.push(e);
        }

        if let Err(e) = self.observability.validate() {
            errors.push(e);
        }

        if errors.is_empty() {
            Ok(())
        } else if errors.len() == 1 {
            Err(errors.remove(0))
        } else {
            Err(ValidationError::Multiple(errors))
        }
    }
}

impl Validate for StreamingConfig {
    fn validate(&self) -> ValidationResult<()> {
        if self.max_chunk_size == 0 || self.max_chunk_size > PLATFORM_MESSAGE_LIMIT {
            return Err(ValidationError::InvalidValue {
                field: "streaming.max_chunk_size".into(),
                reason: format!("must be between 1 and {PLATFORM_MESSAGE_LIMIT}"),
            });
        }

        if self.flush_interval_ms == 0 {
            return Err(ValidationError::InvalidValue {
                field: "streaming.flush_interval_ms".into(),
                reason: "must be greater than 0".into(),
            });
        }

        if self.delta_timeout_secs == 0 {
            return Err(ValidationError::InvalidValue {
                field: "streaming.delta_timeout_secs".into(),
                reason: "must be greater than 0".into(),
            });
        }

        Ok(())
    }
}

impl Validate for SessionConfig {
    fn validate(&self) -> ValidationResult<()> {
        // A committed exchange is two turns; a smaller ceiling would trim it on insert.
        if self.max_history_entries < 2 {
            return Err(ValidationError::InvalidValue {
                field: "session.max_history_entries".into(),
                reason: "must be at least 2".into(),
            });
        }

        Ok(())
    }
}

impl Validate for ChannelsConfig {
    fn validate(&self) -> ValidationResult<()> {
        if let Some(ref discord) = self.discord {
            if discord.enabled {
                if discord.bot_token.trim().is_empty() {
                    return Err(ValidationError::MissingField {
                        field: "channels.discord.bot_token".into(),
                    });
                }
                if discord.application_id.trim().is_empty() {
                    return Err(ValidationError::MissingField {
                        field: "channels.discord.application_id".into(),
                    });
                }
            }
        }

        if let Some(ref cli) = self.cli {
            if cli.enabled && cli.user_id.trim().is_empty() {
                return Err(ValidationError::MissingField {
                    field: "channels.cli.user_id".into(),
                });
            }
        }

        Ok(())
    }
}

impl Validate for ObservabilityConfig {
    fn validate(&self) -> ValidationResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(ValidationError::InvalidValue {
                field: "observability.log_level".into(),
                reason: format!("must be one of: {}", valid_levels.join(", ")),
            });
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.log_format.to_lowercase().as_str()) {
            return Err(ValidationError::InvalidValue {
                field: "observability.log_format".into(),
                reason: format!("must be one of: {}", valid_formats.join(", ")),
            });
        }

        Ok(())
    }
}

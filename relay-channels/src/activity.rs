//! Per-user activity log.
//!
//! Every chat interaction is appended as one JSON line to
//! `<log_dir>/user_activity.jsonl`. Long responses are truncated. The file
//! rotates by size, keeping a fixed number of numbered backups
//! (`user_activity.jsonl.1` is the newest).
//!
//! Logging never fails the interaction: write errors are reported through
//! `tracing` and otherwise ignored.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use relay_common::error::{Result, ResultExt};
use relay_common::util::truncate_chars;
use relay_common::ActivityLogConfig;

use crate::message::Requester;

/// File name of the active log.
pub const ACTIVITY_LOG_FILE: &str = "user_activity.jsonl";

const TRUNCATION_SUFFIX: &str = "... [truncated]";

/// Outcome of an interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InteractionStatus {
    Success,
    Error,
    Cancelled,
}

/// One line of the activity log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub timestamp: DateTime<Utc>,
    pub status: InteractionStatus,
    pub user_id: String,
    pub username: String,
    pub guild: String,
    pub channel: String,
    pub model: String,
    pub input: String,
    pub output: String,
}

/// Appends interactions to a size-rotated JSONL file.
pub struct ActivityLogger {
    config: ActivityLogConfig,
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl ActivityLogger {
    pub fn new(config: ActivityLogConfig) -> Self {
        let log_dir = config.dir();

        if config.enabled {
            if let Err(e) = fs::create_dir_all(&log_dir) {
                tracing::warn!("Failed to create activity log directory: {}", e);
            }
        }

        Self {
            path: log_dir.join(ACTIVITY_LOG_FILE),
            config,
            write_lock: Mutex::new(()),
        }
    }

    /// A logger that writes nothing.
    pub fn disabled() -> Self {
        Self::new(ActivityLogConfig {
            enabled: false,
            ..Default::default()
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record a finished interaction.
    pub fn log_interaction(
        &self,
        requester: &Requester,
        model: &str,
        input: &str,
        output: &str,
        status: InteractionStatus,
    ) {
        if !self.config.enabled {
            return;
        }

        let entry = ActivityEntry {
            timestamp: Utc::now(),
            status,
            user_id: requester.user_id.clone(),
            username: requester.username.clone(),
            guild: requester.guild_label().to_string(),
            channel: requester.channel.as_str().to_string(),
            model: model.to_string(),
            input: input.to_string(),
            output: truncate_chars(output, self.config.max_output_chars, TRUNCATION_SUFFIX),
        };

        if let Err(e) = self.write_entry(&entry) {
            tracing::warn!(
                user_id = %requester.user_id,
                error = %e,
                "Failed to write activity log entry"
            );
        }
    }

    /// Record a failed interaction.
    pub fn log_error(&self, requester: &Requester, model: &str, input: &str, error: &str) {
        self.log_interaction(
            requester,
            model,
            input,
            &format!("ERROR: {error}"),
            InteractionStatus::Error,
        );
    }

    fn write_entry(&self, entry: &ActivityEntry) -> Result<()> {
        let line = serde_json::to_string(entry)?;

        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        self.rotate_if_needed()?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .context(format!("Failed to open activity log: {}", self.path.display()))?;

        writeln!(file, "{}", line)?;

        Ok(())
    }

    fn rotate_if_needed(&self) -> Result<()> {
        let size = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(_) => return Ok(()),
        };

        if size < self.config.max_file_bytes {
            return Ok(());
        }

        if self.config.max_backups == 0 {
            fs::remove_file(&self.path)
                .context(format!("Failed to truncate {}", self.path.display()))?;
            return Ok(());
        }

        for index in (1..self.config.max_backups).rev() {
            let from = self.backup_path(index);
            if from.exists() {
                fs::rename(&from, self.backup_path(index + 1))
                    .context(format!("Failed to rotate {}", from.display()))?;
            }
        }

        fs::rename(&self.path, self.backup_path(1))
            .context(format!("Failed to rotate {}", self.path.display()))?;

        tracing::info!(path = %self.path.display(), size, "Rotated activity log");

        Ok(())
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".{index}"));
        PathBuf::from(name)
    }
}

//! Chunked message delivery.
//!
//! Keeps a list of posted messages in step with the latest chunk list. Each
//! reconciliation edits messages whose chunk changed, posts new messages for
//! chunks past the end, and reposts any message that disappeared. Calling it
//! twice with the same chunks makes no platform calls the second time.

use std::sync::Arc;

use crate::traits::{DeliveryError, MessageHandle, OutputChannel};

/// A posted message and the content it currently shows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredMessage {
    pub handle: MessageHandle,
    pub content: String,
}

/// Which platform call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOp {
    Send,
    Edit,
    /// Reposting a chunk whose message was deleted
    Resend,
}

/// A failed call for one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    pub chunk_index: usize,
    pub op: DeliveryOp,
    pub error: DeliveryError,
}

/// Result of one reconciliation.
#[derive(Debug, Default)]
pub struct Reconciliation {
    /// Posted messages in chunk order
    pub messages: Vec<DeliveredMessage>,
    pub failures: Vec<DeliveryFailure>,
    pub sent: usize,
    pub edited: usize,
}

/// Delivers chunk lists to an [`OutputChannel`].
#[derive(Clone)]
pub struct ChunkedMessageDeliverer {
    output: Arc<dyn OutputChannel>,
}

impl ChunkedMessageDeliverer {
    pub fn new(output: Arc<dyn OutputChannel>) -> Self {
        Self { output }
    }

    pub fn output(&self) -> &Arc<dyn OutputChannel> {
        &self.output
    }

    /// Bring `previous` in line with `chunks`.
    ///
    /// Messages beyond the last chunk are left untouched. When posting a new
    /// chunk fails, the chunks after it are not attempted in this pass so the
    /// message order stays aligned with the chunk order; the next pass picks
    /// them up.
    pub async fn reconcile(
        &self,
        previous: Vec<DeliveredMessage>,
        chunks: &[String],
    ) -> Reconciliation {
        let mut result = Reconciliation {
            messages: previous,
            ..Default::default()
        };

        let overlap = result.messages.len().min(chunks.len());

        for (index, chunk) in chunks.iter().enumerate().take(overlap) {
            if result.messages[index].content == *chunk {
                continue;
            }

            match self.output.edit(&result.messages[index].handle, chunk).await {
                Ok(()) => {
                    result.messages[index].content = chunk.clone();
                    result.edited += 1;
                }
                Err(DeliveryError::NotFound) => {
                    tracing::warn!(
                        output = self.output.name(),
                        chunk_index = index,
                        handle = %result.messages[index].handle,
                        "Message disappeared, posting it again"
                    );
                    match self.output.send(chunk).await {
                        Ok(handle) => {
                            result.messages[index] = DeliveredMessage {
                                handle,
                                content: chunk.clone(),
                            };
                            result.sent += 1;
                        }
                        Err(error) => {
                            tracing::warn!(
                                output = self.output.name(),
                                chunk_index = index,
                                error = %error,
                                "Failed to repost message"
                            );
                            result.failures.push(DeliveryFailure {
                                chunk_index: index,
                                op: DeliveryOp::Resend,
                                error,
                            });
                        }
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        output = self.output.name(),
                        chunk_index = index,
                        error = %error,
                        "Failed to edit message"
                    );
                    result.failures.push(DeliveryFailure {
                        chunk_index: index,
                        op: DeliveryOp::Edit,
                        error,
                    });
                }
            }
        }

        for (index, chunk) in chunks.iter().enumerate().skip(overlap) {
            match self.output.send(chunk).await {
                Ok(handle) => {
                    result.messages.push(DeliveredMessage {
                        handle,
                        content: chunk.clone(),
                    });
                    result.sent += 1;
                }
                Err(error) => {
                    tracing::warn!(
                        output = self.output.name(),
                        chunk_index = index,
                        deferred = chunks.len() - index - 1,
                        error = %error,
                        "Failed to post message"
                    );
                    result.failures.push(DeliveryFailure {
                        chunk_index: index,
                        op: DeliveryOp::Send,
                        error,
                    });
                    break;
                }
            }
        }

        if result.messages.len() > chunks.len() {
            tracing::debug!(
                output = self.output.name(),
                surplus = result.messages.len() - chunks.len(),
                "More messages than chunks, leaving the extras as they are"
            );
        }

        result
    }
}

//! Session coordination.
//!
//! The coordinator owns the per-user generation lifecycle:
//!
//! ```text
//! Idle ──start──> Generating ──done/error──> Idle
//!                     │
//!           cancel / preempt
//!                     ▼
//!                Cancelling ──acknowledged──> Idle (or the next Generating)
//! ```
//!
//! At most one generation runs per user. A second request either preempts the
//! running one (it is cancelled, and the new one starts only after the old one
//! has acknowledged) or is rejected with [`SessionError::SessionBusy`],
//! depending on [`ConcurrentRequestPolicy`].
//!
//! While a generation streams, deltas are aggregated and flushed to the
//! output at most once per flush interval. The end of the stream always
//! flushes. Only completed generations are committed to history.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::StreamExt;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;

use relay_common::{ConcurrentRequestPolicy, StreamingConfig};

use crate::aggregator::{split_into_chunks, StreamAggregator};
use crate::backend::{BackendError, ContinuationToken, GenerateRequest, GenerationStream, ModelBackend};
use crate::deliverer::{ChunkedMessageDeliverer, DeliveredMessage, DeliveryFailure};
use crate::store::{ConversationStore, ConversationTurn, GenerationState, UserSession};
use crate::traits::OutputChannel;

/// Appended as its own message when a generation is cancelled.
pub const TRUNCATION_MARKER: &str = "*⏹ Response truncated: generation was cancelled.*";

/// Shown when a completed generation produced no visible text.
pub const EMPTY_RESPONSE_NOTE: &str = "*(The model returned an empty response.)*";

/// Prefix of the note appended when the backend fails mid-stream.
pub const STREAM_ERROR_PREFIX: &str = "❌ Error during streaming:";

/// A chat request for one user.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub user_id: String,
    pub prompt: String,
    /// Switch to this model before generating
    pub model: Option<String>,
    /// Replace the system prompt before generating
    pub system_prompt: Option<String>,
}

impl ChatRequest {
    pub fn new(user_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            prompt: prompt.into(),
            model: None,
            system_prompt: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }
}

/// How a generation that ran to an end finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationStatus {
    Completed,
    Cancelled,
}

/// Summary of a finished generation.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationReport {
    pub status: GenerationStatus,
    pub model: String,
    /// Generated text, without header or notes
    pub response: String,
    /// Messages posted for this response
    pub messages: usize,
    /// Platform calls that failed along the way
    pub delivery_failures: usize,
}

/// Why a chat request did not produce a report.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Another generation owns this user's session
    #[error("a response is already being generated for this user")]
    SessionBusy,

    /// The backend failed before producing anything; nothing was posted
    #[error("{0}")]
    BackendUnavailable(BackendError),

    /// The backend failed mid-stream; partial text and an error note were posted
    #[error("generation failed: {source}")]
    BackendStream {
        source: BackendError,
        model: String,
        partial: String,
    },
}

enum Ending {
    Completed(Option<ContinuationToken>),
    Cancelled,
    Failed(BackendError),
}

struct ActiveGeneration {
    id: u64,
    state: GenerationState,
    cancel: Arc<Notify>,
    finished: Option<oneshot::Receiver<()>>,
}

/// Per-generation delivery state.
struct StreamState {
    aggregator: StreamAggregator,
    deliverer: ChunkedMessageDeliverer,
    header: String,
    messages: Vec<DeliveredMessage>,
    failures: Vec<DeliveryFailure>,
}

/// Runs generations and keeps per-user sessions consistent.
pub struct SessionCoordinator {
    store: Arc<ConversationStore>,
    backend: Arc<dyn ModelBackend>,
    settings: StreamingConfig,
    active: DashMap<String, ActiveGeneration>,
    next_id: AtomicU64,
}

impl SessionCoordinator {
    pub fn new(
        store: Arc<ConversationStore>,
        backend: Arc<dyn ModelBackend>,
        settings: StreamingConfig,
    ) -> Self {
        Self {
            store,
            backend,
            settings,
            active: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    pub fn backend(&self) -> &Arc<dyn ModelBackend> {
        &self.backend
    }

    pub fn settings(&self) -> &StreamingConfig {
        &self.settings
    }

    /// Generate a response for `request`, streaming it to `output`.
    ///
    /// Returns once the generation has completed, been cancelled, or failed,
    /// and the final flush has been delivered.
    pub async fn start(
        &self,
        request: ChatRequest,
        output: Arc<dyn OutputChannel>,
    ) -> Result<GenerationReport, SessionError> {
        let (_guard, cancel) = self.acquire(&request.user_id).await?;

        if let Some(model) = request.model.as_deref() {
            self.store.set_model(&request.user_id, model);
        }
        if let Some(system_prompt) = request.system_prompt.as_deref() {
            self.store.set_system_prompt(&request.user_id, Some(system_prompt));
        }

        let session = self.store.get(&request.user_id);
        self.run(&request, &session, output, &cancel).await
    }

    /// Cancel the user's running generation and wait until it has stopped.
    ///
    /// Returns false when nothing was generating.
    pub async fn cancel(&self, user_id: &str) -> bool {
        let (id, finished) = {
            let Some(mut current) = self.active.get_mut(user_id) else {
                return false;
            };
            if current.state != GenerationState::Generating {
                return false;
            }
            current.state = GenerationState::Cancelling;
            current.cancel.notify_one();
            self.store
                .set_generation_state(user_id, GenerationState::Cancelling);
            (current.id, current.finished.take())
        };

        let _release = PendingRelease {
            coordinator: self,
            user_id,
            id,
        };

        tracing::info!(user_id = %user_id, generation_id = id, "Cancelling generation");

        if let Some(finished) = finished {
            let _ = finished.await;
        }
        true
    }

    /// Whether the user has a generation in flight.
    pub fn is_generating(&self, user_id: &str) -> bool {
        self.active.contains_key(user_id)
    }

    /// Snapshot of the user's session.
    pub fn session(&self, user_id: &str) -> UserSession {
        self.store.get(user_id)
    }

    /// Switch model. Returns whether it changed.
    pub fn set_model(&self, user_id: &str, model_name: &str) -> bool {
        let changed = self.store.get(user_id).model_name != model_name;
        self.store.set_model(user_id, model_name);
        changed
    }

    /// Set or clear the system prompt.
    pub fn set_system_prompt(&self, user_id: &str, prompt: Option<&str>) {
        self.store.set_system_prompt(user_id, prompt);
    }

    /// Forget the conversation. Returns whether there was anything to forget.
    pub fn clear_history(&self, user_id: &str) -> bool {
        self.store.clear(user_id)
    }

    // ========================================================================
    // Session ownership
    // ========================================================================

    async fn acquire(
        &self,
        user_id: &str,
    ) -> Result<(GenerationGuard<'_>, Arc<Notify>), SessionError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = Arc::new(Notify::new());
        let (finished_tx, finished_rx) = oneshot::channel();
        let mut pending = Some(ActiveGeneration {
            id,
            state: GenerationState::Generating,
            cancel: cancel.clone(),
            finished: Some(finished_rx),
        });

        let preempted = match self.active.entry(user_id.to_string()) {
            Entry::Vacant(slot) => {
                if let Some(generation) = pending.take() {
                    let _slot = slot.insert(generation);
                    self.store
                        .set_generation_state(user_id, GenerationState::Generating);
                }
                None
            }
            Entry::Occupied(mut slot) => {
                let current = slot.get_mut();
                match (current.state, self.settings.concurrent_request_policy) {
                    (GenerationState::Generating, ConcurrentRequestPolicy::Preempt) => {
                        current.state = GenerationState::Cancelling;
                        current.cancel.notify_one();
                        self.store
                            .set_generation_state(user_id, GenerationState::Cancelling);
                        Some((current.id, current.finished.take()))
                    }
                    (state, policy) => {
                        tracing::info!(
                            user_id = %user_id,
                            state = ?state,
                            policy = ?policy,
                            "Rejecting request, session busy"
                        );
                        return Err(SessionError::SessionBusy);
                    }
                }
            }
        };

        if let Some((old_id, finished)) = preempted {
            let release = PendingRelease {
                coordinator: self,
                user_id,
                id: old_id,
            };

            tracing::info!(
                user_id = %user_id,
                generation_id = old_id,
                "Preempting running generation"
            );

            if let Some(finished) = finished {
                let _ = finished.await;
            }
            if let Some(generation) = pending.take() {
                let _slot = self.active.entry(user_id.to_string()).insert(generation);
                self.store
                    .set_generation_state(user_id, GenerationState::Generating);
            }
            drop(release);
        }

        Ok((
            GenerationGuard {
                coordinator: self,
                user_id: user_id.to_string(),
                id,
                _finished: finished_tx,
            },
            cancel,
        ))
    }

    // ========================================================================
    // Streaming
    // ========================================================================

    async fn run(
        &self,
        request: &ChatRequest,
        session: &UserSession,
        output: Arc<dyn OutputChannel>,
        cancel: &Notify,
    ) -> Result<GenerationReport, SessionError> {
        let user_id = request.user_id.as_str();
        let model = session.model_name.clone();

        tracing::info!(
            user_id = %user_id,
            model = %model,
            output = output.name(),
            has_context = session.has_context(),
            "Generation started"
        );

        let generate = GenerateRequest::new(&model, &request.prompt)
            .with_system_prompt(session.system_prompt.clone())
            .with_continuation(session.continuation().cloned());

        let stream = tokio::select! {
            biased;
            _ = cancel.notified() => None,
            result = self.backend.generate(generate) => match result {
                Ok(stream) => Some(stream),
                Err(e) => {
                    tracing::warn!(user_id = %user_id, model = %model, error = %e, "Backend failed to start generation");
                    return Err(SessionError::BackendUnavailable(e));
                }
            },
        };

        let mut state = StreamState {
            aggregator: StreamAggregator::new(self.settings.flush_interval()),
            deliverer: ChunkedMessageDeliverer::new(output),
            header: self.header(&model, &request.prompt),
            messages: Vec::new(),
            failures: Vec::new(),
        };

        let ending = match stream {
            Some(stream) => self.pump(stream, &mut state, cancel).await,
            None => Ending::Cancelled,
        };

        let note = match &ending {
            Ending::Completed(_) if state.aggregator.text().trim().is_empty() => {
                Some(EMPTY_RESPONSE_NOTE.to_string())
            }
            Ending::Completed(_) => None,
            Ending::Cancelled => Some(TRUNCATION_MARKER.to_string()),
            Ending::Failed(e) => Some(format!("{STREAM_ERROR_PREFIX} {e}")),
        };
        let unresolved = self.flush(&mut state, note.as_deref()).await;

        if let Some(warning) = delivery_warning(state.failures.len(), unresolved) {
            if let Err(e) = state.deliverer.output().send(&warning).await {
                tracing::warn!(user_id = %user_id, error = %e, "Failed to post delivery warning");
            }
        }

        let messages = state.messages.len();
        let delivery_failures = state.failures.len();
        let response = state.aggregator.into_text();

        match ending {
            Ending::Completed(continuation) => {
                self.store
                    .append_turn(user_id, ConversationTurn::user(request.prompt.as_str()));
                self.store.append_turn(
                    user_id,
                    ConversationTurn::assistant(response.as_str(), continuation),
                );

                tracing::info!(
                    user_id = %user_id,
                    model = %model,
                    response_chars = response.chars().count(),
                    messages,
                    delivery_failures,
                    "Generation completed"
                );

                Ok(GenerationReport {
                    status: GenerationStatus::Completed,
                    model,
                    response,
                    messages,
                    delivery_failures,
                })
            }
            Ending::Cancelled => {
                tracing::info!(
                    user_id = %user_id,
                    model = %model,
                    response_chars = response.chars().count(),
                    "Generation cancelled"
                );

                Ok(GenerationReport {
                    status: GenerationStatus::Cancelled,
                    model,
                    response,
                    messages,
                    delivery_failures,
                })
            }
            Ending::Failed(source) => {
                tracing::warn!(
                    user_id = %user_id,
                    model = %model,
                    error = %source,
                    "Generation failed mid-stream"
                );

                Err(SessionError::BackendStream {
                    source,
                    model,
                    partial: response,
                })
            }
        }
    }

    /// Drive the stream until it ends, is cancelled, or fails.
    ///
    /// The stream is dropped on return, which aborts the backend request.
    async fn pump(
        &self,
        mut stream: GenerationStream,
        state: &mut StreamState,
        cancel: &Notify,
    ) -> Ending {
        let delta_timeout = self.settings.delta_timeout();
        let mut delta_deadline = Instant::now() + delta_timeout;

        loop {
            let flush_at = state.aggregator.next_flush_at();
            let dirty = state.aggregator.is_dirty();

            tokio::select! {
                biased;
                _ = cancel.notified() => return Ending::Cancelled,
                _ = tokio::time::sleep_until(flush_at), if dirty => {
                    self.flush(state, None).await;
                }
                next = tokio::time::timeout_at(delta_deadline, stream.next()) => match next {
                    Err(_) => return Ending::Failed(BackendError::Timeout(delta_timeout)),
                    Ok(None) => {
                        return Ending::Failed(BackendError::Stream(
                            "stream closed before completion".into(),
                        ))
                    }
                    Ok(Some(Err(e))) => return Ending::Failed(e),
                    Ok(Some(Ok(chunk))) => {
                        delta_deadline = Instant::now() + delta_timeout;
                        state.aggregator.push(&chunk.delta);
                        if chunk.done {
                            return Ending::Completed(chunk.continuation);
                        }
                        if state.aggregator.should_flush(Instant::now()) {
                            self.flush(state, None).await;
                        }
                    }
                },
            }
        }
    }

    /// Deliver the current text, plus an optional trailing note.
    ///
    /// Returns how many chunks are not showing their latest content.
    async fn flush(&self, state: &mut StreamState, note: Option<&str>) -> usize {
        let chunks = render_chunks(
            &state.header,
            state.aggregator.text(),
            note,
            self.settings.max_chunk_size,
        );

        let previous = std::mem::take(&mut state.messages);
        let result = state.deliverer.reconcile(previous, &chunks).await;

        tracing::debug!(
            chunks = chunks.len(),
            sent = result.sent,
            edited = result.edited,
            failures = result.failures.len(),
            "Flushed response"
        );

        state.messages = result.messages;
        state.failures.extend(result.failures);
        state.aggregator.mark_flushed(Instant::now());

        chunks
            .iter()
            .enumerate()
            .filter(|(i, chunk)| state.messages.get(*i).map(|m| &m.content) != Some(*chunk))
            .count()
    }

    fn header(&self, model: &str, prompt: &str) -> String {
        if self.settings.show_header {
            format!("**Model:** {model}\n**You:** {prompt}\n\n**AI:** ")
        } else {
            String::new()
        }
    }
}

/// One end-of-stream notice covering every failed platform call.
fn delivery_warning(failures: usize, unresolved: usize) -> Option<String> {
    if failures == 0 && unresolved == 0 {
        return None;
    }
    if unresolved > 0 {
        return Some(format!(
            "⚠️ {unresolved} part(s) of this response could not be delivered; the text above may be incomplete."
        ));
    }
    Some(format!(
        "⚠️ {failures} update(s) to this response could not be delivered; the text above is complete."
    ))
}

/// Render the display text into chunks.
///
/// The header and text are split together; a note always starts a new chunk
/// so that the text chunks stay a prefix of the full response.
pub fn render_chunks(header: &str, text: &str, note: Option<&str>, max_chars: usize) -> Vec<String> {
    let mut chunks = split_into_chunks(&format!("{header}{text}"), max_chars);
    if let Some(note) = note {
        chunks.extend(split_into_chunks(note, max_chars));
    }
    chunks
}

// ============================================================================
// Ownership guards
// ============================================================================

/// Held by a running generation. Dropping it releases the session and
/// acknowledges any pending cancellation.
struct GenerationGuard<'a> {
    coordinator: &'a SessionCoordinator,
    user_id: String,
    id: u64,
    _finished: oneshot::Sender<()>,
}

impl Drop for GenerationGuard<'_> {
    fn drop(&mut self) {
        // A cancelled slot stays until whoever cancelled it takes over.
        let id = self.id;
        let store = &self.coordinator.store;
        let user_id = self.user_id.as_str();
        self.coordinator.active.remove_if(user_id, |_, g| {
            let owned = g.id == id && g.state == GenerationState::Generating;
            if owned {
                store.set_generation_state(user_id, GenerationState::Idle);
            }
            owned
        });
    }
}

/// Held while waiting for a cancelled generation to stop. Removes the
/// cancelled slot unless a new generation has replaced it.
struct PendingRelease<'a> {
    coordinator: &'a SessionCoordinator,
    user_id: &'a str,
    id: u64,
}

impl Drop for PendingRelease<'_> {
    fn drop(&mut self) {
        let id = self.id;
        let store = &self.coordinator.store;
        let user_id = self.user_id;
        self.coordinator.active.remove_if(user_id, |_, g| {
            let owned = g.id == id;
            if owned {
                store.set_generation_state(user_id, GenerationState::Idle);
            }
            owned
        });
    }
}

//! Test doubles shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use relay_channels::{
    BackendError, ContinuationToken, DeliveryError, GenerateRequest, GenerationChunk,
    GenerationStream, MessageHandle, ModelBackend, OutputChannel,
};
use tokio::time::Instant;

// ─────────────────────────────────────────────────────────────────────────────
// Scripted backend
// ─────────────────────────────────────────────────────────────────────────────

/// One step of a scripted generation.
#[derive(Debug, Clone)]
pub enum Step {
    /// Wait, then emit a delta
    Delta(Duration, String),
    /// Emit the final chunk
    Done(Option<ContinuationToken>),
    /// Fail the stream
    Fail(String),
    /// Never produce anything again
    Hang,
}

/// Deltas of `text` split into `parts` pieces, `every` apart, then done.
pub fn steady(text: &str, parts: usize, every: Duration, token: Option<ContinuationToken>) -> Vec<Step> {
    let chars: Vec<char> = text.chars().collect();
    let size = chars.len().div_ceil(parts.max(1)).max(1);
    let mut steps: Vec<Step> = chars
        .chunks(size)
        .map(|c| Step::Delta(every, c.iter().collect()))
        .collect();
    steps.push(Step::Done(token));
    steps
}

pub fn token(n: i64) -> ContinuationToken {
    ContinuationToken::new(serde_json::json!([n, n + 1]))
}

/// Backend that replays scripts and tracks how many streams are open.
#[derive(Default)]
pub struct ScriptedBackend {
    scripts: Mutex<VecDeque<Vec<Step>>>,
    fallback: Mutex<Vec<Step>>,
    by_prompt: Mutex<Vec<(String, Vec<Step>)>>,
    start_error: Mutex<Option<BackendError>>,
    models: Mutex<Vec<String>>,
    models_error: Mutex<Option<BackendError>>,
    requests: Mutex<Vec<GenerateRequest>>,
    open_streams: Arc<AtomicUsize>,
    max_open_streams: Arc<AtomicUsize>,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a script for the next `generate` call.
    pub fn push_script(&self, steps: Vec<Step>) {
        self.scripts.lock().unwrap().push_back(steps);
    }

    /// Script used once the queue is empty.
    pub fn set_fallback(&self, steps: Vec<Step>) {
        *self.fallback.lock().unwrap() = steps;
    }

    /// Script used for every prompt starting with `prefix`, ahead of the queue.
    pub fn script_for_prompt(&self, prefix: &str, steps: Vec<Step>) {
        self.by_prompt
            .lock()
            .unwrap()
            .push((prefix.to_string(), steps));
    }

    pub fn fail_start(&self, error: BackendError) {
        *self.start_error.lock().unwrap() = Some(error);
    }

    pub fn set_models(&self, models: &[&str]) {
        *self.models.lock().unwrap() = models.iter().map(|m| m.to_string()).collect();
    }

    pub fn fail_list_models(&self, error: BackendError) {
        *self.models_error.lock().unwrap() = Some(error);
    }

    pub fn requests(&self) -> Vec<GenerateRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn open_streams(&self) -> usize {
        self.open_streams.load(Ordering::SeqCst)
    }

    pub fn max_open_streams(&self) -> usize {
        self.max_open_streams.load(Ordering::SeqCst)
    }
}

struct OpenStream(Arc<AtomicUsize>);

impl Drop for OpenStream {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, request: GenerateRequest) -> Result<GenerationStream, BackendError> {
        let keyed = self
            .by_prompt
            .lock()
            .unwrap()
            .iter()
            .find(|(prefix, _)| request.prompt.starts_with(prefix.as_str()))
            .map(|(_, steps)| steps.clone());
        self.requests.lock().unwrap().push(request);

        if let Some(error) = self.start_error.lock().unwrap().clone() {
            return Err(error);
        }

        let steps: VecDeque<Step> = keyed
            .unwrap_or_else(|| {
                self.scripts
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or_else(|| self.fallback.lock().unwrap().clone())
            })
            .into();

        let open = self.open_streams.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_open_streams.fetch_max(open, Ordering::SeqCst);
        let guard = OpenStream(self.open_streams.clone());

        Ok(Box::pin(futures_util::stream::unfold(
            (steps, guard),
            |(mut steps, guard)| async move {
                match steps.pop_front()? {
                    Step::Delta(wait, text) => {
                        tokio::time::sleep(wait).await;
                        Some((Ok(GenerationChunk::delta(text)), (steps, guard)))
                    }
                    Step::Done(token) => {
                        Some((Ok(GenerationChunk::done(token)), (VecDeque::new(), guard)))
                    }
                    Step::Fail(message) => Some((
                        Err(BackendError::Stream(message)),
                        (VecDeque::new(), guard),
                    )),
                    Step::Hang => {
                        futures_util::future::pending::<()>().await;
                        None
                    }
                }
            },
        )))
    }

    async fn list_models(&self) -> Result<Vec<String>, BackendError> {
        if let Some(error) = self.models_error.lock().unwrap().clone() {
            return Err(error);
        }
        Ok(self.models.lock().unwrap().clone())
    }

    async fn check_connection(&self) -> bool {
        true
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Recording output
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Send { handle: String, content: String },
    Edit { handle: String, content: String },
}

/// Output surface that records every call and keeps the visible messages.
#[derive(Default)]
pub struct RecordingOutput {
    calls: Mutex<Vec<(Instant, Call)>>,
    order: Mutex<Vec<String>>,
    contents: Mutex<HashMap<String, String>>,
    deleted: Mutex<HashSet<String>>,
    delete_first_message: Mutex<bool>,
    fail_edits: Mutex<bool>,
    failing_edits: AtomicUsize,
    next_id: AtomicUsize,
}

impl RecordingOutput {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the first posted message disappear right after it is posted.
    pub fn delete_first_message(&self) {
        *self.delete_first_message.lock().unwrap() = true;
    }

    pub fn fail_edits(&self) {
        *self.fail_edits.lock().unwrap() = true;
    }

    /// Fail only the next `n` edits.
    pub fn fail_next_edits(&self, n: usize) {
        self.failing_edits.store(n, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().iter().map(|(_, c)| c.clone()).collect()
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().iter().map(|(t, _)| *t).collect()
    }

    pub fn sends(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Send { content, .. } => Some(content),
                Call::Edit { .. } => None,
            })
            .collect()
    }

    /// Contents of the messages still present, in posting order.
    pub fn visible(&self) -> Vec<String> {
        let deleted = self.deleted.lock().unwrap();
        let contents = self.contents.lock().unwrap();
        self.order
            .lock()
            .unwrap()
            .iter()
            .filter(|id| !deleted.contains(*id))
            .filter_map(|id| contents.get(id).cloned())
            .collect()
    }
}

#[async_trait]
impl OutputChannel for RecordingOutput {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn send(&self, content: &str) -> Result<MessageHandle, DeliveryError> {
        let id = format!("msg-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.calls.lock().unwrap().push((
            Instant::now(),
            Call::Send {
                handle: id.clone(),
                content: content.to_string(),
            },
        ));
        self.order.lock().unwrap().push(id.clone());
        self.contents
            .lock()
            .unwrap()
            .insert(id.clone(), content.to_string());

        let mut delete_first = self.delete_first_message.lock().unwrap();
        if *delete_first {
            *delete_first = false;
            self.deleted.lock().unwrap().insert(id.clone());
        }

        Ok(MessageHandle::new(id))
    }

    async fn edit(&self, handle: &MessageHandle, content: &str) -> Result<(), DeliveryError> {
        self.calls.lock().unwrap().push((
            Instant::now(),
            Call::Edit {
                handle: handle.to_string(),
                content: content.to_string(),
            },
        ));

        if self.deleted.lock().unwrap().contains(handle.as_str()) {
            return Err(DeliveryError::NotFound);
        }
        let transient = self
            .failing_edits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if transient {
            return Err(DeliveryError::Failed("503 Service Unavailable".into()));
        }
        if *self.fail_edits.lock().unwrap() {
            return Err(DeliveryError::RateLimited {
                retry_after_ms: 2000,
            });
        }

        self.contents
            .lock()
            .unwrap()
            .insert(handle.to_string(), content.to_string());
        Ok(())
    }
}

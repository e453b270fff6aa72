//! Ollama backend.
//!
//! Talks to a local Ollama server:
//! - `POST /api/generate` with `stream: true`, answered as newline-delimited JSON
//! - `GET /api/tags` for the installed models
//! - `GET /` as a liveness probe
//!
//! The `context` array Ollama returns on the final line is kept as the
//! conversation's [`ContinuationToken`].

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use relay_common::OllamaConfig;

use super::{
    BackendError, ContinuationToken, GenerateRequest, GenerationChunk, GenerationStream,
    ModelBackend,
};

/// Ollama client for local models.
pub struct OllamaClient {
    base_url: String,
    client: Client,
    request_timeout: Duration,
}

#[derive(Debug, Serialize)]
struct OllamaGenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<&'a ContinuationToken>,
}

/// One line of the `/api/generate` stream.
#[derive(Debug, Deserialize)]
struct OllamaGenerateLine {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    context: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OllamaTagsResponse {
    #[serde(default)]
    models: Vec<OllamaModelTag>,
}

#[derive(Debug, Deserialize)]
struct OllamaModelTag {
    name: String,
}

impl OllamaClient {
    /// Create a new Ollama client.
    ///
    /// `request_timeout` bounds the non-streaming calls only. Generation streams
    /// are bounded per delta by the caller.
    pub fn new(base_url: &str, request_timeout: Duration, connect_timeout: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: Client::builder()
                .connect_timeout(connect_timeout)
                .build()
                .unwrap_or_else(|_| Client::new()),
            request_timeout,
        }
    }

    /// Create from the `llm.ollama` config section.
    pub fn from_config(config: &OllamaConfig) -> Self {
        Self::new(
            &config.base_url,
            Duration::from_secs(config.timeout_secs),
            Duration::from_secs(config.connect_timeout_secs),
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn unavailable(&self, err: &reqwest::Error) -> BackendError {
        BackendError::Unavailable(format!(
            "{} ({err}). Is Ollama running? Try `ollama serve`.",
            self.base_url
        ))
    }
}

#[async_trait]
impl ModelBackend for OllamaClient {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn generate(&self, request: GenerateRequest) -> Result<GenerationStream, BackendError> {
        let body = OllamaGenerateRequest {
            model: &request.model,
            prompt: &request.prompt,
            stream: true,
            system: request.system_prompt.as_deref(),
            context: request.continuation.as_ref(),
        };

        let url = format!("{}/api/generate", self.base_url);

        tracing::debug!(
            model = %request.model,
            has_system_prompt = request.system_prompt.is_some(),
            has_context = request.continuation.is_some(),
            "Starting Ollama generation"
        );

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.unavailable(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Http {
                status: status.as_u16(),
                body,
            });
        }

        Ok(decode_ndjson(response.bytes_stream()))
    }

    async fn list_models(&self) -> Result<Vec<String>, BackendError> {
        let url = format!("{}/api/tags", self.base_url);

        let response = self
            .client
            .get(&url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| self.unavailable(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let tags: OllamaTagsResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))?;

        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    async fn check_connection(&self) -> bool {
        match self
            .client
            .get(&self.base_url)
            .timeout(self.request_timeout)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!(error = %e, base_url = %self.base_url, "Ollama liveness probe failed");
                false
            }
        }
    }
}

// ============================================================================
// NDJSON decoding
// ============================================================================

struct NdjsonState<S> {
    body: Pin<Box<S>>,
    buffer: Vec<u8>,
    body_ended: bool,
    finished: bool,
}

/// Decode a newline-delimited JSON byte stream into generation chunks.
///
/// The stream always terminates with a `done` chunk unless it fails: a body
/// that ends without one gets a synthesized final chunk. Lines that do not
/// parse are skipped.
pub(crate) fn decode_ndjson<S, B, E>(body: S) -> GenerationStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let state = NdjsonState {
        body: Box::pin(body),
        buffer: Vec::new(),
        body_ended: false,
        finished: false,
    };

    Box::pin(futures_util::stream::unfold(state, |mut st| async move {
        loop {
            if st.finished {
                return None;
            }

            if let Some(pos) = st.buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = st.buffer.drain(..=pos).collect();
                if let Some(item) = parse_line(&line) {
                    st.finished = !matches!(item, Ok(ref chunk) if !chunk.done);
                    return Some((item, st));
                }
                continue;
            }

            if st.body_ended {
                let rest = std::mem::take(&mut st.buffer);
                st.finished = true;
                return match parse_line(&rest) {
                    Some(Ok(chunk)) if !chunk.done => {
                        // Emit the trailing delta now; the synthesized done follows.
                        st.finished = false;
                        Some((Ok(chunk), st))
                    }
                    Some(item) => Some((item, st)),
                    None => {
                        tracing::debug!("Ollama stream ended without a done line");
                        Some((Ok(GenerationChunk::done(None)), st))
                    }
                };
            }

            match st.body.next().await {
                Some(Ok(bytes)) => st.buffer.extend_from_slice(bytes.as_ref()),
                Some(Err(e)) => {
                    st.finished = true;
                    return Some((Err(BackendError::Stream(e.to_string())), st));
                }
                None => st.body_ended = true,
            }
        }
    }))
}

/// Parse a single NDJSON line. Returns `None` for blank or unparseable lines.
fn parse_line(line: &[u8]) -> Option<Result<GenerationChunk, BackendError>> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    let parsed: OllamaGenerateLine = match serde_json::from_str(text) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::debug!(error = %e, "Skipping unparseable Ollama line");
            return None;
        }
    };

    if let Some(error) = parsed.error {
        return Some(Err(BackendError::Stream(error)));
    }

    let continuation = if parsed.done {
        parsed.context.map(ContinuationToken::new)
    } else {
        None
    };

    Some(Ok(GenerationChunk {
        delta: parsed.response,
        done: parsed.done,
        continuation,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(parts: &[&str]) -> impl Stream<Item = Result<Vec<u8>, std::io::Error>> {
        let parts: Vec<Result<Vec<u8>, std::io::Error>> =
            parts.iter().map(|p| Ok(p.as_bytes().to_vec())).collect();
        futures_util::stream::iter(parts)
    }

    async fn collect(stream: GenerationStream) -> Vec<Result<GenerationChunk, BackendError>> {
        stream.collect().await
    }

    #[test]
    fn test_parse_line_delta() {
        let chunk = parse_line(br#"{"response":"Hel","done":false}"#)
            .unwrap()
            .unwrap();
        assert_eq!(chunk.delta, "Hel");
        assert!(!chunk.done);
        assert!(chunk.continuation.is_none());
    }

    #[test]
    fn test_parse_line_done_with_context() {
        let chunk = parse_line(br#"{"response":"","done":true,"context":[1,2,3]}"#)
            .unwrap()
            .unwrap();
        assert!(chunk.done);
        assert_eq!(
            chunk.continuation,
            Some(ContinuationToken::new(serde_json::json!([1, 2, 3])))
        );
    }

    #[test]
    fn test_parse_line_skips_garbage() {
        assert!(parse_line(b"   \n").is_none());
        assert!(parse_line(b"not json").is_none());
    }

    #[test]
    fn test_parse_line_error_field() {
        let item = parse_line(br#"{"error":"model 'nope' not found"}"#).unwrap();
        assert!(matches!(item, Err(BackendError::Stream(ref m)) if m.contains("nope")));
    }

    #[tokio::test]
    async fn test_decode_lines_split_across_reads() {
        let stream = decode_ndjson(body(&[
            "{\"response\":\"Hel",
            "lo\",\"done\":false}\n{\"response\":\" world\",\"done\":false}\n",
            "{\"response\":\"\",\"done\":true,\"context\":[9]}\n",
        ]));
        let items = collect(stream).await;
        assert_eq!(items.len(), 3);
        let text: String = items
            .iter()
            .map(|i| i.as_ref().unwrap().delta.as_str())
            .collect();
        assert_eq!(text, "Hello world");
        assert!(items[2].as_ref().unwrap().done);
    }

    #[tokio::test]
    async fn test_decode_utf8_split_inside_character() {
        let line = "{\"response\":\"日本\",\"done\":true}\n".as_bytes().to_vec();
        let (a, b) = line.split_at(15);
        let parts: Vec<Result<Vec<u8>, std::io::Error>> = vec![Ok(a.to_vec()), Ok(b.to_vec())];
        let items = collect(decode_ndjson(futures_util::stream::iter(parts))).await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap().delta, "日本");
    }

    #[tokio::test]
    async fn test_decode_synthesizes_done_on_early_end() {
        let items = collect(decode_ndjson(body(&["{\"response\":\"partial\"}\n"]))).await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap().delta, "partial");
        let last = items[1].as_ref().unwrap();
        assert!(last.done);
        assert!(last.continuation.is_none());
    }

    #[tokio::test]
    async fn test_decode_trailing_line_without_newline() {
        let items = collect(decode_ndjson(body(&[
            "{\"response\":\"a\"}\n{\"response\":\"b\",\"done\":true}",
        ])))
        .await;
        assert_eq!(items.len(), 2);
        assert!(items[1].as_ref().unwrap().done);
    }

    #[tokio::test]
    async fn test_decode_stops_after_done() {
        let items = collect(decode_ndjson(body(&[
            "{\"response\":\"a\",\"done\":true}\n{\"response\":\"late\"}\n",
        ])))
        .await;
        assert_eq!(items.len(), 1);
    }

    #[tokio::test]
    async fn test_decode_transport_error_ends_stream() {
        let parts: Vec<Result<Vec<u8>, std::io::Error>> = vec![
            Ok(b"{\"response\":\"a\"}\n".to_vec()),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
            Ok(b"{\"response\":\"b\"}\n".to_vec()),
        ];
        let items = collect(decode_ndjson(futures_util::stream::iter(parts))).await;
        assert_eq!(items.len(), 2);
        assert!(matches!(items[1], Err(BackendError::Stream(_))));
    }

    #[test]
    fn test_request_serialization_omits_empty_fields() {
        let body = OllamaGenerateRequest {
            model: "llama3",
            prompt: "hi",
            stream: true,
            system: None,
            context: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["stream"], true);
        assert!(json.get("system").is_none());
        assert!(json.get("context").is_none());
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let client = OllamaClient::new(
            "http://localhost:11434/",
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        assert_eq!(client.base_url(), "http://localhost:11434");
    }
}

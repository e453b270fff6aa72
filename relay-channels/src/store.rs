//! Per-user conversation state.
//!
//! Each user gets an isolated [`UserSession`] keyed by user ID. History is
//! bounded: once it exceeds the configured ceiling the oldest turns are
//! dropped first.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::backend::ContinuationToken;

/// Platform user identifier.
pub type UserId = String;

/// Author of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One committed message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
    /// Backend state after this turn; assistant turns only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation: Option<ContinuationToken>,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            continuation: None,
        }
    }

    pub fn assistant(content: impl Into<String>, continuation: Option<ContinuationToken>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            continuation,
        }
    }
}

/// Where a user's generation is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationState {
    #[default]
    Idle,
    Generating,
    Cancelling,
}

/// Everything remembered about one user.
#[derive(Debug, Clone, PartialEq)]
pub struct UserSession {
    pub model_name: String,
    pub system_prompt: Option<String>,
    pub history: Vec<ConversationTurn>,
    pub generation_state: GenerationState,
}

impl UserSession {
    fn new(model_name: &str) -> Self {
        Self {
            model_name: model_name.to_string(),
            system_prompt: None,
            history: Vec::new(),
            generation_state: GenerationState::Idle,
        }
    }

    /// Whether there is any committed conversation to continue.
    pub fn has_context(&self) -> bool {
        !self.history.is_empty()
    }

    /// Continuation token of the most recent assistant turn.
    pub fn continuation(&self) -> Option<&ContinuationToken> {
        self.history
            .iter()
            .rev()
            .find(|turn| turn.role == Role::Assistant)
            .and_then(|turn| turn.continuation.as_ref())
    }
}

/// Concurrent map of user sessions.
pub struct ConversationStore {
    sessions: DashMap<UserId, UserSession>,
    default_model: String,
    max_history_entries: usize,
}

impl ConversationStore {
    /// Create a store. New sessions start on `default_model`.
    pub fn new(default_model: impl Into<String>, max_history_entries: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            default_model: default_model.into(),
            max_history_entries,
        }
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    pub fn max_history_entries(&self) -> usize {
        self.max_history_entries
    }

    /// Snapshot of the user's session, created with defaults on first access.
    pub fn get(&self, user_id: &str) -> UserSession {
        self.with_session(user_id, |session| session.clone())
    }

    /// Select the model for subsequent requests.
    pub fn set_model(&self, user_id: &str, model_name: &str) {
        self.with_session(user_id, |session| {
            session.model_name = model_name.to_string();
        });
    }

    /// Set or clear the system prompt. An empty prompt clears it.
    pub fn set_system_prompt(&self, user_id: &str, prompt: Option<&str>) {
        let prompt = prompt
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string);
        self.with_session(user_id, |session| {
            session.system_prompt = prompt;
        });
    }

    /// Append a turn, dropping the oldest turns beyond the ceiling.
    ///
    /// Returns how many turns were dropped.
    pub fn append_turn(&self, user_id: &str, turn: ConversationTurn) -> usize {
        let max = self.max_history_entries;
        self.with_session(user_id, |session| {
            session.history.push(turn);
            let excess = session.history.len().saturating_sub(max);
            session.history.drain(..excess);
            excess
        })
    }

    /// Forget the conversation. Returns whether there was anything to forget.
    pub fn clear(&self, user_id: &str) -> bool {
        self.with_session(user_id, |session| {
            let had_context = session.has_context();
            session.history.clear();
            had_context
        })
    }

    pub fn generation_state(&self, user_id: &str) -> GenerationState {
        self.sessions
            .get(user_id)
            .map(|s| s.generation_state)
            .unwrap_or_default()
    }

    pub(crate) fn set_generation_state(&self, user_id: &str, state: GenerationState) {
        self.with_session(user_id, |session| {
            session.generation_state = state;
        });
    }

    /// Number of users with a session.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn with_session<R>(&self, user_id: &str, f: impl FnOnce(&mut UserSession) -> R) -> R {
        let mut entry = self
            .sessions
            .entry(user_id.to_string())
            .or_insert_with(|| UserSession::new(&self.default_model));
        f(entry.value_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(n: i64) -> Option<ContinuationToken> {
        Some(ContinuationToken::new(serde_json::json!([n])))
    }

    #[test]
    fn test_get_creates_default_session() {
        let store = ConversationStore::new("llama3", 10);
        let session = store.get("alice");
        assert_eq!(session.model_name, "llama3");
        assert!(session.system_prompt.is_none());
        assert!(!session.has_context());
        assert_eq!(session.generation_state, GenerationState::Idle);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_sessions_are_isolated() {
        let store = ConversationStore::new("llama3", 10);
        store.set_model("alice", "mistral");
        store.append_turn("alice", ConversationTurn::user("hi"));
        let bob = store.get("bob");
        assert_eq!(bob.model_name, "llama3");
        assert!(bob.history.is_empty());
        assert_eq!(store.get("alice").model_name, "mistral");
    }

    #[test]
    fn test_history_trims_oldest_first() {
        let store = ConversationStore::new("llama3", 4);
        for i in 0..3 {
            store.append_turn("alice", ConversationTurn::user(format!("q{i}")));
            store.append_turn("alice", ConversationTurn::assistant(format!("a{i}"), token(i)));
        }
        let history = store.get("alice").history;
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].content, "q1");
        assert_eq!(history[3].content, "a2");
    }

    #[test]
    fn test_append_reports_dropped_turns() {
        let store = ConversationStore::new("llama3", 2);
        assert_eq!(store.append_turn("u", ConversationTurn::user("1")), 0);
        assert_eq!(store.append_turn("u", ConversationTurn::user("2")), 0);
        assert_eq!(store.append_turn("u", ConversationTurn::user("3")), 1);
    }

    #[test]
    fn test_continuation_comes_from_latest_assistant_turn() {
        let store = ConversationStore::new("llama3", 10);
        store.append_turn("u", ConversationTurn::user("q1"));
        store.append_turn("u", ConversationTurn::assistant("a1", token(1)));
        store.append_turn("u", ConversationTurn::user("q2"));
        store.append_turn("u", ConversationTurn::assistant("a2", token(2)));
        assert_eq!(store.get("u").continuation(), token(2).as_ref());
    }

    #[test]
    fn test_clear_reports_previous_context() {
        let store = ConversationStore::new("llama3", 10);
        assert!(!store.clear("u"));
        store.append_turn("u", ConversationTurn::user("q"));
        assert!(store.clear("u"));
        assert!(store.get("u").continuation().is_none());
    }

    #[test]
    fn test_blank_system_prompt_clears() {
        let store = ConversationStore::new("llama3", 10);
        store.set_system_prompt("u", Some("You are terse."));
        assert_eq!(store.get("u").system_prompt.as_deref(), Some("You are terse."));
        store.set_system_prompt("u", Some("   "));
        assert!(store.get("u").system_prompt.is_none());
    }

    #[test]
    fn test_generation_state_defaults_to_idle() {
        let store = ConversationStore::new("llama3", 10);
        assert_eq!(store.generation_state("nobody"), GenerationState::Idle);
        assert!(store.is_empty());
        store.set_generation_state("u", GenerationState::Generating);
        assert_eq!(store.generation_state("u"), GenerationState::Generating);
    }
}

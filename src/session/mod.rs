pub mod context;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, warn};

use crate::config::SessionConfig;
use crate::types::RuleKey;

pub use context::VariableContext;

/// The four bounded histories a session keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKind {
    /// Normalized input sentences.
    Input,
    /// Bot answers, one per input sentence (the prior-utterance context).
    That,
    /// Raw requests as received.
    Request,
    /// Full responses as returned.
    Response,
}

/// Sliding window of the most recent entries. Oldest entries roll off
/// silently once the depth is reached.
#[derive(Debug, Clone, Serialize)]
pub struct History {
    depth: usize,
    entries: VecDeque<String>,
}

impl History {
    pub fn new(depth: usize) -> Self {
        Self {
            depth,
            entries: VecDeque::with_capacity(depth.min(64)),
        }
    }

    pub fn push(&mut self, value: impl Into<String>) {
        self.entries.push_back(value.into());
        while self.entries.len() > self.depth {
            self.entries.pop_front();
        }
    }

    /// 1-based lookup from the most recent entry. Index 0 is treated as 1.
    pub fn get(&self, index: usize) -> Option<&str> {
        let back = index.max(1);
        self.entries
            .len()
            .checked_sub(back)
            .and_then(|i| self.entries.get(i))
            .map(String::as_str)
    }

    /// Entries from most recent to oldest.
    pub fn recent(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().rev().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }
}

/// Counters for rules a session has learned and unlearned.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LearningStats {
    pub learned: u64,
    pub unlearned: u64,
    pub durable: u64,
    pub last_learned_at: Option<DateTime<Utc>>,
}

/// Per-conversation state.
///
/// Fields are not synchronized individually: the engine holds the session
/// lock for the whole of one `process` call, and callers are expected to
/// have at most one call in flight per session.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationSession {
    pub id: String,
    variables: HashMap<String, String>,
    max_variables: usize,
    inputs: History,
    thats: History,
    requests: History,
    responses: History,
    topic: String,
    /// Rules learned by this session, for bulk removal.
    pub learned: Vec<RuleKey>,
    pub stats: LearningStats,
    pub created_at: DateTime<Utc>,
}

impl ConversationSession {
    pub fn new(id: impl Into<String>, config: &SessionConfig) -> Self {
        let depth = config.history_depth;
        Self {
            id: id.into(),
            variables: HashMap::new(),
            max_variables: config.max_variables,
            inputs: History::new(depth),
            thats: History::new(depth),
            requests: History::new(depth),
            responses: History::new(depth),
            topic: String::new(),
            learned: Vec::new(),
            stats: LearningStats::default(),
            created_at: Utc::now(),
        }
    }

    pub fn variable(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(String::as_str)
    }

    pub fn variables(&self) -> &HashMap<String, String> {
        &self.variables
    }

    /// Set a variable. New names are refused once the session holds
    /// `max_variables` entries; existing names can always be overwritten.
    pub fn set_variable(&mut self, name: &str, value: impl Into<String>) -> bool {
        if !self.variables.contains_key(name) && self.variables.len() >= self.max_variables {
            warn!(
                session = %self.id,
                name,
                limit = self.max_variables,
                "session variable limit reached, write dropped"
            );
            return false;
        }
        self.variables.insert(name.to_string(), value.into());
        true
    }

    pub fn remove_variable(&mut self, name: &str) -> Option<String> {
        self.variables.remove(name)
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn set_topic(&mut self, topic: impl Into<String>) {
        self.topic = topic.into();
    }

    pub fn history(&self, kind: HistoryKind) -> &History {
        match kind {
            HistoryKind::Input => &self.inputs,
            HistoryKind::That => &self.thats,
            HistoryKind::Request => &self.requests,
            HistoryKind::Response => &self.responses,
        }
    }

    pub fn append_history(&mut self, kind: HistoryKind, value: impl Into<String>) {
        let history = match kind {
            HistoryKind::Input => &mut self.inputs,
            HistoryKind::That => &mut self.thats,
            HistoryKind::Request => &mut self.requests,
            HistoryKind::Response => &mut self.responses,
        };
        history.push(value);
    }

    pub fn record_learned(&mut self, key: RuleKey, durable: bool) {
        if !self.learned.contains(&key) {
            self.learned.push(key);
        }
        self.stats.learned += 1;
        if durable {
            self.stats.durable += 1;
        }
        self.stats.last_learned_at = Some(Utc::now());
    }

    pub fn record_unlearned(&mut self, key: &RuleKey) {
        self.learned.retain(|k| k != key);
        self.stats.unlearned += 1;
    }
}

pub type SessionHandle = Arc<Mutex<ConversationSession>>;

/// Maps session ids to sessions.
///
/// Only the id-to-session map is guarded here; each session carries its own
/// lock.
pub struct SessionStore {
    sessions: RwLock<HashMap<String, SessionHandle>>,
    config: SessionConfig,
}

impl SessionStore {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn get(&self, id: &str) -> Option<SessionHandle> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions.get(id).map(Arc::clone)
    }

    /// Look up a session, creating an empty one on first use.
    pub fn get_or_create(&self, id: &str) -> SessionHandle {
        if let Some(session) = self.get(id) {
            return session;
        }

        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(sessions.entry(id.to_string()).or_insert_with(|| {
            debug!(session = id, "created session");
            Arc::new(Mutex::new(ConversationSession::new(id, &self.config)))
        }))
    }

    pub fn remove(&self, id: &str) -> Option<SessionHandle> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        sessions.remove(id)
    }

    pub fn count(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn ids(&self) -> Vec<String> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<String> = sessions.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::ConversationSession;
use crate::error::EngineError;
use crate::store::RuleStore;
use crate::template::VarScope;

/// Per-call evaluation state, created fresh for every input sentence and
/// threaded by reference through the whole recursive descent.
pub struct VariableContext<'a> {
    /// Scratch variables, visible for this call only.
    pub locals: HashMap<String, String>,
    pub session: &'a mut ConversationSession,
    pub store: &'a RwLock<RuleStore>,
    /// Recursive re-matches currently open, innermost included.
    pub depth: usize,
    pub max_depth: usize,
    /// Recursive re-matches started so far in this call.
    pub rematches: usize,
    pub max_rematches: usize,
}

impl<'a> VariableContext<'a> {
    pub fn new(
        session: &'a mut ConversationSession,
        store: &'a RwLock<RuleStore>,
        max_depth: usize,
    ) -> Self {
        Self {
            locals: HashMap::new(),
            session,
            store,
            depth: 0,
            max_depth,
            rematches: 0,
            max_rematches: usize::MAX,
        }
    }

    /// Also cap the total number of re-matches in this call.
    pub fn with_rematch_limit(mut self, max_rematches: usize) -> Self {
        self.max_rematches = max_rematches;
        self
    }

    pub fn topic(&self) -> &str {
        self.session.topic()
    }

    pub fn store(&self) -> RwLockReadGuard<'_, RuleStore> {
        self.store.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn store_mut(&self) -> RwLockWriteGuard<'_, RuleStore> {
        self.store.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open one recursive re-match. Fails when it would nest deeper than
    /// `max_depth` or start more than `max_rematches` in this call; on
    /// failure nothing is counted.
    ///
    /// Every successful call must be paired with [`exit_recursion`](Self::exit_recursion).
    pub fn enter_recursion(&mut self) -> Result<usize, EngineError> {
        if self.depth >= self.max_depth || self.rematches >= self.max_rematches {
            return Err(EngineError::RecursionLimitExceeded { depth: self.depth + 1 });
        }
        self.depth += 1;
        self.rematches += 1;
        Ok(self.depth)
    }

    pub fn exit_recursion(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    /// Resolve a variable: locals, then session variables, then rule-store
    /// globals, then bot properties. When the current rule has a topic, the
    /// topic-qualified name (`TOPIC.name`) is tried first.
    pub fn lookup(&self, name: &str, topic: Option<&str>) -> Option<String> {
        if let Some(topic) = topic.filter(|t| !t.is_empty()) {
            if let Some(value) = self.lookup_plain(&qualified(topic, name)) {
                return Some(value);
            }
        }
        self.lookup_plain(name)
    }

    fn lookup_plain(&self, name: &str) -> Option<String> {
        if let Some(value) = self.locals.get(name) {
            return Some(value.clone());
        }
        if name == "topic" {
            return Some(self.session.topic().to_string());
        }
        if let Some(value) = self.session.variable(name) {
            return Some(value.to_string());
        }
        let store = self.store();
        store
            .global(name)
            .or_else(|| store.property(name))
            .map(String::from)
    }

    /// Write a variable into the given tier. `topic` in the session tier
    /// changes the conversation topic.
    pub fn write(&mut self, scope: VarScope, name: &str, value: &str) {
        match scope {
            VarScope::Local => {
                self.locals.insert(name.to_string(), value.to_string());
            }
            VarScope::Session if name == "topic" => self.session.set_topic(value),
            VarScope::Session => {
                self.session.set_variable(name, value);
            }
            VarScope::Global => self.store_mut().set_global(name, value),
        }
    }
}

/// Topic-qualified variable name.
pub fn qualified(topic: &str, name: &str) -> String {
    format!("{topic}.{name}")
}

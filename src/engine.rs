//! The top-level entry point.

use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};
use tracing::{debug, info, warn};

use crate::cache::{CacheLayer, CacheStatsSnapshot};
use crate::config::{self, EngineConfig};
use crate::error::{EngineError, Result};
use crate::matcher::{MatchQuery, PatternMatcher};
use crate::normalize::{NormalizeKind, normalize, split_sentences};
use crate::persist::PersistenceWorker;
use crate::services::{CommandDispatcher, ExternalService, LearnedRuleSink};
use crate::session::{ConversationSession, HistoryKind, SessionHandle, SessionStore, VariableContext};
use crate::store::{self, LoadReport, RuleStore};
use crate::template::Template;
use crate::template::eval::{Evaluator, Frame};
use crate::types::{Captures, MatchResult, RuleKey};

/// Result of one `process` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Response {
    pub text: String,
    /// True when every sentence of the input matched a rule.
    pub matched: bool,
    /// The rule that answered the last matched sentence.
    pub rule: Option<RuleKey>,
    /// True when the input was a command handled outside matching.
    pub out_of_band: bool,
}

/// A rule engine: one rule store, its sessions and caches.
///
/// `Engine` is `Sync`; share it across threads behind an `Arc`. Calls for
/// different sessions run in parallel. Calls for the same session are
/// serialized by that session's lock.
pub struct Engine {
    config: EngineConfig,
    store: RwLock<RuleStore>,
    sessions: SessionStore,
    cache: CacheLayer,
    persistence: Option<PersistenceWorker>,
    service: Option<Box<dyn ExternalService>>,
    commands: Option<Box<dyn CommandDispatcher>>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_store(config, RuleStore::new())
    }

    pub fn with_store(config: EngineConfig, store: RuleStore) -> Result<Self> {
        config::validate(&config).map_err(|e| EngineError::Config(e.to_string()))?;
        info!(
            rules = store.len(),
            max_depth = config.matching.max_recursion_depth,
            cache = config.cache.enabled,
            "engine ready"
        );
        Ok(Self {
            cache: CacheLayer::new(&config.cache),
            sessions: SessionStore::new(config.session.clone()),
            store: RwLock::new(store),
            persistence: None,
            service: None,
            commands: None,
            config,
        })
    }

    /// Persist `<learnf>` rules through `sink` on a background thread.
    pub fn with_persistence(mut self, sink: Arc<dyn LearnedRuleSink>) -> Result<Self> {
        let worker = PersistenceWorker::spawn(sink).map_err(|e| EngineError::Persistence(e.to_string()))?;
        self.persistence = Some(worker);
        Ok(self)
    }

    pub fn with_service_client(mut self, service: Box<dyn ExternalService>) -> Self {
        self.service = Some(service);
        self
    }

    pub fn with_command_dispatcher(mut self, dispatcher: Box<dyn CommandDispatcher>) -> Self {
        self.commands = Some(dispatcher);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // --- Rule store ------------------------------------------------------------

    /// Replace the whole rule set. Calls in flight finish against the store
    /// they started with; later calls see the new one.
    pub fn set_rule_store(&self, store: RuleStore) {
        let rules = store.len();
        let mut current = self.store.write().unwrap_or_else(PoisonError::into_inner);
        *current = store;
        // Matching holds the read guard, so nothing computed against the old
        // store can be cached after this clear.
        self.cache.clear_store_derived();
        drop(current);
        info!(rules, "rule store replaced");
    }

    /// Leniently load markup into the current store.
    pub fn load_markup(&self, src: &str) -> LoadReport {
        let mut store = self.store.write().unwrap_or_else(PoisonError::into_inner);
        store::load_markup(&mut store, src)
    }

    pub fn load_markup_strict(&self, src: &str) -> Result<usize> {
        let mut store = self.store.write().unwrap_or_else(PoisonError::into_inner);
        store::load_markup_strict(&mut store, src)
    }

    /// Mutate the store in place (sets, maps, substitutions, ...).
    pub fn update_store<R>(&self, f: impl FnOnce(&mut RuleStore) -> R) -> R {
        let mut store = self.store.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut store)
    }

    pub fn store(&self) -> RwLockReadGuard<'_, RuleStore> {
        self.store.read().unwrap_or_else(PoisonError::into_inner)
    }

    // --- Sessions --------------------------------------------------------------

    /// Session `id`, created empty if it does not exist yet.
    pub fn create_session(&self, id: &str) -> SessionHandle {
        self.sessions.get_or_create(id)
    }

    /// A new session under a random id.
    pub fn new_session(&self) -> SessionHandle {
        self.sessions.get_or_create(&uuid::Uuid::new_v4().to_string())
    }

    pub fn session(&self, id: &str) -> Option<SessionHandle> {
        self.sessions.get(id)
    }

    pub fn remove_session(&self, id: &str) -> bool {
        let removed = self.sessions.remove(id).is_some();
        if removed {
            self.cache.invalidate_session(id);
        }
        removed
    }

    pub fn session_count(&self) -> usize {
        self.sessions.count()
    }

    // --- Processing ------------------------------------------------------------

    /// Answer `input` for an existing session.
    ///
    /// Input is split into sentences (when configured) and each is matched
    /// and evaluated in turn; answers are joined with a space. Inputs
    /// starting with the command prefix go to the command dispatcher
    /// instead, when one is installed.
    pub fn process(&self, session_id: &str, input: &str) -> Result<Response> {
        let handle = self
            .sessions
            .get(session_id)
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;

        if let Some(response) = self.dispatch_command(session_id, input) {
            return Ok(response);
        }

        let mut guard = handle.lock().unwrap_or_else(PoisonError::into_inner);
        let session = &mut *guard;
        session.append_history(HistoryKind::Request, input);

        let mut sentences = Vec::new();
        if self.config.matching.split_sentences {
            sentences = split_sentences(input);
        }
        if sentences.is_empty() {
            sentences.push(input.trim().to_string());
        }

        let evaluator = self.evaluator();
        let mut answers = Vec::with_capacity(sentences.len());
        let mut matched = true;
        let mut rule = None;
        for sentence in &sentences {
            let normalized = {
                let store = self.store();
                normalize(sentence, NormalizeKind::Pattern, store.normal_substitutions())
            };
            session.append_history(HistoryKind::Input, normalized);

            let outcome = {
                let mut ctx = self.context(session);
                evaluator.answer(sentence, &mut ctx)
            };
            let answer = match outcome {
                Some(answer) => {
                    rule = Some(answer.rule.key.clone());
                    answer.text
                }
                None => {
                    matched = false;
                    let err = EngineError::NoMatch {
                        input: sentence.clone(),
                    };
                    warn!(session = %session_id, error = %err, "using default response");
                    self.default_response(sentence)
                }
            };
            session.append_history(HistoryKind::That, answer.as_str());
            answers.push(answer);
        }

        let text = answers
            .iter()
            .filter(|a| !a.is_empty())
            .cloned()
            .collect::<Vec<_>>()
            .join(" ");
        session.append_history(HistoryKind::Response, text.as_str());
        debug!(session = %session_id, sentences = sentences.len(), matched, "processed input");

        Ok(Response {
            text,
            matched,
            rule,
            out_of_band: false,
        })
    }

    /// Get-or-create the session, then [`process`](Self::process).
    pub fn respond(&self, session_id: &str, input: &str) -> Result<String> {
        self.create_session(session_id);
        self.process(session_id, input).map(|r| r.text)
    }

    fn dispatch_command(&self, session_id: &str, input: &str) -> Option<Response> {
        let dispatcher = self.commands.as_ref()?;
        let command = input.trim_start().strip_prefix(self.config.commands.prefix.as_str())?;
        debug!(session = %session_id, command, "out-of-band command");
        let text = match dispatcher.dispatch(session_id, command.trim()) {
            Ok(text) => text,
            Err(e) => {
                warn!(session = %session_id, error = %e, "command failed");
                format!("command failed: {e}")
            }
        };
        Some(Response {
            text,
            matched: false,
            rule: None,
            out_of_band: true,
        })
    }

    fn default_response(&self, sentence: &str) -> String {
        let configured = &self.config.matching.default_response;
        if configured.is_empty() {
            sentence.to_string()
        } else {
            configured.clone()
        }
    }

    // --- Lower-level access ----------------------------------------------------

    /// Match raw text against the store without touching any session.
    /// `that_history` is most recent first.
    pub fn match_input(
        &self,
        input: &str,
        topic: Option<&str>,
        that_history: &[&str],
        prior_index: usize,
    ) -> Option<MatchResult> {
        let store = self.store();
        let subs = store.normal_substitutions();
        let pattern = normalize(input, NormalizeKind::Pattern, subs);
        let original = normalize(input, NormalizeKind::Matching, subs);
        let topic = topic
            .map(|t| normalize(t, NormalizeKind::Pattern, subs))
            .unwrap_or_default();
        let thats: Vec<String> = that_history
            .iter()
            .map(|t| normalize(t, NormalizeKind::PriorUtterance, subs))
            .collect();
        let query = MatchQuery {
            input: &pattern,
            original: &original,
            topic: &topic,
            thats: &thats,
            prior_index,
        };
        PatternMatcher::new(&store, Some(&self.cache)).find(&query)
    }

    /// A fresh evaluation context for `session`.
    pub fn context<'s>(&'s self, session: &'s mut ConversationSession) -> VariableContext<'s> {
        VariableContext::new(session, &self.store, self.config.matching.max_recursion_depth)
            .with_rematch_limit(self.config.matching.max_rematches)
    }

    /// Evaluate a template outside of matching, e.g. to render a greeting.
    /// The rule topic used for qualified reads is the session's topic.
    pub fn evaluate(&self, template: &Template, captures: &Captures, ctx: &mut VariableContext<'_>) -> String {
        let topic = normalize(ctx.topic(), NormalizeKind::Pattern, None);
        let frame = Frame {
            captures,
            topic: Some(topic.as_str()).filter(|t| !t.is_empty()),
        };
        self.evaluator().evaluate(template, frame, ctx)
    }

    fn evaluator(&self) -> Evaluator<'_> {
        Evaluator {
            cache: &self.cache,
            persistence: self.persistence.as_ref(),
            service: self.service.as_deref(),
            services: &self.config.services,
        }
    }

    /// Remove every rule the session learned. Globally loaded rules and
    /// rules learned by other sessions are untouched.
    pub fn unlearn_session(&self, session_id: &str) -> Result<usize> {
        let handle = self
            .sessions
            .get(session_id)
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;
        let mut session = handle.lock().unwrap_or_else(PoisonError::into_inner);

        let keys = std::mem::take(&mut session.learned);
        let mut removed = 0;
        {
            let mut store = self.store.write().unwrap_or_else(PoisonError::into_inner);
            for key in &keys {
                if store.remove(key).is_some() {
                    removed += 1;
                }
            }
        }
        session.stats.unlearned += removed as u64;
        info!(session = %session_id, removed, "unlearned session rules");
        Ok(removed)
    }

    pub fn cache_stats(&self) -> CacheStatsSnapshot {
        self.cache.stats()
    }

    /// Wait until queued persistence requests are written.
    pub fn flush_persistence(&self) {
        if let Some(worker) = &self.persistence {
            worker.flush();
        }
    }
}

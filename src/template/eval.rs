//! Template evaluation.
//!
//! Evaluation is a depth-first, left-to-right walk; every node produces a
//! string and siblings are concatenated. Unresolvable references produce
//! an empty string and a warning, never an error.

use chrono::format::{Item, StrftimeItems};
use rand::seq::SliceRandom;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::markup;
use super::{Attr, Branch, BranchTest, CaseTransform, LearnCategory, LearnPart, Node, Tag, TagKind, Template, VarRef, VarScope};
use crate::cache::layer::{TagKey, VariableKey};
use crate::cache::{CacheLayer, FreshnessInputs};
use crate::config::ServicesConfig;
use crate::error::EngineError;
use crate::matcher::{MatchQuery, PatternMatcher};
use crate::normalize::{NormalizeKind, normalize};
use crate::persist::PersistenceWorker;
use crate::services::ExternalService;
use crate::session::{HistoryKind, VariableContext};
use crate::store::{RuleStore, loader};
use crate::types::{Captures, Rule, RuleSource, StarKind};

/// Name and version reported by `<program/>`.
pub const PROGRAM: &str = concat!("ruleweave ", env!("CARGO_PKG_VERSION"));

const DEFAULT_DATE_FORMAT: &str = "%B %-d, %Y";

/// The captures and topic of the rule being evaluated.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'f> {
    pub captures: &'f Captures,
    /// The rule's topic pattern; qualifies variable reads.
    pub topic: Option<&'f str>,
}

/// The answer to one input sentence.
#[derive(Debug, Clone)]
pub struct Answer {
    pub rule: Arc<Rule>,
    pub text: String,
}

/// Evaluates templates against a [`VariableContext`].
///
/// Borrows everything it needs from the engine; create one per call.
pub struct Evaluator<'e> {
    pub cache: &'e CacheLayer,
    pub persistence: Option<&'e PersistenceWorker>,
    pub service: Option<&'e dyn ExternalService>,
    pub services: &'e ServicesConfig,
}

impl<'e> Evaluator<'e> {
    pub fn new(cache: &'e CacheLayer, services: &'e ServicesConfig) -> Self {
        Self {
            cache,
            persistence: None,
            service: None,
            services,
        }
    }

    /// Normalize, match and evaluate one sentence. `None` when no rule
    /// matches.
    pub fn answer(&self, sentence: &str, ctx: &mut VariableContext<'_>) -> Option<Answer> {
        let result = {
            let store = ctx.store();
            let input = self.normalized(sentence, NormalizeKind::Pattern, &store);
            let original = self.normalized(sentence, NormalizeKind::Matching, &store);
            let topic = self.normalized(ctx.topic(), NormalizeKind::Pattern, &store);
            let thats: Vec<String> = ctx
                .session
                .history(HistoryKind::That)
                .recent()
                .map(|that| self.normalized(that, NormalizeKind::PriorUtterance, &store))
                .collect();
            let query = MatchQuery {
                input: &input,
                original: &original,
                topic: &topic,
                thats: &thats,
                prior_index: 1,
            };
            PatternMatcher::new(&store, Some(self.cache)).find(&query)
        }?;

        let frame = Frame {
            captures: &result.captures,
            topic: result.rule.key.topic.as_deref(),
        };
        let text = self.evaluate(&result.rule.template, frame, ctx);
        Some(Answer {
            rule: Arc::clone(&result.rule),
            text: tidy(&text),
        })
    }

    /// Evaluate a whole template.
    pub fn evaluate(&self, template: &Template, frame: Frame<'_>, ctx: &mut VariableContext<'_>) -> String {
        self.eval_nodes(template.nodes(), frame, ctx)
    }

    fn eval_nodes(&self, nodes: &[Node], frame: Frame<'_>, ctx: &mut VariableContext<'_>) -> String {
        let mut out = String::new();
        for node in nodes {
            match node {
                Node::Text(text) => out.push_str(text),
                Node::Tag(tag) => out.push_str(&self.eval_tag(tag, frame, ctx)),
            }
        }
        out
    }

    fn eval_tag(&self, tag: &Tag, frame: Frame<'_>, ctx: &mut VariableContext<'_>) -> String {
        match &tag.kind {
            TagKind::Star { kind, index } => match frame.captures.get(*kind, *index) {
                Some(value) => value.to_string(),
                None => unresolved(format!("{} capture {index}", star_name(*kind))),
            },
            TagKind::Sr => {
                let star = frame.captures.get(StarKind::Input, 1).unwrap_or_default().to_string();
                self.srai(&star, ctx)
            }
            TagKind::Srai => {
                let input = self.eval_nodes(&tag.children, frame, ctx);
                self.srai(&input, ctx)
            }
            TagKind::Get(var) => self.get(var, frame, ctx),
            TagKind::Set(var) => self.set(var, &tag.children, frame, ctx),
            TagKind::Bot { name } => {
                let Some(name) = self.attr_text(name, frame, ctx) else {
                    return unresolved("bot tag without name".into());
                };
                match ctx.store().property(&name) {
                    Some(value) => value.to_string(),
                    None => unresolved(format!("bot property '{name}'")),
                }
            }
            TagKind::Think => {
                self.eval_nodes(&tag.children, frame, ctx);
                String::new()
            }
            TagKind::Condition { var, branches } => self.condition(var.as_ref(), branches, frame, ctx),
            TagKind::Random { branches } => match branches.choose(&mut rand::thread_rng()) {
                Some(branch) => self.eval_nodes(branch, frame, ctx),
                None => String::new(),
            },
            TagKind::Learn { durable, categories } => {
                for category in categories {
                    self.learn(category, *durable, frame, ctx);
                }
                String::new()
            }
            TagKind::Unlearn { durable, categories } => {
                for category in categories {
                    self.unlearn(category, *durable, frame, ctx);
                }
                String::new()
            }
            TagKind::Eval => self.eval_nodes(&tag.children, frame, ctx),
            TagKind::Case(transform) => apply_case(*transform, &self.eval_nodes(&tag.children, frame, ctx)),
            TagKind::Substitute { table } => {
                let text = self.eval_nodes(&tag.children, frame, ctx);
                self.substitute(*table, text.trim(), ctx)
            }
            TagKind::Map { name } => {
                let key = self.eval_nodes(&tag.children, frame, ctx);
                let Some(name) = self.attr_text(name, frame, ctx) else {
                    return unresolved("map tag without name".into());
                };
                self.map(&name, key.trim(), ctx)
            }
            TagKind::Array { name, index } => {
                let name = self.attr_text(name, frame, ctx).unwrap_or_default();
                let index = self.attr_text(index, frame, ctx).and_then(|i| super::parse_index(&i));
                match index.and_then(|i| ctx.store().array_get(&name, i).map(String::from)) {
                    Some(value) => value,
                    None => unresolved(format!("array '{name}' index {index:?}")),
                }
            }
            TagKind::List { name } => {
                let name = self.attr_text(name, frame, ctx).unwrap_or_default();
                match ctx.store().list(&name) {
                    Some(values) => values.join(" "),
                    None => unresolved(format!("list '{name}'")),
                }
            }
            TagKind::First => {
                let text = self.eval_nodes(&tag.children, frame, ctx);
                text.split_whitespace().next().unwrap_or_default().to_string()
            }
            TagKind::Rest => {
                let text = self.eval_nodes(&tag.children, frame, ctx);
                text.split_whitespace().skip(1).collect::<Vec<_>>().join(" ")
            }
            TagKind::History { kind, index } => {
                let index = self
                    .attr_text(index, frame, ctx)
                    .and_then(|i| super::parse_index(&i))
                    .unwrap_or(1);
                match ctx.session.history(*kind).get(index) {
                    Some(value) => value.to_string(),
                    None => {
                        debug!(?kind, index, "history entry not present");
                        String::new()
                    }
                }
            }
            TagKind::Topic => ctx.topic().to_string(),
            TagKind::Id => ctx.session.id.clone(),
            TagKind::Size => ctx.store().len().to_string(),
            TagKind::Vocabulary => ctx.store().vocabulary().to_string(),
            TagKind::Program => PROGRAM.to_string(),
            TagKind::Date { format } => format_date(format.as_deref()),
            TagKind::Sraix { service, default } => {
                let query = self.eval_nodes(&tag.children, frame, ctx);
                let service = self.attr_text(service, frame, ctx).unwrap_or_default();
                self.sraix(&service, query.trim(), default.as_deref())
            }
            TagKind::Br => "\n".to_string(),
            TagKind::Unknown(_) => self.eval_nodes(&tag.children, frame, ctx),
        }
    }

    /// Re-match `input` as a new sentence, counting against the recursion
    /// caps. Past either cap the input text itself is returned.
    fn srai(&self, input: &str, ctx: &mut VariableContext<'_>) -> String {
        let input = input.trim();
        if input.is_empty() {
            return String::new();
        }
        if let Err(e) = ctx.enter_recursion() {
            warn!(error = %e, input, "recursive match abandoned");
            return input.to_string();
        }
        let answer = self.answer(input, ctx);
        ctx.exit_recursion();
        match answer {
            Some(answer) => answer.text,
            None => {
                debug!(error = %EngineError::NoMatch { input: input.to_string() }, "recursive match found nothing");
                String::new()
            }
        }
    }

    fn attr_text(&self, attr: &Attr, frame: Frame<'_>, ctx: &mut VariableContext<'_>) -> Option<String> {
        match attr {
            Attr::Literal(value) => Some(value.clone()),
            Attr::Nodes(nodes) => Some(self.eval_nodes(nodes, frame, ctx).trim().to_string()),
            Attr::Missing => None,
        }
    }

    /// Resolve a variable reference. `None` when unset.
    fn resolve(&self, var: &VarRef, frame: Frame<'_>, ctx: &mut VariableContext<'_>) -> Option<String> {
        let name = self.attr_text(&var.name, frame, ctx).filter(|n| !n.is_empty())?;
        match var.scope {
            VarScope::Local => ctx.locals.get(&name).cloned(),
            VarScope::Session => self.lookup(&name, frame.topic, ctx),
            VarScope::Global => {
                let store = ctx.store();
                store.global(&name).or_else(|| store.property(&name)).map(String::from)
            }
        }
    }

    /// Full three-tier lookup through the variable cache.
    fn lookup(&self, name: &str, topic: Option<&str>, ctx: &VariableContext<'_>) -> Option<String> {
        let inputs = {
            let store = ctx.store();
            FreshnessInputs::new()
                .map("locals", &ctx.locals)
                .map("session", ctx.session.variables())
                .map("globals", store.globals())
                .map("properties", store.properties())
                .value("topic", ctx.topic())
        };
        let key = VariableKey {
            session: ctx.session.id.clone(),
            name: name.to_string(),
            topic: topic.map(String::from),
        };
        if let Some(value) = self.cache.variables.get(&key, &inputs) {
            return value;
        }
        let value = ctx.lookup(name, topic);
        self.cache.variables.set(key, value.clone(), &inputs);
        value
    }

    fn get(&self, var: &VarRef, frame: Frame<'_>, ctx: &mut VariableContext<'_>) -> String {
        match self.resolve(var, frame, ctx) {
            Some(value) => value,
            None => unresolved(format!("variable {:?}", var.name)),
        }
    }

    fn set(&self, var: &VarRef, children: &[Node], frame: Frame<'_>, ctx: &mut VariableContext<'_>) -> String {
        let value = self.eval_nodes(children, frame, ctx).trim().to_string();
        match self.attr_text(&var.name, frame, ctx).filter(|n| !n.is_empty()) {
            Some(name) => {
                debug!(scope = ?var.scope, name = %name, "set variable");
                ctx.write(var.scope, &name, &value);
            }
            None => {
                unresolved("set tag without a variable name".into());
            }
        }
        value
    }

    fn condition(
        &self,
        var: Option<&VarRef>,
        branches: &[Branch],
        frame: Frame<'_>,
        ctx: &mut VariableContext<'_>,
    ) -> String {
        for branch in branches {
            let taken = match &branch.test {
                BranchTest::Default => true,
                test => {
                    let Some(var) = branch.var.as_ref().or(var) else {
                        unresolved("condition branch without a variable".into());
                        continue;
                    };
                    let actual = self.resolve(var, frame, ctx).unwrap_or_default();
                    match test {
                        BranchTest::Value(expected) => {
                            let expected = self.attr_text(expected, frame, ctx).unwrap_or_default();
                            if expected.trim() == "*" {
                                !actual.trim().is_empty()
                            } else {
                                actual.trim().eq_ignore_ascii_case(expected.trim())
                            }
                        }
                        BranchTest::Set(name) => {
                            let name = self.attr_text(name, frame, ctx).unwrap_or_default();
                            let store = ctx.store();
                            let phrase = normalize(&actual, NormalizeKind::Pattern, store.normal_substitutions());
                            store.set_contains(&name, &phrase)
                        }
                        BranchTest::Default => true,
                    }
                }
            };
            if taken {
                return self.eval_nodes(&branch.body, frame, ctx);
            }
        }
        String::new()
    }

    /// Build the raw rule a `<learn>` category describes. `<eval>` parts
    /// are evaluated now; everything else is kept as written.
    fn learned_source(&self, category: &LearnCategory, frame: Frame<'_>, ctx: &mut VariableContext<'_>) -> RuleSource {
        let pattern_markup = self.render_parts(&category.pattern, frame, ctx);
        let that_markup = category.that.as_ref().map(|p| self.render_parts(p, frame, ctx));
        let topic_markup = category.topic.as_ref().map(|p| self.render_parts(p, frame, ctx));
        let template = self.render_parts(&category.template, frame, ctx);

        let store = ctx.store();
        let flatten = |src: &str| loader::pattern_text(&store, &markup::parse(src));
        RuleSource {
            pattern: flatten(&pattern_markup),
            that: that_markup.as_deref().map(flatten),
            that_index: category.that_index,
            topic: topic_markup.as_deref().map(flatten),
            template,
        }
    }

    fn render_parts(&self, parts: &[LearnPart], frame: Frame<'_>, ctx: &mut VariableContext<'_>) -> String {
        let mut out = String::new();
        for part in parts {
            match part {
                LearnPart::Raw(raw) => out.push_str(raw),
                LearnPart::Eval(nodes) => {
                    let value = self.eval_nodes(nodes, frame, ctx);
                    out.push_str(&markup::escape_text(value.trim()));
                }
            }
        }
        out
    }

    fn learn(&self, category: &LearnCategory, durable: bool, frame: Frame<'_>, ctx: &mut VariableContext<'_>) {
        let source = self.learned_source(category, frame, ctx);
        if source.pattern.trim().is_empty() {
            unresolved("learned rule has an empty pattern".into());
            return;
        }
        let key = ctx.store_mut().insert(source.clone());
        info!(session = %ctx.session.id, rule = %key, durable, "learned rule");
        ctx.session.record_learned(key.clone(), durable);
        if durable {
            match self.persistence {
                Some(worker) => worker.persist(key, source),
                None => debug!("no persistence configured, learned rule kept in memory only"),
            }
        }
    }

    fn unlearn(&self, category: &LearnCategory, durable: bool, frame: Frame<'_>, ctx: &mut VariableContext<'_>) {
        let source = self.learned_source(category, frame, ctx);
        let (key, removed) = {
            let mut store = ctx.store_mut();
            let key = store.key_for(&source);
            let removed = store.remove(&key).is_some();
            (key, removed)
        };
        if removed {
            info!(session = %ctx.session.id, rule = %key, "unlearned rule");
            ctx.session.record_unlearned(&key);
        } else {
            debug!(rule = %key, "unlearn found no such rule");
        }
        if durable {
            if let Some(worker) = self.persistence {
                worker.remove(key);
            }
        }
    }

    fn substitute(&self, table: &'static str, text: &str, ctx: &VariableContext<'_>) -> String {
        let store = ctx.store();
        let Some(substitutions) = store.substitutions(table) else {
            debug!(table, "no substitution table, text unchanged");
            return text.to_string();
        };
        let key = TagKey {
            tag: "substitute",
            name: table.to_string(),
            input: text.to_string(),
        };
        let inputs = generation_inputs(&store);
        if let Some(hit) = self.cache.tags.get(&key, &inputs) {
            return hit;
        }
        let result = substitutions.apply_text(text);
        self.cache.tags.set(key, result.clone(), &inputs);
        result
    }

    fn map(&self, name: &str, key: &str, ctx: &VariableContext<'_>) -> String {
        let store = ctx.store();
        let cache_key = TagKey {
            tag: "map",
            name: name.to_string(),
            input: key.to_string(),
        };
        let inputs = generation_inputs(&store);
        if let Some(hit) = self.cache.tags.get(&cache_key, &inputs) {
            return hit;
        }
        let value = match store.map_get(name, key) {
            Some(value) => value.to_string(),
            None => {
                debug!(map = name, key, "map has no entry");
                "unknown".to_string()
            }
        };
        self.cache.tags.set(cache_key, value.clone(), &inputs);
        value
    }

    fn sraix(&self, service: &str, query: &str, default: Option<&str>) -> String {
        let fallback = || default.unwrap_or(self.services.fallback.as_str()).to_string();
        let Some(client) = self.service else {
            warn!(service, "no external service client configured");
            return fallback();
        };
        match client.call(service, query, self.services.timeout()) {
            Ok(answer) => answer,
            Err(e) => {
                warn!(error = %EngineError::Service(e.to_string()), service, "external service failed");
                fallback()
            }
        }
    }

    /// Normalizer output through the normalization cache.
    fn normalized(&self, text: &str, kind: NormalizeKind, store: &RuleStore) -> String {
        let inputs = FreshnessInputs::new().value("substitutions", &store.substitution_generation());
        let key = (kind, text.to_string());
        if let Some(hit) = self.cache.normalized.get(&key, &inputs) {
            return hit;
        }
        let value = normalize(text, kind, store.normal_substitutions());
        self.cache.normalized.set(key, value.clone(), &inputs);
        value
    }
}

fn generation_inputs(store: &RuleStore) -> FreshnessInputs {
    FreshnessInputs::new().value("generation", &store.generation())
}

fn unresolved(what: String) -> String {
    warn!(error = %EngineError::UnresolvedReference(what), "template reference resolved to empty");
    String::new()
}

fn star_name(kind: StarKind) -> &'static str {
    match kind {
        StarKind::Input => "star",
        StarKind::That => "thatstar",
        StarKind::Topic => "topicstar",
    }
}

fn apply_case(transform: CaseTransform, text: &str) -> String {
    match transform {
        CaseTransform::Upper => text.to_uppercase(),
        CaseTransform::Lower => text.to_lowercase(),
        CaseTransform::Formal => text
            .split(' ')
            .map(capitalize)
            .collect::<Vec<_>>()
            .join(" "),
        CaseTransform::Sentence => {
            let trimmed = text.trim_start();
            let lead = &text[..text.len() - trimmed.len()];
            format!("{lead}{}", capitalize(trimmed))
        }
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

fn format_date(format: Option<&str>) -> String {
    let format = format.unwrap_or(DEFAULT_DATE_FORMAT);
    let items: Vec<Item<'_>> = StrftimeItems::new(format).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return unresolved(format!("date format '{format}'"));
    }
    chrono::Local::now().format_with_items(items.into_iter()).to_string()
}

/// Collapse runs of spaces and trim each line.
fn tidy(text: &str) -> String {
    text.split('\n')
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

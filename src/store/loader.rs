//! Bulk loading of rules from AIML-style markup.

use serde::Serialize;
use tracing::{debug, info, warn};

use super::RuleStore;
use crate::error::{EngineError, Result};
use crate::template::markup::{self, Element, Markup};
use crate::types::RuleSource;

/// Outcome of a lenient load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub loaded: usize,
    pub skipped: usize,
}

/// Load every `<category>` in `src`, descending through `<aiml>` and
/// `<topic name="...">` wrappers. Malformed markup is read leniently and
/// categories missing a pattern or template are skipped with a warning.
pub fn load_markup(store: &mut RuleStore, src: &str) -> LoadReport {
    let mut report = LoadReport::default();
    let mut ordinal = 0;
    for outcome in categories(store, &markup::parse(src), None, &mut ordinal) {
        match outcome {
            Ok(source) => {
                store.insert(source);
                report.loaded += 1;
            }
            Err(e) => {
                warn!(error = %e, "skipping category");
                report.skipped += 1;
            }
        }
    }
    info!(loaded = report.loaded, skipped = report.skipped, rules = store.len(), "loaded rule markup");
    report
}

/// Like [`load_markup`] but all-or-nothing: the first markup or category
/// error is returned and the store is left untouched.
pub fn load_markup_strict(store: &mut RuleStore, src: &str) -> Result<usize> {
    let nodes = markup::parse_strict(src)?;
    let mut ordinal = 0;
    let sources = categories(store, &nodes, None, &mut ordinal)
        .into_iter()
        .collect::<Result<Vec<_>>>()?;
    let count = sources.len();
    for source in sources {
        store.insert(source);
    }
    info!(loaded = count, rules = store.len(), "loaded rule markup (strict)");
    Ok(count)
}

fn categories(
    store: &RuleStore,
    nodes: &[Markup],
    topic: Option<&str>,
    ordinal: &mut usize,
) -> Vec<Result<RuleSource>> {
    let mut out = Vec::new();
    for node in nodes {
        let Markup::Element(e) = node else { continue };
        match e.name.as_str() {
            "aiml" => out.extend(categories(store, &e.children, topic, ordinal)),
            "topic" => {
                let name = e.attr("name").or(topic);
                out.extend(categories(store, &e.children, name, ordinal));
            }
            "category" => {
                *ordinal += 1;
                out.push(category(store, e, topic, *ordinal));
            }
            other => debug!(tag = other, "ignoring top-level element"),
        }
    }
    out
}

fn category(store: &RuleStore, e: &Element, topic: Option<&str>, index: usize) -> Result<RuleSource> {
    let invalid = |reason: &str| EngineError::InvalidRule {
        index,
        reason: reason.to_string(),
    };

    let pattern = e
        .child_elements("pattern")
        .next()
        .map(|p| pattern_text(store, &p.children))
        .ok_or_else(|| invalid("missing <pattern>"))?;
    if pattern.trim().is_empty() {
        return Err(invalid("empty <pattern>"));
    }
    let template = e
        .child_elements("template")
        .next()
        .map(Element::inner_markup)
        .ok_or_else(|| invalid("missing <template>"))?;

    let mut source = RuleSource::new(pattern, template);
    if let Some(that) = e.child_elements("that").next() {
        source.that = Some(pattern_text(store, &that.children));
        source.that_index = that.attr("index").and_then(crate::template::parse_index);
    }
    source.topic = e
        .child_elements("topic")
        .next()
        .map(|t| pattern_text(store, &t.children))
        .or_else(|| topic.map(String::from));
    Ok(source)
}

/// Flatten pattern markup to text. Set references are kept as markup for
/// the normalizer; `<bot name="..."/>` is replaced by the property value.
pub(crate) fn pattern_text(store: &RuleStore, nodes: &[Markup]) -> String {
    let mut out = String::new();
    for node in nodes {
        match node {
            Markup::Text(t) => out.push_str(t),
            Markup::Element(e) if e.name == "set" => {
                out.push_str(&format!(" <set>{}</set> ", e.text().trim()));
            }
            Markup::Element(e) if e.name == "bot" => {
                let name = e.attr("name").unwrap_or_default();
                match store.property(name) {
                    Some(value) => out.push_str(value),
                    None => warn!(name, "unknown bot property in pattern"),
                }
            }
            Markup::Element(e) => out.push_str(&e.text()),
        }
        out.push(' ');
    }
    out
}

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::template::Template;

/// Raw, unnormalized rule as written in markup or learned at runtime.
///
/// Learned rules are persisted in this form, next to their key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSource {
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub that: Option<String>,
    /// 1-based index into the prior-utterance history the `that` pattern
    /// is compared against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub that_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    pub template: String,
}

impl RuleSource {
    pub fn new(pattern: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            that: None,
            that_index: None,
            topic: None,
            template: template.into(),
        }
    }

    pub fn with_that(mut self, that: impl Into<String>) -> Self {
        self.that = Some(that.into());
        self
    }

    pub fn with_that_index(mut self, index: usize) -> Self {
        self.that_index = Some(index);
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }
}

/// Composite key a rule is stored under: normalized pattern plus the
/// normalized prior-utterance and topic context when present.
///
/// A context consisting of a lone wildcard is stored as `None`, so
/// `<that>*</that>` and a missing `<that>` produce the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleKey {
    pub pattern: String,
    pub that: Option<String>,
    pub that_index: Option<usize>,
    pub topic: Option<String>,
}

impl fmt::Display for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.pattern)?;
        if let Some(that) = &self.that {
            match self.that_index {
                Some(index) => write!(f, " <THAT:{index}> {that}")?,
                None => write!(f, " <THAT> {that}")?,
            }
        }
        if let Some(topic) = &self.topic {
            write!(f, " <TOPIC> {topic}")?;
        }
        Ok(())
    }
}

/// A stored rule: its key, the raw source it was built from and the
/// template parsed once at construction.
#[derive(Debug)]
pub struct Rule {
    pub key: RuleKey,
    pub source: RuleSource,
    pub template: Arc<Template>,
}

/// Which pattern a capture came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StarKind {
    Input,
    That,
    Topic,
}

/// Wildcard captures for one match, numbered left-to-right per pattern.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Captures {
    pub input: Vec<String>,
    pub that: Vec<String>,
    pub topic: Vec<String>,
}

impl Captures {
    /// 1-based capture lookup.
    pub fn get(&self, kind: StarKind, index: usize) -> Option<&str> {
        let list = match kind {
            StarKind::Input => &self.input,
            StarKind::That => &self.that,
            StarKind::Topic => &self.topic,
        };
        index
            .checked_sub(1)
            .and_then(|i| list.get(i))
            .map(String::as_str)
    }
}

/// The rule selected for an input together with its captures.
#[derive(Debug, Clone)]
pub struct MatchResult {
    pub rule: Arc<Rule>,
    pub captures: Captures,
    /// Context tier the rule matched in (0 = exact that and exact topic).
    pub tier: usize,
}

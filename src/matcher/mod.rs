//! Rule selection.
//!
//! Every candidate that matches is ranked and the lowest rank wins:
//!
//! 1. context tier: `that` specificity, then `topic` specificity
//!    (exact > wildcard > absent), giving tiers 0..=8;
//! 2. longer literal prefix before the first wildcard;
//! 3. high-priority first wildcard over low-priority;
//! 4. fewer wildcard and set tokens;
//! 5. more literal tokens;
//! 6. the rule key, so the choice never depends on load order.

pub mod pattern;

use std::cmp::Reverse;
use std::sync::Arc;
use tracing::debug;

use crate::cache::{CacheLayer, FreshnessInputs};
use crate::store::RuleStore;
use crate::types::{Captures, MatchResult, Rule, RuleKey};

pub use pattern::{CompiledPattern, Priority, Token};

/// A normalized match request.
#[derive(Debug, Clone, Copy)]
pub struct MatchQuery<'a> {
    /// Pattern-normalized input.
    pub input: &'a str,
    /// The same input with its original case, used for captures.
    pub original: &'a str,
    /// Pattern-normalized current topic, empty when unset.
    pub topic: &'a str,
    /// Pattern-normalized prior utterances, most recent first.
    pub thats: &'a [String],
    /// 1-based entry of `thats` compared against rules without their own
    /// index. 0 means the most recent.
    pub prior_index: usize,
}

/// Cache key for a whole match request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MatchKey {
    pub original: String,
    pub topic: String,
    pub thats: Vec<String>,
    pub prior_index: usize,
}

impl MatchKey {
    /// Key for `query`, keeping only the first `that_depth` prior
    /// utterances since no rule can look further back.
    pub fn new(query: &MatchQuery<'_>, that_depth: usize) -> Self {
        Self {
            original: query.original.to_string(),
            topic: query.topic.to_string(),
            thats: query.thats.iter().take(that_depth).cloned().collect(),
            prior_index: query.prior_index,
        }
    }
}

type Rank<'r> = (usize, Reverse<usize>, u8, usize, Reverse<usize>, &'r RuleKey);

/// Finds the best rule for a query against one store.
pub struct PatternMatcher<'a> {
    store: &'a RuleStore,
    cache: Option<&'a CacheLayer>,
}

impl<'a> PatternMatcher<'a> {
    pub fn new(store: &'a RuleStore, cache: Option<&'a CacheLayer>) -> Self {
        Self { store, cache }
    }

    /// The highest-ranked matching rule, or `None` when nothing matches.
    pub fn find(&self, query: &MatchQuery<'_>) -> Option<MatchResult> {
        let Some(cache) = self.cache else {
            return self.search(query);
        };
        let key = MatchKey::new(query, self.store.that_depth(query.prior_index));
        let inputs = FreshnessInputs::new().value("rules", &self.store.digest());
        if let Some(hit) = cache.matches.get(&key, &inputs) {
            return hit;
        }
        let result = self.search(query);
        cache.matches.set(key, result.clone(), &inputs);
        result
    }

    fn search(&self, query: &MatchQuery<'_>) -> Option<MatchResult> {
        let words: Vec<&str> = query.input.split_whitespace().collect();
        let original: Vec<&str> = query.original.split_whitespace().collect();
        // Captures come from the case-preserving form when it lines up
        // word for word with the matched form.
        let capture_words = if original.len() == words.len() { &original } else { &words };
        let topic_words: Vec<&str> = query.topic.split_whitespace().collect();

        let mut best: Option<(Rank<'_>, &Arc<Rule>, Captures)> = None;
        for rule in self.store.candidates(words.first().copied()) {
            let pattern = self.compiled(&rule.key.pattern);
            let that = rule.key.that.as_deref().map(|p| self.compiled(p));
            let topic = rule.key.topic.as_deref().map(|p| self.compiled(p));

            let rank: Rank<'_> = (
                tier(that.as_deref(), topic.as_deref()),
                Reverse(pattern.literal_prefix),
                match pattern.first_wildcard {
                    None => 0,
                    Some(Priority::High) => 1,
                    Some(Priority::Low) => 2,
                },
                pattern.wildcard_count,
                Reverse(pattern.literal_count),
                &rule.key,
            );
            if best.as_ref().is_some_and(|(b, _, _)| *b <= rank) {
                continue;
            }

            let Some(input_spans) = pattern.match_words(&words, self.store) else {
                continue;
            };
            let that_captures = match &that {
                Some(that) => {
                    let index = rule.key.that_index.unwrap_or(query.prior_index).max(1);
                    let prior = query.thats.get(index - 1).map(String::as_str).unwrap_or("");
                    let prior_words: Vec<&str> = prior.split_whitespace().collect();
                    match that.match_words(&prior_words, self.store) {
                        Some(spans) => collect(&prior_words, &spans),
                        None => continue,
                    }
                }
                None => Vec::new(),
            };
            let topic_captures = match &topic {
                Some(topic) => match topic.match_words(&topic_words, self.store) {
                    Some(spans) => collect(&topic_words, &spans),
                    None => continue,
                },
                None => Vec::new(),
            };

            let captures = Captures {
                input: collect(capture_words, &input_spans),
                that: that_captures,
                topic: topic_captures,
            };
            best = Some((rank, rule, captures));
        }

        let (rank, rule, captures) = best?;
        debug!(rule = %rule.key, tier = rank.0, "matched");
        Some(MatchResult {
            rule: Arc::clone(rule),
            captures,
            tier: rank.0,
        })
    }

    fn compiled(&self, pattern: &str) -> Arc<CompiledPattern> {
        let Some(cache) = self.cache else {
            return Arc::new(CompiledPattern::compile(pattern));
        };
        let inputs = FreshnessInputs::new();
        if let Some(compiled) = cache.patterns.get(pattern, &inputs) {
            return compiled;
        }
        let compiled = Arc::new(CompiledPattern::compile(pattern));
        cache.patterns.set(pattern.to_string(), Arc::clone(&compiled), &inputs);
        compiled
    }
}

/// Specificity of a context pattern: 2 exact, 1 with wildcards, 0 absent.
fn specificity(pattern: Option<&CompiledPattern>) -> usize {
    match pattern {
        Some(p) if p.is_exact() => 2,
        Some(_) => 1,
        None => 0,
    }
}

fn tier(that: Option<&CompiledPattern>, topic: Option<&CompiledPattern>) -> usize {
    (2 - specificity(that)) * 3 + (2 - specificity(topic))
}

fn collect(words: &[&str], spans: &[(usize, usize)]) -> Vec<String> {
    spans.iter().map(|&(start, end)| words[start..end].join(" ")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_put_that_before_topic() {
        let exact = CompiledPattern::compile("HELLO");
        let wild = CompiledPattern::compile("* HELLO");
        assert_eq!(tier(Some(&exact), Some(&exact)), 0);
        assert_eq!(tier(Some(&exact), None), 2);
        assert_eq!(tier(Some(&wild), Some(&exact)), 3);
        assert_eq!(tier(None, Some(&exact)), 6);
        assert_eq!(tier(None, None), 8);
    }
}

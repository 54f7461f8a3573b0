pub mod loader;

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::debug;

use crate::normalize::{NormalizeKind, Substitutions, is_set_token, is_wildcard_symbol, normalize};
use crate::template::Template;
use crate::types::{Rule, RuleKey, RuleSource};

pub use loader::{LoadReport, load_markup, load_markup_strict};

/// Substitution table applied to every input before matching.
pub const NORMAL_TABLE: &str = "normal";

/// A named word-set. Members are stored normalized and may span several
/// words.
#[derive(Debug, Clone, Default)]
pub struct WordSet {
    members: HashSet<String>,
    max_words: usize,
}

impl WordSet {
    pub fn contains(&self, phrase: &str) -> bool {
        self.members.contains(phrase)
    }

    /// Word count of the longest member.
    pub fn max_words(&self) -> usize {
        self.max_words
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// In-memory rule set plus the named data templates consult.
///
/// Mutated only by loading and by learn/unlearn. Every change that can
/// affect matching bumps `generation`; changes to substitution tables also
/// bump `substitution_generation`.
#[derive(Debug, Default)]
pub struct RuleStore {
    rules: HashMap<RuleKey, Arc<Rule>>,
    by_first_word: HashMap<String, BTreeSet<RuleKey>>,
    wildcard_first: BTreeSet<RuleKey>,
    // Rules with a prior-utterance context, counted by that index (0 = none).
    that_refs: BTreeMap<usize, usize>,
    sets: HashMap<String, WordSet>,
    maps: HashMap<String, HashMap<String, String>>,
    arrays: HashMap<String, Vec<String>>,
    lists: HashMap<String, Vec<String>>,
    properties: HashMap<String, String>,
    globals: HashMap<String, String>,
    substitutions: HashMap<String, Substitutions>,
    generation: u64,
    substitution_generation: u64,
}

impl RuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    // --- Rules ---------------------------------------------------------------

    /// Composite key for a raw rule: every part normalized, lone-wildcard
    /// contexts dropped.
    pub fn key_for(&self, source: &RuleSource) -> RuleKey {
        let subs = self.normal_substitutions();
        let context = |raw: &Option<String>| {
            raw.as_deref()
                .map(|p| normalize(p, NormalizeKind::Pattern, subs))
                .filter(|p| !p.is_empty() && !is_wildcard_symbol(p))
        };
        let that = context(&source.that);
        RuleKey {
            pattern: normalize(&source.pattern, NormalizeKind::Pattern, subs),
            that_index: that.as_ref().and(source.that_index).filter(|&i| i > 0),
            that,
            topic: context(&source.topic),
        }
    }

    /// Insert a rule, replacing any rule with the same key.
    pub fn insert(&mut self, source: RuleSource) -> RuleKey {
        let key = self.key_for(&source);
        let rule = Rule {
            key: key.clone(),
            template: Arc::new(Template::parse(&source.template)),
            source,
        };
        if self.rules.insert(key.clone(), Arc::new(rule)).is_some() {
            debug!(rule = %key, "replaced existing rule");
        } else if key.that.is_some() {
            *self.that_refs.entry(key.that_index.unwrap_or(0)).or_default() += 1;
        }
        self.index(&key);
        self.generation += 1;
        key
    }

    pub fn remove(&mut self, key: &RuleKey) -> Option<Arc<Rule>> {
        let removed = self.rules.remove(key)?;
        if key.that.is_some() {
            let index = key.that_index.unwrap_or(0);
            if let Some(count) = self.that_refs.get_mut(&index) {
                *count -= 1;
                if *count == 0 {
                    self.that_refs.remove(&index);
                }
            }
        }
        match first_literal(&key.pattern) {
            Some(word) => {
                if let Some(keys) = self.by_first_word.get_mut(word) {
                    keys.remove(key);
                    if keys.is_empty() {
                        self.by_first_word.remove(word);
                    }
                }
            }
            None => {
                self.wildcard_first.remove(key);
            }
        }
        self.generation += 1;
        Some(removed)
    }

    /// Remove the rule a raw source would be stored under.
    pub fn remove_source(&mut self, source: &RuleSource) -> Option<Arc<Rule>> {
        let key = self.key_for(source);
        self.remove(&key)
    }

    fn index(&mut self, key: &RuleKey) {
        match first_literal(&key.pattern) {
            Some(word) => {
                self.by_first_word
                    .entry(word.to_string())
                    .or_default()
                    .insert(key.clone());
            }
            None => {
                self.wildcard_first.insert(key.clone());
            }
        }
    }

    pub fn get(&self, key: &RuleKey) -> Option<&Arc<Rule>> {
        self.rules.get(key)
    }

    pub fn contains(&self, key: &RuleKey) -> bool {
        self.rules.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> impl Iterator<Item = &Arc<Rule>> {
        self.rules.values()
    }

    /// Rules that can possibly match an input starting with `first_word`:
    /// those whose pattern starts with that literal plus every rule whose
    /// pattern starts with a wildcard or set reference.
    pub fn candidates<'a>(&'a self, first_word: Option<&str>) -> impl Iterator<Item = &'a Arc<Rule>> + 'a {
        let literal = first_word
            .and_then(|w| self.by_first_word.get(w))
            .into_iter()
            .flatten();
        literal
            .chain(self.wildcard_first.iter())
            .filter_map(|key| self.rules.get(key))
    }

    // --- Sets, maps, arrays, lists ------------------------------------------

    pub fn add_set<I, S>(&mut self, name: &str, members: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let subs = self.substitutions.get(NORMAL_TABLE);
        let set = self.sets.entry(table_name(name)).or_default();
        for member in members {
            let member = normalize(member.as_ref(), NormalizeKind::Pattern, subs);
            if member.is_empty() {
                continue;
            }
            set.max_words = set.max_words.max(member.split(' ').count());
            set.members.insert(member);
        }
        self.generation += 1;
    }

    pub fn remove_set(&mut self, name: &str) -> bool {
        let removed = self.sets.remove(&table_name(name)).is_some();
        if removed {
            self.generation += 1;
        }
        removed
    }

    pub fn set(&self, name: &str) -> Option<&WordSet> {
        self.sets.get(&table_name(name))
    }

    /// Whether a normalized phrase belongs to the named set.
    pub fn set_contains(&self, name: &str, phrase: &str) -> bool {
        self.set(name).is_some_and(|s| s.contains(phrase))
    }

    pub fn set_count(&self) -> usize {
        self.sets.len()
    }

    pub fn add_map<I, K, V>(&mut self, name: &str, pairs: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let map = self.maps.entry(table_name(name)).or_default();
        for (key, value) in pairs {
            map.insert(map_key(key.as_ref()), value.into());
        }
        self.generation += 1;
    }

    pub fn map_get(&self, name: &str, key: &str) -> Option<&str> {
        self.maps
            .get(&table_name(name))
            .and_then(|m| m.get(&map_key(key)))
            .map(String::as_str)
    }

    pub fn add_array<I, S>(&mut self, name: &str, values: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arrays
            .insert(table_name(name), values.into_iter().map(Into::into).collect());
        self.generation += 1;
    }

    /// 1-based array element.
    pub fn array_get(&self, name: &str, index: usize) -> Option<&str> {
        let values = self.arrays.get(&table_name(name))?;
        index
            .checked_sub(1)
            .and_then(|i| values.get(i))
            .map(String::as_str)
    }

    pub fn add_list<I, S>(&mut self, name: &str, values: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lists
            .entry(table_name(name))
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self.generation += 1;
    }

    pub fn list(&self, name: &str) -> Option<&[String]> {
        self.lists.get(&table_name(name)).map(Vec::as_slice)
    }

    // --- Properties, globals, substitutions ---------------------------------

    pub fn set_property(&mut self, name: &str, value: impl Into<String>) {
        self.properties.insert(name.to_string(), value.into());
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }

    pub fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }

    pub fn set_global(&mut self, name: &str, value: impl Into<String>) {
        self.globals.insert(name.to_string(), value.into());
    }

    pub fn global(&self, name: &str) -> Option<&str> {
        self.globals.get(name).map(String::as_str)
    }

    pub fn globals(&self) -> &HashMap<String, String> {
        &self.globals
    }

    /// Add one substitution to a named table (`normal`, `person`, ...).
    ///
    /// Load `normal` substitutions before rules: rule keys are normalized
    /// with the table as it is at insertion time.
    pub fn add_substitution(&mut self, table: &str, from: &str, to: &str) {
        self.substitutions
            .entry(table.to_ascii_lowercase())
            .or_default()
            .add(from, to);
        self.generation += 1;
        self.substitution_generation += 1;
    }

    pub fn substitutions(&self, table: &str) -> Option<&Substitutions> {
        self.substitutions.get(&table.to_ascii_lowercase())
    }

    pub fn normal_substitutions(&self) -> Option<&Substitutions> {
        self.substitutions.get(NORMAL_TABLE)
    }

    // --- Change tracking -----------------------------------------------------

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn substitution_generation(&self) -> u64 {
        self.substitution_generation
    }

    /// Number of prior utterances, most recent first, that any rule can be
    /// compared against when unindexed contexts use `prior_index`.
    pub fn that_depth(&self, prior_index: usize) -> usize {
        self.that_refs
            .keys()
            .map(|&index| if index == 0 { prior_index.max(1) } else { index })
            .max()
            .unwrap_or(0)
    }

    /// Digest of rule count, set count and generation, used as the
    /// freshness input of match results.
    pub fn digest(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        (self.rules.len(), self.sets.len(), self.generation).hash(&mut hasher);
        hasher.finish()
    }

    /// Distinct literal words across all patterns and set members.
    pub fn vocabulary(&self) -> usize {
        let mut words: HashSet<&str> = HashSet::new();
        for key in self.rules.keys() {
            words.extend(
                key.pattern
                    .split(' ')
                    .filter(|w| !w.is_empty() && !is_wildcard_symbol(w) && !is_set_token(w)),
            );
        }
        for set in self.sets.values() {
            words.extend(set.members.iter().flat_map(|m| m.split(' ')));
        }
        words.len()
    }
}

fn table_name(name: &str) -> String {
    name.trim().to_uppercase()
}

fn map_key(key: &str) -> String {
    normalize(key, NormalizeKind::Pattern, None)
}

fn first_literal(pattern: &str) -> Option<&str> {
    pattern
        .split(' ')
        .next()
        .filter(|w| !w.is_empty() && !is_wildcard_symbol(w) && !is_set_token(w))
}

//! Text canonicalization for matching.
//!
//! Every normalization is a pure function of the text and the substitution
//! table passed in, and is idempotent: normalizing normalized text returns
//! it unchanged.

mod contractions;

use regex::Regex;
use std::sync::LazyLock;
use tracing::warn;

pub use contractions::expand_contractions;

/// Substitution passes before giving up on a table that never settles.
const MAX_SUBSTITUTION_PASSES: usize = 16;

static SET_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<set>\s*([^<\s]+)\s*</set>").expect("set reference regex is valid")
});

/// Which canonical form to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NormalizeKind {
    /// Uppercased, punctuation-free form compared against rule patterns.
    Pattern,
    /// Same tokens as `Pattern` but with the original case, used for captures.
    Matching,
    /// Last sentence of a bot utterance in `Pattern` form.
    PriorUtterance,
    /// Contraction expansion only, case preserved.
    Contractions,
}

/// Normalize `text` into the requested form.
pub fn normalize(text: &str, kind: NormalizeKind, substitutions: Option<&Substitutions>) -> String {
    match kind {
        NormalizeKind::Contractions => expand_contractions(text),
        NormalizeKind::Matching => tokens(text, substitutions).join(" "),
        NormalizeKind::Pattern => tokens(text, substitutions).join(" ").to_uppercase(),
        NormalizeKind::PriorUtterance => {
            let sentences = split_sentences(text);
            let last = sentences.last().map(String::as_str).unwrap_or("");
            normalize(last, NormalizeKind::Pattern, substitutions)
        }
    }
}

/// Split free text into sentences on `.`, `!` and `?` followed by whitespace
/// or the end of the text. Empty sentences are dropped.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        current.push(c);
        if matches!(c, '.' | '!' | '?') && chars.peek().is_none_or(|next| next.is_whitespace()) {
            push_sentence(&mut sentences, &current);
            current.clear();
        }
    }
    push_sentence(&mut sentences, &current);
    sentences
}

fn push_sentence(sentences: &mut Vec<String>, raw: &str) {
    let trimmed = raw.trim().trim_end_matches(['.', '!', '?']).trim();
    if !trimmed.is_empty() {
        sentences.push(trimmed.to_string());
    }
}

/// True for the four wildcard symbols a pattern may contain.
pub fn is_wildcard_symbol(token: &str) -> bool {
    matches!(token, "*" | "_" | "^" | "#")
}

/// True for a normalized set reference token, `<SET>NAME</SET>`.
pub fn is_set_token(token: &str) -> bool {
    set_token_name(token).is_some()
}

/// Name of the set a normalized set reference token points at.
pub fn set_token_name(token: &str) -> Option<&str> {
    token
        .strip_prefix("<SET>")
        .and_then(|rest| rest.strip_suffix("</SET>"))
        .filter(|name| !name.is_empty())
}

fn tokens(text: &str, substitutions: Option<&Substitutions>) -> Vec<String> {
    let text = text.replace(['\u{2019}', '\u{2018}'], "'");
    let text = SET_REF.replace_all(&text, |caps: &regex::Captures<'_>| {
        format!(" <SET>{}</SET> ", caps[1].to_uppercase())
    });

    let mut words: Vec<String> = Vec::new();
    for raw in text.split_whitespace() {
        if is_set_token(raw) || is_wildcard_symbol(raw) {
            words.push(raw.to_string());
            continue;
        }
        let expanded = expand_contractions(raw);
        for piece in expanded.split_whitespace() {
            words.extend(strip_punctuation(piece).split_whitespace().map(String::from));
        }
    }

    match substitutions {
        Some(table) if !table.is_empty() => table.apply_until_stable(words),
        _ => words,
    }
}

/// Drop apostrophes and turn any other punctuation into word breaks.
fn strip_punctuation(word: &str) -> String {
    if is_wildcard_symbol(word) {
        return word.to_string();
    }
    let mut out = String::with_capacity(word.len());
    for c in word.chars() {
        if c.is_alphanumeric() || c == '_' {
            out.push(c);
        } else if c != '\'' {
            out.push(' ');
        }
    }
    out
}

/// A substitution table (normal, person, gender, ...).
///
/// Keys are stored as uppercase token sequences and compared
/// case-insensitively; replacements keep the case they were given in.
#[derive(Debug, Clone, Default)]
pub struct Substitutions {
    entries: Vec<Substitution>,
}

#[derive(Debug, Clone)]
struct Substitution {
    from: Vec<String>,
    to: Vec<String>,
}

impl Substitutions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a substitution. Both sides are run through contraction expansion
    /// and punctuation stripping so they line up with normalized text.
    pub fn add(&mut self, from: &str, to: &str) {
        let from: Vec<String> = clean_words(from).iter().map(|w| w.to_uppercase()).collect();
        if from.is_empty() {
            return;
        }
        let to = clean_words(to);
        self.entries.retain(|e| e.from != from);
        self.entries.push(Substitution { from, to });
        // Longest key first so multi-word keys win over their prefixes.
        self.entries.sort_by(|a, b| b.from.len().cmp(&a.from.len()).then(a.from.cmp(&b.from)));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// One left-to-right pass over `words`. Replaced words are not revisited.
    pub fn apply_once(&self, words: &[String]) -> Vec<String> {
        let mut out = Vec::with_capacity(words.len());
        let mut i = 0;
        'outer: while i < words.len() {
            for entry in &self.entries {
                let end = i + entry.from.len();
                if end <= words.len()
                    && words[i..end]
                        .iter()
                        .zip(&entry.from)
                        .all(|(w, k)| w.to_uppercase() == *k)
                {
                    out.extend(entry.to.iter().cloned());
                    i = end;
                    continue 'outer;
                }
            }
            out.push(words[i].clone());
            i += 1;
        }
        out
    }

    /// Apply passes until the words stop changing.
    pub fn apply_until_stable(&self, mut words: Vec<String>) -> Vec<String> {
        for _ in 0..MAX_SUBSTITUTION_PASSES {
            let next = self.apply_once(&words);
            if next == words {
                return words;
            }
            words = next;
        }
        warn!(
            entries = self.entries.len(),
            "substitution table did not settle after {MAX_SUBSTITUTION_PASSES} passes"
        );
        words
    }

    /// Single-pass substitution over free text, used by the person and
    /// gender template tags. Punctuation stuck to a word is kept in place.
    pub fn apply_text(&self, text: &str) -> String {
        let raw: Vec<&str> = text.split_whitespace().collect();
        let mut out: Vec<String> = Vec::with_capacity(raw.len());
        let mut i = 0;
        'outer: while i < raw.len() {
            for entry in &self.entries {
                let end = i + entry.from.len();
                if end > raw.len() {
                    continue;
                }
                let matched = raw[i..end].iter().zip(&entry.from).all(|(w, k)| {
                    let core = w.trim_matches(|c: char| !c.is_alphanumeric() && c != '\'');
                    strip_punctuation(core).to_uppercase() == *k
                });
                if matched {
                    let trailing: String = raw[end - 1]
                        .chars()
                        .rev()
                        .take_while(|c| c.is_ascii_punctuation() && *c != '\'')
                        .collect::<Vec<_>>()
                        .into_iter()
                        .rev()
                        .collect();
                    let mut replacement = entry.to.join(" ");
                    replacement.push_str(&trailing);
                    if !replacement.is_empty() {
                        out.push(replacement);
                    }
                    i = end;
                    continue 'outer;
                }
            }
            out.push(raw[i].to_string());
            i += 1;
        }
        out.join(" ")
    }
}

fn clean_words(text: &str) -> Vec<String> {
    expand_contractions(text)
        .split_whitespace()
        .flat_map(|w| {
            strip_punctuation(w)
                .split_whitespace()
                .map(String::from)
                .collect::<Vec<_>>()
        })
        .collect()
}

use crate::normalize::set_token_name;
use crate::store::RuleStore;

/// Wildcard priority. High-priority wildcards (`_`, `#`) outrank
/// low-priority ones (`*`, `^`) at equal literal prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    High,
    Low,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Literal(String),
    Wild { priority: Priority, min: usize },
    Set(String),
}

impl Token {
    fn min_words(&self) -> usize {
        match self {
            Token::Literal(_) | Token::Set(_) => 1,
            Token::Wild { min, .. } => *min,
        }
    }

    fn is_capture(&self) -> bool {
        !matches!(self, Token::Literal(_))
    }
}

/// A normalized pattern compiled into tokens plus the figures the matcher
/// ranks candidates by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledPattern {
    tokens: Vec<Token>,
    /// Minimum words needed to match `tokens[i..]`.
    min_tail: Vec<usize>,
    pub literal_prefix: usize,
    pub literal_count: usize,
    /// Wildcard and set tokens.
    pub wildcard_count: usize,
    pub first_wildcard: Option<Priority>,
}

impl CompiledPattern {
    pub fn compile(pattern: &str) -> Self {
        let tokens: Vec<Token> = pattern
            .split_whitespace()
            .map(|word| match word {
                "_" => Token::Wild { priority: Priority::High, min: 1 },
                "#" => Token::Wild { priority: Priority::High, min: 0 },
                "*" => Token::Wild { priority: Priority::Low, min: 1 },
                "^" => Token::Wild { priority: Priority::Low, min: 0 },
                other => match set_token_name(other) {
                    Some(name) => Token::Set(name.to_string()),
                    None => Token::Literal(other.to_string()),
                },
            })
            .collect();

        let mut min_tail = vec![0; tokens.len() + 1];
        for i in (0..tokens.len()).rev() {
            min_tail[i] = min_tail[i + 1] + tokens[i].min_words();
        }

        let literal_prefix = tokens
            .iter()
            .take_while(|t| matches!(t, Token::Literal(_)))
            .count();
        let first_wildcard = tokens.iter().find_map(|t| match t {
            Token::Wild { priority, .. } => Some(*priority),
            _ => None,
        });

        Self {
            literal_count: tokens.iter().filter(|t| !t.is_capture()).count(),
            wildcard_count: tokens.iter().filter(|t| t.is_capture()).count(),
            literal_prefix,
            first_wildcard,
            min_tail,
            tokens,
        }
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    /// True when the pattern contains no wildcard or set token.
    pub fn is_exact(&self) -> bool {
        self.wildcard_count == 0
    }

    /// Match against normalized words. Returns one `(start, end)` word span
    /// per wildcard or set token, in pattern order.
    ///
    /// Wildcards consume as few words as possible; set references try their
    /// longest member first. Set members are read from `store` at call time.
    pub fn match_words(&self, words: &[&str], store: &RuleStore) -> Option<Vec<(usize, usize)>> {
        let mut walk = Walk {
            words,
            store,
            spans: Vec::with_capacity(self.wildcard_count),
            failed: vec![false; (self.tokens.len() + 1) * (words.len() + 1)],
        };
        self.step(0, 0, &mut walk).then_some(walk.spans)
    }

    fn step(&self, ti: usize, wi: usize, walk: &mut Walk<'_>) -> bool {
        // Whether tokens[ti..] can match words[wi..] does not depend on the
        // spans taken so far, so a failed position never needs a second try.
        let slot = ti * (walk.words.len() + 1) + wi;
        if walk.failed[slot] {
            return false;
        }
        let matched = self.try_step(ti, wi, walk);
        if !matched {
            walk.failed[slot] = true;
        }
        matched
    }

    fn try_step(&self, ti: usize, wi: usize, walk: &mut Walk<'_>) -> bool {
        let remaining = walk.words.len() - wi;
        if remaining < self.min_tail[ti] {
            return false;
        }
        let Some(token) = self.tokens.get(ti) else {
            return remaining == 0;
        };

        match token {
            Token::Literal(lit) => walk.words[wi] == lit.as_str() && self.step(ti + 1, wi + 1, walk),
            Token::Wild { min, .. } => {
                let max = remaining - self.min_tail[ti + 1];
                for len in *min..=max {
                    walk.spans.push((wi, wi + len));
                    if self.step(ti + 1, wi + len, walk) {
                        return true;
                    }
                    walk.spans.pop();
                }
                false
            }
            Token::Set(name) => {
                let Some(set) = walk.store.set(name) else {
                    return false;
                };
                let max = set.max_words().min(remaining - self.min_tail[ti + 1]);
                for len in (1..=max).rev() {
                    if !set.contains(&walk.words[wi..wi + len].join(" ")) {
                        continue;
                    }
                    walk.spans.push((wi, wi + len));
                    if self.step(ti + 1, wi + len, walk) {
                        return true;
                    }
                    walk.spans.pop();
                }
                false
            }
        }
    }
}

/// State for one `match_words` call.
struct Walk<'a> {
    words: &'a [&'a str],
    store: &'a RuleStore,
    spans: Vec<(usize, usize)>,
    /// `(token, word)` positions already known not to match.
    failed: Vec<bool>,
}

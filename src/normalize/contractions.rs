/// Whole-word contractions whose expansion is not a plain suffix rewrite.
const WORDS: &[(&str, &str)] = &[
    ("ain't", "is not"),
    ("can't", "can not"),
    ("shan't", "shall not"),
    ("won't", "will not"),
    ("let's", "let us"),
    ("y'all", "you all"),
    ("he's", "he is"),
    ("here's", "here is"),
    ("how's", "how is"),
    ("it's", "it is"),
    ("she's", "she is"),
    ("that's", "that is"),
    ("there's", "there is"),
    ("what's", "what is"),
    ("when's", "when is"),
    ("where's", "where is"),
    ("who's", "who is"),
    ("why's", "why is"),
];

const SUFFIXES: &[(&str, &str)] = &[
    ("n't", "not"),
    ("'re", "are"),
    ("'ll", "will"),
    ("'ve", "have"),
    ("'m", "am"),
    ("'d", "would"),
];

/// Expand English contractions word by word, keeping the case of the
/// original word. Words that are not contractions pass through unchanged.
pub fn expand_contractions(text: &str) -> String {
    let text = text.replace(['\u{2019}', '\u{2018}'], "'");
    text.split_whitespace()
        .map(expand_word)
        .collect::<Vec<_>>()
        .join(" ")
}

fn expand_word(word: &str) -> String {
    if !word.contains('\'') {
        return word.to_string();
    }

    let start = word
        .char_indices()
        .find(|(_, c)| c.is_alphanumeric())
        .map(|(i, _)| i)
        .unwrap_or(word.len());
    let end = word
        .char_indices()
        .rev()
        .find(|(_, c)| c.is_alphanumeric())
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(start);
    if start >= end {
        return word.to_string();
    }
    let (lead, core, trail) = (&word[..start], &word[start..end], &word[end..]);

    let lower = core.to_lowercase();
    if let Some((_, expansion)) = WORDS.iter().find(|(k, _)| *k == lower) {
        return format!("{lead}{}{trail}", match_case(core, expansion));
    }

    for (suffix, expansion) in SUFFIXES {
        let cut = core.len().saturating_sub(suffix.len());
        if cut == 0 || !core.is_char_boundary(cut) {
            continue;
        }
        let (stem, tail) = core.split_at(cut);
        if tail.eq_ignore_ascii_case(suffix) && !stem.ends_with('\'') {
            let expansion = if tail.chars().any(|c| c.is_uppercase()) {
                expansion.to_uppercase()
            } else {
                expansion.to_string()
            };
            return format!("{lead}{stem} {expansion}{trail}");
        }
    }

    word.to_string()
}

fn match_case(original: &str, expansion: &str) -> String {
    let letters: Vec<char> = original.chars().filter(|c| c.is_alphabetic()).collect();
    if letters.len() > 1 && letters.iter().all(|c| c.is_uppercase()) {
        return expansion.to_uppercase();
    }
    if original.chars().next().is_some_and(char::is_uppercase) {
        let mut chars = expansion.chars();
        return match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect(),
            None => String::new(),
        };
    }
    expansion.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_table_words_with_case() {
        assert_eq!(expand_contractions("What's up"), "What is up");
        assert_eq!(expand_contractions("WON'T"), "WILL NOT");
        assert_eq!(expand_contractions("can't"), "can not");
    }

    #[test]
    fn expands_suffixes_and_keeps_trailing_punctuation() {
        assert_eq!(expand_contractions("I'm here."), "I am here.");
        assert_eq!(expand_contractions("don't!"), "do not!");
        assert_eq!(expand_contractions("THEY'RE"), "THEY ARE");
    }

    #[test]
    fn leaves_possessives_alone() {
        assert_eq!(expand_contractions("John's car"), "John's car");
    }
}

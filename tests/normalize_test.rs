use ruleweave::normalize::{NormalizeKind, Substitutions, expand_contractions, normalize, split_sentences};

#[test]
fn pattern_form_is_uppercase_without_punctuation() {
    assert_eq!(normalize("Hello, world!", NormalizeKind::Pattern, None), "HELLO WORLD");
    assert_eq!(normalize("  what   is  AI? ", NormalizeKind::Pattern, None), "WHAT IS AI");
}

#[test]
fn matching_form_keeps_case() {
    assert_eq!(normalize("Alice likes Chocolate.", NormalizeKind::Matching, None), "Alice likes Chocolate");
}

#[test]
fn contractions_are_expanded_in_every_matching_form() {
    assert_eq!(normalize("I don't know", NormalizeKind::Pattern, None), "I DO NOT KNOW");
    assert_eq!(normalize("What's up", NormalizeKind::Matching, None), "What is up");
    assert_eq!(normalize("You can't", NormalizeKind::Contractions, None), "You can not");
}

#[test]
fn curly_apostrophes_are_treated_like_straight_ones() {
    assert_eq!(expand_contractions("it\u{2019}s"), "it is");
}

#[test]
fn wildcards_and_set_references_survive_pattern_normalization() {
    assert_eq!(normalize("what is *", NormalizeKind::Pattern, None), "WHAT IS *");
    assert_eq!(normalize("_ likes #", NormalizeKind::Pattern, None), "_ LIKES #");
    assert_eq!(
        normalize("I like <set>color</set> ^", NormalizeKind::Pattern, None),
        "I LIKE <SET>COLOR</SET> ^"
    );
}

#[test]
fn normalization_is_idempotent() {
    let mut subs = Substitutions::new();
    subs.add("u", "you");
    subs.add("wanna", "want to");
    let inputs = [
        "Hello, World!",
        "I don't think so...",
        "r u there?",
        "I wanna go; now!",
        "What's <set>animal</set> *",
        "e-mail me at bob@example.com",
        "",
    ];
    for kind in [
        NormalizeKind::Pattern,
        NormalizeKind::Matching,
        NormalizeKind::PriorUtterance,
        NormalizeKind::Contractions,
    ] {
        for input in inputs {
            let once = normalize(input, kind, Some(&subs));
            let twice = normalize(&once, kind, Some(&subs));
            assert_eq!(once, twice, "{kind:?} not idempotent for {input:?}");
        }
    }
}

#[test]
fn prior_utterance_uses_last_sentence() {
    assert_eq!(
        normalize("Nice to meet you. Do you like cheese?", NormalizeKind::PriorUtterance, None),
        "DO YOU LIKE CHEESE"
    );
    assert_eq!(normalize("", NormalizeKind::PriorUtterance, None), "");
}

#[test]
fn substitutions_apply_to_pattern_form() {
    let mut subs = Substitutions::new();
    subs.add("u", "you");
    assert_eq!(normalize("are u there", NormalizeKind::Pattern, Some(&subs)), "ARE YOU THERE");
}

#[test]
fn self_feeding_substitutions_settle() {
    let mut subs = Substitutions::new();
    subs.add("a", "b");
    subs.add("b", "c");
    assert_eq!(normalize("a", NormalizeKind::Pattern, Some(&subs)), "C");
}

#[test]
fn substitution_text_keeps_trailing_punctuation() {
    let mut subs = Substitutions::new();
    subs.add("I", "you");
    subs.add("me", "you");
    assert_eq!(subs.apply_text("give it to me!"), "give it to you!");
}

#[test]
fn sentences_split_on_terminators() {
    assert_eq!(
        split_sentences("Hi there. How are you? Fine!"),
        vec!["Hi there", "How are you", "Fine"]
    );
    assert_eq!(split_sentences("version 1.5 is out"), vec!["version 1.5 is out"]);
    assert!(split_sentences("  ...  ").is_empty());
}

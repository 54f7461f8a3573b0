use ruleweave::store::{load_markup, load_markup_strict};
use ruleweave::{EngineError, LoadReport, RuleSource, RuleStore};

#[test]
fn insert_normalizes_the_key() {
    let mut store = RuleStore::new();
    let key = store.insert(
        RuleSource::new("what's up?", "nothing")
            .with_that("how are you")
            .with_topic("small talk"),
    );
    assert_eq!(key.pattern, "WHAT IS UP");
    assert_eq!(key.that.as_deref(), Some("HOW ARE YOU"));
    assert_eq!(key.topic.as_deref(), Some("SMALL TALK"));
    assert_eq!(key.to_string(), "WHAT IS UP <THAT> HOW ARE YOU <TOPIC> SMALL TALK");
    assert!(store.contains(&key));
    assert_eq!(store.get(&key).unwrap().source.template, "nothing");
}

#[test]
fn same_key_replaces_and_different_context_does_not() {
    let mut store = RuleStore::new();
    store.insert(RuleSource::new("HELLO", "one"));
    store.insert(RuleSource::new("hello!", "two"));
    assert_eq!(store.len(), 1);

    store.insert(RuleSource::new("HELLO", "three").with_that("HI"));
    store.insert(RuleSource::new("HELLO", "four").with_that("*"));
    assert_eq!(store.len(), 2);
}

#[test]
fn that_index_is_kept_only_with_a_that() {
    let store = RuleStore::new();
    let key = store.key_for(&RuleSource::new("YES", "x").with_that_index(2));
    assert_eq!(key.that_index, None);
    let key = store.key_for(&RuleSource::new("YES", "x").with_that("OK").with_that_index(2));
    assert_eq!(key.that_index, Some(2));
}

#[test]
fn remove_updates_candidates() {
    let mut store = RuleStore::new();
    let hello = store.insert(RuleSource::new("HELLO *", "x"));
    let wild = store.insert(RuleSource::new("* BYE", "y"));
    assert_eq!(store.candidates(Some("HELLO")).count(), 2);
    assert_eq!(store.candidates(Some("OTHER")).count(), 1);

    store.remove(&hello).unwrap();
    assert_eq!(store.candidates(Some("HELLO")).count(), 1);
    assert!(store.remove(&hello).is_none());
    store.remove_source(&RuleSource::new("* bye", "ignored")).unwrap();
    assert!(!store.contains(&wild));
    assert!(store.is_empty());
}

#[test]
fn mutations_bump_generation_and_digest() {
    let mut store = RuleStore::new();
    let start = (store.generation(), store.digest());
    store.insert(RuleSource::new("A", "x"));
    assert_ne!(store.generation(), start.0);
    assert_ne!(store.digest(), start.1);

    let before = store.digest();
    store.add_set("colors", ["red"]);
    assert_ne!(store.digest(), before);

    let subs = store.substitution_generation();
    store.add_substitution("normal", "u", "you");
    assert_eq!(store.substitution_generation(), subs + 1);
}

#[test]
fn sets_are_case_insensitive_and_multi_word() {
    let mut store = RuleStore::new();
    store.add_set("Colors", ["Red", "sky blue", ""]);
    let set = store.set("COLORS").unwrap();
    assert_eq!(set.len(), 2);
    assert_eq!(set.max_words(), 2);
    assert!(store.set_contains("colors", "SKY BLUE"));
    assert!(!store.set_contains("colors", "GREEN"));
    assert_eq!(store.set_count(), 1);
    assert!(store.remove_set("colors"));
    assert!(store.set("colors").is_none());
}

#[test]
fn maps_arrays_lists_properties_globals() {
    let mut store = RuleStore::new();
    store.add_map("state2capital", [("new york", "Albany")]);
    assert_eq!(store.map_get("STATE2CAPITAL", "New York"), Some("Albany"));
    assert_eq!(store.map_get("state2capital", "Ohio"), None);

    store.add_array("days", ["Mon", "Tue"]);
    assert_eq!(store.array_get("days", 1), Some("Mon"));
    assert_eq!(store.array_get("days", 0), None);
    assert_eq!(store.array_get("days", 3), None);

    store.add_list("chores", ["a"]);
    store.add_list("chores", ["b"]);
    assert_eq!(store.list("CHORES").unwrap(), ["a", "b"]);

    store.set_property("name", "Weaver");
    store.set_global("mood", "calm");
    assert_eq!(store.property("name"), Some("Weaver"));
    assert_eq!(store.global("mood"), Some("calm"));
}

#[test]
fn normal_substitutions_apply_to_later_rules() {
    let mut store = RuleStore::new();
    store.add_substitution("normal", "u", "you");
    let key = store.insert(RuleSource::new("are u there", "yes"));
    assert_eq!(key.pattern, "ARE YOU THERE");
}

#[test]
fn set_members_use_normal_substitutions() {
    let mut store = RuleStore::new();
    store.add_substitution("normal", "u", "you");
    store.add_set("thanks", ["thank u", "cheers"]);
    assert!(store.set_contains("thanks", "THANK YOU"));
    assert!(!store.set_contains("thanks", "THANK U"));
    assert_eq!(store.set("thanks").unwrap().max_words(), 2);
}

#[test]
fn vocabulary_counts_distinct_literal_words() {
    let mut store = RuleStore::new();
    store.insert(RuleSource::new("HELLO THERE", "x"));
    store.insert(RuleSource::new("HELLO *", "x"));
    store.add_set("names", ["ann", "bob smith"]);
    // HELLO THERE ANN BOB SMITH
    assert_eq!(store.vocabulary(), 5);
}

#[test]
fn lenient_load_skips_bad_categories() {
    let mut store = RuleStore::new();
    let report = load_markup(
        &mut store,
        r#"<aiml>
            <category><pattern>HI</pattern><template>Hello</template></category>
            <category><template>no pattern</template></category>
            <category><pattern>BYE</pattern></category>
            <category><pattern>YES</pattern><that>DO YOU AGREE</that><template>Good</template></category>
        </aiml>"#,
    );
    assert_eq!(report, LoadReport { loaded: 2, skipped: 2 });
    assert_eq!(store.len(), 2);
    assert!(store.rules().any(|r| r.key.that.as_deref() == Some("DO YOU AGREE")));
}

#[test]
fn lenient_load_survives_broken_markup() {
    let mut store = RuleStore::new();
    let report = load_markup(
        &mut store,
        "<aiml><category><pattern>HI</pattern><template>Hello <b>there</template></category></aiml>",
    );
    assert_eq!(report.loaded, 1);
}

#[test]
fn strict_load_is_all_or_nothing() {
    let mut store = RuleStore::new();
    let err = load_markup_strict(
        &mut store,
        "<aiml><category><pattern>HI</pattern><template>x</template></category>\
         <category><pattern></pattern><template>y</template></category></aiml>",
    )
    .unwrap_err();
    assert!(matches!(err, EngineError::InvalidRule { index: 2, .. }));
    assert!(store.is_empty());

    let err = load_markup_strict(&mut store, "<aiml><category><pattern>HI</pattern>").unwrap_err();
    assert!(matches!(err, EngineError::InvalidMarkup { .. }));
    assert!(store.is_empty());

    let count = load_markup_strict(
        &mut store,
        "<aiml><category><pattern>HI</pattern><template>x</template></category></aiml>",
    )
    .unwrap();
    assert_eq!(count, 1);
    assert_eq!(store.len(), 1);
}

#[test]
fn set_reference_in_loaded_pattern() {
    let mut store = RuleStore::new();
    load_markup(
        &mut store,
        "<category><pattern>I LIKE <set>colors</set></pattern><template>x</template></category>",
    );
    assert!(store.rules().any(|r| r.key.pattern == "I LIKE <SET>COLORS</SET>"));
}

#[test]
fn that_depth_follows_context_rules() {
    let mut store = RuleStore::new();
    store.insert(RuleSource::new("HI", "x"));
    assert_eq!(store.that_depth(1), 0);

    let plain = store.insert(RuleSource::new("YES", "x").with_that("OK"));
    assert_eq!(store.that_depth(1), 1);
    assert_eq!(store.that_depth(3), 3);

    let deep = store.insert(RuleSource::new("NO", "x").with_that("OK").with_that_index(4));
    assert_eq!(store.that_depth(1), 4);

    // Replacing a rule does not count it twice.
    store.insert(RuleSource::new("NO", "y").with_that("OK").with_that_index(4));
    store.remove(&deep).unwrap();
    assert_eq!(store.that_depth(1), 1);
    store.remove(&plain).unwrap();
    assert_eq!(store.that_depth(1), 0);
}

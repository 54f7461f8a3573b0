mod common;

use std::sync::Arc;

use common::{engine_with, temp_dir};
use ruleweave::persist::JsonRuleFile;
use ruleweave::services::LearnedRuleSink;
use ruleweave::{Engine, EngineConfig};

const TEACH_LOCATION: &str = "<learn><category><pattern>GET LOCATION FOR JOHNDOE</pattern>\
     <template>Seattle</template></category></learn>Noted.";

#[test]
fn learned_rule_is_visible_to_fresh_sessions() {
    let engine = engine_with(&[("TEACH", TEACH_LOCATION)]);
    assert_eq!(engine.respond("mentor", "teach").unwrap(), "Noted.");
    assert_eq!(engine.respond("stranger", "get location for johndoe").unwrap(), "Seattle");
}

#[test]
fn eval_parts_use_the_teaching_rule_captures() {
    let engine = engine_with(&[(
        "* LIVES IN *",
        r#"<learn><category><pattern>WHERE DOES <eval><star/></eval> LIVE</pattern><template><eval><star index="2"/></eval></template></category></learn>OK."#,
    )]);
    engine.respond("a", "Johndoe lives in Seattle").unwrap();
    assert_eq!(engine.respond("b", "Where does johndoe live?").unwrap(), "Seattle");
}

#[test]
fn learned_templates_are_evaluated_when_used() {
    let engine = engine_with(&[(
        "TEACH GREETING",
        r#"<learn><category><pattern>GREET ME</pattern><template>Hello <get name="name"/>.</template></category></learn>ok"#,
    )]);
    engine.respond("a", "teach greeting").unwrap();

    let session = engine.create_session("b");
    session.lock().unwrap().set_variable("name", "Zoe");
    assert_eq!(engine.respond("b", "greet me").unwrap(), "Hello Zoe.");
}

#[test]
fn learned_rules_with_prior_utterance_context() {
    let engine = engine_with(&[
        (
            "TEACH",
            "<learn><category><pattern>YES</pattern><that>READY</that><template>Go!</template></category></learn>Ready?",
        ),
        ("YES", "Yes what?"),
    ]);
    assert_eq!(engine.respond("s", "teach").unwrap(), "Ready?");
    assert_eq!(engine.respond("s", "yes").unwrap(), "Go!");
    assert_eq!(engine.respond("s", "yes").unwrap(), "Yes what?");
}

#[test]
fn relearning_replaces_the_template() {
    let engine = engine_with(&[(
        "FAVORITE IS *",
        r#"<learn><category><pattern>FAVORITE</pattern><template><eval><star/></eval></template></category></learn>ok"#,
    )]);
    engine.respond("s", "favorite is tea").unwrap();
    engine.respond("s", "favorite is coffee").unwrap();
    assert_eq!(engine.respond("s", "favorite").unwrap(), "coffee");
    assert_eq!(engine.store().len(), 2);
}

#[test]
fn unlearn_removes_the_rule() {
    let engine = engine_with(&[
        ("TEACH", TEACH_LOCATION),
        (
            "FORGET",
            "<unlearn><category><pattern>GET LOCATION FOR JOHNDOE</pattern><template/></category></unlearn>Forgotten.",
        ),
    ]);
    engine.respond("s", "teach").unwrap();
    assert_eq!(engine.respond("s", "forget").unwrap(), "Forgotten.");
    assert_eq!(engine.respond("s", "get location for johndoe").unwrap(), "get location for johndoe");

    let session = engine.session("s").unwrap();
    let session = session.lock().unwrap();
    assert_eq!(session.stats.learned, 1);
    assert_eq!(session.stats.unlearned, 1);
    assert!(session.learned.is_empty());
}

#[test]
fn unlearn_session_drops_only_that_sessions_rules() {
    let engine = engine_with(&[
        ("TEACH *", r#"<learn><category><pattern>SAY <eval><star/></eval></pattern><template><eval><star/></eval></template></category></learn>ok"#),
        ("BUILTIN", "still here"),
    ]);
    engine.respond("a", "teach apple").unwrap();
    engine.respond("a", "teach pear").unwrap();
    engine.respond("b", "teach plum").unwrap();
    assert_eq!(engine.store().len(), 5);

    assert_eq!(engine.unlearn_session("a").unwrap(), 2);
    assert_eq!(engine.store().len(), 3);
    assert_eq!(engine.respond("c", "say plum").unwrap(), "plum");
    assert_eq!(engine.respond("c", "builtin").unwrap(), "still here");
    assert_eq!(engine.respond("c", "say apple").unwrap(), "say apple");
}

#[test]
fn learnf_writes_through_the_persistence_sink() {
    common::init_tracing();
    let dir = temp_dir("learnf");
    let file = Arc::new(JsonRuleFile::new(dir.join("learned.json"), 2));
    let engine = Engine::new(EngineConfig::default())
        .unwrap()
        .with_persistence(file.clone())
        .unwrap();
    engine.load_markup(&common::aiml(&[
        (
            "REMEMBER * IS *",
            r#"<learnf><category><pattern>WHAT IS <eval><star/></eval></pattern><template><eval><star index="2"/></eval></template></category></learnf>Got it."#,
        ),
        (
            "FORGET *",
            r#"<unlearnf><category><pattern>WHAT IS <eval><star/></eval></pattern><template/></category></unlearnf>Gone."#,
        ),
    ]));

    engine.respond("s", "remember pi is three").unwrap();
    engine.respond("s", "remember e is two").unwrap();
    engine.flush_persistence();

    let stored = file.load().unwrap();
    assert_eq!(stored.len(), 2);
    assert!(stored.iter().any(|r| r.template == "three"));
    assert_eq!(engine.session("s").unwrap().lock().unwrap().stats.durable, 2);

    // A new engine can be seeded from the file.
    let restored = Engine::new(EngineConfig::default()).unwrap();
    restored.update_store(|store| {
        for source in file.load().unwrap() {
            store.insert(source);
        }
    });
    assert_eq!(restored.respond("x", "what is pi").unwrap(), "three");

    engine.respond("s", "forget pi").unwrap();
    engine.flush_persistence();
    let stored = file.load().unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].template, "two");

    std::fs::remove_dir_all(dir).ok();
}

#[test]
fn learnf_file_uses_the_store_substitutions_for_identity() {
    let dir = temp_dir("learnf-subs");
    let file = Arc::new(JsonRuleFile::new(dir.join("learned.json"), 0));
    let engine = Engine::new(EngineConfig::default())
        .unwrap()
        .with_persistence(file.clone())
        .unwrap();
    engine.update_store(|store| store.add_substitution("normal", "u", "you"));
    engine.load_markup(&common::aiml(&[(
        "NOTE * IS *",
        r#"<learnf><category><pattern><eval><star/></eval></pattern><template><eval><star index="2"/></eval></template></category></learnf>noted"#,
    )]));

    engine.respond("s", "note are u there is first").unwrap();
    engine.respond("s", "note are you there is second").unwrap();
    engine.flush_persistence();

    assert_eq!(engine.store().len(), 2);
    let stored = file.load().unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].template, "second");

    std::fs::remove_dir_all(dir).ok();
}

#[test]
fn learnf_without_persistence_still_learns_in_memory() {
    let engine = engine_with(&[(
        "TEACH",
        "<learnf><category><pattern>PING</pattern><template>pong</template></category></learnf>ok",
    )]);
    engine.respond("s", "teach").unwrap();
    assert_eq!(engine.respond("s", "ping").unwrap(), "pong");
}

struct Failing;

impl LearnedRuleSink for Failing {
    fn persist(&self, _key: &ruleweave::RuleKey, _rule: &ruleweave::RuleSource) -> anyhow::Result<()> {
        anyhow::bail!("disk full")
    }

    fn remove(&self, _key: &ruleweave::RuleKey) -> anyhow::Result<()> {
        anyhow::bail!("disk full")
    }
}

#[test]
fn persistence_failures_do_not_fail_the_call() {
    let engine = Engine::new(EngineConfig::default())
        .unwrap()
        .with_persistence(Arc::new(Failing))
        .unwrap();
    engine.load_markup(&common::aiml(&[(
        "TEACH",
        "<learnf><category><pattern>PING</pattern><template>pong</template></category></learnf>ok",
    )]));
    assert_eq!(engine.respond("s", "teach").unwrap(), "ok");
    engine.flush_persistence();
    assert_eq!(engine.respond("s", "ping").unwrap(), "pong");
}

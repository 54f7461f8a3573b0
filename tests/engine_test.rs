mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::{aiml, engine_with, init_tracing};
use ruleweave::config::EngineConfig;
use ruleweave::services::CommandDispatcher;
use ruleweave::{Captures, Engine, EngineError, RuleStore, StarKind, Template};

#[test]
fn wildcards_fill_the_template() {
    let engine = engine_with(&[("* LIKES *", "<wild1> likes <wild2>.")]);
    assert_eq!(engine.respond("s", "ALICE LIKES CHOCOLATE").unwrap(), "ALICE likes CHOCOLATE.");
}

#[test]
fn captures_keep_the_input_case() {
    let engine = engine_with(&[("WHAT IS *", "You asked about <star/>.")]);
    assert_eq!(engine.respond("s", "What is Rust?").unwrap(), "You asked about Rust.");
}

#[test]
fn runaway_recursion_returns_the_literal_input() {
    let engine = engine_with(&[("LOOP", "<srai>LOOP</srai>")]);
    assert_eq!(engine.respond("s", "loop").unwrap(), "LOOP");
}

#[test]
fn mutual_recursion_terminates_too() {
    let engine = engine_with(&[("PING", "<srai>PONG</srai>"), ("PONG", "<srai>PING</srai>")]);
    let answer = engine.respond("s", "ping").unwrap();
    assert!(answer == "PING" || answer == "PONG", "unexpected {answer}");
}

#[test]
fn recursion_cap_is_configurable() {
    init_tracing();
    let mut config = EngineConfig::default();
    config.matching.max_recursion_depth = 2;
    let engine = Engine::new(config).unwrap();
    engine.load_markup(&aiml(&[
        ("A", "a<srai>B</srai>"),
        ("B", "b<srai>C</srai>"),
        ("C", "c<srai>D</srai>"),
        ("D", "d"),
    ]));
    // Two re-matches succeed, the third is cut off and returns its input.
    assert_eq!(engine.respond("s", "a").unwrap(), "abcD");
}

#[test]
fn recursion_depth_counts_per_call() {
    let mut config = EngineConfig::default();
    config.matching.max_recursion_depth = 1;
    let engine = Engine::new(config).unwrap();
    engine.load_markup(&aiml(&[("HI", "hello"), ("HEY", "<srai>HI</srai>")]));
    for _ in 0..3 {
        assert_eq!(engine.respond("s", "hey").unwrap(), "hello");
    }
}

#[test]
fn sibling_rematches_do_not_nest() {
    let mut config = EngineConfig::default();
    config.matching.max_recursion_depth = 3;
    let engine = Engine::new(config).unwrap();
    engine.load_markup(&aiml(&[
        ("ONE", "1"),
        ("FOUR", "<srai>ONE</srai> <srai>ONE</srai> <srai>ONE</srai> <srai>ONE</srai>"),
    ]));
    assert_eq!(engine.respond("s", "four").unwrap(), "1 1 1 1");
}

#[test]
fn branching_recursion_stops_at_the_rematch_limit() {
    init_tracing();
    let mut config = EngineConfig::default();
    config.matching.max_recursion_depth = 30;
    config.matching.max_rematches = 40;
    let engine = Engine::new(config).unwrap();
    engine.load_markup(&aiml(&[("SPLIT", "<srai>SPLIT</srai><srai>SPLIT</srai>")]));
    let answer = engine.respond("s", "split").unwrap();
    // 40 re-matches ran; the other 42 calls hit a limit and returned "SPLIT".
    assert_eq!(answer.matches("SPLIT").count(), 42);
}

#[test]
fn learned_rule_reaches_a_new_session() {
    let engine = engine_with(&[(
        "TEACH",
        "<learn><category><pattern>GET LOCATION FOR JOHNDOE</pattern><template>Seattle</template></category></learn>",
    )]);
    engine.respond("first", "teach").unwrap();
    engine.create_session("fresh");
    assert_eq!(engine.process("fresh", "GET LOCATION FOR JOHNDOE").unwrap().text, "Seattle");
}

#[test]
fn process_requires_an_existing_session() {
    let engine = engine_with(&[("HI", "hello")]);
    let err = engine.process("ghost", "hi").unwrap_err();
    assert!(matches!(err, EngineError::SessionNotFound(ref id) if id == "ghost"));
}

#[test]
fn response_reports_the_matched_rule() {
    let engine = engine_with(&[("HI", "hello")]);
    engine.create_session("s");

    let response = engine.process("s", "hi").unwrap();
    assert!(response.matched);
    assert!(!response.out_of_band);
    assert_eq!(response.rule.unwrap().pattern, "HI");

    let response = engine.process("s", "something else").unwrap();
    assert!(!response.matched);
    assert!(response.rule.is_none());
    assert_eq!(response.text, "something else");
}

#[test]
fn configured_default_response_is_used_on_no_match() {
    let mut config = EngineConfig::default();
    config.matching.default_response = "I do not understand.".into();
    let engine = Engine::new(config).unwrap();
    assert_eq!(engine.respond("s", "anything").unwrap(), "I do not understand.");
}

#[test]
fn each_sentence_is_answered() {
    let engine = engine_with(&[("HI", "Hello."), ("BYE", "Goodbye.")]);
    assert_eq!(engine.respond("s", "Hi. Bye!").unwrap(), "Hello. Goodbye.");
}

#[test]
fn sentence_splitting_can_be_disabled() {
    let mut config = EngineConfig::default();
    config.matching.split_sentences = false;
    let engine = Engine::new(config).unwrap();
    engine.load_markup(&aiml(&[("HI BYE", "both"), ("HI", "one")]));
    assert_eq!(engine.respond("s", "Hi. Bye!").unwrap(), "both");
}

#[test]
fn empty_input_is_handled() {
    let engine = engine_with(&[("#", "[silence]")]);
    assert_eq!(engine.respond("s", "").unwrap(), "[silence]");
    assert_eq!(engine.respond("s", "   ").unwrap(), "[silence]");
}

#[test]
fn prior_answer_selects_context_rules() {
    let engine = engine_with(&[("YES", "Yes to what?")]);
    engine.load_markup(
        "<category><pattern>DO YOU LIKE TEA</pattern><template>I do. Do you like tea?</template></category>\
         <category><pattern>YES</pattern><that>DO YOU LIKE *</that><template>We both like <thatstar/>.</template></category>",
    );
    assert_eq!(engine.respond("s", "yes").unwrap(), "Yes to what?");
    engine.respond("s", "do you like tea").unwrap();
    assert_eq!(engine.respond("s", "yes").unwrap(), "We both like TEA.");
}

struct Commands {
    calls: Arc<AtomicUsize>,
}

impl CommandDispatcher for Commands {
    fn dispatch(&self, session_id: &str, command: &str) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match command {
            "whoami" => Ok(session_id.to_string()),
            other => anyhow::bail!("unknown command '{other}'"),
        }
    }
}

#[test]
fn prefixed_input_goes_to_the_command_dispatcher() {
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = Engine::new(EngineConfig::default())
        .unwrap()
        .with_command_dispatcher(Box::new(Commands { calls: Arc::clone(&calls) }));
    engine.load_markup(&aiml(&[("WHOAMI", "a rule")]));
    engine.create_session("s");

    let response = engine.process("s", "/whoami").unwrap();
    assert!(response.out_of_band);
    assert_eq!(response.text, "s");

    let response = engine.process("s", "/reboot").unwrap();
    assert!(response.out_of_band);
    assert!(response.text.contains("unknown command"));

    assert_eq!(engine.process("s", "whoami").unwrap().text, "a rule");
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // Commands never touch the conversation history.
    let session = engine.session("s").unwrap();
    assert_eq!(session.lock().unwrap().history(ruleweave::session::HistoryKind::Request).len(), 1);
}

#[test]
fn match_input_works_without_a_session() {
    let engine = engine_with(&[("WHAT IS *", "x")]);
    engine.load_markup(
        "<category><pattern>WHY</pattern><that>THE SKY IS BLUE</that><template>y</template></category>",
    );
    let result = engine.match_input("What is love?", None, &[], 1).unwrap();
    assert_eq!(result.captures.get(StarKind::Input, 1), Some("love"));

    assert!(engine.match_input("why", None, &[], 1).is_none());
    let result = engine.match_input("why", None, &["The sky is blue."], 1).unwrap();
    assert_eq!(result.rule.key.pattern, "WHY");
    assert_eq!(engine.session_count(), 0);
}

#[test]
fn evaluate_renders_a_template_directly() {
    let engine = engine_with(&[]);
    let handle = engine.create_session("s");
    let mut session = handle.lock().unwrap();
    session.set_variable("name", "Ada");

    let template = Template::parse(r#"Hi <get name="name"/>, you said <star/>."#);
    let captures = Captures {
        input: vec!["hello".into()],
        ..Captures::default()
    };
    let mut ctx = engine.context(&mut session);
    assert_eq!(engine.evaluate(&template, &captures, &mut ctx), "Hi Ada, you said hello.");
}

#[test]
fn replacing_the_store_drops_stale_answers() {
    let engine = engine_with(&[("HI", "old")]);
    assert_eq!(engine.respond("s", "hi").unwrap(), "old");

    let mut store = RuleStore::new();
    store.insert(ruleweave::RuleSource::new("HI", "new"));
    engine.set_rule_store(store);
    assert_eq!(engine.respond("s", "hi").unwrap(), "new");
}

#[test]
fn store_swaps_during_traffic_leave_no_stale_match() {
    let store_with = |answer: &str| {
        let mut store = RuleStore::new();
        store.insert(ruleweave::RuleSource::new("HI", answer));
        store
    };
    let engine = Engine::with_store(EngineConfig::default(), store_with("old")).unwrap();
    assert_eq!(engine.store().digest(), store_with("new").digest());

    let engine = &engine;
    std::thread::scope(|scope| {
        for t in 0..4 {
            scope.spawn(move || {
                for _ in 0..200 {
                    engine.respond(&format!("reader-{t}"), "hi").unwrap();
                }
            });
        }
        for round in 0..50 {
            engine.set_rule_store(store_with(if round % 2 == 0 { "old" } else { "new" }));
        }
    });
    assert_eq!(engine.respond("after", "hi").unwrap(), "new");
}

#[test]
fn repeated_input_is_served_from_cache() {
    let engine = engine_with(&[("HI", "hello")]);
    engine.respond("s", "hi").unwrap();
    let before = engine.cache_stats();
    engine.respond("s", "hi").unwrap();
    let after = engine.cache_stats();
    assert!(after.matches.hits > before.matches.hits);
    assert!(after.normalized.hits > before.normalized.hits);
}

#[test]
fn caching_does_not_change_answers() {
    let rules = [
        ("MY NAME IS *", r#"<think><set name="name"><star/></set></think>ok"#),
        ("WHO AM I", r#"<condition name="name"><li value="*"><get name="name"/></li><li>nobody</li></condition>"#),
    ];
    let cached = engine_with(&rules);
    let mut config = EngineConfig::default();
    config.cache.enabled = false;
    let uncached = Engine::new(config).unwrap();
    uncached.load_markup(&aiml(&rules));

    for input in ["who am i", "my name is Kim", "who am i", "my name is Lee", "who am i"] {
        assert_eq!(cached.respond("s", input).unwrap(), uncached.respond("s", input).unwrap());
    }
    assert_eq!(cached.respond("s", "who am i").unwrap(), "Lee");
}

#[test]
fn invalid_config_is_rejected() {
    let mut config = EngineConfig::default();
    config.matching.max_recursion_depth = 0;
    assert!(matches!(Engine::new(config), Err(EngineError::Config(_))));
}

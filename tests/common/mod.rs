#![allow(dead_code)]

use ruleweave::{Engine, EngineConfig};

/// Route engine logs to the test harness. Set `RUST_LOG=ruleweave=debug`
/// to see them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Wrap category bodies in an `<aiml>` document.
pub fn aiml(categories: &[(&str, &str)]) -> String {
    let mut doc = String::from("<aiml>");
    for (pattern, template) in categories {
        doc.push_str(&format!(
            "<category><pattern>{pattern}</pattern><template>{template}</template></category>"
        ));
    }
    doc.push_str("</aiml>");
    doc
}

/// An engine with default config and the given categories loaded.
pub fn engine_with(categories: &[(&str, &str)]) -> Engine {
    init_tracing();
    let engine = Engine::new(EngineConfig::default()).unwrap();
    let report = engine.load_markup(&aiml(categories));
    assert_eq!(report.skipped, 0);
    engine
}

pub fn temp_dir(label: &str) -> std::path::PathBuf {
    let path = std::env::temp_dir().join(format!("ruleweave-{label}-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&path).unwrap();
    path
}

//! A rule-based pattern matching and template evaluation engine.
//!
//! Given free-text input and a little conversational context (the current
//! topic and the bot's previous answers), [`Engine`] picks the best rule
//! from a [`RuleStore`] and evaluates that rule's template to produce the
//! response, updating the conversation's session as it goes.
//!
//! ```no_run
//! use ruleweave::{Engine, EngineConfig};
//!
//! let engine = Engine::new(EngineConfig::default()).expect("valid config");
//! engine.load_markup(
//!     "<category><pattern>* LIKES *</pattern>\
//!      <template><wild1> likes <wild2>.</template></category>",
//! );
//! let reply = engine.respond("alice", "Alice likes chocolate").expect("session");
//! assert_eq!(reply, "Alice likes chocolate.");
//! ```

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod fs_util;
pub mod matcher;
pub mod normalize;
pub mod persist;
pub mod services;
pub mod session;
pub mod store;
pub mod template;
pub mod types;

pub use cache::{CacheLayer, CacheStatsSnapshot};
pub use config::EngineConfig;
pub use engine::{Engine, Response};
pub use error::{EngineError, Result};
pub use normalize::{NormalizeKind, normalize};
pub use session::{ConversationSession, SessionHandle, VariableContext};
pub use store::{LoadReport, RuleStore};
pub use template::Template;
pub use types::{Captures, MatchResult, Rule, RuleKey, RuleSource, StarKind};

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use super::{Cache, CacheStats};
use crate::config::CacheConfig;
use crate::matcher::{CompiledPattern, MatchKey};
use crate::normalize::NormalizeKind;
use crate::types::MatchResult;

/// A variable resolution: session, variable name and the rule topic the
/// lookup was qualified with.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VariableKey {
    pub session: String,
    pub name: String,
    pub topic: Option<String>,
}

/// A pure tag computation: the tag, its table or map name, and its input.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TagKey {
    pub tag: &'static str,
    pub name: String,
    pub input: String,
}

/// The engine's caches. Each has its own lock.
pub struct CacheLayer {
    /// Compiled patterns keyed by normalized pattern text. Set references
    /// are resolved at match time, so entries depend on nothing mutable.
    pub patterns: Cache<String, Arc<CompiledPattern>>,
    /// Normalizer output; fresh while the substitution tables are unchanged.
    pub normalized: Cache<(NormalizeKind, String), String>,
    /// Variable lookups; fresh while locals, session variables, globals,
    /// properties and topic are unchanged.
    pub variables: Cache<VariableKey, Option<String>>,
    /// Match results, including "no match"; fresh while the rule store
    /// digest is unchanged.
    pub matches: Cache<MatchKey, Option<MatchResult>>,
    /// Substitution and map tag results; fresh while the store generation
    /// is unchanged.
    pub tags: Cache<TagKey, String>,
}

/// Read-only counter snapshot of every cache.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatsSnapshot {
    pub patterns: CacheStats,
    pub normalized: CacheStats,
    pub variables: CacheStats,
    pub matches: CacheStats,
    pub tags: CacheStats,
}

impl CacheStatsSnapshot {
    pub fn hits(&self) -> u64 {
        self.all().iter().map(|s| s.hits).sum()
    }

    pub fn misses(&self) -> u64 {
        self.all().iter().map(|s| s.misses).sum()
    }

    fn all(&self) -> [&CacheStats; 5] {
        [&self.patterns, &self.normalized, &self.variables, &self.matches, &self.tags]
    }
}

impl CacheLayer {
    pub fn new(config: &CacheConfig) -> Self {
        if !config.enabled {
            return Self::disabled();
        }
        let ttl = config.ttl();
        Self {
            // Compiled patterns never go stale; only capacity bounds them.
            patterns: Cache::new("patterns", config.pattern_capacity, Duration::MAX),
            normalized: Cache::new("normalized", config.capacity, ttl),
            variables: Cache::new("variables", config.capacity, ttl),
            matches: Cache::new("matches", config.capacity, ttl),
            tags: Cache::new("tags", config.capacity, ttl),
        }
    }

    pub fn disabled() -> Self {
        Self {
            patterns: Cache::disabled("patterns"),
            normalized: Cache::disabled("normalized"),
            variables: Cache::disabled("variables"),
            matches: Cache::disabled("matches"),
            tags: Cache::disabled("tags"),
        }
    }

    /// Drop everything derived from rule store content. Used when the
    /// whole store is replaced, since a new store may repeat an old digest.
    pub fn clear_store_derived(&self) {
        self.normalized.clear();
        self.variables.clear();
        self.matches.clear();
        self.tags.clear();
    }

    /// Drop cached variable lookups of one session.
    pub fn invalidate_session(&self, session: &str) -> usize {
        self.variables.invalidate(|k| k.session == session)
    }

    pub fn clear_all(&self) {
        self.patterns.clear();
        self.clear_store_derived();
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            patterns: self.patterns.stats(),
            normalized: self.normalized.stats(),
            variables: self.variables.stats(),
            matches: self.matches.stats(),
            tags: self.tags.stats(),
        }
    }
}

impl Default for CacheLayer {
    fn default() -> Self {
        Self::new(&CacheConfig::default())
    }
}

//! Durable learned rules.
//!
//! [`JsonRuleFile`] keeps learned rules in a JSON array and rotates numbered
//! backups before every rewrite. [`PersistenceWorker`] runs a sink on its
//! own thread so `<learnf>` never waits on disk.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::fs_util::{ensure_private_dir, state_dir, write_private};
use crate::services::LearnedRuleSink;
use crate::types::{RuleKey, RuleSource};

const DEFAULT_BACKUPS: usize = 3;

/// Learned rules stored as a pretty-printed JSON array. Each entry is a
/// [`RuleSource`] plus the key the learning store gave it.
pub struct JsonRuleFile {
    path: PathBuf,
    backups: usize,
    // Serializes read-modify-write cycles.
    lock: Mutex<()>,
}

impl JsonRuleFile {
    pub fn new(path: impl Into<PathBuf>, backups: usize) -> Self {
        Self {
            path: path.into(),
            backups,
            lock: Mutex::new(()),
        }
    }

    /// `learned.json` in the state directory, keeping three backups.
    pub fn in_state_dir() -> Self {
        Self::new(state_dir().join("learned.json"), DEFAULT_BACKUPS)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the `n`th backup (1 = newest).
    pub fn backup_path(&self, n: usize) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".{n}"));
        PathBuf::from(name)
    }

    /// Read all stored rules. A missing file holds no rules.
    pub fn load(&self) -> anyhow::Result<Vec<RuleSource>> {
        Ok(self.entries()?.into_iter().map(|e| e.rule).collect())
    }

    fn entries(&self) -> anyhow::Result<Vec<StoredRule>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", self.path.display()))?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("invalid learned rule file {}: {e}", self.path.display()))
    }

    fn update(&self, change: impl FnOnce(&mut Vec<StoredRule>)) -> anyhow::Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut entries = self.entries()?;
        change(&mut entries);

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            ensure_private_dir(dir)?;
        }
        self.rotate()?;
        let json = serde_json::to_vec_pretty(&entries)?;
        write_private(&self.path, &json)?;
        debug!(path = %self.path.display(), rules = entries.len(), "wrote learned rules");
        Ok(())
    }

    /// Shift `file.1..file.N-1` up by one and copy the current file to
    /// `file.1`. The oldest backup falls off.
    fn rotate(&self) -> anyhow::Result<()> {
        if self.backups == 0 || !self.path.exists() {
            return Ok(());
        }
        for n in (1..self.backups).rev() {
            let from = self.backup_path(n);
            if from.exists() {
                std::fs::rename(&from, self.backup_path(n + 1))
                    .map_err(|e| anyhow::anyhow!("failed to rotate {}: {e}", from.display()))?;
            }
        }
        let first = self.backup_path(1);
        std::fs::copy(&self.path, &first)
            .map_err(|e| anyhow::anyhow!("failed to back up to {}: {e}", first.display()))?;
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredRule {
    key: RuleKey,
    #[serde(flatten)]
    rule: RuleSource,
}

impl LearnedRuleSink for JsonRuleFile {
    fn persist(&self, key: &RuleKey, rule: &RuleSource) -> anyhow::Result<()> {
        let entry = StoredRule {
            key: key.clone(),
            rule: rule.clone(),
        };
        self.update(|entries| match entries.iter_mut().find(|e| e.key == *key) {
            Some(existing) => *existing = entry,
            None => entries.push(entry),
        })
    }

    fn remove(&self, key: &RuleKey) -> anyhow::Result<()> {
        self.update(|entries| entries.retain(|e| e.key != *key))
    }
}

enum Job {
    Persist(RuleKey, RuleSource),
    Remove(RuleKey),
    Flush(Sender<()>),
}

/// Runs a [`LearnedRuleSink`] on a background thread. Requests are queued
/// and never block the caller; failures are logged.
pub struct PersistenceWorker {
    tx: Option<Sender<Job>>,
    handle: Option<JoinHandle<()>>,
}

impl PersistenceWorker {
    pub fn spawn(sink: Arc<dyn LearnedRuleSink>) -> anyhow::Result<Self> {
        let (tx, rx) = mpsc::channel();
        let handle = std::thread::Builder::new()
            .name("ruleweave-persist".into())
            .spawn(move || run(sink.as_ref(), rx))
            .map_err(|e| anyhow::anyhow!("failed to spawn persistence worker: {e}"))?;
        info!("persistence worker started");
        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    pub fn persist(&self, key: RuleKey, rule: RuleSource) {
        self.send(Job::Persist(key, rule));
    }

    pub fn remove(&self, key: RuleKey) {
        self.send(Job::Remove(key));
    }

    /// Block until every request queued so far has been handled.
    pub fn flush(&self) {
        let (done_tx, done_rx) = mpsc::channel();
        self.send(Job::Flush(done_tx));
        let _ = done_rx.recv();
    }

    fn send(&self, job: Job) {
        let sent = self.tx.as_ref().is_some_and(|tx| tx.send(job).is_ok());
        if !sent {
            warn!("persistence worker is gone, request dropped");
        }
    }
}

impl Drop for PersistenceWorker {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain its queue and exit.
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(sink: &dyn LearnedRuleSink, rx: Receiver<Job>) {
    for job in rx {
        let (action, result) = match job {
            Job::Persist(key, rule) => ("persist", sink.persist(&key, &rule)),
            Job::Remove(key) => ("remove", sink.remove(&key)),
            Job::Flush(done) => {
                let _ = done.send(());
                continue;
            }
        };
        if let Err(e) = result {
            let err = EngineError::Persistence(e.to_string());
            warn!(action, error = %err, "learned rule persistence failed");
        }
    }
    debug!("persistence worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RuleStore;

    fn tmp_dir() -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system clock before epoch")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("ruleweave-persist-test-{nanos}"));
        std::fs::create_dir_all(&path).expect("create temp dir");
        path
    }

    #[test]
    fn persist_replaces_rule_with_same_key() {
        let dir = tmp_dir();
        let file = JsonRuleFile::new(dir.join("learned.json"), 2);
        let mut store = RuleStore::new();
        let first = RuleSource::new("hello", "one");
        let second = RuleSource::new("HELLO!", "two");
        file.persist(&store.key_for(&first), &first).expect("persist");
        file.persist(&store.key_for(&second), &second).expect("persist");
        let rules = file.load().expect("load");
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].template, "two");

        // The store's substitutions decide identity.
        store.add_substitution("normal", "u", "you");
        let a = RuleSource::new("are u there", "a");
        let b = RuleSource::new("are you there", "b");
        file.persist(&store.key_for(&a), &a).expect("persist");
        file.persist(&store.key_for(&b), &b).expect("persist");
        let rules = file.load().expect("load");
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[1].template, "b");

        file.remove(&store.key_for(&a)).expect("remove");
        assert_eq!(file.load().expect("load").len(), 1);
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn rewrites_rotate_backups() {
        let dir = tmp_dir();
        let file = JsonRuleFile::new(dir.join("learned.json"), 2);
        let store = RuleStore::new();
        for i in 0..4 {
            let rule = RuleSource::new(format!("RULE {i}"), "x");
            file.persist(&store.key_for(&rule), &rule).expect("persist");
        }
        assert!(file.backup_path(1).exists());
        assert!(file.backup_path(2).exists());
        assert!(!file.backup_path(3).exists());
        std::fs::remove_dir_all(dir).ok();
    }
}

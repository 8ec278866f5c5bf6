//! Hot reloading of rule definitions from external sources.

use crate::config::HotReloadConfig;
use crate::error::Result;
#[cfg(test)]
use crate::error::RuleError;
use crate::ids::RuleId;
use crate::rule::{Rule, RuleInput};
use crate::trace::TraceType;
use crate::value::canonical_string;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A provider of rule definitions, polled by the watcher.
#[async_trait]
pub trait RuleSource: Send + Sync {
    /// Source name, used in audit entries.
    fn name(&self) -> &str;

    /// Load the source's current rule set.
    async fn load_rules(&self) -> Result<Vec<RuleInput>>;
}

/// The engine surface the watcher applies changes through.
#[async_trait]
pub trait ReloadTarget: Send + Sync {
    /// Wait for the in-flight processing queue to drain.
    async fn drain(&self);

    /// Validate a definition without applying it.
    fn validate(&self, input: &RuleInput) -> Result<()>;

    /// Register a new rule.
    fn apply_add(&self, input: RuleInput) -> Result<()>;

    /// Replace an existing rule.
    fn apply_replace(&self, input: RuleInput) -> Result<()>;

    /// Remove a rule.
    fn apply_remove(&self, id: &RuleId) -> bool;

    /// Persist after a batch of changes has been applied.
    async fn flush(&self) {}

    /// Record a reload audit entry.
    fn audit(&self, trace_type: TraceType, details: Value);
}

/// Stable fingerprint of a rule definition.
///
/// The canonical serialization is key-order independent, so semantically
/// identical inputs hash identically.
pub fn fingerprint(input: &RuleInput) -> String {
    let value = serde_json::to_value(input).unwrap_or(Value::Null);
    blake3::hash(canonical_string(&value).as_bytes())
        .to_hex()
        .to_string()
}

/// Difference between the tracked rule set and a freshly loaded one.
#[derive(Debug, Default)]
pub struct RuleDiff {
    /// Rules not tracked before.
    pub added: Vec<RuleInput>,

    /// Tracked rules missing from the load.
    pub removed: Vec<RuleId>,

    /// Tracked rules whose fingerprint changed.
    pub modified: Vec<RuleInput>,
}

impl RuleDiff {
    /// Whether the diff changes anything.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

/// Compute the diff of a loaded rule set against tracked fingerprints.
pub fn compute_diff(tracked: &HashMap<RuleId, String>, loaded: &[RuleInput]) -> RuleDiff {
    let mut diff = RuleDiff::default();
    let mut seen: HashMap<&RuleId, &RuleInput> = HashMap::new();

    for input in loaded {
        // Later sources win on duplicate ids.
        seen.insert(&input.id, input);
    }

    for (id, input) in &seen {
        match tracked.get(*id) {
            None => diff.added.push((*input).clone()),
            Some(hash) if *hash != fingerprint(input) => {
                diff.modified.push((*input).clone());
            }
            Some(_) => {}
        }
    }
    for id in tracked.keys() {
        if !seen.contains_key(id) {
            diff.removed.push(id.clone());
        }
    }

    diff
}

/// Watcher status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ReloadStatus {
    /// Whether the polling task is running.
    pub running: bool,

    /// Polling interval.
    pub interval_ms: u64,

    /// Rules currently tracked.
    pub tracked_rules_count: usize,

    /// Completion time of the last reload with changes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reload_at: Option<DateTime<Utc>>,

    /// Completed reloads with changes.
    pub reload_count: u64,

    /// Failed reloads.
    pub failure_count: u64,
}

struct WatcherState {
    hashes: HashMap<RuleId, String>,
    last_reload_at: Option<DateTime<Utc>>,
    reload_count: u64,
    failure_count: u64,
}

/// Polls rule sources and applies diffs to the engine.
pub struct HotReloadWatcher {
    sources: Vec<Arc<dyn RuleSource>>,
    target: Arc<dyn ReloadTarget>,
    config: HotReloadConfig,
    state: Mutex<WatcherState>,
    running: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HotReloadWatcher {
    /// Create a watcher over the given sources.
    pub fn new(
        sources: Vec<Arc<dyn RuleSource>>,
        target: Arc<dyn ReloadTarget>,
        config: HotReloadConfig,
    ) -> Self {
        Self {
            sources,
            target,
            config,
            state: Mutex::new(WatcherState {
                hashes: HashMap::new(),
                last_reload_at: None,
                reload_count: 0,
                failure_count: 0,
            }),
            running: AtomicBool::new(false),
            handle: Mutex::new(None),
        }
    }

    /// Track the engine's current rules so the first reload diffs against
    /// them instead of treating everything as added.
    pub fn seed(&self, rules: &[Rule]) {
        let mut state = self.state.lock();
        state.hashes = rules
            .iter()
            .map(|rule| (rule.id.clone(), fingerprint(&rule.to_input())))
            .collect();
    }

    /// Start the polling task. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let watcher = Arc::clone(self);
        let interval_ms = self.config.interval_ms.max(1);
        let handle = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_millis(interval_ms));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it so a fresh
            // watcher waits one interval before its first poll.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if !watcher.running.load(Ordering::SeqCst) {
                    break;
                }
                watcher.reload_once().await;
            }
        });

        *self.handle.lock() = Some(handle);
        info!("Hot-reload watcher started ({} sources)", self.sources.len());
    }

    /// Stop the polling task. Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
        info!("Hot-reload watcher stopped");
    }

    /// Current status snapshot.
    pub fn status(&self) -> ReloadStatus {
        let state = self.state.lock();
        ReloadStatus {
            running: self.running.load(Ordering::SeqCst),
            interval_ms: self.config.interval_ms,
            tracked_rules_count: state.hashes.len(),
            last_reload_at: state.last_reload_at,
            reload_count: state.reload_count,
            failure_count: state.failure_count,
        }
    }

    /// Run one reload cycle now.
    ///
    /// Source failures drop that source's contribution, or abort the whole
    /// cycle in atomic mode; either way the watcher keeps running.
    pub async fn reload_once(&self) {
        let mut loaded: Vec<RuleInput> = Vec::new();
        for source in &self.sources {
            match source.load_rules().await {
                Ok(rules) => loaded.extend(rules),
                Err(err) => {
                    warn!("Rule source {} failed: {}", source.name(), err);
                    if self.config.atomic_reload {
                        self.fail(json!({
                            "source": source.name(),
                            "error": err.to_string(),
                        }));
                        return;
                    }
                }
            }
        }

        let diff = {
            let state = self.state.lock();
            compute_diff(&state.hashes, &loaded)
        };
        if diff.is_empty() {
            debug!("Hot reload: no changes");
            return;
        }

        self.target.audit(
            TraceType::HotReloadStarted,
            json!({
                "added_count": diff.added.len(),
                "removed_count": diff.removed.len(),
                "modified_count": diff.modified.len(),
            }),
        );

        let mut diff = diff;
        if self.config.validate_before_apply {
            let mut invalid: Vec<(RuleId, String)> = Vec::new();
            for input in diff.added.iter().chain(diff.modified.iter()) {
                if let Err(err) = self.target.validate(input) {
                    invalid.push((input.id.clone(), err.to_string()));
                }
            }

            if !invalid.is_empty() {
                if self.config.atomic_reload {
                    // One bad rule aborts the whole batch.
                    self.fail(json!({
                        "invalid": invalid
                            .iter()
                            .map(|(id, e)| json!({"rule_id": id, "error": e}))
                            .collect::<Vec<_>>(),
                    }));
                    return;
                }
                let bad: Vec<&RuleId> = invalid.iter().map(|(id, _)| id).collect();
                diff.added.retain(|input| !bad.contains(&&input.id));
                diff.modified.retain(|input| !bad.contains(&&input.id));
            }
        }

        // Apply only against a quiet engine.
        self.target.drain().await;

        let mut applied = RuleDiff::default();
        for id in &diff.removed {
            if self.target.apply_remove(id) {
                applied.removed.push(id.clone());
            }
        }
        for input in diff.modified {
            match self.target.apply_replace(input.clone()) {
                Ok(()) => applied.modified.push(input),
                Err(err) => warn!("Hot reload: replacing {} failed: {}", input.id, err),
            }
        }
        for input in diff.added {
            match self.target.apply_add(input.clone()) {
                Ok(()) => applied.added.push(input),
                Err(err) => warn!("Hot reload: adding {} failed: {}", input.id, err),
            }
        }

        {
            let mut state = self.state.lock();
            for id in &applied.removed {
                state.hashes.remove(id);
            }
            for input in applied.modified.iter().chain(applied.added.iter()) {
                state.hashes.insert(input.id.clone(), fingerprint(input));
            }
            state.reload_count += 1;
            state.last_reload_at = Some(Utc::now());
        }

        self.target.flush().await;
        self.target.audit(
            TraceType::HotReloadCompleted,
            json!({
                "added_count": applied.added.len(),
                "removed_count": applied.removed.len(),
                "modified_count": applied.modified.len(),
            }),
        );
        info!(
            "Hot reload applied: +{} -{} ~{}",
            applied.added.len(),
            applied.removed.len(),
            applied.modified.len()
        );
    }

    fn fail(&self, details: Value) {
        self.state.lock().failure_count += 1;
        self.target.audit(TraceType::HotReloadFailed, details);
    }
}

/// A fixed in-memory rule source.
pub struct StaticRuleSource {
    name: String,
    rules: Mutex<Vec<RuleInput>>,
}

impl StaticRuleSource {
    /// Create a source serving the given rules.
    pub fn new(name: impl Into<String>, rules: Vec<RuleInput>) -> Self {
        Self {
            name: name.into(),
            rules: Mutex::new(rules),
        }
    }

    /// Replace the served rules.
    pub fn set_rules(&self, rules: Vec<RuleInput>) {
        *self.rules.lock() = rules;
    }
}

#[async_trait]
impl RuleSource for StaticRuleSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load_rules(&self) -> Result<Vec<RuleInput>> {
        Ok(self.rules.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::RuleManager;
    use serde_json::json;

    struct ManagerTarget {
        manager: RuleManager,
        audits: Mutex<Vec<(TraceType, Value)>>,
    }

    impl ManagerTarget {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                manager: RuleManager::new(),
                audits: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ReloadTarget for ManagerTarget {
        async fn drain(&self) {}

        fn validate(&self, input: &RuleInput) -> Result<()> {
            input.validate()
        }

        fn apply_add(&self, input: RuleInput) -> Result<()> {
            self.manager.register(input).map(|_| ())
        }

        fn apply_replace(&self, input: RuleInput) -> Result<()> {
            self.manager.register_with(input, true).map(|_| ())
        }

        fn apply_remove(&self, id: &RuleId) -> bool {
            self.manager.unregister(id)
        }

        fn audit(&self, trace_type: TraceType, details: Value) {
            self.audits.lock().push((trace_type, details));
        }
    }

    fn rule(id: &str, priority: i64) -> RuleInput {
        serde_json::from_value(json!({
            "id": id,
            "name": format!("Rule {id}"),
            "priority": priority,
            "trigger": {"type": "event", "topic": "order.*"},
            "actions": [{"type": "set_fact", "key": format!("fired:{id}"), "value": true}]
        }))
        .unwrap()
    }

    #[test]
    fn test_fingerprint_is_key_order_independent() {
        let a: RuleInput = serde_json::from_value(json!({
            "id": "r1", "name": "R",
            "trigger": {"type": "event", "topic": "a"},
            "actions": []
        }))
        .unwrap();
        let b: RuleInput = serde_json::from_value(json!({
            "name": "R", "id": "r1",
            "actions": [],
            "trigger": {"topic": "a", "type": "event"}
        }))
        .unwrap();
        assert_eq!(fingerprint(&a), fingerprint(&b));

        let c: RuleInput = serde_json::from_value(json!({
            "id": "r1", "name": "R", "priority": 9,
            "trigger": {"type": "event", "topic": "a"},
            "actions": []
        }))
        .unwrap();
        assert_ne!(fingerprint(&a), fingerprint(&c));
    }

    #[test]
    fn test_compute_diff() {
        let r1 = rule("r1", 0);
        let r1_changed = rule("r1", 9);
        let r2 = rule("r2", 0);
        let r3 = rule("r3", 0);

        let tracked = HashMap::from([
            (r1.id.clone(), fingerprint(&r1)),
            (r2.id.clone(), fingerprint(&r2)),
        ]);

        let diff = compute_diff(&tracked, &[r1_changed.clone(), r3.clone()]);
        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.added[0].id, r3.id);
        assert_eq!(diff.removed, vec![r2.id]);
        assert_eq!(diff.modified.len(), 1);
        assert_eq!(diff.modified[0].priority, 9);
    }

    #[tokio::test]
    async fn test_reload_applies_diff_and_audits() {
        let target = ManagerTarget::new();
        target.manager.register(rule("r1", 0)).unwrap();
        target.manager.register(rule("r2", 0)).unwrap();

        let source = Arc::new(StaticRuleSource::new(
            "static",
            vec![rule("r1", 9), rule("r3", 0)],
        ));
        let watcher = HotReloadWatcher::new(
            vec![source],
            Arc::clone(&target) as Arc<dyn ReloadTarget>,
            HotReloadConfig::default(),
        );
        watcher.seed(&target.manager.get_all());
        assert_eq!(watcher.status().tracked_rules_count, 2);

        watcher.reload_once().await;

        assert!(target.manager.get(&RuleId::new("r2")).is_none());
        assert!(target.manager.get(&RuleId::new("r3")).is_some());
        assert_eq!(target.manager.get(&RuleId::new("r1")).unwrap().priority, 9);

        let status = watcher.status();
        assert_eq!(status.tracked_rules_count, 2);
        assert_eq!(status.reload_count, 1);
        assert_eq!(status.failure_count, 0);
        assert!(status.last_reload_at.is_some());

        let audits = target.audits.lock();
        let completed: Vec<_> = audits
            .iter()
            .filter(|(t, _)| *t == TraceType::HotReloadCompleted)
            .collect();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].1["added_count"], json!(1));
        assert_eq!(completed[0].1["removed_count"], json!(1));
        assert_eq!(completed[0].1["modified_count"], json!(1));
    }

    #[tokio::test]
    async fn test_no_change_reload_is_silent() {
        let target = ManagerTarget::new();
        let source = Arc::new(StaticRuleSource::new("static", vec![rule("r1", 0)]));
        let watcher = HotReloadWatcher::new(
            vec![source],
            Arc::clone(&target) as Arc<dyn ReloadTarget>,
            HotReloadConfig::default(),
        );

        watcher.reload_once().await;
        assert_eq!(watcher.status().reload_count, 1);

        watcher.reload_once().await;
        assert_eq!(watcher.status().reload_count, 1);
        assert_eq!(
            target
                .audits
                .lock()
                .iter()
                .filter(|(t, _)| *t == TraceType::HotReloadCompleted)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_atomic_validation_failure_aborts_batch() {
        let target = ManagerTarget::new();

        let mut bad = rule("bad", 0);
        bad.name = " ".into();
        let source = Arc::new(StaticRuleSource::new("static", vec![rule("good", 0), bad]));

        let watcher = HotReloadWatcher::new(
            vec![source],
            Arc::clone(&target) as Arc<dyn ReloadTarget>,
            HotReloadConfig::default(),
        );
        watcher.reload_once().await;

        // Atomic mode: nothing applied, failure recorded.
        assert!(target.manager.is_empty());
        assert_eq!(watcher.status().failure_count, 1);
        assert!(target
            .audits
            .lock()
            .iter()
            .any(|(t, _)| *t == TraceType::HotReloadFailed));
    }

    #[tokio::test]
    async fn test_non_atomic_validation_failure_drops_only_bad_rules() {
        let target = ManagerTarget::new();

        let mut bad = rule("bad", 0);
        bad.name = " ".into();
        let source = Arc::new(StaticRuleSource::new("static", vec![rule("good", 0), bad]));

        let watcher = HotReloadWatcher::new(
            vec![source],
            Arc::clone(&target) as Arc<dyn ReloadTarget>,
            HotReloadConfig {
                atomic_reload: false,
                ..HotReloadConfig::default()
            },
        );
        watcher.reload_once().await;

        assert!(target.manager.get(&RuleId::new("good")).is_some());
        assert!(target.manager.get(&RuleId::new("bad")).is_none());
        assert_eq!(watcher.status().failure_count, 0);
    }

    #[tokio::test]
    async fn test_failing_source_does_not_stop_watcher() {
        struct FailingSource;

        #[async_trait]
        impl RuleSource for FailingSource {
            fn name(&self) -> &str {
                "failing"
            }

            async fn load_rules(&self) -> Result<Vec<RuleInput>> {
                Err(RuleError::internal("disk on fire"))
            }
        }

        let target = ManagerTarget::new();
        let watcher = HotReloadWatcher::new(
            vec![Arc::new(FailingSource)],
            Arc::clone(&target) as Arc<dyn ReloadTarget>,
            HotReloadConfig::default(),
        );

        watcher.reload_once().await;
        assert_eq!(watcher.status().failure_count, 1);

        // The watcher still accepts further cycles.
        watcher.reload_once().await;
        assert_eq!(watcher.status().failure_count, 2);
    }
}

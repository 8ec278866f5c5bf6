//! The engine coordinator: wiring, lifecycle, and the control surface.

use crate::actions::ActionExecutor;
use crate::baselines::{BaselineDef, BaselineRegistry};
use crate::chaining::{BackwardChainer, Goal, QueryResult};
use crate::config::EngineConfig;
use crate::dispatch::{
    Dispatcher, DispatchStats, EventSubscriptionId, QueueHandle, QueueItem,
};
use crate::error::{Result, RuleError};
use crate::events::{Event, EventStore};
use crate::facts::{Fact, FactStore};
use crate::history::HistoryService;
use crate::ids::{EventId, GroupId, RuleId};
use crate::lookups::{LookupExecutor, LookupService, ServiceRegistry};
use crate::manager::RuleManager;
use crate::persistence::Persistence;
use crate::profile::RuleProfiler;
use crate::reload::{HotReloadWatcher, ReloadStatus, ReloadTarget, RuleSource};
use crate::rule::{Group, GroupInput, Rule, RuleInput, TriggerSpec};
use crate::temporal::TemporalCoordinator;
use crate::timers::{Timer, TimerConfig, TimerManager};
use crate::trace::{TraceCollector, TraceEntry, TraceType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// How often the worker closes temporal windows against wall time when no
/// events are flowing.
const SWEEP_INTERVAL_MS: u64 = 200;

/// Snapshot of engine counters and sizes.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    /// Engine instance name.
    pub engine_name: String,

    /// Time since `start`.
    pub uptime_ms: i64,

    /// Registered rules.
    pub rules_registered: usize,

    /// Registered groups.
    pub groups: usize,

    /// Stored facts.
    pub facts: usize,

    /// Retained events.
    pub events_stored: usize,

    /// Active timers.
    pub active_timers: usize,

    /// Items on the processing queue.
    pub queue_depth: usize,

    /// Events fully processed.
    pub events_processed: u64,

    /// Rule trigger count.
    pub rules_triggered: u64,

    /// Rules that ran their actions.
    pub rules_executed: u64,

    /// Rules skipped.
    pub rules_skipped: u64,

    /// Failed actions.
    pub actions_failed: u64,

    /// Internal invariant violations.
    pub invariant_violations: u64,
}

struct EngineInner {
    config: EngineConfig,
    rules: Arc<RuleManager>,
    facts: Arc<FactStore>,
    events: Arc<EventStore>,
    traces: Arc<TraceCollector>,
    timers: Arc<TimerManager>,
    temporal: Arc<Mutex<TemporalCoordinator>>,
    services: Arc<ServiceRegistry>,
    baselines: Arc<BaselineRegistry>,
    profiler: Arc<RuleProfiler>,
    history: HistoryService,
    dispatcher: Arc<Dispatcher>,
    queue: QueueHandle,
    stats: Arc<DispatchStats>,
    persistence: Option<Arc<dyn Persistence>>,
    watcher: Mutex<Option<Arc<HotReloadWatcher>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
    started_at: DateTime<Utc>,
}

impl EngineInner {
    fn ensure_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(RuleError::Shutdown);
        }
        Ok(())
    }

    /// Register or replace a rule and keep the temporal coordinator in
    /// sync.
    fn apply_rule(&self, input: RuleInput, upsert: bool) -> Result<Rule> {
        let rule = self.rules.register_with(input, upsert)?;

        let mut temporal = self.temporal.lock();
        match &rule.trigger {
            TriggerSpec::Temporal { pattern } => {
                temporal.add_pattern(rule.id.as_str(), pattern)?;
            }
            _ => {
                // A replaced rule may have stopped being temporal.
                temporal.remove_pattern(rule.id.as_str());
            }
        }
        Ok(rule)
    }

    fn remove_rule(&self, id: &RuleId) -> bool {
        let removed = self.rules.unregister(id);
        if removed {
            self.temporal.lock().remove_pattern(id.as_str());
        }
        removed
    }

    async fn persist(&self) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        let rules = self.rules.get_all();
        let groups = self.rules.get_groups();
        if let Err(err) = persistence.save(&rules, &groups).await {
            warn!("Persisting rules failed: {}", err);
        }
    }
}

#[async_trait]
impl ReloadTarget for EngineInner {
    async fn drain(&self) {
        self.queue.drain().await;
    }

    fn validate(&self, input: &RuleInput) -> Result<()> {
        input.validate()
    }

    fn apply_add(&self, input: RuleInput) -> Result<()> {
        self.apply_rule(input, false).map(|_| ())
    }

    fn apply_replace(&self, input: RuleInput) -> Result<()> {
        self.apply_rule(input, true).map(|_| ())
    }

    fn apply_remove(&self, id: &RuleId) -> bool {
        self.remove_rule(id)
    }

    async fn flush(&self) {
        self.persist().await;
    }

    fn audit(&self, trace_type: TraceType, details: Value) {
        self.traces.record(TraceEntry::new(trace_type, details));
    }
}

/// Builder for a configured engine.
pub struct EngineBuilder {
    config: EngineConfig,
    persistence: Option<Arc<dyn Persistence>>,
    services: Vec<Arc<dyn LookupService>>,
    sources: Vec<Arc<dyn RuleSource>>,
}

impl EngineBuilder {
    /// Start building with a configuration.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            persistence: None,
            services: Vec::new(),
            sources: Vec::new(),
        }
    }

    /// Attach a persistence adapter; rules and groups are loaded from it
    /// at start and saved on every mutation.
    pub fn with_persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Register a lookup service.
    pub fn with_service(mut self, service: Arc<dyn LookupService>) -> Self {
        self.services.push(service);
        self
    }

    /// Attach a hot-reload rule source; the watcher starts with the engine.
    pub fn with_rule_source(mut self, source: Arc<dyn RuleSource>) -> Self {
        self.sources.push(source);
        self
    }

    /// Wire everything and start the worker.
    pub async fn start(self) -> Result<RulesEngine> {
        let config = self.config;
        let rules = Arc::new(RuleManager::new());
        let facts = Arc::new(FactStore::new());
        let events = Arc::new(EventStore::new(config.event_store.max_events));
        let traces = Arc::new(TraceCollector::new(
            config.trace.max_entries,
            config.trace.enabled,
        ));
        let temporal = Arc::new(Mutex::new(TemporalCoordinator::new()));
        let baselines = Arc::new(BaselineRegistry::new(Arc::clone(&events)));
        let services = Arc::new(ServiceRegistry::new());
        for service in self.services {
            services.register(service);
        }
        let lookups = Arc::new(LookupExecutor::new(Arc::clone(&services)));

        let (queue, mut rx) = QueueHandle::channel();
        let stats = Arc::new(DispatchStats::default());

        let timer_queue = queue.clone();
        let timers = Arc::new(TimerManager::new(move |fired| {
            timer_queue.enqueue(QueueItem::TimerFired(fired));
        }));

        let emit_queue = queue.clone();
        let change_queue = queue.clone();
        let actions = ActionExecutor::new(
            Arc::clone(&facts),
            Arc::clone(&timers),
            Arc::clone(&services),
            Arc::clone(&traces),
            Box::new(move |event| emit_queue.enqueue(QueueItem::Event(event))),
            Box::new(move |change, cause| {
                change_queue.enqueue(QueueItem::FactChanged { change, cause })
            }),
        );

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&rules),
            Arc::clone(&facts),
            Arc::clone(&events),
            Arc::clone(&traces),
            Arc::clone(&temporal),
            Arc::clone(&baselines),
            lookups,
            actions,
            queue.clone(),
            Arc::clone(&stats),
            config.name.clone(),
        ));

        let profiler = Arc::new(RuleProfiler::new());
        profiler.attach(&traces);

        let history = HistoryService::new(Arc::clone(&events), Arc::clone(&traces));

        let inner = Arc::new(EngineInner {
            config,
            rules,
            facts,
            events,
            traces,
            timers,
            temporal,
            services,
            baselines,
            profiler,
            history,
            dispatcher: Arc::clone(&dispatcher),
            queue: queue.clone(),
            stats,
            persistence: self.persistence,
            watcher: Mutex::new(None),
            worker: Mutex::new(None),
            sweeper: Mutex::new(None),
            stopped: AtomicBool::new(false),
            started_at: Utc::now(),
        });

        // Restore persisted rule and group definitions.
        if let Some(persistence) = &inner.persistence {
            if persistence.exists().await? {
                let state = persistence.load().await?;
                for group in state.groups {
                    inner.rules.restore_group(group);
                }
                for rule in state.rules {
                    if let TriggerSpec::Temporal { pattern } = &rule.trigger {
                        if let Err(err) =
                            inner.temporal.lock().add_pattern(rule.id.as_str(), pattern)
                        {
                            warn!("Restored rule {} has a bad pattern: {}", rule.id, err);
                            continue;
                        }
                    }
                    inner.rules.restore_rule(rule);
                }
                info!(
                    "Restored {} rules and {} groups from {}",
                    inner.rules.len(),
                    inner.rules.group_count(),
                    persistence.key()
                );
            }
        }

        // The single logical worker: one trigger at a time, end to end.
        let worker_queue = queue.clone();
        let worker = tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                dispatcher.process(item).await;
                worker_queue.mark_done();
            }
        });
        *inner.worker.lock() = Some(worker);

        // Wall-clock sweeps close temporal windows when no events arrive.
        let sweep_temporal = Arc::clone(&inner.temporal);
        let sweep_queue = queue.clone();
        let sweeper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_millis(
                SWEEP_INTERVAL_MS,
            ));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let has_deadline = sweep_temporal.lock().next_deadline().is_some();
                if has_deadline {
                    sweep_queue.enqueue(QueueItem::Sweep { now: Utc::now() });
                }
            }
        });
        *inner.sweeper.lock() = Some(sweeper);

        if !self.sources.is_empty() {
            let watcher = Arc::new(HotReloadWatcher::new(
                self.sources,
                Arc::clone(&inner) as Arc<dyn ReloadTarget>,
                inner.config.hot_reload.clone(),
            ));
            watcher.seed(&inner.rules.get_all());
            watcher.start();
            *inner.watcher.lock() = Some(watcher);
        }

        info!("Engine {} started", inner.config.name);
        Ok(RulesEngine { inner })
    }
}

/// The running engine. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct RulesEngine {
    inner: Arc<EngineInner>,
}

impl RulesEngine {
    /// Build an engine with extras (persistence, services, rule sources).
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Start a plain engine.
    pub async fn start(config: EngineConfig) -> Result<Self> {
        EngineBuilder::new(config).start().await
    }

    /// Engine name.
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Submit an event for processing, returning its id.
    pub fn emit(&self, event: Event) -> Result<EventId> {
        self.inner.ensure_running()?;
        let id = event.id;
        self.inner.queue.enqueue(QueueItem::Event(event));
        Ok(id)
    }

    /// Build and submit an event.
    pub fn emit_topic(&self, topic: impl Into<String>, data: Value) -> Result<EventId> {
        self.emit(Event::new(topic, data))
    }

    /// Set a fact, returning the previous version when the key existed.
    ///
    /// The mutation is applied immediately; fact-triggered rules run from
    /// the queue.
    pub fn set_fact(&self, key: impl Into<String>, value: Value) -> Result<Option<u64>> {
        self.inner.ensure_running()?;
        let change = self.inner.facts.set_returning(key, value, "api");
        let previous = (change.version > 1).then(|| change.version - 1);
        self.inner
            .queue
            .enqueue(QueueItem::FactChanged { change, cause: None });
        Ok(previous)
    }

    /// Delete a fact.
    pub fn delete_fact(&self, key: &str) -> Result<bool> {
        self.inner.ensure_running()?;
        match self.inner.facts.delete_returning(key, "api") {
            Some(change) => {
                self.inner
                    .queue
                    .enqueue(QueueItem::FactChanged { change, cause: None });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Get a fact.
    pub fn get_fact(&self, key: &str) -> Option<Fact> {
        self.inner.facts.get(key)
    }

    /// Get a fact's value.
    pub fn get_fact_value(&self, key: &str) -> Option<Value> {
        self.inner.facts.get_value(key)
    }

    /// Facts matching a key pattern.
    pub fn get_facts_by_pattern(&self, key_pattern: &str) -> Vec<Fact> {
        self.inner.facts.get_by_pattern(key_pattern)
    }

    /// Register a rule; fails with `Conflict` on a duplicate id.
    pub async fn register_rule(&self, input: RuleInput) -> Result<Rule> {
        self.inner.ensure_running()?;
        let rule = self.inner.apply_rule(input, false)?;
        self.inner.persist().await;
        Ok(rule)
    }

    /// Register a rule, replacing any existing one with the same id.
    pub async fn register_rule_upsert(&self, input: RuleInput) -> Result<Rule> {
        self.inner.ensure_running()?;
        let rule = self.inner.apply_rule(input, true)?;
        self.inner.persist().await;
        Ok(rule)
    }

    /// Unregister a rule.
    pub async fn unregister_rule(&self, id: &RuleId) -> Result<bool> {
        self.inner.ensure_running()?;
        let removed = self.inner.remove_rule(id);
        if removed {
            self.inner.persist().await;
        }
        Ok(removed)
    }

    /// Get a rule.
    pub fn get_rule(&self, id: &RuleId) -> Option<Rule> {
        self.inner.rules.get(id)
    }

    /// All rules, in deterministic candidate order.
    pub fn get_rules(&self) -> Vec<Rule> {
        self.inner.rules.get_all()
    }

    /// Active rules carrying a tag.
    pub fn get_rules_by_tag(&self, tag: &str) -> Vec<Rule> {
        self.inner.rules.get_by_tag(tag)
    }

    /// Create a group.
    pub async fn create_group(&self, input: GroupInput) -> Result<Group> {
        self.inner.ensure_running()?;
        let group = self.inner.rules.create_group(input)?;
        self.inner.persist().await;
        Ok(group)
    }

    /// Replace a group's definition.
    pub async fn update_group(&self, input: GroupInput) -> Result<Group> {
        self.inner.ensure_running()?;
        let group = self.inner.rules.update_group(input)?;
        self.inner.persist().await;
        Ok(group)
    }

    /// Delete a group.
    pub async fn delete_group(&self, id: &GroupId) -> Result<bool> {
        self.inner.ensure_running()?;
        let removed = self.inner.rules.delete_group(id);
        if removed {
            self.inner.persist().await;
        }
        Ok(removed)
    }

    /// Enable a group.
    pub async fn enable_group(&self, id: &GroupId) -> Result<Group> {
        self.inner.ensure_running()?;
        let group = self.inner.rules.set_group_enabled(id, true)?;
        self.inner.persist().await;
        Ok(group)
    }

    /// Disable a group; member rules stop matching immediately.
    pub async fn disable_group(&self, id: &GroupId) -> Result<Group> {
        self.inner.ensure_running()?;
        let group = self.inner.rules.set_group_enabled(id, false)?;
        self.inner.persist().await;
        Ok(group)
    }

    /// Get a group.
    pub fn get_group(&self, id: &GroupId) -> Option<Group> {
        self.inner.rules.get_group(id)
    }

    /// All groups.
    pub fn get_groups(&self) -> Vec<Group> {
        self.inner.rules.get_groups()
    }

    /// Set or replace a named timer.
    pub fn set_timer(&self, config: TimerConfig) -> Result<Timer> {
        self.inner.ensure_running()?;
        let timer = self.inner.timers.set_timer(config, None)?;
        self.inner.traces.record(TraceEntry::new(
            TraceType::TimerSet,
            json!({"name": timer.name, "expires_at": timer.expires_at}),
        ));
        Ok(timer)
    }

    /// Cancel a named timer.
    pub fn cancel_timer(&self, name: &str) -> Result<bool> {
        self.inner.ensure_running()?;
        let cancelled = self.inner.timers.cancel_timer(name);
        if cancelled.is_some() {
            self.inner.traces.record(TraceEntry::new(
                TraceType::TimerCancelled,
                json!({"name": name}),
            ));
        }
        Ok(cancelled.is_some())
    }

    /// Get a timer.
    pub fn get_timer(&self, name: &str) -> Option<Timer> {
        self.inner.timers.get_timer(name)
    }

    /// All active timers.
    pub fn get_timers(&self) -> Vec<Timer> {
        self.inner.timers.get_all()
    }

    /// Run a backward-chaining query against the live rule set.
    pub fn query_goal(&self, goal: &Goal) -> Result<QueryResult> {
        BackwardChainer::new(
            Arc::clone(&self.inner.rules),
            Arc::clone(&self.inner.facts),
            self.inner.config.backward_chaining.clone(),
        )
        .evaluate(goal)
    }

    /// Register a lookup service.
    pub fn register_service(&self, service: Arc<dyn LookupService>) {
        self.inner.services.register(service);
    }

    /// Register a baseline metric.
    pub fn register_baseline(&self, def: BaselineDef) -> Result<()> {
        self.inner.baselines.register(def)
    }

    /// Subscribe to every event the engine processes.
    pub fn subscribe_events<F>(&self, callback: F) -> EventSubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.inner.dispatcher.subscribe_events(callback)
    }

    /// Remove an event subscription.
    pub fn unsubscribe_events(&self, id: EventSubscriptionId) -> bool {
        self.inner.dispatcher.unsubscribe_events(id)
    }

    /// The event store.
    pub fn events(&self) -> Arc<EventStore> {
        Arc::clone(&self.inner.events)
    }

    /// The trace collector.
    pub fn traces(&self) -> Arc<TraceCollector> {
        Arc::clone(&self.inner.traces)
    }

    /// The rule profiler.
    pub fn profiler(&self) -> Arc<RuleProfiler> {
        Arc::clone(&self.inner.profiler)
    }

    /// The history service.
    pub fn history(&self) -> &HistoryService {
        &self.inner.history
    }

    /// Hot-reload watcher status, when sources are attached.
    pub fn reload_status(&self) -> Option<ReloadStatus> {
        self.inner.watcher.lock().as_ref().map(|w| w.status())
    }

    /// Run a hot-reload cycle now, when sources are attached.
    pub async fn reload_now(&self) -> Result<()> {
        let watcher = self
            .inner
            .watcher
            .lock()
            .clone()
            .ok_or_else(|| RuleError::not_found("no rule sources attached"))?;
        watcher.reload_once().await;
        Ok(())
    }

    /// Wait until every submitted trigger has been fully processed.
    pub async fn wait_for_processing_queue(&self) {
        self.inner.queue.drain().await;
    }

    /// Current counters and sizes.
    pub fn get_stats(&self) -> EngineStats {
        let inner = &self.inner;
        EngineStats {
            engine_name: inner.config.name.clone(),
            uptime_ms: (Utc::now() - inner.started_at).num_milliseconds(),
            rules_registered: inner.rules.len(),
            groups: inner.rules.group_count(),
            facts: inner.facts.len(),
            events_stored: inner.events.len(),
            active_timers: inner.timers.len(),
            queue_depth: inner.queue.depth(),
            events_processed: inner.stats.events_processed.load(Ordering::Relaxed),
            rules_triggered: inner.stats.rules_triggered.load(Ordering::Relaxed),
            rules_executed: inner.stats.rules_executed.load(Ordering::Relaxed),
            rules_skipped: inner.stats.rules_skipped.load(Ordering::Relaxed),
            actions_failed: inner.stats.actions_failed.load(Ordering::Relaxed),
            invariant_violations: inner.stats.invariant_violations.load(Ordering::Relaxed),
        }
    }

    /// Stop the engine: cancel timers, stop the watcher, drain the queue
    /// (bounded), and release the worker. Idempotent.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        self.inner.timers.stop();
        if let Some(watcher) = self.inner.watcher.lock().as_ref() {
            watcher.stop();
        }

        let drained = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            self.inner.queue.drain(),
        )
        .await;
        if drained.is_err() {
            warn!("Engine {} stopped with items still queued", self.name());
        }

        if let Some(sweeper) = self.inner.sweeper.lock().take() {
            sweeper.abort();
        }
        if let Some(worker) = self.inner.worker.lock().take() {
            worker.abort();
        }

        info!("Engine {} stopped", self.name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryPersistence;
    use crate::reload::StaticRuleSource;
    use serde_json::json;

    fn rule(spec: Value) -> RuleInput {
        serde_json::from_value(spec).unwrap()
    }

    async fn engine_with_traces() -> RulesEngine {
        let mut config = EngineConfig::default();
        config.trace.enabled = true;
        RulesEngine::start(config).await.unwrap()
    }

    #[tokio::test]
    async fn test_emit_runs_matching_rules() {
        let engine = engine_with_traces().await;
        engine
            .register_rule(rule(json!({
                "id": "earn-points",
                "name": "Earn points",
                "trigger": {"type": "event", "topic": "order.*"},
                "actions": [
                    {"type": "set_fact", "key": "loyalty:points", "value": 500}
                ]
            })))
            .await
            .unwrap();

        engine.emit_topic("order.placed", json!({})).unwrap();
        engine.wait_for_processing_queue().await;

        assert_eq!(engine.get_fact_value("loyalty:points"), Some(json!(500)));
        let stats = engine.get_stats();
        assert_eq!(stats.rules_executed, 1);
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_group_gating_end_to_end() {
        let engine = engine_with_traces().await;
        engine
            .create_group(GroupInput {
                id: GroupId::new("billing"),
                name: "Billing".into(),
                description: None,
                enabled: true,
            })
            .await
            .unwrap();
        engine
            .register_rule(rule(json!({
                "id": "r1",
                "name": "Billing rule",
                "group": "billing",
                "trigger": {"type": "event", "topic": "order.placed"},
                "actions": [
                    {"type": "set_fact", "key": "b:fired", "value": true}
                ]
            })))
            .await
            .unwrap();

        engine.disable_group(&GroupId::new("billing")).await.unwrap();
        engine.emit_topic("order.placed", json!({})).unwrap();
        engine.wait_for_processing_queue().await;
        assert!(engine.get_fact_value("b:fired").is_none());

        engine.enable_group(&GroupId::new("billing")).await.unwrap();
        engine.emit_topic("order.placed", json!({})).unwrap();
        engine.wait_for_processing_queue().await;
        assert_eq!(engine.get_fact_value("b:fired"), Some(json!(true)));
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_register_unregister_leaves_no_residue() {
        let engine = engine_with_traces().await;
        engine
            .register_rule(rule(json!({
                "id": "r1",
                "name": "Rule",
                "trigger": {"type": "event", "topic": "t"},
                "actions": [{"type": "set_fact", "key": "fired", "value": true}]
            })))
            .await
            .unwrap();

        assert!(engine.unregister_rule(&RuleId::new("r1")).await.unwrap());
        assert!(!engine.unregister_rule(&RuleId::new("r1")).await.unwrap());

        engine.emit_topic("t", json!({})).unwrap();
        engine.wait_for_processing_queue().await;
        assert!(engine.get_fact_value("fired").is_none());
        assert_eq!(engine.get_stats().rules_registered, 0);
        engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_repeat_cancelled_after_two_fires() {
        let engine = engine_with_traces().await;
        engine
            .set_timer(TimerConfig {
                name: "t1".into(),
                duration: json!("1s"),
                repeat: Some(crate::timers::RepeatConfig {
                    interval: json!("1s"),
                    max_count: None,
                }),
                on_expire: crate::timers::ExpireSpec {
                    topic: "timer.expired".into(),
                    data: json!({}),
                },
            })
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(2500)).await;
        engine.cancel_timer("t1").unwrap();
        tokio::time::sleep(std::time::Duration::from_secs(3)).await;
        engine.wait_for_processing_queue().await;

        assert_eq!(engine.events().get_by_topic("timer.expired").len(), 2);
        engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_timer_fires_after_stop() {
        let engine = engine_with_traces().await;
        engine
            .set_timer(TimerConfig {
                name: "t1".into(),
                duration: json!("1s"),
                repeat: None,
                on_expire: crate::timers::ExpireSpec {
                    topic: "late.fire".into(),
                    data: json!({}),
                },
            })
            .unwrap();

        let events = engine.events();
        engine.stop().await;
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;

        assert!(events.get_by_topic("late.fire").is_empty());
        assert!(engine.emit_topic("t", json!({})).is_err());
    }

    #[tokio::test]
    async fn test_absence_pattern_end_to_end() {
        let engine = engine_with_traces().await;
        engine
            .register_rule(rule(json!({
                "id": "unpaid-order",
                "name": "Unpaid order",
                "trigger": {"type": "temporal", "pattern": {
                    "type": "absence",
                    "after": {"topic": "order.created"},
                    "expected": {"topic": "payment.received"},
                    "within": "10m",
                    "group_by": "orderId"
                }},
                "actions": [
                    {"type": "set_fact", "key": "unpaid:${trigger.group}", "value": true}
                ]
            })))
            .await
            .unwrap();

        let base = Utc::now();
        engine
            .emit(
                Event::new("order.created", json!({"orderId": "o1"})).with_timestamp(base),
            )
            .unwrap();
        engine.wait_for_processing_queue().await;
        assert!(engine.get_fact_value("unpaid:o1").is_none());

        // A later event advances event time past the window.
        engine
            .emit(
                Event::new("clock.tick", json!({}))
                    .with_timestamp(base + chrono::Duration::minutes(10) + chrono::Duration::seconds(1)),
            )
            .unwrap();
        engine.wait_for_processing_queue().await;

        assert_eq!(engine.get_fact_value("unpaid:o1"), Some(json!(true)));
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_backward_chaining_through_handle() {
        let engine = engine_with_traces().await;
        engine.set_fact("customer:active", json!(true)).unwrap();
        engine
            .register_rule(rule(json!({
                "id": "earn-points",
                "name": "Earn points",
                "trigger": {"type": "event", "topic": "order.placed"},
                "conditions": [
                    {"source": {"type": "fact", "pattern": "customer:active"},
                     "operator": "eq", "value": true}
                ],
                "actions": [
                    {"type": "set_fact", "key": "loyalty:points", "value": 500}
                ]
            })))
            .await
            .unwrap();
        engine
            .register_rule(rule(json!({
                "id": "vip-upgrade",
                "name": "VIP upgrade",
                "trigger": {"type": "event", "topic": "loyalty.changed"},
                "conditions": [
                    {"source": {"type": "fact", "pattern": "loyalty:points"},
                     "operator": "exists"}
                ],
                "actions": [
                    {"type": "set_fact", "key": "customer:tier", "value": "vip"}
                ]
            })))
            .await
            .unwrap();

        let result = engine
            .query_goal(&Goal::Fact {
                key: "customer:tier".into(),
                value: None,
                operator: None,
            })
            .unwrap();
        assert!(result.achievable);
        assert_eq!(result.explored_rules, 2);
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_persistence_restores_on_start() {
        let persistence = Arc::new(MemoryPersistence::new());

        let engine = RulesEngine::builder(EngineConfig::default())
            .with_persistence(Arc::clone(&persistence) as Arc<dyn Persistence>)
            .start()
            .await
            .unwrap();
        engine
            .register_rule(rule(json!({
                "id": "r1",
                "name": "Rule",
                "trigger": {"type": "event", "topic": "t"},
                "actions": [{"type": "set_fact", "key": "fired", "value": true}]
            })))
            .await
            .unwrap();
        let registered = engine.get_rule(&RuleId::new("r1")).unwrap();
        engine.stop().await;

        let revived = RulesEngine::builder(EngineConfig::default())
            .with_persistence(persistence as Arc<dyn Persistence>)
            .start()
            .await
            .unwrap();
        let restored = revived.get_rule(&RuleId::new("r1")).unwrap();
        assert_eq!(restored.version, registered.version);
        assert_eq!(restored.created_at, registered.created_at);

        revived.emit_topic("t", json!({})).unwrap();
        revived.wait_for_processing_queue().await;
        assert_eq!(revived.get_fact_value("fired"), Some(json!(true)));
        revived.stop().await;
    }

    #[tokio::test]
    async fn test_hot_reload_through_engine() {
        let source = Arc::new(StaticRuleSource::new("static", vec![]));
        let engine = RulesEngine::builder({
            let mut config = EngineConfig::default();
            config.trace.enabled = true;
            config
        })
        .with_rule_source(Arc::clone(&source) as Arc<dyn RuleSource>)
        .start()
        .await
        .unwrap();

        source.set_rules(vec![rule(json!({
            "id": "hot-rule",
            "name": "Hot rule",
            "trigger": {"type": "event", "topic": "t"},
            "actions": [{"type": "set_fact", "key": "hot", "value": true}]
        }))]);
        engine.reload_now().await.unwrap();

        assert!(engine.get_rule(&RuleId::new("hot-rule")).is_some());
        let status = engine.reload_status().unwrap();
        assert_eq!(status.tracked_rules_count, 1);
        assert_eq!(status.reload_count, 1);
        assert_eq!(
            engine
                .traces()
                .get_by_type(TraceType::HotReloadCompleted)
                .len(),
            1
        );
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_event_subscription() {
        let engine = engine_with_traces().await;
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        engine.subscribe_events(move |event| sink.lock().push(event.topic.clone()));

        engine.emit_topic("a.b", json!({})).unwrap();
        engine.wait_for_processing_queue().await;

        assert_eq!(seen.lock().as_slice(), &["a.b".to_string()]);
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_stats_surface() {
        let engine = engine_with_traces().await;
        engine.emit_topic("t", json!({})).unwrap();
        engine.wait_for_processing_queue().await;

        let stats = engine.get_stats();
        assert_eq!(stats.engine_name, "noex-rules");
        assert_eq!(stats.events_processed, 1);
        assert_eq!(stats.events_stored, 1);
        assert_eq!(stats.queue_depth, 0);
        engine.stop().await;
    }
}

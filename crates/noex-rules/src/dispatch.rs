//! The dispatch pipeline: one trigger at a time, end to end.
//!
//! Triggers are serialized through an unbounded queue owned by a single
//! worker. A rule's effects (fact mutations, derived events, temporal
//! matches) are appended to the queue tail and processed after the current
//! trigger completes, so fact updates from rule A are visible to rule B in
//! emission order.

use crate::actions::ActionExecutor;
use crate::baselines::BaselineRegistry;
use crate::conditions::ConditionEvaluator;
use crate::context::{EvaluationContext, TriggerContext};
use crate::events::{Event, EventStore};
use crate::facts::{FactChange, FactStore};
use crate::ids::{CorrelationId, RuleId};
use crate::lookups::LookupExecutor;
use crate::manager::RuleManager;
use crate::rule::Rule;
use crate::temporal::{TemporalCoordinator, TemporalMatch};
use crate::timers::TimerFired;
use crate::trace::{TraceCollector, TraceEntry, TraceType};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Notify};
use tracing::warn;
use uuid::Uuid;

/// A unit of work on the processing queue.
#[derive(Debug)]
pub enum QueueItem {
    /// An emitted event.
    Event(Event),

    /// A fact mutation, with the event that caused it when known.
    FactChanged {
        change: FactChange,
        cause: Option<Event>,
    },

    /// A timer fire.
    TimerFired(TimerFired),

    /// A completed temporal pattern instance.
    TemporalMatch(TemporalMatch),

    /// Close temporal windows that expired by `now`.
    Sweep { now: DateTime<Utc> },
}

/// Dispatch counters, shared with the engine stats surface.
#[derive(Debug, Default)]
pub struct DispatchStats {
    /// Events fully processed.
    pub events_processed: AtomicU64,

    /// Rule trigger count.
    pub rules_triggered: AtomicU64,

    /// Rules that ran their actions.
    pub rules_executed: AtomicU64,

    /// Rules skipped (conditions, lookups, or errors).
    pub rules_skipped: AtomicU64,

    /// Failed actions.
    pub actions_failed: AtomicU64,

    /// Internal invariant violations.
    pub invariant_violations: AtomicU64,
}

/// Sender side of the processing queue, with drain tracking.
#[derive(Clone)]
pub struct QueueHandle {
    tx: mpsc::UnboundedSender<QueueItem>,
    pending: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl QueueHandle {
    /// Create a queue and its receiver.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<QueueItem>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                pending: Arc::new(AtomicUsize::new(0)),
                idle: Arc::new(Notify::new()),
            },
            rx,
        )
    }

    /// Append an item to the queue tail.
    pub fn enqueue(&self, item: QueueItem) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(item).is_err() {
            // Worker is gone; keep the pending count honest.
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Mark one item processed. Called by the worker.
    pub fn mark_done(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Items submitted but not yet fully processed.
    pub fn depth(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Wait until every submitted item has been processed.
    pub async fn drain(&self) {
        loop {
            let notified = self.idle.notified();
            if self.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Event subscription identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventSubscriptionId(Uuid);

type EventCallback = Box<dyn Fn(&Event) + Send + Sync>;

/// Processes queue items: candidate lookup, condition evaluation, action
/// execution, and re-entrant effect routing.
pub struct Dispatcher {
    rules: Arc<RuleManager>,
    facts: Arc<FactStore>,
    events: Arc<EventStore>,
    traces: Arc<TraceCollector>,
    temporal: Arc<Mutex<TemporalCoordinator>>,
    baselines: Arc<BaselineRegistry>,
    conditions: ConditionEvaluator,
    lookups: Arc<LookupExecutor>,
    actions: ActionExecutor,
    queue: QueueHandle,
    stats: Arc<DispatchStats>,
    event_subscribers: RwLock<HashMap<EventSubscriptionId, EventCallback>>,
    engine_name: String,
}

impl Dispatcher {
    /// Wire a dispatcher to the engine internals.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rules: Arc<RuleManager>,
        facts: Arc<FactStore>,
        events: Arc<EventStore>,
        traces: Arc<TraceCollector>,
        temporal: Arc<Mutex<TemporalCoordinator>>,
        baselines: Arc<BaselineRegistry>,
        lookups: Arc<LookupExecutor>,
        actions: ActionExecutor,
        queue: QueueHandle,
        stats: Arc<DispatchStats>,
        engine_name: impl Into<String>,
    ) -> Self {
        Self {
            rules,
            facts,
            events,
            traces,
            temporal,
            baselines,
            conditions: ConditionEvaluator::new(),
            lookups,
            actions,
            queue,
            stats,
            event_subscribers: RwLock::new(HashMap::new()),
            engine_name: engine_name.into(),
        }
    }

    /// Subscribe to every event the engine processes.
    ///
    /// Subscribers observe; they must not mutate engine state synchronously.
    pub fn subscribe_events<F>(&self, callback: F) -> EventSubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = EventSubscriptionId(Uuid::new_v4());
        self.event_subscribers.write().insert(id, Box::new(callback));
        id
    }

    /// Remove an event subscription.
    pub fn unsubscribe_events(&self, id: EventSubscriptionId) -> bool {
        self.event_subscribers.write().remove(&id).is_some()
    }

    /// Process one queue item end to end.
    pub async fn process(&self, item: QueueItem) {
        match item {
            QueueItem::Event(event) => self.process_event(event).await,
            QueueItem::FactChanged { change, cause } => {
                self.process_fact_change(change, cause).await;
            }
            QueueItem::TimerFired(fired) => self.process_timer(fired).await,
            QueueItem::TemporalMatch(matched) => self.process_temporal_match(matched).await,
            QueueItem::Sweep { now } => {
                let matches = self.temporal.lock().sweep(now);
                for matched in matches {
                    self.queue.enqueue(QueueItem::TemporalMatch(matched));
                }
            }
        }
    }

    async fn process_event(&self, mut event: Event) {
        if event.source.is_none() {
            event.source = Some(self.engine_name.clone());
        }
        // No cause to inherit from means a fresh correlation.
        if event.correlation_id.is_none() {
            event.correlation_id = Some(CorrelationId::new());
        }

        if let Err(err) = self.events.append(event.clone()) {
            self.stats
                .invariant_violations
                .fetch_add(1, Ordering::Relaxed);
            warn!("Event {} rejected: {}", event.id, err);
            self.traces.record(
                TraceEntry::new(
                    TraceType::EventEmitted,
                    json!({"topic": event.topic, "error": err.to_string()}),
                )
                .with_correlation(event.correlation_id),
            );
            return;
        }

        self.traces.record(
            TraceEntry::new(
                TraceType::EventEmitted,
                json!({"topic": event.topic, "event_id": event.id, "source": event.source}),
            )
            .with_correlation(event.correlation_id)
            .with_causation(event.causation_id),
        );

        {
            let subscribers = self.event_subscribers.read();
            for callback in subscribers.values() {
                if std::panic::catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
                    warn!("Event subscriber panicked for {}", event.id);
                }
            }
        }

        // Temporal matches re-enter through the queue tail, after this
        // event's own rules.
        let matches = self.temporal.lock().process_event(&event);
        for matched in matches {
            self.queue.enqueue(QueueItem::TemporalMatch(matched));
        }

        let candidates = self.rules.candidates_for_event(&event.topic);
        for rule in candidates {
            let trigger = TriggerContext::Event {
                event: event.clone(),
            };
            self.dispatch_rule(&rule, trigger).await;
        }

        self.stats.events_processed.fetch_add(1, Ordering::Relaxed);
    }

    async fn process_fact_change(&self, change: FactChange, cause: Option<Event>) {
        self.traces.record(
            TraceEntry::new(
                TraceType::FactChanged,
                json!({
                    "key": change.key,
                    "version": change.version,
                    "deleted": change.is_delete(),
                    "source": change.source,
                }),
            )
            .with_correlation(cause.as_ref().and_then(|e| e.correlation_id))
            .with_causation(cause.as_ref().map(|e| e.id)),
        );

        let candidates = self.rules.candidates_for_fact(&change.key);
        for rule in candidates {
            let trigger = TriggerContext::FactChange {
                change: change.clone(),
                cause: cause.clone(),
            };
            self.dispatch_rule(&rule, trigger).await;
        }
    }

    async fn process_timer(&self, fired: TimerFired) {
        let timer = fired.timer;

        self.traces.record(
            TraceEntry::new(
                TraceType::TimerExpired,
                json!({"name": timer.name, "fire_count": fired.fire_count}),
            )
            .with_correlation(timer.correlation_id),
        );

        let mut expiry = Event::new(timer.on_expire.topic.clone(), timer.on_expire.data.clone())
            .with_source(format!("timer:{}", timer.name));
        if let Some(correlation_id) = timer.correlation_id {
            expiry = expiry.with_correlation(correlation_id);
        }

        let candidates = self.rules.candidates_for_timer(&timer.name);
        for rule in candidates {
            let trigger = TriggerContext::Timer {
                timer: timer.clone(),
                event: expiry.clone(),
                fire_count: fired.fire_count,
            };
            self.dispatch_rule(&rule, trigger).await;
        }

        // The expiry event itself goes through normal emission.
        self.queue.enqueue(QueueItem::Event(expiry));
    }

    async fn process_temporal_match(&self, matched: TemporalMatch) {
        let rule_id = RuleId::new(matched.pattern_id.clone());
        let Some(rule) = self.rules.get(&rule_id) else {
            // The rule was unregistered after the match was queued.
            return;
        };
        if !self.rules.is_rule_active(&rule) {
            return;
        }

        let trigger = TriggerContext::Temporal { matched };
        self.dispatch_rule(&rule, trigger).await;
    }

    /// Run one rule, isolating any panic to a skip record.
    async fn dispatch_rule(&self, rule: &Rule, trigger: TriggerContext) {
        let correlation_id = trigger.correlation_id();
        let causation_id = trigger.causation_id();

        let outcome = AssertUnwindSafe(self.run_rule(rule, trigger))
            .catch_unwind()
            .await;

        if outcome.is_err() {
            warn!("Rule {} panicked during dispatch", rule.id);
            self.stats
                .invariant_violations
                .fetch_add(1, Ordering::Relaxed);
            self.stats.rules_skipped.fetch_add(1, Ordering::Relaxed);
            self.traces.record(
                TraceEntry::new(TraceType::RuleSkipped, json!({"reason": "error"}))
                    .with_correlation(correlation_id)
                    .with_causation(causation_id)
                    .with_rule(rule.id.clone(), rule.name.clone()),
            );
        }
    }

    async fn run_rule(&self, rule: &Rule, trigger: TriggerContext) {
        self.stats.rules_triggered.fetch_add(1, Ordering::Relaxed);

        let correlation_id = trigger.correlation_id();
        let causation_id = trigger.causation_id();
        let record = |trace_type: TraceType, details: serde_json::Value| {
            TraceEntry::new(trace_type, details)
                .with_correlation(correlation_id)
                .with_causation(causation_id)
                .with_rule(rule.id.clone(), rule.name.clone())
        };

        self.traces.record(record(
            TraceType::RuleTriggered,
            json!({"trigger": trigger.describe()}),
        ));

        let started = Instant::now();
        let mut ctx = EvaluationContext::new(trigger, Arc::clone(&self.facts))
            .with_baselines(Arc::clone(&self.baselines));

        if !rule.lookups.is_empty() {
            if let Err(err) = self.lookups.resolve_all(&rule.lookups, &mut ctx).await {
                self.stats.rules_skipped.fetch_add(1, Ordering::Relaxed);
                self.traces.record(record(
                    TraceType::RuleSkipped,
                    json!({"reason": "lookup_failed", "error": err.to_string()}),
                ));
                return;
            }
        }

        let (passed, outcomes) = self.conditions.evaluate_all(&rule.conditions, &ctx);
        for (index, outcome) in outcomes.iter().enumerate() {
            self.traces.record(
                record(
                    TraceType::ConditionEvaluated,
                    json!({
                        "index": index,
                        "passed": outcome.passed,
                        "expected": outcome.expected,
                        "actual": outcome.actual,
                    }),
                )
                .with_duration_ms(outcome.duration_ms),
            );
        }

        if !passed {
            self.stats.rules_skipped.fetch_add(1, Ordering::Relaxed);
            self.traces.record(record(
                TraceType::RuleSkipped,
                json!({"reason": "conditions_not_met"}),
            ));
            return;
        }

        let action_outcomes = self.actions.execute_all(rule, &mut ctx).await;
        let failed = action_outcomes.iter().filter(|o| !o.succeeded()).count();
        self.stats
            .actions_failed
            .fetch_add(failed as u64, Ordering::Relaxed);

        self.stats.rules_executed.fetch_add(1, Ordering::Relaxed);
        self.traces.record(
            record(
                TraceType::RuleExecuted,
                json!({
                    "actions": action_outcomes.len(),
                    "failed_actions": failed,
                }),
            )
            .with_duration_ms(started.elapsed().as_secs_f64() * 1000.0),
        );
    }
}

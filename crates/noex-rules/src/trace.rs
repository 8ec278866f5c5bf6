//! Structured tracing of every engine decision.

use crate::ids::{CorrelationId, EventId, RuleId, TraceId};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;
use uuid::Uuid;

/// Kind of a trace entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceType {
    /// A rule was selected by a trigger.
    RuleTriggered,
    /// A rule ran its actions.
    RuleExecuted,
    /// A rule was skipped (conditions, lookups, or an error).
    RuleSkipped,
    /// One condition was evaluated.
    ConditionEvaluated,
    /// An action is about to run.
    ActionStarted,
    /// An action finished.
    ActionCompleted,
    /// An action failed.
    ActionFailed,
    /// A fact was set or deleted.
    FactChanged,
    /// An event entered the store.
    EventEmitted,
    /// A timer was set or replaced.
    TimerSet,
    /// A timer was cancelled.
    TimerCancelled,
    /// A timer fired.
    TimerExpired,
    /// A hot reload began applying a diff.
    HotReloadStarted,
    /// A hot reload applied its diff.
    HotReloadCompleted,
    /// A hot reload was aborted.
    HotReloadFailed,
}

/// A single recorded decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    /// Unique entry identifier.
    pub id: TraceId,

    /// When the entry was recorded.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,

    /// Entry kind.
    pub trace_type: TraceType,

    /// Kind-specific details.
    pub details: Value,

    /// Correlation id of the flow this entry belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,

    /// Id of the causing event, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<EventId>,

    /// Rule the entry concerns, when any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<RuleId>,

    /// Name of that rule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_name: Option<String>,

    /// Wall time consumed, for executed rules, conditions, and actions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
}

impl TraceEntry {
    /// Create an entry with the current timestamp.
    pub fn new(trace_type: TraceType, details: Value) -> Self {
        Self {
            id: TraceId::new(),
            timestamp: Utc::now(),
            trace_type,
            details,
            correlation_id: None,
            causation_id: None,
            rule_id: None,
            rule_name: None,
            duration_ms: None,
        }
    }

    /// Set the correlation id.
    pub fn with_correlation(mut self, correlation_id: Option<CorrelationId>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Set the causation id.
    pub fn with_causation(mut self, causation_id: Option<EventId>) -> Self {
        self.causation_id = causation_id;
        self
    }

    /// Set the rule id and name.
    pub fn with_rule(mut self, rule_id: RuleId, rule_name: impl Into<String>) -> Self {
        self.rule_id = Some(rule_id);
        self.rule_name = Some(rule_name.into());
        self
    }

    /// Set the duration.
    pub fn with_duration_ms(mut self, duration_ms: f64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }
}

/// Trace subscription identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceSubscriptionId(Uuid);

type TraceCallback = Box<dyn Fn(&TraceEntry) + Send + Sync>;

struct CollectorInner {
    entries: HashMap<TraceId, TraceEntry>,
    order: VecDeque<TraceId>,
    by_correlation: HashMap<CorrelationId, Vec<TraceId>>,
    by_rule: HashMap<RuleId, Vec<TraceId>>,
    by_type: HashMap<TraceType, Vec<TraceId>>,
}

/// Bounded trace collector with secondary indexes and live subscribers.
///
/// Recording is a no-op while disabled. When the buffer fills, roughly 10%
/// of the oldest entries are evicted in one batch, keeping the indexes in
/// lockstep.
pub struct TraceCollector {
    capacity: usize,
    enabled: AtomicBool,
    inner: RwLock<CollectorInner>,
    subscribers: RwLock<HashMap<TraceSubscriptionId, TraceCallback>>,
}

impl TraceCollector {
    /// Create a collector holding at most `capacity` entries.
    pub fn new(capacity: usize, enabled: bool) -> Self {
        Self {
            capacity: capacity.max(1),
            enabled: AtomicBool::new(enabled),
            inner: RwLock::new(CollectorInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
                by_correlation: HashMap::new(),
                by_rule: HashMap::new(),
                by_type: HashMap::new(),
            }),
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    /// Whether recording is enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Enable or disable recording.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Record an entry; a no-op while disabled.
    pub fn record(&self, entry: TraceEntry) {
        if !self.is_enabled() {
            return;
        }

        {
            let mut inner = self.inner.write();

            if inner.order.len() >= self.capacity {
                let batch = (self.capacity / 10).max(1);
                for _ in 0..batch {
                    let Some(evicted_id) = inner.order.pop_front() else {
                        break;
                    };
                    unindex(&mut inner, evicted_id);
                }
            }

            inner.order.push_back(entry.id);
            if let Some(correlation_id) = entry.correlation_id {
                inner
                    .by_correlation
                    .entry(correlation_id)
                    .or_default()
                    .push(entry.id);
            }
            if let Some(rule_id) = entry.rule_id.clone() {
                inner.by_rule.entry(rule_id).or_default().push(entry.id);
            }
            inner
                .by_type
                .entry(entry.trace_type)
                .or_default()
                .push(entry.id);
            inner.entries.insert(entry.id, entry.clone());
        }

        let subscribers = self.subscribers.read();
        for callback in subscribers.values() {
            if catch_unwind(AssertUnwindSafe(|| callback(&entry))).is_err() {
                warn!("Trace subscriber panicked; entry {} dropped for it", entry.id);
            }
        }
    }

    /// Subscribe to entries as they are recorded.
    pub fn subscribe<F>(&self, callback: F) -> TraceSubscriptionId
    where
        F: Fn(&TraceEntry) + Send + Sync + 'static,
    {
        let id = TraceSubscriptionId(Uuid::new_v4());
        self.subscribers.write().insert(id, Box::new(callback));
        id
    }

    /// Remove a subscription.
    pub fn unsubscribe(&self, id: TraceSubscriptionId) -> bool {
        self.subscribers.write().remove(&id).is_some()
    }

    /// Entries for a correlation id, oldest first.
    pub fn get_by_correlation(&self, correlation_id: CorrelationId) -> Vec<TraceEntry> {
        let inner = self.inner.read();
        inner
            .by_correlation
            .get(&correlation_id)
            .map(|ids| collect(&inner, ids))
            .unwrap_or_default()
    }

    /// Entries for a rule, oldest first.
    pub fn get_by_rule(&self, rule_id: &RuleId) -> Vec<TraceEntry> {
        let inner = self.inner.read();
        inner
            .by_rule
            .get(rule_id)
            .map(|ids| collect(&inner, ids))
            .unwrap_or_default()
    }

    /// Entries of a kind, oldest first.
    pub fn get_by_type(&self, trace_type: TraceType) -> Vec<TraceEntry> {
        let inner = self.inner.read();
        inner
            .by_type
            .get(&trace_type)
            .map(|ids| collect(&inner, ids))
            .unwrap_or_default()
    }

    /// The most recent `limit` entries, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<TraceEntry> {
        let inner = self.inner.read();
        let skip = inner.order.len().saturating_sub(limit);
        inner
            .order
            .iter()
            .skip(skip)
            .filter_map(|id| inner.entries.get(id).cloned())
            .collect()
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.inner.read().order.len()
    }

    /// Whether the collector is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.read().order.is_empty()
    }

    /// Drop all entries and indexes.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.entries.clear();
        inner.order.clear();
        inner.by_correlation.clear();
        inner.by_rule.clear();
        inner.by_type.clear();
    }
}

fn collect(inner: &CollectorInner, ids: &[TraceId]) -> Vec<TraceEntry> {
    ids.iter()
        .filter_map(|id| inner.entries.get(id).cloned())
        .collect()
}

fn unindex(inner: &mut CollectorInner, id: TraceId) {
    fn remove<K: std::hash::Hash + Eq>(index: &mut HashMap<K, Vec<TraceId>>, key: &K, id: TraceId) {
        let emptied = match index.get_mut(key) {
            Some(ids) => {
                ids.retain(|other| *other != id);
                ids.is_empty()
            }
            None => false,
        };
        if emptied {
            index.remove(key);
        }
    }

    let Some(entry) = inner.entries.remove(&id) else {
        return;
    };

    if let Some(correlation_id) = entry.correlation_id {
        remove(&mut inner.by_correlation, &correlation_id, id);
    }
    if let Some(rule_id) = entry.rule_id {
        remove(&mut inner.by_rule, &rule_id, id);
    }
    remove(&mut inner.by_type, &entry.trace_type, id);
}

//! Event type and the bounded event store.

use crate::error::{Result, RuleError};
use crate::ids::{CorrelationId, EventId};
use crate::pattern;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};

/// An event flowing through the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event identifier.
    pub id: EventId,

    /// Dot-delimited topic.
    pub topic: String,

    /// Open payload.
    #[serde(default)]
    pub data: Value,

    /// When the event occurred.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,

    /// Who emitted the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// Correlation id threaded across causally-related events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,

    /// Id of the immediate cause.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<EventId>,
}

impl Event {
    /// Create a new event with a fresh id and the current timestamp.
    pub fn new(topic: impl Into<String>, data: Value) -> Self {
        Self {
            id: EventId::new(),
            topic: topic.into(),
            data,
            timestamp: Utc::now(),
            source: None,
            correlation_id: None,
            causation_id: None,
        }
    }

    /// Set the event source.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Set the correlation id.
    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Set the causation id.
    pub fn with_causation(mut self, causation_id: EventId) -> Self {
        self.causation_id = Some(causation_id);
        self
    }

    /// Set the timestamp.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Read a dotted field path from the payload.
    pub fn field(&self, path: &str) -> Option<&Value> {
        crate::value::traverse(&self.data, path)
    }
}

struct StoreInner {
    events: HashMap<EventId, Event>,
    order: VecDeque<EventId>,
    by_topic: HashMap<String, Vec<EventId>>,
    by_correlation: HashMap<CorrelationId, Vec<EventId>>,
}

/// Bounded in-memory event store.
///
/// Holds the most recent events in a ring buffer with secondary indexes by
/// topic and correlation. When the buffer fills, roughly 10% of the oldest
/// entries are evicted in one batch and unindexed one by one.
pub struct EventStore {
    capacity: usize,
    inner: RwLock<StoreInner>,
}

impl EventStore {
    /// Create a store holding at most `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: RwLock::new(StoreInner {
                events: HashMap::new(),
                order: VecDeque::new(),
                by_topic: HashMap::new(),
                by_correlation: HashMap::new(),
            }),
        }
    }

    /// Append an event.
    ///
    /// Event ids must be unique for the engine's lifetime; a duplicate is
    /// refused with an invariant error.
    pub fn append(&self, event: Event) -> Result<()> {
        let mut inner = self.inner.write();

        if inner.events.contains_key(&event.id) {
            return Err(RuleError::invariant(format!(
                "duplicate event id {}",
                event.id
            )));
        }

        if inner.order.len() >= self.capacity {
            let batch = (self.capacity / 10).max(1);
            for _ in 0..batch {
                let Some(evicted_id) = inner.order.pop_front() else {
                    break;
                };
                unindex(&mut inner, evicted_id);
            }
        }

        inner.order.push_back(event.id);
        inner
            .by_topic
            .entry(event.topic.clone())
            .or_default()
            .push(event.id);
        if let Some(correlation_id) = event.correlation_id {
            inner
                .by_correlation
                .entry(correlation_id)
                .or_default()
                .push(event.id);
        }
        inner.events.insert(event.id, event);
        Ok(())
    }

    /// Get an event by id.
    pub fn get(&self, id: EventId) -> Option<Event> {
        self.inner.read().events.get(&id).cloned()
    }

    /// Events with an exact topic, oldest first.
    pub fn get_by_topic(&self, topic: &str) -> Vec<Event> {
        let inner = self.inner.read();
        inner
            .by_topic
            .get(topic)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.events.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Events whose topic matches a wildcard pattern, oldest first.
    pub fn get_by_topic_pattern(&self, topic_pattern: &str) -> Vec<Event> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.events.get(id))
            .filter(|e| pattern::matches_topic(&e.topic, topic_pattern))
            .cloned()
            .collect()
    }

    /// Events with timestamps in `[start, end]`, oldest first.
    pub fn get_in_time_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<Event> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.events.get(id))
            .filter(|e| e.timestamp >= start && e.timestamp <= end)
            .cloned()
            .collect()
    }

    /// Events sharing a correlation id, oldest first.
    pub fn get_by_correlation(&self, correlation_id: CorrelationId) -> Vec<Event> {
        let inner = self.inner.read();
        inner
            .by_correlation
            .get(&correlation_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.events.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All retained events, oldest first.
    pub fn get_all(&self) -> Vec<Event> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.events.get(id).cloned())
            .collect()
    }

    /// Number of retained events.
    pub fn len(&self) -> usize {
        self.inner.read().order.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.read().order.is_empty()
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

fn unindex(inner: &mut StoreInner, id: EventId) {
    fn remove<K: std::hash::Hash + Eq>(index: &mut HashMap<K, Vec<EventId>>, key: &K, id: EventId) {
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

    let Some(event) = inner.events.remove(&id) else {
        return;
    };

    remove(&mut inner.by_topic, &event.topic, id);
    if let Some(correlation_id) = event.correlation_id {
        remove(&mut inner.by_correlation, &correlation_id, id);
    }
}

//! Baseline metrics: aggregates over historical events.
//!
//! A baseline names an aggregate (`sum`, `avg`, `min`, `max`, `count`) of a
//! payload field over events in a trailing window. Conditions with a
//! `baseline{metric}` source resolve through the registry at evaluation
//! time.

use crate::duration::parse_duration;
use crate::error::{Result, RuleError};
use crate::events::EventStore;
use crate::pattern;
use crate::temporal::AggregateFunction;
use crate::value;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// A baseline metric definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineDef {
    /// Metric name referenced from conditions.
    pub metric: String,

    /// Topic pattern of the contributing events.
    pub topic: String,

    /// Payload field supplying samples; unused for `count`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,

    /// Aggregate function.
    pub function: AggregateFunction,

    /// Trailing window, duration grammar.
    pub window: Value,
}

impl BaselineDef {
    /// Validate the definition.
    pub fn validate(&self) -> Result<()> {
        if self.metric.trim().is_empty() {
            return Err(RuleError::validation("baseline metric must not be empty"));
        }
        if self.topic.trim().is_empty() {
            return Err(RuleError::validation(format!(
                "baseline {}: topic must not be empty",
                self.metric
            )));
        }
        if self.field.is_none() && self.function != AggregateFunction::Count {
            return Err(RuleError::validation(format!(
                "baseline {}: function {:?} requires a field",
                self.metric, self.function
            )));
        }
        parse_duration(&self.window).map_err(|e| {
            RuleError::validation(format!("baseline {}: invalid window: {e}", self.metric))
        })?;
        Ok(())
    }
}

/// Registry of baseline metrics, evaluated against the event store.
pub struct BaselineRegistry {
    events: Arc<EventStore>,
    defs: RwLock<HashMap<String, BaselineDef>>,
}

impl BaselineRegistry {
    /// Create a registry reading from the given event store.
    pub fn new(events: Arc<EventStore>) -> Self {
        Self {
            events,
            defs: RwLock::new(HashMap::new()),
        }
    }

    /// Register a metric, replacing any previous definition with the name.
    pub fn register(&self, def: BaselineDef) -> Result<()> {
        def.validate()?;
        self.defs.write().insert(def.metric.clone(), def);
        Ok(())
    }

    /// Remove a metric.
    pub fn remove(&self, metric: &str) -> bool {
        self.defs.write().remove(metric).is_some()
    }

    /// Registered metric names.
    pub fn metrics(&self) -> Vec<String> {
        self.defs.read().keys().cloned().collect()
    }

    /// Evaluate a metric at a point in time.
    ///
    /// Returns `None` for unknown metrics and for aggregates that are
    /// undefined over an empty sample set.
    pub fn evaluate(&self, metric: &str, now: DateTime<Utc>) -> Option<f64> {
        let def = self.defs.read().get(metric).cloned()?;
        let window = parse_duration(&def.window).ok()?;

        let samples: Vec<f64> = self
            .events
            .get_in_time_range(now - window, now)
            .into_iter()
            .filter(|event| pattern::matches_topic(&event.topic, &def.topic))
            .filter_map(|event| match &def.field {
                Some(field) => value::traverse(&event.data, field).and_then(|v| v.as_f64()),
                // Every matching event is one sample for `count`.
                None => Some(1.0),
            })
            .collect();

        def.function.apply(&samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Event;
    use chrono::Duration;
    use serde_json::json;

    fn registry_with_orders() -> (BaselineRegistry, DateTime<Utc>) {
        let store = Arc::new(EventStore::new(100));
        let base = Utc::now();
        for (offset, total) in [(0, 100.0), (60, 200.0), (120, 600.0)] {
            store
                .append(
                    Event::new("order.placed", json!({"total": total}))
                        .with_timestamp(base + Duration::seconds(offset)),
                )
                .unwrap();
        }
        (BaselineRegistry::new(store), base)
    }

    #[test]
    fn test_validation() {
        let def = BaselineDef {
            metric: "avg-order".into(),
            topic: "order.placed".into(),
            field: None,
            function: AggregateFunction::Avg,
            window: json!("1h"),
        };
        assert!(def.validate().is_err());

        let def = BaselineDef {
            field: Some("total".into()),
            ..def
        };
        assert!(def.validate().is_ok());
    }

    #[test]
    fn test_avg_over_window() {
        let (registry, base) = registry_with_orders();
        registry
            .register(BaselineDef {
                metric: "avg-order".into(),
                topic: "order.*".into(),
                field: Some("total".into()),
                function: AggregateFunction::Avg,
                window: json!("1h"),
            })
            .unwrap();

        let avg = registry.evaluate("avg-order", base + Duration::seconds(120));
        assert_eq!(avg, Some(300.0));
    }

    #[test]
    fn test_count_without_field() {
        let (registry, base) = registry_with_orders();
        registry
            .register(BaselineDef {
                metric: "order-count".into(),
                topic: "order.placed".into(),
                field: None,
                function: AggregateFunction::Count,
                window: json!("90"),
            })
            .unwrap();

        // A 90 ms window ending at the second event sees only that event.
        let count = registry.evaluate("order-count", base + Duration::seconds(60));
        assert_eq!(count, Some(1.0));
    }

    #[test]
    fn test_unknown_metric() {
        let (registry, base) = registry_with_orders();
        assert_eq!(registry.evaluate("nope", base), None);
    }
}

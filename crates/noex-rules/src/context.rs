//! Evaluation context: the trigger, live state, and bound variables.

use crate::baselines::BaselineRegistry;
use crate::events::Event;
use crate::facts::{FactChange, FactStore};
use crate::ids::{CorrelationId, EventId};
use crate::temporal::TemporalMatch;
use crate::timers::Timer;
use crate::value;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// The stimulus a rule is being evaluated against.
#[derive(Debug, Clone)]
pub enum TriggerContext {
    /// An emitted event.
    Event {
        event: Event,
    },

    /// A fact mutation, with the event that caused it when known.
    FactChange {
        change: FactChange,
        cause: Option<Event>,
    },

    /// A timer expiry; `event` is the emitted expiry event.
    Timer {
        timer: Timer,
        event: Event,
        fire_count: u32,
    },

    /// A temporal pattern match.
    Temporal {
        matched: TemporalMatch,
    },
}

impl TriggerContext {
    /// Short kind name used in traces.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Event { .. } => "event",
            Self::FactChange { .. } => "fact",
            Self::Timer { .. } => "timer",
            Self::Temporal { .. } => "temporal",
        }
    }

    /// The event backing `event.*` resolution, when the trigger has one.
    ///
    /// Temporal triggers expose their last matched event.
    pub fn event(&self) -> Option<&Event> {
        match self {
            Self::Event { event } => Some(event),
            Self::FactChange { cause, .. } => cause.as_ref(),
            Self::Timer { event, .. } => Some(event),
            Self::Temporal { matched } => matched.matched_events.last(),
        }
    }

    /// Events matched by a temporal trigger.
    pub fn matched_events(&self) -> &[Event] {
        match self {
            Self::Temporal { matched } => &matched.matched_events,
            _ => &[],
        }
    }

    /// Correlation id carried by the trigger.
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        match self {
            Self::Event { event } => event.correlation_id,
            Self::FactChange { cause, .. } => cause.as_ref().and_then(|e| e.correlation_id),
            Self::Timer { timer, event, .. } => timer.correlation_id.or(event.correlation_id),
            Self::Temporal { matched } => matched.correlation_id(),
        }
    }

    /// Id of the immediate cause, for derived events and traces.
    pub fn causation_id(&self) -> Option<EventId> {
        match self {
            Self::Event { event } => Some(event.id),
            Self::FactChange { cause, .. } => cause.as_ref().map(|e| e.id),
            Self::Timer { event, .. } => Some(event.id),
            Self::Temporal { matched } => matched.causation_id(),
        }
    }

    /// When the trigger happened.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Event { event } => event.timestamp,
            Self::FactChange { change, .. } => change.timestamp,
            Self::Timer { event, .. } => event.timestamp,
            Self::Temporal { matched } => matched.window_end,
        }
    }

    /// Trace-friendly summary.
    pub fn describe(&self) -> Value {
        match self {
            Self::Event { event } => json!({
                "kind": "event",
                "topic": event.topic,
                "event_id": event.id,
            }),
            Self::FactChange { change, .. } => json!({
                "kind": "fact",
                "key": change.key,
                "version": change.version,
            }),
            Self::Timer { timer, fire_count, .. } => json!({
                "kind": "timer",
                "name": timer.name,
                "fire_count": fire_count,
            }),
            Self::Temporal { matched } => json!({
                "kind": "temporal",
                "pattern_id": matched.pattern_id,
                "match": matched.kind,
                "group": matched.group_key,
            }),
        }
    }
}

/// Everything a condition or action may read while a rule runs.
pub struct EvaluationContext {
    /// The trigger under evaluation.
    pub trigger: TriggerContext,

    /// Live fact store.
    pub facts: Arc<FactStore>,

    /// Baseline metrics, when the engine has any registered.
    pub baselines: Option<Arc<BaselineRegistry>>,

    /// Variables bound by the caller, lookups, or earlier actions.
    pub variables: HashMap<String, Value>,

    /// Resolved lookup results; `None` marks a failed `skip`-policy lookup.
    pub lookups: HashMap<String, Option<Value>>,
}

impl EvaluationContext {
    /// Create a context for a trigger.
    pub fn new(trigger: TriggerContext, facts: Arc<FactStore>) -> Self {
        Self {
            trigger,
            facts,
            baselines: None,
            variables: HashMap::new(),
            lookups: HashMap::new(),
        }
    }

    /// Attach a baseline registry.
    pub fn with_baselines(mut self, baselines: Arc<BaselineRegistry>) -> Self {
        self.baselines = Some(baselines);
        self
    }

    /// Bind a context variable.
    pub fn bind(&mut self, key: impl Into<String>, value: Value) {
        self.variables.insert(key.into(), value);
    }

    /// Bind a lookup result.
    pub fn bind_lookup(&mut self, name: impl Into<String>, result: Option<Value>) {
        self.lookups.insert(name.into(), result);
    }

    /// Resolve a reference path against this context.
    ///
    /// Path grammar: `event[.field...]`, `fact:<key>`, `context.<key>[...]`,
    /// `lookup.<name>[.field...]`, `baseline.<metric>`, and `trigger.<attr>`
    /// for trigger metadata. Unknown prefixes resolve to `None`.
    pub fn resolve(&self, path: &str) -> Option<Value> {
        if let Some(key) = path.strip_prefix("fact:") {
            return self.facts.get_value(key);
        }

        if path == "event" {
            return self.trigger.event().map(|e| e.data.clone());
        }
        if let Some(rest) = path.strip_prefix("event.") {
            let event = self.trigger.event()?;
            return value::traverse(&event.data, rest).cloned();
        }

        if let Some(rest) = path.strip_prefix("context.") {
            let (key, tail) = split_head(rest);
            let bound = self.variables.get(key)?;
            return match tail {
                Some(tail) => value::traverse(bound, tail).cloned(),
                None => Some(bound.clone()),
            };
        }

        if let Some(rest) = path.strip_prefix("lookup.") {
            let (name, tail) = split_head(rest);
            let result = self.lookups.get(name)?.as_ref()?;
            return match tail {
                Some(tail) => value::traverse(result, tail).cloned(),
                None => Some(result.clone()),
            };
        }

        if let Some(metric) = path.strip_prefix("baseline.") {
            let registry = self.baselines.as_ref()?;
            return registry
                .evaluate(metric, self.trigger.timestamp())
                .map(|v| json!(v));
        }

        if let Some(attr) = path.strip_prefix("trigger.") {
            return self.resolve_trigger_attr(attr);
        }

        None
    }

    fn resolve_trigger_attr(&self, attr: &str) -> Option<Value> {
        match (&self.trigger, attr) {
            (TriggerContext::Event { event }, "topic") => Some(json!(event.topic)),
            (TriggerContext::FactChange { change, .. }, "key") => Some(json!(change.key)),
            (TriggerContext::FactChange { change, .. }, "value") => change.new_value.clone(),
            (TriggerContext::FactChange { change, .. }, "previous") => {
                change.previous_value.clone()
            }
            (TriggerContext::Timer { timer, .. }, "name") => Some(json!(timer.name)),
            (TriggerContext::Temporal { matched }, "group") => {
                matched.group_key.as_ref().map(|g| json!(g))
            }
            (TriggerContext::Temporal { matched }, "value") => matched.value.map(|v| json!(v)),
            _ => None,
        }
    }

    /// Expand `${...}` placeholders in a template.
    pub fn interpolate(&self, template: &str) -> String {
        value::interpolate(template, &|path| self.resolve(path))
    }

    /// Resolve refs and placeholders throughout an action payload.
    pub fn resolve_payload(&self, payload: &Value) -> Value {
        value::resolve_value(payload, &|path| self.resolve(path))
    }
}

fn split_head(path: &str) -> (&str, Option<&str>) {
    match path.split_once('.') {
        Some((head, tail)) => (head, Some(tail)),
        None => (path, None),
    }
}

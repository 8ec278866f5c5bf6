//! Temporal pattern matching over the event stream.
//!
//! Four matchers (sequence, absence, count, aggregate) own per-pattern
//! instance state keyed by group. Matchers run on event time: an incoming
//! event first sweeps expired windows at its timestamp, then advances the
//! instances it matches. Matches feed back into the dispatcher as temporal
//! triggers.

mod absence;
mod aggregate;
mod count;
mod sequence;

pub use absence::AbsenceMatcher;
pub use aggregate::AggregateMatcher;
pub use count::CountMatcher;
pub use sequence::SequenceMatcher;

use crate::duration::parse_duration;
use crate::error::{Result, RuleError};
use crate::events::Event;
use crate::ids::{CorrelationId, EventId};
use crate::pattern;
use crate::value;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Selects events participating in a temporal pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSelector {
    /// Topic, exact or wildcard pattern.
    pub topic: String,

    /// Equality filter over dotted payload fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<HashMap<String, Value>>,

    /// Binding name for the matched event in sequence patterns.
    #[serde(default, rename = "as", skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl EventSelector {
    /// Whether an event satisfies this selector.
    pub fn matches(&self, event: &Event) -> bool {
        if !pattern::matches_topic(&event.topic, &self.topic) {
            return false;
        }
        match &self.filter {
            Some(filter) => filter
                .iter()
                .all(|(path, expected)| value::traverse(&event.data, path) == Some(expected)),
            None => true,
        }
    }
}

/// Threshold comparison for count and aggregate patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    /// Actual at or above the threshold.
    Gte,
    /// Actual at or below the threshold.
    Lte,
    /// Actual equal to the threshold.
    Eq,
}

impl Comparison {
    /// Apply the comparison.
    pub fn holds(&self, actual: f64, threshold: f64) -> bool {
        match self {
            Self::Gte => actual >= threshold,
            Self::Lte => actual <= threshold,
            Self::Eq => (actual - threshold).abs() < f64::EPSILON,
        }
    }
}

/// Aggregate function for aggregate patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFunction {
    /// Sum of samples.
    Sum,
    /// Mean of samples.
    Avg,
    /// Smallest sample.
    Min,
    /// Largest sample.
    Max,
    /// Number of samples.
    Count,
}

impl AggregateFunction {
    /// Apply the function over a slice of samples.
    pub fn apply(&self, samples: &[f64]) -> Option<f64> {
        if samples.is_empty() {
            return match self {
                Self::Count => Some(0.0),
                Self::Sum => Some(0.0),
                _ => None,
            };
        }
        let value = match self {
            Self::Sum => samples.iter().sum(),
            Self::Avg => samples.iter().sum::<f64>() / samples.len() as f64,
            Self::Min => samples.iter().cloned().fold(f64::INFINITY, f64::min),
            Self::Max => samples.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            Self::Count => samples.len() as f64,
        };
        Some(value)
    }
}

/// A temporal pattern, one of the four matcher families.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TemporalPattern {
    /// Ordered events within a window.
    Sequence {
        events: Vec<EventSelector>,
        within: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group_by: Option<String>,
    },

    /// An expected event failing to follow another within a window.
    Absence {
        after: EventSelector,
        expected: EventSelector,
        within: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group_by: Option<String>,
    },

    /// Event count crossing a threshold within a window.
    Count {
        event: EventSelector,
        threshold: u64,
        comparison: Comparison,
        window: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group_by: Option<String>,
        #[serde(default = "default_sliding")]
        sliding: bool,
    },

    /// Aggregate of a numeric field crossing a threshold within a window.
    Aggregate {
        event: EventSelector,
        field: String,
        function: AggregateFunction,
        threshold: f64,
        comparison: Comparison,
        window: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group_by: Option<String>,
    },
}

fn default_sliding() -> bool {
    true
}

impl TemporalPattern {
    /// Validate window durations and selector shapes.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Sequence { events, within, .. } => {
                if events.is_empty() {
                    return Err(RuleError::validation(
                        "sequence pattern requires at least one event selector",
                    ));
                }
                parse_duration(within)?;
            }
            Self::Absence { within, .. } => {
                parse_duration(within)?;
            }
            Self::Count {
                threshold, window, ..
            } => {
                if *threshold == 0 {
                    return Err(RuleError::validation(
                        "count pattern threshold must be positive",
                    ));
                }
                parse_duration(window)?;
            }
            Self::Aggregate { field, window, .. } => {
                if field.trim().is_empty() {
                    return Err(RuleError::validation(
                        "aggregate pattern field must not be empty",
                    ));
                }
                parse_duration(window)?;
            }
        }
        Ok(())
    }
}

/// Kind of a temporal match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemporalMatchKind {
    /// A sequence completed.
    SequenceMatch,
    /// An expected event never arrived.
    AbsenceMatch,
    /// A count crossed its threshold.
    CountMatch,
    /// An aggregate crossed its threshold.
    AggregateMatch,
}

/// A completed temporal pattern instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemporalMatch {
    /// Id of the owning pattern (the rule id).
    pub pattern_id: String,

    /// Match kind.
    pub kind: TemporalMatchKind,

    /// Group key the instance belonged to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_key: Option<String>,

    /// Events that satisfied the pattern, in source order.
    pub matched_events: Vec<Event>,

    /// Start of the matched window.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub window_start: DateTime<Utc>,

    /// End of the matched window.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub window_end: DateTime<Utc>,

    /// Count or aggregate value, when the pattern has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

impl TemporalMatch {
    /// Correlation id carried by the matched events, if any.
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.matched_events.iter().find_map(|e| e.correlation_id)
    }

    /// Id of the last matched event, the immediate cause of the match.
    pub fn causation_id(&self) -> Option<EventId> {
        self.matched_events.last().map(|e| e.id)
    }
}

/// Extract the group key of an event for a pattern.
pub(crate) fn group_key(event: &Event, group_by: &Option<String>) -> Option<String> {
    let path = group_by.as_ref()?;
    value::traverse(&event.data, path).map(|v| value::stringify(Some(v)))
}

/// Routes events to the four matchers and sweeps expired windows.
///
/// The coordinator is driven by the single dispatch worker; it is not
/// internally synchronized.
pub struct TemporalCoordinator {
    sequence: SequenceMatcher,
    absence: AbsenceMatcher,
    count: CountMatcher,
    aggregate: AggregateMatcher,
    patterns: HashMap<String, TemporalPattern>,
}

impl Default for TemporalCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl TemporalCoordinator {
    /// Create a coordinator with no patterns.
    pub fn new() -> Self {
        Self {
            sequence: SequenceMatcher::new(),
            absence: AbsenceMatcher::new(),
            count: CountMatcher::new(),
            aggregate: AggregateMatcher::new(),
            patterns: HashMap::new(),
        }
    }

    /// Register a pattern under an id, replacing any previous pattern with
    /// the same id.
    pub fn add_pattern(&mut self, pattern_id: impl Into<String>, pattern: &TemporalPattern) -> Result<()> {
        pattern.validate()?;
        let pattern_id = pattern_id.into();
        self.remove_pattern(&pattern_id);

        match pattern {
            TemporalPattern::Sequence { .. } => {
                self.sequence.add_pattern(pattern_id.clone(), pattern)?;
            }
            TemporalPattern::Absence { .. } => {
                self.absence.add_pattern(pattern_id.clone(), pattern)?;
            }
            TemporalPattern::Count { .. } => {
                self.count.add_pattern(pattern_id.clone(), pattern)?;
            }
            TemporalPattern::Aggregate { .. } => {
                self.aggregate.add_pattern(pattern_id.clone(), pattern)?;
            }
        }
        self.patterns.insert(pattern_id, pattern.clone());
        Ok(())
    }

    /// Remove a pattern and its instances.
    pub fn remove_pattern(&mut self, pattern_id: &str) -> bool {
        let known = self.patterns.remove(pattern_id).is_some();
        if known {
            self.sequence.remove_pattern(pattern_id);
            self.absence.remove_pattern(pattern_id);
            self.count.remove_pattern(pattern_id);
            self.aggregate.remove_pattern(pattern_id);
        }
        known
    }

    /// Whether a pattern id is registered.
    pub fn has_pattern(&self, pattern_id: &str) -> bool {
        self.patterns.contains_key(pattern_id)
    }

    /// Number of registered patterns.
    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    /// Feed an event through every matcher.
    ///
    /// Windows that expired strictly before the event's timestamp are
    /// swept first, so their matches precede any match the event itself
    /// completes.
    pub fn process_event(&mut self, event: &Event) -> Vec<TemporalMatch> {
        let mut matches = self.sweep(event.timestamp);
        matches.extend(self.sequence.process_event(event));
        matches.extend(self.absence.process_event(event));
        matches.extend(self.count.process_event(event));
        matches.extend(self.aggregate.process_event(event));
        matches
    }

    /// Close every window whose deadline passed.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<TemporalMatch> {
        let mut matches = Vec::new();
        matches.extend(self.sequence.sweep(now));
        matches.extend(self.absence.sweep(now));
        matches.extend(self.count.sweep(now));
        matches.extend(self.aggregate.sweep(now));
        matches
    }

    /// Earliest pending window deadline across all matchers.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        [
            self.sequence.next_deadline(),
            self.absence.next_deadline(),
            self.count.next_deadline(),
            self.aggregate.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Drop all patterns and instances.
    pub fn reset(&mut self) {
        self.sequence.reset();
        self.absence.reset();
        self.count.reset();
        self.aggregate.reset();
        self.patterns.clear();
    }
}

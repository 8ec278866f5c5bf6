//! Aggregate pattern matcher: a numeric field aggregate over a window.

use super::{
    group_key, AggregateFunction, Comparison, EventSelector, TemporalMatch, TemporalMatchKind,
    TemporalPattern,
};
use crate::duration::parse_duration;
use crate::error::{Result, RuleError};
use crate::events::Event;
use crate::value;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};

struct AggregateInstance {
    events: VecDeque<(Event, f64)>,
}

struct AggregateState {
    selector: EventSelector,
    field: String,
    function: AggregateFunction,
    threshold: f64,
    comparison: Comparison,
    window: Duration,
    group_by: Option<String>,
    instances: HashMap<Option<String>, AggregateInstance>,
}

/// Matches aggregates of a numeric payload field crossing a threshold
/// within a sliding window.
pub struct AggregateMatcher {
    patterns: HashMap<String, AggregateState>,
}

impl Default for AggregateMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl AggregateMatcher {
    /// Create an empty matcher.
    pub fn new() -> Self {
        Self {
            patterns: HashMap::new(),
        }
    }

    /// Register an aggregate pattern.
    pub fn add_pattern(&mut self, pattern_id: String, pattern: &TemporalPattern) -> Result<()> {
        let TemporalPattern::Aggregate {
            event,
            field,
            function,
            threshold,
            comparison,
            window,
            group_by,
        } = pattern
        else {
            return Err(RuleError::internal("not an aggregate pattern"));
        };

        self.patterns.insert(
            pattern_id,
            AggregateState {
                selector: event.clone(),
                field: field.clone(),
                function: *function,
                threshold: *threshold,
                comparison: *comparison,
                window: parse_duration(window)?,
                group_by: group_by.clone(),
                instances: HashMap::new(),
            },
        );
        Ok(())
    }

    /// Remove a pattern and its instances.
    pub fn remove_pattern(&mut self, pattern_id: &str) -> bool {
        self.patterns.remove(pattern_id).is_some()
    }

    /// Feed an event; returns matches it produced.
    ///
    /// Events without a numeric value at the configured field are ignored.
    pub fn process_event(&mut self, event: &Event) -> Vec<TemporalMatch> {
        let mut matches = Vec::new();

        for (pattern_id, state) in self.patterns.iter_mut() {
            if !state.selector.matches(event) {
                continue;
            }
            let Some(sample) = value::traverse(&event.data, &state.field).and_then(|v| v.as_f64())
            else {
                continue;
            };
            let group = group_key(event, &state.group_by);

            let instance = state
                .instances
                .entry(group.clone())
                .or_insert_with(|| AggregateInstance {
                    events: VecDeque::new(),
                });

            instance.events.push_back((event.clone(), sample));
            let cutoff = event.timestamp - state.window;
            while instance
                .events
                .front()
                .map(|(e, _)| e.timestamp <= cutoff)
                .unwrap_or(false)
            {
                instance.events.pop_front();
            }

            let samples: Vec<f64> = instance.events.iter().map(|(_, v)| *v).collect();
            let Some(aggregate) = state.function.apply(&samples) else {
                continue;
            };

            if state.comparison.holds(aggregate, state.threshold) {
                matches.push(TemporalMatch {
                    pattern_id: pattern_id.clone(),
                    kind: TemporalMatchKind::AggregateMatch,
                    group_key: group,
                    matched_events: instance.events.iter().map(|(e, _)| e.clone()).collect(),
                    window_start: cutoff,
                    window_end: event.timestamp,
                    value: Some(aggregate),
                });
            }
        }

        matches
    }

    /// Prune aged-out samples; aggregate windows never fire on a sweep.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<TemporalMatch> {
        for state in self.patterns.values_mut() {
            let cutoff = now - state.window;
            for instance in state.instances.values_mut() {
                while instance
                    .events
                    .front()
                    .map(|(e, _)| e.timestamp <= cutoff)
                    .unwrap_or(false)
                {
                    instance.events.pop_front();
                }
            }
            state.instances.retain(|_, instance| !instance.events.is_empty());
        }
        Vec::new()
    }

    /// Aggregate windows carry no deadline.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        None
    }

    /// Drop all patterns and instances.
    pub fn reset(&mut self) {
        self.patterns.clear();
    }

    /// Number of registered patterns.
    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }
}

//! Sequence pattern matcher: ordered events within a window.

use super::{group_key, EventSelector, TemporalMatch, TemporalMatchKind, TemporalPattern};
use crate::duration::parse_duration;
use crate::error::{Result, RuleError};
use crate::events::Event;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tracing::debug;

struct SequenceInstance {
    next_index: usize,
    first_timestamp: DateTime<Utc>,
    matched: Vec<Event>,
}

struct SequenceState {
    selectors: Vec<EventSelector>,
    within: Duration,
    group_by: Option<String>,
    // One active instance per group; overlap is not supported.
    instances: HashMap<Option<String>, SequenceInstance>,
}

/// Matches ordered event sequences completing within their window.
pub struct SequenceMatcher {
    patterns: HashMap<String, SequenceState>,
}

impl Default for SequenceMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceMatcher {
    /// Create an empty matcher.
    pub fn new() -> Self {
        Self {
            patterns: HashMap::new(),
        }
    }

    /// Register a sequence pattern.
    pub fn add_pattern(&mut self, pattern_id: String, pattern: &TemporalPattern) -> Result<()> {
        let TemporalPattern::Sequence {
            events,
            within,
            group_by,
        } = pattern
        else {
            return Err(RuleError::internal("not a sequence pattern"));
        };

        self.patterns.insert(
            pattern_id,
            SequenceState {
                selectors: events.clone(),
                within: parse_duration(within)?,
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

    /// Advance instances with an event; returns completed matches.
    pub fn process_event(&mut self, event: &Event) -> Vec<TemporalMatch> {
        enum Step {
            Start,
            Expired,
            Advanced,
            Completed,
            Blocked,
        }

        let mut matches = Vec::new();

        for (pattern_id, state) in self.patterns.iter_mut() {
            let group = group_key(event, &state.group_by);

            let step = match state.instances.get_mut(&group) {
                None => Step::Start,
                Some(instance) => {
                    if event.timestamp > instance.first_timestamp + state.within {
                        Step::Expired
                    } else if state.selectors[instance.next_index].matches(event) {
                        instance.matched.push(event.clone());
                        instance.next_index += 1;
                        if instance.next_index == state.selectors.len() {
                            Step::Completed
                        } else {
                            Step::Advanced
                        }
                    } else {
                        // Not the expected step; the instance stays put.
                        Step::Blocked
                    }
                }
            };

            match step {
                Step::Completed => {
                    let instance = state.instances.remove(&group).expect("instance present");
                    matches.push(complete(pattern_id, group, instance));
                    continue;
                }
                Step::Advanced | Step::Blocked => continue,
                Step::Expired => {
                    debug!("Sequence {} instance expired for group {:?}", pattern_id, group);
                    state.instances.remove(&group);
                }
                Step::Start => {}
            }

            // No instance (or a just-expired one): this event may start one.
            if state.selectors[0].matches(event) {
                let instance = SequenceInstance {
                    next_index: 1,
                    first_timestamp: event.timestamp,
                    matched: vec![event.clone()],
                };

                if state.selectors.len() == 1 {
                    matches.push(complete(pattern_id, group, instance));
                } else {
                    state.instances.insert(group, instance);
                }
            }
        }

        matches
    }

    /// Drop instances whose window passed without completing.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<TemporalMatch> {
        for state in self.patterns.values_mut() {
            let within = state.within;
            state
                .instances
                .retain(|_, instance| now <= instance.first_timestamp + within);
        }
        Vec::new()
    }

    /// Earliest instance expiry.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.patterns
            .values()
            .flat_map(|state| {
                state
                    .instances
                    .values()
                    .map(move |i| i.first_timestamp + state.within)
            })
            .min()
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

fn complete(pattern_id: &str, group: Option<String>, instance: SequenceInstance) -> TemporalMatch {
    let window_start = instance.first_timestamp;
    let window_end = instance
        .matched
        .last()
        .map(|e| e.timestamp)
        .unwrap_or(window_start);
    TemporalMatch {
        pattern_id: pattern_id.to_string(),
        kind: TemporalMatchKind::SequenceMatch,
        group_key: group,
        matched_events: instance.matched,
        window_start,
        window_end,
        value: None,
    }
}

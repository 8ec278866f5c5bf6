//! Absence pattern matcher: an expected event failing to arrive in time.

use super::{group_key, EventSelector, TemporalMatch, TemporalMatchKind, TemporalPattern};
use crate::duration::parse_duration;
use crate::error::{Result, RuleError};
use crate::events::Event;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tracing::debug;

struct AbsenceInstance {
    after_event: Event,
    deadline: DateTime<Utc>,
}

struct AbsenceState {
    after: EventSelector,
    expected: EventSelector,
    within: Duration,
    group_by: Option<String>,
    instances: HashMap<Option<String>, AbsenceInstance>,
}

/// Matches windows in which an expected event never arrived.
pub struct AbsenceMatcher {
    patterns: HashMap<String, AbsenceState>,
}

impl Default for AbsenceMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl AbsenceMatcher {
    /// Create an empty matcher.
    pub fn new() -> Self {
        Self {
            patterns: HashMap::new(),
        }
    }

    /// Register an absence pattern.
    pub fn add_pattern(&mut self, pattern_id: String, pattern: &TemporalPattern) -> Result<()> {
        let TemporalPattern::Absence {
            after,
            expected,
            within,
            group_by,
        } = pattern
        else {
            return Err(RuleError::internal("not an absence pattern"));
        };

        self.patterns.insert(
            pattern_id,
            AbsenceState {
                after: after.clone(),
                expected: expected.clone(),
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

    /// Open or cancel instances with an event.
    ///
    /// An `expected` arriving at or before the deadline cancels the
    /// instance with no match; one arriving later is ignored (the sweep
    /// already produced the match).
    pub fn process_event(&mut self, event: &Event) -> Vec<TemporalMatch> {
        for (pattern_id, state) in self.patterns.iter_mut() {
            let group = group_key(event, &state.group_by);

            if state.expected.matches(event) {
                let in_window = state
                    .instances
                    .get(&group)
                    .map(|instance| event.timestamp <= instance.deadline)
                    .unwrap_or(false);
                if in_window {
                    debug!(
                        "Absence {} cancelled for group {:?}: expected arrived",
                        pattern_id, group
                    );
                    state.instances.remove(&group);
                }
                continue;
            }

            if state.after.matches(event) && !state.instances.contains_key(&group) {
                state.instances.insert(
                    group,
                    AbsenceInstance {
                        after_event: event.clone(),
                        deadline: event.timestamp + state.within,
                    },
                );
            }
        }

        Vec::new()
    }

    /// Emit matches for instances whose deadline passed.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<TemporalMatch> {
        let mut matches = Vec::new();

        for (pattern_id, state) in self.patterns.iter_mut() {
            let expired: Vec<Option<String>> = state
                .instances
                .iter()
                .filter(|(_, instance)| now > instance.deadline)
                .map(|(group, _)| group.clone())
                .collect();

            for group in expired {
                let instance = state.instances.remove(&group).expect("instance present");
                matches.push(TemporalMatch {
                    pattern_id: pattern_id.clone(),
                    kind: TemporalMatchKind::AbsenceMatch,
                    group_key: group,
                    window_start: instance.after_event.timestamp,
                    window_end: instance.deadline,
                    matched_events: vec![instance.after_event],
                    value: None,
                });
            }
        }

        matches
    }

    /// Earliest instance deadline.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.patterns
            .values()
            .flat_map(|state| state.instances.values().map(|i| i.deadline))
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pattern() -> TemporalPattern {
        serde_json::from_value(json!({
            "type": "absence",
            "after": {"topic": "order.created"},
            "expected": {"topic": "payment.received"},
            "within": "10m",
            "group_by": "orderId"
        }))
        .unwrap()
    }

    fn at(base: DateTime<Utc>, secs: i64, topic: &str, order_id: &str) -> Event {
        Event::new(topic, json!({"orderId": order_id}))
            .with_timestamp(base + Duration::seconds(secs))
    }

    #[test]
    fn test_absence_fires_after_window() {
        let mut matcher = AbsenceMatcher::new();
        matcher.add_pattern("p".into(), &pattern()).unwrap();
        let base = Utc::now();

        matcher.process_event(&at(base, 0, "order.created", "o1"));

        // At the deadline, nothing fires yet.
        assert!(matcher.sweep(base + Duration::minutes(10)).is_empty());

        // One second past the deadline, the absence match is produced.
        let matches = matcher.sweep(base + Duration::minutes(10) + Duration::seconds(1));
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].kind, TemporalMatchKind::AbsenceMatch);
        assert_eq!(matches[0].group_key.as_deref(), Some("o1"));
        assert_eq!(matches[0].matched_events[0].topic, "order.created");
    }

    #[test]
    fn test_expected_in_window_cancels() {
        let mut matcher = AbsenceMatcher::new();
        matcher.add_pattern("p".into(), &pattern()).unwrap();
        let base = Utc::now();

        matcher.process_event(&at(base, 0, "order.created", "o1"));
        matcher.process_event(&at(base, 300, "payment.received", "o1"));

        assert!(matcher.sweep(base + Duration::minutes(11)).is_empty());
    }

    #[test]
    fn test_expected_exactly_at_deadline_cancels() {
        let mut matcher = AbsenceMatcher::new();
        matcher.add_pattern("p".into(), &pattern()).unwrap();
        let base = Utc::now();

        matcher.process_event(&at(base, 0, "order.created", "o1"));
        matcher.process_event(&at(base, 600, "payment.received", "o1"));

        assert!(matcher.sweep(base + Duration::minutes(11)).is_empty());
    }

    #[test]
    fn test_groups_are_independent() {
        let mut matcher = AbsenceMatcher::new();
        matcher.add_pattern("p".into(), &pattern()).unwrap();
        let base = Utc::now();

        matcher.process_event(&at(base, 0, "order.created", "o1"));
        matcher.process_event(&at(base, 0, "order.created", "o2"));
        matcher.process_event(&at(base, 60, "payment.received", "o2"));

        let matches = matcher.sweep(base + Duration::minutes(11));
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].group_key.as_deref(), Some("o1"));
    }

    #[test]
    fn test_expected_for_other_group_does_not_cancel() {
        let mut matcher = AbsenceMatcher::new();
        matcher.add_pattern("p".into(), &pattern()).unwrap();
        let base = Utc::now();

        matcher.process_event(&at(base, 0, "order.created", "o1"));
        matcher.process_event(&at(base, 60, "payment.received", "o2"));

        let matches = matcher.sweep(base + Duration::minutes(11));
        assert_eq!(matches.len(), 1);
    }
}

//! Count pattern matcher with sliding and tumbling windows.

use super::{group_key, Comparison, EventSelector, TemporalMatch, TemporalMatchKind, TemporalPattern};
use crate::duration::parse_duration;
use crate::error::{Result, RuleError};
use crate::events::Event;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::{HashMap, VecDeque};

enum CountInstance {
    /// Events inside `(now - window, now]`, pruned on every arrival.
    Sliding { events: VecDeque<Event> },

    /// Events inside the aligned window `[start, start + window)`.
    Tumbling {
        window_start: DateTime<Utc>,
        events: Vec<Event>,
    },
}

struct CountState {
    selector: EventSelector,
    threshold: u64,
    comparison: Comparison,
    window: Duration,
    group_by: Option<String>,
    sliding: bool,
    instances: HashMap<Option<String>, CountInstance>,
}

/// Floor a timestamp to its aligned tumbling window start.
fn align(timestamp: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    let window_ms = window.num_milliseconds().max(1);
    let aligned = (timestamp.timestamp_millis() / window_ms) * window_ms;
    Utc.timestamp_millis_opt(aligned).single().unwrap_or(timestamp)
}

/// Matches event counts crossing a threshold within a window.
pub struct CountMatcher {
    patterns: HashMap<String, CountState>,
}

impl Default for CountMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl CountMatcher {
    /// Create an empty matcher.
    pub fn new() -> Self {
        Self {
            patterns: HashMap::new(),
        }
    }

    /// Register a count pattern.
    pub fn add_pattern(&mut self, pattern_id: String, pattern: &TemporalPattern) -> Result<()> {
        let TemporalPattern::Count {
            event,
            threshold,
            comparison,
            window,
            group_by,
            sliding,
        } = pattern
        else {
            return Err(RuleError::internal("not a count pattern"));
        };

        self.patterns.insert(
            pattern_id,
            CountState {
                selector: event.clone(),
                threshold: *threshold,
                comparison: *comparison,
                window: parse_duration(window)?,
                group_by: group_by.clone(),
                sliding: *sliding,
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
    pub fn process_event(&mut self, event: &Event) -> Vec<TemporalMatch> {
        let mut matches = Vec::new();

        for (pattern_id, state) in self.patterns.iter_mut() {
            if !state.selector.matches(event) {
                continue;
            }
            let group = group_key(event, &state.group_by);

            if state.sliding {
                let instance = state
                    .instances
                    .entry(group.clone())
                    .or_insert_with(|| CountInstance::Sliding {
                        events: VecDeque::new(),
                    });
                let CountInstance::Sliding { events } = instance else {
                    continue;
                };

                events.push_back(event.clone());
                let cutoff = event.timestamp - state.window;
                while events.front().map(|e| e.timestamp <= cutoff).unwrap_or(false) {
                    events.pop_front();
                }

                let count = events.len() as f64;
                if state.comparison.holds(count, state.threshold as f64) {
                    matches.push(TemporalMatch {
                        pattern_id: pattern_id.clone(),
                        kind: TemporalMatchKind::CountMatch,
                        group_key: group,
                        matched_events: events.iter().cloned().collect(),
                        window_start: cutoff,
                        window_end: event.timestamp,
                        value: Some(count),
                    });
                }
            } else {
                let window_start = align(event.timestamp, state.window);

                let appended = match state.instances.get_mut(&group) {
                    Some(CountInstance::Tumbling {
                        window_start: current_start,
                        events,
                    }) if *current_start == window_start => {
                        events.push(event.clone());
                        true
                    }
                    _ => false,
                };

                if !appended {
                    // The event opens a new window; close any old one first.
                    if let Some(closed) = state.instances.remove(&group) {
                        if let Some(m) = close_tumbling(pattern_id, &group, closed, state) {
                            matches.push(m);
                        }
                    }
                    state.instances.insert(
                        group,
                        CountInstance::Tumbling {
                            window_start,
                            events: vec![event.clone()],
                        },
                    );
                }
            }
        }

        matches
    }

    /// Close tumbling windows whose end has been reached.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<TemporalMatch> {
        let mut matches = Vec::new();

        for (pattern_id, state) in self.patterns.iter_mut() {
            if state.sliding {
                continue;
            }

            let closed_groups: Vec<Option<String>> = state
                .instances
                .iter()
                .filter(|(_, instance)| match instance {
                    CountInstance::Tumbling { window_start, .. } => {
                        now >= *window_start + state.window
                    }
                    CountInstance::Sliding { .. } => false,
                })
                .map(|(group, _)| group.clone())
                .collect();

            for group in closed_groups {
                let closed = state.instances.remove(&group).expect("instance present");
                if let Some(m) = close_tumbling(pattern_id, &group, closed, state) {
                    matches.push(m);
                }
            }
        }

        matches
    }

    /// Earliest tumbling window end.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.patterns
            .values()
            .filter(|state| !state.sliding)
            .flat_map(|state| {
                state.instances.values().filter_map(move |instance| match instance {
                    CountInstance::Tumbling { window_start, .. } => {
                        Some(*window_start + state.window)
                    }
                    CountInstance::Sliding { .. } => None,
                })
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

fn close_tumbling(
    pattern_id: &str,
    group: &Option<String>,
    instance: CountInstance,
    state: &CountState,
) -> Option<TemporalMatch> {
    let CountInstance::Tumbling {
        window_start,
        events,
    } = instance
    else {
        return None;
    };

    let count = events.len() as f64;
    if !state.comparison.holds(count, state.threshold as f64) {
        return None;
    }

    Some(TemporalMatch {
        pattern_id: pattern_id.to_string(),
        kind: TemporalMatchKind::CountMatch,
        group_key: group.clone(),
        matched_events: events,
        window_start,
        window_end: window_start + state.window,
        value: Some(count),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sliding_pattern() -> TemporalPattern {
        serde_json::from_value(json!({
            "type": "count",
            "event": {"topic": "login.failed"},
            "threshold": 3,
            "comparison": "gte",
            "window": "5m",
            "group_by": "userId",
            "sliding": true
        }))
        .unwrap()
    }

    fn tumbling_pattern() -> TemporalPattern {
        serde_json::from_value(json!({
            "type": "count",
            "event": {"topic": "login.failed"},
            "threshold": 2,
            "comparison": "gte",
            "window": "1m",
            "group_by": "userId",
            "sliding": false
        }))
        .unwrap()
    }

    fn login_at(base: DateTime<Utc>, secs: i64, user: &str) -> Event {
        Event::new("login.failed", json!({"userId": user}))
            .with_timestamp(base + Duration::seconds(secs))
    }

    fn minute_aligned_base() -> DateTime<Utc> {
        align(Utc::now(), Duration::minutes(1))
    }

    #[test]
    fn test_sliding_matches_from_threshold_onward() {
        let mut matcher = CountMatcher::new();
        matcher.add_pattern("p".into(), &sliding_pattern()).unwrap();
        let base = Utc::now();

        assert!(matcher.process_event(&login_at(base, 0, "u1")).is_empty());
        assert!(matcher.process_event(&login_at(base, 10, "u1")).is_empty());

        let third = matcher.process_event(&login_at(base, 20, "u1"));
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].value, Some(3.0));

        // The instance stays active; the fourth event matches again.
        let fourth = matcher.process_event(&login_at(base, 30, "u1"));
        assert_eq!(fourth.len(), 1);
        assert_eq!(fourth[0].value, Some(4.0));
    }

    #[test]
    fn test_sliding_prunes_old_events() {
        let mut matcher = CountMatcher::new();
        matcher.add_pattern("p".into(), &sliding_pattern()).unwrap();
        let base = Utc::now();

        for i in 0..4 {
            matcher.process_event(&login_at(base, i * 10, "u1"));
        }

        // Six minutes later, everything has aged out; count restarts at 1.
        assert!(matcher.process_event(&login_at(base, 360, "u1")).is_empty());
        assert!(matcher.process_event(&login_at(base, 370, "u1")).is_empty());
        let matches = matcher.process_event(&login_at(base, 380, "u1"));
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].value, Some(3.0));
    }

    #[test]
    fn test_sliding_boundary_event_is_excluded() {
        let mut matcher = CountMatcher::new();
        matcher.add_pattern("p".into(), &sliding_pattern()).unwrap();
        let base = Utc::now();

        matcher.process_event(&login_at(base, 0, "u1"));
        matcher.process_event(&login_at(base, 10, "u1"));

        // The first event sits exactly at now - window and is not counted,
        // leaving the count at 2.
        let matches = matcher.process_event(&login_at(base, 300, "u1"));
        assert!(matches.is_empty());
    }

    #[test]
    fn test_sliding_groups_are_independent() {
        let mut matcher = CountMatcher::new();
        matcher.add_pattern("p".into(), &sliding_pattern()).unwrap();
        let base = Utc::now();

        matcher.process_event(&login_at(base, 0, "u1"));
        matcher.process_event(&login_at(base, 1, "u2"));
        matcher.process_event(&login_at(base, 2, "u1"));
        matcher.process_event(&login_at(base, 3, "u2"));
        let matches = matcher.process_event(&login_at(base, 4, "u1"));

        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].group_key.as_deref(), Some("u1"));
    }

    #[test]
    fn test_tumbling_evaluates_at_window_end() {
        let mut matcher = CountMatcher::new();
        matcher.add_pattern("p".into(), &tumbling_pattern()).unwrap();
        let base = minute_aligned_base();

        assert!(matcher.process_event(&login_at(base, 1, "u1")).is_empty());
        assert!(matcher.process_event(&login_at(base, 2, "u1")).is_empty());
        assert!(matcher.process_event(&login_at(base, 3, "u1")).is_empty());

        let matches = matcher.sweep(base + Duration::seconds(60));
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].value, Some(3.0));
        assert_eq!(matches[0].window_start, base);
    }

    #[test]
    fn test_tumbling_event_at_boundary_opens_next_window() {
        let mut matcher = CountMatcher::new();
        matcher.add_pattern("p".into(), &tumbling_pattern()).unwrap();
        let base = minute_aligned_base();

        matcher.process_event(&login_at(base, 1, "u1"));
        matcher.process_event(&login_at(base, 2, "u1"));

        // An event exactly at the window end belongs to the next window
        // and closes the previous one.
        let matches = matcher.process_event(&login_at(base, 60, "u1"));
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].value, Some(2.0));

        // The boundary event counts toward the new window only.
        let matches = matcher.sweep(base + Duration::seconds(120));
        assert!(matches.is_empty());
    }

    #[test]
    fn test_tumbling_below_threshold_produces_no_match() {
        let mut matcher = CountMatcher::new();
        matcher.add_pattern("p".into(), &tumbling_pattern()).unwrap();
        let base = minute_aligned_base();

        matcher.process_event(&login_at(base, 1, "u1"));
        assert!(matcher.sweep(base + Duration::seconds(61)).is_empty());
    }
}

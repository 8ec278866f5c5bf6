//! History queries: events, their causes and effects, and correlation
//! timelines.

use crate::error::{Result, RuleError};
use crate::events::{Event, EventStore};
use crate::ids::{CorrelationId, EventId, RuleId};
use crate::pattern;
use crate::trace::{TraceCollector, TraceEntry, TraceType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Filter for event queries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    /// Topic wildcard pattern.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_pattern: Option<String>,

    /// Correlation id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,

    /// Inclusive lower timestamp bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,

    /// Inclusive upper timestamp bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,

    /// Maximum number of events, newest kept.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

/// Summary of a rule's reaction to an event.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RuleSummary {
    /// The rule.
    pub rule_id: RuleId,

    /// Its name.
    pub rule_name: String,

    /// Whether it executed (false = skipped).
    pub executed: bool,
}

/// An event with its related traces, rules, and direct effects.
#[derive(Debug, Clone, Serialize)]
pub struct EventDetail {
    /// The event.
    pub event: Event,

    /// Trace entries caused by the event.
    pub traces: Vec<TraceEntry>,

    /// Rules the event triggered.
    pub triggered_rules: Vec<RuleSummary>,

    /// Events directly caused by this event.
    pub caused_events: Vec<Event>,
}

/// One item on a correlation timeline.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TimelineItem {
    /// An event at its causation depth.
    Event { depth: usize, event: Event },

    /// A trace entry at the depth of its causing event.
    Trace { depth: usize, entry: TraceEntry },
}

impl TimelineItem {
    fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Event { event, .. } => event.timestamp,
            Self::Trace { entry, .. } => entry.timestamp,
        }
    }
}

/// Events and traces of one correlation, merged by timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct Timeline {
    /// The correlation.
    pub correlation_id: CorrelationId,

    /// Items ordered by timestamp.
    pub items: Vec<TimelineItem>,
}

/// Combines the event store and trace collector into history views.
pub struct HistoryService {
    events: Arc<EventStore>,
    traces: Arc<TraceCollector>,
}

impl HistoryService {
    /// Create a service over the engine's stores.
    pub fn new(events: Arc<EventStore>, traces: Arc<TraceCollector>) -> Self {
        Self { events, traces }
    }

    /// Query events with filtering, oldest first.
    pub fn query_events(&self, filter: &EventFilter) -> Vec<Event> {
        let mut events = match filter.correlation_id {
            Some(correlation_id) => self.events.get_by_correlation(correlation_id),
            None => self.events.get_all(),
        };

        if let Some(topic_pattern) = &filter.topic_pattern {
            events.retain(|e| pattern::matches_topic(&e.topic, topic_pattern));
        }
        if let Some(start) = filter.start {
            events.retain(|e| e.timestamp >= start);
        }
        if let Some(end) = filter.end {
            events.retain(|e| e.timestamp <= end);
        }
        if let Some(limit) = filter.limit {
            let skip = events.len().saturating_sub(limit);
            events.drain(..skip);
        }
        events
    }

    /// An event with its related traces, rule reactions, and direct
    /// effects.
    pub fn event_detail(&self, event_id: EventId) -> Result<EventDetail> {
        let event = self
            .events
            .get(event_id)
            .ok_or_else(|| RuleError::not_found(format!("event {event_id}")))?;

        let related: Vec<TraceEntry> = match event.correlation_id {
            Some(correlation_id) => self
                .traces
                .get_by_correlation(correlation_id)
                .into_iter()
                .filter(|t| t.causation_id == Some(event_id))
                .collect(),
            None => Vec::new(),
        };

        let mut triggered_rules = Vec::new();
        for entry in &related {
            let (Some(rule_id), Some(rule_name)) = (&entry.rule_id, &entry.rule_name) else {
                continue;
            };
            match entry.trace_type {
                TraceType::RuleExecuted => triggered_rules.push(RuleSummary {
                    rule_id: rule_id.clone(),
                    rule_name: rule_name.clone(),
                    executed: true,
                }),
                TraceType::RuleSkipped => triggered_rules.push(RuleSummary {
                    rule_id: rule_id.clone(),
                    rule_name: rule_name.clone(),
                    executed: false,
                }),
                _ => {}
            }
        }

        let caused_events = match event.correlation_id {
            Some(correlation_id) => self
                .events
                .get_by_correlation(correlation_id)
                .into_iter()
                .filter(|e| e.causation_id == Some(event_id))
                .collect(),
            None => Vec::new(),
        };

        Ok(EventDetail {
            event,
            traces: related,
            triggered_rules,
            caused_events,
        })
    }

    /// Events and traces of a correlation merged by timestamp, each with a
    /// depth derived from the causation chain (root = 0).
    pub fn correlation_timeline(&self, correlation_id: CorrelationId) -> Timeline {
        let events = self.events.get_by_correlation(correlation_id);
        let traces = self.traces.get_by_correlation(correlation_id);

        let by_id: HashMap<EventId, &Event> = events.iter().map(|e| (e.id, e)).collect();
        let mut depths: HashMap<EventId, usize> = HashMap::new();
        for event in &events {
            compute_depth(event.id, &by_id, &mut depths);
        }

        let mut items: Vec<TimelineItem> = Vec::with_capacity(events.len() + traces.len());
        for event in &events {
            items.push(TimelineItem::Event {
                depth: depths.get(&event.id).copied().unwrap_or(0),
                event: event.clone(),
            });
        }
        for entry in traces {
            // A trace sits at the depth of the event that caused it;
            // unreachable causes stay at the root.
            let depth = entry
                .causation_id
                .and_then(|id| depths.get(&id).copied())
                .unwrap_or(0);
            items.push(TimelineItem::Trace { depth, entry });
        }

        items.sort_by_key(|item| item.timestamp());
        Timeline {
            correlation_id,
            items,
        }
    }

    /// Export a timeline as JSON.
    pub fn export_timeline_json(&self, timeline: &Timeline) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(timeline)?)
    }

    /// Export a timeline as a Mermaid sequence diagram.
    ///
    /// Participants are the event sources, topics, and executing rules;
    /// interactions are emissions and rule executions.
    pub fn export_timeline_mermaid(&self, timeline: &Timeline) -> String {
        let mut participants: Vec<(String, String)> = Vec::new();
        let mut lines: Vec<String> = Vec::new();

        let declare = |participants: &mut Vec<(String, String)>, label: &str| -> String {
            let id = sanitize(label);
            if !participants.iter().any(|(existing, _)| existing == &id) {
                participants.push((id.clone(), label.to_string()));
            }
            id
        };

        for item in &timeline.items {
            match item {
                TimelineItem::Event { event, .. } => {
                    let source_label = event.source.as_deref().unwrap_or("external");
                    let source = declare(&mut participants, source_label);
                    let topic = declare(&mut participants, &event.topic);
                    lines.push(format!("    {source}->>{topic}: emit"));
                }
                TimelineItem::Trace { entry, .. } => {
                    if entry.trace_type != TraceType::RuleExecuted {
                        continue;
                    }
                    let (Some(rule_name), Some(causation_id)) =
                        (&entry.rule_name, entry.causation_id)
                    else {
                        continue;
                    };
                    let topic_label = timeline
                        .items
                        .iter()
                        .find_map(|other| match other {
                            TimelineItem::Event { event, .. } if event.id == causation_id => {
                                Some(event.topic.clone())
                            }
                            _ => None,
                        })
                        .unwrap_or_else(|| "unknown".to_string());
                    let topic = declare(&mut participants, &topic_label);
                    let rule = declare(&mut participants, rule_name);
                    lines.push(format!("    {topic}->>{rule}: rule executed"));
                }
            }
        }

        let mut out = String::from("sequenceDiagram\n");
        for (id, label) in &participants {
            out.push_str(&format!("    participant {id} as {label}\n"));
        }
        for line in &lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}

fn compute_depth(
    id: EventId,
    by_id: &HashMap<EventId, &Event>,
    depths: &mut HashMap<EventId, usize>,
) -> usize {
    if let Some(depth) = depths.get(&id) {
        return *depth;
    }

    // Mark before recursing so a causation loop terminates at 0.
    depths.insert(id, 0);
    let depth = match by_id.get(&id).and_then(|e| e.causation_id) {
        Some(parent) if by_id.contains_key(&parent) => {
            compute_depth(parent, by_id, depths) + 1
        }
        _ => 0,
    };
    depths.insert(id, depth);
    depth
}

fn sanitize(label: &str) -> String {
    let mut out: String = label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if out.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(true) {
        out.insert(0, 'p');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Fixture {
        history: HistoryService,
        correlation: CorrelationId,
        root_id: EventId,
        child_id: EventId,
    }

    fn fixture() -> Fixture {
        let events = Arc::new(EventStore::new(100));
        let traces = Arc::new(TraceCollector::new(100, true));
        let correlation = CorrelationId::new();

        let root = Event::new("order.placed", json!({"id": 1}))
            .with_source("api")
            .with_correlation(correlation);
        let root_id = root.id;
        events.append(root).unwrap();

        let child = Event::new("loyalty.awarded", json!({"points": 500}))
            .with_source("rule:earn-points")
            .with_correlation(correlation)
            .with_causation(root_id);
        let child_id = child.id;
        events.append(child.clone()).unwrap();

        let grandchild = Event::new("notify.sent", json!({}))
            .with_correlation(correlation)
            .with_causation(child_id)
            .with_timestamp(child.timestamp + chrono::Duration::milliseconds(5));
        events.append(grandchild).unwrap();

        traces.record(
            crate::trace::TraceEntry::new(TraceType::RuleExecuted, json!({}))
                .with_correlation(Some(correlation))
                .with_causation(Some(root_id))
                .with_rule(RuleId::new("earn-points"), "Earn points"),
        );

        Fixture {
            history: HistoryService::new(events, traces),
            correlation,
            root_id,
            child_id,
        }
    }

    #[test]
    fn test_query_events_with_filters() {
        let f = fixture();

        let all = f.history.query_events(&EventFilter::default());
        assert_eq!(all.len(), 3);

        let by_pattern = f.history.query_events(&EventFilter {
            topic_pattern: Some("order.*".into()),
            ..Default::default()
        });
        assert_eq!(by_pattern.len(), 1);

        let limited = f.history.query_events(&EventFilter {
            limit: Some(2),
            ..Default::default()
        });
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[1].topic, "notify.sent");
    }

    #[test]
    fn test_event_detail() {
        let f = fixture();
        let detail = f.history.event_detail(f.root_id).unwrap();

        assert_eq!(detail.event.id, f.root_id);
        assert_eq!(detail.caused_events.len(), 1);
        assert_eq!(detail.caused_events[0].id, f.child_id);
        assert_eq!(detail.triggered_rules.len(), 1);
        assert!(detail.triggered_rules[0].executed);

        assert!(f.history.event_detail(EventId::new()).is_err());
    }

    #[test]
    fn test_timeline_depths() {
        let f = fixture();
        let timeline = f.history.correlation_timeline(f.correlation);

        let depths: Vec<usize> = timeline
            .items
            .iter()
            .filter_map(|item| match item {
                TimelineItem::Event { depth, .. } => Some(*depth),
                TimelineItem::Trace { .. } => None,
            })
            .collect();
        assert_eq!(depths, vec![0, 1, 2]);

        let trace_depths: Vec<usize> = timeline
            .items
            .iter()
            .filter_map(|item| match item {
                TimelineItem::Trace { depth, .. } => Some(*depth),
                TimelineItem::Event { .. } => None,
            })
            .collect();
        assert_eq!(trace_depths, vec![0]);
    }

    #[test]
    fn test_mermaid_export() {
        let f = fixture();
        let timeline = f.history.correlation_timeline(f.correlation);
        let diagram = f.history.export_timeline_mermaid(&timeline);

        assert!(diagram.starts_with("sequenceDiagram"));
        assert!(diagram.contains("participant api as api"));
        assert!(diagram.contains("order_placed"));
        assert!(diagram.contains("rule executed"));
    }
}

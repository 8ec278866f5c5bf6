//! Per-rule performance and outcome profiling.
//!
//! The profiler subscribes to the trace collector and folds entries into
//! per-rule aggregates: trigger/execute/skip counts, duration statistics,
//! and condition- and action-level sub-profiles.

use crate::ids::RuleId;
use crate::trace::{TraceCollector, TraceEntry, TraceSubscriptionId, TraceType};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
struct ConditionStats {
    evaluations: u64,
    passes: u64,
    total_duration_ms: f64,
}

#[derive(Debug, Clone, Default)]
struct ActionStats {
    executions: u64,
    failures: u64,
    total_duration_ms: f64,
}

#[derive(Debug, Clone, Default)]
struct RuleStats {
    rule_name: String,
    triggered: u64,
    executed: u64,
    skipped: u64,
    action_failures: u64,
    total_duration_ms: f64,
    min_duration_ms: Option<f64>,
    max_duration_ms: Option<f64>,
    conditions: HashMap<usize, ConditionStats>,
    actions: HashMap<(usize, String), ActionStats>,
}

/// Condition-level profile in a report.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ConditionProfile {
    /// Position in the rule's condition list.
    pub index: usize,

    /// Evaluation count.
    pub evaluations: u64,

    /// Pass count.
    pub passes: u64,

    /// Failure count.
    pub failures: u64,

    /// Share of evaluations that passed.
    pub pass_rate: f64,

    /// Mean evaluation time.
    pub avg_duration_ms: f64,
}

/// Action-level profile in a report.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ActionProfile {
    /// Position in the rule's action list.
    pub index: usize,

    /// Action kind.
    pub action_type: String,

    /// Execution count, including failures.
    pub executions: u64,

    /// Failure count.
    pub failures: u64,

    /// Mean execution time.
    pub avg_duration_ms: f64,
}

/// Per-rule profile report.
#[derive(Debug, Clone, Serialize)]
pub struct RuleProfile {
    /// The rule.
    pub rule_id: RuleId,

    /// Its name at last observation.
    pub rule_name: String,

    /// Times the rule was triggered.
    pub triggered: u64,

    /// Times the rule executed its actions.
    pub executed: u64,

    /// Times the rule was skipped.
    pub skipped: u64,

    /// Failed actions across all executions.
    pub action_failures: u64,

    /// Total execution time.
    pub total_duration_ms: f64,

    /// Fastest execution.
    pub min_duration_ms: Option<f64>,

    /// Slowest execution.
    pub max_duration_ms: Option<f64>,

    /// Mean execution time.
    pub avg_duration_ms: f64,

    /// Aggregate condition pass rate.
    pub condition_pass_rate: f64,

    /// Condition sub-profiles, by position.
    pub conditions: Vec<ConditionProfile>,

    /// Action sub-profiles, by position.
    pub actions: Vec<ActionProfile>,
}

/// Engine-wide profile summary.
#[derive(Debug, Clone, Serialize)]
pub struct ProfileSummary {
    /// Rules with any observations.
    pub rules_profiled: usize,

    /// Total triggers across rules.
    pub total_triggered: u64,

    /// Total executions across rules.
    pub total_executed: u64,

    /// Total skips across rules.
    pub total_skipped: u64,

    /// Total action failures across rules.
    pub total_action_failures: u64,

    /// Mean execution time across all executions.
    pub avg_duration_ms: f64,
}

/// Aggregates trace entries into per-rule profiles.
pub struct RuleProfiler {
    stats: RwLock<HashMap<RuleId, RuleStats>>,
}

impl Default for RuleProfiler {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleProfiler {
    /// Create an empty profiler.
    pub fn new() -> Self {
        Self {
            stats: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribe the profiler to a trace collector.
    pub fn attach(self: &Arc<Self>, traces: &TraceCollector) -> TraceSubscriptionId {
        let profiler = Arc::clone(self);
        traces.subscribe(move |entry| profiler.observe(entry))
    }

    /// Fold one trace entry into the aggregates.
    pub fn observe(&self, entry: &TraceEntry) {
        let Some(rule_id) = entry.rule_id.clone() else {
            return;
        };

        let mut stats = self.stats.write();
        let rule = stats.entry(rule_id).or_default();
        if let Some(name) = &entry.rule_name {
            rule.rule_name = name.clone();
        }

        match entry.trace_type {
            TraceType::RuleTriggered => rule.triggered += 1,
            TraceType::RuleSkipped => rule.skipped += 1,
            TraceType::RuleExecuted => {
                rule.executed += 1;
                if let Some(duration) = entry.duration_ms {
                    rule.total_duration_ms += duration;
                    rule.min_duration_ms = Some(
                        rule.min_duration_ms.map_or(duration, |m| m.min(duration)),
                    );
                    rule.max_duration_ms = Some(
                        rule.max_duration_ms.map_or(duration, |m| m.max(duration)),
                    );
                }
            }
            TraceType::ConditionEvaluated => {
                let index = entry.details["index"].as_u64().unwrap_or(0) as usize;
                let passed = entry.details["passed"].as_bool().unwrap_or(false);
                let condition = rule.conditions.entry(index).or_default();
                condition.evaluations += 1;
                if passed {
                    condition.passes += 1;
                }
                condition.total_duration_ms += entry.duration_ms.unwrap_or(0.0);
            }
            TraceType::ActionCompleted | TraceType::ActionFailed => {
                let index = entry.details["index"].as_u64().unwrap_or(0) as usize;
                let action_type = entry.details["action_type"]
                    .as_str()
                    .unwrap_or("unknown")
                    .to_string();
                let action = rule.actions.entry((index, action_type)).or_default();
                action.executions += 1;
                action.total_duration_ms += entry.duration_ms.unwrap_or(0.0);
                if entry.trace_type == TraceType::ActionFailed {
                    action.failures += 1;
                    rule.action_failures += 1;
                }
            }
            _ => {}
        }
    }

    /// Profile for one rule.
    pub fn get_profile(&self, rule_id: &RuleId) -> Option<RuleProfile> {
        let stats = self.stats.read();
        stats.get(rule_id).map(|s| build_profile(rule_id, s))
    }

    /// Profiles for every observed rule.
    pub fn get_all_profiles(&self) -> Vec<RuleProfile> {
        let stats = self.stats.read();
        stats.iter().map(|(id, s)| build_profile(id, s)).collect()
    }

    /// The `limit` slowest rules by mean execution time.
    pub fn slowest_rules(&self, limit: usize) -> Vec<RuleProfile> {
        let mut profiles = self.get_all_profiles();
        profiles.retain(|p| p.executed > 0);
        profiles.sort_by(|a, b| {
            b.avg_duration_ms
                .partial_cmp(&a.avg_duration_ms)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        profiles.truncate(limit);
        profiles
    }

    /// The `limit` most-triggered rules.
    pub fn hottest_rules(&self, limit: usize) -> Vec<RuleProfile> {
        let mut profiles = self.get_all_profiles();
        profiles.sort_by(|a, b| b.triggered.cmp(&a.triggered));
        profiles.truncate(limit);
        profiles
    }

    /// The `limit` rules whose conditions pass least often.
    pub fn lowest_pass_rate(&self, limit: usize) -> Vec<RuleProfile> {
        let mut profiles = self.get_all_profiles();
        profiles.retain(|p| p.conditions.iter().any(|c| c.evaluations > 0));
        profiles.sort_by(|a, b| {
            a.condition_pass_rate
                .partial_cmp(&b.condition_pass_rate)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        profiles.truncate(limit);
        profiles
    }

    /// Engine-wide summary.
    pub fn summary(&self) -> ProfileSummary {
        let stats = self.stats.read();
        let total_executed: u64 = stats.values().map(|s| s.executed).sum();
        let total_duration: f64 = stats.values().map(|s| s.total_duration_ms).sum();

        ProfileSummary {
            rules_profiled: stats.len(),
            total_triggered: stats.values().map(|s| s.triggered).sum(),
            total_executed,
            total_skipped: stats.values().map(|s| s.skipped).sum(),
            total_action_failures: stats.values().map(|s| s.action_failures).sum(),
            avg_duration_ms: if total_executed > 0 {
                total_duration / total_executed as f64
            } else {
                0.0
            },
        }
    }

    /// Drop all aggregates.
    pub fn reset(&self) {
        self.stats.write().clear();
    }
}

fn build_profile(rule_id: &RuleId, stats: &RuleStats) -> RuleProfile {
    let mut conditions: Vec<ConditionProfile> = stats
        .conditions
        .iter()
        .map(|(index, c)| ConditionProfile {
            index: *index,
            evaluations: c.evaluations,
            passes: c.passes,
            failures: c.evaluations - c.passes,
            pass_rate: if c.evaluations > 0 {
                c.passes as f64 / c.evaluations as f64
            } else {
                0.0
            },
            avg_duration_ms: if c.evaluations > 0 {
                c.total_duration_ms / c.evaluations as f64
            } else {
                0.0
            },
        })
        .collect();
    conditions.sort_by_key(|c| c.index);

    let mut actions: Vec<ActionProfile> = stats
        .actions
        .iter()
        .map(|((index, action_type), a)| ActionProfile {
            index: *index,
            action_type: action_type.clone(),
            executions: a.executions,
            failures: a.failures,
            avg_duration_ms: if a.executions > 0 {
                a.total_duration_ms / a.executions as f64
            } else {
                0.0
            },
        })
        .collect();
    actions.sort_by_key(|a| a.index);

    let total_evaluations: u64 = stats.conditions.values().map(|c| c.evaluations).sum();
    let total_passes: u64 = stats.conditions.values().map(|c| c.passes).sum();

    RuleProfile {
        rule_id: rule_id.clone(),
        rule_name: stats.rule_name.clone(),
        triggered: stats.triggered,
        executed: stats.executed,
        skipped: stats.skipped,
        action_failures: stats.action_failures,
        total_duration_ms: stats.total_duration_ms,
        min_duration_ms: stats.min_duration_ms,
        max_duration_ms: stats.max_duration_ms,
        avg_duration_ms: if stats.executed > 0 {
            stats.total_duration_ms / stats.executed as f64
        } else {
            0.0
        },
        condition_pass_rate: if total_evaluations > 0 {
            total_passes as f64 / total_evaluations as f64
        } else {
            0.0
        },
        conditions,
        actions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(trace_type: TraceType, rule: &str, details: serde_json::Value) -> TraceEntry {
        TraceEntry::new(trace_type, details).with_rule(RuleId::new(rule), format!("Rule {rule}"))
    }

    #[test]
    fn test_rule_counters_and_durations() {
        let profiler = RuleProfiler::new();

        profiler.observe(&entry(TraceType::RuleTriggered, "r1", json!({})));
        profiler.observe(&entry(TraceType::RuleExecuted, "r1", json!({})).with_duration_ms(4.0));
        profiler.observe(&entry(TraceType::RuleTriggered, "r1", json!({})));
        profiler.observe(&entry(TraceType::RuleExecuted, "r1", json!({})).with_duration_ms(8.0));
        profiler.observe(&entry(TraceType::RuleTriggered, "r1", json!({})));
        profiler.observe(&entry(TraceType::RuleSkipped, "r1", json!({})));

        let profile = profiler.get_profile(&RuleId::new("r1")).unwrap();
        assert_eq!(profile.triggered, 3);
        assert_eq!(profile.executed, 2);
        assert_eq!(profile.skipped, 1);
        assert_eq!(profile.min_duration_ms, Some(4.0));
        assert_eq!(profile.max_duration_ms, Some(8.0));
        assert_eq!(profile.avg_duration_ms, 6.0);
    }

    #[test]
    fn test_condition_and_action_sub_profiles() {
        let profiler = RuleProfiler::new();

        profiler.observe(
            &entry(
                TraceType::ConditionEvaluated,
                "r1",
                json!({"index": 0, "passed": true}),
            )
            .with_duration_ms(1.0),
        );
        profiler.observe(
            &entry(
                TraceType::ConditionEvaluated,
                "r1",
                json!({"index": 0, "passed": false}),
            )
            .with_duration_ms(3.0),
        );
        profiler.observe(
            &entry(
                TraceType::ActionCompleted,
                "r1",
                json!({"index": 0, "action_type": "set_fact"}),
            )
            .with_duration_ms(2.0),
        );
        profiler.observe(
            &entry(
                TraceType::ActionFailed,
                "r1",
                json!({"index": 1, "action_type": "call_service"}),
            )
            .with_duration_ms(5.0),
        );

        let profile = profiler.get_profile(&RuleId::new("r1")).unwrap();
        assert_eq!(profile.conditions.len(), 1);
        assert_eq!(profile.conditions[0].evaluations, 2);
        assert_eq!(profile.conditions[0].pass_rate, 0.5);
        assert_eq!(profile.actions.len(), 2);
        assert_eq!(profile.actions[1].failures, 1);
        assert_eq!(profile.action_failures, 1);
    }

    #[test]
    fn test_reports() {
        let profiler = RuleProfiler::new();

        for _ in 0..5 {
            profiler.observe(&entry(TraceType::RuleTriggered, "hot", json!({})));
        }
        profiler.observe(&entry(TraceType::RuleExecuted, "hot", json!({})).with_duration_ms(1.0));
        profiler.observe(&entry(TraceType::RuleTriggered, "slow", json!({})));
        profiler.observe(&entry(TraceType::RuleExecuted, "slow", json!({})).with_duration_ms(50.0));

        let hottest = profiler.hottest_rules(1);
        assert_eq!(hottest[0].rule_id.as_str(), "hot");

        let slowest = profiler.slowest_rules(1);
        assert_eq!(slowest[0].rule_id.as_str(), "slow");

        let summary = profiler.summary();
        assert_eq!(summary.rules_profiled, 2);
        assert_eq!(summary.total_triggered, 6);
        assert_eq!(summary.total_executed, 2);
    }

    #[test]
    fn test_attach_to_collector() {
        let collector = TraceCollector::new(100, true);
        let profiler = Arc::new(RuleProfiler::new());
        profiler.attach(&collector);

        collector.record(entry(TraceType::RuleTriggered, "r1", json!({})));
        assert_eq!(profiler.get_profile(&RuleId::new("r1")).unwrap().triggered, 1);
    }
}

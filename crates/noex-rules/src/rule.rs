//! Rule, group, condition, and action descriptors.

use crate::error::{Result, RuleError};
use crate::ids::{GroupId, RuleId};
use crate::temporal::TemporalPattern;
use crate::timers::TimerConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The stimulus that selects a rule for evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerSpec {
    /// An event whose topic matches the pattern.
    Event { topic: String },

    /// A fact change whose key matches the pattern.
    Fact { pattern: String },

    /// A timer expiry whose name matches the pattern.
    Timer { name: String },

    /// A temporal pattern match over the event stream.
    Temporal { pattern: TemporalPattern },
}

/// Where a condition reads its actual value from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConditionSource {
    /// The value of a fact; the pattern may contain `${...}` segments.
    Fact { pattern: String },

    /// A dotted path into the triggering event's data.
    Event { field: String },

    /// A variable bound earlier in the rule or supplied by the caller.
    Context { key: String },

    /// A named lookup result, optionally narrowed to a field.
    Lookup {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        field: Option<String>,
    },

    /// An aggregate computed over historical events.
    Baseline { metric: String },
}

/// Comparison operator applied between the source value and the expected value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    /// Strict equality.
    Eq,
    /// Strict inequality.
    Neq,
    /// Numeric greater-than.
    Gt,
    /// Numeric greater-or-equal.
    Gte,
    /// Numeric less-than.
    Lt,
    /// Numeric less-or-equal.
    Lte,
    /// Membership in an expected array.
    In,
    /// Absence from an expected array.
    NotIn,
    /// Array element or substring containment.
    Contains,
    /// Negated containment.
    NotContains,
    /// Regular expression match over a string.
    Matches,
    /// The source resolves to a value.
    Exists,
    /// The source resolves to nothing.
    NotExists,
}

impl ConditionOperator {
    /// Whether the operator is a unary predicate over the source alone.
    pub fn is_unary(&self) -> bool {
        matches!(self, Self::Exists | Self::NotExists)
    }
}

/// A `{"ref": "path"}` object resolved against the evaluation context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RefSpec {
    /// Resolution path, `source.segment...`.
    #[serde(rename = "ref")]
    pub path: String,
}

/// A literal value or a reference resolved at evaluation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValueOrRef {
    /// A reference into the evaluation context.
    Ref(RefSpec),

    /// A literal JSON value.
    Literal(Value),
}

impl ValueOrRef {
    /// Create a literal value.
    pub fn literal(value: impl Into<Value>) -> Self {
        Self::Literal(value.into())
    }

    /// Create a reference.
    pub fn reference(path: impl Into<String>) -> Self {
        Self::Ref(RefSpec { path: path.into() })
    }
}

/// A single condition: source, operator, expected value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Where the actual value comes from.
    pub source: ConditionSource,

    /// Comparison operator.
    pub operator: ConditionOperator,

    /// Expected value; absent for unary operators.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<ValueOrRef>,
}

impl Condition {
    /// Create a binary condition.
    pub fn new(source: ConditionSource, operator: ConditionOperator, value: ValueOrRef) -> Self {
        Self {
            source,
            operator,
            value: Some(value),
        }
    }

    /// Create a unary condition (`exists` / `not_exists`).
    pub fn unary(source: ConditionSource, operator: ConditionOperator) -> Self {
        Self {
            source,
            operator,
            value: None,
        }
    }
}

/// Log level for the `log` action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    /// Debug-level diagnostics.
    Debug,
    /// Informational.
    Info,
    /// Something unexpected but tolerable.
    Warn,
    /// A failure worth attention.
    Error,
}

/// Side effect executed when a rule's conditions pass.
///
/// `key`, `topic`, and payload values may contain `${...}` placeholders or
/// `ref` objects, resolved against the evaluation context before the side
/// effect is applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Set a fact to a value.
    SetFact { key: String, value: Value },

    /// Delete a fact.
    DeleteFact { key: String },

    /// Add a numeric delta to a fact, treating an absent fact as zero.
    IncrementFact {
        key: String,
        #[serde(default = "default_increment")]
        by: Value,
    },

    /// Emit a derived event.
    EmitEvent { topic: String, data: Value },

    /// Set or replace a named timer.
    SetTimer { config: TimerConfig },

    /// Cancel a named timer.
    CancelTimer { name: String },

    /// Call a registered service, optionally binding the result to a
    /// context variable for subsequent actions.
    CallService {
        service: String,
        method: String,
        #[serde(default)]
        args: Vec<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bind: Option<String>,
    },

    /// Write a log line through the engine's logger.
    Log { level: LogLevel, message: String },
}

fn default_increment() -> Value {
    Value::from(1)
}

/// Error policy when a data requirement cannot be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LookupErrorPolicy {
    /// Skip the whole rule with reason `lookup_failed`.
    #[default]
    Fail,

    /// Leave the lookup result absent and continue evaluating.
    Skip,
}

/// Cache settings for a data requirement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSpec {
    /// Time-to-live, duration grammar (`"30s"`, milliseconds number).
    pub ttl: Value,
}

/// A named external data requirement resolved before condition evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRequirement {
    /// Name under which the result is bound.
    pub name: String,

    /// Registered service name.
    pub service: String,

    /// Method on the service.
    pub method: String,

    /// Arguments; may contain `ref` objects and `${...}` placeholders.
    #[serde(default)]
    pub args: Vec<Value>,

    /// Optional result cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheSpec>,

    /// Failure policy.
    #[serde(default)]
    pub on_error: LookupErrorPolicy,
}

/// Caller-supplied rule definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleInput {
    /// Unique rule identifier.
    pub id: RuleId,

    /// Human-readable name.
    pub name: String,

    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Optional group membership.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<GroupId>,

    /// Evaluation priority; higher runs first.
    #[serde(default)]
    pub priority: i64,

    /// Whether the rule participates in dispatch.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Ordered set of tags.
    #[serde(default)]
    pub tags: Vec<String>,

    /// The trigger.
    pub trigger: TriggerSpec,

    /// Conditions, evaluated in order with short-circuit AND.
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Actions, executed in order.
    #[serde(default)]
    pub actions: Vec<Action>,

    /// Data requirements resolved before conditions.
    #[serde(default)]
    pub lookups: Vec<DataRequirement>,
}

fn default_enabled() -> bool {
    true
}

impl RuleInput {
    /// Validate the definition.
    pub fn validate(&self) -> Result<()> {
        if self.id.as_str().trim().is_empty() {
            return Err(RuleError::validation("rule id must not be empty"));
        }
        if self.name.trim().is_empty() {
            return Err(RuleError::validation(format!(
                "rule {}: name must not be empty",
                self.id
            )));
        }

        match &self.trigger {
            TriggerSpec::Event { topic } if topic.trim().is_empty() => {
                return Err(RuleError::validation(format!(
                    "rule {}: event trigger topic must not be empty",
                    self.id
                )));
            }
            TriggerSpec::Fact { pattern } if pattern.trim().is_empty() => {
                return Err(RuleError::validation(format!(
                    "rule {}: fact trigger pattern must not be empty",
                    self.id
                )));
            }
            TriggerSpec::Timer { name } if name.trim().is_empty() => {
                return Err(RuleError::validation(format!(
                    "rule {}: timer trigger name must not be empty",
                    self.id
                )));
            }
            TriggerSpec::Temporal { pattern } => pattern.validate().map_err(|e| {
                RuleError::validation(format!("rule {}: {e}", self.id))
            })?,
            _ => {}
        }

        for (index, condition) in self.conditions.iter().enumerate() {
            if !condition.operator.is_unary() && condition.value.is_none() {
                return Err(RuleError::validation(format!(
                    "rule {}: condition {index} requires a value for operator {:?}",
                    self.id, condition.operator
                )));
            }
        }

        for (index, action) in self.actions.iter().enumerate() {
            match action {
                Action::SetFact { key, .. }
                | Action::DeleteFact { key }
                | Action::IncrementFact { key, .. }
                    if key.trim().is_empty() =>
                {
                    return Err(RuleError::validation(format!(
                        "rule {}: action {index} fact key must not be empty",
                        self.id
                    )));
                }
                Action::EmitEvent { topic, .. } if topic.trim().is_empty() => {
                    return Err(RuleError::validation(format!(
                        "rule {}: action {index} event topic must not be empty",
                        self.id
                    )));
                }
                Action::SetTimer { config } => config.validate().map_err(|e| {
                    RuleError::validation(format!("rule {}: action {index}: {e}", self.id))
                })?,
                Action::CancelTimer { name } if name.trim().is_empty() => {
                    return Err(RuleError::validation(format!(
                        "rule {}: action {index} timer name must not be empty",
                        self.id
                    )));
                }
                _ => {}
            }
        }

        for lookup in &self.lookups {
            if lookup.name.trim().is_empty()
                || lookup.service.trim().is_empty()
                || lookup.method.trim().is_empty()
            {
                return Err(RuleError::validation(format!(
                    "rule {}: lookup name, service, and method must not be empty",
                    self.id
                )));
            }
            if let Some(cache) = &lookup.cache {
                crate::duration::parse_duration(&cache.ttl).map_err(|e| {
                    RuleError::validation(format!(
                        "rule {}: lookup {}: invalid cache ttl: {e}",
                        self.id, lookup.name
                    ))
                })?;
            }
        }

        Ok(())
    }
}

/// A registered rule; immutable after registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Unique rule identifier.
    pub id: RuleId,

    /// Human-readable name.
    pub name: String,

    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Optional group membership.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<GroupId>,

    /// Evaluation priority; higher runs first.
    pub priority: i64,

    /// Whether the rule participates in dispatch.
    pub enabled: bool,

    /// Ordered set of tags.
    #[serde(default)]
    pub tags: Vec<String>,

    /// The trigger.
    pub trigger: TriggerSpec,

    /// Conditions, evaluated in order with short-circuit AND.
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Actions, executed in order.
    #[serde(default)]
    pub actions: Vec<Action>,

    /// Data requirements resolved before conditions.
    #[serde(default)]
    pub lookups: Vec<DataRequirement>,

    /// Revision counter, starting at 1 and bumped on update.
    pub version: u64,

    /// Registration timestamp.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,

    /// Last update timestamp.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

impl Rule {
    /// Build a rule from a validated input.
    pub fn from_input(input: RuleInput, version: u64, now: DateTime<Utc>) -> Self {
        Self {
            id: input.id,
            name: input.name,
            description: input.description,
            group: input.group,
            priority: input.priority,
            enabled: input.enabled,
            tags: input.tags,
            trigger: input.trigger,
            conditions: input.conditions,
            actions: input.actions,
            lookups: input.lookups,
            version,
            created_at: now,
            updated_at: now,
        }
    }

    /// Recover the input form, dropping bookkeeping fields.
    pub fn to_input(&self) -> RuleInput {
        RuleInput {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            group: self.group.clone(),
            priority: self.priority,
            enabled: self.enabled,
            tags: self.tags.clone(),
            trigger: self.trigger.clone(),
            conditions: self.conditions.clone(),
            actions: self.actions.clone(),
            lookups: self.lookups.clone(),
        }
    }

    /// Whether the rule carries the given tag.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// A named switch gating a cohort of rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    /// Unique group identifier.
    pub id: GroupId,

    /// Human-readable name.
    pub name: String,

    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Whether member rules may run.
    pub enabled: bool,

    /// Creation timestamp.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,

    /// Last update timestamp.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

/// Caller-supplied group definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupInput {
    /// Unique group identifier.
    pub id: GroupId,

    /// Human-readable name.
    pub name: String,

    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Whether member rules may run.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl GroupInput {
    /// Validate the definition.
    pub fn validate(&self) -> Result<()> {
        if self.id.as_str().trim().is_empty() {
            return Err(RuleError::validation("group id must not be empty"));
        }
        if self.name.trim().is_empty() {
            return Err(RuleError::validation(format!(
                "group {}: name must not be empty",
                self.id
            )));
        }
        Ok(())
    }

    /// Build a group from a validated input.
    pub fn into_group(self, now: DateTime<Utc>) -> Group {
        Group {
            id: self.id,
            name: self.name,
            description: self.description,
            enabled: self.enabled,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal_input() -> RuleInput {
        serde_json::from_value(json!({
            "id": "earn-points",
            "name": "Earn points",
            "trigger": {"type": "event", "topic": "order.placed"},
            "conditions": [
                {
                    "source": {"type": "fact", "pattern": "customer:active"},
                    "operator": "eq",
                    "value": true
                }
            ],
            "actions": [
                {"type": "set_fact", "key": "loyalty:points", "value": 500}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_input_deserialization_defaults() {
        let input = minimal_input();
        assert_eq!(input.priority, 0);
        assert!(input.enabled);
        assert!(input.tags.is_empty());
        assert!(input.lookups.is_empty());
        input.validate().unwrap();
    }

    #[test]
    fn test_value_or_ref_shapes() {
        let reference: ValueOrRef =
            serde_json::from_value(json!({"ref": "event.customer.id"})).unwrap();
        assert_eq!(reference, ValueOrRef::reference("event.customer.id"));

        let literal: ValueOrRef =
            serde_json::from_value(json!({"ref": "x", "extra": 1})).unwrap();
        assert!(matches!(literal, ValueOrRef::Literal(_)));

        let literal: ValueOrRef = serde_json::from_value(json!([1, 2])).unwrap();
        assert!(matches!(literal, ValueOrRef::Literal(_)));
    }

    #[test]
    fn test_validation_rejects_missing_value_for_binary_operator() {
        let mut input = minimal_input();
        input.conditions[0].value = None;
        let err = input.validate().unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_validation_accepts_unary_without_value() {
        let mut input = minimal_input();
        input.conditions = vec![Condition::unary(
            ConditionSource::Fact {
                pattern: "loyalty:points".into(),
            },
            ConditionOperator::Exists,
        )];
        input.validate().unwrap();
    }

    #[test]
    fn test_validation_rejects_empty_ids() {
        let mut input = minimal_input();
        input.id = RuleId::new("  ");
        assert!(input.validate().is_err());

        let group = GroupInput {
            id: GroupId::new(""),
            name: "Billing".into(),
            description: None,
            enabled: true,
        };
        assert!(group.validate().is_err());
    }

    #[test]
    fn test_rule_round_trips_through_input() {
        let now = Utc::now();
        let rule = Rule::from_input(minimal_input(), 1, now);
        assert_eq!(rule.version, 1);
        assert_eq!(rule.to_input(), minimal_input());
    }

    #[test]
    fn test_action_serialization_shape() {
        let action = Action::EmitEvent {
            topic: "loyalty.awarded".into(),
            data: json!({"points": {"ref": "fact:loyalty:points"}}),
        };
        let value = serde_json::to_value(&action).unwrap();
        assert_eq!(value["type"], "emit_event");
        assert_eq!(value["topic"], "loyalty.awarded");
        let back: Action = serde_json::from_value(value).unwrap();
        assert_eq!(back, action);
    }
}

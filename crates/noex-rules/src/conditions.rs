//! Condition evaluation over heterogeneous sources.

use crate::context::EvaluationContext;
use crate::rule::{Condition, ConditionOperator, ConditionSource, ValueOrRef};
use dashmap::DashMap;
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

/// Per-condition evaluation result, consumed by the tracer and profiler.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionOutcome {
    /// The expected value after reference resolution.
    pub expected: Option<Value>,

    /// The actual value read from the source.
    pub actual: Option<Value>,

    /// Whether the condition passed.
    pub passed: bool,

    /// Evaluation wall time.
    pub duration_ms: f64,
}

/// Evaluates conditions against a context.
///
/// `matches` patterns compile once and are cached per pattern string.
pub struct ConditionEvaluator {
    regexes: DashMap<String, Arc<Regex>>,
}

impl Default for ConditionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl ConditionEvaluator {
    /// Create an evaluator with an empty regex cache.
    pub fn new() -> Self {
        Self {
            regexes: DashMap::new(),
        }
    }

    /// Evaluate a single condition.
    pub fn evaluate(&self, condition: &Condition, ctx: &EvaluationContext) -> ConditionOutcome {
        let started = Instant::now();

        let actual = resolve_source(&condition.source, ctx);
        let expected = condition.value.as_ref().and_then(|v| match v {
            ValueOrRef::Literal(value) => Some(value.clone()),
            ValueOrRef::Ref(spec) => ctx.resolve(&spec.path),
        });

        let passed = self.apply(condition.operator, actual.as_ref(), expected.as_ref());

        ConditionOutcome {
            expected,
            actual,
            passed,
            duration_ms: started.elapsed().as_secs_f64() * 1000.0,
        }
    }

    /// Evaluate conditions in order with short-circuit AND.
    ///
    /// Returns the outcomes actually evaluated; the last one is the failure
    /// when the overall result is false.
    pub fn evaluate_all(
        &self,
        conditions: &[Condition],
        ctx: &EvaluationContext,
    ) -> (bool, Vec<ConditionOutcome>) {
        let mut outcomes = Vec::with_capacity(conditions.len());
        for condition in conditions {
            let outcome = self.evaluate(condition, ctx);
            let passed = outcome.passed;
            outcomes.push(outcome);
            if !passed {
                return (false, outcomes);
            }
        }
        (true, outcomes)
    }

    /// Drop cached `matches` compilations.
    pub fn purge_regex_cache(&self) {
        self.regexes.clear();
    }

    /// Apply an operator to already-resolved operands.
    ///
    /// Used by backward chaining, where values come from goals rather than
    /// a live trigger context.
    pub fn apply_resolved(
        &self,
        operator: ConditionOperator,
        actual: Option<&Value>,
        expected: Option<&Value>,
    ) -> bool {
        self.apply(operator, actual, expected)
    }

    fn apply(
        &self,
        operator: ConditionOperator,
        actual: Option<&Value>,
        expected: Option<&Value>,
    ) -> bool {
        use ConditionOperator::*;

        match operator {
            Exists => return actual.is_some() && actual != Some(&Value::Null),
            NotExists => return actual.is_none() || actual == Some(&Value::Null),
            _ => {}
        }

        // All binary operators fail closed on a missing operand.
        let (Some(actual), Some(expected)) = (actual, expected) else {
            return false;
        };

        match operator {
            Eq => actual == expected,
            Neq => actual != expected,
            Gt | Gte | Lt | Lte => match (actual.as_f64(), expected.as_f64()) {
                (Some(a), Some(b)) => match operator {
                    Gt => a > b,
                    Gte => a >= b,
                    Lt => a < b,
                    Lte => a <= b,
                    _ => unreachable!(),
                },
                _ => false,
            },
            In => match expected {
                Value::Array(items) => items.contains(actual),
                _ => false,
            },
            NotIn => match expected {
                Value::Array(items) => !items.contains(actual),
                _ => false,
            },
            Contains => contains(actual, expected),
            NotContains => is_container(actual) && !contains(actual, expected),
            Matches => match (actual, expected) {
                (Value::String(text), Value::String(pattern)) => self
                    .compile(pattern)
                    .map(|re| re.is_match(text))
                    .unwrap_or(false),
                _ => false,
            },
            Exists | NotExists => unreachable!(),
        }
    }

    fn compile(&self, pattern: &str) -> Option<Arc<Regex>> {
        if let Some(re) = self.regexes.get(pattern) {
            return Some(Arc::clone(&re));
        }
        match Regex::new(pattern) {
            Ok(re) => {
                let re = Arc::new(re);
                self.regexes.insert(pattern.to_string(), Arc::clone(&re));
                Some(re)
            }
            Err(_) => None,
        }
    }
}

fn is_container(value: &Value) -> bool {
    matches!(value, Value::Array(_) | Value::String(_))
}

fn contains(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Array(items), needle) => items.contains(needle),
        (Value::String(haystack), Value::String(needle)) => haystack.contains(needle),
        _ => false,
    }
}

fn resolve_source(source: &ConditionSource, ctx: &EvaluationContext) -> Option<Value> {
    match source {
        ConditionSource::Fact { pattern } => {
            let key = if crate::value::has_placeholder(pattern) {
                ctx.interpolate(pattern)
            } else {
                pattern.clone()
            };
            ctx.resolve(&format!("fact:{key}"))
        }
        ConditionSource::Event { field } => ctx.resolve(&format!("event.{field}")),
        ConditionSource::Context { key } => ctx.resolve(&format!("context.{key}")),
        ConditionSource::Lookup { name, field } => match field {
            Some(field) => ctx.resolve(&format!("lookup.{name}.{field}")),
            None => ctx.resolve(&format!("lookup.{name}")),
        },
        ConditionSource::Baseline { metric } => ctx.resolve(&format!("baseline.{metric}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TriggerContext;
    use crate::events::Event;
    use crate::facts::FactStore;
    use serde_json::json;
    use std::sync::Arc;

    fn ctx() -> EvaluationContext {
        let facts = Arc::new(FactStore::new());
        facts.set("customer:active", json!(true), "test");
        facts.set("loyalty:points", json!(500), "test");
        facts.set("customer:42:tier", json!("vip"), "test");

        let event = Event::new(
            "order.placed",
            json!({
                "customer": {"id": 42, "email": "ada@example.com"},
                "total": 120.0,
                "items": ["book", "pen"],
            }),
        );
        EvaluationContext::new(TriggerContext::Event { event }, facts)
    }

    fn fact(pattern: &str) -> ConditionSource {
        ConditionSource::Fact {
            pattern: pattern.to_string(),
        }
    }

    fn event(field: &str) -> ConditionSource {
        ConditionSource::Event {
            field: field.to_string(),
        }
    }

    #[test]
    fn test_eq_and_neq() {
        let evaluator = ConditionEvaluator::new();
        let ctx = ctx();

        let condition = Condition::new(
            fact("customer:active"),
            ConditionOperator::Eq,
            ValueOrRef::literal(true),
        );
        assert!(evaluator.evaluate(&condition, &ctx).passed);

        let condition = Condition::new(
            fact("customer:active"),
            ConditionOperator::Neq,
            ValueOrRef::literal(false),
        );
        assert!(evaluator.evaluate(&condition, &ctx).passed);
    }

    #[test]
    fn test_numeric_comparisons_require_numbers() {
        let evaluator = ConditionEvaluator::new();
        let ctx = ctx();

        let condition = Condition::new(
            fact("loyalty:points"),
            ConditionOperator::Gte,
            ValueOrRef::literal(100),
        );
        assert!(evaluator.evaluate(&condition, &ctx).passed);

        // A string operand fails the comparison outright.
        let condition = Condition::new(
            fact("customer:42:tier"),
            ConditionOperator::Gt,
            ValueOrRef::literal(1),
        );
        assert!(!evaluator.evaluate(&condition, &ctx).passed);
    }

    #[test]
    fn test_in_fails_closed_on_non_array() {
        let evaluator = ConditionEvaluator::new();
        let ctx = ctx();

        let condition = Condition::new(
            fact("customer:42:tier"),
            ConditionOperator::In,
            ValueOrRef::literal(json!(["vip", "gold"])),
        );
        assert!(evaluator.evaluate(&condition, &ctx).passed);

        let condition = Condition::new(
            fact("customer:42:tier"),
            ConditionOperator::In,
            ValueOrRef::literal("vip"),
        );
        assert!(!evaluator.evaluate(&condition, &ctx).passed);

        let condition = Condition::new(
            fact("customer:42:tier"),
            ConditionOperator::NotIn,
            ValueOrRef::literal("vip"),
        );
        assert!(!evaluator.evaluate(&condition, &ctx).passed);
    }

    #[test]
    fn test_contains_on_arrays_and_strings() {
        let evaluator = ConditionEvaluator::new();
        let ctx = ctx();

        let condition = Condition::new(
            event("items"),
            ConditionOperator::Contains,
            ValueOrRef::literal("book"),
        );
        assert!(evaluator.evaluate(&condition, &ctx).passed);

        let condition = Condition::new(
            event("customer.email"),
            ConditionOperator::Contains,
            ValueOrRef::literal("@example."),
        );
        assert!(evaluator.evaluate(&condition, &ctx).passed);

        let condition = Condition::new(
            event("items"),
            ConditionOperator::NotContains,
            ValueOrRef::literal("hat"),
        );
        assert!(evaluator.evaluate(&condition, &ctx).passed);

        // not_contains over a non-container fails closed.
        let condition = Condition::new(
            event("total"),
            ConditionOperator::NotContains,
            ValueOrRef::literal("x"),
        );
        assert!(!evaluator.evaluate(&condition, &ctx).passed);
    }

    #[test]
    fn test_matches_with_cache() {
        let evaluator = ConditionEvaluator::new();
        let ctx = ctx();

        let condition = Condition::new(
            event("customer.email"),
            ConditionOperator::Matches,
            ValueOrRef::literal(r"^[a-z]+@example\.com$"),
        );
        assert!(evaluator.evaluate(&condition, &ctx).passed);
        assert!(evaluator.evaluate(&condition, &ctx).passed);
        assert_eq!(evaluator.regexes.len(), 1);

        evaluator.purge_regex_cache();
        assert!(evaluator.regexes.is_empty());
    }

    #[test]
    fn test_exists_and_not_exists() {
        let evaluator = ConditionEvaluator::new();
        let ctx = ctx();

        let condition = Condition::unary(fact("loyalty:points"), ConditionOperator::Exists);
        assert!(evaluator.evaluate(&condition, &ctx).passed);

        let condition = Condition::unary(fact("loyalty:missing"), ConditionOperator::NotExists);
        assert!(evaluator.evaluate(&condition, &ctx).passed);

        let condition = Condition::unary(event("customer.phone"), ConditionOperator::Exists);
        assert!(!evaluator.evaluate(&condition, &ctx).passed);
    }

    #[test]
    fn test_ref_expected_value() {
        let evaluator = ConditionEvaluator::new();
        let ctx = ctx();

        let condition = Condition::new(
            event("customer.id"),
            ConditionOperator::Eq,
            ValueOrRef::reference("event.customer.id"),
        );
        assert!(evaluator.evaluate(&condition, &ctx).passed);
    }

    #[test]
    fn test_interpolated_fact_pattern() {
        let evaluator = ConditionEvaluator::new();
        let ctx = ctx();

        let condition = Condition::new(
            fact("customer:${event.customer.id}:tier"),
            ConditionOperator::Eq,
            ValueOrRef::literal("vip"),
        );
        assert!(evaluator.evaluate(&condition, &ctx).passed);
    }

    #[test]
    fn test_short_circuit_stops_at_first_failure() {
        let evaluator = ConditionEvaluator::new();
        let ctx = ctx();

        let conditions = vec![
            Condition::new(
                fact("customer:active"),
                ConditionOperator::Eq,
                ValueOrRef::literal(true),
            ),
            Condition::new(
                fact("loyalty:points"),
                ConditionOperator::Gt,
                ValueOrRef::literal(10_000),
            ),
            Condition::unary(fact("customer:active"), ConditionOperator::Exists),
        ];

        let (passed, outcomes) = evaluator.evaluate_all(&conditions, &ctx);
        assert!(!passed);
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].passed);
        assert!(!outcomes[1].passed);
    }
}

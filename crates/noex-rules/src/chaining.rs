//! Backward-chaining goal queries over the rule graph.
//!
//! A query asks whether a goal fact or event is achievable from the live
//! fact store plus the registered rules, and returns the proof tree it
//! found. The search is read-only: no rule is executed.

use crate::conditions::ConditionEvaluator;
use crate::config::BackwardChainingConfig;
use crate::error::Result;
use crate::facts::FactStore;
use crate::ids::RuleId;
use crate::manager::RuleManager;
use crate::rule::{Action, Condition, ConditionOperator, ConditionSource, Rule, ValueOrRef};
use crate::value;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// A goal to prove.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Goal {
    /// A fact holding a value (or simply existing).
    Fact {
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        operator: Option<ConditionOperator>,
    },

    /// An event with the topic being emitted.
    Event { topic: String },
}

impl Goal {
    fn stack_key(&self) -> String {
        match self {
            Self::Fact { key, .. } => format!("fact:{key}"),
            Self::Event { topic } => format!("event:{topic}"),
        }
    }
}

/// Why a branch cannot be achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnachievableReason {
    /// No registered rule produces the goal.
    NoRules,
    /// Every candidate was already on the proof stack.
    CycleDetected,
    /// The branch hit the depth limit.
    MaxDepth,
    /// Candidates existed but none could be satisfied.
    AllPathsFailed,
}

/// A condition inside a rule proof node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionProof {
    /// The condition as registered.
    pub condition: Condition,

    /// Whether the condition holds now or is achievable via a child proof.
    pub satisfied: bool,

    /// Whether a child sub-goal was chained for this condition.
    pub chained: bool,
}

/// A node in the proof tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProofNode {
    /// The goal is met by the live fact store.
    FactExists {
        key: String,
        current_value: Option<Value>,
        satisfied: bool,
    },

    /// A rule whose action could produce the goal.
    Rule {
        rule_id: RuleId,
        rule_name: String,
        satisfied: bool,
        conditions: Vec<ConditionProof>,
        children: Vec<ProofNode>,
    },

    /// The branch cannot be achieved.
    Unachievable {
        reason: UnachievableReason,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },
}

impl ProofNode {
    /// Whether this node proves its goal.
    pub fn satisfied(&self) -> bool {
        match self {
            Self::FactExists { satisfied, .. } => *satisfied,
            Self::Rule { satisfied, .. } => *satisfied,
            Self::Unachievable { .. } => false,
        }
    }
}

/// Result of a backward-chaining query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Whether the goal is achievable.
    pub achievable: bool,

    /// Root of the proof tree.
    pub root: ProofNode,

    /// Rules attempted across the whole query.
    pub explored_rules: usize,

    /// Whether any branch hit the depth limit.
    pub max_depth_reached: bool,
}

struct SearchState {
    explored: usize,
    max_depth_reached: bool,
    // Visited (rule, goal) pairs on the current branch.
    stack: Vec<(RuleId, String)>,
}

/// Goal-driven proof search with cycle and depth guards.
pub struct BackwardChainer {
    rules: Arc<RuleManager>,
    facts: Arc<FactStore>,
    evaluator: ConditionEvaluator,
    config: BackwardChainingConfig,
}

impl BackwardChainer {
    /// Create a chainer over the rule table and fact store.
    pub fn new(
        rules: Arc<RuleManager>,
        facts: Arc<FactStore>,
        config: BackwardChainingConfig,
    ) -> Self {
        Self {
            rules,
            facts,
            evaluator: ConditionEvaluator::new(),
            config,
        }
    }

    /// Evaluate a goal and build its proof tree.
    pub fn evaluate(&self, goal: &Goal) -> Result<QueryResult> {
        let mut state = SearchState {
            explored: 0,
            max_depth_reached: false,
            stack: Vec::new(),
        };

        let root = self.prove(goal, 0, &mut state);
        Ok(QueryResult {
            achievable: root.satisfied(),
            root,
            explored_rules: state.explored,
            max_depth_reached: state.max_depth_reached,
        })
    }

    fn prove(&self, goal: &Goal, depth: usize, state: &mut SearchState) -> ProofNode {
        // Depth is checked before any fact or rule lookup, so a zero limit
        // fails even trivially-true goals.
        if depth >= self.config.max_depth {
            state.max_depth_reached = true;
            return ProofNode::Unachievable {
                reason: UnachievableReason::MaxDepth,
                details: Some(format!("depth limit {} reached", self.config.max_depth)),
            };
        }

        if let Goal::Fact { key, value, operator } = goal {
            if let Some(fact) = self.facts.get(key) {
                let operator = operator.unwrap_or(ConditionOperator::Eq);
                let satisfied = match value {
                    Some(expected) => {
                        self.evaluator
                            .apply_resolved(operator, Some(&fact.value), Some(expected))
                    }
                    None => true,
                };
                if satisfied {
                    return ProofNode::FactExists {
                        key: key.clone(),
                        current_value: Some(fact.value),
                        satisfied: true,
                    };
                }
            }
        }

        let candidates = match goal {
            Goal::Fact { key, value, operator } => {
                let operator = operator.unwrap_or(ConditionOperator::Eq);
                self.rules
                    .rules_producing_fact(key)
                    .into_iter()
                    .filter(|rule| could_produce_value(rule, key, value.as_ref(), operator))
                    .collect::<Vec<_>>()
            }
            Goal::Event { topic } => self.rules.rules_emitting_topic(topic),
        };

        if candidates.is_empty() {
            return ProofNode::Unachievable {
                reason: UnachievableReason::NoRules,
                details: Some(format!("no rules produce {}", goal.stack_key())),
            };
        }

        let goal_key = goal.stack_key();
        let mut attempted = 0usize;
        let mut failed: Vec<ProofNode> = Vec::new();

        for rule in candidates {
            if state.explored >= self.config.max_explored_rules {
                debug!("Backward chaining exploration budget exhausted");
                break;
            }

            let stack_entry = (rule.id.clone(), goal_key.clone());
            if state.stack.contains(&stack_entry) {
                debug!("Cycle on rule {} for goal {}", rule.id, goal_key);
                continue;
            }

            attempted += 1;
            state.explored += 1;
            state.stack.push(stack_entry);
            let node = self.prove_rule(&rule, depth, state);
            state.stack.pop();

            if node.satisfied() {
                // First satisfying proof wins.
                return node;
            }
            failed.push(node);
        }

        if attempted == 0 {
            return ProofNode::Unachievable {
                reason: UnachievableReason::CycleDetected,
                details: Some(format!("every candidate for {} cycled", goal_key)),
            };
        }

        ProofNode::Unachievable {
            reason: UnachievableReason::AllPathsFailed,
            details: Some(format!("{attempted} candidate rules failed for {goal_key}")),
        }
    }

    fn prove_rule(&self, rule: &Rule, depth: usize, state: &mut SearchState) -> ProofNode {
        let mut satisfied = true;
        let mut conditions = Vec::with_capacity(rule.conditions.len());
        let mut children = Vec::new();

        for condition in &rule.conditions {
            let (holds, chained_child) = self.prove_condition(condition, depth, state);
            let chained = chained_child.is_some();
            if let Some(child) = chained_child {
                children.push(child);
            }
            if !holds {
                satisfied = false;
            }
            conditions.push(ConditionProof {
                condition: condition.clone(),
                satisfied: holds,
                chained,
            });
        }

        ProofNode::Rule {
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            satisfied,
            conditions,
            children,
        }
    }

    /// Prove one condition; returns whether it holds and any chained child.
    fn prove_condition(
        &self,
        condition: &Condition,
        depth: usize,
        state: &mut SearchState,
    ) -> (bool, Option<ProofNode>) {
        // Only fact conditions can be reasoned about without a trigger
        // context; everything else is unsatisfiable here.
        let ConditionSource::Fact { pattern } = &condition.source else {
            return (false, None);
        };
        if value::has_placeholder(pattern) {
            return (false, None);
        }

        let expected = condition.value.as_ref().and_then(|v| match v {
            ValueOrRef::Literal(value) => Some(value.clone()),
            ValueOrRef::Ref(_) => None,
        });

        if let Some(fact) = self.facts.get(pattern) {
            let holds = self.evaluator.apply_resolved(
                condition.operator,
                Some(&fact.value),
                expected.as_ref(),
            );
            // A wrong live value is not chained; only absent facts are.
            return (holds, None);
        }

        if condition.operator == ConditionOperator::NotExists {
            return (true, None);
        }

        let sub_goal = Goal::Fact {
            key: pattern.clone(),
            value: expected,
            operator: Some(condition.operator),
        };
        let child = self.prove(&sub_goal, depth + 1, state);
        let holds = child.satisfied();
        (holds, Some(child))
    }
}

/// Whether a rule's fact actions could produce the goal value.
///
/// Literal action values are compared under an `eq` goal; references and
/// interpolations cannot be decided statically and count as producers.
fn could_produce_value(
    rule: &Rule,
    key: &str,
    goal_value: Option<&Value>,
    operator: ConditionOperator,
) -> bool {
    let Some(goal_value) = goal_value else {
        return true;
    };
    if operator != ConditionOperator::Eq {
        return true;
    }

    rule.actions.iter().any(|action| match action {
        Action::SetFact { key: action_key, value } => {
            if !crate::pattern::matches_key(
                key,
                &crate::manager::action_pattern(action_key),
            ) {
                return false;
            }
            if value::as_ref_path(value).is_some() {
                return true;
            }
            match value {
                Value::String(s) if value::has_placeholder(s) => true,
                literal => literal == goal_value,
            }
        }
        Action::IncrementFact { key: action_key, .. } => crate::pattern::matches_key(
            key,
            &crate::manager::action_pattern(action_key),
        ),
        _ => false,
    })
}

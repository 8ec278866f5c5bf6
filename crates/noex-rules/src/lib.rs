//! # Noex Rules
//!
//! An event-driven rules engine core for the Noex platform: a long-lived
//! in-process service that accepts events and fact mutations, decides which
//! user-defined rules are triggered, evaluates their conditions against
//! live state, and executes their actions.
//!
//! ## Features
//!
//! - **Rule Manager**: validated registration, trigger and reverse-action
//!   indexes, tag queries, and group gating
//! - **Fact Store**: versioned facts with synchronous, isolated change
//!   notifications
//! - **Event Store**: bounded ring buffer with topic, correlation, and
//!   time-range queries
//! - **Dispatch Pipeline**: a single logical worker serializing triggers,
//!   with deterministic candidate ordering
//! - **Condition Evaluator**: thirteen operators over facts, event paths,
//!   context variables, lookups, and baselines
//! - **Action Executor**: fact mutations, derived events, timers, service
//!   calls, and logging with `${...}` interpolation
//! - **Timer Manager**: named one-shot and repeating timers, cancellable,
//!   replace-by-name
//! - **Temporal Patterns**: sequence, absence, count, and aggregate
//!   matchers with sliding and tumbling windows and per-group instances
//! - **Backward Chaining**: goal-driven proof search with cycle and depth
//!   guards
//! - **Tracing**: ring-buffered decision traces with correlation
//!   timelines, profiling, and Mermaid export
//! - **Hot Reload**: source polling with canonical-hash diffing and atomic
//!   apply
//!
//! ## Architecture
//!
//! ```text
//!     emit(event) / set_fact(k,v) / timer fire / temporal match
//!                        │
//!                        ▼
//!               ┌── Matcher (indexes) ──┐
//!                        │
//!               candidate rules (priority order)
//!                        │
//!                        ▼
//!               ┌── Condition Evaluator ──┐  ← facts, context, lookups
//!                        │
//!                 passing rules
//!                        │
//!                        ▼
//!               ┌── Action Executor ──┐ → fact mutations,
//!                        │             → derived events (queue tail),
//!                        │             → timer operations, logs
//!                        ▼
//!                   Trace / Profile / History
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use noex_rules::prelude::*;
//! use serde_json::json;
//!
//! # async fn run() -> noex_rules::Result<()> {
//! let engine = RulesEngine::start(EngineConfig::default()).await?;
//!
//! let rule: RuleInput = serde_json::from_value(json!({
//!     "id": "earn-points",
//!     "name": "Earn points",
//!     "trigger": {"type": "event", "topic": "order.placed"},
//!     "conditions": [
//!         {"source": {"type": "fact", "pattern": "customer:active"},
//!          "operator": "eq", "value": true}
//!     ],
//!     "actions": [
//!         {"type": "set_fact", "key": "loyalty:points", "value": 500}
//!     ]
//! }))?;
//! engine.register_rule(rule).await?;
//!
//! engine.set_fact("customer:active", json!(true))?;
//! engine.emit_topic("order.placed", json!({"orderId": "o1"}))?;
//! engine.wait_for_processing_queue().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

// Core modules
pub mod config;
pub mod error;
pub mod ids;

// Data model
pub mod events;
pub mod facts;
pub mod rule;

// Shared utilities
pub mod duration;
pub mod pattern;
pub mod value;

// Evaluation pipeline
pub mod actions;
pub mod baselines;
pub mod conditions;
pub mod context;
pub mod dispatch;
pub mod lookups;
pub mod manager;

// Temporal and goal reasoning
pub mod chaining;
pub mod temporal;
pub mod timers;

// Observability
pub mod history;
pub mod profile;
pub mod trace;

// Lifecycle
pub mod engine;
pub mod persistence;
pub mod reload;

pub use error::{Result, RuleError};

/// Prelude module for convenient imports.
pub mod prelude {
    //! Commonly used types and traits.

    // Error types
    pub use crate::error::{Result, RuleError};

    // Identifiers
    pub use crate::ids::{CorrelationId, EventId, GroupId, RuleId, TimerId, TraceId};

    // Configuration
    pub use crate::config::{
        BackwardChainingConfig, EngineConfig, EventStoreConfig, HotReloadConfig, TraceConfig,
    };

    // Data model
    pub use crate::events::{Event, EventStore};
    pub use crate::facts::{Fact, FactChange, FactStore, FactSubscriptionId};
    pub use crate::rule::{
        Action, CacheSpec, Condition, ConditionOperator, ConditionSource, DataRequirement,
        Group, GroupInput, LogLevel, LookupErrorPolicy, RefSpec, Rule, RuleInput, TriggerSpec,
        ValueOrRef,
    };

    // Evaluation
    pub use crate::baselines::{BaselineDef, BaselineRegistry};
    pub use crate::conditions::{ConditionEvaluator, ConditionOutcome};
    pub use crate::context::{EvaluationContext, TriggerContext};
    pub use crate::lookups::{LookupExecutor, LookupService, ServiceRegistry};
    pub use crate::manager::RuleManager;

    // Temporal patterns
    pub use crate::temporal::{
        AggregateFunction, Comparison, EventSelector, TemporalCoordinator, TemporalMatch,
        TemporalMatchKind, TemporalPattern,
    };

    // Timers
    pub use crate::timers::{ExpireSpec, RepeatConfig, Timer, TimerConfig, TimerManager};

    // Backward chaining
    pub use crate::chaining::{
        BackwardChainer, ConditionProof, Goal, ProofNode, QueryResult, UnachievableReason,
    };

    // Observability
    pub use crate::history::{EventDetail, EventFilter, HistoryService, Timeline, TimelineItem};
    pub use crate::profile::{ProfileSummary, RuleProfile, RuleProfiler};
    pub use crate::trace::{TraceCollector, TraceEntry, TraceSubscriptionId, TraceType};

    // Lifecycle
    pub use crate::engine::{EngineBuilder, EngineStats, RulesEngine};
    pub use crate::persistence::{MemoryPersistence, PersistedState, Persistence};
    pub use crate::reload::{HotReloadWatcher, ReloadStatus, RuleSource, StaticRuleSource};
}

// Re-export commonly used external types
pub use async_trait::async_trait;
pub use chrono;
pub use serde;
pub use serde_json;
pub use uuid;

#[cfg(test)]
mod tests {
    use super::prelude::*;

    #[test]
    fn test_prelude_imports() {
        let _event_id = EventId::new();
        let _correlation_id = CorrelationId::new();
        let _rule_id = RuleId::new("r1");
        let _config = EngineConfig::default();
        let _store = FactStore::new();
    }
}
